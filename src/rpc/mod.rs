//! Connection Engine Module
//!
//! Implements the per-client RPC surface: line-delimited JSON-RPC 2.0 over a
//! byte stream, one connection actor per accepted transport.
//!
//! ## Architecture Overview
//! Each connection runs five cooperating loops under one cancellation scope:
//! 1. **Reader**: decodes newline-delimited frames (32 MiB ceiling),
//!    resynchronizing after structural errors.
//! 2. **Dispatcher**: validates each request and hands it to a handler on
//!    its own task, so a slow handler never blocks the connection.
//! 3. **Writer**: serializes responses from a bounded queue in enqueue
//!    order, applying the null-id and null-result rules.
//! 4. **Watchdog**: cancels the scope once the transport has been idle in
//!    both directions past the threshold.
//! 5. **Completion demultiplexer**: turns finished tasks pushed by the
//!    session notifier into responses addressed by the original request id.
//!
//! ## Submodules
//! - **`protocol`**: wire types, error codes and the writer normalization.
//! - **`connection`**: the connection actor and request dispatch.
//! - **`notifier`**: the process-wide session notifier registry.
//! - **`handlers`**: `sys.*` and `sync.*` request handlers.

pub mod connection;
pub mod handlers;
pub mod notifier;
pub mod protocol;

#[cfg(test)]
mod tests;
