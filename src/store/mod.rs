//! Shared Document Store Module
//!
//! The only cross-node synchronization medium: keyed tables with
//! conditional updates (compare-and-swap on the row), the `(stat, path)`
//! and deadline secondary indexes the broker's matchers and purger rely
//! on, and a change stream over the `tasks` table.
//!
//! ## Submodules
//! - **`types`**: row types of the collaborator-owned tables and write
//!   outcome counters.
//! - **`memory`**: the in-process store implementation shared by every
//!   node handle.

pub mod memory;
pub mod types;
