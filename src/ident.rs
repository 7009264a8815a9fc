//! Identifier and method-path helpers.
//!
//! Every persistent row in the cluster is keyed by a composable id:
//! a 12-character node id, a 16-character connection id (node id + 4), and
//! a 26-character task id (connection id + 10). The orphan sweep builds a
//! regex out of node ids, so `safe_id` only ever emits `[0-9A-Za-z]`.

use rand::Rng;

const ID_CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of a node id. Connection ids append 4 characters, task ids 10 more.
pub const NODE_ID_LEN: usize = 12;

/// Length of a connection id (also the task-id prefix that routes completions).
pub const CONN_ID_LEN: usize = 16;

/// Random id of `n` characters, safe to embed in regexes and key ranges.
pub fn safe_id(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char)
        .collect()
}

/// The dotted prefixes of `name` used for tag lookup, shallowest first:
/// the root `"."`, every dot-terminated prefix, and finally `name` itself
/// when it does not already end with a dot.
pub fn prefixes(name: &str) -> Vec<String> {
    let mut out = vec![".".to_string()];
    for (i, c) in name.char_indices() {
        if c == '.' {
            let pf = &name[..=i];
            if out.last().map(String::as_str) != Some(pf) {
                out.push(pf.to_string());
            }
        }
    }
    if !name.is_empty() && !name.ends_with('.') {
        out.push(name.to_string());
    }
    out
}

/// Splits a full dotted method into its namespace path and leaf method.
/// `"math.add"` becomes `("math", "add")`; a bare name has an empty path.
pub fn split_path_method(full: &str) -> (String, String) {
    match full.rfind('.') {
        Some(i) => (full[..i].to_string(), full[i + 1..].to_string()),
        None => (String::new(), full.to_string()),
    }
}

/// Unix time in milliseconds. All deadlines and heartbeats use this clock.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
