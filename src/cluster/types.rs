use serde::{Deserialize, Serialize};

use crate::store::types::Row;

/// 1/5/15-minute load averages published with each heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadAvg {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// One broker process in the cluster, as persisted in the `nodes` table.
///
/// `deadline` is the heartbeat expiry; `kill` is the tombstone flag any
/// peer may set once the deadline passes. The master is simply the node
/// with the lexicographically least id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRow {
    pub id: String,
    pub deadline: i64,
    pub kill: bool,
    pub version: String,
    pub clients: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadAvg>,
}

impl Row for NodeRow {
    fn key(&self) -> &str {
        &self.id
    }
}
