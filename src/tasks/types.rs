use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ident::CONN_ID_LEN;

/// Lifecycle state of a task row. Transitions are `waiting -> working`,
/// `working -> waiting` (rollback only), `working -> done` and
/// `waiting -> done` (cancel or timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStat {
    Waiting,
    Working,
    Done,
}

impl TaskStat {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStat::Waiting => "waiting",
            TaskStat::Working => "working",
            TaskStat::Done => "done",
        }
    }
}

/// One unit of remote work, persisted as a single row in the `tasks` table.
///
/// The first 16 characters of `id` are the originating connection id; the
/// change feed and the session notifier use that prefix to route the
/// completion back to the caller. A worker subscription ("pull-record") is
/// a task too, with `path` prefixed `@pull.` and an empty `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRow {
    pub id: String,
    pub stat: TaskStat,
    pub path: String,
    pub method: String,
    pub params: Value,
    pub local_id: Value,
    /// Connection id of the worker currently assigned this task; empty
    /// until matched.
    pub tses: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err_str: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err_obj: Option<Value>,
    /// Authorization context frozen at push time. Workers see these tags,
    /// never the caller's live permissions.
    pub tags: Map<String, Value>,
    pub creation_time: i64,
    pub dead_line: i64,
}

impl TaskRow {
    /// The originating connection id (the routing prefix of `id`).
    pub fn conn_prefix(&self) -> &str {
        if self.id.len() >= CONN_ID_LEN {
            &self.id[..CONN_ID_LEN]
        } else {
            &self.id
        }
    }

    /// True for worker-subscription rows (`path` starts with `@pull.`).
    pub fn is_pull_record(&self) -> bool {
        self.path.starts_with(PULL_PREFIX)
    }
}

/// Path prefix marking a pull-record row.
pub const PULL_PREFIX: &str = "@pull.";
