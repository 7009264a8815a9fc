use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A row that can live in a keyed table.
pub trait Row: Clone + PartialEq {
    fn key(&self) -> &str;
}

/// Outcome counters of a write, mirroring the semantics the broker depends
/// on: a conditional update that found its row but failed the guard (or
/// produced an identical row) reports `unchanged`; a missing row reports
/// `skipped`; a duplicate insert reports `errors`.
#[derive(Debug, Clone)]
pub struct WriteResult<T> {
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub errors: usize,
    pub changes: Vec<Change<T>>,
}

impl<T> Default for WriteResult<T> {
    fn default() -> Self {
        Self {
            inserted: 0,
            replaced: 0,
            unchanged: 0,
            skipped: 0,
            deleted: 0,
            errors: 0,
            changes: Vec::new(),
        }
    }
}

impl<T> WriteResult<T> {
    /// The new value of the first change, when the write returned changes.
    pub fn first_new(&self) -> Option<&T> {
        self.changes.first().and_then(|c| c.new.as_ref())
    }
}

/// An `(old, new)` pair as yielded by a change stream. Inserts have no old
/// value, deletes no new value.
#[derive(Debug, Clone)]
pub struct Change<T> {
    pub old: Option<T>,
    pub new: Option<T>,
}

/// One live connection, registered at accept and removed by `db_clean` when
/// the connection closes. The orphan sweep matches `node_id` against the
/// live-node pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub id: String,
    pub node_id: String,
    pub user: String,
    pub since: i64,
}

impl Row for SessionRow {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Pipe rows are owned by the pipe collaborator; the schema keeps the table
/// so `db_clean` and the orphan sweep cover it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeRow {
    pub id: String,
    pub created_at: i64,
}

impl Row for PipeRow {
    fn key(&self) -> &str {
        &self.id
    }
}

/// A held synchronization lock. `owner` is the holding connection id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRow {
    pub id: String,
    pub owner: String,
}

impl Row for LockRow {
    fn key(&self) -> &str {
        &self.id
    }
}

/// A stored user. `pass` is the hex SHA-256 digest of the password; `tags`
/// maps a dotted prefix to the tag map granted under that prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub user: String,
    pub pass: String,
    pub tags: Map<String, Value>,
}

impl Row for UserRow {
    fn key(&self) -> &str {
        &self.user
    }
}
