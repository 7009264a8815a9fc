use super::types::*;
use crate::cluster::types::NodeRow;
use crate::tasks::types::{TaskRow, TaskStat};

use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Buffered change-feed capacity. A consumer that falls this far behind is
/// disconnected and must reopen the feed, the same contract a remote change
/// stream gives its clients.
pub const FEED_BUFFER: usize = 4096;

pub type TaskChange = Change<TaskRow>;

#[derive(Default)]
struct TaskTableInner {
    rows: BTreeMap<String, TaskRow>,
    by_stat_path: HashMap<(TaskStat, String), BTreeSet<String>>,
    by_deadline: BTreeSet<(i64, String)>,
}

/// The `tasks` table: primary key `id`, compound `(stat, path)` index for
/// matcher candidate lookup, `deadLine` index for purge sweeps, and a change
/// stream over every write.
///
/// All writes to the table run under one lock, so a conditional update is a
/// true compare-and-swap: two concurrent matchers claiming the same row see
/// at most one `replaced`.
pub struct TaskTable {
    inner: Mutex<TaskTableInner>,
    feed: broadcast::Sender<TaskChange>,
}

impl TaskTable {
    fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_BUFFER);
        Self {
            inner: Mutex::new(TaskTableInner::default()),
            feed,
        }
    }

    fn index_insert(inner: &mut TaskTableInner, row: &TaskRow) {
        inner
            .by_stat_path
            .entry((row.stat, row.path.clone()))
            .or_default()
            .insert(row.id.clone());
        inner.by_deadline.insert((row.dead_line, row.id.clone()));
    }

    fn index_remove(inner: &mut TaskTableInner, row: &TaskRow) {
        if let Some(set) = inner.by_stat_path.get_mut(&(row.stat, row.path.clone())) {
            set.remove(&row.id);
            if set.is_empty() {
                inner.by_stat_path.remove(&(row.stat, row.path.clone()));
            }
        }
        inner.by_deadline.remove(&(row.dead_line, row.id.clone()));
    }

    /// Replaces (or deletes) a row, keeps the indexes in step and emits the
    /// change on the feed. Must run under the table lock.
    fn commit(&self, inner: &mut TaskTableInner, old: Option<TaskRow>, new: Option<TaskRow>) {
        if let Some(o) = &old {
            Self::index_remove(inner, o);
            inner.rows.remove(&o.id);
        }
        if let Some(n) = &new {
            Self::index_insert(inner, n);
            inner.rows.insert(n.id.clone(), n.clone());
        }
        let _ = self.feed.send(Change { old, new });
    }

    pub fn insert(&self, row: TaskRow) -> WriteResult<TaskRow> {
        let mut inner = self.inner.lock().unwrap();
        let mut res = WriteResult::default();
        if inner.rows.contains_key(&row.id) {
            res.errors = 1;
            return res;
        }
        self.commit(&mut inner, None, Some(row));
        res.inserted = 1;
        res
    }

    pub fn get(&self, id: &str) -> Option<TaskRow> {
        self.inner.lock().unwrap().rows.get(id).cloned()
    }

    /// Conditional update on one row: missing row counts `skipped`, a failed
    /// guard or a no-op mutation counts `unchanged`, a real change counts
    /// `replaced` and is returned in `changes`.
    pub fn update_if<G, F>(&self, id: &str, guard: G, apply: F) -> WriteResult<TaskRow>
    where
        G: FnOnce(&TaskRow) -> bool,
        F: FnOnce(&mut TaskRow),
    {
        let mut inner = self.inner.lock().unwrap();
        let mut res = WriteResult::default();
        let Some(old) = inner.rows.get(id).cloned() else {
            res.skipped = 1;
            return res;
        };
        if !guard(&old) {
            res.unchanged = 1;
            return res;
        }
        let mut new = old.clone();
        apply(&mut new);
        if new == old {
            res.unchanged = 1;
            return res;
        }
        self.commit(&mut inner, Some(old.clone()), Some(new.clone()));
        res.replaced = 1;
        res.changes.push(Change {
            old: Some(old),
            new: Some(new),
        });
        res
    }

    /// `Sample(1)` over the `(stat, path)` index plus a conditional update:
    /// picks one random candidate and flips it under the table lock. An
    /// empty candidate set returns an all-zero result (the matcher gives up
    /// quietly); a guard that no longer holds counts `unchanged`.
    pub fn claim_one<F>(&self, stat: TaskStat, path: &str, apply: F) -> WriteResult<TaskRow>
    where
        F: FnOnce(&mut TaskRow),
    {
        let mut inner = self.inner.lock().unwrap();
        let mut res = WriteResult::default();
        let id = {
            let Some(ids) = inner.by_stat_path.get(&(stat, path.to_string())) else {
                return res;
            };
            if ids.is_empty() {
                return res;
            }
            let nth = rand::thread_rng().gen_range(0..ids.len());
            match ids.iter().nth(nth) {
                Some(id) => id.clone(),
                None => return res,
            }
        };
        let Some(old) = inner.rows.get(&id).cloned() else {
            res.skipped = 1;
            return res;
        };
        if old.stat != stat {
            res.unchanged = 1;
            return res;
        }
        let mut new = old.clone();
        apply(&mut new);
        if new == old {
            res.unchanged = 1;
            return res;
        }
        self.commit(&mut inner, Some(old.clone()), Some(new.clone()));
        res.replaced = 1;
        res.changes.push(Change {
            old: Some(old),
            new: Some(new),
        });
        res
    }

    /// Conditional update over the id range `[prefix, prefix + \u{ffff}]`,
    /// restricted to rows passing `filter`. Used by `task.cancel` to address
    /// a task by the caller's connection prefix and local request id.
    pub fn update_prefix_where<P, G, F>(
        &self,
        prefix: &str,
        filter: P,
        guard: G,
        apply: F,
    ) -> WriteResult<TaskRow>
    where
        P: Fn(&TaskRow) -> bool,
        G: Fn(&TaskRow) -> bool,
        F: Fn(&mut TaskRow),
    {
        let mut inner = self.inner.lock().unwrap();
        let mut res = WriteResult::default();
        let hi = format!("{}\u{ffff}", prefix);
        let ids: Vec<String> = inner
            .rows
            .range(prefix.to_string()..hi)
            .filter(|(_, r)| filter(r))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            let old = match inner.rows.get(&id) {
                Some(r) => r.clone(),
                None => continue,
            };
            if !guard(&old) {
                res.unchanged += 1;
                continue;
            }
            let mut new = old.clone();
            apply(&mut new);
            if new == old {
                res.unchanged += 1;
                continue;
            }
            self.commit(&mut inner, Some(old.clone()), Some(new.clone()));
            res.replaced += 1;
            res.changes.push(Change {
                old: Some(old),
                new: Some(new),
            });
        }
        res
    }

    /// Conditional update over every row with `deadLine < now` (the first
    /// purger pass).
    pub fn expire_before<G, F>(&self, now: i64, guard: G, apply: F) -> WriteResult<TaskRow>
    where
        G: Fn(&TaskRow) -> bool,
        F: Fn(&mut TaskRow),
    {
        let mut inner = self.inner.lock().unwrap();
        let mut res = WriteResult::default();
        let ids: Vec<String> = inner
            .by_deadline
            .range(..(now, String::new()))
            .map(|(_, id)| id.clone())
            .collect();
        for id in ids {
            let old = match inner.rows.get(&id) {
                Some(r) => r.clone(),
                None => continue,
            };
            if !guard(&old) {
                res.unchanged += 1;
                continue;
            }
            let mut new = old.clone();
            apply(&mut new);
            if new == old {
                res.unchanged += 1;
                continue;
            }
            self.commit(&mut inner, Some(old.clone()), Some(new.clone()));
            res.replaced += 1;
        }
        res
    }

    /// Deletes every row with `deadLine < now` passing `filter` (the second
    /// purger pass).
    pub fn delete_before<P>(&self, now: i64, filter: P) -> WriteResult<TaskRow>
    where
        P: Fn(&TaskRow) -> bool,
    {
        let mut inner = self.inner.lock().unwrap();
        let mut res = WriteResult::default();
        let ids: Vec<String> = inner
            .by_deadline
            .range(..(now, String::new()))
            .map(|(_, id)| id.clone())
            .collect();
        for id in ids {
            let old = match inner.rows.get(&id) {
                Some(r) if filter(r) => r.clone(),
                _ => continue,
            };
            self.commit(&mut inner, Some(old), None);
            res.deleted += 1;
        }
        res
    }

    pub fn delete(&self, id: &str) -> WriteResult<TaskRow> {
        let mut inner = self.inner.lock().unwrap();
        let mut res = WriteResult::default();
        match inner.rows.get(id).cloned() {
            Some(old) => {
                self.commit(&mut inner, Some(old), None);
                res.deleted = 1;
            }
            None => res.skipped = 1,
        }
        res
    }

    pub fn filter<P>(&self, pred: P) -> Vec<TaskRow>
    where
        P: Fn(&TaskRow) -> bool,
    {
        self.inner
            .lock()
            .unwrap()
            .rows
            .values()
            .filter(|r| pred(r))
            .cloned()
            .collect()
    }

    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let hi = format!("{}\u{ffff}", prefix);
        let ids: Vec<String> = inner
            .rows
            .range(prefix.to_string()..hi)
            .map(|(id, _)| id.clone())
            .collect();
        let n = ids.len();
        for id in ids {
            if let Some(old) = inner.rows.get(&id).cloned() {
                self.commit(&mut inner, Some(old), None);
            }
        }
        n
    }

    /// Opens the change stream: a snapshot of the current rows (the
    /// include-initial pass) plus a receiver for every subsequent write.
    /// Both are taken under the table lock, so no change falls in between.
    pub fn changes(&self) -> (Vec<TaskRow>, broadcast::Receiver<TaskChange>) {
        let inner = self.inner.lock().unwrap();
        let rx = self.feed.subscribe();
        let snapshot = inner.rows.values().cloned().collect();
        (snapshot, rx)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A plain keyed table without secondary indexes, used for the `nodes`,
/// `sessions`, `pipes`, `locks` and `users` tables.
pub struct Table<T: Row> {
    rows: Mutex<BTreeMap<String, T>>,
}

impl<T: Row> Table<T> {
    fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, row: T) -> WriteResult<T> {
        let mut rows = self.rows.lock().unwrap();
        let mut res = WriteResult::default();
        if rows.contains_key(row.key()) {
            res.errors = 1;
            return res;
        }
        rows.insert(row.key().to_string(), row);
        res.inserted = 1;
        res
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.rows.lock().unwrap().get(key).cloned()
    }

    pub fn update_if<G, F>(&self, key: &str, guard: G, apply: F) -> WriteResult<T>
    where
        G: FnOnce(&T) -> bool,
        F: FnOnce(&mut T),
    {
        let mut rows = self.rows.lock().unwrap();
        let mut res = WriteResult::default();
        let Some(old) = rows.get(key).cloned() else {
            res.skipped = 1;
            return res;
        };
        if !guard(&old) {
            res.unchanged = 1;
            return res;
        }
        let mut new = old.clone();
        apply(&mut new);
        if new == old {
            res.unchanged = 1;
            return res;
        }
        rows.insert(key.to_string(), new.clone());
        res.replaced = 1;
        res.changes.push(Change {
            old: Some(old),
            new: Some(new),
        });
        res
    }

    pub fn update_where<P, F>(&self, filter: P, apply: F) -> WriteResult<T>
    where
        P: Fn(&T) -> bool,
        F: Fn(&mut T),
    {
        let mut rows = self.rows.lock().unwrap();
        let mut res = WriteResult::default();
        let keys: Vec<String> = rows
            .iter()
            .filter(|(_, r)| filter(r))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            let old = match rows.get(&key) {
                Some(r) => r.clone(),
                None => continue,
            };
            let mut new = old.clone();
            apply(&mut new);
            if new == old {
                res.unchanged += 1;
                continue;
            }
            rows.insert(key, new.clone());
            res.replaced += 1;
            res.changes.push(Change {
                old: Some(old),
                new: Some(new),
            });
        }
        res
    }

    pub fn filter<P>(&self, pred: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        self.rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| pred(r))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<T> {
        self.rows.lock().unwrap().values().cloned().collect()
    }

    pub fn min_id(&self) -> Option<String> {
        self.rows
            .lock()
            .unwrap()
            .keys()
            .next()
            .map(|k| k.to_string())
    }

    pub fn delete(&self, key: &str) -> WriteResult<T> {
        let mut rows = self.rows.lock().unwrap();
        let mut res = WriteResult::default();
        if rows.remove(key).is_some() {
            res.deleted = 1;
        } else {
            res.skipped = 1;
        }
        res
    }

    pub fn delete_where<P>(&self, pred: P) -> usize
    where
        P: Fn(&T) -> bool,
    {
        let mut rows = self.rows.lock().unwrap();
        let keys: Vec<String> = rows
            .iter()
            .filter(|(_, r)| pred(r))
            .map(|(k, _)| k.clone())
            .collect();
        let n = keys.len();
        for key in keys {
            rows.remove(&key);
        }
        n
    }

    pub fn delete_prefix(&self, prefix: &str) -> usize {
        self.delete_where(|r| r.key().starts_with(prefix))
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The shared document store every broker node coordinates through. Node
/// handles in the same process share one `Arc<MemStore>`; all cross-node
/// synchronization happens through its conditional updates and the task
/// change feed.
pub struct MemStore {
    pub tasks: TaskTable,
    pub nodes: Table<NodeRow>,
    pub sessions: Table<SessionRow>,
    pub pipes: Table<PipeRow>,
    pub locks: Table<LockRow>,
    pub users: Table<UserRow>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: TaskTable::new(),
            nodes: Table::new(),
            sessions: Table::new(),
            pipes: Table::new(),
            locks: Table::new(),
            users: Table::new(),
        })
    }

    /// Best-effort removal of every row owned by a connection or node id:
    /// tasks and sessions and pipes by key prefix, locks by owner prefix.
    /// Node rows are reaped separately by the cluster service.
    pub fn db_clean(&self, owner: &str) {
        if owner.is_empty() {
            return;
        }
        let tasks = self.tasks.delete_prefix(owner);
        let sessions = self.sessions.delete_prefix(owner);
        let pipes = self.pipes.delete_prefix(owner);
        let locks = self.locks.delete_where(|l| l.owner.starts_with(owner));
        tracing::debug!(
            "db_clean {}: {} tasks, {} sessions, {} pipes, {} locks",
            owner,
            tasks,
            sessions,
            pipes,
            locks
        );
    }
}
