use serde_json::json;

use super::types::{TaskRow, TaskStat, PULL_PREFIX};
use crate::context::NodeContext;
use crate::ident::now_ms;

/// Default task lifetime when the caller supplies no timeout: ten days.
pub const DEFAULT_TASK_TIMEOUT_MS: i64 = 10 * 24 * 60 * 60 * 1000;

/// How long a finished task row is retained before the purger deletes it.
pub const DONE_GRACE_MS: i64 = 600_000;

/// Ceiling on consecutive claim collisions before a matcher gives up. The
/// next change-feed event re-triggers matching, so giving up loses nothing.
const CLAIM_RETRY_LIMIT: usize = 10;

/// Pull path of the matching: a pull-record has entered `working`, so try
/// to claim a waiting task under its prefix and complete the pull-record
/// with the claimed task's descriptor. When the pull-record can no longer
/// be completed (cancelled or timed out in between), the claim is rolled
/// back. An unmatched pull-record is parked back to `waiting` so a later
/// push can wake it.
pub fn task_pull(ctx: &NodeContext, pull: &TaskRow) -> bool {
    let prefix = pull.path.strip_prefix(PULL_PREFIX).unwrap_or(&pull.path);
    let key = prefix.strip_suffix('.').unwrap_or(prefix).to_string();
    let worker = pull.conn_prefix().to_string();
    let mut collisions = 0;
    loop {
        let claim = ctx.store.tasks.claim_one(TaskStat::Waiting, &key, |t| {
            t.stat = TaskStat::Working;
            t.tses = worker.clone();
        });
        if claim.replaced > 0 {
            let Some(claimed) = claim.first_new().cloned() else {
                break;
            };
            let descriptor = json!({
                "taskid": claimed.id,
                "path": claimed.path,
                "method": claimed.method,
                "params": claimed.params,
                "tags": claimed.tags,
            });
            let now = now_ms();
            let done = ctx.store.tasks.update_if(
                &pull.id,
                |t| t.stat == TaskStat::Working,
                |t| {
                    t.stat = TaskStat::Done;
                    t.result = Some(descriptor);
                    t.dead_line = now + DONE_GRACE_MS;
                },
            );
            if done.replaced != 1 {
                // The pull-record went away under us; re-queue the task.
                ctx.store.tasks.update_if(
                    &claimed.id,
                    |_| true,
                    |t| {
                        t.stat = TaskStat::Waiting;
                        t.tses.clear();
                    },
                );
                break;
            }
            return true;
        }
        if claim.unchanged > 0 {
            collisions += 1;
            if collisions >= CLAIM_RETRY_LIMIT {
                tracing::warn!("giving up on contended claim for {}", key);
                break;
            }
            tracing::debug!("claim collision on {}, retrying", key);
            continue;
        }
        break;
    }
    ctx.store.tasks.update_if(
        &pull.id,
        |t| t.stat == TaskStat::Working,
        |t| t.stat = TaskStat::Waiting,
    );
    false
}

/// Push path of the matching: a task has entered `waiting`, so try to wake
/// one pull-record parked under `@pull.<path>.`. Flipping the pull-record
/// to `working` re-enters [`task_pull`] through the change feed, which
/// performs the actual hand-off.
pub fn task_wakeup(ctx: &NodeContext, task: &TaskRow) -> bool {
    let key = format!("{}{}.", PULL_PREFIX, task.path);
    let mut collisions = 0;
    loop {
        let res = ctx
            .store
            .tasks
            .claim_one(TaskStat::Waiting, &key, |t| t.stat = TaskStat::Working);
        if res.replaced > 0 {
            return true;
        }
        if res.unchanged > 0 {
            collisions += 1;
            if collisions >= CLAIM_RETRY_LIMIT {
                tracing::warn!("giving up on contended wakeup for {}", key);
                return false;
            }
            continue;
        }
        return false;
    }
}
