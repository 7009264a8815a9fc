use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use super::broker::{task_pull, task_wakeup, DONE_GRACE_MS};
use super::types::{TaskRow, TaskStat};
use crate::context::NodeContext;
use crate::ident::now_ms;
use crate::rpc::protocol::{err_str, ERR_TIMEOUT};

/// Consecutive feed failures tolerated before the worker gives up, which is
/// fatal for the process.
const FEED_RETRY_LIMIT: u32 = 10;

/// Change-feed dispatcher: watches every task row in this node's id range
/// and drives the transition-specific reactions. Reopens the feed on error
/// up to [`FEED_RETRY_LIMIT`] times, resetting the counter on any delivered
/// event; running out of retries cancels the root scope.
pub async fn task_track(ctx: Arc<NodeContext>) {
    let mut retry = 0;
    while retry < FEED_RETRY_LIMIT {
        if ctx.root.is_cancelled() {
            return;
        }
        let (initial, mut rx) = ctx.store.tasks.changes();
        for task in initial {
            if task.id.starts_with(&ctx.node_id) {
                dispatch(&ctx, task);
            }
        }
        loop {
            tokio::select! {
                _ = ctx.root.cancelled() => return,
                change = rx.recv() => match change {
                    Ok(change) => {
                        retry = 0;
                        if let Some(new) = change.new {
                            if new.id.starts_with(&ctx.node_id) {
                                dispatch(&ctx, new);
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("task feed lagged by {} changes, reopening", n);
                        break;
                    }
                    Err(RecvError::Closed) => {
                        tracing::error!("task feed closed, reopening");
                        break;
                    }
                }
            }
        }
        retry += 1;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    tracing::error!("task change feed gave up after {} retries", FEED_RETRY_LIMIT);
    ctx.root.cancel();
}

fn dispatch(ctx: &Arc<NodeContext>, task: TaskRow) {
    match task.stat {
        TaskStat::Done => {
            let prefix = task.conn_prefix().to_string();
            let id = task.id.clone();
            ctx.notifier.notify(&prefix, task);
            let store = ctx.store.clone();
            tokio::spawn(async move {
                store.tasks.delete(&id);
            });
        }
        TaskStat::Working if task.is_pull_record() => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                task_pull(&ctx, &task);
            });
        }
        TaskStat::Waiting if !task.is_pull_record() => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                task_wakeup(&ctx, &task);
            });
        }
        _ => {}
    }
}

/// Deadline purger, ticking every second. Pass one times out every overdue
/// task that is not yet done (re-arming its deadline so the completion is
/// still delivered); pass two deletes done rows past their grace window.
pub async fn task_purge(ctx: Arc<NodeContext>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ctx.root.cancelled() => return,
            _ = tick.tick() => {
                let now = now_ms();
                ctx.store.tasks.expire_before(
                    now,
                    |t| t.stat != TaskStat::Done,
                    |t| {
                        t.stat = TaskStat::Done;
                        t.err_code = Some(ERR_TIMEOUT);
                        t.err_str = Some(err_str(ERR_TIMEOUT).to_string());
                        t.dead_line = now + DONE_GRACE_MS;
                    },
                );
                ctx.store.tasks.delete_before(now, |t| t.stat == TaskStat::Done);
            }
        }
    }
}
