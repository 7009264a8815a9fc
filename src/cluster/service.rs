use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use super::types::{LoadAvg, NodeRow};
use crate::context::NodeContext;
use crate::ident::now_ms;

const HEARTBEAT: Duration = Duration::from_secs(3);

/// Heartbeat validity window: a node missing heartbeats for this long is
/// tombstoned by whichever peer notices first.
const NODE_TTL_MS: i64 = 10_000;

/// Extra grace after expiry before a tombstoned node is reaped.
const REAP_GRACE_MS: i64 = 10_000;

/// How many characters of an orphaned owner id the sweep hands to
/// `db_clean`.
const ORPHAN_PREFIX_LEN: usize = 8;

/// Node lifecycle loop: registers this node, then heartbeats every three
/// seconds, tombstoning and reaping dead peers, tracking mastership and
/// (as master) sweeping orphaned rows. Exiting the loop marks the node
/// killed and cancels the root scope.
pub async fn node_track(ctx: Arc<NodeContext>) {
    let row = NodeRow {
        id: ctx.node_id.clone(),
        deadline: now_ms() + NODE_TTL_MS,
        kill: false,
        version: ctx.version.clone(),
        clients: 0,
        load: None,
    };
    if ctx.store.nodes.insert(row).errors > 0 {
        tracing::error!("can't insert on nodes table: id {} already present", ctx.node_id);
        ctx.root.cancel();
        return;
    }
    tracing::info!("node {} registered", ctx.node_id);

    let mut tick = tokio::time::interval(HEARTBEAT);
    loop {
        tokio::select! {
            _ = ctx.root.cancelled() => break,
            _ = tick.tick() => {
                if !heartbeat(&ctx) {
                    break;
                }
            }
        }
    }

    ctx.store
        .nodes
        .update_if(&ctx.node_id, |_| true, |n| n.kill = true);
    tracing::info!("node {} deregistered", ctx.node_id);
    ctx.root.cancel();
}

/// One heartbeat round. Returns false when the node must exit: its row was
/// deleted out from under it, or a peer (or the node itself) set the
/// tombstone flag.
pub(crate) fn heartbeat(ctx: &Arc<NodeContext>) -> bool {
    let now = now_ms();
    let clients = ctx.numconn.load(Ordering::SeqCst);
    let avg = sysinfo::System::load_average();
    let load = LoadAvg {
        one: avg.one,
        five: avg.five,
        fifteen: avg.fifteen,
    };
    let res = ctx.store.nodes.update_if(
        &ctx.node_id,
        |_| true,
        |n| {
            n.deadline = now + NODE_TTL_MS;
            n.clients = clients;
            n.load = Some(load);
        },
    );
    if res.replaced == 0 {
        tracing::error!("zero records updated on nodes table, deleted record?");
        return false;
    }
    if res.first_new().map(|n| n.kill).unwrap_or(false) {
        tracing::error!("node {} has been killed", ctx.node_id);
        return false;
    }

    // Promote expired peers to tombstones.
    ctx.store
        .nodes
        .update_where(|n| n.deadline < now && !n.kill, |n| n.kill = true);

    // Reap tombstones past the grace window, cleaning their leftovers.
    for dead in ctx
        .store
        .nodes
        .filter(|n| n.kill && n.deadline < now - REAP_GRACE_MS)
    {
        tracing::info!("cleaning node {}", dead.id);
        clean_node(ctx, &dead.id);
    }

    // The master is the lexicographically least node id.
    match ctx.store.nodes.min_id() {
        Some(min) if min == ctx.node_id => {
            if !ctx.is_master() {
                tracing::info!("node {} is the master node now", ctx.node_id);
                ctx.set_master(true);
            }
        }
        Some(_) => {
            if ctx.is_master() {
                tracing::info!("node {} is not the master node anymore", ctx.node_id);
                ctx.set_master(false);
            }
        }
        None => {}
    }

    if ctx.is_master() {
        search_orphaned(ctx);
    }
    true
}

pub fn clean_node(ctx: &NodeContext, node: &str) {
    ctx.store.db_clean(node);
    ctx.store.nodes.delete(node);
}

/// Master-only sweep for rows whose owner is no longer a live node: crashes
/// that bypassed the tombstone path leave sessions, tasks, pipes and locks
/// behind. Node ids are alphanumeric by construction, so the concatenated
/// pattern needs no escaping.
pub fn search_orphaned(ctx: &NodeContext) {
    let ids: Vec<String> = ctx.store.nodes.all().into_iter().map(|n| n.id).collect();
    if ids.is_empty() {
        tracing::error!("node list is empty, who am I?");
        return;
    }
    let pattern = format!("(^{})", ids.join("|^"));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => {
            tracing::error!("bad liveness pattern {}: {}", pattern, e);
            return;
        }
    };

    let sessions: Vec<String> = ctx
        .store
        .sessions
        .filter(|s| !re.is_match(&s.node_id))
        .into_iter()
        .map(|s| s.node_id)
        .collect();
    clean_orphans(ctx, "sessions", sessions);

    let tasks: Vec<String> = ctx
        .store
        .tasks
        .filter(|t| !re.is_match(&t.id))
        .into_iter()
        .map(|t| t.id)
        .collect();
    clean_orphans(ctx, "tasks", tasks);

    let pipes: Vec<String> = ctx
        .store
        .pipes
        .filter(|p| !re.is_match(&p.id))
        .into_iter()
        .map(|p| p.id)
        .collect();
    clean_orphans(ctx, "pipes", pipes);

    let locks: Vec<String> = ctx
        .store
        .locks
        .filter(|l| !re.is_match(&l.owner))
        .into_iter()
        .map(|l| l.owner)
        .collect();
    clean_orphans(ctx, "locks", locks);
}

fn clean_orphans(ctx: &NodeContext, what: &str, owners: Vec<String>) {
    if owners.is_empty() {
        return;
    }
    tracing::warn!("found {} orphaned {}", owners.len(), what);
    for owner in owners {
        let prefix: String = owner.chars().take(ORPHAN_PREFIX_LEN).collect();
        ctx.store.db_clean(&prefix);
    }
}
