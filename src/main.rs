use serde_json::{json, Map};
use std::net::SocketAddr;
use std::sync::Arc;

use taskgrid::cluster::service::node_track;
use taskgrid::context::{NodeContext, DEFAULT_WATCHDOG_SECS};
use taskgrid::ident::{safe_id, NODE_ID_LEN};
use taskgrid::rpc::connection::serve;
use taskgrid::rpc::handlers::digest;
use taskgrid::store::memory::MemStore;
use taskgrid::store::types::UserRow;
use taskgrid::tasks::feed::{task_purge, task_track};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--node-id <id>] [--watchdog <secs>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:1717", args[0]);
        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut node_id: Option<String> = None;
    let mut watchdog_secs = DEFAULT_WATCHDOG_SECS;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--node-id" => {
                node_id = Some(args[i + 1].clone());
                i += 2;
            }
            "--watchdog" => {
                watchdog_secs = args[i + 1].parse()?;
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.expect("--bind is required");
    let node_id = node_id.unwrap_or_else(|| safe_id(NODE_ID_LEN));
    if node_id.len() != NODE_ID_LEN || !node_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        anyhow::bail!(
            "node id must be {} alphanumeric characters, got {:?}",
            NODE_ID_LEN,
            node_id
        );
    }

    tracing::info!("starting node {} on {}", node_id, bind_addr);

    let store = MemStore::new();
    seed_root_user(&store);

    let ctx = NodeContext::new(node_id, store, watchdog_secs);
    let node_handle = tokio::spawn(node_track(ctx.clone()));
    tokio::spawn(task_track(ctx.clone()));
    tokio::spawn(task_purge(ctx.clone()));

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("listening on {}", bind_addr);

    loop {
        tokio::select! {
            _ = ctx.root.cancelled() => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                ctx.root.cancel();
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("accept from {}", peer);
                    tokio::spawn(serve(ctx.clone(), stream));
                }
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                }
            }
        }
    }

    let _ = node_handle.await;
    Ok(())
}

/// Seeds the bootstrap `root` user (admin on every prefix) when missing.
/// The password comes from `ROOT_PASS`, defaulting to `root` — change it
/// anywhere beyond a local sandbox.
fn seed_root_user(store: &Arc<MemStore>) {
    if store.users.get("root").is_some() {
        return;
    }
    let pass = std::env::var("ROOT_PASS").unwrap_or_else(|_| "root".to_string());
    let mut tags = Map::new();
    tags.insert(".".to_string(), json!({"@admin": true}));
    store.users.insert(UserRow {
        user: "root".to_string(),
        pass: digest(&pass),
        tags,
    });
    tracing::warn!("seeded default root user");
}
