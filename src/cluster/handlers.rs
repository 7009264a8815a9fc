use serde_json::{json, Value};

use crate::rpc::connection::{tag_true, Request};
use crate::rpc::protocol::{ERR_METHOD_NOT_FOUND, ERR_PERMISSION_DENIED};

/// Administrative node queries under `sys.node.*`.
pub async fn handle_nodes_req(req: Request) {
    match req.method.as_str() {
        "sys.node.list" => node_list(req).await,
        _ => req.error(ERR_METHOD_NOT_FOUND, "", None).await,
    }
}

/// `sys.node.list {limit?, skip?}`: plucks `{id, clients, load, version}`
/// for every registered node, in id order.
async fn node_list(req: Request) {
    let limit = req.params.get("limit").and_then(Value::as_i64).unwrap_or(100);
    let skip = req.params.get("skip").and_then(Value::as_i64).unwrap_or(0);
    let tags = req.conn.tags("sys.node");
    if !(tag_true(&tags, "@sys.node.list") || tag_true(&tags, "@admin")) {
        return req.error(ERR_PERMISSION_DENIED, "", None).await;
    }
    let nodes = req.conn.ctx.store.nodes.all();
    let iter = nodes.into_iter().skip(skip.max(0) as usize);
    let take = if limit > 0 { limit as usize } else { usize::MAX };
    let list: Vec<Value> = iter
        .take(take)
        .map(|n| {
            json!({
                "id": n.id,
                "clients": n.clients,
                "load": n.load,
                "version": n.version,
            })
        })
        .collect();
    req.result(Value::Array(list)).await;
}
