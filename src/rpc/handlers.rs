use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::connection::{tag_true, Request};
use super::protocol::{
    ERR_INVALID_PARAMS, ERR_INVALID_USER, ERR_LOCK_NOT_OWNED, ERR_METHOD_NOT_FOUND,
    ERR_PERMISSION_DENIED,
};
use crate::store::types::LockRow;

/// Hex SHA-256 digest used for stored passwords.
pub fn digest(pass: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pass.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub async fn handle_sys_req(req: Request) {
    match req.method.as_str() {
        "sys.ping" => req.result(json!("pong")).await,
        "sys.login" => sys_login(req).await,
        "sys.watchdog" => sys_watchdog(req).await,
        method if method.starts_with("sys.node.") => {
            crate::cluster::handlers::handle_nodes_req(req).await
        }
        _ => req.error(ERR_METHOD_NOT_FOUND, "", None).await,
    }
}

async fn sys_login(req: Request) {
    let Some(user) = req.params.get("user").and_then(Value::as_str) else {
        return req.error(ERR_INVALID_PARAMS, "user", None).await;
    };
    let Some(pass) = req.params.get("pass").and_then(Value::as_str) else {
        return req.error(ERR_INVALID_PARAMS, "pass", None).await;
    };
    let Some(row) = req.conn.ctx.store.users.get(user) else {
        return req.error(ERR_INVALID_USER, "", None).await;
    };
    if digest(pass) != row.pass {
        return req.error(ERR_INVALID_USER, "", None).await;
    }
    let name = row.user.clone();
    req.conn.set_user(row);
    req.conn
        .ctx
        .store
        .sessions
        .update_if(&req.conn.conn_id, |_| true, |s| s.user = name.clone());
    tracing::info!("connection {} logged in as {}", req.conn.conn_id, user);
    req.result(json!({"ok": true, "user": user})).await;
}

async fn sys_watchdog(req: Request) {
    let value = req.params.get("value").and_then(Value::as_i64).unwrap_or(0);
    if value <= 0 {
        return req.error(ERR_INVALID_PARAMS, "value", None).await;
    }
    req.conn.set_watchdog_secs(value);
    req.result(json!({"ok": true, "watchdog": req.conn.watchdog_secs()}))
        .await;
}

pub async fn handle_sync_req(req: Request) {
    match req.method.as_str() {
        "sync.lock" => sync_lock(req).await,
        "sync.unlock" => sync_unlock(req).await,
        _ => req.error(ERR_METHOD_NOT_FOUND, "", None).await,
    }
}

async fn sync_lock(req: Request) {
    let Some(lock) = req.params.get("lock").and_then(Value::as_str) else {
        return req.error(ERR_INVALID_PARAMS, "lock", None).await;
    };
    let tags = req.conn.tags(lock);
    if !(tag_true(&tags, "@sync.lock") || tag_true(&tags, "@admin")) {
        return req.error(ERR_PERMISSION_DENIED, "", None).await;
    }
    let res = req.conn.ctx.store.locks.insert(LockRow {
        id: lock.to_string(),
        owner: req.conn.conn_id.clone(),
    });
    if res.errors > 0 {
        return req.error(ERR_LOCK_NOT_OWNED, "", None).await;
    }
    req.result(json!({"ok": true})).await;
}

async fn sync_unlock(req: Request) {
    let Some(lock) = req.params.get("lock").and_then(Value::as_str) else {
        return req.error(ERR_INVALID_PARAMS, "lock", None).await;
    };
    let tags = req.conn.tags(lock);
    if !(tag_true(&tags, "@sync.unlock") || tag_true(&tags, "@admin")) {
        return req.error(ERR_PERMISSION_DENIED, "", None).await;
    }
    let owner = req.conn.conn_id.clone();
    let deleted = req
        .conn
        .ctx
        .store
        .locks
        .delete_where(|l| l.id == lock && l.owner == owner);
    if deleted > 0 {
        req.result(json!({"ok": true})).await;
    } else {
        req.error(ERR_LOCK_NOT_OWNED, "", None).await;
    }
}
