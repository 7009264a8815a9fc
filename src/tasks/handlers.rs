use serde_json::{json, Map, Value};

use super::broker::{DEFAULT_TASK_TIMEOUT_MS, DONE_GRACE_MS};
use super::types::{TaskRow, TaskStat, PULL_PREFIX};
use crate::ident::{now_ms, safe_id, split_path_method};
use crate::rpc::connection::{tag_true, Request};
use crate::rpc::protocol::{
    err_str, ERR_CANCEL, ERR_INTERNAL, ERR_INVALID_PARAMS, ERR_INVALID_TASK, ERR_METHOD_NOT_FOUND,
    ERR_PERMISSION_DENIED,
};

pub async fn handle_task_req(req: Request) {
    match req.method.as_str() {
        "task.push" => task_push(req).await,
        "task.pull" => task_pull_req(req).await,
        "task.cancel" => task_cancel(req).await,
        "task.result" => task_result(req).await,
        "task.error" => task_error(req).await,
        _ => req.error(ERR_METHOD_NOT_FOUND, "", None).await,
    }
}

fn timeout_ms(params: &Value) -> i64 {
    let timeout = params.get("timeout").and_then(Value::as_f64).unwrap_or(0.0);
    if timeout <= 0.0 {
        DEFAULT_TASK_TIMEOUT_MS
    } else {
        (timeout * 1000.0) as i64
    }
}

/// `task.push {method, params, timeout?}`: inserts a waiting task. The
/// response is produced later by the completion demultiplexer once the
/// task reaches `done`, so nothing is answered here on success.
async fn task_push(req: Request) {
    let Some(method) = req.params.get("method").and_then(Value::as_str) else {
        return req.error(ERR_INVALID_PARAMS, "method", None).await;
    };
    let Some(params) = req.params.get("params") else {
        return req.error(ERR_INVALID_PARAMS, "params", None).await;
    };
    let tags = req.conn.tags(method);
    if !(tag_true(&tags, "@task.push") || tag_true(&tags, "@admin")) {
        return req.error(ERR_PERMISSION_DENIED, "", None).await;
    }
    let (path, leaf) = split_path_method(method);
    let now = now_ms();
    let task = TaskRow {
        id: format!("{}{}", req.conn.conn_id, safe_id(10)),
        stat: TaskStat::Waiting,
        path,
        method: leaf,
        params: params.clone(),
        local_id: req.id.clone().unwrap_or(Value::Null),
        tses: String::new(),
        result: None,
        err_code: None,
        err_str: None,
        err_obj: None,
        tags,
        creation_time: now,
        dead_line: now + timeout_ms(&req.params),
    };
    if req.conn.ctx.store.tasks.insert(task).errors > 0 {
        req.error(ERR_INTERNAL, "", None).await;
    }
}

/// `task.pull {prefix, timeout?}`: inserts a pull-record under
/// `@pull.<prefix>`. The response is the matched task's descriptor,
/// delivered when the pull-record reaches `done`.
async fn task_pull_req(req: Request) {
    let prefix = req
        .params
        .get("prefix")
        .and_then(Value::as_str)
        .unwrap_or("");
    if prefix.is_empty() {
        return req.error(ERR_INVALID_PARAMS, "prefix", None).await;
    }
    let prefix = if prefix.ends_with('.') {
        prefix.to_string()
    } else {
        format!("{}.", prefix)
    };
    let tags = req.conn.tags(&prefix);
    if !(tag_true(&tags, "@task.pull") || tag_true(&tags, "@admin")) {
        return req.error(ERR_PERMISSION_DENIED, "", None).await;
    }
    let now = now_ms();
    let record = TaskRow {
        id: format!("{}{}", req.conn.conn_id, safe_id(10)),
        stat: TaskStat::Working,
        path: format!("{}{}", PULL_PREFIX, prefix),
        method: String::new(),
        params: Value::Null,
        local_id: req.id.clone().unwrap_or(Value::Null),
        tses: String::new(),
        result: None,
        err_code: None,
        err_str: None,
        err_obj: None,
        tags: Map::new(),
        creation_time: now,
        dead_line: now + timeout_ms(&req.params),
    };
    if req.conn.ctx.store.tasks.insert(record).errors > 0 {
        req.error(ERR_INTERNAL, "", None).await;
    }
}

/// `task.cancel {taskid}`: addresses a task by the caller's own request id
/// within the connection's id range and forces it `done` with a cancel
/// error. Already-done tasks report `InvalidTask`.
async fn task_cancel(req: Request) {
    let taskid = req.params.get("taskid").cloned().unwrap_or(Value::Null);
    let now = now_ms();
    let res = req.conn.ctx.store.tasks.update_prefix_where(
        &req.conn.conn_id,
        |t| t.local_id == taskid,
        |t| t.stat != TaskStat::Done,
        |t| {
            t.stat = TaskStat::Done;
            t.err_code = Some(ERR_CANCEL);
            t.err_str = Some(err_str(ERR_CANCEL).to_string());
            t.dead_line = now + DONE_GRACE_MS;
        },
    );
    if res.replaced > 0 {
        req.result(json!({"ok": true})).await;
    } else {
        req.error(ERR_INVALID_TASK, "", None).await;
    }
}

/// `task.result {taskid, result}`: the worker completes a task. Conditional
/// on the task not being done already, so duplicate completions stay
/// idempotent and a done row keeps exactly one outcome.
async fn task_result(req: Request) {
    let Some(taskid) = req.params.get("taskid").and_then(Value::as_str) else {
        return req.error(ERR_INVALID_PARAMS, "taskid", None).await;
    };
    let result = req.params.get("result").cloned().unwrap_or(Value::Null);
    let now = now_ms();
    let res = req.conn.ctx.store.tasks.update_if(
        taskid,
        |t| t.stat != TaskStat::Done,
        |t| {
            t.stat = TaskStat::Done;
            t.result = Some(result);
            t.dead_line = now + DONE_GRACE_MS;
        },
    );
    if res.replaced > 0 {
        req.result(json!({"ok": true})).await;
    } else {
        req.error(ERR_INVALID_TASK, "", None).await;
    }
}

/// `task.error {taskid, code, message, data?}`: the worker reports failure;
/// the caller sees the supplied code, message and data verbatim.
async fn task_error(req: Request) {
    let Some(taskid) = req.params.get("taskid").and_then(Value::as_str) else {
        return req.error(ERR_INVALID_PARAMS, "taskid", None).await;
    };
    let code = req.params.get("code").and_then(Value::as_i64).unwrap_or(0);
    let message = req
        .params
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let data = req.params.get("data").cloned();
    let now = now_ms();
    let res = req.conn.ctx.store.tasks.update_if(
        taskid,
        |t| t.stat != TaskStat::Done,
        |t| {
            t.stat = TaskStat::Done;
            t.err_code = Some(code);
            t.err_str = Some(message.clone());
            t.err_obj = data.clone();
            t.dead_line = now + DONE_GRACE_MS;
        },
    );
    if res.replaced > 0 {
        req.result(json!({"ok": true})).await;
    } else {
        req.error(ERR_INVALID_TASK, "", None).await;
    }
}
