use serde::{Deserialize, Serialize};
use serde_json::Value;

// JSON-RPC 2.0 codes.
pub const ERR_PARSE: i64 = -32700;
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
pub const ERR_INTERNAL: i64 = -32603;

// Application codes.
pub const ERR_TIMEOUT: i64 = -32000;
pub const ERR_CANCEL: i64 = -32001;
pub const ERR_INVALID_TASK: i64 = -32002;
pub const ERR_INVALID_USER: i64 = -32004;
pub const ERR_LOCK_NOT_OWNED: i64 = -32006;
pub const ERR_PERMISSION_DENIED: i64 = -32010;

/// Canonical message for a negative error code.
pub fn err_str(code: i64) -> &'static str {
    match code {
        ERR_PARSE => "parse error",
        ERR_INVALID_REQUEST => "invalid request",
        ERR_METHOD_NOT_FOUND => "method not found",
        ERR_INVALID_PARAMS => "invalid params",
        ERR_INTERNAL => "internal error",
        ERR_TIMEOUT => "timeout",
        ERR_CANCEL => "cancel",
        ERR_INVALID_TASK => "invalid task",
        ERR_INVALID_USER => "invalid user",
        ERR_LOCK_NOT_OWNED => "lock not owned",
        ERR_PERMISSION_DENIED => "permission denied",
        _ => "error",
    }
}

/// Canonical message, optionally annotated as `<canonical>:[<context>]`.
pub fn err_message(code: i64, context: &str) -> String {
    if context.is_empty() {
        err_str(code).to_string()
    } else {
        format!("{}:[{}]", err_str(code), context)
    }
}

/// One inbound frame. Missing fields default so that validation (not
/// deserialization) rejects malformed requests; a field of the wrong type
/// is a deserialization error and maps to `InvalidRequest`.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcReq {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcErr {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One outbound frame. `id: None` marks a response that is normally
/// suppressed by the writer; parse and invalid-request errors get a JSON
/// null id instead.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRes {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErr>,
}

impl JsonRpcRes {
    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i64, context: &str, data: Option<Value>) -> Self {
        let message = if code < 0 {
            err_message(code, context)
        } else {
            context.to_string()
        };
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcErr {
                code,
                message,
                data,
            }),
        }
    }
}

/// Applies the writer's id and payload rules: a response without an id is
/// dropped unless it carries a parse or invalid-request error (whose id
/// becomes JSON null), and a response with neither result nor error is
/// normalized to `result: null`.
pub fn normalize(mut res: JsonRpcRes) -> Option<JsonRpcRes> {
    if res.id.is_none() {
        match &res.error {
            Some(e) if e.code == ERR_PARSE || e.code == ERR_INVALID_REQUEST => {
                res.id = Some(Value::Null);
            }
            _ => return None,
        }
    }
    if res.result.is_none() && res.error.is_none() {
        res.result = Some(Value::Null);
    }
    Some(res)
}
