use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::protocol::{
    normalize, JsonRpcErr, JsonRpcReq, JsonRpcRes, ERR_INVALID_REQUEST, ERR_METHOD_NOT_FOUND,
    ERR_PARSE,
};
use crate::context::NodeContext;
use crate::ident::{now_ms, prefixes, safe_id};
use crate::store::types::{SessionRow, UserRow};

/// Bounded queue sizes giving each connection a fixed memory footprint.
pub const REQ_BUFFER: usize = 64;
pub const RES_BUFFER: usize = 64;

/// Per-frame size ceiling on the inbound stream.
pub const MAX_FRAME_BYTES: u64 = 32 * 1024 * 1024;

const WATCHDOG_TICK: Duration = Duration::from_secs(10);
const MIN_WATCHDOG_SECS: i64 = 10;

/// State shared by a connection's cooperating loops and by every in-flight
/// request handler. Requests hold a non-owning `Arc` back-reference whose
/// lifetime is bounded by the connection's cancellation scope.
pub struct ConnShared {
    pub ctx: Arc<NodeContext>,
    pub conn_id: String,
    pub cancel: CancellationToken,
    user: Mutex<Option<UserRow>>,
    res_tx: mpsc::Sender<JsonRpcRes>,
    wdog_secs: AtomicI64,
    last_read: AtomicI64,
    last_write: AtomicI64,
}

impl ConnShared {
    /// Enqueues a response, observing cancellation while the bounded queue
    /// applies backpressure.
    pub async fn push_res(&self, res: JsonRpcRes) -> Result<()> {
        tokio::select! {
            sent = self.res_tx.send(res) => sent.map_err(|_| anyhow!("response queue closed")),
            _ = self.cancel.cancelled() => Err(anyhow!("connection cancelled")),
        }
    }

    /// The effective tag set for a dotted name: the user's tag maps merged
    /// over the name's prefixes, deeper prefixes overriding shallower ones.
    pub fn tags(&self, name: &str) -> Map<String, Value> {
        let mut out = Map::new();
        let user = self.user.lock().unwrap();
        let Some(user) = user.as_ref() else {
            return out;
        };
        for pf in prefixes(name) {
            if let Some(Value::Object(map)) = user.tags.get(&pf) {
                for (k, v) in map {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        out
    }

    pub fn set_user(&self, user: UserRow) {
        *self.user.lock().unwrap() = Some(user);
    }

    pub fn user_name(&self) -> Option<String> {
        self.user.lock().unwrap().as_ref().map(|u| u.user.clone())
    }

    pub fn watchdog_secs(&self) -> i64 {
        self.wdog_secs.load(Ordering::Relaxed)
    }

    pub fn set_watchdog_secs(&self, secs: i64) {
        self.wdog_secs
            .store(secs.max(MIN_WATCHDOG_SECS), Ordering::Relaxed);
    }
}

/// True when the tag map carries the named grant as a literal `true`.
pub fn tag_true(tags: &Map<String, Value>, key: &str) -> bool {
    matches!(tags.get(key), Some(Value::Bool(true)))
}

/// One parsed request, carrying its connection back-reference so handlers
/// can enqueue a response without owning the connection.
pub struct Request {
    pub id: Option<Value>,
    pub method: String,
    pub params: Value,
    pub conn: Arc<ConnShared>,
}

impl Request {
    pub async fn result(&self, result: Value) {
        let _ = self
            .conn
            .push_res(JsonRpcRes::result(self.id.clone(), result))
            .await;
    }

    pub async fn error(&self, code: i64, context: &str, data: Option<Value>) {
        let _ = self
            .conn
            .push_res(JsonRpcRes::error(self.id.clone(), code, context, data))
            .await;
    }
}

/// Runs one accepted transport to completion: spawns the reader, writer,
/// watchdog and completion-demultiplexer loops, dispatches requests on this
/// task, and cleans up the connection's rows when the scope ends.
pub async fn serve(ctx: Arc<NodeContext>, stream: TcpStream) {
    let conn_id = format!("{}{}", ctx.node_id, safe_id(4));
    let (res_tx, res_rx) = mpsc::channel(RES_BUFFER);
    let (req_tx, mut req_rx) = mpsc::channel::<JsonRpcReq>(REQ_BUFFER);
    let now = now_ms();
    let shared = Arc::new(ConnShared {
        ctx: ctx.clone(),
        conn_id: conn_id.clone(),
        cancel: ctx.root.child_token(),
        user: Mutex::new(None),
        res_tx,
        wdog_secs: AtomicI64::new(ctx.watchdog_secs),
        last_read: AtomicI64::new(now),
        last_write: AtomicI64::new(now),
    });
    ctx.numconn.fetch_add(1, Ordering::SeqCst);
    ctx.store.sessions.insert(SessionRow {
        id: conn_id.clone(),
        node_id: ctx.node_id.clone(),
        user: String::new(),
        since: now,
    });
    tracing::info!("connection {} accepted", conn_id);

    let (rd, wr) = stream.into_split();
    spawn_guarded(shared.cancel.clone(), recv_worker(shared.clone(), rd, req_tx));
    spawn_guarded(shared.cancel.clone(), send_worker(shared.clone(), wr, res_rx));
    spawn_guarded(shared.cancel.clone(), resp_worker(shared.clone()));
    spawn_guarded(shared.cancel.clone(), watchdog(shared.clone()));

    loop {
        let req = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            received = req_rx.recv() => match received {
                Some(req) => req,
                None => break,
            },
        };
        if req.jsonrpc != "2.0" || req.method.is_empty() {
            let _ = shared
                .push_res(JsonRpcRes::error(req.id, ERR_INVALID_REQUEST, "", None))
                .await;
            continue;
        }
        tracing::debug!("{} <- {} ({:?})", conn_id, req.method, req.id);
        let request = Request {
            id: req.id,
            method: req.method,
            params: req.params,
            conn: shared.clone(),
        };
        tokio::spawn(handle_req(request));
    }

    shared.cancel.cancel();
    ctx.numconn.fetch_sub(1, Ordering::SeqCst);
    if !ctx.root.is_cancelled() {
        tracing::info!("clean {} session", conn_id);
        ctx.store.db_clean(&conn_id);
    }
}

fn spawn_guarded<F>(cancel: CancellationToken, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        fut.await;
        cancel.cancel();
    });
}

/// Routes one validated request by its namespace prefix. Notifications
/// (requests without an id) are dropped without a response.
async fn handle_req(req: Request) {
    if req.id.is_none() {
        return;
    }
    let method = req.method.clone();
    if method.starts_with("sys.") {
        super::handlers::handle_sys_req(req).await;
    } else if method.starts_with("task.") {
        crate::tasks::handlers::handle_task_req(req).await;
    } else if method.starts_with("sync.") {
        super::handlers::handle_sync_req(req).await;
    } else if method.starts_with("pipe.")
        || method.starts_with("chan.")
        || method.starts_with("user.")
    {
        // Collaborator namespaces not linked into this build.
        req.error(ERR_METHOD_NOT_FOUND, "", None).await;
    } else {
        req.error(ERR_METHOD_NOT_FOUND, "", None).await;
    }
}

/// Reader loop: consumes line-delimited JSON frames up to the size ceiling.
/// Structural errors produce a null-id parse error and the decoder picks up
/// at the next line; type mismatches produce an invalid-request error;
/// transport errors end the loop (and with it the connection scope).
async fn recv_worker(
    shared: Arc<ConnShared>,
    rd: OwnedReadHalf,
    req_tx: mpsc::Sender<JsonRpcReq>,
) {
    let mut reader = BufReader::new(rd);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_FRAME_BYTES);
        let n = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            read = limited.read_until(b'\n', &mut buf) => match read {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("connection {} read error: {}", shared.conn_id, e);
                    return;
                }
            },
        };
        if n == 0 {
            tracing::debug!("connection {} reached end of stream", shared.conn_id);
            return;
        }
        shared.last_read.store(now_ms(), Ordering::Relaxed);
        if !buf.ends_with(b"\n") && buf.len() as u64 >= MAX_FRAME_BYTES {
            tracing::warn!("connection {} frame over {} bytes", shared.conn_id, MAX_FRAME_BYTES);
            return;
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<JsonRpcReq>(&buf) {
            Ok(req) => {
                let sent = tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    sent = req_tx.send(req) => sent,
                };
                if sent.is_err() {
                    return;
                }
            }
            Err(e) if e.classify() == serde_json::error::Category::Data => {
                let _ = shared
                    .push_res(JsonRpcRes::error(None, ERR_INVALID_REQUEST, "", None))
                    .await;
            }
            Err(_) => {
                let _ = shared
                    .push_res(JsonRpcRes::error(None, ERR_PARSE, "", None))
                    .await;
            }
        }
    }
}

/// Writer loop: drains the response queue, applies the id and null-result
/// normalization rules, and writes CRLF-terminated frames in enqueue order.
async fn send_worker(
    shared: Arc<ConnShared>,
    mut wr: OwnedWriteHalf,
    mut res_rx: mpsc::Receiver<JsonRpcRes>,
) {
    loop {
        let res = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            received = res_rx.recv() => match received {
                Some(res) => res,
                None => return,
            },
        };
        let Some(res) = normalize(res) else {
            continue;
        };
        let mut bytes = match serde_json::to_vec(&res) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("response marshal error: {}", e);
                return;
            }
        };
        bytes.extend_from_slice(b"\r\n");
        if let Err(e) = wr.write_all(&bytes).await {
            tracing::debug!("connection {} write error: {}", shared.conn_id, e);
            return;
        }
        shared.last_write.store(now_ms(), Ordering::Relaxed);
    }
}

/// Completion demultiplexer: registers this connection with the session
/// notifier and converts completed tasks pushed by the change feed into
/// responses addressed by the original request id. A duplicate session id
/// fails the registration and tears the connection down.
async fn resp_worker(shared: Arc<ConnShared>) {
    let mut rx = match shared.ctx.notifier.register(&shared.conn_id) {
        Ok(rx) => rx,
        Err(e) => {
            tracing::error!("{}", e);
            return;
        }
    };
    loop {
        let task = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(task) => task,
                None => break,
            },
        };
        let res = match task.err_code {
            Some(code) => JsonRpcRes {
                jsonrpc: "2.0",
                id: Some(task.local_id),
                result: None,
                error: Some(JsonRpcErr {
                    code,
                    message: task.err_str.unwrap_or_default(),
                    data: task.err_obj,
                }),
            },
            None => JsonRpcRes::result(Some(task.local_id), task.result.unwrap_or(Value::Null)),
        };
        if shared.push_res(res).await.is_err() {
            break;
        }
    }
    shared.ctx.notifier.unregister(&shared.conn_id);
}

/// Liveness watchdog: every 10 seconds, cancels the scope once both the
/// last read and the last write are older than the connection's threshold.
async fn watchdog(shared: Arc<ConnShared>) {
    let mut tick = tokio::time::interval(WATCHDOG_TICK);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tick.tick() => {
                let now = now_ms();
                let max_ms = shared.watchdog_secs() * 1000;
                if now - shared.last_read.load(Ordering::Relaxed) > max_ms
                    && now - shared.last_write.load(Ordering::Relaxed) > max_ms
                {
                    tracing::warn!("connection {} watchdog expired", shared.conn_id);
                    return;
                }
            }
        }
    }
}
