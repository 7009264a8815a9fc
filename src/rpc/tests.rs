//! Connection Engine Tests
//!
//! Unit tests for the writer normalization rules and the session notifier,
//! plus end-to-end scenarios over real TCP sockets: the full push/pull
//! round-trip, timeouts, cancellation, match races, authorization and
//! stream resynchronization.

#[cfg(test)]
mod tests {
    use crate::cluster::service::node_track;
    use crate::context::NodeContext;
    use crate::ident::now_ms;
    use crate::rpc::connection::serve;
    use crate::rpc::handlers::digest;
    use crate::rpc::notifier::{SessionNotifier, NOTIFY_BUFFER};
    use crate::rpc::protocol::{normalize, JsonRpcRes, ERR_PARSE};
    use crate::store::memory::MemStore;
    use crate::store::types::UserRow;
    use crate::tasks::feed::{task_purge, task_track};
    use crate::tasks::types::{TaskRow, TaskStat};
    use serde_json::{json, Map, Value};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const NODE: &str = "NODEAAAAAAAA";

    fn seed_users(store: &Arc<MemStore>) {
        let mut tags = Map::new();
        tags.insert(".".to_string(), json!({"@admin": true}));
        store.users.insert(UserRow {
            user: "root".to_string(),
            pass: digest("root"),
            tags,
        });
        let mut tags = Map::new();
        tags.insert(
            "math.".to_string(),
            json!({"@task.push": true, "@task.pull": true}),
        );
        store.users.insert(UserRow {
            user: "limited".to_string(),
            pass: digest("limited"),
            tags,
        });
    }

    async fn start_node(node_id: &str) -> (Arc<NodeContext>, SocketAddr) {
        let store = MemStore::new();
        seed_users(&store);
        let ctx = NodeContext::new(node_id.to_string(), store, 90);
        tokio::spawn(node_track(ctx.clone()));
        tokio::spawn(task_track(ctx.clone()));
        tokio::spawn(task_purge(ctx.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_ctx.root.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(serve(accept_ctx.clone(), stream));
                        }
                        Err(_) => break,
                    }
                }
            }
        });
        (ctx, addr)
    }

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (rd, wr) = stream.into_split();
            Self {
                reader: BufReader::new(rd),
                writer: wr,
            }
        }

        async fn send(&mut self, v: Value) {
            let mut line = serde_json::to_vec(&v).unwrap();
            line.extend_from_slice(b"\r\n");
            self.writer.write_all(&line).await.unwrap();
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
            self.writer.write_all(b"\r\n").await.unwrap();
        }

        async fn recv_within(&mut self, ms: u64) -> Option<Value> {
            let mut line = String::new();
            match timeout(Duration::from_millis(ms), self.reader.read_line(&mut line)).await {
                Ok(Ok(0)) => None,
                Ok(Ok(_)) => Some(serde_json::from_str(&line).unwrap()),
                Ok(Err(_)) => None,
                Err(_) => None,
            }
        }

        async fn recv(&mut self) -> Value {
            self.recv_within(5_000).await.expect("no response in time")
        }

        async fn call(&mut self, v: Value) -> Value {
            self.send(v).await;
            self.recv().await
        }

        async fn login(&mut self, user: &str, pass: &str) {
            let res = self
                .call(json!({
                    "jsonrpc": "2.0",
                    "id": "login",
                    "method": "sys.login",
                    "params": {"user": user, "pass": pass},
                }))
                .await;
            assert_eq!(res["result"]["ok"], json!(true), "login failed: {}", res);
        }
    }

    fn done_task(conn_id: &str, seq: u32) -> TaskRow {
        TaskRow {
            id: format!("{}task{:06}", conn_id, seq),
            stat: TaskStat::Done,
            path: "math".to_string(),
            method: "add".to_string(),
            params: json!(null),
            local_id: json!(seq),
            tses: String::new(),
            result: Some(json!(1)),
            err_code: None,
            err_str: None,
            err_obj: None,
            tags: Map::new(),
            creation_time: now_ms(),
            dead_line: now_ms() + 600_000,
        }
    }

    // ============================================================
    // TEST 1: Writer normalization rules
    // ============================================================

    #[test]
    fn test_normalize_suppresses_idless_results() {
        let res = JsonRpcRes::result(None, json!(5));
        assert!(normalize(res).is_none());
    }

    #[test]
    fn test_normalize_nulls_id_for_parse_errors() {
        let res = JsonRpcRes::error(None, ERR_PARSE, "", None);
        let out = normalize(res).unwrap();
        assert_eq!(out.id, Some(Value::Null));
    }

    #[test]
    fn test_normalize_drops_idless_application_errors() {
        let res = JsonRpcRes::error(None, -32000, "", None);
        assert!(normalize(res).is_none());
    }

    #[test]
    fn test_normalize_fills_null_result() {
        let res = JsonRpcRes {
            jsonrpc: "2.0",
            id: Some(json!(1)),
            result: None,
            error: None,
        };
        let out = normalize(res).unwrap();
        assert_eq!(out.result, Some(Value::Null));
    }

    // ============================================================
    // TEST 2: Session notifier registry
    // ============================================================

    #[tokio::test]
    async fn test_notifier_rejects_duplicate_sessions() {
        let notifier = SessionNotifier::new();
        let _rx = notifier.register("CONN").unwrap();
        assert!(notifier.register("CONN").is_err());
        notifier.unregister("CONN");
        assert!(notifier.register("CONN").is_ok());
    }

    #[tokio::test]
    async fn test_notifier_drops_on_overflow_and_unknown_ids() {
        let notifier = SessionNotifier::new();
        assert!(!notifier.notify("nobody", done_task("CONN000000000000", 0)));

        let _rx = notifier.register("CONN000000000000").unwrap();
        for seq in 0..NOTIFY_BUFFER as u32 {
            assert!(notifier.notify("CONN000000000000", done_task("CONN000000000000", seq)));
        }
        // The buffer is full; the completion is dropped, not blocked on.
        assert!(!notifier.notify("CONN000000000000", done_task("CONN000000000000", 9999)));
    }

    // ============================================================
    // TEST 3: Password digests
    // ============================================================

    #[test]
    fn test_digest_is_stable_hex() {
        let d = digest("root");
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(d, digest("root"));
        assert_ne!(d, digest("toor"));
    }

    // ============================================================
    // TEST 4: Ping, login, bad credentials
    // ============================================================

    #[tokio::test]
    async fn test_ping_and_login() {
        let (ctx, addr) = start_node(NODE).await;
        let mut c = Client::connect(addr).await;

        let res = c
            .call(json!({"jsonrpc": "2.0", "id": 1, "method": "sys.ping"}))
            .await;
        assert_eq!(res["result"], json!("pong"));
        assert_eq!(res["id"], json!(1));

        let res = c
            .call(json!({
                "jsonrpc": "2.0", "id": 2, "method": "sys.login",
                "params": {"user": "root", "pass": "wrong"},
            }))
            .await;
        assert_eq!(res["error"]["code"], json!(-32004));

        c.login("root", "root").await;
        ctx.root.cancel();
    }

    // ============================================================
    // TEST 5: Happy path — push, pull, result, round-trip
    // ============================================================

    #[tokio::test]
    async fn test_happy_path_round_trip() {
        let (ctx, addr) = start_node(NODE).await;
        let mut worker = Client::connect(addr).await;
        worker.login("root", "root").await;
        let mut caller = Client::connect(addr).await;
        caller.login("root", "root").await;

        worker
            .send(json!({
                "jsonrpc": "2.0", "id": 2, "method": "task.pull",
                "params": {"prefix": "math."},
            }))
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        caller
            .send(json!({
                "jsonrpc": "2.0", "id": 7, "method": "task.push",
                "params": {"method": "math.add", "params": [2, 3]},
            }))
            .await;

        let pulled = worker.recv().await;
        assert_eq!(pulled["id"], json!(2));
        let descriptor = &pulled["result"];
        assert_eq!(descriptor["path"], json!("math"));
        assert_eq!(descriptor["method"], json!("add"));
        assert_eq!(descriptor["params"], json!([2, 3]));
        assert_eq!(descriptor["tags"]["@admin"], json!(true));
        let taskid = descriptor["taskid"].as_str().unwrap().to_string();

        let ack = worker
            .call(json!({
                "jsonrpc": "2.0", "id": 3, "method": "task.result",
                "params": {"taskid": taskid, "result": 5},
            }))
            .await;
        assert_eq!(ack["id"], json!(3));
        assert_eq!(ack["result"]["ok"], json!(true));

        let fin = caller.recv().await;
        assert_eq!(fin["id"], json!(7));
        assert_eq!(fin["result"], json!(5));
        ctx.root.cancel();
    }

    // ============================================================
    // TEST 6: Timeout — no worker, purger completes the task
    // ============================================================

    #[tokio::test]
    async fn test_push_times_out_without_worker() {
        let (ctx, addr) = start_node(NODE).await;
        let mut caller = Client::connect(addr).await;
        caller.login("root", "root").await;

        caller
            .send(json!({
                "jsonrpc": "2.0", "id": 1, "method": "task.push",
                "params": {"method": "x.y", "params": null, "timeout": 1},
            }))
            .await;

        let res = caller.recv_within(5_000).await.expect("no timeout response");
        assert_eq!(res["id"], json!(1));
        assert_eq!(res["error"]["code"], json!(-32000));
        assert_eq!(res["error"]["message"], json!("timeout"));
        ctx.root.cancel();
    }

    // ============================================================
    // TEST 7: Cancel — second call acks, first call errors
    // ============================================================

    #[tokio::test]
    async fn test_cancel_completes_with_cancel_error() {
        let (ctx, addr) = start_node(NODE).await;
        let mut caller = Client::connect(addr).await;
        caller.login("root", "root").await;

        caller
            .send(json!({
                "jsonrpc": "2.0", "id": 1, "method": "task.push",
                "params": {"method": "slow.op", "params": null},
            }))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        caller
            .send(json!({
                "jsonrpc": "2.0", "id": 2, "method": "task.cancel",
                "params": {"taskid": 1},
            }))
            .await;

        // The ack and the completion may arrive in either order.
        let a = caller.recv().await;
        let b = caller.recv().await;
        let (ack, fin) = if a["id"] == json!(2) { (a, b) } else { (b, a) };
        assert_eq!(ack["result"]["ok"], json!(true));
        assert_eq!(fin["id"], json!(1));
        assert_eq!(fin["error"]["code"], json!(-32001));

        // Cancelling the same task again is not a second cancellation.
        let res = caller
            .call(json!({
                "jsonrpc": "2.0", "id": 3, "method": "task.cancel",
                "params": {"taskid": 1},
            }))
            .await;
        assert_eq!(res["error"]["code"], json!(-32002));
        ctx.root.cancel();
    }

    // ============================================================
    // TEST 8: Match race — one task, two workers, one winner
    // ============================================================

    #[tokio::test]
    async fn test_match_race_single_winner() {
        let (ctx, addr) = start_node(NODE).await;
        let mut w1 = Client::connect(addr).await;
        w1.login("root", "root").await;
        let mut w2 = Client::connect(addr).await;
        w2.login("root", "root").await;
        let mut caller = Client::connect(addr).await;
        caller.login("root", "root").await;

        for w in [&mut w1, &mut w2] {
            w.send(json!({
                "jsonrpc": "2.0", "id": 1, "method": "task.pull",
                "params": {"prefix": "q."},
            }))
            .await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        caller
            .send(json!({
                "jsonrpc": "2.0", "id": 5, "method": "task.push",
                "params": {"method": "q.run", "params": null},
            }))
            .await;

        let r1 = w1.recv_within(2_000).await;
        let r2 = w2.recv_within(500).await;
        assert!(
            r1.is_some() ^ r2.is_some(),
            "exactly one worker must receive the task"
        );

        // The losing pull-record stays parked.
        let parked = ctx
            .store
            .tasks
            .filter(|t| t.is_pull_record() && t.stat == TaskStat::Waiting);
        assert_eq!(parked.len(), 1);
        ctx.root.cancel();
    }

    // ============================================================
    // TEST 9: Authorization — no grant, no task row
    // ============================================================

    #[tokio::test]
    async fn test_push_denied_without_grant() {
        let (ctx, addr) = start_node(NODE).await;
        let mut c = Client::connect(addr).await;

        // Anonymous connections hold no tags at all.
        let res = c
            .call(json!({
                "jsonrpc": "2.0", "id": 1, "method": "task.push",
                "params": {"method": "math.add", "params": null},
            }))
            .await;
        assert_eq!(res["error"]["code"], json!(-32010));

        // A user scoped to math.* may not push into sys.*.
        c.login("limited", "limited").await;
        let res = c
            .call(json!({
                "jsonrpc": "2.0", "id": 2, "method": "task.push",
                "params": {"method": "sys.reboot", "params": null},
            }))
            .await;
        assert_eq!(res["error"]["code"], json!(-32010));
        assert!(ctx.store.tasks.is_empty());
        ctx.root.cancel();
    }

    // ============================================================
    // TEST 10: Parse error mid-stream, decoder resynchronizes
    // ============================================================

    #[tokio::test]
    async fn test_parse_error_has_null_id_and_stream_continues() {
        let (ctx, addr) = start_node(NODE).await;
        let mut c = Client::connect(addr).await;

        c.send_raw("{this is not json").await;
        let res = c.recv().await;
        assert!(res["id"].is_null());
        assert_eq!(res["error"]["code"], json!(-32700));

        // The next frame parses normally.
        let res = c
            .call(json!({"jsonrpc": "2.0", "id": 1, "method": "sys.ping"}))
            .await;
        assert_eq!(res["result"], json!("pong"));
        ctx.root.cancel();
    }

    #[tokio::test]
    async fn test_type_mismatch_is_invalid_request() {
        let (ctx, addr) = start_node(NODE).await;
        let mut c = Client::connect(addr).await;

        c.send_raw(r#"{"jsonrpc": "2.0", "id": 9, "method": 5}"#).await;
        let res = c.recv().await;
        assert_eq!(res["error"]["code"], json!(-32600));
        ctx.root.cancel();
    }

    // ============================================================
    // TEST 11: Notifications and malformed envelopes
    // ============================================================

    #[tokio::test]
    async fn test_notifications_are_dropped() {
        let (ctx, addr) = start_node(NODE).await;
        let mut c = Client::connect(addr).await;

        c.send(json!({"jsonrpc": "2.0", "method": "sys.ping"})).await;
        let res = c
            .call(json!({"jsonrpc": "2.0", "id": 5, "method": "sys.ping"}))
            .await;
        // The only response belongs to the identified request.
        assert_eq!(res["id"], json!(5));
        ctx.root.cancel();
    }

    #[tokio::test]
    async fn test_wrong_version_is_invalid_request() {
        let (ctx, addr) = start_node(NODE).await;
        let mut c = Client::connect(addr).await;

        let res = c
            .call(json!({"jsonrpc": "1.0", "id": 1, "method": "sys.ping"}))
            .await;
        assert_eq!(res["id"], json!(1));
        assert_eq!(res["error"]["code"], json!(-32600));
        ctx.root.cancel();
    }

    #[tokio::test]
    async fn test_unknown_namespaces_are_method_not_found() {
        let (ctx, addr) = start_node(NODE).await;
        let mut c = Client::connect(addr).await;
        c.login("root", "root").await;

        for method in ["task.nope", "pipe.open", "chan.sub", "user.create", "bogus.x"] {
            let res = c
                .call(json!({"jsonrpc": "2.0", "id": 1, "method": method}))
                .await;
            assert_eq!(res["error"]["code"], json!(-32601), "method {}", method);
        }
        ctx.root.cancel();
    }

    // ============================================================
    // TEST 12: Node listing
    // ============================================================

    #[tokio::test]
    async fn test_sys_node_list() {
        let (ctx, addr) = start_node(NODE).await;
        for _ in 0..50 {
            if !ctx.store.nodes.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut c = Client::connect(addr).await;
        c.login("root", "root").await;
        let res = c
            .call(json!({"jsonrpc": "2.0", "id": 1, "method": "sys.node.list", "params": {}}))
            .await;
        let nodes = res["result"].as_array().expect("node list");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0]["id"], json!(NODE));
        ctx.root.cancel();
    }

    // ============================================================
    // TEST 13: Sync locks
    // ============================================================

    #[tokio::test]
    async fn test_sync_lock_is_exclusive() {
        let (ctx, addr) = start_node(NODE).await;
        let mut a = Client::connect(addr).await;
        a.login("root", "root").await;
        let mut b = Client::connect(addr).await;
        b.login("root", "root").await;

        let res = a
            .call(json!({"jsonrpc": "2.0", "id": 1, "method": "sync.lock", "params": {"lock": "m"}}))
            .await;
        assert_eq!(res["result"]["ok"], json!(true));

        let res = b
            .call(json!({"jsonrpc": "2.0", "id": 1, "method": "sync.lock", "params": {"lock": "m"}}))
            .await;
        assert_eq!(res["error"]["code"], json!(-32006));

        let res = b
            .call(json!({"jsonrpc": "2.0", "id": 2, "method": "sync.unlock", "params": {"lock": "m"}}))
            .await;
        assert_eq!(res["error"]["code"], json!(-32006));

        let res = a
            .call(json!({"jsonrpc": "2.0", "id": 2, "method": "sync.unlock", "params": {"lock": "m"}}))
            .await;
        assert_eq!(res["result"]["ok"], json!(true));
        ctx.root.cancel();
    }

    // ============================================================
    // TEST 14: Disconnect cleans the connection's rows
    // ============================================================

    #[tokio::test]
    async fn test_disconnect_cleans_owned_rows() {
        let (ctx, addr) = start_node(NODE).await;
        let mut c = Client::connect(addr).await;
        c.login("root", "root").await;

        c.send(json!({
            "jsonrpc": "2.0", "id": 1, "method": "task.push",
            "params": {"method": "slow.op", "params": null},
        }))
        .await;
        for _ in 0..50 {
            if ctx.store.tasks.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(ctx.store.tasks.len(), 1);
        assert_eq!(ctx.store.sessions.len(), 1);

        drop(c);
        for _ in 0..100 {
            if ctx.store.tasks.is_empty() && ctx.store.sessions.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(ctx.store.tasks.is_empty());
        assert!(ctx.store.sessions.is_empty());
        ctx.root.cancel();
    }

    // ============================================================
    // TEST 15: Watchdog threshold is clamped per connection
    // ============================================================

    #[tokio::test]
    async fn test_watchdog_value_is_clamped() {
        let (ctx, addr) = start_node(NODE).await;
        let mut c = Client::connect(addr).await;

        let res = c
            .call(json!({"jsonrpc": "2.0", "id": 1, "method": "sys.watchdog", "params": {"value": 3}}))
            .await;
        assert_eq!(res["result"]["watchdog"], json!(10));

        let res = c
            .call(json!({"jsonrpc": "2.0", "id": 2, "method": "sys.watchdog", "params": {"value": 120}}))
            .await;
        assert_eq!(res["result"]["watchdog"], json!(120));

        let res = c
            .call(json!({"jsonrpc": "2.0", "id": 3, "method": "sys.watchdog", "params": {}}))
            .await;
        assert_eq!(res["error"]["code"], json!(-32602));
        ctx.root.cancel();
    }
}
