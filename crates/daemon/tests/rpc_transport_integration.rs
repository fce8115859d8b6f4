use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use emendare_common::diff;
use emendare_common::protocol::jsonrpc::{Request, RequestId, Response, CONFLICT};
use emendare_daemon::config::{DaemonConfig, ServerConfig, StorageBackend, StorageConfig};
use emendare_daemon::runtime::{self, DaemonHandle};
use emendare_daemon::startup::DaemonPaths;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

async fn start_daemon(tmp: &TempDir) -> (DaemonPaths, DaemonHandle) {
    let paths = DaemonPaths::under(tmp.path().join("home")).expect("paths");
    let config = DaemonConfig {
        storage: StorageConfig { backend: StorageBackend::Memory, database_path: None },
        server: ServerConfig { ws_enabled: true, ws_addr: SocketAddr::from(([127, 0, 0, 1], 0)) },
        ..DaemonConfig::default()
    };
    let handle = runtime::start(paths.clone(), config).await.expect("daemon should start");
    (paths, handle)
}

struct UnixClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
    next_id: i64,
}

impl UnixClient {
    async fn connect(socket_path: &Path) -> Self {
        let stream = UnixStream::connect(socket_path).await.expect("client should connect");
        let (read_half, writer) = stream.into_split();
        Self { reader: BufReader::new(read_half), writer, next_id: 1 }
    }

    async fn call(&mut self, method: &str, params: Value) -> Response {
        let request = Request::new(method, Some(params), RequestId::Number(self.next_id));
        self.next_id += 1;
        let mut encoded = serde_json::to_vec(&request).unwrap();
        encoded.push(b'\n');
        self.writer.write_all(&encoded).await.unwrap();
        self.writer.flush().await.unwrap();

        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        let response: Response = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(response.id, request.id);
        response
    }

    async fn ok(&mut self, method: &str, params: Value) -> Value {
        self.call(method, params).await.into_result().expect("call should succeed")
    }
}

#[tokio::test]
async fn unix_and_websocket_clients_share_one_engine() {
    let tmp = TempDir::new().unwrap();
    let (paths, handle) = start_daemon(&tmp).await;
    let http_addr = handle.http_addr().expect("http enabled");
    let mut client = UnixClient::connect(&paths.socket_path).await;

    let user = client.ok("user.create", json!({ "name": "ada" })).await;
    let document = client.ok("doc.create", json!({ "title": "Charter", "body": "Dues are ten." })).await;
    client.ok("doc.follow", json!({ "user_id": user["id"], "document_id": document["id"] })).await;

    let (mut rpc_socket, _) = connect_async(format!("ws://{http_addr}/rpc")).await.unwrap();
    let request = json!({
        "jsonrpc": "2.0",
        "method": "doc.get",
        "params": { "document_id": document["id"] },
        "id": "from-ws",
    });
    rpc_socket.send(WsMessage::text(request.to_string())).await.unwrap();
    let reply = rpc_socket.next().await.unwrap().unwrap();
    let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply["id"], "from-ws");
    assert_eq!(reply["result"]["followers_count"], 1);

    let again = client.call("doc.follow", json!({ "user_id": user["id"], "document_id": document["id"] })).await;
    let error = again.error.expect("second follow should fail");
    assert_eq!(error.code, CONFLICT);
    assert_eq!(error.error_code(), Some("ALREADY_FOLLOWING"));

    drop(rpc_socket);
    handle.stop().await;
    assert!(!paths.socket_path.exists());
}

#[tokio::test]
async fn subscribers_see_tallies_for_their_topic() {
    let tmp = TempDir::new().unwrap();
    let (paths, handle) = start_daemon(&tmp).await;
    let http_addr = handle.http_addr().expect("http enabled");
    let mut client = UnixClient::connect(&paths.socket_path).await;

    let user = client.ok("user.create", json!({ "name": "grace" })).await;
    let document = client.ok("doc.create", json!({ "title": "Bylaws", "body": "Quorum is five." })).await;
    client.ok("doc.follow", json!({ "user_id": user["id"], "document_id": document["id"] })).await;
    let amendment = client
        .ok(
            "amend.propose",
            json!({
                "document_id": document["id"],
                "author_id": user["id"],
                "name": "lower quorum",
                "base_version": 1,
                "patch": diff::diff("Quorum is five.", "Quorum is three."),
            }),
        )
        .await;
    let amendment_id = amendment["id"].as_str().unwrap().to_string();

    let (mut subscription, _) =
        connect_async(format!("ws://{http_addr}/subscribe?topic=amendment/{amendment_id}"))
            .await
            .unwrap();

    client
        .ok("amend.vote", json!({ "amendment_id": amendment_id, "user_id": user["id"], "stance": "up" }))
        .await;

    let frame = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("notification should arrive")
        .unwrap()
        .unwrap();
    let notification: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(notification["topic"], format!("amendment/{amendment_id}"));
    assert_eq!(notification["payload"]["up"], 1);

    let body = client
        .ok("doc.at_version", json!({ "document_id": document["id"], "version": 1 }))
        .await;
    assert_eq!(body["body"], "Quorum is five.");

    drop(subscription);
    handle.stop().await;
}

#[tokio::test]
async fn daemon_shutdown_method_stops_the_daemon() {
    let tmp = TempDir::new().unwrap();
    let (paths, handle) = start_daemon(&tmp).await;
    let mut client = UnixClient::connect(&paths.socket_path).await;

    let response = client.call("daemon.shutdown", json!({})).await;
    assert_eq!(response.result, Some(json!({ "ok": true })));

    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("daemon should stop after daemon.shutdown");
    assert!(!paths.pid_path.exists());
}
