// Newline-delimited JSON-RPC over the daemon's Unix socket.
//
// One request per line, one response line per request, in order. A
// connection stays open until the client closes it.

use anyhow::{Context, Result};
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::rpc::methods::{handle_raw_request, RpcServerState};

/// Accepts connections forever, one task per connection.
pub async fn serve_unix(listener: UnixListener, state: RpcServerState) -> Result<()> {
    loop {
        accept_one(&listener, &state).await?;
    }
}

/// Like [`serve_unix`], returning once `shutdown_rx` fires. Connections
/// already accepted finish on their own tasks.
pub async fn serve_unix_until_shutdown(
    listener: UnixListener,
    state: RpcServerState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            accepted = accept_one(&listener, &state) => accepted?,
            _ = shutdown_rx.recv() => {
                debug!("unix rpc listener stopping");
                return Ok(());
            }
        }
    }
}

async fn accept_one(listener: &UnixListener, state: &RpcServerState) -> Result<()> {
    let (stream, _) = listener.accept().await.context("failed to accept unix rpc connection")?;
    let connection_state = state.clone();
    tokio::spawn(async move {
        if let Err(error) = serve_connection(stream, connection_state).await {
            warn!(?error, "unix rpc connection failed");
        }
    });
    Ok(())
}

/// Serves one stream until EOF. Blank lines are ignored.
pub async fn serve_connection<IO>(stream: IO, state: RpcServerState) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut request_line = Vec::new();

    loop {
        request_line.clear();
        let bytes_read = reader
            .read_until(b'\n', &mut request_line)
            .await
            .context("failed to read json-rpc request")?;
        if bytes_read == 0 {
            return Ok(());
        }

        let request = trim_line(&request_line);
        if request.is_empty() {
            continue;
        }

        let response = handle_raw_request(request, &state).await;
        let mut encoded =
            serde_json::to_vec(&response).context("failed to serialize json-rpc response")?;
        encoded.push(b'\n');

        write_half.write_all(&encoded).await.context("failed to write json-rpc response")?;
        write_half.flush().await.context("failed to flush json-rpc response")?;
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|byte| !byte.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|byte| !byte.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use std::io;

    use emendare_common::protocol::jsonrpc::{Request, RequestId, Response, METHOD_NOT_FOUND};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{UnixListener, UnixStream};

    use super::*;

    fn bind(dir: &TempDir) -> Option<(UnixListener, std::path::PathBuf)> {
        let socket_path = dir.path().join("rpc.sock");
        match UnixListener::bind(&socket_path) {
            Ok(listener) => Some((listener, socket_path)),
            Err(error) if error.kind() == io::ErrorKind::PermissionDenied => {
                eprintln!("skipping unix socket test: bind is not permitted in this environment");
                None
            }
            Err(error) => panic!("failed to bind unix socket: {error}"),
        }
    }

    async fn exchange(
        write_half: &mut tokio::net::unix::OwnedWriteHalf,
        reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>,
        payload: &[u8],
    ) -> Response {
        write_half.write_all(payload).await.unwrap();
        write_half.write_all(b"\n").await.unwrap();
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).await.unwrap();
        serde_json::from_slice(&line).unwrap()
    }

    #[test]
    fn trim_strips_surrounding_whitespace() {
        assert_eq!(trim_line(b"  {}\r\n"), b"{}");
        assert_eq!(trim_line(b" \t\r\n"), b"");
        assert_eq!(trim_line(b""), b"");
    }

    #[tokio::test]
    async fn answers_requests_in_order_on_one_connection() {
        let dir = TempDir::new().unwrap();
        let Some((listener, socket_path)) = bind(&dir) else { return };
        let server = tokio::spawn(serve_unix(listener, RpcServerState::default()));

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"\n\r\n").await.unwrap();
        let ping = serde_json::to_vec(&Request::new("rpc.ping", None, RequestId::Number(1))).unwrap();
        let response = exchange(&mut write_half, &mut reader, &ping).await;
        assert_eq!(response.id, RequestId::Number(1));
        assert_eq!(response.result, Some(json!({ "ok": true })));

        let unknown =
            serde_json::to_vec(&Request::new("doc.delete", None, RequestId::Number(2))).unwrap();
        let response = exchange(&mut write_half, &mut reader, &unknown).await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);

        server.abort();
        let _ = server.await;
    }

    #[tokio::test]
    async fn serves_concurrent_clients() {
        let dir = TempDir::new().unwrap();
        let Some((listener, socket_path)) = bind(&dir) else { return };
        let server = tokio::spawn(serve_unix(listener, RpcServerState::default()));

        let mut clients = Vec::new();
        for client_id in 0_i64..6 {
            let socket_path = socket_path.clone();
            clients.push(tokio::spawn(async move {
                let stream = UnixStream::connect(&socket_path).await.unwrap();
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let request = Request::new(
                    "user.create",
                    Some(json!({ "name": format!("member-{client_id}") })),
                    RequestId::Number(client_id),
                );
                exchange(&mut write_half, &mut reader, &serde_json::to_vec(&request).unwrap()).await
            }));
        }

        for (expected_id, client) in (0_i64..6).zip(clients) {
            let response = client.await.unwrap();
            assert_eq!(response.id, RequestId::Number(expected_id));
            let user = response.into_result().unwrap();
            assert_eq!(user["name"], format!("member-{expected_id}"));
        }

        server.abort();
        let _ = server.await;
    }

    #[tokio::test]
    async fn stops_accepting_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let Some((listener, _socket_path)) = bind(&dir) else { return };
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(serve_unix_until_shutdown(
            listener,
            RpcServerState::default(),
            shutdown_rx,
        ));

        shutdown_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
