//! Connection gatekeeper: accepts WebSocket connections, validates the
//! puzzle name from the request path, and routes participants into the
//! session registry. Each connection gets its own task owning the socket,
//! the outbound pump, and the liveness probe timer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use gridfill_core::protocol::{ClientCommand, UNKNOWN_GAME};
use gridfill_core::{Config, PuzzleStore, Session, SessionRegistry};

pub async fn start_server(config: Config) -> Result<()> {
    let store =
        PuzzleStore::new(&config.data_dir).context("Failed to open puzzle data directory")?;
    let registry = Arc::new(SessionRegistry::new(store, config.save_debounce()));
    let listener = TcpListener::bind(&config.bind)
        .await
        .context("Failed to bind server")?;

    println!("gridfill listening on: ws://{}", config.bind);

    while let Ok((stream, peer)) = listener.accept().await {
        let registry = registry.clone();
        let ping_timeout = config.ping_timeout();
        tokio::spawn(async move {
            debug!(%peer, "inbound connection");
            handle_connection(stream, registry, ping_timeout).await;
        });
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    registry: Arc<SessionRegistry>,
    ping_timeout: Duration,
) {
    let mut path = String::new();
    let ws = match accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = req.uri().path().to_string();
        Ok(resp)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            debug!("websocket handshake failed: {e}");
            return;
        }
    };

    let name = path.trim_start_matches('/').to_string();
    // Lookup and registration are one registry operation, so the session
    // handed back can never be one that teardown already unregistered
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let Some((session, id)) = registry.join(&name, out_tx).await else {
        reject_unknown(ws, &name).await;
        return;
    };

    run_participant(ws, registry, session, id, out_rx, ping_timeout).await;
}

/// Unrecognized puzzle name: the rejection sentinel, then close. Like every
/// other server frame it goes out as a JSON value, so the wire text is the
/// quoted string `"unknown-game"`.
async fn reject_unknown(mut ws: WebSocketStream<TcpStream>, name: &str) {
    info!(puzzle = %name, "rejecting connection for unknown puzzle");
    if let Ok(text) = serde_json::to_string(UNKNOWN_GAME) {
        let _ = ws.send(Message::Text(text)).await;
    }
    let _ = ws.close(None).await;
}

async fn run_participant(
    ws: WebSocketStream<TcpStream>,
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    id: u64,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    ping_timeout: Duration,
) {
    info!(puzzle = %session.name(), id, "participant joined");
    session.notify_single(id).await;

    let (mut sink, mut stream) = ws.split();

    // Liveness: a probe every interval; any inbound frame counts as an
    // answer. A probe still unanswered at the next tick kills the
    // connection.
    let mut probe = interval(ping_timeout);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            frame = stream.next() => match frame {
                Some(Ok(msg)) => {
                    awaiting_pong = false;
                    match msg {
                        Message::Text(text) => {
                            match serde_json::from_str::<ClientCommand>(&text) {
                                Ok(cmd) => session.handle(id, cmd).await,
                                Err(e) => {
                                    warn!(
                                        puzzle = %session.name(),
                                        id,
                                        "unparseable message, closing connection: {e}"
                                    );
                                    break;
                                }
                            }
                        }
                        Message::Ping(payload) => {
                            if sink.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                Some(Err(e)) => {
                    debug!(puzzle = %session.name(), id, "transport error: {e}");
                    break;
                }
                None => break,
            },
            _ = probe.tick() => {
                if awaiting_pong {
                    info!(puzzle = %session.name(), id, "liveness timeout, closing");
                    break;
                }
                awaiting_pong = true;
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    registry.disconnect(&session, id).await;
    info!(puzzle = %session.name(), id, "participant left");
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridfill_core::model::PuzzleUpload;
    use std::net::SocketAddr;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;

    const PROBE: Duration = Duration::from_millis(100);

    /// Gatekeeper on an ephemeral port serving one puzzle named "daily",
    /// with a probe window short enough to test against
    async fn spawn_gatekeeper() -> (tempfile::TempDir, SocketAddr, Arc<SessionRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let store = PuzzleStore::new(dir.path()).unwrap();
        let doc = PuzzleUpload {
            width: 2,
            height: 2,
            grid: vec![false; 4],
        }
        .into_document()
        .unwrap();
        store.write_atomic("daily", &doc).await.unwrap();

        let registry = Arc::new(SessionRegistry::new(store, Duration::from_secs(120)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_registry = registry.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let registry = accept_registry.clone();
                tokio::spawn(handle_connection(stream, registry, PROBE));
            }
        });
        (dir, addr, registry)
    }

    /// Drain frames until the server closes the connection
    async fn await_close(ws: &mut WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>) {
        loop {
            match timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("server never closed the connection")
            {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_puzzle_rejected_with_sentinel() {
        let (_dir, addr, registry) = spawn_gatekeeper().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/nope")).await.unwrap();

        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let Message::Text(text) = frame else {
            panic!("expected a text frame, got {frame:?}");
        };
        // The sentinel is a JSON value like every other server frame
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, serde_json::json!(UNKNOWN_GAME));

        await_close(&mut ws).await;
        assert_eq!(registry.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_silent_connection_closed_after_probe_window() {
        let (_dir, addr, registry) = spawn_gatekeeper().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/daily")).await.unwrap();

        // Never read, never write: the server's pings pile up unanswered
        // and the second tick finds the probe outstanding
        tokio::time::sleep(PROBE * 3).await;
        await_close(&mut ws).await;

        // The close runs the disconnect path and tears the session down
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while registry.active_sessions().await != 0 {
            assert!(tokio::time::Instant::now() < deadline, "session not torn down");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_responsive_connection_survives_probes() {
        let (_dir, addr, _registry) = spawn_gatekeeper().await;
        let (ws, _) = connect_async(format!("ws://{addr}/daily")).await.unwrap();
        let (mut sink, mut stream) = ws.split();

        // Answer pings across several probe windows
        let deadline = tokio::time::Instant::now() + PROBE * 4;
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Ping(payload))) => {
                        sink.send(Message::Pong(payload)).await.unwrap();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        panic!("server closed a responsive connection");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => panic!("transport error: {e}"),
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        // Still being served: a name change comes back as a broadcast
        sink.send(Message::Text(r#"{"cmd":"name","name":"Ada"}"#.into()))
            .await
            .unwrap();
        loop {
            let frame = timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("no broadcast after name change")
                .unwrap()
                .unwrap();
            if let Message::Text(text) = frame {
                let view: serde_json::Value = serde_json::from_str(&text).unwrap();
                if view["online"] == serde_json::json!(["Ada"]) {
                    break;
                }
            }
        }
    }
}
