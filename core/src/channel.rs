//! Resilient duplex channel: a logical connection that survives transport
//! failures.
//!
//! A driver task owns the WebSocket and a reconnect state machine with
//! states connecting, ready, and failed. An ordinary close while ready
//! retries immediately; transport errors and failed connection attempts
//! are gated behind a capped exponential backoff, and once the delay
//! exceeds the cap the channel fails permanently until an explicit retry.
//! Outgoing work is queued as producers that run at most once, in FIFO
//! order, only while the transport is ready.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::ClientCommand;

type Transport = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Smallest reconnect delay; the backoff resets here on every
    /// successful open
    pub backoff_floor: Duration,
    /// Once the doubling delay exceeds this, the channel gives up
    pub backoff_cap: Duration,
    /// Retry with no delay after an ordinary close while ready. Tunable:
    /// disabling it gates every reconnect behind the backoff, trading
    /// reconnect latency for protection against close storms.
    pub immediate_retry_on_close: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backoff_floor: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(4),
            immediate_retry_on_close: true,
        }
    }
}

/// Terminal failure report
#[derive(Debug)]
pub struct ChannelFailure {
    pub reason: String,
    /// Distinguishes a lost connection from one never established
    pub ever_connected: bool,
}

impl ChannelFailure {
    pub fn describe(&self) -> String {
        if self.ever_connected {
            format!("connection lost: {}", self.reason)
        } else {
            format!("unable to establish connection: {}", self.reason)
        }
    }
}

/// A queued unit of work; runs at most once, when the channel is ready,
/// and emits exactly one message
type Producer = Box<dyn FnOnce() -> ClientCommand + Send>;

/// Application callbacks driven by the channel task
pub struct ChannelHooks {
    /// Fired on every successful open, before the queue flush
    pub on_connect: Box<dyn FnMut() + Send>,
    /// Handed every parsed inbound message; an error is fatal for the
    /// channel, not just for the message
    pub on_message: Box<dyn FnMut(serde_json::Value) -> Result<()> + Send>,
    /// Fired when the channel enters the failed state
    pub on_failure: Box<dyn FnMut(ChannelFailure) + Send>,
}

enum Command {
    Send(Producer),
    Retry,
    Fatal(String),
    Close,
}

/// Application-side handle to the channel task
#[derive(Clone)]
pub struct ChannelHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ChannelHandle {
    /// Queue a producer for delivery; at-most-once per connection epoch
    pub fn send(&self, produce: impl FnOnce() -> ClientCommand + Send + 'static) {
        let _ = self.tx.send(Command::Send(Box::new(produce)));
    }

    /// Leave the failed state and start reconnecting
    pub fn retry(&self) {
        let _ = self.tx.send(Command::Retry);
    }

    /// Tear the transport down and fail permanently
    pub fn fatal(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Command::Fatal(reason.into()));
    }

    /// Shut the channel down for good
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }
}

/// Open a resilient channel to `url` and return its handle
pub fn open(url: String, config: ChannelConfig, hooks: ChannelHooks) -> ChannelHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_channel(url, config, hooks, rx));
    ChannelHandle { tx }
}

/// How one ready epoch ended
enum Epoch {
    /// Ordinary close
    Closed,
    /// Transport error, reconnect with backoff
    Errored(String),
    /// Application-fatal, enter the failed state
    Fatal(String),
    /// Explicit close, stop the task
    Shutdown,
}

enum Wait {
    Elapsed,
    Fatal(String),
    Shutdown,
}

async fn run_channel(
    url: String,
    config: ChannelConfig,
    mut hooks: ChannelHooks,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut backoff = config.backoff_floor;
    let mut ever_connected = false;
    let mut queue: VecDeque<Producer> = VecDeque::new();
    let mut next_delay = Duration::ZERO;

    loop {
        if !next_delay.is_zero() {
            match wait_delay(next_delay, &mut rx, &mut queue).await {
                Wait::Elapsed => {}
                Wait::Fatal(reason) => {
                    if !enter_failed(&mut rx, &mut hooks, &mut queue, reason, ever_connected).await
                    {
                        return;
                    }
                    backoff = config.backoff_floor;
                    next_delay = Duration::ZERO;
                    continue;
                }
                Wait::Shutdown => return,
            }
        }

        match connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                info!(%url, "channel connected");
                ever_connected = true;
                backoff = config.backoff_floor;
                (hooks.on_connect)();
                match drive_ready(ws, &mut queue, &mut rx, &mut hooks).await {
                    Epoch::Closed => {
                        debug!(%url, "transport closed");
                        queue.clear();
                        if config.immediate_retry_on_close {
                            next_delay = Duration::ZERO;
                            continue;
                        }
                    }
                    Epoch::Errored(reason) => {
                        warn!(%url, "transport error: {reason}");
                        queue.clear();
                    }
                    Epoch::Fatal(reason) => {
                        queue.clear();
                        if !enter_failed(&mut rx, &mut hooks, &mut queue, reason, ever_connected)
                            .await
                        {
                            return;
                        }
                        backoff = config.backoff_floor;
                        next_delay = Duration::ZERO;
                        continue;
                    }
                    Epoch::Shutdown => return,
                }
            }
            Err(e) => {
                debug!(%url, "connect attempt failed: {e}");
            }
        }

        // Backoff gate: give up once the next delay would exceed the cap
        if backoff > config.backoff_cap {
            let reason = "reconnect backoff exceeded cap".to_string();
            if !enter_failed(&mut rx, &mut hooks, &mut queue, reason, ever_connected).await {
                return;
            }
            backoff = config.backoff_floor;
            next_delay = Duration::ZERO;
            continue;
        }
        next_delay = backoff;
        backoff = backoff.saturating_mul(2);
    }
}

/// Sit out the backoff delay while still accepting commands. Sends queued
/// during this window become eligible on the next successful open.
async fn wait_delay(
    delay: Duration,
    rx: &mut mpsc::UnboundedReceiver<Command>,
    queue: &mut VecDeque<Producer>,
) -> Wait {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return Wait::Elapsed,
            cmd = rx.recv() => match cmd {
                Some(Command::Send(produce)) => queue.push_back(produce),
                Some(Command::Retry) => {}
                Some(Command::Fatal(reason)) => return Wait::Fatal(reason),
                Some(Command::Close) | None => return Wait::Shutdown,
            },
        }
    }
}

/// The failed state. Returns true when an explicit retry was requested,
/// false when the channel should stop.
async fn enter_failed(
    rx: &mut mpsc::UnboundedReceiver<Command>,
    hooks: &mut ChannelHooks,
    queue: &mut VecDeque<Producer>,
    reason: String,
    ever_connected: bool,
) -> bool {
    queue.clear();
    let failure = ChannelFailure {
        reason,
        ever_connected,
    };
    warn!("channel failed: {}", failure.describe());
    (hooks.on_failure)(failure);
    loop {
        match rx.recv().await {
            Some(Command::Retry) => return true,
            // Sends are discarded while failed
            Some(Command::Send(_)) | Some(Command::Fatal(_)) => {}
            Some(Command::Close) | None => return false,
        }
    }
}

async fn send_command(ws: &mut Transport, cmd: ClientCommand) -> std::result::Result<(), String> {
    let text = serde_json::to_string(&cmd).map_err(|e| e.to_string())?;
    ws.send(Message::Text(text)).await.map_err(|e| e.to_string())
}

/// The ready state: flush the queue, then pump frames and commands until
/// the epoch ends.
async fn drive_ready(
    mut ws: Transport,
    queue: &mut VecDeque<Producer>,
    rx: &mut mpsc::UnboundedReceiver<Command>,
    hooks: &mut ChannelHooks,
) -> Epoch {
    // FIFO flush; a failure aborts the rest of the queue, the transport
    // is no longer writable
    while let Some(produce) = queue.pop_front() {
        if let Err(reason) = send_command(&mut ws, produce()).await {
            return Epoch::Errored(reason);
        }
    }

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Send(produce)) => {
                    if let Err(reason) = send_command(&mut ws, produce()).await {
                        return Epoch::Errored(reason);
                    }
                }
                Some(Command::Retry) => {}
                Some(Command::Fatal(reason)) => {
                    let _ = ws.close(None).await;
                    return Epoch::Fatal(reason);
                }
                Some(Command::Close) | None => {
                    let _ = ws.close(None).await;
                    return Epoch::Shutdown;
                }
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let parsed: serde_json::Value = match serde_json::from_str(&text) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            let _ = ws.close(None).await;
                            return Epoch::Fatal(format!("unparseable message: {e}"));
                        }
                    };
                    if let Err(e) = (hooks.on_message)(parsed) {
                        let _ = ws.close(None).await;
                        return Epoch::Fatal(e.to_string());
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = ws.send(Message::Pong(payload)).await {
                        return Epoch::Errored(e.to_string());
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Epoch::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Epoch::Errored(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GridfillError;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> ChannelConfig {
        ChannelConfig {
            backoff_floor: Duration::from_millis(5),
            backoff_cap: Duration::from_millis(20),
            immediate_retry_on_close: true,
        }
    }

    #[derive(Debug, PartialEq)]
    enum Event {
        Connected,
        Message(serde_json::Value),
        Failed(String, bool),
    }

    fn hooks(
        events: mpsc::UnboundedSender<Event>,
        message_result: fn() -> Result<()>,
    ) -> ChannelHooks {
        let connect_tx = events.clone();
        let message_tx = events.clone();
        ChannelHooks {
            on_connect: Box::new(move || {
                let _ = connect_tx.send(Event::Connected);
            }),
            on_message: Box::new(move |value| {
                let _ = message_tx.send(Event::Message(value));
                message_result()
            }),
            on_failure: Box::new(move |failure| {
                let _ = events.send(Event::Failed(failure.describe(), failure.ever_connected));
            }),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_flushes_queued_sends_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut got = Vec::new();
            while got.len() < 2 {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => got.push(text),
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
            got
        });

        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let handle = open(format!("ws://{addr}"), fast_config(), hooks(ev_tx, || Ok(())));
        handle.send(|| ClientCommand::Name {
            name: "Alice".to_string(),
        });
        handle.send(|| ClientCommand::Update { data: vec![] });

        assert_eq!(next_event(&mut ev_rx).await, Event::Connected);
        let got = server.await.unwrap();
        assert_eq!(got.len(), 2);
        assert!(got[0].contains("\"name\""));
        assert!(got[1].contains("\"update\""));
        handle.close();
    }

    #[tokio::test]
    async fn test_delivers_parsed_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text("{\"failed\":false}".to_string()))
                .await
                .unwrap();
            // Hold the connection open until the client goes away
            while ws.next().await.is_some() {}
        });

        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let handle = open(format!("ws://{addr}"), fast_config(), hooks(ev_tx, || Ok(())));
        assert_eq!(next_event(&mut ev_rx).await, Event::Connected);
        match next_event(&mut ev_rx).await {
            Event::Message(value) => assert_eq!(value["failed"], serde_json::json!(false)),
            other => panic!("unexpected event: {other:?}"),
        }
        handle.close();
    }

    #[tokio::test]
    async fn test_reconnects_immediately_after_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // First connection is closed by the server right away; the
            // channel must come straight back
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                let _ = ws.close(None).await;
            }
        });

        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let handle = open(format!("ws://{addr}"), fast_config(), hooks(ev_tx, || Ok(())));
        assert_eq!(next_event(&mut ev_rx).await, Event::Connected);
        assert_eq!(next_event(&mut ev_rx).await, Event::Connected);
        handle.close();
    }

    #[tokio::test]
    async fn test_gives_up_when_never_connected() {
        // Grab a free port and release it so every attempt is refused
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let handle = open(format!("ws://{addr}"), fast_config(), hooks(ev_tx, || Ok(())));
        match next_event(&mut ev_rx).await {
            Event::Failed(describe, ever_connected) => {
                assert!(!ever_connected);
                assert!(describe.starts_with("unable to establish"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        handle.close();
    }

    #[tokio::test]
    async fn test_retry_leaves_failed_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let handle = open(format!("ws://{addr}"), fast_config(), hooks(ev_tx, || Ok(())));
        assert!(matches!(
            next_event(&mut ev_rx).await,
            Event::Failed(_, false)
        ));

        // Bring a server up on the same port, then explicitly retry
        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while ws.next().await.is_some() {}
        });
        handle.retry();
        assert_eq!(next_event(&mut ev_rx).await, Event::Connected);
        handle.close();
    }

    #[tokio::test]
    async fn test_message_callback_error_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text("{}".to_string())).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let handle = open(
            format!("ws://{addr}"),
            fast_config(),
            hooks(ev_tx, || {
                Err(GridfillError::Protocol("unexpected view".to_string()))
            }),
        );
        assert_eq!(next_event(&mut ev_rx).await, Event::Connected);
        assert!(matches!(next_event(&mut ev_rx).await, Event::Message(_)));
        match next_event(&mut ev_rx).await {
            Event::Failed(describe, ever_connected) => {
                assert!(ever_connected);
                assert!(describe.starts_with("connection lost"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        handle.close();
    }
}
