//! Client connection manager for the realtime ticket endpoint.
//!
//! Owns at most one WebSocket at a time: connect/disconnect, ordered
//! event dispatch, outbound sends, a throttled typing signal, and
//! bounded auto-reconnection with linear backoff. The manager is an
//! explicitly constructed instance: create one per chat session and
//! call [`ConnectionManager::disconnect`] on teardown.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::models::frame::{ClientFrame, EventKind, ServerFrame};
use crate::ws::registry::{EventRegistry, HandlerId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Lifecycle of the managed connection. `Failed` is terminal: the
/// reconnect budget is exhausted and only a fresh `connect` leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

/// Result of a realtime send attempt. `Dropped` means the connection
/// was not open; callers decide whether to fall back to REST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum SendOutcome {
    Sent,
    Dropped,
}

/// Tunable timings. Defaults match the platform behavior; tests shrink
/// them to compress time.
#[derive(Debug, Clone)]
pub struct WsOptions {
    /// Reconnect attempts after an unexpected close before giving up.
    pub max_reconnect_attempts: u32,
    /// Backoff base; attempt n waits n times this long.
    pub reconnect_base_delay: Duration,
    /// Rolling window allowing at most one outbound typing frame.
    pub typing_throttle: Duration,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            typing_throttle: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
struct Target {
    ticket_id: i64,
    token: String,
}

/// Manages exactly one realtime connection to a ticket conversation.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    base_url: String,
    options: WsOptions,
    registry: EventRegistry,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    /// Most recently supplied target, reused by the reconnect path.
    target: Mutex<Option<Target>>,
    /// Suppresses auto-reconnect once a manual disconnect happened.
    manual_disconnect: AtomicBool,
    reconnect_attempts: AtomicU32,
    out_tx: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    last_typing: Mutex<Option<Instant>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

impl ConnectionManager {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_options(base_url, WsOptions::default())
    }

    pub fn with_options(base_url: impl Into<String>, options: WsOptions) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                base_url: base_url.into(),
                options,
                registry: EventRegistry::new(),
                state_tx,
                state_rx,
                target: Mutex::new(None),
                manual_disconnect: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                out_tx: Mutex::new(None),
                last_typing: Mutex::new(None),
                reader: Mutex::new(None),
                writer: Mutex::new(None),
                reconnect: Mutex::new(None),
            }),
        }
    }

    /// Open the realtime connection for `ticket_id`.
    ///
    /// Resolves once the transport is open. If already open this is an
    /// immediate `Ok`. If an attempt is in flight, the call joins it:
    /// all concurrent callers share the outcome of the single attempt
    /// and exactly one transport is constructed.
    pub async fn connect(&self, ticket_id: i64, token: &str) -> ChatResult<()> {
        self.inner.manual_disconnect.store(false, Ordering::SeqCst);
        *self.inner.target.lock().unwrap() = Some(Target {
            ticket_id,
            token: token.to_string(),
        });
        connect_inner(&self.inner, ticket_id, token).await
    }

    /// Close the connection, cancel pending reconnects, and drop all
    /// event subscriptions. Idempotent; auto-reconnect stays suppressed
    /// until the next `connect`.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.manual_disconnect.store(true, Ordering::SeqCst);
        if let Some(handle) = inner.reconnect.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = inner.reader.lock().unwrap().take() {
            handle.abort();
        }
        // Dropping the sender ends the writer loop, which sends a Close
        // frame before exiting; no abort so the frame gets flushed.
        inner.out_tx.lock().unwrap().take();
        inner.writer.lock().unwrap().take();
        inner.registry.clear();
        inner.set_state(ConnectionState::Closed);
        debug!("realtime connection closed by client");
    }

    /// Send a chat message over the realtime channel. Content is not
    /// validated here; the chat controller guards emptiness and length.
    pub fn send_message(&self, content: &str) -> SendOutcome {
        if !self.is_connected() {
            warn!("realtime send dropped: connection not open");
            return SendOutcome::Dropped;
        }
        let out = self.inner.out_tx.lock().unwrap();
        let sent = out.as_ref().is_some_and(|tx| {
            tx.send(ClientFrame::Message {
                content: content.to_string(),
            })
            .is_ok()
        });
        if sent {
            SendOutcome::Sent
        } else {
            warn!("realtime send dropped: writer gone");
            SendOutcome::Dropped
        }
    }

    /// Send a typing signal, at most once per throttle window. Calls
    /// inside the window are suppressed silently. This is the single
    /// typing throttle for the whole stack.
    pub fn send_typing(&self) {
        let now = Instant::now();
        let mut last = self.inner.last_typing.lock().unwrap();
        if last.is_some_and(|prev| now.duration_since(prev) < self.inner.options.typing_throttle) {
            return;
        }
        let out = self.inner.out_tx.lock().unwrap();
        if let Some(tx) = out.as_ref() {
            if self.is_connected() && tx.send(ClientFrame::Typing).is_ok() {
                *last = Some(now);
            }
        }
    }

    /// Subscribe to inbound frames of one kind. Handlers run in
    /// subscription order on the reader task and must not block.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ServerFrame) + Send + Sync + 'static,
    {
        self.inner.registry.on(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: HandlerId) {
        self.inner.registry.off(kind, id);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Watchable lifecycle, including the terminal `Failed` state after
    /// the reconnect budget runs out.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // Best-effort teardown so no timer outlives the owner.
        self.disconnect();
    }
}

/// Shared connect path for callers and the reconnect loop, so the
/// in-flight guard applies to both.
async fn connect_inner(inner: &Arc<Inner>, ticket_id: i64, token: &str) -> ChatResult<()> {
    let mut claimed = false;
    let mut already_open = false;
    inner.state_tx.send_if_modified(|state| match *state {
        ConnectionState::Open => {
            already_open = true;
            false
        }
        ConnectionState::Connecting => false,
        _ => {
            *state = ConnectionState::Connecting;
            claimed = true;
            true
        }
    });

    if already_open {
        return Ok(());
    }
    if !claimed {
        return join_in_flight(inner).await;
    }
    establish(inner, ticket_id, token).await
}

/// Wait for the in-flight attempt owned by another caller to settle.
async fn join_in_flight(inner: &Arc<Inner>) -> ChatResult<()> {
    let mut rx = inner.state_rx.clone();
    loop {
        let state = *rx.borrow_and_update();
        match state {
            ConnectionState::Connecting => {
                if rx.changed().await.is_err() {
                    return Err(ChatError::Ws("connection state channel closed".to_string()));
                }
            }
            ConnectionState::Open => return Ok(()),
            _ => return Err(ChatError::Ws("connection attempt failed".to_string())),
        }
    }
}

/// Open the transport and spawn the reader/writer tasks.
async fn establish(inner: &Arc<Inner>, ticket_id: i64, token: &str) -> ChatResult<()> {
    let url = match realtime_url(&inner.base_url, ticket_id, token) {
        Ok(url) => url,
        Err(e) => {
            inner.set_state(ConnectionState::Closed);
            return Err(e);
        }
    };
    let conn_id = connection_id();
    debug!(conn_id = %conn_id, ticket_id, "opening realtime connection");

    match connect_async(url.as_str()).await {
        Ok((stream, _response)) => {
            let (sink, source) = stream.split();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            *inner.out_tx.lock().unwrap() = Some(out_tx);
            inner.reconnect_attempts.store(0, Ordering::SeqCst);

            let writer = tokio::spawn(write_loop(sink, out_rx));
            let reader = tokio::spawn(read_loop(Arc::clone(inner), source, conn_id.clone()));
            *inner.writer.lock().unwrap() = Some(writer);
            *inner.reader.lock().unwrap() = Some(reader);

            inner.set_state(ConnectionState::Open);
            info!(conn_id = %conn_id, ticket_id, "realtime connection open");
            Ok(())
        }
        Err(e) => {
            inner.set_state(ConnectionState::Closed);
            warn!(conn_id = %conn_id, ticket_id, error = %e, "realtime connection failed");
            Err(ChatError::Ws(e.to_string()))
        }
    }
}

/// Serialize and transmit outbound frames; a Close frame is sent when
/// the channel ends so the server sees a clean shutdown.
async fn write_loop(mut sink: WsSink, mut out_rx: mpsc::UnboundedReceiver<ClientFrame>) {
    while let Some(frame) = out_rx.recv().await {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound frame");
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Read inbound frames and dispatch them to subscribers; on close,
/// hand off to the reconnect path unless the disconnect was manual.
async fn read_loop(inner: Arc<Inner>, mut source: WsSource, conn_id: String) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                Ok(parsed) => inner.registry.dispatch(&parsed),
                Err(e) => warn!(conn_id = %conn_id, error = %e, "unparseable realtime frame"),
            },
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "server closed realtime connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "realtime read error");
                break;
            }
        }
    }
    on_closed(&inner);
}

fn on_closed(inner: &Arc<Inner>) {
    inner.out_tx.lock().unwrap().take();
    inner.set_state(ConnectionState::Closed);
    if inner.manual_disconnect.load(Ordering::SeqCst) {
        return;
    }
    let task = tokio::spawn(reconnect_loop(Arc::clone(inner)));
    if let Some(old) = inner.reconnect.lock().unwrap().replace(task) {
        old.abort();
    }
}

/// Retry the most recent target with linearly growing delays until the
/// attempt budget runs out, then publish the terminal `Failed` state.
async fn reconnect_loop(inner: Arc<Inner>) {
    loop {
        let attempt = inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > inner.options.max_reconnect_attempts {
            warn!(
                attempts = inner.options.max_reconnect_attempts,
                "reconnect budget exhausted, giving up"
            );
            inner.set_state(ConnectionState::Failed);
            return;
        }

        let delay = inner.options.reconnect_base_delay * attempt;
        debug!(attempt, ?delay, "scheduling reconnect");
        tokio::time::sleep(delay).await;

        if inner.manual_disconnect.load(Ordering::SeqCst) {
            return;
        }
        let target = match inner.target.lock().unwrap().clone() {
            Some(target) => target,
            None => return,
        };

        match connect_inner(&inner, target.ticket_id, &target.token).await {
            Ok(()) => {
                info!(attempt, ticket_id = target.ticket_id, "reconnected");
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
            }
        }
    }
}

/// Derive the realtime endpoint from the platform origin: http maps to
/// ws and https to wss, the token rides as a query parameter.
fn realtime_url(base_url: &str, ticket_id: i64, token: &str) -> ChatResult<String> {
    let trimmed = base_url.trim_end_matches('/');
    let (scheme, host) = if let Some(rest) = trimmed.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        ("ws", rest)
    } else {
        return Err(ChatError::Config(format!(
            "base url must be http(s): {}",
            base_url
        )));
    };
    Ok(format!(
        "{}://{}/ws/tickets/{}/?token={}",
        scheme, host, ticket_id, token
    ))
}

/// Unique id for one transport, used in diagnostics only.
fn connection_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_url_plain_origin() {
        assert_eq!(
            realtime_url("http://ctf.example.com", 3, "abc").unwrap(),
            "ws://ctf.example.com/ws/tickets/3/?token=abc"
        );
    }

    #[test]
    fn realtime_url_secure_origin() {
        assert_eq!(
            realtime_url("https://ctf.example.com/", 12, "tok").unwrap(),
            "wss://ctf.example.com/ws/tickets/12/?token=tok"
        );
    }

    #[test]
    fn realtime_url_rejects_other_schemes() {
        assert!(realtime_url("ftp://ctf.example.com", 1, "t").is_err());
    }

    #[test]
    fn send_message_without_connection_is_dropped() {
        let manager = ConnectionManager::new("http://127.0.0.1:1");
        assert_eq!(manager.send_message("hello"), SendOutcome::Dropped);
        assert!(!manager.is_connected());
    }

    #[test]
    fn send_typing_without_connection_is_silent() {
        let manager = ConnectionManager::new("http://127.0.0.1:1");
        manager.send_typing();
        assert!(manager.inner.last_typing.lock().unwrap().is_none());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let manager = ConnectionManager::new("http://127.0.0.1:1");
        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Closed);
    }
}
