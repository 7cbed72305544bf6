//! Reconnecting websocket channel to the cloud collaborator.
//!
//! Sends are fire-and-forget: while the socket is down they are dropped,
//! and anything still buffered from before a reconnect is discarded when
//! the next connection opens. Inbound frames are filtered down to the
//! forwarded message types; keep-alive traffic never reaches observers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use switchyard_protocol::{InboundMessage, Mode, OutboundMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::observer::{EventChannel, ObserverError};

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid connection request: {0}")]
    InvalidRequest(String),
    #[error("websocket connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Linear backoff: `attempt * step`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub step: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            max_attempts: 50,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.max_delay)
    }
}

/// Attempt counter for one transport. Any successful open resets it.
#[derive(Debug)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Record a failure; returns the delay before the next attempt, or
    /// `None` once the attempt budget is spent.
    pub fn on_failure(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for(self.attempts))
    }

    pub fn on_open(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub token: String,
    pub session_id: String,
    pub user_id: String,
    pub device_id: String,
    pub keepalive: Duration,
    pub reconnect: ReconnectPolicy,
}

/// Reported once when the reconnect budget runs out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportClosed {
    pub attempts: u32,
}

/// Cloneable send handle. Every send is a no-op while the socket is down.
#[derive(Clone)]
pub struct TransportSender {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    open: Arc<AtomicBool>,
}

impl TransportSender {
    pub(crate) fn new(open: bool) -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                open: Arc::new(AtomicBool::new(open)),
            },
            rx,
        )
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    /// Returns whether the message was handed to the socket task.
    pub fn send(&self, msg: OutboundMessage) -> bool {
        if !self.is_open() {
            debug!(
                component = "transport",
                event = "transport.send.dropped",
                kind = msg.kind(),
                "Channel not open, dropping outbound message"
            );
            return false;
        }
        self.tx.send(msg).is_ok()
    }

    pub fn forward_event(&self, event: Value) -> bool {
        self.send(OutboundMessage::claude_event(event))
    }

    pub fn send_thinking(&self, thinking: bool) -> bool {
        self.send(OutboundMessage::thinking(thinking))
    }

    pub fn send_mode_change(&self, mode: Mode) -> bool {
        self.send(OutboundMessage::mode_change(mode))
    }
}

pub struct Transport {
    sender: TransportSender,
    inbound: Arc<EventChannel<InboundMessage>>,
    closed: Arc<EventChannel<TransportClosed>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Transport {
    /// Validate the handshake request and start the connection supervisor.
    pub fn start(config: TransportConfig) -> Result<Self, TransportError> {
        build_request(&config)?;

        let (sender, out_rx) = TransportSender::new(false);
        let inbound = Arc::new(EventChannel::new("transport_inbound"));
        let closed = Arc::new(EventChannel::new("transport_closed"));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(supervise(
            config,
            sender.clone(),
            out_rx,
            inbound.clone(),
            closed.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            sender,
            inbound,
            closed,
            cancel,
            task: Some(task),
        })
    }

    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    pub fn take_inbound_receiver(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<InboundMessage>, ObserverError> {
        self.inbound.take_receiver()
    }

    pub fn take_closed_receiver(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<TransportClosed>, ObserverError> {
        self.closed.take_receiver()
    }

    /// Caller-initiated close. No reconnect follows and the close observer
    /// is not notified.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!(
            component = "transport",
            event = "transport.closed",
            "Transport closed by caller"
        );
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn build_request(config: &TransportConfig) -> Result<Request<()>, TransportError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

    let headers = [
        ("authorization", format!("Bearer {}", config.token)),
        ("x-session-id", config.session_id.clone()),
        ("x-user-id", config.user_id.clone()),
        ("x-device-id", config.device_id.clone()),
    ];
    for (name, value) in headers {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| TransportError::InvalidRequest(format!("{name}: {e}")))?;
        request
            .headers_mut()
            .insert(HeaderName::from_static(name), value);
    }
    Ok(request)
}

#[derive(Debug, PartialEq, Eq)]
enum ConnectionEnd {
    Intentional,
    Dropped,
}

async fn supervise(
    config: TransportConfig,
    sender: TransportSender,
    mut out_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    inbound: Arc<EventChannel<InboundMessage>>,
    closed: Arc<EventChannel<TransportClosed>>,
    cancel: CancellationToken,
) {
    let mut state = ReconnectState::new(config.reconnect.clone());

    loop {
        let request = match build_request(&config) {
            Ok(request) => request,
            Err(err) => {
                error!(
                    component = "transport",
                    event = "transport.request.invalid",
                    error = %err,
                    "Cannot build connection request"
                );
                return;
            }
        };

        let connect = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connect_async(request) => result,
        };

        match connect {
            Ok((ws, _)) => {
                state.on_open();
                let mut stale = 0usize;
                while out_rx.try_recv().is_ok() {
                    stale += 1;
                }
                sender.set_open(true);
                info!(
                    component = "transport",
                    event = "transport.connected",
                    url = %config.url,
                    discarded = stale,
                    "Connected to cloud"
                );

                let end =
                    run_connection(ws, &mut out_rx, &inbound, config.keepalive, &cancel).await;
                sender.set_open(false);
                if end == ConnectionEnd::Intentional {
                    return;
                }
                warn!(
                    component = "transport",
                    event = "transport.dropped",
                    "Cloud connection dropped"
                );
            }
            Err(err) => {
                let err = TransportError::from(err);
                warn!(
                    component = "transport",
                    event = "transport.connect_failed",
                    attempt = state.attempts() + 1,
                    error = %err,
                    "Cloud connect failed"
                );
            }
        }

        match state.on_failure() {
            Some(delay) => {
                debug!(
                    component = "transport",
                    event = "transport.reconnect.scheduled",
                    attempt = state.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                error!(
                    component = "transport",
                    event = "transport.reconnect.exhausted",
                    attempts = state.attempts(),
                    "Giving up on cloud connection"
                );
                closed.emit(TransportClosed {
                    attempts: state.attempts(),
                });
                return;
            }
        }
    }
}

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_connection(
    ws: Socket,
    out_rx: &mut mpsc::UnboundedReceiver<OutboundMessage>,
    inbound: &EventChannel<InboundMessage>,
    keepalive: Duration,
    cancel: &CancellationToken,
) -> ConnectionEnd {
    let (mut sink, mut stream) = ws.split();
    let mut ping = tokio::time::interval_at(Instant::now() + keepalive, keepalive);

    loop {
        let outgoing = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return ConnectionEnd::Intentional;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match handle_frame(text.as_str(), inbound) {
                    Some(reply) => reply,
                    None => continue,
                },
                Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Dropped,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    debug!(
                        component = "transport",
                        event = "transport.read_error",
                        error = %err,
                        "Websocket read failed"
                    );
                    return ConnectionEnd::Dropped;
                }
            },
            Some(msg) = out_rx.recv() => msg,
            _ = ping.tick() => OutboundMessage::Ping,
        };

        let json = match serde_json::to_string(&outgoing) {
            Ok(json) => json,
            Err(err) => {
                warn!(
                    component = "transport",
                    event = "transport.encode_failed",
                    error = %err,
                    "Failed to encode outbound message"
                );
                continue;
            }
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            return ConnectionEnd::Dropped;
        }
    }
}

/// Route one inbound text frame. Returns a reply to send, if any.
fn handle_frame(text: &str, inbound: &EventChannel<InboundMessage>) -> Option<OutboundMessage> {
    let msg: InboundMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(err) => {
            debug!(
                component = "transport",
                event = "transport.frame.malformed",
                error = %err,
                "Ignoring malformed inbound frame"
            );
            return None;
        }
    };

    match msg {
        InboundMessage::Ping => Some(OutboundMessage::Pong),
        msg if msg.is_forwarded() => {
            inbound.emit(msg);
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as ServerRequest, Response,
    };

    #[test]
    fn backoff_is_linear_and_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(10), Duration::from_secs(10));
        assert_eq!(policy.delay_for(49), Duration::from_secs(10));
    }

    #[test]
    fn attempts_reset_after_successful_open() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        assert_eq!(state.on_failure(), Some(Duration::from_millis(1000)));
        assert_eq!(state.on_failure(), Some(Duration::from_millis(2000)));
        assert_eq!(state.attempts(), 2);

        state.on_open();
        assert_eq!(state.attempts(), 0);
        assert_eq!(state.on_failure(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn attempts_are_bounded() {
        let mut state = ReconnectState::new(ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        });
        for _ in 0..3 {
            assert!(state.on_failure().is_some());
        }
        assert_eq!(state.on_failure(), None);
        assert_eq!(state.attempts(), 3);
    }

    #[tokio::test]
    async fn sends_are_dropped_while_closed() {
        let (sender, mut rx) = TransportSender::new(false);
        assert!(!sender.send_thinking(true));

        sender.set_open(true);
        assert!(sender.send_thinking(true));
        assert!(sender.send_mode_change(Mode::Remote));
        assert!(matches!(
            rx.recv().await,
            Some(OutboundMessage::Thinking { thinking: true, .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(OutboundMessage::ModeChange {
                mode: Mode::Remote,
                ..
            })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ping_frames_are_answered_and_not_forwarded() {
        let inbound = EventChannel::new("test");
        let mut rx = inbound.take_receiver().expect("receiver");

        assert_eq!(
            handle_frame(r#"{"type":"ping"}"#, &inbound),
            Some(OutboundMessage::Pong)
        );
        assert_eq!(handle_frame(r#"{"type":"pong"}"#, &inbound), None);
        assert_eq!(handle_frame(r#"{"type":"mystery"}"#, &inbound), None);
        assert_eq!(handle_frame("not json", &inbound), None);
        assert!(rx.try_recv().is_err());

        assert_eq!(
            handle_frame(r#"{"type":"switch","mode":"local"}"#, &inbound),
            None
        );
        assert_eq!(
            rx.try_recv().ok(),
            Some(InboundMessage::Switch {
                mode: Some(Mode::Local)
            })
        );
    }

    #[test]
    fn rejects_unusable_url() {
        let config = TransportConfig {
            url: "not a url".to_string(),
            token: "t".to_string(),
            session_id: "s".to_string(),
            user_id: "u".to_string(),
            device_id: "d".to_string(),
            keepalive: DEFAULT_KEEPALIVE,
            reconnect: ReconnectPolicy::default(),
        };
        assert!(matches!(
            build_request(&config),
            Err(TransportError::InvalidRequest(_))
        ));
    }

    fn local_config(addr: std::net::SocketAddr, reconnect: ReconnectPolicy) -> TransportConfig {
        TransportConfig {
            url: format!("ws://{addr}/session"),
            token: "secret".to_string(),
            session_id: "sess-1".to_string(),
            user_id: "user-1".to_string(),
            device_id: "dev-1".to_string(),
            keepalive: DEFAULT_KEEPALIVE,
            reconnect,
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    #[tokio::test]
    async fn reconnects_after_server_drops_and_resets_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (dropped_tx, mut dropped_rx) = mpsc::unbounded_channel::<()>();
        let (resume_tx, mut resume_rx) = mpsc::unbounded_channel::<()>();

        // With a budget of one attempt, the third connection only happens if
        // every successful open resets the counter.
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (tcp, _) = listener.accept().await.expect("accept");
                let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
                let _ = ws.close(None).await;
                drop(ws);
                let _ = dropped_tx.send(());
                resume_rx.recv().await;
            }

            let (tcp, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
            ws.send(Message::Text(r#"{"type":"user_input","message":"back"}"#.into()))
                .await
                .expect("send input");
            while let Some(Ok(frame)) = ws.next().await {
                if let Message::Text(text) = frame {
                    let value: Value = serde_json::from_str(text.as_str()).expect("json");
                    if value["type"] != "ping" {
                        return value;
                    }
                }
            }
            Value::Null
        });

        let transport = Transport::start(local_config(
            addr,
            ReconnectPolicy {
                step: Duration::from_millis(20),
                max_delay: Duration::from_millis(20),
                max_attempts: 1,
            },
        ))
        .expect("start");
        let mut inbound = transport.take_inbound_receiver().expect("inbound");
        let mut closed = transport.take_closed_receiver().expect("closed");
        let sender = transport.sender();

        for _ in 0..2 {
            dropped_rx.recv().await.expect("server dropped connection");
            wait_until(|| !sender.is_open()).await;
            assert!(!sender.send_thinking(true));
            resume_tx.send(()).expect("resume server");
        }

        let msg = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("input in time")
            .expect("input relayed");
        assert_eq!(
            msg,
            InboundMessage::UserInput {
                message: "back".to_string(),
                attachments: vec![],
            }
        );
        assert!(sender.send_mode_change(Mode::Remote));

        let first = server.await.expect("server");
        assert_eq!(first["type"], "mode_change");
        assert!(closed.try_recv().is_err());
        transport.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_notify_close_observer_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let transport = Transport::start(local_config(
            addr,
            ReconnectPolicy {
                step: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                max_attempts: 3,
            },
        ))
        .expect("start");
        let mut closed = transport.take_closed_receiver().expect("closed");

        let report = closed.recv().await.expect("close reported");
        assert_eq!(report, TransportClosed { attempts: 3 });

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(closed.try_recv().is_err());
        assert!(!transport.sender().is_open());
        transport.close().await;
    }

    #[tokio::test]
    async fn handshake_carries_identity_and_relays_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let seen_headers = Arc::new(Mutex::new(Vec::<(String, String)>::new()));

        let server = {
            let seen_headers = seen_headers.clone();
            tokio::spawn(async move {
                let (tcp, _) = listener.accept().await.expect("accept");
                let callback = |req: &ServerRequest, resp: Response| {
                    let mut seen = seen_headers.lock().expect("lock");
                    for name in ["authorization", "x-session-id", "x-user-id", "x-device-id"] {
                        if let Some(value) = req.headers().get(name) {
                            let value = value.to_str().unwrap_or("").to_string();
                            seen.push((name.to_string(), value));
                        }
                    }
                    Ok::<Response, ErrorResponse>(resp)
                };
                let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback)
                    .await
                    .expect("handshake");

                ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
                    .await
                    .expect("send ping");
                ws.send(Message::Text(r#"{"type":"user_input","message":"hi"}"#.into()))
                    .await
                    .expect("send input");

                let mut received = Vec::new();
                while let Some(Ok(frame)) = ws.next().await {
                    if let Message::Text(text) = frame {
                        let value: Value = serde_json::from_str(text.as_str()).expect("json");
                        received.push(value);
                        if received.len() == 2 {
                            break;
                        }
                    }
                }
                received
            })
        };

        let transport = Transport::start(local_config(addr, ReconnectPolicy::default()))
            .expect("start");
        let mut inbound = transport.take_inbound_receiver().expect("inbound");
        let sender = transport.sender();

        let msg = inbound.recv().await.expect("user input relayed");
        assert_eq!(
            msg,
            InboundMessage::UserInput {
                message: "hi".to_string(),
                attachments: vec![],
            }
        );
        assert!(sender.is_open());
        assert!(sender.send_mode_change(Mode::Remote));

        let received = server.await.expect("server");
        assert_eq!(received[0]["type"], "pong");
        assert_eq!(received[1]["type"], "mode_change");
        assert_eq!(received[1]["mode"], "remote");

        let headers = seen_headers.lock().expect("lock").clone();
        assert!(headers.contains(&("authorization".to_string(), "Bearer secret".to_string())));
        assert!(headers.contains(&("x-session-id".to_string(), "sess-1".to_string())));
        assert!(headers.contains(&("x-user-id".to_string(), "user-1".to_string())));
        assert!(headers.contains(&("x-device-id".to_string(), "dev-1".to_string())));

        let mut closed = transport.take_closed_receiver().expect("closed");
        transport.close().await;
        assert!(closed.try_recv().is_err());
    }
}
