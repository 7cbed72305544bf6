//! Loopback HTTP receiver for assistant lifecycle hooks.
//!
//! `POST /hook` with the hook's JSON body. Bodies are parsed leniently and
//! the response is always `200 ok` once the body is read; a body that takes
//! longer than the read timeout gets `408`. Every other path is `404`.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use switchyard_protocol::{HookEvent, HookEventName};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::observer::{EventChannel, ObserverError};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HookServerError {
    #[error("failed to bind hook receiver: {0}")]
    Bind(#[source] std::io::Error),
}

/// What the receiver tells the local driver.
#[derive(Debug, Clone, PartialEq)]
pub enum HookSignal {
    /// A `SessionStart` disclosed the assistant's session id.
    SessionId(String),
    Event(HookEvent),
}

#[derive(Clone)]
struct HookState {
    signals: mpsc::UnboundedSender<HookSignal>,
}

pub fn hook_router(signals: mpsc::UnboundedSender<HookSignal>, read_timeout: Duration) -> Router {
    Router::new()
        .route("/hook", post(receive_hook))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(TimeoutLayer::new(read_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(HookState { signals })
}

async fn receive_hook(State(state): State<HookState>, body: Bytes) -> (StatusCode, &'static str) {
    let Some(event) = HookEvent::from_body(&body) else {
        debug!(
            component = "hook_server",
            event = "hook_server.body.ignored",
            bytes = body.len(),
            "Hook body without a known event"
        );
        return (StatusCode::OK, "ok");
    };

    debug!(
        component = "hook_server",
        event = "hook_server.received",
        hook = event.kind.as_str(),
        session_id = event.session_id.as_deref().unwrap_or(""),
        "Hook received"
    );

    if event.kind == HookEventName::SessionStart {
        if let Some(id) = &event.session_id {
            let _ = state.signals.send(HookSignal::SessionId(id.clone()));
        }
    }
    let _ = state.signals.send(HookSignal::Event(event));
    (StatusCode::OK, "ok")
}

pub struct HookServer {
    addr: SocketAddr,
    signals: EventChannel<HookSignal>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl HookServer {
    /// Bind an ephemeral loopback port and start serving.
    pub async fn start(read_timeout: Duration) -> Result<Self, HookServerError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(HookServerError::Bind)?;
        let addr = listener.local_addr().map_err(HookServerError::Bind)?;

        let signals = EventChannel::new("hook_signals");
        let app = hook_router(signals.sender(), read_timeout);
        let shutdown = CancellationToken::new();
        let graceful = shutdown.clone().cancelled_owned();

        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(graceful)
                .await
            {
                warn!(
                    component = "hook_server",
                    event = "hook_server.serve_failed",
                    error = %err,
                    "Hook receiver stopped with error"
                );
            }
        });

        info!(
            component = "hook_server",
            event = "hook_server.listening",
            addr = %addr,
            "Hook receiver listening"
        );

        Ok(Self {
            addr,
            signals,
            shutdown,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn take_signal_receiver(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<HookSignal>, ObserverError> {
        self.signals.take_receiver()
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
        debug!(
            component = "hook_server",
            event = "hook_server.stopped",
            "Hook receiver stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn post_hook(path: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .expect("request")
    }

    #[tokio::test]
    async fn session_start_reports_id_then_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let app = hook_router(tx, DEFAULT_READ_TIMEOUT);

        let body = r#"{"session_id":"abc","hook_event_name":"SessionStart","source":"startup"}"#;
        let response = app
            .oneshot(post_hook("/hook", Body::from(body)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("body");
        assert_eq!(bytes.as_ref(), b"ok");

        assert_eq!(rx.try_recv().ok(), Some(HookSignal::SessionId("abc".into())));
        match rx.try_recv() {
            Ok(HookSignal::Event(event)) => {
                assert_eq!(event.kind, HookEventName::SessionStart);
                assert_eq!(event.payload["source"], "startup");
            }
            other => panic!("expected hook event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_events_are_forwarded_without_session_update() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let app = hook_router(tx, DEFAULT_READ_TIMEOUT);

        let body = r#"{"sessionId":"abc","hook_event_name":"UserPromptSubmit","prompt":"go"}"#;
        let response = app
            .oneshot(post_hook("/hook", Body::from(body)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(matches!(
            rx.try_recv(),
            Ok(HookSignal::Event(HookEvent {
                kind: HookEventName::UserPromptSubmit,
                ..
            }))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_body_still_gets_ok() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let app = hook_router(tx, DEFAULT_READ_TIMEOUT);

        let response = app
            .oneshot(post_hook("/hook", Body::from("{nope")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let app = hook_router(tx, DEFAULT_READ_TIMEOUT);

        let response = app
            .oneshot(post_hook("/elsewhere", Body::from("{}")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stalled_body_times_out() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let app = hook_router(tx, Duration::from_millis(50));

        let stalled = futures::stream::pending::<Result<Bytes, std::io::Error>>();
        let response = app
            .oneshot(post_hook("/hook", Body::from_stream(stalled)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn serves_on_ephemeral_loopback_port() {
        let server = HookServer::start(DEFAULT_READ_TIMEOUT).await.expect("start");
        let mut signals = server.take_signal_receiver().expect("signals");
        assert_ne!(server.port(), 0);

        let response = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/hook", server.port()))
            .body(r#"{"session_id":"s","hook_event_name":"Stop"}"#)
            .send()
            .await
            .expect("post");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(matches!(
            signals.recv().await,
            Some(HookSignal::Event(HookEvent {
                kind: HookEventName::Stop,
                ..
            }))
        ));

        server.stop().await;
    }
}
