//! Permission relay.
//!
//! Two paths deliver a cloud decision to the assistant:
//! - a suspended wait (remote driver), resolved as soon as the response lands;
//! - a parked response (local driver, nobody waiting), kept with its receipt
//!   time and only consumed on mode entry while younger than the TTL.
//!
//! Starting a new wait always discards a parked response first, so an old
//! answer can never be applied to a newer prompt.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use switchyard_protocol::{PermissionDecision, PermissionResponse};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_PROTECTED_TOOL: &str = "ExitPlanMode";

#[derive(Debug, Clone)]
pub struct PermissionPolicy {
    /// How long a parked response stays eligible for consumption.
    pub pending_ttl: Duration,
    /// Tool that always requires a fresh interactive decision.
    pub protected_tool: String,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            pending_ttl: DEFAULT_PENDING_TTL,
            protected_tool: DEFAULT_PROTECTED_TOOL.to_string(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PermissionError {
    #[error("a permission wait is already outstanding")]
    WaiterPending,
    #[error("permission wait cancelled")]
    Cancelled,
}

/// Where an incoming response ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Parked,
}

struct ParkedResponse {
    response: PermissionResponse,
    received_at: Instant,
}

#[derive(Default)]
struct RelayState {
    always_allowed: HashSet<String>,
    parked: Option<ParkedResponse>,
    waiter: Option<oneshot::Sender<PermissionResponse>>,
}

pub struct PermissionRelay {
    policy: PermissionPolicy,
    state: Mutex<RelayState>,
}

/// A parked response taken out of the relay, still bound to its TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimedResponse {
    pub response: PermissionResponse,
    pub expires_at: Instant,
}

impl PrimedResponse {
    /// True if this response may answer the prompt `request_id` right now.
    /// A response naming a different request never applies.
    pub fn applies_to(&self, request_id: &str) -> bool {
        Instant::now() <= self.expires_at
            && self
                .response
                .request_id
                .as_deref()
                .map_or(true, |id| id == request_id)
    }
}

/// An outstanding wait created by [`PermissionRelay::begin_wait`].
pub struct PermissionWait {
    rx: oneshot::Receiver<PermissionResponse>,
}

impl PermissionWait {
    pub async fn wait(
        self,
        cancel: &CancellationToken,
    ) -> Result<PermissionResponse, PermissionError> {
        tokio::select! {
            response = self.rx => response.map_err(|_| PermissionError::Cancelled),
            _ = cancel.cancelled() => Err(PermissionError::Cancelled),
        }
    }
}

impl PermissionRelay {
    pub fn new(policy: PermissionPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(RelayState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_protected(&self, tool: &str) -> bool {
        tool == self.policy.protected_tool
    }

    pub fn is_always_allowed(&self, tool: &str) -> bool {
        !self.is_protected(tool) && self.state().always_allowed.contains(tool)
    }

    /// Cache an allow-always decision. Returns false for the protected tool.
    pub fn allow_always(&self, tool: &str) -> bool {
        if self.is_protected(tool) {
            warn!(
                component = "permission",
                event = "permission.always_allow.protected",
                tool = %tool,
                "Refusing to cache allow-always for protected tool"
            );
            return false;
        }
        self.state().always_allowed.insert(tool.to_string());
        info!(
            component = "permission",
            event = "permission.always_allow.cached",
            tool = %tool,
            "Tool allowed for the rest of the session"
        );
        true
    }

    /// Open a new wait. Any parked response is discarded first, whatever its age.
    pub fn begin_wait(&self) -> Result<PermissionWait, PermissionError> {
        let mut state = self.state();
        if state.parked.take().is_some() {
            debug!(
                component = "permission",
                event = "permission.parked.cleared",
                "Discarded parked response before new request"
            );
        }
        if state.waiter.as_ref().is_some_and(|w| !w.is_closed()) {
            return Err(PermissionError::WaiterPending);
        }
        let (tx, rx) = oneshot::channel();
        state.waiter = Some(tx);
        Ok(PermissionWait { rx })
    }

    /// Ask for a decision on `tool`, suspending until the cloud answers.
    ///
    /// Cached allow-always tools resolve without creating a wait. An
    /// allow-always answer is cached for the rest of the session.
    pub async fn request(
        &self,
        tool: &str,
        cancel: &CancellationToken,
    ) -> Result<PermissionResponse, PermissionError> {
        if self.is_always_allowed(tool) {
            debug!(
                component = "permission",
                event = "permission.request.cached_allow",
                tool = %tool,
                "Tool already allowed for this session"
            );
            return Ok(PermissionResponse::new(PermissionDecision::AllowAlways));
        }

        let response = self.begin_wait()?.wait(cancel).await?;
        if response.decision == PermissionDecision::AllowAlways {
            self.allow_always(tool);
        }
        Ok(response)
    }

    /// Deliver a response from the cloud: to the waiter if there is one,
    /// otherwise park it with its receipt time.
    pub fn respond(&self, response: PermissionResponse) -> Delivery {
        let mut state = self.state();
        if let Some(waiter) = state.waiter.take() {
            match waiter.send(response) {
                Ok(()) => return Delivery::Delivered,
                Err(response) => {
                    state.parked = Some(ParkedResponse {
                        response,
                        received_at: Instant::now(),
                    });
                }
            }
        } else {
            state.parked = Some(ParkedResponse {
                response,
                received_at: Instant::now(),
            });
        }
        debug!(
            component = "permission",
            event = "permission.response.parked",
            "No waiter, parked permission response"
        );
        Delivery::Parked
    }

    /// Consume the parked response if it is still within the TTL.
    /// Expired responses are discarded unread.
    pub fn take_parked(&self) -> Option<PermissionResponse> {
        self.take_primed().map(|primed| primed.response)
    }

    /// Like [`take_parked`](Self::take_parked), but keeps the TTL deadline so
    /// the holder can still refuse the response when a prompt shows up late.
    pub fn take_primed(&self) -> Option<PrimedResponse> {
        let parked = self.state().parked.take()?;
        let age = parked.received_at.elapsed();
        if age > self.policy.pending_ttl {
            info!(
                component = "permission",
                event = "permission.parked.expired",
                age_ms = age.as_millis() as u64,
                "Discarded expired parked permission response"
            );
            return None;
        }
        Some(PrimedResponse {
            response: parked.response,
            expires_at: parked.received_at + self.policy.pending_ttl,
        })
    }

    pub fn has_parked(&self) -> bool {
        self.state().parked.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn relay() -> PermissionRelay {
        PermissionRelay::new(PermissionPolicy::default())
    }

    fn response(decision: PermissionDecision) -> PermissionResponse {
        PermissionResponse {
            request_id: Some("req-1".to_string()),
            decision,
            message: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn parked_response_within_ttl_is_returned_once() {
        let relay = relay();
        assert_eq!(
            relay.respond(response(PermissionDecision::AllowOnce)),
            Delivery::Parked
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            relay.take_parked(),
            Some(response(PermissionDecision::AllowOnce))
        );
        assert_eq!(relay.take_parked(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn parked_response_after_ttl_is_discarded() {
        let relay = relay();
        relay.respond(response(PermissionDecision::Deny));

        tokio::time::advance(DEFAULT_PENDING_TTL + Duration::from_millis(1)).await;
        assert_eq!(relay.take_parked(), None);
        assert!(!relay.has_parked());
    }

    #[tokio::test(start_paused = true)]
    async fn primed_response_only_applies_to_its_request_within_ttl() {
        let relay = relay();
        relay.respond(response(PermissionDecision::AllowOnce));

        tokio::time::advance(Duration::from_secs(10)).await;
        let primed = relay.take_primed().expect("primed");
        assert!(primed.applies_to("req-1"));
        assert!(!primed.applies_to("req-2"));

        tokio::time::advance(DEFAULT_PENDING_TTL).await;
        assert!(!primed.applies_to("req-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn new_wait_clears_fresh_parked_response() {
        let relay = relay();
        relay.respond(response(PermissionDecision::AllowOnce));

        let _wait = relay.begin_wait().expect("wait");
        assert!(!relay.has_parked());
        assert_eq!(relay.take_parked(), None);
    }

    #[tokio::test]
    async fn waiting_request_resolves_on_response() {
        let relay = Arc::new(relay());
        let cancel = CancellationToken::new();
        let task = {
            let relay = relay.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { relay.request("Bash", &cancel).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(
            relay.respond(response(PermissionDecision::AllowOnce)),
            Delivery::Delivered
        );
        let got = task.await.expect("join").expect("response");
        assert_eq!(got.decision, PermissionDecision::AllowOnce);
        assert!(!relay.is_always_allowed("Bash"));
    }

    #[tokio::test]
    async fn only_one_wait_at_a_time() {
        let relay = relay();
        let _first = relay.begin_wait().expect("first wait");
        assert!(matches!(
            relay.begin_wait(),
            Err(PermissionError::WaiterPending)
        ));
    }

    #[tokio::test]
    async fn allow_always_is_cached_per_tool() {
        let relay = Arc::new(relay());
        let cancel = CancellationToken::new();
        let task = {
            let relay = relay.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { relay.request("Edit", &cancel).await })
        };
        tokio::task::yield_now().await;
        relay.respond(response(PermissionDecision::AllowAlways));
        task.await.expect("join").expect("response");

        assert!(relay.is_always_allowed("Edit"));
        assert!(!relay.is_always_allowed("Bash"));

        // Cached tools resolve without a waiter being installed.
        let cached = relay.request("Edit", &cancel).await.expect("cached");
        assert_eq!(cached.decision, PermissionDecision::AllowAlways);
        assert_eq!(
            relay.respond(response(PermissionDecision::Deny)),
            Delivery::Parked
        );
    }

    #[tokio::test]
    async fn protected_tool_is_never_always_allowed() {
        let relay = Arc::new(relay());
        assert!(!relay.allow_always(DEFAULT_PROTECTED_TOOL));
        assert!(!relay.is_always_allowed(DEFAULT_PROTECTED_TOOL));

        let cancel = CancellationToken::new();
        let task = {
            let relay = relay.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { relay.request(DEFAULT_PROTECTED_TOOL, &cancel).await })
        };
        tokio::task::yield_now().await;
        relay.respond(response(PermissionDecision::AllowAlways));
        task.await.expect("join").expect("response");

        assert!(!relay.is_always_allowed(DEFAULT_PROTECTED_TOOL));
    }

    #[tokio::test]
    async fn cancelled_wait_parks_late_response() {
        let relay = relay();
        let cancel = CancellationToken::new();
        let wait = relay.begin_wait().expect("wait");
        cancel.cancel();
        assert_eq!(wait.wait(&cancel).await, Err(PermissionError::Cancelled));

        assert_eq!(
            relay.respond(response(PermissionDecision::AllowOnce)),
            Delivery::Parked
        );
    }
}
