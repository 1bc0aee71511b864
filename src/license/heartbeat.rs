// LibriVault - Secure Reading for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Session heartbeat state machine
//!
//! While a title is open, the server expects a periodic liveness ping; the
//! answer is also its channel for pulling a session out from under us. This
//! module drives that loop as a small state machine:
//!
//! ```text
//! IDLE → ACTIVE → { ACTIVE | REVOKED | EXPIRED } → STOPPED
//! ```
//!
//! A revoked/forbidden answer is authoritative: the session moves to
//! `REVOKED` and no further ping is ever sent. Network failures are tolerated
//! up to a consecutive-failure budget, after which the session is declared
//! `EXPIRED` instead of hanging half-alive. `stop()` reaches `STOPPED` from
//! any state and is the deterministic teardown the session owner calls when
//! the viewer closes.
//!
//! State changes are published on a `watch` channel; the session owner
//! subscribes and tears down the decrypted content when a terminal state
//! appears.

use crate::api::LicenseApi;
use crate::error::{DrmError, Result};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Seconds between liveness pings
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Consecutive network failures tolerated before the session expires
const DEFAULT_FAILURE_BUDGET: u32 = 3;

/// Heartbeat loop tuning
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between pings
    pub interval: Duration,
    /// Consecutive failures after which the session is declared expired
    pub failure_budget: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            failure_budget: DEFAULT_FAILURE_BUDGET,
        }
    }
}

/// Lifecycle of one reading session's heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created but not started
    Idle,
    /// Pinging on schedule, session alive
    Active,
    /// Server revoked the session; terminal
    Revoked,
    /// Failure budget exhausted; terminal
    Expired,
    /// Torn down by the session owner
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
            Self::Stopped => "stopped",
        }
    }

    /// Server-decided end states that force content teardown
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Revoked | Self::Expired)
    }

    /// Whether the session can never become active again
    pub fn has_ended(&self) -> bool {
        matches!(self, Self::Revoked | Self::Expired | Self::Stopped)
    }

    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Active)
                | (Active, Revoked)
                | (Active, Expired)
                | (Idle, Stopped)
                | (Active, Stopped)
                | (Revoked, Stopped)
                | (Expired, Stopped)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Periodic liveness loop for one open reading session
///
/// # Example
/// ```rust,no_run
/// # use reader_core::license::{HeartbeatConfig, SessionHeartbeat};
/// # use reader_core::api::LicenseApi;
/// # use std::sync::Arc;
/// # async fn example(api: Arc<dyn LicenseApi>) -> reader_core::error::Result<()> {
/// let heartbeat = SessionHeartbeat::new(api, "42", "session-token", HeartbeatConfig::default());
/// let mut states = heartbeat.subscribe();
/// heartbeat.start()?;
/// // ... viewer is open ...
/// heartbeat.stop();
/// # Ok(())
/// # }
/// ```
pub struct SessionHeartbeat {
    api: Arc<dyn LicenseApi>,
    content_id: String,
    session_token: String,
    config: HeartbeatConfig,
    state: Arc<watch::Sender<SessionState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHeartbeat {
    pub fn new<S: Into<String>>(
        api: Arc<dyn LicenseApi>,
        content_id: S,
        session_token: S,
        config: HeartbeatConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            api,
            content_id: content_id.into(),
            session_token: session_token.into(),
            config,
            state: Arc::new(state),
            task: Mutex::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state changes
    ///
    /// The receiver sees every transition, including the terminal ones that
    /// require tearing down decrypted content.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Begin pinging: `IDLE → ACTIVE`
    ///
    /// # Errors
    /// Returns `InvalidState` if the heartbeat was already started or has
    /// ended.
    pub fn start(&self) -> Result<()> {
        if !advance(&self.state, SessionState::Active) {
            return Err(DrmError::InvalidState(format!(
                "heartbeat cannot start from {} state",
                self.state()
            )));
        }

        info!(content_id = %self.content_id, "heartbeat started");

        let api = Arc::clone(&self.api);
        let state = Arc::clone(&self.state);
        let content_id = self.content_id.clone();
        let session_token = self.session_token.clone();
        let interval = self.config.interval;
        let failure_budget = self.config.failure_budget;

        let handle = tokio::spawn(async move {
            let mut consecutive_failures: u32 = 0;

            loop {
                sleep(interval).await;
                if state.borrow().has_ended() {
                    break;
                }

                match api.send_heartbeat(&session_token).await {
                    Ok(_) => {
                        consecutive_failures = 0;
                        debug!(content_id = %content_id, "heartbeat acknowledged");
                    }
                    Err(e) if e.is_terminal() => {
                        warn!(content_id = %content_id, error = %e, "session revoked by server");
                        advance(&state, SessionState::Revoked);
                        break;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            content_id = %content_id,
                            error = %e,
                            failures = consecutive_failures,
                            budget = failure_budget,
                            "heartbeat failed"
                        );
                        if consecutive_failures >= failure_budget {
                            warn!(content_id = %content_id, "failure budget exhausted, session expired");
                            advance(&state, SessionState::Expired);
                            break;
                        }
                    }
                }
            }
        });

        *self.lock_task() = Some(handle);
        Ok(())
    }

    /// Tear down the loop: any state `→ STOPPED`
    ///
    /// Idempotent; safe to call after a terminal state. The ping task is
    /// cancelled so nothing keeps hitting the server for a closed viewer.
    pub fn stop(&self) {
        let moved = advance(&self.state, SessionState::Stopped);
        if let Some(handle) = self.lock_task().take() {
            handle.abort();
        }
        if moved {
            info!(content_id = %self.content_id, "heartbeat stopped");
        }
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for SessionHeartbeat {
    fn drop(&mut self) {
        // Last-resort cancellation for owners that never called stop()
        if let Some(handle) = self.lock_task().take() {
            handle.abort();
        }
    }
}

/// Apply a transition if the state machine allows it
fn advance(state: &watch::Sender<SessionState>, next: SessionState) -> bool {
    let mut moved = false;
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            *current = next;
            moved = true;
            true
        } else {
            false
        }
    });
    moved
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ContentDownload, HeartbeatResponse, ProgressFn};
    use crate::license::License;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// LicenseApi double with pre-scripted heartbeat outcomes
    struct ScriptedApi {
        heartbeats: StdMutex<VecDeque<Result<HeartbeatResponse>>>,
        calls: AtomicUsize,
    }

    impl ScriptedApi {
        fn with_heartbeats(outcomes: Vec<Result<HeartbeatResponse>>) -> Arc<Self> {
            Arc::new(Self {
                heartbeats: StdMutex::new(outcomes.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn ack() -> Result<HeartbeatResponse> {
        Ok(HeartbeatResponse {
            status: "ok".to_string(),
            server_time: None,
        })
    }

    fn network_failure() -> Result<HeartbeatResponse> {
        Err(DrmError::network("connection reset", true))
    }

    #[async_trait]
    impl LicenseApi for ScriptedApi {
        async fn request_license(&self, _: &str, _: &str, _: &str) -> Result<License> {
            Err(DrmError::internal("not scripted"))
        }

        async fn send_heartbeat(&self, _session_token: &str) -> Result<HeartbeatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.heartbeats
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(DrmError::internal("no scripted heartbeat left")))
        }

        async fn fetch_content(
            &self,
            _: &str,
            _: &str,
            _: Option<ProgressFn>,
        ) -> Result<ContentDownload> {
            Err(DrmError::internal("not scripted"))
        }
    }

    fn config(interval_secs: u64, budget: u32) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(interval_secs),
            failure_budget: budget,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_activates_session() {
        let api = ScriptedApi::with_heartbeats(vec![]);
        let heartbeat = SessionHeartbeat::new(api, "42", "abc", HeartbeatConfig::default());

        assert_eq!(heartbeat.state(), SessionState::Idle);
        heartbeat.start().unwrap();
        assert_eq!(heartbeat.state(), SessionState::Active);

        heartbeat.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_rejected() {
        let api = ScriptedApi::with_heartbeats(vec![]);
        let heartbeat = SessionHeartbeat::new(api, "42", "abc", HeartbeatConfig::default());

        heartbeat.start().unwrap();
        let err = heartbeat.start().unwrap_err();
        assert!(matches!(err, DrmError::InvalidState(_)));

        heartbeat.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_pings_keep_session_active() {
        let api = ScriptedApi::with_heartbeats(vec![ack(), ack(), ack()]);
        let heartbeat =
            SessionHeartbeat::new(Arc::clone(&api) as Arc<dyn LicenseApi>, "42", "abc", config(30, 3));

        heartbeat.start().unwrap();
        tokio::time::sleep(Duration::from_secs(95)).await;

        assert_eq!(heartbeat.state(), SessionState::Active);
        assert_eq!(api.calls(), 3);

        heartbeat.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_revocation_is_terminal_and_never_retried() {
        let api = ScriptedApi::with_heartbeats(vec![Err(DrmError::revoked("returned"))]);
        let heartbeat =
            SessionHeartbeat::new(Arc::clone(&api) as Arc<dyn LicenseApi>, "42", "abc", config(30, 3));

        heartbeat.start().unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(heartbeat.state(), SessionState::Revoked);

        // No further pings are ever scheduled
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(api.calls(), 1);
        assert_eq!(heartbeat.state(), SessionState::Revoked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_budget_expires_session() {
        let api = ScriptedApi::with_heartbeats(vec![
            network_failure(),
            network_failure(),
            network_failure(),
        ]);
        let heartbeat =
            SessionHeartbeat::new(Arc::clone(&api) as Arc<dyn LicenseApi>, "42", "abc", config(30, 3));

        heartbeat.start().unwrap();

        tokio::time::sleep(Duration::from_secs(65)).await;
        // Two failures in: still within budget
        assert_eq!(heartbeat.state(), SessionState::Active);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(heartbeat.state(), SessionState::Expired);
        assert_eq!(api.calls(), 3);

        // Terminal: no further pings
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_counter() {
        let api = ScriptedApi::with_heartbeats(vec![
            network_failure(),
            network_failure(),
            ack(),
            network_failure(),
            network_failure(),
            ack(),
        ]);
        let heartbeat =
            SessionHeartbeat::new(Arc::clone(&api) as Arc<dyn LicenseApi>, "42", "abc", config(30, 3));

        heartbeat.start().unwrap();
        tokio::time::sleep(Duration::from_secs(185)).await;

        // Never three consecutive failures, so never expired
        assert_eq!(heartbeat.state(), SessionState::Active);
        assert_eq!(api.calls(), 6);

        heartbeat.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pings() {
        let api = ScriptedApi::with_heartbeats(vec![ack(), ack(), ack(), ack()]);
        let heartbeat =
            SessionHeartbeat::new(Arc::clone(&api) as Arc<dyn LicenseApi>, "42", "abc", config(30, 3));

        heartbeat.start().unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(api.calls(), 1);

        heartbeat.stop();
        assert_eq!(heartbeat.state(), SessionState::Stopped);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_revocation_reaches_stopped() {
        let api = ScriptedApi::with_heartbeats(vec![Err(DrmError::revoked("recalled"))]);
        let heartbeat =
            SessionHeartbeat::new(Arc::clone(&api) as Arc<dyn LicenseApi>, "42", "abc", config(30, 3));

        heartbeat.start().unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(heartbeat.state(), SessionState::Revoked);

        heartbeat.stop();
        assert_eq!(heartbeat.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_observe_revocation() {
        let api = ScriptedApi::with_heartbeats(vec![Err(DrmError::revoked("recalled"))]);
        let heartbeat =
            SessionHeartbeat::new(Arc::clone(&api) as Arc<dyn LicenseApi>, "42", "abc", config(30, 3));
        let mut states = heartbeat.subscribe();

        heartbeat.start().unwrap();

        // Skip the Active notification, then wait for the terminal one
        loop {
            states.changed().await.unwrap();
            let state = *states.borrow();
            if state.is_terminal() {
                assert_eq!(state, SessionState::Revoked);
                break;
            }
        }
    }

    #[test]
    fn test_transition_rules() {
        use SessionState::*;

        assert!(Idle.can_transition_to(Active));
        assert!(Active.can_transition_to(Revoked));
        assert!(Active.can_transition_to(Expired));
        assert!(Active.can_transition_to(Stopped));
        assert!(Revoked.can_transition_to(Stopped));
        assert!(Expired.can_transition_to(Stopped));

        assert!(!Revoked.can_transition_to(Active));
        assert!(!Expired.can_transition_to(Active));
        assert!(!Stopped.can_transition_to(Active));
        assert!(!Idle.can_transition_to(Revoked));
        assert!(!Stopped.can_transition_to(Stopped));
    }
}
