//! Serial Reconnection Module
//!
//! Bounded, fixed-delay recovery for serial sessions that drop while
//! connected. The attempt counter survives across disconnects: once it
//! reaches the maximum the supervisor stops retrying and reports the
//! disconnect (exactly once) until [`ReconnectSupervisor::reset_reconnect_attempts`]
//! is called, typically by the next manual connect.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lifecycle::DisconnectLatch;
use super::types::{SerialParams, SessionId};
use crate::ssh::ConnectError;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    /// Whether to enable automatic reconnection
    pub enabled: bool,
    /// Maximum number of reconnection attempts
    pub max_attempts: u32,
    /// Fixed delay before every attempt (ms)
    pub delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            delay_ms: 2000,
        }
    }
}

impl ReconnectConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Reconnection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReconnectState {
    /// Not attempting reconnection
    Idle = 0,
    /// Waiting before next attempt
    Waiting = 1,
    /// Currently attempting to reconnect
    Attempting = 2,
    /// Successfully reconnected
    Reconnected = 3,
    /// All attempts exhausted
    Failed = 4,
    /// Reconnection cancelled
    Cancelled = 5,
}

impl ReconnectState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Waiting,
            2 => Self::Attempting,
            3 => Self::Reconnected,
            4 => Self::Failed,
            5 => Self::Cancelled,
            _ => Self::Idle,
        }
    }
}

/// Events emitted during reconnection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconnectEvent {
    Starting {
        session_id: SessionId,
    },
    Waiting {
        session_id: SessionId,
        delay_ms: u64,
        attempt: u32,
    },
    Attempting {
        session_id: SessionId,
        attempt: u32,
        max_attempts: u32,
    },
    Success {
        session_id: SessionId,
        attempt: u32,
    },
    AttemptFailed {
        session_id: SessionId,
        attempt: u32,
        error: String,
    },
    /// All attempts exhausted
    Failed {
        session_id: SessionId,
        total_attempts: u32,
    },
    Cancelled {
        session_id: SessionId,
    },
}

/// Result of one [`ReconnectSupervisor::handle_disconnect`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Reconnected { attempt: u32 },
    /// No (further) retries; `notify` is true for the one caller that should
    /// surface the disconnect
    GaveUp { notify: bool },
    /// Another task is already reconnecting this session
    AlreadyReconnecting,
    Cancelled,
    NotRegistered,
}

pub type ReconnectEventSink = Arc<dyn Fn(ReconnectEvent) + Send + Sync>;

/// Per-session counters
struct SerialEntry {
    params: SerialParams,
    attempts: AtomicU32,
    state: AtomicU8,
    reconnecting: AtomicBool,
    disconnected: DisconnectLatch,
    cancel: Mutex<CancellationToken>,
}

impl SerialEntry {
    fn new(params: SerialParams) -> Self {
        Self {
            params,
            attempts: AtomicU32::new(0),
            state: AtomicU8::new(ReconnectState::Idle as u8),
            reconnecting: AtomicBool::new(false),
            disconnected: DisconnectLatch::new(),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    fn set_state(&self, state: ReconnectState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Clears the in-flight flag however the reconnect loop exits
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Reconnection supervisor for serial sessions
pub struct ReconnectSupervisor {
    config: RwLock<ReconnectConfig>,
    entries: DashMap<SessionId, Arc<SerialEntry>>,
    sink: Option<ReconnectEventSink>,
}

impl ReconnectSupervisor {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config: RwLock::new(config),
            entries: DashMap::new(),
            sink: None,
        }
    }

    /// Set event sink for monitoring reconnection progress
    pub fn with_event_sink(mut self, sink: ReconnectEventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> ReconnectConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: ReconnectConfig) {
        *self.config.write() = config;
    }

    /// Remember the parameters a serial session connected with
    pub fn register(&self, session_id: SessionId, params: SerialParams) {
        debug!("Registering serial session {} for reconnect", session_id);
        if let Some(old) = self
            .entries
            .insert(session_id, Arc::new(SerialEntry::new(params)))
        {
            old.cancel.lock().cancel();
        }
    }

    pub fn unregister(&self, session_id: &SessionId) {
        if let Some((_, entry)) = self.entries.remove(session_id) {
            entry.cancel.lock().cancel();
        }
    }

    pub fn is_registered(&self, session_id: &SessionId) -> bool {
        self.entries.contains_key(session_id)
    }

    pub fn params(&self, session_id: &SessionId) -> Option<SerialParams> {
        self.entries.get(session_id).map(|e| e.params.clone())
    }

    pub fn attempt_count(&self, session_id: &SessionId) -> u32 {
        self.entries
            .get(session_id)
            .map(|e| e.attempts.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn state(&self, session_id: &SessionId) -> ReconnectState {
        self.entries
            .get(session_id)
            .map(|e| ReconnectState::from_u8(e.state.load(Ordering::Acquire)))
            .unwrap_or(ReconnectState::Idle)
    }

    pub fn is_reconnecting(&self, session_id: &SessionId) -> bool {
        self.entries
            .get(session_id)
            .map(|e| e.reconnecting.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Re-enable auto-reconnect after exhaustion and rearm the disconnect latch
    pub fn reset_reconnect_attempts(&self, session_id: &SessionId) {
        if let Some(entry) = self.entries.get(session_id) {
            entry.attempts.store(0, Ordering::SeqCst);
            entry.disconnected.rearm();
            entry.set_state(ReconnectState::Idle);
            let mut cancel = entry.cancel.lock();
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
            debug!("Reconnect attempts reset for session {}", session_id);
        }
    }

    /// Stop any reconnect loop running for the session
    pub fn cancel(&self, session_id: &SessionId) {
        if let Some(entry) = self.entries.get(session_id) {
            info!("Cancelling reconnection for session {}", session_id);
            entry.cancel.lock().cancel();
        }
    }

    fn emit(&self, event: ReconnectEvent) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }

    fn give_up(&self, entry: &SerialEntry) -> ReconnectOutcome {
        ReconnectOutcome::GaveUp {
            notify: entry.disconnected.trip(),
        }
    }

    /// React to an unexpected drop of a serial session
    ///
    /// Retries `connect_fn` with the registered parameters after a fixed
    /// delay, while attempts remain. Only transport-level failures are
    /// retried.
    pub async fn handle_disconnect<F, Fut>(
        &self,
        session_id: SessionId,
        mut connect_fn: F,
    ) -> ReconnectOutcome
    where
        F: FnMut(SerialParams) -> Fut,
        Fut: Future<Output = Result<(), ConnectError>>,
    {
        let Some(entry) = self.entries.get(&session_id).map(|e| e.value().clone()) else {
            return ReconnectOutcome::NotRegistered;
        };

        if entry
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Session {}: reconnect already in flight", session_id);
            return ReconnectOutcome::AlreadyReconnecting;
        }
        let _in_flight = InFlight(&entry.reconnecting);

        let config = self.config();
        if !config.enabled {
            info!("Session {}: auto-reconnect disabled", session_id);
            return self.give_up(&entry);
        }

        let cancel = entry.cancel.lock().clone();
        let max_attempts = config.max_attempts;

        if entry.attempts.load(Ordering::SeqCst) < max_attempts {
            self.emit(ReconnectEvent::Starting { session_id });
        }

        while entry.attempts.load(Ordering::SeqCst) < max_attempts {
            let attempt = entry.attempts.fetch_add(1, Ordering::SeqCst) + 1;

            entry.set_state(ReconnectState::Waiting);
            self.emit(ReconnectEvent::Waiting {
                session_id,
                delay_ms: config.delay_ms,
                attempt,
            });
            info!(
                "Session {}: waiting {}ms before reconnect attempt {}/{}",
                session_id, config.delay_ms, attempt, max_attempts
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    entry.set_state(ReconnectState::Cancelled);
                    self.emit(ReconnectEvent::Cancelled { session_id });
                    return ReconnectOutcome::Cancelled;
                }
                _ = sleep(config.delay()) => {}
            }

            entry.set_state(ReconnectState::Attempting);
            self.emit(ReconnectEvent::Attempting {
                session_id,
                attempt,
                max_attempts,
            });
            info!(
                "Session {}: reconnection attempt {}/{}",
                session_id, attempt, max_attempts
            );

            match connect_fn(entry.params.clone()).await {
                Ok(()) => {
                    entry.attempts.store(0, Ordering::SeqCst);
                    entry.disconnected.rearm();
                    entry.set_state(ReconnectState::Reconnected);
                    self.emit(ReconnectEvent::Success {
                        session_id,
                        attempt,
                    });
                    info!(
                        "Session {}: reconnection successful on attempt {}",
                        session_id, attempt
                    );
                    return ReconnectOutcome::Reconnected { attempt };
                }
                Err(e) if cancel.is_cancelled() || matches!(e, ConnectError::Cancelled) => {
                    debug!("Session {}: reconnect attempt {} superseded: {}", session_id, attempt, e);
                    entry.set_state(ReconnectState::Cancelled);
                    self.emit(ReconnectEvent::Cancelled { session_id });
                    return ReconnectOutcome::Cancelled;
                }
                Err(e) => {
                    self.emit(ReconnectEvent::AttemptFailed {
                        session_id,
                        attempt,
                        error: e.to_string(),
                    });
                    warn!(
                        "Session {}: reconnection attempt {} failed: {}",
                        session_id, attempt, e
                    );
                    if !e.is_transport() {
                        break;
                    }
                }
            }
        }

        entry.set_state(ReconnectState::Failed);
        let total_attempts = entry.attempts.load(Ordering::SeqCst);
        let outcome = self.give_up(&entry);
        if let ReconnectOutcome::GaveUp { notify: true } = outcome {
            self.emit(ReconnectEvent::Failed {
                session_id,
                total_attempts,
            });
            error!(
                "Session {}: reconnection failed after {} attempts",
                session_id, total_attempts
            );
        }
        outcome
    }
}
