//! Session Connector
//!
//! Drives a session from `Idle` to `Connected` (or `Failed`):
//!
//! ```text
//! connect_ssh ──▶ resolve chain ──▶ hop 1 ──▶ ... ──▶ target ──▶ PTY
//!                  │ (error / empty)                         │
//!                  └──▶ direct ──────────────────────────────┤
//!                                                            ▼
//!                               history + auto-forwards + ConnectionCompleted
//! ```
//!
//! Each live connection gets a lifecycle channel. A watcher task consumes its
//! first terminal event: SSH sessions surface `Disconnected` right away,
//! serial sessions go through the [`ReconnectSupervisor`] first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::history::{ConnectionHistory, HistoryEntry};
use super::lifecycle::{lifecycle_channel, LifecycleEvent, LifecycleMonitor, LifecyclePublisher};
use super::reconnect::{ReconnectConfig, ReconnectEvent, ReconnectOutcome, ReconnectSupervisor};
use super::registry::SessionRegistry;
use super::types::{SerialParams, Session, SessionId, SessionState, SessionTarget, TerminalSize};
use crate::forwarding::{ForwardStatus, PortForwardingLifecycle};
use crate::ssh::{
    connect_chain, ChainResolver, ConnectError, Connection, ConnectionChain, CredentialBook,
    HopCallbacks, HostKeyPrompt, KeyboardInteractivePrompt, SerialTransport, SshTarget,
    SshTransport, TofuVerifier, TrustStore,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events raised by the connector
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// A connect attempt finished
    Completed {
        session_id: SessionId,
        success: bool,
        error: Option<String>,
    },
    /// A connected session dropped and will not be recovered
    Disconnected {
        session_id: SessionId,
        reason: String,
    },
    /// Serial auto-reconnect progress
    Reconnecting(ReconnectEvent),
}

/// Collaborators the connector is wired with
pub struct ConnectorDeps {
    pub registry: Arc<SessionRegistry>,
    pub ssh: Arc<dyn SshTransport>,
    pub serial: Arc<dyn SerialTransport>,
    pub resolver: Arc<dyn ChainResolver>,
    pub credentials: Arc<CredentialBook>,
    pub trust_store: Arc<dyn TrustStore>,
    pub host_key_prompt: Arc<dyn HostKeyPrompt>,
    pub kbi_prompt: Arc<dyn KeyboardInteractivePrompt>,
    pub history: Arc<dyn ConnectionHistory>,
    pub forwarding: Arc<dyn PortForwardingLifecycle>,
    pub reconnect: ReconnectConfig,
    /// PTY size requested for new SSH terminals
    pub terminal_size: TerminalSize,
}

/// Lifecycle watcher of the current connection of a session
struct Watcher {
    generation: u64,
    publisher: LifecyclePublisher,
    stop: CancellationToken,
}

struct Inner {
    registry: Arc<SessionRegistry>,
    ssh: Arc<dyn SshTransport>,
    serial: Arc<dyn SerialTransport>,
    resolver: Arc<dyn ChainResolver>,
    credentials: Arc<CredentialBook>,
    callbacks: HopCallbacks,
    history: Arc<dyn ConnectionHistory>,
    forwarding: Arc<dyn PortForwardingLifecycle>,
    supervisor: ReconnectSupervisor,
    terminal_size: TerminalSize,
    events: broadcast::Sender<ConnectionEvent>,
    watchers: DashMap<SessionId, Watcher>,
    next_generation: AtomicU64,
}

/// Connection orchestrator, cheap to clone
#[derive(Clone)]
pub struct SessionConnector {
    inner: Arc<Inner>,
}

impl SessionConnector {
    pub fn new(deps: ConnectorDeps) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let reconnect_tx = events.clone();
        let supervisor = ReconnectSupervisor::new(deps.reconnect).with_event_sink(Arc::new(
            move |event| {
                let _ = reconnect_tx.send(ConnectionEvent::Reconnecting(event));
            },
        ));

        let callbacks = HopCallbacks {
            host_key: Arc::new(TofuVerifier::new(deps.trust_store, deps.host_key_prompt)),
            keyboard_interactive: deps.kbi_prompt,
        };

        Self {
            inner: Arc::new(Inner {
                registry: deps.registry,
                ssh: deps.ssh,
                serial: deps.serial,
                resolver: deps.resolver,
                credentials: deps.credentials,
                callbacks,
                history: deps.history,
                forwarding: deps.forwarding,
                supervisor,
                terminal_size: deps.terminal_size,
                events,
                watchers: DashMap::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn supervisor(&self) -> &ReconnectSupervisor {
        &self.inner.supervisor
    }

    /// Publisher for the session's current connection, for a terminal bridge
    /// that can also notice the connection ending
    pub fn lifecycle_publisher(&self, session_id: &SessionId) -> Option<LifecyclePublisher> {
        self.inner
            .watchers
            .get(session_id)
            .map(|w| w.publisher.clone())
    }

    /// Connect according to the session's target kind
    pub async fn connect(
        &self,
        session: &Arc<Session>,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectError> {
        match &session.target {
            SessionTarget::Ssh(_) => self.connect_ssh(session, cancel).await,
            SessionTarget::Serial(_) => self.connect_serial(session, cancel).await,
        }
    }

    /// Connect an SSH session, directly or through its proxy-jump chain
    pub async fn connect_ssh(
        &self,
        session: &Arc<Session>,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectError> {
        let SessionTarget::Ssh(target) = &session.target else {
            return Err(ConnectError::WrongSessionKind(session.id, "ssh"));
        };
        self.inner.begin(session).await?;

        info!(
            "Connecting session {} to {}",
            session.id,
            target.host.display_label()
        );

        let (publisher, monitor) = lifecycle_channel();
        let result = self.inner.establish_ssh(target, publisher.clone(), cancel).await;
        match result {
            Ok(connection) => {
                self.inner
                    .on_connected(session, connection, publisher, monitor, cancel)
                    .await;
                Ok(())
            }
            Err(e) => {
                self.inner.on_failed(session, &e).await;
                Err(e)
            }
        }
    }

    /// Open a serial session and remember its parameters for auto-reconnect
    pub async fn connect_serial(
        &self,
        session: &Arc<Session>,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectError> {
        let SessionTarget::Serial(params) = &session.target else {
            return Err(ConnectError::WrongSessionKind(session.id, "serial"));
        };
        self.inner.begin(session).await?;
        // A manual open supersedes any automatic retry still pending
        self.inner.supervisor.cancel(&session.id);

        info!("Opening serial session {} on {}", session.id, params.device);

        let (publisher, monitor) = lifecycle_channel();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            result = self.inner.serial.open(params, publisher.clone()) => result,
        };

        match opened {
            Ok(connection) => {
                let supervisor = &self.inner.supervisor;
                if supervisor.params(&session.id).as_ref() == Some(params) {
                    supervisor.reset_reconnect_attempts(&session.id);
                } else {
                    supervisor.register(session.id, params.clone());
                }
                self.inner
                    .on_connected(session, connection, publisher, monitor, cancel)
                    .await;
                Ok(())
            }
            Err(e) => {
                self.inner.on_failed(session, &e).await;
                Err(e)
            }
        }
    }

    /// Close the session's connection on request; not reported as a drop
    pub async fn disconnect(&self, session_id: &SessionId) -> Result<(), ConnectError> {
        let session = self
            .inner
            .registry
            .get(session_id)
            .ok_or(ConnectError::SessionNotFound(*session_id))?;

        info!("Disconnecting session {}", session_id);
        self.inner.supervisor.cancel(session_id);
        self.inner.release(&session).await;
        session.set_state(SessionState::Disconnected);
        Ok(())
    }

    /// Disconnect and forget the session
    pub async fn destroy_session(&self, session_id: &SessionId) {
        if let Some(session) = self.inner.registry.get(session_id) {
            self.inner.supervisor.unregister(session_id);
            self.inner.release(&session).await;
        }
        if self.inner.registry.remove(session_id).is_some() {
            info!("Session {} destroyed", session_id);
        }
    }
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Gate overlapping attempts and drop whatever the session still holds
    async fn begin(&self, session: &Arc<Session>) -> Result<(), ConnectError> {
        if !session.begin_connecting() {
            warn!("Session {} is already connecting", session.id);
            return Err(ConnectError::AlreadyConnecting(session.id));
        }
        self.release(session).await;
        Ok(())
    }

    async fn establish_ssh(
        &self,
        target: &SshTarget,
        publisher: LifecyclePublisher,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Connection>, ConnectError> {
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }

        let chain = match &target.proxy_jump {
            Some(profile) => {
                match self
                    .resolver
                    .resolve_chain(target, &self.credentials, cancel)
                    .await
                {
                    Ok(chain) if !chain.is_empty() => {
                        info!(
                            "Using proxy-jump profile '{}' ({} hop(s))",
                            profile,
                            chain.len()
                        );
                        chain
                    }
                    Ok(_) => {
                        debug!("Proxy-jump profile '{}' resolved to no hops", profile);
                        ConnectionChain::direct(target.host.clone())
                    }
                    Err(ConnectError::ChainResolution(reason)) => {
                        warn!("{}, falling back to direct connection", reason);
                        ConnectionChain::direct(target.host.clone())
                    }
                    Err(e) => return Err(e),
                }
            }
            None => ConnectionChain::direct(target.host.clone()),
        };

        connect_chain(
            self.ssh.as_ref(),
            &chain,
            &self.callbacks,
            self.terminal_size,
            publisher,
            cancel,
        )
        .await
    }

    async fn on_connected(
        self: &Arc<Self>,
        session: &Arc<Session>,
        connection: Arc<dyn Connection>,
        publisher: LifecyclePublisher,
        monitor: LifecycleMonitor,
        cancel: &CancellationToken,
    ) {
        self.attach(session, connection.clone(), publisher, monitor);

        self.history.record(HistoryEntry::success(session.host_id())).await;

        match self
            .forwarding
            .start_auto_forwardings(connection, session.id, session.host_id(), cancel)
            .await
        {
            Ok(handles) => {
                for handle in handles.iter().filter(|h| h.status == ForwardStatus::Error) {
                    warn!(
                        "Session {}: forward {} failed to start: {}",
                        session.id,
                        handle.rule_id,
                        handle.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            Err(e) => warn!(
                "Session {}: failed to start auto-forwards: {}",
                session.id, e
            ),
        }

        info!("Session {} connected", session.id);
        self.emit(ConnectionEvent::Completed {
            session_id: session.id,
            success: true,
            error: None,
        });
    }

    async fn on_failed(&self, session: &Session, error: &ConnectError) {
        let message = error.to_string();
        warn!("Session {} failed to connect: {}", session.id, message);

        session.set_state(SessionState::Failed {
            error: message.clone(),
        });
        self.history
            .record(HistoryEntry::failure(session.host_id(), &message))
            .await;
        self.emit(ConnectionEvent::Completed {
            session_id: session.id,
            success: false,
            error: Some(message),
        });
    }

    /// Store the connection on the session and start watching its lifecycle
    fn attach(
        self: &Arc<Self>,
        session: &Arc<Session>,
        connection: Arc<dyn Connection>,
        publisher: LifecyclePublisher,
        monitor: LifecycleMonitor,
    ) {
        if let Some(stale) = session.replace_connection(connection) {
            warn!("Session {}: closing superseded connection", session.id);
            tokio::spawn(async move { stale.close().await });
        }
        session.set_state(SessionState::Connected);

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let stop = CancellationToken::new();
        let previous = self.watchers.insert(
            session.id,
            Watcher {
                generation,
                publisher,
                stop: stop.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.stop.cancel();
        }

        tokio::spawn(watch(self.clone(), session.clone(), monitor, generation, stop));
    }

    /// Stop watching, close the connection and its forwards
    async fn release(&self, session: &Session) {
        if let Some((_, watcher)) = self.watchers.remove(&session.id) {
            watcher.stop.cancel();
        }
        if let Some(connection) = session.take_connection() {
            connection.close().await;
            self.stop_forwards(&session.id).await;
        }
    }

    async fn stop_forwards(&self, session_id: &SessionId) {
        match self
            .forwarding
            .stop_all_for_session(*session_id, &CancellationToken::new())
            .await
        {
            Ok(0) => {}
            Ok(count) => debug!("Session {}: stopped {} forward(s)", session_id, count),
            Err(e) => warn!("Session {}: failed to stop forwards: {}", session_id, e),
        }
    }

    /// First terminal lifecycle event of a connected session
    async fn on_drop(self: &Arc<Self>, session: Arc<Session>, event: LifecycleEvent) {
        warn!(
            "Session {} dropped ({}): {}",
            session.id, event.source, event.reason
        );

        if let Some(connection) = session.take_connection() {
            connection.close().await;
        }
        self.stop_forwards(&session.id).await;
        session.set_state(SessionState::Disconnected);

        let params = match &session.target {
            SessionTarget::Serial(params) => params.clone(),
            SessionTarget::Ssh(_) => {
                self.emit(ConnectionEvent::Disconnected {
                    session_id: session.id,
                    reason: event.reason,
                });
                return;
            }
        };

        let outcome = self
            .supervisor
            .handle_disconnect(session.id, |params: SerialParams| {
                let inner = self.clone();
                let session = session.clone();
                async move { inner.reopen_serial(&session, &params).await }
            })
            .await;

        match outcome {
            ReconnectOutcome::Reconnected { attempt } => {
                info!(
                    "Serial session {} on {} recovered after {} attempt(s)",
                    session.id, params.device, attempt
                );
            }
            ReconnectOutcome::GaveUp { notify: true } | ReconnectOutcome::NotRegistered => {
                self.emit(ConnectionEvent::Disconnected {
                    session_id: session.id,
                    reason: event.reason,
                });
            }
            ReconnectOutcome::GaveUp { notify: false }
            | ReconnectOutcome::AlreadyReconnecting
            | ReconnectOutcome::Cancelled => {
                debug!("Session {}: reconnect ended with {:?}", session.id, outcome);
            }
        }
    }

    /// One auto-reconnect attempt
    async fn reopen_serial(
        self: &Arc<Self>,
        session: &Arc<Session>,
        params: &SerialParams,
    ) -> Result<(), ConnectError> {
        if !self.registry.contains(&session.id) {
            return Err(ConnectError::SessionNotFound(session.id));
        }
        if !session.begin_reconnecting() {
            debug!(
                "Session {} is {:?}, skipping automatic reopen",
                session.id,
                session.state()
            );
            return Err(ConnectError::Cancelled);
        }

        let (publisher, monitor) = lifecycle_channel();
        match self.serial.open(params, publisher.clone()).await {
            Ok(connection) => {
                self.attach(session, connection, publisher, monitor);
                self.history.record(HistoryEntry::success(session.host_id())).await;
                Ok(())
            }
            Err(e) => {
                session.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }
}

async fn watch(
    inner: Arc<Inner>,
    session: Arc<Session>,
    mut monitor: LifecycleMonitor,
    generation: u64,
    stop: CancellationToken,
) {
    let event = tokio::select! {
        _ = stop.cancelled() => return,
        event = monitor.next_terminal() => event,
    };
    let Some(event) = event else {
        return;
    };

    // A newer connection may already own the slot
    let current = inner
        .watchers
        .remove_if(&session.id, |_, w| w.generation == generation)
        .is_some();
    if !current {
        debug!("Session {}: stale lifecycle event ignored", session.id);
        return;
    }

    inner.on_drop(session, event).await;
}
