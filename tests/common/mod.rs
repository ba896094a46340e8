//! Hand-written collaborators shared by the scenario tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use panemux::forwarding::{ForwardHandle, ForwardingError, PortForwardingLifecycle};
use panemux::session::{
    ConnectionEvent, ConnectorDeps, LifecyclePublisher, MemoryHistory, ReconnectConfig,
    SerialParams, SessionConnector, SessionId, SessionRegistry, TerminalSize,
};
use panemux::ssh::{
    AuthMethod, ConnectError, Connection, CredentialBook, HopCallbacks, HopDescriptor,
    HostKeyPrompt, HostKeyRequest, KbiPrompt, KeyboardInteractivePrompt, MemoryTrustStore,
    PresentedHostKey, ProfileChainResolver, PromptSet, SerialTransport, SshLink, SshTransport,
    TunnelStream,
};

pub const ALGORITHM: &str = "ssh-ed25519";

/// Raw host key every mock hop presents
pub fn host_key(host_id: &str) -> Vec<u8> {
    format!("key-{}", host_id).into_bytes()
}

pub fn hop(host_id: &str, auth: AuthMethod) -> HopDescriptor {
    HopDescriptor::new(host_id, format!("{}.internal", host_id), "ops", auth)
}

#[derive(Default)]
pub struct Journal(Mutex<Vec<String>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().iter().any(|e| e == entry)
    }
}

pub struct MockTerminal {
    label: String,
    alive: AtomicBool,
    journal: Arc<Journal>,
}

impl MockTerminal {
    pub fn new(label: impl Into<String>, journal: Arc<Journal>) -> Self {
        Self {
            label: label.into(),
            alive: AtomicBool::new(true),
            journal,
        }
    }
}

#[async_trait]
impl Connection for MockTerminal {
    fn label(&self) -> String {
        self.label.clone()
    }
    async fn write(&self, _data: Bytes) -> Result<(), ConnectError> {
        Ok(())
    }
    async fn resize(&self, _size: TerminalSize) -> Result<(), ConnectError> {
        Ok(())
    }
    fn subscribe_output(&self) -> broadcast::Receiver<Bytes> {
        broadcast::channel(1).1
    }
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.journal.push(format!("close terminal {}", self.label));
    }
}

pub type Publishers = Arc<Mutex<Vec<LifecyclePublisher>>>;

pub struct MockLink {
    host_id: String,
    journal: Arc<Journal>,
    publishers: Publishers,
}

#[async_trait]
impl SshLink for MockLink {
    fn label(&self) -> String {
        self.host_id.clone()
    }
    async fn open_tunnel(&self, host: &str, _port: u16) -> Result<TunnelStream, ConnectError> {
        self.journal.push(format!("tunnel {}->{}", self.host_id, host));
        Ok(Box::new(tokio::io::duplex(64).0))
    }
    async fn open_terminal(
        &self,
        _size: TerminalSize,
        lifecycle: LifecyclePublisher,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        self.journal.push(format!("terminal {}", self.host_id));
        self.publishers.lock().push(lifecycle);
        Ok(Box::new(MockTerminal::new(&self.host_id, self.journal.clone())))
    }
    async fn close(&self) {
        self.journal.push(format!("close {}", self.host_id));
    }
}

/// SSH transport that verifies host keys and runs keyboard-interactive
/// through the real callbacks
#[derive(Default)]
pub struct MockSsh {
    pub journal: Arc<Journal>,
    pub publishers: Publishers,
    /// Host whose handshake never completes
    pub hang_on: Mutex<Option<String>>,
    /// Host whose handshake fails at the transport level
    pub unreachable: Mutex<HashSet<String>>,
}

#[async_trait]
impl SshTransport for MockSsh {
    async fn connect_hop(
        &self,
        hop: &HopDescriptor,
        tunnel: Option<TunnelStream>,
        callbacks: &HopCallbacks,
    ) -> Result<Box<dyn SshLink>, ConnectError> {
        self.journal.push(format!(
            "connect {}{}",
            hop.host_id,
            if tunnel.is_some() { " (tunnelled)" } else { "" }
        ));

        if self.hang_on.lock().as_deref() == Some(hop.host_id.as_str()) {
            std::future::pending::<()>().await;
        }
        if self.unreachable.lock().contains(&hop.host_id) {
            return Err(ConnectError::Transport(format!(
                "{}: connection refused",
                hop.address()
            )));
        }

        callbacks
            .host_key
            .verify(&PresentedHostKey {
                host_id: hop.host_id.clone(),
                hostname: hop.hostname.clone(),
                port: hop.port,
                algorithm: ALGORITHM.into(),
                raw_key: host_key(&hop.host_id),
            })
            .await?;

        if let AuthMethod::KeyboardInteractive = hop.auth {
            let prompts = PromptSet {
                name: String::new(),
                instructions: "Two-factor authentication".into(),
                prompts: vec![KbiPrompt {
                    prompt: "Verification code: ".into(),
                    echo: false,
                }],
            };
            let answers = callbacks
                .keyboard_interactive
                .respond(&prompts)
                .await
                .ok_or(ConnectError::AuthenticationCancelled)?;
            if answers != ["123456"] {
                return Err(ConnectError::AuthenticationFailed("wrong code".into()));
            }
        }

        Ok(Box::new(MockLink {
            host_id: hop.host_id.clone(),
            journal: self.journal.clone(),
            publishers: self.publishers.clone(),
        }))
    }
}

#[derive(Default)]
pub struct MockSerial {
    pub journal: Arc<Journal>,
    pub opens: AtomicUsize,
    pub failing: AtomicBool,
    pub publishers: Publishers,
}

#[async_trait]
impl SerialTransport for MockSerial {
    async fn open(
        &self,
        params: &SerialParams,
        lifecycle: LifecyclePublisher,
    ) -> Result<Arc<dyn Connection>, ConnectError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectError::Transport(format!("{}: no such device", params.device)));
        }
        self.publishers.lock().push(lifecycle);
        Ok(Arc::new(MockTerminal::new(&params.device, self.journal.clone())))
    }
}

/// Prompt answers scripted per test
#[derive(Default)]
pub struct ScriptedPrompt {
    pub reject_hosts: Mutex<HashSet<String>>,
    pub host_key_calls: Mutex<Vec<String>>,
    pub kbi_answer: Mutex<Option<Vec<String>>>,
    pub kbi_calls: AtomicUsize,
}

#[async_trait]
impl HostKeyPrompt for ScriptedPrompt {
    async fn confirm_host_key(&self, request: &HostKeyRequest) -> bool {
        self.host_key_calls.lock().push(request.host_id.clone());
        !self.reject_hosts.lock().contains(&request.host_id)
    }
}

#[async_trait]
impl KeyboardInteractivePrompt for ScriptedPrompt {
    async fn respond(&self, _prompts: &PromptSet) -> Option<Vec<String>> {
        self.kbi_calls.fetch_add(1, Ordering::SeqCst);
        self.kbi_answer.lock().clone()
    }
}

/// Forwarding that always fails to start
pub struct BrokenForwarding;

#[async_trait]
impl PortForwardingLifecycle for BrokenForwarding {
    async fn start_auto_forwardings(
        &self,
        _connection: Arc<dyn Connection>,
        _session_id: SessionId,
        _host_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ForwardHandle>, ForwardingError> {
        Err(ForwardingError::Bind {
            addr: "127.0.0.1:8080".into(),
            reason: "port already in use".into(),
        })
    }

    async fn stop_all_for_session(
        &self,
        _session_id: SessionId,
        _cancel: &CancellationToken,
    ) -> Result<usize, ForwardingError> {
        Ok(0)
    }
}

pub struct Fixture {
    pub ssh: Arc<MockSsh>,
    pub serial: Arc<MockSerial>,
    pub trust: Arc<MemoryTrustStore>,
    pub prompt: Arc<ScriptedPrompt>,
    pub history: Arc<MemoryHistory>,
    pub credentials: Arc<CredentialBook>,
    pub resolver: ProfileChainResolver,
    pub forwarding: Arc<dyn PortForwardingLifecycle>,
}

impl Fixture {
    pub fn new() -> Self {
        let journal = Arc::new(Journal::default());
        Self {
            ssh: Arc::new(MockSsh {
                journal: journal.clone(),
                ..Default::default()
            }),
            serial: Arc::new(MockSerial {
                journal,
                ..Default::default()
            }),
            trust: Arc::new(MemoryTrustStore::new()),
            prompt: Arc::new(ScriptedPrompt::default()),
            history: Arc::new(MemoryHistory::default()),
            credentials: Arc::new(CredentialBook::new()),
            resolver: ProfileChainResolver::default(),
            forwarding: Arc::new(panemux::forwarding::NoForwarding),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.ssh.journal
    }

    pub fn connector(&self) -> SessionConnector {
        SessionConnector::new(ConnectorDeps {
            registry: Arc::new(SessionRegistry::new()),
            ssh: self.ssh.clone(),
            serial: self.serial.clone(),
            resolver: Arc::new(self.resolver.clone()),
            credentials: self.credentials.clone(),
            trust_store: self.trust.clone(),
            host_key_prompt: self.prompt.clone(),
            kbi_prompt: self.prompt.clone(),
            history: self.history.clone(),
            forwarding: self.forwarding.clone(),
            reconnect: ReconnectConfig {
                enabled: true,
                max_attempts: 3,
                delay_ms: 2000,
            },
            terminal_size: TerminalSize::default(),
        })
    }
}

/// Next `Disconnected` reason, or None if none arrives within `wait`
pub async fn next_disconnect(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    wait: Duration,
) -> Option<String> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(ConnectionEvent::Disconnected { reason, .. })) => return Some(reason),
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
}
