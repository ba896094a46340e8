//! SSH transport implementation using russh

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::{ChannelMsg, Disconnect};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::config::{AuthMethod, HopDescriptor};
use super::error::ConnectError;
use super::prompt::{KbiPrompt, KeyboardInteractivePrompt, PromptSet};
use super::transport::{Connection, HopCallbacks, SshLink, SshTransport, TunnelStream};
use super::trust::{PresentedHostKey, TofuVerifier};
use crate::config::ConnectSettings;
use crate::session::{DisconnectSource, LifecyclePublisher, TerminalSize};

/// Upper bound on keyboard-interactive rounds from a single server
const MAX_KBI_ROUNDS: usize = 10;

/// Expand ~ to home directory for path normalization
/// This ensures paths like ~/... work correctly with russh::keys
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Client handler for russh callbacks
///
/// Host key verification goes through the attempt's [`TofuVerifier`], so a
/// rejected key aborts the handshake with `HostKeyRejected`.
pub struct ClientHandler {
    host_id: String,
    hostname: String,
    port: u16,
    verifier: Arc<TofuVerifier>,
}

impl ClientHandler {
    fn new(hop: &HopDescriptor, verifier: Arc<TofuVerifier>) -> Self {
        Self {
            host_id: hop.host_id.clone(),
            hostname: hop.hostname.clone(),
            port: hop.port,
            verifier,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = ConnectError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let presented = PresentedHostKey {
            host_id: self.host_id.clone(),
            hostname: self.hostname.clone(),
            port: self.port,
            algorithm: server_public_key.algorithm().as_str().to_string(),
            raw_key: server_public_key.public_key_bytes(),
        };
        self.verifier.verify(&presented).await?;
        Ok(true)
    }
}

/// Production [`SshTransport`]
#[derive(Debug, Clone)]
pub struct RusshTransport {
    timeout: Duration,
    keepalive_interval: Duration,
    keepalive_max: usize,
}

impl RusshTransport {
    pub fn new(settings: &ConnectSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.timeout_secs),
            keepalive_interval: Duration::from_secs(settings.keepalive_interval_secs),
            keepalive_max: settings.keepalive_max,
        }
    }

    fn client_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(self.keepalive_interval),
            keepalive_max: self.keepalive_max,
            ..Default::default()
        })
    }
}

impl Default for RusshTransport {
    fn default() -> Self {
        Self::new(&ConnectSettings::default())
    }
}

#[async_trait]
impl SshTransport for RusshTransport {
    async fn connect_hop(
        &self,
        hop: &HopDescriptor,
        tunnel: Option<TunnelStream>,
        callbacks: &HopCallbacks,
    ) -> Result<Box<dyn SshLink>, ConnectError> {
        let handler = ClientHandler::new(hop, callbacks.host_key.clone());
        let config = self.client_config();
        let addr = hop.address();

        let handshake = async {
            match tunnel {
                Some(stream) => {
                    info!("Connecting via stream to {} (SSH-over-SSH)", addr);
                    client::connect_stream(config, stream, handler).await
                }
                None => {
                    info!("Connecting to SSH server at {}", addr);
                    client::connect(config, (hop.hostname.as_str(), hop.port), handler).await
                }
            }
        };

        let mut handle = tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| ConnectError::Timeout(format!("Connection to {} timed out", addr)))??;

        debug!("SSH handshake with {} completed", addr);

        authenticate(&mut handle, hop, callbacks.keyboard_interactive.as_ref()).await?;

        info!("Authenticated to {}", hop.display_label());
        Ok(Box::new(RusshLink {
            label: hop.display_label(),
            handle,
        }))
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    hop: &HopDescriptor,
    kbi: &dyn KeyboardInteractivePrompt,
) -> Result<(), ConnectError> {
    let authenticated = match &hop.auth {
        AuthMethod::Password { password } => {
            debug!("Authenticating to {} with password", hop.hostname);
            handle
                .authenticate_password(&hop.username, password)
                .await
                .map_err(|e| ConnectError::AuthenticationFailed(e.to_string()))?
                .success()
        }
        AuthMethod::Key {
            key_path,
            passphrase,
        } => {
            let key_path = expand_tilde(key_path);
            debug!("Authenticating to {} with key: {}", hop.hostname, key_path);
            let key = russh::keys::load_secret_key(&key_path, passphrase.as_deref())?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(&hop.username, key_with_hash)
                .await
                .map_err(|e| ConnectError::AuthenticationFailed(e.to_string()))?
                .success()
        }
        AuthMethod::Certificate {
            key_path,
            cert_path,
            passphrase,
        } => {
            let key_path = expand_tilde(key_path);
            let cert_path = expand_tilde(cert_path);
            debug!("Authenticating to {} with certificate: {}", hop.hostname, cert_path);
            let key = russh::keys::load_secret_key(&key_path, passphrase.as_deref())?;
            let cert = russh::keys::load_openssh_certificate(&cert_path)
                .map_err(|e| ConnectError::Key(format!("Failed to load certificate: {}", e)))?;
            handle
                .authenticate_openssh_cert(&hop.username, Arc::new(key), cert)
                .await
                .map_err(|e| ConnectError::AuthenticationFailed(e.to_string()))?
                .success()
        }
        AuthMethod::KeyboardInteractive => {
            keyboard_interactive(handle, hop, kbi).await?;
            true
        }
    };

    if !authenticated {
        return Err(ConnectError::AuthenticationFailed(format!(
            "Authentication to {} rejected",
            hop.hostname
        )));
    }
    Ok(())
}

/// Keyboard-interactive loop: one prompt round per InfoRequest
async fn keyboard_interactive(
    handle: &mut Handle<ClientHandler>,
    hop: &HopDescriptor,
    kbi: &dyn KeyboardInteractivePrompt,
) -> Result<(), ConnectError> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(&hop.username, None::<String>)
        .await
        .map_err(|e| ConnectError::AuthenticationFailed(format!("KBI start failed: {}", e)))?;

    for round in 1..=MAX_KBI_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => {
                info!("KBI authentication to {} successful", hop.hostname);
                return Ok(());
            }
            KeyboardInteractiveAuthResponse::Failure { .. } => {
                return Err(ConnectError::AuthenticationFailed(
                    "Authentication rejected by server".to_string(),
                ));
            }
            KeyboardInteractiveAuthResponse::InfoRequest {
                name,
                instructions,
                prompts,
            } => {
                debug!(
                    "KBI round {} for {}: {} prompt(s)",
                    round,
                    hop.hostname,
                    prompts.len()
                );

                let set = PromptSet {
                    name,
                    instructions,
                    prompts: prompts
                        .iter()
                        .map(|p| KbiPrompt {
                            prompt: p.prompt.clone(),
                            echo: p.echo,
                        })
                        .collect(),
                };

                let mut answers = match kbi.respond(&set).await {
                    Some(answers) => Zeroizing::new(answers),
                    None => {
                        info!("KBI authentication to {} cancelled", hop.hostname);
                        return Err(ConnectError::AuthenticationCancelled);
                    }
                };

                if answers.len() != set.prompts.len() {
                    return Err(ConnectError::AuthenticationFailed(format!(
                        "Expected {} responses, got {}",
                        set.prompts.len(),
                        answers.len()
                    )));
                }

                // Handed over without a copy; only rejected answers are wiped here
                response = handle
                    .authenticate_keyboard_interactive_respond(std::mem::take(&mut *answers))
                    .await
                    .map_err(|e| {
                        ConnectError::AuthenticationFailed(format!("KBI respond failed: {}", e))
                    })?;
            }
        }
    }

    Err(ConnectError::AuthenticationFailed(format!(
        "Too many keyboard-interactive rounds from {}",
        hop.hostname
    )))
}

/// One authenticated russh session
pub struct RusshLink {
    label: String,
    handle: Handle<ClientHandler>,
}

#[async_trait]
impl SshLink for RusshLink {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn open_tunnel(&self, host: &str, port: u16) -> Result<TunnelStream, ConnectError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                ConnectError::Transport(format!(
                    "Failed to open tunnel to {}:{} from {}: {}",
                    host, port, self.label, e
                ))
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn open_terminal(
        &self,
        size: TerminalSize,
        lifecycle: LifecyclePublisher,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        let mut channel = self.handle.channel_open_session().await?;

        debug!("Channel opened on {}, requesting PTY", self.label);
        channel
            .request_pty(false, "xterm-256color", size.cols, size.rows, 0, 0, &[])
            .await
            .map_err(|e| ConnectError::Protocol(format!("PTY request failed: {}", e)))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| ConnectError::Protocol(format!("Shell request failed: {}", e)))?;

        info!("Interactive shell started on {}", self.label);

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<TerminalCommand>(1024);
        let (output_tx, _) = broadcast::channel::<Bytes>(1024);
        let alive = Arc::new(AtomicBool::new(true));

        let label = self.label.clone();
        let task_output = output_tx.clone();
        let task_alive = alive.clone();
        tokio::spawn(async move {
            let mut ended_by_peer: Option<(DisconnectSource, String)> = None;

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(TerminalCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to send data to {}: {}", label, e);
                                ended_by_peer = Some((DisconnectSource::Transport, e.to_string()));
                                break;
                            }
                        }
                        Some(TerminalCommand::Resize(size)) => {
                            if let Err(e) = channel.window_change(size.cols, size.rows, 0, 0).await {
                                warn!("Failed to resize PTY on {}: {}", label, e);
                            }
                        }
                        Some(TerminalCommand::Close) | None => {
                            debug!("Closing shell channel on {}", label);
                            let _ = channel.eof().await;
                            break;
                        }
                    },
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            let _ = task_output.send(Bytes::copy_from_slice(&data));
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                            let _ = task_output.send(Bytes::copy_from_slice(&data));
                        }
                        Some(ChannelMsg::Eof) => {
                            info!("SSH channel EOF on {}", label);
                            ended_by_peer = Some((DisconnectSource::Connection, "channel EOF".into()));
                            break;
                        }
                        Some(ChannelMsg::Close) => {
                            info!("SSH channel closed on {}", label);
                            ended_by_peer = Some((DisconnectSource::Connection, "channel closed".into()));
                            break;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            info!("Remote shell on {} exited with {}", label, exit_status);
                        }
                        Some(_) => {}
                        None => {
                            ended_by_peer = Some((DisconnectSource::Transport, "SSH session ended".into()));
                            break;
                        }
                    },
                }
            }

            task_alive.store(false, Ordering::Release);
            if let Some((source, reason)) = ended_by_peer {
                lifecycle.publish(source, reason);
            }
            debug!("Shell channel task for {} terminated", label);
        });

        Ok(Box::new(RusshTerminal {
            label: self.label.clone(),
            cmd_tx,
            output_tx,
            alive,
        }))
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "Session closed", "en")
            .await
        {
            debug!("Disconnect from {} failed: {}", self.label, e);
        }
    }
}

enum TerminalCommand {
    Data(Bytes),
    Resize(TerminalSize),
    Close,
}

/// PTY shell channel, driven by its own task
pub struct RusshTerminal {
    label: String,
    cmd_tx: mpsc::Sender<TerminalCommand>,
    output_tx: broadcast::Sender<Bytes>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for RusshTerminal {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn write(&self, data: Bytes) -> Result<(), ConnectError> {
        self.cmd_tx
            .send(TerminalCommand::Data(data))
            .await
            .map_err(|_| ConnectError::Transport(format!("Shell on {} is closed", self.label)))
    }

    async fn resize(&self, size: TerminalSize) -> Result<(), ConnectError> {
        self.cmd_tx
            .send(TerminalCommand::Resize(size))
            .await
            .map_err(|_| ConnectError::Transport(format!("Shell on {} is closed", self.label)))
    }

    fn subscribe_output(&self) -> broadcast::Receiver<Bytes> {
        self.output_tx.subscribe()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn close(&self) {
        let _ = self.cmd_tx.send(TerminalCommand::Close).await;
    }
}
