//! Transport seams
//!
//! The connector never talks to a socket directly. It drives an
//! [`SshTransport`] hop by hop and a [`SerialTransport`] for serial lines;
//! both hand back a [`Connection`] that the pane layer writes to.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::config::HopDescriptor;
use super::error::ConnectError;
use super::prompt::KeyboardInteractivePrompt;
use super::trust::TofuVerifier;
use crate::session::{LifecyclePublisher, SerialParams, TerminalSize};

/// Byte stream a hop can be tunnelled over
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// Callbacks applied at every hop of one connect attempt
#[derive(Clone)]
pub struct HopCallbacks {
    pub host_key: Arc<TofuVerifier>,
    pub keyboard_interactive: Arc<dyn KeyboardInteractivePrompt>,
}

/// Live terminal session: what a pane writes to and reads from
#[async_trait]
pub trait Connection: Send + Sync {
    fn label(&self) -> String;

    async fn write(&self, data: Bytes) -> Result<(), ConnectError>;

    async fn resize(&self, size: TerminalSize) -> Result<(), ConnectError>;

    /// Output stream (stdout and stderr merged)
    fn subscribe_output(&self) -> broadcast::Receiver<Bytes>;

    /// Open a `direct-tcpip` tunnel from the remote end, for port forwarding
    async fn open_tunnel(&self, host: &str, port: u16) -> Result<TunnelStream, ConnectError> {
        Err(ConnectError::Protocol(format!(
            "{} cannot open tunnels to {}:{}",
            self.label(),
            host,
            port
        )))
    }

    fn is_alive(&self) -> bool;

    /// Close without publishing a lifecycle event
    async fn close(&self);
}

/// One authenticated SSH hop
#[async_trait]
pub trait SshLink: Send + Sync {
    fn label(&self) -> String;

    /// Open a `direct-tcpip` channel to the next hop
    async fn open_tunnel(&self, host: &str, port: u16) -> Result<TunnelStream, ConnectError>;

    /// Request a PTY and shell on this hop; the spawned channel task reports
    /// its end through `lifecycle`
    async fn open_terminal(
        &self,
        size: TerminalSize,
        lifecycle: LifecyclePublisher,
    ) -> Result<Box<dyn Connection>, ConnectError>;

    async fn close(&self);
}

/// Establishes one SSH hop, directly or over the previous hop's tunnel
#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn connect_hop(
        &self,
        hop: &HopDescriptor,
        tunnel: Option<TunnelStream>,
        callbacks: &HopCallbacks,
    ) -> Result<Box<dyn SshLink>, ConnectError>;
}

/// Opens serial lines
#[async_trait]
pub trait SerialTransport: Send + Sync {
    async fn open(
        &self,
        params: &SerialParams,
        lifecycle: LifecyclePublisher,
    ) -> Result<Arc<dyn Connection>, ConnectError>;
}

/// Terminal on the final hop plus every hop it is tunnelled through
///
/// Keeps the jump links alive for as long as the terminal is; closing tears
/// down the terminal first and then each hop from the target back to the
/// first jump host.
pub struct ChainConnection {
    terminal: Box<dyn Connection>,
    /// [jump1, ..., jumpN, target]
    links: Vec<Box<dyn SshLink>>,
}

impl ChainConnection {
    pub fn new(terminal: Box<dyn Connection>, links: Vec<Box<dyn SshLink>>) -> Self {
        Self { terminal, links }
    }

    pub fn hop_count(&self) -> usize {
        self.links.len()
    }
}

#[async_trait]
impl Connection for ChainConnection {
    fn label(&self) -> String {
        self.terminal.label()
    }

    async fn write(&self, data: Bytes) -> Result<(), ConnectError> {
        self.terminal.write(data).await
    }

    async fn resize(&self, size: TerminalSize) -> Result<(), ConnectError> {
        self.terminal.resize(size).await
    }

    fn subscribe_output(&self) -> broadcast::Receiver<Bytes> {
        self.terminal.subscribe_output()
    }

    async fn open_tunnel(&self, host: &str, port: u16) -> Result<TunnelStream, ConnectError> {
        match self.links.last() {
            Some(target) => target.open_tunnel(host, port).await,
            None => Err(ConnectError::Transport("No established hop".into())),
        }
    }

    fn is_alive(&self) -> bool {
        self.terminal.is_alive()
    }

    async fn close(&self) {
        info!(
            "Closing {} ({} hop(s))",
            self.terminal.label(),
            self.links.len()
        );
        self.terminal.close().await;
        close_links_reverse(&self.links).await;
    }
}

/// Release hops last-established first
pub(crate) async fn close_links_reverse(links: &[Box<dyn SshLink>]) {
    for link in links.iter().rev() {
        debug!("Releasing hop {}", link.label());
        link.close().await;
    }
}
