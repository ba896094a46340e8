//! Proxy-jump chains
//!
//! Multi-hop connection tunnels each hop through the previous one:
//! ```text
//! Client --SSH--> [Jump1] --direct-tcpip--> [Jump2] --direct-tcpip--> ... --> [Target]
//! ```
//!
//! Hops connect strictly in order. If any hop fails, or the attempt is
//! cancelled, every hop already established is closed (last first) before
//! the error propagates.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{default_port, CredentialBook, HopDescriptor, HostId, SshTarget};
use super::error::ConnectError;
use super::transport::{
    close_links_reverse, ChainConnection, Connection, HopCallbacks, SshLink, SshTransport,
};
use crate::session::{LifecyclePublisher, TerminalSize};

/// Ordered hops of one connect attempt; the last hop is the real target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionChain {
    hops: Vec<HopDescriptor>,
}

impl ConnectionChain {
    pub fn new(hops: Vec<HopDescriptor>) -> Self {
        Self { hops }
    }

    /// Single-hop chain straight to the target
    pub fn direct(target: HopDescriptor) -> Self {
        Self { hops: vec![target] }
    }

    pub fn hops(&self) -> &[HopDescriptor] {
        &self.hops
    }

    pub fn target(&self) -> Option<&HopDescriptor> {
        self.hops.last()
    }

    /// Every hop before the target
    pub fn jumps(&self) -> &[HopDescriptor] {
        match self.hops.split_last() {
            Some((_, jumps)) => jumps,
            None => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }
}

/// Turns a target with a proxy-jump profile into a connection chain
///
/// An empty chain means "connect directly".
#[async_trait]
pub trait ChainResolver: Send + Sync {
    async fn resolve_chain(
        &self,
        target: &SshTarget,
        credentials: &CredentialBook,
        cancel: &CancellationToken,
    ) -> Result<ConnectionChain, ConnectError>;
}

/// Jump host entry of a proxy-jump profile; credentials come from the
/// [`CredentialBook`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpHost {
    pub host_id: HostId,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
}

impl JumpHost {
    pub fn new(
        host_id: impl Into<String>,
        hostname: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            hostname: hostname.into(),
            port: 22,
            username: username.into(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Resolves chains from named proxy-jump profiles
#[derive(Debug, Clone, Default)]
pub struct ProfileChainResolver {
    profiles: HashMap<String, Vec<JumpHost>>,
}

impl ProfileChainResolver {
    pub fn new(profiles: HashMap<String, Vec<JumpHost>>) -> Self {
        Self { profiles }
    }

    pub fn add_profile(&mut self, name: impl Into<String>, jumps: Vec<JumpHost>) {
        self.profiles.insert(name.into(), jumps);
    }
}

#[async_trait]
impl ChainResolver for ProfileChainResolver {
    async fn resolve_chain(
        &self,
        target: &SshTarget,
        credentials: &CredentialBook,
        cancel: &CancellationToken,
    ) -> Result<ConnectionChain, ConnectError> {
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }

        let Some(profile) = target.proxy_jump.as_deref() else {
            return Ok(ConnectionChain::default());
        };

        let jumps = self.profiles.get(profile).ok_or_else(|| {
            ConnectError::ChainResolution(format!("Unknown proxy-jump profile '{}'", profile))
        })?;

        if jumps.is_empty() {
            debug!("Proxy-jump profile '{}' has no hops", profile);
            return Ok(ConnectionChain::default());
        }

        let mut hops = Vec::with_capacity(jumps.len() + 1);
        for jump in jumps {
            let auth = credentials.get(&jump.host_id).ok_or_else(|| {
                ConnectError::ChainResolution(format!(
                    "No credentials for jump host '{}'",
                    jump.host_id
                ))
            })?;
            hops.push(HopDescriptor {
                host_id: jump.host_id.clone(),
                hostname: jump.hostname.clone(),
                port: jump.port,
                username: jump.username.clone(),
                auth,
            });
        }
        hops.push(target.host.clone());

        Ok(ConnectionChain::new(hops))
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, ConnectError>>,
) -> Result<T, ConnectError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ConnectError::Cancelled),
        result = fut => result,
    }
}

/// Connect every hop of `chain` in order and open a terminal on the last
pub async fn connect_chain(
    transport: &dyn SshTransport,
    chain: &ConnectionChain,
    callbacks: &HopCallbacks,
    size: TerminalSize,
    lifecycle: LifecyclePublisher,
    cancel: &CancellationToken,
) -> Result<Arc<dyn Connection>, ConnectError> {
    if chain.is_empty() {
        return Err(ConnectError::ChainResolution("Connection chain is empty".into()));
    }

    info!("Establishing SSH connection over {} hop(s)", chain.len());

    let mut links: Vec<Box<dyn SshLink>> = Vec::with_capacity(chain.len());
    match establish(transport, chain, callbacks, size, lifecycle, cancel, &mut links).await {
        Ok(terminal) => {
            info!("Target connection established");
            Ok(Arc::new(ChainConnection::new(terminal, links)))
        }
        Err(e) => {
            warn!(
                "Connection chain failed after {} hop(s): {}",
                links.len(),
                e
            );
            close_links_reverse(&links).await;
            Err(e)
        }
    }
}

async fn establish(
    transport: &dyn SshTransport,
    chain: &ConnectionChain,
    callbacks: &HopCallbacks,
    size: TerminalSize,
    lifecycle: LifecyclePublisher,
    cancel: &CancellationToken,
    links: &mut Vec<Box<dyn SshLink>>,
) -> Result<Box<dyn Connection>, ConnectError> {
    for (i, hop) in chain.hops().iter().enumerate() {
        let tunnel = match links.last() {
            Some(previous) => {
                debug!(
                    "Hop {}: opening tunnel to {} through {}",
                    i + 1,
                    hop.address(),
                    previous.label()
                );
                Some(cancellable(cancel, previous.open_tunnel(&hop.hostname, hop.port)).await?)
            }
            None => None,
        };

        info!("Hop {}: connecting to {}", i + 1, hop.display_label());
        let link = cancellable(cancel, transport.connect_hop(hop, tunnel, callbacks)).await?;
        links.push(link);
    }

    let target = links
        .last()
        .ok_or_else(|| ConnectError::Transport("No established hop".into()))?;
    cancellable(cancel, target.open_terminal(size, lifecycle)).await
}
