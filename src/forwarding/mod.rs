//! Port Forwarding Module
//!
//! The connector only needs two trigger points from forwarding: start the
//! auto-start rules once a session connects, and stop everything for a
//! session when it goes away. [`PortForwardingLifecycle`] is that seam;
//! [`AutoForwarder`] implements it for local (-L) forwards.

mod local;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::session::SessionId;
use crate::ssh::Connection;

pub use local::AutoForwarder;

/// Type of port forwarding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardType {
    /// Local port forwarding (-L)
    Local,
    /// Remote port forwarding (-R)
    Remote,
    /// Dynamic SOCKS proxy (-D)
    Dynamic,
}

/// Status of a port forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    Starting,
    Active,
    /// Forward has stopped (user requested or session closed)
    Stopped,
    Error,
}

/// Saved forward rule for a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRule {
    pub id: String,
    pub forward_type: ForwardType,
    /// Local bind address (local forward)
    pub bind_address: String,
    pub bind_port: u16,
    pub target_host: String,
    pub target_port: u16,
    /// Start as soon as a session to the host connects
    #[serde(default)]
    pub auto_start: bool,
    pub description: Option<String>,
}

impl ForwardRule {
    /// Create a local forward rule
    pub fn local(
        bind_address: impl Into<String>,
        bind_port: u16,
        target_host: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            forward_type: ForwardType::Local,
            bind_address: bind_address.into(),
            bind_port,
            target_host: target_host.into(),
            target_port,
            auto_start: false,
            description: None,
        }
    }

    pub fn auto_start(mut self) -> Self {
        self.auto_start = true;
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }
}

/// Running (or failed) forward started for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardHandle {
    pub rule_id: String,
    pub session_id: SessionId,
    pub forward_type: ForwardType,
    /// Actual bound address (may differ from requested if port was 0)
    pub bound_addr: Option<String>,
    pub status: ForwardStatus,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ForwardingError {
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("{0:?} forwarding is not supported here")]
    Unsupported(ForwardType),

    #[error("Forwarding cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Forwarding trigger points used by the session connector
#[async_trait]
pub trait PortForwardingLifecycle: Send + Sync {
    /// Start every auto-start rule of `host_id` on the new connection
    async fn start_auto_forwardings(
        &self,
        connection: Arc<dyn Connection>,
        session_id: SessionId,
        host_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ForwardHandle>, ForwardingError>;

    /// Stop every forward of the session; returns how many were stopped
    async fn stop_all_for_session(
        &self,
        session_id: SessionId,
        cancel: &CancellationToken,
    ) -> Result<usize, ForwardingError>;
}

/// Lifecycle that never forwards anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoForwarding;

#[async_trait]
impl PortForwardingLifecycle for NoForwarding {
    async fn start_auto_forwardings(
        &self,
        _connection: Arc<dyn Connection>,
        _session_id: SessionId,
        _host_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ForwardHandle>, ForwardingError> {
        Ok(Vec::new())
    }

    async fn stop_all_for_session(
        &self,
        _session_id: SessionId,
        _cancel: &CancellationToken,
    ) -> Result<usize, ForwardingError> {
        Ok(0)
    }
}
