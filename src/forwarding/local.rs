//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through the
//! session's connection. Example: forward local:8888 -> remote_jupyter:8888

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ForwardHandle, ForwardRule, ForwardStatus, ForwardType, ForwardingError,
    PortForwardingLifecycle,
};
use crate::session::SessionId;
use crate::ssh::Connection;

/// How long `stop_all_for_session` waits for a listener task to wind down
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningForward {
    handle: ForwardHandle,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Starts a host's auto-start local forwards when a session connects
#[derive(Default)]
pub struct AutoForwarder {
    /// Rules keyed by host id
    rules: DashMap<String, Vec<ForwardRule>>,
    running: DashMap<SessionId, Vec<RunningForward>>,
}

impl AutoForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&self, host_id: impl Into<String>, rule: ForwardRule) {
        self.rules.entry(host_id.into()).or_default().push(rule);
    }

    pub fn rules_for(&self, host_id: &str) -> Vec<ForwardRule> {
        self.rules
            .get(host_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Forwards currently running for a session
    pub fn active_for(&self, session_id: &SessionId) -> Vec<ForwardHandle> {
        self.running
            .get(session_id)
            .map(|r| r.iter().map(|f| f.handle.clone()).collect())
            .unwrap_or_default()
    }

    async fn start_local(
        &self,
        connection: Arc<dyn Connection>,
        session_id: SessionId,
        rule: &ForwardRule,
    ) -> Result<RunningForward, ForwardingError> {
        let addr = rule.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ForwardingError::Bind {
                addr: addr.clone(),
                reason: match e.kind() {
                    std::io::ErrorKind::AddrInUse => "port already in use".to_string(),
                    std::io::ErrorKind::PermissionDenied => {
                        "ports below 1024 require elevated privileges".to_string()
                    }
                    _ => e.to_string(),
                },
            })?;
        let bound_addr = listener.local_addr()?;

        info!(
            "Started local port forward: {} -> {}:{}",
            bound_addr, rule.target_host, rule.target_port
        );

        let stop = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            connection,
            rule.target_host.clone(),
            rule.target_port,
            stop.clone(),
        ));

        Ok(RunningForward {
            handle: ForwardHandle {
                rule_id: rule.id.clone(),
                session_id,
                forward_type: ForwardType::Local,
                bound_addr: Some(bound_addr.to_string()),
                status: ForwardStatus::Active,
                error: None,
            },
            stop,
            task,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    connection: Arc<dyn Connection>,
    target_host: String,
    target_port: u16,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!("Forward connection from {}", peer);
                    tokio::spawn(bridge(
                        socket,
                        connection.clone(),
                        target_host.clone(),
                        target_port,
                        stop.child_token(),
                    ));
                }
                Err(e) => {
                    warn!("Accept failed on forward to {}:{}: {}", target_host, target_port, e);
                    break;
                }
            },
        }
    }
    debug!("Forward listener for {}:{} stopped", target_host, target_port);
}

async fn bridge(
    mut socket: TcpStream,
    connection: Arc<dyn Connection>,
    target_host: String,
    target_port: u16,
    stop: CancellationToken,
) {
    let mut tunnel = match connection.open_tunnel(&target_host, target_port).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            warn!("Failed to open tunnel to {}:{}: {}", target_host, target_port, e);
            return;
        }
    };

    tokio::select! {
        _ = stop.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut socket, &mut tunnel) => {
            match result {
                Ok((sent, received)) => debug!(
                    "Forward to {}:{} closed ({} bytes out, {} bytes in)",
                    target_host, target_port, sent, received
                ),
                Err(e) => debug!("Forward to {}:{} ended: {}", target_host, target_port, e),
            }
        }
    }
}

#[async_trait]
impl PortForwardingLifecycle for AutoForwarder {
    async fn start_auto_forwardings(
        &self,
        connection: Arc<dyn Connection>,
        session_id: SessionId,
        host_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ForwardHandle>, ForwardingError> {
        let rules: Vec<ForwardRule> = self
            .rules_for(host_id)
            .into_iter()
            .filter(|r| r.auto_start)
            .collect();
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            "Starting {} auto-start forward(s) for session {}",
            rules.len(),
            session_id
        );

        let mut handles = Vec::with_capacity(rules.len());
        for rule in &rules {
            if cancel.is_cancelled() {
                return Err(ForwardingError::Cancelled);
            }

            let started = match rule.forward_type {
                ForwardType::Local => self.start_local(connection.clone(), session_id, rule).await,
                other => Err(ForwardingError::Unsupported(other)),
            };

            match started {
                Ok(running) => {
                    handles.push(running.handle.clone());
                    self.running.entry(session_id).or_default().push(running);
                }
                Err(e) => {
                    warn!("Auto-start forward {} failed: {}", rule.id, e);
                    handles.push(ForwardHandle {
                        rule_id: rule.id.clone(),
                        session_id,
                        forward_type: rule.forward_type,
                        bound_addr: None,
                        status: ForwardStatus::Error,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        Ok(handles)
    }

    async fn stop_all_for_session(
        &self,
        session_id: SessionId,
        cancel: &CancellationToken,
    ) -> Result<usize, ForwardingError> {
        let Some((_, forwards)) = self.running.remove(&session_id) else {
            return Ok(0);
        };

        let count = forwards.len();
        info!("Stopping {} forward(s) for session {}", count, session_id);

        for forward in forwards {
            forward.stop.cancel();
            if cancel.is_cancelled() {
                continue;
            }
            if tokio::time::timeout(STOP_TIMEOUT, forward.task).await.is_err() {
                warn!(
                    "Timeout waiting for forward {} to stop",
                    forward.handle.rule_id
                );
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TerminalSize;
    use crate::ssh::{ConnectError, TunnelStream};
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::broadcast;

    /// Connection whose tunnels echo everything back
    struct EchoConnection;

    #[async_trait]
    impl Connection for EchoConnection {
        fn label(&self) -> String {
            "echo".into()
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
        async fn open_tunnel(&self, _host: &str, _port: u16) -> Result<TunnelStream, ConnectError> {
            let (local, remote) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(remote);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
            Ok(Box::new(local))
        }
        fn is_alive(&self) -> bool {
            true
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_auto_start_local_forward_round_trip() {
        let forwarder = AutoForwarder::new();
        forwarder.add_rule("web", ForwardRule::local("127.0.0.1", 0, "localhost", 8888).auto_start());
        forwarder.add_rule("web", ForwardRule::local("127.0.0.1", 0, "localhost", 9999));

        let session_id = SessionId::new();
        let cancel = CancellationToken::new();
        let handles = forwarder
            .start_auto_forwardings(Arc::new(EchoConnection), session_id, "web", &cancel)
            .await
            .unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].status, ForwardStatus::Active);

        let addr = handles[0].bound_addr.clone().unwrap();
        let mut client = TcpStream::connect(&addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(forwarder.stop_all_for_session(session_id, &cancel).await.unwrap(), 1);
        assert!(forwarder.active_for(&session_id).is_empty());
        assert_eq!(forwarder.stop_all_for_session(session_id, &cancel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_rule_reports_error_handle() {
        let forwarder = AutoForwarder::new();
        let mut rule = ForwardRule::local("127.0.0.1", 0, "localhost", 1080).auto_start();
        rule.forward_type = ForwardType::Dynamic;
        forwarder.add_rule("web", rule);

        let handles = forwarder
            .start_auto_forwardings(
                Arc::new(EchoConnection),
                SessionId::new(),
                "web",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(handles[0].status, ForwardStatus::Error);
        assert!(handles[0].error.is_some());
    }

    #[tokio::test]
    async fn test_unknown_host_starts_nothing() {
        let forwarder = AutoForwarder::new();
        let handles = forwarder
            .start_auto_forwardings(
                Arc::new(EchoConnection),
                SessionId::new(),
                "nobody",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(handles.is_empty());
    }
}
