//! User decisions needed mid-connect: host-key approval and
//! keyboard-interactive (2FA) answers
//!
//! The connector only sees the two prompt traits. [`PromptChannel`] is the
//! stock implementation: it turns each question into a [`PromptRequest`] on a
//! bounded channel and suspends the connecting task (not the UI loop) until
//! the receiving side replies or the timeout expires.
//!
//! ```text
//! connect task                              UI owner
//!    │                                         │
//!    │──── PromptRequest::HostKey ────────────▶│ show fingerprint
//!    │◀─── reply.send(true) ───────────────────│
//!    │                                         │
//!    │──── PromptRequest::KeyboardInteractive ▶│ show prompts
//!    │◀─── reply.send(Some(answers)) ──────────│
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Host key presented by a server that is not (or no longer) trusted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyRequest {
    pub host_id: String,
    pub hostname: String,
    pub port: u16,
    pub algorithm: String,
    pub fingerprint: String,
    #[serde(skip)]
    pub raw_key: Vec<u8>,
    /// Fingerprint previously trusted for this algorithm, if the key changed
    pub previous_fingerprint: Option<String>,
}

impl HostKeyRequest {
    pub fn is_key_change(&self) -> bool {
        self.previous_fingerprint.is_some()
    }
}

/// Keyboard-Interactive prompt from server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbiPrompt {
    /// The prompt text to display
    pub prompt: String,
    /// true = show input (echo), false = mask input (password-style)
    pub echo: bool,
}

/// One round of keyboard-interactive prompts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptSet {
    /// Display name from server (may be empty)
    pub name: String,
    /// Instructions from server (may be empty)
    pub instructions: String,
    pub prompts: Vec<KbiPrompt>,
}

/// Host-key verification callback
#[async_trait]
pub trait HostKeyPrompt: Send + Sync {
    /// true accepts and trusts the key, false fails the connection
    async fn confirm_host_key(&self, request: &HostKeyRequest) -> bool;
}

/// Keyboard-interactive authentication callback
#[async_trait]
pub trait KeyboardInteractivePrompt: Send + Sync {
    /// Answers in prompt order; None means the user cancelled
    async fn respond(&self, prompts: &PromptSet) -> Option<Vec<String>>;
}

/// One-shot reply slot for a [`PromptRequest`]
#[derive(Debug)]
pub struct PromptReply<T> {
    tx: oneshot::Sender<T>,
}

impl<T> PromptReply<T> {
    /// Deliver the answer; false if the connect attempt already gave up
    pub fn send(self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }
}

/// Question for the UI owner; dropping the reply counts as reject/cancel
#[derive(Debug)]
pub enum PromptRequest {
    HostKey {
        request: HostKeyRequest,
        reply: PromptReply<bool>,
    },
    KeyboardInteractive {
        prompts: PromptSet,
        reply: PromptReply<Option<Vec<String>>>,
    },
}

/// Channel-backed prompt broker
#[derive(Debug, Clone)]
pub struct PromptChannel {
    tx: mpsc::Sender<PromptRequest>,
    timeout: Duration,
}

impl PromptChannel {
    /// Create the broker and the receiver the UI owner drains
    pub fn new(capacity: usize, timeout: Duration) -> (Self, mpsc::Receiver<PromptRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, timeout }, rx)
    }

    async fn ask<T: Send>(
        &self,
        build: impl FnOnce(PromptReply<T>) -> PromptRequest + Send,
    ) -> Option<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = build(PromptReply { tx: reply_tx });

        if self.tx.send(request).await.is_err() {
            warn!("Prompt receiver is gone, treating prompt as declined");
            return None;
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_)) => {
                debug!("Prompt reply dropped without an answer");
                None
            }
            Err(_) => {
                warn!("No prompt answer within {}s", self.timeout.as_secs());
                None
            }
        }
    }
}

#[async_trait]
impl HostKeyPrompt for PromptChannel {
    async fn confirm_host_key(&self, request: &HostKeyRequest) -> bool {
        let request = request.clone();
        self.ask(|reply| PromptRequest::HostKey { request, reply })
            .await
            .unwrap_or(false)
    }
}

#[async_trait]
impl KeyboardInteractivePrompt for PromptChannel {
    async fn respond(&self, prompts: &PromptSet) -> Option<Vec<String>> {
        let prompts = prompts.clone();
        self.ask(|reply| PromptRequest::KeyboardInteractive { prompts, reply })
            .await
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_key_request() -> HostKeyRequest {
        HostKeyRequest {
            host_id: "web".into(),
            hostname: "web.example.com".into(),
            port: 22,
            algorithm: "ssh-ed25519".into(),
            fingerprint: "SHA256:abc".into(),
            raw_key: vec![1, 2, 3],
            previous_fingerprint: None,
        }
    }

    #[tokio::test]
    async fn test_host_key_answer_round_trip() {
        let (channel, mut rx) = PromptChannel::new(4, Duration::from_secs(5));

        let ui = tokio::spawn(async move {
            match rx.recv().await {
                Some(PromptRequest::HostKey { request, reply }) => {
                    assert_eq!(request.hostname, "web.example.com");
                    reply.send(true);
                }
                other => panic!("unexpected request: {:?}", other),
            }
        });

        assert!(channel.confirm_host_key(&host_key_request()).await);
        ui.await.unwrap();
    }

    #[tokio::test]
    async fn test_kbi_dropped_reply_is_cancellation() {
        let (channel, mut rx) = PromptChannel::new(1, Duration::from_secs(5));

        let ui = tokio::spawn(async move {
            if let Some(request) = rx.recv().await {
                drop(request);
            }
        });

        let prompts = PromptSet {
            prompts: vec![KbiPrompt {
                prompt: "Verification code: ".into(),
                echo: false,
            }],
            ..Default::default()
        };
        assert_eq!(channel.respond(&prompts).await, None);
        ui.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_rejects_host_key() {
        let (channel, _rx) = PromptChannel::new(1, Duration::from_millis(20));
        assert!(!channel.confirm_host_key(&host_key_request()).await);
    }

    #[tokio::test]
    async fn test_closed_receiver_rejects() {
        let (channel, rx) = PromptChannel::new(1, Duration::from_secs(5));
        drop(rx);
        assert!(!channel.confirm_host_key(&host_key_request()).await);
    }
}
