//! Connection lifecycle channel
//!
//! Each live connection gets one channel. Everything that can notice the
//! connection ending (the channel task, the protocol bridge, the transport
//! keepalive) publishes to it; the consumer takes the first terminal event and
//! the [`DisconnectLatch`] swallows the rest, so one drop yields exactly one
//! "disconnected" signal however many sources report it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

/// One-shot latch: the first `trip` wins until `rearm`
#[derive(Debug, Default)]
pub struct DisconnectLatch {
    tripped: AtomicBool,
}

impl DisconnectLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// True only for the caller that flips the latch
    pub fn trip(&self) -> bool {
        self.tripped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn rearm(&self) {
        self.tripped.store(false, Ordering::Release);
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }
}

/// Who noticed the connection ending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectSource {
    /// Channel / session level (EOF, close, remote exit)
    Connection,
    /// Terminal bridge between the connection and the pane
    Bridge,
    /// Transport level (socket error, keepalive timeout)
    Transport,
}

impl fmt::Display for DisconnectSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectSource::Connection => "connection",
            DisconnectSource::Bridge => "bridge",
            DisconnectSource::Transport => "transport",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub source: DisconnectSource,
    pub reason: String,
}

/// Publishing half, cloned into every source
#[derive(Debug, Clone)]
pub struct LifecyclePublisher {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecyclePublisher {
    /// Report the connection as ended; a no-op once nobody is listening
    pub fn publish(&self, source: DisconnectSource, reason: impl Into<String>) {
        let event = LifecycleEvent {
            source,
            reason: reason.into(),
        };
        if self.tx.send(event).is_err() {
            debug!("Lifecycle monitor gone, dropping {} event", source);
        }
    }
}

/// Consuming half, owned by the connector's watcher task
#[derive(Debug)]
pub struct LifecycleMonitor {
    rx: mpsc::UnboundedReceiver<LifecycleEvent>,
    latch: DisconnectLatch,
}

impl LifecycleMonitor {
    /// First terminal event; later duplicates are drained and ignored.
    /// None once every publisher is gone without reporting anything new.
    pub async fn next_terminal(&mut self) -> Option<LifecycleEvent> {
        while let Some(event) = self.rx.recv().await {
            if self.latch.trip() {
                return Some(event);
            }
            debug!(
                "Ignoring duplicate disconnect from {}: {}",
                event.source, event.reason
            );
        }
        None
    }

    pub fn has_fired(&self) -> bool {
        self.latch.is_tripped()
    }
}

/// Create the lifecycle channel for one connection
pub fn lifecycle_channel() -> (LifecyclePublisher, LifecycleMonitor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        LifecyclePublisher { tx },
        LifecycleMonitor {
            rx,
            latch: DisconnectLatch::new(),
        },
    )
}
