//! Session Management Module
//!
//! Provides:
//! - Session identity, target and connection state
//! - A registry of live sessions (DashMap, bounded)
//! - The connector that drives SSH / serial connects and watches for drops
//! - A single lifecycle channel per connection with duplicate suppression
//! - Bounded fixed-delay auto-reconnect for serial sessions
//! - Connection history

mod connector;
mod history;
mod lifecycle;
mod reconnect;
mod registry;
mod types;

pub use connector::{ConnectionEvent, ConnectorDeps, SessionConnector};
pub use history::{
    truncate_chars, ConnectionHistory, HistoryEntry, MemoryHistory, MAX_HISTORY_ERROR_CHARS,
};
pub use lifecycle::{
    lifecycle_channel, DisconnectLatch, DisconnectSource, LifecycleEvent, LifecycleMonitor,
    LifecyclePublisher,
};
pub use reconnect::{
    ReconnectConfig, ReconnectEvent, ReconnectEventSink, ReconnectOutcome, ReconnectState,
    ReconnectSupervisor,
};
pub use registry::{RegistryError, SessionRegistry};
pub use types::{
    ConnectionKind, FlowControl, Parity, SerialParams, Session, SessionId, SessionState,
    SessionTarget, TerminalSize,
};
