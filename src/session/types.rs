//! Session Types and Data Structures

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ssh::{Connection, SshTarget};

/// Unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Initial terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u32,
    pub rows: u32,
}

impl TerminalSize {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

/// Serial line parameters, kept verbatim for reconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialParams {
    /// Device path (`/dev/ttyUSB0`, `COM3`)
    pub device: String,
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_flow_control")]
    pub flow_control: FlowControl,
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> Parity {
    Parity::None
}

fn default_stop_bits() -> u8 {
    1
}

fn default_flow_control() -> FlowControl {
    FlowControl::None
}

impl SerialParams {
    /// 8N1, no flow control
    pub fn new(device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            flow_control: default_flow_control(),
        }
    }
}

/// How a session reaches its remote end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    SshDirect,
    SshProxyChain,
    Serial,
}

/// Remote end of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionTarget {
    Ssh(SshTarget),
    Serial(SerialParams),
}

impl SessionTarget {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            SessionTarget::Ssh(target) if target.proxy_jump.is_some() => {
                ConnectionKind::SshProxyChain
            }
            SessionTarget::Ssh(_) => ConnectionKind::SshDirect,
            SessionTarget::Serial(_) => ConnectionKind::Serial,
        }
    }

    /// Trust-store / history key; serial targets use their device path
    pub fn host_id(&self) -> &str {
        match self {
            SessionTarget::Ssh(target) => &target.host.host_id,
            SessionTarget::Serial(params) => &params.device,
        }
    }

    pub fn display_label(&self) -> String {
        match self {
            SessionTarget::Ssh(target) => target.host.display_label(),
            SessionTarget::Serial(params) => format!("{}@{}", params.device, params.baud_rate),
        }
    }
}

/// Connection state of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    /// Dropped after being connected (unexpected or manual)
    Disconnected,
    Failed { error: String },
}

impl SessionState {
    /// Whether a new connect attempt may start from this state
    pub fn can_connect(&self) -> bool {
        !matches!(self, SessionState::Connecting | SessionState::Connected)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

static SESSION_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// A remote target plus its live connection
///
/// Shared as `Arc<Session>` between the registry, panes and the connector.
pub struct Session {
    pub id: SessionId,
    pub target: SessionTarget,
    /// Monotonically increasing creation sequence
    pub created_at: u64,
    state: RwLock<SessionState>,
    connection: RwLock<Option<Arc<dyn Connection>>>,
}

impl Session {
    pub fn new(target: SessionTarget) -> Self {
        Self {
            id: SessionId::new(),
            target,
            created_at: SESSION_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            state: RwLock::new(SessionState::Idle),
            connection: RwLock::new(None),
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.target.kind()
    }

    pub fn host_id(&self) -> &str {
        self.target.host_id()
    }

    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    /// Move to Connecting unless an attempt is already running
    pub(crate) fn begin_connecting(&self) -> bool {
        let mut state = self.state.write();
        if *state == SessionState::Connecting {
            return false;
        }
        *state = SessionState::Connecting;
        true
    }

    /// Claim a dropped session for an automatic retry
    ///
    /// Only a Disconnected session qualifies; a manual connect that already
    /// moved it on wins.
    pub(crate) fn begin_reconnecting(&self) -> bool {
        let mut state = self.state.write();
        if *state != SessionState::Disconnected {
            return false;
        }
        *state = SessionState::Connecting;
        true
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.read().clone()
    }

    /// Install `connection`, handing back whatever it displaced
    pub(crate) fn replace_connection(
        &self,
        connection: Arc<dyn Connection>,
    ) -> Option<Arc<dyn Connection>> {
        self.connection.write().replace(connection)
    }

    pub(crate) fn take_connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.write().take()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("created_at", &self.created_at)
            .field("state", &*self.state.read())
            .field("connected", &self.connection.read().is_some())
            .finish()
    }
}
