//! panemux - terminal pane multiplexer and session connection orchestrator
//!
//! Two engines:
//! - [`pane`]: split / mirror / tabbed pane layout with focus navigation
//! - [`session`] + [`ssh`]: connecting sessions directly or through
//!   proxy-jump chains, trust-on-first-use host keys, keyboard-interactive
//!   auth, and bounded auto-reconnect for serial lines
//!
//! [`orchestrator::PaneOrchestrator`] binds the two together.

pub mod config;
pub mod forwarding;
pub mod orchestrator;
pub mod pane;
pub mod session;
pub mod ssh;

pub use orchestrator::{OrchestratorError, PaneOrchestrator};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
///
/// Filter comes from `RUST_LOG`, defaulting to `info`. Safe to call more
/// than once; later calls are ignored.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
