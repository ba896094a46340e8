//! Pane Orchestrator
//!
//! Binds layout intents to session work: "split" creates a pane and a
//! session and connects it, "close" tears the session down once no pane shows
//! it any more.
//!
//! Owned by a single task, like the [`PaneTree`] inside it.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LayoutSettings;
use crate::pane::{ClosedPane, FocusDirection, LayoutError, LayoutEvent, Orientation, PaneId, PaneTree};
use crate::session::{RegistryError, Session, SessionConnector, SessionId, SessionTarget};
use crate::ssh::ConnectError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Pane {0} has no session")]
    NoSession(PaneId),
}

/// Layout plus the connector it drives
pub struct PaneOrchestrator {
    tree: PaneTree,
    connector: SessionConnector,
    layout: LayoutSettings,
}

impl PaneOrchestrator {
    pub fn new(connector: SessionConnector, layout: LayoutSettings) -> Result<Self, LayoutError> {
        Ok(Self {
            tree: PaneTree::with_default_ratio(layout.default_split_ratio)?,
            connector,
            layout,
        })
    }

    pub fn tree(&self) -> &PaneTree {
        &self.tree
    }

    pub fn connector(&self) -> &SessionConnector {
        &self.connector
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&LayoutEvent) + Send + 'static) {
        self.tree.subscribe(listener);
    }

    /// Session shown by `pane`
    pub fn session_for(&self, pane: PaneId) -> Result<Arc<Session>, OrchestratorError> {
        let leaf = self.tree.leaf(pane).ok_or(LayoutError::PaneNotFound(pane))?;
        let session_id = leaf.session.ok_or(OrchestratorError::NoSession(pane))?;
        Ok(self.connector.registry().require(&session_id)?)
    }

    pub fn focused_session(&self) -> Option<Arc<Session>> {
        let pane = self.tree.focused()?;
        let session_id = self.tree.leaf(pane)?.session?;
        self.connector.registry().get(&session_id)
    }

    fn create_session(
        &self,
        target: Option<SessionTarget>,
    ) -> Result<Option<Arc<Session>>, OrchestratorError> {
        match target {
            Some(target) => Ok(Some(self.connector.registry().create(target)?)),
            None => Ok(None),
        }
    }

    /// Undo a session created for a layout change that failed
    async fn discard(&self, session: Option<Arc<Session>>) {
        if let Some(session) = session {
            self.connector.destroy_session(&session.id).await;
        }
    }

    /// First pane of an empty layout
    pub async fn create_root(
        &mut self,
        target: Option<SessionTarget>,
    ) -> Result<PaneId, OrchestratorError> {
        let session = self.create_session(target)?;
        match self.tree.create_root(session.as_ref().map(|s| s.id)) {
            Ok(pane) => Ok(pane),
            Err(e) => {
                self.discard(session).await;
                Err(e.into())
            }
        }
    }

    /// Split `pane`; the new pane gets a fresh session for `target`
    pub async fn split(
        &mut self,
        pane: PaneId,
        orientation: Orientation,
        target: Option<SessionTarget>,
    ) -> Result<PaneId, OrchestratorError> {
        let session = self.create_session(target)?;
        match self
            .tree
            .split(pane, orientation, session.as_ref().map(|s| s.id))
        {
            Ok(new_pane) => Ok(new_pane),
            Err(e) => {
                self.discard(session).await;
                Err(e.into())
            }
        }
    }

    /// Split `pane`, then connect the new pane's session
    ///
    /// A failed connect closes the new pane again and destroys its session.
    pub async fn split_and_connect(
        &mut self,
        pane: PaneId,
        orientation: Orientation,
        target: SessionTarget,
        cancel: &CancellationToken,
    ) -> Result<PaneId, OrchestratorError> {
        let new_pane = self.split(pane, orientation, Some(target)).await?;
        self.connect_or_close(new_pane, cancel).await?;
        Ok(new_pane)
    }

    /// Connect a freshly created pane, closing it again if that fails
    async fn connect_or_close(
        &mut self,
        pane: PaneId,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        if let Err(e) = self.connect(pane, cancel).await {
            warn!("Connect for new pane {} failed, closing it: {}", pane, e);
            if let Err(close_err) = self.close(pane).await {
                warn!("Failed to close pane {}: {}", pane, close_err);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Second view of the pane's session; no new session is created
    pub fn mirror(
        &mut self,
        pane: PaneId,
        orientation: Orientation,
    ) -> Result<PaneId, OrchestratorError> {
        Ok(self.tree.mirror(pane, orientation)?)
    }

    /// Close `pane`, destroying its session when nothing else shows it
    pub async fn close(&mut self, pane: PaneId) -> Result<ClosedPane, OrchestratorError> {
        let closed = self.tree.close(pane)?;
        if let (Some(session_id), false) = (closed.session, closed.session_still_displayed) {
            debug!("Session {} no longer displayed", session_id);
            self.connector.destroy_session(&session_id).await;
        }
        Ok(closed)
    }

    /// New tab with a fresh session for `target`
    pub fn open_tab(&mut self, target: SessionTarget) -> Result<PaneId, OrchestratorError> {
        let session = self.connector.registry().create(target)?;
        Ok(self.tree.create_tabbed_pane(session.id))
    }

    /// New tab, then connect its session; a failed connect closes the tab
    pub async fn open_tab_and_connect(
        &mut self,
        target: SessionTarget,
        cancel: &CancellationToken,
    ) -> Result<PaneId, OrchestratorError> {
        let pane = self.open_tab(target)?;
        self.connect_or_close(pane, cancel).await?;
        Ok(pane)
    }

    pub fn activate_tab(&mut self, session: SessionId) -> Result<PaneId, OrchestratorError> {
        Ok(self.tree.set_active_tabbed_session(session)?)
    }

    pub fn navigate(&mut self, direction: FocusDirection) -> Option<PaneId> {
        self.tree.navigate_focus(direction)
    }

    pub fn focus(&mut self, pane: PaneId) -> Result<(), OrchestratorError> {
        Ok(self.tree.set_focused_pane(pane)?)
    }

    /// Connect (or reconnect) the session shown by `pane`
    pub async fn connect(
        &self,
        pane: PaneId,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let session = self.session_for(pane)?;
        info!("Connecting pane {} (session {})", pane, session.id);
        Ok(self.connector.connect(&session, cancel).await?)
    }

    /// Divider drag; the ratio is clamped to the configured bounds
    pub fn resize_split(&mut self, container: PaneId, ratio: f64) -> Result<f64, OrchestratorError> {
        let clamped = self.layout.clamp_ratio(ratio);
        self.tree.set_split_ratio(container, clamped)?;
        Ok(clamped)
    }

    /// Clear the layout and destroy every session it showed
    pub async fn reset(&mut self) {
        let sessions = self.tree.sessions();
        self.tree.reset();
        for session_id in sessions {
            self.connector.destroy_session(&session_id).await;
        }
    }
}
