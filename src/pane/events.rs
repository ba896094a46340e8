//! Layout Event System
//!
//! Notifications raised by [`PaneTree`](super::PaneTree) mutations. Listeners
//! run synchronously on the mutating thread, in the order mutations occur.

use super::types::PaneId;

/// Layout notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutEvent {
    /// Any structural or visibility change
    LayoutChanged,
    /// Focus moved (None = nothing focused, layout empty)
    FocusedPaneChanged(Option<PaneId>),
}

type Listener = Box<dyn FnMut(&LayoutEvent) + Send>;

/// Synchronous fan-out of layout events
///
/// An emitter with no listeners (see [`LayoutEventEmitter::noop`]) drops
/// every event.
#[derive(Default)]
pub struct LayoutEventEmitter {
    listeners: Vec<Listener>,
}

impl LayoutEventEmitter {
    /// Emitter without listeners
    pub fn noop() -> Self {
        Self::default()
    }

    /// Register a listener; it receives every subsequent event
    pub fn subscribe(&mut self, listener: impl FnMut(&LayoutEvent) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn emit(&mut self, event: LayoutEvent) {
        for listener in self.listeners.iter_mut() {
            listener(&event);
        }
    }

    pub fn emit_layout_changed(&mut self) {
        self.emit(LayoutEvent::LayoutChanged);
    }

    pub fn emit_focus_changed(&mut self, pane: Option<PaneId>) {
        self.emit(LayoutEvent::FocusedPaneChanged(pane));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl std::fmt::Debug for LayoutEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayoutEventEmitter")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
