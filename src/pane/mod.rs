//! Pane Layout Module
//!
//! Split / mirror / tabbed layout of terminal panes. Knows sessions only by
//! id and has no networking of its own.

mod events;
mod tree;
mod types;

pub use events::{LayoutEvent, LayoutEventEmitter};
pub use tree::{ClosedPane, LayoutError, Leaves, PaneTree};
pub use types::{
    ContainerPane, FocusDirection, LeafPane, Orientation, PaneId, PaneNode, DEFAULT_SPLIT_RATIO,
};
