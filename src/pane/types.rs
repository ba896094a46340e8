//! Pane layout data structures
//!
//! Nodes live in an arena owned by [`PaneTree`](super::PaneTree) and refer to
//! each other by [`PaneId`]. Containers own their two children by id, every
//! node stores its parent id as a plain (non-owning) back-reference.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// Default split ratio for new containers (50% to the first child)
pub const DEFAULT_SPLIT_RATIO: f64 = 0.5;

static NEXT_PANE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque arena address of a pane node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PaneId(u64);

impl PaneId {
    pub(crate) fn next() -> Self {
        Self(NEXT_PANE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pane-{}", self.0)
    }
}

/// Split orientation of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    /// Children stacked top/bottom
    Horizontal,
    /// Children side by side left/right
    Vertical,
}

/// Direction for keyboard focus navigation
///
/// Navigation walks a single cyclic ordering of leaves, so `Left`/`Up` both
/// mean "previous" and `Right`/`Down` both mean "next".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusDirection {
    Left,
    Right,
    Up,
    Down,
}

impl FocusDirection {
    pub(crate) fn is_backward(self) -> bool {
        matches!(self, FocusDirection::Left | FocusDirection::Up)
    }
}

/// A displayable pane
#[derive(Debug, Clone, PartialEq)]
pub struct LeafPane {
    pub id: PaneId,
    /// Session shown in this pane (None = empty placeholder pane)
    pub session: Option<SessionId>,
    pub is_focused: bool,
    /// Canonical (non-mirror) pane for its session
    pub is_primary_for_session: bool,
    /// False for hidden tabs and background panes
    pub is_visible: bool,
    pub parent: Option<PaneId>,
}

impl LeafPane {
    pub(crate) fn new(session: Option<SessionId>, is_primary: bool) -> Self {
        Self {
            id: PaneId::next(),
            session,
            is_focused: false,
            is_primary_for_session: is_primary,
            is_visible: true,
            parent: None,
        }
    }
}

/// A split divider owning exactly two children
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerPane {
    pub id: PaneId,
    pub orientation: Orientation,
    /// Share of space given to `first`, always in (0, 1)
    pub ratio: f64,
    pub first: PaneId,
    pub second: PaneId,
    pub parent: Option<PaneId>,
}

impl ContainerPane {
    /// The child that is not `child`
    pub fn sibling_of(&self, child: PaneId) -> PaneId {
        if self.first == child {
            self.second
        } else {
            self.first
        }
    }

    pub(crate) fn replace_child(&mut self, old: PaneId, new: PaneId) {
        if self.first == old {
            self.first = new;
        } else if self.second == old {
            self.second = new;
        }
    }
}

/// Arena node: either a leaf pane or a container
#[derive(Debug, Clone, PartialEq)]
pub enum PaneNode {
    Leaf(LeafPane),
    Container(ContainerPane),
}

impl PaneNode {
    pub fn id(&self) -> PaneId {
        match self {
            PaneNode::Leaf(leaf) => leaf.id,
            PaneNode::Container(container) => container.id,
        }
    }

    pub fn parent(&self) -> Option<PaneId> {
        match self {
            PaneNode::Leaf(leaf) => leaf.parent,
            PaneNode::Container(container) => container.parent,
        }
    }

    pub(crate) fn set_parent(&mut self, parent: Option<PaneId>) {
        match self {
            PaneNode::Leaf(leaf) => leaf.parent = parent,
            PaneNode::Container(container) => container.parent = parent,
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafPane> {
        match self {
            PaneNode::Leaf(leaf) => Some(leaf),
            PaneNode::Container(_) => None,
        }
    }

    pub(crate) fn as_leaf_mut(&mut self) -> Option<&mut LeafPane> {
        match self {
            PaneNode::Leaf(leaf) => Some(leaf),
            PaneNode::Container(_) => None,
        }
    }

    pub fn as_container(&self) -> Option<&ContainerPane> {
        match self {
            PaneNode::Container(container) => Some(container),
            PaneNode::Leaf(_) => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, PaneNode::Leaf(_))
    }
}
