//! Pane Tree - split/mirror/tab layout engine
//!
//! Two mutually exclusive layout modes share one node arena:
//!
//! ```text
//! tree mode                         tabbed mode
//! ┌─────────────────────────┐       ┌──────────────────────────┐
//! │ Container(Vertical)     │       │ tabs: [A] [B] [C]        │
//! │  ├── Leaf(A)            │       │        only one visible  │
//! │  └── Container(Horiz.)  │       │ root: None               │
//! │       ├── Leaf(B)       │       └──────────────────────────┘
//! │       └── Leaf(C)       │
//! │ background: [D] hidden  │
//! └─────────────────────────┘
//! ```
//!
//! Switching tabbed → tree keeps the other tabs as hidden background panes;
//! switching tree → tabbed brings them back, so no session is dropped while
//! toggling modes.
//!
//! The tree is not internally synchronized: one owner mutates it, and
//! [`LayoutEvent`]s are delivered synchronously from inside each mutation.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::events::{LayoutEvent, LayoutEventEmitter};
use super::types::{
    ContainerPane, FocusDirection, LeafPane, Orientation, PaneId, PaneNode, DEFAULT_SPLIT_RATIO,
};
use crate::session::SessionId;

/// Layout errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LayoutError {
    #[error("Layout already has a root pane")]
    RootExists,

    #[error("Pane not found: {0}")]
    PaneNotFound(PaneId),

    #[error("Pane {0} is not a leaf")]
    NotALeaf(PaneId),

    #[error("Pane {0} is not a container")]
    NotAContainer(PaneId),

    #[error("Pane {0} is hidden in the background")]
    PaneHidden(PaneId),

    #[error("Session {0} is not displayed in any pane")]
    SessionNotDisplayed(SessionId),

    #[error("Split ratio must be between 0 and 1 (exclusive), got {0}")]
    InvalidRatio(f64),

    #[error("Layout is empty")]
    EmptyLayout,
}

/// Outcome of [`PaneTree::close`]
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPane {
    pub pane: PaneId,
    pub session: Option<SessionId>,
    /// Whether another leaf still shows the closed pane's session
    pub session_still_displayed: bool,
}

/// Pane layout engine
#[derive(Debug, Default)]
pub struct PaneTree {
    nodes: HashMap<PaneId, PaneNode>,
    root: Option<PaneId>,
    /// Tabbed collection in insertion order
    tabs: Vec<PaneId>,
    active_tab: Option<PaneId>,
    /// Hidden leaves parked while in tree mode
    background: Vec<PaneId>,
    focused: Option<PaneId>,
    /// Ratio for new splits; None means [`DEFAULT_SPLIT_RATIO`]
    default_ratio: Option<f64>,
    events: LayoutEventEmitter,
}

impl PaneTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tree whose new splits start at `ratio` instead of an even split
    pub fn with_default_ratio(ratio: f64) -> Result<Self, LayoutError> {
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(LayoutError::InvalidRatio(ratio));
        }
        Ok(Self {
            default_ratio: Some(ratio),
            ..Self::default()
        })
    }

    /// Register a listener for layout and focus notifications
    pub fn subscribe(&mut self, listener: impl FnMut(&LayoutEvent) + Send + 'static) {
        self.events.subscribe(listener);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn root(&self) -> Option<PaneId> {
        self.root
    }

    pub fn focused(&self) -> Option<PaneId> {
        self.focused
    }

    pub fn node(&self, id: PaneId) -> Option<&PaneNode> {
        self.nodes.get(&id)
    }

    pub fn leaf(&self, id: PaneId) -> Option<&LeafPane> {
        self.nodes.get(&id).and_then(PaneNode::as_leaf)
    }

    /// Every node in the arena, in no particular order
    pub fn nodes(&self) -> impl Iterator<Item = &PaneNode> {
        self.nodes.values()
    }

    pub fn is_tabbed_mode(&self) -> bool {
        !self.tabs.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn tabbed_panes(&self) -> &[PaneId] {
        &self.tabs
    }

    pub fn active_tab(&self) -> Option<PaneId> {
        self.active_tab
    }

    pub fn background_panes(&self) -> &[PaneId] {
        &self.background
    }

    /// Lazy pre-order walk over the leaves reachable from the root
    ///
    /// Finite and restartable: every call starts a fresh walk. Empty in
    /// tabbed mode, where the root is absent.
    pub fn leaves(&self) -> Leaves<'_> {
        Leaves {
            nodes: &self.nodes,
            stack: self.root.into_iter().collect(),
        }
    }

    /// Number of leaves in the arena (tree, tabs and background)
    pub fn leaf_count(&self) -> usize {
        self.nodes.values().filter(|node| node.is_leaf()).count()
    }

    /// Leaves currently shown on screen
    pub fn visible_leaves(&self) -> Vec<PaneId> {
        if self.is_tabbed_mode() {
            self.active_tab.into_iter().collect()
        } else {
            self.leaves().map(|leaf| leaf.id).collect()
        }
    }

    /// All leaves showing `session`, wherever they live
    pub fn leaves_for_session(&self, session: SessionId) -> Vec<PaneId> {
        self.every_leaf()
            .filter(|id| self.leaf(*id).is_some_and(|leaf| leaf.session == Some(session)))
            .collect()
    }

    pub fn primary_leaf_for(&self, session: SessionId) -> Option<PaneId> {
        self.every_leaf().find(|id| {
            self.leaf(*id)
                .is_some_and(|leaf| leaf.session == Some(session) && leaf.is_primary_for_session)
        })
    }

    pub fn displays_session(&self, session: SessionId) -> bool {
        self.every_leaf()
            .any(|id| self.leaf(id).is_some_and(|leaf| leaf.session == Some(session)))
    }

    /// Distinct sessions shown by any leaf
    pub fn sessions(&self) -> HashSet<SessionId> {
        self.nodes
            .values()
            .filter_map(|node| node.as_leaf().and_then(|leaf| leaf.session))
            .collect()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Create the first leaf. Fails if a root (or tab set) already exists.
    pub fn create_root(&mut self, session: Option<SessionId>) -> Result<PaneId, LayoutError> {
        if self.root.is_some() || !self.tabs.is_empty() || !self.background.is_empty() {
            return Err(LayoutError::RootExists);
        }

        let primary = session.is_some_and(|s| !self.has_primary(s));
        let leaf = LeafPane::new(session, primary);
        let id = leaf.id;
        self.nodes.insert(id, PaneNode::Leaf(leaf));
        self.root = Some(id);
        debug!("Created root pane {}", id);

        self.focus_internal(Some(id));
        self.events.emit_layout_changed();
        self.events.emit_focus_changed(Some(id));
        Ok(id)
    }

    /// Drop every pane and return to the empty state
    pub fn reset(&mut self) {
        let had_focus = self.focused.is_some();
        self.nodes.clear();
        self.root = None;
        self.tabs.clear();
        self.active_tab = None;
        self.background.clear();
        self.focused = None;

        self.events.emit_layout_changed();
        if had_focus {
            self.events.emit_focus_changed(None);
        }
    }

    /// Split `leaf` and place a new leaf showing `session` beside it
    ///
    /// The new leaf takes focus. Splitting a tabbed pane first turns the tab
    /// set into a tree rooted at that pane; the other tabs become background
    /// panes.
    pub fn split(
        &mut self,
        leaf: PaneId,
        orientation: Orientation,
        session: Option<SessionId>,
    ) -> Result<PaneId, LayoutError> {
        self.prepare_split_target(leaf)?;

        let primary = session.is_some_and(|s| !self.has_primary(s));
        let new_id = self.insert_split(leaf, orientation, session, primary)?;
        debug!("Split {} ({:?}) -> new pane {}", leaf, orientation, new_id);

        self.focus_internal(Some(new_id));
        self.events.emit_layout_changed();
        self.events.emit_focus_changed(Some(new_id));
        Ok(new_id)
    }

    /// Split `leaf` with a second view of the same session
    ///
    /// The mirror is never primary. Returns `leaf` unchanged when it has no
    /// session.
    pub fn mirror(&mut self, leaf: PaneId, orientation: Orientation) -> Result<PaneId, LayoutError> {
        let Some(session) = self.require_leaf(leaf)?.session else {
            return Ok(leaf);
        };
        self.prepare_split_target(leaf)?;

        let new_id = self.insert_split(leaf, orientation, Some(session), false)?;
        debug!("Mirrored {} ({:?}) -> new pane {}", leaf, orientation, new_id);

        self.focus_internal(Some(new_id));
        self.events.emit_layout_changed();
        self.events.emit_focus_changed(Some(new_id));
        Ok(new_id)
    }

    /// Close a leaf
    ///
    /// - sole tab: the layout becomes empty
    /// - one of several tabs: removed; if it was active the most recently
    ///   added remaining tab becomes active
    /// - tree leaf: its sibling takes the parent's slot
    ///
    /// Primary status moves to another leaf of the same session, if any.
    pub fn close(&mut self, leaf: PaneId) -> Result<ClosedPane, LayoutError> {
        let closed = self.require_leaf(leaf)?.clone();
        let was_focused = self.focused == Some(leaf);
        let mut new_focus = self.focused;

        if let Some(pos) = self.tabs.iter().position(|&id| id == leaf) {
            self.tabs.remove(pos);
            self.nodes.remove(&leaf);

            if self.tabs.is_empty() {
                self.active_tab = None;
                new_focus = None;
            } else if self.active_tab == Some(leaf) {
                let next = *self.tabs.last().ok_or(LayoutError::EmptyLayout)?;
                self.show_tab(next);
                new_focus = Some(next);
            }
        } else if let Some(pos) = self.background.iter().position(|&id| id == leaf) {
            self.background.remove(pos);
            self.nodes.remove(&leaf);
        } else {
            self.nodes.remove(&leaf);

            match closed.parent {
                None => {
                    self.root = None;
                    new_focus = self.restore_from_background();
                }
                Some(parent_id) => {
                    let container = match self.nodes.remove(&parent_id) {
                        Some(PaneNode::Container(container)) => container,
                        Some(_) => return Err(LayoutError::NotAContainer(parent_id)),
                        None => return Err(LayoutError::PaneNotFound(parent_id)),
                    };
                    let sibling = container.sibling_of(leaf);
                    self.attach(sibling, container.parent, parent_id)?;

                    if was_focused {
                        let sibling_is_leaf = self.nodes.get(&sibling).is_some_and(PaneNode::is_leaf);
                        new_focus = if sibling_is_leaf {
                            Some(sibling)
                        } else {
                            self.leaves().next().map(|l| l.id)
                        };
                    }
                }
            }
        }
        debug!("Closed pane {}", leaf);

        if let (true, Some(session)) = (closed.is_primary_for_session, closed.session) {
            self.promote_primary(session);
        }

        let focus_changed = self.focus_internal(new_focus);
        self.events.emit_layout_changed();
        if focus_changed {
            self.events.emit_focus_changed(self.focused);
        }

        let session_still_displayed = closed.session.is_some_and(|s| self.displays_session(s));
        Ok(ClosedPane {
            pane: leaf,
            session: closed.session,
            session_still_displayed,
        })
    }

    /// Give focus to `leaf`; no-op if it already has it
    ///
    /// Focusing a hidden tab makes it the active tab.
    pub fn set_focused_pane(&mut self, leaf: PaneId) -> Result<(), LayoutError> {
        self.require_leaf(leaf)?;
        if self.background.contains(&leaf) {
            return Err(LayoutError::PaneHidden(leaf));
        }
        if self.focused == Some(leaf) {
            return Ok(());
        }

        if self.tabs.contains(&leaf) {
            self.show_tab(leaf);
        }
        self.focus_internal(Some(leaf));
        self.events.emit_layout_changed();
        self.events.emit_focus_changed(Some(leaf));
        Ok(())
    }

    /// Move focus to the previous/next leaf, wrapping at both ends
    ///
    /// The ordering is the pre-order leaf walk in tree mode and insertion
    /// order in tabbed mode; it is one-dimensional, so screen geometry is not
    /// considered.
    pub fn navigate_focus(&mut self, direction: FocusDirection) -> Option<PaneId> {
        let order: Vec<PaneId> = if self.is_tabbed_mode() {
            self.tabs.clone()
        } else {
            self.leaves().map(|leaf| leaf.id).collect()
        };
        if order.is_empty() {
            return None;
        }

        let len = order.len();
        let current = self
            .focused
            .and_then(|focused| order.iter().position(|&id| id == focused));
        let next_index = match current {
            None => 0,
            Some(i) if direction.is_backward() => (i + len - 1) % len,
            Some(i) => (i + 1) % len,
        };
        let target = order[next_index];

        if self.focused != Some(target) {
            if self.is_tabbed_mode() {
                self.show_tab(target);
            }
            self.focus_internal(Some(target));
            self.events.emit_layout_changed();
            self.events.emit_focus_changed(Some(target));
        }
        Some(target)
    }

    /// Append a new tab showing `session` and make it the active tab
    ///
    /// In tree mode every tree leaf (one per session) and every background
    /// pane first moves into the tab set and the tree is cleared.
    pub fn create_tabbed_pane(&mut self, session: SessionId) -> PaneId {
        if !self.is_tabbed_mode() {
            self.migrate_tree_to_tabs();
        }

        let primary = !self.has_primary(session);
        let leaf = LeafPane::new(Some(session), primary);
        let id = leaf.id;
        self.nodes.insert(id, PaneNode::Leaf(leaf));
        self.tabs.push(id);
        debug!("Created tabbed pane {} ({} tabs)", id, self.tabs.len());

        self.show_tab(id);
        self.focus_internal(Some(id));
        self.events.emit_layout_changed();
        self.events.emit_focus_changed(Some(id));
        id
    }

    /// Bring the pane showing `session` to the front
    ///
    /// In tabbed mode this toggles visibility so only that tab shows. In tree
    /// mode a session visible in the tree just gets focus; otherwise the
    /// layout switches to tabbed mode with that session's pane active.
    pub fn set_active_tabbed_session(&mut self, session: SessionId) -> Result<PaneId, LayoutError> {
        if !self.is_tabbed_mode() {
            if self.root.is_none() {
                return Err(LayoutError::EmptyLayout);
            }

            let in_tree = self
                .leaves()
                .find(|leaf| leaf.session == Some(session))
                .map(|leaf| leaf.id);
            if let Some(id) = in_tree {
                self.set_focused_pane(id)?;
                return Ok(id);
            }

            let in_background = self
                .background
                .iter()
                .any(|id| self.leaf(*id).is_some_and(|leaf| leaf.session == Some(session)));
            if !in_background {
                return Err(LayoutError::SessionNotDisplayed(session));
            }
            self.migrate_tree_to_tabs();
        }

        let target = self
            .tabs
            .iter()
            .copied()
            .find(|id| self.leaf(*id).is_some_and(|leaf| leaf.session == Some(session)))
            .ok_or(LayoutError::SessionNotDisplayed(session))?;

        self.show_tab(target);
        let focus_changed = self.focus_internal(Some(target));
        self.events.emit_layout_changed();
        if focus_changed {
            self.events.emit_focus_changed(Some(target));
        }
        Ok(target)
    }

    /// Change the share of space given to a container's first child
    pub fn set_split_ratio(&mut self, container: PaneId, ratio: f64) -> Result<(), LayoutError> {
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(LayoutError::InvalidRatio(ratio));
        }
        match self.nodes.get_mut(&container) {
            Some(PaneNode::Container(node)) => node.ratio = ratio,
            Some(_) => return Err(LayoutError::NotAContainer(container)),
            None => return Err(LayoutError::PaneNotFound(container)),
        }
        self.events.emit_layout_changed();
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn require_leaf(&self, id: PaneId) -> Result<&LeafPane, LayoutError> {
        match self.nodes.get(&id) {
            Some(PaneNode::Leaf(leaf)) => Ok(leaf),
            Some(PaneNode::Container(_)) => Err(LayoutError::NotALeaf(id)),
            None => Err(LayoutError::PaneNotFound(id)),
        }
    }

    fn leaf_mut(&mut self, id: PaneId) -> Option<&mut LeafPane> {
        self.nodes.get_mut(&id).and_then(PaneNode::as_leaf_mut)
    }

    /// Tree leaves, then tabs, then background panes
    fn every_leaf(&self) -> impl Iterator<Item = PaneId> + '_ {
        self.leaves()
            .map(|leaf| leaf.id)
            .chain(self.tabs.iter().copied())
            .chain(self.background.iter().copied())
    }

    fn has_primary(&self, session: SessionId) -> bool {
        self.primary_leaf_for(session).is_some()
    }

    fn promote_primary(&mut self, session: SessionId) {
        if self.has_primary(session) {
            return;
        }
        let heir = self
            .every_leaf()
            .find(|id| self.leaf(*id).is_some_and(|leaf| leaf.session == Some(session)));
        if let Some(heir) = heir {
            if let Some(leaf) = self.leaf_mut(heir) {
                leaf.is_primary_for_session = true;
                debug!("Pane {} is now primary for session {}", heir, session);
            }
        }
    }

    /// Move the focus flag; returns whether the focused pane changed
    fn focus_internal(&mut self, target: Option<PaneId>) -> bool {
        if self.focused == target {
            return false;
        }
        if let Some(old) = self.focused.and_then(|id| self.leaf_mut(id)) {
            old.is_focused = false;
        }
        if let Some(new) = target.and_then(|id| self.leaf_mut(id)) {
            new.is_focused = true;
        }
        self.focused = target;
        true
    }

    fn show_tab(&mut self, active: PaneId) {
        for id in self.tabs.clone() {
            if let Some(leaf) = self.leaf_mut(id) {
                leaf.is_visible = id == active;
            }
        }
        self.active_tab = Some(active);
    }

    /// Validate a split target, converting the tab set to a tree if needed
    fn prepare_split_target(&mut self, leaf: PaneId) -> Result<(), LayoutError> {
        self.require_leaf(leaf)?;
        if self.background.contains(&leaf) {
            return Err(LayoutError::PaneHidden(leaf));
        }
        if self.tabs.contains(&leaf) {
            self.convert_tabs_to_tree(leaf);
        }
        Ok(())
    }

    /// Replace `target` with a container holding `target` and a new leaf
    fn insert_split(
        &mut self,
        target: PaneId,
        orientation: Orientation,
        session: Option<SessionId>,
        primary: bool,
    ) -> Result<PaneId, LayoutError> {
        let parent = self
            .nodes
            .get(&target)
            .ok_or(LayoutError::PaneNotFound(target))?
            .parent();

        let container_id = PaneId::next();
        let mut new_leaf = LeafPane::new(session, primary);
        let new_id = new_leaf.id;
        new_leaf.parent = Some(container_id);

        let container = ContainerPane {
            id: container_id,
            orientation,
            ratio: self.default_ratio.unwrap_or(DEFAULT_SPLIT_RATIO),
            first: target,
            second: new_id,
            parent,
        };

        self.nodes.insert(container_id, PaneNode::Container(container));
        self.nodes.insert(new_id, PaneNode::Leaf(new_leaf));
        self.attach(container_id, parent, target)?;
        if let Some(node) = self.nodes.get_mut(&target) {
            node.set_parent(Some(container_id));
        }
        Ok(new_id)
    }

    /// Put `node` into the slot `previous` occupied under `parent` (or root)
    fn attach(
        &mut self,
        node: PaneId,
        parent: Option<PaneId>,
        previous: PaneId,
    ) -> Result<(), LayoutError> {
        match parent {
            Some(parent_id) => match self.nodes.get_mut(&parent_id) {
                Some(PaneNode::Container(container)) => container.replace_child(previous, node),
                Some(_) => return Err(LayoutError::NotAContainer(parent_id)),
                None => return Err(LayoutError::PaneNotFound(parent_id)),
            },
            None => self.root = Some(node),
        }
        self.nodes
            .get_mut(&node)
            .ok_or(LayoutError::PaneNotFound(node))?
            .set_parent(parent);
        Ok(())
    }

    /// Tabbed → tree: `chosen` becomes the root, the other tabs go to the
    /// background
    fn convert_tabs_to_tree(&mut self, chosen: PaneId) {
        let tabs = std::mem::take(&mut self.tabs);
        for id in tabs {
            if id == chosen {
                continue;
            }
            if let Some(leaf) = self.leaf_mut(id) {
                leaf.is_visible = false;
                leaf.parent = None;
            }
            self.background.push(id);
        }
        if let Some(leaf) = self.leaf_mut(chosen) {
            leaf.is_visible = true;
            leaf.parent = None;
        }
        self.root = Some(chosen);
        self.active_tab = None;
        debug!(
            "Converted tabs to tree rooted at {} ({} background panes)",
            chosen,
            self.background.len()
        );
    }

    /// Tree → tabbed: tree leaves and background panes become tabs, one per
    /// session; containers and redundant mirrors are discarded
    fn migrate_tree_to_tabs(&mut self) {
        let mut candidates: Vec<PaneId> = self.leaves().map(|leaf| leaf.id).collect();
        candidates.append(&mut self.background);

        let mut kept: Vec<PaneId> = Vec::with_capacity(candidates.len());
        let mut slot_by_session: HashMap<SessionId, usize> = HashMap::new();
        let mut dropped: Vec<PaneId> = Vec::new();

        for id in candidates {
            let Some(leaf) = self.leaf(id) else { continue };
            match leaf.session {
                None => kept.push(id),
                Some(session) => match slot_by_session.get(&session) {
                    None => {
                        slot_by_session.insert(session, kept.len());
                        kept.push(id);
                    }
                    Some(&slot) => {
                        if leaf.is_primary_for_session {
                            dropped.push(kept[slot]);
                            kept[slot] = id;
                        } else {
                            dropped.push(id);
                        }
                    }
                },
            }
        }

        for id in dropped {
            self.nodes.remove(&id);
        }
        self.nodes.retain(|_, node| node.is_leaf());
        for id in &kept {
            if let Some(leaf) = self.leaf_mut(*id) {
                leaf.parent = None;
                leaf.is_visible = false;
            }
        }
        self.root = None;
        self.tabs = kept;
        for session in slot_by_session.keys() {
            self.promote_primary(*session);
        }

        if self.focused.is_some_and(|id| !self.nodes.contains_key(&id)) {
            self.focused = None;
        }
        debug!("Migrated tree to {} tabs", self.tabs.len());
    }

    /// Make the most recently hidden background pane the root
    fn restore_from_background(&mut self) -> Option<PaneId> {
        let restored = self.background.pop()?;
        if let Some(leaf) = self.leaf_mut(restored) {
            leaf.is_visible = true;
            leaf.parent = None;
        }
        self.root = Some(restored);
        debug!("Restored background pane {} as root", restored);
        Some(restored)
    }
}

/// Pre-order leaf iterator, see [`PaneTree::leaves`]
pub struct Leaves<'a> {
    nodes: &'a HashMap<PaneId, PaneNode>,
    stack: Vec<PaneId>,
}

impl<'a> Iterator for Leaves<'a> {
    type Item = &'a LeafPane;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            match self.nodes.get(&id) {
                Some(PaneNode::Leaf(leaf)) => return Some(leaf),
                Some(PaneNode::Container(container)) => {
                    self.stack.push(container.second);
                    self.stack.push(container.first);
                }
                None => {}
            }
        }
        None
    }
}
