//! The tty routing tree.
//!
//! Two separate trees share one arena: the "no tty" pool, which holds every
//! connection that is not in tty mode, and the real tty tree. Both roots are
//! permanent. Other nodes are created along the path a connection enters
//! and pruned as soon as they have neither members nor children.
//!
//! Nodes refer to each other by [`NodeId`], so a `focus` naming a child that
//! has since been pruned simply resolves to nothing.

use std::collections::HashMap;

use crate::error::TreeError;

/// Stable connection identifier.
pub type ConnId = u64;

/// Priority given to connections that never set one.
pub const DEFAULT_PRIORITY: u32 = 50;

/// Priority meaning "never fill the display".
pub const DISABLED_PRIORITY: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug)]
struct TtyNode {
    number: u32,
    parent: Option<NodeId>,
    focus: Option<u32>,
    members: Vec<ConnId>,
    children: Vec<NodeId>,
}

impl TtyNode {
    fn new(number: u32, parent: Option<NodeId>) -> Self {
        Self {
            number,
            parent,
            focus: None,
            members: Vec::new(),
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Member {
    node: NodeId,
    priority: u32,
}

#[derive(Debug)]
pub struct TtyTree {
    nodes: HashMap<NodeId, TtyNode>,
    members: HashMap<ConnId, Member>,
    next_node: usize,
}

impl Default for TtyTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TtyTree {
    /// Root of the pool of connections outside tty mode.
    pub const NO_TTY: NodeId = NodeId(0);
    /// Root of the real tty tree.
    pub const TTY_ROOT: NodeId = NodeId(1);

    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(Self::NO_TTY, TtyNode::new(0, None));
        nodes.insert(Self::TTY_ROOT, TtyNode::new(0, None));
        Self {
            nodes,
            members: HashMap::new(),
            next_node: 2,
        }
    }

    /// Register a new connection in the "no tty" pool.
    pub fn attach(&mut self, conn: ConnId) {
        if self.members.contains_key(&conn) {
            return;
        }
        self.members.insert(
            conn,
            Member {
                node: Self::NO_TTY,
                priority: DEFAULT_PRIORITY,
            },
        );
        self.insert_sorted(Self::NO_TTY, conn, DEFAULT_PRIORITY);
    }

    /// Forget a connection entirely, pruning whatever it leaves empty.
    pub fn detach(&mut self, conn: ConnId) -> bool {
        let Some(member) = self.members.remove(&conn) else {
            return false;
        };
        self.unlink(member.node, conn);
        self.prune(member.node);
        true
    }

    /// Move a connection to the node at `path`, creating missing nodes.
    ///
    /// Entering the tty a connection already holds is a no-op; entering a
    /// different one is refused without touching the tree.
    pub fn enter(&mut self, conn: ConnId, path: &[u32]) -> Result<NodeId, TreeError> {
        let member = *self
            .members
            .get(&conn)
            .ok_or(TreeError::UnknownConnection)?;
        if member.node != Self::NO_TTY {
            return match self.lookup(path) {
                Some(node) if node == member.node => Ok(node),
                _ => Err(TreeError::AlreadyInTty),
            };
        }

        let mut node = Self::TTY_ROOT;
        for &number in path {
            node = match self.child(node, number) {
                Some(child) => child,
                None => self.create_child(node, number),
            };
        }

        self.unlink(Self::NO_TTY, conn);
        self.insert_sorted(node, conn, member.priority);
        if let Some(m) = self.members.get_mut(&conn) {
            m.node = node;
        }
        Ok(node)
    }

    /// Move a connection back to the "no tty" pool.
    pub fn leave(&mut self, conn: ConnId) -> Result<(), TreeError> {
        let member = *self
            .members
            .get(&conn)
            .ok_or(TreeError::UnknownConnection)?;
        if member.node == Self::NO_TTY {
            return Err(TreeError::NotInTty);
        }
        self.unlink(member.node, conn);
        self.insert_sorted(Self::NO_TTY, conn, member.priority);
        if let Some(m) = self.members.get_mut(&conn) {
            m.node = Self::NO_TTY;
        }
        self.prune(member.node);
        Ok(())
    }

    /// The tty a connection is in, if it is in tty mode.
    pub fn tty_of(&self, conn: ConnId) -> Option<NodeId> {
        self.members
            .get(&conn)
            .map(|m| m.node)
            .filter(|node| *node != Self::NO_TTY)
    }

    /// Set the focus of the connection's own tty.
    pub fn set_focus(&mut self, conn: ConnId, focus: u32) -> Result<(), TreeError> {
        let node = self.tty_of(conn).ok_or(TreeError::NotInTty)?;
        if let Some(n) = self.nodes.get_mut(&node) {
            n.focus = Some(focus);
        }
        Ok(())
    }

    /// Set which top-level tty is active.
    pub fn set_root_focus(&mut self, focus: Option<u32>) {
        if let Some(root) = self.nodes.get_mut(&Self::TTY_ROOT) {
            root.focus = focus;
        }
    }

    pub fn focus(&self, node: NodeId) -> Option<u32> {
        self.nodes.get(&node).and_then(|n| n.focus)
    }

    pub fn priority(&self, conn: ConnId) -> Option<u32> {
        self.members.get(&conn).map(|m| m.priority)
    }

    /// Change a connection's priority and move it to its new place in its
    /// node's list.
    pub fn set_priority(&mut self, conn: ConnId, priority: u32) -> Result<(), TreeError> {
        let member = self
            .members
            .get_mut(&conn)
            .ok_or(TreeError::UnknownConnection)?;
        member.priority = priority;
        let node = member.node;
        self.unlink(node, conn);
        self.insert_sorted(node, conn, priority);
        Ok(())
    }

    /// Find the connection that gets a key.
    ///
    /// Scans each node's members in priority order and stops at the first
    /// one `accepts` agrees to. If none does, continues into the focused
    /// child; an unset or stale focus ends the search.
    pub fn route(&self, mut accepts: impl FnMut(ConnId) -> bool) -> Option<ConnId> {
        let mut node = Self::TTY_ROOT;
        loop {
            let n = self.nodes.get(&node)?;
            if let Some(&conn) = n.members.iter().find(|&&c| accepts(c)) {
                return Some(conn);
            }
            node = n.focus.and_then(|f| self.child(node, f))?;
        }
    }

    /// Find the connection whose window is shown.
    ///
    /// Walks the focused path from the root. At each node the first member
    /// that is not disabled and for which `fills` holds is a candidate; the
    /// deepest candidate wins.
    pub fn filler(&self, mut fills: impl FnMut(ConnId) -> bool) -> Option<ConnId> {
        let mut node = Some(Self::TTY_ROOT);
        let mut found = None;
        while let Some(id) = node {
            let Some(n) = self.nodes.get(&id) else { break };
            let candidate = n.members.iter().copied().find(|&c| {
                self.priority(c).is_some_and(|p| p != DISABLED_PRIORITY) && fills(c)
            });
            if candidate.is_some() {
                found = candidate;
            }
            node = n.focus.and_then(|f| self.child(id, f));
        }
        found
    }

    /// Every connection in tty mode, in tree order.
    pub fn tty_members(&self) -> Vec<ConnId> {
        let mut out = Vec::new();
        self.collect(Self::TTY_ROOT, &mut out);
        out
    }

    /// Every registered connection, both roots included.
    pub fn all_members(&self) -> Vec<ConnId> {
        let mut out = Vec::new();
        self.collect(Self::NO_TTY, &mut out);
        self.collect(Self::TTY_ROOT, &mut out);
        out
    }

    /// Resolve a path without creating anything.
    pub fn lookup(&self, path: &[u32]) -> Option<NodeId> {
        path.iter()
            .try_fold(Self::TTY_ROOT, |node, &number| self.child(node, number))
    }

    /// Numbers from the tty root down to `node`.
    pub fn path(&self, node: NodeId) -> Vec<u32> {
        let mut path = Vec::new();
        let mut cur = node;
        while let Some(n) = self.nodes.get(&cur) {
            let Some(parent) = n.parent else { break };
            path.push(n.number);
            cur = parent;
        }
        path.reverse();
        path
    }

    pub fn members(&self, node: NodeId) -> &[ConnId] {
        self.nodes
            .get(&node)
            .map(|n| n.members.as_slice())
            .unwrap_or(&[])
    }

    /// Child numbers of a node, in creation order.
    pub fn children(&self, node: NodeId) -> Vec<u32> {
        self.nodes
            .get(&node)
            .map(|n| {
                n.children
                    .iter()
                    .filter_map(|c| self.nodes.get(c).map(|c| c.number))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn collect(&self, node: NodeId, out: &mut Vec<ConnId>) {
        if let Some(n) = self.nodes.get(&node) {
            out.extend_from_slice(&n.members);
            for child in &n.children {
                self.collect(*child, out);
            }
        }
    }

    fn child(&self, node: NodeId, number: u32) -> Option<NodeId> {
        self.nodes.get(&node)?.children.iter().copied().find(|c| {
            self.nodes
                .get(c)
                .is_some_and(|child| child.number == number)
        })
    }

    fn create_child(&mut self, parent: NodeId, number: u32) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        self.nodes.insert(id, TtyNode::new(number, Some(parent)));
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(id);
        }
        id
    }

    /// Insert before the first member with a strictly lower priority, so
    /// equal priorities keep arrival order.
    fn insert_sorted(&mut self, node: NodeId, conn: ConnId, priority: u32) {
        let members = &self.members;
        let Some(n) = self.nodes.get_mut(&node) else {
            return;
        };
        let pos = n
            .members
            .iter()
            .position(|c| members.get(c).is_some_and(|m| m.priority < priority))
            .unwrap_or(n.members.len());
        n.members.insert(pos, conn);
    }

    fn unlink(&mut self, node: NodeId, conn: ConnId) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.members.retain(|c| *c != conn);
        }
    }

    fn prune(&mut self, mut node: NodeId) {
        while node != Self::NO_TTY && node != Self::TTY_ROOT {
            let Some(n) = self.nodes.get(&node) else { return };
            if !n.members.is_empty() || !n.children.is_empty() {
                return;
            }
            let Some(parent) = n.parent else { return };
            self.nodes.remove(&node);
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.retain(|c| *c != node);
            }
            node = parent;
        }
    }
}
