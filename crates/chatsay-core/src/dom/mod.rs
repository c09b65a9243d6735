//! In-memory model of the host page.
//!
//! [`Document`] is the only surface the engine touches: element tree queries,
//! serialized markup, selector matching and mutation observation. Elements
//! are addressed by [`NodeId`]; a handle can go stale at any time, so callers
//! re-check [`Document::is_connected`] before acting on one.

mod markup;
mod mutation;
mod selector;

pub use markup::{parse_fragment, ParsedNode};
pub use mutation::{MutationKind, MutationObserver, MutationRecord, ObserveOptions};
pub use selector::Selector;

use crate::{ChatsayError, Result};
use chatsay_types::NodeId;
use markup::{escape_attribute, escape_text, VOID_ELEMENTS};
use selector::ElementView;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone)]
enum NodeKind {
    Element {
        tag: String,
        attributes: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

pub(crate) struct Tree {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    body: NodeId,
    next_id: u64,
    next_observer_id: u64,
    registrations: Vec<mutation::Registration>,
}

pub(crate) fn read_tree(lock: &RwLock<Tree>) -> RwLockReadGuard<'_, Tree> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_tree(lock: &RwLock<Tree>) -> RwLockWriteGuard<'_, Tree> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Tree {
    fn alloc(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                kind,
                parent: None,
                children: Vec::new(),
            },
        );
        id
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(ChatsayError::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or(ChatsayError::NodeNotFound(id))
    }

    fn ensure_element(&self, id: NodeId) -> Result<()> {
        match self.node(id)?.kind {
            NodeKind::Element { .. } => Ok(()),
            NodeKind::Text(_) => Err(ChatsayError::NotAnElement(id)),
        }
    }

    fn is_connected(&self, id: NodeId) -> bool {
        let mut current = id;
        loop {
            if current == self.root {
                return true;
            }
            match self.nodes.get(&current).and_then(|n| n.parent) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    /// Unlink `id` from its parent, returning the former parent.
    fn detach(&mut self, id: NodeId) -> Option<NodeId> {
        let parent = self.nodes.get_mut(&id)?.parent.take()?;
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.retain(|c| *c != id);
        }
        Some(parent)
    }

    fn link(&mut self, parent: NodeId, child: NodeId, index: usize) {
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            let index = index.min(parent_node.children.len());
            parent_node.children.insert(index, child);
        }
        if let Some(child_node) = self.nodes.get_mut(&child) {
            child_node.parent = Some(parent);
        }
    }

    /// Materialize a parsed fragment node as a detached subtree.
    fn build(&mut self, parsed: ParsedNode) -> NodeId {
        match parsed {
            ParsedNode::Text(text) => self.alloc(NodeKind::Text(text)),
            ParsedNode::Element {
                tag,
                attributes,
                children,
            } => {
                let id = self.alloc(NodeKind::Element { tag, attributes });
                for (index, child) in children.into_iter().enumerate() {
                    let child_id = self.build(child);
                    self.link(id, child_id, index);
                }
                id
            }
        }
    }

    fn element_children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&id)
            .map(|n| {
                n.children
                    .iter()
                    .copied()
                    .filter(|c| {
                        matches!(
                            self.nodes.get(c).map(|n| &n.kind),
                            Some(NodeKind::Element { .. })
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Element descendants of `scope` in document order, excluding `scope`.
    fn descendants(&self, scope: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.element_children(scope).into_iter().rev().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.element_children(id).into_iter().rev());
        }
        out
    }

    fn text_content(&self, id: NodeId, out: &mut String) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        match &node.kind {
            NodeKind::Text(text) => out.push_str(text),
            NodeKind::Element { .. } => {
                for child in &node.children {
                    self.text_content(*child, out);
                }
            }
        }
    }

    fn serialize(&self, id: NodeId, out: &mut String) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        match &node.kind {
            NodeKind::Text(text) => out.push_str(&escape_text(text)),
            NodeKind::Element { tag, attributes } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attributes {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&escape_attribute(value));
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&tag.as_str()) {
                    return;
                }
                for child in &node.children {
                    self.serialize(*child, out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }
}

impl ElementView for Tree {
    fn tag_of(&self, node: NodeId) -> Option<&str> {
        match &self.nodes.get(&node)?.kind {
            NodeKind::Element { tag, .. } => Some(tag),
            NodeKind::Text(_) => None,
        }
    }

    fn attribute_of(&self, node: NodeId, name: &str) -> Option<&str> {
        match &self.nodes.get(&node)?.kind {
            NodeKind::Element { attributes, .. } => attributes
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str()),
            NodeKind::Text(_) => None,
        }
    }

    fn parent_element_of(&self, node: NodeId) -> Option<NodeId> {
        let parent = self.nodes.get(&node)?.parent?;
        self.tag_of(parent).map(|_| parent)
    }
}

/// Shared handle to the page's element tree.
#[derive(Clone)]
pub struct Document {
    tree: Arc<RwLock<Tree>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tree = self.read();
        f.debug_struct("Document")
            .field("nodes", &tree.nodes.len())
            .field("observers", &tree.registrations.len())
            .finish()
    }
}

impl Document {
    /// An empty `<html><body></body></html>` document.
    pub fn new() -> Self {
        let mut tree = Tree {
            nodes: HashMap::new(),
            root: NodeId(0),
            body: NodeId(0),
            next_id: 0,
            next_observer_id: 0,
            registrations: Vec::new(),
        };
        let root = tree.alloc(NodeKind::Element {
            tag: "html".into(),
            attributes: Vec::new(),
        });
        let body = tree.alloc(NodeKind::Element {
            tag: "body".into(),
            attributes: Vec::new(),
        });
        tree.link(root, body, 0);
        tree.root = root;
        tree.body = body;

        Self {
            tree: Arc::new(RwLock::new(tree)),
        }
    }

    /// A document whose body holds `html`.
    pub fn with_body(html: &str) -> Result<Self> {
        let document = Self::new();
        document.append_html(document.body(), html)?;
        Ok(document)
    }

    fn read(&self) -> RwLockReadGuard<'_, Tree> {
        read_tree(&self.tree)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tree> {
        write_tree(&self.tree)
    }

    pub fn root(&self) -> NodeId {
        self.read().root
    }

    pub fn body(&self) -> NodeId {
        self.read().body
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn exists(&self, node: NodeId) -> bool {
        self.read().nodes.contains_key(&node)
    }

    /// Whether `node` is currently attached to the document.
    pub fn is_connected(&self, node: NodeId) -> bool {
        self.read().is_connected(node)
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.read().nodes.get(&node).and_then(|n| n.parent)
    }

    /// Element children in order.
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.read().element_children(node)
    }

    /// All child nodes, text included.
    pub fn child_nodes(&self, node: NodeId) -> Vec<NodeId> {
        self.read()
            .nodes
            .get(&node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn tag(&self, node: NodeId) -> Option<String> {
        self.read().tag_of(node).map(str::to_string)
    }

    pub fn is_element(&self, node: NodeId) -> bool {
        self.read().tag_of(node).is_some()
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.read().attribute_of(node, name).map(str::to_string)
    }

    pub fn has_attribute(&self, node: NodeId, name: &str) -> bool {
        self.read().attribute_of(node, name).is_some()
    }

    pub fn text_content(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.read().text_content(node, &mut out);
        out
    }

    /// Serialized markup of the node's children.
    pub fn inner_html(&self, node: NodeId) -> String {
        let tree = self.read();
        let mut out = String::new();
        if let Some(n) = tree.nodes.get(&node) {
            for child in &n.children {
                tree.serialize(*child, &mut out);
            }
        }
        out
    }

    /// Serialized markup of the node itself.
    pub fn outer_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.read().serialize(node, &mut out);
        out
    }

    /// Whether `node` is `ancestor` or one of its descendants.
    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        self.read().is_inclusive_ancestor(ancestor, node)
    }

    pub fn matches(&self, node: NodeId, selector: &Selector) -> bool {
        selector.matches(&*self.read(), node)
    }

    /// Nearest inclusive ancestor matching `selector`.
    pub fn closest(&self, node: NodeId, selector: &Selector) -> Option<NodeId> {
        let tree = self.read();
        let mut current = Some(node);
        while let Some(id) = current {
            if selector.matches(&*tree, id) {
                return Some(id);
            }
            current = tree.nodes.get(&id).and_then(|n| n.parent);
        }
        None
    }

    /// First descendant of `scope` matching `selector`, in document order.
    pub fn select_first(&self, scope: NodeId, selector: &Selector) -> Option<NodeId> {
        let tree = self.read();
        tree.descendants(scope)
            .into_iter()
            .find(|id| selector.matches(&*tree, *id))
    }

    /// Every descendant of `scope` matching `selector`, in document order.
    pub fn select_all(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        let tree = self.read();
        tree.descendants(scope)
            .into_iter()
            .filter(|id| selector.matches(&*tree, *id))
            .collect()
    }

    pub fn query_selector(&self, scope: NodeId, selector: &str) -> Result<Option<NodeId>> {
        Ok(self.select_first(scope, &Selector::parse(selector)?))
    }

    pub fn query_selector_all(&self, scope: NodeId, selector: &str) -> Result<Vec<NodeId>> {
        Ok(self.select_all(scope, &Selector::parse(selector)?))
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Create a detached element.
    pub fn create_element(&self, tag: &str) -> NodeId {
        self.write().alloc(NodeKind::Element {
            tag: tag.to_ascii_lowercase(),
            attributes: Vec::new(),
        })
    }

    pub fn append_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        self.insert_before(parent, child, None)
    }

    /// Insert `child` under `parent` before `reference` (or last), moving it
    /// out of its current parent first.
    pub fn insert_before(&self, parent: NodeId, child: NodeId, reference: Option<NodeId>) -> Result<()> {
        let mut tree = self.write();
        tree.ensure_element(parent)?;
        tree.node(child)?;
        if tree.is_inclusive_ancestor(child, parent) {
            return Err(ChatsayError::HierarchyError(format!(
                "cannot insert {} into its own subtree",
                child
            )));
        }

        if let Some(old_parent) = tree.detach(child) {
            tree.notify(MutationRecord::child_list(old_parent, Vec::new(), vec![child]));
        }

        let index = match reference {
            Some(reference) => tree
                .node(parent)?
                .children
                .iter()
                .position(|c| *c == reference)
                .ok_or_else(|| {
                    ChatsayError::HierarchyError(format!("{} is not a child of {}", reference, parent))
                })?,
            None => tree.node(parent)?.children.len(),
        };
        tree.link(parent, child, index);
        tree.notify(MutationRecord::child_list(parent, vec![child], Vec::new()));
        Ok(())
    }

    /// Detach `node` from its parent. Detached nodes are left untouched.
    pub fn remove(&self, node: NodeId) -> Result<()> {
        let mut tree = self.write();
        tree.node(node)?;
        if let Some(parent) = tree.detach(node) {
            tree.notify(MutationRecord::child_list(parent, Vec::new(), vec![node]));
        }
        Ok(())
    }

    /// Parse `html` and append the resulting nodes to `parent` as one change.
    pub fn append_html(&self, parent: NodeId, html: &str) -> Result<Vec<NodeId>> {
        let parsed = parse_fragment(html)?;
        let mut tree = self.write();
        tree.ensure_element(parent)?;

        let mut added = Vec::with_capacity(parsed.len());
        for node in parsed {
            let id = tree.build(node);
            let index = tree.node(parent)?.children.len();
            tree.link(parent, id, index);
            added.push(id);
        }
        if !added.is_empty() {
            tree.notify(MutationRecord::child_list(parent, added.clone(), Vec::new()));
        }
        trace!(target: "chatsay::dom", "Appended {} nodes to {}", added.len(), parent);
        Ok(added)
    }

    /// Replace every child of `parent` with the nodes parsed from `html`.
    pub fn set_inner_html(&self, parent: NodeId, html: &str) -> Result<Vec<NodeId>> {
        let parsed = parse_fragment(html)?;
        let mut tree = self.write();
        tree.ensure_element(parent)?;

        let removed = std::mem::take(&mut tree.node_mut(parent)?.children);
        for child in &removed {
            if let Some(node) = tree.nodes.get_mut(child) {
                node.parent = None;
            }
        }

        let mut added = Vec::with_capacity(parsed.len());
        for node in parsed {
            let id = tree.build(node);
            let index = tree.node(parent)?.children.len();
            tree.link(parent, id, index);
            added.push(id);
        }
        if !added.is_empty() || !removed.is_empty() {
            tree.notify(MutationRecord::child_list(parent, added.clone(), removed));
        }
        Ok(added)
    }

    /// Replace every child of `node` with a single text node.
    pub fn set_text(&self, node: NodeId, text: &str) -> Result<()> {
        let mut tree = self.write();
        tree.ensure_element(node)?;

        let removed = std::mem::take(&mut tree.node_mut(node)?.children);
        for child in &removed {
            if let Some(n) = tree.nodes.get_mut(child) {
                n.parent = None;
            }
        }
        let mut added = Vec::new();
        if !text.is_empty() {
            let id = tree.alloc(NodeKind::Text(text.to_string()));
            tree.link(node, id, 0);
            added.push(id);
        }
        tree.notify(MutationRecord::child_list(node, added, removed));
        Ok(())
    }

    pub fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<()> {
        let name = name.to_ascii_lowercase();
        let mut tree = self.write();
        let old_value = match &mut tree.node_mut(node)?.kind {
            NodeKind::Element { attributes, .. } => {
                match attributes.iter_mut().find(|(n, _)| *n == name) {
                    Some((_, existing)) => Some(std::mem::replace(existing, value.to_string())),
                    None => {
                        attributes.push((name.clone(), value.to_string()));
                        None
                    }
                }
            }
            NodeKind::Text(_) => return Err(ChatsayError::NotAnElement(node)),
        };
        tree.notify(MutationRecord::attribute(node, &name, old_value));
        Ok(())
    }

    pub fn remove_attribute(&self, node: NodeId, name: &str) -> Result<()> {
        let name = name.to_ascii_lowercase();
        let mut tree = self.write();
        let old_value = match &mut tree.node_mut(node)?.kind {
            NodeKind::Element { attributes, .. } => {
                let position = attributes.iter().position(|(n, _)| *n == name);
                position.map(|i| attributes.remove(i).1)
            }
            NodeKind::Text(_) => return Err(ChatsayError::NotAnElement(node)),
        };
        if old_value.is_some() {
            tree.notify(MutationRecord::attribute(node, &name, old_value));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Create an observer with no registrations yet.
    pub fn mutation_observer(&self) -> MutationObserver {
        let id = {
            let mut tree = self.write();
            tree.next_observer_id += 1;
            tree.next_observer_id
        };
        MutationObserver::new(id, Arc::downgrade(&self.tree))
    }

    /// Create an observer already registered on `target`.
    pub fn observe(&self, target: NodeId, options: ObserveOptions) -> MutationObserver {
        let observer = self.mutation_observer();
        observer.observe(target, options);
        observer
    }

    /// Number of live observer registrations.
    pub fn observer_count(&self) -> usize {
        self.read().registrations.len()
    }

    /// Wait until `condition` holds, re-evaluating it after every mutation
    /// batch on `target`. Returns the final evaluation once `timeout` passes.
    pub async fn wait_for<F>(
        &self,
        target: NodeId,
        options: ObserveOptions,
        timeout: Duration,
        mut condition: F,
    ) -> bool
    where
        F: FnMut(&Document) -> bool,
    {
        if condition(self) {
            return true;
        }

        let mut observer = self.observe(target, options);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return condition(self),
                batch = observer.next_batch() => {
                    if batch.is_none() || condition(self) {
                        return condition(self);
                    }
                }
            }
        }
    }
}
