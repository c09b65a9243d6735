//! Mutation observation over the document tree.

use super::{write_tree, Tree};
use chatsay_types::NodeId;
use std::sync::{RwLock, Weak};
use tokio::sync::mpsc;

/// Kind of change a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    ChildList,
    Attributes,
}

/// One observed change, delivered to every matching observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub target: NodeId,
    pub added_nodes: Vec<NodeId>,
    pub removed_nodes: Vec<NodeId>,
    pub attribute_name: Option<String>,
    pub old_value: Option<String>,
}

impl MutationRecord {
    pub(crate) fn child_list(target: NodeId, added_nodes: Vec<NodeId>, removed_nodes: Vec<NodeId>) -> Self {
        Self {
            kind: MutationKind::ChildList,
            target,
            added_nodes,
            removed_nodes,
            attribute_name: None,
            old_value: None,
        }
    }

    pub(crate) fn attribute(target: NodeId, name: &str, old_value: Option<String>) -> Self {
        Self {
            kind: MutationKind::Attributes,
            target,
            added_nodes: Vec::new(),
            removed_nodes: Vec::new(),
            attribute_name: Some(name.to_string()),
            old_value,
        }
    }
}

/// What an observer registration is interested in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserveOptions {
    pub child_list: bool,
    pub attributes: bool,
    pub subtree: bool,
    pub attribute_filter: Option<Vec<String>>,
}

impl ObserveOptions {
    pub fn child_list() -> Self {
        Self {
            child_list: true,
            ..Self::default()
        }
    }

    pub fn attributes() -> Self {
        Self {
            attributes: true,
            ..Self::default()
        }
    }

    pub fn with_child_list(mut self) -> Self {
        self.child_list = true;
        self
    }

    pub fn with_attributes(mut self) -> Self {
        self.attributes = true;
        self
    }

    pub fn subtree(mut self) -> Self {
        self.subtree = true;
        self
    }

    pub fn attribute_filter<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = true;
        self.attribute_filter = Some(names.into_iter().map(Into::into).collect());
        self
    }

    fn wants(&self, record: &MutationRecord) -> bool {
        match record.kind {
            MutationKind::ChildList => self.child_list,
            MutationKind::Attributes => {
                self.attributes
                    && match (&self.attribute_filter, &record.attribute_name) {
                        (None, _) => true,
                        (Some(filter), Some(name)) => filter.iter().any(|f| f == name),
                        (Some(_), None) => false,
                    }
            }
        }
    }
}

pub(crate) struct Registration {
    pub(crate) observer_id: u64,
    pub(crate) target: NodeId,
    pub(crate) options: ObserveOptions,
    pub(crate) tx: mpsc::UnboundedSender<MutationRecord>,
}

impl Tree {
    /// Queue `record` for every observer whose registration covers it.
    pub(crate) fn notify(&self, record: MutationRecord) {
        let mut delivered: Vec<u64> = Vec::new();
        for registration in &self.registrations {
            if delivered.contains(&registration.observer_id) {
                continue;
            }
            let covered = registration.target == record.target
                || (registration.options.subtree
                    && self.is_inclusive_ancestor(registration.target, record.target));
            if covered && registration.options.wants(&record) {
                delivered.push(registration.observer_id);
                let _ = registration.tx.send(record.clone());
            }
        }
    }
}

/// Receives batches of mutation records for the targets it observes.
///
/// Dropping the observer removes all of its registrations.
pub struct MutationObserver {
    id: u64,
    tree: Weak<RwLock<Tree>>,
    tx: mpsc::UnboundedSender<MutationRecord>,
    rx: mpsc::UnboundedReceiver<MutationRecord>,
}

impl MutationObserver {
    pub(crate) fn new(id: u64, tree: Weak<RwLock<Tree>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { id, tree, tx, rx }
    }

    /// Start observing `target`. Observing the same target again replaces
    /// the previous options.
    pub fn observe(&self, target: NodeId, options: ObserveOptions) {
        let Some(tree) = self.tree.upgrade() else {
            return;
        };
        let mut tree = write_tree(&tree);
        tree.registrations
            .retain(|r| !(r.observer_id == self.id && r.target == target));
        tree.registrations.push(Registration {
            observer_id: self.id,
            target,
            options,
            tx: self.tx.clone(),
        });
    }

    /// Wait for the next batch: the first pending record plus everything
    /// queued behind it.
    pub async fn next_batch(&mut self) -> Option<Vec<MutationRecord>> {
        let first = self.rx.recv().await?;
        let mut batch = vec![first];
        while let Ok(record) = self.rx.try_recv() {
            batch.push(record);
        }
        Some(batch)
    }

    /// Remove every registration of this observer.
    pub fn disconnect(&self) {
        if let Some(tree) = self.tree.upgrade() {
            write_tree(&tree)
                .registrations
                .retain(|r| r.observer_id != self.id);
        }
    }
}

impl Drop for MutationObserver {
    fn drop(&mut self) {
        self.disconnect();
    }
}
