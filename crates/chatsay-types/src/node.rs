//! Element handles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to an element of the host document.
///
/// A handle stays valid as an identifier after its element leaves the tree;
/// whether it is still attached must be re-checked before every use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transition reported by an element watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "node", rename_all = "snake_case")]
pub enum WatchEvent {
    /// The watched element appeared.
    Found(NodeId),
    /// The previously found element is no longer connected.
    Lost(NodeId),
}

impl WatchEvent {
    pub fn node(&self) -> NodeId {
        match self {
            WatchEvent::Found(node) | WatchEvent::Lost(node) => *node,
        }
    }
}
