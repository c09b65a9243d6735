//! Response-container classification at the site-adapter boundary.

use crate::dom::Document;
use crate::Result;
use async_trait::async_trait;
use chatsay_types::{NodeId, RcKind, Site};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Site-specific knowledge the engine consults about the host page.
///
/// Predicates may return negative answers for nodes that later turn out to
/// be relevant; the engine asks again on every sighting.
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    fn site(&self) -> Site;

    /// Ancestor that is never replaced while the page is open.
    fn stable_ancestor(&self, document: &Document) -> NodeId {
        document.body()
    }

    async fn locate_chat_root(&self, document: &Document) -> Result<Option<NodeId>>;

    /// Secondary root the newest response is rendered into first, if the
    /// site has one.
    async fn locate_replay_anchor(&self, _document: &Document) -> Result<Option<NodeId>> {
        Ok(None)
    }

    /// Whether the page currently shows a fresh chat with nothing to drain.
    fn is_this_empty_chat(&self, document: &Document) -> bool;

    fn is_rc(&self, document: &Document, node: NodeId) -> bool;

    /// Whether `node` is a live reply rather than history. May wait on
    /// further mutations before answering.
    async fn is_new_rc(&self, document: &Document, node: NodeId) -> Result<bool>;

    /// The response container `node` belongs to, if any.
    fn parse_response_container(&self, document: &Document, node: NodeId) -> Option<NodeId>;

    /// Elements inside `rc` whose children are the segments, in order.
    fn parse_response_elements(&self, document: &Document, rc: NodeId) -> Vec<NodeId>;

    fn thinking_indicator(&self, _document: &Document, _rc: NodeId) -> Option<NodeId> {
        None
    }

    fn streaming_marker(&self, document: &Document, rc: NodeId) -> Option<NodeId>;

    fn is_streaming_complete(&self, document: &Document, marker: NodeId) -> bool;
}

/// When a sighting happened relative to the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// Added while history is being drained.
    DuringHistory,
    /// Added while watching for new responses.
    Live,
}

/// Wraps a [`SiteAdapter`] so that failures degrade to "not a response".
#[derive(Clone)]
pub struct ResponseClassifier {
    adapter: Arc<dyn SiteAdapter>,
    document: Document,
    timeout: Duration,
}

impl ResponseClassifier {
    pub fn new(adapter: Arc<dyn SiteAdapter>, document: Document, timeout: Duration) -> Self {
        Self {
            adapter,
            document,
            timeout,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn SiteAdapter> {
        &self.adapter
    }

    /// The response container `node` belongs to, if any.
    pub fn container_of(&self, node: NodeId) -> Option<NodeId> {
        if !self.document.is_element(node) {
            return None;
        }
        let rc = self.adapter.parse_response_container(&self.document, node)?;
        self.adapter.is_rc(&self.document, rc).then_some(rc)
    }

    /// Response containers currently under `root`, in order.
    pub fn containers_under(&self, root: NodeId) -> Vec<NodeId> {
        self.document
            .children(root)
            .into_iter()
            .filter(|child| self.adapter.is_rc(&self.document, *child))
            .collect()
    }

    /// Classify a node that was already present when the chat root became
    /// available. Such responses are taken as fully rendered.
    pub fn classify_existing(&self, node: NodeId) -> RcKind {
        if self.document.is_connected(node) && self.adapter.is_rc(&self.document, node) {
            RcKind::ExistingRc
        } else {
            RcKind::NotRc
        }
    }

    /// Children of `root` that classify as existing responses.
    pub fn existing_under(&self, root: NodeId) -> Vec<NodeId> {
        self.document
            .children(root)
            .into_iter()
            .filter(|child| self.classify_existing(*child) == RcKind::ExistingRc)
            .collect()
    }

    pub async fn classify(&self, node: NodeId, sighting: Sighting) -> RcKind {
        if !self.document.is_connected(node) || !self.adapter.is_rc(&self.document, node) {
            return RcKind::NotRc;
        }
        trace!(target: "chatsay::classifier", "Classifying {} ({:?})", node, sighting);

        let answer = AssertUnwindSafe(self.adapter.is_new_rc(&self.document, node)).catch_unwind();
        match tokio::time::timeout(self.timeout, answer).await {
            Ok(Ok(Ok(true))) => RcKind::NewRc,
            Ok(Ok(Ok(false))) => RcKind::PrevRc,
            Ok(Ok(Err(e))) => {
                warn!(target: "chatsay::classifier", "Classifying {} failed: {}", node, e);
                RcKind::NotRc
            }
            Ok(Err(_)) => {
                warn!(target: "chatsay::classifier", "Classifier panicked on {}", node);
                RcKind::NotRc
            }
            Err(_) => {
                debug!(
                    target: "chatsay::classifier",
                    "Classifying {} timed out after {:?}",
                    node,
                    self.timeout
                );
                RcKind::NotRc
            }
        }
    }

    /// Segment elements of `rc`, in container order.
    pub fn segments_of(&self, rc: NodeId) -> Vec<NodeId> {
        self.adapter
            .parse_response_elements(&self.document, rc)
            .into_iter()
            .flat_map(|element| self.document.children(element))
            .collect()
    }
}
