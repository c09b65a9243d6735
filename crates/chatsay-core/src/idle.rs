//! Detects when an element has stopped changing.

use crate::dom::{Document, ObserveOptions};
use chatsay_types::NodeId;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// How an idle wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The quiet period elapsed with no child-list mutation.
    Idle,
    /// The element left the document.
    Disconnected,
    /// The caller cancelled the wait.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct IdleDetector {
    document: Document,
    subtree: bool,
}

impl IdleDetector {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            subtree: false,
        }
    }

    /// Also count mutations anywhere below the element.
    pub fn with_subtree(mut self) -> Self {
        self.subtree = true;
        self
    }

    /// Resolve once `quiet` passes without a child-list mutation on `element`.
    ///
    /// An element that is already idle resolves after exactly `quiet`. There
    /// is no ceiling; wrap the call in `tokio::time::timeout` for one.
    pub async fn wait_until_idle(
        &self,
        element: NodeId,
        quiet: Duration,
        cancel: &CancellationToken,
    ) -> IdleOutcome {
        if !self.document.is_connected(element) {
            return IdleOutcome::Disconnected;
        }

        let mut options = ObserveOptions::child_list();
        options.subtree = self.subtree;
        let mut observer = self.document.observe(element, options);

        let deadline = tokio::time::sleep(quiet);
        tokio::pin!(deadline);
        let mut resets = 0usize;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return IdleOutcome::Cancelled,
                batch = observer.next_batch() => {
                    if batch.is_none() || !self.document.is_connected(element) {
                        return IdleOutcome::Disconnected;
                    }
                    resets += 1;
                    deadline.as_mut().reset(Instant::now() + quiet);
                }
                _ = &mut deadline => {
                    trace!(target: "chatsay::idle", "{} idle after {} resets", element, resets);
                    return if self.document.is_connected(element) {
                        IdleOutcome::Idle
                    } else {
                        IdleOutcome::Disconnected
                    };
                }
            }
        }
    }
}
