//! Watches for an element appearing and disappearing under a stable ancestor.

use crate::dom::{Document, ObserveOptions, Selector};
use crate::scope::ResourceScope;
use crate::Result;
use async_trait::async_trait;
use chatsay_types::{NodeId, WatchEvent};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, trace};

/// Finds the watched element, if it currently exists.
#[async_trait]
pub trait Locate: Send + Sync {
    async fn locate(&self, document: &Document) -> Result<Option<NodeId>>;
}

/// Locates the first element matching a selector.
#[derive(Debug, Clone)]
pub struct SelectorLocator {
    selector: Selector,
}

impl SelectorLocator {
    pub fn new(selector: Selector) -> Self {
        Self { selector }
    }
}

#[async_trait]
impl Locate for SelectorLocator {
    async fn locate(&self, document: &Document) -> Result<Option<NodeId>> {
        Ok(document.select_first(document.root(), &self.selector))
    }
}

pub struct ElementWatcher {
    name: String,
    document: Document,
    stable_ancestor: NodeId,
    locator: Arc<dyn Locate>,
    debounce: Duration,
    poll: Duration,
}

impl ElementWatcher {
    pub fn new(
        name: impl Into<String>,
        document: Document,
        stable_ancestor: NodeId,
        locator: Arc<dyn Locate>,
    ) -> Self {
        Self {
            name: name.into(),
            document,
            stable_ancestor,
            locator,
            debounce: Duration::from_millis(100),
            poll: Duration::from_secs(1),
        }
    }

    pub fn with_timing(mut self, debounce: Duration, poll: Duration) -> Self {
        self.debounce = debounce;
        self.poll = poll.max(Duration::from_millis(1));
        self
    }

    /// Start watching. Transitions are sent on `events` until the handle is
    /// stopped or dropped.
    pub fn start(self, events: mpsc::UnboundedSender<WatchEvent>) -> ElementWatcherHandle {
        let scope = ResourceScope::new(format!("watcher:{}", self.name));
        scope.spawn(self.run(events));
        ElementWatcherHandle { scope }
    }

    async fn run(self, events: mpsc::UnboundedSender<WatchEvent>) {
        let mut observer = self
            .document
            .observe(self.stable_ancestor, ObserveOptions::child_list().subtree());
        let mut found: Option<NodeId> = None;
        let mut poll = tokio::time::interval_at(Instant::now() + self.poll, self.poll);
        let mut debounce: Option<Pin<Box<Sleep>>> = None;

        debug!(target: "chatsay::watcher", "Watching for {}", self.name);
        self.check(&mut found, &events).await;

        loop {
            tokio::select! {
                batch = observer.next_batch() => {
                    if batch.is_none() {
                        break;
                    }
                    match debounce.as_mut() {
                        Some(sleep) => sleep.as_mut().reset(Instant::now() + self.debounce),
                        None => debounce = Some(Box::pin(tokio::time::sleep(self.debounce))),
                    }
                }
                _ = wait_optional(&mut debounce) => {
                    debounce = None;
                    self.check(&mut found, &events).await;
                }
                _ = poll.tick() => {
                    self.check(&mut found, &events).await;
                }
            }
            if events.is_closed() {
                break;
            }
        }
    }

    async fn check(&self, found: &mut Option<NodeId>, events: &mpsc::UnboundedSender<WatchEvent>) {
        if let Some(element) = *found {
            if self.document.is_connected(element) {
                return;
            }
            info!(target: "chatsay::watcher", "{} lost ({})", self.name, element);
            *found = None;
            let _ = events.send(WatchEvent::Lost(element));
        }

        match self.locator.locate(&self.document).await {
            Ok(Some(element)) if self.document.is_connected(element) => {
                info!(target: "chatsay::watcher", "{} found ({})", self.name, element);
                *found = Some(element);
                let _ = events.send(WatchEvent::Found(element));
            }
            Ok(_) => {
                trace!(target: "chatsay::watcher", "{} not present", self.name);
            }
            Err(e) => {
                debug!(target: "chatsay::watcher", "Locating {} failed, retrying later: {}", self.name, e);
            }
        }
    }
}

pub(crate) async fn wait_optional(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Stops the watcher when stopped or dropped.
pub struct ElementWatcherHandle {
    scope: ResourceScope,
}

impl ElementWatcherHandle {
    pub fn stop(&self) {
        self.scope.teardown();
    }

    pub fn is_stopped(&self) -> bool {
        self.scope.is_torn_down()
    }
}
