//! The extension instance: one per page.
//!
//! Wires a document, a site adapter and a speech sink together. `init()`
//! starts watching for the chat root and connects the observer whenever it
//! appears; `teardown()` stops everything.

use crate::announce::Announcer;
use crate::classifier::SiteAdapter;
use crate::config::{Messages, ObserverConfig};
use crate::dom::Document;
use crate::observer::ChatObserver;
use crate::scope::ResourceScope;
use crate::watcher::{ElementWatcher, ElementWatcherHandle, Locate};
use crate::Result;
use async_trait::async_trait;
use chatsay_types::{NodeId, WatchEvent};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Finds the chat root through the site adapter.
struct ChatRootLocator {
    adapter: Arc<dyn SiteAdapter>,
}

#[async_trait]
impl Locate for ChatRootLocator {
    async fn locate(&self, document: &Document) -> Result<Option<NodeId>> {
        self.adapter.locate_chat_root(document).await
    }
}

struct Running {
    watcher: ElementWatcherHandle,
    scope: ResourceScope,
}

pub struct Extension {
    document: Document,
    adapter: Arc<dyn SiteAdapter>,
    observer: ChatObserver,
    config: ObserverConfig,
    running: Mutex<Option<Running>>,
}

impl Extension {
    pub fn new(
        document: Document,
        adapter: Arc<dyn SiteAdapter>,
        announcer: Arc<dyn Announcer>,
        config: ObserverConfig,
        messages: Messages,
    ) -> Self {
        let observer = ChatObserver::new(document.clone(), adapter.clone(), announcer, config.clone(), messages);
        Self {
            document,
            adapter,
            observer,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn observer(&self) -> &ChatObserver {
        &self.observer
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start watching for the chat root. Calling it again while running
    /// does nothing.
    pub fn init(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let stable_ancestor = self.adapter.stable_ancestor(&self.document);
        let locator = ChatRootLocator {
            adapter: self.adapter.clone(),
        };
        let watcher = ElementWatcher::new("chat root", self.document.clone(), stable_ancestor, Arc::new(locator))
            .with_timing(self.config.watcher_debounce(), self.config.watcher_poll())
            .start(tx);

        let scope = ResourceScope::new(format!("extension:{}", self.adapter.site()));
        scope.spawn(drive(rx, self.observer.clone(), self.adapter.clone(), self.document.clone()));

        info!(
            target: "chatsay::context",
            "Started for {} (stable ancestor {})",
            self.adapter.site(),
            stable_ancestor
        );
        *running = Some(Running { watcher, scope });
    }

    /// Stop watching and disconnect the observer.
    pub fn teardown(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(running) = running {
            running.watcher.stop();
            running.scope.teardown();
            self.observer.disconnect();
            info!(target: "chatsay::context", "Stopped for {}", self.adapter.site());
        }
    }
}

impl Drop for Extension {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Connect on every chat root sighting, disconnect on every loss.
async fn drive(
    mut events: mpsc::UnboundedReceiver<WatchEvent>,
    observer: ChatObserver,
    adapter: Arc<dyn SiteAdapter>,
    document: Document,
) {
    while let Some(event) = events.recv().await {
        match event {
            WatchEvent::Found(root) => {
                let anchor = match adapter.locate_replay_anchor(&document).await {
                    Ok(anchor) => anchor,
                    Err(e) => {
                        debug!(target: "chatsay::context", "Locating replay anchor failed: {}", e);
                        None
                    }
                };
                if let Err(e) = observer.connect(root, anchor) {
                    debug!(target: "chatsay::context", "Connect to {} failed, waiting for next sighting: {}", root, e);
                }
            }
            WatchEvent::Lost(root) => {
                debug!(target: "chatsay::context", "Chat root {} lost", root);
                observer.disconnect();
            }
        }
    }
}
