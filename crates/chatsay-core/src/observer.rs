//! Chat observer: connects to a chat root, drains history, then tracks live
//! responses.
//!
//! ```text
//! Disconnected -> Connecting -> DrainingHistory -> ObservingNew
//!       ^                                              |
//!       +------------------ disconnect ----------------+
//! ```
//!
//! Each connection owns a [`ResourceScope`]; every task it starts is torn
//! down on disconnect, so no timer or mutation observer outlives the chat
//! root it was created for.

use crate::announce::Announcer;
use crate::classifier::{ResponseClassifier, SiteAdapter, Sighting};
use crate::config::{Messages, ObserverConfig};
use crate::dom::{Document, ObserveOptions};
use crate::scope::ResourceScope;
use crate::segments::SpokenSet;
use crate::tracker::{ResponseTracker, TrackedResponse, TrackerContext};
use crate::{ChatsayError, Result};
use chatsay_types::{AnnounceOptions, NodeId, ObserverState, RcKind, StreamPhase};
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use uuid::Uuid;

struct Connection {
    id: Uuid,
    chat_root: NodeId,
    replay_anchor: Option<NodeId>,
    scope: ResourceScope,
    registry: Arc<DashMap<NodeId, TrackedResponse>>,
    in_flight: Mutex<HashSet<NodeId>>,
    spoken: SpokenSet,
}

#[derive(Default)]
struct Inner {
    connection: Option<Arc<Connection>>,
    /// Set when the last disconnect left an empty chat behind.
    skip_history_next: bool,
}

struct Shared {
    document: Document,
    classifier: ResponseClassifier,
    announcer: Arc<dyn Announcer>,
    config: Arc<ObserverConfig>,
    messages: Arc<Messages>,
    state: watch::Sender<ObserverState>,
    inner: Mutex<Inner>,
}

/// Orchestrates history draining and live-response tracking for one page.
#[derive(Clone)]
pub struct ChatObserver {
    shared: Arc<Shared>,
}

impl ChatObserver {
    pub fn new(
        document: Document,
        adapter: Arc<dyn SiteAdapter>,
        announcer: Arc<dyn Announcer>,
        config: ObserverConfig,
        messages: Messages,
    ) -> Self {
        let classifier = ResponseClassifier::new(adapter, document.clone(), config.classify_timeout());
        let (state, _) = watch::channel(ObserverState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                document,
                classifier,
                announcer,
                config: Arc::new(config),
                messages: Arc::new(messages),
                state,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    pub fn state(&self) -> ObserverState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ObserverState> {
        self.shared.state.subscribe()
    }

    /// Identifier of the current connection, if connected.
    pub fn connection_id(&self) -> Option<Uuid> {
        self.inner().connection.as_ref().map(|c| c.id)
    }

    /// Responses tracked in the current connection and their phases.
    pub fn tracked_responses(&self) -> Vec<(NodeId, StreamPhase)> {
        let Some(connection) = self.inner().connection.clone() else {
            return Vec::new();
        };
        let mut tracked: Vec<_> = connection
            .registry
            .iter()
            .map(|entry| (*entry.key(), entry.value().phase))
            .collect();
        tracked.sort_by_key(|(rc, _)| *rc);
        tracked
    }

    /// Index of the last segment announced for `rc` in the current
    /// connection.
    pub fn announced_through(&self, rc: NodeId) -> Option<usize> {
        let connection = self.inner().connection.clone()?;
        let tracked = connection.registry.get(&rc)?;
        tracked.cursor
    }

    /// Start observing `chat_root`.
    ///
    /// Fails fast if either element is not connected; retrying is the
    /// caller's job. Any previous connection is torn down first.
    pub fn connect(&self, chat_root: NodeId, replay_anchor: Option<NodeId>) -> Result<()> {
        let document = &self.shared.document;
        for node in std::iter::once(chat_root).chain(replay_anchor) {
            if !document.is_connected(node) {
                debug!(target: "chatsay::observer", "Cannot connect, {} is not connected", node);
                self.disconnect();
                return Err(ChatsayError::NotConnected(node));
            }
        }

        let connection = Arc::new(Connection {
            id: Uuid::new_v4(),
            chat_root,
            replay_anchor,
            scope: ResourceScope::new(format!("connection:{}", chat_root)),
            registry: Arc::new(DashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            spoken: SpokenSet::new(),
        });

        let skip_history = {
            let mut inner = self.inner();
            if let Some(previous) = inner.connection.take() {
                debug!(target: "chatsay::observer", "Replacing connection {}", previous.id);
                previous.scope.teardown();
            }
            inner.connection = Some(connection.clone());
            std::mem::take(&mut inner.skip_history_next)
        };
        self.shared.state.send_replace(ObserverState::Connecting);

        let empty_chat = skip_history || self.shared.classifier.adapter().is_this_empty_chat(document);
        info!(
            target: "chatsay::observer",
            "Connected to chat root {} (connection {}, empty chat: {})",
            chat_root,
            connection.id,
            empty_chat
        );

        if empty_chat {
            self.shared.state.send_replace(ObserverState::ObservingNew);
            let observer = self.clone();
            let conn = connection.clone();
            connection.scope.spawn(async move { observer.observe_new(conn, true).await });
            return Ok(());
        }

        let existing = self.shared.classifier.existing_under(chat_root).len();
        if existing > 0 {
            self.status(&self.shared.messages.existing(existing));
        }
        self.shared.state.send_replace(ObserverState::DrainingHistory);

        let observer = self.clone();
        let conn = connection.clone();
        connection.scope.spawn(async move {
            let held = observer.drain_history(&conn).await;
            if !observer.set_state_if_current(&conn, ObserverState::ObservingNew) {
                return;
            }
            for rc in held {
                if observer.shared.document.is_connected(rc) {
                    observer.start_tracker(&conn, rc);
                }
            }
            tokio::time::sleep(observer.shared.config.settle()).await;
            observer.observe_new(conn, false).await;
        });
        Ok(())
    }

    /// Tear down the current connection.
    ///
    /// If the page now shows an empty chat, the next connect skips history
    /// draining.
    pub fn disconnect(&self) {
        let now_empty = self.shared.classifier.adapter().is_this_empty_chat(&self.shared.document);
        let previous = {
            let mut inner = self.inner();
            inner.skip_history_next = now_empty;
            inner.connection.take()
        };
        if let Some(connection) = previous {
            connection.scope.teardown();
            for mut entry in connection.registry.iter_mut() {
                if !entry.value().phase.is_terminal() {
                    entry.value_mut().phase = StreamPhase::Abandoned;
                }
            }
            info!(
                target: "chatsay::observer",
                "Disconnected from chat root {} (connection {}, empty chat: {})",
                connection.chat_root,
                connection.id,
                now_empty
            );
        }
        self.shared.state.send_replace(ObserverState::Disconnected);
    }

    /// Count history responses added until the quiet window or the ceiling
    /// passes.
    ///
    /// Returns the live responses sighted meanwhile whose streaming marker
    /// was still running; they are tracked once draining ends.
    async fn drain_history(&self, conn: &Arc<Connection>) -> Vec<NodeId> {
        let document = &self.shared.document;
        let adapter = self.shared.classifier.adapter();
        let config = &self.shared.config;

        let mut observer = document.mutation_observer();
        observer.observe(conn.chat_root, ObserveOptions::child_list());
        if let Some(anchor) = conn.replay_anchor {
            observer.observe(anchor, ObserveOptions::child_list());
        }

        let ceiling = tokio::time::sleep(config.history_ceiling());
        let quiet = tokio::time::sleep(config.history_quiet());
        tokio::pin!(ceiling, quiet);

        let mut loaded: HashSet<NodeId> = HashSet::new();
        let mut held: Vec<NodeId> = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = &mut ceiling => {
                    info!(
                        target: "chatsay::observer",
                        "History still loading after {:?}, moving on",
                        config.history_ceiling()
                    );
                    break;
                }
                _ = &mut quiet => break,
                batch = observer.next_batch() => {
                    let Some(batch) = batch else { break };
                    let added: Vec<NodeId> = batch.iter().flat_map(|r| r.added_nodes.iter().copied()).collect();
                    if added.is_empty() {
                        continue;
                    }
                    quiet.as_mut().reset(Instant::now() + config.history_quiet());

                    let candidates = self.candidates(added.into_iter());
                    let kinds = join_all(
                        candidates.iter().map(|rc| self.shared.classifier.classify(*rc, Sighting::DuringHistory)),
                    )
                    .await;
                    for (rc, kind) in candidates.into_iter().zip(kinds) {
                        match kind {
                            RcKind::PrevRc => {
                                loaded.insert(rc);
                            }
                            RcKind::NewRc => {
                                let streaming = adapter
                                    .streaming_marker(document, rc)
                                    .is_some_and(|marker| !adapter.is_streaming_complete(document, marker));
                                if streaming && !held.contains(&rc) {
                                    debug!(target: "chatsay::observer", "Holding live {} until history is drained", rc);
                                    held.push(rc);
                                } else {
                                    debug!(target: "chatsay::observer", "Ignoring live-looking {} during history", rc);
                                }
                            }
                            _ => trace!(target: "chatsay::observer", "{} is not history", rc),
                        }
                    }
                }
            }
        }

        debug!(
            target: "chatsay::observer",
            "History drained: {} responses (connection {})",
            loaded.len(),
            conn.id
        );
        if !loaded.is_empty() {
            self.status(&self.shared.messages.previous(loaded.len()));
        }
        held
    }

    /// Watch for live responses and start a tracker for each.
    ///
    /// Responses show up under the replay anchor when there is one, else
    /// under the chat root. An anchor that leaves the document is located
    /// again through the adapter, falling back to the chat root; the loop
    /// ends only when the chat root itself is gone.
    ///
    /// With `scan_present`, responses already under the target once it is
    /// observed are candidates too.
    async fn observe_new(&self, conn: Arc<Connection>, scan_present: bool) {
        let document = self.shared.document.clone();
        let mut anchor = conn.replay_anchor;
        let mut scan_present = scan_present;

        loop {
            if !document.is_connected(conn.chat_root) {
                debug!(target: "chatsay::observer", "Chat root {} is gone", conn.chat_root);
                return;
            }
            let target = anchor
                .filter(|anchor| document.is_connected(*anchor))
                .unwrap_or(conn.chat_root);

            let mut observer = document.observe(target, ObserveOptions::child_list().subtree());
            // removal of the target is reported on its parent
            let parent = document.parent(target);
            if let Some(parent) = parent {
                observer.observe(parent, ObserveOptions::child_list());
            }
            debug!(target: "chatsay::observer", "Observing {} for new responses", target);
            if scan_present {
                let present = self.shared.classifier.containers_under(target);
                self.consider(&conn, present);
            }

            loop {
                let Some(batch) = observer.next_batch().await else {
                    return;
                };
                if !document.is_connected(target) {
                    break;
                }
                let touched = batch
                    .iter()
                    .filter(|r| Some(r.target) != parent)
                    .flat_map(|r| r.added_nodes.iter().copied().chain(std::iter::once(r.target)));
                let candidates = self.candidates(touched);
                self.consider(&conn, candidates);
            }

            anchor = self.relocate_anchor().await;
            // a re-rendered anchor may already hold the live response
            scan_present = anchor.is_some();
            info!(
                target: "chatsay::observer",
                "Live target {} left the document, now observing {}",
                target,
                anchor.unwrap_or(conn.chat_root)
            );
        }
    }

    async fn relocate_anchor(&self) -> Option<NodeId> {
        let document = &self.shared.document;
        match self.shared.classifier.adapter().locate_replay_anchor(document).await {
            Ok(anchor) => anchor.filter(|anchor| document.is_connected(*anchor)),
            Err(e) => {
                debug!(target: "chatsay::observer", "Locating replay anchor failed: {}", e);
                None
            }
        }
    }

    /// Response containers of `nodes`, deduplicated, in order.
    fn candidates(&self, nodes: impl Iterator<Item = NodeId>) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        nodes
            .filter_map(|node| self.shared.classifier.container_of(node))
            .filter(|rc| seen.insert(*rc))
            .collect()
    }

    /// Classify untracked candidates and track the live ones.
    fn consider(&self, conn: &Arc<Connection>, candidates: Vec<NodeId>) {
        let fresh: Vec<NodeId> = {
            let mut in_flight = conn.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            candidates
                .into_iter()
                .filter(|rc| !conn.registry.contains_key(rc) && in_flight.insert(*rc))
                .collect()
        };
        if fresh.is_empty() {
            return;
        }

        let observer = self.clone();
        let task_conn = conn.clone();
        conn.scope.spawn(async move {
            let conn = task_conn;
            let kinds = join_all(
                fresh.iter().map(|rc| observer.shared.classifier.classify(*rc, Sighting::Live)),
            )
            .await;
            for (rc, kind) in fresh.into_iter().zip(kinds) {
                conn.in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&rc);
                if kind == RcKind::NewRc {
                    observer.start_tracker(&conn, rc);
                } else {
                    trace!(target: "chatsay::observer", "{} classified {:?}", rc, kind);
                }
            }
        });
    }

    fn start_tracker(&self, conn: &Arc<Connection>, rc: NodeId) {
        if conn.registry.contains_key(&rc) || conn.scope.is_torn_down() {
            return;
        }
        info!(target: "chatsay::observer", "New response {}", rc);
        let ctx = TrackerContext {
            document: self.shared.document.clone(),
            classifier: self.shared.classifier.clone(),
            announcer: self.shared.announcer.clone(),
            config: self.shared.config.clone(),
            messages: self.shared.messages.clone(),
            spoken: conn.spoken.clone(),
            registry: conn.registry.clone(),
        };
        let tracker = ResponseTracker::new(rc, ctx);
        let token = conn.scope.token().child_token();
        conn.scope.spawn(async move {
            tracker.run(token).await;
        });
    }

    fn set_state_if_current(&self, conn: &Arc<Connection>, state: ObserverState) -> bool {
        let inner = self.inner();
        let current = inner.connection.as_ref().is_some_and(|c| c.id == conn.id);
        if current {
            self.shared.state.send_replace(state);
        }
        current
    }

    fn status(&self, text: &str) {
        self.shared.announcer.announce(text, AnnounceOptions::status());
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
