//! Streaming lifecycle of a single live response.
//!
//! A tracker walks one response container through thinking, awaiting start
//! and streaming until its streaming marker reports completion, then speaks
//! whatever segments are still unspoken. A failsafe bounds every phase.

use crate::announce::Announcer;
use crate::classifier::ResponseClassifier;
use crate::config::{Messages, ObserverConfig};
use crate::dom::{Document, ObserveOptions};
use crate::idle::{IdleDetector, IdleOutcome};
use crate::segments::{Cursor, SegmentAnnouncer, SpokenSet};
use crate::watcher::wait_optional;
use chatsay_types::{AnnounceOptions, AnnouncePolicy, NodeId, StreamPhase};
use dashmap::DashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// What the registry knows about one tracked response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedResponse {
    pub phase: StreamPhase,
    /// Last segment index announced.
    pub cursor: Cursor,
}

/// Everything a tracker shares with the connection that started it.
#[derive(Clone)]
pub struct TrackerContext {
    pub document: Document,
    pub classifier: ResponseClassifier,
    pub announcer: Arc<dyn Announcer>,
    pub config: Arc<ObserverConfig>,
    pub messages: Arc<Messages>,
    pub spoken: SpokenSet,
    /// Every response tracked in the current connection.
    pub registry: Arc<DashMap<NodeId, TrackedResponse>>,
}

/// Result of re-reading the container after a wakeup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Waiting,
    Progressed,
    Completed,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Completed,
    Failsafe,
    Disconnected,
    Cancelled,
}

pub struct ResponseTracker {
    rc: NodeId,
    ctx: TrackerContext,
    segment_announcer: SegmentAnnouncer,
    phase: StreamPhase,
    cursor: Cursor,
    known: Vec<NodeId>,
}

impl ResponseTracker {
    pub fn new(rc: NodeId, ctx: TrackerContext) -> Self {
        let segment_announcer =
            SegmentAnnouncer::new(ctx.document.clone(), ctx.announcer.clone(), ctx.spoken.clone())
                .with_empty_marker(ctx.messages.empty_segment.clone(), ctx.config.announce_empty_segments);
        ctx.registry.insert(
            rc,
            TrackedResponse {
                phase: StreamPhase::AwaitingStart,
                cursor: None,
            },
        );
        Self {
            rc,
            ctx,
            segment_announcer,
            phase: StreamPhase::AwaitingStart,
            cursor: None,
            known: Vec::new(),
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Track the response until it completes, is abandoned, or `cancel`
    /// fires. Returns the terminal phase.
    pub async fn run(mut self, cancel: CancellationToken) -> StreamPhase {
        let document = self.ctx.document.clone();
        let config = self.ctx.config.clone();
        let incremental = config.policy == AnnouncePolicy::Incremental;

        let mut observer = document.observe(self.rc, ObserveOptions::child_list().with_attributes().subtree());
        // removal of the container is reported on its parent
        if let Some(parent) = document.parent(self.rc) {
            observer.observe(parent, ObserveOptions::child_list());
        }

        let failsafe = tokio::time::sleep(config.failsafe());
        tokio::pin!(failsafe);
        let mut thinking_poll = tokio::time::interval_at(Instant::now() + config.thinking_poll(), config.thinking_poll());
        thinking_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + config.heartbeat(), config.heartbeat());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut segment_wait: Option<Pin<Box<Sleep>>> = None;

        debug!(target: "chatsay::tracker", "Tracking response {}", self.rc);

        let finish = loop {
            let before = self.phase;
            match self.evaluate() {
                Step::Completed => break Finish::Completed,
                Step::Disconnected => break Finish::Disconnected,
                Step::Progressed => {
                    failsafe.as_mut().reset(Instant::now() + config.failsafe());
                    if before != self.phase {
                        match self.phase {
                            StreamPhase::Thinking => thinking_poll.reset(),
                            StreamPhase::Streaming => heartbeat.reset(),
                            _ => {}
                        }
                    }
                }
                Step::Waiting => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Finish::Cancelled,
                _ = &mut failsafe => break Finish::Failsafe,
                _ = observer.next_batch() => {
                    if incremental && self.phase == StreamPhase::Streaming {
                        let deadline = Instant::now() + config.segment_wait();
                        match segment_wait.as_mut() {
                            Some(sleep) => sleep.as_mut().reset(deadline),
                            None => segment_wait = Some(Box::pin(tokio::time::sleep_until(deadline))),
                        }
                    }
                }
                _ = thinking_poll.tick(), if self.phase == StreamPhase::Thinking => {
                    let document = &self.ctx.document;
                    if self.ctx.classifier.adapter().thinking_indicator(document, self.rc).is_some() {
                        self.status(&self.ctx.messages.still_thinking);
                        failsafe.as_mut().reset(Instant::now() + config.failsafe());
                    }
                }
                _ = heartbeat.tick(), if self.phase == StreamPhase::Streaming => {
                    self.status(&self.ctx.messages.loading);
                }
                _ = wait_optional(&mut segment_wait) => {
                    segment_wait = None;
                    self.known = self.ctx.classifier.segments_of(self.rc);
                    self.cursor = self.segment_announcer.announce_all(&self.known, self.cursor);
                    self.publish();
                }
            }
        };
        drop(observer);

        match finish {
            Finish::Completed => self.complete(&cancel).await,
            Finish::Failsafe if document.is_connected(self.rc) => {
                warn!(
                    target: "chatsay::tracker",
                    "Response {} made no progress for {:?} in phase {:?}, giving up",
                    self.rc,
                    config.failsafe(),
                    self.phase
                );
                self.flush();
                self.status(&self.ctx.messages.stop_waiting);
                self.set_phase(StreamPhase::Abandoned);
            }
            Finish::Failsafe | Finish::Disconnected => {
                debug!(target: "chatsay::tracker", "Response {} left the document", self.rc);
                self.set_phase(StreamPhase::Abandoned);
            }
            Finish::Cancelled => {
                trace!(target: "chatsay::tracker", "Tracking of {} cancelled", self.rc);
                self.set_phase(StreamPhase::Abandoned);
            }
        }
        self.phase
    }

    /// Re-read the container and advance the phase.
    fn evaluate(&mut self) -> Step {
        let document = self.ctx.document.clone();
        let adapter = self.ctx.classifier.adapter().clone();
        if !document.is_connected(self.rc) {
            return Step::Disconnected;
        }

        let mut progressed = false;
        if matches!(self.phase, StreamPhase::Thinking | StreamPhase::AwaitingStart) {
            if adapter.streaming_marker(&document, self.rc).is_none() {
                let thinking = adapter.thinking_indicator(&document, self.rc).is_some();
                return match (self.phase, thinking) {
                    (StreamPhase::AwaitingStart, true) => {
                        self.set_phase(StreamPhase::Thinking);
                        self.status(&self.ctx.messages.thinking);
                        Step::Progressed
                    }
                    (StreamPhase::Thinking, false) => {
                        self.set_phase(StreamPhase::AwaitingStart);
                        Step::Progressed
                    }
                    _ => Step::Waiting,
                };
            }
            self.set_phase(StreamPhase::Streaming);
            self.status(&self.ctx.messages.responding);
            progressed = true;
        }

        let segments = self.ctx.classifier.segments_of(self.rc);
        if segments.len() < self.known.len() {
            warn!(
                target: "chatsay::tracker",
                before = ?self.known,
                after = ?segments,
                "Segment count of {} dropped from {} to {}, resyncing",
                self.rc,
                self.known.len(),
                segments.len()
            );
            self.cursor = segments.iter().rposition(|s| self.ctx.spoken.contains(*s));
        } else if segments.len() > self.known.len() {
            progressed = true;
            if self.ctx.config.policy == AnnouncePolicy::Incremental {
                self.cursor = self.segment_announcer.announce_settled(&segments, self.cursor);
            }
        }
        self.known = segments;
        self.publish();

        let complete = match adapter.streaming_marker(&document, self.rc) {
            Some(marker) => adapter.is_streaming_complete(&document, marker),
            None => true,
        };
        if complete {
            Step::Completed
        } else if progressed {
            Step::Progressed
        } else {
            Step::Waiting
        }
    }

    async fn complete(&mut self, cancel: &CancellationToken) {
        let quiet = self.ctx.config.completion_quiet();
        let detector = IdleDetector::new(self.ctx.document.clone()).with_subtree();
        let outcome =
            tokio::time::timeout(self.ctx.config.failsafe(), detector.wait_until_idle(self.rc, quiet, cancel)).await;
        match outcome {
            Ok(IdleOutcome::Cancelled) => {
                self.set_phase(StreamPhase::Abandoned);
                return;
            }
            Ok(IdleOutcome::Disconnected) => {
                debug!(target: "chatsay::tracker", "Response {} left the document on completion", self.rc);
                self.set_phase(StreamPhase::Abandoned);
                return;
            }
            Ok(IdleOutcome::Idle) => {}
            Err(_) => {
                debug!(target: "chatsay::tracker", "Response {} still mutating after completion", self.rc);
            }
        }

        self.flush();
        self.set_phase(StreamPhase::Complete);
        info!(
            target: "chatsay::tracker",
            "Response {} complete ({} segments)",
            self.rc,
            self.known.len()
        );
    }

    /// Speak every segment after the cursor.
    fn flush(&mut self) {
        self.known = self.ctx.classifier.segments_of(self.rc);
        self.cursor = self.segment_announcer.announce_all(&self.known, self.cursor);
    }

    fn set_phase(&mut self, phase: StreamPhase) {
        if self.phase != phase {
            debug!(target: "chatsay::tracker", "Response {}: {:?} -> {:?}", self.rc, self.phase, phase);
        }
        self.phase = phase;
        self.publish();
    }

    fn publish(&self) {
        self.ctx.registry.insert(
            self.rc,
            TrackedResponse {
                phase: self.phase,
                cursor: self.cursor,
            },
        );
    }

    fn status(&self, text: &str) {
        self.ctx.announcer.announce(text, AnnounceOptions::status());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announce::ChannelAnnouncer;
    use crate::classifier::SiteAdapter;
    use crate::Result;
    use crate::dom::Selector;
    use async_trait::async_trait;
    use chatsay_types::{Announcement, Site};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// `.rc` containers with a `[data-streaming]` marker, `.thinking`
    /// indicator and `.body` segment parents.
    struct TestAdapter {
        rc: Selector,
        marker: Selector,
        thinking: Selector,
    }

    #[async_trait]
    impl SiteAdapter for TestAdapter {
        fn site(&self) -> Site {
            Site::Grok
        }

        async fn locate_chat_root(&self, document: &Document) -> Result<Option<NodeId>> {
            document.query_selector(document.body(), "#root")
        }

        fn is_this_empty_chat(&self, _document: &Document) -> bool {
            false
        }

        fn is_rc(&self, document: &Document, node: NodeId) -> bool {
            document.matches(node, &self.rc)
        }

        async fn is_new_rc(&self, _document: &Document, _node: NodeId) -> Result<bool> {
            Ok(true)
        }

        fn parse_response_container(&self, document: &Document, node: NodeId) -> Option<NodeId> {
            document.closest(node, &self.rc)
        }

        fn parse_response_elements(&self, document: &Document, rc: NodeId) -> Vec<NodeId> {
            document.query_selector_all(rc, ".body").unwrap_or_default()
        }

        fn thinking_indicator(&self, document: &Document, rc: NodeId) -> Option<NodeId> {
            document.select_first(rc, &self.thinking)
        }

        fn streaming_marker(&self, document: &Document, rc: NodeId) -> Option<NodeId> {
            document.select_first(rc, &self.marker)
        }

        fn is_streaming_complete(&self, document: &Document, marker: NodeId) -> bool {
            document.attribute(marker, "data-streaming").as_deref() != Some("true")
        }
    }

    struct Fixture {
        document: Document,
        rc: NodeId,
        ctx: TrackerContext,
        rx: UnboundedReceiver<Announcement>,
    }

    fn fixture(rc_html: &str, config: ObserverConfig) -> Fixture {
        let document = Document::with_body(&format!("<div id=root>{}</div>", rc_html)).unwrap();
        let rc = document.query_selector(document.body(), ".rc").unwrap().unwrap();
        let adapter = TestAdapter {
            rc: Selector::parse(".rc").unwrap(),
            marker: Selector::parse("[data-streaming]").unwrap(),
            thinking: Selector::parse(".thinking").unwrap(),
        };
        let (announcer, rx) = ChannelAnnouncer::new();
        let ctx = TrackerContext {
            document: document.clone(),
            classifier: ResponseClassifier::new(Arc::new(adapter), document.clone(), Duration::from_secs(5)),
            announcer: Arc::new(announcer),
            config: Arc::new(config),
            messages: Arc::new(Messages::default()),
            spoken: SpokenSet::new(),
            registry: Arc::new(DashMap::new()),
        };
        Fixture { document, rc, ctx, rx }
    }

    fn texts(rx: &mut UnboundedReceiver<Announcement>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(a) = rx.try_recv() {
            out.push(a.text);
        }
        out
    }

    fn spawn(f: &Fixture) -> tokio::task::JoinHandle<StreamPhase> {
        let tracker = ResponseTracker::new(f.rc, f.ctx.clone());
        tokio::spawn(tracker.run(CancellationToken::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_complete_flushes_immediately() {
        let mut f = fixture(
            r#"<div class=rc><div data-streaming="false"></div><div class=body><p>A</p><p>B</p></div></div>"#,
            ObserverConfig::default(),
        );
        let phase = spawn(&f).await.unwrap();
        assert_eq!(phase, StreamPhase::Complete);
        assert_eq!(texts(&mut f.rx), vec!["Responding...", "A", "B"]);
        assert_eq!(
            f.ctx.registry.get(&f.rc).map(|t| *t),
            Some(TrackedResponse {
                phase: StreamPhase::Complete,
                cursor: Some(1),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_thinking_then_streaming() {
        let mut f = fixture(r#"<div class=rc><div class=thinking></div></div>"#, ObserverConfig::default());
        let handle = spawn(&f);

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(texts(&mut f.rx), vec!["Thinking...", "Still thinking..."]);

        let thinking = f.document.query_selector(f.rc, ".thinking").unwrap().unwrap();
        f.document.remove(thinking).unwrap();
        let appended = f
            .document
            .append_html(f.rc, r#"<div data-streaming="true"></div><div class=body><p>A</p></div>"#)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(texts(&mut f.rx), vec!["Responding...", "Loading..."]);

        f.document.set_attribute(appended[0], "data-streaming", "false").unwrap();
        assert_eq!(handle.await.unwrap(), StreamPhase::Complete);
        assert_eq!(texts(&mut f.rx), vec!["A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failsafe_flushes_then_reports() {
        let mut f = fixture(
            r#"<div class=rc><div data-streaming="true"></div><div class=body><p>A</p></div></div>"#,
            ObserverConfig {
                heartbeat_ms: 60_000,
                ..ObserverConfig::default()
            },
        );
        let start = Instant::now();
        let phase = spawn(&f).await.unwrap();
        assert_eq!(phase, StreamPhase::Abandoned);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(
            texts(&mut f.rx),
            vec!["Responding...", "A", "Unknown error, stop waiting"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_container_is_abandoned_quietly() {
        let mut f = fixture(r#"<div class=rc></div>"#, ObserverConfig::default());
        let handle = spawn(&f);
        tokio::time::sleep(Duration::from_secs(1)).await;
        f.document.remove(f.rc).unwrap();
        assert_eq!(handle.await.unwrap(), StreamPhase::Abandoned);
        assert!(texts(&mut f.rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_speaks_settled_segments_early() {
        let mut f = fixture(
            r#"<div class=rc><div data-streaming="true"></div><div class=body></div></div>"#,
            ObserverConfig {
                policy: AnnouncePolicy::Incremental,
                heartbeat_ms: 60_000,
                ..ObserverConfig::default()
            },
        );
        let body = f.document.query_selector(f.rc, ".body").unwrap().unwrap();
        let handle = spawn(&f);

        tokio::time::sleep(Duration::from_millis(100)).await;
        f.document.append_html(body, "<p>A</p><p>B</p>").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(texts(&mut f.rx), vec!["Responding...", "A"]);

        // the newest segment is spoken once the response goes quiet
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert_eq!(texts(&mut f.rx), vec!["B"]);

        f.document.append_html(body, "<p>C</p>").unwrap();
        let marker = f.document.query_selector(f.rc, "[data-streaming]").unwrap().unwrap();
        f.document.set_attribute(marker, "data-streaming", "false").unwrap();
        assert_eq!(handle.await.unwrap(), StreamPhase::Complete);
        assert_eq!(texts(&mut f.rx), vec!["C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrinking_segments_resync_without_repeats() {
        let mut f = fixture(
            r#"<div class=rc><div data-streaming="true"></div><div class=body></div></div>"#,
            ObserverConfig {
                policy: AnnouncePolicy::Incremental,
                heartbeat_ms: 60_000,
                ..ObserverConfig::default()
            },
        );
        let body = f.document.query_selector(f.rc, ".body").unwrap().unwrap();
        let handle = spawn(&f);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let added = f.document.append_html(body, "<p>A</p><p>B</p>").unwrap();
        tokio::time::sleep(Duration::from_millis(4_100)).await;
        assert_eq!(texts(&mut f.rx), vec!["Responding...", "A", "B"]);
        assert_eq!(f.ctx.registry.get(&f.rc).and_then(|t| t.cursor), Some(1));

        // the page re-renders and drops the first segment
        f.document.remove(added[0]).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.ctx.registry.get(&f.rc).and_then(|t| t.cursor), Some(0));

        f.document.append_html(body, "<p>D</p>").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let marker = f.document.query_selector(f.rc, "[data-streaming]").unwrap().unwrap();
        f.document.set_attribute(marker, "data-streaming", "false").unwrap();

        assert_eq!(handle.await.unwrap(), StreamPhase::Complete);
        assert_eq!(texts(&mut f.rx), vec!["D"]);
        assert_eq!(f.ctx.registry.get(&f.rc).and_then(|t| t.cursor), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons() {
        let f = fixture(r#"<div class=rc></div>"#, ObserverConfig::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ResponseTracker::new(f.rc, f.ctx.clone()).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), StreamPhase::Abandoned);
        assert_eq!(f.document.observer_count(), 0);
    }
}
