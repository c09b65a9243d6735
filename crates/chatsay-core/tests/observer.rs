//! End-to-end tests for the chat observer against a simulated page.

use async_trait::async_trait;
use chatsay_core::{
    adapter_for, ChannelAnnouncer, ChatObserver, ChatsayError, Document, Extension, Messages, ObserverConfig,
    Result, Selector, SiteAdapter,
};
use chatsay_types::{Announcement, NodeId, ObserverState, Site, StreamPhase};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;

/// `.rc` turns under `#root`. A turn is live when it carries `data-new`;
/// `[data-streaming]` is the marker, `.thinking` the indicator and `.body`
/// the segment parent. `[data-empty-chat]` anywhere marks a fresh chat and
/// `data-fail` makes classification error.
struct MockAdapter {
    rc: Selector,
    marker: Selector,
    thinking: Selector,
    empty: Selector,
}

impl MockAdapter {
    fn new() -> Self {
        Self {
            rc: Selector::parse(".rc").unwrap(),
            marker: Selector::parse("[data-streaming]").unwrap(),
            thinking: Selector::parse(".thinking").unwrap(),
            empty: Selector::parse("[data-empty-chat]").unwrap(),
        }
    }
}

#[async_trait]
impl SiteAdapter for MockAdapter {
    fn site(&self) -> Site {
        Site::Claude
    }

    async fn locate_chat_root(&self, document: &Document) -> Result<Option<NodeId>> {
        document.query_selector(document.root(), "#root")
    }

    async fn locate_replay_anchor(&self, document: &Document) -> Result<Option<NodeId>> {
        document.query_selector(document.root(), "#anchor")
    }

    fn is_this_empty_chat(&self, document: &Document) -> bool {
        document.select_first(document.root(), &self.empty).is_some()
    }

    fn is_rc(&self, document: &Document, node: NodeId) -> bool {
        document.matches(node, &self.rc)
    }

    async fn is_new_rc(&self, document: &Document, node: NodeId) -> Result<bool> {
        if document.has_attribute(node, "data-fail") {
            return Err(ChatsayError::ClassifierError("bad node".into()));
        }
        Ok(document.has_attribute(node, "data-new"))
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

struct Page {
    document: Document,
    observer: ChatObserver,
    rx: UnboundedReceiver<Announcement>,
}

impl Page {
    fn new(body: &str) -> Self {
        Self::with_config(body, ObserverConfig::default())
    }

    fn with_config(body: &str, config: ObserverConfig) -> Self {
        let document = Document::with_body(body).unwrap();
        let (announcer, rx) = ChannelAnnouncer::new();
        let observer = ChatObserver::new(
            document.clone(),
            Arc::new(MockAdapter::new()),
            Arc::new(announcer),
            config,
            Messages::default(),
        );
        Self { document, observer, rx }
    }

    fn find(&self, selector: &str) -> NodeId {
        self.document
            .query_selector(self.document.root(), selector)
            .unwrap()
            .unwrap_or_else(|| panic!("no element matches {}", selector))
    }

    fn connect(&self) {
        let anchor = self.document.query_selector(self.document.root(), "#anchor").unwrap();
        self.observer.connect(self.find("#root"), anchor).unwrap();
    }

    fn announcements(&mut self) -> Vec<Announcement> {
        let mut out = Vec::new();
        while let Ok(a) = self.rx.try_recv() {
            out.push(a);
        }
        out
    }

    fn texts(&mut self) -> Vec<String> {
        self.announcements().into_iter().map(|a| a.text).collect()
    }

    fn spoken_segments(&mut self) -> Vec<String> {
        self.announcements()
            .into_iter()
            .filter(|a| a.is_primary())
            .map(|a| a.text)
            .collect()
    }
}

/// Past history draining plus the settle delay.
const PAST_SETTLE: Duration = Duration::from_millis(6_100);

#[tokio::test(start_paused = true)]
async fn test_existing_responses_counted_once() {
    let mut page = Page::new(
        r#"<div id=root>
             <div class=rc><div class=body><p>one</p></div></div>
             <div class=rc><div class=body><p>two</p></div></div>
             <div class=rc><div class=body><p>three</p></div></div>
           </div>"#,
    );
    page.connect();
    assert_eq!(page.observer.state(), ObserverState::DrainingHistory);
    assert_eq!(page.texts(), vec!["3 existing responses"]);

    sleep(PAST_SETTLE).await;
    assert_eq!(page.observer.state(), ObserverState::ObservingNew);
    assert!(page.texts().is_empty());
    assert!(page.observer.tracked_responses().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_empty_chat_skips_history() {
    let mut page = Page::new("<div data-empty-chat></div><div id=root></div>");
    page.connect();
    assert_eq!(page.observer.state(), ObserverState::ObservingNew);

    sleep(Duration::from_secs(20)).await;
    assert!(page.texts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_streaming_response_spoken_once_in_order() {
    let mut page = Page::new("<div data-empty-chat></div><div id=root></div>");
    page.connect();
    let root = page.find("#root");

    sleep(Duration::from_millis(10)).await;
    let rc = page
        .document
        .append_html(root, r#"<div class=rc data-new><div data-streaming="true"></div><div class=body></div></div>"#)
        .unwrap()[0];
    sleep(Duration::from_millis(100)).await;
    assert_eq!(page.observer.tracked_responses(), vec![(rc, StreamPhase::Streaming)]);

    let body = page.document.query_selector(rc, ".body").unwrap().unwrap();
    page.document.append_html(body, "<p>A</p><p>B</p>").unwrap();
    sleep(Duration::from_millis(300)).await;
    page.document.append_html(body, "<p>C</p>").unwrap();
    // re-render without a content change
    let a = page.document.query_selector(body, "p").unwrap().unwrap();
    page.document.set_attribute(a, "class", "rendered").unwrap();
    sleep(Duration::from_millis(300)).await;

    let marker = page.document.query_selector(rc, "[data-streaming]").unwrap().unwrap();
    page.document.set_attribute(marker, "data-streaming", "false").unwrap();
    sleep(Duration::from_secs(2)).await;

    assert_eq!(page.spoken_segments(), vec!["A", "B", "C"]);
    assert_eq!(page.observer.tracked_responses(), vec![(rc, StreamPhase::Complete)]);
    assert_eq!(page.observer.announced_through(rc), Some(2));

    // later mutations of a finished response are not spoken again
    page.document.set_text(a, "A").unwrap();
    sleep(Duration::from_secs(2)).await;
    assert!(page.spoken_segments().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_history_batch_announced_as_count() {
    let mut page = Page::new(r#"<div id=root><div class=rc></div></div>"#);
    page.connect();
    assert_eq!(page.texts(), vec!["1 existing response"]);
    let root = page.find("#root");

    sleep(Duration::from_millis(500)).await;
    page.document
        .append_html(root, "<div class=rc></div><div class=rc></div><p>not a response</p>")
        .unwrap();
    sleep(Duration::from_millis(1_500)).await;
    page.document.append_html(root, "<div class=rc></div>").unwrap();

    sleep(Duration::from_millis(1_900)).await;
    assert_eq!(page.observer.state(), ObserverState::DrainingHistory);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(page.observer.state(), ObserverState::ObservingNew);
    assert_eq!(page.texts(), vec!["3 previous responses loaded"]);
}

#[tokio::test(start_paused = true)]
async fn test_history_ceiling_forces_progress() {
    let mut page = Page::new(r#"<div id=root></div>"#);
    page.connect();
    let root = page.find("#root");

    let writer = page.document.clone();
    tokio::spawn(async move {
        for _ in 0..30 {
            sleep(Duration::from_secs(1)).await;
            writer.append_html(root, "<div class=rc></div>").unwrap();
        }
    });

    sleep(Duration::from_millis(14_900)).await;
    assert_eq!(page.observer.state(), ObserverState::DrainingHistory);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(page.observer.state(), ObserverState::ObservingNew);

    let texts = page.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].ends_with("previous responses loaded"), "{:?}", texts);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_resets_connection_state() {
    let mut page = Page::new("<div data-empty-chat></div><div id=root></div>");
    page.connect();
    let first_id = page.observer.connection_id();
    let root = page.find("#root");
    page.document
        .append_html(
            root,
            r#"<div class=rc data-new><div data-streaming="true"></div><div class=body><p>A</p></div></div>"#,
        )
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(page.observer.tracked_responses().len(), 1);

    page.document.remove(root).unwrap();
    page.observer.disconnect();
    assert_eq!(page.observer.state(), ObserverState::Disconnected);
    assert!(page.observer.tracked_responses().is_empty());
    sleep(Duration::from_millis(1)).await;
    assert_eq!(page.document.observer_count(), 0);
    assert_eq!(page.texts(), vec!["Responding..."]);

    // a fresh root with identical content behaves like a first connection
    let body = page.document.body();
    let root = page
        .document
        .append_html(
            body,
            r#"<div id=root><div class=rc data-new><div data-streaming="false"></div><div class=body><p>A</p></div></div></div>"#,
        )
        .unwrap()[0];
    page.observer.connect(root, None).unwrap();
    assert_ne!(page.observer.connection_id(), first_id);
    assert_eq!(page.observer.state(), ObserverState::ObservingNew);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(page.texts(), vec!["Responding...", "A"]);
}

#[tokio::test(start_paused = true)]
async fn test_connect_fails_fast_on_stale_root() {
    let page = Page::new("<div id=root></div>");
    let root = page.find("#root");
    page.document.remove(root).unwrap();
    assert!(page.observer.connect(root, None).is_err());
    assert_eq!(page.observer.state(), ObserverState::Disconnected);
    assert_eq!(page.document.observer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failsafe_reports_stalled_response() {
    let mut page = Page::with_config(
        "<div data-empty-chat></div><div id=root></div>",
        ObserverConfig {
            heartbeat_ms: 120_000,
            ..ObserverConfig::default()
        },
    );
    page.connect();
    let root = page.find("#root");
    page.document
        .append_html(root, r#"<div class=rc data-new><div class=body><p>partial</p></div></div>"#)
        .unwrap();

    sleep(Duration::from_secs(29)).await;
    assert!(page.texts().is_empty());
    sleep(Duration::from_secs(2)).await;
    // whatever arrived is still spoken before giving up
    assert_eq!(page.texts(), vec!["partial", "Unknown error, stop waiting"]);
    assert_eq!(page.observer.tracked_responses()[0].1, StreamPhase::Abandoned);
}

#[tokio::test(start_paused = true)]
async fn test_replay_anchor_receives_new_responses() {
    let mut page = Page::new(
        r#"<div id=root><div class=rc><div class=body><p>old</p></div></div></div><div id=anchor></div>"#,
    );
    page.connect();
    assert_eq!(page.texts(), vec!["1 existing response"]);
    sleep(PAST_SETTLE).await;

    let anchor = page.find("#anchor");
    page.document
        .append_html(
            anchor,
            r#"<div class=rc data-new><div class=thinking></div><div data-streaming="true"></div></div>"#,
        )
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    let rc = page.observer.tracked_responses()[0].0;
    let marker = page.document.query_selector(rc, "[data-streaming]").unwrap().unwrap();
    page.document.append_html(rc, "<div class=body><p>new</p></div>").unwrap();
    page.document.set_attribute(marker, "data-streaming", "false").unwrap();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(page.texts(), vec!["Responding...", "new"]);
}

#[tokio::test(start_paused = true)]
async fn test_removed_anchor_falls_back_to_chat_root() {
    let mut page = Page::new("<div id=root></div><div id=anchor></div>");
    page.connect();
    sleep(PAST_SETTLE).await;

    page.document.remove(page.find("#anchor")).unwrap();
    sleep(Duration::from_millis(10)).await;
    let root = page.find("#root");
    let rc = page
        .document
        .append_html(
            root,
            r#"<div class=rc data-new><div data-streaming="true"></div><div class=body><p>fresh</p></div></div>"#,
        )
        .unwrap()[0];
    sleep(Duration::from_millis(100)).await;
    assert_eq!(page.observer.tracked_responses(), vec![(rc, StreamPhase::Streaming)]);

    let marker = page.document.query_selector(rc, "[data-streaming]").unwrap().unwrap();
    page.document.set_attribute(marker, "data-streaming", "false").unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(page.texts(), vec!["Responding...", "fresh"]);
}

#[tokio::test(start_paused = true)]
async fn test_rerendered_anchor_is_followed() {
    let mut page = Page::new("<div id=root></div><div id=anchor></div>");
    page.connect();
    sleep(PAST_SETTLE).await;

    // the anchor is swapped for a new one that already holds the reply
    page.document.remove(page.find("#anchor")).unwrap();
    let body = page.document.body();
    page.document
        .append_html(
            body,
            r#"<div id=anchor><div class=rc data-new><div data-streaming="true"></div><div class=body><p>swapped</p></div></div></div>"#,
        )
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    let tracked = page.observer.tracked_responses();
    assert_eq!(tracked.len(), 1);

    let marker = page.document.query_selector(tracked[0].0, "[data-streaming]").unwrap().unwrap();
    page.document.set_attribute(marker, "data-streaming", "false").unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(page.texts(), vec!["Responding...", "swapped"]);

    // later replies land in the new anchor too
    let anchor = page.find("#anchor");
    page.document
        .append_html(
            anchor,
            r#"<div class=rc data-new><div data-streaming="false"></div><div class=body><p>next</p></div></div>"#,
        )
        .unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(page.texts(), vec!["Responding...", "next"]);
}

#[tokio::test(start_paused = true)]
async fn test_failing_classification_does_not_block_siblings() {
    let mut page = Page::new("<div data-empty-chat></div><div id=root></div>");
    page.connect();
    sleep(Duration::from_millis(10)).await;

    let root = page.find("#root");
    let added = page
        .document
        .append_html(
            root,
            r#"<div class=rc data-fail data-new><div class=body><p>broken</p></div></div>
               <div class=rc data-new><div data-streaming="true"></div><div class=body><p>ok</p></div></div>"#,
        )
        .unwrap();
    let good = added[added.len() - 1];
    sleep(Duration::from_millis(100)).await;
    assert_eq!(page.observer.tracked_responses(), vec![(good, StreamPhase::Streaming)]);

    let marker = page.document.query_selector(good, "[data-streaming]").unwrap().unwrap();
    page.document.set_attribute(marker, "data-streaming", "false").unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(page.texts(), vec!["Responding...", "ok"]);
}

#[tokio::test(start_paused = true)]
async fn test_live_response_during_history_is_tracked_after_drain() {
    let mut page = Page::new(r#"<div id=root><div class=rc><div class=body><p>old</p></div></div></div>"#);
    page.connect();
    let root = page.find("#root");

    sleep(Duration::from_millis(500)).await;
    let added = page
        .document
        .append_html(
            root,
            r#"<div class=rc data-new><div data-streaming="true"></div><div class=body><p>early</p></div></div>
               <div class=rc data-new><div data-streaming="false"></div><div class=body><p>replayed</p></div></div>"#,
        )
        .unwrap();
    let live = added[0];
    sleep(Duration::from_millis(500)).await;
    assert_eq!(page.observer.state(), ObserverState::DrainingHistory);
    let marker = page.document.query_selector(live, "[data-streaming]").unwrap().unwrap();
    page.document.set_attribute(marker, "data-streaming", "false").unwrap();

    sleep(PAST_SETTLE).await;
    assert_eq!(page.observer.state(), ObserverState::ObservingNew);
    assert_eq!(page.texts(), vec!["1 existing response", "Responding...", "early"]);
    assert_eq!(page.observer.tracked_responses(), vec![(live, StreamPhase::Complete)]);
}

#[tokio::test(start_paused = true)]
async fn test_losing_root_does_not_mark_next_chat_empty() {
    let document = Document::with_body(
        r#"<main id=app><div class=chat-thread><div data-test-render-count=1></div></div></main>"#,
    )
    .unwrap();
    let app = document.query_selector(document.body(), "#app").unwrap().unwrap();
    let (announcer, mut rx) = ChannelAnnouncer::new();
    let extension = Extension::new(
        document.clone(),
        adapter_for(Site::Claude, None).unwrap(),
        Arc::new(announcer),
        ObserverConfig::default(),
        Messages::default(),
    );
    extension.init();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(rx.try_recv().unwrap().text, "1 existing response");

    // navigating away removes the thread without showing a new-chat greeting
    document.set_inner_html(app, "").unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(extension.observer().state(), ObserverState::Disconnected);

    document
        .set_inner_html(
            app,
            r#"<div class=chat-thread><div data-test-render-count=1></div><div data-test-render-count=1></div></div>"#,
        )
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(extension.observer().state(), ObserverState::DrainingHistory);
    assert_eq!(rx.try_recv().unwrap().text, "2 existing responses");

    extension.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_extension_follows_chat_root() {
    let document = Document::with_body("<main id=app><div data-home-screen></div></main>").unwrap();
    let app = document.query_selector(document.body(), "#app").unwrap().unwrap();
    let (announcer, mut rx) = ChannelAnnouncer::new();
    let extension = Extension::new(
        document.clone(),
        adapter_for(Site::Grok, None).unwrap(),
        Arc::new(announcer),
        ObserverConfig::default(),
        Messages::default(),
    );
    extension.init();
    assert!(extension.is_running());
    sleep(Duration::from_millis(50)).await;
    assert_eq!(extension.observer().state(), ObserverState::Disconnected);

    // chat opened from the home screen
    let root = document.set_inner_html(app, "<div data-chat-root></div>").unwrap()[0];
    sleep(Duration::from_millis(200)).await;
    assert_eq!(extension.observer().state(), ObserverState::DrainingHistory);
    sleep(PAST_SETTLE).await;
    assert_eq!(extension.observer().state(), ObserverState::ObservingNew);

    let rc = document
        .append_html(root, "<div id=response-1><div data-thinking></div></div>")
        .unwrap()[0];
    sleep(Duration::from_millis(100)).await;
    let thinking = document.query_selector(rc, "[data-thinking]").unwrap().unwrap();
    document.remove(thinking).unwrap();
    let bubble = document
        .append_html(
            rc,
            r#"<div data-streaming="true"><div class=response-content-markdown><p>Hello</p><ul><li>x</li></ul></div></div>"#,
        )
        .unwrap()[0];
    sleep(Duration::from_millis(100)).await;
    document.set_attribute(bubble, "data-streaming", "false").unwrap();
    sleep(Duration::from_secs(1)).await;

    let mut texts = Vec::new();
    while let Ok(a) = rx.try_recv() {
        texts.push(a.text);
    }
    assert_eq!(texts, vec!["Thinking...", "Responding...", "Hello", "<li>x</li>"]);

    // back to the home screen, then straight into a new chat
    document.set_inner_html(app, "<div data-home-screen></div>").unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(extension.observer().state(), ObserverState::Disconnected);
    document.set_inner_html(app, "<div data-chat-root></div>").unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(extension.observer().state(), ObserverState::ObservingNew);

    extension.teardown();
    assert!(!extension.is_running());
    sleep(Duration::from_millis(10)).await;
    assert_eq!(document.observer_count(), 0);
}
