//! Replays the bundled scenarios and checks what would be spoken.

use chatsay_cli::config::Config;
use chatsay_cli::scenario::{replay, ReplayOptions, Scenario, ScenarioError};
use chatsay_types::{AnnouncePolicy, ObserverState, Site, StreamPhase};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn bundled(name: &str) -> Scenario {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scenarios").join(name);
    Scenario::load(&path).unwrap()
}

fn texts(report: &chatsay_cli::scenario::ReplayReport) -> Vec<&str> {
    report.announcements.iter().map(|a| a.text.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_claude_streamed_reply() {
    let report = replay(&bundled("claude.toml"), ReplayOptions::default(), |_| {})
        .await
        .unwrap();

    assert_eq!(report.site, Site::Claude);
    assert_eq!(
        texts(&report),
        vec![
            "1 existing response",
            "Responding...",
            "Hello there.",
            "<li>First</li><li>Second</li>",
            "Done.",
        ]
    );
    assert!(report.announcements[3].options.markup);
    assert_eq!(report.final_state, ObserverState::ObservingNew);
    assert_eq!(report.responses.len(), 1);
    assert_eq!(report.responses[0].1, StreamPhase::Complete);
}

#[tokio::test(start_paused = true)]
async fn test_gemini_replay_anchor_with_thinking() {
    let report = replay(&bundled("gemini.toml"), ReplayOptions::default(), |_| {})
        .await
        .unwrap();

    assert_eq!(
        texts(&report),
        vec![
            "1 existing response",
            "Thinking...",
            "Still thinking...",
            "Responding...",
            "Gemini says hi.",
            "Second paragraph.",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_grok_stalled_reply_gives_up() {
    let mut live = Vec::new();
    let report = replay(&bundled("grok.toml"), ReplayOptions::default(), |a| live.push(a.text.clone()))
        .await
        .unwrap();

    assert_eq!(
        texts(&report),
        vec![
            "Responding...",
            "Loading...",
            "Loading...",
            "Partial answer",
            "Unknown error, stop waiting",
        ]
    );
    assert_eq!(live, texts(&report));
    assert_eq!(report.spoken(), vec!["Partial answer"]);
    assert_eq!(report.responses[0].1, StreamPhase::Abandoned);
}

#[tokio::test(start_paused = true)]
async fn test_config_messages_and_policy_apply() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(
        br#"
        [observer]
        policy = "incremental"
        segment_wait_ms = 100

        [messages]
        existing_response = "one old answer"
        responding = "Answering"
        "#,
    )
    .unwrap();
    let config = Config::load_from(file.path()).unwrap();
    assert_eq!(config.observer.policy, AnnouncePolicy::Incremental);

    let options = ReplayOptions {
        observer: config.observer,
        messages: config.messages,
        ..ReplayOptions::default()
    };
    let report = replay(&bundled("claude.toml"), options, |_| {}).await.unwrap();
    assert_eq!(
        texts(&report),
        vec![
            "one old answer",
            "Answering",
            "Hello there.",
            "<li>First</li><li>Second</li>",
            "Done.",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_site_is_reported() {
    let scenario: Scenario = toml::from_str(r#"initial_html = "<p>x</p>""#).unwrap();
    let err = replay(&scenario, ReplayOptions::default(), |_| {}).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<ScenarioError>(), Some(ScenarioError::NoSite)));
}
