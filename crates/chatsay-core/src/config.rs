//! Engine timing and message configuration.

use chatsay_types::AnnouncePolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing knobs for the observation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// Quiet window that ends history draining.
    #[serde(default = "default_history_quiet_ms")]
    pub history_quiet_ms: u64,
    /// Hard ceiling on history draining.
    #[serde(default = "default_history_ceiling_ms")]
    pub history_ceiling_ms: u64,
    /// Delay between the end of history draining and new-response detection.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Per-response ceiling without forward progress.
    #[serde(default = "default_failsafe_ms")]
    pub failsafe_ms: u64,
    #[serde(default = "default_thinking_poll_ms")]
    pub thinking_poll_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Quiet window before the newest segment is spoken in incremental mode.
    #[serde(default = "default_segment_wait_ms")]
    pub segment_wait_ms: u64,
    /// Quiet window after the streaming marker reports completion.
    #[serde(default = "default_completion_quiet_ms")]
    pub completion_quiet_ms: u64,
    #[serde(default = "default_classify_timeout_ms")]
    pub classify_timeout_ms: u64,
    #[serde(default = "default_watcher_poll_ms")]
    pub watcher_poll_ms: u64,
    #[serde(default = "default_watcher_debounce_ms")]
    pub watcher_debounce_ms: u64,
    #[serde(default)]
    pub policy: AnnouncePolicy,
    /// Speak the empty-segment marker. When off it is only logged.
    #[serde(default = "default_announce_empty_segments")]
    pub announce_empty_segments: bool,
}

fn default_history_quiet_ms() -> u64 {
    2_000
}

fn default_history_ceiling_ms() -> u64 {
    15_000
}

fn default_settle_ms() -> u64 {
    4_000
}

fn default_failsafe_ms() -> u64 {
    30_000
}

fn default_thinking_poll_ms() -> u64 {
    5_000
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

fn default_segment_wait_ms() -> u64 {
    4_000
}

fn default_completion_quiet_ms() -> u64 {
    500
}

fn default_classify_timeout_ms() -> u64 {
    5_000
}

fn default_watcher_poll_ms() -> u64 {
    1_000
}

fn default_watcher_debounce_ms() -> u64 {
    100
}

fn default_announce_empty_segments() -> bool {
    true
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            history_quiet_ms: default_history_quiet_ms(),
            history_ceiling_ms: default_history_ceiling_ms(),
            settle_ms: default_settle_ms(),
            failsafe_ms: default_failsafe_ms(),
            thinking_poll_ms: default_thinking_poll_ms(),
            heartbeat_ms: default_heartbeat_ms(),
            segment_wait_ms: default_segment_wait_ms(),
            completion_quiet_ms: default_completion_quiet_ms(),
            classify_timeout_ms: default_classify_timeout_ms(),
            watcher_poll_ms: default_watcher_poll_ms(),
            watcher_debounce_ms: default_watcher_debounce_ms(),
            policy: AnnouncePolicy::default(),
            announce_empty_segments: default_announce_empty_segments(),
        }
    }
}

impl ObserverConfig {
    pub fn history_quiet(&self) -> Duration {
        Duration::from_millis(self.history_quiet_ms)
    }

    pub fn history_ceiling(&self) -> Duration {
        Duration::from_millis(self.history_ceiling_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn failsafe(&self) -> Duration {
        Duration::from_millis(self.failsafe_ms)
    }

    pub fn thinking_poll(&self) -> Duration {
        Duration::from_millis(self.thinking_poll_ms.max(1))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(1))
    }

    pub fn segment_wait(&self) -> Duration {
        Duration::from_millis(self.segment_wait_ms)
    }

    pub fn completion_quiet(&self) -> Duration {
        Duration::from_millis(self.completion_quiet_ms)
    }

    pub fn classify_timeout(&self) -> Duration {
        Duration::from_millis(self.classify_timeout_ms)
    }

    pub fn watcher_poll(&self) -> Duration {
        Duration::from_millis(self.watcher_poll_ms.max(1))
    }

    pub fn watcher_debounce(&self) -> Duration {
        Duration::from_millis(self.watcher_debounce_ms)
    }
}

/// Spoken status messages. `{count}` is replaced with a number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Messages {
    #[serde(default = "default_existing_response")]
    pub existing_response: String,
    #[serde(default = "default_existing_responses")]
    pub existing_responses: String,
    #[serde(default = "default_previous_response")]
    pub previous_response: String,
    #[serde(default = "default_previous_responses")]
    pub previous_responses: String,
    #[serde(default = "default_thinking")]
    pub thinking: String,
    #[serde(default = "default_still_thinking")]
    pub still_thinking: String,
    #[serde(default = "default_responding")]
    pub responding: String,
    #[serde(default = "default_loading")]
    pub loading: String,
    #[serde(default = "default_stop_waiting")]
    pub stop_waiting: String,
    #[serde(default = "default_empty_segment")]
    pub empty_segment: String,
}

fn default_existing_response() -> String {
    "1 existing response".to_string()
}

fn default_existing_responses() -> String {
    "{count} existing responses".to_string()
}

fn default_previous_response() -> String {
    "1 previous response loaded".to_string()
}

fn default_previous_responses() -> String {
    "{count} previous responses loaded".to_string()
}

fn default_thinking() -> String {
    "Thinking...".to_string()
}

fn default_still_thinking() -> String {
    "Still thinking...".to_string()
}

fn default_responding() -> String {
    "Responding...".to_string()
}

fn default_loading() -> String {
    "Loading...".to_string()
}

fn default_stop_waiting() -> String {
    "Unknown error, stop waiting".to_string()
}

fn default_empty_segment() -> String {
    "[empty segment]".to_string()
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            existing_response: default_existing_response(),
            existing_responses: default_existing_responses(),
            previous_response: default_previous_response(),
            previous_responses: default_previous_responses(),
            thinking: default_thinking(),
            still_thinking: default_still_thinking(),
            responding: default_responding(),
            loading: default_loading(),
            stop_waiting: default_stop_waiting(),
            empty_segment: default_empty_segment(),
        }
    }
}

impl Messages {
    pub fn existing(&self, count: usize) -> String {
        plural(&self.existing_response, &self.existing_responses, count)
    }

    pub fn previous(&self, count: usize) -> String {
        plural(&self.previous_response, &self.previous_responses, count)
    }
}

fn plural(one: &str, many: &str, count: usize) -> String {
    let template = if count == 1 { one } else { many };
    template.replace("{count}", &count.to_string())
}
