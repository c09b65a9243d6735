//! Observer state machine vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a node sighted under a chat root.
///
/// Derived on every sighting; never stored as the canonical state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RcKind {
    /// Not a response container.
    NotRc,
    /// Present when the chat root first became available.
    ExistingRc,
    /// Added while history was being backfilled.
    PrevRc,
    /// A live reply to a just-submitted prompt.
    NewRc,
}

impl RcKind {
    pub fn is_response(&self) -> bool {
        !matches!(self, RcKind::NotRc)
    }
}

/// Connection state of the chat observer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverState {
    #[default]
    Disconnected,
    Connecting,
    DrainingHistory,
    ObservingNew,
}

impl fmt::Display for ObserverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObserverState::Disconnected => "disconnected",
            ObserverState::Connecting => "connecting",
            ObserverState::DrainingHistory => "draining_history",
            ObserverState::ObservingNew => "observing_new",
        };
        f.write_str(name)
    }
}

/// Phase of a single response's streaming lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    /// Site shows a "thinking" indicator; no output yet.
    Thinking,
    /// Waiting for the streaming marker to appear.
    AwaitingStart,
    /// Output is streaming; waiting for the marker to signal completion.
    Streaming,
    /// Completed and fully announced.
    Complete,
    /// Torn down before completion (disconnect or failsafe).
    Abandoned,
}

impl StreamPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamPhase::Complete | StreamPhase::Abandoned)
    }
}

/// When response segments are spoken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnouncePolicy {
    /// Speak segments once the response has finished streaming.
    #[default]
    CompletionOnly,
    /// Speak all but the newest segment as soon as a newer sibling appears,
    /// and the newest one after a quiet window.
    Incremental,
}
