//! Announcement types handed to the speech sink.

use serde::{Deserialize, Serialize};

/// Delivery hints for an announcement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceOptions {
    /// Response content, as opposed to status chatter ("responding", "loading").
    #[serde(default)]
    pub primary: bool,
    /// Text is serialized markup and should be rendered, not read literally.
    #[serde(default)]
    pub markup: bool,
}

impl AnnounceOptions {
    /// Status message.
    pub fn status() -> Self {
        Self::default()
    }

    /// Response segment content.
    pub fn segment(markup: bool) -> Self {
        Self {
            primary: true,
            markup,
        }
    }
}

/// A single message for the screen reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub text: String,
    #[serde(default)]
    pub options: AnnounceOptions,
}

impl Announcement {
    pub fn new(text: impl Into<String>, options: AnnounceOptions) -> Self {
        Self {
            text: text.into(),
            options,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.options.primary
    }
}
