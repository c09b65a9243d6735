//! Speech sinks.

use chatsay_types::{AnnounceOptions, Announcement};
use tokio::sync::mpsc;
use tracing::debug;

/// Receives text destined for the screen reader.
///
/// Fire-and-forget: implementations must not fail or block.
pub trait Announcer: Send + Sync {
    fn announce(&self, text: &str, options: AnnounceOptions);
}

/// Forwards announcements into a channel and logs them under
/// `chatsay::speech`.
#[derive(Debug, Clone)]
pub struct ChannelAnnouncer {
    tx: mpsc::UnboundedSender<Announcement>,
}

impl ChannelAnnouncer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Announcement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Announcer for ChannelAnnouncer {
    fn announce(&self, text: &str, options: AnnounceOptions) {
        debug!(
            target: "chatsay::speech",
            primary = options.primary,
            markup = options.markup,
            "{}",
            text
        );
        if self.tx.send(Announcement::new(text, options)).is_err() {
            debug!(target: "chatsay::speech", "Announcement dropped, receiver closed");
        }
    }
}
