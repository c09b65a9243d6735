//! Speaks response segments in container order, at most once each.

use crate::announce::Announcer;
use crate::dom::Document;
use chatsay_types::{AnnounceOptions, NodeId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

/// Index of the last segment already handled; `None` before the first.
pub type Cursor = Option<usize>;

/// Segment nodes already spoken during one chat-root connection.
#[derive(Debug, Clone, Default)]
pub struct SpokenSet {
    inner: Arc<Mutex<HashSet<NodeId>>>,
}

impl SpokenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `node`; false if it was already recorded.
    pub fn insert(&self, node: NodeId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&node)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Speakable content extracted from a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentText {
    pub text: String,
    pub markup: bool,
}

/// Extract what should be spoken for `segment`: serialized markup when the
/// segment has structure, its text otherwise, `None` when there is nothing.
pub fn speakable_text(document: &Document, segment: NodeId) -> Option<SegmentText> {
    let html = document.inner_html(segment);
    let html = html.trim();
    if !html.is_empty() {
        return Some(SegmentText {
            markup: html.contains('<'),
            text: html.to_string(),
        });
    }

    let text = document.text_content(segment);
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(SegmentText {
            text: text.to_string(),
            markup: false,
        })
    }
}

pub struct SegmentAnnouncer {
    document: Document,
    announcer: Arc<dyn Announcer>,
    spoken: SpokenSet,
    empty_marker: String,
    announce_empty: bool,
}

impl SegmentAnnouncer {
    pub fn new(document: Document, announcer: Arc<dyn Announcer>, spoken: SpokenSet) -> Self {
        Self {
            document,
            announcer,
            spoken,
            empty_marker: "[empty segment]".to_string(),
            announce_empty: true,
        }
    }

    /// Text logged for segments with no content, and spoken unless
    /// `announce` is false.
    pub fn with_empty_marker(mut self, marker: impl Into<String>, announce: bool) -> Self {
        self.empty_marker = marker.into();
        self.announce_empty = announce;
        self
    }

    /// Announce `segments[(cursor, up_to]]` in ascending order and return the
    /// new cursor.
    ///
    /// Indices whose segment is gone are skipped without moving the cursor
    /// onto them. Empty segments are consumed. A segment node already spoken
    /// in this connection is consumed silently.
    pub fn announce_from(&self, segments: &[NodeId], cursor: Cursor, up_to: usize) -> Cursor {
        let start = next_index(cursor);
        if up_to < start {
            return cursor;
        }

        let mut cursor = cursor;
        for index in start..=up_to {
            let Some(&segment) = segments.get(index) else {
                debug!(
                    target: "chatsay::segments",
                    "Segment {} missing ({} known), skipping",
                    index,
                    segments.len()
                );
                continue;
            };
            if !self.document.is_connected(segment) {
                debug!(
                    target: "chatsay::segments",
                    "Segment {} ({}) left the document, skipping",
                    index,
                    segment
                );
                continue;
            }

            if self.spoken.insert(segment) {
                match speakable_text(&self.document, segment) {
                    Some(content) => {
                        trace!(target: "chatsay::segments", "Segment {}: {}", index, content.text);
                        self.announcer
                            .announce(&content.text, AnnounceOptions::segment(content.markup));
                    }
                    None => {
                        debug!(target: "chatsay::segments", "Segment {}: {}", index, self.empty_marker);
                        if self.announce_empty {
                            self.announcer
                                .announce(&self.empty_marker, AnnounceOptions::segment(false));
                        }
                    }
                }
            } else {
                trace!(target: "chatsay::segments", "Segment {} ({}) already spoken", index, segment);
            }
            cursor = Some(index);
        }
        cursor
    }

    /// Announce every segment.
    pub fn announce_all(&self, segments: &[NodeId], cursor: Cursor) -> Cursor {
        match segments.len() {
            0 => cursor,
            len => self.announce_from(segments, cursor, len - 1),
        }
    }

    /// Announce every segment except the newest, which may still be growing.
    pub fn announce_settled(&self, segments: &[NodeId], cursor: Cursor) -> Cursor {
        match segments.len() {
            0 | 1 => cursor,
            len => self.announce_from(segments, cursor, len - 2),
        }
    }
}

/// First index after `cursor`.
pub fn next_index(cursor: Cursor) -> usize {
    cursor.map_or(0, |c| c + 1)
}
