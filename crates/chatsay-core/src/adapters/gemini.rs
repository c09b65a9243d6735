use super::{CompiledProfile, SiteProfile};
use crate::classifier::SiteAdapter;
use crate::dom::Document;
use crate::Result;
use async_trait::async_trait;
use chatsay_types::{NodeId, Site};

pub(super) fn default_profile() -> SiteProfile {
    SiteProfile {
        chat_root: "#chat-history > .chat-history-scroll-container".to_string(),
        replay_anchor: Some("[data-replay-anchor]".to_string()),
        stable_ancestor: None,
        response_container: ".conversation-container".to_string(),
        response_element: "message-content .markdown".to_string(),
        streaming_marker: "message-content".to_string(),
        streaming_attribute: "aria-busy".to_string(),
        streaming_done_values: vec!["false".to_string()],
        thinking_indicator: Some("model-thoughts".to_string()),
        empty_chat: Some(".zero-state-container".to_string()),
        new_rc_wait_ms: 500,
    }
}

/// Gemini renders the newest turn into a replay anchor before moving it
/// into the history list, and marks a streaming reply with `aria-busy`.
#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    profile: CompiledProfile,
}

impl GeminiAdapter {
    pub fn new() -> Result<Self> {
        Self::with_profile(&default_profile())
    }

    pub fn with_profile(profile: &SiteProfile) -> Result<Self> {
        Ok(Self {
            profile: profile.compile()?,
        })
    }

    fn in_replay_anchor(&self, document: &Document, node: NodeId) -> bool {
        self.profile
            .replay_anchor(document)
            .is_some_and(|anchor| document.contains(anchor, node))
    }
}

#[async_trait]
impl SiteAdapter for GeminiAdapter {
    fn site(&self) -> Site {
        Site::Gemini
    }

    fn stable_ancestor(&self, document: &Document) -> NodeId {
        self.profile.stable_ancestor(document)
    }

    async fn locate_chat_root(&self, document: &Document) -> Result<Option<NodeId>> {
        Ok(self.profile.chat_root(document))
    }

    async fn locate_replay_anchor(&self, document: &Document) -> Result<Option<NodeId>> {
        Ok(self.profile.replay_anchor(document))
    }

    fn is_this_empty_chat(&self, document: &Document) -> bool {
        self.profile.shows_empty_chat(document)
    }

    fn is_rc(&self, document: &Document, node: NodeId) -> bool {
        self.profile.is_rc(document, node)
    }

    async fn is_new_rc(&self, document: &Document, node: NodeId) -> Result<bool> {
        if self.in_replay_anchor(document, node) {
            return Ok(true);
        }
        let profile = &self.profile;
        Ok(profile
            .wait_on_rc(document, node, |d| {
                profile.is_streaming(d, node) || profile.thinking_indicator(d, node).is_some()
            })
            .await)
    }

    fn parse_response_container(&self, document: &Document, node: NodeId) -> Option<NodeId> {
        self.profile.parse_response_container(document, node)
    }

    fn parse_response_elements(&self, document: &Document, rc: NodeId) -> Vec<NodeId> {
        self.profile.parse_response_elements(document, rc)
    }

    fn thinking_indicator(&self, document: &Document, rc: NodeId) -> Option<NodeId> {
        self.profile.thinking_indicator(document, rc)
    }

    fn streaming_marker(&self, document: &Document, rc: NodeId) -> Option<NodeId> {
        self.profile.streaming_marker(document, rc)
    }

    fn is_streaming_complete(&self, document: &Document, marker: NodeId) -> bool {
        self.profile.is_streaming_complete(document, marker)
    }
}
