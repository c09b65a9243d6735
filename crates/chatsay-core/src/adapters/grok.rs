use super::{CompiledProfile, SiteProfile};
use crate::classifier::SiteAdapter;
use crate::dom::Document;
use crate::Result;
use async_trait::async_trait;
use chatsay_types::{NodeId, Site};

pub(super) fn default_profile() -> SiteProfile {
    SiteProfile {
        chat_root: "[data-chat-root]".to_string(),
        replay_anchor: None,
        stable_ancestor: None,
        response_container: "div[id^=response-]".to_string(),
        response_element: ".response-content-markdown".to_string(),
        streaming_marker: "[data-streaming]".to_string(),
        streaming_attribute: "data-streaming".to_string(),
        streaming_done_values: vec!["false".to_string()],
        thinking_indicator: Some("[data-thinking]".to_string()),
        empty_chat: Some("[data-home-screen]".to_string()),
        new_rc_wait_ms: 500,
    }
}

/// Grok marks a live reply with a thinking placeholder, then a
/// `data-streaming` bubble.
#[derive(Debug, Clone)]
pub struct GrokAdapter {
    profile: CompiledProfile,
}

impl GrokAdapter {
    pub fn new() -> Result<Self> {
        Self::with_profile(&default_profile())
    }

    pub fn with_profile(profile: &SiteProfile) -> Result<Self> {
        Ok(Self {
            profile: profile.compile()?,
        })
    }

    fn looks_live(&self, document: &Document, rc: NodeId) -> bool {
        self.profile.thinking_indicator(document, rc).is_some() || self.profile.is_streaming(document, rc)
    }
}

#[async_trait]
impl SiteAdapter for GrokAdapter {
    fn site(&self) -> Site {
        Site::Grok
    }

    fn stable_ancestor(&self, document: &Document) -> NodeId {
        self.profile.stable_ancestor(document)
    }

    async fn locate_chat_root(&self, document: &Document) -> Result<Option<NodeId>> {
        Ok(self.profile.chat_root(document))
    }

    fn is_this_empty_chat(&self, document: &Document) -> bool {
        self.profile.shows_empty_chat(document)
    }

    fn is_rc(&self, document: &Document, node: NodeId) -> bool {
        self.profile.is_rc(document, node)
    }

    async fn is_new_rc(&self, document: &Document, node: NodeId) -> Result<bool> {
        Ok(self
            .profile
            .wait_on_rc(document, node, |d| self.looks_live(d, node))
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
