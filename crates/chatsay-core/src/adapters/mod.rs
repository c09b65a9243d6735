//! Built-in site adapters.
//!
//! Each site is a [`SiteProfile`] of selectors plus a little site-specific
//! logic for deciding whether a response is live. Profiles can be replaced
//! from configuration when a site's markup drifts.

mod claude;
mod gemini;
mod grok;

pub use claude::ClaudeAdapter;
pub use gemini::GeminiAdapter;
pub use grok::GrokAdapter;

use crate::classifier::SiteAdapter;
use crate::dom::{Document, ObserveOptions, Selector};
use crate::Result;
use chatsay_types::{NodeId, Site};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Selectors describing one site's chat markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteProfile {
    /// Direct parent of every response container.
    pub chat_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_anchor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_ancestor: Option<String>,
    pub response_container: String,
    /// Parent of the segments, searched inside a container.
    pub response_element: String,
    pub streaming_marker: String,
    pub streaming_attribute: String,
    /// Attribute values meaning streaming has finished. A missing attribute
    /// also counts as finished.
    #[serde(default = "default_done_values")]
    pub streaming_done_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_indicator: Option<String>,
    /// Present only on the fresh-chat view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_chat: Option<String>,
    /// How long newness classification may wait for a streaming marker.
    #[serde(default = "default_new_rc_wait_ms")]
    pub new_rc_wait_ms: u64,
}

fn default_done_values() -> Vec<String> {
    vec!["false".to_string()]
}

fn default_new_rc_wait_ms() -> u64 {
    1_000
}

impl SiteProfile {
    pub fn compile(&self) -> Result<CompiledProfile> {
        let optional = |s: &Option<String>| s.as_deref().map(Selector::parse).transpose();
        Ok(CompiledProfile {
            chat_root: Selector::parse(&self.chat_root)?,
            replay_anchor: optional(&self.replay_anchor)?,
            stable_ancestor: optional(&self.stable_ancestor)?,
            response_container: Selector::parse(&self.response_container)?,
            response_element: Selector::parse(&self.response_element)?,
            streaming_marker: Selector::parse(&self.streaming_marker)?,
            thinking_indicator: optional(&self.thinking_indicator)?,
            empty_chat: optional(&self.empty_chat)?,
            profile: self.clone(),
        })
    }
}

/// A profile with its selectors parsed, plus the matching logic every
/// adapter shares.
#[derive(Debug, Clone)]
pub struct CompiledProfile {
    profile: SiteProfile,
    chat_root: Selector,
    replay_anchor: Option<Selector>,
    stable_ancestor: Option<Selector>,
    response_container: Selector,
    response_element: Selector,
    streaming_marker: Selector,
    thinking_indicator: Option<Selector>,
    empty_chat: Option<Selector>,
}

impl CompiledProfile {
    pub fn profile(&self) -> &SiteProfile {
        &self.profile
    }

    fn new_rc_wait(&self) -> Duration {
        Duration::from_millis(self.profile.new_rc_wait_ms)
    }

    fn stable_ancestor(&self, document: &Document) -> NodeId {
        self.stable_ancestor
            .as_ref()
            .and_then(|s| document.select_first(document.root(), s))
            .unwrap_or_else(|| document.body())
    }

    fn chat_root(&self, document: &Document) -> Option<NodeId> {
        document.select_first(document.root(), &self.chat_root)
    }

    fn replay_anchor(&self, document: &Document) -> Option<NodeId> {
        let selector = self.replay_anchor.as_ref()?;
        document.select_first(document.root(), selector)
    }

    fn shows_empty_chat(&self, document: &Document) -> bool {
        self.empty_chat
            .as_ref()
            .is_some_and(|s| document.select_first(document.root(), s).is_some())
    }

    fn is_rc(&self, document: &Document, node: NodeId) -> bool {
        document.matches(node, &self.response_container)
    }

    fn parse_response_container(&self, document: &Document, node: NodeId) -> Option<NodeId> {
        document.closest(node, &self.response_container)
    }

    fn parse_response_elements(&self, document: &Document, rc: NodeId) -> Vec<NodeId> {
        document.select_all(rc, &self.response_element)
    }

    fn thinking_indicator(&self, document: &Document, rc: NodeId) -> Option<NodeId> {
        let selector = self.thinking_indicator.as_ref()?;
        document.select_first(rc, selector)
    }

    fn streaming_marker(&self, document: &Document, rc: NodeId) -> Option<NodeId> {
        if document.matches(rc, &self.streaming_marker) {
            return Some(rc);
        }
        document.select_first(rc, &self.streaming_marker)
    }

    fn is_streaming_complete(&self, document: &Document, marker: NodeId) -> bool {
        match document.attribute(marker, &self.profile.streaming_attribute) {
            Some(value) => self.profile.streaming_done_values.contains(&value),
            None => true,
        }
    }

    /// Whether `rc` currently carries a marker that says it is streaming.
    fn is_streaming(&self, document: &Document, rc: NodeId) -> bool {
        self.streaming_marker(document, rc)
            .is_some_and(|marker| !self.is_streaming_complete(document, marker))
    }

    /// Wait up to the profile's newness window for `condition` to hold on
    /// `rc`.
    async fn wait_on_rc<F>(&self, document: &Document, rc: NodeId, condition: F) -> bool
    where
        F: FnMut(&Document) -> bool,
    {
        document
            .wait_for(
                rc,
                ObserveOptions::child_list().with_attributes().subtree(),
                self.new_rc_wait(),
                condition,
            )
            .await
    }
}

/// Built-in selector profile for `site`.
pub fn default_profile(site: Site) -> SiteProfile {
    match site {
        Site::Claude => claude::default_profile(),
        Site::Gemini => gemini::default_profile(),
        Site::Grok => grok::default_profile(),
    }
}

/// Adapter for `site`, optionally with its profile replaced.
pub fn adapter_for(site: Site, profile: Option<SiteProfile>) -> Result<Arc<dyn SiteAdapter>> {
    let profile = profile.unwrap_or_else(|| default_profile(site));
    Ok(match site {
        Site::Claude => Arc::new(ClaudeAdapter::with_profile(&profile)?),
        Site::Gemini => Arc::new(GeminiAdapter::with_profile(&profile)?),
        Site::Grok => Arc::new(GrokAdapter::with_profile(&profile)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profiles_compile() {
        for site in Site::ALL {
            assert!(default_profile(site).compile().is_ok(), "{} profile", site);
            assert_eq!(adapter_for(site, None).unwrap().site(), site);
        }
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let mut profile = default_profile(Site::Grok);
        profile.response_container = "div[".to_string();
        assert!(adapter_for(Site::Grok, Some(profile)).is_err());
    }

    #[test]
    fn test_missing_attribute_counts_as_complete() {
        let document = Document::with_body("<div class=rc><span class=m></span></div>").unwrap();
        let profile = SiteProfile {
            chat_root: "body".into(),
            replay_anchor: None,
            stable_ancestor: None,
            response_container: ".rc".into(),
            response_element: ".m".into(),
            streaming_marker: ".m".into(),
            streaming_attribute: "data-streaming".into(),
            streaming_done_values: default_done_values(),
            thinking_indicator: None,
            empty_chat: None,
            new_rc_wait_ms: 10,
        }
        .compile()
        .unwrap();

        let rc = document.query_selector(document.body(), ".rc").unwrap().unwrap();
        let marker = profile.streaming_marker(&document, rc).unwrap();
        assert!(profile.is_streaming_complete(&document, marker));

        document.set_attribute(marker, "data-streaming", "true").unwrap();
        assert!(profile.is_streaming(&document, rc));
        document.set_attribute(marker, "data-streaming", "false").unwrap();
        assert!(!profile.is_streaming(&document, rc));
    }
}
