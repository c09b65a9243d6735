//! Scripted page mutations replayed against the engine.
//!
//! A scenario is a TOML file: the page's initial body markup followed by
//! `[[step]]` entries, each one DOM mutation or a pause.

use chatsay_core::{
    adapter_for, ChannelAnnouncer, ChatsayError, Document, Extension, Messages, ObserverConfig, SiteProfile,
};
use chatsay_types::{Announcement, NodeId, ObserverState, Site, StreamPhase};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid scenario: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Step {step}: no element matches '{selector}' (index {index})")]
    NoMatch {
        step: usize,
        selector: String,
        index: usize,
    },

    #[error("Step {step}: {source}")]
    Dom {
        step: usize,
        #[source]
        source: ChatsayError,
    },

    #[error("No site given and the scenario does not name one")]
    NoSite,
}

pub type Result<T> = std::result::Result<T, ScenarioError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<Site>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Body markup the page starts with.
    #[serde(default)]
    pub initial_html: String,
    /// Time to keep observing after the last step.
    #[serde(default = "default_tail_ms")]
    pub tail_ms: u64,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

fn default_tail_ms() -> u64 {
    5_000
}

/// One scripted mutation. `target` is a selector; `nth` picks among its
/// matches in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Append {
        target: String,
        #[serde(default)]
        nth: usize,
        html: String,
    },
    Remove {
        target: String,
        #[serde(default)]
        nth: usize,
    },
    SetAttribute {
        target: String,
        #[serde(default)]
        nth: usize,
        name: String,
        value: String,
    },
    RemoveAttribute {
        target: String,
        #[serde(default)]
        nth: usize,
        name: String,
    },
    ReplaceChildren {
        target: String,
        #[serde(default)]
        nth: usize,
        html: String,
    },
    SetText {
        target: String,
        #[serde(default)]
        nth: usize,
        text: String,
    },
    Wait {
        ms: u64,
    },
}

impl Step {
    fn target(&self) -> Option<(&str, usize)> {
        match self {
            Step::Append { target, nth, .. }
            | Step::Remove { target, nth }
            | Step::SetAttribute { target, nth, .. }
            | Step::RemoveAttribute { target, nth, .. }
            | Step::ReplaceChildren { target, nth, .. }
            | Step::SetText { target, nth, .. } => Some((target, *nth)),
            Step::Wait { .. } => None,
        }
    }

    /// Apply this step to `document`. `index` is only used for errors.
    pub fn apply(&self, document: &Document, index: usize) -> Result<()> {
        let Some((selector, nth)) = self.target() else {
            return Ok(());
        };
        let dom = |source| ScenarioError::Dom { step: index, source };
        let node = resolve(document, selector, nth)
            .map_err(dom)?
            .ok_or_else(|| ScenarioError::NoMatch {
                step: index,
                selector: selector.to_string(),
                index: nth,
            })?;

        match self {
            Step::Append { html, .. } => document.append_html(node, html).map(|_| ()),
            Step::Remove { .. } => document.remove(node),
            Step::SetAttribute { name, value, .. } => document.set_attribute(node, name, value),
            Step::RemoveAttribute { name, .. } => document.remove_attribute(node, name),
            Step::ReplaceChildren { html, .. } => document.set_inner_html(node, html).map(|_| ()),
            Step::SetText { text, .. } => document.set_text(node, text),
            Step::Wait { .. } => Ok(()),
        }
        .map_err(dom)
    }
}

fn resolve(document: &Document, selector: &str, nth: usize) -> chatsay_core::Result<Option<NodeId>> {
    Ok(document.query_selector_all(document.root(), selector)?.get(nth).copied())
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Total scripted wait, excluding the tail.
    pub fn scripted_duration(&self) -> Duration {
        Duration::from_millis(
            self.steps
                .iter()
                .map(|step| match step {
                    Step::Wait { ms } => *ms,
                    _ => 0,
                })
                .sum(),
        )
    }
}

/// What a replay produced.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub site: Site,
    pub announcements: Vec<Announcement>,
    pub final_state: ObserverState,
    pub responses: Vec<(NodeId, StreamPhase)>,
}

impl ReplayReport {
    /// Spoken response content, without status messages.
    pub fn spoken(&self) -> Vec<&str> {
        self.announcements
            .iter()
            .filter(|a| a.is_primary())
            .map(|a| a.text.as_str())
            .collect()
    }
}

/// Options for [`replay`] beyond the scenario itself.
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Overrides the scenario's own site.
    pub site: Option<Site>,
    pub profile: Option<SiteProfile>,
    pub observer: ObserverConfig,
    pub messages: Messages,
}

/// Run `scenario` through a fresh extension and collect what it announced.
///
/// `on_announcement` sees each announcement as it happens.
pub async fn replay<F>(scenario: &Scenario, options: ReplayOptions, mut on_announcement: F) -> anyhow::Result<ReplayReport>
where
    F: FnMut(&Announcement),
{
    let site = options.site.or(scenario.site).ok_or(ScenarioError::NoSite)?;
    let document = Document::with_body(&scenario.initial_html)?;
    let adapter = adapter_for(site, options.profile)?;
    let (announcer, mut rx) = ChannelAnnouncer::new();
    let extension = Extension::new(
        document.clone(),
        adapter,
        Arc::new(announcer),
        options.observer,
        options.messages,
    );

    info!(
        target: "chatsay::replay",
        "Replaying {} steps against {} ({:?} scripted)",
        scenario.steps.len(),
        site,
        scenario.scripted_duration()
    );
    extension.init();

    let mut announcements = Vec::new();
    let mut collect = |rx: &mut tokio::sync::mpsc::UnboundedReceiver<Announcement>| {
        while let Ok(announcement) = rx.try_recv() {
            on_announcement(&announcement);
            announcements.push(announcement);
        }
    };

    for (index, step) in scenario.steps.iter().enumerate() {
        match step {
            Step::Wait { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
            _ => {
                debug!(target: "chatsay::replay", "Step {}: {:?}", index, step);
                step.apply(&document, index)?;
                tokio::task::yield_now().await;
            }
        }
        collect(&mut rx);
    }
    tokio::time::sleep(Duration::from_millis(scenario.tail_ms)).await;
    collect(&mut rx);

    let final_state = extension.observer().state();
    let responses = extension.observer().tracked_responses();
    extension.teardown();

    Ok(ReplayReport {
        site,
        announcements,
        final_state,
        responses,
    })
}
