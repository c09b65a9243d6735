//! Replay configuration.

use anyhow::{Context, Result};
use chatsay_core::{Messages, ObserverConfig, SiteProfile};
use chatsay_types::Site;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub observer: ObserverConfig,
    #[serde(default)]
    pub messages: Messages,
    /// Selector profile overrides, keyed by site name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sites: BTreeMap<String, SiteProfile>,
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `config/default.toml`, then the user config directory, falling
    /// back to defaults.
    pub fn load() -> Result<Self> {
        let local = PathBuf::from("config/default.toml");
        if local.exists() {
            return Self::load_from(&local);
        }
        if let Some(user) = user_config_path() {
            if user.exists() {
                return Self::load_from(&user);
            }
        }
        Ok(Config::default())
    }

    /// Reject profile overrides for sites we do not know.
    pub fn validate(&self) -> Result<()> {
        for name in self.sites.keys() {
            name.parse::<Site>()?;
        }
        Ok(())
    }

    /// Profile override for `site`, if the config has one.
    pub fn profile_for(&self, site: Site) -> Option<SiteProfile> {
        self.sites
            .iter()
            .find(|(name, _)| name.parse::<Site>().ok() == Some(site))
            .map(|(_, profile)| profile.clone())
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chatsay").join("config.toml"))
}
