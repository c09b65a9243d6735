//! Supported chat sites.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Chat web application the engine is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Site {
    Claude,
    Gemini,
    Grok,
}

impl Site {
    pub const ALL: [Site; 3] = [Site::Claude, Site::Gemini, Site::Grok];

    pub fn as_str(&self) -> &'static str {
        match self {
            Site::Claude => "claude",
            Site::Gemini => "gemini",
            Site::Grok => "grok",
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown site: '{0}'. Use 'claude', 'gemini' or 'grok'.")]
pub struct UnknownSite(pub String);

impl FromStr for Site {
    type Err = UnknownSite;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude" => Ok(Site::Claude),
            "gemini" => Ok(Site::Gemini),
            "grok" => Ok(Site::Grok),
            _ => Err(UnknownSite(s.to_string())),
        }
    }
}
