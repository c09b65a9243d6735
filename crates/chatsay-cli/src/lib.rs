//! chatsay command-line tools: replay scripted chat pages through the
//! observation engine and inspect built-in site profiles.
//!
//! Separated from main.rs so the replay path can be integration tested.

pub mod config;
pub mod logging;
pub mod scenario;
