//! Chat observation and response segmentation engine for chatsay.

pub mod adapters;
pub mod announce;
pub mod classifier;
pub mod config;
pub mod context;
pub mod dom;
pub mod error;
pub mod idle;
pub mod observer;
pub mod scope;
pub mod segments;
pub mod tracker;
pub mod watcher;

pub use adapters::{adapter_for, default_profile, ClaudeAdapter, GeminiAdapter, GrokAdapter, SiteProfile};
pub use announce::{Announcer, ChannelAnnouncer};
pub use classifier::{ResponseClassifier, Sighting, SiteAdapter};
pub use config::{Messages, ObserverConfig};
pub use context::Extension;
pub use dom::{Document, MutationObserver, MutationRecord, ObserveOptions, Selector};
pub use error::ChatsayError;
pub use idle::{IdleDetector, IdleOutcome};
pub use observer::ChatObserver;
pub use scope::ResourceScope;
pub use segments::{Cursor, SegmentAnnouncer, SpokenSet};
pub use tracker::{ResponseTracker, TrackedResponse, TrackerContext};
pub use watcher::{ElementWatcher, ElementWatcherHandle, Locate, SelectorLocator};

/// Result type for chatsay operations.
pub type Result<T> = std::result::Result<T, ChatsayError>;
