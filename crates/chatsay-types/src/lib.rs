//! Shared types for the chatsay screen-reader engine.

mod announcement;
mod node;
mod observer;
mod site;

pub use announcement::*;
pub use node::*;
pub use observer::*;
pub use site::*;
