//! Error types for chatsay.

use chatsay_types::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatsayError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node is not connected to the document: {0}")]
    NotConnected(NodeId),

    #[error("Not an element: {0}")]
    NotAnElement(NodeId),

    #[error("Hierarchy error: {0}")]
    HierarchyError(String),

    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Markup error: {0}")]
    MarkupError(String),

    #[error("Classifier error: {0}")]
    ClassifierError(String),
}
