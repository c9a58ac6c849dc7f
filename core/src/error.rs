/// Error types for the chat session core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("History fetch error: {0}")]
    Fetch(String),

    #[error("Send failed for message {message_id}: {reason}")]
    Send { message_id: String, reason: String },

    #[error("Invalid message: {0}")]
    Validation(String),

    #[error("Not connected")]
    NotConnected,

    #[error("No active conversation")]
    NoActiveConversation,
}

pub type Result<T> = std::result::Result<T, ChatError>;
