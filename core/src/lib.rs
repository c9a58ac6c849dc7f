/// ChatLink - Real-time conversation session core
///
/// Keeps one authenticated real-time connection per session, routes server
/// events to the open conversation, reconciles paginated history with live
/// messages and debounces typing indicators.

pub mod error;
pub mod config;
pub mod messenger_types;
pub mod realtime;
pub mod http;
pub mod history;
pub mod feed;
pub mod typing;
pub mod session;
pub mod conversation;
pub mod utils;

pub use error::{ChatError, Result};
pub use config::Config;
pub use conversation::{ConversationSession, LoadOutcome, SessionSnapshot};
pub use feed::{MessageFeed, PageState};
pub use history::{HistoryApi, HttpHistory};
pub use messenger_types::{Conversation, FeedPage, Message, MessageStatus, Presence, UserSummary};
pub use realtime::{ConnectionManager, ConnectionState, Connector, Credential, NetworkConnector, TransportKind};
pub use session::{CredentialProvider, EnvCredentials, SessionContext};
