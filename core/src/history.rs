/// Paginated message history from the REST backend
use crate::error::{ChatError, Result};
use crate::http::HttpClient;
use crate::messenger_types::{Conversation, FeedPage, Message};
use crate::realtime::Credential;
use serde::Deserialize;
use std::future::Future;
use tracing::debug;

/// Source of conversation details and historical message pages
pub trait HistoryApi: Send + Sync + 'static {
    /// Fetch one page (1-based) of up to `limit` messages, newest pages first
    fn fetch_page(
        &self,
        conversation_id: &str,
        page: u32,
        limit: usize,
    ) -> impl Future<Output = Result<FeedPage>> + Send;

    fn fetch_conversation(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<Conversation>> + Send;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    current_page: u32,
    total_pages: u32,
    #[serde(default)]
    has_more: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    messages: Vec<Message>,
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    chat: Conversation,
}

/// [`HistoryApi`] over `GET {base}/chat/...`
pub struct HttpHistory {
    http: HttpClient,
    base: String,
    user_id: String,
}

impl HttpHistory {
    pub fn new(base: impl Into<String>, credential: &Credential) -> Self {
        Self {
            http: HttpClient::new(credential.token.clone()),
            base: base.into().trim_end_matches('/').to_string(),
            user_id: credential.user_id.clone(),
        }
    }

    fn messages_url(&self, conversation_id: &str, page: u32, limit: usize) -> String {
        format!(
            "{}/chat/getChatMessages?chatId={}&userId={}&page={}&limit={}",
            self.base,
            urlencoding::encode(conversation_id),
            urlencoding::encode(&self.user_id),
            page,
            limit
        )
    }

    fn chat_url(&self, conversation_id: &str) -> String {
        format!(
            "{}/chat/getChatById?chatId={}&userId={}",
            self.base,
            urlencoding::encode(conversation_id),
            urlencoding::encode(&self.user_id)
        )
    }
}

impl HistoryApi for HttpHistory {
    async fn fetch_page(&self, conversation_id: &str, page: u32, limit: usize) -> Result<FeedPage> {
        let response: MessagesResponse = self
            .http
            .get_json(&self.messages_url(conversation_id, page, limit))
            .await
            .map_err(|e| ChatError::Fetch(format!("page {} of {}: {}", page, conversation_id, e)))?;
        Ok(into_page(page, response))
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        let response: ChatResponse = self
            .http
            .get_json(&self.chat_url(conversation_id))
            .await
            .map_err(|e| ChatError::Fetch(format!("conversation {}: {}", conversation_id, e)))?;
        Ok(response.chat)
    }
}

fn into_page(requested: u32, response: MessagesResponse) -> FeedPage {
    let pagination = response.pagination;
    let has_more = pagination
        .has_more
        .unwrap_or(pagination.current_page < pagination.total_pages);
    debug!(
        "Fetched page {}/{} with {} messages",
        pagination.current_page,
        pagination.total_pages,
        response.messages.len()
    );
    FeedPage {
        page: requested,
        messages: response.messages,
        has_more,
    }
}
