/// Minimal JSON-over-HTTP client for the REST backend
use crate::error::{ChatError, Result};
use bytes::Bytes;
use http::{header, Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// HTTP client that attaches the session's bearer token to every request
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpConnector, Full<Bytes>>,
    token: String,
}

impl HttpClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            token: token.into(),
        }
    }

    pub async fn get_json<T: DeserializeOwned + Send>(&self, url: &str) -> Result<T> {
        self.request(Method::GET, url, None).await
    }

    pub async fn post_json<T, B>(&self, url: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned + Send,
        B: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(body)?;
        self.request(Method::POST, url, Some(payload)).await
    }

    async fn request<T: DeserializeOwned + Send>(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T> {
        debug!("{} {}", method, url);

        let mut builder = Request::builder()
            .method(method)
            .uri(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::ACCEPT, "application/json");
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ChatError::Http(format!("Invalid request for {}: {}", url, e)))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ChatError::Http(format!("{}: {}", url, e)))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ChatError::Http(format!("{}: body read error: {}", url, e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(ChatError::Http(format!(
                "{} returned {}: {}",
                url,
                status.as_u16(),
                error_message(&body)
            )));
        }

        Ok(serde_json::from_slice(&body)?)
    }
}

/// Pull the human-readable message out of an error body
fn error_message(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for key in ["message", "error"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    String::from_utf8_lossy(body).trim().to_string()
}
