use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::batch::{build_batch_body, parse_batch_response};
use super::message::{Message, MessageRef};
use super::{redact_response_body, ApiError, BatchItem, MailboxApi, Profile, ProfileLookup};
use crate::credentials::AccessToken;
use crate::pager::{ListQuery, ListingPage};

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
pub const GMAIL_BATCH_ENDPOINT: &str = "https://www.googleapis.com/batch/gmail/v1";
const BATCH_API_PATH: &str = "/gmail/v1";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Option<Vec<MessageRef>>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    result_size_estimate: Option<u64>,
}

/// reqwest-backed Gmail REST client for the `me` mailbox.
#[derive(Debug)]
pub struct GmailClient {
    client: Client,
    api_base: String,
    batch_endpoint: String,
    batch_mode: AtomicBool,
    batch_lock: Mutex<()>,
}

impl Default for GmailClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GmailClient {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::transport("build gmail http client", e))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            api_base: GMAIL_API_BASE.to_string(),
            batch_endpoint: GMAIL_BATCH_ENDPOINT.to_string(),
            batch_mode: AtomicBool::new(false),
            batch_lock: Mutex::new(()),
        }
    }

    /// Points the client at another host, e.g. a local test server.
    pub fn with_endpoints(mut self, api_base: &str, batch_endpoint: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.batch_endpoint = batch_endpoint.to_string();
        self
    }

    fn messages_url(&self, query: &ListQuery, page_token: Option<&str>) -> Result<Url, ApiError> {
        let mut url = Url::parse(&format!("{}/users/me/messages", self.api_base))
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query.to_params() {
                pairs.append_pair(key, &value);
            }
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
        }
        Ok(url)
    }

    /// `id` is pushed as one escaped path segment.
    fn message_url(&self, id: &str) -> Result<Url, ApiError> {
        let mut url = Url::parse(&format!("{}/users/me/messages", self.api_base))
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidUrl(format!("{} cannot take a path", self.api_base)))?
            .push(id);
        url.query_pairs_mut().append_pair("format", "full");
        Ok(url)
    }

    async fn get_json(&self, token: &AccessToken, url: &str, context: &str) -> Result<String, ApiError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(token.as_str())
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| ApiError::transport(format!("gmail api request {context}"), e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::transport(format!("read gmail {context} response"), e))?;
        if !status.is_success() {
            return Err(ApiError::Status {
                context: format!("gmail {context}"),
                status: status.as_u16(),
                body: redact_response_body(&body),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl MailboxApi for GmailClient {
    async fn list_messages(
        &self,
        token: &AccessToken,
        query: &ListQuery,
        page_token: Option<&str>,
    ) -> Result<ListingPage, ApiError> {
        let url = self.messages_url(query, page_token)?;
        let body = self.get_json(token, url.as_str(), "messages.list").await?;
        let list: MessageListResponse =
            serde_json::from_str(&body).map_err(|e| ApiError::decode("gmail message list", e))?;

        Ok(ListingPage {
            items: list.messages.unwrap_or_default(),
            continuation_token: list.next_page_token,
            estimated_total: list.result_size_estimate,
        })
    }

    async fn get_message(&self, token: &AccessToken, id: &str) -> Result<Message, ApiError> {
        let url = self.message_url(id)?;
        let body = self.get_json(token, url.as_str(), "messages.get").await?;
        serde_json::from_str(&body).map_err(|e| ApiError::decode("gmail message", e))
    }

    async fn execute_batch(
        &self,
        token: &AccessToken,
        ids: &[String],
    ) -> Result<Vec<BatchItem>, ApiError> {
        if !self.batch_mode() {
            return Err(ApiError::BatchModeDisabled);
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let boundary = format!("gmfetch_batch_{}", uuid::Uuid::new_v4().as_simple());
        let body = build_batch_body(ids, &boundary, BATCH_API_PATH);
        debug!(items = ids.len(), "sending gmail batch request");

        let response = self
            .client
            .post(&self.batch_endpoint)
            .bearer_auth(token.as_str())
            .header("content-type", format!("multipart/mixed; boundary={boundary}"))
            .body(body)
            .send()
            .await
            .map_err(|e| ApiError::transport("gmail batch request", e))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let response_body = response
            .text()
            .await
            .map_err(|e| ApiError::transport("read gmail batch response", e))?;

        if !status.is_success() {
            return Err(ApiError::Status {
                context: "gmail batch".to_string(),
                status: status.as_u16(),
                body: redact_response_body(&response_body),
            });
        }

        parse_batch_response(&response_body, &content_type, ids)
    }

    fn set_batch_mode(&self, enabled: bool) {
        self.batch_mode.store(enabled, Ordering::SeqCst);
    }

    fn batch_mode(&self) -> bool {
        self.batch_mode.load(Ordering::SeqCst)
    }

    fn batch_lock(&self) -> &Mutex<()> {
        &self.batch_lock
    }
}

#[async_trait]
impl ProfileLookup for GmailClient {
    async fn get_profile(&self, token: &AccessToken) -> Result<Profile, ApiError> {
        let url = format!("{}/users/me/profile", self.api_base);
        let body = self.get_json(token, &url, "users.getProfile").await?;
        serde_json::from_str(&body).map_err(|e| ApiError::decode("gmail profile", e))
    }
}
