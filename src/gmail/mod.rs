//! Remote capabilities consumed by the credential manager, pager and batch
//! fetcher, plus their Google implementations.

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::{AccessToken, TokenResponse};
use crate::pager::{ListQuery, ListingPage};

pub mod batch;
pub mod client;
pub mod message;
pub mod oauth;

pub use client::GmailClient;
pub use message::{Message, MessageRef};
pub use oauth::GoogleOAuthClient;

const REDACTED_BODY_MAX_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{context} failed: status={status} body={body}")]
    Status {
        context: String,
        status: u16,
        body: String,
    },

    #[error("decode {context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("batch request issued while batch mode is off")]
    BatchModeDisabled,

    #[error("malformed batch response: {0}")]
    MalformedBatch(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    pub(crate) fn transport(context: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn decode(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            context: context.into(),
            source,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Mailbox profile returned by `users/me/profile`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub email_address: String,
    #[serde(default)]
    pub messages_total: Option<u64>,
    #[serde(default)]
    pub threads_total: Option<u64>,
    #[serde(default)]
    pub history_id: Option<String>,
}

/// Why one member of a batch group did not come back as a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub status: Option<u16>,
    pub detail: String,
}

impl std::fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "status={status} {}", self.detail),
            None => f.write_str(&self.detail),
        }
    }
}

/// One member response of a batch round trip, keyed by the id that was sent.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub id: String,
    pub outcome: Result<Message, ItemFailure>,
}

/// OAuth endpoint operations.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Consent URL the user is sent to; the code comes back on the redirect.
    fn authorization_url(&self, state: Option<&str>) -> Result<Url, ApiError>;

    /// Scope URLs requested at consent time.
    fn requested_scopes(&self) -> Vec<String>;

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, ApiError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ApiError>;

    async fn revoke(&self, token: &str) -> Result<(), ApiError>;
}

#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn get_profile(&self, token: &AccessToken) -> Result<Profile, ApiError>;
}

/// Message listing and retrieval.
///
/// Batch mode is a property of the shared client: `execute_batch` only runs
/// while it is on, and whoever turns it on holds `batch_lock` until it is
/// turned off again.
#[async_trait]
pub trait MailboxApi: Send + Sync {
    async fn list_messages(
        &self,
        token: &AccessToken,
        query: &ListQuery,
        page_token: Option<&str>,
    ) -> Result<ListingPage, ApiError>;

    async fn get_message(&self, token: &AccessToken, id: &str) -> Result<Message, ApiError>;

    async fn execute_batch(
        &self,
        token: &AccessToken,
        ids: &[String],
    ) -> Result<Vec<BatchItem>, ApiError>;

    fn set_batch_mode(&self, enabled: bool);

    fn batch_mode(&self) -> bool;

    fn batch_lock(&self) -> &tokio::sync::Mutex<()>;
}

pub(crate) fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= REDACTED_BODY_MAX_LEN {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(REDACTED_BODY_MAX_LEN).collect();
        format!("{head}…[truncated {} bytes]", trimmed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::{redact_response_body, ApiError, ItemFailure, Profile};

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(500);
        let redacted = redact_response_body(&body);
        assert!(redacted.len() < 300);
        assert!(redacted.contains("truncated 500 bytes"));
        assert_eq!(redact_response_body("  short  "), "short");
    }

    #[test]
    fn profile_deserializes_camel_case() {
        let profile: Profile = serde_json::from_str(
            r#"{"emailAddress":"me@example.com","messagesTotal":10,"threadsTotal":4,"historyId":"99"}"#,
        )
        .expect("decode profile");
        assert_eq!(profile.email_address, "me@example.com");
        assert_eq!(profile.history_id.as_deref(), Some("99"));
    }

    #[test]
    fn item_failure_display_includes_status() {
        let failure = ItemFailure {
            status: Some(404),
            detail: "Requested entity was not found.".to_string(),
        };
        assert_eq!(failure.to_string(), "status=404 Requested entity was not found.");
        let status = ApiError::Status {
            context: "x".to_string(),
            status: 500,
            body: String::new(),
        };
        assert_eq!(status.status(), Some(500));
    }
}
