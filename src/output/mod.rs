pub mod json;
pub mod table;

use anyhow::Result;
use serde::Serialize;

use crate::credentials::{Credential, CredentialState};
use crate::fetcher::FetchError;
use crate::gmail::Message;
use crate::pager::ListingPage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

/// One resolved id, either the message or why it could not be fetched.
#[derive(Debug, Clone, Serialize)]
pub struct FetchReportItem {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchReportItem {
    pub fn from_outcome(outcome: Result<Message, FetchError>) -> Self {
        match outcome {
            Ok(message) => Self {
                id: message.id.clone(),
                message: Some(message),
                error: None,
            },
            Err(error) => Self {
                id: error.id().to_string(),
                message: None,
                error: Some(error.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub identity_key: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    pub has_refresh_token: bool,
    pub scopes: Vec<String>,
}

impl CredentialStatus {
    pub fn new(identity_key: &str, state: CredentialState, credential: Option<&Credential>) -> Self {
        Self {
            identity_key: identity_key.to_string(),
            state: state.to_string(),
            email: credential.and_then(|c| c.email.clone()),
            expires_at: credential
                .and_then(Credential::expires_at_utc)
                .map(|dt| dt.to_rfc3339()),
            has_refresh_token: credential.is_some_and(Credential::has_refresh_token),
            scopes: credential.map(|c| c.scope.clone()).unwrap_or_default(),
        }
    }
}

pub fn format_status(format: OutputFormat, status: &CredentialStatus) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_status(status)),
        OutputFormat::Json => json::format_status(status),
    }
}

pub fn format_listing(format: OutputFormat, page: &ListingPage) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_listing(page)),
        OutputFormat::Json => json::format_listing(page),
    }
}

pub fn format_fetch_results(format: OutputFormat, items: &[FetchReportItem]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_fetch_results(items)),
        OutputFormat::Json => json::format_fetch_results(items),
    }
}

pub fn format_message(format: OutputFormat, message: &Message) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_message(message)),
        OutputFormat::Json => json::format_message(message),
    }
}
