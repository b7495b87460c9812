use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::READ_SCOPES;

use self::store::StoreError;

pub mod cipher;
pub mod manager;
pub mod store;

pub use cipher::TokenCipher;
pub use manager::{CredentialManager, CredentialRegistry, ManagerOptions};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};

const DEFAULT_TOKEN_TYPE: &str = "Bearer";
const DEFAULT_EXPIRES_IN: u64 = 3600;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no stored credential for '{identity_key}'; authorization required")]
    NoCredential { identity_key: String },

    #[error("authorization code exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("credential for '{identity_key}' expired and has no refresh token; authorization required")]
    ReauthorizationRequired { identity_key: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where a credential currently sits in its lifecycle. Computed lazily from
/// the stored record and the clock; nothing here is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    NoCredential,
    Authorized,
    Expired,
    /// Expired and no refresh token on file, so only an interactive exchange
    /// can recover.
    ReauthorizationRequired,
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCredential => write!(f, "no_credential"),
            Self::Authorized => write!(f, "authorized"),
            Self::Expired => write!(f, "expired"),
            Self::ReauthorizationRequired => write!(f, "reauthorization_required"),
        }
    }
}

/// A bearer token handed to remote calls. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken({})", mask_secret(&self.0))
    }
}

impl AsRef<str> for AccessToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One OAuth grant for one identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub identity_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    #[serde(default)]
    pub scope: Vec<String>,
    /// Issuance time, epoch seconds.
    pub created_at: i64,
    /// Lifetime in seconds, counted from `created_at`.
    pub expires_in: u64,
}

impl Credential {
    /// Builds a credential from a token endpoint response. `now` stamps the
    /// issuance time when the response does not carry one.
    pub fn from_response(identity_key: &str, response: TokenResponse, now: i64) -> Self {
        Self {
            identity_key: identity_key.to_string(),
            email: None,
            access_token: response.access_token,
            refresh_token: response.refresh_token.filter(|token| !token.trim().is_empty()),
            token_type: response
                .token_type
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string()),
            scope: response.scope.as_deref().map(parse_scope).unwrap_or_default(),
            created_at: response.created.unwrap_or(now),
            expires_in: response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
        }
    }

    pub fn expires_at(&self) -> i64 {
        self.created_at
            .saturating_add(i64::try_from(self.expires_in).unwrap_or(i64::MAX))
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.expires_at(), 0).single()
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at()
    }

    pub fn has_refresh_token(&self) -> bool {
        non_empty(self.refresh_token.as_deref()).is_some()
    }

    pub fn has_read_scope(&self) -> bool {
        has_read_scope(&self.scope)
    }

    pub fn scope_string(&self) -> String {
        self.scope.join(" ")
    }

    pub fn access_token(&self) -> AccessToken {
        AccessToken::new(self.access_token.clone())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity_key", &self.identity_key)
            .field("email", &self.email)
            .field("access_token", &mask_secret(&self.access_token))
            .field(
                "refresh_token",
                &self.refresh_token.as_deref().map(mask_secret),
            )
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("created_at", &self.created_at)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Token endpoint payload, shared by the code exchange and refresh grants.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
}

/// Merge-on-save: long-lived fields missing from `incoming` are carried over
/// from `prior`. A stored refresh token is never replaced by an empty one.
pub fn merge_credential(prior: Option<&Credential>, mut incoming: Credential) -> Credential {
    let Some(prior) = prior else {
        return incoming;
    };

    if non_empty(incoming.email.as_deref()).is_none() {
        incoming.email = non_empty(prior.email.as_deref()).map(str::to_string);
    }
    if non_empty(incoming.refresh_token.as_deref()).is_none() {
        incoming.refresh_token = non_empty(prior.refresh_token.as_deref()).map(str::to_string);
    }
    incoming
}

/// Accepts space- or comma-delimited scope strings.
pub fn parse_scope(raw: &str) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::new();
    for part in raw.split([' ', ',']).map(str::trim).filter(|s| !s.is_empty()) {
        if !scopes.iter().any(|existing| existing == part) {
            scopes.push(part.to_string());
        }
    }
    scopes
}

pub fn has_read_scope(scopes: &[String]) -> bool {
    scopes
        .iter()
        .any(|scope| READ_SCOPES.contains(&scope.as_str()))
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    format!("{head}…({} chars)", chars.len())
}

/// Source of "now" for expiry decisions, in epoch seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}
