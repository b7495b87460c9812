use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::debug;

use super::{redact_response_body, ApiError, TokenSource};
use crate::config::{AccessType, ApprovalPrompt, OAuthSettings};
use crate::credentials::TokenResponse;

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Google's OAuth2 endpoints, configured once at construction.
#[derive(Debug, Clone)]
pub struct GoogleOAuthClient {
    client: Client,
    settings: OAuthSettings,
    auth_url: String,
    token_url: String,
    revoke_url: String,
}

impl GoogleOAuthClient {
    pub fn new(settings: OAuthSettings) -> Self {
        Self::with_client(Client::new(), settings)
    }

    pub fn with_timeout(settings: OAuthSettings, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::transport("build oauth http client", e))?;
        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: Client, settings: OAuthSettings) -> Self {
        Self {
            client,
            settings,
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            revoke_url: GOOGLE_REVOKE_URL.to_string(),
        }
    }

    pub fn with_endpoints(mut self, auth_url: &str, token_url: &str, revoke_url: &str) -> Self {
        self.auth_url = auth_url.to_string();
        self.token_url = token_url.to_string();
        self.revoke_url = revoke_url.to_string();
        self
    }

    pub fn settings(&self) -> &OAuthSettings {
        &self.settings
    }

    async fn post_token_form(
        &self,
        form: &[(&str, &str)],
        context: &str,
    ) -> Result<TokenResponse, ApiError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| ApiError::transport(format!("request {context} from {}", self.token_url), e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::transport(format!("read {context} response"), e))?;
        if !status.is_success() {
            return Err(ApiError::Status {
                context: context.to_string(),
                status: status.as_u16(),
                body: oauth_error_detail(&body),
            });
        }

        serde_json::from_str(&body).map_err(|e| ApiError::decode(format!("{context} response"), e))
    }
}

#[async_trait]
impl TokenSource for GoogleOAuthClient {
    fn authorization_url(&self, state: Option<&str>) -> Result<Url, ApiError> {
        let mut url =
            Url::parse(&self.auth_url).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("client_id", &self.settings.client_id)
                .append_pair("redirect_uri", &self.settings.redirect_url)
                .append_pair("response_type", "code");

            let scopes = self.requested_scopes().join(" ");
            if !scopes.is_empty() {
                pairs.append_pair("scope", &scopes);
            }

            pairs.append_pair(
                "access_type",
                match self.settings.access_type {
                    AccessType::Online => "online",
                    AccessType::Offline => "offline",
                },
            );
            if self.settings.approval_prompt == ApprovalPrompt::Force {
                pairs.append_pair("prompt", "consent");
            }

            if let Some(state) = state.or(self.settings.state.as_deref()) {
                pairs.append_pair("state", state);
            }
        }
        Ok(url)
    }

    fn requested_scopes(&self) -> Vec<String> {
        self.settings.scope_urls()
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, ApiError> {
        debug!("exchanging gmail authorization code");
        self.post_token_form(
            &[
                ("code", code),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
                ("redirect_uri", self.settings.redirect_url.as_str()),
                ("grant_type", "authorization_code"),
            ],
            "gmail authorization code exchange",
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ApiError> {
        debug!("refreshing gmail access token");
        self.post_token_form(
            &[
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ],
            "gmail token refresh",
        )
        .await
    }

    async fn revoke(&self, token: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(&self.revoke_url)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| ApiError::transport("gmail token revoke", e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            context: "gmail token revoke".to_string(),
            status: status.as_u16(),
            body: oauth_error_detail(&body),
        })
    }
}

/// `error: error_description` from an OAuth error payload, or the redacted body.
fn oauth_error_detail(body: &str) -> String {
    match serde_json::from_str::<OAuthErrorResponse>(body) {
        Ok(parsed) => match parsed.error_description {
            Some(description) => format!("{}: {description}", parsed.error),
            None => parsed.error,
        },
        Err(_) => redact_response_body(body),
    }
}
