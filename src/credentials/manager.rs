use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::Url;
use tracing::{debug, info, warn};

use super::store::CredentialStore;
use super::{
    has_read_scope, merge_credential, non_empty, AccessToken, AuthError, Clock, Credential,
    CredentialState, SystemClock,
};
use crate::gmail::{ApiError, ProfileLookup, TokenSource};

/// Anything that can hand out a currently valid bearer token.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<AccessToken, AuthError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Treat a credential as expired this many seconds before it really is.
    pub refresh_skew_secs: u64,
}

/// Lifecycle of the credential for a single identity key.
///
/// The record is cached behind an async mutex that is held across the refresh
/// round trip, so concurrent callers on one manager refresh at most once.
pub struct CredentialManager {
    identity_key: String,
    store: Arc<dyn CredentialStore>,
    tokens: Arc<dyn TokenSource>,
    profile: Option<Arc<dyn ProfileLookup>>,
    clock: Arc<dyn Clock>,
    options: ManagerOptions,
    cached: tokio::sync::Mutex<Option<Credential>>,
}

impl CredentialManager {
    pub fn new(
        identity_key: impl Into<String>,
        store: Arc<dyn CredentialStore>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            identity_key: identity_key.into(),
            store,
            tokens,
            profile: None,
            clock: Arc::new(SystemClock),
            options: ManagerOptions::default(),
            cached: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_profile_lookup(mut self, profile: Arc<dyn ProfileLookup>) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn identity_key(&self) -> &str {
        &self.identity_key
    }

    pub fn authorization_url(&self, state: Option<&str>) -> Result<Url, ApiError> {
        self.tokens.authorization_url(state)
    }

    /// Returns a token that is not expired right now, refreshing and
    /// persisting first when the stored one is.
    pub async fn valid_access_token(&self) -> Result<AccessToken, AuthError> {
        let mut cached = self.cached.lock().await;
        let credential = self
            .load(&mut cached)?
            .ok_or_else(|| AuthError::NoCredential {
                identity_key: self.identity_key.clone(),
            })?;

        if !self.is_expired(&credential) {
            return Ok(credential.access_token());
        }

        let refreshed = self.refresh_locked(&mut cached, &credential).await?;
        Ok(refreshed.access_token())
    }

    /// Exchanges a one-time authorization code and stores the result.
    pub async fn exchange_authorization_code(&self, code: &str) -> Result<Credential, AuthError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(AuthError::ExchangeFailed(
                "authorization code is empty".to_string(),
            ));
        }

        let mut cached = self.cached.lock().await;
        let response = self.tokens.exchange_code(code).await.map_err(|error| {
            warn!(identity_key = %self.identity_key, %error, "authorization code exchange failed");
            AuthError::ExchangeFailed(error.to_string())
        })?;

        let mut credential =
            Credential::from_response(&self.identity_key, response, self.clock.now());
        if credential.scope.is_empty() {
            credential.scope = self.tokens.requested_scopes();
        }

        if has_read_scope(&credential.scope) {
            if let Some(profile) = &self.profile {
                match profile.get_profile(&credential.access_token()).await {
                    Ok(profile) => credential.email = Some(profile.email_address),
                    Err(error) => warn!(
                        identity_key = %self.identity_key,
                        %error,
                        "profile lookup failed; storing credential without email"
                    ),
                }
            }
        }

        let saved = self.persist_locked(&mut cached, credential)?;
        info!(
            identity_key = %self.identity_key,
            email = saved.email.as_deref().unwrap_or(""),
            "gmail authorization stored"
        );
        Ok(saved)
    }

    /// True when a usable token exists, refreshing if needed. Failures are
    /// folded into `false`.
    pub async fn is_authorized(&self) -> bool {
        match self.valid_access_token().await {
            Ok(_) => true,
            Err(error) => {
                debug!(identity_key = %self.identity_key, %error, "not authorized");
                false
            }
        }
    }

    /// Invalidates the grant remotely and removes the local record. Calling it
    /// with nothing stored is a no-op.
    pub async fn revoke(&self) -> Result<(), AuthError> {
        let mut cached = self.cached.lock().await;
        let Some(credential) = self.load(&mut cached)? else {
            debug!(identity_key = %self.identity_key, "nothing to revoke");
            return Ok(());
        };

        let token = non_empty(credential.refresh_token.as_deref())
            .unwrap_or(credential.access_token.as_str());
        if let Err(error) = self.tokens.revoke(token).await {
            warn!(
                identity_key = %self.identity_key,
                %error,
                "remote revoke failed; removing local credential anyway"
            );
        }

        self.store.delete(&self.identity_key)?;
        *cached = None;
        info!(identity_key = %self.identity_key, "gmail credential revoked");
        Ok(())
    }

    /// Current lifecycle state. Never contacts the token endpoint.
    pub async fn state(&self) -> Result<CredentialState, AuthError> {
        let mut cached = self.cached.lock().await;
        Ok(match self.load(&mut cached)? {
            None => CredentialState::NoCredential,
            Some(credential) if !self.is_expired(&credential) => CredentialState::Authorized,
            Some(credential) if credential.has_refresh_token() => CredentialState::Expired,
            Some(_) => CredentialState::ReauthorizationRequired,
        })
    }

    pub async fn current(&self) -> Result<Option<Credential>, AuthError> {
        let mut cached = self.cached.lock().await;
        self.load(&mut cached)
    }

    pub async fn email(&self) -> Result<Option<String>, AuthError> {
        Ok(self.current().await?.and_then(|credential| credential.email))
    }

    /// Stores a credential obtained elsewhere, merged over the existing record.
    pub async fn save(&self, credential: Credential) -> Result<Credential, AuthError> {
        let mut cached = self.cached.lock().await;
        self.persist_locked(&mut cached, credential)
    }

    fn is_expired(&self, credential: &Credential) -> bool {
        let skew = i64::try_from(self.options.refresh_skew_secs).unwrap_or(i64::MAX);
        credential.is_expired_at(self.clock.now().saturating_add(skew))
    }

    fn load(&self, cached: &mut Option<Credential>) -> Result<Option<Credential>, AuthError> {
        if cached.is_none() {
            *cached = self.store.get(&self.identity_key)?;
        }
        Ok(cached.clone())
    }

    async fn refresh_locked(
        &self,
        cached: &mut Option<Credential>,
        credential: &Credential,
    ) -> Result<Credential, AuthError> {
        let Some(refresh_token) = non_empty(credential.refresh_token.as_deref()) else {
            warn!(identity_key = %self.identity_key, "credential expired without a refresh token");
            return Err(AuthError::ReauthorizationRequired {
                identity_key: self.identity_key.clone(),
            });
        };

        debug!(identity_key = %self.identity_key, "access token expired; refreshing");
        let response = self.tokens.refresh(refresh_token).await.map_err(|error| {
            warn!(identity_key = %self.identity_key, %error, "token refresh failed");
            AuthError::RefreshFailed(error.to_string())
        })?;

        let mut refreshed =
            Credential::from_response(&self.identity_key, response, self.clock.now());
        if refreshed.scope.is_empty() {
            refreshed.scope = credential.scope.clone();
        }
        let saved = self.persist_locked(cached, refreshed)?;
        info!(
            identity_key = %self.identity_key,
            expires_at = saved.expires_at(),
            "gmail access token refreshed"
        );
        Ok(saved)
    }

    fn persist_locked(
        &self,
        cached: &mut Option<Credential>,
        incoming: Credential,
    ) -> Result<Credential, AuthError> {
        let prior = self.load(cached)?;
        let merged = merge_credential(prior.as_ref(), incoming);
        self.store.put(&self.identity_key, &merged)?;
        *cached = Some(merged.clone());
        Ok(merged)
    }
}

#[async_trait]
impl AccessTokenProvider for CredentialManager {
    async fn access_token(&self) -> Result<AccessToken, AuthError> {
        self.valid_access_token().await
    }
}

/// One [`CredentialManager`] per identity key for the whole process, all
/// sharing the same store and remote capabilities.
pub struct CredentialRegistry {
    store: Arc<dyn CredentialStore>,
    tokens: Arc<dyn TokenSource>,
    profile: Option<Arc<dyn ProfileLookup>>,
    clock: Arc<dyn Clock>,
    options: ManagerOptions,
    managers: Mutex<HashMap<String, Arc<CredentialManager>>>,
}

impl CredentialRegistry {
    pub fn new(store: Arc<dyn CredentialStore>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            store,
            tokens,
            profile: None,
            clock: Arc::new(SystemClock),
            options: ManagerOptions::default(),
            managers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_profile_lookup(mut self, profile: Arc<dyn ProfileLookup>) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn manager(&self, identity_key: &str) -> Arc<CredentialManager> {
        let mut managers = self
            .managers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        managers
            .entry(identity_key.to_string())
            .or_insert_with(|| {
                let mut manager =
                    CredentialManager::new(identity_key, self.store.clone(), self.tokens.clone())
                        .with_clock(self.clock.clone())
                        .with_options(self.options);
                if let Some(profile) = &self.profile {
                    manager = manager.with_profile_lookup(profile.clone());
                }
                Arc::new(manager)
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.managers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
