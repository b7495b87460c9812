use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const GMAIL_SCOPE_ALL: &str = "https://mail.google.com/";
pub const GMAIL_SCOPE_COMPOSE: &str = "https://www.googleapis.com/auth/gmail.compose";
pub const GMAIL_SCOPE_INSERT: &str = "https://www.googleapis.com/auth/gmail.insert";
pub const GMAIL_SCOPE_LABELS: &str = "https://www.googleapis.com/auth/gmail.labels";
pub const GMAIL_SCOPE_METADATA: &str = "https://www.googleapis.com/auth/gmail.metadata";
pub const GMAIL_SCOPE_MODIFY: &str = "https://www.googleapis.com/auth/gmail.modify";
pub const GMAIL_SCOPE_READONLY: &str = "https://www.googleapis.com/auth/gmail.readonly";
pub const GMAIL_SCOPE_SEND: &str = "https://www.googleapis.com/auth/gmail.send";
pub const GMAIL_SCOPE_SETTINGS_BASIC: &str =
    "https://www.googleapis.com/auth/gmail.settings.basic";
pub const GMAIL_SCOPE_SETTINGS_SHARING: &str =
    "https://www.googleapis.com/auth/gmail.settings.sharing";

/// Scopes that allow reading the mailbox profile.
pub const READ_SCOPES: &[&str] = &[GMAIL_SCOPE_READONLY, GMAIL_SCOPE_MODIFY, GMAIL_SCOPE_ALL];

const ENV_PREFIX: &str = "GMFETCH_";
const DEFAULT_REDIRECT_URL: &str = "http://localhost:8080/oauth/gmail/callback";
const DEFAULT_CREDENTIALS_FILE_NAME: &str = "gmail-json";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Short scope names accepted in configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GmailScope {
    All,
    Compose,
    Insert,
    Labels,
    Metadata,
    Modify,
    Readonly,
    Send,
    SettingsBasic,
    SettingsSharing,
}

impl GmailScope {
    pub fn url(self) -> &'static str {
        match self {
            Self::All => GMAIL_SCOPE_ALL,
            Self::Compose => GMAIL_SCOPE_COMPOSE,
            Self::Insert => GMAIL_SCOPE_INSERT,
            Self::Labels => GMAIL_SCOPE_LABELS,
            Self::Metadata => GMAIL_SCOPE_METADATA,
            Self::Modify => GMAIL_SCOPE_MODIFY,
            Self::Readonly => GMAIL_SCOPE_READONLY,
            Self::Send => GMAIL_SCOPE_SEND,
            Self::SettingsBasic => GMAIL_SCOPE_SETTINGS_BASIC,
            Self::SettingsSharing => GMAIL_SCOPE_SETTINGS_SHARING,
        }
    }
}

impl FromStr for GmailScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "compose" => Ok(Self::Compose),
            "insert" => Ok(Self::Insert),
            "labels" => Ok(Self::Labels),
            "metadata" => Ok(Self::Metadata),
            "modify" => Ok(Self::Modify),
            "readonly" => Ok(Self::Readonly),
            "send" => Ok(Self::Send),
            "settings_basic" => Ok(Self::SettingsBasic),
            "settings_sharing" => Ok(Self::SettingsSharing),
            other => Err(format!("unknown gmail scope: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Online,
    #[default]
    Offline,
}

impl Display for AccessType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

impl FromStr for AccessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            other => Err(format!("invalid access type: {other}")),
        }
    }
}

/// `Force` asks Google to show the consent screen again, which is what makes
/// it hand out a fresh refresh token.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalPrompt {
    Auto,
    #[default]
    Force,
}

impl FromStr for ApprovalPrompt {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "force" | "consent" => Ok(Self::Force),
            other => Err(format!("invalid approval prompt: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenStoreKind {
    #[default]
    Sqlite,
    File,
}

impl FromStr for TokenStoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "database" | "db" => Ok(Self::Sqlite),
            "file" | "json" => Ok(Self::File),
            other => Err(format!("invalid token store: {other}")),
        }
    }
}

/// Everything the OAuth client needs to build consent URLs and talk to the
/// token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub scopes: Vec<GmailScope>,
    /// Raw scope URLs appended after the mapped short names.
    pub additional_scopes: Vec<String>,
    pub access_type: AccessType,
    pub approval_prompt: ApprovalPrompt,
    pub state: Option<String>,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_url: DEFAULT_REDIRECT_URL.to_string(),
            scopes: vec![GmailScope::Readonly],
            additional_scopes: Vec::new(),
            access_type: AccessType::default(),
            approval_prompt: ApprovalPrompt::default(),
            state: None,
        }
    }
}

impl OAuthSettings {
    /// Mapped scope URLs, deduplicated in first-seen order, followed by the
    /// additional raw scopes.
    pub fn scope_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        for scope in &self.scopes {
            let url = scope.url().to_string();
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        for extra in &self.additional_scopes {
            let extra = extra.trim();
            if !extra.is_empty() && !urls.iter().any(|url| url == extra) {
                urls.push(extra.to_string());
            }
        }
        urls
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(anyhow!("missing gmail client id ({ENV_PREFIX}CLIENT_ID/config)"));
        }
        if self.client_secret.trim().is_empty() {
            return Err(anyhow!(
                "missing gmail client secret ({ENV_PREFIX}CLIENT_SECRET/config)"
            ));
        }
        if self.redirect_url.trim().is_empty() {
            return Err(anyhow!("missing redirect url ({ENV_PREFIX}REDIRECT_URL/config)"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub oauth: OAuthSettings,
    pub token_store: TokenStoreKind,
    /// Directory for the SQLite database and credential files.
    pub data_dir: Option<PathBuf>,
    pub credentials_file_name: String,
    pub allow_multiple_credentials: bool,
    /// 64 hex chars. When unset, file credentials are written unencrypted.
    pub token_cache_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            oauth: OAuthSettings::default(),
            token_store: TokenStoreKind::default(),
            data_dir: None,
            credentials_file_name: DEFAULT_CREDENTIALS_FILE_NAME.to_string(),
            allow_multiple_credentials: true,
            token_cache_key: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Config {
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::default_data_dir()?.join("config.json"))
    }

    pub fn default_data_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("failed to determine home directory"))?;
        Ok(home.join(".gmfetch"))
    }

    /// Loads the JSON file at `path` (when it exists) and applies `GMFETCH_*`
    /// environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::default_data_dir(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = get("CLIENT_ID") {
            self.oauth.client_id = value;
        }
        if let Some(value) = get("CLIENT_SECRET") {
            self.oauth.client_secret = value;
        }
        if let Some(value) = get("REDIRECT_URL") {
            self.oauth.redirect_url = value;
        }
        if let Some(value) = get("SCOPES") {
            self.oauth.scopes = split_list(&value)
                .map(|name| name.parse::<GmailScope>().map_err(|e| anyhow!(e)))
                .collect::<Result<Vec<_>>>()
                .context("parse GMFETCH_SCOPES")?;
        }
        if let Some(value) = get("ADDITIONAL_SCOPES") {
            self.oauth.additional_scopes = split_list(&value).map(str::to_string).collect();
        }
        if let Some(value) = get("ACCESS_TYPE") {
            self.oauth.access_type = value.parse().map_err(|e: String| anyhow!(e))?;
        }
        if let Some(value) = get("APPROVAL_PROMPT") {
            self.oauth.approval_prompt = value.parse().map_err(|e: String| anyhow!(e))?;
        }
        if let Some(value) = get("STATE") {
            self.oauth.state = Some(value);
        }
        if let Some(value) = get("TOKEN_STORE") {
            self.token_store = value.parse().map_err(|e: String| anyhow!(e))?;
        }
        if let Some(value) = get("DATA_DIR") {
            self.data_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = get("CREDENTIALS_FILE_NAME") {
            self.credentials_file_name = value;
        }
        if let Some(value) = get("ALLOW_MULTIPLE_CREDENTIALS") {
            self.allow_multiple_credentials = parse_bool(&value)
                .with_context(|| format!("invalid GMFETCH_ALLOW_MULTIPLE_CREDENTIALS '{value}'"))?;
        }
        if let Some(value) = get("TOKEN_CACHE_KEY") {
            self.token_cache_key = Some(value);
        }
        if let Some(value) = get("REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = value
                .parse()
                .with_context(|| format!("invalid GMFETCH_REQUEST_TIMEOUT_SECS '{value}'"))?;
        }
        Ok(())
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split([',', ' '])
        .map(str::trim)
        .filter(|part| !part.is_empty())
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("expected a boolean, got '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{AccessType, ApprovalPrompt, Config, GmailScope, OAuthSettings, TokenStoreKind};
    use super::{GMAIL_SCOPE_READONLY, GMAIL_SCOPE_SEND};

    fn apply(config: &mut Config, vars: &[(&str, &str)]) -> anyhow::Result<()> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config.apply_overrides(|key| map.get(key).cloned())
    }

    #[test]
    fn scope_names_map_to_urls() {
        assert_eq!("readonly".parse::<GmailScope>().unwrap().url(), GMAIL_SCOPE_READONLY);
        assert_eq!(
            "settings_basic".parse::<GmailScope>().unwrap(),
            GmailScope::SettingsBasic
        );
        assert!("bogus".parse::<GmailScope>().is_err());
    }

    #[test]
    fn scope_urls_are_deduplicated_and_keep_additional_scopes() {
        let settings = OAuthSettings {
            scopes: vec![GmailScope::Readonly, GmailScope::Send, GmailScope::Readonly],
            additional_scopes: vec![
                "openid".to_string(),
                GMAIL_SCOPE_SEND.to_string(),
                " ".to_string(),
            ],
            ..OAuthSettings::default()
        };

        assert_eq!(
            settings.scope_urls(),
            vec![
                GMAIL_SCOPE_READONLY.to_string(),
                GMAIL_SCOPE_SEND.to_string(),
                "openid".to_string(),
            ]
        );
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut config = Config::default();
        apply(
            &mut config,
            &[
                ("CLIENT_ID", "id-123"),
                ("CLIENT_SECRET", "secret"),
                ("SCOPES", "readonly, modify"),
                ("ACCESS_TYPE", "online"),
                ("APPROVAL_PROMPT", "auto"),
                ("TOKEN_STORE", "file"),
                ("ALLOW_MULTIPLE_CREDENTIALS", "false"),
                ("REQUEST_TIMEOUT_SECS", "5"),
            ],
        )
        .expect("apply overrides");

        assert_eq!(config.oauth.client_id, "id-123");
        assert_eq!(
            config.oauth.scopes,
            vec![GmailScope::Readonly, GmailScope::Modify]
        );
        assert_eq!(config.oauth.access_type, AccessType::Online);
        assert_eq!(config.oauth.approval_prompt, ApprovalPrompt::Auto);
        assert_eq!(config.token_store, TokenStoreKind::File);
        assert!(!config.allow_multiple_credentials);
        assert_eq!(config.request_timeout().as_secs(), 5);
        config.oauth.validate().expect("settings are complete");
    }

    #[test]
    fn invalid_override_is_reported() {
        let mut config = Config::default();
        assert!(apply(&mut config, &[("SCOPES", "readonly,nope")]).is_err());
        assert!(apply(&mut config, &[("ALLOW_MULTIPLE_CREDENTIALS", "maybe")]).is_err());
    }

    #[test]
    fn validate_requires_client_credentials() {
        assert!(OAuthSettings::default().validate().is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"oauth":{"client_id":"abc","scopes":["readonly","send"]},"token_store":"file"}"#,
        )
        .expect("parse config json");
        assert_eq!(config.oauth.client_id, "abc");
        assert_eq!(config.oauth.access_type, AccessType::Offline);
        assert_eq!(config.token_store, TokenStoreKind::File);
        assert!(config.allow_multiple_credentials);
    }
}
