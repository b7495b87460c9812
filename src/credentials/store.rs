use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use super::cipher::TokenCipher;
use super::Credential;

pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_ACCESS_TOKEN_LEN: usize = 500;
pub const MAX_REFRESH_TOKEN_LEN: usize = 500;
pub const MAX_TOKEN_TYPE_LEN: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential encryption: {0}")]
    Crypto(String),

    #[error("invalid credential record: {0}")]
    InvalidRecord(String),

    #[error("{0}")]
    Config(String),
}

/// Persistence for one credential record per identity key.
///
/// `put` must be durable before it returns.
pub trait CredentialStore: Send + Sync {
    fn get(&self, identity_key: &str) -> Result<Option<Credential>, StoreError>;

    fn put(&self, identity_key: &str, credential: &Credential) -> Result<(), StoreError>;

    /// Deleting a missing record is not an error.
    fn delete(&self, identity_key: &str) -> Result<(), StoreError>;
}

/// Field checks applied by every backend before a write.
pub fn validate_credential(identity_key: &str, credential: &Credential) -> Result<(), StoreError> {
    if identity_key.trim().is_empty() {
        return Err(StoreError::InvalidRecord("identity key is empty".to_string()));
    }
    if credential.identity_key != identity_key {
        return Err(StoreError::InvalidRecord(format!(
            "record belongs to '{}' but was written under '{identity_key}'",
            credential.identity_key
        )));
    }
    if credential.access_token.trim().is_empty() {
        return Err(StoreError::InvalidRecord("access_token is empty".to_string()));
    }

    check_len("email", credential.email.as_deref().unwrap_or(""), MAX_EMAIL_LEN)?;
    check_len("access_token", &credential.access_token, MAX_ACCESS_TOKEN_LEN)?;
    check_len(
        "refresh_token",
        credential.refresh_token.as_deref().unwrap_or(""),
        MAX_REFRESH_TOKEN_LEN,
    )?;
    check_len("token_type", &credential.token_type, MAX_TOKEN_TYPE_LEN)?;
    Ok(())
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), StoreError> {
    let len = value.chars().count();
    if len > max {
        return Err(StoreError::InvalidRecord(format!(
            "{field} is {len} chars, limit is {max}"
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    records: Mutex<HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Credential>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, identity_key: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self.lock().get(identity_key).cloned())
    }

    fn put(&self, identity_key: &str, credential: &Credential) -> Result<(), StoreError> {
        validate_credential(identity_key, credential)?;
        self.lock()
            .insert(identity_key.to_string(), credential.clone());
        Ok(())
    }

    fn delete(&self, identity_key: &str) -> Result<(), StoreError> {
        self.lock().remove(identity_key);
        Ok(())
    }
}

/// One JSON file per identity, optionally sealed with a [`TokenCipher`].
///
/// With `allow_multiple` off every identity shares `<file_name>.json`, which
/// suits single-account installs.
#[derive(Debug)]
pub struct FileCredentialStore {
    dir: PathBuf,
    file_name: String,
    allow_multiple: bool,
    cipher: Option<TokenCipher>,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            file_name: file_name.into(),
            allow_multiple: true,
            cipher: None,
        }
    }

    pub fn with_cipher(mut self, cipher: TokenCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn allow_multiple(mut self, allow: bool) -> Self {
        self.allow_multiple = allow;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, identity_key: &str) -> PathBuf {
        let name = if self.allow_multiple && !identity_key.is_empty() {
            format!("{}-{}", self.file_name, sanitize_file_component(identity_key))
        } else {
            self.file_name.clone()
        };
        self.dir.join(format!("{name}.json"))
    }

    fn encode(&self, credential: &Credential) -> Result<String, StoreError> {
        let json = serde_json::to_string(credential)?;
        match &self.cipher {
            Some(cipher) => cipher.seal(json.as_bytes()),
            None => Ok(json),
        }
    }

    fn decode(&self, raw: &str) -> Result<Credential, StoreError> {
        match &self.cipher {
            Some(cipher) => {
                let plaintext = cipher.open(raw)?;
                Ok(serde_json::from_slice(&plaintext)?)
            }
            None => Ok(serde_json::from_str(raw)?),
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, identity_key: &str) -> Result<Option<Credential>, StoreError> {
        let path = self.path_for(identity_key);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }

        let mut credential = self.decode(&raw)?;
        // A shared file answers for whichever identity asks.
        if !self.allow_multiple {
            credential.identity_key = identity_key.to_string();
        }
        Ok(Some(credential))
    }

    fn put(&self, identity_key: &str, credential: &Credential) -> Result<(), StoreError> {
        validate_credential(identity_key, credential)?;
        std::fs::create_dir_all(&self.dir)?;

        let path = self.path_for(identity_key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, self.encode(credential)?)?;
        restrict_permissions(&tmp)?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "wrote credential file");
        Ok(())
    }

    fn delete(&self, identity_key: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path_for(identity_key)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

fn sanitize_file_component(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '@') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}
