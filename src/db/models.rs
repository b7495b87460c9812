use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

use crate::credentials::{non_empty, parse_scope, Credential};

/// One `gmail_tokens` row. Column names follow the table, which keeps the
/// legacy `userId` spelling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenRow {
    pub user_id: String,
    pub email: Option<String>,
    pub access_token: String,
    pub expires_in: i64,
    /// Space-delimited.
    pub scope: String,
    pub token_type: String,
    pub created: i64,
    pub refresh_token: Option<String>,
}

impl TokenRow {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            user_id: row.get("userId")?,
            email: row.get("email")?,
            access_token: row.get("access_token")?,
            expires_in: row.get("expires_in")?,
            scope: row.get("scope")?,
            token_type: row.get("token_type")?,
            created: row.get("created")?,
            refresh_token: row.get("refresh_token")?,
        })
    }

    pub fn from_credential(credential: &Credential) -> Self {
        Self {
            user_id: credential.identity_key.clone(),
            email: non_empty(credential.email.as_deref()).map(str::to_string),
            access_token: credential.access_token.clone(),
            expires_in: i64::try_from(credential.expires_in).unwrap_or(i64::MAX),
            scope: credential.scope_string(),
            token_type: credential.token_type.clone(),
            created: credential.created_at,
            refresh_token: non_empty(credential.refresh_token.as_deref()).map(str::to_string),
        }
    }

    pub fn into_credential(self) -> Credential {
        Credential {
            identity_key: self.user_id,
            email: self.email.filter(|email| !email.trim().is_empty()),
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|token| !token.trim().is_empty()),
            token_type: self.token_type,
            scope: parse_scope(&self.scope),
            created_at: self.created,
            expires_in: u64::try_from(self.expires_in).unwrap_or(0),
        }
    }
}
