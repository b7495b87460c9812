use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::debug;

use crate::credentials::store::{validate_credential, CredentialStore, StoreError};
use crate::credentials::Credential;

use self::models::TokenRow;

pub mod migrations;
pub mod models;
pub mod schema;

#[derive(Debug, Clone, Serialize)]
pub struct TokenSummary {
    pub user_id: String,
    pub email: Option<String>,
    pub expires_at: i64,
    pub has_refresh_token: bool,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let mut db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut db = Self {
            conn: Connection::open_in_memory()?,
            path: PathBuf::from(":memory:"),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&mut self) -> Result<(), StoreError> {
        migrations::migrate(&self.conn)
    }

    pub fn default_db_path() -> Result<PathBuf, StoreError> {
        let home = dirs::home_dir()
            .ok_or_else(|| StoreError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".gmfetch").join("gmfetch.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_token(&self, user_id: &str) -> Result<Option<TokenRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT userId, email, access_token, expires_in, scope, token_type, created, refresh_token
            FROM gmail_tokens
            WHERE userId = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([user_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(TokenRow::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// Insert or replace the row keyed by `token.user_id`.
    pub fn upsert_token(&self, token: &TokenRow) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO gmail_tokens (
                userId, email, access_token, expires_in, scope, token_type, created, refresh_token
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(userId) DO UPDATE SET
                email = excluded.email,
                access_token = excluded.access_token,
                expires_in = excluded.expires_in,
                scope = excluded.scope,
                token_type = excluded.token_type,
                created = excluded.created,
                refresh_token = excluded.refresh_token
            "#,
            params![
                token.user_id,
                token.email,
                token.access_token,
                token.expires_in,
                token.scope,
                token.token_type,
                token.created,
                token.refresh_token,
            ],
        )?;

        Ok(())
    }

    pub fn delete_token(&self, user_id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM gmail_tokens WHERE userId = ?", [user_id])?;
        Ok(deleted > 0)
    }

    pub fn list_tokens(&self) -> Result<Vec<TokenSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT userId, email, expires_in, created, refresh_token
            FROM gmail_tokens
            ORDER BY userId ASC
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            let expires_in: i64 = row.get("expires_in")?;
            let created: i64 = row.get("created")?;
            let refresh_token: Option<String> = row.get("refresh_token")?;
            Ok(TokenSummary {
                user_id: row.get("userId")?,
                email: row.get("email")?,
                expires_at: created.saturating_add(expires_in),
                has_refresh_token: refresh_token.is_some_and(|token| !token.trim().is_empty()),
            })
        })?;

        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(row?);
        }
        Ok(tokens)
    }
}

/// [`CredentialStore`] over the `gmail_tokens` table.
pub struct SqliteCredentialStore {
    db: Mutex<Database>,
}

impl SqliteCredentialStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn list(&self) -> Result<Vec<TokenSummary>, StoreError> {
        self.lock().list_tokens()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Database> {
        self.db
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn get(&self, identity_key: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self
            .lock()
            .get_token(identity_key)?
            .map(TokenRow::into_credential))
    }

    fn put(&self, identity_key: &str, credential: &Credential) -> Result<(), StoreError> {
        validate_credential(identity_key, credential)?;
        self.lock()
            .upsert_token(&TokenRow::from_credential(credential))?;
        debug!(identity_key, "stored gmail credential in sqlite");
        Ok(())
    }

    fn delete(&self, identity_key: &str) -> Result<(), StoreError> {
        if self.lock().delete_token(identity_key)? {
            debug!(identity_key, "deleted gmail credential from sqlite");
        }
        Ok(())
    }
}
