//! Token database versioning. The version lives in SQLite's `user_version`
//! header field; each step runs in its own transaction and bumps it.

use rusqlite::Connection;
use tracing::info;

use crate::credentials::store::StoreError;
use crate::db::schema::{self, TOKEN_COLUMNS, TOKEN_TABLE};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Index `n` upgrades a database from version `n` to `n + 1`.
const STEPS: &[Step] = &[schema::create_token_table];

pub fn latest_version() -> u32 {
    STEPS.len() as u32
}

pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let current = user_version(conn)?;
    let latest = latest_version();
    if current > latest {
        return Err(StoreError::Config(format!(
            "token database is at version {current}; this build understands up to {latest}"
        )));
    }

    for (from, step) in STEPS.iter().enumerate().skip(current as usize) {
        let to = from as u32 + 1;
        let tx = conn.unchecked_transaction()?;
        step(&tx)?;
        tx.pragma_update(None, "user_version", to)?;
        tx.commit()?;
        info!(version = to, "migrated token database");
    }

    check_token_columns(conn)
}

pub(crate) fn user_version(conn: &Connection) -> Result<u32, StoreError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// A `gmail_tokens` table left by another tool keeps its layout through
/// `CREATE TABLE IF NOT EXISTS`; refuse to read or write it.
fn check_token_columns(conn: &Connection) -> Result<(), StoreError> {
    let found = schema::token_columns(conn)?;
    if found.iter().map(String::as_str).eq(TOKEN_COLUMNS) {
        return Ok(());
    }
    Err(StoreError::Config(format!(
        "{TOKEN_TABLE} has columns [{}], expected [{}]",
        found.join(", "),
        TOKEN_COLUMNS.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rusqlite::{params, Connection};
    use uuid::Uuid;

    use super::{latest_version, migrate, user_version};
    use crate::credentials::store::StoreError;
    use crate::db::schema::{token_columns, TOKEN_COLUMNS};

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("gmfetch-migrations-{}.db", Uuid::new_v4()))
    }

    #[test]
    fn fresh_database_gets_exact_token_layout() -> Result<(), StoreError> {
        let conn = Connection::open_in_memory()?;
        assert_eq!(user_version(&conn)?, 0);

        migrate(&conn)?;

        assert_eq!(user_version(&conn)?, latest_version());
        assert_eq!(token_columns(&conn)?, TOKEN_COLUMNS);

        let pk: Vec<String> = conn
            .prepare("SELECT name FROM pragma_table_info('gmail_tokens') WHERE pk > 0")?
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        assert_eq!(pk, vec!["userId".to_string()]);
        Ok(())
    }

    #[test]
    fn rerun_keeps_rows_and_rejects_duplicate_keys() -> Result<(), StoreError> {
        let db_path = temp_db_path();
        {
            let conn = Connection::open(&db_path)?;
            migrate(&conn)?;
            conn.execute(
                "INSERT INTO gmail_tokens (userId, access_token, expires_in, created) VALUES (?1, ?2, ?3, ?4)",
                params!["user-1", "T1", 3600, 1000],
            )?;
        }

        let conn = Connection::open(&db_path)?;
        migrate(&conn)?;
        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM gmail_tokens", [], |row| row.get(0))?;
        assert_eq!(rows, 1);
        assert!(conn
            .execute(
                "INSERT INTO gmail_tokens (userId, access_token, expires_in, created) VALUES (?1, ?2, ?3, ?4)",
                params!["user-1", "T2", 3600, 2000],
            )
            .is_err());

        drop(conn);
        let _ = std::fs::remove_file(db_path);
        Ok(())
    }

    #[test]
    fn newer_version_is_rejected() -> Result<(), StoreError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        conn.pragma_update(None, "user_version", 99)?;

        assert!(matches!(migrate(&conn), Err(StoreError::Config(_))));
        Ok(())
    }

    #[test]
    fn foreign_token_table_is_rejected() -> Result<(), StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE gmail_tokens (id INTEGER PRIMARY KEY, userId INTEGER, email TEXT, access_token TEXT)",
        )?;

        match migrate(&conn) {
            Err(StoreError::Config(detail)) => assert!(detail.contains("id, userId")),
            other => panic!("expected layout error, got {other:?}"),
        }
        Ok(())
    }
}
