use rusqlite::Connection;

pub const TOKEN_TABLE: &str = "gmail_tokens";

/// Column order of `gmail_tokens`, as reported by `PRAGMA table_info`.
pub const TOKEN_COLUMNS: [&str; 8] = [
    "userId",
    "email",
    "access_token",
    "expires_in",
    "scope",
    "token_type",
    "created",
    "refresh_token",
];

/// One row per identity key, keyed by `userId`.
pub fn create_token_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS gmail_tokens (
            userId TEXT PRIMARY KEY NOT NULL,
            email TEXT,
            access_token TEXT NOT NULL,
            expires_in INTEGER NOT NULL,
            scope TEXT NOT NULL DEFAULT '',
            token_type TEXT NOT NULL DEFAULT 'Bearer',
            created INTEGER NOT NULL,
            refresh_token TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_gmail_tokens_email ON gmail_tokens(email);
        "#,
    )
}

/// Column names of `gmail_tokens` in declaration order; empty when the table
/// does not exist.
pub fn token_columns(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let columns = stmt.query_map([TOKEN_TABLE], |row| row.get(0))?;
    columns.collect()
}
