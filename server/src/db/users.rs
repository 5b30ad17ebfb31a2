//! Credential collaborator consumed by the handshake.
//!
//! Every query is parameterized; usernames never get spliced into SQL text.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::models::CredentialRecord;
use crate::db::DbPool;

/// Look up the credential row for `username`. `Ok(None)` when absent.
pub fn lookup_credential(
    conn: &Connection,
    username: &str,
) -> Result<Option<CredentialRecord>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, username, password, created_at FROM users WHERE username = ?1",
        params![username],
        |row| {
            Ok(CredentialRecord {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        },
    )
    .optional()
}

/// Insert a new account and return its id.
pub fn create_user(conn: &Connection, username: &str, password: &str) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO users (username, password, created_at) VALUES (?1, ?2, ?3)",
        params![username, password, Utc::now().to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Create each account that does not exist yet. Returns how many were added.
pub fn seed_users(db: &DbPool, users: &[(String, String)]) -> Result<usize, String> {
    let conn = db.lock().map_err(|e| format!("DB lock error: {}", e))?;
    let mut added = 0;
    for (username, password) in users {
        let existing = lookup_credential(&conn, username)
            .map_err(|e| format!("Failed to look up user {}: {}", username, e))?;
        if existing.is_some() {
            tracing::debug!("User {} already exists, skipping", username);
            continue;
        }
        create_user(&conn, username, password)
            .map_err(|e| format!("Failed to create user {}: {}", username, e))?;
        added += 1;
    }
    Ok(added)
}
