use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking, no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "-- Migration 1: Initial schema

CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE content_blobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hash TEXT NOT NULL UNIQUE,
    size INTEGER NOT NULL,
    ref_count INTEGER NOT NULL CHECK (ref_count >= 0),
    created_at TEXT NOT NULL,
    -- Unix seconds of the latest reference taken
    last_acquired_at INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE path_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    blob_id INTEGER NOT NULL,
    path TEXT NOT NULL,
    share_link TEXT UNIQUE,
    created_at TEXT NOT NULL,
    downloads INTEGER NOT NULL DEFAULT 0,
    is_private INTEGER NOT NULL DEFAULT 1,
    link_password TEXT,
    is_dir INTEGER NOT NULL DEFAULT 0,
    UNIQUE (owner_id, path),
    FOREIGN KEY (owner_id) REFERENCES users(id),
    FOREIGN KEY (blob_id) REFERENCES content_blobs(id)
);

CREATE INDEX idx_path_entries_blob ON path_entries(blob_id);
",
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }
}
