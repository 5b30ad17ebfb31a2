//! Deduplicated, reference-counted content storage.
//!
//! Content is addressed by the hex MD5 of its bytes. Each distinct hash has
//! one `content_blobs` row and one file at `{data_dir}/blobs/{hash}`; any
//! number of `path_entries` point at it.
//!
//! `ref_count` equals the number of path entries referencing the blob, plus
//! any `BlobRef` returned by `put` and not yet consumed by `bind_path` or
//! `release`. Every mutation runs in a transaction under the database lock,
//! and a blob whose count drops to zero is deleted (row and file) before the
//! lock is released, so no path entry can ever resolve to reclaimed content.
//!
//! A `BlobRef` that is dropped without being consumed leaves its reference
//! behind. `sweep` reconciles such blobs back to their entry count once the
//! last `put` on them is older than the reservation grace period.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::MutexGuard;
use std::time::Duration;

use chrono::Utc;
use md5::{Digest, Md5};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::models::{ContentBlob, PathEntry, Visibility};
use crate::db::DbPool;
use crate::error::StoreError;

const BLOB_COLUMNS: &str = "id, hash, size, ref_count, created_at";
const ENTRY_COLUMNS: &str = "id, owner_id, blob_id, path, share_link, created_at, downloads, \
                             is_private, link_password, is_dir";

/// Hex MD5 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Normalize a logical path: absolute, no `.`/`..` segments, repeated and
/// trailing slashes collapsed. The root itself cannot be bound.
pub fn normalize_path(path: &str) -> Result<String, StoreError> {
    if !path.starts_with('/') {
        return Err(StoreError::InvalidPath(format!("{} is not absolute", path)));
    }
    let mut segments = Vec::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(StoreError::InvalidPath(format!("{} contains {}", path, segment)));
        }
        segments.push(segment);
    }
    if segments.is_empty() {
        return Err(StoreError::InvalidPath("root cannot be bound".to_string()));
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Outcome of dropping a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub hash: String,
    /// References left on the blob
    pub ref_count: i64,
    /// True when the count hit zero and the blob was deleted
    pub reclaimed: bool,
}

/// One reference on a stored blob, taken by `ContentStore::put`.
///
/// Not `Clone`: `bind_path` and `release` take it by value, so a reference
/// backs at most one path entry.
#[derive(Debug)]
#[must_use = "an unconsumed reference keeps the blob alive until the next sweep"]
pub struct BlobRef {
    blob: ContentBlob,
}

impl BlobRef {
    /// The blob as it was when the reference was taken.
    pub fn blob(&self) -> &ContentBlob {
        &self.blob
    }

    pub fn hash(&self) -> &str {
        &self.blob.hash
    }
}

/// Result of a maintenance sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Blobs whose abandoned `put` references were dropped
    pub stale_reservations: usize,
    /// Rows with zero references removed
    pub zero_ref_rows: usize,
    /// Files with no matching row removed
    pub orphan_files: usize,
}

/// Handle to the content store. Cheap to clone.
#[derive(Clone)]
pub struct ContentStore {
    db: DbPool,
    blobs_dir: PathBuf,
}

impl ContentStore {
    /// Open the store, creating `{data_dir}/blobs` if needed.
    pub fn new(db: DbPool, data_dir: &str) -> Result<Self, StoreError> {
        let blobs_dir = Path::new(data_dir).join("blobs");
        std::fs::create_dir_all(&blobs_dir)?;
        Ok(Self { db, blobs_dir })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|e| StoreError::Lock(e.to_string()))
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.blobs_dir.join(hash)
    }

    /// Take a reference on the blob for `bytes`, storing the bytes only if
    /// the hash is new. The reference must be handed to `bind_path` or given
    /// back with `release`.
    pub fn put(&self, bytes: &[u8]) -> Result<BlobRef, StoreError> {
        let hash = content_hash(bytes);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let blob = self.acquire(&tx, &hash, bytes)?;
        tx.commit()?;
        Ok(BlobRef { blob })
    }

    /// Create a path entry for a reference obtained from `put`, consuming it.
    /// If the entry cannot be created the reference is released.
    ///
    /// Fails with `NotFound` and creates nothing when the blob no longer
    /// carries a reference beyond its entries (a sweep already reclaimed it).
    pub fn bind_path(
        &self,
        owner_id: i64,
        path: &str,
        reference: BlobRef,
        visibility: Visibility,
        link_password: Option<&str>,
    ) -> Result<PathEntry, StoreError> {
        let blob = reference.blob;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if unbound_references(&tx, blob.id)? < 1 {
            return Err(StoreError::NotFound(format!("reference on blob {}", blob.hash)));
        }

        let bound = normalize_path(path)
            .and_then(|path| insert_entry(&tx, owner_id, &path, blob.id, visibility, link_password, false));
        match bound {
            Ok(entry) => {
                tx.commit()?;
                tracing::debug!(owner = owner_id, path = %entry.path, hash = %blob.hash, "Bound path");
                Ok(entry)
            }
            Err(e) => {
                let released = decrement(&tx, blob.id)?;
                tx.commit()?;
                if released.reclaimed {
                    self.remove_blob_file(&released.hash);
                }
                Err(e)
            }
        }
    }

    /// `put` and `bind_path` in one transaction.
    pub fn upload(
        &self,
        owner_id: i64,
        path: &str,
        bytes: &[u8],
        visibility: Visibility,
        link_password: Option<&str>,
    ) -> Result<PathEntry, StoreError> {
        self.create_entry(owner_id, path, bytes, visibility, link_password, false)
    }

    /// Create a directory entry. Directories reference the empty-content blob.
    pub fn make_directory(&self, owner_id: i64, path: &str) -> Result<PathEntry, StoreError> {
        self.create_entry(owner_id, path, &[], Visibility::Private, None, true)
    }

    fn create_entry(
        &self,
        owner_id: i64,
        path: &str,
        bytes: &[u8],
        visibility: Visibility,
        link_password: Option<&str>,
        is_dir: bool,
    ) -> Result<PathEntry, StoreError> {
        let path = normalize_path(path)?;
        let hash = content_hash(bytes);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if load_entry_by_path(&tx, owner_id, &path)?.is_some() {
            return Err(StoreError::PathExists(path));
        }
        let blob = self.acquire(&tx, &hash, bytes)?;
        let entry = insert_entry(&tx, owner_id, &path, blob.id, visibility, link_password, is_dir)?;
        tx.commit()?;

        tracing::debug!(
            owner = owner_id,
            path = %entry.path,
            hash = %blob.hash,
            ref_count = blob.ref_count,
            "Stored entry"
        );
        Ok(entry)
    }

    /// Delete a path entry and drop its blob reference, reclaiming the blob
    /// when it was the last one.
    pub fn unbind_path(&self, entry_id: i64) -> Result<Released, StoreError> {
        let mut conn = self.lock()?;
        let entry = load_entry(&conn, entry_id)?
            .ok_or_else(|| StoreError::NotFound(format!("path entry {}", entry_id)))?;

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM path_entries WHERE id = ?1", params![entry_id])?;
        let released = decrement(&tx, entry.blob_id)?;
        tx.commit()?;

        if released.reclaimed {
            self.remove_blob_file(&released.hash);
        }
        tracing::debug!(
            owner = entry.owner_id,
            path = %entry.path,
            ref_count = released.ref_count,
            reclaimed = released.reclaimed,
            "Unbound path"
        );
        Ok(released)
    }

    /// Give back a reference taken by `put` that was never bound.
    pub fn release(&self, reference: BlobRef) -> Result<Released, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if unbound_references(&tx, reference.blob.id)? < 1 {
            return Err(StoreError::NotFound(format!("reference on blob {}", reference.blob.hash)));
        }
        let released = decrement(&tx, reference.blob.id)?;
        tx.commit()?;
        if released.reclaimed {
            self.remove_blob_file(&released.hash);
        }
        Ok(released)
    }

    /// Insert or re-reference the blob for `hash` inside `tx`.
    fn acquire(&self, tx: &Connection, hash: &str, bytes: &[u8]) -> Result<ContentBlob, StoreError> {
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM content_blobs WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE content_blobs SET ref_count = ref_count + 1, last_acquired_at = ?1
                     WHERE id = ?2",
                    params![Utc::now().timestamp(), id],
                )?;
                if !self.blob_path(hash).exists() {
                    tracing::warn!(hash = %hash, "Blob file missing, rewriting");
                    self.write_blob_file(hash, bytes)?;
                }
            }
            None => {
                let now = Utc::now();
                self.write_blob_file(hash, bytes)?;
                tx.execute(
                    "INSERT INTO content_blobs (hash, size, ref_count, created_at, last_acquired_at)
                     VALUES (?1, ?2, 1, ?3, ?4)",
                    params![hash, bytes.len() as i64, now.to_rfc3339(), now.timestamp()],
                )?;
            }
        }

        load_blob_by_hash(tx, hash)?
            .ok_or_else(|| StoreError::NotFound(format!("blob {}", hash)))
    }

    fn write_blob_file(&self, hash: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = self.blobs_dir.join(format!("{}.tmp", hash));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, self.blob_path(hash))?;
        Ok(())
    }

    fn remove_blob_file(&self, hash: &str) {
        if let Err(e) = std::fs::remove_file(self.blob_path(hash)) {
            // The sweep retries orphaned files
            tracing::warn!(hash = %hash, "Failed to remove blob file: {}", e);
        }
    }

    /// Read the content behind a path entry.
    pub fn read(&self, entry_id: i64) -> Result<Vec<u8>, StoreError> {
        let conn = self.lock()?;
        let hash: Option<String> = conn
            .query_row(
                "SELECT b.hash FROM path_entries e
                 JOIN content_blobs b ON b.id = e.blob_id
                 WHERE e.id = ?1 AND b.ref_count > 0",
                params![entry_id],
                |row| row.get(0),
            )
            .optional()?;
        let hash = hash.ok_or_else(|| StoreError::NotFound(format!("path entry {}", entry_id)))?;
        Ok(std::fs::read(self.blob_path(&hash))?)
    }

    pub fn entry(&self, entry_id: i64) -> Result<Option<PathEntry>, StoreError> {
        let conn = self.lock()?;
        load_entry(&conn, entry_id)
    }

    pub fn find_entry(&self, owner_id: i64, path: &str) -> Result<Option<PathEntry>, StoreError> {
        let path = normalize_path(path)?;
        let conn = self.lock()?;
        load_entry_by_path(&conn, owner_id, &path)
    }

    /// All entries of `owner`, ordered by path.
    pub fn list_entries(&self, owner_id: i64) -> Result<Vec<PathEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM path_entries WHERE owner_id = ?1 ORDER BY path",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![owner_id], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Blob row for `hash`, if it is still stored.
    pub fn blob(&self, hash: &str) -> Result<Option<ContentBlob>, StoreError> {
        let conn = self.lock()?;
        load_blob_by_hash(&conn, hash)
    }

    /// Make an entry public under a fresh share link, optionally guarded by
    /// a link password. Returns the link token.
    pub fn publish(&self, entry_id: i64, link_password: Option<&str>) -> Result<String, StoreError> {
        let link = Uuid::new_v4().simple().to_string();
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE path_entries SET is_private = 0, share_link = ?1, link_password = ?2
             WHERE id = ?3",
            params![link, link_password, entry_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("path entry {}", entry_id)));
        }
        Ok(link)
    }

    /// Read a public entry through its share link and count the download.
    pub fn open_shared(
        &self,
        link: &str,
        password: Option<&str>,
    ) -> Result<(PathEntry, Vec<u8>), StoreError> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM path_entries WHERE share_link = ?1 AND is_private = 0",
                    ENTRY_COLUMNS
                ),
                params![link],
                entry_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound("share link".to_string()))?;

        if let Some(expected) = entry.link_password.as_deref() {
            if password != Some(expected) {
                return Err(StoreError::AccessDenied);
            }
        }

        let blob = load_blob_by_id(&conn, entry.blob_id)?
            .filter(|blob| blob.ref_count > 0)
            .ok_or_else(|| StoreError::NotFound(format!("blob of entry {}", entry.id)))?;
        let bytes = std::fs::read(self.blob_path(&blob.hash))?;

        conn.execute(
            "UPDATE path_entries SET downloads = downloads + 1 WHERE id = ?1",
            params![entry.id],
        )?;
        let entry = PathEntry {
            downloads: entry.downloads + 1,
            ..entry
        };
        Ok((entry, bytes))
    }

    /// Maintenance pass, in order:
    ///
    /// 1. blobs carrying more references than entries, with no `put` within
    ///    `reservation_grace`, are set back to their entry count;
    /// 2. unreferenced blob rows are deleted;
    /// 3. any file in the blobs directory without a row (left by an aborted
    ///    upload, a failed removal, or step 2) is deleted.
    pub fn sweep(&self, reservation_grace: Duration) -> Result<SweepReport, StoreError> {
        let mut conn = self.lock()?;
        let mut report = SweepReport::default();

        let grace = i64::try_from(reservation_grace.as_secs()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp().saturating_sub(grace);
        let tx = conn.transaction()?;
        let mut stmt = tx.prepare(
            "SELECT b.id, b.hash, b.ref_count,
                    (SELECT COUNT(*) FROM path_entries e WHERE e.blob_id = b.id) AS live
             FROM content_blobs b
             WHERE b.last_acquired_at <= ?1",
        )?;
        let stale: Vec<(i64, String, i64)> = stmt
            .query_map(params![cutoff], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .filter_map(|row| match row {
                Ok((id, hash, ref_count, live)) if ref_count > live => Some(Ok((id, hash, live))),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
            .collect::<Result<_, _>>()?;
        drop(stmt);
        for (id, hash, live) in &stale {
            tracing::warn!(hash = %hash, entries = *live, "Dropping abandoned blob references");
            tx.execute(
                "UPDATE content_blobs SET ref_count = ?1 WHERE id = ?2",
                params![live, id],
            )?;
        }
        tx.commit()?;
        report.stale_reservations = stale.len();

        let mut stmt = conn.prepare(
            "SELECT hash FROM content_blobs b WHERE ref_count = 0
             AND NOT EXISTS (SELECT 1 FROM path_entries e WHERE e.blob_id = b.id)",
        )?;
        let dead: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        for hash in &dead {
            conn.execute("DELETE FROM content_blobs WHERE hash = ?1", params![hash])?;
        }
        report.zero_ref_rows = dead.len();

        let mut stmt = conn.prepare("SELECT hash FROM content_blobs")?;
        let live: HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for dir_entry in std::fs::read_dir(&self.blobs_dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if live.contains(&name) {
                continue;
            }
            match std::fs::remove_file(dir_entry.path()) {
                Ok(()) => report.orphan_files += 1,
                Err(e) => tracing::warn!("Failed to remove orphan blob {}: {}", name, e),
            }
        }

        Ok(report)
    }
}

fn blob_from_row(row: &Row<'_>) -> rusqlite::Result<ContentBlob> {
    Ok(ContentBlob {
        id: row.get(0)?,
        hash: row.get(1)?,
        size: row.get(2)?,
        ref_count: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<PathEntry> {
    Ok(PathEntry {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        blob_id: row.get(2)?,
        path: row.get(3)?,
        share_link: row.get(4)?,
        created_at: row.get(5)?,
        downloads: row.get(6)?,
        visibility: Visibility::from_private_flag(row.get(7)?),
        link_password: row.get(8)?,
        is_dir: row.get(9)?,
    })
}

fn load_blob_by_hash(conn: &Connection, hash: &str) -> Result<Option<ContentBlob>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM content_blobs WHERE hash = ?1", BLOB_COLUMNS),
            params![hash],
            blob_from_row,
        )
        .optional()?)
}

fn load_blob_by_id(conn: &Connection, id: i64) -> Result<Option<ContentBlob>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM content_blobs WHERE id = ?1", BLOB_COLUMNS),
            params![id],
            blob_from_row,
        )
        .optional()?)
}

fn load_entry(conn: &Connection, id: i64) -> Result<Option<PathEntry>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM path_entries WHERE id = ?1", ENTRY_COLUMNS),
            params![id],
            entry_from_row,
        )
        .optional()?)
}

fn load_entry_by_path(
    conn: &Connection,
    owner_id: i64,
    path: &str,
) -> Result<Option<PathEntry>, StoreError> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM path_entries WHERE owner_id = ?1 AND path = ?2",
                ENTRY_COLUMNS
            ),
            params![owner_id, path],
            entry_from_row,
        )
        .optional()?)
}

fn insert_entry(
    conn: &Connection,
    owner_id: i64,
    path: &str,
    blob_id: i64,
    visibility: Visibility,
    link_password: Option<&str>,
    is_dir: bool,
) -> Result<PathEntry, StoreError> {
    if load_entry_by_path(conn, owner_id, path)?.is_some() {
        return Err(StoreError::PathExists(path.to_string()));
    }
    conn.execute(
        "INSERT INTO path_entries
         (owner_id, blob_id, path, created_at, is_private, link_password, is_dir)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            owner_id,
            blob_id,
            path,
            Utc::now().to_rfc3339(),
            visibility.is_private(),
            link_password,
            is_dir,
        ],
    )?;
    load_entry(conn, conn.last_insert_rowid())?
        .ok_or_else(|| StoreError::NotFound(format!("path entry {}", path)))
}

/// References on `blob_id` not backed by a path entry; 0 for a missing blob.
fn unbound_references(conn: &Connection, blob_id: i64) -> Result<i64, StoreError> {
    let unbound: Option<i64> = conn
        .query_row(
            "SELECT b.ref_count - (SELECT COUNT(*) FROM path_entries e WHERE e.blob_id = b.id)
             FROM content_blobs b WHERE b.id = ?1",
            params![blob_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(unbound.unwrap_or(0))
}

/// Drop one reference; delete the row when none remain. The caller removes
/// the file after committing.
fn decrement(conn: &Connection, blob_id: i64) -> Result<Released, StoreError> {
    let blob = load_blob_by_id(conn, blob_id)?
        .ok_or_else(|| StoreError::NotFound(format!("blob {}", blob_id)))?;
    let ref_count = (blob.ref_count - 1).max(0);

    if ref_count == 0 {
        conn.execute("DELETE FROM content_blobs WHERE id = ?1", params![blob_id])?;
    } else {
        conn.execute(
            "UPDATE content_blobs SET ref_count = ?1 WHERE id = ?2",
            params![ref_count, blob_id],
        )?;
    }

    Ok(Released {
        hash: blob.hash,
        ref_count,
        reclaimed: ref_count == 0,
    })
}
