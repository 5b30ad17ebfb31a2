//! Deduplicated content storage.
//!
//! Storage layout: `{data_dir}/blobs/{md5_hex}` holds the bytes of each
//! distinct content. Blob reference counts and per-user path entries are
//! tracked in the SQLite `content_blobs` and `path_entries` tables.

pub mod store;
pub mod sweep;

pub use store::{content_hash, normalize_path, BlobRef, ContentStore, Released, SweepReport};
