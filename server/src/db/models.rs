/// Database row types for all tables.
/// These correspond 1:1 to the SQLite schema defined in migrations.rs.

/// Account row in the users table. Handshake only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub id: i64,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

/// Deduplicated content unit, one row per distinct content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentBlob {
    pub id: i64,
    /// Hex MD5 of the content bytes
    pub hash: String,
    pub size: i64,
    /// Number of live path entries plus unconsumed `BlobRef`s
    pub ref_count: i64,
    pub created_at: String,
}

/// Whether a path entry can be reached through its share link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Private,
    Public,
}

impl Visibility {
    pub fn is_private(self) -> bool {
        matches!(self, Visibility::Private)
    }

    pub fn from_private_flag(is_private: bool) -> Self {
        if is_private {
            Visibility::Private
        } else {
            Visibility::Public
        }
    }
}

/// User-visible file or directory record pointing at a content blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub id: i64,
    pub owner_id: i64,
    pub blob_id: i64,
    pub path: String,
    pub share_link: Option<String>,
    pub created_at: String,
    pub downloads: i64,
    pub visibility: Visibility,
    pub link_password: Option<String>,
    pub is_dir: bool,
}
