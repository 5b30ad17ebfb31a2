use std::time::Duration;

use crate::auth::token::SecurityLevel;
use crate::config::Config;
use crate::content::ContentStore;
use crate::db::DbPool;
use crate::error::StoreError;
use crate::session::SessionRegistry;

/// Shared server state handed to every connection task.
#[derive(Clone)]
pub struct ServerState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// Logged-in users and their transmission channels
    pub sessions: SessionRegistry,
    /// Deduplicated file content
    pub store: ContentStore,
    /// Strength of issued tokens
    pub security_level: SecurityLevel,
    /// Receive buffer capacity per connection
    pub auth_buffer_size: usize,
    /// Receive poll tick
    pub tick: Duration,
    /// Empty ticks before a pending receive times out (0 = never)
    pub idle_tick_limit: u32,
    /// Channels a user may bind in parallel
    pub max_transmission_channels: usize,
}

impl ServerState {
    pub fn from_config(config: &Config, db: DbPool) -> Result<Self, StoreError> {
        let store = ContentStore::new(db.clone(), &config.data_dir)?;
        Ok(Self {
            db,
            sessions: SessionRegistry::new(),
            store,
            security_level: SecurityLevel::from_level(config.security_level),
            auth_buffer_size: config.auth_buffer_size,
            tick: config.tick_interval(),
            idle_tick_limit: config.idle_tick_limit,
            max_transmission_channels: config.max_transmission_channels,
        })
    }
}
