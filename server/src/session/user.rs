use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::auth::token::Token;
use crate::error::RegistryError;

/// A transmission channel bound to a user's session.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: u64,
    pub peer: String,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SessionState {
    token: Option<Token>,
    path: String,
    channels: Vec<ChannelInfo>,
}

/// Session entity for a logged-in user.
///
/// Token, working path and bound channels live under one lock so a reconnect
/// check and a logout can never interleave.
#[derive(Debug)]
pub struct User {
    id: i64,
    name: String,
    state: Mutex<SessionState>,
    next_channel_id: AtomicU64,
    /// Flips to `true` on logout; every bound channel watches it
    shutdown: watch::Sender<bool>,
}

impl User {
    pub fn new(name: impl Into<String>, id: i64, path: impl Into<String>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id,
            name: name.into(),
            state: Mutex::new(SessionState {
                token: None,
                path: path.into(),
                channels: Vec::new(),
            }),
            next_channel_id: AtomicU64::new(1),
            shutdown,
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // A poisoned lock only means another connection task panicked mid-update;
    // the state itself is still a plain value.
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_path(&self) -> String {
        self.state().path.clone()
    }

    pub fn set_current_path(&self, path: impl Into<String>) {
        self.state().path = path.into();
    }

    pub fn set_token(&self, token: Token) {
        self.state().token = Some(token);
    }

    pub fn has_token(&self) -> bool {
        self.state().token.is_some()
    }

    /// True only while a session token is live and equals `secret`.
    pub fn token_matches(&self, secret: &[u8]) -> bool {
        self.state()
            .token
            .as_ref()
            .is_some_and(|token| token.as_bytes() == secret)
    }

    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.state().channels.clone()
    }

    pub fn channel_count(&self) -> usize {
        self.state().channels.len()
    }

    /// Verify `secret` against the live token and bind a new transmission
    /// channel in the same critical section.
    pub fn attach_channel(
        self: &Arc<Self>,
        secret: &[u8],
        peer: impl Into<String>,
        max_channels: usize,
    ) -> Result<ChannelGuard, RegistryError> {
        let mut state = self.state();
        let live = state
            .token
            .as_ref()
            .is_some_and(|token| token.as_bytes() == secret);
        if !live {
            return Err(RegistryError::TokenMismatch);
        }
        if state.channels.len() >= max_channels {
            return Err(RegistryError::ChannelLimit(max_channels));
        }

        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        state.channels.push(ChannelInfo {
            id,
            peer: peer.into(),
            opened_at: Utc::now(),
        });
        drop(state);

        Ok(ChannelGuard {
            user: self.clone(),
            id,
            shutdown: self.shutdown.subscribe(),
        })
    }

    fn detach_channel(&self, id: u64) {
        self.state().channels.retain(|c| c.id != id);
    }

    /// End the session: invalidate the token, drop every channel binding and
    /// tell the channel loops to stop.
    pub fn logout(&self) {
        {
            let mut state = self.state();
            state.token = None;
            state.channels.clear();
        }
        self.shutdown.send_replace(true);
        tracing::info!(user = %self.name, "User logged out");
    }

    pub fn is_logged_out(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Handle held by a transmission channel's connection task. Unbinds the
/// channel from its owner when dropped.
#[derive(Debug)]
pub struct ChannelGuard {
    user: Arc<User>,
    id: u64,
    shutdown: watch::Receiver<bool>,
}

impl ChannelGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> &Arc<User> {
        &self.user
    }

    /// Resolves once the owning session has logged out.
    pub async fn closed(&mut self) {
        // Err means the owner was dropped entirely, which also ends the channel
        let _ = self.shutdown.wait_for(|logged_out| *logged_out).await;
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.user.detach_channel(self.id);
    }
}
