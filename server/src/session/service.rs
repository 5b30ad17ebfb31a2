use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ReceiveError;
use crate::session::user::{ChannelGuard, User};
use crate::transmit::Transmittable;

/// Loops that take over a connection once the handshake has accepted it.
///
/// `serve_session` runs for a new login and returns when the session ends;
/// the caller then logs the user out. `serve_transmission` runs on an extra
/// channel bound to an already logged-in user.
#[async_trait]
pub trait SessionService: Send + Sync + 'static {
    async fn serve_session(&self, user: Arc<User>, conn: &mut dyn Transmittable);

    async fn serve_transmission(&self, channel: ChannelGuard, conn: &mut dyn Transmittable);
}

/// Holds sessions and channels open, discarding inbound bytes, until the peer
/// disconnects or (for channels) the owning session logs out.
pub struct IdleService {
    tick: Duration,
}

impl IdleService {
    pub fn new(tick: Duration) -> Self {
        Self { tick }
    }

    /// Returns once the peer has gone away.
    async fn drain(&self, conn: &mut dyn Transmittable) {
        loop {
            match conn.receive_until(1, 0, self.tick).await {
                Ok(_) | Err(ReceiveError::TimedOut { .. }) => continue,
                Err(e) => {
                    tracing::debug!(peer = %conn.peer(), "Connection ended: {}", e);
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl SessionService for IdleService {
    async fn serve_session(&self, user: Arc<User>, conn: &mut dyn Transmittable) {
        tracing::debug!(user = %user.name(), "Session idle loop started");
        self.drain(conn).await;
    }

    async fn serve_transmission(&self, mut channel: ChannelGuard, conn: &mut dyn Transmittable) {
        let channel_id = channel.id();
        tokio::select! {
            _ = self.drain(conn) => {}
            _ = channel.closed() => {
                tracing::debug!(channel = channel_id, "Owner logged out, closing channel");
            }
        }
    }
}
