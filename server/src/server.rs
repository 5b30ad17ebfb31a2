//! TCP accept loop and the per-connection driver.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::auth::handshake::{self, HandshakeOutcome};
use crate::auth::token::generate_token;
use crate::session::SessionService;
use crate::state::ServerState;
use crate::transmit::{TcpTransmitter, Transmittable};

/// Bind `addr` and serve connections until the listener fails.
pub async fn run(
    addr: SocketAddr,
    state: ServerState,
    service: Arc<dyn SessionService>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    serve(listener, state, service).await
}

/// Accept loop: one task per connection, each with its own token, buffer
/// and cipher key.
pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    service: Arc<dyn SessionService>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Error accepting connection: {}", e);
                continue;
            }
        };
        tracing::info!(peer = %peer, "Received connection request");

        let state = state.clone();
        let service = service.clone();
        tokio::spawn(async move {
            let token = generate_token(state.security_level);
            let conn = TcpTransmitter::new(stream, state.auth_buffer_size, token, peer.to_string())
                .with_idle_limit(state.idle_tick_limit);
            serve_connection(conn, &state, service.as_ref()).await;
        });
    }
}

/// Drive one connection: send the token in the clear, run the handshake,
/// then hand the connection to the session loop (new login) or the
/// transmission loop (reconnect). The connection's cipher key is the token.
pub async fn serve_connection<T>(mut conn: T, state: &ServerState, service: &dyn SessionService)
where
    T: Transmittable,
{
    let token = conn.cipher_key().clone();
    if let Err(e) = conn.send_bytes(token.as_bytes()).await {
        tracing::debug!(peer = %conn.peer(), "Failed to send token: {}", e);
        return;
    }

    match handshake::negotiate(&mut conn, state).await {
        HandshakeOutcome::Rejected => {
            tracing::info!(peer = %conn.peer(), "Connection rejected");
        }
        HandshakeOutcome::NewLogin(user) => {
            user.set_token(token);
            if let Err(e) = state.sessions.add(user.clone()) {
                tracing::warn!(peer = %conn.peer(), "Login dropped: {}", e);
                user.logout();
                return;
            }
            tracing::info!(user = %user.name(), peer = %conn.peer(), "User logged in");

            service.serve_session(user.clone(), &mut conn).await;

            state.sessions.end_session(&user);
        }
        HandshakeOutcome::ReconnectTransmission(channel) => {
            tracing::info!(
                user = %channel.owner().name(),
                channel = channel.id(),
                peer = %conn.peer(),
                "Transmission channel opened"
            );
            service.serve_transmission(channel, &mut conn).await;
        }
    }
}
