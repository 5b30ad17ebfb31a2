//! Connection authentication.
//!
//! Wire sequence, after the server has written the raw token:
//!
//! ```text
//! client -> server  srcLength:u64be | encLength:u64be | nameLength:u64be
//! client -> server  encLength bytes, AES-CFB(token, username ++ secret)
//! server -> client  token (confirmation)
//! ```
//!
//! A username with a live session is a reconnect: the secret must be that
//! session's token and the connection becomes a transmission channel.
//! Any other username is a login checked against the credential table.
//!
//! The token travels in the clear before it becomes the cipher key, so a
//! passive observer of the first message can read everything after it.

use std::sync::Arc;

use crate::auth::cipher;
use crate::db::users;
use crate::error::{HandshakeError, RegistryError};
use crate::session::user::{ChannelGuard, User};
use crate::state::ServerState;
use crate::transmit::Transmittable;

/// Size of the credential frame header.
pub const HEADER_LEN: usize = 24;

/// Working path of a freshly logged-in user.
pub const ROOT_PATH: &str = "/";

/// Result of a handshake as seen by the connection driver.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Close the connection without a response
    Rejected,
    /// New session; not yet registered
    NewLogin(Arc<User>),
    /// Extra channel bound to a live session
    ReconnectTransmission(ChannelGuard),
}

/// Decoded credential header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialHeader {
    pub src_len: usize,
    pub enc_len: usize,
    pub name_len: usize,
}

impl CredentialHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, HandshakeError> {
        if bytes.len() < HEADER_LEN {
            return Err(HandshakeError::MalformedHeader(format!(
                "header is {} bytes",
                bytes.len()
            )));
        }
        let field = |i: usize| -> Result<usize, HandshakeError> {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            usize::try_from(u64::from_be_bytes(raw))
                .map_err(|_| HandshakeError::MalformedHeader("length overflows usize".to_string()))
        };
        let header = Self {
            src_len: field(0)?,
            enc_len: field(1)?,
            name_len: field(2)?,
        };

        if header.name_len > header.src_len {
            return Err(HandshakeError::MalformedHeader(format!(
                "name length {} exceeds plaintext length {}",
                header.name_len, header.src_len
            )));
        }
        if header.src_len > header.enc_len {
            return Err(HandshakeError::MalformedHeader(format!(
                "plaintext length {} exceeds ciphertext length {}",
                header.src_len, header.enc_len
            )));
        }
        Ok(header)
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..8].copy_from_slice(&(self.src_len as u64).to_be_bytes());
        out[8..16].copy_from_slice(&(self.enc_len as u64).to_be_bytes());
        out[16..].copy_from_slice(&(self.name_len as u64).to_be_bytes());
        out
    }
}

/// Build the client's credential frame: header followed by the encrypted
/// `username ++ secret`.
pub fn encode_credential_frame(
    username: &str,
    secret: &[u8],
    key: &[u8],
) -> Result<Vec<u8>, crate::error::CipherError> {
    let mut plaintext = Vec::with_capacity(username.len() + secret.len());
    plaintext.extend_from_slice(username.as_bytes());
    plaintext.extend_from_slice(secret);
    let ciphertext = cipher::encode(&plaintext, key)?;

    let header = CredentialHeader {
        src_len: plaintext.len(),
        enc_len: ciphertext.len(),
        name_len: username.len(),
    };
    let mut frame = header.encode().to_vec();
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Read and check the credential frame. The caller has already sent the
/// token; nothing is written here.
pub async fn authenticate<T>(conn: &mut T, state: &ServerState) -> Result<HandshakeOutcome, HandshakeError>
where
    T: Transmittable + ?Sized,
{
    let tick = state.tick;
    let received = conn.receive_until(HEADER_LEN, 0, tick).await?;
    let header = CredentialHeader::parse(&conn.buffer()[..HEADER_LEN])?;

    let frame_end = HEADER_LEN
        .checked_add(header.enc_len)
        .ok_or_else(|| HandshakeError::MalformedHeader("frame length overflow".to_string()))?;
    conn.receive_until(frame_end, received, tick).await?;

    let plaintext = cipher::decode(
        &conn.buffer()[HEADER_LEN..frame_end],
        header.src_len,
        conn.cipher_key().as_bytes(),
    )?;
    let (name_bytes, secret) = plaintext.split_at(header.name_len);
    let username = std::str::from_utf8(name_bytes)
        .map_err(|_| HandshakeError::MalformedHeader("username is not UTF-8".to_string()))?
        .to_string();

    if let Some(owner) = state.sessions.find_by_name(&username) {
        let channel = owner
            .attach_channel(secret, conn.peer(), state.max_transmission_channels)
            .map_err(|e| match e {
                RegistryError::TokenMismatch => HandshakeError::AuthRejected,
                other => HandshakeError::Registry(other),
            })?;
        return Ok(HandshakeOutcome::ReconnectTransmission(channel));
    }

    let db = state.db.clone();
    let lookup_name = username.clone();
    let record = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| format!("DB lock error: {}", e))?;
        users::lookup_credential(&conn, &lookup_name).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| HandshakeError::Persistence(e.to_string()))?
    .map_err(HandshakeError::Persistence)?;

    match record {
        Some(record) if record.password.as_bytes() == secret => {
            Ok(HandshakeOutcome::NewLogin(User::new(username, record.id, ROOT_PATH)))
        }
        _ => Err(HandshakeError::AuthRejected),
    }
}

/// Run `authenticate`, collapse every failure into `Rejected`, and echo the
/// token back on success. A client that cannot take the full echo is
/// rejected as well.
pub async fn negotiate<T>(conn: &mut T, state: &ServerState) -> HandshakeOutcome
where
    T: Transmittable + ?Sized,
{
    let outcome = match authenticate(conn, state).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::debug!(peer = %conn.peer(), "Handshake rejected: {}", e);
            return HandshakeOutcome::Rejected;
        }
    };

    let token = conn.cipher_key().clone();
    if let Err(e) = conn.send_bytes(token.as_bytes()).await {
        tracing::debug!(peer = %conn.peer(), "Handshake confirmation failed: {}", e);
        return HandshakeOutcome::Rejected;
    }
    outcome
}
