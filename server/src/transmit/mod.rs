//! Byte transport capability shared by the handshake and the session loops.
//!
//! A `Transmittable` owns a fixed receive buffer and the connection's cipher
//! key. It is implemented over any async byte stream (`StreamTransmitter`,
//! used for live TCP sockets) and by an in-memory fake for tests.

pub mod memory;
pub mod stream;

use std::time::Duration;

use async_trait::async_trait;

use crate::auth::token::Token;
use crate::error::ReceiveError;

pub use memory::MemoryTransmitter;
pub use stream::{StreamTransmitter, TcpTransmitter};

#[async_trait]
pub trait Transmittable: Send {
    /// Fill the receive buffer from offset `received` until `target` bytes are
    /// held in total, waking at least every `tick` to check for a stalled peer.
    /// Returns the new received count. Earlier buffer contents are left as is.
    async fn receive_until(
        &mut self,
        target: usize,
        received: usize,
        tick: Duration,
    ) -> Result<usize, ReceiveError>;

    /// The whole receive buffer. Callers slice it by offset.
    fn buffer(&self) -> &[u8];

    /// Key for this connection's symmetric cipher.
    fn cipher_key(&self) -> &Token;

    /// Write raw bytes to the peer.
    async fn send_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Human readable peer label for logs.
    fn peer(&self) -> String;
}
