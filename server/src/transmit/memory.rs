//! In-memory `Transmittable` for driving the handshake without sockets.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::auth::token::Token;
use crate::error::ReceiveError;
use crate::transmit::Transmittable;

/// Scripted peer: inbound chunks are handed out in order, then the stream
/// reports closed. Everything sent is captured in a shared buffer.
pub struct MemoryTransmitter {
    inbound: VecDeque<Vec<u8>>,
    buf: Vec<u8>,
    key: Token,
    sent: Arc<Mutex<Vec<u8>>>,
    refuse_sends: bool,
}

impl MemoryTransmitter {
    pub fn new(key: Token, capacity: usize) -> Self {
        Self {
            inbound: VecDeque::new(),
            buf: vec![0u8; capacity],
            key,
            sent: Arc::new(Mutex::new(Vec::new())),
            refuse_sends: false,
        }
    }

    /// Queue bytes the peer will "send".
    pub fn push_inbound(&mut self, bytes: impl Into<Vec<u8>>) {
        self.inbound.push_back(bytes.into());
    }

    /// Make every send fail, as if the peer vanished.
    pub fn refuse_sends(mut self) -> Self {
        self.refuse_sends = true;
        self
    }

    /// Handle to the bytes written so far, usable after the transmitter moves.
    pub fn sent(&self) -> Arc<Mutex<Vec<u8>>> {
        self.sent.clone()
    }
}

#[async_trait]
impl Transmittable for MemoryTransmitter {
    async fn receive_until(
        &mut self,
        target: usize,
        received: usize,
        _tick: Duration,
    ) -> Result<usize, ReceiveError> {
        if target > self.buf.len() {
            return Err(ReceiveError::FrameTooLarge {
                target,
                capacity: self.buf.len(),
            });
        }

        let mut received = received;
        while received < target {
            let Some(mut chunk) = self.inbound.pop_front() else {
                return Err(ReceiveError::Closed { received, target });
            };
            let take = chunk.len().min(target - received);
            self.buf[received..received + take].copy_from_slice(&chunk[..take]);
            received += take;
            if take < chunk.len() {
                self.inbound.push_front(chunk.split_off(take));
            }
        }
        Ok(received)
    }

    fn buffer(&self) -> &[u8] {
        &self.buf
    }

    fn cipher_key(&self) -> &Token {
        &self.key
    }

    async fn send_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if self.refuse_sends {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer refused bytes",
            ));
        }
        self.sent
            .lock()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?
            .extend_from_slice(bytes);
        Ok(())
    }

    fn peer(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chunks_split_at_target() {
        let mut t = MemoryTransmitter::new(Token::from_bytes(vec![0u8; 16]), 16);
        t.push_inbound(b"abcdef".to_vec());
        t.push_inbound(b"gh".to_vec());

        let received = t.receive_until(4, 0, Duration::ZERO).await.unwrap();
        assert_eq!(received, 4);
        let received = t.receive_until(8, received, Duration::ZERO).await.unwrap();
        assert_eq!(&t.buffer()[..received], b"abcdefgh");
        assert!(matches!(
            t.receive_until(9, received, Duration::ZERO).await,
            Err(ReceiveError::Closed { received: 8, target: 9 })
        ));
    }
}
