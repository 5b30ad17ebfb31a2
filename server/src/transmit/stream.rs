use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{interval, MissedTickBehavior};

use crate::auth::token::Token;
use crate::error::ReceiveError;
use crate::transmit::Transmittable;

/// `interval` rejects a zero period.
const MIN_TICK: Duration = Duration::from_millis(1);

/// Live socket transmitter.
pub type TcpTransmitter = StreamTransmitter<TcpStream>;

/// `Transmittable` over an async byte stream with a fixed-capacity buffer.
pub struct StreamTransmitter<S> {
    stream: S,
    buf: Vec<u8>,
    key: Token,
    peer: String,
    /// Consecutive empty ticks tolerated by `receive_until`, `None` = wait forever
    idle_limit: Option<u32>,
}

impl<S> StreamTransmitter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, capacity: usize, key: Token, peer: impl Into<String>) -> Self {
        Self {
            stream,
            buf: vec![0u8; capacity],
            key,
            peer: peer.into(),
            idle_limit: None,
        }
    }

    pub fn with_idle_limit(mut self, ticks: u32) -> Self {
        self.idle_limit = (ticks > 0).then_some(ticks);
        self
    }
}

#[async_trait]
impl<S> Transmittable for StreamTransmitter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn receive_until(
        &mut self,
        target: usize,
        received: usize,
        tick: Duration,
    ) -> Result<usize, ReceiveError> {
        if target > self.buf.len() {
            return Err(ReceiveError::FrameTooLarge {
                target,
                capacity: self.buf.len(),
            });
        }

        let mut received = received;
        let mut ticker = interval(tick.max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        let mut idle_ticks = 0u32;

        while received < target {
            tokio::select! {
                read = self.stream.read(&mut self.buf[received..target]) => {
                    match read? {
                        0 => return Err(ReceiveError::Closed { received, target }),
                        n => {
                            received += n;
                            idle_ticks = 0;
                        }
                    }
                }
                _ = ticker.tick() => {
                    idle_ticks += 1;
                    if let Some(limit) = self.idle_limit {
                        if idle_ticks >= limit {
                            return Err(ReceiveError::TimedOut { ticks: idle_ticks });
                        }
                    }
                }
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
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
