/// Transport interface and write-side backpressure.
///
/// A session talks to its peer through a `DataChannel` (WebRTC-style:
/// `send` queues, `buffered_amount` reports what is still queued, and a
/// low-threshold notification fires as the queue drains). Incoming frames
/// arrive on an `mpsc::Receiver`; the stream ending means the peer is gone.
///
/// ```text
///   buffered
///      ^
///  high|----+.........................  write() suspends here
///      |   / \
///      |  /   \
///   low|-/-----+--------------------   ...and resumes here
///      |/       \___
///      +-------------------------> t
/// ```

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

pub trait DataChannel: Send + Sync {
    /// Queue a frame. Never blocks.
    fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Bytes queued but not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Notified (`notify_waiters`) whenever the buffered amount falls to the
    /// low threshold or below, and when the channel closes.
    fn buffered_amount_low(&self) -> &Notify;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// One end of a peer connection.
pub struct TransportHandle {
    pub channel: Arc<dyn DataChannel>,
    pub incoming: mpsc::Receiver<Bytes>,
}

impl TransportHandle {
    pub fn new(channel: Arc<dyn DataChannel>, incoming: mpsc::Receiver<Bytes>) -> Self {
        Self { channel, incoming }
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("buffered", &self.channel.buffered_amount())
            .field("closed", &self.channel.is_closed())
            .finish()
    }
}

/// Wraps a channel so that `send` is never called while more than
/// `high_water` bytes are buffered.
pub struct ChannelWriter {
    channel: Arc<dyn DataChannel>,
    high_water: usize,
    low_water: usize,
}

impl ChannelWriter {
    pub fn new(channel: Arc<dyn DataChannel>, high_water: usize, low_water: usize) -> Self {
        channel.set_buffered_amount_low_threshold(low_water);
        Self {
            channel,
            high_water,
            low_water,
        }
    }

    pub async fn write(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.channel.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.channel.buffered_amount() > self.high_water {
            self.drain().await?;
        }
        self.channel.send(frame)
    }

    /// Queue a frame without waiting for buffer space. Used for small
    /// control frames that must not sit behind a full data queue.
    pub fn write_now(&self, frame: Bytes) -> Result<(), TransportError> {
        self.channel.send(frame)
    }

    async fn drain(&self) -> Result<(), TransportError> {
        loop {
            let notified = self.channel.buffered_amount_low().notified();
            tokio::pin!(notified);
            // Register before checking so a drain between check and await is not lost.
            notified.as_mut().enable();

            if self.channel.is_closed() {
                return Err(TransportError::Closed);
            }
            if self.channel.buffered_amount() <= self.low_water {
                return Ok(());
            }
            notified.await;
        }
    }

    pub fn channel(&self) -> &Arc<dyn DataChannel> {
        &self.channel
    }
}
