/// In-process duplex channel pair.
///
/// ```text
///   end A                                              end B
///   send() --> outbound queue --> pump (filter) --> incoming (bounded)
///   incoming <-- pump (filter) <-- outbound queue <-- send()
/// ```
///
/// A frame counts toward the sender's `buffered_amount` until its pump has
/// pushed it into the peer's bounded incoming queue, so a slow reader
/// produces real backpressure on the writer. Filters let tests drop,
/// tamper with or duplicate individual frames, and the link can be cut
/// at any time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::channel::{DataChannel, TransportError, TransportHandle};

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Frames each end's incoming queue holds before the pump waits.
    pub capacity: usize,
    /// Simulated per-frame link delay.
    pub drain_delay: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            drain_delay: Duration::ZERO,
        }
    }
}

/// What a filter does with one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameAction {
    Deliver,
    Drop,
    Replace(Bytes),
    Duplicate,
}

type FrameFilter = Box<dyn FnMut(&Bytes) -> FrameAction + Send>;
type SharedFilter = Arc<Mutex<Option<FrameFilter>>>;

/// Buffer accounting shared between a channel end and its pump.
#[derive(Default)]
struct BufferState {
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    closed: AtomicBool,
    low: Notify,
}

impl BufferState {
    fn release(&self, len: usize) {
        let now = self.buffered.fetch_sub(len, Ordering::SeqCst).saturating_sub(len);
        if now <= self.low_threshold.load(Ordering::SeqCst) {
            self.low.notify_waiters();
        }
    }

    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.low.notify_waiters();
    }
}

pub struct MemoryChannel {
    outbound: mpsc::UnboundedSender<Bytes>,
    state: Arc<BufferState>,
    link: CancellationToken,
}

impl DataChannel for MemoryChannel {
    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let len = frame.len();
        self.state.buffered.fetch_add(len, Ordering::SeqCst);
        self.outbound.send(frame).map_err(|_| {
            self.state.release(len);
            TransportError::Closed
        })
    }

    fn buffered_amount(&self) -> usize {
        self.state.buffered.load(Ordering::SeqCst)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.state.low_threshold.store(threshold, Ordering::SeqCst);
    }

    fn buffered_amount_low(&self) -> &Notify {
        &self.state.low
    }

    fn close(&self) {
        self.link.cancel();
        self.state.shut();
    }

    fn is_closed(&self) -> bool {
        self.link.is_cancelled() || self.state.closed.load(Ordering::SeqCst)
    }
}

/// Test-side control over a pair created by [`pair`].
#[derive(Clone)]
pub struct MemoryLink {
    token: CancellationToken,
    a_to_b: SharedFilter,
    b_to_a: SharedFilter,
}

impl MemoryLink {
    /// Cut the link. Queued frames are discarded and both incoming streams end.
    pub fn disconnect(&self) {
        self.token.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token that cuts this link when cancelled; usable from inside a filter.
    pub fn disconnector(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn set_filter_a_to_b(&self, filter: impl FnMut(&Bytes) -> FrameAction + Send + 'static) {
        set_filter(&self.a_to_b, Some(Box::new(filter)));
    }

    pub fn set_filter_b_to_a(&self, filter: impl FnMut(&Bytes) -> FrameAction + Send + 'static) {
        set_filter(&self.b_to_a, Some(Box::new(filter)));
    }

    pub fn clear_filters(&self) {
        set_filter(&self.a_to_b, None);
        set_filter(&self.b_to_a, None);
    }
}

fn set_filter(slot: &SharedFilter, filter: Option<FrameFilter>) {
    if let Ok(mut slot) = slot.lock() {
        *slot = filter;
    }
}

/// Connected pair with default settings. Must be called inside a tokio runtime.
pub fn pair() -> (TransportHandle, TransportHandle, MemoryLink) {
    pair_with(MemoryConfig::default())
}

pub fn pair_with(config: MemoryConfig) -> (TransportHandle, TransportHandle, MemoryLink) {
    let token = CancellationToken::new();
    let a_to_b: SharedFilter = Arc::new(Mutex::new(None));
    let b_to_a: SharedFilter = Arc::new(Mutex::new(None));

    let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
    let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
    let (a_in_tx, a_in_rx) = mpsc::channel(config.capacity.max(1));
    let (b_in_tx, b_in_rx) = mpsc::channel(config.capacity.max(1));

    let a_state = Arc::new(BufferState::default());
    let b_state = Arc::new(BufferState::default());

    tokio::spawn(pump(
        a_out_rx,
        b_in_tx,
        a_state.clone(),
        a_to_b.clone(),
        config.drain_delay,
        token.clone(),
    ));
    tokio::spawn(pump(
        b_out_rx,
        a_in_tx,
        b_state.clone(),
        b_to_a.clone(),
        config.drain_delay,
        token.clone(),
    ));

    let a = MemoryChannel {
        outbound: a_out_tx,
        state: a_state,
        link: token.clone(),
    };
    let b = MemoryChannel {
        outbound: b_out_tx,
        state: b_state,
        link: token.clone(),
    };

    let link = MemoryLink {
        token,
        a_to_b,
        b_to_a,
    };
    (
        TransportHandle::new(Arc::new(a), a_in_rx),
        TransportHandle::new(Arc::new(b), b_in_rx),
        link,
    )
}

async fn pump(
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    inbound: mpsc::Sender<Bytes>,
    state: Arc<BufferState>,
    filter: SharedFilter,
    delay: Duration,
    token: CancellationToken,
) {
    'frames: loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let action = match filter.lock() {
            Ok(mut slot) => slot.as_mut().map(|f| f(&frame)).unwrap_or(FrameAction::Deliver),
            Err(_) => FrameAction::Deliver,
        };
        let deliveries = match action {
            FrameAction::Deliver => vec![frame.clone()],
            FrameAction::Drop => Vec::new(),
            FrameAction::Replace(other) => vec![other],
            FrameAction::Duplicate => vec![frame.clone(), frame.clone()],
        };

        for delivery in deliveries {
            tokio::select! {
                biased;
                _ = token.cancelled() => break 'frames,
                sent = inbound.send(delivery) => {
                    if sent.is_err() {
                        break 'frames;
                    }
                }
            }
        }
        state.release(frame.len());
    }
    state.shut();
}
