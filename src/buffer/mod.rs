#[cfg(test)]
mod duplication_buffer_test;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::source::{PacketListener, Ssrc};

lazy_static! {
    static ref DUPLICATION_BUFFER_UNIQUE_ID: AtomicUsize = AtomicUsize::new(0);
}

/// Time service handle used to timestamp packet arrival.
pub type NowGen = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// Default cap on buffered packets per encoding. At typical video packet
/// rates this absorbs several seconds of consumer stall before packets are
/// dropped.
pub const DEFAULT_LIMIT_COUNT: usize = 512;

struct DuplicationBufferInternal {
    packets: VecDeque<(rtp::packet::Packet, SystemTime)>,

    // One sender per blocked reader; dropping it wakes that reader. The
    // whole list is drained on every write and on close, so several
    // concurrent readers can block on the same buffer.
    wakers: Vec<mpsc::Sender<()>>,

    closed: bool,

    // The limit on buffered packets; the oldest packet is dropped beyond it.
    limit_count: usize,
}

/// DuplicationBuffer copies the packets of one encoding into an independent
/// queue so a mirror can be read without blocking or racing the producer.
/// It is registered as a [`PacketListener`] on the encoding's packet source;
/// every received packet is cloned, tagged with its arrival time, and
/// appended. The producer only ever contends on this buffer's own lock,
/// never on another mirror's.
pub struct DuplicationBuffer {
    id: usize,
    ssrc: Ssrc,
    now_gen: NowGen,
    dropped: AtomicU64,
    buffer: Mutex<DuplicationBufferInternal>,
}

impl DuplicationBuffer {
    pub fn new(ssrc: Ssrc, now_gen: NowGen, limit_count: usize) -> Self {
        DuplicationBuffer {
            id: DUPLICATION_BUFFER_UNIQUE_ID.fetch_add(1, Ordering::SeqCst),
            ssrc,
            now_gen,
            dropped: AtomicU64::new(0),
            buffer: Mutex::new(DuplicationBufferInternal {
                packets: VecDeque::new(),
                wakers: vec![],
                closed: false,
                limit_count,
            }),
        }
    }

    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    /// Number of packets dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// write appends a copy of the packet, stamped with the arrival time.
    /// When the limit is hit the oldest packet is dropped to make room: a
    /// stalled consumer loses its own tail, it never backpressures the
    /// producer. Returns ErrBufferClosed after close().
    pub async fn write(&self, pkt: &rtp::packet::Packet) -> Result<()> {
        let now = (self.now_gen)();
        let wakers = {
            let mut b = self.buffer.lock().await;

            if b.closed {
                return Err(Error::ErrBufferClosed);
            }

            if b.limit_count != 0 && b.packets.len() + 1 > b.limit_count {
                b.packets.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                log::trace!(
                    "duplication buffer ssrc={} full, dropped oldest ({} total)",
                    self.ssrc,
                    dropped
                );
            }

            b.packets.push_back((pkt.clone(), now));

            std::mem::take(&mut b.wakers)
        };

        // Dropping the senders after the push wakes every blocked reader;
        // they find the packet (or re-queue a waker) on their next pass.
        drop(wakers);

        Ok(())
    }

    /// read pops the oldest buffered packet with its arrival time.
    /// Blocks until a packet is available or the buffer is closed; a closed
    /// buffer drains its remaining packets before returning ErrBufferClosed.
    pub async fn read(&self) -> Result<(rtp::packet::Packet, SystemTime)> {
        loop {
            let mut notify_rx;
            {
                // use {} to let LockGuard RAII
                let mut b = self.buffer.lock().await;

                if let Some(entry) = b.packets.pop_front() {
                    return Ok(entry);
                }

                // Checked after packets so the buffer is fully drained.
                if b.closed {
                    return Err(Error::ErrBufferClosed);
                }

                // Queue our own waker while still holding the lock, so a
                // write or close cannot slip in unseen before we block.
                let (tx, rx) = mpsc::channel(1);
                b.wakers.push(tx);
                notify_rx = rx;
            }

            // Wake on the writer (or close) dropping the sender.
            notify_rx.recv().await;
        }
    }

    /// close unblocks every reader and prevents future writes.
    /// Already-buffered packets can still be read, ErrBufferClosed once
    /// depleted. Idempotent.
    pub async fn close(&self) {
        let wakers = {
            let mut b = self.buffer.lock().await;

            if b.closed {
                return;
            }

            b.closed = true;
            std::mem::take(&mut b.wakers)
        };

        drop(wakers);
    }

    pub async fn is_closed(&self) -> bool {
        let b = self.buffer.lock().await;

        b.closed
    }

    /// count returns the number of packets in the buffer.
    pub async fn count(&self) -> usize {
        let b = self.buffer.lock().await;

        b.packets.len()
    }
}

impl fmt::Debug for DuplicationBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplicationBuffer")
            .field("id", &self.id)
            .field("ssrc", &self.ssrc)
            .finish()
    }
}

#[async_trait]
impl PacketListener for DuplicationBuffer {
    fn listener_id(&self) -> usize {
        self.id
    }

    async fn on_packet(&self, pkt: &rtp::packet::Packet) {
        // Delivery to a closed buffer races benignly with stop(); swallow it.
        if let Err(err) = self.write(pkt).await {
            log::trace!(
                "duplication buffer ssrc={} dropped delivery: {}",
                self.ssrc,
                err
            );
        }
    }
}
