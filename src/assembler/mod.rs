#[cfg(test)]
mod frame_assembler_test;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::buffer::DuplicationBuffer;
use crate::error::{Error, Result};
use crate::source::MediaKind;

/// Frame is one reconstructed codec frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    /// RTP timestamp shared by the packets of this frame.
    pub timestamp: u32,
    pub packet_count: usize,
    /// Arrival time of the packet that completed the frame.
    pub received_at: SystemTime,
}

#[derive(Default)]
struct PendingFrame {
    payloads: Vec<Bytes>,
    timestamp: u32,
    last_sequence_number: Option<u16>,
}

impl PendingFrame {
    fn reset(&mut self) {
        self.payloads.clear();
        self.timestamp = 0;
    }

    fn assemble(&mut self, received_at: SystemTime) -> Frame {
        let packet_count = self.payloads.len();
        let mut data = BytesMut::with_capacity(self.payloads.iter().map(Bytes::len).sum());
        for payload in self.payloads.drain(..) {
            data.extend_from_slice(&payload);
        }
        Frame {
            data: data.freeze(),
            timestamp: self.timestamp,
            packet_count,
            received_at,
        }
    }
}

/// FrameAssembler reconstructs codec frames from one mirror's
/// [`DuplicationBuffer`]. Each assembler pulls at its own pace and never
/// synchronizes with the producer or with sibling mirrors.
///
/// Video frames span every packet sharing an RTP timestamp up to the packet
/// carrying the marker bit; a sequence-number gap discards the partial frame
/// and resynchronizes on the next timestamp. Audio packets are complete
/// frames on their own. Reordering is the transport's concern upstream of
/// the duplication buffer, so no reorder window is kept here.
pub struct FrameAssembler {
    buffer: Arc<DuplicationBuffer>,
    kind: MediaKind,
    stopped: AtomicBool,
    discarded_frames: AtomicU64,
    // No await is ever held across this lock; read_frame is the only writer.
    pending: Mutex<PendingFrame>,
}

impl FrameAssembler {
    pub fn new(buffer: Arc<DuplicationBuffer>, kind: MediaKind) -> Self {
        FrameAssembler {
            buffer,
            kind,
            stopped: AtomicBool::new(false),
            discarded_frames: AtomicU64::new(0),
            pending: Mutex::new(PendingFrame::default()),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Number of partial frames discarded because of packet loss.
    pub fn discarded_frames(&self) -> u64 {
        self.discarded_frames.load(Ordering::SeqCst)
    }

    /// read_frame blocks until the next complete frame is available.
    /// Returns ErrAssemblerStopped after stop(), ErrBufferClosed once the
    /// underlying buffer is closed and drained.
    pub async fn read_frame(&self) -> Result<Frame> {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(Error::ErrAssemblerStopped);
            }

            let (pkt, received_at) = self.buffer.read().await?;

            // Padding-only packets carry no media.
            if pkt.payload.is_empty() {
                continue;
            }

            if self.kind == MediaKind::Audio {
                return Ok(Frame {
                    data: pkt.payload,
                    timestamp: pkt.header.timestamp,
                    packet_count: 1,
                    received_at,
                });
            }

            let mut pending = self.pending.lock();

            if let Some(last) = pending.last_sequence_number {
                if pkt.header.sequence_number != last.wrapping_add(1)
                    && !pending.payloads.is_empty()
                {
                    let discarded = self.discarded_frames.fetch_add(1, Ordering::SeqCst) + 1;
                    log::debug!(
                        "frame assembler ssrc={} sequence gap {} -> {}, discarded partial frame ({} total)",
                        self.buffer.ssrc(),
                        last,
                        pkt.header.sequence_number,
                        discarded
                    );
                    pending.reset();
                }
            }
            pending.last_sequence_number = Some(pkt.header.sequence_number);

            if pending.payloads.is_empty() {
                pending.timestamp = pkt.header.timestamp;
            } else if pending.timestamp != pkt.header.timestamp {
                // Timestamp moved on without a marker: the frame end was
                // lost. Start over from this packet.
                self.discarded_frames.fetch_add(1, Ordering::SeqCst);
                pending.reset();
                pending.timestamp = pkt.header.timestamp;
            }

            pending.payloads.push(pkt.payload.clone());

            if pkt.header.marker {
                let frame = pending.assemble(received_at);
                pending.reset();
                return Ok(frame);
            }
        }
    }

    /// stop ends the assembler: pending partial state is cleared and
    /// subsequent read_frame calls fail fast. Idempotent. The duplication
    /// buffer is closed separately by its owner.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut pending = self.pending.lock();
        pending.reset();
        pending.last_sequence_number = None;
    }
}

impl fmt::Debug for FrameAssembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAssembler")
            .field("kind", &self.kind)
            .field("buffer", &self.buffer)
            .finish()
    }
}
