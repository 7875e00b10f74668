
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;

use crate::assembler::{Frame, FrameAssembler};
use crate::buffer::{DuplicationBuffer, NowGen, DEFAULT_LIMIT_COUNT};
use crate::error::{Error, Result};
use crate::event::{EventChannel, MirrorEvent};
use crate::source::{
    ActiveLayer, MediaKind, PacketListener, PacketSource, RefreshRequester, SourceTrack, Ssrc,
    TrackInfo, TrackStats,
};

/// EncodingMirror is the per-encoding half of a mirror: the duplication
/// buffer registered on the original packet source and the frame assembler
/// reading from it. Both are exclusively owned by the mirror.
pub struct EncodingMirror {
    pub id: String,
    pub ssrc: Ssrc,
    /// The packet source the buffer was registered on at construction time.
    /// stop() must unregister from this handle, not from whatever the
    /// source track reports by then.
    source: Arc<dyn PacketSource + Send + Sync>,
    buffer: Arc<DuplicationBuffer>,
    assembler: Arc<FrameAssembler>,
}

impl fmt::Debug for EncodingMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodingMirror")
            .field("id", &self.id)
            .field("ssrc", &self.ssrc)
            .finish()
    }
}

/// MirrorReader is the consumer-side handle for one mirrored encoding.
/// Each reader pulls from its own duplication buffer at its own pace.
#[derive(Clone)]
pub struct MirrorReader {
    encoding_id: String,
    buffer: Arc<DuplicationBuffer>,
    assembler: Arc<FrameAssembler>,
}

impl MirrorReader {
    pub fn encoding_id(&self) -> &str {
        self.encoding_id.as_str()
    }

    pub fn ssrc(&self) -> Ssrc {
        self.buffer.ssrc()
    }

    /// read_frame blocks until the next reconstructed frame.
    pub async fn read_frame(&self) -> Result<Frame> {
        self.assembler.read_frame().await
    }

    /// read_rtp pops the next raw mirrored packet, bypassing frame assembly.
    /// Mixing read_rtp and read_frame on one reader starves the assembler of
    /// the packets taken here.
    pub async fn read_rtp(&self) -> Result<rtp::packet::Packet> {
        let (pkt, _) = self.buffer.read().await?;
        Ok(pkt)
    }
}

impl fmt::Debug for MirrorReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorReader")
            .field("encoding_id", &self.encoding_id)
            .finish()
    }
}

struct MirroredTrackInternal {
    /// Encoding id -> mirror pair. Empty once stopped.
    encodings: HashMap<String, Arc<EncodingMirror>>,
    /// Back-reference to the original track. Cleared at stop.
    source: Option<Arc<dyn SourceTrack + Send + Sync>>,
}

/// MirroredTrack re-publishes a [`SourceTrack`] so N downstream contexts can
/// consume it concurrently without contending for the original track's
/// state. One {DuplicationBuffer, FrameAssembler} pair exists per encoding
/// present on the source at construction time; encodings added later are
/// not reflected, and no packets are replayed retroactively.
///
/// Read-only queries delegate to the source unchanged. attach()/detach()
/// keep a consumer reference count and publish `attached` on the 0 -> 1
/// transition and `detached` on 1 -> 0; stop() is terminal and publishes
/// `stopped` at most once. Only the attach count takes a mirror-wide lock;
/// the per-packet path never does.
pub struct MirroredTrack {
    /// True once stop() has run its teardown. Queries and attach/detach on a
    /// stopped mirror fail fast with ErrMirrorStopped; refresh() and stop()
    /// become no-ops.
    stopped: AtomicBool,

    /// Attach count plus the emission decision, mutated atomically relative
    /// to other attach/detach calls. Never held across an await.
    attach_count: SyncMutex<u32>,

    /// Non-owning handle to the receiver used for intra-refresh requests.
    receiver: Weak<dyn RefreshRequester + Send + Sync>,

    events: EventChannel,

    /// Self-reference handed to event subscribers as the payload.
    weak_self: Weak<MirroredTrack>,

    internal: Mutex<MirroredTrackInternal>,
}

impl MirroredTrack {
    /// Builds a mirror of `source`, wiring one duplication buffer and frame
    /// assembler per encoding and registering each buffer as a listener on
    /// its encoding's packet source. Mirroring is live from the moment of
    /// registration.
    pub async fn new(
        source: Arc<dyn SourceTrack + Send + Sync>,
        receiver: Weak<dyn RefreshRequester + Send + Sync>,
        now_gen: NowGen,
    ) -> Arc<Self> {
        let mut encodings = HashMap::new();
        for encoding in source.encodings() {
            let buffer = Arc::new(DuplicationBuffer::new(
                encoding.ssrc,
                Arc::clone(&now_gen),
                DEFAULT_LIMIT_COUNT,
            ));
            let listener = Arc::clone(&buffer) as Arc<dyn PacketListener + Send + Sync>;
            encoding.source.add_listener(listener).await;
            let assembler = Arc::new(FrameAssembler::new(Arc::clone(&buffer), source.kind()));

            log::debug!(
                "mirroring encoding id={} ssrc={} of track {}",
                encoding.id,
                encoding.ssrc,
                source.id()
            );

            encodings.insert(
                encoding.id.clone(),
                Arc::new(EncodingMirror {
                    id: encoding.id.clone(),
                    ssrc: encoding.ssrc,
                    source: Arc::clone(&encoding.source),
                    buffer,
                    assembler,
                }),
            );
        }

        Arc::new_cyclic(|weak_self| MirroredTrack {
            stopped: AtomicBool::new(false),
            attach_count: SyncMutex::new(0),
            receiver,
            events: EventChannel::new(),
            weak_self: weak_self.clone(),
            internal: Mutex::new(MirroredTrackInternal {
                encodings,
                source: Some(source),
            }),
        })
    }

    async fn emit(&self, event: MirrorEvent) {
        // The upgrade only fails while the last strong reference is being
        // dropped, at which point nobody can observe the event anyway.
        if let Some(track) = self.weak_self.upgrade() {
            self.events.emit(event, track).await;
        }
    }

    fn source(internal: &MirroredTrackInternal) -> Result<Arc<dyn SourceTrack + Send + Sync>> {
        internal
            .source
            .as_ref()
            .map(Arc::clone)
            .ok_or(Error::ErrMirrorStopped)
    }

    /// get_id returns the original track's identifier.
    pub async fn get_id(&self) -> Result<String> {
        let internal = self.internal.lock().await;
        Ok(Self::source(&internal)?.id())
    }

    /// get_media returns whether the original track is audio or video.
    pub async fn get_media(&self) -> Result<MediaKind> {
        let internal = self.internal.lock().await;
        Ok(Self::source(&internal)?.kind())
    }

    pub async fn get_track_info(&self) -> Result<TrackInfo> {
        let internal = self.internal.lock().await;
        Ok(Self::source(&internal)?.track_info())
    }

    pub async fn get_ssrcs(&self) -> Result<Vec<Ssrc>> {
        let internal = self.internal.lock().await;
        Ok(Self::source(&internal)?.ssrcs())
    }

    pub async fn get_stats(&self) -> Result<TrackStats> {
        let source = {
            let internal = self.internal.lock().await;
            Self::source(&internal)?
        };
        Ok(source.stats().await)
    }

    /// get_active_layers returns the source's layer ranking, highest bitrate
    /// first.
    pub async fn get_active_layers(&self) -> Result<Vec<ActiveLayer>> {
        let source = {
            let internal = self.internal.lock().await;
            Self::source(&internal)?
        };
        Ok(source.active_layers().await)
    }

    pub fn attach_count(&self) -> u32 {
        *self.attach_count.lock()
    }

    /// Encoding ids currently mirrored. Empty after stop().
    pub async fn encoding_ids(&self) -> Vec<String> {
        let internal = self.internal.lock().await;
        internal.encodings.keys().cloned().collect()
    }

    /// reader returns the consumer handle for one mirrored encoding.
    pub async fn reader(&self, encoding_id: &str) -> Result<MirrorReader> {
        let internal = self.internal.lock().await;
        let encoding = internal
            .encodings
            .get(encoding_id)
            .ok_or_else(|| Error::ErrEncodingNotFound(encoding_id.to_owned()))?;
        Ok(MirrorReader {
            encoding_id: encoding.id.clone(),
            buffer: Arc::clone(&encoding.buffer),
            assembler: Arc::clone(&encoding.assembler),
        })
    }

    /// attach registers one more downstream consumer. The source is notified
    /// first so upstream accounting reflects the true consumer count, then
    /// the count is incremented; the 0 -> 1 transition emits `attached` with
    /// this mirror as payload.
    pub async fn attach(&self) -> Result<()> {
        // The internal lock is held across the upstream forward and the
        // count mutation, serializing attach/detach/stop against each other.
        // The per-packet path never touches this lock.
        let is_first = {
            let internal = self.internal.lock().await;
            let source = Self::source(&internal)?;
            source.attached().await;

            let mut count = self.attach_count.lock();
            *count += 1;
            *count == 1
        };

        if is_first {
            self.emit(MirrorEvent::Attached).await;
        }
        Ok(())
    }

    /// detach drops one downstream consumer; the 1 -> 0 transition emits
    /// `detached`. A detach without a matching attach is a caller defect:
    /// it returns ErrAttachCountUnderflow, the count stays at zero and the
    /// source is not notified, so upstream accounting cannot go negative.
    pub async fn detach(&self) -> Result<()> {
        let is_last = {
            let internal = self.internal.lock().await;
            let source = Self::source(&internal)?;

            {
                let count = self.attach_count.lock();
                if *count == 0 {
                    log::warn!("detach without matching attach on mirrored track");
                    return Err(Error::ErrAttachCountUnderflow);
                }
            }
            // Forward before decrementing so upstream accounting reflects
            // the consumer count the caller still observes.
            source.detached().await;

            let mut count = self.attach_count.lock();
            *count = count.saturating_sub(1);
            *count == 0
        };

        if is_last {
            self.emit(MirrorEvent::Detached).await;
        }
        Ok(())
    }

    /// refresh issues one intra-refresh (key-frame) request per mirrored
    /// encoding, addressed to that encoding's SSRC on the original receiver.
    /// Best-effort: a stopped mirror or a dead receiver is a silent no-op.
    pub async fn refresh(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let receiver = match self.receiver.upgrade() {
            Some(receiver) => receiver,
            None => {
                log::trace!("refresh skipped, receiver gone");
                return;
            }
        };

        let ssrcs: Vec<Ssrc> = {
            let internal = self.internal.lock().await;
            internal.encodings.values().map(|e| e.ssrc).collect()
        };
        for ssrc in ssrcs {
            receiver.send_intra_refresh_request(ssrc).await;
        }
    }

    /// stop tears the mirror down: every duplication buffer is removed as a
    /// listener from its original packet source, then buffer and assembler
    /// are stopped and the encoding map, subscriber list and source
    /// reference are released. Emits `stopped` once. Idempotent; concurrent
    /// calls cannot double-release.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let (encodings, source) = {
            let mut internal = self.internal.lock().await;
            (
                std::mem::take(&mut internal.encodings),
                internal.source.take(),
            )
        };

        if let Some(source) = &source {
            log::debug!("stopping mirror of track {}", source.id());
        }

        for mirror in encodings.values() {
            mirror
                .source
                .remove_listener(mirror.buffer.listener_id())
                .await;
            mirror.buffer.close().await;
            mirror.assembler.stop();
        }

        self.emit(MirrorEvent::Stopped).await;
        self.events.clear().await;
    }

    /// on subscribes to a lifecycle event; returns a subscription id for
    /// off().
    pub async fn on<F>(&self, event: MirrorEvent, handler: F) -> usize
    where
        F: FnMut(Arc<MirroredTrack>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>
            + Send
            + Sync
            + 'static,
    {
        self.events.on(event, handler).await
    }

    /// once subscribes for a single delivery.
    pub async fn once<F>(&self, event: MirrorEvent, handler: F) -> usize
    where
        F: FnMut(Arc<MirroredTrack>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>
            + Send
            + Sync
            + 'static,
    {
        self.events.once(event, handler).await
    }

    pub async fn off(&self, subscription_id: usize) -> bool {
        self.events.off(subscription_id).await
    }
}

impl fmt::Debug for MirroredTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirroredTrack")
            .field("stopped", &self.stopped)
            .finish()
    }
}
