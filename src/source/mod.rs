
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Synchronization source identifier of one RTP stream.
pub type Ssrc = u32;

/// MediaKind says whether a track carries audio or video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Unspecified = 0,

    /// MediaKind::Audio indicates this is an audio track
    Audio = 1,

    /// MediaKind::Video indicates this is a video track
    Video = 2,
}

impl Default for MediaKind {
    fn default() -> Self {
        MediaKind::Unspecified
    }
}

impl From<&str> for MediaKind {
    fn from(raw: &str) -> Self {
        match raw {
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            _ => MediaKind::Unspecified,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Unspecified => crate::UNSPECIFIED_STR,
        };
        write!(f, "{s}")
    }
}

/// Per-encoding receive statistics as reported by the original track.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct EncodingStats {
    pub encoding_id: String,
    pub ssrc: Ssrc,
    pub bitrate_bps: u64,
    pub packets: u64,
    pub bytes: u64,
}

/// Aggregated statistics of the original track, delegated verbatim.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct TrackStats {
    pub encodings: Vec<EncodingStats>,
}

/// One entry of the active-layer ranking, highest bitrate first.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ActiveLayer {
    pub encoding_id: String,
    pub ssrc: Ssrc,
    pub bitrate_bps: u64,
}

/// Static description of a track and its encodings.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub kind: MediaKind,
    /// (encoding id, ssrc) pairs.
    pub encodings: Vec<(String, Ssrc)>,
}

/// PacketListener receives every RTP packet a [`PacketSource`] emits, on the
/// producer's task.
#[async_trait]
pub trait PacketListener {
    /// Process-unique identity, used for listener removal.
    fn listener_id(&self) -> usize;

    async fn on_packet(&self, pkt: &rtp::packet::Packet);
}

/// PacketSource is the producer side of one encoding's live RTP stream. The
/// host's fan-out delivers every emitted packet to every registered listener.
#[async_trait]
pub trait PacketSource {
    fn ssrc(&self) -> Ssrc;

    async fn add_listener(&self, listener: Arc<dyn PacketListener + Send + Sync>);

    /// Removing an id that is not registered is a no-op.
    async fn remove_listener(&self, listener_id: usize);
}

/// TrackEncoding describes one simulcast layer of a source track.
pub struct TrackEncoding {
    pub id: String,
    pub ssrc: Ssrc,
    pub source: Arc<dyn PacketSource + Send + Sync>,
}

impl fmt::Debug for TrackEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackEncoding")
            .field("id", &self.id)
            .field("ssrc", &self.ssrc)
            .finish()
    }
}

/// SourceTrack is the original inbound track a mirror is built from. It is
/// owned externally and outlives any mirror until the mirror is stopped.
#[async_trait]
pub trait SourceTrack {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn track_info(&self) -> TrackInfo;

    fn ssrcs(&self) -> Vec<Ssrc>;

    /// Current encodings. A mirror snapshots this at construction time.
    fn encodings(&self) -> Vec<Arc<TrackEncoding>>;

    async fn stats(&self) -> TrackStats;

    /// Active-layer ranking, highest bitrate first.
    async fn active_layers(&self) -> Vec<ActiveLayer>;

    /// Notification that a downstream consumer attached to a mirror of this
    /// track. Forwarded before the mirror's own accounting so upstream sees
    /// the true consumer count.
    async fn attached(&self);

    async fn detached(&self);
}

/// RefreshRequester issues intra-refresh (key-frame, PLI-equivalent)
/// requests toward the original sender. Fire-and-forget.
#[async_trait]
pub trait RefreshRequester {
    async fn send_intra_refresh_request(&self, ssrc: Ssrc);
}

/// RtpPacketSource is an in-process [`PacketSource`]: a thread-safe listener
/// fan-out that clones every emitted packet to every registered listener.
pub struct RtpPacketSource {
    ssrc: Ssrc,
    listeners: Mutex<Vec<Arc<dyn PacketListener + Send + Sync>>>,
}

impl RtpPacketSource {
    pub fn new(ssrc: Ssrc) -> Self {
        RtpPacketSource {
            ssrc,
            listeners: Mutex::new(vec![]),
        }
    }

    /// Delivers one packet to every registered listener, in registration
    /// order. The listener list is cloned first so a listener cannot block
    /// add/remove callers for longer than its own delivery.
    pub async fn emit(&self, pkt: &rtp::packet::Packet) {
        let listeners = {
            let listeners = self.listeners.lock().await;
            listeners.clone()
        };
        for listener in listeners {
            listener.on_packet(pkt).await;
        }
    }

    pub async fn listener_count(&self) -> usize {
        let listeners = self.listeners.lock().await;
        listeners.len()
    }
}

impl fmt::Debug for RtpPacketSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpPacketSource")
            .field("ssrc", &self.ssrc)
            .finish()
    }
}

#[async_trait]
impl PacketSource for RtpPacketSource {
    fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    async fn add_listener(&self, listener: Arc<dyn PacketListener + Send + Sync>) {
        let mut listeners = self.listeners.lock().await;
        listeners.push(listener);
    }

    async fn remove_listener(&self, listener_id: usize) {
        let mut listeners = self.listeners.lock().await;
        listeners.retain(|l| l.listener_id() != listener_id);
    }
}
