//! Stream registry
//!
//! Authoritative map of active streams plus the per-stream subscriber
//! fan-out. Two maps live behind one read-write lock: publishes take the
//! shared lock to iterate subscribers with non-blocking sends, while
//! create/subscribe/stop take the exclusive lock. Per-stream counters are
//! atomics so the publish path never needs a write lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::LimitsConfig;
use crate::error::RegistryError;
use crate::flv::{AudioCodecInfo, VideoCodecInfo};

/// Stream lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Connecting,
    Live,
    Stopping,
    Stopped,
}

impl Default for StreamState {
    fn default() -> Self {
        StreamState::Idle
    }
}

/// Media frame kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Video,
    Audio,
}

/// One demuxed media frame, immutable once published.
///
/// Video payloads are Annex-B; IDR frames carry a leading SPS+PPS pair put
/// there by the parser.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_key: Arc<str>,
    pub kind: FrameKind,
    /// Presentation time in source-domain milliseconds (wrapping u32)
    pub pts: u32,
    pub payload: Bytes,
    pub is_keyframe: bool,
    pub codec_tag: u8,
}

/// Running per-session counters, updated lock-free from the publish path
#[derive(Debug, Default)]
pub struct StreamStats {
    pub bytes_received: AtomicU64,
    pub frames_received: AtomicU64,
    pub keyframes: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub last_frame_unix_ms: AtomicU64,
}

impl StreamStats {
    fn reset(&self) {
        self.bytes_received.store(0, Ordering::Relaxed);
        self.frames_received.store(0, Ordering::Relaxed);
        self.keyframes.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.last_frame_unix_ms.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            keyframes: self.keyframes.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            last_frame_unix_ms: self.last_frame_unix_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub bytes_received: u64,
    pub frames_received: u64,
    pub keyframes: u64,
    pub frames_dropped: u64,
    pub last_frame_unix_ms: u64,
}

#[derive(Debug, Default)]
struct StreamMeta {
    state: StreamState,
    publisher_addr: Option<SocketAddr>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    video_codec: Option<VideoCodecInfo>,
    audio_codec: Option<AudioCodecInfo>,
    /// Frame-rate hint from `@setDataFrame` metadata
    frame_rate_hint: Option<f64>,
}

/// One registered stream
#[derive(Debug)]
pub struct StreamEntry {
    pub key: Arc<str>,
    meta: Mutex<StreamMeta>,
    pub stats: StreamStats,
}

impl StreamEntry {
    fn new(key: Arc<str>) -> Self {
        Self {
            key,
            meta: Mutex::new(StreamMeta::default()),
            stats: StreamStats::default(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.meta.lock().state
    }

    /// Record the parsed AVC sequence header. Set exactly once per
    /// publishing session; repeats from chatty encoders are ignored.
    pub fn set_video_codec(&self, info: VideoCodecInfo) {
        let mut meta = self.meta.lock();
        if meta.video_codec.is_some() {
            debug!(key = %self.key, "ignoring repeated AVC sequence header");
            return;
        }
        meta.video_codec = Some(info);
    }

    pub fn video_codec(&self) -> Option<VideoCodecInfo> {
        self.meta.lock().video_codec.clone()
    }

    pub fn set_audio_codec(&self, info: AudioCodecInfo) {
        let mut meta = self.meta.lock();
        if meta.audio_codec.is_none() {
            meta.audio_codec = Some(info);
        }
    }

    pub fn audio_codec(&self) -> Option<AudioCodecInfo> {
        self.meta.lock().audio_codec
    }

    pub fn set_frame_rate_hint(&self, fps: f64) {
        if fps.is_finite() && fps > 0.0 {
            self.meta.lock().frame_rate_hint = Some(fps);
        }
    }

    pub fn frame_rate_hint(&self) -> Option<f64> {
        self.meta.lock().frame_rate_hint
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let meta = self.meta.lock();
        StreamSnapshot {
            key: self.key.to_string(),
            state: meta.state,
            publisher_addr: meta.publisher_addr.map(|a| a.to_string()),
            started_at: meta.started_at.map(|t| t.to_rfc3339()),
            stopped_at: meta.stopped_at.map(|t| t.to_rfc3339()),
            video: meta.video_codec.as_ref().map(|v| VideoSnapshot {
                profile: v.profile,
                level: v.level,
                width: v.width,
                height: v.height,
            }),
            audio: meta.audio_codec.map(|a| AudioSnapshot {
                profile: a.profile,
                sample_rate: a.sample_rate,
                channels: a.channels,
            }),
            stats: self.stats.snapshot(),
        }
    }
}

/// Read-only view of a stream for queries and the debug endpoint
#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    pub key: String,
    pub state: StreamState,
    pub publisher_addr: Option<String>,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    pub video: Option<VideoSnapshot>,
    pub audio: Option<AudioSnapshot>,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoSnapshot {
    pub profile: u8,
    pub level: u8,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioSnapshot {
    pub profile: u8,
    pub sample_rate: u32,
    pub channels: u8,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Frame>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Arc<StreamEntry>>,
    subscribers: HashMap<String, Vec<Subscriber>>,
}

/// A subscriber's end of the fan-out: a bounded frame channel plus a
/// cleanup that must run exactly once. `close` runs it eagerly; `Drop` is
/// the safety net.
pub struct Subscription {
    pub receiver: mpsc::Receiver<Frame>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("receiver", &self.receiver)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn close(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

struct Shared {
    limits: LimitsConfig,
    inner: RwLock<Inner>,
    next_subscriber_id: AtomicU64,
}

/// Stream registry with subscriber fan-out. Cheap to clone; all clones see
/// the same state.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                limits,
                inner: RwLock::new(Inner::default()),
                next_subscriber_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a publisher for `key`.
    ///
    /// Rejects when a publisher already holds the key (anything between
    /// Connecting and Stopping), when the key contains reserved characters,
    /// or when the live-stream limit is reached. A leftover Stopped entry is
    /// replaced.
    pub fn create(
        &self,
        key: &str,
        publisher_addr: SocketAddr,
    ) -> Result<Arc<StreamEntry>, RegistryError> {
        if !valid_stream_key(key) {
            return Err(RegistryError::InvalidKey(key.to_string()));
        }

        let mut inner = self.shared.inner.write();

        if let Some(existing) = inner.streams.get(key) {
            let state = existing.state();
            if state != StreamState::Stopped && state != StreamState::Idle {
                return Err(RegistryError::AlreadyLive(key.to_string()));
            }
        }

        let active = inner
            .streams
            .values()
            .filter(|s| {
                let st = s.state();
                st == StreamState::Connecting || st == StreamState::Live
            })
            .count();
        if active >= self.shared.limits.max_streams {
            return Err(RegistryError::TooManyStreams(self.shared.limits.max_streams));
        }

        let entry = Arc::new(StreamEntry::new(Arc::from(key)));
        {
            let mut meta = entry.meta.lock();
            meta.state = StreamState::Connecting;
            meta.publisher_addr = Some(publisher_addr);
            meta.started_at = Some(Utc::now());
        }
        entry.stats.reset();
        inner.streams.insert(key.to_string(), entry.clone());
        inner.subscribers.entry(key.to_string()).or_default();

        debug!(key, %publisher_addr, "stream registered");
        Ok(entry)
    }

    pub fn set_live(&self, key: &str) -> Result<(), RegistryError> {
        let inner = self.shared.inner.read();
        let entry = inner
            .streams
            .get(key)
            .ok_or_else(|| RegistryError::UnknownStream(key.to_string()))?;
        entry.meta.lock().state = StreamState::Live;
        Ok(())
    }

    /// Stop a stream: close every subscriber channel exactly once, clear the
    /// session codec info, and drop the entry once nothing references it.
    /// Idempotent; unknown keys are a no-op.
    pub fn set_stopped(&self, key: &str) {
        let mut inner = self.shared.inner.write();

        // dropping the senders closes each channel exactly once
        let had_subscribers = match inner.subscribers.remove(key) {
            Some(subs) => !subs.is_empty(),
            None => false,
        };

        let known = if let Some(entry) = inner.streams.get(key) {
            let mut meta = entry.meta.lock();
            if meta.state != StreamState::Stopped {
                meta.state = StreamState::Stopped;
                meta.stopped_at = Some(Utc::now());
                meta.video_codec = None;
                meta.audio_codec = None;
            }
            true
        } else {
            false
        };

        if known && !had_subscribers {
            // no publisher and no subscribers remain
            inner.streams.remove(key);
        } else if had_subscribers {
            // receivers still draining; the entry goes when the last one
            // unsubscribes
            inner.subscribers.entry(key.to_string()).or_default();
        }
        debug!(key, "stream stopped");
    }

    /// Fan a frame out to every subscriber without blocking.
    ///
    /// A full channel counts against the stream's dropped-frames stat and
    /// the frame is skipped for that subscriber only.
    pub fn publish_frame(&self, frame: Frame) -> Result<(), RegistryError> {
        let inner = self.shared.inner.read();
        let key: &str = &frame.stream_key;
        let entry = inner
            .streams
            .get(key)
            .ok_or_else(|| RegistryError::UnknownStream(key.to_string()))?;

        let stats = &entry.stats;
        stats
            .bytes_received
            .fetch_add(frame.payload.len() as u64, Ordering::Relaxed);
        stats.frames_received.fetch_add(1, Ordering::Relaxed);
        if frame.kind == FrameKind::Video && frame.is_keyframe {
            stats.keyframes.fetch_add(1, Ordering::Relaxed);
        }
        stats
            .last_frame_unix_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);

        if let Some(subs) = inner.subscribers.get(key) {
            for sub in subs {
                if sub.tx.try_send(frame.clone()).is_err() {
                    let dropped = stats.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped % 500 == 1 {
                        warn!(
                            key,
                            dropped,
                            subscriber = sub.id,
                            "subscriber lagging, dropping frames"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Register a subscriber and hand back its channel end plus cleanup.
    ///
    /// Frames arrive in publish order. The registry keeps only the sender;
    /// the returned `Subscription` owns the receiver and the cleanup.
    pub fn subscribe(&self, key: &str, buffer: usize) -> Result<Subscription, RegistryError> {
        let mut inner = self.shared.inner.write();
        if !inner.streams.contains_key(key) {
            return Err(RegistryError::UnknownStream(key.to_string()));
        }

        let max_viewers = self.shared.limits.max_viewers_per_stream;
        let subs = inner.subscribers.entry(key.to_string()).or_default();
        if subs.len() >= max_viewers {
            return Err(RegistryError::TooManyViewers(max_viewers));
        }

        let id = self.shared.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer.max(1));
        subs.push(Subscriber { id, tx });

        let registry = self.clone();
        let cleanup_key = key.to_string();
        Ok(Subscription {
            receiver: rx,
            cleanup: Some(Box::new(move || registry.unsubscribe(&cleanup_key, id))),
        })
    }

    fn unsubscribe(&self, key: &str, id: u64) {
        let mut inner = self.shared.inner.write();
        let now_empty = match inner.subscribers.get_mut(key) {
            Some(subs) => {
                subs.retain(|s| s.id != id);
                subs.is_empty()
            }
            None => true,
        };

        // last subscriber of a stopped stream takes the entry with it
        if now_empty {
            let stopped = inner
                .streams
                .get(key)
                .map(|e| e.state() == StreamState::Stopped)
                .unwrap_or(false);
            if stopped {
                inner.streams.remove(key);
                inner.subscribers.remove(key);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<StreamEntry>> {
        self.shared.inner.read().streams.get(key).cloned()
    }

    pub fn list(&self) -> Vec<StreamSnapshot> {
        self.shared
            .inner
            .read()
            .streams
            .values()
            .map(|e| e.snapshot())
            .collect()
    }

    pub fn list_live(&self) -> Vec<StreamSnapshot> {
        self.shared
            .inner
            .read()
            .streams
            .values()
            .filter(|e| e.state() == StreamState::Live)
            .map(|e| e.snapshot())
            .collect()
    }
}

/// Stream keys are opaque printable bytes, excluding the URL-reserved
/// `?` and `/`.
pub(crate) fn valid_stream_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_graphic() && c != '?' && c != '/')
}
