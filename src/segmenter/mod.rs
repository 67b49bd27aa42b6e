//! Per-stream segmentation worker
//!
//! One worker owns all segmentation state for a stream: it subscribes to the
//! registry fan-out, buffers video frames into keyframe-aligned groups,
//! closes a segment on every tick that finds a keyframe in the buffer, and
//! maintains the sliding playlist window. Storage writes may block the
//! worker; the publish path is never affected because the subscriber channel
//! is bounded and drop-on-full.

pub mod playlist;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SegmentConfig;
use crate::mux::Muxer;
use crate::registry::{Frame, FrameKind, Registry, StreamEntry, Subscription};
use crate::storage::Storage;

pub use playlist::{parse_media_playlist, PlaylistState, SegmentRecord};

/// Consecutive muxer failures after which the stream is stopped
const MAX_MUX_FAILURES: u32 = 3;

/// Handle to a running segmentation worker.
///
/// HTTP handlers read the playlist through it; the ingest connection stops
/// it on teardown. `stop` is idempotent.
pub struct SegmenterHandle {
    playlist: Arc<RwLock<PlaylistState>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SegmenterHandle {
    pub fn playlist(&self) -> &Arc<RwLock<PlaylistState>> {
        &self.playlist
    }

    /// Handle over a pre-built playlist, for handler tests
    #[cfg(test)]
    pub(crate) fn for_tests(playlist: PlaylistState) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            playlist: Arc::new(RwLock::new(playlist)),
            shutdown,
            task: Mutex::new(None),
        })
    }

    /// Signal shutdown and wait for the final flush. Safe to call more than
    /// once; later calls are no-ops.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "segmenter task failed");
            }
        }
    }
}

/// Start a segmentation worker for a freshly admitted stream
pub fn spawn(
    registry: Registry,
    stream: Arc<StreamEntry>,
    subscription: Subscription,
    storage: Arc<dyn Storage>,
    muxer: Arc<dyn Muxer>,
    config: SegmentConfig,
) -> Arc<SegmenterHandle> {
    let playlist = Arc::new(RwLock::new(PlaylistState::new(config.window_size)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tick = config.tick_interval();

    let worker = Worker {
        key: stream.key.to_string(),
        registry,
        stream,
        storage,
        muxer,
        config,
        playlist: playlist.clone(),
        buffer: Vec::new(),
        has_keyframe: false,
        init_written: false,
        mux_failures: 0,
    };
    let task = tokio::spawn(worker.run(subscription, shutdown_rx, tick));

    Arc::new(SegmenterHandle {
        playlist,
        shutdown: shutdown_tx,
        task: Mutex::new(Some(task)),
    })
}

enum Finalize {
    /// Nothing to close yet, or the segment was discarded
    Idle,
    /// A segment entered the window
    Closed,
    /// Sustained muxer failure; the stream must stop
    Fatal,
}

struct Worker {
    key: String,
    registry: Registry,
    stream: Arc<StreamEntry>,
    storage: Arc<dyn Storage>,
    muxer: Arc<dyn Muxer>,
    config: SegmentConfig,
    playlist: Arc<RwLock<PlaylistState>>,
    buffer: Vec<Frame>,
    has_keyframe: bool,
    init_written: bool,
    mux_failures: u32,
}

impl Worker {
    async fn run(
        mut self,
        mut subscription: Subscription,
        mut shutdown: watch::Receiver<bool>,
        tick: Duration,
    ) {
        // every object path is written exactly once per publishing session
        if let Err(e) = self.purge_session_objects().await {
            warn!(key = %self.key, error = %e, "could not purge stale session objects");
        }

        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick completes immediately

        info!(key = %self.key, "segmenter started");
        loop {
            tokio::select! {
                maybe = subscription.receiver.recv() => match maybe {
                    Some(frame) => self.on_frame(frame),
                    // publisher gone: channel closed by the registry
                    None => break,
                },
                _ = ticker.tick() => {
                    if matches!(self.finalize().await, Finalize::Fatal) {
                        error!(key = %self.key, "sustained mux failure, stopping stream");
                        self.registry.set_stopped(&self.key);
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        // drain whatever already arrived, then close a last segment if a
        // keyframe made it in
        while let Ok(frame) = subscription.receiver.try_recv() {
            self.on_frame(frame);
        }
        let _ = self.finalize().await;
        self.playlist.write().ended = true;
        subscription.close();
        info!(key = %self.key, "segmenter stopped");
    }

    /// Buffer one frame. Audio is an extension point and is dropped here.
    /// A segment only ever opens on an IDR that carries its parameter sets,
    /// so frames arriving before that are discarded.
    fn on_frame(&mut self, frame: Frame) {
        if frame.kind != FrameKind::Video {
            return;
        }
        if self.buffer.is_empty() {
            if !frame.is_keyframe {
                return;
            }
            if !starts_with_sps(&frame.payload) {
                warn!(key = %self.key, "keyframe without parameter sets cannot open a segment");
                return;
            }
        }
        self.has_keyframe |= frame.is_keyframe;
        self.buffer.push(frame);
    }

    /// Try to close the current buffer into a segment.
    async fn finalize(&mut self) -> Finalize {
        if self.buffer.is_empty() || !self.has_keyframe {
            return Finalize::Idle;
        }

        let frames = std::mem::take(&mut self.buffer);
        self.has_keyframe = false;

        let fps = self
            .stream
            .frame_rate_hint()
            .unwrap_or(self.config.nominal_frame_rate);
        let duration = self.segment_duration_secs(&frames, fps);
        let sequence = self.playlist.read().next_sequence;

        let bytes = match self.muxer.media_segment(&frames, sequence as u32, fps) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.mux_failures += 1;
                warn!(
                    key = %self.key,
                    sequence,
                    failures = self.mux_failures,
                    error = %e,
                    "mux failed, segment discarded"
                );
                if self.mux_failures >= MAX_MUX_FAILURES {
                    return Finalize::Fatal;
                }
                return Finalize::Idle;
            }
        };
        self.mux_failures = 0;

        // the first successful segment also produces the init payload; if
        // that fails the segment is discarded and retried on the next close
        if !self.init_written && !self.write_init(&frames[0]).await {
            return Finalize::Idle;
        }

        let path = format!("{}/segment_{}.{}", self.key, sequence, self.muxer.segment_extension());
        let byte_size = bytes.len();
        if let Err(e) = self.store_put(&path, bytes).await {
            // discarded without advancing the sequence, so numbering stays
            // gap-free
            warn!(key = %self.key, sequence, error = %e, "segment write failed, discarded");
            return Finalize::Idle;
        }

        let evicted = {
            let mut playlist = self.playlist.write();
            playlist.next_sequence = sequence + 1;
            playlist.push(SegmentRecord {
                sequence,
                duration,
                path: path.clone(),
                uri: format!("segment_{}.{}", sequence, self.muxer.segment_extension()),
                byte_size,
                created_at: Utc::now(),
            })
        };

        if let Some(old) = evicted {
            let storage = self.storage.clone();
            let old_path = old.path.clone();
            let deleted =
                tokio::task::spawn_blocking(move || storage.delete(&old_path)).await;
            if let Ok(Err(e)) = deleted {
                warn!(key = %self.key, path = %old.path, error = %e, "evicted segment not deleted");
            }
        }

        debug!(key = %self.key, sequence, duration, byte_size, "segment closed");
        Finalize::Closed
    }

    /// Segment duration per the playlist contract: PTS-derived and clamped
    /// when the buffer spans a sane positive range, frame-count over nominal
    /// rate otherwise. Never zero.
    fn segment_duration_secs(&self, frames: &[Frame], fps: f64) -> f64 {
        let target = self.config.duration_secs;
        if let (Some(first), Some(last)) = (frames.first(), frames.last()) {
            let span_ms = last.pts.wrapping_sub(first.pts);
            if span_ms > 0 && f64::from(span_ms) < 4000.0 * target {
                let secs = f64::from(span_ms) / 1000.0;
                return secs.clamp(0.5 * target, 2.0 * target);
            }
        }
        (frames.len() as f64 / fps.max(1.0)).max(0.001)
    }

    async fn write_init(&mut self, first_keyframe: &Frame) -> bool {
        let Some(codec) = self.stream.video_codec() else {
            warn!(key = %self.key, "no codec configuration, cannot build init segment");
            return false;
        };

        let init = match self.muxer.init_segment(&codec, first_keyframe) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %self.key, error = %e, "init mux failed");
                self.mux_failures += 1;
                return false;
            }
        };

        let path = format!("{}/init.mp4", self.key);
        match self.store_put(&path, init).await {
            Ok(()) => {
                self.init_written = true;
                self.playlist.write().has_init = true;
                info!(key = %self.key, "init segment written");
                true
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "init segment write failed");
                false
            }
        }
    }

    async fn store_put(&self, path: &str, data: Bytes) -> io::Result<()> {
        let storage = self.storage.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || storage.put(&path, &data))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    async fn purge_session_objects(&self) -> io::Result<()> {
        let storage = self.storage.clone();
        let key = self.key.clone();
        tokio::task::spawn_blocking(move || storage.delete_prefix(&key))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

/// True when an Annex-B payload opens with an SPS NAL, i.e. parameter sets
/// were injected ahead of the IDR.
fn starts_with_sps(payload: &[u8]) -> bool {
    payload.len() > 4 && payload[..4] == [0, 0, 0, 1] && payload[4] & 0x1F == 7
}
