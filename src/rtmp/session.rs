//! Per-connection RTMP publisher session
//!
//! Drives an `rml_rtmp` `ServerSession` over one TCP connection: answers
//! protocol requests, admits exactly one publisher after token validation,
//! demuxes FLV-framed media into registry frames, and tears the stream down
//! exactly once when the connection ends.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult, StreamMetadata,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{AuthError, CodecError, Result, ServerError};
use crate::flv::{self, AvcPacket, VideoCodecInfo};
use crate::registry::{Frame, FrameKind, StreamEntry};
use crate::segmenter;
use crate::state::AppState;

/// Connection lifecycle; only `Publishing` accepts media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Connected,
    Ready,
    Publishing,
    Closed,
}

struct Publishing {
    key: Arc<str>,
    entry: Arc<StreamEntry>,
}

/// One publisher connection
pub struct PublisherSession {
    state: Arc<AppState>,
    peer_addr: SocketAddr,
    connection_id: Uuid,
    session: ServerSession,
    initial_results: Vec<ServerSessionResult>,
    conn_state: ConnectionState,
    publishing: Option<Publishing>,
    /// Parsed AVC sequence header for this session; drives AVCC length
    /// decoding and SPS/PPS injection
    codec_config: Option<VideoCodecInfo>,
}

impl PublisherSession {
    pub fn new(state: Arc<AppState>, peer_addr: SocketAddr) -> Result<Self> {
        let config = ServerSessionConfig::new();
        let (session, initial_results) = ServerSession::new(config)
            .map_err(|e| ServerError::Protocol(format!("session setup failed: {e:?}")))?;

        Ok(Self {
            state,
            peer_addr,
            connection_id: Uuid::new_v4(),
            session,
            initial_results,
            conn_state: ConnectionState::Connected,
            publishing: None,
            codec_config: None,
        })
    }

    /// Send the initial protocol messages (chunk size, window ack, ...)
    pub async fn send_initial(&mut self, stream: &mut TcpStream) -> Result<()> {
        let results = std::mem::take(&mut self.initial_results);
        self.send_results(results, stream).await
    }

    /// Feed received bytes through the protocol engine and dispatch events
    pub async fn handle_input(&mut self, data: &[u8], stream: &mut TcpStream) -> Result<()> {
        let results = self
            .session
            .handle_input(data)
            .map_err(|e| ServerError::Protocol(format!("chunk decode failed: {e:?}")))?;

        for result in results {
            match result {
                ServerSessionResult::OutboundResponse(packet) => {
                    stream.write_all(&packet.bytes).await?;
                }
                ServerSessionResult::RaisedEvent(event) => {
                    self.handle_event(event, stream).await?;
                }
                ServerSessionResult::UnhandleableMessageReceived(msg) => {
                    trace!(type_id = msg.type_id, "unhandleable RTMP message");
                }
            }
        }
        stream.flush().await?;
        Ok(())
    }

    /// Stop the stream this connection published. Runs exactly once; later
    /// calls are no-ops.
    pub async fn teardown(&mut self) {
        if let Some(publishing) = self.publishing.take() {
            let key: &str = &publishing.key;
            if let Some(handle) = self.state.segmenter(key) {
                handle.stop().await;
            }
            self.state.registry.set_stopped(key);
            info!(
                connection = %self.connection_id,
                key,
                "publishing stopped"
            );
        }
        self.conn_state = ConnectionState::Closed;
    }

    async fn handle_event(
        &mut self,
        event: ServerSessionEvent,
        stream: &mut TcpStream,
    ) -> Result<()> {
        match event {
            ServerSessionEvent::ConnectionRequested {
                request_id,
                app_name,
            } => {
                if app_name != self.state.config.rtmp_app {
                    return Err(ServerError::Protocol(format!(
                        "unknown application {app_name:?}"
                    )));
                }
                info!(connection = %self.connection_id, app_name, "connection accepted");
                let results = self.accept(request_id)?;
                self.send_results(results, stream).await?;
                self.conn_state = ConnectionState::Ready;
            }

            ServerSessionEvent::ReleaseStreamRequested { request_id, .. } => {
                let results = self.accept(request_id)?;
                self.send_results(results, stream).await?;
            }

            ServerSessionEvent::PublishStreamRequested {
                request_id,
                app_name,
                stream_key,
                mode,
            } => {
                if self.conn_state != ConnectionState::Ready {
                    return Err(ServerError::Protocol(
                        "publish before connect".to_string(),
                    ));
                }
                debug!(app_name, stream_key, ?mode, "publish requested");
                self.admit_publisher(&stream_key)?;
                let results = self.accept(request_id)?;
                self.send_results(results, stream).await?;
                self.conn_state = ConnectionState::Publishing;
            }

            ServerSessionEvent::StreamMetadataChanged { metadata, .. } => {
                self.apply_metadata(&metadata);
            }

            ServerSessionEvent::VideoDataReceived {
                data, timestamp, ..
            } => {
                if self.conn_state == ConnectionState::Publishing {
                    self.handle_video(data, timestamp.value)?;
                }
            }

            ServerSessionEvent::AudioDataReceived {
                data, timestamp, ..
            } => {
                if self.conn_state == ConnectionState::Publishing {
                    self.handle_audio(data, timestamp.value)?;
                }
            }

            ServerSessionEvent::PublishStreamFinished { .. } => {
                info!(connection = %self.connection_id, "publish finished by peer");
                self.teardown().await;
                self.conn_state = ConnectionState::Ready;
            }

            ServerSessionEvent::PlayStreamRequested { .. } => {
                return Err(ServerError::Protocol(
                    "playback is not served over RTMP".to_string(),
                ));
            }

            other => {
                debug!(?other, "unhandled RTMP event");
            }
        }
        Ok(())
    }

    /// Admission: parse `key?token=...`, consume the token atomically,
    /// register the stream, start its segmenter, go live.
    fn admit_publisher(&mut self, publish_name: &str) -> Result<()> {
        let (key, token) = split_publish_name(publish_name);

        match token {
            Some(token) => {
                self.state
                    .tokens
                    .consume(token, key, Some(self.peer_addr.ip()))?;
            }
            None if self.state.config.token.require_token => {
                warn!(key, "publish without token rejected");
                return Err(ServerError::Auth(AuthError::NotFound));
            }
            None => {}
        }

        let entry = self.state.registry.create(key, self.peer_addr)?;
        // registered from here on: teardown cleans up even if a later
        // admission step fails
        self.publishing = Some(Publishing {
            key: entry.key.clone(),
            entry: entry.clone(),
        });

        let subscription = self
            .state
            .registry
            .subscribe(key, self.state.config.segment.subscriber_buffer)?;
        let handle = segmenter::spawn(
            self.state.registry.clone(),
            entry.clone(),
            subscription,
            self.state.storage.clone(),
            self.state.muxer.clone(),
            self.state.config.segment.clone(),
        );
        self.state.segmenters.insert(key.to_string(), handle);

        self.state.registry.set_live(key)?;
        info!(
            connection = %self.connection_id,
            key,
            peer = %self.peer_addr,
            "publisher admitted"
        );
        Ok(())
    }

    fn apply_metadata(&mut self, metadata: &StreamMetadata) {
        let Some(publishing) = &self.publishing else {
            return;
        };
        if let Some(fps) = metadata.video_frame_rate {
            publishing.entry.set_frame_rate_hint(f64::from(fps));
        }
        debug!(
            key = %publishing.key,
            width = ?metadata.video_width,
            height = ?metadata.video_height,
            fps = ?metadata.video_frame_rate,
            "stream metadata"
        );
    }

    /// Demux one video message: sequence headers update the codec config,
    /// frames become Annex-B registry frames with SPS/PPS injected at IDRs.
    fn handle_video(&mut self, data: Bytes, timestamp_ms: u32) -> Result<()> {
        let Some(publishing) = &self.publishing else {
            return Ok(());
        };

        let tag = match flv::parse_video_tag(&data) {
            Ok(tag) => tag,
            // session-level codec problems end the publisher
            Err(e @ CodecError::UnsupportedCodec(_))
            | Err(e @ CodecError::MalformedConfig(_))
            | Err(e @ CodecError::BadNalLengthSize(_)) => {
                return Err(ServerError::Codec(e));
            }
            // frame-level problems drop just this frame
            Err(e) => {
                warn!(key = %publishing.key, error = %e, "dropping malformed video tag");
                publishing.entry.stats.frames_dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Ok(());
            }
        };

        let is_keyframe = tag.is_keyframe();

        match tag.packet {
            AvcPacket::SequenceHeader(info) => {
                debug!(
                    key = %publishing.key,
                    profile = info.profile,
                    width = info.width,
                    height = info.height,
                    "AVC sequence header"
                );
                publishing.entry.set_video_codec(info.clone());
                self.codec_config = Some(info);
            }

            AvcPacket::NalUnits {
                data: avcc,
                composition_time,
            } => {
                let length_size = self
                    .codec_config
                    .as_ref()
                    .map(|c| c.nal_length_size)
                    .unwrap_or(4);

                let annexb = match flv::avcc_to_annexb(&avcc, length_size) {
                    Ok(annexb) => annexb,
                    Err(e) => {
                        warn!(key = %publishing.key, error = %e, "dropping truncated frame");
                        publishing.entry.stats.frames_dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        return Ok(());
                    }
                };

                let payload = if is_keyframe {
                    match &self.codec_config {
                        Some(config) => flv::inject_parameter_sets(config, &annexb),
                        None => {
                            warn!(key = %publishing.key, "keyframe before sequence header, no SPS/PPS injected");
                            annexb
                        }
                    }
                } else {
                    annexb
                };

                let frame = Frame {
                    stream_key: publishing.key.clone(),
                    kind: FrameKind::Video,
                    pts: timestamp_ms.wrapping_add(composition_time as u32),
                    payload: Bytes::from(payload),
                    is_keyframe,
                    codec_tag: 7,
                };
                // UnknownStream here means the stream was stopped out from
                // under the connection; ending it is correct
                self.state.registry.publish_frame(frame)?;
            }

            AvcPacket::EndOfSequence => {
                debug!(key = %publishing.key, "AVC end of sequence");
            }
        }
        Ok(())
    }

    /// Forward one audio message; an AAC sequence header only updates the
    /// stream's audio codec info.
    fn handle_audio(&mut self, data: Bytes, timestamp_ms: u32) -> Result<()> {
        let Some(publishing) = &self.publishing else {
            return Ok(());
        };

        let tag = match flv::parse_audio_tag(&data) {
            Ok(tag) => tag,
            Err(e) => {
                warn!(key = %publishing.key, error = %e, "dropping malformed audio tag");
                return Ok(());
            }
        };

        if tag.is_sequence_header {
            if let Some(info) = flv::parse_audio_specific_config(&tag.payload) {
                debug!(
                    key = %publishing.key,
                    sample_rate = info.sample_rate,
                    channels = info.channels,
                    "AAC codec config"
                );
                publishing.entry.set_audio_codec(info);
            }
            return Ok(());
        }

        let frame = Frame {
            stream_key: publishing.key.clone(),
            kind: FrameKind::Audio,
            pts: timestamp_ms,
            payload: tag.payload,
            is_keyframe: false,
            codec_tag: tag.sound_format,
        };
        self.state.registry.publish_frame(frame)?;
        Ok(())
    }

    fn accept(&mut self, request_id: u32) -> Result<Vec<ServerSessionResult>> {
        self.session
            .accept_request(request_id)
            .map_err(|e| ServerError::Protocol(format!("accept_request failed: {e:?}")))
    }

    async fn send_results(
        &self,
        results: Vec<ServerSessionResult>,
        stream: &mut TcpStream,
    ) -> Result<()> {
        for result in results {
            if let ServerSessionResult::OutboundResponse(packet) = result {
                stream.write_all(&packet.bytes).await?;
            }
        }
        stream.flush().await?;
        Ok(())
    }
}

/// Split an RTMP publishing name into stream key and optional inline token
/// (`key?token=...`).
fn split_publish_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once('?') {
        Some((key, query)) => {
            let token = query.split('&').find_map(|p| p.strip_prefix("token="));
            (key, token)
        }
        None => (name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use crate::registry::StreamState;
    use crate::state::test_state;

    fn peer() -> SocketAddr {
        "10.0.0.5:44321".parse().unwrap()
    }

    fn session(state: &Arc<AppState>) -> PublisherSession {
        let mut session = PublisherSession::new(state.clone(), peer()).unwrap();
        session.conn_state = ConnectionState::Ready;
        session
    }

    #[test]
    fn test_split_publish_name() {
        assert_eq!(split_publish_name("cam1"), ("cam1", None));
        assert_eq!(
            split_publish_name("cam1?token=abc123"),
            ("cam1", Some("abc123"))
        );
        assert_eq!(
            split_publish_name("cam1?foo=1&token=t&bar=2"),
            ("cam1", Some("t"))
        );
        assert_eq!(split_publish_name("cam1?foo=1"), ("cam1", None));
    }

    #[tokio::test]
    async fn test_admission_with_valid_token() {
        let state = test_state();
        let token = state.tokens.issue("cam1", 60, None);

        let mut session = session(&state);
        session
            .admit_publisher(&format!("cam1?token={}", token.token))
            .unwrap();

        let entry = state.registry.get("cam1").unwrap();
        assert_eq!(entry.state(), StreamState::Live);
        assert!(state.segmenter("cam1").is_some());

        session.teardown().await;
        assert_eq!(state.registry.get("cam1").map(|e| e.state()), None);
    }

    #[tokio::test]
    async fn test_admission_without_token_rejected() {
        let state = test_state();
        let mut session = session(&state);
        let err = session.admit_publisher("cam1").unwrap_err();
        assert!(matches!(err, ServerError::Auth(AuthError::NotFound)));
        assert!(state.registry.get("cam1").is_none());
    }

    #[tokio::test]
    async fn test_token_is_single_use_across_connections() {
        let state = test_state();
        let token = state.tokens.issue("cam1", 60, None);
        let name = format!("cam1?token={}", token.token);

        let mut first = session(&state);
        first.admit_publisher(&name).unwrap();
        first.teardown().await;

        // stream slot is free again, but the token was consumed
        let mut second = session(&state);
        let err = second.admit_publisher(&name).unwrap_err();
        assert!(matches!(
            err,
            ServerError::Auth(AuthError::AlreadyUsed)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_publishers_single_winner() {
        let state = test_state();
        let tok1 = state.tokens.issue("cam1", 60, None);
        let tok2 = state.tokens.issue("cam1", 60, None);

        let mut first = session(&state);
        let mut second = session(&state);
        first
            .admit_publisher(&format!("cam1?token={}", tok1.token))
            .unwrap();
        let err = second
            .admit_publisher(&format!("cam1?token={}", tok2.token))
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Registry(RegistryError::AlreadyLive(_))
        ));

        // the survivor's session starts numbering at 0
        let handle = state.segmenter("cam1").unwrap();
        assert_eq!(handle.playlist().read().next_sequence, 0);

        first.teardown().await;
    }

    #[tokio::test]
    async fn test_teardown_idempotent() {
        let state = test_state();
        let token = state.tokens.issue("cam1", 60, None);
        let mut session = session(&state);
        session
            .admit_publisher(&format!("cam1?token={}", token.token))
            .unwrap();

        session.teardown().await;
        session.teardown().await;
        assert!(state.registry.get("cam1").is_none());
    }

    #[tokio::test]
    async fn test_video_sequence_header_then_frame() {
        let state = test_state();
        let token = state.tokens.issue("cam1", 60, None);
        let mut session = session(&state);
        session
            .admit_publisher(&format!("cam1?token={}", token.token))
            .unwrap();
        session.conn_state = ConnectionState::Publishing;

        // sequence header
        let mut header = vec![
            0x17, 0x00, 0x00, 0x00, 0x00, // tag header
            0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, // config, 1 SPS
        ];
        header.extend_from_slice(&[0x00, 0x04, 0x67, 0x64, 0x00, 0x1F]);
        header.extend_from_slice(&[0x01, 0x00, 0x03, 0x68, 0xEB, 0xE3]);
        session.handle_video(Bytes::from(header), 0).unwrap();

        let entry = state.registry.get("cam1").unwrap();
        assert!(entry.video_codec().is_some());

        // keyframe: one IDR NAL in AVCC framing
        let mut keyframe = vec![0x17, 0x01, 0x00, 0x00, 0x00];
        keyframe.extend_from_slice(&[0x00, 0x00, 0x00, 0x02, 0x65, 0x88]);
        session.handle_video(Bytes::from(keyframe), 40).unwrap();

        let stats = &entry.stats;
        assert_eq!(
            stats
                .frames_received
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert_eq!(
            stats.keyframes.load(std::sync::atomic::Ordering::Relaxed),
            1
        );

        session.teardown().await;
    }

    #[tokio::test]
    async fn test_unsupported_codec_ends_session() {
        let state = test_state();
        let token = state.tokens.issue("cam1", 60, None);
        let mut session = session(&state);
        session
            .admit_publisher(&format!("cam1?token={}", token.token))
            .unwrap();
        session.conn_state = ConnectionState::Publishing;

        // codec id 2 (Sorenson H.263)
        let err = session
            .handle_video(Bytes::from_static(&[0x22, 0x01, 0, 0, 0, 0xAA]), 0)
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Codec(CodecError::UnsupportedCodec(2))
        ));

        session.teardown().await;
    }

    #[tokio::test]
    async fn test_truncated_frame_dropped_not_fatal() {
        let state = test_state();
        let token = state.tokens.issue("cam1", 60, None);
        let mut session = session(&state);
        session
            .admit_publisher(&format!("cam1?token={}", token.token))
            .unwrap();
        session.conn_state = ConnectionState::Publishing;

        // NAL length overruns by one byte
        let mut tag = vec![0x27, 0x01, 0x00, 0x00, 0x00];
        tag.extend_from_slice(&[0x00, 0x00, 0x00, 0x04, 0x41, 0x9A, 0x00]);
        session.handle_video(Bytes::from(tag), 0).unwrap();

        let entry = state.registry.get("cam1").unwrap();
        assert_eq!(
            entry
                .stats
                .frames_dropped
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );

        session.teardown().await;
    }

    #[tokio::test]
    async fn test_audio_codec_info_recorded() {
        let state = test_state();
        let token = state.tokens.issue("cam1", 60, None);
        let mut session = session(&state);
        session
            .admit_publisher(&format!("cam1?token={}", token.token))
            .unwrap();
        session.conn_state = ConnectionState::Publishing;

        session
            .handle_audio(Bytes::from_static(&[0xAF, 0x00, 0x11, 0x90]), 0)
            .unwrap();
        let entry = state.registry.get("cam1").unwrap();
        let audio = entry.audio_codec().unwrap();
        assert_eq!(audio.sample_rate, 48000);
        assert_eq!(audio.channels, 2);

        // a raw AAC frame is forwarded, not treated as config
        session
            .handle_audio(Bytes::from_static(&[0xAF, 0x01, 0x21, 0x10, 0x05]), 20)
            .unwrap();
        assert_eq!(
            entry
                .stats
                .frames_received
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );

        session.teardown().await;
    }
}
