//! FLV tag and AVC bitstream parsing
//!
//! Pure functions, no I/O. An RTMP video message payload is an FLV video tag
//! body; for H.264 this module parses the AVCDecoderConfigurationRecord out
//! of sequence headers, converts AVCC length-prefixed NAL units to Annex-B,
//! and injects SPS/PPS ahead of IDR frames so every keyframe is a
//! self-contained random-access point. Audio tags are parsed just far enough
//! to classify AAC sequence headers and extract codec parameters.

use bytes::Bytes;
use h264_reader::nal::sps::SeqParameterSet;
use h264_reader::nal::{Nal, RefNal};
use tracing::{debug, warn};

use crate::error::CodecError;

/// FLV video tag fixed header: frame-type/codec byte, AVC packet type,
/// 24-bit composition time offset.
const VIDEO_TAG_HEADER_LEN: usize = 5;

/// 4-byte Annex-B start code
const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Parsed H.264 decoder configuration (AVCDecoderConfigurationRecord).
///
/// Width and height are decoded from the first SPS; zero when the SPS could
/// not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoCodecInfo {
    pub profile: u8,
    pub compatibility: u8,
    pub level: u8,
    /// Length of the NAL size prefix applied to all AVCC payloads of the
    /// session: 1, 2 or 4
    pub nal_length_size: u8,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
    pub width: u32,
    pub height: u32,
}

/// Parsed AAC codec parameters (from an AudioSpecificConfig)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCodecInfo {
    /// AAC audio object type (2 = LC)
    pub profile: u8,
    pub sample_rate: u32,
    pub channels: u8,
}

/// FLV video frame types (high nibble of the first tag byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Key,
    Inter,
    DisposableInter,
    GeneratedKey,
    VideoInfo,
}

impl FrameType {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            1 => Some(FrameType::Key),
            2 => Some(FrameType::Inter),
            3 => Some(FrameType::DisposableInter),
            4 => Some(FrameType::GeneratedKey),
            5 => Some(FrameType::VideoInfo),
            _ => None,
        }
    }
}

/// Result of parsing an FLV video tag body
#[derive(Debug)]
pub struct VideoTag {
    pub frame_type: FrameType,
    pub packet: AvcPacket,
}

impl VideoTag {
    /// True for IDR frames (frame type 1)
    pub fn is_keyframe(&self) -> bool {
        self.frame_type == FrameType::Key
    }
}

/// The AVC payload carried by a video tag
#[derive(Debug)]
pub enum AvcPacket {
    /// AVC sequence header carrying the decoder configuration
    SequenceHeader(VideoCodecInfo),
    /// One frame of AVCC length-prefixed NAL units
    NalUnits {
        data: Bytes,
        /// Signed composition-time offset in milliseconds; PTS is the
        /// message timestamp plus this offset
        composition_time: i32,
    },
    /// End of the AVC sequence
    EndOfSequence,
}

/// Parse an FLV video tag body (the full payload of an RTMP video message).
///
/// Tag layout:
///   byte 0: frame type (high nibble) | codec id (low nibble, 7 = AVC)
///   byte 1: AVC packet type (0 = sequence header, 1 = NALUs, 2 = end)
///   bytes 2-4: composition time offset (signed 24-bit big-endian)
///   bytes 5+: AVC data
pub fn parse_video_tag(data: &Bytes) -> Result<VideoTag, CodecError> {
    if data.len() < 2 {
        return Err(CodecError::TruncatedTag);
    }

    let frame_nibble = data[0] >> 4;
    let codec_id = data[0] & 0x0F;
    if codec_id != 7 {
        return Err(CodecError::UnsupportedCodec(codec_id));
    }
    let frame_type = FrameType::from_nibble(frame_nibble).ok_or(CodecError::TruncatedTag)?;

    let avc_packet_type = data[1];
    match avc_packet_type {
        0 => {
            if data.len() < VIDEO_TAG_HEADER_LEN {
                return Err(CodecError::TruncatedTag);
            }
            let info = parse_decoder_config(&data[VIDEO_TAG_HEADER_LEN..])?;
            Ok(VideoTag {
                frame_type,
                packet: AvcPacket::SequenceHeader(info),
            })
        }
        1 => {
            if data.len() < VIDEO_TAG_HEADER_LEN {
                return Err(CodecError::TruncatedTag);
            }
            if data.len() == VIDEO_TAG_HEADER_LEN {
                return Err(CodecError::EmptyFrame);
            }
            let composition_time = i24_be(&data[2..5]);
            Ok(VideoTag {
                frame_type,
                packet: AvcPacket::NalUnits {
                    data: data.slice(VIDEO_TAG_HEADER_LEN..),
                    composition_time,
                },
            })
        }
        2 => Ok(VideoTag {
            frame_type,
            packet: AvcPacket::EndOfSequence,
        }),
        other => {
            warn!(avc_packet_type = other, "unknown AVC packet type");
            Err(CodecError::TruncatedTag)
        }
    }
}

/// Parse an AVCDecoderConfigurationRecord (ISO 14496-15).
///
/// Layout:
///   byte 0: configuration version (always 1)
///   byte 1: profile
///   byte 2: profile compatibility
///   byte 3: level
///   byte 4: 0b111111xx, xx = lengthSizeMinusOne
///   byte 5: 0b111xxxxx, xxxxx = numSPS
///   per SPS: u16-BE length, then bytes; 1 byte numPPS; per PPS likewise
pub fn parse_decoder_config(config: &[u8]) -> Result<VideoCodecInfo, CodecError> {
    if config.len() < 6 {
        return Err(CodecError::MalformedConfig("record shorter than 6 bytes"));
    }
    if config[0] != 1 {
        return Err(CodecError::MalformedConfig("configuration version != 1"));
    }

    let profile = config[1];
    let compatibility = config[2];
    let level = config[3];
    let nal_length_size = (config[4] & 0x03) + 1;
    if !matches!(nal_length_size, 1 | 2 | 4) {
        return Err(CodecError::BadNalLengthSize(nal_length_size));
    }

    let num_sps = (config[5] & 0x1F) as usize;
    let mut pos = 6;
    let mut sps = Vec::with_capacity(num_sps);
    for _ in 0..num_sps {
        let (ps, next) = read_u16_prefixed(config, pos, "truncated SPS")?;
        sps.push(ps.to_vec());
        pos = next;
    }

    if pos >= config.len() {
        return Err(CodecError::MalformedConfig("truncated PPS count"));
    }
    let num_pps = config[pos] as usize;
    pos += 1;
    let mut pps = Vec::with_capacity(num_pps);
    for _ in 0..num_pps {
        let (ps, next) = read_u16_prefixed(config, pos, "truncated PPS")?;
        pps.push(ps.to_vec());
        pos = next;
    }

    let (width, height) = sps
        .first()
        .and_then(|s| sps_dimensions(s))
        .unwrap_or_else(|| {
            warn!("could not decode picture dimensions from SPS");
            (0, 0)
        });

    debug!(
        profile,
        level,
        nal_length_size,
        num_sps = sps.len(),
        num_pps = pps.len(),
        width,
        height,
        "parsed AVC decoder config"
    );

    Ok(VideoCodecInfo {
        profile,
        compatibility,
        level,
        nal_length_size,
        sps,
        pps,
        width,
        height,
    })
}

/// Signed 24-bit big-endian (composition time offset)
fn i24_be(b: &[u8]) -> i32 {
    let raw = ((b[0] as i32) << 16) | ((b[1] as i32) << 8) | b[2] as i32;
    // sign-extend from 24 bits
    (raw << 8) >> 8
}

fn read_u16_prefixed<'a>(
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
) -> Result<(&'a [u8], usize), CodecError> {
    if pos + 2 > buf.len() {
        return Err(CodecError::MalformedConfig(what));
    }
    let len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
    let start = pos + 2;
    if start + len > buf.len() {
        return Err(CodecError::MalformedConfig(what));
    }
    Ok((&buf[start..start + len], start + len))
}

/// Decode picture dimensions from an SPS NAL (with its header byte, no start
/// code)
fn sps_dimensions(sps_nal: &[u8]) -> Option<(u32, u32)> {
    let nal = RefNal::new(sps_nal, &[], true);
    let sps = SeqParameterSet::from_bits(nal.rbsp_bits()).ok()?;
    sps.pixel_dimensions().ok()
}

/// Convert an AVCC length-prefixed payload to Annex-B.
///
/// Each NAL unit gets a 4-byte start code. Zero-length NAL units are
/// skipped; a declared length overrunning the buffer is an error.
pub fn avcc_to_annexb(avcc: &[u8], nal_length_size: u8) -> Result<Vec<u8>, CodecError> {
    let prefix = nal_length_size as usize;
    let mut out = Vec::with_capacity(avcc.len() + 16);
    let mut pos = 0;

    while pos < avcc.len() {
        if pos + prefix > avcc.len() {
            return Err(CodecError::TruncatedNalu {
                declared: prefix,
                remaining: avcc.len() - pos,
            });
        }
        let mut len = 0usize;
        for &b in &avcc[pos..pos + prefix] {
            len = (len << 8) | b as usize;
        }
        pos += prefix;

        if len == 0 {
            continue;
        }
        if pos + len > avcc.len() {
            return Err(CodecError::TruncatedNalu {
                declared: len,
                remaining: avcc.len() - pos,
            });
        }
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&avcc[pos..pos + len]);
        pos += len;
    }

    Ok(out)
}

/// Prepend every SPS and PPS (each behind a 4-byte start code) to an Annex-B
/// frame, making an IDR self-decodable.
pub fn inject_parameter_sets(config: &VideoCodecInfo, annexb: &[u8]) -> Vec<u8> {
    let ps_len: usize = config
        .sps
        .iter()
        .chain(config.pps.iter())
        .map(|ps| ps.len() + START_CODE.len())
        .sum();

    let mut out = Vec::with_capacity(ps_len + annexb.len());
    for ps in config.sps.iter().chain(config.pps.iter()) {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(ps);
    }
    out.extend_from_slice(annexb);
    out
}

/// Result of parsing an FLV audio tag body
#[derive(Debug)]
pub struct AudioTag {
    /// Sound format nibble (10 = AAC)
    pub sound_format: u8,
    /// True for an AAC sequence header (AudioSpecificConfig follows)
    pub is_sequence_header: bool,
    /// Payload past the per-codec header
    pub payload: Bytes,
}

/// Parse an FLV audio tag body: 1 header byte (format/rate/size/type), and
/// for AAC a packet-type byte (0 = AudioSpecificConfig, 1 = raw frames).
pub fn parse_audio_tag(data: &Bytes) -> Result<AudioTag, CodecError> {
    if data.is_empty() {
        return Err(CodecError::TruncatedTag);
    }
    let sound_format = data[0] >> 4;

    if sound_format == 10 {
        if data.len() < 2 {
            return Err(CodecError::TruncatedTag);
        }
        Ok(AudioTag {
            sound_format,
            is_sequence_header: data[1] == 0,
            payload: data.slice(2..),
        })
    } else {
        Ok(AudioTag {
            sound_format,
            is_sequence_header: false,
            payload: data.slice(1..),
        })
    }
}

/// AAC sampling frequencies by AudioSpecificConfig index
const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Decode an AAC AudioSpecificConfig: 5 bits object type, 4 bits sampling
/// frequency index, 4 bits channel configuration. Returns `None` for
/// escape-coded frequencies and other exotica.
pub fn parse_audio_specific_config(asc: &[u8]) -> Option<AudioCodecInfo> {
    if asc.len() < 2 {
        return None;
    }
    let profile = asc[0] >> 3;
    let freq_index = ((asc[0] & 0x07) << 1 | asc[1] >> 7) as usize;
    let channels = (asc[1] >> 3) & 0x0F;

    let sample_rate = *AAC_SAMPLE_RATES.get(freq_index)?;
    Some(AudioCodecInfo {
        profile,
        sample_rate,
        channels,
    })
}
