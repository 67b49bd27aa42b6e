//! Muxer boundary
//!
//! The segmenter hands the muxer an ordered list of Annex-B frames (SPS/PPS
//! already ahead of each IDR) and gets back container bytes. The muxer must
//! not reorder frames. The in-process fMP4/CMAF implementation lives in
//! [`fmp4`]; the trait keeps the container choice swappable.

pub mod fmp4;

use bytes::Bytes;

use crate::error::MuxError;
use crate::flv::VideoCodecInfo;
use crate::registry::Frame;

pub use fmp4::Fmp4Muxer;

/// Container muxer contract
pub trait Muxer: Send + Sync + 'static {
    /// Build the initialization payload served as `EXT-X-MAP` content.
    ///
    /// `init_frame` is the first keyframe of the session, whose Annex-B
    /// prefix carries SPS and PPS by construction.
    fn init_segment(&self, codec: &VideoCodecInfo, init_frame: &Frame) -> Result<Bytes, MuxError>;

    /// Build one self-contained media segment from ordered Annex-B frames.
    ///
    /// `sequence` is the segment's playlist sequence number;
    /// `frame_rate_hint` is used for sample durations when PTS deltas are
    /// unusable.
    fn media_segment(
        &self,
        frames: &[Frame],
        sequence: u32,
        frame_rate_hint: f64,
    ) -> Result<Bytes, MuxError>;

    /// File extension of media segments produced by this muxer
    fn segment_extension(&self) -> &'static str;
}

/// Split an Annex-B elementary stream into NAL unit slices (bodies only,
/// start codes removed). Both 3- and 4-byte start codes are accepted.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut pos = 0;
    let mut current: Option<usize> = None;

    while pos + 2 < data.len() {
        if data[pos] == 0 && data[pos + 1] == 0 {
            let code_len = if data[pos + 2] == 1 {
                Some(3)
            } else if pos + 3 < data.len() && data[pos + 2] == 0 && data[pos + 3] == 1 {
                Some(4)
            } else {
                None
            };
            if let Some(code_len) = code_len {
                if let Some(start) = current {
                    if start < pos {
                        nals.push(&data[start..pos]);
                    }
                }
                pos += code_len;
                current = Some(pos);
                continue;
            }
        }
        pos += 1;
    }
    if let Some(start) = current {
        if start < data.len() {
            nals.push(&data[start..]);
        }
    }
    nals
}

/// Repackage Annex-B into AVCC with 4-byte length prefixes, as required by
/// fMP4 sample data.
pub fn annexb_to_avcc(data: &[u8]) -> Result<Vec<u8>, MuxError> {
    let nals = split_annexb(data);
    if nals.is_empty() {
        return Err(MuxError::BadBitstream("no NAL units found"));
    }
    let total: usize = nals.iter().map(|n| n.len() + 4).sum();
    let mut out = Vec::with_capacity(total);
    for nal in nals {
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    Ok(out)
}
