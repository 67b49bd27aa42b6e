//! In-process fMP4/CMAF muxer
//!
//! Hand-assembled ISO-BMFF boxes: the init segment is `ftyp`+`moov` (with an
//! `avc1`/`avcC` sample entry built from the session's SPS/PPS and an `mvex`
//! declaring the fragmented layout); each media segment is one
//! `moof`(+`mfhd`,`traf`)+`mdat` pair carrying every frame of the segment as
//! one sample run. Track timescale is 1000 so sample times stay in the RTMP
//! millisecond domain.

use bytes::Bytes;

use crate::error::MuxError;
use crate::flv::VideoCodecInfo;
use crate::registry::Frame;

use super::{annexb_to_avcc, Muxer};

/// Milliseconds; matches the RTMP timestamp domain
const TIMESCALE: u32 = 1000;

const TRACK_ID: u32 = 1;

/// fMP4 muxer for a single H.264 video track
#[derive(Debug, Default)]
pub struct Fmp4Muxer;

impl Fmp4Muxer {
    pub fn new() -> Self {
        Self
    }
}

impl Muxer for Fmp4Muxer {
    fn init_segment(&self, codec: &VideoCodecInfo, init_frame: &Frame) -> Result<Bytes, MuxError> {
        if codec.sps.is_empty() || codec.pps.is_empty() {
            return Err(MuxError::MissingParameterSets);
        }
        if !init_frame.is_keyframe {
            return Err(MuxError::BadBitstream("init frame is not a keyframe"));
        }

        let mut out = ftyp();
        out.append(&mut moov(codec));
        Ok(Bytes::from(out))
    }

    fn media_segment(
        &self,
        frames: &[Frame],
        sequence: u32,
        frame_rate_hint: f64,
    ) -> Result<Bytes, MuxError> {
        if frames.is_empty() {
            return Err(MuxError::EmptyInput);
        }

        let fallback_duration = if frame_rate_hint > 0.0 {
            (TIMESCALE as f64 / frame_rate_hint).round() as u32
        } else {
            33
        };

        let mut samples = Vec::with_capacity(frames.len());
        let mut mdat_payload = Vec::new();
        let mut prev_delta = fallback_duration;

        for (i, frame) in frames.iter().enumerate() {
            let data = annexb_to_avcc(&frame.payload)?;

            // duration to the next frame; the last sample reuses the
            // previous delta
            let duration = match frames.get(i + 1) {
                Some(next) => {
                    let delta = next.pts.wrapping_sub(frame.pts);
                    if delta == 0 || delta > 10 * TIMESCALE {
                        fallback_duration
                    } else {
                        delta
                    }
                }
                None => prev_delta,
            };
            prev_delta = duration;

            samples.push(Sample {
                size: data.len() as u32,
                duration,
                key_frame: frame.is_keyframe,
            });
            mdat_payload.extend_from_slice(&data);
        }

        let base_decode_time = frames[0].pts;
        let mut out = moof(sequence, base_decode_time, &samples);
        out.append(&mut mdat(&mdat_payload));
        Ok(Bytes::from(out))
    }

    fn segment_extension(&self) -> &'static str {
        "m4s"
    }
}

struct Sample {
    size: u32,
    duration: u32,
    key_frame: bool,
}

impl Sample {
    /// 4-byte trun sample flags: sample_depends_on in the low bits of the
    /// first byte, sample_is_non_sync as the low bit of the second
    fn flags(&self) -> [u8; 4] {
        let depends_on: u8 = if self.key_frame { 2 } else { 1 };
        let non_sync: u8 = if self.key_frame { 0 } else { 1 };
        [depends_on, non_sync, 0x00, 0x00]
    }

    /// 1-byte sdtp entry
    fn sdtp_byte(&self) -> u8 {
        let depends_on: u8 = if self.key_frame { 2 } else { 1 };
        depends_on << 4
    }
}

fn mp4_box(box_type: &[u8; 4], payloads: &[&[u8]]) -> Vec<u8> {
    let size: u32 = 8 + payloads.iter().map(|p| p.len() as u32).sum::<u32>();
    let mut buffer = Vec::with_capacity(size as usize);
    buffer.extend_from_slice(&size.to_be_bytes());
    buffer.extend_from_slice(box_type);
    for p in payloads {
        buffer.extend_from_slice(p);
    }
    buffer
}

/// file type box
fn ftyp() -> Vec<u8> {
    const MAJOR_BRAND: [u8; 4] = *b"isom";
    const MINOR_VERSION: [u8; 4] = [0, 0, 0, 1];
    const AVC_BRAND: [u8; 4] = *b"avc1";
    mp4_box(b"ftyp", &[&MAJOR_BRAND, &MINOR_VERSION, &MAJOR_BRAND, &AVC_BRAND])
}

/// movie box: mvhd + one video trak + mvex
fn moov(codec: &VideoCodecInfo) -> Vec<u8> {
    let mvhd = mvhd();
    let trak = trak(codec);
    let mvex = mvex();
    mp4_box(b"moov", &[&mvhd, &trak, &mvex])
}

fn mvhd() -> Vec<u8> {
    let mut bytes = vec![
        0x00, // version 0
        0x00, 0x00, 0x00, // flags
        0x00, 0x00, 0x00, 0x00, // creation_time
        0x00, 0x00, 0x00, 0x00, // modification_time
    ];
    bytes.extend_from_slice(&TIMESCALE.to_be_bytes());
    bytes.extend_from_slice(&0u32.to_be_bytes()); // duration: live, unknown
    bytes.extend_from_slice(&[
        0x00, 0x01, 0x00, 0x00, // 1.0 rate
        0x01, 0x00, // 1.0 volume
        0x00, 0x00, // reserved
        0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x01, 0x00, 0x00, // unity matrix
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x01, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0x40, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, // pre_defined x6
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0xFF, 0xFF, 0xFF, 0xFF, // next_track_ID
    ]);
    mp4_box(b"mvhd", &[&bytes])
}

fn trak(codec: &VideoCodecInfo) -> Vec<u8> {
    let tkhd = tkhd(codec.width as u16, codec.height as u16);
    let mdia = mdia(codec);
    mp4_box(b"trak", &[&tkhd, &mdia])
}

fn tkhd(width: u16, height: u16) -> Vec<u8> {
    let mut bytes = vec![
        0x00, // version 0
        0x00, 0x00, 0x07, // flags: enabled, in movie, in preview
        0x00, 0x00, 0x00, 0x00, // creation_time
        0x00, 0x00, 0x00, 0x00, // modification_time
    ];
    bytes.extend_from_slice(&TRACK_ID.to_be_bytes());
    bytes.extend_from_slice(&[
        0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x00, 0x00, 0x00, // duration
        0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x00, // layer
        0x00, 0x00, // alternate_group
        0x00, 0x00, // volume: video track
        0x00, 0x00, // reserved
        0x00, 0x01, 0x00, 0x00, // unity matrix
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x01, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0x40, 0x00, 0x00, 0x00, //
    ]);
    // 16.16 fixed-point width and height
    bytes.extend_from_slice(&[(width >> 8) as u8, width as u8, 0x00, 0x00]);
    bytes.extend_from_slice(&[(height >> 8) as u8, height as u8, 0x00, 0x00]);
    mp4_box(b"tkhd", &[&bytes])
}

fn mdia(codec: &VideoCodecInfo) -> Vec<u8> {
    let mdhd = mdhd();
    let hdlr = hdlr();
    let minf = minf(codec);
    mp4_box(b"mdia", &[&mdhd, &hdlr, &minf])
}

fn mdhd() -> Vec<u8> {
    let mut bytes = vec![
        0x00, // version 0
        0x00, 0x00, 0x00, // flags
        0x00, 0x00, 0x00, 0x00, // creation_time
        0x00, 0x00, 0x00, 0x00, // modification_time
    ];
    bytes.extend_from_slice(&TIMESCALE.to_be_bytes());
    bytes.extend_from_slice(&0u32.to_be_bytes()); // duration
    bytes.extend_from_slice(&[
        0x55, 0xC4, // 'und' language
        0x00, 0x00, // pre_defined
    ]);
    mp4_box(b"mdhd", &[&bytes])
}

fn hdlr() -> Vec<u8> {
    const VIDEO_HDLR: [u8; 37] = [
        0x00, // version 0
        0x00, 0x00, 0x00, // flags
        0x00, 0x00, 0x00, 0x00, // pre_defined
        0x76, 0x69, 0x64, 0x65, // handler_type: 'vide'
        0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x00, 0x00, 0x00, // reserved
        0x56, 0x69, 0x64, 0x65, // name: 'VideoHandler\0'
        0x6F, 0x48, 0x61, 0x6E, //
        0x64, 0x6C, 0x65, 0x72, 0x00,
    ];
    mp4_box(b"hdlr", &[&VIDEO_HDLR])
}

fn minf(codec: &VideoCodecInfo) -> Vec<u8> {
    const VMHD: [u8; 12] = [
        0x00, // version
        0x00, 0x00, 0x01, // flags
        0x00, 0x00, // graphicsmode
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // opcolor
    ];
    const DREF: [u8; 20] = [
        0x00, // version 0
        0x00, 0x00, 0x00, // flags
        0x00, 0x00, 0x00, 0x01, // entry_count
        0x00, 0x00, 0x00, 0x0C, // entry size
        0x75, 0x72, 0x6C, 0x20, // 'url '
        0x00, // version 0
        0x00, 0x00, 0x01, // self-contained
    ];
    let vmhd = mp4_box(b"vmhd", &[&VMHD]);
    let dinf = mp4_box(b"dinf", &[&mp4_box(b"dref", &[&DREF])]);
    let stbl = stbl(codec);
    mp4_box(b"minf", &[&vmhd, &dinf, &stbl])
}

fn stbl(codec: &VideoCodecInfo) -> Vec<u8> {
    const EMPTY_FULL_BOX: [u8; 8] = [
        0x00, // version
        0x00, 0x00, 0x00, // flags
        0x00, 0x00, 0x00, 0x00, // entry_count
    ];
    const STSZ: [u8; 12] = [
        0x00, 0x00, 0x00, 0x00, // version + flags
        0x00, 0x00, 0x00, 0x00, // sample_size
        0x00, 0x00, 0x00, 0x00, // sample_count
    ];
    let stsd = stsd(codec);
    let stts = mp4_box(b"stts", &[&EMPTY_FULL_BOX]);
    let stsc = mp4_box(b"stsc", &[&EMPTY_FULL_BOX]);
    let stsz = mp4_box(b"stsz", &[&STSZ]);
    let stco = mp4_box(b"stco", &[&EMPTY_FULL_BOX]);
    mp4_box(b"stbl", &[&stsd, &stts, &stsc, &stsz, &stco])
}

fn stsd(codec: &VideoCodecInfo) -> Vec<u8> {
    const STSD_HEADER: [u8; 8] = [
        0x00, // version 0
        0x00, 0x00, 0x00, // flags
        0x00, 0x00, 0x00, 0x01, // entry_count
    ];
    let avc1 = avc1(codec);
    mp4_box(b"stsd", &[&STSD_HEADER, &avc1])
}

fn avc1(codec: &VideoCodecInfo) -> Vec<u8> {
    let width = codec.width as u16;
    let height = codec.height as u16;

    let mut bytes = vec![
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x01, // data_reference_index
        0x00, 0x00, // pre_defined
        0x00, 0x00, // reserved
        0x00, 0x00, 0x00, 0x00, // pre_defined
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
    ];
    bytes.extend_from_slice(&[(width >> 8) as u8, width as u8]);
    bytes.extend_from_slice(&[(height >> 8) as u8, height as u8]);
    bytes.extend_from_slice(&[
        0x00, 0x48, 0x00, 0x00, // horizresolution 72dpi
        0x00, 0x48, 0x00, 0x00, // vertresolution 72dpi
        0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x01, // frame_count
    ]);
    bytes.extend_from_slice(&[0u8; 32]); // compressorname
    bytes.extend_from_slice(&[
        0x00, 0x18, // depth = 24
        0xFF, 0xFF, // pre_defined
    ]);

    let avcc = avcc(codec);
    mp4_box(b"avc1", &[&bytes, &avcc])
}

/// AVCConfigurationBox rebuilt from the parsed decoder configuration. The
/// length size is pinned to 4 because sample data is repackaged with 4-byte
/// prefixes regardless of what the publisher sent.
fn avcc(codec: &VideoCodecInfo) -> Vec<u8> {
    let mut bytes = vec![
        0x01, // configuration version
        codec.profile,
        codec.compatibility,
        codec.level,
        0xFC | 0x03, // lengthSizeMinusOne = 3
        0xE0 | (codec.sps.len() as u8 & 0x1F),
    ];
    for sps in &codec.sps {
        bytes.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        bytes.extend_from_slice(sps);
    }
    bytes.push(codec.pps.len() as u8);
    for pps in &codec.pps {
        bytes.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        bytes.extend_from_slice(pps);
    }
    mp4_box(b"avcC", &[&bytes])
}

/// movie extends box: declares the track as fragmented
fn mvex() -> Vec<u8> {
    let mut trex = vec![
        0x00, // version 0
        0x00, 0x00, 0x00, // flags
    ];
    trex.extend_from_slice(&TRACK_ID.to_be_bytes());
    trex.extend_from_slice(&[
        0x00, 0x00, 0x00, 0x01, // default_sample_description_index
        0x00, 0x00, 0x00, 0x00, // default_sample_duration
        0x00, 0x00, 0x00, 0x00, // default_sample_size
        0x00, 0x01, 0x00, 0x01, // default_sample_flags
    ]);
    let trex = mp4_box(b"trex", &[&trex]);
    mp4_box(b"mvex", &[&trex])
}

// traf layout is fixed, so the trun data offset can be computed up front:
// moof = hdr(8) + mfhd(16) + traf(hdr 8 + tfhd 16 + tfdt 16 + trun(20+16n)
// + sdtp(12+n)) and mdat payload starts 8 bytes after the moof.
fn moof_size(sample_count: usize) -> u32 {
    (96 + 17 * sample_count) as u32
}

fn moof(sequence: u32, base_decode_time: u32, samples: &[Sample]) -> Vec<u8> {
    let mfhd = mfhd(sequence);
    let traf = traf(base_decode_time, samples);
    let out = mp4_box(b"moof", &[&mfhd, &traf]);
    debug_assert_eq!(out.len() as u32, moof_size(samples.len()));
    out
}

fn mfhd(sequence: u32) -> Vec<u8> {
    let mut bytes = vec![
        0x00, // version 0
        0x00, 0x00, 0x00, // flags
    ];
    bytes.extend_from_slice(&sequence.to_be_bytes());
    mp4_box(b"mfhd", &[&bytes])
}

fn traf(base_decode_time: u32, samples: &[Sample]) -> Vec<u8> {
    let mut tfhd = vec![
        0x00, // version 0
        0x00, 0x00, 0x00, // flags
    ];
    tfhd.extend_from_slice(&TRACK_ID.to_be_bytes());
    let tfhd = mp4_box(b"tfhd", &[&tfhd]);

    let mut tfdt = vec![
        0x00, // version 0
        0x00, 0x00, 0x00, // flags
    ];
    tfdt.extend_from_slice(&base_decode_time.to_be_bytes());
    let tfdt = mp4_box(b"tfdt", &[&tfdt]);

    let data_offset = moof_size(samples.len()) + 8;
    let trun = trun(data_offset, samples);
    let sdtp = sdtp(samples);

    mp4_box(b"traf", &[&tfhd, &tfdt, &trun, &sdtp])
}

fn trun(data_offset: u32, samples: &[Sample]) -> Vec<u8> {
    let mut bytes = vec![
        0x00, // version 0
        0x00, 0x0F, 0x01, // flags: data-offset, duration, size, flags, cts
    ];
    bytes.extend_from_slice(&(samples.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&data_offset.to_be_bytes());
    for s in samples {
        bytes.extend_from_slice(&s.duration.to_be_bytes());
        bytes.extend_from_slice(&s.size.to_be_bytes());
        bytes.extend_from_slice(&s.flags());
        bytes.extend_from_slice(&0u32.to_be_bytes()); // cts offset
    }
    mp4_box(b"trun", &[&bytes])
}

fn sdtp(samples: &[Sample]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + samples.len());
    bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // version + flags
    for s in samples {
        bytes.push(s.sdtp_byte());
    }
    mp4_box(b"sdtp", &[&bytes])
}

/// movie data box
fn mdat(data: &[u8]) -> Vec<u8> {
    mp4_box(b"mdat", &[data])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FrameKind;
    use std::sync::Arc;

    fn codec() -> VideoCodecInfo {
        VideoCodecInfo {
            profile: 0x64,
            compatibility: 0,
            level: 0x1F,
            nal_length_size: 4,
            sps: vec![vec![0x67, 0x64, 0x00, 0x1F]],
            pps: vec![vec![0x68, 0xEB, 0xE3]],
            width: 1280,
            height: 720,
        }
    }

    fn frame(pts: u32, keyframe: bool, body: &[u8]) -> Frame {
        let mut payload = vec![0, 0, 0, 1];
        payload.extend_from_slice(body);
        Frame {
            stream_key: Arc::from("cam1"),
            kind: FrameKind::Video,
            pts,
            payload: payload.into(),
            is_keyframe: keyframe,
            codec_tag: 7,
        }
    }

    /// Walk top-level boxes: (type, payload) pairs
    fn boxes(data: &[u8]) -> Vec<([u8; 4], Vec<u8>)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos + 8 <= data.len() {
            let size = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            let box_type: [u8; 4] = data[pos + 4..pos + 8].try_into().unwrap();
            assert!(size >= 8 && pos + size <= data.len(), "bad box size");
            out.push((box_type, data[pos + 8..pos + size].to_vec()));
            pos += size;
        }
        assert_eq!(pos, data.len(), "trailing bytes after last box");
        out
    }

    /// Find a nested box by path, e.g. ["moov", "trak", "mdia"]
    fn find_box(data: &[u8], path: &[&str]) -> Option<Vec<u8>> {
        let mut current = data.to_vec();
        for name in path {
            let target: [u8; 4] = name.as_bytes().try_into().unwrap();
            current = boxes(&current)
                .into_iter()
                .find(|(t, _)| *t == target)?
                .1;
        }
        Some(current)
    }

    #[test]
    fn test_init_segment_is_ftyp_then_moov() {
        let muxer = Fmp4Muxer::new();
        let init = muxer
            .init_segment(&codec(), &frame(0, true, &[0x65, 0x01]))
            .unwrap();

        let top = boxes(&init);
        assert_eq!(top.len(), 2);
        assert_eq!(&top[0].0, b"ftyp");
        assert_eq!(&top[1].0, b"moov");

        // the moov declares a fragmented video track
        let moov_children: Vec<[u8; 4]> =
            boxes(&top[1].1).into_iter().map(|(t, _)| t).collect();
        assert_eq!(moov_children, vec![*b"mvhd", *b"trak", *b"mvex"]);
    }

    #[test]
    fn test_init_segment_carries_parameter_sets() {
        let muxer = Fmp4Muxer::new();
        let codec = codec();
        let init = muxer
            .init_segment(&codec, &frame(0, true, &[0x65, 0x01]))
            .unwrap();

        let avcc = find_box(
            &init,
            &["moov", "trak", "mdia", "minf", "stbl", "stsd"],
        )
        .unwrap();
        // stsd payload: 8 header bytes then the avc1 entry
        let avc1 = &avcc[8..];
        let needle = &codec.sps[0];
        assert!(
            avc1.windows(needle.len()).any(|w| w == &needle[..]),
            "SPS not embedded in sample entry"
        );
    }

    #[test]
    fn test_init_requires_parameter_sets() {
        let muxer = Fmp4Muxer::new();
        let mut bad = codec();
        bad.sps.clear();
        assert_eq!(
            muxer
                .init_segment(&bad, &frame(0, true, &[0x65]))
                .unwrap_err(),
            MuxError::MissingParameterSets
        );
    }

    #[test]
    fn test_media_segment_layout() {
        let muxer = Fmp4Muxer::new();
        let frames = vec![
            frame(0, true, &[0x65, 0xAA]),
            frame(33, false, &[0x41, 0xBB]),
            frame(66, false, &[0x41, 0xCC]),
        ];
        let seg = muxer.media_segment(&frames, 7, 30.0).unwrap();

        let top = boxes(&seg);
        assert_eq!(top.len(), 2);
        assert_eq!(&top[0].0, b"moof");
        assert_eq!(&top[1].0, b"mdat");

        // mdat carries the AVCC repack of every frame, in order
        let mut expected = Vec::new();
        for f in &frames {
            expected.extend_from_slice(&annexb_to_avcc(&f.payload).unwrap());
        }
        assert_eq!(top[1].1, expected);

        // mfhd carries the segment sequence number
        let mfhd = find_box(&seg, &["moof", "mfhd"]).unwrap();
        assert_eq!(&mfhd[4..8], &7u32.to_be_bytes());
    }

    #[test]
    fn test_trun_data_offset_points_at_mdat_payload() {
        let muxer = Fmp4Muxer::new();
        let frames = vec![frame(0, true, &[0x65, 0xAA]), frame(40, false, &[0x41])];
        let seg = muxer.media_segment(&frames, 0, 25.0).unwrap();

        let trun = find_box(&seg, &["moof", "traf", "trun"]).unwrap();
        let data_offset = u32::from_be_bytes(trun[8..12].try_into().unwrap());

        let moof_len = {
            let top = boxes(&seg);
            8 + top[0].1.len() as u32
        };
        assert_eq!(data_offset, moof_len + 8);

        let sample_count = u32::from_be_bytes(trun[4..8].try_into().unwrap());
        assert_eq!(sample_count, 2);
    }

    #[test]
    fn test_sample_durations_from_pts_deltas() {
        let muxer = Fmp4Muxer::new();
        let frames = vec![
            frame(1000, true, &[0x65]),
            frame(1040, false, &[0x41]),
            frame(1080, false, &[0x41]),
        ];
        let seg = muxer.media_segment(&frames, 0, 30.0).unwrap();
        let trun = find_box(&seg, &["moof", "traf", "trun"]).unwrap();

        // entries start after version/flags(4) + count(4) + offset(4)
        let first_duration = u32::from_be_bytes(trun[12..16].try_into().unwrap());
        let second_duration = u32::from_be_bytes(trun[28..32].try_into().unwrap());
        let last_duration = u32::from_be_bytes(trun[44..48].try_into().unwrap());
        assert_eq!(first_duration, 40);
        assert_eq!(second_duration, 40);
        // last sample reuses the previous delta
        assert_eq!(last_duration, 40);

        let tfdt = find_box(&seg, &["moof", "traf", "tfdt"]).unwrap();
        let base = u32::from_be_bytes(tfdt[4..8].try_into().unwrap());
        assert_eq!(base, 1000);
    }

    #[test]
    fn test_empty_segment_rejected() {
        let muxer = Fmp4Muxer::new();
        assert_eq!(
            muxer.media_segment(&[], 0, 30.0).unwrap_err(),
            MuxError::EmptyInput
        );
    }
}
