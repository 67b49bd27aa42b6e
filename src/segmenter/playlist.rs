//! Live playlist state and HLS media playlist text
//!
//! The playlist is a pure function of the current window: regenerating it
//! from the segment list always yields the same text. `#EXT-X-ENDLIST` only
//! appears after the publishing session has ended.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// One closed media segment in the live window
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    /// Monotonic sequence number, starting at 0 each publishing session
    pub sequence: u64,
    /// Seconds, never zero or negative
    pub duration: f64,
    /// Storage path of the segment bytes
    pub path: String,
    /// URI as referenced from the playlist
    pub uri: String,
    pub byte_size: usize,
    pub created_at: DateTime<Utc>,
}

/// Sliding-window playlist for one stream
#[derive(Debug)]
pub struct PlaylistState {
    segments: VecDeque<SegmentRecord>,
    window_size: usize,
    pub next_sequence: u64,
    pub has_init: bool,
    pub ended: bool,
}

impl PlaylistState {
    pub fn new(window_size: usize) -> Self {
        Self {
            segments: VecDeque::with_capacity(window_size + 1),
            window_size: window_size.max(1),
            next_sequence: 0,
            has_init: false,
            ended: false,
        }
    }

    /// Append a closed segment; returns the evicted record once the window
    /// overflows.
    pub fn push(&mut self, segment: SegmentRecord) -> Option<SegmentRecord> {
        self.segments.push_back(segment);
        if self.segments.len() > self.window_size {
            self.segments.pop_front()
        } else {
            None
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentRecord> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Sequence number of the oldest segment in the window, 0 when empty
    pub fn media_sequence(&self) -> u64 {
        self.segments.front().map(|s| s.sequence).unwrap_or(0)
    }

    /// Ceiling of the longest segment duration in the window, at least 1
    pub fn target_duration(&self) -> u64 {
        let max = self
            .segments
            .iter()
            .map(|s| s.duration)
            .fold(0.0f64, f64::max);
        (max.ceil() as u64).max(1)
    }

    /// Look up a windowed segment by sequence number
    pub fn get(&self, sequence: u64) -> Option<&SegmentRecord> {
        self.segments.iter().find(|s| s.sequence == sequence)
    }

    /// Render the HLS media playlist text
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:7\n");
        out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", self.target_duration()));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", self.media_sequence()));
        if self.has_init {
            out.push_str("#EXT-X-MAP:URI=\"init.mp4\"\n");
        }
        for segment in &self.segments {
            out.push_str(&format!("#EXTINF:{:.3},\n", segment.duration));
            out.push_str(&segment.uri);
            out.push('\n');
        }
        if self.ended {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }
}

/// Parsed view of a media playlist, used to verify render round-trips
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPlaylist {
    pub version: u32,
    pub target_duration: u64,
    pub media_sequence: u64,
    pub init_uri: Option<String>,
    pub segments: Vec<(f64, String)>,
    pub ended: bool,
}

/// Parse an HLS media playlist back into its segment list
pub fn parse_media_playlist(text: &str) -> Option<ParsedPlaylist> {
    let mut lines = text.lines();
    if lines.next()? != "#EXTM3U" {
        return None;
    }

    let mut parsed = ParsedPlaylist {
        version: 0,
        target_duration: 0,
        media_sequence: 0,
        init_uri: None,
        segments: Vec::new(),
        ended: false,
    };
    let mut pending_duration: Option<f64> = None;

    for line in lines {
        if let Some(v) = line.strip_prefix("#EXT-X-VERSION:") {
            parsed.version = v.parse().ok()?;
        } else if let Some(v) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            parsed.target_duration = v.parse().ok()?;
        } else if let Some(v) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            parsed.media_sequence = v.parse().ok()?;
        } else if let Some(v) = line.strip_prefix("#EXT-X-MAP:URI=") {
            parsed.init_uri = Some(v.trim_matches('"').to_string());
        } else if let Some(v) = line.strip_prefix("#EXTINF:") {
            let duration = v.trim_end_matches(',').parse().ok()?;
            pending_duration = Some(duration);
        } else if line == "#EXT-X-ENDLIST" {
            parsed.ended = true;
        } else if !line.starts_with('#') && !line.is_empty() {
            parsed
                .segments
                .push((pending_duration.take()?, line.to_string()));
        }
    }
    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sequence: u64, duration: f64) -> SegmentRecord {
        SegmentRecord {
            sequence,
            duration,
            path: format!("cam1/segment_{sequence}.m4s"),
            uri: format!("segment_{sequence}.m4s"),
            byte_size: 1000,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_window_eviction() {
        let mut playlist = PlaylistState::new(3);
        for seq in 0..5 {
            let evicted = playlist.push(record(seq, 2.0));
            match seq {
                0..=2 => assert!(evicted.is_none()),
                _ => assert_eq!(evicted.unwrap().sequence, seq - 3),
            }
        }
        assert_eq!(playlist.len(), 3);
        assert_eq!(playlist.media_sequence(), 2);
    }

    #[test]
    fn test_target_duration_covers_every_segment() {
        let mut playlist = PlaylistState::new(5);
        let _ = playlist.push(record(0, 1.96));
        let _ = playlist.push(record(1, 2.4));
        let _ = playlist.push(record(2, 2.0));
        assert_eq!(playlist.target_duration(), 3);
    }

    #[test]
    fn test_empty_playlist_defaults() {
        let playlist = PlaylistState::new(5);
        assert_eq!(playlist.media_sequence(), 0);
        assert_eq!(playlist.target_duration(), 1);
        assert!(playlist.is_empty());
    }

    #[test]
    fn test_render_live_has_no_endlist() {
        let mut playlist = PlaylistState::new(5);
        playlist.has_init = true;
        let _ = playlist.push(record(8, 2.0));
        let _ = playlist.push(record(9, 1.967));

        let text = playlist.render();
        assert!(text.starts_with("#EXTM3U\n#EXT-X-VERSION:7\n"));
        assert!(text.contains("#EXT-X-TARGETDURATION:2\n"));
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:8\n"));
        assert!(text.contains("#EXT-X-MAP:URI=\"init.mp4\"\n"));
        assert!(text.contains("#EXTINF:2.000,\nsegment_8.m4s\n"));
        assert!(text.contains("#EXTINF:1.967,\nsegment_9.m4s\n"));
        assert!(!text.contains("#EXT-X-ENDLIST"));

        playlist.ended = true;
        assert!(playlist.render().ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn test_render_parse_roundtrip() {
        let mut playlist = PlaylistState::new(4);
        playlist.has_init = true;
        for seq in 3..7 {
            let _ = playlist.push(record(seq, 2.0 + seq as f64 / 100.0));
        }

        let parsed = parse_media_playlist(&playlist.render()).unwrap();
        assert_eq!(parsed.version, 7);
        assert_eq!(parsed.media_sequence, 3);
        assert_eq!(parsed.init_uri.as_deref(), Some("init.mp4"));
        assert_eq!(parsed.segments.len(), 4);
        for (i, (duration, uri)) in parsed.segments.iter().enumerate() {
            let seq = i as u64 + 3;
            assert_eq!(uri, &format!("segment_{seq}.m4s"));
            assert!((duration - (2.0 + seq as f64 / 100.0)).abs() < 0.001);
        }
        assert!(!parsed.ended);
    }

    #[test]
    fn test_parse_rejects_non_playlist() {
        assert!(parse_media_playlist("hello\nworld").is_none());
    }
}
