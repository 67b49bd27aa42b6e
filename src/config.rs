//! Server configuration
//!
//! All knobs come from environment variables with sensible defaults, so the
//! binary runs with no arguments. Invalid values fall back to the default
//! with a warning instead of aborting startup.

use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;

/// HLS segmentation configuration
#[derive(Debug, Clone, Serialize)]
pub struct SegmentConfig {
    /// Target segment duration in seconds (closing-tick period)
    pub duration_secs: f64,

    /// Number of segments kept in the live playlist window
    pub window_size: usize,

    /// Frame-rate assumed when PTS is unreliable and the publisher sent no
    /// metadata hint
    pub nominal_frame_rate: f64,

    /// Capacity of each subscriber channel, in frames
    pub subscriber_buffer: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            duration_secs: 2.0,
            window_size: 10,
            nominal_frame_rate: 30.0,
            subscriber_buffer: 1024,
        }
    }
}

impl SegmentConfig {
    /// Closing-tick period, floored at 100ms so a bad value can never
    /// produce a spin loop
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.duration_secs.max(0.1))
    }
}

/// Publish-token configuration
#[derive(Debug, Clone, Serialize)]
pub struct TokenConfig {
    /// TTL applied when the issue request does not specify one
    pub default_ttl_secs: u64,

    /// Upper bound any requested TTL is clamped to
    pub max_ttl_secs: u64,

    /// Enforce the publisher-IP hint recorded at issue time
    pub bind_publisher_ip: bool,

    /// Reject publishers that present no token at all
    pub require_token: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            max_ttl_secs: 3600,
            bind_publisher_ip: false,
            require_token: true,
        }
    }
}

/// Admission limits
#[derive(Debug, Clone, Serialize)]
pub struct LimitsConfig {
    /// Maximum concurrently live streams
    pub max_streams: usize,

    /// Maximum subscribers per stream
    pub max_viewers_per_stream: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_streams: 64,
            max_viewers_per_stream: 256,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// HTTP (playback + control) bind address
    pub http_addr: String,

    /// RTMP (ingest) bind address
    pub rtmp_addr: String,

    /// RTMP application name publishers must connect to
    pub rtmp_app: String,

    /// Root directory for segment storage
    pub storage_root: PathBuf,

    /// Segmentation configuration
    pub segment: SegmentConfig,

    /// Token configuration
    pub token: TokenConfig,

    /// Admission limits
    pub limits: LimitsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            rtmp_addr: "0.0.0.0:1935".to_string(),
            rtmp_app: "live".to_string(),
            storage_root: PathBuf::from("./data"),
            segment: SegmentConfig::default(),
            token: TokenConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            http_addr: env_or("HTTP_BIND_ADDR", defaults.http_addr),
            rtmp_addr: env_or("RTMP_BIND_ADDR", defaults.rtmp_addr),
            rtmp_app: env_or("RTMP_APP", defaults.rtmp_app),
            storage_root: PathBuf::from(env_or(
                "STORAGE_ROOT",
                defaults.storage_root.display().to_string(),
            )),
            segment: SegmentConfig {
                duration_secs: env_parse("HLS_SEGMENT_DURATION", defaults.segment.duration_secs),
                window_size: env_parse("HLS_WINDOW_SIZE", defaults.segment.window_size),
                nominal_frame_rate: env_parse(
                    "HLS_NOMINAL_FRAME_RATE",
                    defaults.segment.nominal_frame_rate,
                ),
                subscriber_buffer: env_parse(
                    "SUBSCRIBER_BUFFER",
                    defaults.segment.subscriber_buffer,
                ),
            },
            token: TokenConfig {
                default_ttl_secs: env_parse("TOKEN_DEFAULT_TTL", defaults.token.default_ttl_secs),
                max_ttl_secs: env_parse("TOKEN_MAX_TTL", defaults.token.max_ttl_secs),
                bind_publisher_ip: env_parse("TOKEN_BIND_IP", defaults.token.bind_publisher_ip),
                require_token: env_parse("TOKEN_REQUIRED", defaults.token.require_token),
            },
            limits: LimitsConfig {
                max_streams: env_parse("MAX_STREAMS", defaults.limits.max_streams),
                max_viewers_per_stream: env_parse(
                    "MAX_VIEWERS_PER_STREAM",
                    defaults.limits.max_viewers_per_stream,
                ),
            },
        }
    }

}

fn env_or(key: &str, default: String) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default,
    }
}

fn env_parse<T: FromStr + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, raw, %default, "unparseable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
