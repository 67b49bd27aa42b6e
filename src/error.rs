use thiserror::Error;

/// Main error type for the ingest server
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("RTMP protocol error: {0}")]
    Protocol(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("mux error: {0}")]
    Mux(#[from] MuxError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Publish-token validation failures.
///
/// Surfaced to the RTMP peer as an unauthorized publish status before the
/// connection is closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("token not found")]
    NotFound,

    #[error("token expired")]
    Expired,

    #[error("token already used")]
    AlreadyUsed,

    #[error("token bound to a different stream key")]
    WrongStream,

    #[error("token bound to a different publisher address")]
    WrongAddress,
}

/// Bitstream-level failures from the FLV/AVC parser.
///
/// Frame-level variants drop the offending frame; session-level variants
/// (unsupported codec, malformed config) close the publisher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported video codec id {0}")]
    UnsupportedCodec(u8),

    #[error("malformed AVC decoder configuration: {0}")]
    MalformedConfig(&'static str),

    #[error("NAL length size {0} not in {{1, 2, 4}}")]
    BadNalLengthSize(u8),

    #[error("NAL unit length {declared} overruns remaining {remaining} bytes")]
    TruncatedNalu { declared: usize, remaining: usize },

    #[error("video tag carries no payload")]
    EmptyFrame,

    #[error("video tag shorter than its fixed header")]
    TruncatedTag,
}

/// Muxer failures. A failed segment is discarded and the segmenter moves
/// on; sustained failures stop the stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("no frames to mux")]
    EmptyInput,

    #[error("codec configuration carries no SPS/PPS")]
    MissingParameterSets,

    #[error("malformed Annex-B bitstream: {0}")]
    BadBitstream(&'static str),
}

/// Stream registry admission and lookup failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("stream {0} is already live")]
    AlreadyLive(String),

    #[error("invalid stream key {0:?}")]
    InvalidKey(String),

    #[error("unknown stream {0}")]
    UnknownStream(String),

    #[error("maximum concurrent streams ({0}) reached")]
    TooManyStreams(usize),

    #[error("maximum viewers per stream ({0}) reached")]
    TooManyViewers(usize),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServerError::from(AuthError::AlreadyUsed);
        assert_eq!(err.to_string(), "authentication error: token already used");

        let err = ServerError::from(CodecError::TruncatedNalu {
            declared: 12,
            remaining: 11,
        });
        assert!(err.to_string().contains("overruns"));
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::AlreadyLive("cam1".into());
        assert_eq!(err.to_string(), "stream cam1 is already live");
    }
}
