use thiserror::Error;

/// Malformed HTTP framing. All variants map to `400 Bad Request` at the
/// server, after which the connection is closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("invalid request line: {0}")]
    InvalidRequestLine(String),

    #[error("unsupported HTTP version: {0}")]
    UnsupportedVersion(String),

    #[error("invalid header line: {0}")]
    InvalidHeader(String),

    #[error("invalid chunk size line: {0}")]
    InvalidChunkSize(String),

    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("header block exceeds {0} bytes")]
    HeadersTooLarge(usize),

    #[error("body exceeds the configured limit of {0} bytes")]
    BodyTooLarge(usize),
}
