//! Unified error types for the RPC channel.
//!
//! A single `Error` enum that every subsystem converts into. Peer-induced
//! failures never surface here as panics: the channel logs them and either
//! answers the peer or tears the connection down, so these values mostly
//! reach callers that misuse the API or feed the crate bad configuration.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    /// A header, envelope or payload could not be encoded or decoded.
    Codec(CodecError),
    /// An envelope exceeds the configured frame cap.
    FrameTooLarge { len: usize, max: usize },
    /// The caller broke the calling convention (e.g. a reply slot on a
    /// streaming method).
    Misuse(&'static str),
    /// Configuration is invalid.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "codec: {e}"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds max {max}")
            }
            Self::Misuse(msg) => write!(f, "misuse: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Codec errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Bytes are present but structurally wrong.
    Malformed(&'static str),
    /// The postcard layer rejected the input.
    Postcard(postcard::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed data: {msg}"),
            Self::Postcard(e) => write!(f, "postcard: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<postcard::Error> for CodecError {
    fn from(e: postcard::Error) -> Self {
        Self::Postcard(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Self::Codec(CodecError::Postcard(e))
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
