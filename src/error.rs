//! Error taxonomy for the call runtime.
//!
//! Each failure mode gets its own plain enum with a hand-written `Display`,
//! mirroring `hotaru_core::connection::error::ConnectionError` rather than
//! reaching for a derive macro: the set of variants is small and stable, and
//! every variant needs its own wording anyway.

use std::fmt;

use crate::status::Code;

/// Malformed wire framing: a bad 5-byte prefix, an absurd length, or a frame
/// truncated at transport teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than 5 bytes were available to parse a frame header.
    HeaderTruncated { available: usize },
    /// The declared payload length does not match what was actually buffered
    /// (only surfaced by callers that assert on `Parser` internals; `feed`
    /// itself never raises this since it waits for more bytes instead).
    LengthMismatch { declared: u32, actual: usize },
    /// The payload is too large to frame (`len > u32::MAX`).
    PayloadTooLarge { len: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderTruncated { available } => {
                write!(f, "frame header truncated: only {available} byte(s) available, need 5")
            }
            Self::LengthMismatch { declared, actual } => {
                write!(f, "frame length mismatch: declared {declared}, actual {actual}")
            }
            Self::PayloadTooLarge { len } => {
                write!(f, "payload of {len} bytes exceeds the 2^32-1 frame length limit")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// A method's `Codec<T>` failed to serialize or deserialize a payload.
#[derive(Debug, Clone)]
pub enum CodecError {
    Decode(String),
    Encode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(msg) => write!(f, "decode error: {msg}"),
            Self::Encode(msg) => write!(f, "encode error: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// The transport is closed, half-closed on the side that's being asked to
/// send, or the peer reset the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// `close()` has already been called on this transport.
    Closed,
    /// The local side of this stream already sent `endOfStream=true`.
    HalfClosed,
    /// No unused stream id remains in this side's partition (id space
    /// exhausted without wraparound support, or the peer never released).
    StreamIdsExhausted,
    /// Operation referenced a stream id that was never allocated, or was
    /// already released.
    UnknownStream { stream_id: u64 },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport is closed"),
            Self::HalfClosed => write!(f, "local side of this stream is half-closed"),
            Self::StreamIdsExhausted => write!(f, "no stream ids available in this side's partition"),
            Self::UnknownStream { stream_id } => write!(f, "unknown stream id {stream_id}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<TransportError> for StatusError {
    fn from(err: TransportError) -> Self {
        StatusError::new(Code::Unavailable, err.to_string())
    }
}

/// An invariant of the protocol was violated: e.g. a data event arrived on
/// the responder side before any metadata event, or the caller observed a
/// trailer before response-initial headers. These indicate a bug in the
/// peer or in this crate, not an application-level failure.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    DataBeforeMetadata { stream_id: u64 },
    TrailerBeforeResponseInitial { stream_id: u64 },
    MultiplePayloadsForUnary { stream_id: u64 },
    MalformedPath { path: String },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataBeforeMetadata { stream_id } => {
                write!(f, "stream {stream_id}: data event observed before any metadata event")
            }
            Self::TrailerBeforeResponseInitial { stream_id } => {
                write!(f, "stream {stream_id}: trailer observed before response-initial metadata")
            }
            Self::MultiplePayloadsForUnary { stream_id } => {
                write!(f, "stream {stream_id}: more than one payload received for a unary call")
            }
            Self::MalformedPath { path } => write!(f, "malformed method path: {path:?}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Registration-time failures: duplicate `service.method` keys, or an
/// attempt to register after the dispatch loop has already started.
#[derive(Debug, Clone)]
pub enum RegistrationError {
    DuplicateMethod { key: String },
    AlreadyStarted,
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateMethod { key } => write!(f, "method {key:?} is already registered"),
            Self::AlreadyStarted => {
                write!(f, "responder has already started dispatching; registry is now immutable")
            }
        }
    }
}

impl std::error::Error for RegistrationError {}

/// The single error type visible to application code on the caller side.
/// Wraps any non-OK trailer, or a local failure translated into the closest
/// matching status code (see the `From` impls below).
#[derive(Debug, Clone)]
pub struct StatusError {
    code: Code,
    message: String,
    details: Option<String>,
}

impl StatusError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {} ({}): {}", self.code as u32, self.code, self.message)
    }
}

impl std::error::Error for StatusError {}

impl From<CodecError> for StatusError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Decode(msg) => StatusError::new(Code::InvalidArgument, msg),
            CodecError::Encode(msg) => StatusError::new(Code::Internal, msg),
        }
    }
}

impl From<FrameError> for StatusError {
    fn from(err: FrameError) -> Self {
        StatusError::new(Code::Internal, err.to_string())
    }
}

impl From<ProtocolError> for StatusError {
    fn from(err: ProtocolError) -> Self {
        StatusError::new(Code::Internal, err.to_string())
    }
}
