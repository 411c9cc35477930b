use num_derive::{FromPrimitive, ToPrimitive};

pub type StreamId = u32;
pub type NonZeroStreamId = std::num::NonZeroU32;

/// An ordered header list; pseudo-headers come first, names are lowercase on the wire.
pub type Headers = Vec<(String, String)>;

pub const U31_MAX: u32 = u32::MAX >> 1;

/// https://httpwg.org/specs/rfc7540.html#InitialWindowSize
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
/// https://httpwg.org/specs/rfc7540.html#FrameSize
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_FRAME_SIZE_CEILING: u32 = (1 << 24) - 1;

/// Demand granted to the request queue when the peer declares no concurrent
/// stream limit. Large enough to never bound behavior in practice.
pub const UNBOUNDED_DEMAND: u64 = 2_000_000_000;

/// Connection-level receive window increment sent once the peer acknowledges
/// our settings, so large downloads are not throttled by the 65,535 octet
/// default. Keeps the total comfortably below 2^31 - 1.
pub const CONNECTION_WINDOW_BOOST: u32 = 2_000_000_000;

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorCode {
    /// The associated condition is not a result of an error. For example, a GOAWAY might include this code to indicate graceful shutdown of a connection.
    NoError = 0x0,
    /// The endpoint detected an unspecific protocol error. This error is for use when a more specific error code is not available.
    ProtocolError = 0x1,
    /// The endpoint encountered an unexpected internal error.
    InternalError = 0x2,
    /// The endpoint detected that its peer violated the flow-control protocol.
    FlowControlError = 0x3,
    /// The endpoint sent a SETTINGS frame but did not receive a response in a timely manner.
    SettingsTimeout = 0x4,
    /// The endpoint received a frame after a stream was half-closed.
    StreamClosed = 0x5,
    /// The endpoint received a frame with an invalid size.
    FrameSizeError = 0x6,
    /// The endpoint refused the stream prior to performing any application processing.
    RefusedStream = 0x7,
    /// Used by the endpoint to indicate that the stream is no longer needed.
    Cancel = 0x8,
    /// The endpoint is unable to maintain the header compression context for the connection.
    CompressionError = 0x9,
    /// The connection established in response to a CONNECT request was reset or abnormally closed.
    ConnectError = 0xa,
    /// The endpoint detected that its peer is exhibiting a behavior that might be generating excessive load.
    EnhanceYourCalm = 0xb,
    /// The underlying transport has properties that do not meet minimum security requirements.
    InadequateSecurity = 0xc,
    /// The endpoint requires that HTTP/1.1 be used instead of HTTP/2.
    Http11Required = 0xd,
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u16)]
#[non_exhaustive]
pub enum SettingsParameter {
    /// Maximum size of the header compression table used to decode header blocks, in octets.
    HeaderTableSize = 0x1,
    /// 0 or 1; any other value is a connection error of type PROTOCOL_ERROR.
    EnablePush = 0x2,
    /// Maximum number of concurrent streams that the sender will allow. Initially unlimited.
    MaxConcurrentStreams = 0x3,
    /// The sender's initial window size (in octets) for stream-level flow control.
    InitialWindowSize = 0x4,
    /// Size of the largest frame payload that the sender is willing to receive, in octets.
    MaxFrameSize = 0x5,
    /// Advisory maximum size of header list that the sender is prepared to accept, in octets.
    MaxHeaderListSize = 0x6,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("frame of {length} bytes exceeds the advertised {max} byte limit")]
    Oversized { length: u32, max: u32 },
    #[error("payload length {length} is invalid for {typ:?}")]
    InvalidLength { typ: FrameType, length: usize },
    #[error("payload is shorter than expected")]
    PayloadTooShort,
    #[error("unexpected 0 stream ID")]
    ZeroStreamId,
    #[error("unexpected non-0 stream ID on a connection-scoped frame")]
    UnexpectedStreamId,
    #[error("unexpected 0 window increment")]
    ZeroWindowIncrement,
    #[error("unknown error type: {0}")]
    UnknownErrorType(u32),
    #[error("padding length exceeds the payload")]
    InvalidPadding,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FrameEncodeError {
    #[error("payload of {length} bytes exceeds the peer's {max} byte frame limit")]
    Oversized { length: usize, max: u32 },
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("flow control: {0}")]
    FlowControl(&'static str),
    #[error("stream {id} reset: {error:?}")]
    Stream { id: StreamId, error: ErrorCode },
    #[error("request abandoned by GOAWAY (last stream {last_stream}, {error:?})")]
    CancelledByGoaway { last_stream: StreamId, error: ErrorCode },
    #[error("connection closed")]
    Closed,
    #[error("header compression: {0}")]
    Compression(String),
    #[error("malformed frame: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("{0}")]
    Encode(#[from] FrameEncodeError),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[cfg(feature = "json")]
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Error code carried by the GOAWAY sent when this error tears the
    /// connection down.
    pub fn goaway_code(&self) -> ErrorCode {
        match self {
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::Decode(
                FrameDecodeError::Oversized { .. } | FrameDecodeError::InvalidLength { .. },
            ) => ErrorCode::FrameSizeError,
            _ => ErrorCode::ProtocolError,
        }
    }
}
