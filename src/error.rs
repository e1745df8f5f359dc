//! Error types for amqp-gateway.
//!
//! The taxonomy follows the failure domains of a gateway session:
//!
//! - [`DecodeError`] / [`EncodeError`] - malformed method payloads
//! - [`ProtocolError`] - framing and state machine violations (fatal to one connection)
//! - [`LookupError`] - namespace ownership could not be resolved
//! - [`RoutingError`] - the owning broker could not be reached or lost
//!
//! Every kind maps to an AMQP reply code so the client always sees a close
//! reason instead of a silently dropped socket.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::connection::reply_code;
use crate::lookup::BrokerEndpoint;

/// A method payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// No method is registered under this (class, method) pair.
    #[error("unknown method {class_id}/{method_id}")]
    UnknownMethod { class_id: u16, method_id: u16 },

    /// Payload ended before the named field was complete.
    #[error("truncated payload while reading {context}")]
    Truncated { context: &'static str },

    /// Bytes left over after the last schema field.
    #[error("{remaining} trailing bytes after {method}")]
    TrailingBytes {
        method: &'static str,
        remaining: usize,
    },

    /// A short string was not valid UTF-8.
    #[error("invalid UTF-8 in {context}")]
    InvalidUtf8 { context: &'static str },

    /// Field table value with an unknown type tag.
    #[error("unknown field table value tag {tag:#04x}")]
    UnknownFieldTag { tag: u8 },

    /// Method frame payload shorter than the class/method id prefix.
    #[error("method payload shorter than 4 bytes")]
    PayloadTooShort,
}

/// A method instance does not fit its schema or wire widths.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("{method} expects {expected} fields, got {actual}")]
    FieldCount {
        method: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{method}.{field} must be a {expected}")]
    FieldType {
        method: &'static str,
        field: &'static str,
        expected: &'static str,
    },

    #[error("{context} is {len} bytes, wire width allows {max}")]
    ValueTooWide {
        context: &'static str,
        len: usize,
        max: usize,
    },
}

/// Violation of the wire protocol. Always fatal to the offending connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds frame-max {max}")]
    FrameTooLarge { size: u64, max: u32 },

    #[error("frame end marker is {found:#04x}, expected 0xce")]
    FrameCorrupt { found: u8 },

    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    TruncatedFrame { buffered: usize },

    #[error("unsupported protocol header {0:?}")]
    BadProtocolHeader([u8; 8]),

    #[error("heartbeat frame on channel {channel} with {size} byte payload")]
    MalformedHeartbeat { channel: u16, size: usize },

    #[error("method {class_id}/{method_id} not allowed while {state}")]
    UnexpectedMethod {
        state: &'static str,
        class_id: u16,
        method_id: u16,
    },

    #[error("{frame_type} frame not allowed while {state}")]
    UnexpectedFrame {
        state: &'static str,
        frame_type: &'static str,
    },

    #[error("channel {channel} exceeds channel-max {max}")]
    ChannelOutOfRange { channel: u16, max: u16 },

    #[error("channel {0} is already open")]
    ChannelAlreadyOpen(u16),

    #[error("channel {0} is not open")]
    ChannelNotOpen(u16),

    #[error("class {class_id} methods are not allowed on channel {channel}")]
    InvalidChannel { class_id: u16, channel: u16 },

    #[error("unsupported SASL mechanism {0:?}")]
    UnsupportedMechanism(String),

    #[error("tune-ok {field} {requested} exceeds server limit {limit}")]
    TuneRejected {
        field: &'static str,
        requested: u32,
        limit: u32,
    },

    #[error("missed heartbeats from client, silent for {silent_for:?}")]
    HeartbeatTimeout { silent_for: Duration },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl ProtocolError {
    /// AMQP reply code sent to the client when this error closes the connection.
    pub fn reply_code(&self) -> u16 {
        match self {
            ProtocolError::FrameTooLarge { .. }
            | ProtocolError::FrameCorrupt { .. }
            | ProtocolError::UnknownFrameType(_)
            | ProtocolError::TruncatedFrame { .. }
            | ProtocolError::MalformedHeartbeat { .. } => reply_code::FRAME_ERROR,
            ProtocolError::BadProtocolHeader(_) => reply_code::FRAME_ERROR,
            ProtocolError::UnexpectedMethod { .. } | ProtocolError::UnexpectedFrame { .. } => {
                reply_code::UNEXPECTED_FRAME
            }
            ProtocolError::ChannelOutOfRange { .. }
            | ProtocolError::ChannelAlreadyOpen(_)
            | ProtocolError::ChannelNotOpen(_) => reply_code::CHANNEL_ERROR,
            ProtocolError::InvalidChannel { .. } => reply_code::COMMAND_INVALID,
            ProtocolError::UnsupportedMechanism(_) => reply_code::ACCESS_REFUSED,
            ProtocolError::TuneRejected { .. } => reply_code::NOT_ALLOWED,
            ProtocolError::HeartbeatTimeout { .. } => reply_code::CONNECTION_FORCED,
            ProtocolError::Decode(DecodeError::UnknownMethod { .. }) => {
                reply_code::NOT_IMPLEMENTED
            }
            ProtocolError::Decode(_) => reply_code::SYNTAX_ERROR,
            ProtocolError::Encode(_) => reply_code::INTERNAL_ERROR,
        }
    }
}

/// Namespace ownership could not be resolved.
///
/// `Clone` so every waiter of a shared lookup receives the same failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// Some step of the lookup chain came back empty.
    #[error("failed to find broker for namespace {namespace}: {reason}")]
    BrokerNotFound { namespace: String, reason: String },

    /// The coordination service itself failed.
    #[error("coordination query for namespace {namespace} failed: {message}")]
    TransportFailure { namespace: String, message: String },

    #[error("lookup for namespace {namespace} timed out after {after:?}")]
    Timeout { namespace: String, after: Duration },

    /// The broker advertised an endpoint that cannot be parsed.
    #[error("namespace {namespace} owner advertised unusable endpoint {advertisement:?}")]
    InvalidAdvertisement {
        namespace: String,
        advertisement: String,
    },
}

impl LookupError {
    /// Namespace the failed lookup was for.
    pub fn namespace(&self) -> &str {
        match self {
            LookupError::BrokerNotFound { namespace, .. }
            | LookupError::TransportFailure { namespace, .. }
            | LookupError::Timeout { namespace, .. }
            | LookupError::InvalidAdvertisement { namespace, .. } => namespace,
        }
    }

    /// Whether querying again can plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LookupError::TransportFailure { .. } | LookupError::Timeout { .. }
        )
    }
}

/// Failure reported by a coordination backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CoordinationError(pub String);

/// The session could not be attached to (or lost) its owning broker.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("failed to connect to broker {endpoint}: {source}")]
    Connect {
        endpoint: BrokerEndpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("connecting to broker {endpoint} timed out after {after:?}")]
    ConnectTimeout {
        endpoint: BrokerEndpoint,
        after: Duration,
    },

    #[error("handshake with broker {endpoint} failed: {reason}")]
    Handshake {
        endpoint: BrokerEndpoint,
        reason: String,
    },

    /// The broker closed the connection while we were opening the namespace.
    #[error("broker {endpoint} rejected the session: {code} {text}")]
    Rejected {
        endpoint: BrokerEndpoint,
        code: u16,
        text: String,
    },

    #[error("giving up on namespace {namespace} after {attempts} attempts: {last}")]
    Exhausted {
        namespace: String,
        attempts: u32,
        #[source]
        last: Box<RoutingError>,
    },

    #[error("lost connection to broker for namespace {namespace}")]
    UpstreamLost { namespace: String },
}

impl RoutingError {
    /// AMQP reply code sent to the client when routing gives up.
    pub fn reply_code(&self) -> u16 {
        match self {
            RoutingError::Lookup(_) => reply_code::INTERNAL_ERROR,
            RoutingError::Exhausted { last, .. } => last.reply_code(),
            RoutingError::Rejected {
                code: reply_code::ACCESS_REFUSED,
                ..
            } => reply_code::ACCESS_REFUSED,
            _ => reply_code::CONNECTION_FORCED,
        }
    }

    /// Whether another attempt (after invalidating ownership) can succeed.
    ///
    /// A broker refusing the credentials will refuse them again.
    pub fn is_retriable(&self) -> bool {
        match self {
            RoutingError::Lookup(err) => err.is_retriable(),
            RoutingError::Connect { .. }
            | RoutingError::ConnectTimeout { .. }
            | RoutingError::Handshake { .. } => true,
            RoutingError::Rejected { code, .. } => *code != reply_code::ACCESS_REFUSED,
            RoutingError::Exhausted { .. } | RoutingError::UpstreamLost { .. } => false,
        }
    }
}

/// Invalid gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Method registry misconfiguration, detected at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("method {class_id}/{method_id} registered twice")]
    Duplicate { class_id: u16, method_id: u16 },
}

/// Main error type for gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// I/O error on a client or broker socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Client did not complete a handshake step in time.
    #[error("client {peer} handshake timed out after {after:?}")]
    HandshakeTimeout { peer: SocketAddr, after: Duration },

    /// Peer closed the connection unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl From<DecodeError> for GatewayError {
    fn from(err: DecodeError) -> Self {
        GatewayError::Protocol(ProtocolError::Decode(err))
    }
}

impl From<EncodeError> for GatewayError {
    fn from(err: EncodeError) -> Self {
        GatewayError::Protocol(ProtocolError::Encode(err))
    }
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;
