//! Error taxonomy surfaced to applications as connection close reasons.

use thiserror::Error;

/// Reason code carried on a close packet and surfaced via the
/// status-changed callback. Mirrors the taxonomy in the error handling
/// design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The application closed the connection itself with no underlying
    /// fault (`AppClose` with an app-supplied code).
    AppDefined(u32),
    InvalidParameter,
    InvalidState,
    Timeout,
    ReplyTimeoutAggregate,
    AuthenticationFailure,
    ProtocolVersion,
    RemoteClose,
    TooManyFragments,
    InternalError,
}

impl CloseReason {
    pub fn code(self) -> u32 {
        match self {
            CloseReason::AppDefined(c) => c,
            CloseReason::InvalidParameter => 1001,
            CloseReason::InvalidState => 1002,
            CloseReason::Timeout => 1003,
            CloseReason::ReplyTimeoutAggregate => 1004,
            CloseReason::AuthenticationFailure => 1005,
            CloseReason::ProtocolVersion => 1006,
            CloseReason::RemoteClose => 1007,
            CloseReason::TooManyFragments => 1008,
            CloseReason::InternalError => 1009,
        }
    }

    pub fn from_wire(code: u32) -> CloseReason {
        match code {
            1001 => CloseReason::InvalidParameter,
            1002 => CloseReason::InvalidState,
            1003 => CloseReason::Timeout,
            1004 => CloseReason::ReplyTimeoutAggregate,
            1005 => CloseReason::AuthenticationFailure,
            1006 => CloseReason::ProtocolVersion,
            1007 => CloseReason::RemoteClose,
            1008 => CloseReason::TooManyFragments,
            1009 => CloseReason::InternalError,
            other => CloseReason::AppDefined(other),
        }
    }
}

/// Library-facing error type. API misuse (bad handles, calls in the wrong
/// state) returns this directly; faults that affect an established
/// connection instead transition it to `ProblemDetectedLocally` with a
/// `CloseReason` and are only observable through the status callback.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid state for this operation: {0}")]
    InvalidState(String),

    #[error("unknown connection handle")]
    UnknownConnection,

    #[error("unknown poll group handle")]
    UnknownPollGroup,

    #[error("unknown listen socket handle")]
    UnknownListenSocket,

    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("incompatible protocol version: peer={peer}, local={local}")]
    ProtocolVersion { peer: u32, local: u32 },

    #[error("message too large: {size} bytes")]
    MessageTooLarge { size: usize },

    #[error("too many unreliable fragments outstanding")]
    TooManyFragments,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, NetError>;
