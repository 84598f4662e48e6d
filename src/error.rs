//! Error types for every layer of the signalling stack.
//!
//! Transport and framing errors are session-fatal and lead to a restart.
//! GSM protocol rejections are not Rust errors: they travel as
//! [`RejectCause`] values back over the air while the session continues.

use std::fmt;
use thiserror::Error;

/// Errors produced while splitting or assembling peer frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("primitive {0:#04x} requires a connection id")]
    MissingConnId(u8),

    #[error("no encoder for primitive {0:#04x}")]
    NoEncoder(u8),

    #[error("empty payload for primitive {0:#04x}")]
    EmptyPayload(u8),

    #[error("L3 codec: {0}")]
    Codec(#[from] CodecError),
}

/// Status vocabulary of the external L3 codec.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("message too short")]
    MsgTooShort,
    #[error("unknown protocol discriminator")]
    UnknownProto,
    #[error("parser error")]
    ParserErr,
    #[error("missing parameter")]
    MissingParam,
    #[error("incorrect optional IE")]
    IncorrectOptionalIE,
    #[error("incorrect mandatory IE")]
    IncorrectMandatoryIE,
    #[error("missing mandatory IE")]
    MissingMandatoryIE,
    #[error("unknown message type")]
    UnknownMsgType,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer endpoint closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top level error returned by the engine's public API.
#[derive(Debug, Error)]
pub enum BtsError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("UE store error: {0}")]
    Store(String),

    #[error("radio is not up")]
    RadioNotReady,

    #[error("subscriber '{0}' is offline")]
    Offline(String),

    #[error("transaction slot busy")]
    Busy,

    #[error("unknown channel '{0}'")]
    NoChannel(String),

    #[error("{0}")]
    Failure(String),
}

impl BtsError {
    /// Error string reported back to the call routing collaborator.
    pub fn error_name(&self) -> &'static str {
        match self {
            BtsError::RadioNotReady => "interworking",
            BtsError::Offline(_) => "offline",
            BtsError::Busy => "busy",
            BtsError::NoChannel(_) => "invalid-callref",
            _ => "failure",
        }
    }
}

pub type Result<T> = std::result::Result<T, BtsError>;

/// GSM 04.08 reject causes used by MM and RR replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectCause {
    ServiceNotSupported,
    InvalidIE,
    UnknownMessage,
    UnexpectedMessage,
    ProtocolError,
    /// Any other value supplied by the registration collaborator.
    Other(u8),
}

impl RejectCause {
    pub fn code(self) -> u8 {
        match self {
            RejectCause::ServiceNotSupported => 32,
            RejectCause::InvalidIE => 96,
            RejectCause::UnknownMessage => 97,
            RejectCause::UnexpectedMessage => 98,
            RejectCause::ProtocolError => 111,
            RejectCause::Other(c) => c,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            32 => RejectCause::ServiceNotSupported,
            96 => RejectCause::InvalidIE,
            97 => RejectCause::UnknownMessage,
            98 => RejectCause::UnexpectedMessage,
            111 => RejectCause::ProtocolError,
            c => RejectCause::Other(c),
        }
    }
}

impl fmt::Display for RejectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_cause_codes() {
        assert_eq!(RejectCause::ServiceNotSupported.code(), 32);
        assert_eq!(RejectCause::InvalidIE.code(), 96);
        assert_eq!(RejectCause::UnknownMessage.code(), 97);
        assert_eq!(RejectCause::UnexpectedMessage.code(), 98);
        assert_eq!(RejectCause::ProtocolError.code(), 111);
        assert_eq!(RejectCause::from_code(98), RejectCause::UnexpectedMessage);
        assert_eq!(RejectCause::from_code(17), RejectCause::Other(17));
        assert_eq!(RejectCause::ProtocolError.to_string(), "111");
    }

    #[test]
    fn test_error_names_for_collaborator() {
        assert_eq!(BtsError::RadioNotReady.error_name(), "interworking");
        assert_eq!(BtsError::Offline("IMSI1".into()).error_name(), "offline");
        assert_eq!(BtsError::Busy.error_name(), "busy");
        assert_eq!(BtsError::Failure("x".into()).error_name(), "failure");
    }
}
