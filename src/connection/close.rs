//! Reply codes and close reasons.

use crate::error::{DecodeError, LookupError, ProtocolError, RoutingError};
use crate::method::MethodInstance;

/// AMQP reply codes used by the gateway.
pub mod reply_code {
    pub const REPLY_SUCCESS: u16 = 200;
    pub const CONNECTION_FORCED: u16 = 320;
    pub const ACCESS_REFUSED: u16 = 403;
    pub const FRAME_ERROR: u16 = 501;
    pub const SYNTAX_ERROR: u16 = 502;
    pub const COMMAND_INVALID: u16 = 503;
    pub const CHANNEL_ERROR: u16 = 504;
    pub const UNEXPECTED_FRAME: u16 = 505;
    pub const NOT_ALLOWED: u16 = 530;
    pub const NOT_IMPLEMENTED: u16 = 540;
    pub const INTERNAL_ERROR: u16 = 541;

    /// Symbolic name used as the reply-text prefix.
    pub fn name(code: u16) -> &'static str {
        match code {
            REPLY_SUCCESS => "REPLY_SUCCESS",
            CONNECTION_FORCED => "CONNECTION_FORCED",
            ACCESS_REFUSED => "ACCESS_REFUSED",
            FRAME_ERROR => "FRAME_ERROR",
            SYNTAX_ERROR => "SYNTAX_ERROR",
            COMMAND_INVALID => "COMMAND_INVALID",
            CHANNEL_ERROR => "CHANNEL_ERROR",
            UNEXPECTED_FRAME => "UNEXPECTED_FRAME",
            NOT_ALLOWED => "NOT_ALLOWED",
            NOT_IMPLEMENTED => "NOT_IMPLEMENTED",
            INTERNAL_ERROR => "INTERNAL_ERROR",
            _ => "UNKNOWN",
        }
    }
}

/// Why a connection is being closed, as sent in `connection.close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub text: String,
    /// Class and method of the offending method, `(0, 0)` when none.
    pub failing: (u16, u16),
}

impl CloseReason {
    pub fn new(code: u16, message: impl std::fmt::Display) -> Self {
        Self {
            code,
            text: format!("{} - {}", reply_code::name(code), message),
            failing: (0, 0),
        }
    }

    pub fn with_failing(mut self, class_id: u16, method_id: u16) -> Self {
        self.failing = (class_id, method_id);
        self
    }

    pub fn to_method(&self) -> MethodInstance {
        MethodInstance::connection_close(self.code, &self.text, self.failing)
    }
}

impl From<&ProtocolError> for CloseReason {
    fn from(err: &ProtocolError) -> Self {
        let reason = CloseReason::new(err.reply_code(), err);
        match err {
            ProtocolError::UnexpectedMethod {
                class_id,
                method_id,
                ..
            }
            | ProtocolError::Decode(DecodeError::UnknownMethod {
                class_id,
                method_id,
            }) => reason.with_failing(*class_id, *method_id),
            _ => reason,
        }
    }
}

impl From<&RoutingError> for CloseReason {
    fn from(err: &RoutingError) -> Self {
        CloseReason::new(err.reply_code(), err)
    }
}

impl From<&LookupError> for CloseReason {
    fn from(err: &LookupError) -> Self {
        CloseReason::new(reply_code::INTERNAL_ERROR, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_method_close() {
        let err = ProtocolError::from(DecodeError::UnknownMethod {
            class_id: 10,
            method_id: 99,
        });
        let reason = CloseReason::from(&err);
        assert_eq!(reason.code, reply_code::NOT_IMPLEMENTED);
        assert_eq!(reason.failing, (10, 99));
        assert_eq!(reason.text, "NOT_IMPLEMENTED - unknown method 10/99");

        let close = reason.to_method();
        assert_eq!(close.short("reply-code"), Some(540));
        assert_eq!(close.short("class-id"), Some(10));
        assert_eq!(close.short("method-id"), Some(99));
    }

    #[test]
    fn test_lookup_failure_is_internal_error() {
        let err = LookupError::BrokerNotFound {
            namespace: "missing-ns".into(),
            reason: "no bundle descriptor".into(),
        };
        let reason = CloseReason::from(&err);
        assert_eq!(reason.code, reply_code::INTERNAL_ERROR);
        assert!(reason.text.contains("missing-ns"));
    }
}
