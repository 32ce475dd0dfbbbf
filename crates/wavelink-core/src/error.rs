//! Shared error type across wavelink crates.

use thiserror::Error;

/// Client-facing protocol rejection codes (stable wire values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolCode {
    /// The `transport` query value is unknown or disabled.
    UnknownTransport,
    /// The `sid` query value does not name a live session.
    UnknownSid,
    /// A handshake was attempted with a method other than GET.
    BadHandshakeMethod,
    /// Malformed request (bad headers, transport mismatch, overlap).
    BadRequest,
    /// Rejected by the admission hook.
    Forbidden,
}

impl ProtocolCode {
    /// Numeric code carried in the JSON error body.
    pub fn code(self) -> u8 {
        match self {
            ProtocolCode::UnknownTransport => 0,
            ProtocolCode::UnknownSid => 1,
            ProtocolCode::BadHandshakeMethod => 2,
            ProtocolCode::BadRequest => 3,
            ProtocolCode::Forbidden => 4,
        }
    }

    /// Human-readable message carried in the JSON error body.
    pub fn message(self) -> &'static str {
        match self {
            ProtocolCode::UnknownTransport => "Transport unknown",
            ProtocolCode::UnknownSid => "Session ID unknown",
            ProtocolCode::BadHandshakeMethod => "Bad handshake method",
            ProtocolCode::BadRequest => "Bad request",
            ProtocolCode::Forbidden => "Forbidden",
        }
    }

    /// HTTP status used when surfacing the rejection over polling.
    pub fn http_status(self) -> u16 {
        match self {
            ProtocolCode::Forbidden => 403,
            _ => 400,
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, WavelinkError>;

/// Unified error type used by core and gateway.
#[derive(Debug, Error)]
pub enum WavelinkError {
    /// Protocol-level rejection, surfaced to the client as structured JSON.
    #[error("{}", .0.message())]
    Protocol(ProtocolCode),
    /// Malformed wire bytes; fatal for the session that produced them.
    #[error("parse error: {0}")]
    Parse(String),
    /// Decoded polling body exceeded the configured limit.
    #[error("payload too large")]
    PayloadTooLarge,
    /// I/O failure on an active transport.
    #[error("transport error: {0}")]
    Transport(String),
    /// Unexpected internal failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl WavelinkError {
    /// Protocol code for client-facing rejections, if this is one.
    pub fn protocol_code(&self) -> Option<ProtocolCode> {
        match self {
            WavelinkError::Protocol(code) => Some(*code),
            _ => None,
        }
    }

    pub fn bad_request() -> Self {
        WavelinkError::Protocol(ProtocolCode::BadRequest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_codes_are_stable() {
        assert_eq!(ProtocolCode::UnknownTransport.code(), 0);
        assert_eq!(ProtocolCode::UnknownSid.code(), 1);
        assert_eq!(ProtocolCode::BadHandshakeMethod.code(), 2);
        assert_eq!(ProtocolCode::BadRequest.code(), 3);
        assert_eq!(ProtocolCode::Forbidden.code(), 4);
        assert_eq!(ProtocolCode::UnknownSid.message(), "Session ID unknown");
    }

    #[test]
    fn forbidden_maps_to_403() {
        assert_eq!(ProtocolCode::Forbidden.http_status(), 403);
        assert_eq!(ProtocolCode::UnknownSid.http_status(), 400);
    }
}
