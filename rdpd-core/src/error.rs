//! Error types for the RDP protocol engine.
//!
//! Every fallible operation returns `Result<T, RdpError>`. Parsing never
//! panics on hostile input: running out of bytes is a `TruncatedPdu`, a
//! field outside its legal range is a `ProtocolViolation`, and both abort
//! the whole connection.

use thiserror::Error;

/// Shorthand used across the crate.
pub type Result<T> = std::result::Result<T, RdpError>;

/// The canonical error type for the RDP engine.
#[derive(Debug, Error)]
pub enum RdpError {
    // ── Parse Errors ─────────────────────────────────────────────
    /// A declared field needs more bytes than the PDU carries.
    #[error("truncated {what}: need {needed} bytes, {available} available")]
    TruncatedPdu {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    /// A field value is outside its legal range.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Like `ProtocolViolation`, but carries the offending value.
    #[error("invalid {field}: {value:#x}")]
    InvalidField { field: &'static str, value: u64 },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A PDU arrived that the current state does not accept.
    #[error("unexpected {pdu} in state {state}")]
    UnexpectedPdu {
        pdu: &'static str,
        state: &'static str,
    },

    // ── Negotiation Errors ───────────────────────────────────────
    /// Client and server security or encryption method sets are disjoint.
    #[error("negotiation mismatch: {0}")]
    NegotiationMismatch(&'static str),

    /// The client did not provide credentials the server requires.
    #[error("credentials required: {0}")]
    CredentialsRequired(&'static str),

    // ── Crypto Errors ────────────────────────────────────────────
    /// An RSA/RC4/DES3/HMAC primitive failed or a signature did not verify.
    #[error("crypto failure: {0}")]
    CryptoFailure(&'static str),

    // ── Connection Errors ────────────────────────────────────────
    /// The transport reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// The peer ended the session (disconnect ultimatum, X.224 DR, EOF).
    #[error("peer disconnected")]
    Disconnected,

    // ── Configuration Errors ─────────────────────────────────────
    /// Configuration or key material could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RdpError {
    /// Build a `TruncatedPdu` error.
    pub fn truncated(what: &'static str, needed: usize, available: usize) -> Self {
        RdpError::TruncatedPdu {
            what,
            needed,
            available,
        }
    }

    /// Build an `InvalidField` error.
    pub fn invalid(field: &'static str, value: impl Into<u64>) -> Self {
        RdpError::InvalidField {
            field,
            value: value.into(),
        }
    }

    /// Whether this error came from malformed or truncated wire data.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            RdpError::TruncatedPdu { .. }
                | RdpError::ProtocolViolation(_)
                | RdpError::InvalidField { .. }
                | RdpError::UnknownVariant { .. }
        )
    }

    /// Whether the connection must be torn down. Every engine error is:
    /// layer state cannot be resynchronised after a bad PDU.
    pub fn is_fatal(&self) -> bool {
        true
    }

    /// Graceful termination requested by the peer, not a fault.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, RdpError::Disconnected)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RdpError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RdpError::ChannelClosed
    }
}

impl From<toml::de::Error> for RdpError {
    fn from(e: toml::de::Error) -> Self {
        RdpError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = RdpError::truncated("tpkt header", 4, 2);
        let s = e.to_string();
        assert!(s.contains("tpkt header"));
        assert!(s.contains('4'));
        assert!(s.contains('2'));

        let e = RdpError::invalid("per length", 0xC1u8);
        assert!(e.to_string().contains("0xc1"));
    }

    #[test]
    fn parse_error_classification() {
        assert!(RdpError::truncated("x", 1, 0).is_parse_error());
        assert!(RdpError::ProtocolViolation("bad").is_parse_error());
        assert!(!RdpError::Disconnected.is_parse_error());
        assert!(RdpError::Disconnected.is_disconnect());
        assert!(RdpError::ChannelClosed.is_fatal());
    }

    #[tokio::test]
    async fn closed_channel_maps_to_channel_closed() {
        let (tx, rx) = tokio::sync::mpsc::channel::<u8>(1);
        drop(rx);
        let e: RdpError = tx.send(1).await.unwrap_err().into();
        assert!(matches!(e, RdpError::ChannelClosed));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: RdpError = io_err.into();
        assert!(matches!(e, RdpError::Io(_)));
    }
}
