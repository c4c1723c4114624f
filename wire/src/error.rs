use thiserror::Error;

/// Failure modes for [`crate::codec::Payload::decode`].
///
/// Both variants are silently-dropped conditions at the call site (see
/// `spec.md` §7) — the error type exists so the caller can bump a
/// per-source drop counter rather than to drive any retry logic.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("payload shorter than the 54-byte header, or its length field overruns the buffer")]
    MalformedHeader,
    #[error("unknown message type byte 0x{0:02x}")]
    UnknownType(u8),
}
