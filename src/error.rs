//! Error taxonomy for the edge connection core.
//!
//! Every variant here maps to one of the abstract error kinds named in the
//! wire protocol's error registry; [`ErrorCode`] carries the stable 4-byte
//! code that goes out on the wire in an `E` frame.

use std::collections::HashMap;

/// A stable 4-byte error code, part of the domain's error-code registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const UNSUPPORTED_PROTOCOL_VERSION: ErrorCode = ErrorCode(0x_01_00_00_00);
    pub const BINARY_PROTOCOL_ERROR: ErrorCode = ErrorCode(0x_02_00_00_00);
    pub const UNSUPPORTED_FEATURE: ErrorCode = ErrorCode(0x_03_00_00_00);
    pub const TYPE_SPEC_NOT_FOUND: ErrorCode = ErrorCode(0x_04_00_00_00);
    pub const IN_TX_ERROR_REJECTION: ErrorCode = ErrorCode(0x_05_00_00_00);
    pub const COMPILER_ERROR: ErrorCode = ErrorCode(0x_06_00_00_00);
    pub const BACKEND_ERROR: ErrorCode = ErrorCode(0x_07_00_00_00);
    pub const INTERNAL_SERVER_ERROR: ErrorCode = ErrorCode(0x_FF_00_00_00);
}

/// A single `(tag_byte, value)` attribute attached to an error response,
/// per the wire protocol's `E` frame shape.
pub type ErrorAttribute = (u8, String);

/// All possible failures raised while driving a session.
#[derive(thiserror::Error, Debug)]
pub enum EdgeError {
    /// Handshake rejected: only protocol version (1, 0) is accepted.
    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedProtocolVersion { major: u16, minor: u16 },

    /// Framing or semantic violation: empty query, unexpected message type,
    /// unterminated frame, malformed bind arguments.
    #[error("protocol error: {0}")]
    BinaryProtocolError(String),

    /// A feature the session does not implement was requested (named
    /// prepared statements, an unsupported describe mode).
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// `Describe` was sent with no prior `Parse`.
    #[error("no type descriptor available for an anonymous statement")]
    TypeSpecNotFound,

    /// A non-rollback unit was attempted while the view was in `InTxError`.
    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    InTxErrorRejection,

    /// The compiler rejected the statement.
    #[error("{message}")]
    CompilerError {
        message: String,
        attributes: Vec<ErrorAttribute>,
    },

    /// The backend engine reported a failure, already translated into the
    /// domain's error taxonomy via `interpret_backend_error`.
    #[error("{message}")]
    BackendError {
        code: ErrorCode,
        message: String,
        attributes: Vec<ErrorAttribute>,
    },

    /// The backend engine reported a failure that has not yet been
    /// translated by the compiler. Sessions route this through
    /// `interpret_backend_error` before it reaches the client.
    #[error("backend error: {0:?}")]
    RawBackendError(HashMap<u8, String>),

    /// An unrecognized backend transaction status, or any other
    /// unclassified failure.
    #[error("internal server error: {0}")]
    InternalServerError(String),

    /// The connection was closed while a frame was awaited. Terminal: the
    /// session ends without attempting to report this to the client.
    #[error("connection aborted")]
    ConnectionAborted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl EdgeError {
    pub fn malformed_bind_args() -> Self {
        EdgeError::BinaryProtocolError("malformed bind arguments".to_string())
    }

    /// The stable 4-byte code this error surfaces to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            EdgeError::UnsupportedProtocolVersion { .. } => ErrorCode::UNSUPPORTED_PROTOCOL_VERSION,
            EdgeError::BinaryProtocolError(_) => ErrorCode::BINARY_PROTOCOL_ERROR,
            EdgeError::UnsupportedFeature(_) => ErrorCode::UNSUPPORTED_FEATURE,
            EdgeError::TypeSpecNotFound => ErrorCode::TYPE_SPEC_NOT_FOUND,
            EdgeError::InTxErrorRejection => ErrorCode::IN_TX_ERROR_REJECTION,
            EdgeError::CompilerError { .. } => ErrorCode::COMPILER_ERROR,
            EdgeError::BackendError { code, .. } => *code,
            EdgeError::RawBackendError(_) => ErrorCode::BACKEND_ERROR,
            EdgeError::InternalServerError(_) => ErrorCode::INTERNAL_SERVER_ERROR,
            EdgeError::ConnectionAborted => ErrorCode::INTERNAL_SERVER_ERROR,
            EdgeError::Io(_) | EdgeError::Utf8(_) => ErrorCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn attributes(&self) -> Vec<ErrorAttribute> {
        match self {
            EdgeError::CompilerError { attributes, .. } => attributes.clone(),
            EdgeError::BackendError { attributes, .. } => attributes.clone(),
            _ => Vec::new(),
        }
    }
}

/// The fully-resolved shape of an error ready to be written as an `E` frame:
/// a 4-byte code, a human message, and zero or more tagged attributes.
#[derive(Debug, Clone)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
    pub attributes: Vec<ErrorAttribute>,
}

impl From<&EdgeError> for WireError {
    fn from(err: &EdgeError) -> Self {
        WireError {
            code: err.code(),
            message: err.to_string(),
            attributes: err.attributes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_tx_error_rejection_has_stable_code() {
        let err = EdgeError::InTxErrorRejection;
        assert_eq!(err.code(), ErrorCode::IN_TX_ERROR_REJECTION);
    }

    #[test]
    fn backend_error_carries_its_own_code_and_attributes() {
        let err = EdgeError::BackendError {
            code: ErrorCode(0x_07_01_00_00),
            message: "division by zero".into(),
            attributes: vec![(b'H', "hint text".into())],
        };
        let wire = WireError::from(&err);
        assert_eq!(wire.code, ErrorCode(0x_07_01_00_00));
        assert_eq!(wire.attributes, vec![(b'H', "hint text".to_string())]);
    }
}
