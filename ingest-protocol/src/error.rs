//! Result codes shared by every public operation
//!
//! Each variant has a stable numeric value so that status reports and
//! reject packets can carry them on the wire. Success is `Result::Ok`,
//! reported as `0` by [`code_of`].

use thiserror::Error;

/// Public result code
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    #[error("context not initialized")]
    NotInitialized,

    #[error("context already initialized")]
    AlreadyInitialized,

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("reconnecting")]
    Reconnecting,

    #[error("operation failed")]
    Failed,

    #[error("test failed")]
    TestFailed,

    #[error("not ready")]
    NotReady,

    #[error("not supported")]
    NotSupported,

    #[error("timed out")]
    Timeout,

    #[error("authorization failed")]
    AuthorizationFailed,

    #[error("licensing failed")]
    LicensingFailed,

    #[error("network error")]
    NetworkError,

    #[error("protocol version mismatch")]
    VersionMismatch,

    #[error("server full")]
    ServerFull,

    #[error("certificate error")]
    CertificateError,

    #[error("end of file")]
    EndOfFile,
}

impl ErrorCode {
    /// Stable numeric value (success is 0)
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::NotInitialized => 1,
            ErrorCode::AlreadyInitialized => 2,
            ErrorCode::InvalidParameter => 3,
            ErrorCode::AlreadyConnected => 4,
            ErrorCode::NotConnected => 5,
            ErrorCode::Reconnecting => 6,
            ErrorCode::Failed => 7,
            ErrorCode::TestFailed => 8,
            ErrorCode::NotReady => 9,
            ErrorCode::NotSupported => 10,
            ErrorCode::Timeout => 11,
            ErrorCode::AuthorizationFailed => 12,
            ErrorCode::LicensingFailed => 13,
            ErrorCode::NetworkError => 14,
            ErrorCode::VersionMismatch => 15,
            ErrorCode::ServerFull => 16,
            ErrorCode::CertificateError => 17,
            ErrorCode::EndOfFile => 18,
        }
    }

    /// Inverse of [`ErrorCode::code`]; `0` and unknown values give `None`
    pub fn from_code(code: u32) -> Option<Self> {
        let code = match code {
            1 => ErrorCode::NotInitialized,
            2 => ErrorCode::AlreadyInitialized,
            3 => ErrorCode::InvalidParameter,
            4 => ErrorCode::AlreadyConnected,
            5 => ErrorCode::NotConnected,
            6 => ErrorCode::Reconnecting,
            7 => ErrorCode::Failed,
            8 => ErrorCode::TestFailed,
            9 => ErrorCode::NotReady,
            10 => ErrorCode::NotSupported,
            11 => ErrorCode::Timeout,
            12 => ErrorCode::AuthorizationFailed,
            13 => ErrorCode::LicensingFailed,
            14 => ErrorCode::NetworkError,
            15 => ErrorCode::VersionMismatch,
            16 => ErrorCode::ServerFull,
            17 => ErrorCode::CertificateError,
            18 => ErrorCode::EndOfFile,
            _ => return None,
        };
        Some(code)
    }

    /// Failures that end a connect attempt without automatic reconnection
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorCode::AuthorizationFailed
                | ErrorCode::LicensingFailed
                | ErrorCode::CertificateError
                | ErrorCode::VersionMismatch
                | ErrorCode::ServerFull
        )
    }
}

/// Numeric code of an operation result
pub fn code_of<T>(result: &Result<T, ErrorCode>) -> u32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in 1..=18 {
            let err = ErrorCode::from_code(code).unwrap();
            assert_eq!(err.code(), code);
        }
        assert_eq!(ErrorCode::from_code(0), None);
        assert_eq!(ErrorCode::from_code(99), None);
    }

    #[test]
    fn test_terminal_classification() {
        assert!(ErrorCode::AuthorizationFailed.is_terminal());
        assert!(ErrorCode::VersionMismatch.is_terminal());
        assert!(!ErrorCode::NetworkError.is_terminal());
        assert!(!ErrorCode::Timeout.is_terminal());
    }

    #[test]
    fn test_code_of() {
        let ok: Result<(), ErrorCode> = Ok(());
        assert_eq!(code_of(&ok), 0);
        assert_eq!(code_of::<()>(&Err(ErrorCode::NotReady)), 9);
    }
}
