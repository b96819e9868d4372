//! Explicit result kinds, replacing the exception-for-control-flow style
//! the code this is ported from used to detect capability differences.
//! Every fallible core operation returns `Outcome<T>` and call sites match
//! on `ErrorKind` exhaustively instead of throwing/catching.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ErrorKind {
    #[error("source not found")]
    SourceNotFound,

    #[error("fingerprint not found")]
    FingerprintNotFound,

    #[error("session unavailable")]
    SessionUnavailable,

    #[error("decode failed for track {0}")]
    DecodeFailed(String),

    #[error("latent backend unavailable")]
    BackendUnavailable,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("deprecated endpoint: {0}")]
    DeprecatedEndpoint(String),

    #[error("shutting down")]
    Shutdown,
}

pub type Outcome<T> = Result<T, ErrorKind>;

impl ErrorKind {
    /// HTTP status code this error kind maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::SourceNotFound => 404,
            ErrorKind::FingerprintNotFound => 404,
            ErrorKind::SessionUnavailable => 503,
            ErrorKind::DecodeFailed(_) => 500,
            ErrorKind::BackendUnavailable => 500,
            ErrorKind::PayloadTooLarge => 413,
            ErrorKind::InvalidArgument(_) => 400,
            ErrorKind::DeprecatedEndpoint(_) => 410,
            ErrorKind::Shutdown => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(ErrorKind::SourceNotFound.status_code(), 404);
        assert_eq!(ErrorKind::SessionUnavailable.status_code(), 503);
        assert_eq!(ErrorKind::PayloadTooLarge.status_code(), 413);
        assert_eq!(ErrorKind::InvalidArgument(String::new()).status_code(), 400);
        assert_eq!(
            ErrorKind::DeprecatedEndpoint(String::new()).status_code(),
            410
        );
    }
}
