use thiserror::Error;

/// Errors surfaced by the NADE core entry points.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NadeError {
    #[error("invalid argument: {0}")]
    BadArgument(&'static str),
    #[error("no active session")]
    NoSession,
    #[error("key exchange failed")]
    KeyExchangeFailed,
    #[error("authentication failed")]
    AuthFail,
    #[error("malformed frame")]
    FrameMalformed,
    #[error("uncorrectable codeword")]
    Uncorrectable,
    #[error("system entropy unavailable")]
    EntropyFailure,
}

pub type Result<T> = std::result::Result<T, NadeError>;
