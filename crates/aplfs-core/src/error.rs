use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error type shared across the engine.
///
/// Variants carry rendered messages rather than source errors so that values
/// can be cloned across single-flight waiters, which all observe the leader's
/// outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("compile error: {0}")]
    Compile(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("not found")]
    NotFound,
    #[error("read-only filesystem")]
    ReadOnly,
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("json error: {0}")]
    Json(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Io(err.to_string())
    }
}
