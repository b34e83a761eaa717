use thiserror::Error;

/// Error taxonomy shared by every layer built on top of the store.
///
/// Protocol front-ends render these to wire strings at the boundary only
/// (`BAD`/`NO`/`-ERR`/5xx/etc.) — nothing below `pv-proto` ever constructs a
/// protocol-specific string.
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed input: {0}")]
    ProtocolSyntax(String),

    #[error("{0}")]
    Semantic(String),

    #[error("permission denied")]
    Permission,

    #[error("transient failure, retry: {0}")]
    Transient(String),

    #[error("fatal invariant violation: {0}")]
    Fatal(String),

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

impl Error {
    /// Transient SQL errors (serialization failures, connection loss during
    /// a statement) are safe to retry once; everything else is not.
    pub fn retryable(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Sql(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
