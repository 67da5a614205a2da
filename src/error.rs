use std::io;

/// Crate-wide error type. Each variant names the failure kind the way
/// callers need to branch on it (see the error-handling table in the
/// design doc); anything that doesn't need its own branch collapses into
/// `Other`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("unsupported cipher method: {0}")]
    UnsupportedMethod(String),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("replayed salt rejected")]
    Replayed,

    #[error("no access user matched on port {0}")]
    NoMatchingUser(u16),

    #[error("user {0} is disabled")]
    UserDisabled(i64),

    #[error("user {user_id} over its tcp connection cap ({limit})")]
    ConnLimit { user_id: i64, limit: u32 },

    #[error("header parse error: {0}")]
    HeaderParse(String),

    #[error("dial to upstream failed: {0}")]
    Dial(String),

    #[error("sync error: {0}")]
    Sync(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}
