use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configured ranges are inconsistent.
    #[error("invalid range configuration: {0}")]
    InvalidRange(String),

    /// A range references a provider that was never registered.
    #[error("range `{range}` references unknown provider `{provider}`")]
    UnknownProvider { range: String, provider: String },

    /// A message could not be encoded or decoded.
    #[error("malformed forwarding message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The peer or a backing provider dropped its connection.
    #[error("forwarding target lost: {0}")]
    TargetLost(String),

    /// A response did not correspond to the outstanding request.
    #[error("unexpected response id {actual}, expected {expected}")]
    UnexpectedResponse { expected: u64, actual: u64 },
}
