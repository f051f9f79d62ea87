use std::path::PathBuf;

use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No symbol with this exact name exists in the binary image.
    #[error("symbol `{symbol}` not found in {image}")]
    SymbolNotFound { image: String, symbol: String },

    /// The configured binary image does not exist.
    #[error("binary image {0} does not exist")]
    BinaryNotFound(PathBuf),

    /// The binary image is not a valid ELF file.
    #[error("failed to parse binary image: {0}")]
    Elf(#[from] elf::ParseError),

    /// The session configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The session configuration could not be decoded.
    #[error("malformed configuration: {0}")]
    ConfigFormat(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Failure reported by the source or destination.
    #[error(transparent)]
    Target(#[from] debuggable::Error),

    #[error(transparent)]
    Forwarding(#[from] memfwd::Error),

    /// The probe control plane failed to reset the target.
    #[error("probe control failed: {0}")]
    Probe(String),

    /// A session can only run once.
    #[error("session already ran")]
    AlreadyRun,
}

impl Error {
    /// Whether this error reports loss of a connection to a target or provider.
    pub fn is_target_lost(&self) -> bool {
        match self {
            Error::Target(err) => err.is_target_lost(),
            Error::Forwarding(memfwd::Error::TargetLost(_)) => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Target(err) if err.is_timeout())
    }
}
