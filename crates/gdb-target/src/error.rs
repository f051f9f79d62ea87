use std::io;
use std::time::Duration;

use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors of the remote serial protocol layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    /// No complete packet arrived within the read timeout.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The remote stub closed the connection.
    #[error("remote closed the connection")]
    Closed,

    /// The remote kept rejecting a packet.
    #[error("packet `{0}` was not acknowledged")]
    NotAcknowledged(String),

    /// A packet checksum did not match its payload.
    #[error("checksum mismatch: expected {expected:#04x}, computed {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    /// A packet or reply could not be parsed.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The remote answered with an `Enn` error reply.
    #[error("remote error {0:#04x}")]
    Remote(u8),

    /// The remote answered with an empty reply to a command it does not implement.
    #[error("remote does not support `{0}`")]
    Unsupported(String),
}

impl Error {
    /// Whether the connection is unusable after this error.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            Error::Io(err) => !matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ),
            Error::Closed | Error::NotAcknowledged(_) => true,
            _ => false,
        }
    }
}
