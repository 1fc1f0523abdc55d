use std::io;
use std::io::ErrorKind;

pub type Result<T> = std::result::Result<T, P2pError>;

/// Error type for the P2P layer.
///
/// The variants matter for control flow: transient I/O errors take a peer
/// offline without touching the manager, protocol violations are fatal to the
/// offending peer only, and everything else terminates the manager.
#[derive(Debug, thiserror::Error)]
pub enum P2pError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("logic error: {0}")]
    Logic(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl P2pError {
    /// Whether this is a transient network error: the remote is unreachable or
    /// hung up, but the local node is healthy. The affected peer is reported
    /// offline and removed; the manager keeps running.
    pub fn is_transient(&self) -> bool {
        match self {
            P2pError::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NetworkDown
                    | ErrorKind::NetworkUnreachable
                    | ErrorKind::HostUnreachable
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Whether this error must terminate the manager. Transient network errors
    /// and protocol violations are handled at the peer level.
    pub fn is_fatal(&self) -> bool {
        match self {
            P2pError::Protocol(_) => false,
            _ => !self.is_transient(),
        }
    }
}

impl From<bytes::TryGetError> for P2pError {
    fn from(e: bytes::TryGetError) -> Self {
        P2pError::Protocol(format!("truncated PDU payload: {}", e))
    }
}
