use std::{io, time::Duration};

use thiserror::Error;

use crate::peer::PeerId;

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Everything that can go wrong inside the relay.
///
/// Only [`RelayError::Bind`] and [`RelayError::AcceptLoop`] ever escape the
/// server; the per-connection variants are logged by the task that owns the
/// connection and stop there.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection")]
    Accept(#[source] io::Error),

    #[error("accept loop gave up after {failures} consecutive failures")]
    AcceptLoop {
        failures: u32,
        #[source]
        last: Box<RelayError>,
    },

    #[error("failed to receive from peer {peer}")]
    Receive {
        peer: PeerId,
        #[source]
        source: io::Error,
    },

    #[error("peer {peer} sent a line longer than {limit} bytes")]
    FrameTooLong { peer: PeerId, limit: usize },

    #[error("peer {peer} closed the connection")]
    PeerClosed { peer: PeerId },

    #[error("failed to send to peer {peer}")]
    Send {
        peer: PeerId,
        #[source]
        source: io::Error,
    },

    #[error("send to peer {peer} timed out after {timeout:?}")]
    SendTimeout { peer: PeerId, timeout: Duration },

    #[error("connection to peer {peer} is already closed")]
    Closed { peer: PeerId },

    #[error("registry is closed to new peers")]
    RegistryClosed,
}

impl RelayError {
    pub fn bind(addr: impl ToString, source: io::Error) -> Self {
        RelayError::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// True for the errors that mean the remote side simply went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            RelayError::PeerClosed { .. } | RelayError::Closed { .. } => true,
            RelayError::Receive { source, .. } | RelayError::Send { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
