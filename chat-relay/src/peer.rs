use std::{
    fmt,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, MutexGuard, watch},
    time::timeout,
};
use tracing::debug;

use crate::{
    error::{RelayError, Result},
    frame::write_line,
};

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Identifier handed out by the registry when a connection is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

impl From<u64> for PeerId {
    fn from(value: u64) -> Self {
        PeerId(value)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Write side of one accepted connection.
///
/// The read half stays with the connection's own task; this half is shared
/// through the registry so other tasks can deliver broadcasts. Writes are
/// serialized by `writer`, so concurrent broadcasts never interleave partial
/// lines. Closing happens once: the writer is shut down and dropped, and
/// anyone waiting in [`PeerConnection::closed`] wakes up.
pub struct PeerConnection {
    id: PeerId,
    remote_addr: String,
    writer: Mutex<Option<BoxedWriter>>,
    closing: AtomicBool,
    close_signal: watch::Sender<bool>,
}

impl PeerConnection {
    pub fn new<W>(id: PeerId, remote_addr: impl ToString, writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        let (close_signal, _) = watch::channel(false);
        Self {
            id,
            remote_addr: remote_addr.to_string(),
            writer: Mutex::new(Some(Box::pin(writer))),
            closing: AtomicBool::new(false),
            close_signal,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Takes the write lock and keeps it until the guard is dropped. Every
    /// other write to this peer, broadcasts included, queues behind it.
    pub async fn hold_writes(&self) -> WriteGuard<'_> {
        WriteGuard {
            peer: self.id,
            writer: self.writer.lock().await,
        }
    }

    /// Writes one line to this peer, waiting for any write already in flight.
    pub async fn send(&self, text: &str) -> Result<()> {
        self.hold_writes().await.send(text).await
    }

    /// Like [`send`](Self::send) but gives up after `limit`, covering the
    /// time spent waiting for the write lock as well.
    pub async fn send_within(&self, text: &str, limit: Duration) -> Result<()> {
        match timeout(limit, self.send(text)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::SendTimeout {
                peer: self.id,
                timeout: limit,
            }),
        }
    }

    /// Shuts the transport down. Safe to call any number of times from any task;
    /// only the first call does anything. Returns whether this call closed it.
    pub async fn close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }

        // Wake the reader first so a write stuck on a dead peer cannot delay it.
        self.close_signal.send_replace(true);

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(err) = writer.shutdown().await {
                debug!(peer = %self.id, error = ?err, "transport shutdown failed");
            }
        }
        true
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut signal = self.close_signal.subscribe();
        // The sender lives as long as `self`, so this only errors if it is dropped.
        let _ = signal.wait_for(|closed| *closed).await;
    }
}

/// Exclusive access to a peer's write half; see [`PeerConnection::hold_writes`].
pub struct WriteGuard<'a> {
    peer: PeerId,
    writer: MutexGuard<'a, Option<BoxedWriter>>,
}

impl WriteGuard<'_> {
    pub async fn send(&mut self, text: &str) -> Result<()> {
        let peer = self.peer;
        let Some(writer) = self.writer.as_mut() else {
            return Err(RelayError::Closed { peer });
        };
        write_line(writer, text)
            .await
            .map_err(|source| RelayError::Send { peer, source })
    }

    pub async fn send_within(&mut self, text: &str, limit: Duration) -> Result<()> {
        let peer = self.peer;
        match timeout(limit, self.send(text)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::SendTimeout {
                peer,
                timeout: limit,
            }),
        }
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
