use std::{fmt, io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    net::TcpStream,
    select,
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::RelayConfig,
    error::{RelayError, Result},
    frame::{Frame, LineReader},
    peer::{PeerConnection, PeerId},
    relay::Relay,
};

/// Lifecycle of one connection's task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registered,
    Reading,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Registered => "registered",
            SessionState::Reading => "reading",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What every connection task needs from the server, shared between them.
pub struct SessionContext {
    relay: Relay,
    welcome: Option<String>,
    max_line_bytes: usize,
    send_timeout: Duration,
}

impl SessionContext {
    pub fn new(relay: Relay, config: &RelayConfig) -> Self {
        Self {
            relay,
            welcome: config.welcome.clone(),
            max_line_bytes: config.max_line_bytes,
            send_timeout: config.send_timeout,
        }
    }
}

/// Runs one accepted TCP connection until it closes.
pub async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    ctx: Arc<SessionContext>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    serve_peer(reader, writer, remote, ctx).await
}

/// Transport-agnostic body of [`handle_connection`].
///
/// Returns `Ok` when the peer hung up or the server closed it, and the
/// closing error otherwise. Either way the peer is out of the registry and
/// its transport is closed by the time this returns.
pub async fn serve_peer<R, W>(
    reader: R,
    writer: W,
    remote: impl ToString,
    ctx: Arc<SessionContext>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Send + 'static,
{
    let id = ctx.relay.registry().next_id();
    let peer = Arc::new(PeerConnection::new(id, remote, writer));
    let session = Session {
        peer,
        lines: LineReader::new(BufReader::new(reader), ctx.max_line_bytes),
        ctx,
        state: SessionState::Connecting,
    };
    session.run().await
}

struct Session<R> {
    peer: Arc<PeerConnection>,
    lines: LineReader<BufReader<R>>,
    ctx: Arc<SessionContext>,
    state: SessionState,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin,
{
    async fn run(mut self) -> Result<()> {
        let cause = match self.register().await {
            Ok(()) => self.read_until_closed().await,
            Err(err) => err,
        };
        self.close().await;
        self.report(cause)
    }

    fn id(&self) -> PeerId {
        self.peer.id()
    }

    fn transition(&mut self, next: SessionState) {
        trace!(peer = %self.id(), from = %self.state, to = %next, "session state");
        self.state = next;
    }

    async fn register(&mut self) -> Result<()> {
        // Broadcasts can target the peer as soon as it is added; holding its
        // writes until the welcome is out keeps the welcome first.
        let peer = Arc::clone(&self.peer);
        let mut writes = peer.hold_writes().await;

        self.ctx.relay.registry().add(Arc::clone(&peer)).await?;
        self.transition(SessionState::Registered);
        info!(peer = %self.id(), remote = %peer.remote_addr(), "peer connected");

        if let Some(welcome) = &self.ctx.welcome {
            writes.send_within(welcome, self.ctx.send_timeout).await?;
        }
        Ok(())
    }

    /// Reads lines and relays them until something ends the connection,
    /// returning what ended it.
    async fn read_until_closed(&mut self) -> RelayError {
        self.transition(SessionState::Reading);
        let id = self.id();

        loop {
            let frame = select! {
                biased;
                _ = self.peer.closed() => {
                    return RelayError::Receive {
                        peer: id,
                        source: io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed by server"),
                    };
                }
                frame = self.lines.next_frame() => frame,
            };

            match frame {
                Ok(Frame::Line(text)) => {
                    debug!(peer = %id, bytes = text.len(), "relaying message");
                    let report = self.ctx.relay.broadcast(id, &text).await;
                    trace!(peer = %id, delivered = report.delivered, failed = report.failed, "fan-out finished");
                }
                Ok(Frame::TooLong) => {
                    return RelayError::FrameTooLong {
                        peer: id,
                        limit: self.ctx.max_line_bytes,
                    };
                }
                Ok(Frame::Eof) => return RelayError::PeerClosed { peer: id },
                Err(source) => return RelayError::Receive { peer: id, source },
            }
        }
    }

    async fn close(&mut self) {
        // Unregister before closing so nothing is broadcast to a closed transport.
        self.ctx.relay.registry().remove(self.id()).await;
        self.peer.close().await;
        self.transition(SessionState::Closed);
    }

    fn report(&self, cause: RelayError) -> Result<()> {
        let id = self.id();
        let remote = self.peer.remote_addr();
        match cause {
            RelayError::PeerClosed { .. } => {
                info!(peer = %id, remote = %remote, "peer disconnected");
                Ok(())
            }
            RelayError::Receive { ref source, .. }
                if source.kind() == io::ErrorKind::ConnectionAborted =>
            {
                info!(peer = %id, remote = %remote, "peer connection closed");
                Ok(())
            }
            RelayError::RegistryClosed => {
                debug!(peer = %id, remote = %remote, "rejected connection during shutdown");
                Ok(())
            }
            err => {
                warn!(peer = %id, remote = %remote, error = %err, "peer connection failed");
                Err(err)
            }
        }
    }
}
