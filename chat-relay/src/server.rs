use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::{JoinError, JoinSet},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::RelayConfig,
    error::{RelayError, Result},
    registry::PeerRegistry,
    relay::Relay,
    session::{SessionContext, handle_connection},
};

/// Pause after an accept failure that is not just one connection going bad,
/// e.g. running out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct RelayServer {
    listener: TcpListener,
    config: RelayConfig,
    registry: Arc<PeerRegistry>,
}

impl RelayServer {
    /// Binds the configured address. Failing here is fatal for the process.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::bind(&addr, source))?;
        Ok(Self::from_listener(listener, config))
    }

    /// Wraps a listener that is already bound; `config.host` and
    /// `config.port` are ignored.
    pub fn from_listener(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            config,
            registry: Arc::new(PeerRegistry::new()),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until `shutdown` resolves or the accept loop hits
    /// a fatal error, then closes every peer and the listener.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer {
            listener,
            config,
            registry,
        } = self;
        let relay = Relay::new(Arc::clone(&registry), config.send_timeout);
        let ctx = Arc::new(SessionContext::new(relay, &config));
        let mut tasks = JoinSet::new();
        let mut failures = AcceptFailures::new(config.max_accept_failures);
        tokio::pin!(shutdown);

        let outcome = loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break Ok(());
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, remote)) => {
                            failures.reset();
                            spawn_peer_handler(&mut tasks, stream, remote, &ctx);
                        }
                        Err(err) => {
                            if let Err(fatal) = handle_accept_error(err, &mut failures).await {
                                error!(error = %fatal, "accept loop stopped");
                                break Err(fatal);
                            }
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_handler_exit(joined);
                }
            }
        };

        close_all_peers(&registry).await;
        drop(listener);
        wait_for_handlers(tasks, config.shutdown_grace).await;
        info!("relay stopped");

        outcome
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_peer_handler(
    tasks: &mut JoinSet<()>,
    stream: TcpStream,
    remote: SocketAddr,
    ctx: &Arc<SessionContext>,
) {
    let ctx = Arc::clone(ctx);
    tasks.spawn(async move {
        // The session already logged why it ended.
        let _ = handle_connection(stream, remote, ctx).await;
    });
}

fn log_handler_exit(joined: std::result::Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(err) if err.is_panic() => error!(error = ?err, "connection task panicked"),
        Err(err) => debug!(error = ?err, "connection task cancelled"),
    }
}

struct AcceptFailures {
    consecutive: u32,
    limit: u32,
}

impl AcceptFailures {
    fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit: limit.max(1),
        }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Counts one failure and reports whether the limit has been reached.
    fn record(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.limit
    }
}

/// Errors that only concern the one connection being accepted.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

async fn handle_accept_error(err: io::Error, failures: &mut AcceptFailures) -> Result<()> {
    let transient = is_transient_accept_error(&err);
    let err = RelayError::Accept(err);
    if transient {
        debug!(error = ?err, "connection dropped before it was accepted");
        return Ok(());
    }

    if failures.record() {
        return Err(RelayError::AcceptLoop {
            failures: failures.consecutive,
            last: Box::new(err),
        });
    }

    warn!(error = ?err, consecutive = failures.consecutive, "failed to accept connection");
    sleep(ACCEPT_BACKOFF).await;
    Ok(())
}

async fn close_all_peers(registry: &PeerRegistry) {
    let peers = registry.drain().await;
    if peers.is_empty() {
        return;
    }

    info!(peers = peers.len(), "closing peer connections");
    join_all(peers.iter().map(|peer| peer.close())).await;
}

async fn wait_for_handlers(mut tasks: JoinSet<()>, grace: Duration) {
    let drained = timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            log_handler_exit(joined);
        }
    })
    .await;

    if drained.is_err() {
        warn!(remaining = tasks.len(), "connection tasks still running after grace period; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}
