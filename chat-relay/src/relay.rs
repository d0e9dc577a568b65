use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::{
    peer::{PeerConnection, PeerId},
    registry::PeerRegistry,
};

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Fans a message out to every registered peer except its sender.
#[derive(Clone)]
pub struct Relay {
    registry: Arc<PeerRegistry>,
    send_timeout: Duration,
}

impl Relay {
    pub fn new(registry: Arc<PeerRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Sends `text` to everyone but `sender`, all targets concurrently.
    ///
    /// A target that fails or times out is dropped from the registry and
    /// closed; the rest still get the message.
    pub async fn broadcast(&self, sender: PeerId, text: &str) -> BroadcastReport {
        let targets: Vec<Arc<PeerConnection>> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|peer| peer.id() != sender)
            .collect();

        let sends = targets.iter().map(|peer| async move {
            let result = peer.send_within(text, self.send_timeout).await;
            (peer, result)
        });

        let mut report = BroadcastReport::default();
        for (peer, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    if err.is_disconnect() {
                        debug!(from = %sender, to = %peer.id(), error = %err, "skipping departed peer");
                    } else {
                        warn!(from = %sender, to = %peer.id(), error = %err, "failed to relay message");
                    }
                    self.evict(peer).await;
                }
            }
        }

        report
    }

    async fn evict(&self, peer: &PeerConnection) {
        // The peer's own task may be removing it concurrently; both paths are idempotent.
        self.registry.remove(peer.id()).await;
        peer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncBufReadExt, BufReader, DuplexStream},
        time::timeout,
    };

    use super::*;

    async fn register(registry: &PeerRegistry) -> (Arc<PeerConnection>, BufReader<DuplexStream>) {
        let (writer, reader) = tokio::io::duplex(256);
        let peer = Arc::new(PeerConnection::new(registry.next_id(), "test", writer));
        registry.add(Arc::clone(&peer)).await.expect("register");
        (peer, BufReader::new(reader))
    }

    async fn next_line(reader: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(1), reader.read_line(&mut line))
            .await
            .expect("line arrived in time")
            .expect("read line");
        line
    }

    #[tokio::test]
    async fn sender_is_excluded_from_fan_out() {
        let registry = Arc::new(PeerRegistry::new());
        let relay = Relay::new(Arc::clone(&registry), Duration::from_secs(1));
        let (alice, mut alice_rx) = register(&registry).await;
        let (_bob, mut bob_rx) = register(&registry).await;
        let (_carol, mut carol_rx) = register(&registry).await;

        let report = relay.broadcast(alice.id(), "A: hello").await;

        assert_eq!(report, BroadcastReport { delivered: 2, failed: 0 });
        assert_eq!(next_line(&mut bob_rx).await, "A: hello\n");
        assert_eq!(next_line(&mut carol_rx).await, "A: hello\n");

        let mut line = String::new();
        let nothing = timeout(Duration::from_millis(50), alice_rx.read_line(&mut line)).await;
        assert!(nothing.is_err(), "sender received its own message: {line:?}");
    }

    #[tokio::test]
    async fn failed_target_is_evicted_and_others_still_receive() {
        let registry = Arc::new(PeerRegistry::new());
        let relay = Relay::new(Arc::clone(&registry), Duration::from_secs(1));
        let (alice, _alice_rx) = register(&registry).await;
        let (bob, bob_rx) = register(&registry).await;
        let (_carol, mut carol_rx) = register(&registry).await;

        // Bob's far end goes away after he was registered.
        drop(bob_rx);

        let report = relay.broadcast(alice.id(), "A: still here?").await;

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert_eq!(next_line(&mut carol_rx).await, "A: still here?\n");
        assert!(!registry.contains(bob.id()).await);
        assert!(bob.is_closed());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn closed_but_still_registered_peer_fails_harmlessly() {
        let registry = Arc::new(PeerRegistry::new());
        let relay = Relay::new(Arc::clone(&registry), Duration::from_secs(1));
        let (alice, _alice_rx) = register(&registry).await;
        let (bob, _bob_rx) = register(&registry).await;
        let (_carol, mut carol_rx) = register(&registry).await;

        // Bob's own task closes him without having removed him yet.
        bob.close().await;

        let report = relay.broadcast(alice.id(), "A: race").await;

        assert_eq!(report.failed, 1);
        assert_eq!(next_line(&mut carol_rx).await, "A: race\n");
        assert!(!registry.contains(bob.id()).await);

        // The handler's own removal afterwards is still fine.
        assert!(registry.remove(bob.id()).await.is_none());
    }

    #[tokio::test]
    async fn stalled_target_does_not_hold_up_the_rest() {
        let registry = Arc::new(PeerRegistry::new());
        let relay = Relay::new(Arc::clone(&registry), Duration::from_millis(100));
        let (alice, _alice_rx) = register(&registry).await;
        let (_carol, mut carol_rx) = register(&registry).await;

        // A peer whose pipe is tiny and never drained.
        let (writer, _stalled_rx) = tokio::io::duplex(4);
        let stalled = Arc::new(PeerConnection::new(registry.next_id(), "stalled", writer));
        registry.add(Arc::clone(&stalled)).await.expect("register stalled");

        let report = relay.broadcast(alice.id(), "A: anyone awake").await;

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert_eq!(next_line(&mut carol_rx).await, "A: anyone awake\n");
        assert!(!registry.contains(stalled.id()).await);
    }

    #[tokio::test]
    async fn empty_registry_is_a_no_op() {
        let registry = Arc::new(PeerRegistry::new());
        let relay = Relay::new(registry, Duration::from_secs(1));
        let report = relay.broadcast(PeerId::from(1), "hello?").await;
        assert_eq!(report, BroadcastReport::default());
    }
}
