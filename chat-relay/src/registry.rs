use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    error::{RelayError, Result},
    peer::{PeerConnection, PeerId},
};

/// The set of currently connected peers.
///
/// Every operation takes the lock once and never awaits while holding it, so
/// the network writes done by the relay always happen on a [`snapshot`]
/// outside the lock.
///
/// [`snapshot`]: PeerRegistry::snapshot
pub struct PeerRegistry {
    inner: Mutex<RegistryState>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct RegistryState {
    peers: HashMap<PeerId, Arc<PeerConnection>>,
    closed: bool,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> PeerId {
        PeerId::from(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a peer. Fails once [`drain`](Self::drain) has run.
    pub async fn add(&self, peer: Arc<PeerConnection>) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.closed {
            return Err(RelayError::RegistryClosed);
        }

        let id = peer.id();
        if state.peers.insert(id, peer).is_some() {
            debug!(peer = %id, "replaced existing registry entry");
        }
        Ok(())
    }

    /// Removes a peer, returning it if it was still registered.
    /// Removing an unknown id is a no-op.
    pub async fn remove(&self, id: PeerId) -> Option<Arc<PeerConnection>> {
        self.inner.lock().await.peers.remove(&id)
    }

    /// Point-in-time copy of the registered peers, for iterating without the lock.
    pub async fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.inner.lock().await.peers.values().cloned().collect()
    }

    pub async fn contains(&self, id: PeerId) -> bool {
        self.inner.lock().await.peers.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes the registry to new peers and hands back everything registered.
    pub async fn drain(&self) -> Vec<Arc<PeerConnection>> {
        let mut state = self.inner.lock().await;
        state.closed = true;
        state.peers.drain().map(|(_, peer)| peer).collect()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
