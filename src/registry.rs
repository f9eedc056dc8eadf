//! Connected peer registry and broadcast fabric.
//!
//! The registry owns every peer. Each peer owns a bounded FIFO outbound
//! queue (a `tokio::sync::mpsc` channel whose receiving half is drained by
//! the peer's connection task) and its last cached awareness payload.
//! Broadcast captures a snapshot of eligible peers under the registry lock
//! and then enqueues an owned copy of the frame per recipient; a peer
//! removed between snapshot and enqueue just has the enqueue land in a
//! closed channel.
//!
//! Lock order: registry map lock before any per-peer field lock. The map
//! lock is never held across a transport write.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;

/// Opaque peer identity. Compared by value only; never routed on pointer
/// identity across module boundaries.
pub type PeerId = Uuid;

/// One connected client.
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    outbound: mpsc::Sender<Vec<u8>>,
    synced: AtomicBool,
    client_id: Mutex<Option<u32>>,
    awareness: Mutex<Option<Vec<u8>>>,
    closed: watch::Sender<bool>,
}

impl Peer {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the sync handshake has completed. Only synced peers are
    /// broadcast-eligible.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Marks the handshake complete. Returns whether the peer was already
    /// synced.
    pub fn mark_synced(&self) -> bool {
        self.synced.swap(true, Ordering::AcqRel)
    }

    /// The client id announced by this peer's first awareness message, if
    /// any has arrived yet.
    pub fn client_id(&self) -> Option<u32> {
        *self.client_id.lock().unwrap()
    }

    /// Records the peer's announced client id. Returns true the first
    /// time; later announcements keep the original id.
    pub fn learn_client_id(&self, client_id: u32) -> bool {
        let mut slot = self.client_id.lock().unwrap();
        if slot.is_none() {
            *slot = Some(client_id);
            true
        } else {
            false
        }
    }

    /// The last cached awareness JSON for this peer, if present.
    pub fn awareness(&self) -> Option<Vec<u8>> {
        self.awareness.lock().unwrap().clone()
    }

    /// Caches (or, with `None`, clears) the peer's awareness payload.
    pub fn set_awareness(&self, state_json: Option<Vec<u8>>) {
        *self.awareness.lock().unwrap() = state_json;
    }

    /// Signals the connection task to tear this peer down.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// The connection task's end of a peer: the outbound frame queue and the
/// close signal. Dropping it makes further enqueues no-ops.
pub struct PeerReceiver {
    pub frames: mpsc::Receiver<Vec<u8>>,
    pub closed: watch::Receiver<bool>,
}

/// Registry of all connected peers, keyed by peer id.
pub struct Registry {
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    queue_capacity: usize,
}

impl Registry {
    /// `queue_capacity` bounds each peer's outbound queue; a peer whose
    /// queue overflows is closed rather than allowed to pin server memory.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Inserts a new, not-yet-synced peer and hands back its receiving
    /// side for the connection task.
    pub async fn add(&self, addr: SocketAddr) -> (Arc<Peer>, PeerReceiver) {
        let (outbound, frames) = mpsc::channel(self.queue_capacity);
        let (closed_tx, closed_rx) = watch::channel(false);
        let peer = Arc::new(Peer {
            id: Uuid::new_v4(),
            addr,
            outbound,
            synced: AtomicBool::new(false),
            client_id: Mutex::new(None),
            awareness: Mutex::new(None),
            closed: closed_tx,
        });
        self.peers.write().await.insert(peer.id, peer.clone());
        (
            peer,
            PeerReceiver {
                frames,
                closed: closed_rx,
            },
        )
    }

    /// Unlinks a peer. Idempotent: removing an already-removed peer is a
    /// no-op returning `None`. The peer's queue drains when the connection
    /// task drops its receiver.
    pub async fn remove(&self, id: PeerId) -> Option<Arc<Peer>> {
        let removed = self.peers.write().await.remove(&id);
        if let Some(peer) = &removed {
            peer.close();
        }
        removed
    }

    pub async fn find(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().await.get(&id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Appends a frame to the peer's outbound FIFO. The frame is an owned
    /// buffer; queues never share bytes. Returns false when the frame was
    /// not queued; an overflowing peer is closed.
    pub fn enqueue(&self, peer: &Peer, frame: Vec<u8>) -> bool {
        if peer.is_closed() {
            return false;
        }
        match peer.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "peer {} ({}): outbound queue full, closing",
                    peer.id,
                    peer.addr
                );
                peer.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// All currently synced peers, captured under the registry lock.
    pub async fn snapshot_eligible(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .await
            .values()
            .filter(|peer| peer.is_synced() && !peer.is_closed())
            .cloned()
            .collect()
    }

    /// Every registered peer, synced or not. Used to prime a newcomer's
    /// presence view.
    pub async fn snapshot_all(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Closes every peer, signalling their connection tasks to flush what
    /// is already queued and tear down. Used at shutdown.
    pub async fn close_all(&self) {
        for peer in self.snapshot_all().await {
            peer.close();
        }
    }

    /// Enqueues an owned copy of `frame` on every synced peer except
    /// `except`. Returns the number of peers reached.
    pub async fn broadcast(&self, frame: &[u8], except: PeerId) -> usize {
        let targets = self.snapshot_eligible().await;
        let mut reached = 0;
        for peer in targets {
            if peer.id == except {
                continue;
            }
            if self.enqueue(&peer, frame.to_vec()) {
                reached += 1;
            }
        }
        reached
    }
}
