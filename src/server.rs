//! WebSocket sync server: connection lifecycle, sync handshake, and
//! broadcast plumbing.
//!
//! ```text
//! Client A ──┐                         ┌── Peer queue ──► Client B
//!            ├── per-connection task ──┤
//! Client B ──┘          │              └── Peer queue ──► Client C
//!                       │
//!                ┌──────┴──────┐
//!                │   Replica   │──► SnapshotStore (optional)
//!                │  (yrs Doc)  │
//!                └─────────────┘
//! ```
//!
//! Each connection runs one task that multiplexes three event sources:
//! inbound WebSocket frames, the peer's outbound FIFO queue, and the
//! peer's close signal. Inbound handling is run-to-completion; disk I/O
//! happens on the saver task, never here.
//!
//! The server never pushes document state on connect. It waits for the
//! client's SYNC_STEP1 and answers with a differential SYNC_STEP2, which
//! removes the race between an initial snapshot and updates broadcast
//! during the acceptance window. Updates arriving before the handshake
//! are dropped; the handshake diff reconciles the client afterwards.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::document::Replica;
use crate::persistence::{spawn_saver, SaveHandle, SnapshotStore};
use crate::protocol::{self, MessageKind};
use crate::registry::{Peer, Registry};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Name of the shared text branch; must match every connecting client.
    pub shared_type: String,
    /// Snapshot file path. `None` disables persistence.
    pub persistence_path: Option<PathBuf>,
    /// Outbound frames buffered per peer before the peer is dropped.
    pub queue_capacity: usize,
    /// WebSocket subprotocol label echoed when a client offers it.
    /// Opaque; no negotiation beyond the echo.
    pub subprotocol: String,
    /// Seconds between periodic stats log lines. Zero disables them.
    pub stats_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            shared_type: "quill".to_string(),
            persistence_path: None,
            queue_capacity: 256,
            subprotocol: "crdt-protocol".to_string(),
            stats_interval_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub updates_applied: u64,
    pub updates_rejected: u64,
}

/// Unrecoverable startup failures. Everything after startup is contained
/// at the connection boundary.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
}

/// The sync server: one process, one document.
pub struct SyncServer {
    config: ServerConfig,
    replica: Arc<Replica>,
    registry: Arc<Registry>,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<SnapshotStore>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let replica = Arc::new(Replica::new(config.shared_type.clone()));
        let registry = Arc::new(Registry::new(config.queue_capacity));
        let store = config
            .persistence_path
            .as_ref()
            .map(|path| Arc::new(SnapshotStore::new(path)));
        Self {
            config,
            replica,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The authoritative replica. Debug and test hook; the frame path
    /// reaches it internally.
    pub fn replica(&self) -> Arc<Replica> {
        self.replica.clone()
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Binds, serves until ctrl-c, then tears down. A final snapshot save
    /// runs at shutdown when persistence is configured.
    pub async fn run(&self) -> Result<(), ServerError> {
        if let Some(store) = &self.store {
            if let Err(err) = store.load(&self.replica).await {
                log::warn!("snapshot load failed, starting empty: {err}");
            }
        }

        let listener =
            TcpListener::bind(&self.config.bind_addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: self.config.bind_addr.clone(),
                    source,
                })?;
        log::info!(
            "listening on {} (shared type {:?}, subprotocol {:?})",
            self.config.bind_addr,
            self.config.shared_type,
            self.config.subprotocol
        );

        let saver = self
            .store
            .as_ref()
            .map(|store| spawn_saver(store.clone(), self.replica.clone()));

        let reporter = (self.config.stats_interval_secs > 0).then(|| {
            let stats = self.stats.clone();
            let registry = self.registry.clone();
            let period = Duration::from_secs(self.config.stats_interval_secs);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let snapshot = stats.read().await.clone();
                    log::info!(
                        "{} peer(s), {} messages ({} bytes), {} applied, {} rejected",
                        registry.count().await,
                        snapshot.total_messages,
                        snapshot.total_bytes,
                        snapshot.updates_applied,
                        snapshot.updates_rejected
                    );
                }
            })
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            log::warn!("accept failed: {err}");
                            continue;
                        }
                    };
                    log::debug!("tcp connection from {addr}");

                    let replica = self.replica.clone();
                    let registry = self.registry.clone();
                    let stats = self.stats.clone();
                    let saver = saver.clone();
                    let subprotocol = self.config.subprotocol.clone();

                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(
                            stream, addr, replica, registry, stats, saver, subprotocol,
                        )
                        .await
                        {
                            log::error!("connection error from {addr}: {err}");
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("shutdown requested");
                    break;
                }
            }
        }

        // Stop accepting, give connection tasks a moment to flush what is
        // already queued, then save and exit.
        if let Some(reporter) = reporter {
            reporter.abort();
        }
        self.registry.close_all().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        if let Some(store) = &self.store {
            if let Err(err) = store.save(&self.replica).await {
                log::warn!("final snapshot save failed: {err}");
            }
        }
        log::info!("final content: {:?}", self.replica.text_content().await);
        Ok(())
    }
}

/// Accepts the WebSocket handshake, echoing the configured subprotocol
/// when the client offers it.
async fn accept_websocket(
    stream: TcpStream,
    subprotocol: String,
) -> Result<
    tokio_tungstenite::WebSocketStream<TcpStream>,
    tokio_tungstenite::tungstenite::Error,
> {
    let callback = move |request: &Request,
                         mut response: Response|
          -> Result<Response, ErrorResponse> {
        let offered = request
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.split(',').any(|part| part.trim() == subprotocol));
        if offered {
            if let Ok(value) = HeaderValue::from_str(&subprotocol) {
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, value);
            }
        }
        Ok(response)
    };
    tokio_tungstenite::accept_hdr_async(stream, callback).await
}

/// Runs one connection from WebSocket accept to teardown.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    replica: Arc<Replica>,
    registry: Arc<Registry>,
    stats: Arc<RwLock<ServerStats>>,
    saver: Option<SaveHandle>,
    subprotocol: String,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = accept_websocket(stream, subprotocol).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let (peer, mut rx) = registry.add(addr).await;
    log::info!(
        "client connected from {addr} (total: {})",
        registry.count().await
    );

    // Prime the newcomer's presence view with every peer whose identity
    // and awareness are already known. Enqueued on the new peer only.
    for other in registry.snapshot_all().await {
        if other.id() == peer.id() {
            continue;
        }
        if let (Some(client_id), Some(json)) = (other.client_id(), other.awareness()) {
            registry.enqueue(&peer, protocol::encode_awareness(client_id, Some(&json)));
        }
    }

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }
                        handle_frame(&bytes, &peer, &replica, &registry, &stats, saver.as_ref())
                            .await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("connection closed by {addr}");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text and pong frames carry nothing for us.
                    }
                    Some(Err(err)) => {
                        log::warn!("websocket error from {addr}: {err}");
                        break;
                    }
                }
            }
            outbound = rx.frames.recv() => {
                match outbound {
                    Some(frame) => {
                        if let Err(err) = ws_sender.send(Message::Binary(frame.into())).await {
                            log::warn!("write to {addr} failed, closing: {err}");
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = rx.closed.changed() => {
                // Best-effort flush of frames queued before the close.
                while let Ok(frame) = rx.frames.try_recv() {
                    if ws_sender.send(Message::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
                log::debug!("peer {} closed by server", peer.id());
                break;
            }
        }
    }

    // Disconnect transition: announce departure before unlinking so the
    // broadcast snapshot cannot include the departing peer.
    if let Some(client_id) = peer.client_id() {
        let remove_frame = protocol::encode_awareness(client_id, None);
        let reached = registry.broadcast(&remove_frame, peer.id()).await;
        log::debug!("awareness remove for client {client_id} sent to {reached} peer(s)");
    }
    registry.remove(peer.id()).await;
    {
        let mut s = stats.write().await;
        s.active_connections -= 1;
    }
    log::info!(
        "client disconnected from {addr} (remaining: {})",
        registry.count().await
    );

    Ok(())
}

/// Handles one inbound protocol frame. Decode and apply failures are
/// contained here: the frame is dropped and the connection stays up.
async fn handle_frame(
    raw: &[u8],
    peer: &Arc<Peer>,
    replica: &Arc<Replica>,
    registry: &Arc<Registry>,
    stats: &Arc<RwLock<ServerStats>>,
    saver: Option<&SaveHandle>,
) {
    let frame = match protocol::decode_frame(raw) {
        Ok(frame) => frame,
        Err(err) => {
            log::warn!(
                "{}: dropping undecodable frame ({err}); first bytes: {}",
                peer.addr(),
                hex_prefix(raw)
            );
            return;
        }
    };

    match frame.kind {
        MessageKind::SyncStep1 => {
            // Eligibility flips before the diff snapshot: an update applied
            // concurrently lands in the diff, in the broadcast, or in both,
            // and applies commute.
            let already_synced = peer.mark_synced();
            let diff = match replica.encode_diff(frame.payload).await {
                Ok(diff) => diff,
                Err(err) => {
                    log::warn!("{}: bad state vector in SYNC_STEP1: {err}", peer.addr());
                    return;
                }
            };
            let reply = protocol::encode_frame(MessageKind::SyncStep2, &diff);
            if registry.enqueue(peer, reply) && !already_synced {
                log::info!(
                    "peer {} synced ({} byte initial state)",
                    peer.id(),
                    diff.len()
                );
            }
        }
        MessageKind::SyncStep2 => {
            if !peer.is_synced() {
                log::debug!(
                    "{}: dropping update received before handshake",
                    peer.addr()
                );
                return;
            }
            match replica.apply_update(frame.payload).await {
                Ok(()) => {
                    stats.write().await.updates_applied += 1;
                    if let Some(saver) = saver {
                        saver.request();
                    }
                    // Forward the frame exactly as received; re-encoding
                    // would break update identity.
                    let reached = registry.broadcast(raw, peer.id()).await;
                    log::debug!(
                        "applied {} byte update, broadcast to {reached} peer(s)",
                        frame.payload.len()
                    );
                }
                Err(err) => {
                    stats.write().await.updates_rejected += 1;
                    log::warn!("{}: update rejected: {err}", peer.addr());
                }
            }
        }
        MessageKind::Awareness => {
            let update = match protocol::decode_awareness(frame.payload) {
                Ok(update) => update,
                Err(err) => {
                    log::warn!("{}: dropping bad awareness payload: {err}", peer.addr());
                    return;
                }
            };
            if peer.learn_client_id(update.client_id) {
                log::info!(
                    "peer {} identifies as client {}",
                    peer.id(),
                    update.client_id
                );
            }
            peer.set_awareness(update.state_json.map(<[u8]>::to_vec));
            registry.broadcast(raw, peer.id()).await;
        }
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(16)
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.shared_type, "quill");
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.subprotocol, "crdt-protocol");
        assert_eq!(config.stats_interval_secs, 30);
        assert!(config.persistence_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9000");
        assert!(server.store.is_none());
    }

    #[test]
    fn test_server_with_persistence() {
        let config = ServerConfig {
            persistence_path: Some(PathBuf::from("/tmp/doc.bin")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config);
        assert!(server.store.is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.updates_applied, 0);
        assert_eq!(stats.updates_rejected, 0);
    }

    #[tokio::test]
    async fn test_replica_hook_reflects_shared_type() {
        let config = ServerConfig {
            shared_type: "document".to_string(),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config);
        assert_eq!(server.replica().shared_type(), "document");
        assert_eq!(server.replica().text_content().await, "");
    }

    #[test]
    fn test_hex_prefix_truncates() {
        assert_eq!(hex_prefix(&[0xab, 0x01]), "ab 01");
        assert_eq!(hex_prefix(&[0xff; 32]).split(' ').count(), 16);
    }

    #[tokio::test]
    async fn test_run_fails_on_unbindable_address() {
        let config = ServerConfig {
            bind_addr: "256.256.256.256:0".to_string(),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config);
        assert!(matches!(
            server.run().await,
            Err(ServerError::Bind { .. })
        ));
    }
}
