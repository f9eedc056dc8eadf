//! # cowrite — real-time collaborative document server
//!
//! Relays conflict-free edits between concurrently connected clients of a
//! shared text document, keeping an authoritative in-memory replica from
//! which late joiners are hydrated. Ephemeral presence (cursor/selection)
//! is relayed alongside but never becomes document state.
//!
//! ```text
//! ┌─────────────┐    WebSocket     ┌──────────────────────────┐
//! │   Client    │ ◄──────────────► │        SyncServer        │
//! │  (editor)   │   binary frames  │                          │
//! └─────────────┘                  │  protocol ── framing     │
//!                                  │  document ── yrs replica │
//!                                  │  registry ── peers+queues│
//!                                  │  persistence ── snapshot │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire format (kind byte + varuint framing)
//! - [`document`] — authoritative CRDT replica over `yrs`
//! - [`registry`] — peer registry, per-peer send queues, broadcast
//! - [`server`] — WebSocket transport glue and connection lifecycle
//! - [`persistence`] — optional single-file snapshot sink
//!
//! ## Sync model
//!
//! Clients open the exchange with SYNC_STEP1 (their state vector); the
//! server answers with a differential SYNC_STEP2 and marks the peer
//! synced. Subsequent SYNC_STEP2 updates from any peer are applied to the
//! replica and rebroadcast byte-for-byte to every other synced peer.
//! Per-peer ordering is FIFO; cross-peer ordering is unconstrained, which
//! the CRDT absorbs.

pub mod document;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod server;

pub use document::{Replica, ReplicaError};
pub use persistence::{spawn_saver, PersistenceError, SaveHandle, SnapshotStore};
pub use protocol::{AwarenessUpdate, Frame, MessageKind, ProtocolError};
pub use registry::{Peer, PeerId, PeerReceiver, Registry};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
