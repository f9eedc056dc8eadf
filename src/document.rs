//! The authoritative document replica, a thin wrapper over the Yrs CRDT
//! engine.
//!
//! The replica owns one `yrs::Doc` with a single named text branch (the
//! shared-type name, which every connecting client must use as well). All
//! mutation funnels through [`Replica::apply_update`] under a write lock;
//! readers take shared snapshots and never observe a partially applied
//! update.

use thiserror::Error;
use tokio::sync::RwLock;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, Update, WriteTxn};

/// Replica failures. Apply errors are recoverable: the CRDT engine is the
/// source of truth for what it considers valid, and a rejected update is
/// dropped without being rebroadcast.
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("malformed update payload: {0}")]
    MalformedUpdate(yrs::encoding::read::Error),
    #[error("update rejected by crdt engine: {0}")]
    Rejected(#[from] yrs::error::UpdateError),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(yrs::encoding::read::Error),
}

/// The server's authoritative copy of the shared document.
pub struct Replica {
    doc: RwLock<Doc>,
    shared_type: String,
}

impl Replica {
    /// Creates an empty replica whose text branch is named `shared_type`.
    pub fn new(shared_type: impl Into<String>) -> Self {
        let shared_type = shared_type.into();
        let doc = Doc::new();
        {
            // Materialize the root branch so an empty document still
            // answers diffs and text reads.
            let mut txn = doc.transact_mut();
            txn.get_or_insert_text(shared_type.as_str());
        }
        Self {
            doc: RwLock::new(doc),
            shared_type,
        }
    }

    /// The configured shared-type name.
    pub fn shared_type(&self) -> &str {
        &self.shared_type
    }

    /// Applies a remote update.
    ///
    /// The v1 update encoding is attempted first; a payload that fails to
    /// parse as v1 is retried once as v2, so clients on either encoding
    /// are accepted. A payload that parses but is rejected by the engine
    /// surfaces [`ReplicaError::Rejected`] without a retry.
    pub async fn apply_update(&self, update: &[u8]) -> Result<(), ReplicaError> {
        let doc = self.doc.write().await;
        let decoded = match Update::decode_v1(update) {
            Ok(decoded) => decoded,
            Err(v1_err) => {
                Update::decode_v2(update).map_err(|_| ReplicaError::MalformedUpdate(v1_err))?
            }
        };
        let mut txn = doc.transact_mut();
        txn.apply_update(decoded)?;
        Ok(())
    }

    /// Encodes the minimal update that brings a replica at `remote_sv` up
    /// to this replica's current state. An empty `remote_sv` yields the
    /// full document state.
    pub async fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = if remote_sv.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(remote_sv).map_err(ReplicaError::MalformedStateVector)?
        };
        let doc = self.doc.read().await;
        let txn = doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// This replica's state vector, an opaque summary of what it has seen.
    pub async fn encode_state_vector(&self) -> Vec<u8> {
        let doc = self.doc.read().await;
        let txn = doc.transact();
        txn.state_vector().encode_v1()
    }

    /// The full document state as one update, i.e. the diff against an
    /// empty state vector. This is what gets persisted.
    pub async fn snapshot_full_state(&self) -> Vec<u8> {
        let doc = self.doc.read().await;
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Current text content. For logs and tests only; never on the frame
    /// path and never shipped over the wire.
    pub async fn text_content(&self) -> String {
        let doc = self.doc.read().await;
        let txn = doc.transact();
        match txn.get_text(self.shared_type.as_str()) {
            Some(text) => text.get_string(&txn),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::Text;

    /// A client-side doc with an edit, encoded as a v1 full-state update.
    fn client_update_v1(client_id: u64, text: &str) -> Vec<u8> {
        let doc = Doc::with_client_id(client_id);
        {
            let mut txn = doc.transact_mut();
            let branch = txn.get_or_insert_text("quill");
            branch.insert(&mut txn, 0, text);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn client_update_v2(client_id: u64, text: &str) -> Vec<u8> {
        let doc = Doc::with_client_id(client_id);
        {
            let mut txn = doc.transact_mut();
            let branch = txn.get_or_insert_text("quill");
            branch.insert(&mut txn, 0, text);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v2(&StateVector::default())
    }

    #[tokio::test]
    async fn test_empty_replica() {
        let replica = Replica::new("quill");
        assert_eq!(replica.shared_type(), "quill");
        assert_eq!(replica.text_content().await, "");
    }

    #[tokio::test]
    async fn test_apply_v1_update() {
        let replica = Replica::new("quill");
        replica
            .apply_update(&client_update_v1(1, "hello"))
            .await
            .unwrap();
        assert_eq!(replica.text_content().await, "hello");
    }

    #[tokio::test]
    async fn test_apply_falls_back_to_v2() {
        let replica = Replica::new("quill");
        replica
            .apply_update(&client_update_v2(1, "hello"))
            .await
            .unwrap();
        assert_eq!(replica.text_content().await, "hello");
    }

    #[tokio::test]
    async fn test_apply_garbage_rejected() {
        let replica = Replica::new("quill");
        let err = replica
            .apply_update(&[0xff, 0xfe, 0xfd, 0xfc])
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::MalformedUpdate(_)));
        assert_eq!(replica.text_content().await, "");
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let replica = Replica::new("quill");
        let update = client_update_v1(1, "once");
        replica.apply_update(&update).await.unwrap();
        replica.apply_update(&update).await.unwrap();
        assert_eq!(replica.text_content().await, "once");
    }

    #[tokio::test]
    async fn test_concurrent_updates_converge() {
        // Two clients insert at position 0 without seeing each other; the
        // engine's deterministic tiebreak orders them the same everywhere.
        let a = client_update_v1(1, "X");
        let b = client_update_v1(2, "Y");

        let first = Replica::new("quill");
        first.apply_update(&a).await.unwrap();
        first.apply_update(&b).await.unwrap();

        let second = Replica::new("quill");
        second.apply_update(&b).await.unwrap();
        second.apply_update(&a).await.unwrap();

        let text = first.text_content().await;
        assert_eq!(text.len(), 2);
        assert_eq!(text, second.text_content().await);
    }

    #[tokio::test]
    async fn test_diff_against_empty_is_full_state() {
        let replica = Replica::new("quill");
        replica
            .apply_update(&client_update_v1(1, "hello"))
            .await
            .unwrap();

        let diff = replica.encode_diff(&[]).await.unwrap();
        assert_eq!(diff, replica.snapshot_full_state().await);

        let fresh = Replica::new("quill");
        fresh.apply_update(&diff).await.unwrap();
        assert_eq!(fresh.text_content().await, "hello");
    }

    #[tokio::test]
    async fn test_diff_against_known_state_is_incremental() {
        let replica = Replica::new("quill");
        replica
            .apply_update(&client_update_v1(1, "hello"))
            .await
            .unwrap();

        // A peer that already holds "hello" reports its state vector; the
        // diff for it must be smaller than the full state.
        let peer = Replica::new("quill");
        peer.apply_update(&replica.snapshot_full_state().await)
            .await
            .unwrap();
        let peer_sv = peer.encode_state_vector().await;

        replica
            .apply_update(&client_update_v1(2, " world"))
            .await
            .unwrap();
        let diff = replica.encode_diff(&peer_sv).await.unwrap();
        assert!(diff.len() < replica.snapshot_full_state().await.len());

        peer.apply_update(&diff).await.unwrap();
        assert_eq!(peer.text_content().await, replica.text_content().await);
    }

    #[tokio::test]
    async fn test_malformed_state_vector_rejected() {
        let replica = Replica::new("quill");
        let err = replica
            .encode_diff(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff])
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::MalformedStateVector(_)));
    }

    #[tokio::test]
    async fn test_empty_document_full_state_applies_cleanly() {
        let replica = Replica::new("quill");
        let state = replica.snapshot_full_state().await;
        let client = Replica::new("quill");
        client.apply_update(&state).await.unwrap();
        assert_eq!(client.text_content().await, "");
    }
}
