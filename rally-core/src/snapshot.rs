//! Document snapshots and the persistence collaborator interface.
//!
//! CRDT state is process-local. The surrounding system flushes snapshots
//! to durable storage and hands them back when a document is first opened
//! again. Wire format:
//!
//! ```text
//! ┌──────────────┬─────────────────────────────────────────┐
//! │ u32 LE size  │ LZ4 block( bincode(DocumentSnapshot) )  │
//! └──────────────┴─────────────────────────────────────────┘
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::crdt::BlockCrdt;

/// Point-in-time state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub document_id: String,
    pub clock: i64,
    pub blocks: Vec<BlockCrdt>,
}

impl DocumentSnapshot {
    /// Serialize and compress.
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    /// Decompress and deserialize.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| SnapshotError::Decompression(e.to_string()))?;
        let (snapshot, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| SnapshotError::Deserialization(e.to_string()))?;
        Ok(snapshot)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Snapshot serialization failed: {0}")]
    Serialization(String),
    #[error("Snapshot deserialization failed: {0}")]
    Deserialization(String),
    #[error("Snapshot decompression failed: {0}")]
    Decompression(String),
    #[error("Snapshot store error: {0}")]
    Store(String),
}

/// Durable home for document snapshots, supplied by the persistence layer.
pub trait SnapshotStore: Send + Sync {
    /// Last saved snapshot for the document, if any.
    fn load(&self, document_id: &str) -> Result<Option<DocumentSnapshot>, SnapshotError>;

    /// Replace the stored snapshot for `snapshot.document_id`.
    fn save(&self, snapshot: &DocumentSnapshot) -> Result<(), SnapshotError>;

    fn remove(&self, document_id: &str) -> Result<(), SnapshotError>;
}

/// Snapshot store that keeps encoded snapshots in memory.
#[derive(Default)]
pub struct MemorySnapshotStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Total encoded size of all stored snapshots.
    pub fn stored_bytes(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, document_id: &str) -> Result<Option<DocumentSnapshot>, SnapshotError> {
        match self.entries.read().get(document_id) {
            Some(bytes) => DocumentSnapshot::decode(bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, snapshot: &DocumentSnapshot) -> Result<(), SnapshotError> {
        let bytes = snapshot.encode()?;
        self.entries
            .write()
            .insert(snapshot.document_id.clone(), bytes);
        Ok(())
    }

    fn remove(&self, document_id: &str) -> Result<(), SnapshotError> {
        self.entries.write().remove(document_id);
        Ok(())
    }
}
