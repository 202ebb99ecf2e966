//! One document's blocks and its logical clock.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use super::block::BlockCrdt;
use super::event::{DeleteEvent, UpdateEvent};
use crate::snapshot::DocumentSnapshot;

struct DocumentState {
    blocks: HashMap<String, BlockCrdt>,
    clock: i64,
}

/// CRDT state for a single document.
///
/// The block map and the clock sit behind one lock owned by the document,
/// so documents never contend with each other.
pub struct DocumentCrdt {
    document_id: String,
    state: RwLock<DocumentState>,
}

impl DocumentCrdt {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            state: RwLock::new(DocumentState {
                blocks: HashMap::new(),
                clock: 0,
            }),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Current clock value.
    pub fn clock(&self) -> i64 {
        self.state.read().clock
    }

    /// Advance the clock for a locally originated write.
    ///
    /// Takes the greater of `clock + 1` and the wall clock in milliseconds.
    pub fn tick(&self) -> i64 {
        let now = wall_clock_millis();
        let mut state = self.state.write();
        state.clock = state.clock.saturating_add(1).max(now);
        state.clock
    }

    /// Lamport receive rule: `clock = max(clock, remote) + 1`.
    pub fn receive_tick(&self, remote_timestamp: i64) -> i64 {
        let mut state = self.state.write();
        state.clock = state.clock.max(remote_timestamp).saturating_add(1);
        state.clock
    }

    /// Merge a field write. Returns whether the write was accepted.
    pub fn apply_update(&self, event: &UpdateEvent) -> bool {
        let mut state = self.state.write();
        let block = state
            .blocks
            .entry(event.block_id.clone())
            .or_insert_with(|| BlockCrdt::new(event.block_id.clone()));
        block.apply_update(event.field, &event.value, event.timestamp, &event.node_id)
    }

    /// Tombstone a block. Returns whether the delete was accepted.
    pub fn apply_delete(&self, event: &DeleteEvent) -> bool {
        let mut state = self.state.write();
        let block = state
            .blocks
            .entry(event.block_id.clone())
            .or_insert_with(|| BlockCrdt::new(event.block_id.clone()));
        block.apply_delete(event.timestamp, &event.node_id)
    }

    /// Copy of one block's state.
    pub fn block_state(&self, block_id: &str) -> Option<BlockCrdt> {
        self.state.read().blocks.get(block_id).cloned()
    }

    /// Copies of every block, ordered by block id.
    pub fn blocks(&self) -> Vec<BlockCrdt> {
        let state = self.state.read();
        let mut blocks: Vec<BlockCrdt> = state.blocks.values().cloned().collect();
        blocks.sort_by(|a, b| a.block_id().cmp(b.block_id()));
        blocks
    }

    pub fn block_count(&self) -> usize {
        self.state.read().blocks.len()
    }

    /// Point-in-time copy of the document for persistence.
    pub fn snapshot(&self) -> DocumentSnapshot {
        let state = self.state.read();
        let mut blocks: Vec<BlockCrdt> = state.blocks.values().cloned().collect();
        blocks.sort_by(|a, b| a.block_id().cmp(b.block_id()));
        DocumentSnapshot {
            document_id: self.document_id.clone(),
            clock: state.clock,
            blocks,
        }
    }

    /// Merge a persisted snapshot into live state.
    ///
    /// Blocks merge by the CRDT rules rather than being overwritten, so a
    /// stale snapshot can never roll back newer writes. The clock advances
    /// past the snapshot's clock. Returns the number of blocks that changed.
    pub fn restore(&self, snapshot: &DocumentSnapshot) -> usize {
        let mut state = self.state.write();
        let mut changed = 0;
        for incoming in &snapshot.blocks {
            let block = state
                .blocks
                .entry(incoming.block_id().to_string())
                .or_insert_with(|| BlockCrdt::new(incoming.block_id()));
            if block.merge(incoming) {
                changed += 1;
            }
        }
        state.clock = state.clock.max(snapshot.clock).saturating_add(1);
        log::debug!(
            "Restored document {} ({changed}/{} blocks changed, clock {})",
            self.document_id,
            snapshot.blocks.len(),
            state.clock
        );
        changed
    }
}

fn wall_clock_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
