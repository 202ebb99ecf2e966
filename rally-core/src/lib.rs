//! # rally-core: conflict-free document state for Rally
//!
//! Last-Writer-Wins registers over a hybrid Lamport clock, grouped into
//! blocks and documents, plus the snapshot format the persistence layer
//! uses to carry that state across restarts.
//!
//! ## Modules
//!
//! - [`crdt`]: registers, blocks, documents and the document registry
//! - [`snapshot`]: compressed snapshots and the [`SnapshotStore`] seam

pub mod crdt;
pub mod snapshot;

pub use crdt::{
    BlockCrdt, BlockField, DeleteEvent, DocEvent, DocumentCrdt, DocumentCrdtManager,
    LwwRegister, UpdateEvent,
};
pub use snapshot::{DocumentSnapshot, MemorySnapshotStore, SnapshotError, SnapshotStore};
