//! Block-level CRDT engine for collaborative documents.
//!
//! ```text
//! DocumentCrdtManager ── documentId ──► DocumentCrdt (clock + lock)
//!                                            │
//!                                            └── blockId ──► BlockCrdt
//!                                                             ├── content: LwwRegister
//!                                                             ├── checked: LwwRegister
//!                                                             └── tombstone
//! ```
//!
//! Each block field is an atomic, independently replaceable value. Two
//! writes to the same field resolve by `(timestamp, writer id)`; there is
//! no character-level merge inside a block.

pub mod block;
pub mod document;
pub mod event;
pub mod lww;
pub mod manager;

pub use block::BlockCrdt;
pub use document::DocumentCrdt;
pub use event::{BlockField, DeleteEvent, DocEvent, UpdateEvent};
pub use lww::LwwRegister;
pub use manager::DocumentCrdtManager;
