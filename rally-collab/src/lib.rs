//! # rally-collab: real-time connection hub for Rally
//!
//! Tracks who is connected, fans events out to rooms, debounces presence
//! flapping, rate-limits client traffic, and carries collaborative
//! document edits into the CRDT engine in `rally-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   WebSocket (JSON)   ┌────────────┐  register/unregister  ┌─────────────┐
//! │  Client A  │ ◄──────────────────► │ HubServer  │ ────────────────────► │     Hub     │
//! └────────────┘                      └─────┬──────┘                       │ clients     │
//! ┌────────────┐                            │ frames                       │ rooms       │
//! │  Client B  │ ◄─── outbound queue ──┐    ▼                              │ debounce    │
//! └────────────┘                       │ ┌────────┐   send_to_room         └──────┬──────┘
//!                                      │ │ Router │ ──► DocSync ──────────────────►│
//!                                      │ └────────┘      │                        │ on_connect /
//!                                      │                 ▼                        │ on_disconnect
//!                                      │        DocumentCrdtManager               ▼
//!                                      └──────────────────────────────── PresenceNotifier
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope and message types
//! - [`connection`]: outbound queue, rate limiter, socket pumps
//! - [`hub`]: connection registry, rooms, debounced disconnects
//! - [`router`]: envelope dispatch to handlers
//! - [`docsync`]: document sessions over the CRDT engine
//! - [`presence`]: online/offline notifications
//! - [`server`]: WebSocket listener and authentication seam

pub mod connection;
pub mod docsync;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod server;

// Re-exports for convenience
pub use connection::{
    serve_connection, Connection, ConnectionConfig, RateLimitConfig, RateLimiter, SessionEnd,
    UserId,
};
pub use docsync::{doc_room, DocRef, DocSync, DocSyncConfig};
pub use hub::{Hub, HubConfig, HubObserver, HubStats};
pub use presence::{OnlineSnapshot, OnlineStatus, PresenceNotifier, StaticWatchers, WatcherDirectory};
pub use protocol::{Envelope, MessageType, Payload, ProtocolError};
pub use router::{MessageHandler, Router};
pub use server::{Authenticator, HubServer, ServerConfig, ServerError, TrustedHeaderAuthenticator};
