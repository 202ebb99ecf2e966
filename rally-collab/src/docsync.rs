//! Collaborative document sessions over the hub.
//!
//! ```text
//! doc_join   {documentId}  → join room "doc:<id>", rehydrate if needed,
//!                            reply doc_state to the joiner
//! doc_update UpdateEvent   → receive_tick, merge, rebroadcast if accepted
//! doc_delete DeleteEvent   → receive_tick, tombstone, rebroadcast if accepted
//! doc_leave  {documentId}  → leave room; last one out flushes and unloads
//! ```
//!
//! Live state sits in a [`DocumentCrdtManager`]; the [`SnapshotStore`] is
//! the durable side. Documents whose collaborators vanished without a
//! `doc_leave` are picked up by [`DocSync::evict_idle`].
//!
//! Loading and unloading hold the lifecycle gate exclusively, while edits
//! and flushes share it. A document becomes visible only once restored,
//! and no edit can land on an instance that is being unloaded.

use parking_lot::RwLock;
use rally_core::{
    DeleteEvent, DocEvent, DocumentCrdt, DocumentCrdtManager, SnapshotError, SnapshotStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::hub::Hub;
use crate::protocol::{Envelope, MessageType};
use crate::router::{MessageHandler, Router};

/// Room name for a document.
pub fn doc_room(document_id: &str) -> String {
    format!("doc:{document_id}")
}

/// Payload of `doc_join` and `doc_leave`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocRef {
    pub document_id: String,
}

#[derive(Debug, Clone)]
pub struct DocSyncConfig {
    /// How often live documents are flushed and idle ones unloaded
    pub flush_interval: Duration,
}

impl Default for DocSyncConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
        }
    }
}

pub struct DocSync {
    documents: DocumentCrdtManager,
    store: Arc<dyn SnapshotStore>,
    config: DocSyncConfig,
    lifecycle: RwLock<()>,
}

impl DocSync {
    pub fn new(store: Arc<dyn SnapshotStore>, config: DocSyncConfig) -> Self {
        Self {
            documents: DocumentCrdtManager::new(),
            store,
            config,
            lifecycle: RwLock::new(()),
        }
    }

    /// Route the four `doc_*` types to this handler.
    pub fn register(self: &Arc<Self>, router: Router) -> Router {
        [
            MessageType::DocJoin,
            MessageType::DocLeave,
            MessageType::DocUpdate,
            MessageType::DocDelete,
        ]
        .into_iter()
        .fold(router, |router, msg_type| {
            router.route(msg_type, self.clone() as Arc<dyn MessageHandler>)
        })
    }

    pub fn documents(&self) -> &DocumentCrdtManager {
        &self.documents
    }

    /// Live document, rehydrated from the store on first use.
    pub fn open(&self, document_id: &str) -> Arc<DocumentCrdt> {
        if let Some(doc) = self.loaded(document_id) {
            return doc;
        }
        let _gate = self.lifecycle.write();
        self.load(document_id)
    }

    fn loaded(&self, document_id: &str) -> Option<Arc<DocumentCrdt>> {
        let _gate = self.lifecycle.read();
        self.documents.get(document_id)
    }

    /// Caller holds the lifecycle gate exclusively.
    fn load(&self, document_id: &str) -> Arc<DocumentCrdt> {
        if let Some(doc) = self.documents.get(document_id) {
            return doc;
        }

        let doc = Arc::new(DocumentCrdt::new(document_id));
        match self.store.load(document_id) {
            Ok(Some(snapshot)) => {
                doc.restore(&snapshot);
                log::info!(
                    "Rehydrated document {document_id} ({} blocks)",
                    snapshot.blocks.len()
                );
            }
            Ok(None) => {}
            // Start empty; later writes still merge correctly with the stored copy.
            Err(e) => log::error!("Failed to load snapshot for {document_id}: {e}"),
        }
        self.documents.get_or_insert(doc)
    }

    /// Apply one incoming event. Returns whether it changed state.
    pub fn apply(&self, event: &DocEvent) -> bool {
        {
            let _gate = self.lifecycle.read();
            if let Some(doc) = self.documents.get(event.document_id()) {
                return Self::merge(&doc, event);
            }
        }
        let _gate = self.lifecycle.write();
        let doc = self.load(event.document_id());
        Self::merge(&doc, event)
    }

    fn merge(doc: &DocumentCrdt, event: &DocEvent) -> bool {
        doc.receive_tick(event.timestamp());
        match event {
            DocEvent::Update(update) => doc.apply_update(update),
            DocEvent::Delete(delete) => doc.apply_delete(delete),
        }
    }

    /// Save one live document. Unloaded documents are skipped.
    pub fn flush(&self, document_id: &str) -> Result<bool, SnapshotError> {
        let _gate = self.lifecycle.read();
        match self.documents.get(document_id) {
            Some(doc) => {
                self.store.save(&doc.snapshot())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Save every live document. Returns how many were saved.
    pub fn flush_all(&self) -> usize {
        let mut saved = 0;
        for document_id in self.documents.document_ids() {
            match self.flush(&document_id) {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(e) => log::error!("Failed to flush document {document_id}: {e}"),
            }
        }
        saved
    }

    /// Flush and unload a document. Returns whether it was unloaded; it
    /// stays loaded if the flush fails.
    pub fn close(&self, document_id: &str) -> bool {
        let _gate = self.lifecycle.write();
        let Some(doc) = self.documents.remove(document_id) else {
            return false;
        };
        match self.store.save(&doc.snapshot()) {
            Ok(()) => {
                log::info!("Document {document_id} unloaded");
                true
            }
            Err(e) => {
                log::error!("Keeping document {document_id} loaded, flush failed: {e}");
                self.documents.get_or_insert(doc);
                false
            }
        }
    }

    /// Unload every document whose room is empty. Returns how many.
    pub fn evict_idle(&self, hub: &Hub) -> usize {
        self.documents
            .document_ids()
            .into_iter()
            .filter(|id| hub.room_members(&doc_room(id)).is_empty())
            .filter(|id| self.close(id))
            .count()
    }

    /// Periodically unload idle documents and flush the rest.
    pub fn spawn_maintenance(self: &Arc<Self>, hub: Hub) -> JoinHandle<()> {
        let sync = self.clone();
        let period = self.config.flush_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let evicted = sync.evict_idle(&hub);
                let flushed = sync.flush_all();
                log::debug!("Document maintenance: {evicted} unloaded, {flushed} flushed");
            }
        })
    }

    fn handle_join(&self, hub: &Hub, conn: &Arc<Connection>, envelope: &Envelope) {
        let Some(DocRef { document_id }) = self.parse(conn, envelope) else {
            return;
        };
        if !hub.join_room(conn, &doc_room(&document_id)) {
            return;
        }

        // Opened after joining so no update falls between state and membership.
        let doc = self.open(&document_id);
        let reply = Envelope::with_payload(MessageType::DocState, &doc.snapshot())
            .and_then(|env| env.to_payload());
        match reply {
            Ok(payload) => {
                conn.send(payload);
            }
            Err(e) => log::error!("Failed to encode state of {document_id}: {e}"),
        }
    }

    fn handle_leave(&self, hub: &Hub, conn: &Arc<Connection>, envelope: &Envelope) {
        let Some(DocRef { document_id }) = self.parse(conn, envelope) else {
            return;
        };
        let room = doc_room(&document_id);
        hub.leave_room(conn, &room);
        if hub.room_members(&room).is_empty() {
            self.close(&document_id);
        }
    }

    fn handle_event(&self, hub: &Hub, conn: &Arc<Connection>, event: DocEvent) {
        if !self.apply(&event) {
            log::debug!(
                "Stale {} for block {} from {}",
                if matches!(event, DocEvent::Delete(_)) { "delete" } else { "update" },
                event.block_id(),
                event.node_id()
            );
            return;
        }

        let rebroadcast = match &event {
            DocEvent::Update(update) => Envelope::with_payload(MessageType::DocUpdate, update),
            DocEvent::Delete(delete) => Envelope::with_payload(MessageType::DocDelete, delete),
        }
        .and_then(|env| env.to_payload());

        match rebroadcast {
            Ok(payload) => {
                hub.send_to_room(&doc_room(event.document_id()), payload, Some(conn.user_id()));
            }
            Err(e) => log::error!("Failed to encode event for {}: {e}", event.document_id()),
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(&self, conn: &Connection, envelope: &Envelope) -> Option<T> {
        envelope
            .payload_as::<T>()
            .map_err(|e| log::warn!("Dropping frame from user {}: {e}", conn.user_id()))
            .ok()
    }
}

impl MessageHandler for DocSync {
    fn handle(&self, hub: &Hub, conn: &Arc<Connection>, envelope: Envelope) {
        match envelope.msg_type {
            MessageType::DocJoin => self.handle_join(hub, conn, &envelope),
            MessageType::DocLeave => self.handle_leave(hub, conn, &envelope),
            // Either shape is accepted on doc_update.
            MessageType::DocUpdate => {
                if let Some(event) = self.parse::<DocEvent>(conn, &envelope) {
                    self.handle_event(hub, conn, event);
                }
            }
            MessageType::DocDelete => {
                if let Some(event) = self.parse::<DeleteEvent>(conn, &envelope) {
                    self.handle_event(hub, conn, DocEvent::Delete(event));
                }
            }
            ref other => log::debug!("DocSync ignoring {other}"),
        }
    }
}
