//! Process-wide registry of live documents.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::document::DocumentCrdt;

/// Maps document ids to their CRDT state.
///
/// Documents are created lazily and live until [`remove`](Self::remove) is
/// called; nothing is evicted automatically. The registry lock is only held
/// to look up or insert an entry, never while a document is being mutated.
pub struct DocumentCrdtManager {
    documents: RwLock<HashMap<String, Arc<DocumentCrdt>>>,
}

impl DocumentCrdtManager {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// Get the document, creating an empty one on first use.
    pub fn get_or_create(&self, document_id: &str) -> Arc<DocumentCrdt> {
        // Fast path: read lock
        if let Some(doc) = self.documents.read().get(document_id) {
            return doc.clone();
        }

        let mut documents = self.documents.write();
        // Another caller may have won the race between the two locks.
        if let Some(doc) = documents.get(document_id) {
            return doc.clone();
        }

        let doc = Arc::new(DocumentCrdt::new(document_id));
        documents.insert(document_id.to_string(), doc.clone());
        log::debug!("Created CRDT state for document {document_id}");
        doc
    }

    /// Insert a fully built document unless one is already loaded, and
    /// return whichever instance is now registered.
    pub fn get_or_insert(&self, doc: Arc<DocumentCrdt>) -> Arc<DocumentCrdt> {
        let mut documents = self.documents.write();
        documents
            .entry(doc.document_id().to_string())
            .or_insert(doc)
            .clone()
    }

    /// Get the document only if it is already loaded.
    pub fn get(&self, document_id: &str) -> Option<Arc<DocumentCrdt>> {
        self.documents.read().get(document_id).cloned()
    }

    pub fn has(&self, document_id: &str) -> bool {
        self.documents.read().contains_key(document_id)
    }

    /// Drop a document's in-memory state. Returns the removed instance.
    pub fn remove(&self, document_id: &str) -> Option<Arc<DocumentCrdt>> {
        let removed = self.documents.write().remove(document_id);
        if removed.is_some() {
            log::debug!("Removed CRDT state for document {document_id}");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Ids of every loaded document.
    pub fn document_ids(&self) -> Vec<String> {
        self.documents.read().keys().cloned().collect()
    }
}

impl Default for DocumentCrdtManager {
    fn default() -> Self {
        Self::new()
    }
}
