//! CRDT events as they travel inside `doc_*` envelopes.
//!
//! ```text
//! UpdateEvent { documentId, blockId, field: "content"|"checked", value, timestamp, nodeId }
//! DeleteEvent { documentId, blockId, timestamp, nodeId }
//! ```

use serde::{Deserialize, Deserializer, Serialize};

/// The replaceable fields of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockField {
    Content,
    Checked,
}

/// A write to one field of one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEvent {
    pub document_id: String,
    pub block_id: String,
    pub field: BlockField,
    /// Registers hold strings; a JSON boolean is accepted for `checked`.
    #[serde(deserialize_with = "string_or_bool")]
    pub value: String,
    pub timestamp: i64,
    pub node_id: String,
}

/// A tombstone for one block.
///
/// Unknown keys are refused so that a malformed update (say, an unknown
/// `field`) can never be read back as a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeleteEvent {
    pub document_id: String,
    pub block_id: String,
    pub timestamp: i64,
    pub node_id: String,
}

/// Either kind of event. An update is recognised by its `field`/`value`
/// keys; anything else with the delete shape is a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocEvent {
    Update(UpdateEvent),
    Delete(DeleteEvent),
}

impl DocEvent {
    pub fn document_id(&self) -> &str {
        match self {
            DocEvent::Update(e) => &e.document_id,
            DocEvent::Delete(e) => &e.document_id,
        }
    }

    pub fn block_id(&self) -> &str {
        match self {
            DocEvent::Update(e) => &e.block_id,
            DocEvent::Delete(e) => &e.block_id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            DocEvent::Update(e) => e.timestamp,
            DocEvent::Delete(e) => e.timestamp,
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            DocEvent::Update(e) => &e.node_id,
            DocEvent::Delete(e) => &e.node_id,
        }
    }
}

fn string_or_bool<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Flag(bool),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Flag(b) => b.to_string(),
    })
}
