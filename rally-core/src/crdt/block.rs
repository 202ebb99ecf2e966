//! Per-block CRDT state: two LWW registers plus a sticky tombstone.
//!
//! ```text
//! absent ──first write/delete──► live ──delete──► tombstoned (terminal)
//! ```

use serde::{Deserialize, Serialize};

use super::event::BlockField;
use super::lww::LwwRegister;

/// State of one document block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockCrdt {
    block_id: String,
    content: LwwRegister<String>,
    checked: LwwRegister<String>,
    deleted: bool,
    deleted_at: i64,
    deleted_by: String,
}

impl BlockCrdt {
    /// A fresh, live block with empty registers.
    pub fn new(block_id: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            content: LwwRegister::default(),
            checked: LwwRegister::default(),
            deleted: false,
            deleted_at: 0,
            deleted_by: String::new(),
        }
    }

    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    pub fn content(&self) -> &LwwRegister<String> {
        &self.content
    }

    pub fn checked(&self) -> &LwwRegister<String> {
        &self.checked
    }

    /// The `checked` register read as a flag.
    pub fn is_checked(&self) -> bool {
        self.checked.value() == "true"
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn deleted_at(&self) -> i64 {
        self.deleted_at
    }

    pub fn deleted_by(&self) -> &str {
        &self.deleted_by
    }

    /// Merge a write into the named field. Tombstoned blocks reject every
    /// write, whatever its timestamp.
    pub fn apply_update(
        &mut self,
        field: BlockField,
        value: &str,
        timestamp: i64,
        writer_id: &str,
    ) -> bool {
        if self.deleted {
            return false;
        }
        let register = match field {
            BlockField::Content => &mut self.content,
            BlockField::Checked => &mut self.checked,
        };
        register.set(value.to_string(), timestamp, writer_id)
    }

    /// Tombstone the block.
    ///
    /// The first delete always lands. Once tombstoned, a later delete only
    /// re-stamps `deleted_at`/`deleted_by` when its timestamp is strictly
    /// greater; the block never becomes live again.
    pub fn apply_delete(&mut self, timestamp: i64, writer_id: &str) -> bool {
        if self.deleted && timestamp <= self.deleted_at {
            return false;
        }
        self.deleted = true;
        self.deleted_at = timestamp;
        self.deleted_by = writer_id.to_string();
        true
    }

    /// Fold another replica's view of this block into ours.
    ///
    /// Registers merge by the LWW rule while we are still live; a remote
    /// tombstone is then applied with the usual delete rule.
    pub fn merge(&mut self, other: &BlockCrdt) -> bool {
        let mut changed = false;
        if !self.deleted {
            changed |= self.content.merge(&other.content);
            changed |= self.checked.merge(&other.checked);
        }
        if other.deleted {
            changed |= self.apply_delete(other.deleted_at, &other.deleted_by);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_block_is_live_and_empty() {
        let block = BlockCrdt::new("b1");
        assert_eq!(block.block_id(), "b1");
        assert!(!block.is_deleted());
        assert_eq!(block.content().value(), "");
        assert!(!block.is_checked());
    }

    #[test]
    fn test_fields_are_independent() {
        let mut block = BlockCrdt::new("b1");
        assert!(block.apply_update(BlockField::Content, "hello", 10, "n1"));
        assert!(block.apply_update(BlockField::Checked, "true", 5, "n2"));

        assert_eq!(block.content().value(), "hello");
        assert_eq!(block.content().timestamp(), 10);
        assert!(block.is_checked());
        assert_eq!(block.checked().writer_id(), "n2");
    }

    #[test]
    fn test_tombstone_rejects_updates() {
        let mut block = BlockCrdt::new("b1");
        block.apply_update(BlockField::Content, "x", 10, "n1");
        assert!(block.apply_delete(20, "n1"));

        assert!(!block.apply_update(BlockField::Content, "revive", i64::MAX, "zzz"));
        assert!(!block.apply_update(BlockField::Checked, "true", i64::MAX, "zzz"));
        assert_eq!(block.content().value(), "x");
    }

    #[test]
    fn test_first_delete_always_accepted() {
        let mut block = BlockCrdt::new("b1");
        block.apply_update(BlockField::Content, "x", 500, "n1");
        // Older than the content write, still tombstones.
        assert!(block.apply_delete(1, "n2"));
        assert!(block.is_deleted());
        assert_eq!(block.deleted_at(), 1);
        assert_eq!(block.deleted_by(), "n2");
    }

    #[test]
    fn test_later_delete_restamps() {
        let mut block = BlockCrdt::new("b1");
        assert!(block.apply_delete(100, "n1"));
        assert!(!block.apply_delete(100, "n2"));
        assert!(!block.apply_delete(50, "n2"));
        assert_eq!(block.deleted_at(), 100);

        assert!(block.apply_delete(300, "n2"));
        assert_eq!(block.deleted_at(), 300);
        assert_eq!(block.deleted_by(), "n2");
        assert!(block.is_deleted());
    }

    #[test]
    fn test_merge_carries_tombstone() {
        let mut local = BlockCrdt::new("b1");
        local.apply_update(BlockField::Content, "local", 10, "n1");

        let mut remote = BlockCrdt::new("b1");
        remote.apply_update(BlockField::Content, "remote", 20, "n2");
        remote.apply_delete(30, "n2");

        assert!(local.merge(&remote));
        assert_eq!(local.content().value(), "remote");
        assert!(local.is_deleted());
        assert_eq!(local.deleted_at(), 30);

        // Nothing new the second time.
        assert!(!local.merge(&remote));
    }
}
