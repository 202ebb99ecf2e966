//! Last-Writer-Wins register.
//!
//! A register keeps the value of the write carrying the greatest
//! `(timestamp, writer_id)` pair it has observed. Writer ids are compared
//! lexicographically, so two replicas that observe the same set of writes
//! agree on the value regardless of delivery order.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A single conflict-resolving value slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LwwRegister<T> {
    value: T,
    timestamp: i64,
    writer_id: String,
}

impl<T: Clone> LwwRegister<T> {
    /// Create a register already holding a write.
    pub fn new(value: T, timestamp: i64, writer_id: impl Into<String>) -> Self {
        Self {
            value,
            timestamp,
            writer_id: writer_id.into(),
        }
    }

    /// Current value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Logical timestamp of the winning write.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Identity of the replica that produced the winning write.
    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }

    /// Whether a write stamped `(timestamp, writer_id)` beats the current one.
    ///
    /// Strictly greater timestamp wins; on equal timestamps the
    /// lexicographically greater writer wins. An identical stamp loses, which
    /// makes re-delivery of the same write a no-op.
    pub fn would_accept(&self, timestamp: i64, writer_id: &str) -> bool {
        match timestamp.cmp(&self.timestamp) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => writer_id > self.writer_id.as_str(),
        }
    }

    /// Apply a write. Returns `true` if it replaced the current value.
    pub fn set(&mut self, value: T, timestamp: i64, writer_id: &str) -> bool {
        if !self.would_accept(timestamp, writer_id) {
            return false;
        }
        self.value = value;
        self.timestamp = timestamp;
        self.writer_id = writer_id.to_string();
        true
    }

    /// Merge a remote register into this one. Returns `true` if the remote won.
    pub fn merge(&mut self, remote: &Self) -> bool {
        self.set(remote.value.clone(), remote.timestamp, &remote.writer_id)
    }
}

impl<T: Default> Default for LwwRegister<T> {
    /// The empty register: default value at timestamp 0 with no writer.
    fn default() -> Self {
        Self {
            value: T::default(),
            timestamp: 0,
            writer_id: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W1: &str = "aaaaaaaa-0000-4000-8000-000000000001";
    const W2: &str = "bbbbbbbb-0000-4000-8000-000000000002";

    #[test]
    fn test_default_is_empty() {
        let reg: LwwRegister<String> = LwwRegister::default();
        assert_eq!(reg.value(), "");
        assert_eq!(reg.timestamp(), 0);
        assert_eq!(reg.writer_id(), "");
    }

    #[test]
    fn test_higher_timestamp_wins() {
        let mut reg = LwwRegister::default();
        assert!(reg.set("first".to_string(), 100, W2));
        assert!(reg.set("second".to_string(), 200, W1));
        assert_eq!(reg.value(), "second");

        // Older write is ignored even from a "larger" writer.
        assert!(!reg.set("stale".to_string(), 150, W2));
        assert_eq!(reg.value(), "second");
        assert_eq!(reg.timestamp(), 200);
        assert_eq!(reg.writer_id(), W1);
    }

    #[test]
    fn test_tie_break_on_writer_id() {
        let mut a = LwwRegister::default();
        a.set("from-a".to_string(), 100, W1);
        a.set("from-b".to_string(), 100, W2);

        let mut b = LwwRegister::default();
        b.set("from-b".to_string(), 100, W2);
        b.set("from-a".to_string(), 100, W1);

        assert_eq!(a.value(), "from-b");
        assert_eq!(b.value(), "from-b");
    }

    #[test]
    fn test_identical_stamp_is_rejected() {
        let mut reg = LwwRegister::new("x".to_string(), 10, W1);
        assert!(!reg.set("y".to_string(), 10, W1));
        assert_eq!(reg.value(), "x");
    }

    #[test]
    fn test_merge_reports_winner() {
        let mut local = LwwRegister::new(false, 5, W1);
        let remote = LwwRegister::new(true, 6, W1);
        assert!(local.merge(&remote));
        assert!(*local.value());

        // Merging again is idempotent.
        assert!(!local.merge(&remote));
        assert_eq!(local, remote);
    }

    #[test]
    fn test_merge_commutes() {
        let a = LwwRegister::new("a".to_string(), 100, W1);
        let b = LwwRegister::new("b".to_string(), 200, W2);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab, ba);
        assert_eq!(ab.value(), "b");
    }
}
