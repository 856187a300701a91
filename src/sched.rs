//! Time-ordered QP scheduler index.
//!
//! QPs with deterministic work to perform before the scheduling horizon
//! sit in an ordered set keyed by `(wake_time, tid)`, where `tid` is a
//! device-global monotone counter that breaks ties FIFO. The index
//! holds QP numbers only; resolution back to the object goes through
//! the device registry.

use std::{
    collections::{BTreeSet, HashMap},
    time::Instant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SchedKey {
    wake_time: Instant,
    tid: u64,
    qpn: u32,
}

#[derive(Debug, Default)]
pub(crate) struct SchedIndex {
    tree: BTreeSet<SchedKey>,
    keys: HashMap<u32, SchedKey>,
}

impl SchedIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts or moves `qpn`. The caller supplies a fresh `tid` when
    /// the QP was not already indexed at this wake time.
    pub(crate) fn insert(&mut self, qpn: u32, wake_time: Instant, tid: u64) {
        self.remove(qpn);
        let key = SchedKey {
            wake_time,
            tid,
            qpn,
        };
        let _inserted = self.tree.insert(key);
        let _old = self.keys.insert(qpn, key);
    }

    pub(crate) fn remove(&mut self, qpn: u32) -> bool {
        match self.keys.remove(&qpn) {
            Some(key) => self.tree.remove(&key),
            None => false,
        }
    }

    /// The earliest-waking QP, if any.
    pub(crate) fn first(&self) -> Option<(u32, Instant)> {
        self.tree.iter().next().map(|key| (key.qpn, key.wake_time))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tree.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn orders_by_time_then_tid() {
        let mut index = SchedIndex::new();
        let base = Instant::now();
        index.insert(3, base + Duration::from_millis(5), 2);
        index.insert(1, base + Duration::from_millis(1), 1);
        index.insert(2, base + Duration::from_millis(1), 0);

        // same wake time: lower tid first
        assert_eq!(index.first().map(|(qpn, _)| qpn), Some(2));
        index.remove(2);
        assert_eq!(index.first().map(|(qpn, _)| qpn), Some(1));
        index.remove(1);
        assert_eq!(index.first().map(|(qpn, _)| qpn), Some(3));
    }

    #[test]
    fn reinsert_replaces_key() {
        let mut index = SchedIndex::new();
        let base = Instant::now();
        index.insert(7, base + Duration::from_millis(10), 0);
        index.insert(7, base, 1);
        assert_eq!(index.len(), 1);
        assert_eq!(index.first().map(|(qpn, _)| qpn), Some(7));
        assert!(index.remove(7));
        assert!(!index.remove(7));
        assert!(index.first().is_none());
    }
}
