// Per-instance change ledger.
//
// Holds the pending operation for each touched index plus the links that
// place the instance in a graph: owner, parent, index inside the parent and
// the shared root. Graph-wide effects (dirty-set membership, propagation to
// ancestors) are applied by `ChangeTree`; this type only keeps local state.

use std::collections::{BTreeMap, BTreeSet};

use super::operation::Operation;

/// Handle of a node (structure instance or container) inside a document.
///
/// Ids are assigned from a per-document counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefId(pub u32);

impl std::fmt::Display for RefId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Operations taken out of a ledger by `flush`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flushed {
    /// A structure-wide CLEAR was recorded this cycle.
    pub clear: bool,
    /// Per-index operations, ascending by index.
    pub ops: Vec<(u32, Operation)>,
}

impl Flushed {
    pub fn is_empty(&self) -> bool {
        !self.clear && self.ops.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ChangeLedger {
    owner: RefId,
    pub(crate) parent: Option<RefId>,
    pub(crate) index_in_parent: u32,
    pub(crate) root: RefId,
    pub(crate) children: BTreeSet<RefId>,
    pending: BTreeMap<u32, Operation>,
    structure_op: Option<Operation>,
    /// Indices a receiver has been (or will be) told are present.
    observed: BTreeSet<u32>,
    /// The owner has been sent in full since it was last attached.
    pub(crate) announced: bool,
}

impl ChangeLedger {
    /// A free-standing ledger: no parent, its own root.
    pub fn new(owner: RefId) -> Self {
        Self {
            owner,
            parent: None,
            index_in_parent: 0,
            root: owner,
            children: BTreeSet::new(),
            pending: BTreeMap::new(),
            structure_op: None,
            observed: BTreeSet::new(),
            announced: false,
        }
    }

    #[inline]
    pub fn owner(&self) -> RefId {
        self.owner
    }

    #[inline]
    pub fn parent(&self) -> Option<RefId> {
        self.parent
    }

    #[inline]
    pub fn index_in_parent(&self) -> u32 {
        self.index_in_parent
    }

    #[inline]
    pub fn root(&self) -> RefId {
        self.root
    }

    pub fn children(&self) -> impl Iterator<Item = RefId> + '_ {
        self.children.iter().copied()
    }

    #[inline]
    pub fn is_announced(&self) -> bool {
        self.announced
    }

    /// True if anything is waiting to be flushed.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.structure_op.is_some() || !self.pending.is_empty()
    }

    pub fn pending(&self, index: u32) -> Option<Operation> {
        self.pending.get(&index).copied()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn structure_operation(&self) -> Option<Operation> {
        self.structure_op
    }

    /// Record a change at `index`: ADD if the index was never observed
    /// present (or its ADD has not been flushed yet), REPLACE otherwise.
    ///
    /// Returns true if `index` had no pending operation before.
    pub fn record_changed(&mut self, index: u32) -> bool {
        let op = match self.pending.get(&index) {
            Some(Operation::Add) => Operation::Add,
            _ if self.observed.contains(&index) => Operation::Replace,
            _ => Operation::Add,
        };
        self.observed.insert(index);
        self.pending.insert(index, op).is_none()
    }

    /// Record a DELETE at `index`, superseding any pending operation there.
    ///
    /// Returns true if `index` had no pending operation before.
    pub fn record_deleted(&mut self, index: u32) -> bool {
        self.observed.remove(&index);
        self.pending.insert(index, Operation::Delete).is_none()
    }

    /// Record a structure-wide operation. A CLEAR forgets every observed
    /// index; per-index entries recorded before it must be discarded by the
    /// caller first.
    pub fn set_operation(&mut self, op: Operation) {
        if op == Operation::Clear {
            self.observed.clear();
        }
        self.structure_op = Some(op);
    }

    /// Drop all pending operations without emitting them.
    pub fn discard(&mut self) {
        self.pending.clear();
        self.structure_op = None;
    }

    /// Take the pending operations, leaving the ledger clean.
    pub fn flush(&mut self) -> Flushed {
        let clear = self.structure_op.take() == Some(Operation::Clear);
        let ops = std::mem::take(&mut self.pending).into_iter().collect();
        Flushed { clear, ops }
    }

    /// Put back operations taken by `flush`. Operations recorded since then
    /// win over the restored ones.
    pub fn restore(&mut self, flushed: Flushed) {
        if flushed.clear && self.structure_op.is_none() {
            self.structure_op = Some(Operation::Clear);
        }
        for (index, op) in flushed.ops {
            self.pending.entry(index).or_insert(op);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_change_is_add_then_replace() {
        let mut l = ChangeLedger::new(RefId(1));
        assert!(l.record_changed(3));
        assert_eq!(l.pending(3), Some(Operation::Add));
        // Still unflushed: stays ADD.
        assert!(!l.record_changed(3));
        assert_eq!(l.pending(3), Some(Operation::Add));

        let flushed = l.flush();
        assert_eq!(flushed.ops, vec![(3, Operation::Add)]);
        assert!(!l.is_dirty());

        l.record_changed(3);
        assert_eq!(l.pending(3), Some(Operation::Replace));
    }

    #[test]
    fn delete_supersedes_and_forgets_presence() {
        let mut l = ChangeLedger::new(RefId(1));
        l.record_changed(0);
        l.flush();
        l.record_changed(0);
        l.record_deleted(0);
        assert_eq!(l.pending(0), Some(Operation::Delete));
        l.flush();
        l.record_changed(0);
        assert_eq!(l.pending(0), Some(Operation::Add));
    }

    #[test]
    fn flush_orders_by_index() {
        let mut l = ChangeLedger::new(RefId(1));
        for i in [5, 1, 3] {
            l.record_changed(i);
        }
        let idx: Vec<u32> = l.flush().ops.into_iter().map(|(i, _)| i).collect();
        assert_eq!(idx, vec![1, 3, 5]);
    }

    #[test]
    fn restore_undoes_flush() {
        let mut l = ChangeLedger::new(RefId(1));
        l.set_operation(Operation::Clear);
        l.record_changed(2);
        let flushed = l.flush();
        assert!(!l.is_dirty());
        l.restore(flushed);
        assert_eq!(l.structure_operation(), Some(Operation::Clear));
        assert_eq!(l.pending(2), Some(Operation::Add));
    }

    #[test]
    fn clear_after_discard() {
        let mut l = ChangeLedger::new(RefId(1));
        l.record_changed(0);
        l.record_changed(1);
        l.discard();
        l.set_operation(Operation::Clear);
        let flushed = l.flush();
        assert!(flushed.clear);
        assert!(flushed.ops.is_empty());
        // Indices observed before the clear are gone.
        l.record_changed(0);
        assert_eq!(l.pending(0), Some(Operation::Add));
    }
}
