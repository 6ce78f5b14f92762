// Arena of change ledgers plus the per-root dirty sets.
//
// Invariants:
//   - every ledger reachable from a root through parent links carries that
//     root's id in `root`;
//   - a ledger is in its root's dirty set iff it has pending operations, or
//     was marked since the last flush/discard;
//   - a pending change at index `i` of a ledger implies a pending operation
//     at `index_in_parent` of its parent, up to the root.
//
// Single-threaded: the dirty sets are shared mutable state touched by every
// mutating call, so concurrent mutation would need either a lock around the
// whole tree or per-thread staging merged at flush time.

use std::collections::HashMap;

use indexmap::IndexSet;
use log::trace;

use super::ledger::{ChangeLedger, Flushed, RefId};
use super::operation::Operation;

#[derive(Debug, Default)]
pub struct ChangeTree {
    ledgers: HashMap<RefId, ChangeLedger>,
    dirty: HashMap<RefId, IndexSet<RefId>>,
}

impl ChangeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a free-standing ledger for `owner`.
    pub fn register(&mut self, owner: RefId) {
        self.ledgers.insert(owner, ChangeLedger::new(owner));
    }

    /// Remove a ledger. Children keep their (now dangling) parent link;
    /// callers detach or unregister them first.
    pub fn unregister(&mut self, owner: RefId) -> Option<ChangeLedger> {
        let ledger = self.ledgers.remove(&owner)?;
        self.undirty(ledger.root, owner);
        if let Some(parent) = ledger.parent.and_then(|p| self.ledgers.get_mut(&p)) {
            parent.children.remove(&owner);
        }
        Some(ledger)
    }

    pub fn get(&self, id: RefId) -> Option<&ChangeLedger> {
        self.ledgers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.ledgers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledgers.is_empty()
    }

    pub fn root_of(&self, id: RefId) -> Option<RefId> {
        self.ledgers.get(&id).map(ChangeLedger::root)
    }

    pub fn parent_of(&self, id: RefId) -> Option<RefId> {
        self.ledgers.get(&id).and_then(ChangeLedger::parent)
    }

    /// Ledgers currently dirty under `root`, in the order they were marked.
    pub fn dirty_set(&self, root: RefId) -> impl Iterator<Item = RefId> + '_ {
        self.dirty.get(&root).into_iter().flatten().copied()
    }

    pub fn is_dirty(&self, id: RefId) -> bool {
        self.ledgers
            .get(&id)
            .is_some_and(|l| self.dirty.get(&l.root).is_some_and(|s| s.contains(&id)))
    }

    /// True if `ancestor` is `id` or lies on the parent chain of `id`.
    pub fn is_ancestor_or_self(&self, ancestor: RefId, id: RefId) -> bool {
        let mut current = Some(id);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.parent_of(c);
        }
        false
    }

    fn mark_dirty(&mut self, id: RefId) {
        if let Some(root) = self.root_of(id) {
            self.dirty.entry(root).or_default().insert(id);
        }
    }

    fn undirty(&mut self, root: RefId, id: RefId) {
        if let Some(set) = self.dirty.get_mut(&root) {
            set.shift_remove(&id);
            if set.is_empty() {
                self.dirty.remove(&root);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// Record ADD/REPLACE at `index` and propagate a REPLACE of this ledger's
    /// slot up through every ancestor that is not already pending there.
    pub fn mark_changed(&mut self, id: RefId, index: u32) {
        let mut current = id;
        let mut index = index;
        loop {
            let Some(ledger) = self.ledgers.get_mut(&current) else {
                return;
            };
            let fresh = ledger.record_changed(index);
            let next = ledger.parent.map(|p| (p, ledger.index_in_parent));
            trace!("mark {current} index {index} (fresh: {fresh})");
            self.mark_dirty(current);
            match next {
                Some((parent, slot)) if fresh => {
                    current = parent;
                    index = slot;
                }
                _ => break,
            }
        }
    }

    /// Record DELETE at `index` and make sure ancestors reference this ledger.
    pub fn mark_deleted(&mut self, id: RefId, index: u32) {
        let Some(ledger) = self.ledgers.get_mut(&id) else {
            return;
        };
        let fresh = ledger.record_deleted(index);
        let next = ledger.parent.map(|p| (p, ledger.index_in_parent));
        self.mark_dirty(id);
        if let (true, Some((parent, slot))) = (fresh, next) {
            self.mark_changed(parent, slot);
        }
    }

    /// Record a structure-wide operation.
    pub fn set_operation(&mut self, id: RefId, op: Operation) {
        if let Some(ledger) = self.ledgers.get_mut(&id) {
            ledger.set_operation(op);
            self.mark_dirty(id);
        }
    }

    /// Mark every ancestor of `id` dirty at its own index-in-parent, whether
    /// or not it already had a pending operation there.
    pub fn touch_ancestors(&mut self, id: RefId) {
        let mut current = id;
        while let Some(ledger) = self.ledgers.get(&current) {
            let Some(parent) = ledger.parent else {
                break;
            };
            let slot = ledger.index_in_parent;
            if let Some(p) = self.ledgers.get_mut(&parent) {
                p.record_changed(slot);
            }
            self.mark_dirty(parent);
            current = parent;
        }
    }

    // -----------------------------------------------------------------------
    // Linkage
    // -----------------------------------------------------------------------

    /// Attach `id` under `parent` at `index_in_parent`. The whole subtree of
    /// `id` adopts the parent's root, and pending work moves into that root's
    /// dirty set. The subtree will be sent in full on the next delta.
    pub fn reparent(&mut self, id: RefId, parent: RefId, index_in_parent: u32) {
        let Some(new_root) = self.root_of(parent) else {
            return;
        };
        let old_parent = match self.ledgers.get_mut(&id) {
            Some(ledger) => {
                let old = ledger.parent.replace(parent);
                ledger.index_in_parent = index_in_parent;
                old
            }
            None => return,
        };
        if let Some(old) = old_parent.filter(|&p| p != parent)
            && let Some(p) = self.ledgers.get_mut(&old)
        {
            p.children.remove(&id);
        }
        if let Some(p) = self.ledgers.get_mut(&parent) {
            p.children.insert(id);
        }
        self.set_root(id, new_root, true);
    }

    /// Detach `id` from its parent; it becomes the root of its own subtree.
    pub fn detach(&mut self, id: RefId) {
        let Some(old_parent) = self.ledgers.get_mut(&id).and_then(|l| l.parent.take()) else {
            return;
        };
        if let Some(p) = self.ledgers.get_mut(&old_parent) {
            p.children.remove(&id);
        }
        self.set_root(id, id, false);
    }

    fn set_root(&mut self, id: RefId, root: RefId, reset_announced: bool) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(ledger) = self.ledgers.get_mut(&current) else {
                continue;
            };
            let old_root = ledger.root;
            ledger.root = root;
            if reset_announced {
                ledger.announced = false;
            }
            stack.extend(ledger.children.iter().copied());

            if old_root != root {
                let was_dirty = self
                    .dirty
                    .get(&old_root)
                    .is_some_and(|s| s.contains(&current));
                if was_dirty {
                    self.undirty(old_root, current);
                    self.dirty.entry(root).or_default().insert(current);
                }
            }
        }
    }

    pub(crate) fn set_announced(&mut self, id: RefId, announced: bool) {
        if let Some(ledger) = self.ledgers.get_mut(&id) {
            ledger.announced = announced;
        }
    }

    // -----------------------------------------------------------------------
    // Discard / flush
    // -----------------------------------------------------------------------

    /// Drop pending operations of `id` and leave its root's dirty set.
    pub fn discard(&mut self, id: RefId) {
        if let Some(ledger) = self.ledgers.get_mut(&id) {
            ledger.discard();
            let root = ledger.root;
            self.undirty(root, id);
        }
    }

    /// `discard` for `id` and every descendant.
    pub fn discard_subtree(&mut self, id: RefId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(ledger) = self.ledgers.get(&current) {
                stack.extend(ledger.children.iter().copied());
            }
            self.discard(current);
        }
    }

    /// Undo a `flush` of `id`: the operations go back into the ledger, the
    /// announced flag is reset to `announced`, and the ledger rejoins its
    /// root's dirty set if anything is pending.
    pub fn restore(&mut self, id: RefId, flushed: Flushed, announced: bool) {
        let Some(ledger) = self.ledgers.get_mut(&id) else {
            return;
        };
        ledger.restore(flushed);
        ledger.announced = announced;
        if ledger.is_dirty() {
            self.mark_dirty(id);
        }
    }

    /// Take the pending operations of `id` and remove it from the dirty set.
    pub fn flush(&mut self, id: RefId) -> Flushed {
        let Some(ledger) = self.ledgers.get_mut(&id) else {
            return Flushed::default();
        };
        let flushed = ledger.flush();
        let root = ledger.root;
        self.undirty(root, id);
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// root(1) -> mid(2) at slot 4 -> leaf(3) at slot 7
    fn chain() -> ChangeTree {
        let mut t = ChangeTree::new();
        for i in 1..=3 {
            t.register(RefId(i));
        }
        t.reparent(RefId(2), RefId(1), 4);
        t.reparent(RefId(3), RefId(2), 7);
        t
    }

    #[test]
    fn reparent_updates_root_transitively() {
        let mut t = ChangeTree::new();
        for i in 1..=3 {
            t.register(RefId(i));
        }
        // Build the lower link first, then attach the subtree.
        t.reparent(RefId(3), RefId(2), 0);
        assert_eq!(t.root_of(RefId(3)), Some(RefId(2)));
        t.reparent(RefId(2), RefId(1), 0);
        assert_eq!(t.root_of(RefId(2)), Some(RefId(1)));
        assert_eq!(t.root_of(RefId(3)), Some(RefId(1)));
    }

    #[test]
    fn nested_change_dirties_every_ancestor() {
        let mut t = chain();
        t.mark_changed(RefId(3), 0);
        let dirty: Vec<_> = t.dirty_set(RefId(1)).collect();
        assert!(dirty.contains(&RefId(1)));
        assert!(dirty.contains(&RefId(2)));
        assert!(dirty.contains(&RefId(3)));
        assert_eq!(t.get(RefId(2)).unwrap().pending(7), Some(Operation::Add));
        assert_eq!(t.get(RefId(1)).unwrap().pending(4), Some(Operation::Add));
    }

    #[test]
    fn pending_work_moves_with_reparent() {
        let mut t = ChangeTree::new();
        t.register(RefId(1));
        t.register(RefId(2));
        t.mark_changed(RefId(2), 0);
        assert_eq!(t.dirty_set(RefId(2)).collect::<Vec<_>>(), vec![RefId(2)]);
        t.reparent(RefId(2), RefId(1), 0);
        assert_eq!(t.dirty_set(RefId(2)).count(), 0);
        assert!(t.is_dirty(RefId(2)));
    }

    #[test]
    fn detach_stops_propagation() {
        let mut t = chain();
        t.flush(RefId(1));
        t.flush(RefId(2));
        t.flush(RefId(3));
        t.detach(RefId(3));
        t.mark_changed(RefId(3), 0);
        assert!(!t.is_dirty(RefId(2)));
        assert_eq!(t.root_of(RefId(3)), Some(RefId(3)));
        assert!(!t.get(RefId(2)).unwrap().children().any(|c| c == RefId(3)));
    }

    #[test]
    fn touch_ancestors_forces_marks() {
        let mut t = chain();
        for i in 1..=3 {
            t.flush(RefId(i));
        }
        t.set_operation(RefId(3), Operation::Clear);
        t.touch_ancestors(RefId(3));
        assert_eq!(t.get(RefId(2)).unwrap().pending(7), Some(Operation::Add));
        assert!(t.is_dirty(RefId(1)));
        assert!(t.is_dirty(RefId(3)));
    }

    #[test]
    fn restore_rejoins_dirty_set() {
        let mut t = chain();
        t.mark_changed(RefId(3), 1);
        t.set_announced(RefId(3), true);
        let flushed = t.flush(RefId(3));
        assert!(!t.is_dirty(RefId(3)));
        t.restore(RefId(3), flushed, false);
        assert!(t.is_dirty(RefId(3)));
        assert!(!t.get(RefId(3)).unwrap().is_announced());
        assert_eq!(t.get(RefId(3)).unwrap().pending(1), Some(Operation::Add));
    }

    #[test]
    fn flush_and_discard_leave_dirty_set() {
        let mut t = chain();
        t.mark_changed(RefId(3), 1);
        let flushed = t.flush(RefId(3));
        assert_eq!(flushed.ops, vec![(1, Operation::Add)]);
        assert!(!t.is_dirty(RefId(3)));
        t.discard_subtree(RefId(1));
        assert_eq!(t.dirty_set(RefId(1)).count(), 0);
    }

    #[test]
    fn ancestor_check() {
        let t = chain();
        assert!(t.is_ancestor_or_self(RefId(1), RefId(3)));
        assert!(t.is_ancestor_or_self(RefId(3), RefId(3)));
        assert!(!t.is_ancestor_or_self(RefId(3), RefId(1)));
    }
}
