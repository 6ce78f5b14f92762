// Containers.
//
// A container holds items keyed by an identity drawn from its own counter,
// plus a position table used by the decoder to address items by wire index.
// Identities are strictly increasing and never reused, even after removals
// or a clear.
//
// `Collection` is the storage and read API. Mutation goes through
// `CollectionMut`, a short-lived view borrowing the owning `Document` so
// every change reaches the ledger.

use indexmap::IndexMap;

use super::SchemaError;
use super::document::{CallbackKind, Document};
use super::types::{ChildType, FieldType};
use super::value::Value;
use crate::changes::{Operation, RefId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    /// Items keyed by identity; duplicates allowed.
    Collection,
    /// Holds each value at most once.
    Set,
}

#[derive(Debug, Clone)]
pub struct Collection {
    kind: ContainerKind,
    child: ChildType,
    /// identity -> value, in insertion order.
    items: IndexMap<u32, Value>,
    /// position -> identity.
    indexes: IndexMap<u32, u32>,
    next_identity: u32,
}

impl Collection {
    pub(crate) fn new(kind: ContainerKind, child: ChildType) -> Self {
        Self {
            kind,
            child,
            items: IndexMap::new(),
            indexes: IndexMap::new(),
            next_identity: 0,
        }
    }

    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    pub fn child(&self) -> ChildType {
        self.child
    }

    /// Item with identity `key`.
    pub fn at(&self, key: u32) -> Option<&Value> {
        self.items.get(&key)
    }

    pub fn has(&self, value: &Value) -> bool {
        self.position_of(value).is_some()
    }

    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Identity the next `add` will hand out.
    pub fn next_identity(&self) -> u32 {
        self.next_identity
    }

    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.items.keys().copied()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> + '_ {
        self.items.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Value)> + '_ {
        self.items.iter().map(|(k, v)| (*k, v))
    }

    pub fn for_each(&self, mut f: impl FnMut(&Value, u32)) {
        for (k, v) in &self.items {
            f(v, *k);
        }
    }

    /// Identity of the first item equal to `value` (linear scan).
    pub fn position_of(&self, value: &Value) -> Option<u32> {
        self.items
            .iter()
            .find_map(|(k, v)| (v == value).then_some(*k))
    }

    pub(crate) fn into_values(self) -> Vec<Value> {
        self.items.into_values().collect()
    }
}

// ---------------------------------------------------------------------------
// Mutating view
// ---------------------------------------------------------------------------

pub struct CollectionMut<'a> {
    doc: &'a mut Document,
    id: RefId,
}

impl<'a> CollectionMut<'a> {
    pub(crate) fn new(doc: &'a mut Document, id: RefId) -> Self {
        Self { doc, id }
    }

    pub fn id(&self) -> RefId {
        self.id
    }

    fn view(&self) -> Option<&Collection> {
        self.doc.container(self.id).ok()
    }

    pub fn at(&self, key: u32) -> Option<&Value> {
        self.view()?.at(key)
    }

    pub fn has(&self, value: &Value) -> bool {
        self.view().is_some_and(|c| c.has(value))
    }

    pub fn size(&self) -> usize {
        self.view().map_or(0, Collection::size)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Append `value` under a fresh identity and record ADD.
    ///
    /// On a set, a value already held is not added again; its identity is
    /// returned and nothing is recorded. Errors on a value the child type
    /// rejects, on a node that is already attached elsewhere, and once the
    /// container has handed out its last identity.
    pub fn add(&mut self, value: impl Into<Value>) -> Result<u32, SchemaError> {
        let coll = self.doc.container(self.id)?;
        let value = FieldType::from(coll.child).normalize(value.into());
        if coll.kind == ContainerKind::Set
            && let Some(existing) = coll.position_of(&value)
        {
            return Ok(existing);
        }
        self.doc.check_slot(self.id, coll.child.into(), &value)?;

        let coll = self.doc.container_mut(self.id)?;
        let identity = coll.next_identity;
        let Some(next) = identity.checked_add(1) else {
            return Err(SchemaError::IdentitiesExhausted(self.id));
        };
        coll.next_identity = next;
        coll.indexes.insert(identity, identity);
        coll.items.insert(identity, value.clone());

        if let Value::Ref(child) = value {
            self.doc.changes.reparent(child, self.id, identity);
        }
        self.doc.changes.mark_changed(self.id, identity);
        Ok(identity)
    }

    /// Replace the item at `key` in place and record REPLACE.
    ///
    /// Returns the previous value, or `None` if `key` is not held (nothing
    /// changes then). On a set, a value already held under another key
    /// leaves the set unchanged.
    pub fn replace(
        &mut self,
        key: u32,
        value: impl Into<Value>,
    ) -> Result<Option<Value>, SchemaError> {
        let coll = self.doc.container(self.id)?;
        let value = FieldType::from(coll.child).normalize(value.into());
        let Some(current) = coll.at(key) else {
            return Ok(None);
        };
        if *current == value {
            return Ok(Some(value));
        }
        if coll.kind == ContainerKind::Set && coll.position_of(&value).is_some() {
            return Ok(None);
        }
        self.doc.check_slot(self.id, coll.child.into(), &value)?;

        let coll = self.doc.container_mut(self.id)?;
        let old = coll.items.insert(key, value.clone());
        if let Some(Value::Ref(old_ref)) = old {
            self.doc.changes.detach(old_ref);
        }
        if let Value::Ref(child) = value {
            self.doc.changes.reparent(child, self.id, key);
        }
        self.doc.changes.mark_changed(self.id, key);
        Ok(old)
    }

    /// Remove the first item equal to `value` (linear scan) and record
    /// DELETE. A removed node is detached but stays in the document.
    pub fn remove(&mut self, value: &Value) -> bool {
        let Ok(coll) = self.doc.container_mut(self.id) else {
            return false;
        };
        let Some(identity) = coll.position_of(value) else {
            return false;
        };
        coll.items.shift_remove(&identity);
        coll.indexes.retain(|_, v| *v != identity);
        if let Value::Ref(child) = value {
            self.doc.changes.detach(*child);
        }
        self.doc.changes.mark_deleted(self.id, identity);
        true
    }

    /// Drop every item. Pending operations of the whole subtree are
    /// discarded and a single CLEAR is recorded; every ancestor is marked
    /// at its own slot.
    pub fn clear(&mut self) {
        self.doc.changes.discard_subtree(self.id);
        let Ok(coll) = self.doc.container_mut(self.id) else {
            return;
        };
        coll.indexes.clear();
        let items = std::mem::take(&mut coll.items);
        for child in items.values().filter_map(Value::as_ref_id) {
            self.doc.changes.detach(child);
        }
        self.doc.changes.set_operation(self.id, Operation::Clear);
        self.doc.changes.touch_ancestors(self.id);
    }

    /// Replay the add callback for every held item, in iteration order.
    pub fn trigger_all(&self) {
        let Some(coll) = self.view() else {
            return;
        };
        for (key, value) in coll.iter() {
            self.doc.fire(self.id, CallbackKind::Add, value, key);
        }
    }

    // -----------------------------------------------------------------------
    // Decode-side positional helpers. These never touch the ledger.
    // -----------------------------------------------------------------------

    pub(crate) fn set_index(&mut self, position: u32, identity: u32) {
        if let Ok(coll) = self.doc.container_mut(self.id) {
            coll.indexes.insert(position, identity);
        }
    }

    pub(crate) fn get_by_index(&self, position: u32) -> Option<u32> {
        self.view()?.indexes.get(&position).copied()
    }

    /// Remove the item at wire `position`; returns it.
    pub(crate) fn delete_by_index(&mut self, position: u32) -> Option<Value> {
        let coll = self.doc.container_mut(self.id).ok()?;
        let identity = coll.indexes.shift_remove(&position)?;
        let old = coll.items.shift_remove(&identity)?;
        coll.indexes.retain(|_, v| *v != identity);
        if let Value::Ref(child) = old {
            self.doc.unlink(child, self.id, identity);
        }
        Some(old)
    }

    /// Empty both tables and discard locally pending operations of the
    /// subtree. Returns the dropped items.
    pub(crate) fn clear_all_indexes(&mut self) -> Vec<(u32, Value)> {
        self.doc.changes.discard_subtree(self.id);
        let Ok(coll) = self.doc.container_mut(self.id) else {
            return Vec::new();
        };
        coll.indexes.clear();
        let items: Vec<(u32, Value)> = std::mem::take(&mut coll.items).into_iter().collect();
        for (key, value) in &items {
            if let Value::Ref(child) = value {
                self.doc.unlink(*child, self.id, *key);
            }
        }
        items
    }

    /// Store `value` at wire `position`, reusing the identity already mapped
    /// there or adopting `position` as the identity. Returns the previous
    /// value. Adopting `u32::MAX` leaves no identity for a later `add`.
    pub(crate) fn insert_at(&mut self, position: u32, value: Value) -> Option<Value> {
        let coll = self.doc.container_mut(self.id).ok()?;
        let identity = coll.indexes.get(&position).copied().unwrap_or(position);
        coll.indexes.insert(position, identity);
        coll.next_identity = coll.next_identity.max(identity.saturating_add(1));
        let old = coll.items.insert(identity, value.clone());
        self.link(identity, old.as_ref(), &value);
        old
    }

    /// Overwrite the item at wire `position`. `None` if nothing is there.
    pub(crate) fn replace_at(&mut self, position: u32, value: Value) -> Option<Value> {
        let coll = self.doc.container_mut(self.id).ok()?;
        let identity = *coll.indexes.get(&position)?;
        let slot = coll.items.get_mut(&identity)?;
        let old = std::mem::replace(slot, value.clone());
        self.link(identity, Some(&old), &value);
        Some(old)
    }

    fn link(&mut self, identity: u32, old: Option<&Value>, new: &Value) {
        if let Some(Value::Ref(old_ref)) = old
            && old != Some(new)
        {
            self.doc.unlink(*old_ref, self.id, identity);
        }
        if let Value::Ref(child) = new {
            self.doc.changes.reparent(*child, self.id, identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::schema::types::{PrimitiveType, SchemaBuilder, TypeId, TypeRegistry};

    fn doc() -> (Document, TypeId) {
        let mut reg = TypeRegistry::new();
        let item = reg.add(SchemaBuilder::new("Item").field("n", PrimitiveType::Int32));
        let root = reg.add(
            SchemaBuilder::new("Root")
                .field("list", crate::schema::FieldType::Collection(ChildType::Schema(item))),
        );
        (Document::new(Rc::new(reg), root).unwrap(), item)
    }

    #[test]
    fn identities_strictly_increase_across_removals() {
        let (mut doc, _) = doc();
        let c = doc.create_collection(PrimitiveType::String.into()).unwrap();
        let mut coll = doc.collection(c).unwrap();
        let a = coll.add("a").unwrap();
        let b = coll.add("b").unwrap();
        assert!(coll.remove(&Value::from("b")));
        let d = coll.add("d").unwrap();
        assert!(a < b && b < d);
        coll.clear();
        let e = coll.add("e").unwrap();
        assert!(e > d);
    }

    #[test]
    fn remove_by_value() {
        let (mut doc, _) = doc();
        let c = doc.create_collection(PrimitiveType::Int32.into()).unwrap();
        let mut coll = doc.collection(c).unwrap();
        coll.add(7).unwrap();
        coll.add(8).unwrap();
        assert!(!coll.remove(&Value::Int(9)));
        assert!(coll.remove(&Value::Int(7)));
        assert_eq!(coll.size(), 1);
        assert!(!coll.has(&Value::Int(7)));
        assert_eq!(coll.at(1), Some(&Value::Int(8)));
        assert_eq!(coll.at(0), None);
    }

    #[test]
    fn clear_leaves_a_single_structure_op() {
        let (mut doc, _) = doc();
        let c = doc.create_collection(PrimitiveType::Int32.into()).unwrap();
        {
            let mut coll = doc.collection(c).unwrap();
            coll.add(1).unwrap();
            coll.add(2).unwrap();
            coll.remove(&Value::Int(1));
            coll.clear();
            assert_eq!(coll.size(), 0);
        }
        let ledger = doc.changes().get(c).unwrap();
        assert_eq!(ledger.structure_operation(), Some(Operation::Clear));
        assert_eq!(ledger.pending_len(), 0);
    }

    #[test]
    fn clear_touches_ancestors() {
        let (mut doc, item) = doc();
        let root = doc.root();
        let list = doc.create_collection(ChildType::Schema(item)).unwrap();
        doc.set(root, "list", list).unwrap();
        let it = doc.create_instance(item).unwrap();
        doc.collection(list).unwrap().add(it).unwrap();
        for id in [root, list, it] {
            doc.changes.flush(id);
        }

        doc.collection(list).unwrap().clear();
        assert!(doc.changes().is_dirty(root));
        assert_eq!(doc.changes().get(root).unwrap().pending(0), Some(Operation::Replace));
        assert_eq!(doc.changes().parent_of(it), None);
    }

    #[test]
    fn set_rejects_duplicates() {
        let (mut doc, _) = doc();
        let s = doc.create_set(PrimitiveType::String.into()).unwrap();
        let mut set = doc.collection(s).unwrap();
        let a = set.add("x").unwrap();
        let b = set.add("x").unwrap();
        assert_eq!(a, b);
        assert_eq!(set.size(), 1);
    }

    #[test]
    fn replace_in_place() {
        let (mut doc, _) = doc();
        let c = doc.create_collection(PrimitiveType::String.into()).unwrap();
        let key = doc.collection(c).unwrap().add("a").unwrap();
        doc.changes.flush(c);
        let old = doc.collection(c).unwrap().replace(key, "b").unwrap();
        assert_eq!(old, Some(Value::from("a")));
        assert_eq!(
            doc.changes().get(c).unwrap().pending(key),
            Some(Operation::Replace)
        );
        assert_eq!(doc.collection(c).unwrap().replace(99, "z").unwrap(), None);
    }

    #[test]
    fn child_type_is_enforced() {
        let (mut doc, _) = doc();
        let c = doc.create_collection(PrimitiveType::Uint8.into()).unwrap();
        let mut coll = doc.collection(c).unwrap();
        assert!(coll.add(300).is_err());
        assert!(coll.add(Value::Null).is_err());
        assert!(coll.is_empty());
    }

    #[test]
    fn positional_helpers() {
        let (mut doc, _) = doc();
        let c = doc.create_collection(PrimitiveType::Int32.into()).unwrap();
        let mut coll = doc.collection(c).unwrap();
        assert_eq!(coll.insert_at(3, Value::Int(30)), None);
        assert_eq!(coll.get_by_index(3), Some(3));
        assert_eq!(coll.replace_at(3, Value::Int(31)), Some(Value::Int(30)));
        assert_eq!(coll.replace_at(4, Value::Int(40)), None);
        coll.set_index(5, 3);
        assert_eq!(coll.get_by_index(5), Some(3));
        assert_eq!(coll.delete_by_index(3), Some(Value::Int(31)));
        assert_eq!(coll.delete_by_index(3), None);
        coll.insert_at(0, Value::Int(1));
        let dropped = coll.clear_all_indexes();
        assert_eq!(dropped, vec![(0, Value::Int(1))]);
        assert!(coll.is_empty());
        assert_eq!(coll.get_by_index(0), None);
        // Identities handed out locally continue above decoded ones.
        assert_eq!(doc.container(c).unwrap().next_identity(), 4);
        assert!(!doc.changes().is_dirty(c));
    }

    #[test]
    fn add_refuses_once_identities_run_out() {
        let (mut doc, _) = doc();
        let c = doc.create_collection(PrimitiveType::Int32.into()).unwrap();
        let mut coll = doc.collection(c).unwrap();
        coll.insert_at(u32::MAX, Value::Int(1));
        assert_eq!(coll.add(2), Err(SchemaError::IdentitiesExhausted(c)));
        assert_eq!(coll.size(), 1);
        assert_eq!(doc.container(c).unwrap().next_identity(), u32::MAX);
        assert!(!doc.changes().is_dirty(c));
    }

    #[test]
    fn trigger_all_replays_in_order() {
        let (mut doc, _) = doc();
        let c = doc.create_collection(PrimitiveType::String.into()).unwrap();
        for s in ["p", "q", "r"] {
            doc.collection(c).unwrap().add(s).unwrap();
        }
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        doc.on_add(c, move |v, k| {
            sink.borrow_mut().push((k, v.as_str().unwrap_or_default().to_owned()));
            Ok(())
        })
        .unwrap();
        doc.collection(c).unwrap().trigger_all();
        assert_eq!(
            *seen.borrow(),
            vec![(0, "p".to_owned()), (1, "q".to_owned()), (2, "r".to_owned())]
        );
    }
}
