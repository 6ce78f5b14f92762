// Node arena.
//
// A `Document` owns every structure instance and container of one graph,
// plus the `ChangeTree` holding their ledgers. Nodes refer to each other by
// `RefId`; dropping the document drops the whole graph at once.
//
// Mutations made through the public API are recorded in the ledgers. The
// decoder applies remote state through the crate-private `apply_*` methods,
// which link nodes but record nothing.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use log::{debug, warn};

use super::SchemaError;
use super::collection::{Collection, CollectionMut, ContainerKind};
use super::types::{ChildType, FieldDef, FieldType, SchemaType, TypeId, TypeRegistry};
use super::value::Value;
use crate::changes::{ChangeTree, RefId};

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// Error type callbacks may return; it is logged, never propagated.
pub type CallbackResult = Result<(), Box<dyn std::error::Error>>;

/// Receives `(value, key)`: the item identity for containers, the field
/// index for structure instances.
pub type Callback = Rc<dyn Fn(&Value, u32) -> CallbackResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Add,
    Remove,
    Change,
}

#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    on_add: Option<Callback>,
    on_remove: Option<Callback>,
    on_change: Option<Callback>,
}

impl Callbacks {
    fn slot(&mut self, kind: CallbackKind) -> &mut Option<Callback> {
        match kind {
            CallbackKind::Add => &mut self.on_add,
            CallbackKind::Remove => &mut self.on_remove,
            CallbackKind::Change => &mut self.on_change,
        }
    }

    pub(crate) fn get(&self, kind: CallbackKind) -> Option<&Callback> {
        match kind {
            CallbackKind::Add => self.on_add.as_ref(),
            CallbackKind::Remove => self.on_remove.as_ref(),
            CallbackKind::Change => self.on_change.as_ref(),
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_add", &self.on_add.is_some())
            .field("on_remove", &self.on_remove.is_some())
            .field("on_change", &self.on_change.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct Instance {
    pub(crate) type_id: TypeId,
    pub(crate) fields: Vec<Option<Value>>,
}

#[derive(Debug)]
pub(crate) enum NodeKind {
    Instance(Instance),
    Container(Collection),
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) callbacks: Callbacks,
}

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Instance(TypeId),
    Container { kind: ContainerKind, child: ChildType },
}

impl NodeType {
    /// True if a node of this type may fill a slot declared as `ty`.
    pub fn fits(self, ty: FieldType) -> bool {
        match (self, ty) {
            (NodeType::Instance(t), FieldType::Ref(expected)) => t == expected,
            (NodeType::Container { kind, child }, FieldType::Collection(expected)) => {
                kind == ContainerKind::Collection && child == expected
            }
            (NodeType::Container { kind, child }, FieldType::Set(expected)) => {
                kind == ContainerKind::Set && child == expected
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Document {
    registry: Rc<TypeRegistry>,
    pub(crate) nodes: HashMap<RefId, Node>,
    pub(crate) changes: ChangeTree,
    next_ref: u32,
    root: RefId,
}

impl Document {
    /// Create a document whose root is a fresh instance of `root_type`.
    pub fn new(registry: Rc<TypeRegistry>, root_type: TypeId) -> Result<Self, SchemaError> {
        let mut doc = Self {
            registry,
            nodes: HashMap::new(),
            changes: ChangeTree::new(),
            next_ref: 0,
            root: RefId(0),
        };
        doc.root = doc.create_instance(root_type)?;
        Ok(doc)
    }

    pub fn registry(&self) -> &Rc<TypeRegistry> {
        &self.registry
    }

    pub fn root(&self) -> RefId {
        self.root
    }

    /// Ledgers of every node, with the per-root dirty sets.
    pub fn changes(&self) -> &ChangeTree {
        &self.changes
    }

    pub fn contains(&self, id: RefId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of live nodes, attached or not.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_type(&self, id: RefId) -> Option<NodeType> {
        self.nodes.get(&id).map(|n| match &n.kind {
            NodeKind::Instance(i) => NodeType::Instance(i.type_id),
            NodeKind::Container(c) => NodeType::Container {
                kind: c.kind(),
                child: c.child(),
            },
        })
    }

    fn alloc(&mut self, kind: NodeKind) -> RefId {
        let id = RefId(self.next_ref);
        self.next_ref += 1;
        self.nodes.insert(
            id,
            Node {
                kind,
                callbacks: Callbacks::default(),
            },
        );
        self.changes.register(id);
        id
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create a free-standing instance of `ty`.
    pub fn create_instance(&mut self, ty: TypeId) -> Result<RefId, SchemaError> {
        let field_count = self.registry.get(ty)?.fields().len();
        Ok(self.alloc(NodeKind::Instance(Instance {
            type_id: ty,
            fields: vec![None; field_count],
        })))
    }

    /// Create a free-standing, empty collection.
    pub fn create_collection(&mut self, child: ChildType) -> Result<RefId, SchemaError> {
        self.create_container(ContainerKind::Collection, child)
    }

    /// Create a free-standing, empty set.
    pub fn create_set(&mut self, child: ChildType) -> Result<RefId, SchemaError> {
        self.create_container(ContainerKind::Set, child)
    }

    fn create_container(
        &mut self,
        kind: ContainerKind,
        child: ChildType,
    ) -> Result<RefId, SchemaError> {
        if let ChildType::Schema(t) = child {
            self.registry.get(t)?;
        }
        Ok(self.alloc(NodeKind::Container(Collection::new(kind, child))))
    }

    /// Create an empty node suitable for a slot of type `ty`.
    pub(crate) fn create_for(&mut self, ty: FieldType) -> Result<RefId, SchemaError> {
        match ty {
            FieldType::Ref(t) => self.create_instance(t),
            FieldType::Collection(c) => self.create_collection(c),
            FieldType::Set(c) => self.create_set(c),
            FieldType::Primitive(p) => Err(SchemaError::TypeMismatch {
                expected: "node".into(),
                found: p.name().into(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Structure instances
    // -----------------------------------------------------------------------

    fn instance(&self, id: RefId) -> Result<&Instance, SchemaError> {
        match self.nodes.get(&id).map(|n| &n.kind) {
            Some(NodeKind::Instance(i)) => Ok(i),
            Some(_) => Err(SchemaError::NotAnInstance(id)),
            None => Err(SchemaError::UnknownNode(id)),
        }
    }

    fn instance_mut(&mut self, id: RefId) -> Result<&mut Instance, SchemaError> {
        match self.nodes.get_mut(&id).map(|n| &mut n.kind) {
            Some(NodeKind::Instance(i)) => Ok(i),
            Some(_) => Err(SchemaError::NotAnInstance(id)),
            None => Err(SchemaError::UnknownNode(id)),
        }
    }

    /// Field table of the instance `id`.
    pub fn schema_of(&self, id: RefId) -> Result<&SchemaType, SchemaError> {
        let type_id = self.instance(id)?.type_id;
        self.registry.get(type_id)
    }

    fn field_def(&self, id: RefId, field: &str) -> Result<FieldDef, SchemaError> {
        let schema = self.schema_of(id)?;
        schema
            .field_by_name(field)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownField {
                type_name: schema.name().to_owned(),
                field: field.to_owned(),
            })
    }

    fn field_def_at(&self, id: RefId, index: u32) -> Result<FieldDef, SchemaError> {
        let schema = self.schema_of(id)?;
        schema
            .field(index)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownField {
                type_name: schema.name().to_owned(),
                field: index.to_string(),
            })
    }

    /// Set a field by name. Setting `Value::Null` removes the field.
    pub fn set(
        &mut self,
        id: RefId,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<(), SchemaError> {
        let def = self.field_def(id, field)?;
        self.set_field(id, def.index, value.into())
    }

    /// Set a field by index.
    pub fn set_field(&mut self, id: RefId, index: u32, value: Value) -> Result<(), SchemaError> {
        let def = self.field_def_at(id, index)?;
        if value.is_null() {
            return self.remove_field_at(id, index).map(|_| ());
        }
        let value = def.ty.normalize(value);
        let current = self.instance(id)?.fields[index as usize].as_ref();
        if current == Some(&value) {
            return Ok(());
        }
        self.check_slot(id, def.ty, &value)?;

        let old = self.instance_mut(id)?.fields[index as usize].replace(value.clone());
        if let Some(Value::Ref(old_ref)) = old {
            self.changes.detach(old_ref);
        }
        if let Value::Ref(child) = value {
            self.changes.reparent(child, id, index);
        }
        self.changes.mark_changed(id, index);
        Ok(())
    }

    pub fn get(&self, id: RefId, field: &str) -> Option<&Value> {
        let def = self.field_def(id, field).ok()?;
        self.get_field(id, def.index)
    }

    pub fn get_field(&self, id: RefId, index: u32) -> Option<&Value> {
        self.instance(id)
            .ok()?
            .fields
            .get(index as usize)?
            .as_ref()
    }

    /// Remove a field by name, returning its previous value.
    pub fn remove_field(&mut self, id: RefId, field: &str) -> Result<Option<Value>, SchemaError> {
        let def = self.field_def(id, field)?;
        self.remove_field_at(id, def.index)
    }

    fn remove_field_at(&mut self, id: RefId, index: u32) -> Result<Option<Value>, SchemaError> {
        let old = match self.instance_mut(id)?.fields.get_mut(index as usize) {
            Some(slot) => slot.take(),
            None => None,
        };
        if let Some(v) = &old {
            if let Value::Ref(child) = v {
                self.changes.detach(*child);
            }
            self.changes.mark_deleted(id, index);
        }
        Ok(old)
    }

    /// Validate `value` for a slot of type `ty` under `parent`.
    pub(crate) fn check_slot(
        &self,
        parent: RefId,
        ty: FieldType,
        value: &Value,
    ) -> Result<(), SchemaError> {
        match (ty, value) {
            (FieldType::Primitive(p), v) => {
                if p.accepts(v) {
                    Ok(())
                } else {
                    Err(SchemaError::TypeMismatch {
                        expected: p.name().into(),
                        found: v.kind().into(),
                    })
                }
            }
            (_, Value::Ref(child)) => {
                let node_type = self
                    .node_type(*child)
                    .ok_or(SchemaError::UnknownNode(*child))?;
                if !node_type.fits(ty) {
                    return Err(SchemaError::TypeMismatch {
                        expected: format!("{ty:?}"),
                        found: format!("{node_type:?}"),
                    });
                }
                if self.changes.is_ancestor_or_self(*child, parent) {
                    return Err(SchemaError::Cycle(*child));
                }
                if *child == self.root || self.changes.parent_of(*child).is_some() {
                    return Err(SchemaError::AlreadyAttached(*child));
                }
                Ok(())
            }
            (_, v) => Err(SchemaError::TypeMismatch {
                expected: format!("{ty:?}"),
                found: v.kind().into(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Containers
    // -----------------------------------------------------------------------

    /// Read-only access to a container.
    pub fn container(&self, id: RefId) -> Result<&Collection, SchemaError> {
        match self.nodes.get(&id).map(|n| &n.kind) {
            Some(NodeKind::Container(c)) => Ok(c),
            Some(_) => Err(SchemaError::NotAContainer(id)),
            None => Err(SchemaError::UnknownNode(id)),
        }
    }

    pub(crate) fn container_mut(&mut self, id: RefId) -> Result<&mut Collection, SchemaError> {
        match self.nodes.get_mut(&id).map(|n| &mut n.kind) {
            Some(NodeKind::Container(c)) => Ok(c),
            Some(_) => Err(SchemaError::NotAContainer(id)),
            None => Err(SchemaError::UnknownNode(id)),
        }
    }

    /// Mutating view of a container.
    pub fn collection(&mut self, id: RefId) -> Result<CollectionMut<'_>, SchemaError> {
        self.container(id)?;
        Ok(CollectionMut::new(self, id))
    }

    // -----------------------------------------------------------------------
    // Callbacks
    // -----------------------------------------------------------------------

    fn register_callback(
        &mut self,
        id: RefId,
        kind: CallbackKind,
        callback: Callback,
    ) -> Result<(), SchemaError> {
        let node = self.nodes.get_mut(&id).ok_or(SchemaError::UnknownNode(id))?;
        *node.callbacks.slot(kind) = Some(callback);
        Ok(())
    }

    pub fn on_add<F>(&mut self, id: RefId, f: F) -> Result<(), SchemaError>
    where
        F: Fn(&Value, u32) -> CallbackResult + 'static,
    {
        self.register_callback(id, CallbackKind::Add, Rc::new(f))
    }

    pub fn on_remove<F>(&mut self, id: RefId, f: F) -> Result<(), SchemaError>
    where
        F: Fn(&Value, u32) -> CallbackResult + 'static,
    {
        self.register_callback(id, CallbackKind::Remove, Rc::new(f))
    }

    pub fn on_change<F>(&mut self, id: RefId, f: F) -> Result<(), SchemaError>
    where
        F: Fn(&Value, u32) -> CallbackResult + 'static,
    {
        self.register_callback(id, CallbackKind::Change, Rc::new(f))
    }

    /// Invoke a registered callback; failures are logged and swallowed.
    pub(crate) fn fire(&self, id: RefId, kind: CallbackKind, value: &Value, key: u32) {
        let Some(cb) = self
            .nodes
            .get(&id)
            .and_then(|n| n.callbacks.get(kind))
            .cloned()
        else {
            return;
        };
        if let Err(e) = cb(value, key) {
            warn!("{kind:?} callback on {id} failed for key {key}: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Slots (shared by encoder and decoder)
    // -----------------------------------------------------------------------

    /// Declared type of slot `index` in node `id`.
    pub(crate) fn slot_type(&self, id: RefId, index: u32) -> Option<FieldType> {
        match &self.nodes.get(&id)?.kind {
            NodeKind::Instance(i) => self
                .registry
                .get(i.type_id)
                .ok()?
                .field(index)
                .map(|f| f.ty),
            NodeKind::Container(c) => Some(c.child().into()),
        }
    }

    pub(crate) fn slot_value(&self, id: RefId, index: u32) -> Option<&Value> {
        match &self.nodes.get(&id)?.kind {
            NodeKind::Instance(i) => i.fields.get(index as usize)?.as_ref(),
            NodeKind::Container(c) => c.at(index),
        }
    }

    /// Every occupied slot of `id`: ascending field index for instances,
    /// iteration order for containers.
    pub(crate) fn live_slots(&self, id: RefId) -> Vec<(u32, Value)> {
        match self.nodes.get(&id).map(|n| &n.kind) {
            Some(NodeKind::Instance(i)) => i
                .fields
                .iter()
                .enumerate()
                .filter_map(|(idx, v)| v.clone().map(|v| (idx as u32, v)))
                .collect(),
            Some(NodeKind::Container(c)) => c.iter().map(|(k, v)| (k, v.clone())).collect(),
            None => Vec::new(),
        }
    }

    /// True if `target` is `from` or is held, directly or through nested
    /// nodes, in one of its slots.
    pub(crate) fn reaches(&self, from: RefId, target: RefId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            match self.nodes.get(&id).map(|n| &n.kind) {
                Some(NodeKind::Instance(i)) => {
                    stack.extend(i.fields.iter().flatten().filter_map(Value::as_ref_id));
                }
                Some(NodeKind::Container(c)) => {
                    stack.extend(c.values().filter_map(Value::as_ref_id));
                }
                None => {}
            }
        }
        false
    }

    pub(crate) fn is_container(&self, id: RefId) -> bool {
        matches!(
            self.nodes.get(&id).map(|n| &n.kind),
            Some(NodeKind::Container(_))
        )
    }

    /// Decode side: write a field without recording a change. Returns the
    /// previous value.
    pub(crate) fn apply_field(
        &mut self,
        id: RefId,
        index: u32,
        value: Option<Value>,
    ) -> Result<Option<Value>, SchemaError> {
        let instance = self.instance_mut(id)?;
        let Some(slot) = instance.fields.get_mut(index as usize) else {
            return Ok(None);
        };
        let old = std::mem::replace(slot, value.clone());
        if let Some(Value::Ref(old_ref)) = &old
            && value.as_ref() != old.as_ref()
        {
            self.unlink(*old_ref, id, index);
        }
        if let Some(Value::Ref(child)) = value {
            self.changes.reparent(child, id, index);
        }
        Ok(old)
    }

    /// Detach `child` if it is still linked at `parent[index]`.
    pub(crate) fn unlink(&mut self, child: RefId, parent: RefId, index: u32) {
        let linked_here = self
            .changes
            .get(child)
            .is_some_and(|l| l.parent() == Some(parent) && l.index_in_parent() == index);
        if linked_here {
            self.changes.detach(child);
        }
    }

    /// Remove one node and its ledger; its children are detached, not
    /// removed.
    pub(crate) fn drop_node(&mut self, id: RefId) -> Option<Vec<Value>> {
        let children: Vec<RefId> = self
            .changes
            .get(id)
            .map(|l| l.children().collect())
            .unwrap_or_default();
        for child in children {
            self.changes.detach(child);
        }
        self.changes.unregister(id);
        let node = self.nodes.remove(&id)?;
        let values = match node.kind {
            NodeKind::Instance(i) => i.fields.into_iter().flatten().collect(),
            NodeKind::Container(c) => c.into_values(),
        };
        Some(values)
    }

    /// Drop a free-standing node and everything beneath it.
    pub fn release(&mut self, id: RefId) -> Result<(), SchemaError> {
        if !self.contains(id) {
            return Err(SchemaError::UnknownNode(id));
        }
        if id == self.root || self.changes.parent_of(id).is_some() {
            return Err(SchemaError::AlreadyAttached(id));
        }
        let mut stack = vec![id];
        let mut released = 0usize;
        while let Some(current) = stack.pop() {
            if let Some(values) = self.drop_node(current) {
                released += 1;
                stack.extend(values.iter().filter_map(Value::as_ref_id));
            }
        }
        debug!("released {released} nodes under {id}");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Clone
    // -----------------------------------------------------------------------

    /// Copy a node.
    ///
    /// With `for_decoding`, the copy is shallow: same items and field values
    /// (nested nodes are shared by handle) and the same callbacks. Otherwise
    /// nested nodes are cloned recursively and plain values are copied,
    /// giving an independent graph whose every slot is pending as ADD.
    pub fn clone_node(&mut self, id: RefId, for_decoding: bool) -> Result<RefId, SchemaError> {
        let node = self.nodes.get(&id).ok_or(SchemaError::UnknownNode(id))?;

        if for_decoding {
            let kind = match &node.kind {
                NodeKind::Instance(i) => NodeKind::Instance(i.clone()),
                NodeKind::Container(c) => NodeKind::Container(c.clone()),
            };
            let callbacks = node.callbacks.clone();
            let copy = self.alloc(kind);
            if let Some(n) = self.nodes.get_mut(&copy) {
                n.callbacks = callbacks;
            }
            return Ok(copy);
        }

        let slots = self.live_slots(id);
        match self.node_type(id).ok_or(SchemaError::UnknownNode(id))? {
            NodeType::Instance(type_id) => {
                let copy = self.create_instance(type_id)?;
                for (index, value) in slots {
                    let value = self.deep_copy(value)?;
                    self.set_field(copy, index, value)?;
                }
                Ok(copy)
            }
            NodeType::Container { kind, child } => {
                let copy = self.create_container(kind, child)?;
                for (_, value) in slots {
                    let value = self.deep_copy(value)?;
                    self.collection(copy)?.add(value)?;
                }
                Ok(copy)
            }
        }
    }

    fn deep_copy(&mut self, value: Value) -> Result<Value, SchemaError> {
        match value {
            Value::Ref(r) => Ok(Value::Ref(self.clone_node(r, false)?)),
            v => Ok(v),
        }
    }

    // -----------------------------------------------------------------------
    // Projection
    // -----------------------------------------------------------------------

    /// Read-only export as a JSON value: instances become objects keyed by
    /// field name, containers objects keyed by item identity.
    pub fn to_json(&self, id: RefId) -> Result<serde_json::Value, SchemaError> {
        let node = self.nodes.get(&id).ok_or(SchemaError::UnknownNode(id))?;
        let mut obj = serde_json::Map::new();
        match &node.kind {
            NodeKind::Instance(i) => {
                let schema = self.registry.get(i.type_id)?;
                for (def, value) in schema.fields().iter().zip(&i.fields) {
                    if let Some(v) = value {
                        obj.insert(def.name.clone(), self.value_to_json(v)?);
                    }
                }
            }
            NodeKind::Container(c) => {
                for (key, v) in c.iter() {
                    obj.insert(key.to_string(), self.value_to_json(v)?);
                }
            }
        }
        Ok(serde_json::Value::Object(obj))
    }

    fn value_to_json(&self, value: &Value) -> Result<serde_json::Value, SchemaError> {
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::json!(i),
            Value::UInt(u) => serde_json::json!(u),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::json!(b),
            Value::Ref(r) => self.to_json(*r)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
