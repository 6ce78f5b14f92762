// Schema decoder: applies encoded buffers to a `Document`.
//
// A `Decoder` is bound to one receiving document for its whole life: it
// maps sender reference ids to local nodes and counts how many slots
// reference each node, releasing nodes nobody references any more.
//
// Failure model: a malformed buffer fails fast and leaves the document
// partially applied; the caller discards it and resynchronises from a
// snapshot. Stale references (REPLACE/DELETE of something already gone)
// are not failures; they are logged and skipped.

use std::collections::HashMap;

use log::{debug, trace};
use thiserror::Error;

use crate::changes::{END_OF_STRUCTURE, Operation, RefId};
use crate::encoder::DEFAULT_MAX_DEPTH;
use crate::msgpack::{self, DecodeContext, Reader};
use crate::schema::{
    CallbackKind, ChildType, Document, FieldType, PrimitiveType, SchemaError, TypeId, Value,
};

// ---------------------------------------------------------------------------
// Options / stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Deepest structure nesting accepted before failing.
    pub max_depth: usize,
    /// Run registered add/remove/change callbacks while applying.
    pub invoke_callbacks: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            invoke_callbacks: true,
        }
    }
}

/// Counters for one applied buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Records applied, CLEAR included.
    pub records: usize,
    /// REPLACE/DELETE records whose target was not present.
    pub missing: usize,
    /// Nodes created locally.
    pub created: usize,
    /// Nodes released because no slot references them any more.
    pub released: usize,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Primitive(#[from] msgpack::DecodeError),
    #[error("node {node} has no field {index}")]
    UnknownField { node: RefId, index: u32 },
    #[error("unknown operation tag {0:#04x}")]
    UnknownOperation(u8),
    #[error("{op} is not valid on node {node}")]
    UnexpectedOperation { op: Operation, node: RefId },
    #[error("unexpected value: expected {expected}, found {found}")]
    UnexpectedValue { expected: String, found: String },
    #[error("structure nesting exceeds {0} levels")]
    DepthLimit(usize),
    #[error("{0} trailing bytes after the root block")]
    TrailingBytes(usize),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

fn unexpected(expected: impl Into<String>, found: impl Into<String>) -> DecodeError {
    DecodeError::UnexpectedValue {
        expected: expected.into(),
        found: found.into(),
    }
}

// ---------------------------------------------------------------------------
// Reference tracking
// ---------------------------------------------------------------------------

/// Sender refid -> local node, plus per-node reference counts.
///
/// A count reaching zero only queues the node; `collect` removes whatever is
/// still unreferenced once the whole buffer has been applied, so a node moved
/// between slots within one buffer survives.
#[derive(Debug, Default)]
pub struct ReferenceTracker {
    local: HashMap<u32, RefId>,
    wire: HashMap<RefId, u32>,
    counts: HashMap<RefId, u32>,
    orphans: Vec<RefId>,
}

impl ReferenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, wire: u32) -> Option<RefId> {
        self.local.get(&wire).copied()
    }

    pub fn count(&self, local: RefId) -> u32 {
        self.counts.get(&local).copied().unwrap_or(0)
    }

    /// Number of tracked nodes.
    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    fn bind(&mut self, wire: u32, local: RefId) {
        self.local.insert(wire, local);
        self.wire.insert(local, wire);
    }

    fn retain(&mut self, local: RefId) {
        *self.counts.entry(local).or_default() += 1;
    }

    fn release(&mut self, local: RefId) {
        if let Some(count) = self.counts.get_mut(&local) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.orphans.push(local);
            }
        }
    }

    /// Remove queued nodes whose count is still zero, releasing the
    /// references they held in turn. Returns the number of nodes removed.
    fn collect(&mut self, doc: &mut Document) -> usize {
        let mut removed = 0;
        while let Some(id) = self.orphans.pop() {
            if self.counts.get(&id) != Some(&0) {
                continue;
            }
            self.counts.remove(&id);
            if let Some(wire) = self.wire.remove(&id) {
                self.local.remove(&wire);
            }
            if let Some(values) = doc.drop_node(id) {
                trace!("released {id}");
                removed += 1;
                for child in values.iter().filter_map(Value::as_ref_id) {
                    self.release(child);
                }
            }
        }
        removed
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Decoder {
    opts: DecodeOptions,
    refs: ReferenceTracker,
}

/// Apply a single buffer to `doc` with a fresh `Decoder`.
///
/// Suitable for a one-off snapshot; a stream of deltas needs one `Decoder`
/// kept alive across buffers.
pub fn decode(doc: &mut Document, bytes: &[u8]) -> Result<DecodeStats, DecodeError> {
    Decoder::new(DecodeOptions::default()).decode(doc, bytes)
}

impl Decoder {
    pub fn new(opts: DecodeOptions) -> Self {
        Self {
            opts,
            refs: ReferenceTracker::new(),
        }
    }

    pub fn options(&self) -> &DecodeOptions {
        &self.opts
    }

    pub fn references(&self) -> &ReferenceTracker {
        &self.refs
    }

    /// Apply one encoded buffer. An empty buffer is a no-op.
    pub fn decode(&mut self, doc: &mut Document, bytes: &[u8]) -> Result<DecodeStats, DecodeError> {
        let mut stats = DecodeStats::default();
        if bytes.is_empty() {
            return Ok(stats);
        }
        let mut reader = Reader::new(bytes);
        let wire_root = read_u32(&mut reader, "root refid")?;
        match self.refs.get(wire_root) {
            Some(local) if local == doc.root() => {}
            Some(local) => {
                return Err(unexpected(format!("root {}", doc.root()), local.to_string()));
            }
            None => {
                self.refs.bind(wire_root, doc.root());
                self.refs.retain(doc.root());
            }
        }

        let mut apply = Apply {
            doc,
            reader,
            refs: &mut self.refs,
            opts: &self.opts,
            stats: &mut stats,
        };
        let root = apply.doc.root();
        apply.block(root, 0)?;
        if !apply.reader.is_empty() {
            return Err(DecodeError::TrailingBytes(apply.reader.remaining()));
        }
        stats.released = self.refs.collect(doc);
        debug!(
            "applied {} records ({} missing, {} created, {} released)",
            stats.records, stats.missing, stats.created, stats.released
        );
        Ok(stats)
    }
}

fn read_u32(reader: &mut Reader<'_>, what: &str) -> Result<u32, DecodeError> {
    let offset = reader.offset();
    if !reader.is_number() {
        let found = reader
            .peek()
            .map_or_else(|| "end of input".to_owned(), |b| format!("tag {b:#04x}"));
        return Err(unexpected(what, found));
    }
    let v = reader.read_number()?;
    v.as_u64()
        .and_then(|u| u32::try_from(u).ok())
        .ok_or_else(|| unexpected(what, format!("{v:?} at offset {offset}")))
}

/// Map a plain msgpack value onto a schema value.
fn from_plain(v: msgpack::Value) -> Result<Value, DecodeError> {
    Ok(match v {
        msgpack::Value::Nil => Value::Null,
        msgpack::Value::Bool(b) => Value::Bool(b),
        msgpack::Value::Int(i) => Value::Int(i),
        msgpack::Value::UInt(u) => Value::from(u),
        msgpack::Value::Float(f) => Value::Float(f),
        msgpack::Value::Str(s) => Value::Str(s),
        msgpack::Value::Bin(b) => Value::Bytes(b),
        other => return Err(unexpected("primitive", format!("{other:?}"))),
    })
}

/// Read one primitive of type `p`.
fn read_primitive(reader: &mut Reader<'_>, p: PrimitiveType) -> Result<Value, DecodeError> {
    let value = match p {
        PrimitiveType::String => {
            if !reader.is_string() {
                return Err(unexpected("string", peek_desc(reader)));
            }
            Value::Str(reader.read_string()?)
        }
        PrimitiveType::Boolean | PrimitiveType::Bytes => from_plain(reader.read_value()?)?,
        _ => {
            let negative_fixint = reader.peek().is_some_and(|b| b >= 0xe0);
            if !reader.is_number() && !negative_fixint {
                return Err(unexpected(p.name(), peek_desc(reader)));
            }
            from_plain(reader.read_number()?)?
        }
    };
    let value = p.normalize(value);
    if !p.accepts(&value) {
        return Err(unexpected(p.name(), value.kind()));
    }
    Ok(value)
}

fn peek_desc(reader: &Reader<'_>) -> String {
    reader
        .peek()
        .map_or_else(|| "end of input".to_owned(), |b| format!("tag {b:#04x}"))
}

// ---------------------------------------------------------------------------
// Buffer application
// ---------------------------------------------------------------------------

struct Apply<'a, 'b> {
    doc: &'a mut Document,
    reader: Reader<'b>,
    refs: &'a mut ReferenceTracker,
    opts: &'a DecodeOptions,
    stats: &'a mut DecodeStats,
}

impl Apply<'_, '_> {
    fn fire(&self, id: RefId, kind: CallbackKind, value: &Value, key: u32) {
        if self.opts.invoke_callbacks {
            self.doc.fire(id, kind, value, key);
        }
    }

    fn release(&mut self, value: Option<&Value>) {
        if let Some(Value::Ref(r)) = value {
            self.refs.release(*r);
        }
    }

    fn block(&mut self, id: RefId, depth: usize) -> Result<(), DecodeError> {
        if depth > self.opts.max_depth {
            return Err(DecodeError::DepthLimit(self.opts.max_depth));
        }
        loop {
            let tag = self.reader.read_u8()?;
            if tag == END_OF_STRUCTURE {
                return Ok(());
            }
            let op = Operation::from_tag(tag).ok_or(DecodeError::UnknownOperation(tag))?;
            self.stats.records += 1;
            if op == Operation::Clear {
                self.clear(id)?;
                continue;
            }
            let index = read_u32(&mut self.reader, "index")?;
            trace!("{id}: {op} {index}");
            match op {
                Operation::Delete => self.delete(id, index)?,
                _ => self.assign(id, op, index, depth)?,
            }
        }
    }

    fn clear(&mut self, id: RefId) -> Result<(), DecodeError> {
        if !self.doc.is_container(id) {
            return Err(DecodeError::UnexpectedOperation {
                op: Operation::Clear,
                node: id,
            });
        }
        let items = self.doc.collection(id)?.clear_all_indexes();
        trace!("{id}: CLEAR ({} items)", items.len());
        for (key, value) in items {
            self.fire(id, CallbackKind::Remove, &value, key);
            self.release(Some(&value));
        }
        Ok(())
    }

    fn delete(&mut self, id: RefId, index: u32) -> Result<(), DecodeError> {
        let old = if self.doc.is_container(id) {
            self.doc.collection(id)?.delete_by_index(index)
        } else {
            self.doc.apply_field(id, index, None)?
        };
        match old {
            Some(old) => {
                self.fire(id, CallbackKind::Remove, &old, index);
                self.release(Some(&old));
            }
            None => {
                debug!("{id}: DELETE of missing index {index} ignored");
                self.stats.missing += 1;
            }
        }
        Ok(())
    }

    fn assign(
        &mut self,
        id: RefId,
        op: Operation,
        index: u32,
        depth: usize,
    ) -> Result<(), DecodeError> {
        let ty = self
            .doc
            .slot_type(id, index)
            .ok_or(DecodeError::UnknownField { node: id, index })?;
        let value = match ty {
            FieldType::Primitive(p) => read_primitive(&mut self.reader, p)?,
            _ => Value::Ref(self.node(id, index, ty, depth)?),
        };
        // A node may still sit in a slot the buffer has not cleared yet, so
        // the check runs on the value graph once the child's block is applied.
        if let Value::Ref(child) = value
            && self.doc.reaches(child, id)
        {
            return Err(SchemaError::Cycle(child).into());
        }

        if !self.doc.is_container(id) {
            let old = self.doc.apply_field(id, index, Some(value.clone()))?;
            self.release(old.as_ref());
            self.fire(id, CallbackKind::Change, &value, index);
            return Ok(());
        }

        let mut coll = self.doc.collection(id)?;
        let old = match op {
            Operation::Replace => match coll.replace_at(index, value.clone()) {
                Some(old) => Some(old),
                None => {
                    debug!("{id}: REPLACE of missing index {index} ignored");
                    self.stats.missing += 1;
                    self.release(Some(&value));
                    return Ok(());
                }
            },
            _ => coll.insert_at(index, value.clone()),
        };
        let key = coll.get_by_index(index).unwrap_or(index);
        self.release(old.as_ref());
        let kind = match op {
            Operation::Add => CallbackKind::Add,
            _ => CallbackKind::Change,
        };
        self.fire(id, kind, &value, key);
        Ok(())
    }

    /// Read a node reference and its block. The returned node has been
    /// retained once for the slot about to hold it.
    fn node(
        &mut self,
        parent: RefId,
        index: u32,
        ty: FieldType,
        depth: usize,
    ) -> Result<RefId, DecodeError> {
        let wire = read_u32(&mut self.reader, "refid")?;
        let local = match self.refs.get(wire) {
            Some(local) => {
                let node_type = self
                    .doc
                    .node_type(local)
                    .ok_or(SchemaError::UnknownNode(local))?;
                if !node_type.fits(ty) {
                    return Err(unexpected(format!("{ty:?}"), format!("{node_type:?}")));
                }
                if local == self.doc.root() {
                    return Err(SchemaError::Cycle(local).into());
                }
                local
            }
            None => {
                let local = self.create(parent, index, ty)?;
                self.refs.bind(wire, local);
                self.stats.created += 1;
                local
            }
        };
        self.refs.retain(local);
        self.block(local, depth + 1)?;
        Ok(local)
    }

    /// Create the local node for a new sender refid. A container replacing
    /// another container in the same slot inherits its callbacks.
    fn create(&mut self, parent: RefId, index: u32, ty: FieldType) -> Result<RefId, DecodeError> {
        let previous = match (ty, self.doc.slot_value(parent, index)) {
            (FieldType::Collection(_) | FieldType::Set(_), Some(Value::Ref(prev))) => Some(*prev),
            _ => None,
        };
        if let Some(prev) = previous
            && self.doc.node_type(prev).is_some_and(|t| t.fits(ty))
        {
            let copy = self.doc.clone_node(prev, true)?;
            self.doc.collection(copy)?.clear_all_indexes();
            return Ok(copy);
        }
        Ok(self.doc.create_for(ty)?)
    }
}

// ---------------------------------------------------------------------------
// Graph decode context
// ---------------------------------------------------------------------------

/// What the value being decoded should become.
#[derive(Debug, Clone, Copy)]
enum Expect {
    Primitive(PrimitiveType),
    Instance(TypeId),
    Container { child: ChildType, set: bool },
}

impl From<FieldType> for Expect {
    fn from(ty: FieldType) -> Self {
        match ty {
            FieldType::Primitive(p) => Expect::Primitive(p),
            FieldType::Ref(t) => Expect::Instance(t),
            FieldType::Collection(child) => Expect::Container { child, set: false },
            FieldType::Set(child) => Expect::Container { child, set: true },
        }
    }
}

/// Decodes plain msgpack into schema nodes: maps become instances of the
/// expected type (keys are field names), arrays become containers, and
/// everything else a primitive of the expected type.
struct GraphContext<'d> {
    doc: &'d mut Document,
    expect: Expect,
}

fn rejected(e: impl std::fmt::Display) -> msgpack::DecodeError {
    msgpack::DecodeError::Rejected(e.to_string())
}

impl GraphContext<'_> {
    fn primitive(&self, value: Value) -> Result<Value, msgpack::DecodeError> {
        match self.expect {
            Expect::Primitive(p) => {
                let value = p.normalize(value);
                if value.is_null() || p.accepts(&value) {
                    Ok(value)
                } else {
                    Err(rejected(format_args!("{} is not a valid {p}", value.kind())))
                }
            }
            _ if value.is_null() => Ok(Value::Null),
            expect => Err(rejected(format_args!("expected {expect:?}, found {}", value.kind()))),
        }
    }

    fn nested(&mut self, ty: FieldType) -> GraphContext<'_> {
        GraphContext {
            doc: &mut *self.doc,
            expect: ty.into(),
        }
    }
}

impl DecodeContext for GraphContext<'_> {
    type Output = Value;

    fn scalar(&mut self, value: msgpack::Value) -> Result<Value, msgpack::DecodeError> {
        let value = from_plain(value).map_err(rejected)?;
        self.primitive(value)
    }

    fn read_string(&mut self, value: String) -> Result<Value, msgpack::DecodeError> {
        self.primitive(Value::Str(value))
    }

    fn read_binary(&mut self, bytes: &[u8]) -> Result<Value, msgpack::DecodeError> {
        self.primitive(Value::Bytes(bytes.to_vec()))
    }

    fn read_array(
        &mut self,
        reader: &mut Reader<'_>,
        len: usize,
    ) -> Result<Value, msgpack::DecodeError> {
        let Expect::Container { child, set } = self.expect else {
            return Err(rejected(format_args!("array where {:?} was expected", self.expect)));
        };
        let id = if set {
            self.doc.create_set(child)
        } else {
            self.doc.create_collection(child)
        }
        .map_err(rejected)?;
        for _ in 0..len {
            let item = reader.read_with(&mut self.nested(child.into()))?;
            self.doc.collection(id).and_then(|mut c| c.add(item)).map_err(rejected)?;
        }
        Ok(Value::Ref(id))
    }

    fn read_map(
        &mut self,
        reader: &mut Reader<'_>,
        len: usize,
    ) -> Result<Value, msgpack::DecodeError> {
        let Expect::Instance(type_id) = self.expect else {
            return Err(rejected(format_args!("map where {:?} was expected", self.expect)));
        };
        let id = self.doc.create_instance(type_id).map_err(rejected)?;
        for _ in 0..len {
            if !reader.is_string() {
                return Err(rejected("map keys must be field names"));
            }
            let key = reader.read_string()?;
            let ty = self
                .doc
                .schema_of(id)
                .map_err(rejected)?
                .field_by_name(&key)
                .map(|f| f.ty)
                .ok_or_else(|| rejected(format_args!("unknown field `{key}`")))?;
            let value = reader.read_with(&mut self.nested(ty))?;
            if !value.is_null() {
                self.doc.set(id, &key, value).map_err(rejected)?;
            }
        }
        Ok(Value::Ref(id))
    }
}

/// Decode one plain msgpack value from `bytes` as a value of type `ty`,
/// creating free-standing nodes in `doc` for maps and arrays.
///
/// The whole input must be consumed.
pub fn decode_value_into(
    doc: &mut Document,
    bytes: &[u8],
    ty: FieldType,
) -> Result<Value, DecodeError> {
    let mut reader = Reader::new(bytes);
    let mut ctx = GraphContext {
        doc,
        expect: ty.into(),
    };
    let value = reader.read_with(&mut ctx)?;
    if !reader.is_empty() {
        return Err(DecodeError::TrailingBytes(reader.remaining()));
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
