// Schema encoder: delta and snapshot passes over a `Document`.
//
// Buffer layout:
//
//   root refid (msgpack uint)
//   block := record* END_OF_STRUCTURE
//   record := CLEAR
//           | DELETE index
//           | (ADD | REPLACE) index payload
//   payload := msgpack primitive | child refid block
//
// Child blocks are written inline where the parent references them, so a
// receiver always locates a child through its parent's record first.

use std::collections::HashSet;

use log::{debug, trace};
use thiserror::Error;

use crate::changes::{END_OF_STRUCTURE, Flushed, Operation, RefId};
use crate::msgpack::encoder as mp;
use crate::schema::{Document, FieldType, PrimitiveType, SchemaError, Value};

/// Default limit for nested structure blocks.
pub const DEFAULT_MAX_DEPTH: usize = 128;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EncodeMode {
    /// Pending changes only; flushes the ledgers.
    #[default]
    Delta,
    /// Every live slot as ADD; ledgers are left untouched.
    Snapshot,
}

/// Configuration for an encode pass.
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub mode: EncodeMode,
    /// Deepest structure nesting accepted before failing.
    pub max_depth: usize,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            mode: EncodeMode::Delta,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Counters for one encode pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeStats {
    /// Structure blocks written.
    pub blocks: usize,
    /// Records written, CLEAR included.
    pub records: usize,
    /// Dirty ledgers not reachable from the root, dropped after the pass.
    pub discarded: usize,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("structure nesting exceeds {0} levels")]
    DepthLimit(usize),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Encode pending changes of `doc` into `output` and flush them.
///
/// Nothing is written when the document has no pending changes.
pub fn encode(doc: &mut Document, output: &mut Vec<u8>) -> Result<EncodeStats, EncodeError> {
    encode_with_options(doc, output, &EncodeOptions::default())
}

/// Encode the full state of `doc` into `output`.
pub fn encode_snapshot(doc: &Document, output: &mut Vec<u8>) -> Result<EncodeStats, EncodeError> {
    let mut pass = SnapshotPass {
        doc,
        out: output,
        max_depth: DEFAULT_MAX_DEPTH,
        stats: EncodeStats::default(),
    };
    pass.run()
}

/// Encode with custom options.
pub fn encode_with_options(
    doc: &mut Document,
    output: &mut Vec<u8>,
    opts: &EncodeOptions,
) -> Result<EncodeStats, EncodeError> {
    match opts.mode {
        EncodeMode::Snapshot => {
            let mut pass = SnapshotPass {
                doc,
                out: output,
                max_depth: opts.max_depth,
                stats: EncodeStats::default(),
            };
            pass.run()
        }
        EncodeMode::Delta => {
            let mut pass = DeltaPass {
                doc,
                out: output,
                max_depth: opts.max_depth,
                visited: HashSet::new(),
                taken: Vec::new(),
                stats: EncodeStats::default(),
            };
            pass.run()
        }
    }
}

// ---------------------------------------------------------------------------
// Shared record writers
// ---------------------------------------------------------------------------

fn write_record_head(out: &mut Vec<u8>, op: Operation, index: u32) {
    out.push(op.tag());
    mp::write_uint(out, u64::from(index));
}

fn mismatch(p: PrimitiveType, value: &Value) -> EncodeError {
    EncodeError::Schema(SchemaError::TypeMismatch {
        expected: p.name().into(),
        found: value.kind().into(),
    })
}

/// Write a primitive payload in the wire form of its declared type.
fn write_primitive(out: &mut Vec<u8>, p: PrimitiveType, value: &Value) -> Result<(), EncodeError> {
    match (p, value) {
        (PrimitiveType::String, Value::Str(s)) => mp::write_str(out, s),
        (PrimitiveType::Boolean, Value::Bool(b)) => mp::write_bool(out, *b),
        (PrimitiveType::Bytes, Value::Bytes(b)) => mp::write_bin(out, b),
        (PrimitiveType::Float32, v) => {
            let f = v.as_f64().ok_or_else(|| mismatch(p, v))?;
            mp::write_f32(out, f as f32);
        }
        (PrimitiveType::Float64, v) => {
            let f = v.as_f64().ok_or_else(|| mismatch(p, v))?;
            mp::write_f64(out, f);
        }
        (PrimitiveType::Number, Value::Int(i)) => mp::write_int(out, *i),
        (PrimitiveType::Number, Value::UInt(u)) => mp::write_uint(out, *u),
        (PrimitiveType::Number, Value::Float(f)) => mp::write_f64(out, *f),
        (
            PrimitiveType::Int8
            | PrimitiveType::Int16
            | PrimitiveType::Int32
            | PrimitiveType::Int64,
            v,
        ) => mp::write_int(out, v.as_i64().ok_or_else(|| mismatch(p, v))?),
        (
            PrimitiveType::Uint8
            | PrimitiveType::Uint16
            | PrimitiveType::Uint32
            | PrimitiveType::Uint64,
            v,
        ) => mp::write_uint(out, v.as_u64().ok_or_else(|| mismatch(p, v))?),
        (_, v) => return Err(mismatch(p, v)),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Delta pass
// ---------------------------------------------------------------------------

struct DeltaPass<'a> {
    doc: &'a mut Document,
    out: &'a mut Vec<u8>,
    max_depth: usize,
    visited: HashSet<RefId>,
    /// Ledgers flushed so far, with their announced flag before the pass.
    taken: Vec<(RefId, Flushed, bool)>,
    stats: EncodeStats,
}

impl DeltaPass<'_> {
    fn run(&mut self) -> Result<EncodeStats, EncodeError> {
        let root = self.doc.root();
        let announced = self
            .doc
            .changes()
            .get(root)
            .is_some_and(|l| l.is_announced());
        if announced && self.doc.changes().dirty_set(root).next().is_none() {
            return Ok(EncodeStats::default());
        }

        let start = self.out.len();
        mp::write_uint(self.out, u64::from(root.0));
        if let Err(e) = self.write_block(root, 0) {
            // Leave the document as if the pass never ran.
            self.out.truncate(start);
            for (id, flushed, announced) in self.taken.drain(..).rev() {
                self.doc.changes.restore(id, flushed, announced);
            }
            debug!("delta aborted, pending changes kept: {e}");
            return Err(e);
        }

        let stale: Vec<RefId> = self
            .doc
            .changes()
            .dirty_set(root)
            .filter(|id| !self.visited.contains(id))
            .collect();
        for id in stale {
            debug!("discarding unreachable pending changes of {id}");
            self.doc.changes.discard(id);
            self.stats.discarded += 1;
        }
        debug!(
            "delta: {} blocks, {} records, {} bytes",
            self.stats.blocks,
            self.stats.records,
            self.out.len()
        );
        Ok(std::mem::take(&mut self.stats))
    }

    fn write_block(&mut self, id: RefId, depth: usize) -> Result<(), EncodeError> {
        if depth > self.max_depth {
            return Err(EncodeError::DepthLimit(self.max_depth));
        }
        self.visited.insert(id);
        self.stats.blocks += 1;

        let announced = self.doc.changes().get(id).is_some_and(|l| l.is_announced());
        let flushed = self.doc.changes.flush(id);
        self.taken.push((id, flushed.clone(), announced));
        if flushed.clear {
            self.out.push(Operation::Clear.tag());
            self.stats.records += 1;
        }

        if announced {
            for (index, op) in flushed.ops {
                match op {
                    Operation::Delete => self.write_delete(id, index),
                    Operation::Add | Operation::Replace => {
                        // Superseded since it was recorded.
                        let Some(value) = self.doc.slot_value(id, index).cloned() else {
                            continue;
                        };
                        self.write_value(id, op, index, &value, depth)?;
                    }
                    Operation::Clear => {}
                }
            }
        } else {
            // First time the receiver sees this node under its current
            // parent: removals, then every live slot.
            for (index, op) in flushed.ops {
                if op == Operation::Delete {
                    self.write_delete(id, index);
                }
            }
            self.doc.changes.set_announced(id, true);
            for (index, value) in self.doc.live_slots(id) {
                self.write_value(id, Operation::Add, index, &value, depth)?;
            }
        }

        self.out.push(END_OF_STRUCTURE);
        Ok(())
    }

    fn write_delete(&mut self, id: RefId, index: u32) {
        trace!("{id}: DELETE {index}");
        write_record_head(self.out, Operation::Delete, index);
        self.stats.records += 1;
    }

    fn write_value(
        &mut self,
        id: RefId,
        op: Operation,
        index: u32,
        value: &Value,
        depth: usize,
    ) -> Result<(), EncodeError> {
        let ty = self
            .doc
            .slot_type(id, index)
            .ok_or(SchemaError::UnknownNode(id))?;
        trace!("{id}: {op} {index}");
        write_record_head(self.out, op, index);
        self.stats.records += 1;
        match (ty, value) {
            (FieldType::Primitive(p), v) => write_primitive(self.out, p, v),
            (_, Value::Ref(child)) => {
                mp::write_uint(self.out, u64::from(child.0));
                self.write_block(*child, depth + 1)
            }
            (_, v) => Err(SchemaError::TypeMismatch {
                expected: format!("{ty:?}"),
                found: v.kind().into(),
            }
            .into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot pass
// ---------------------------------------------------------------------------

struct SnapshotPass<'a> {
    doc: &'a Document,
    out: &'a mut Vec<u8>,
    max_depth: usize,
    stats: EncodeStats,
}

impl SnapshotPass<'_> {
    fn run(&mut self) -> Result<EncodeStats, EncodeError> {
        let root = self.doc.root();
        let start = self.out.len();
        mp::write_uint(self.out, u64::from(root.0));
        if let Err(e) = self.write_block(root, 0) {
            self.out.truncate(start);
            return Err(e);
        }
        debug!(
            "snapshot: {} blocks, {} records, {} bytes",
            self.stats.blocks,
            self.stats.records,
            self.out.len()
        );
        Ok(std::mem::take(&mut self.stats))
    }

    fn write_block(&mut self, id: RefId, depth: usize) -> Result<(), EncodeError> {
        if depth > self.max_depth {
            return Err(EncodeError::DepthLimit(self.max_depth));
        }
        self.stats.blocks += 1;
        for (index, value) in self.doc.live_slots(id) {
            let ty = self
                .doc
                .slot_type(id, index)
                .ok_or(SchemaError::UnknownNode(id))?;
            write_record_head(self.out, Operation::Add, index);
            self.stats.records += 1;
            match (ty, &value) {
                (FieldType::Primitive(p), v) => write_primitive(self.out, p, v)?,
                (_, Value::Ref(child)) => {
                    mp::write_uint(self.out, u64::from(child.0));
                    self.write_block(*child, depth + 1)?;
                }
                (_, v) => {
                    return Err(SchemaError::TypeMismatch {
                        expected: format!("{ty:?}"),
                        found: v.kind().into(),
                    }
                    .into());
                }
            }
        }
        self.out.push(END_OF_STRUCTURE);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
