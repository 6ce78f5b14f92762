use std::rc::Rc;

use proptest::prelude::*;
use schemadelta::decoder::Decoder;
use schemadelta::encoder;
use schemadelta::msgpack;
use schemadelta::schema::{
    ChildType, Document, FieldType, PrimitiveType, SchemaBuilder, TypeId, TypeRegistry, Value,
};
use schemadelta::{Operation, RefId};

struct Fixture {
    registry: Rc<TypeRegistry>,
    state: TypeId,
    item: TypeId,
}

fn fixture() -> Fixture {
    let mut reg = TypeRegistry::new();
    let item = reg.add(
        SchemaBuilder::new("Item")
            .field("label", PrimitiveType::String)
            .field("n", PrimitiveType::Int32),
    );
    let state = reg.add(
        SchemaBuilder::new("State")
            .field("count", PrimitiveType::Float64)
            .field("items", FieldType::Collection(ChildType::Schema(item)))
            .field("tags", FieldType::Set(ChildType::Primitive(PrimitiveType::String)))
            .field("blob", PrimitiveType::Bytes),
    );
    Fixture {
        registry: Rc::new(reg),
        state,
        item,
    }
}

struct Server {
    doc: Document,
    items: RefId,
    tags: RefId,
}

fn server(f: &Fixture) -> Server {
    let mut doc = Document::new(Rc::clone(&f.registry), f.state).unwrap();
    let root = doc.root();
    let items = doc.create_collection(ChildType::Schema(f.item)).unwrap();
    let tags = doc.create_set(PrimitiveType::String.into()).unwrap();
    doc.set(root, "items", items).unwrap();
    doc.set(root, "tags", tags).unwrap();
    Server { doc, items, tags }
}

#[derive(Debug, Clone)]
enum Step {
    AddItem(String, i32),
    RemoveItem(usize),
    SetItemN(usize, i32),
    SetCount(f64),
    SetBlob(Vec<u8>),
    AddTag(String),
    RemoveTag(usize),
    ClearItems,
    Sync,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => ("[a-z]{0,6}", any::<i32>()).prop_map(|(s, n)| Step::AddItem(s, n)),
        1 => any::<usize>().prop_map(Step::RemoveItem),
        2 => (any::<usize>(), any::<i32>()).prop_map(|(i, n)| Step::SetItemN(i, n)),
        1 => (-1e9f64..1e9f64).prop_map(Step::SetCount),
        1 => proptest::collection::vec(any::<u8>(), 0..16).prop_map(Step::SetBlob),
        1 => "[a-c]{1,2}".prop_map(Step::AddTag),
        1 => any::<usize>().prop_map(Step::RemoveTag),
        1 => Just(Step::ClearItems),
        2 => Just(Step::Sync),
    ]
}

fn nth(doc: &Document, id: RefId, i: usize) -> Option<Value> {
    let c = doc.container(id).unwrap();
    if c.is_empty() {
        return None;
    }
    c.values().nth(i % c.size()).cloned()
}

/// Apply one step to the server. Returns true for `Sync`.
fn apply(f: &Fixture, s: &mut Server, step: &Step) -> bool {
    let root = s.doc.root();
    match step {
        Step::AddItem(label, n) => {
            let it = s.doc.create_instance(f.item).unwrap();
            s.doc.set(it, "label", label.as_str()).unwrap();
            s.doc.set(it, "n", *n).unwrap();
            s.doc.collection(s.items).unwrap().add(it).unwrap();
        }
        Step::RemoveItem(i) => {
            if let Some(v) = nth(&s.doc, s.items, *i) {
                assert!(s.doc.collection(s.items).unwrap().remove(&v));
                s.doc.release(v.as_ref_id().unwrap()).unwrap();
            }
        }
        Step::SetItemN(i, n) => {
            if let Some(v) = nth(&s.doc, s.items, *i) {
                s.doc.set(v.as_ref_id().unwrap(), "n", *n).unwrap();
            }
        }
        Step::SetCount(c) => s.doc.set(root, "count", *c).unwrap(),
        Step::SetBlob(b) => s.doc.set(root, "blob", b.clone()).unwrap(),
        Step::AddTag(t) => {
            s.doc.collection(s.tags).unwrap().add(t.as_str()).unwrap();
        }
        Step::RemoveTag(i) => {
            if let Some(v) = nth(&s.doc, s.tags, *i) {
                s.doc.collection(s.tags).unwrap().remove(&v);
            }
        }
        Step::ClearItems => {
            let removed: Vec<RefId> = s
                .doc
                .container(s.items)
                .unwrap()
                .values()
                .filter_map(Value::as_ref_id)
                .collect();
            s.doc.collection(s.items).unwrap().clear();
            for id in removed {
                s.doc.release(id).unwrap();
            }
        }
        Step::Sync => return true,
    }
    false
}

fn json(doc: &Document) -> serde_json::Value {
    doc.to_json(doc.root()).unwrap()
}

proptest! {
    #[test]
    fn prop_deltas_converge(steps in proptest::collection::vec(step(), 0..40)) {
        let f = fixture();
        let mut s = server(&f);
        let mut client = Document::new(Rc::clone(&f.registry), f.state).unwrap();
        let mut dec = Decoder::default();
        for st in steps.iter().chain(std::iter::once(&Step::Sync)) {
            if apply(&f, &mut s, st) {
                let mut buf = Vec::new();
                encoder::encode(&mut s.doc, &mut buf).unwrap();
                dec.decode(&mut client, &buf).unwrap();
                prop_assert_eq!(json(&client), json(&s.doc));
            }
        }
        prop_assert_eq!(client.len(), s.doc.len());
    }

    #[test]
    fn prop_same_buffers_same_state(steps in proptest::collection::vec(step(), 0..30)) {
        let f = fixture();
        let mut s = server(&f);
        let mut a = Document::new(Rc::clone(&f.registry), f.state).unwrap();
        let mut b = Document::new(Rc::clone(&f.registry), f.state).unwrap();
        let (mut da, mut db) = (Decoder::default(), Decoder::default());
        for st in steps.iter().chain(std::iter::once(&Step::Sync)) {
            if apply(&f, &mut s, st) {
                let mut buf = Vec::new();
                encoder::encode(&mut s.doc, &mut buf).unwrap();
                da.decode(&mut a, &buf).unwrap();
                db.decode(&mut b, &buf).unwrap();
            }
        }
        prop_assert_eq!(json(&a), json(&b));
    }

    #[test]
    fn prop_snapshot_matches_delta_stream(steps in proptest::collection::vec(step(), 0..30)) {
        let f = fixture();
        let mut s = server(&f);
        for st in &steps {
            if apply(&f, &mut s, st) {
                encoder::encode(&mut s.doc, &mut Vec::new()).unwrap();
            }
        }
        let mut snap = Vec::new();
        encoder::encode_snapshot(&s.doc, &mut snap).unwrap();
        let mut fresh = Document::new(Rc::clone(&f.registry), f.state).unwrap();
        Decoder::default().decode(&mut fresh, &snap).unwrap();
        prop_assert_eq!(json(&fresh), json(&s.doc));
    }

    #[test]
    fn prop_identities_strictly_increase(
        n in 1usize..64,
        removals in proptest::collection::vec(any::<usize>(), 0..8),
    ) {
        let f = fixture();
        let mut s = server(&f);
        let mut last = None;
        for i in 0..n {
            if let Some(r) = removals.get(i % 8)
                && i % 3 == 0
            {
                apply(&f, &mut s, &Step::RemoveItem(*r));
            }
            let it = s.doc.create_instance(f.item).unwrap();
            let id = s.doc.collection(s.items).unwrap().add(it).unwrap();
            if let Some(prev) = last {
                prop_assert!(id > prev, "{} after {}", id, prev);
            }
            last = Some(id);
        }
    }

    #[test]
    fn prop_clear_leaves_single_operation(steps in proptest::collection::vec(step(), 0..20)) {
        let f = fixture();
        let mut s = server(&f);
        for st in &steps {
            if apply(&f, &mut s, st) {
                encoder::encode(&mut s.doc, &mut Vec::new()).unwrap();
            }
        }
        apply(&f, &mut s, &Step::ClearItems);
        let ledger = s.doc.changes().get(s.items).unwrap();
        prop_assert_eq!(ledger.structure_operation(), Some(Operation::Clear));
        prop_assert_eq!(ledger.pending_len(), 0);
        prop_assert!(s.doc.changes().is_dirty(s.doc.root()));
    }

    #[test]
    fn prop_nested_change_marks_ancestors(
        labels in proptest::collection::vec("[a-z]{1,4}", 1..8),
        pick in any::<usize>(),
        n in any::<i32>(),
    ) {
        let f = fixture();
        let mut s = server(&f);
        for (i, l) in labels.iter().enumerate() {
            apply(&f, &mut s, &Step::AddItem(l.clone(), i as i32));
        }
        encoder::encode(&mut s.doc, &mut Vec::new()).unwrap();
        prop_assert_eq!(s.doc.changes().dirty_set(s.doc.root()).count(), 0);

        let target = nth(&s.doc, s.items, pick).and_then(|v| v.as_ref_id()).unwrap();
        let before = s.doc.get(target, "n").and_then(Value::as_i64);
        s.doc.set(target, "n", n).unwrap();
        let root = s.doc.root();
        let dirty: Vec<RefId> = s.doc.changes().dirty_set(root).collect();
        if before == Some(i64::from(n)) {
            prop_assert!(dirty.is_empty());
        } else {
            for id in [target, s.items, root] {
                prop_assert!(dirty.contains(&id));
            }
            prop_assert!(!dirty.contains(&s.tags));
        }
    }

    #[test]
    fn prop_msgpack_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let mut offset = 0;
        while offset < bytes.len() {
            let before = offset;
            if msgpack::decode(&bytes, &mut offset).is_err() {
                prop_assert_eq!(offset, before);
                break;
            }
            prop_assert!(offset > before && offset <= bytes.len());
        }
    }

    #[test]
    fn prop_apply_garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let f = fixture();
        let mut doc = Document::new(Rc::clone(&f.registry), f.state).unwrap();
        let _ = Decoder::default().decode(&mut doc, &bytes);
    }
}
