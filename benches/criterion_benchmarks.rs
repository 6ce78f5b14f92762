use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use schemadelta::decoder::Decoder;
use schemadelta::encoder;
use schemadelta::msgpack::{self, encoder as mp};
use schemadelta::RefId;
use schemadelta::schema::{
    ChildType, Document, FieldType, PrimitiveType, SchemaBuilder, TypeId, TypeRegistry,
};
use std::rc::Rc;

struct Types {
    registry: Rc<TypeRegistry>,
    state: TypeId,
    entity: TypeId,
}

fn types() -> Types {
    let mut reg = TypeRegistry::new();
    let entity = reg.add(
        SchemaBuilder::new("Entity")
            .field("name", PrimitiveType::String)
            .field("x", PrimitiveType::Float32)
            .field("y", PrimitiveType::Float32)
            .field("hp", PrimitiveType::Uint16),
    );
    let state = reg.add(
        SchemaBuilder::new("State")
            .field("tick", PrimitiveType::Uint32)
            .field("entities", FieldType::Collection(ChildType::Schema(entity))),
    );
    Types {
        registry: Rc::new(reg),
        state,
        entity,
    }
}

/// A document holding `n` entities, already flushed once.
fn populated(t: &Types, n: usize) -> (Document, Vec<RefId>) {
    let mut doc = Document::new(Rc::clone(&t.registry), t.state).unwrap();
    let entities = doc.create_collection(ChildType::Schema(t.entity)).unwrap();
    doc.set(doc.root(), "entities", entities).unwrap();
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let e = doc.create_instance(t.entity).unwrap();
        doc.set(e, "name", format!("entity-{i}")).unwrap();
        doc.set(e, "x", i as f64).unwrap();
        doc.set(e, "y", 0.5).unwrap();
        doc.set(e, "hp", 100).unwrap();
        doc.collection(entities).unwrap().add(e).unwrap();
        ids.push(e);
    }
    encoder::encode(&mut doc, &mut Vec::new()).unwrap();
    (doc, ids)
}

/// Move every `stride`-th entity and return the encoded delta.
fn tick(doc: &mut Document, ids: &[RefId], stride: usize, step: u32) -> Vec<u8> {
    doc.set(doc.root(), "tick", step).unwrap();
    for (i, id) in ids.iter().enumerate().step_by(stride.max(1)) {
        doc.set(*id, "x", f64::from(step) + i as f64).unwrap();
    }
    let mut out = Vec::new();
    encoder::encode(doc, &mut out).unwrap();
    out
}

fn msgpack_payload(n: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..n {
        mp::write_str(&mut out, &format!("key-{i}"));
        mp::write_int(&mut out, i as i64 * 7919 - 50_000);
        mp::write_f64(&mut out, i as f64 / 3.0);
        let pair = msgpack::Value::Array(vec![msgpack::Value::Bool(true), msgpack::Value::Nil]);
        mp::write_value(&mut out, &pair);
    }
    out
}

fn bench_msgpack_decode(c: &mut Criterion) {
    let mut g = c.benchmark_group("msgpack_decode");
    for n in [256usize, 4096] {
        let bytes = msgpack_payload(n);
        g.throughput(Throughput::Bytes(bytes.len() as u64));
        g.bench_with_input(BenchmarkId::from_parameter(n), &bytes, |b, bytes| {
            b.iter(|| {
                let mut offset = 0;
                while offset < bytes.len() {
                    black_box(msgpack::decode(black_box(bytes), &mut offset).unwrap());
                }
            });
        });
    }
    g.finish();
}

fn bench_delta_encode(c: &mut Criterion) {
    let t = types();
    let mut g = c.benchmark_group("delta_encode");
    for (n, stride) in [(1000usize, 1usize), (1000, 10), (10_000, 100)] {
        let (mut doc, ids) = populated(&t, n);
        let mut step = 0u32;
        g.bench_function(format!("{n}_entities_every_{stride}"), |b| {
            b.iter(|| {
                step += 1;
                black_box(tick(&mut doc, &ids, stride, step));
            });
        });
    }
    g.finish();
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let t = types();
    let mut g = c.benchmark_group("snapshot_encode");
    for n in [100usize, 1000, 10_000] {
        let (doc, _) = populated(&t, n);
        g.bench_with_input(BenchmarkId::from_parameter(n), &doc, |b, doc| {
            b.iter(|| {
                let mut out = Vec::new();
                encoder::encode_snapshot(doc, &mut out).unwrap();
                black_box(out);
            });
        });
    }
    g.finish();
}

fn bench_apply(c: &mut Criterion) {
    let t = types();
    let mut g = c.benchmark_group("apply");
    for n in [100usize, 1000, 10_000] {
        let (doc, _) = populated(&t, n);
        let mut snap = Vec::new();
        encoder::encode_snapshot(&doc, &mut snap).unwrap();
        g.throughput(Throughput::Bytes(snap.len() as u64));
        g.bench_with_input(BenchmarkId::new("snapshot", n), &snap, |b, snap| {
            b.iter(|| {
                let mut client = Document::new(Rc::clone(&t.registry), t.state).unwrap();
                Decoder::default().decode(&mut client, black_box(snap)).unwrap();
                black_box(client.len());
            });
        });
    }

    // Steady state: one client following a stream of deltas.
    let (mut doc, ids) = populated(&t, 1000);
    let mut snap = Vec::new();
    encoder::encode_snapshot(&doc, &mut snap).unwrap();
    let mut client = Document::new(Rc::clone(&t.registry), t.state).unwrap();
    let mut dec = Decoder::default();
    dec.decode(&mut client, &snap).unwrap();
    let mut step = 0u32;
    g.bench_function("delta_1000_every_10", |b| {
        b.iter(|| {
            step += 1;
            let delta = tick(&mut doc, &ids, 10, step);
            black_box(dec.decode(&mut client, &delta).unwrap());
        });
    });
    g.finish();
}

criterion_group!(
    benches,
    bench_msgpack_decode,
    bench_delta_encode,
    bench_snapshot_encode,
    bench_apply
);
criterion_main!(benches);
