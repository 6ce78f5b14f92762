#![no_main]
use std::rc::Rc;

use libfuzzer_sys::fuzz_target;
use schemadelta::decoder::Decoder;
use schemadelta::schema::{
    ChildType, Document, FieldType, PrimitiveType, SchemaBuilder, TypeRegistry,
};

fuzz_target!(|data: &[u8]| {
    let mut reg = TypeRegistry::new();
    let item = reg.add(
        SchemaBuilder::new("Item")
            .field("name", PrimitiveType::String)
            .field("n", PrimitiveType::Int32),
    );
    let node = reg.declare("Node");
    let state = reg.add(
        SchemaBuilder::new("State")
            .field("items", FieldType::Collection(ChildType::Schema(item)))
            .field("tags", FieldType::Set(ChildType::Primitive(PrimitiveType::String)))
            .field("next", FieldType::Ref(node))
            .field("f", PrimitiveType::Float32),
    );
    let _ = reg.define(
        node,
        SchemaBuilder::new("Node")
            .field("value", PrimitiveType::Number)
            .field("next", FieldType::Ref(node)),
    );
    let registry = Rc::new(reg);

    // Arbitrary buffers, split into a stream, must never panic and must
    // leave a document that can still be projected.
    let mut doc = match Document::new(registry, state) {
        Ok(doc) => doc,
        Err(_) => return,
    };
    let mut dec = Decoder::default();
    for chunk in data.split(|b| *b == 0xff) {
        let _ = dec.decode(&mut doc, chunk);
    }
    let _ = doc.to_json(doc.root());
});
