//! Schemadelta: typed state graphs with field-level change tracking and
//! compact binary deltas.
//!
//! The crate provides:
//! - Change ledgers with parent/root wiring and per-root dirty sets (`changes`)
//! - Schema types, structure instances and containers (`schema`)
//! - A msgpack subset for scalar payloads (`msgpack`)
//! - Delta and snapshot encoding (`encoder`) and buffer application (`decoder`)
//! - An optional CLI (`cli` feature)
//!
//! # Quick Start
//!
//! ```
//! use std::rc::Rc;
//!
//! use schemadelta::decoder::Decoder;
//! use schemadelta::encoder;
//! use schemadelta::schema::{
//!     ChildType, Document, FieldType, PrimitiveType, SchemaBuilder, TypeRegistry,
//! };
//!
//! let mut types = TypeRegistry::new();
//! let player = types.add(SchemaBuilder::new("Player").field("name", PrimitiveType::String));
//! let state = types.add(
//!     SchemaBuilder::new("State")
//!         .field("players", FieldType::Collection(ChildType::Schema(player))),
//! );
//! let types = Rc::new(types);
//!
//! let mut server = Document::new(Rc::clone(&types), state).unwrap();
//! let players = server.create_collection(ChildType::Schema(player)).unwrap();
//! server.set(server.root(), "players", players).unwrap();
//! let p = server.create_instance(player).unwrap();
//! server.set(p, "name", "ada").unwrap();
//! server.collection(players).unwrap().add(p).unwrap();
//!
//! let mut client = Document::new(types, state).unwrap();
//! let mut decoder = Decoder::default();
//! let mut delta = Vec::new();
//! encoder::encode(&mut server, &mut delta).unwrap();
//! decoder.decode(&mut client, &delta).unwrap();
//!
//! assert_eq!(
//!     client.to_json(client.root()).unwrap(),
//!     server.to_json(server.root()).unwrap()
//! );
//! ```

pub mod changes;
pub mod decoder;
pub mod encoder;
pub mod msgpack;
pub mod schema;

#[cfg(feature = "cli")]
pub mod cli;

pub use changes::{Operation, RefId};
pub use decoder::{DecodeOptions, Decoder};
pub use encoder::{EncodeMode, EncodeOptions};
pub use schema::{Document, SchemaError, Value};
