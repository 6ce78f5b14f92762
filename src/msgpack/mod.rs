// MessagePack subset used by the schema wire format.
//
// Only the value types the schema system can carry are supported. Decoding
// is a single forward pass over a byte slice driven by the leading tag byte.
//
// # Modules
//
// - `value`   — Plain decoded value (no graph nodes)
// - `decoder` — Cursor reader, tag dispatch, peek predicates, decode contexts
// - `encoder` — Compact writers for scalars, strings and binaries

pub mod decoder;
pub mod encoder;
pub mod value;

pub use decoder::{
    DecodeContext, DecodeError, PlainContext, Reader, decode, decode_with, int_check,
    string_check,
};
pub use value::Value;
