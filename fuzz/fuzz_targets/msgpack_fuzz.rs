#![no_main]
use libfuzzer_sys::fuzz_target;
use schemadelta::msgpack;

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes must only ever return errors.
    let mut offset = 0;
    while offset < data.len() {
        let before = offset;
        if msgpack::decode(data, &mut offset).is_err() {
            assert_eq!(offset, before);
            break;
        }
        assert!(offset > before);
    }

    // The peek predicates must agree with what a full decode produces.
    if msgpack::string_check(data, 0) {
        let mut off = 0;
        if let Ok(v) = msgpack::decode(data, &mut off) {
            assert!(matches!(v, msgpack::Value::Str(_)));
        }
    }
});
