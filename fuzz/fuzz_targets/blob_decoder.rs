#![no_main]

use agent_trail_core::sources::blob::{child_refs, decode_blob, DecodedBlob};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    match decode_blob(data) {
        // Accepted JSON must re-serialize.
        DecodedBlob::Json(value) => assert!(!value.to_string().is_empty()),
        DecodedBlob::Text(text) => assert!(!text.is_empty()),
        DecodedBlob::Empty => {}
    }
    for id in child_refs(data) {
        assert_eq!(id.len(), 64);
    }
});
