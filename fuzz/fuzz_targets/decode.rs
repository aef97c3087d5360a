#![no_main]

use hll_container::{encoding, Sketch};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(decoded) = encoding::decode(data) {
        // accepted input must re-encode to a canonical form that decodes to the same slots
        let encoded = encoding::encode(&decoded.slots, decoded.non_zero as usize);
        let again = encoding::decode(&encoded).unwrap();
        assert_eq!(decoded.slots, again.slots);
        assert_eq!(decoded.non_zero, again.non_zero);
    }
    if let Ok(sketch) = serde_json::from_slice::<Sketch>(data) {
        let _ = sketch.estimate();
    }
});
