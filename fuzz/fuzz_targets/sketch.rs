#![no_main]

use hll_container::hash::{HashFunction, Murmur3};
use hll_container::Sketch;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let sketch = Sketch::new("fuzz", 0, 0);
    let mut previous = 0;
    for chunk in data.chunks(4) {
        sketch.add_hash(Murmur3.hash32(chunk));
        let slots = sketch.slots();
        assert!(slots.iter().all(|&rank| rank <= 25));
        let non_zero = slots.iter().filter(|&&rank| rank > 0).count() as u32;
        assert_eq!(non_zero, sketch.non_zero());
        assert!(non_zero >= previous);
        previous = non_zero;
    }
    let restored = Sketch::from_bytes("fuzz", 0, 0, &sketch.to_bytes()).unwrap();
    assert_eq!(restored, sketch);
    assert_eq!(restored.estimate(), sketch.estimate());
});
