//! Fuzz target for delta application.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    base: Vec<u8>,
    delta: Vec<u8>,
}

fuzz_target!(|input: Input| {
    if let Ok(out) = githost_git::apply_delta(&input.base, &input.delta, 1 << 20) {
        let (base, result) = githost_git::delta_sizes(&input.delta).unwrap();
        assert_eq!(base, input.base.len() as u64);
        assert_eq!(result, out.len() as u64);
    }
});
