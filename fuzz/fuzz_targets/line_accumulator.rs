#![no_main]

use agent_trail_core::accumulator::LineAccumulator;
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    chunks: Vec<Vec<u8>>,
    max_pending: u16,
}

fuzz_target!(|input: Input| {
    let max_pending = usize::from(input.max_pending).max(1);
    let mut acc = LineAccumulator::new(max_pending);
    let mut lines = Vec::new();
    for chunk in &input.chunks {
        lines.extend(acc.push(chunk));
        assert!(acc.pending_len() <= max_pending);
    }
    lines.extend(acc.finish());
    for line in &lines {
        assert!(!line.contains('\n'));
    }
});
