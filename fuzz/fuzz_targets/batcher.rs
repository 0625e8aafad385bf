#![no_main]

use libfuzzer_sys::fuzz_target;
use std::collections::VecDeque;
use streamfeed_client::{BatchItem, Batcher};

struct Item(usize, usize);

impl BatchItem for Item {
    fn size_bytes(&self) -> usize {
        self.1
    }
}

fuzz_target!(|data: &[u8]| {
    // First two bytes pick the limits, the rest are item sizes.
    // Checks that:
    // - no batch exceeds either limit
    // - oversized items are never batched
    // - every item comes out exactly once, batched ones in queue order
    if data.len() < 2 {
        return;
    }
    let max_count = data[0] as usize % 16 + 1;
    let max_bytes = data[1] as usize * 4 + 1;
    let mut queue: VecDeque<Item> = data[2..]
        .iter()
        .enumerate()
        .map(|(i, b)| Item(i, *b as usize * 3))
        .collect();
    let total = queue.len();

    let batcher = Batcher::new(max_count, max_bytes);
    let mut seen = 0;
    let mut last_batched = None;

    while !queue.is_empty() {
        let selection = batcher.select(&mut queue);
        assert!(selection.batch.len() <= max_count);
        assert!(selection.batch.total_bytes() <= max_bytes);
        assert!(!selection.batch.is_empty() || !selection.oversized.is_empty());

        for item in &selection.oversized {
            assert!(item.1 > max_bytes);
        }
        for item in selection.batch.items() {
            assert!(last_batched.map_or(true, |last| item.0 > last));
            last_batched = Some(item.0);
        }
        seen += selection.batch.len() + selection.oversized.len();
    }

    assert_eq!(seen, total);
});
