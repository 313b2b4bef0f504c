//! Deterministic allocation churn with a full invariant sweep.
//!
//! Drives the allocator through seeded pseudo-random malloc/free storms
//! and re-verifies the complete invariant set (alignment, boundary
//! tags, minimum sizes, no adjacent free blocks, containment, epilogue
//! placement, free-list agreement) after every single operation.

use segfit_core::heap::Heap;

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

const CHURN_OPS: usize = if cfg!(debug_assertions) { 1500 } else { 4000 };

fn churn(seed: u64, max_request: usize, fill: Option<u8>) {
    let mut heap = Heap::new();
    heap.init(1 << 20).expect("init");

    let mut rng = XorShift64::new(seed);
    let mut live: Vec<(*mut u8, usize)> = Vec::new();

    for step in 0..CHURN_OPS {
        let r = rng.next_u64();
        if r % 3 != 0 || live.is_empty() {
            let request = rng.gen_range(1, max_request);
            let p = heap.malloc(request);
            if !p.is_null() {
                if let Some(byte) = fill {
                    // Every usable byte belongs to the caller, footer
                    // word included.
                    // SAFETY: the block reserves request + header bytes.
                    unsafe { std::ptr::write_bytes(p, byte, request) };
                }
                live.push((p, request));
            }
        } else {
            let idx = rng.gen_range(0, live.len() - 1);
            let (p, _) = live.swap_remove(idx);
            // SAFETY: p came from malloc on this heap and is freed once.
            unsafe { heap.free(p) };
        }

        let snap = heap
            .check()
            .unwrap_or_else(|e| panic!("invariant violated at step {step}: {e}"));
        assert_eq!(
            snap.blocks.iter().filter(|b| b.allocated).count(),
            live.len(),
            "allocated census diverged at step {step}"
        );
    }

    // Drain everything; full coalescing must leave a single free span.
    for (p, _) in live.drain(..) {
        // SAFETY: each pointer is freed exactly once.
        unsafe { heap.free(p) };
    }
    let snap = heap.check().expect("final check");
    assert_eq!(snap.blocks.len(), 1, "one fully coalesced span remains");
    assert!(!snap.blocks[0].allocated);

    heap.deinit().expect("deinit");
}

#[test]
fn random_churn_preserves_every_invariant() {
    churn(0xA5A5_5A5A_DEAD_BEEF, 2048, None);
}

#[test]
fn churn_with_fully_written_payloads() {
    // 0x00 bytes make clobbered allocated-block footers read as free
    // size-0 words; the coalescer must shrug them off.
    churn(0x1355_7799_BBDD_FF01, 512, Some(0x00));
}

#[test]
fn churn_with_set_bit_payload_pattern() {
    churn(0x0F0F_F0F0_1234_5678, 768, Some(0xFF));
}

#[test]
fn small_class_thrash() {
    // Stay inside the two smallest classes to stress LIFO reuse.
    churn(0xC0FF_EE00_C0FF_EE00, 56, None);
}

#[test]
fn accounting_gauges_track_the_walker() {
    let mut heap = Heap::new();
    heap.init(1 << 18).expect("init");

    let mut rng = XorShift64::new(0x9E37_79B9_7F4A_7C15);
    let mut live: Vec<*mut u8> = Vec::new();

    for _ in 0..600 {
        if rng.next_u64() % 2 == 0 || live.is_empty() {
            let p = heap.malloc(rng.gen_range(1, 1024));
            if !p.is_null() {
                live.push(p);
            }
        } else {
            let idx = rng.gen_range(0, live.len() - 1);
            let p = live.swap_remove(idx);
            // SAFETY: freed exactly once.
            unsafe { heap.free(p) };
        }

        let snap = heap.check().expect("check");
        let stats = heap.stats();
        assert_eq!(stats.live_blocks, live.len());
        assert_eq!(stats.live_bytes, snap.allocated_bytes());
        assert_eq!(
            stats.free_blocks,
            snap.blocks.iter().filter(|b| !b.allocated).count()
        );
        assert_eq!(stats.free_bytes, snap.free_bytes());
        assert!(stats.peak_live_bytes >= stats.live_bytes);
    }
}
