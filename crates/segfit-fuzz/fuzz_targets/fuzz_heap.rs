#![no_main]
use libfuzzer_sys::fuzz_target;
use segfit_core::heap::Heap;

// Interpret the fuzz input as a malloc/free op sequence: each 4-byte
// chunk is (op, size_lo, size_hi, _), with frees popping the most
// recent live allocation. The full invariant walk runs at the end of
// every input.
fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let mut heap = Heap::new();
    if heap.init(1 << 20).is_err() {
        return;
    }
    let mut live: Vec<(*mut u8, usize)> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let op = chunk[0] % 3;
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;

        match op {
            0 => {
                let p = heap.malloc(size);
                if !p.is_null() {
                    live.push((p, size));
                }
            }
            1 => {
                if let Some((p, _)) = live.pop() {
                    // SAFETY: p came from malloc and is freed once.
                    unsafe { heap.free(p) };
                }
            }
            _ => {
                // Touch every usable byte of the newest allocation,
                // footer word included.
                if let Some(&(p, size)) = live.last() {
                    // SAFETY: the block reserves size + header bytes.
                    unsafe { std::ptr::write_bytes(p, chunk[3], size) };
                }
            }
        }
    }

    heap.check().expect("heap invariants must survive any op sequence");

    for (p, _) in live {
        // SAFETY: each live pointer is freed exactly once.
        unsafe { heap.free(p) };
    }
    let snap = heap.check().expect("final walk");
    assert!(snap.blocks.iter().all(|b| !b.allocated));
});
