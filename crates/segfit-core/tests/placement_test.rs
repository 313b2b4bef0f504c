//! Placement-policy tests: first-fit order inside a class, fall-through
//! to higher classes, LIFO reuse, class-schedule placement of freed
//! blocks, and heap extension merging with a free predecessor.

use segfit_core::heap::size_class::{NUM_SIZE_CLASSES, class_lower_bound};
use segfit_core::heap::{BOOTSTRAP_BYTES, Heap};

const PAGE: usize = 4096;

fn offset(heap: &Heap, p: *mut u8) -> usize {
    p as usize - heap.heap_start() as usize
}

#[test]
fn first_fit_takes_the_first_large_enough_block_in_the_class() {
    let mut heap = Heap::new();
    heap.init(PAGE).expect("init");

    // Two class-1 holes separated by guards: a 96-byte hole below a
    // 64-byte hole in list order (LIFO: b freed last, so it heads the
    // list).
    let a = heap.malloc(88); // 96-byte block
    let _g1 = heap.malloc(24);
    let b = heap.malloc(56); // 64-byte block
    let _g2 = heap.malloc(24);
    unsafe { heap.free(a) };
    unsafe { heap.free(b) };

    // An 80-byte adjusted request walks past the too-small head (64)
    // and takes the 96-byte hole.
    let p = heap.malloc(72);
    assert_eq!(p, a);
    heap.check().expect("check");
}

#[test]
fn scan_falls_through_to_higher_classes() {
    let mut heap = Heap::new();
    heap.init(PAGE).expect("init");

    let a = heap.malloc(56); // 64-byte block, class 1 when freed
    let _guard = heap.malloc(24);
    unsafe { heap.free(a) };

    // Class 1 holds only the too-small 64-byte hole; classes 2..=5 are
    // empty; the request is served from the page remainder in class 6.
    let before = heap.check().expect("check");
    let tail_offset = before
        .free_pairs()
        .iter()
        .find(|&&(_, size)| size >= 112)
        .map(|&(o, _)| o)
        .expect("page remainder");

    let p = heap.malloc(104); // 112-byte adjusted request
    assert_eq!(offset(&heap, p), tail_offset);
    heap.check().expect("check");
}

#[test]
fn freed_blocks_are_reused_in_lifo_order() {
    let mut heap = Heap::new();
    heap.init(PAGE).expect("init");

    let x = heap.malloc(40);
    let _g1 = heap.malloc(24);
    let y = heap.malloc(40);
    let _g2 = heap.malloc(24);
    let z = heap.malloc(40);
    let _g3 = heap.malloc(24);

    unsafe { heap.free(x) };
    unsafe { heap.free(y) };
    unsafe { heap.free(z) };

    // Head insertion: the most recently freed block is handed out
    // first.
    assert_eq!(heap.malloc(40), z);
    assert_eq!(heap.malloc(40), y);
    assert_eq!(heap.malloc(40), x);
    heap.check().expect("check");
}

#[test]
fn freed_blocks_land_in_their_schedule_class() {
    let mut heap = Heap::new();
    heap.init(1 << 16).expect("init");

    // One block at each class lower bound, separated by guards so
    // nothing coalesces.
    let mut freed = Vec::new();
    for class in 0..NUM_SIZE_CLASSES {
        let bound = class_lower_bound(class);
        let p = heap.malloc(bound - 8);
        assert!(!p.is_null(), "class {class}");
        let _guard = heap.malloc(24);
        freed.push((p, bound));
    }
    for &(p, _) in &freed {
        unsafe { heap.free(p) };
    }

    // check() verifies each free block sits on the list its size maps
    // to; the snapshot confirms the expected sizes survived.
    let snap = heap.check().expect("check");
    let pairs = snap.free_pairs();
    for &(p, bound) in &freed {
        assert!(
            pairs.contains(&(offset(&heap, p), bound)),
            "class block of {bound} bytes is free"
        );
    }
    let census = snap.class_census();
    for (class, &(_, bound)) in freed.iter().enumerate() {
        assert!(census[class].blocks >= 1, "class {class}");
        assert!(census[class].bytes >= bound, "class {class}");
    }
}

#[test]
fn extension_merges_with_a_free_block_at_the_top() {
    let mut heap = Heap::new();
    heap.init(PAGE * 4).expect("init");

    // Consume the initial page whole, then free it again.
    let big = heap.malloc(4072);
    assert_eq!(offset(&heap, big), BOOTSTRAP_BYTES);
    unsafe { heap.free(big) };
    assert_eq!(heap.stats().extensions, 1);

    // A request larger than the free page forces an extension whose new
    // span merges with the free block below it; the allocation is
    // served from the merged block's front.
    let p = heap.malloc(6000);
    assert!(!p.is_null());
    assert_eq!(heap.stats().extensions, 2);
    assert_eq!(
        offset(&heap, p),
        BOOTSTRAP_BYTES,
        "merged block starts at the old free block"
    );

    let snap = heap.check().expect("check");
    assert_eq!(snap.free_pairs(), vec![(BOOTSTRAP_BYTES + 6016, PAGE)]);
}
