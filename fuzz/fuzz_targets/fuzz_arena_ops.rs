#![no_main]
use artifact_cache::{Allocation, FitPolicy, FreeListAllocator};
use libfuzzer_sys::{
    arbitrary::{Arbitrary, Unstructured},
    fuzz_target,
};

#[derive(Debug, Arbitrary)]
enum Op {
    Allocate(u16),
    Release(u8),
    AddPage(u16),
}

// Random allocate/release/grow sequences must keep the allocator consistent
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);

    let best_fit: bool = match u.arbitrary() {
        Ok(flag) => flag,
        Err(_) => return,
    };
    let ops: Vec<Op> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let policy = if best_fit {
        FitPolicy::BestFit
    } else {
        FitPolicy::FirstFit
    };
    let mut alloc = FreeListAllocator::new(4096, 32, policy);
    let mut live: Vec<Allocation> = Vec::new();

    for op in ops.iter().take(256) {
        match *op {
            Op::Allocate(size) => {
                if let Some(allocation) = alloc.allocate(size as u64) {
                    live.push(allocation);
                }
            }
            Op::Release(idx) => {
                if !live.is_empty() {
                    let allocation = live.swap_remove(idx as usize % live.len());
                    alloc.release(allocation).unwrap();
                    // Second release of the same range must be refused
                    assert!(alloc.release(allocation).is_err());
                }
            }
            Op::AddPage(len) => {
                if len > 0 {
                    alloc.add_page(len as u64);
                }
            }
        }

        alloc.verify(live.iter()).unwrap();
    }
});
