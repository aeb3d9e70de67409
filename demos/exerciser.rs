//! Randomized stress exerciser: a fixed pool of slots driven through
//! allocate / resize / free with every live buffer checksummed between
//! operations. Any heap corruption shows up as a checksum mismatch.
//!
//! Usage: `exerciser [iterations] [seed]`, both optional.

use std::ptr::NonNull;

use fitalloc::Allocator;

const SLOTS: usize = 100;
const SIZE_MAX: usize = 40940;

struct Slot {
    addr: Option<NonNull<u8>>,
    size: usize,
    checksum: u32,
}

/// splitmix64, deterministic per seed.
fn next(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e3779b97f4a7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

unsafe fn fill(addr: NonNull<u8>, size: usize, rng: &mut u64) {
    for i in 0..size {
        unsafe { *addr.as_ptr().add(i) = next(rng) as u8 };
    }
}

unsafe fn checksum(addr: NonNull<u8>, size: usize) -> u32 {
    let mut sum: u32 = 0;
    for i in 0..size {
        let byte = unsafe { *addr.as_ptr().add(i) };
        sum = (sum << 3) ^ (sum >> 5) ^ u32::from(byte);
    }
    sum
}

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let iterations: usize = args
        .next()
        .map(|arg| arg.parse().expect("iterations must be a number"))
        .unwrap_or(1000);
    let mut rng: u64 = args
        .next()
        .map(|arg| arg.parse().expect("seed must be a number"))
        .unwrap_or(0x5eed);

    let mut allocator = Allocator::new();
    let mut slots: Vec<Slot> = (0..SLOTS)
        .map(|_| Slot { addr: None, size: 0, checksum: 0 })
        .collect();
    let mut allocations: usize = 0;
    let mut resizes: usize = 0;
    let mut frees: usize = 0;

    unsafe {
        for iteration in 0..iterations {
            for (index, slot) in slots.iter().enumerate() {
                if let Some(addr) = slot.addr {
                    let sum = checksum(addr, slot.size);
                    assert_eq!(
                        sum, slot.checksum,
                        "iteration {iteration}: slot {index} corrupted"
                    );
                }
            }

            let index = next(&mut rng) as usize % SLOTS;
            let size = next(&mut rng) as usize % SIZE_MAX + 1;

            if slots[index].addr.is_none() {
                let addr = allocator.allocate(size).expect("backend out of memory");
                fill(addr, size, &mut rng);
                slots[index] = Slot { addr: Some(addr), size, checksum: checksum(addr, size) };
                allocations += 1;
            } else if next(&mut rng) % 2 == 0 {
                let live = slots[index].size.min(size);
                let before = checksum(slots[index].addr.unwrap(), live);

                let addr = allocator.resize(slots[index].addr, size).expect("backend out of memory");
                assert_eq!(
                    checksum(addr, live),
                    before,
                    "iteration {iteration}: resize lost content"
                );

                fill(addr, size, &mut rng);
                slots[index] = Slot { addr: Some(addr), size, checksum: checksum(addr, size) };
                resizes += 1;
            } else {
                allocator.free(slots[index].addr);
                slots[index] = Slot { addr: None, size: 0, checksum: 0 };
                frees += 1;
            }
        }

        for slot in &mut slots {
            allocator.free(slot.addr.take());
        }
    }

    allocator.dump("final state");
    println!("{iterations} iterations: {allocations} allocations, {resizes} resizes, {frees} frees");
}
