//! Walks the allocator through a small mixed workload and dumps the free
//! tree after each step. Run with `RUST_LOG=debug` to also see the arena
//! traffic with the operating system.

use std::ptr::NonNull;

use fitalloc::Allocator;

fn log_alloc(label: &str, addr: Option<NonNull<u8>>, size: usize) {
    match addr {
        Some(addr) => println!("{label}: {size} bytes at {addr:p}"),
        None => println!("{label}: {size} bytes refused"),
    }
}

fn main() {
    env_logger::init();

    let mut allocator = Allocator::new();

    unsafe {
        let a = allocator.allocate(50000);
        log_alloc("a", a, 50000);
        let b = allocator.allocate(10);
        log_alloc("b", b, 10);
        let c = allocator.allocate(12000);
        log_alloc("c", c, 12000);
        let d = allocator.allocate(1500);
        log_alloc("d", d, 1500);
        allocator.dump("after four allocations");

        let a = allocator.resize(a, 100000);
        log_alloc("a grown", a, 100000);
        allocator.dump("after growing a");

        allocator.free(a);
        allocator.dump("after freeing a");

        let d = allocator.resize(d, 2000);
        log_alloc("d grown", d, 2000);
        allocator.dump("after growing d");

        allocator.free(b);
        allocator.free(c);
        allocator.free(d);
        allocator.dump("after freeing everything");
    }
}
