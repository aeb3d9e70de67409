//! Best-fit general purpose allocator built on page-granular arenas.
//!
//! Memory is requested from the operating system in arenas of whole
//! pages. An arena is a linear sequence of blocks, each one a header
//! followed by its payload:
//!
//! ```text
//! +--------+---------+--------+-------------+--------+-----------+
//! | Header | Payload | Header |   Payload   | Header |  Payload  |
//! +--------+---------+--------+-------------+--------+-----------+
//! ^ first                                   ^ last
//! ```
//!
//! Headers carry the current and previous payload sizes, so neighbors
//! are reachable in both directions by pure address arithmetic. Free
//! blocks reuse their own payload to store an AVL tree node; the tree
//! indexes all free blocks by size and answers best-fit queries in
//! logarithmic time. Requests too large for a standard arena get a
//! dedicated arena of their own, invisible to the tree.
//!
//! ```
//! use fitalloc::Allocator;
//!
//! let mut allocator = Allocator::new();
//!
//! unsafe {
//!     let addr = allocator.allocate(1024).unwrap();
//!     addr.as_ptr().write_bytes(0, 1024);
//!     let addr = allocator.resize(Some(addr), 4096).unwrap();
//!     allocator.free(Some(addr));
//! }
//! ```

mod allocator;
mod block;
mod kernel;
mod tree;
mod utils;

pub use allocator::Allocator;
pub use kernel::{Platform, PlatformMemory};
