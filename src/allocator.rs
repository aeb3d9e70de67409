use std::{marker::PhantomData, mem, ptr, ptr::NonNull};

use crate::block::{BLOCK_HEADER_SIZE, BLOCK_SIZE_MIN, Block};
use crate::kernel::{Platform, PlatformMemory};
use crate::tree::{Tree, TreeNode};
use crate::utils::align;

/// Number of pages in a standard arena. Requests that don't fit get a
/// dedicated arena of their own instead.
const ARENA_PAGES: usize = 32;

/// Alignment granularity of payload sizes and therefore of every header
/// address inside an arena.
const ALIGN: usize = mem::size_of::<usize>();

/// Best-fit heap allocator.
///
/// Memory comes from the backend `P` in page-granular arenas. Each arena
/// is a linear sequence of header-prefixed blocks (see [`Block`]); free
/// blocks additionally appear in a size-indexed AVL tree (see
/// [`crate::tree`]) so allocation can find the smallest block that fits.
/// Requests too large for a standard arena get a dedicated, exactly
/// sized arena that never touches the tree.
///
/// Each instance is fully independent: it owns its tree and its arenas,
/// and several allocators can coexist in one process. The structure is
/// built on raw pointers and is deliberately `!Send`/`!Sync`; wrap every
/// entry point in one lock if multiple threads need it.
///
/// Arenas are released back to the backend as soon as all their blocks
/// have been freed and coalesced. Dropping an allocator that still has
/// busy blocks leaks their arenas, the same way leaking a `malloc`'d
/// pointer would.
pub struct Allocator<P: PlatformMemory = Platform> {
    /// Free blocks indexed by payload size.
    tree: Tree,
    /// Backend page size, cached at construction.
    page_size: usize,
    /// Standard arena size in bytes.
    arena_size: usize,
    /// Largest payload a standard arena can host; anything above goes to
    /// the dedicated-arena path.
    block_size_max: usize,
    _platform: PhantomData<P>,
}

impl Allocator {
    /// Constructs an allocator backed by the operating system's virtual
    /// memory interface.
    pub fn new() -> Self {
        Self::with_backend()
    }
}

impl<P: PlatformMemory> Allocator<P> {
    /// Constructs an allocator on an arbitrary backend `P`. No memory is
    /// requested from the backend until the first allocation.
    pub fn with_backend() -> Self {
        let page_size = unsafe { P::page_size() };
        let arena_size = page_size * ARENA_PAGES;

        Self {
            tree: Tree::new(),
            page_size,
            arena_size,
            block_size_max: arena_size - BLOCK_HEADER_SIZE,
            _platform: PhantomData,
        }
    }

    /// Allocates a block of at least `size` usable bytes and returns the
    /// payload address, or `None` when the backend is out of memory.
    /// A size of zero is served as the minimum block size.
    ///
    /// # Safety
    ///
    /// The returned address is valid until passed to [`Allocator::free`]
    /// or moved by [`Allocator::resize`]. Nothing is initialized.
    pub unsafe fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        unsafe {
            if size > self.block_size_max {
                let block = self.allocate_dedicated(size)?;
                return Some(Block::payload_of(block));
            }

            let size = clamp_round(size);
            let block = self.find_suitable_block(size)?;

            if let Some(rest) = Block::divide(block, size) {
                self.add_to_tree(rest);
            }

            Some(Block::payload_of(block))
        }
    }

    /// Returns a block to the allocator. `None` is a no-op.
    ///
    /// The block is coalesced with free neighbors; if that leaves it
    /// spanning its whole arena the arena goes back to the backend,
    /// otherwise the block enters the free tree (after hinting the
    /// backend that its interior pages are unused).
    ///
    /// # Safety
    ///
    /// `address` must have been produced by this allocator and must be
    /// currently allocated. Double frees and foreign pointers are
    /// undefined behavior, as with any heap allocator.
    pub unsafe fn free(&mut self, address: Option<NonNull<u8>>) {
        let Some(payload) = address else { return };

        unsafe {
            let mut block = Block::from_payload(payload);
            block.as_mut().clear_busy();

            // Dedicated blocks never joined the tree and their arena is
            // exactly the block itself: hand the whole thing back.
            if block.as_ref().size_curr() > self.block_size_max {
                let len = block.as_ref().size_curr() + BLOCK_HEADER_SIZE;
                log::debug!("releasing {len} byte dedicated arena at {block:p}");
                P::release(block.cast(), len);
                return;
            }

            block = self.coalesce(block);

            if block.as_ref().is_first() && block.as_ref().is_last() {
                let len = block.as_ref().size_curr() + BLOCK_HEADER_SIZE;
                debug_assert_eq!(len, self.arena_size);
                log::debug!("releasing {len} byte arena at {block:p}");
                P::release(block.cast(), len);
            } else {
                Block::release_unused::<P>(block, self.page_size);
                self.add_to_tree(block);
            }
        }
    }

    /// Changes the size of an allocation, preserving its content up to
    /// the smaller of the old and new sizes.
    ///
    /// A `None` address behaves like [`Allocator::allocate`]. Shrinking
    /// and growing happen in place when the neighboring space allows it;
    /// otherwise the content moves to a fresh block. Returns `None` when
    /// a required fresh block cannot be obtained, in which case the
    /// original allocation is untouched and still valid.
    ///
    /// # Safety
    ///
    /// Same contract as [`Allocator::free`] for non-`None` addresses. On
    /// success the returned address replaces the old one, which must not
    /// be used again.
    pub unsafe fn resize(
        &mut self,
        address: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        unsafe {
            let Some(payload) = address else {
                return self.allocate(new_size);
            };

            // A size so close to the address-space limit that rounding
            // would wrap is plain exhaustion, not an error to die on.
            if new_size > usize::MAX - (ALIGN - 1) {
                return None;
            }
            let new_size = clamp_round(new_size);

            let block = Block::from_payload(payload);
            let current = block.as_ref().size_curr();

            if current > self.block_size_max {
                // Dedicated arenas are exactly sized; any real change
                // means moving.
                if new_size == current {
                    return Some(payload);
                }
                return self.relocate(payload, current, new_size);
            }

            if new_size == current {
                return Some(payload);
            }
            if new_size < current {
                return Some(self.shrink(block, new_size));
            }
            if let Some(expanded) = self.expand_in_place(block, new_size) {
                return Some(expanded);
            }

            self.relocate(payload, current, new_size)
        }
    }

    /// Prints every free block known to the tree, in size order, with its
    /// adjacency and flag state. Diagnostics only.
    pub fn dump(&self, label: &str) {
        println!("{label}:");

        if self.tree.is_empty() {
            println!("  tree is empty");
            return;
        }

        unsafe {
            self.tree.walk(|node, chained| {
                let block = Block::from_node(node);
                let header = block.as_ref();
                println!(
                    "  [{:p}] {:>10} {:>10} {} {} {} {}",
                    block,
                    header.size_curr(),
                    header.size_prev(),
                    if header.is_busy() { "busy" } else { "free" },
                    if header.is_first() { "first" } else { "" },
                    if header.is_last() { "last" } else { "" },
                    if chained { "chained" } else { "" },
                );
            });
        }
    }

    /// Takes the best-fitting free block out of the tree, or initializes
    /// a fresh standard arena when the tree has nothing big enough.
    unsafe fn find_suitable_block(&mut self, size: usize) -> Option<NonNull<Block>> {
        unsafe {
            if let Some(node) = self.tree.find_best(size) {
                self.tree.remove(node);
                return Some(Block::from_node(node));
            }

            self.request_arena(self.arena_size)
        }
    }

    /// Reserves a dedicated arena for a request that exceeds the standard
    /// block size: the rounded request plus header, rounded up to whole
    /// pages so the payload always covers it. Checked arithmetic turns
    /// near-`usize::MAX` requests into `None` instead of a wrap.
    unsafe fn allocate_dedicated(&mut self, requested: usize) -> Option<NonNull<Block>> {
        unsafe {
            if requested > usize::MAX - (ALIGN - 1) {
                return None;
            }

            let rounded = align(requested, ALIGN);
            let total = rounded.checked_add(BLOCK_HEADER_SIZE + self.page_size - 1)?;
            let arena_size = total & !(self.page_size - 1);

            let block = self.request_arena(arena_size)?;
            // The whole arena is one block; mark it busy without ever
            // touching the tree. Exact sizing means there is no rest.
            let rest = Block::divide(block, block.as_ref().size_curr());
            debug_assert!(rest.is_none());
            Some(block)
        }
    }

    /// Asks the backend for `arena_size` bytes and initializes them as a
    /// single spanning free block.
    unsafe fn request_arena(&mut self, arena_size: usize) -> Option<NonNull<Block>> {
        unsafe {
            let addr = P::reserve(arena_size)?;
            log::debug!("reserved {arena_size} byte arena at {addr:p}");

            let block = addr.cast::<Block>();
            Block::init_arena(block, arena_size - BLOCK_HEADER_SIZE);
            Some(block)
        }
    }

    /// Merges `block` with its free neighbors on both sides. Neighbors
    /// are found by address arithmetic, not through the tree; the tree
    /// only learns about it because the absorbed side must leave it
    /// before its header is overwritten. Returns the surviving block,
    /// which is the predecessor if one was absorbed into.
    unsafe fn coalesce(&mut self, mut block: NonNull<Block>) -> NonNull<Block> {
        unsafe {
            if !block.as_ref().is_last() {
                let next = Block::next(block);
                if !next.as_ref().is_busy() {
                    self.remove_from_tree(next);
                    Block::combine(block, next);
                }
            }

            if !block.as_ref().is_first() {
                let prev = Block::prev(block);
                if !prev.as_ref().is_busy() {
                    self.remove_from_tree(prev);
                    Block::combine(prev, block);
                    block = prev;
                }
            }

            block
        }
    }

    /// In-place shrink. The cut-off tail is merged with a free successor
    /// when there is one, then offered back to the tree. When the tail is
    /// too small to stand on its own the block simply keeps its size.
    unsafe fn shrink(&mut self, block: NonNull<Block>, new_size: usize) -> NonNull<u8> {
        unsafe {
            if let Some(rest) = Block::divide(block, new_size) {
                if !rest.as_ref().is_last() {
                    let next = Block::next(rest);
                    if !next.as_ref().is_busy() {
                        self.remove_from_tree(next);
                        Block::combine(rest, next);
                    }
                }
                self.add_to_tree(rest);
            }

            Block::payload_of(block)
        }
    }

    /// In-place growth: absorb a free successor when the combined span
    /// covers `new_size`, then split the surplus off again. Returns
    /// `None` when the successor is busy, absent, or too small.
    unsafe fn expand_in_place(
        &mut self,
        block: NonNull<Block>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        unsafe {
            if block.as_ref().is_last() {
                return None;
            }

            let next = Block::next(block);
            if next.as_ref().is_busy() {
                return None;
            }

            let combined =
                block.as_ref().size_curr() + next.as_ref().size_curr() + BLOCK_HEADER_SIZE;
            if combined < new_size {
                return None;
            }

            self.remove_from_tree(next);
            Block::combine(block, next);

            if let Some(rest) = Block::divide(block, new_size) {
                self.add_to_tree(rest);
            }

            Some(Block::payload_of(block))
        }
    }

    /// Move path shared by resize: fresh allocation, copy of the live
    /// prefix, release of the old block. On allocation failure the old
    /// block is left exactly as it was.
    unsafe fn relocate(
        &mut self,
        payload: NonNull<u8>,
        current: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        unsafe {
            let new_payload = self.allocate(new_size)?;
            ptr::copy_nonoverlapping(
                payload.as_ptr(),
                new_payload.as_ptr(),
                current.min(new_size),
            );
            self.free(Some(payload));
            Some(new_payload)
        }
    }

    unsafe fn add_to_tree(&mut self, block: NonNull<Block>) {
        unsafe {
            debug_assert!(!block.as_ref().is_busy());
            let size = block.as_ref().size_curr();
            debug_assert!(size >= BLOCK_SIZE_MIN);

            // The node lives in the payload we are no longer using.
            let node = Block::node_of(block);
            node.as_ptr().write(TreeNode::new());
            self.tree.insert(node, size);
        }
    }

    unsafe fn remove_from_tree(&mut self, block: NonNull<Block>) {
        unsafe {
            debug_assert!(!block.as_ref().is_busy());
            self.tree.remove(Block::node_of(block));
        }
    }
}

impl<P: PlatformMemory> Default for Allocator<P> {
    fn default() -> Self {
        Self::with_backend()
    }
}

/// Requested size to actual payload size: clamp up to the minimum block
/// size, then round to the alignment granularity.
fn clamp_round(size: usize) -> usize {
    align(size.max(BLOCK_SIZE_MIN), ALIGN)
}
