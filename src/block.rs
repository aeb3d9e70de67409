use std::{mem, ptr::NonNull};

use crate::kernel::PlatformMemory;
use crate::tree::TreeNode;
use crate::utils::align;

/// Size of the header that precedes every payload, in bytes.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Block>();

/// Smallest payload a block may have. A free block stores its tree node
/// inside the payload, so no block is ever allowed to shrink below the
/// node's footprint.
pub(crate) const BLOCK_SIZE_MIN: usize = mem::size_of::<TreeNode>();

const FLAG_BUSY: u8 = 1 << 0;
const FLAG_FIRST: u8 = 1 << 1;
const FLAG_LAST: u8 = 1 << 2;

/// Block header. Sits immediately before the payload handed to clients:
///
/// ```text
/// +---------------------+ <------+
/// |      size_curr      |        |
/// +---------------------+        |
/// |      size_prev      |        |
/// +---------------------+        | -> Header
/// |       offset        |        |
/// +---------------------+        |
/// | busy|first|last (1B)|        |
/// +---------------------+ <------+
/// |       Payload       |        |
/// |         ...         |        | -> Addressable content, or the
/// |         ...         |        |    embedded tree node while free
/// +---------------------+ <------+
/// ```
///
/// Blocks inside one arena form a linear sequence with no pointers
/// between them: `size_curr` is the distance to the next header,
/// `size_prev` the distance back to the previous one, and the first/last
/// flags bound the sequence. `offset` is the distance from the start of
/// the arena, kept so a free block can compute which of its interior
/// pages are page-aligned and returnable to the OS.
///
/// Invariant between any two adjacent blocks A and B:
/// `B.size_prev == A.size_curr`, and only the block at the very end of
/// the arena carries the last flag.
#[repr(C)]
pub(crate) struct Block {
    /// Usable payload size of this block, header excluded.
    size_curr: usize,
    /// Payload size of the preceding block; meaningless on a first block.
    size_prev: usize,
    /// Byte offset of this header from the start of the owning arena.
    offset: usize,
    /// Bit-packed BUSY / FIRST / LAST flags.
    flags: u8,
}

impl Block {
    #[inline]
    pub fn size_curr(&self) -> usize {
        self.size_curr
    }

    #[inline]
    pub fn size_prev(&self) -> usize {
        self.size_prev
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn set_size_curr(&mut self, size: usize) {
        self.size_curr = size;
    }

    #[inline]
    pub fn set_size_prev(&mut self, size: usize) {
        self.size_prev = size;
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.flags & FLAG_BUSY != 0
    }

    #[inline]
    pub fn is_first(&self) -> bool {
        self.flags & FLAG_FIRST != 0
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        self.flags & FLAG_LAST != 0
    }

    #[inline]
    pub fn set_busy(&mut self) {
        self.flags |= FLAG_BUSY;
    }

    #[inline]
    pub fn clear_busy(&mut self) {
        self.flags &= !FLAG_BUSY;
    }

    #[inline]
    pub fn set_last(&mut self) {
        self.flags |= FLAG_LAST;
    }

    #[inline]
    pub fn clear_last(&mut self) {
        self.flags &= !FLAG_LAST;
    }

    /// Writes a header describing a single free block that spans a whole
    /// freshly reserved arena of `arena_size - BLOCK_HEADER_SIZE` payload
    /// bytes.
    ///
    /// # Safety
    ///
    /// `block` must point to the first byte of a writable region of at
    /// least `BLOCK_HEADER_SIZE + payload` bytes.
    pub unsafe fn init_arena(block: NonNull<Block>, payload: usize) {
        unsafe {
            block.as_ptr().write(Block {
                size_curr: payload,
                size_prev: 0,
                offset: 0,
                flags: FLAG_FIRST | FLAG_LAST,
            });
        }
    }

    /// Address of the payload that belongs to this header.
    #[inline]
    pub unsafe fn payload_of(block: NonNull<Block>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(block.as_ptr().offset(1)).cast() }
    }

    /// Recovers the header from a payload address previously produced by
    /// [`Block::payload_of`].
    ///
    /// # Safety
    ///
    /// `payload` must be an address this allocator handed out; anything
    /// else reads garbage as a header.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<Block> {
        unsafe { NonNull::new_unchecked(payload.cast::<Block>().as_ptr().offset(-1)) }
    }

    /// The tree node embedded at the start of a free block's payload.
    #[inline]
    pub unsafe fn node_of(block: NonNull<Block>) -> NonNull<TreeNode> {
        unsafe { Self::payload_of(block).cast() }
    }

    /// Inverse of [`Block::node_of`].
    #[inline]
    pub unsafe fn from_node(node: NonNull<TreeNode>) -> NonNull<Block> {
        unsafe { Self::from_payload(node.cast()) }
    }

    /// The block that starts right after this one's payload ends.
    ///
    /// # Safety
    ///
    /// Must not be called on a block with the last flag; there is nothing
    /// after it. Callers always check the flag first.
    #[inline]
    pub unsafe fn next(block: NonNull<Block>) -> NonNull<Block> {
        unsafe {
            debug_assert!(!block.as_ref().is_last());
            let distance = BLOCK_HEADER_SIZE + block.as_ref().size_curr;
            NonNull::new_unchecked(block.as_ptr().byte_add(distance))
        }
    }

    /// The block whose payload ends right before this one's header.
    ///
    /// # Safety
    ///
    /// Must not be called on a block with the first flag; `size_prev` is
    /// meaningless there. Callers always check the flag first.
    #[inline]
    pub unsafe fn prev(block: NonNull<Block>) -> NonNull<Block> {
        unsafe {
            debug_assert!(!block.as_ref().is_first());
            let distance = BLOCK_HEADER_SIZE + block.as_ref().size_prev;
            NonNull::new_unchecked(block.as_ptr().byte_sub(distance))
        }
    }

    /// Marks `block` busy and, when worthwhile, carves its payload down
    /// to `size` bytes, creating a new free block out of the remainder:
    ///
    /// ```text
    /// +--------+----------------------+      +--------+------+ +--------+------+
    /// | Header |       Payload        |  =>  | Header | size | | Header | rest |
    /// +--------+----------------------+      +--------+------+ +--------+------+
    /// ```
    ///
    /// Returns the remainder block, already wired into the adjacency
    /// chain (size_prev updated, last flag moved), or `None` when the
    /// leftover couldn't host a header plus a minimum payload. In that
    /// case the block keeps its full size.
    ///
    /// # Safety
    ///
    /// `size` must not exceed `block.size_curr`. The allocator only ever
    /// passes sizes rounded to its alignment granularity, which keeps
    /// every header and embedded node aligned.
    pub unsafe fn divide(mut block: NonNull<Block>, size: usize) -> Option<NonNull<Block>> {
        unsafe {
            block.as_mut().set_busy();

            let rest = block.as_ref().size_curr - size;
            if rest < BLOCK_HEADER_SIZE + BLOCK_SIZE_MIN {
                return None;
            }
            let rest = rest - BLOCK_HEADER_SIZE;

            block.as_mut().size_curr = size;

            let was_last = block.as_ref().is_last();
            block.as_mut().clear_last();

            let mut right = Self::next(block);
            right.as_ptr().write(Block {
                size_curr: rest,
                size_prev: size,
                offset: block.as_ref().offset + size + BLOCK_HEADER_SIZE,
                flags: 0,
            });

            if was_last {
                right.as_mut().set_last();
            } else {
                Self::next(right).as_mut().set_size_prev(rest);
            }

            Some(right)
        }
    }

    /// Merges `right` into `left`, its address-adjacent predecessor.
    /// `right`'s header stops existing; the caller must have removed it
    /// from the free tree beforehand.
    ///
    /// # Safety
    ///
    /// `right` must be free and must be exactly `Block::next(left)`.
    pub unsafe fn combine(mut left: NonNull<Block>, right: NonNull<Block>) {
        unsafe {
            debug_assert!(!right.as_ref().is_busy());
            debug_assert!(Self::next(left) == right);

            let merged = left.as_ref().size_curr + right.as_ref().size_curr + BLOCK_HEADER_SIZE;
            left.as_mut().size_curr = merged;

            if right.as_ref().is_last() {
                left.as_mut().set_last();
            } else {
                Self::next(right).as_mut().set_size_prev(merged);
            }
        }
    }

    /// For a free block much larger than a page, hints the OS that the
    /// page-aligned interior of its payload is unused so the physical
    /// frames can be reclaimed. The header and the embedded tree node are
    /// excluded from the range; the virtual addresses stay valid either
    /// way. No-op when the block is too small or rounding collapses the
    /// range.
    ///
    /// # Safety
    ///
    /// `block` must be free and `page_size` must be the page size of the
    /// backend that mapped its arena.
    pub unsafe fn release_unused<P: PlatformMemory>(block: NonNull<Block>, page_size: usize) {
        unsafe {
            let size_curr = block.as_ref().size_curr;
            if size_curr - BLOCK_SIZE_MIN < page_size {
                return;
            }

            // Arena-relative bounds of the advisable range: up-aligned
            // past the header and node, down-aligned at the payload end.
            let offset = block.as_ref().offset;
            let start = align(offset + BLOCK_HEADER_SIZE + BLOCK_SIZE_MIN, page_size);
            let end = (offset + BLOCK_HEADER_SIZE + size_curr) & !(page_size - 1);

            if start == end {
                return;
            }
            debug_assert!(start < end && (end - start) % page_size == 0);

            let addr = NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(start - offset));
            P::advise_unused(addr, end - start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA: usize = 4096;

    /// A word-aligned buffer standing in for an OS arena.
    fn arena_buffer() -> Box<[usize]> {
        vec![0usize; ARENA / mem::size_of::<usize>()].into_boxed_slice()
    }

    unsafe fn arena_block(buffer: &mut [usize]) -> NonNull<Block> {
        unsafe {
            let block = NonNull::new_unchecked(buffer.as_mut_ptr()).cast::<Block>();
            Block::init_arena(block, ARENA - BLOCK_HEADER_SIZE);
            block
        }
    }

    #[test]
    fn fresh_arena_is_one_free_block() {
        let mut buffer = arena_buffer();
        unsafe {
            let block = arena_block(&mut buffer);

            assert_eq!(block.as_ref().size_curr(), ARENA - BLOCK_HEADER_SIZE);
            assert_eq!(block.as_ref().offset(), 0);
            assert!(!block.as_ref().is_busy());
            assert!(block.as_ref().is_first());
            assert!(block.as_ref().is_last());
        }
    }

    #[test]
    fn divide_wires_the_adjacency_chain() {
        let mut buffer = arena_buffer();
        unsafe {
            let block = arena_block(&mut buffer);
            let right = Block::divide(block, 512).unwrap();

            assert!(block.as_ref().is_busy());
            assert_eq!(block.as_ref().size_curr(), 512);
            assert!(block.as_ref().is_first());
            assert!(!block.as_ref().is_last());

            assert_eq!(right, Block::next(block));
            assert_eq!(block, Block::prev(right));
            assert_eq!(right.as_ref().size_prev(), 512);
            assert_eq!(
                right.as_ref().size_curr(),
                ARENA - 2 * BLOCK_HEADER_SIZE - 512
            );
            assert_eq!(right.as_ref().offset(), 512 + BLOCK_HEADER_SIZE);
            assert!(!right.as_ref().is_busy());
            assert!(!right.as_ref().is_first());
            assert!(right.as_ref().is_last());
        }
    }

    #[test]
    fn divide_updates_size_prev_of_the_follower() {
        let mut buffer = arena_buffer();
        unsafe {
            let block = arena_block(&mut buffer);
            let tail = Block::divide(block, 512).unwrap();

            // Split the middle block again; the tail's size_prev must
            // track the new middle block, not the original.
            let middle = Block::divide(block, 256);
            // 512 - 256 leaves no room for header + node on most targets.
            if let Some(middle) = middle {
                assert_eq!(Block::next(middle), tail);
                assert_eq!(tail.as_ref().size_prev(), middle.as_ref().size_curr());
            } else {
                assert_eq!(block.as_ref().size_curr(), 512);
            }
        }
    }

    #[test]
    fn divide_refuses_an_unworthy_split() {
        let mut buffer = arena_buffer();
        unsafe {
            let block = arena_block(&mut buffer);
            let payload = block.as_ref().size_curr();

            // One byte short of hosting the remainder's header + node.
            let size = payload - BLOCK_HEADER_SIZE - BLOCK_SIZE_MIN + 1;
            assert!(Block::divide(block, size).is_none());

            // The block stays whole but is now busy.
            assert!(block.as_ref().is_busy());
            assert_eq!(block.as_ref().size_curr(), payload);
            assert!(block.as_ref().is_last());
        }
    }

    #[test]
    fn divide_at_exact_threshold_splits() {
        let mut buffer = arena_buffer();
        unsafe {
            let block = arena_block(&mut buffer);
            let payload = block.as_ref().size_curr();

            let size = payload - BLOCK_HEADER_SIZE - BLOCK_SIZE_MIN;
            let right = Block::divide(block, size).unwrap();

            assert_eq!(right.as_ref().size_curr(), BLOCK_SIZE_MIN);
            assert!(right.as_ref().is_last());
        }
    }

    #[test]
    fn combine_reverses_divide() {
        let mut buffer = arena_buffer();
        unsafe {
            let mut block = arena_block(&mut buffer);
            let payload = block.as_ref().size_curr();

            let right = Block::divide(block, 512).unwrap();
            block.as_mut().clear_busy();

            Block::combine(block, right);

            assert_eq!(block.as_ref().size_curr(), payload);
            assert!(block.as_ref().is_first());
            assert!(block.as_ref().is_last());
        }
    }

    #[test]
    fn combine_updates_size_prev_of_the_follower() {
        let mut buffer = arena_buffer();
        unsafe {
            let mut block = arena_block(&mut buffer);

            let mut middle = Block::divide(block, 512).unwrap();
            let tail = Block::divide(middle, 1024).unwrap();

            // Merge head and middle; the tail must now point back at the
            // merged block.
            block.as_mut().clear_busy();
            middle.as_mut().clear_busy();
            let middle_size = middle.as_ref().size_curr();
            Block::combine(block, middle);

            assert_eq!(
                block.as_ref().size_curr(),
                512 + BLOCK_HEADER_SIZE + middle_size
            );
            assert_eq!(tail.as_ref().size_prev(), block.as_ref().size_curr());
            assert_eq!(Block::next(block), tail);
            assert_eq!(Block::prev(tail), block);
        }
    }

    #[test]
    fn payload_header_roundtrip() {
        let mut buffer = arena_buffer();
        unsafe {
            let block = arena_block(&mut buffer);
            let payload = Block::payload_of(block);

            assert_eq!(
                payload.as_ptr() as usize - block.as_ptr() as usize,
                BLOCK_HEADER_SIZE
            );
            assert_eq!(Block::from_payload(payload), block);
            assert_eq!(Block::from_node(Block::node_of(block)), block);
        }
    }
}
