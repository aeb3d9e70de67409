//! Helper functions that don't particularly belong to any concrete module
//! of the allocator.

/// Rounds `to_be_aligned` up to the next multiple of `alignment`, which
/// must be a power of two.
///
/// This is used to align payload sizes to the machine word size and arena
/// sizes to the page size, so that every block header and every embedded
/// tree node ends up on a properly aligned address.
pub(crate) fn align(to_be_aligned: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn align_pointer_size() {
        let alignments = vec![(1..=8, 8), (9..=16, 16), (17..=24, 24), (25..=32, 32)];

        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(expected, align(size, mem::size_of::<usize>()));
            }
        }
    }

    #[test]
    fn align_page_size() {
        // For testing purposes we are assuming the page size is 4096.
        let alignments = vec![(1..=4096, 4096), (4097..=8192, 8192)];

        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(expected, align(size, 4096));
            }
        }
    }

    #[test]
    fn align_is_identity_on_multiples() {
        for size in [0, 4096, 8192] {
            assert_eq!(size, align(size, 4096));
        }
    }
}
