//! Alignment rounding and the commit growth/shrink policy shared by every
//! arena variant: how far to round up a bump position, how aggressively to
//! grow or shrink a lazy commit, and when shrinking is worth it at all.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts")))]
use disabled_contracts::*;

/// The pointer width of the target, in bytes.  Every auto-alignment value
/// must be at least this large.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

#[inline]
pub fn is_pow2(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Rounds `n` up to the nearest multiple of `align`, which must be a power
/// of two.
#[requires(is_pow2(align), "alignment must be a power of two")]
#[ensures(ret >= n, "align_up never rounds down")]
#[ensures(ret % align == 0, "the result is always aligned")]
#[inline]
pub fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Returns `true` when `alignment` is acceptable for `set_auto_align`: a
/// power of two no smaller than a machine word.
#[inline]
pub fn is_valid_alignment(alignment: usize) -> bool {
    is_pow2(alignment) && alignment >= WORD_SIZE
}

/// The next commit target when growing: quadruple the current size.
///
/// Chosen to amortize the cost of repeated `commit` syscalls against a
/// workload that keeps pushing past the current commit boundary, at the
/// price of temporarily over-committing up to 4x what's actually used.
#[inline]
pub fn extend_policy(committed: usize) -> usize {
    committed.saturating_mul(4)
}

/// The next commit target when shrinking: halve the current size.
#[inline]
pub fn reduce_policy(committed: usize) -> usize {
    committed / 2
}

/// Whether a pop that leaves `used` bytes live is worth decommitting
/// pages over: true once the committed region is at least 4x oversized.
#[inline]
pub fn should_reduce(committed: usize, used: usize) -> bool {
    committed >= used.saturating_mul(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(4095, 4096), 4096);
    }

    #[test]
    fn valid_alignment_rejects_non_pow2_and_subword() {
        assert!(is_valid_alignment(WORD_SIZE));
        assert!(is_valid_alignment(64));
        assert!(!is_valid_alignment(0));
        assert!(!is_valid_alignment(3));
        assert!(!is_valid_alignment(WORD_SIZE / 2usize.max(1) + 1));
    }

    #[test]
    fn growth_and_shrink_policy() {
        assert_eq!(extend_policy(4096), 16384);
        assert_eq!(reduce_policy(16384), 8192);
        assert!(should_reduce(16384, 1000));
        assert!(!should_reduce(8192, 4000));
    }

    proptest::proptest! {
        #[test]
        fn align_up_is_idempotent(n: usize, shift in 0u32..12) {
            let align = 1usize << shift;
            let aligned = align_up(n.min(usize::MAX / 2), align);
            proptest::prop_assert_eq!(align_up(aligned, align), aligned);
        }
    }
}
