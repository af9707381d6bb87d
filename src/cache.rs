//! Size presets and the cross-architecture cache line size used as the
//! default cross-thread alignment for scratch and arena allocations.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts")))]
use disabled_contracts::*;

/// Presets for [`crate::scratch::Scratch::init`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScratchSize {
    Small,
    Medium,
    Large,
}

impl ScratchSize {
    #[cfg(not(feature = "test_only_small_constants"))]
    pub fn bytes(self) -> usize {
        match self {
            ScratchSize::Small => 512 * 1024,
            ScratchSize::Medium => 1024 * 1024,
            ScratchSize::Large => 4 * 1024 * 1024,
        }
    }

    // Shrunk so a test that walks Small/Medium/Large doesn't have to commit
    // multiple MiB per preset just to exercise the enum.
    #[cfg(feature = "test_only_small_constants")]
    pub fn bytes(self) -> usize {
        match self {
            ScratchSize::Small => 16 * 1024,
            ScratchSize::Medium => 32 * 1024,
            ScratchSize::Large => 64 * 1024,
        }
    }
}

/// Presets for the `*Arena::init` constructors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArenaSize {
    Small,
    Medium,
    Large,
}

impl ArenaSize {
    #[cfg(not(feature = "test_only_small_constants"))]
    pub fn bytes(self) -> usize {
        match self {
            ArenaSize::Small => 64 * 1024 * 1024,
            ArenaSize::Medium => 256 * 1024 * 1024,
            ArenaSize::Large => 1024 * 1024 * 1024,
        }
    }

    // Same rationale as `ScratchSize::bytes` above: a test that pushes past
    // a "Large" arena to exercise growth/remap should not need a gigabyte.
    #[cfg(feature = "test_only_small_constants")]
    pub fn bytes(self) -> usize {
        match self {
            ArenaSize::Small => MIN_ARENA_SIZE,
            ArenaSize::Medium => MIN_ARENA_SIZE * 4,
            ArenaSize::Large => MIN_ARENA_SIZE * 16,
        }
    }
}

// Mirrors the preprocessor ladder in the C original's cache.h, one
// `#[cfg(target_arch = ...)]` function per branch instead of `#if`/`#elif`,
// since `cfg` can't gate a block expression inline within one function body.
#[cfg(all(target_arch = "aarch64", target_vendor = "apple"))]
fn cache_line_size_for_target() -> usize {
    128 // M1/M2/M3
}

#[cfg(all(target_arch = "powerpc64", not(target_vendor = "apple")))]
fn cache_line_size_for_target() -> usize {
    128 // POWER8, POWER9
}

#[cfg(target_arch = "s390x")]
fn cache_line_size_for_target() -> usize {
    256 // z/Architecture
}

#[cfg(not(any(
    all(target_arch = "aarch64", target_vendor = "apple"),
    all(target_arch = "powerpc64", not(target_vendor = "apple")),
    target_arch = "s390x"
)))]
fn cache_line_size_for_target() -> usize {
    64 // x86(-64), generic arm/aarch64, 32-bit powerpc, and the fallback
}

/// The platform's cache line size, used as the default cross-thread
/// alignment for allocations meant to avoid false sharing.
#[inline]
pub fn cache_line_size() -> usize {
    cache_line_size_for_target()
}

/// The floor `ArenaSize`'s shrunk test presets scale from; irrelevant
/// outside `test_only_small_constants` builds.
#[cfg(feature = "test_only_small_constants")]
pub const MIN_ARENA_SIZE: usize = 64 * 1024;

#[cfg(not(feature = "test_only_small_constants"))]
pub const MIN_ARENA_SIZE: usize = 4096;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_line_is_a_reasonable_power_of_two() {
        let size = cache_line_size();
        assert!(size >= 32 && size <= 256);
        assert!(crate::policy::is_pow2(size));
    }

    #[test]
    fn size_presets_are_monotone() {
        assert!(ScratchSize::Small.bytes() < ScratchSize::Medium.bytes());
        assert!(ScratchSize::Medium.bytes() < ScratchSize::Large.bytes());
        assert!(ArenaSize::Small.bytes() < ArenaSize::Medium.bytes());
        assert!(ArenaSize::Medium.bytes() < ArenaSize::Large.bytes());
    }
}
