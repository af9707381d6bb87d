//! A fixed-size arena: one reservation, committed in full up front.  The
//! simplest of the three variants, and the one a scratch subarena's view
//! is shaped after.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts")))]
use disabled_contracts::*;

use std::ptr::NonNull;

use crate::cache::cache_line_size;
use crate::error::{Error, Result};
use crate::large_block::LargeBlockList;
use crate::os;
use crate::policy;

/// A single fixed-capacity mapping with a bump pointer.  Oversize pushes
/// (bigger than the remaining capacity) spill onto a side chain of
/// individually mapped blocks rather than failing outright.
pub struct StaticArena {
    memory: NonNull<u8>,
    position: usize,
    total_size: usize,
    blocks: LargeBlockList,
    alignment: usize,
    auto_align: bool,
}

// Single-owner: nothing here is shared between threads, but an idle arena
// may be handed off to another thread along with its owning thread.
unsafe impl Send for StaticArena {}

impl StaticArena {
    /// Reserves and commits `arena_size` bytes.  `auto_align`, if
    /// nonzero, must be a power of two at least a word wide; it becomes
    /// the default alignment applied before every `push`.
    #[requires(arena_size >= os::page_size(), "arena must be at least one page")]
    pub fn init(arena_size: usize, auto_align: usize) -> Result<Self> {
        if arena_size < os::page_size() {
            return Err(Error::InvalidParams("arena_size must be at least one page"));
        }

        let auto_align_on = auto_align != 0;
        if auto_align_on && !policy::is_valid_alignment(auto_align) {
            return Err(Error::InvalidParams(
                "auto_align must be zero or a power of two at least a word wide",
            ));
        }
        let alignment = if auto_align_on { auto_align } else { policy::WORD_SIZE };

        let memory = os::reserve_commit(os::page_align_up(arena_size))?;

        Ok(StaticArena {
            memory,
            position: 0,
            total_size: arena_size,
            blocks: LargeBlockList::new(),
            alignment,
            auto_align: auto_align_on,
        })
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn capacity(&self) -> usize {
        self.total_size
    }

    #[requires(policy::is_valid_alignment(alignment), "alignment must be a power of two word or larger")]
    pub fn set_auto_align(&mut self, alignment: usize, on: bool) -> Result<()> {
        if !policy::is_valid_alignment(alignment) {
            return Err(Error::InvalidParams(
                "alignment must be a power of two at least a word wide",
            ));
        }

        self.auto_align = on;
        if on {
            self.alignment = alignment;
        }
        Ok(())
    }

    fn apply_auto_align(&mut self) {
        if self.auto_align {
            self.position = policy::align_up(self.position, self.alignment);
        }
    }

    pub fn push_aligner(&mut self, alignment: usize) -> Result<()> {
        if !policy::is_valid_alignment(alignment) {
            return Err(Error::InvalidParams(
                "alignment must be a power of two at least a word wide",
            ));
        }
        self.position = policy::align_up(self.position, alignment);
        Ok(())
    }

    pub fn push_aligner_cacheline(&mut self) -> Result<()> {
        self.position = policy::align_up(self.position, cache_line_size());
        Ok(())
    }

    pub fn push_aligner_pagesize(&mut self) -> Result<()> {
        self.position = policy::align_up(self.position, os::page_size());
        Ok(())
    }

    /// Carves `bytes` from the arena without zeroing them.  Falls back to
    /// an oversize block when the primary mapping is exhausted; returns
    /// `None` only if that oversize allocation itself fails.
    pub fn push_no_zero(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        self.apply_auto_align();

        if self.position + bytes <= self.total_size {
            let ptr = unsafe { self.memory.as_ptr().add(self.position) };
            self.position += bytes;
            return NonNull::new(ptr);
        }

        self.blocks.push_new(bytes).ok()
    }

    /// Like [`push_no_zero`], but zeroes the returned bytes.
    pub fn push(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        let ptr = self.push_no_zero(bytes)?;
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, bytes) };
        Some(ptr)
    }

    /// Retreats the bump position by `bytes`, clamped to zero.
    pub fn pop(&mut self, bytes: usize) {
        self.position = self.position.saturating_sub(bytes);
    }

    /// Sets the bump position to `position`, but only if that's a
    /// retreat; pops never move the position forward.
    pub fn pop_to(&mut self, position: usize) {
        if position < self.position {
            self.position = position;
        }
    }

    /// Sets the bump position to the offset of `address` within the
    /// arena.  `address` must lie in `[base, base+position)`: the current
    /// live region.  Anything else is rejected and the position is left
    /// untouched.
    pub fn pop_to_address(&mut self, address: NonNull<u8>) -> Result<()> {
        let base = self.memory.as_ptr() as usize;
        let addr = address.as_ptr() as usize;
        let top = base + self.position;

        if addr < base || addr >= top {
            return Err(Error::InvalidParams(
                "address is not within the arena's live region",
            ));
        }

        self.position = addr - base;
        Ok(())
    }

    /// Pops the most recent oversize block, if any.
    pub fn pop_large_block(&mut self) -> Result<()> {
        self.blocks.pop_head()
    }

    /// Resets the bump position to zero and releases every oversize
    /// block.
    pub fn clear(&mut self) -> Result<()> {
        self.position = 0;
        self.blocks.destroy_all()
    }

    /// Releases the oversize chain and the primary mapping.  Called
    /// automatically by `Drop`; exposed directly so a caller can observe
    /// a teardown failure.
    pub fn destroy(mut self) -> Result<()> {
        self.destroy_in_place()
    }

    fn destroy_in_place(&mut self) -> Result<()> {
        let blocks_result = self.blocks.destroy_all();
        let release_result = os::release(self.memory, os::page_align_up(self.total_size));

        self.total_size = 0;
        self.position = 0;
        self.auto_align = false;

        release_result?;
        blocks_result
    }

    pub(crate) fn memory_base(&self) -> NonNull<u8> {
        self.memory
    }

    pub(crate) fn blocks_mut(&mut self) -> &mut LargeBlockList {
        &mut self.blocks
    }

    pub(crate) fn alignment_config(&self) -> (usize, bool) {
        (self.alignment, self.auto_align)
    }

    pub(crate) fn set_position(&mut self, position: usize) {
        self.position = position;
    }
}

impl Drop for StaticArena {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_in_place() {
            log::warn!("StaticArena leaked resources on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_rejects_undersized_arena() {
        assert!(StaticArena::init(1, 0).is_err());
    }

    #[test]
    fn init_rejects_non_power_of_two_auto_align() {
        assert!(StaticArena::init(4096, 3).is_err());
        assert!(StaticArena::init(4096, policy::WORD_SIZE).is_ok());
    }

    #[test]
    fn fill_and_pop_round_trip() {
        let mut arena = StaticArena::init(1024 * 1024, 16).expect("init should succeed");

        let p = arena.push(100).expect("push should succeed");
        assert_eq!(p.as_ptr() as usize % 16, 0);
        assert_eq!(unsafe { *p.as_ptr() }, 0);

        let pos_after_first = arena.position();
        assert!(pos_after_first >= 100);

        // Fill almost to the top, then overflow into an oversize block.
        let remaining = arena.capacity() - arena.position();
        arena
            .push_no_zero(remaining)
            .expect("push should exactly fill the arena");
        assert_eq!(arena.position(), arena.capacity());

        let overflow = arena.push(1).expect("overflow should use an oversize block");
        assert_ne!(overflow.as_ptr() as usize, 0);

        arena.pop_large_block().expect("pop the oversize block");
        arena.clear().expect("clear");
        assert_eq!(arena.position(), 0);
    }

    #[test]
    fn pop_to_address_rejects_out_of_range() {
        let mut arena = StaticArena::init(4096, 0).expect("init");
        let p = arena.push_no_zero(16).expect("push");

        let base = arena.memory_base();
        let before_base = NonNull::new((base.as_ptr() as usize - 8) as *mut u8).unwrap();
        assert!(arena.pop_to_address(before_base).is_err());

        arena.pop_to_address(p).expect("address within live region");
        assert_eq!(arena.position(), 0);
    }

    #[test]
    fn pop_to_never_advances_the_position() {
        let mut arena = StaticArena::init(4096, 0).expect("init");
        arena.push_no_zero(100).expect("push");

        arena.pop_to(1000); // would move forward: rejected
        assert_eq!(arena.position(), 100);

        arena.pop_to(10);
        assert_eq!(arena.position(), 10);
    }

    #[test]
    fn pop_to_then_push_replays_the_same_pointer() {
        let mut arena = StaticArena::init(4096, 16).expect("init");
        let mark = arena.position();

        let first = arena.push_no_zero(48).expect("first push");
        arena.pop_to(mark);

        let second = arena.push_no_zero(48).expect("second push at the same position");
        assert_eq!(first, second);
    }
}
