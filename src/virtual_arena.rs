//! A single large reservation whose commit grows and shrinks lazily.  Trades
//! the static arena's "pay for everything up front" for "pay per extend",
//! at the cost of tracking a separate committed size.
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

/// A lazily committed arena over a single VM reservation.  When `remap` is
/// enabled, a push that would exceed the current reservation grows it by
/// copying into a fresh, larger mapping instead of spilling to an oversize
/// block.
pub struct VirtualArena {
    memory: NonNull<u8>,
    position: usize,
    committed_size: usize,
    total_size: usize,
    blocks: LargeBlockList,
    alignment: usize,
    auto_align: bool,
    remap: bool,
}

unsafe impl Send for VirtualArena {}

impl VirtualArena {
    #[requires(arena_size >= os::page_size(), "arena must be at least one page")]
    pub fn init(arena_size: usize, auto_align: usize, remap: bool) -> Result<Self> {
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

        let total_size = os::page_align_up(arena_size);
        let memory = os::reserve(total_size)?;
        let committed_size = os::page_size();

        if let Err(e) = os::commit(memory, committed_size) {
            let _ = os::release(memory, total_size);
            return Err(e);
        }

        Ok(VirtualArena {
            memory,
            position: 0,
            committed_size,
            total_size,
            blocks: LargeBlockList::new(),
            alignment,
            auto_align: auto_align_on,
            remap,
        })
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn committed(&self) -> usize {
        self.committed_size
    }

    pub fn reservation(&self) -> usize {
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

    /// Grows the reservation itself, copying the live prefix across.
    /// `new_total` must be at least the current committed size.
    fn remap_to(&mut self, new_total: usize) -> Result<()> {
        if new_total < self.committed_size {
            return Err(Error::InvalidParams(
                "remap target must be at least the committed size",
            ));
        }

        let new_total = os::page_align_up(new_total);
        let new_memory = os::reserve(new_total)?;

        if let Err(e) = os::commit(new_memory, new_total) {
            let _ = os::release(new_memory, new_total);
            return Err(e);
        }

        unsafe {
            std::ptr::copy_nonoverlapping(self.memory.as_ptr(), new_memory.as_ptr(), self.position);
        }

        if let Err(e) = os::release(self.memory, self.total_size) {
            log::debug!("failed to release the pre-remap mapping: {}", e);
        }

        self.memory = new_memory;
        self.total_size = new_total;
        self.committed_size = new_total;
        Ok(())
    }

    /// Ensures at least `target` bytes are committed, growing the
    /// reservation first (via remap) if needed.
    fn extend_commit(&mut self, target: usize) -> Result<()> {
        if target > self.total_size {
            if !self.remap {
                return Err(Error::OsMemory(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "virtual arena reservation exhausted and remap is disabled",
                )));
            }

            log::debug!("virtual arena out of reservation, remapping");
            self.remap_to(policy::extend_policy(self.total_size.max(target)))?;
            if target > self.total_size {
                return Err(Error::OsMemory(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "remap did not grow the reservation enough",
                )));
            }

            // `remap_to` already commits the whole new reservation and
            // records it as `committed_size`; nothing left to do.
            return Ok(());
        }

        let target = os::page_align_up(target).min(self.total_size);
        os::commit(self.memory, target)?;
        self.committed_size = target;
        Ok(())
    }

    fn reduce_commit(&mut self, target: usize) -> Result<()> {
        let target = os::page_align_up(target);
        if target >= self.committed_size {
            return Ok(());
        }

        let base = unsafe { NonNull::new_unchecked(self.memory.as_ptr().add(target)) };
        os::decommit(base, self.committed_size - target)?;
        self.committed_size = target;
        Ok(())
    }

    fn shrink_after_pop(&mut self) {
        while self.position > os::page_size()
            && policy::should_reduce(self.committed_size, self.position)
        {
            let target = policy::reduce_policy(self.committed_size);
            if let Err(e) = self.reduce_commit(target) {
                log::debug!("reduce_commit failed during pop: {}", e);
                break;
            }
        }
    }

    /// Carves `bytes` without zeroing.  Small pushes (or any push when
    /// `remap` is enabled) grow the commit within (or the size of) the
    /// reservation; anything that would still overflow the reservation
    /// with remap disabled spills to an oversize block.
    pub fn push_no_zero(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        self.apply_auto_align();

        if bytes > self.total_size / 2 && !self.remap {
            return self.blocks.push_new(bytes).ok();
        }

        while self.position + bytes > self.committed_size {
            let next_target = policy::extend_policy(self.committed_size.max(os::page_size()));
            if self.extend_commit(next_target).is_err() {
                if self.remap {
                    return None;
                }
                return self.blocks.push_new(bytes).ok();
            }
        }

        let ptr = unsafe { self.memory.as_ptr().add(self.position) };
        self.position += bytes;
        NonNull::new(ptr)
    }

    pub fn push(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        let ptr = self.push_no_zero(bytes)?;
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, bytes) };
        Some(ptr)
    }

    pub fn pop(&mut self, bytes: usize) {
        self.position = self.position.saturating_sub(bytes);
        self.shrink_after_pop();
    }

    pub fn pop_to(&mut self, position: usize) {
        if position < self.position {
            self.position = position;
        }
        self.shrink_after_pop();
    }

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
        self.shrink_after_pop();
        Ok(())
    }

    pub fn pop_large_block(&mut self) -> Result<()> {
        self.blocks.pop_head()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.position = 0;
        if let Err(e) = self.reduce_commit(os::page_size()) {
            log::debug!("reduce_commit failed during clear: {}", e);
        }
        self.blocks.destroy_all()
    }

    pub fn destroy(mut self) -> Result<()> {
        self.destroy_in_place()
    }

    fn destroy_in_place(&mut self) -> Result<()> {
        let blocks_result = self.blocks.destroy_all();
        let release_result = os::release(self.memory, self.total_size);

        self.total_size = 0;
        self.committed_size = 0;
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

    pub(crate) fn set_position(&mut self, position: usize) {
        self.position = position;
    }
}

impl Drop for VirtualArena {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_in_place() {
            log::warn!("VirtualArena leaked resources on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_grows_geometrically_under_repeated_pushes() {
        let mut arena = VirtualArena::init(64 * 1024 * 1024, 8, false).expect("init");
        let start_committed = arena.committed();
        assert_eq!(start_committed, os::page_size());

        for _ in 0..2000 {
            arena.push(1024).expect("push should succeed");
        }

        assert!(arena.committed() > start_committed);
        assert!(arena.committed() <= arena.reservation());
    }

    #[test]
    fn pop_shrinks_commit_once_oversized() {
        let mut arena = VirtualArena::init(64 * 1024 * 1024, 8, false).expect("init");
        for _ in 0..4000 {
            arena.push(1024).expect("push");
        }
        let grown_committed = arena.committed();

        arena.pop(3_800_000);
        assert!(arena.committed() < grown_committed);
    }

    #[test]
    fn remap_grows_the_reservation_when_enabled() {
        let mut arena = VirtualArena::init(64 * 1024, 8, true).expect("init");
        let original_reservation = arena.reservation();

        let p = arena.push(128 * 1024).expect("push larger than initial reservation");
        assert!(arena.reservation() > original_reservation);
        assert_eq!(unsafe { *p.as_ptr() }, 0);
    }

    #[test]
    fn without_remap_oversized_push_spills_to_large_block() {
        let mut arena = VirtualArena::init(64 * 1024, 8, false).expect("init");
        let original_reservation = arena.reservation();

        arena.push(128 * 1024).expect("push should still succeed via oversize chain");
        assert_eq!(arena.reservation(), original_reservation);

        arena.pop_large_block().expect("pop large block");
    }

    #[test]
    fn push_over_half_reservation_goes_oversize_even_with_room_to_spare() {
        // A push bigger than half the reservation is oversize by size alone,
        // regardless of how little of the reservation is actually in use.
        let mut arena = VirtualArena::init(64 * 1024, 8, false).expect("init");
        let original_reservation = arena.reservation();

        arena
            .push_no_zero(40 * 1024)
            .expect("oversize push should still succeed via the large-block chain");
        assert_eq!(arena.position(), 0);
        assert_eq!(arena.reservation(), original_reservation);

        arena.pop_large_block().expect("pop large block");
    }

    #[test]
    fn init_rejects_non_power_of_two_auto_align() {
        assert!(VirtualArena::init(64 * 1024, 3, false).is_err());
    }
}
