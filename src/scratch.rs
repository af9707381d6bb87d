//! A scratch subarena: a temporary region carved from the top of a parent
//! arena, viewed through the same bump-allocation interface.  Destroying it
//! rewinds the parent; merging it folds whatever the scratch allocated back
//! into the parent instead of discarding it.
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

use crate::chain_arena::ChainArena;
use crate::error::{Error, Result};
use crate::large_block::LargeBlockList;
use crate::policy;
use crate::static_arena::StaticArena;
use crate::virtual_arena::VirtualArena;

/// What a scratch subarena needs from whichever arena variant hosts it.
pub trait ScratchParent {
    fn push_no_zero(&mut self, bytes: usize) -> Option<NonNull<u8>>;
    fn position(&self) -> usize;
    fn set_parent_position(&mut self, position: usize);
    fn oversize_chain(&mut self) -> &mut LargeBlockList;
    /// Base of the primary mapping a push currently carves from (the only
    /// block with a live bump pointer: the whole mapping for C4/C5, the
    /// current head block for C6).
    fn primary_base(&self) -> NonNull<u8>;
    /// Usable size of that same primary mapping.
    fn primary_size(&self) -> usize;
}

impl ScratchParent for StaticArena {
    fn push_no_zero(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        StaticArena::push_no_zero(self, bytes)
    }
    fn position(&self) -> usize {
        StaticArena::position(self)
    }
    fn set_parent_position(&mut self, position: usize) {
        self.set_position(position)
    }
    fn oversize_chain(&mut self) -> &mut LargeBlockList {
        self.blocks_mut()
    }
    fn primary_base(&self) -> NonNull<u8> {
        self.memory_base()
    }
    fn primary_size(&self) -> usize {
        self.capacity()
    }
}

impl ScratchParent for VirtualArena {
    fn push_no_zero(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        VirtualArena::push_no_zero(self, bytes)
    }
    fn position(&self) -> usize {
        VirtualArena::position(self)
    }
    fn set_parent_position(&mut self, position: usize) {
        self.set_position(position)
    }
    fn oversize_chain(&mut self) -> &mut LargeBlockList {
        self.blocks_mut()
    }
    fn primary_base(&self) -> NonNull<u8> {
        self.memory_base()
    }
    fn primary_size(&self) -> usize {
        self.reservation()
    }
}

impl ScratchParent for ChainArena {
    fn push_no_zero(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        ChainArena::push_no_zero(self, bytes)
    }
    fn position(&self) -> usize {
        ChainArena::position(self)
    }
    fn set_parent_position(&mut self, position: usize) {
        self.set_position(position)
    }
    fn oversize_chain(&mut self) -> &mut LargeBlockList {
        self.blocks_mut()
    }
    fn primary_base(&self) -> NonNull<u8> {
        self.base_ptr()
    }
    fn primary_size(&self) -> usize {
        self.block_capacity()
    }
}

/// A temporary region carved from a parent arena's top.
pub struct Scratch {
    base: NonNull<u8>,
    offset_in_parent: usize,
    capacity: usize,
    position: usize,
    blocks: LargeBlockList,
    backed_in_parent: bool,
    alignment: usize,
    auto_align: bool,
}

impl Scratch {
    /// Carves `size` bytes from the top of `parent`, without zeroing them.
    #[requires(size > 0, "a scratch region must not be empty")]
    pub fn init<P: ScratchParent>(parent: &mut P, size: usize, auto_align: usize) -> Result<Self> {
        let mem = parent
            .push_no_zero(size)
            .ok_or_else(|| Error::OsMemory(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "parent could not satisfy the scratch allocation",
            )))?;

        // Read the primary mapping's base/size only *after* the push: on a
        // `ChainArena`, a push that exceeds the current block's headroom
        // calls `new_block()` internally, which replaces `base_ptr`/
        // `base_size` as a side effect of this very call. Classifying
        // against a pre-push snapshot would compare `mem` (carved from the
        // new block) against the superseded old block's range.
        let primary_base = parent.primary_base();
        let primary_size = parent.primary_size();

        // Whether `push_no_zero` carved this span from the primary mapping
        // or spilled to an oversize block. Compared by address range rather
        // than by position deltas, since auto-align padding consumed on the
        // primary path shifts the position by more than `size` even though
        // the allocation still landed inside the primary mapping.
        let base_addr = primary_base.as_ptr() as usize;
        let mem_addr = mem.as_ptr() as usize;
        let backed_in_parent =
            mem_addr >= base_addr && mem_addr.saturating_add(size) <= base_addr + primary_size;

        let auto_align_on = auto_align != 0;
        if auto_align_on && !policy::is_valid_alignment(auto_align) {
            return Err(Error::InvalidParams(
                "auto_align must be zero or a power of two at least a word wide",
            ));
        }
        let alignment = if auto_align_on { auto_align } else { policy::WORD_SIZE };

        Ok(Scratch {
            base: mem,
            offset_in_parent: if backed_in_parent { mem_addr - base_addr } else { 0 },
            capacity: size,
            position: 0,
            blocks: LargeBlockList::new(),
            backed_in_parent,
            alignment,
            auto_align: auto_align_on,
        })
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn apply_auto_align(&mut self) {
        if self.auto_align {
            self.position = policy::align_up(self.position, self.alignment);
        }
    }

    /// Carves `bytes` from the scratch region itself, without zeroing.
    /// Overflow (past `capacity`) spills to the scratch's own oversize
    /// chain, independent of the parent's.
    pub fn push_no_zero(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        self.apply_auto_align();

        if self.position + bytes <= self.capacity {
            let ptr = unsafe { self.base.as_ptr().add(self.position) };
            self.position += bytes;
            return NonNull::new(ptr);
        }

        self.blocks.push_new(bytes).ok()
    }

    pub fn push(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        let ptr = self.push_no_zero(bytes)?;
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, bytes) };
        Some(ptr)
    }

    pub fn pop(&mut self, bytes: usize) {
        self.position = self.position.saturating_sub(bytes);
    }

    /// Rewinds `parent` by this scratch's capacity and tears down the
    /// scratch's own oversize chain. Requires the scratch still be the
    /// most recent thing carved from `parent`.
    pub fn destroy<P: ScratchParent>(mut self, parent: &mut P) -> Result<()> {
        if self.backed_in_parent {
            if self.offset_in_parent + self.capacity != parent.position() {
                return Err(Error::InvalidParams(
                    "scratch must be destroyed in LIFO order: it is not at the top of its parent",
                ));
            }
            parent.set_parent_position(self.offset_in_parent);
        } else {
            parent.oversize_chain().delete_by_payload(self.base)?;
        }

        self.blocks.destroy_all()
    }

    /// Commits the scratch's contents into `parent` instead of discarding
    /// them: `parent`'s position advances to cover what the scratch wrote,
    /// and the scratch's oversize chain is folded into the parent's, ahead
    /// of whatever the parent already had.
    pub fn merge<P: ScratchParent>(mut self, parent: &mut P) -> Result<()> {
        if !self.backed_in_parent {
            return Err(Error::InvalidParams(
                "an oversize-backed scratch cannot be merged into its parent",
            ));
        }

        let top_bound = self.offset_in_parent + self.position;
        let alt_bound = parent
            .position()
            .saturating_sub(self.capacity - self.position);
        parent.set_parent_position(top_bound.max(alt_bound));

        let scratch_blocks = std::mem::take(&mut self.blocks);
        let parent_blocks = std::mem::take(parent.oversize_chain());
        let mut merged = scratch_blocks;
        merged.merge(parent_blocks)?;
        *parent.oversize_chain() = merged;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_rewinds_the_parent() {
        let mut parent = StaticArena::init(1024 * 1024, 16).expect("init parent");
        parent.push_no_zero(100).expect("push");
        let position_before_scratch = parent.position();

        let mut scratch = Scratch::init(&mut parent, 4096, 16).expect("init scratch");
        scratch.push_no_zero(50).expect("push into scratch");

        scratch.destroy(&mut parent).expect("destroy scratch");
        assert_eq!(parent.position(), position_before_scratch);
    }

    #[test]
    fn merge_advances_the_parent_by_what_the_scratch_used() {
        let mut parent = StaticArena::init(1024 * 1024, 16).expect("init parent");
        parent.push_no_zero(100).expect("push");
        let position_before_scratch = parent.position();

        let mut scratch = Scratch::init(&mut parent, 4096, 16).expect("init scratch");
        scratch.push_no_zero(50).expect("push into scratch");

        scratch.merge(&mut parent).expect("merge scratch");
        assert_eq!(parent.position(), position_before_scratch + 50);
    }

    #[test]
    fn destroy_out_of_lifo_order_is_rejected() {
        let mut parent = StaticArena::init(1024 * 1024, 16).expect("init parent");

        let scratch = Scratch::init(&mut parent, 4096, 16).expect("init scratch");
        // Sneak in an allocation directly on the parent before destroying
        // the scratch: this breaks the "scratch is at the top" invariant.
        parent.push_no_zero(8).expect("push");

        assert!(scratch.destroy(&mut parent).is_err());
    }

    #[test]
    fn scratch_on_chain_arena_uses_current_block() {
        let mut parent = ChainArena::init(1024 * 1024, 16, true).expect("init parent");
        let mut scratch = Scratch::init(&mut parent, 4096, 16).expect("init scratch");
        scratch.push_no_zero(50).expect("push into scratch");
        scratch.destroy(&mut parent).expect("destroy scratch");
    }

    #[test]
    fn scratch_init_that_exhausts_the_current_block_is_backed_by_the_new_one() {
        // Leave only 1 KiB of headroom in the current block, then ask
        // `Scratch::init` for a span that needs more than that but is
        // still well under `base_block / 2` (so it stays on the in-block
        // path rather than spilling to the oversize chain). The
        // `push_no_zero` call *inside* `Scratch::init` has to trigger
        // `new_block` before `init` reads back the primary mapping's
        // base/size — if it read them beforehand it would classify the
        // scratch against the now-superseded old block.
        let mut parent = ChainArena::init(1024 * 1024, 16, true).expect("init parent");
        let capacity = parent.block_capacity();
        parent
            .push_no_zero(capacity - 1024)
            .expect("fill most of the first block");
        let first_block_base = parent.base_ptr();

        let scratch = Scratch::init(&mut parent, 200 * 1024, 16).expect("init scratch");

        assert_ne!(
            parent.base_ptr(),
            first_block_base,
            "init's own push should have rolled the parent onto a new block"
        );
        assert!(
            scratch.backed_in_parent,
            "the scratch landed in the new block, not the oversize chain"
        );

        scratch
            .destroy(&mut parent)
            .expect("destroy should rewind the new block, not fail as oversize");
    }

    #[test]
    fn destroy_accounts_for_auto_align_padding_before_the_scratch() {
        // Push an odd number of bytes so the parent's auto-align (64) has
        // to round the position up before the scratch is carved: the
        // scratch's offset into the parent is not simply "position before
        // the call" in that case.
        let mut parent = StaticArena::init(1024 * 1024, 64).expect("init parent");
        parent.push_no_zero(3).expect("push an odd amount");

        let mut scratch = Scratch::init(&mut parent, 4096, 0).expect("init scratch");
        scratch.push_no_zero(10).expect("push into scratch");

        let position_at_top = parent.position();
        scratch.destroy(&mut parent).expect("destroy scratch");
        assert_eq!(parent.position(), position_at_top - 4096);
    }

    #[test]
    fn oversize_backed_scratch_cannot_be_merged_but_can_be_destroyed() {
        let mut parent = StaticArena::init(4096, 0).expect("init parent");
        parent.push_no_zero(4000).expect("fill most of the parent");

        // Too big to fit in the remaining capacity: spills to an oversize
        // block, so the scratch is not backed in the parent's primary
        // mapping.
        let mut scratch = Scratch::init(&mut parent, 8192, 0).expect("init scratch");
        scratch.push_no_zero(50).expect("push into scratch");

        assert!(scratch.merge(&mut parent).is_err());

        let mut scratch = Scratch::init(&mut parent, 8192, 0).expect("init scratch");
        scratch.push_no_zero(50).expect("push into scratch");
        scratch.destroy(&mut parent).expect("destroy the oversize-backed scratch");
    }
}
