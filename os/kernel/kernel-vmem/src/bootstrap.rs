//! # Bootstrap identity mapper
//!
//! The one-shot relocation that runs before the real page-frame allocator
//! (PFA) exists: it builds a brand-new top-level table and identity-maps
//! physical low memory into the kernel window, using only a reserve
//! allocator (see `kernel-alloc`'s bump allocator) for intermediate
//! page-table frames.
//!
//! This deliberately stays at the [`AddressSpace`] layer rather than
//! [`Pmap`](crate::pmap::Pmap): `Pmap::create` asserts the PFA is ready,
//! which is exactly the precondition that does not hold yet when this runs.
//! Once the PFA and object cache are up, higher layers adopt this table as
//! the kernel's permanent upper-half mapping; this module's job ends at
//! producing it.
//!
//! Every intermediate PUD/PMD/PT frame is installed one 4 KiB page at a
//! time through [`AddressSpace::map_one`], so the existing walk/alloc/unwind
//! logic is exercised exactly as it would be for any other caller — no
//! separate bulk table-splicing path to keep in sync with it.

use crate::addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use crate::address_space::MapSize;
use crate::page_table::pml4::PageMapLevel4;
use crate::pmap::{PFlags, table_flags};
use crate::{AddressSpace, PhysFrameAlloc, PhysMapper};
use kernel_info::memory::MemoryLimits;
use log::trace;

/// Errors from [`bootstrap_identity_map`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    /// The reserve allocator ran out of low memory while building the root
    /// table or one of its intermediate levels.
    #[error("reserve allocator exhausted while building the bootstrap identity map")]
    OutOfMemory,
}

/// Build a fresh top-level table and identity-map `[limits.lowmem_start,
/// limits.lowmem_top)` into the kernel window at `window_base + pa`, using
/// 4 KiB leaves throughout.
///
/// `window_base` is normally [`kernel_info::memory::HHDM_BASE`]; it is a
/// parameter so tests can use a small synthetic offset instead.
///
/// Returns the new [`AddressSpace`], not yet activated — the caller decides
/// when (and whether) to load it into CR3 via [`AddressSpace::activate`].
///
/// # Errors
/// Propagates [`BootstrapError::OutOfMemory`] the moment the reserve
/// allocator can no longer supply a frame, whether for the root table or
/// any intermediate level.
pub fn bootstrap_identity_map<'m, M: PhysMapper, A: PhysFrameAlloc>(
    mapper: &'m M,
    reserve: &mut A,
    limits: MemoryLimits,
    window_base: u64,
) -> Result<AddressSpace<'m, M>, BootstrapError> {
    let root = reserve.alloc_4k().ok_or(BootstrapError::OutOfMemory)?;
    unsafe {
        let table: &mut PageMapLevel4 = mapper.phys_to_mut(root.base());
        *table = PageMapLevel4::zeroed();
    }
    let aspace = AddressSpace::from_root(mapper, root);

    let nframes = limits.lowmem_bytes_avail() / Size4K::SIZE;
    trace!(
        "pmap bootstrap: identity-mapping {} frames from {:#x} into window {:#x}",
        nframes, limits.lowmem_start, window_base
    );

    let leaf_flags = PFlags::RW.to_leaf_bits();
    for i in 0..nframes {
        let offset = i * Size4K::SIZE;
        let pa = PhysicalAddress::new(limits.lowmem_start + offset);
        let va = VirtualAddress::new(window_base + limits.lowmem_start + offset);
        aspace
            .map_one::<A, Size4K>(reserve, va, pa, table_flags(), leaf_flags)
            .map_err(|_| BootstrapError::OutOfMemory)?;
    }

    trace!("pmap bootstrap: identity map complete, root at {root:?}");
    Ok(aspace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    struct FrameArena {
        frames: RefCell<HashMap<u64, *mut u8>>,
        next: RefCell<u64>,
    }

    impl FrameArena {
        fn new() -> Rc<Self> {
            Rc::new(Self { frames: RefCell::new(HashMap::new()), next: RefCell::new(0x1000) })
        }

        fn alloc(&self) -> PhysicalPage<Size4K> {
            let layout = Layout::from_size_align(4096, 4096).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            let mut next = self.next.borrow_mut();
            let pa = *next;
            *next += 4096;
            self.frames.borrow_mut().insert(pa, ptr);
            PhysicalPage::from_addr(PhysicalAddress::new(pa))
        }

        fn ptr_for(&self, pa: PhysicalAddress) -> *mut u8 {
            *self.frames.borrow().get(&pa.as_u64()).expect("access to frame never allocated")
        }
    }

    impl Drop for FrameArena {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(4096, 4096).unwrap();
            for ptr in self.frames.borrow().values() {
                unsafe { dealloc(*ptr, layout) };
            }
        }
    }

    struct TestMapper(Rc<FrameArena>);

    impl PhysMapper for TestMapper {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            unsafe { &mut *self.0.ptr_for(pa).cast::<T>() }
        }
    }

    struct CountingReserve {
        arena: Rc<FrameArena>,
        allocations: usize,
        fail_after: Option<usize>,
    }

    impl CountingReserve {
        fn new(arena: Rc<FrameArena>) -> Self {
            Self { arena, allocations: 0, fail_after: None }
        }
    }

    impl PhysFrameAlloc for CountingReserve {
        fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
            if let Some(n) = self.fail_after {
                if self.allocations >= n {
                    return None;
                }
            }
            self.allocations += 1;
            Some(self.arena.alloc())
        }

        fn free_4k(&mut self, _frame: PhysicalPage<Size4K>) {
            // Reserve allocator keeps no accounting; frees are no-ops.
        }
    }

    #[test]
    fn sixty_four_mib_allocates_exactly_expected_tables() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut reserve = CountingReserve::new(arena);

        let limits = MemoryLimits::new(0, 64 * 1024 * 1024);
        let aspace = bootstrap_identity_map(&mapper, &mut reserve, limits, 0x1_0000_0000).unwrap();

        // 1 root PML4 + 1 PUD + 1 PMD + 32 PTs (64 MiB / 2 MiB) = 35 frames.
        assert_eq!(reserve.allocations, 1 + 1 + 1 + 32);

        let first = VirtualAddress::new(0x1_0000_0000);
        let last = VirtualAddress::new(0x1_0000_0000 + 64 * 1024 * 1024 - 4096);
        assert_eq!(aspace.query(first), Some(PhysicalAddress::new(0)));
        assert_eq!(aspace.query(last), Some(PhysicalAddress::new(64 * 1024 * 1024 - 4096)));
    }

    #[test]
    fn exhaustion_surfaces_as_out_of_memory() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut reserve = CountingReserve::new(arena);
        reserve.fail_after = Some(2);

        let limits = MemoryLimits::new(0, 64 * 1024 * 1024);
        let err = bootstrap_identity_map(&mapper, &mut reserve, limits, 0x1_0000_0000).unwrap_err();
        assert_eq!(err, BootstrapError::OutOfMemory);
    }
}
