//! # Object cache: ctor/dtor-backed allocation of `Pmap` objects
//!
//! Higher kernel layers (process/thread creation) need to hand out `Pmap`
//! objects without each call site re-deriving the "allocate a root frame,
//! zero it, set refcount to one" dance, and without forgetting to return
//! the root frame to the PFA on the last `destroy`. [`PmapCache`] is that
//! thin ctor/dtor wrapper: `alloc` is `Pmap::create`, `free` is
//! `Pmap::destroy` followed by handing the freed root frame back to the
//! allocator if it was the last reference.
//!
//! This only becomes usable once the PFA is ready — [`Pmap::create`] itself
//! enforces that with a hard panic, so this cache is not a way around that
//! ordering constraint, just a convenience on top of it.

use kernel_vmem::PhysFrameAlloc;
use kernel_vmem::pmap::{Pmap, PmapCreateError};

/// Errors from [`PmapCache::alloc`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectCacheError {
    /// The backing allocator could not supply the new object's root frame.
    #[error(transparent)]
    OutOfMemory(#[from] PmapCreateError),
}

/// Ctor/dtor pair for `Pmap` objects, parameterized over the physical
/// mapper every `Pmap` produced by this cache shares.
pub struct PmapCache<'m, M: kernel_vmem::PhysMapper> {
    mapper: &'m M,
}

impl<'m, M: kernel_vmem::PhysMapper> PmapCache<'m, M> {
    /// Build a cache that hands out `Pmap` objects backed by `mapper`.
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self { mapper }
    }

    /// Construct a fresh, empty `Pmap`.
    ///
    /// # Errors
    /// Propagates [`PmapCreateError::OutOfMemory`] if `alloc` cannot supply
    /// the root table frame.
    ///
    /// # Panics
    /// Panics if called before the physical frame allocator is ready; see
    /// [`Pmap::create`].
    pub fn alloc<A: PhysFrameAlloc>(&self, alloc: &mut A) -> Result<Pmap<'m, M>, ObjectCacheError> {
        Ok(Pmap::create(self.mapper, alloc, true)?)
    }

    /// Release a reference to `pmap`, returning its root frame to `alloc`
    /// once the last reference is gone.
    ///
    /// # Panics
    /// Propagates [`Pmap::destroy`]'s panics: a refcount underflow, or a
    /// final release while leaf mappings are still installed.
    pub fn free<A: PhysFrameAlloc>(&self, pmap: &Pmap<'m, M>, alloc: &mut A) {
        if let Some(root) = pmap.destroy() {
            alloc.free_4k(root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::addresses::{PhysicalAddress, PhysicalPage, Size4K};
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

    impl kernel_vmem::PhysMapper for TestMapper {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let ptr = *self.0.frames.borrow().get(&pa.as_u64()).expect("unmapped frame");
            unsafe { &mut *ptr.cast::<T>() }
        }
    }

    struct TestFrameAlloc {
        arena: Rc<FrameArena>,
        outstanding: usize,
    }

    impl PhysFrameAlloc for TestFrameAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
            self.outstanding += 1;
            Some(self.arena.alloc())
        }

        fn free_4k(&mut self, _frame: PhysicalPage<Size4K>) {
            self.outstanding -= 1;
        }
    }

    #[test]
    fn alloc_then_free_returns_root_frame_to_allocator() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut alloc = TestFrameAlloc { arena, outstanding: 0 };
        let cache = PmapCache::new(&mapper);

        let pmap = cache.alloc(&mut alloc).unwrap();
        assert_eq!(alloc.outstanding, 1);
        cache.free(&pmap, &mut alloc);
        assert_eq!(alloc.outstanding, 0);
    }

    #[test]
    fn shared_reference_keeps_object_alive_until_last_free() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut alloc = TestFrameAlloc { arena, outstanding: 0 };
        let cache = PmapCache::new(&mapper);

        let pmap = cache.alloc(&mut alloc).unwrap();
        pmap.reference();
        cache.free(&pmap, &mut alloc);
        assert_eq!(alloc.outstanding, 1, "first free must not return the frame yet");
        cache.free(&pmap, &mut alloc);
        assert_eq!(alloc.outstanding, 0);
    }
}
