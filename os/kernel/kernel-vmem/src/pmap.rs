//! # PMAP: reference-counted, copy-capable address-space objects
//!
//! Built on top of [`AddressSpace`], a [`Pmap`] adds the bookkeeping a kernel
//! needs to hand address spaces to higher layers: reference counting so
//! multiple threads/tasks can share one, a [`SpinLock`]-protected table walk
//! so concurrent callers don't race on the same tree, ergonomic flag sets
//! ([`MFlags`] for allocation policy, [`PFlags`] for page protection), and a
//! `copy` operation that deep-duplicates another pmap's tree (fork-style).
//!
//! Unlike [`AddressSpace`], which exposes 1 GiB/2 MiB/4 KiB mapping via
//! [`MapSize`](crate::address_space::MapSize), the operations here
//! ([`Pmap::map`], [`Pmap::map_range`], [`Pmap::copy`]) only deal in 4 KiB
//! pages. Huge pages stay a lower-level [`AddressSpace`] concern; nothing in
//! the call sites this object serves (process/thread creation, `mmap`-style
//! single-page installs) needs them.
//!
//! ## Concurrency
//!
//! A [`Pmap`] wraps its own table walk in a [`SpinLock`]; this crate targets
//! a single core today; the lock exists so the design survives the jump to
//! SMP without a rewrite of call sites. TLB invalidation after a mutation is
//! the caller's responsibility — see [`tlb_flush`].
//!
//! ## Error taxonomy
//!
//! Every fallible operation returns a dedicated `thiserror` enum rather than
//! a bare `bool`/sentinel, matching the convention set by
//! [`AddressSpaceMapOneError`](crate::address_space::AddressSpaceMapOneError)
//! and friends.

use crate::addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use crate::page_table::pd::{L2Index, PageDirectory, PdEntry, PdEntryKind};
use crate::page_table::pdpt::{L3Index, PageDirectoryPointerTable, PdptEntry, PdptEntryKind};
use crate::page_table::pml4::{L4Index, PageMapLevel4, Pml4Entry};
use crate::page_table::pt::{L1Index, PageTable, PtEntry4k};
use crate::page_table::split_indices;
use crate::{AddressSpace, PhysFrameAlloc, PhysMapper, VirtualMemoryPageBits};
use bitflags::bitflags;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_sync::SpinLock;
use log::{trace, warn};

/// Upper bound on reentrant nesting of [`Pmap::map`].
///
/// The bootstrap path may need to map the frame it is about to hand to its
/// own allocator before that allocation has returned (see the bootstrap
/// driver), so a small amount of reentrancy is expected. Anything past this
/// depth means the allocator is looping rather than making progress, and we'd
/// rather panic than run the table walk off into the weeds.
pub const PMM_MAX_DEPTH: usize = 8;

static MAP_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// RAII nesting guard for [`Pmap::map`].
struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        let depth = MAP_DEPTH.fetch_add(1, Ordering::AcqRel) + 1;
        assert!(
            depth <= PMM_MAX_DEPTH,
            "pmap: map() recursion depth exceeded {PMM_MAX_DEPTH} levels (reentrant allocator loop?)"
        );
        Self
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        MAP_DEPTH.fetch_sub(1, Ordering::AcqRel);
    }
}

bitflags! {
    /// Allocation-policy hints for [`Pmap::map`] / [`Pmap::map_range`].
    ///
    /// These never affect the installed page-table entry; they only steer how
    /// the backing frame is obtained and initialized before it is mapped.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MFlags: u32 {
        /// Caller may block while memory is reclaimed.
        const WAIT = 1 << 0;
        /// Prefer frames outside the kernel's low-memory identity range.
        const HIGH = 1 << 1;
        /// Frame must be addressable by legacy (< 4 GiB / ISA) DMA.
        const DMA = 1 << 2;
        /// Zero the destination frame's contents before publishing the mapping.
        const ZERO = 1 << 3;
    }
}

impl MFlags {
    /// General-purpose user mapping: may block, no special placement, zeroed.
    pub const USER: Self = Self::WAIT.union(Self::HIGH).union(Self::ZERO);
    /// Kernel-internal mapping: may block, zeroed, no placement constraint.
    pub const KERNEL: Self = Self::WAIT.union(Self::ZERO);
    /// Atomic context: must not block, no zeroing (caller installs content).
    pub const ATOMIC: Self = Self::empty();
    /// Device/DMA buffer: must not block, legacy-addressable, zeroed.
    pub const BUFFER: Self = Self::DMA.union(Self::ZERO);
}

bitflags! {
    /// Requested page protection for [`Pmap::map`] / [`Pmap::setprot`].
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PFlags: u32 {
        /// Loads permitted.
        const READ = 1 << 0;
        /// Stores permitted.
        const WRITE = 1 << 1;
        /// Instruction fetch permitted.
        const EXEC = 1 << 2;
        /// Accessible from user mode (CPL3).
        const USER = 1 << 3;
        /// TLB entry survives a CR3 reload.
        const GLOBAL = 1 << 4;
        /// Caching disabled for this mapping.
        const NOCACHE = 1 << 5;
    }
}

impl PFlags {
    /// Common read-write kernel mapping.
    pub const RW: Self = Self::READ.union(Self::WRITE);
    /// Read-only mapping.
    pub const R: Self = Self::READ;
    /// Read-write-execute (used sparingly; most mappings should be NX).
    pub const RWX: Self = Self::READ.union(Self::WRITE).union(Self::EXEC);

    /// A request is malformed if it grants no access at all, or grants write
    /// without read (x86-64 has no write-only page protection).
    #[inline]
    #[must_use]
    pub const fn bad(self) -> bool {
        self.is_empty() || (self.contains(Self::WRITE) && !self.contains(Self::READ))
    }

    /// Translate to the leaf bits installed at the PT level.
    pub(crate) fn to_leaf_bits(self) -> VirtualMemoryPageBits {
        VirtualMemoryPageBits {
            present: true,
            writable: self.contains(Self::WRITE),
            user: self.contains(Self::USER),
            no_execute: !self.contains(Self::EXEC),
            global: self.contains(Self::GLOBAL),
            cache_disable: self.contains(Self::NOCACHE),
            ..VirtualMemoryPageBits::default()
        }
    }
}

/// Non-leaf flags used for every intermediate table `Pmap` installs.
///
/// Always present + writable; permission narrowing happens at the leaf.
pub(crate) fn table_flags() -> VirtualMemoryPageBits {
    VirtualMemoryPageBits {
        present: true,
        writable: true,
        ..VirtualMemoryPageBits::default()
    }
}

/// Marker bit (OS-available, low) distinguishing a [`Pmap::copy`]-installed
/// placeholder from an ordinary unmapped (all-zero) PTE.
const PROTNONE_MARKER: u8 = 0b001;

/// A non-present PTE standing in for a source mapping that was absent when
/// [`Pmap::copy`] ran, so the destination's PT shape mirrors the source's
/// even where nothing is actually mapped.
const fn protnone_entry() -> PtEntry4k {
    PtEntry4k::new().with_os_available_low(PROTNONE_MARKER)
}

/// Tests whether `e` is a [`protnone_entry`] placeholder rather than a
/// genuinely empty PTE.
#[must_use]
pub const fn is_protnone(e: PtEntry4k) -> bool {
    !e.present() && (e.os_available_low() & PROTNONE_MARKER) != 0
}

/// Errors from [`Pmap::create`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmapCreateError {
    #[error("out of memory while allocating a new top-level table")]
    OutOfMemory,
}

/// Errors from [`Pmap::map`] / [`Pmap::map_range`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmapMapError {
    #[error("out of memory while allocating an intermediate page-table frame")]
    OutOfMemory,
}

/// Errors from [`Pmap::setprot`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmapSetProtError {
    #[error("sva/eva is not 4 KiB aligned, or eva <= sva")]
    Unaligned,
    #[error("malformed protection flags")]
    BadFlags,
}

/// Errors from [`Pmap::copy`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmapCopyError {
    #[error("out of memory while duplicating the page-table tree")]
    OutOfMemory,
}

/// A reference-counted, lockable, copy-capable address space.
///
/// `Pmap` is the object higher kernel layers actually hold: process control
/// blocks reference one, `fork`-like operations [`copy`](Self::copy) one into
/// a fresh sibling, and the last dropper frees its root table back to the
/// allocator via [`destroy`](Self::destroy).
pub struct Pmap<'m, M: PhysMapper> {
    aspace: AddressSpace<'m, M>,
    mapper: &'m M,
    refct: AtomicUsize,
    lock: SpinLock<()>,
}

impl<'m, M: PhysMapper> Pmap<'m, M> {
    /// Create a new pmap with a freshly allocated, entirely empty top-level
    /// table (no kernel-half entries are cloned in).
    ///
    /// Unlike [`AddressSpace::new`], this never reads the currently-active
    /// CR3 — callers that want the new space to share the kernel's upper
    /// half do so explicitly afterwards (e.g. via their own PML4 splice),
    /// keeping `create` usable before (or entirely without) an active
    /// hardware address space.
    ///
    /// # Errors
    /// Fails if the allocator cannot supply the root-table frame.
    ///
    /// # Panics
    /// Panics if called before the physical frame allocator is ready
    /// (`pfa_ready` is `false`); this mirrors the bootstrap ordering
    /// constraint of the allocator this pmap is built from.
    pub fn create<A: PhysFrameAlloc>(
        mapper: &'m M,
        alloc: &mut A,
        pfa_ready: bool,
    ) -> Result<Self, PmapCreateError> {
        assert!(
            pfa_ready,
            "pmap: create() called before the physical frame allocator is ready"
        );
        let root = alloc.alloc_4k().ok_or(PmapCreateError::OutOfMemory)?;
        unsafe {
            let table: &mut PageMapLevel4 = mapper.phys_to_mut(root.base());
            *table = PageMapLevel4::zeroed();
        }
        trace!("pmap: created new address space rooted at {root:?}");
        Ok(Self {
            aspace: AddressSpace::from_root(mapper, root),
            mapper,
            refct: AtomicUsize::new(1),
            lock: SpinLock::new(()),
        })
    }

    /// Bump the reference count. Pair with [`destroy`](Self::destroy).
    pub fn reference(&self) {
        self.refct.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference. Returns the root table frame once the last
    /// reference is released, so the caller's object cache can return it to
    /// the physical frame allocator.
    ///
    /// # Panics
    /// - If called on a pmap whose reference count is already zero.
    /// - If, on the final reference, the pmap still holds leaf mappings —
    ///   callers must [`unmap`](Self::unmap) everything first.
    pub fn destroy(&self) -> Option<PhysicalPage<Size4K>> {
        let prev = self.refct.fetch_sub(1, Ordering::AcqRel);
        assert!(prev >= 1, "pmap: destroy() on an object with refct already at 0");
        if prev != 1 {
            return None;
        }
        assert!(
            !self.has_any_mapping(),
            "pmap: destroy() on a pmap that still holds leaf mappings"
        );
        trace!("pmap: destroyed address space rooted at {:?}", self.aspace.root_page());
        Some(self.aspace.root_page())
    }

    /// Load this pmap's root table into CR3.
    ///
    /// No-op if the root table address is zero (defensive; a constructed
    /// `Pmap` never actually has a null root, but activation is cheap to
    /// guard and the cost of skipping it on a corrupted object is low).
    ///
    /// # Safety
    /// Caller must ensure the CPU's paging state and currently mapped
    /// code/stack are consistent with the target space.
    pub unsafe fn activate(&self) {
        if self.aspace.root_page().base().as_u64() == 0 {
            warn!("pmap: activate() called with a null top table; ignoring");
            return;
        }
        unsafe {
            self.aspace.activate();
        }
    }

    /// Translate `va` to its mapped physical address, if any.
    #[must_use]
    pub fn getmap(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.aspace.query(va)
    }

    /// Map a single 4 KiB page `va -> pa` with the given allocation policy
    /// and protection.
    ///
    /// On allocator exhaustion, every intermediate table frame this call
    /// allocated is freed and unlinked before returning — a full unwind, not
    /// just a partial chain left dangling.
    ///
    /// # Errors
    /// Returns [`PmapMapError::OutOfMemory`] if `alloc` is exhausted at any
    /// depth of the walk.
    pub fn map<A: PhysFrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        mflags: MFlags,
        pflags: PFlags,
    ) -> Result<(), PmapMapError> {
        let _depth = DepthGuard::enter();
        self.lock.with_lock(|_| self.map_locked(alloc, va, pa, mflags, pflags))
    }

    fn map_locked<A: PhysFrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        mflags: MFlags,
        pflags: PFlags,
    ) -> Result<(), PmapMapError> {
        let (i4, i3, i2, i1) = split_indices(va);
        let pml4 = self.aspace.pml4_mut();

        let mut new_pdpt = None;
        let pdpt_page = match pml4.get(i4).next_table() {
            Some(p) => p,
            None => {
                let f = alloc.alloc_4k().ok_or(PmapMapError::OutOfMemory)?;
                self.aspace.zero_pdpt(f);
                pml4.set(i4, Pml4Entry::present_with(table_flags(), f));
                new_pdpt = Some(f);
                f
            }
        };

        let pdpt = self.aspace.pdpt_mut(pdpt_page);
        let mut new_pd = None;
        let pd_page = match pdpt.get(i3).kind() {
            Some(PdptEntryKind::NextPageDirectory(p, _)) => p,
            Some(PdptEntryKind::Leaf1GiB(_, _)) | None => match alloc.alloc_4k() {
                Some(f) => {
                    self.aspace.zero_pd(f);
                    pdpt.set(i3, PdptEntry::make_next(f, table_flags().to_pdpte()));
                    new_pd = Some(f);
                    f
                }
                None => {
                    if let Some(f) = new_pdpt {
                        pml4.set(i4, Pml4Entry::zero());
                        alloc.free_4k(f);
                    }
                    return Err(PmapMapError::OutOfMemory);
                }
            },
        };

        let pd = self.aspace.pd_mut(pd_page);
        let pt_page = match pd.get(i2).kind() {
            Some(PdEntryKind::NextPageTable(p, _)) => p,
            Some(PdEntryKind::Leaf2MiB(_, _)) | None => match alloc.alloc_4k() {
                Some(f) => {
                    self.aspace.zero_pt(f);
                    pd.set(i2, PdEntry::present_next_with(table_flags(), f));
                    f
                }
                None => {
                    if let Some(f) = new_pd {
                        pdpt.set_zero(i3);
                        alloc.free_4k(f);
                    }
                    if let Some(f) = new_pdpt {
                        pml4.set(i4, Pml4Entry::zero());
                        alloc.free_4k(f);
                    }
                    return Err(PmapMapError::OutOfMemory);
                }
            },
        };

        let pt = self.aspace.pt_mut(pt_page);
        pt.set(i1, PtEntry4k::present_with(pflags.to_leaf_bits(), PhysicalPage::from_addr(pa)));

        if mflags.contains(MFlags::ZERO) {
            let bytes: &mut [u8] =
                unsafe { core::slice::from_raw_parts_mut(self.mapper.phys_to_mut(pa), Size4K::SIZE as usize) };
            bytes.fill(0);
        }

        trace!("pmap: mapped VA={va} -> PA={pa}");
        Ok(())
    }

    /// Convenience wrapper mapping `nframes` consecutive 4 KiB pages starting
    /// at `va -> pa`. Stops and propagates the first error; pages already
    /// installed by earlier iterations are left mapped (each call to
    /// [`map`](Self::map) fully unwinds its own partial work, but this loop
    /// does not unwind prior *completed* iterations — matching `map`'s
    /// per-call, not per-range, unwind contract).
    ///
    /// # Errors
    /// Propagates [`PmapMapError`] from the first page that fails to map.
    pub fn map_range<A: PhysFrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        nframes: u64,
        mflags: MFlags,
        pflags: PFlags,
    ) -> Result<(), PmapMapError> {
        for i in 0..nframes {
            let offset = i * Size4K::SIZE;
            let v = VirtualAddress::new(va.as_u64() + offset);
            let p = PhysicalAddress::new(pa.as_u64() + offset);
            self.map(alloc, v, p, mflags, pflags)?;
        }
        Ok(())
    }

    /// Unmap a single 4 KiB page. Idempotent: unmapping an already-absent
    /// page is not an error.
    pub fn unmap(&self, va: VirtualAddress) {
        self.lock.with_lock(|_| {
            let _ = self.aspace.unmap_one(va);
        });
    }

    /// Change the protection of every 4 KiB page in `[sva, eva)`.
    ///
    /// Pages with no existing mapping in the range are silently skipped
    /// (there is nothing to reprotect). Ranges that pass through a 1 GiB/2
    /// MiB leaf are likewise skipped; huge-page protection changes are out
    /// of scope for this engine (see module docs).
    ///
    /// With the `legacy-silent-validation` feature, malformed input is
    /// logged and silently ignored instead of rejected, matching historical
    /// callers that never checked the return value.
    ///
    /// # Errors
    /// Returns [`PmapSetProtError::Unaligned`] if `sva`/`eva` are not 4 KiB
    /// aligned or `eva <= sva`, and [`PmapSetProtError::BadFlags`] if
    /// `pflags` is malformed (see [`PFlags::bad`]).
    pub fn setprot(
        &self,
        sva: VirtualAddress,
        eva: VirtualAddress,
        pflags: PFlags,
    ) -> Result<(), PmapSetProtError> {
        let aligned = sva.as_u64() % Size4K::SIZE == 0 && eva.as_u64() % Size4K::SIZE == 0 && eva > sva;
        if !aligned {
            warn!("pmap: setprot called with misaligned range {sva}..{eva}");
            if cfg!(feature = "legacy-silent-validation") {
                return Ok(());
            }
            return Err(PmapSetProtError::Unaligned);
        }
        if pflags.bad() {
            warn!("pmap: setprot called with malformed pflags {pflags:?}");
            if cfg!(feature = "legacy-silent-validation") {
                return Ok(());
            }
            return Err(PmapSetProtError::BadFlags);
        }

        self.lock.with_lock(|_| {
            let mut va = sva;
            while va < eva {
                self.rewrite_leaf(va, pflags);
                va = VirtualAddress::new(va.as_u64() + Size4K::SIZE);
            }
        });
        Ok(())
    }

    /// Rewrite the leaf at `va` in place, preserving the mapped frame.
    /// No-op if `va` has no 4 KiB leaf mapping.
    fn rewrite_leaf(&self, va: VirtualAddress, pflags: PFlags) {
        let (i4, i3, i2, i1) = split_indices(va);
        let pml4 = self.aspace.pml4_mut();
        let Some(pdpt_page) = pml4.get(i4).next_table() else {
            return;
        };
        let pdpt = self.aspace.pdpt_mut(pdpt_page);
        let Some(PdptEntryKind::NextPageDirectory(pd_page, _)) = pdpt.get(i3).kind() else {
            return;
        };
        let pd = self.aspace.pd_mut(pd_page);
        let Some(PdEntryKind::NextPageTable(pt_page, _)) = pd.get(i2).kind() else {
            return;
        };
        let pt = self.aspace.pt_mut(pt_page);
        let Some((page, _old)) = pt.get(i1).page_4k() else {
            return;
        };
        pt.set(i1, PtEntry4k::present_with(pflags.to_leaf_bits(), page));
    }

    /// Deep-duplicate `src`'s entire tree into `self`.
    ///
    /// Every present leaf in `src` (at any of the three levels) is copied
    /// verbatim into `self` — the underlying physical frame is shared, not
    /// copied, between the two pmaps. Every absent 4 KiB leaf in a PT that
    /// `self` ends up materializing is filled with a [`protnone_entry`]
    /// placeholder so later lookups can distinguish "never touched" from
    /// "explicitly not mapped" at copy time (see [`is_protnone`]).
    ///
    /// On allocator exhaustion partway through, every table `self` newly
    /// allocated **for the call frame where the failure occurred** is freed
    /// before that frame returns its error. Tables already linked by
    /// shallower (already-returned-Ok) call frames are left attached to
    /// `self` — the caller must still [`destroy`](Self::destroy) `self` to
    /// reclaim them. This is a deliberately narrower unwind than
    /// [`map`](Self::map)'s full unwind; see the module's design notes.
    ///
    /// # Errors
    /// Returns [`PmapCopyError::OutOfMemory`] if `alloc` is exhausted.
    pub fn copy<A: PhysFrameAlloc>(&self, src: &Self, alloc: &mut A) -> Result<(), PmapCopyError> {
        self.lock.with_lock(|_| {
            src.lock.with_lock(|_| {
                let dst_pml4 = self.aspace.pml4_mut();
                let src_pml4 = src.aspace.pml4_mut();

                for i4 in 0..512u16 {
                    let idx = L4Index::new(i4);
                    let Some(pdpt_page) = src_pml4.get(idx).next_table() else {
                        continue;
                    };
                    let src_flags = src_pml4.get(idx);

                    let Some(new_pdpt) = alloc.alloc_4k() else {
                        self.unwind_pml4_prefix(dst_pml4, i4, alloc);
                        return Err(PmapCopyError::OutOfMemory);
                    };
                    self.aspace.zero_pdpt(new_pdpt);
                    dst_pml4.set(idx, Pml4Entry::present_with(src_flags.into(), new_pdpt));

                    let dst_pdpt = self.aspace.pdpt_mut(new_pdpt);
                    let src_pdpt = self.aspace.pdpt_mut(pdpt_page);
                    if let Err(e) = self.copy_pdpt_level(dst_pdpt, src_pdpt, alloc) {
                        // The failure happened deeper than this level (it already
                        // unwound its own same-depth work before returning). Free
                        // only the one entry this loop iteration just linked —
                        // prior i4 siblings are a shallower, already-Ok'd call
                        // frame and stay attached to self.
                        dst_pml4.set(idx, Pml4Entry::zero());
                        alloc.free_4k(new_pdpt);
                        return Err(e);
                    }
                }

                trace!(
                    "pmap: copied tree from {:?} into {:?}",
                    src.aspace.root_page(),
                    self.aspace.root_page()
                );
                Ok(())
            })
        })
    }

    fn copy_pdpt_level<A: PhysFrameAlloc>(
        &self,
        dst_pdpt: &mut PageDirectoryPointerTable,
        src_pdpt: &PageDirectoryPointerTable,
        alloc: &mut A,
    ) -> Result<(), PmapCopyError> {
        for i3 in 0..512u16 {
            let idx = L3Index::new(i3);
            match src_pdpt.get(idx).kind() {
                None => {}
                Some(PdptEntryKind::Leaf1GiB(_, _)) => {
                    dst_pdpt.set(idx, src_pdpt.get(idx));
                }
                Some(PdptEntryKind::NextPageDirectory(pd_page, flags)) => {
                    let Some(new_pd) = alloc.alloc_4k() else {
                        self.unwind_pdpt_prefix(dst_pdpt, i3, alloc);
                        return Err(PmapCopyError::OutOfMemory);
                    };
                    self.aspace.zero_pd(new_pd);
                    dst_pdpt.set(idx, PdptEntry::make_next(new_pd, flags));

                    let dst_pd = self.aspace.pd_mut(new_pd);
                    let src_pd = self.aspace.pd_mut(pd_page);
                    if let Err(e) = self.copy_pd_level(dst_pd, src_pd, alloc) {
                        // Same reasoning as copy()'s PDPT-level branch: the
                        // failure already unwound its own depth. Free only the
                        // entry this iteration linked, not prior i3 siblings.
                        dst_pdpt.set_zero(idx);
                        alloc.free_4k(new_pd);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    fn copy_pd_level<A: PhysFrameAlloc>(
        &self,
        dst_pd: &mut PageDirectory,
        src_pd: &PageDirectory,
        alloc: &mut A,
    ) -> Result<(), PmapCopyError> {
        for i2 in 0..512u16 {
            let idx = L2Index::new(i2);
            match src_pd.get(idx).kind() {
                None => {}
                Some(PdEntryKind::Leaf2MiB(_, _)) => {
                    dst_pd.set(idx, src_pd.get(idx));
                }
                Some(PdEntryKind::NextPageTable(pt_page, flags)) => {
                    let Some(new_pt) = alloc.alloc_4k() else {
                        self.unwind_pd_prefix(dst_pd, i2, alloc);
                        return Err(PmapCopyError::OutOfMemory);
                    };
                    self.aspace.zero_pt(new_pt);
                    dst_pd.set(idx, PdEntry::present_next_with(flags.into(), new_pt));

                    let dst_pt = self.aspace.pt_mut(new_pt);
                    let src_pt = self.aspace.pt_mut(pt_page);
                    self.copy_pt_level(dst_pt, src_pt);
                }
            }
        }
        Ok(())
    }

    /// Copy one PT's 512 entries verbatim, substituting [`protnone_entry`]
    /// for absent source leaves. Infallible: PT population never allocates.
    fn copy_pt_level(&self, dst_pt: &mut PageTable, src_pt: &PageTable) {
        for i1 in 0..512u16 {
            let idx = L1Index::new(i1);
            let e = src_pt.get(idx);
            if e.present() {
                dst_pt.set(idx, e);
            } else {
                dst_pt.set(idx, protnone_entry());
            }
        }
    }

    fn unwind_pml4_prefix<A: PhysFrameAlloc>(&self, dst_pml4: &mut PageMapLevel4, upto: u16, alloc: &mut A) {
        for i4 in 0..upto {
            let idx = L4Index::new(i4);
            if let Some(pdpt_page) = dst_pml4.get(idx).next_table() {
                self.free_pdpt_subtree(pdpt_page, alloc);
                dst_pml4.set(idx, Pml4Entry::zero());
            }
        }
    }

    fn unwind_pdpt_prefix<A: PhysFrameAlloc>(
        &self,
        dst_pdpt: &mut PageDirectoryPointerTable,
        upto: u16,
        alloc: &mut A,
    ) {
        for i3 in 0..upto {
            let idx = L3Index::new(i3);
            if let Some(PdptEntryKind::NextPageDirectory(pd_page, _)) = dst_pdpt.get(idx).kind() {
                self.free_pd_subtree(pd_page, alloc);
                dst_pdpt.set_zero(idx);
            }
        }
    }

    fn unwind_pd_prefix<A: PhysFrameAlloc>(&self, dst_pd: &mut PageDirectory, upto: u16, alloc: &mut A) {
        for i2 in 0..upto {
            let idx = L2Index::new(i2);
            if let Some(PdEntryKind::NextPageTable(pt_page, _)) = dst_pd.get(idx).kind() {
                alloc.free_4k(pt_page);
                dst_pd.set_zero(idx);
            }
        }
    }

    /// Free a PDPT subtree this copy allocated: every child PD/PT it owns,
    /// then the PDPT frame itself. Never frees the leaf data frames the
    /// tree's PTEs point at — those are not owned by `Pmap`.
    fn free_pdpt_subtree<A: PhysFrameAlloc>(&self, pdpt_page: PhysicalPage<Size4K>, alloc: &mut A) {
        let pdpt = self.aspace.pdpt_mut(pdpt_page);
        for i3 in 0..512u16 {
            if let Some(PdptEntryKind::NextPageDirectory(pd_page, _)) = pdpt.get(L3Index::new(i3)).kind() {
                self.free_pd_subtree(pd_page, alloc);
            }
        }
        alloc.free_4k(pdpt_page);
    }

    fn free_pd_subtree<A: PhysFrameAlloc>(&self, pd_page: PhysicalPage<Size4K>, alloc: &mut A) {
        let pd = self.aspace.pd_mut(pd_page);
        for i2 in 0..512u16 {
            if let Some(PdEntryKind::NextPageTable(pt_page, _)) = pd.get(L2Index::new(i2)).kind() {
                alloc.free_4k(pt_page);
            }
        }
        alloc.free_4k(pd_page);
    }

    /// Walks the whole tree looking for any present leaf at any level.
    fn has_any_mapping(&self) -> bool {
        let pml4 = self.aspace.pml4_mut();
        for i4 in 0..512u16 {
            let Some(pdpt_page) = pml4.get(L4Index::new(i4)).next_table() else {
                continue;
            };
            let pdpt = self.aspace.pdpt_mut(pdpt_page);
            for i3 in 0..512u16 {
                match pdpt.get(L3Index::new(i3)).kind() {
                    Some(PdptEntryKind::Leaf1GiB(_, _)) => return true,
                    Some(PdptEntryKind::NextPageDirectory(pd_page, _)) => {
                        let pd = self.aspace.pd_mut(pd_page);
                        for i2 in 0..512u16 {
                            match pd.get(L2Index::new(i2)).kind() {
                                Some(PdEntryKind::Leaf2MiB(_, _)) => return true,
                                Some(PdEntryKind::NextPageTable(pt_page, _)) => {
                                    let pt = self.aspace.pt_mut(pt_page);
                                    for i1 in 0..512u16 {
                                        if pt.get(L1Index::new(i1)).present() {
                                            return true;
                                        }
                                    }
                                }
                                None => {}
                            }
                        }
                    }
                    None => {}
                }
            }
        }
        false
    }

    /// Per-page modified (dirty) tracking. Not implemented: this engine
    /// keeps no reverse mapping from physical frame back to installing
    /// PTEs, so there is nowhere to look up "all the places this frame is
    /// mapped" without a full tree walk per call.
    pub fn is_modified(&self, _va: VirtualAddress) -> bool {
        unimplemented!("pmap: modified-bit tracking needs a reverse-mapping index")
    }

    /// See [`is_modified`](Self::is_modified).
    pub fn clear_modify(&self, _va: VirtualAddress) {
        unimplemented!("pmap: modified-bit tracking needs a reverse-mapping index")
    }

    /// Per-page accessed-bit tracking. Not implemented for the same reason
    /// as [`is_modified`](Self::is_modified).
    pub fn is_referenced(&self, _va: VirtualAddress) -> bool {
        unimplemented!("pmap: accessed-bit tracking needs a reverse-mapping index")
    }

    /// See [`is_referenced`](Self::is_referenced).
    pub fn clear_reference(&self, _va: VirtualAddress) {
        unimplemented!("pmap: accessed-bit tracking needs a reverse-mapping index")
    }

    /// Change protection of every mapping of a physical frame, across every
    /// pmap that maps it. Not implemented: requires the same reverse-mapping
    /// index as [`is_modified`](Self::is_modified).
    pub fn page_setprot(&self, _pa: PhysicalAddress, _pflags: PFlags) {
        unimplemented!("pmap: reverse-mapping-driven setprot needs a per-frame installing-entry list")
    }

    /// Unmap a physical frame from every pmap that maps it. Not implemented
    /// for the same reason.
    pub fn unmapping_all(&self, _pa: PhysicalAddress) {
        unimplemented!("pmap: reverse-mapping teardown needs a per-frame installing-entry list")
    }

    /// SMP TLB-shootdown-aware deactivation. Not implemented: this engine
    /// targets a single core; see the module docs' concurrency section.
    pub fn deactivate(&self) {
        unimplemented!("pmap: deactivate() has no defined semantics without SMP TLB shootdown")
    }
}

/// Invalidate the TLB entry for `va` on the local CPU.
///
/// Callers of [`Pmap::map`] / [`Pmap::unmap`] / [`Pmap::setprot`] are
/// responsible for calling this (or a full CR3 reload) after mutating a
/// currently-active address space.
///
/// # Safety
/// Must run at CPL0.
pub unsafe fn tlb_flush(va: VirtualAddress) {
    unsafe {
        crate::invalidate_tlb_page(va);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    const FRAME_LAYOUT: Layout = match Layout::from_size_align(4096, 4096) {
        Ok(l) => l,
        Err(_) => unreachable!(),
    };

    /// Host-side stand-in for physical memory: hands out synthetic physical
    /// addresses backed by real heap allocations, and lets [`TestMapper`]
    /// translate between the two.
    struct FrameArena {
        map: RefCell<HashMap<u64, *mut u8>>,
        next_pa: RefCell<u64>,
    }

    impl FrameArena {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                map: RefCell::new(HashMap::new()),
                next_pa: RefCell::new(0x1000_0000),
            })
        }

        fn alloc(&self) -> PhysicalPage<Size4K> {
            let ptr = unsafe { alloc_zeroed(FRAME_LAYOUT) };
            assert!(!ptr.is_null());
            let mut next = self.next_pa.borrow_mut();
            let pa = *next;
            *next += Size4K::SIZE;
            self.map.borrow_mut().insert(pa, ptr);
            PhysicalPage::from_addr(PhysicalAddress::new(pa))
        }

        fn free(&self, frame: PhysicalPage<Size4K>) {
            if let Some(ptr) = self.map.borrow_mut().remove(&frame.base().as_u64()) {
                unsafe { dealloc(ptr, FRAME_LAYOUT) };
            }
        }
    }

    struct TestMapper(Rc<FrameArena>);

    impl PhysMapper for TestMapper {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let ptr = *self
                .0
                .map
                .borrow()
                .get(&pa.as_u64())
                .unwrap_or_else(|| panic!("test mapper: unmapped physical address {pa:?}"));
            unsafe { &mut *ptr.cast::<T>() }
        }
    }

    struct TestFrameAlloc {
        arena: Rc<FrameArena>,
        fail_after: Option<usize>,
        allocations: usize,
        outstanding: usize,
    }

    impl TestFrameAlloc {
        fn new(arena: Rc<FrameArena>) -> Self {
            Self {
                arena,
                fail_after: None,
                allocations: 0,
                outstanding: 0,
            }
        }

        fn failing_after(arena: Rc<FrameArena>, n: usize) -> Self {
            Self {
                arena,
                fail_after: Some(n),
                allocations: 0,
                outstanding: 0,
            }
        }
    }

    impl PhysFrameAlloc for TestFrameAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
            if let Some(limit) = self.fail_after {
                if self.allocations >= limit {
                    return None;
                }
            }
            self.allocations += 1;
            self.outstanding += 1;
            Some(self.arena.alloc())
        }

        fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
            self.outstanding -= 1;
            self.arena.free(frame);
        }
    }

    fn new_pmap<'m>(mapper: &'m TestMapper, alloc: &mut TestFrameAlloc) -> Pmap<'m, TestMapper> {
        Pmap::create(mapper, alloc, true).expect("create should succeed with a fresh arena")
    }

    #[test]
    fn round_trip_mapping() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut alloc = TestFrameAlloc::new(arena.clone());
        let p = new_pmap(&mapper, &mut alloc);

        let va = VirtualAddress::new(0x0000_0040_0000);
        let pa = PhysicalAddress::new(0x1000);
        p.map(&mut alloc, va, pa, MFlags::KERNEL, PFlags::RW).unwrap();
        assert_eq!(p.getmap(va), Some(pa));
    }

    #[test]
    fn idempotent_unmap() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut alloc = TestFrameAlloc::new(arena.clone());
        let p = new_pmap(&mapper, &mut alloc);

        let va = VirtualAddress::new(0x0000_0040_0000);
        let pa = PhysicalAddress::new(0x1000);
        p.map(&mut alloc, va, pa, MFlags::KERNEL, PFlags::RW).unwrap();

        p.unmap(va);
        p.unmap(va);
        assert_eq!(p.getmap(va), None);
    }

    #[test]
    fn setprot_preserves_mapping() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut alloc = TestFrameAlloc::new(arena.clone());
        let p = new_pmap(&mapper, &mut alloc);

        let va = VirtualAddress::new(0x0000_0040_0000);
        let pa = PhysicalAddress::new(0x1000);
        p.map(&mut alloc, va, pa, MFlags::KERNEL, PFlags::RW).unwrap();

        let eva = VirtualAddress::new(va.as_u64() + Size4K::SIZE);
        p.setprot(va, eva, PFlags::R).unwrap();
        assert_eq!(p.getmap(va), Some(pa));
    }

    #[test]
    fn setprot_rejects_bad_flags() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut alloc = TestFrameAlloc::new(arena.clone());
        let p = new_pmap(&mapper, &mut alloc);

        let sva = VirtualAddress::new(0x0000_0040_0000);
        let eva = VirtualAddress::new(sva.as_u64() + Size4K::SIZE);
        let err = p.setprot(sva, eva, PFlags::WRITE);
        assert_eq!(err, Err(PmapSetProtError::BadFlags));
    }

    #[test]
    fn map_with_zero_flag_zero_fills_destination() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut alloc = TestFrameAlloc::new(arena.clone());
        let p = new_pmap(&mapper, &mut alloc);

        let data = arena.alloc();
        unsafe {
            let bytes: &mut [u8] = core::slice::from_raw_parts_mut(mapper.phys_to_mut(data.base()), 4096);
            bytes.fill(0xAA);
        }

        let va = VirtualAddress::new(0x0010_0000);
        p.map(&mut alloc, va, data.base(), MFlags::KERNEL, PFlags::RW).unwrap();

        let bytes: &[u8] = unsafe { core::slice::from_raw_parts(mapper.phys_to_mut(data.base()), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn map_oom_on_first_alloc_leaves_no_partial_state() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut seed_alloc = TestFrameAlloc::new(arena.clone());
        let p = new_pmap(&mapper, &mut seed_alloc);

        let mut alloc = TestFrameAlloc::failing_after(arena.clone(), 0);
        let va = VirtualAddress::new(0x0000_0040_0000);
        let pa = PhysicalAddress::new(0x9000);
        let err = p.map(&mut alloc, va, pa, MFlags::KERNEL, PFlags::RW);
        assert_eq!(err, Err(PmapMapError::OutOfMemory));
        assert_eq!(p.getmap(va), None);
    }

    #[test]
    fn map_oom_at_second_level_unwinds_first_level() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut seed_alloc = TestFrameAlloc::new(arena.clone());
        let p = new_pmap(&mapper, &mut seed_alloc);

        let mut alloc = TestFrameAlloc::failing_after(arena.clone(), 1);
        let va = VirtualAddress::new(0x0000_0040_0000);
        let pa = PhysicalAddress::new(0x9000);
        let before = alloc.outstanding;
        let err = p.map(&mut alloc, va, pa, MFlags::KERNEL, PFlags::RW);
        assert_eq!(err, Err(PmapMapError::OutOfMemory));
        assert_eq!(alloc.outstanding, before, "new PDPT frame must be freed on PD-alloc failure");
        assert_eq!(p.getmap(va), None);
    }

    #[test]
    fn refcount_gates_destroy() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut alloc = TestFrameAlloc::new(arena.clone());
        let p = new_pmap(&mapper, &mut alloc);

        p.reference();
        p.reference();
        assert!(p.destroy().is_none());
        assert!(p.destroy().is_none());
        assert!(p.destroy().is_some());
    }

    #[test]
    fn destroy_panics_with_live_mappings() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut alloc = TestFrameAlloc::new(arena.clone());
        let p = new_pmap(&mapper, &mut alloc);

        let va = VirtualAddress::new(0x0000_0040_0000);
        let pa = PhysicalAddress::new(0x9000);
        p.map(&mut alloc, va, pa, MFlags::KERNEL, PFlags::RW).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| p.destroy()));
        assert!(result.is_err());
    }

    #[test]
    fn copy_is_independent_of_later_src_mutation() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut alloc = TestFrameAlloc::new(arena.clone());
        let src = new_pmap(&mapper, &mut alloc);
        let dst = new_pmap(&mapper, &mut alloc);

        let va = VirtualAddress::new(0x0080_0000);
        let pa = PhysicalAddress::new(0x5000);
        src.map(&mut alloc, va, pa, MFlags::KERNEL, PFlags::RW).unwrap();

        dst.copy(&src, &mut alloc).unwrap();
        assert_eq!(dst.getmap(va), Some(pa));

        src.unmap(va);
        assert_eq!(src.getmap(va), None);
        assert_eq!(dst.getmap(va), Some(pa), "copy must not alias src's page tables");
    }

    #[test]
    fn copy_fills_unmapped_leaves_with_protnone() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut alloc = TestFrameAlloc::new(arena.clone());
        let src = new_pmap(&mapper, &mut alloc);
        let dst = new_pmap(&mapper, &mut alloc);

        // Force a PT to exist with exactly one present entry, so the copy
        // must populate the other 511 with protnone placeholders.
        let base = VirtualAddress::new(0x0000_0020_0000);
        src.map(&mut alloc, base, PhysicalAddress::new(0x7000), MFlags::KERNEL, PFlags::RW)
            .unwrap();

        dst.copy(&src, &mut alloc).unwrap();

        let (i4, i3, i2, _) = split_indices(base);
        let pdpt_page = dst.aspace.pml4_mut().get(i4).next_table().unwrap();
        let pd_page = match dst.aspace.pdpt_mut(pdpt_page).get(i3).kind() {
            Some(PdptEntryKind::NextPageDirectory(p, _)) => p,
            _ => panic!("expected a PD"),
        };
        let pt_page = match dst.aspace.pd_mut(pd_page).get(i2).kind() {
            Some(PdEntryKind::NextPageTable(p, _)) => p,
            _ => panic!("expected a PT"),
        };
        let pt = dst.aspace.pt_mut(pt_page);
        let neighbor = L1Index::new(L1Index::from(base).as_usize() as u16 + 1);
        assert!(is_protnone(pt.get(neighbor)));
    }

    #[test]
    fn copy_oom_does_not_leak_reachable_frames() {
        let arena = FrameArena::new();
        let mapper = TestMapper(arena.clone());
        let mut seed_alloc = TestFrameAlloc::new(arena.clone());
        let src = new_pmap(&mapper, &mut seed_alloc);
        let dst = new_pmap(&mapper, &mut seed_alloc);

        src.map(
            &mut seed_alloc,
            VirtualAddress::new(0x0000_0040_0000),
            PhysicalAddress::new(0x9000),
            MFlags::KERNEL,
            PFlags::RW,
        )
        .unwrap();

        let mut alloc = TestFrameAlloc::failing_after(arena.clone(), 0);
        let err = dst.copy(&src, &mut alloc);
        assert_eq!(err, Err(PmapCopyError::OutOfMemory));
        assert_eq!(dst.getmap(VirtualAddress::new(0x0000_0040_0000)), None);
    }
}
