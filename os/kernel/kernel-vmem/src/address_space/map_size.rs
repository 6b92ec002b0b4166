//! # Memory Page Table Mapping Size
//!
//! This module defines the behavior of [`AddressSpace::map_one`](super::AddressSpace::map_one) for
//! different page sizes.
//!
//! The `MapSize` trait is implemented for each page size, and provides the
//! following methods:
//!
//! - `ensure_chain_for`: given a virtual address, ensure that the non-leaf
//!   chain for that address down to the table that holds the leaf exists.
//! - `set_leaf`: install the leaf entry for `Self`'s page size.

use crate::VirtualMemoryPageBits;
use crate::addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress,
};
use crate::page_table::pd::{L2Index, PdEntry, PdEntryKind};
use crate::page_table::pdpt::{L3Index, PdptEntry, PdptEntryKind};
use crate::page_table::pml4::{L4Index, Pml4Entry};
use crate::page_table::pt::{L1Index, PtEntry4k};
use crate::{AddressSpace, PhysFrameAlloc, PhysMapper, PhysMapperExt};

/// # Page-size–directed mapping behavior
///
/// `MapSize` encodes, at the type level, how to:
/// 1) **ensure** the non-leaf page-table chain exists for a given virtual
///    address, and
/// 2) **install** the correct **leaf** entry for that page size.
///
/// Implementations for [`Size1G`], [`Size2M`], and [`Size4K`] decide where to
/// stop the walk and which entry to write, so callers don't branch at runtime.
pub trait MapSize: PageSize {
    /// Ensure that the non-leaf chain for `va` exists down to the table that
    /// holds the leaf for `Self`, allocating and linking intermediate tables
    /// as needed.
    ///
    /// ### Returns
    /// The 4 KiB frame of the table where the leaf for `Self` must be
    /// written: `Size1G` → PDPT frame, `Size2M` → PD frame, `Size4K` → PT frame.
    ///
    /// ### Errors
    /// Propagates allocator exhaustion at the depth it occurred.
    fn ensure_chain_for<A: PhysFrameAlloc, M: PhysMapper>(
        aspace: &AddressSpace<'_, M>,
        alloc: &mut A,
        va: VirtualAddress,
        nonleaf_flags: VirtualMemoryPageBits,
    ) -> Result<PhysicalPage<Size4K>, MapSizeEnsureChainError>;

    /// Install the leaf entry for `va → pa` in the `leaf_tbl_page` returned by
    /// [`ensure_chain_for`](Self::ensure_chain_for), with the given `leaf_flags`.
    fn set_leaf<M: PhysMapper>(
        aspace: &AddressSpace<'_, M>,
        leaf_tbl_page: PhysicalPage<Size4K>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        leaf_flags: VirtualMemoryPageBits,
    );
}

/// Error returned by [`MapSize::ensure_chain_for`] when allocating a new
/// intermediate table frame fails.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[allow(clippy::enum_variant_names)]
pub enum MapSizeEnsureChainError {
    #[error("out of memory (PDPT)")]
    OomPdpt,
    #[error("out of memory (PD)")]
    OomPd,
    #[error("out of memory (PT)")]
    OomPt,
}

/// Ensure the L4 → L3 (PML4 → PDPT) link exists, allocating a fresh PDPT if needed.
fn ensure_pdpt<A: PhysFrameAlloc, M: PhysMapper>(
    aspace: &AddressSpace<'_, M>,
    alloc: &mut A,
    i4: L4Index,
    nonleaf_flags: VirtualMemoryPageBits,
) -> Result<PhysicalPage<Size4K>, MapSizeEnsureChainError> {
    let pml4 = aspace.pml4_mut();
    let e4 = pml4.get(i4);
    if let Some(pdpt_page) = e4.next_table() {
        return Ok(pdpt_page);
    }
    let f = alloc
        .alloc_4k()
        .ok_or(MapSizeEnsureChainError::OomPdpt)?;
    aspace.zero_pdpt(f);
    pml4.set(i4, Pml4Entry::present_with(nonleaf_flags, f));
    Ok(f)
}

/// Ensure the L3 → L2 (PDPT → PD) link exists, splitting a 1 GiB leaf only
/// happens implicitly (a present 1 GiB leaf is treated as "no child PD yet"
/// and overwritten) since in-place huge-page splitting needs the caller to
/// have unmapped it first.
fn ensure_pd<M: PhysMapper>(
    aspace: &AddressSpace<'_, M>,
    pdpt_page: PhysicalPage<Size4K>,
    i3: L3Index,
    alloc_pd: impl FnOnce() -> Result<PhysicalPage<Size4K>, MapSizeEnsureChainError>,
    nonleaf_flags: VirtualMemoryPageBits,
) -> Result<PhysicalPage<Size4K>, MapSizeEnsureChainError> {
    let pdpt = aspace.pdpt_mut(pdpt_page);
    let e3 = pdpt.get(i3);
    match e3.kind() {
        Some(PdptEntryKind::NextPageDirectory(pd, _)) => Ok(pd),
        Some(PdptEntryKind::Leaf1GiB(_, _)) | None => {
            let f = alloc_pd()?;
            aspace.zero_pd(f);
            pdpt.set(i3, PdptEntry::make_next(f, nonleaf_flags.to_pdpte()));
            Ok(f)
        }
    }
}

/// Ensure the L2 → L1 (PD → PT) link exists.
fn ensure_pt<M: PhysMapper>(
    aspace: &AddressSpace<'_, M>,
    pd_page: PhysicalPage<Size4K>,
    i2: L2Index,
    alloc_pt: impl FnOnce() -> Result<PhysicalPage<Size4K>, MapSizeEnsureChainError>,
    nonleaf_flags: VirtualMemoryPageBits,
) -> Result<PhysicalPage<Size4K>, MapSizeEnsureChainError> {
    let pd = aspace.pd_mut(pd_page);
    let e2 = pd.get(i2);
    match e2.kind() {
        Some(PdEntryKind::NextPageTable(pt, _)) => Ok(pt),
        Some(PdEntryKind::Leaf2MiB(_, _)) | None => {
            let f = alloc_pt()?;
            aspace.zero_pt(f);
            pd.set(i2, PdEntry::present_next_with(nonleaf_flags, f));
            Ok(f)
        }
    }
}

impl MapSize for Size1G {
    fn ensure_chain_for<A: PhysFrameAlloc, M: PhysMapper>(
        aspace: &AddressSpace<'_, M>,
        alloc: &mut A,
        va: VirtualAddress,
        nonleaf_flags: VirtualMemoryPageBits,
    ) -> Result<PhysicalPage<Size4K>, MapSizeEnsureChainError> {
        ensure_pdpt(aspace, alloc, L4Index::from(va), nonleaf_flags)
    }

    fn set_leaf<M: PhysMapper>(
        aspace: &AddressSpace<'_, M>,
        leaf_tbl_page: PhysicalPage<Size4K>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        leaf_flags: VirtualMemoryPageBits,
    ) {
        debug_assert_eq!(pa.offset::<Self>().as_u64(), 0);
        let pdpt = aspace.pdpt_mut(leaf_tbl_page);
        let idx = L3Index::from(va);
        let g1 = PhysicalPage::<Self>::from_addr(pa);
        pdpt.set(idx, PdptEntry::make_1g(g1, leaf_flags.to_pdpte_1g()));
    }
}

impl MapSize for Size2M {
    fn ensure_chain_for<A: PhysFrameAlloc, M: PhysMapper>(
        aspace: &AddressSpace<'_, M>,
        alloc: &mut A,
        va: VirtualAddress,
        nonleaf_flags: VirtualMemoryPageBits,
    ) -> Result<PhysicalPage<Size4K>, MapSizeEnsureChainError> {
        let i3 = L3Index::from(va);
        let pdpt_page = ensure_pdpt(aspace, alloc, L4Index::from(va), nonleaf_flags)?;
        ensure_pd(
            aspace,
            pdpt_page,
            i3,
            || {
                alloc
                    .alloc_4k()
                    .ok_or(MapSizeEnsureChainError::OomPd)
            },
            nonleaf_flags,
        )
    }

    fn set_leaf<M: PhysMapper>(
        aspace: &AddressSpace<'_, M>,
        leaf_tbl_page: PhysicalPage<Size4K>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        leaf_flags: VirtualMemoryPageBits,
    ) {
        debug_assert_eq!(pa.offset::<Self>().as_u64(), 0);
        let pd = aspace.pd_mut(leaf_tbl_page);
        let idx = L2Index::from(va);
        let m2 = PhysicalPage::<Self>::from_addr(pa);
        pd.set(idx, PdEntry::present_leaf_with(leaf_flags, m2));
    }
}

impl MapSize for Size4K {
    fn ensure_chain_for<A: PhysFrameAlloc, M: PhysMapper>(
        aspace: &AddressSpace<'_, M>,
        alloc: &mut A,
        va: VirtualAddress,
        nonleaf_flags: VirtualMemoryPageBits,
    ) -> Result<PhysicalPage<Size4K>, MapSizeEnsureChainError> {
        let i3 = L3Index::from(va);
        let i2 = L2Index::from(va);
        let pdpt_page = ensure_pdpt(aspace, alloc, L4Index::from(va), nonleaf_flags)?;
        let pd_page = ensure_pd(
            aspace,
            pdpt_page,
            i3,
            || {
                alloc
                    .alloc_4k()
                    .ok_or(MapSizeEnsureChainError::OomPd)
            },
            nonleaf_flags,
        )?;
        ensure_pt(
            aspace,
            pd_page,
            i2,
            || {
                alloc
                    .alloc_4k()
                    .ok_or(MapSizeEnsureChainError::OomPt)
            },
            nonleaf_flags,
        )
    }

    fn set_leaf<M: PhysMapper>(
        aspace: &AddressSpace<'_, M>,
        leaf_tbl_page: PhysicalPage<Size4K>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        leaf_flags: VirtualMemoryPageBits,
    ) {
        debug_assert_eq!(pa.offset::<Self>().as_u64(), 0);
        let pt = aspace.pt_mut(leaf_tbl_page);
        let idx = L1Index::from(va);
        let k4 = PhysicalPage::<Self>::from_addr(pa);
        pt.set(idx, PtEntry4k::present_with(leaf_flags, k4));
    }
}
