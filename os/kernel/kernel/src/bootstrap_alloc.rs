//! # Bootstrap-Only Identity Mapping
//!
//! Builds the kernel's first post-paging page table: a reserve allocator
//! over the low-memory identity window, handed to
//! [`kernel_vmem::bootstrap::bootstrap_identity_map`] to produce a fresh
//! [`AddressSpace`](kernel_vmem::AddressSpace).
//!
//! ## WARNING
//!
//! - Valid only between "paging enabled" and "the real page-frame allocator
//!   is [`ready`](kernel_alloc::frame_alloc::BitmapFrameAlloc::ready)".
//! - The [`ReserveAllocator`] returned here must be
//!   [`retire`](ReserveAllocator::retire)d once the bitmap allocator has
//!   walked the boot memory map and taken over.

use kernel_alloc::phys_mapper::HhdmPhysMapper;
use kernel_alloc::reserve::ReserveAllocator;
use kernel_info::memory::{IDENTITY_LOW_BYTES, MemoryLimits, PHYS_LOAD};
use kernel_vmem::AddressSpace;
use kernel_vmem::bootstrap::{BootstrapError, bootstrap_identity_map};

/// Low-memory window this bootstrap pass identity-maps:
/// `[PHYS_LOAD, PHYS_LOAD + IDENTITY_LOW_BYTES)`.
fn lowmem_limits() -> MemoryLimits {
    MemoryLimits::new(PHYS_LOAD, PHYS_LOAD + IDENTITY_LOW_BYTES)
}

/// Build the reserve allocator and the identity-mapped bootstrap address
/// space in one step.
///
/// # Errors
/// Propagates [`BootstrapError::OutOfMemory`] if the reserve window is too
/// small for the low-memory identity map it is asked to build.
pub fn build(
    mapper: &HhdmPhysMapper,
) -> Result<(AddressSpace<'_, HhdmPhysMapper>, ReserveAllocator), BootstrapError> {
    let limits = lowmem_limits();
    let mut reserve = ReserveAllocator::new(limits);
    let aspace = bootstrap_identity_map(mapper, &mut reserve, limits, PHYS_LOAD)?;
    Ok((aspace, reserve))
}
