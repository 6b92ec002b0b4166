//! # Bootstrap-Only: HHDM Framebuffer Mapping
//!
//! **This module is strictly for early kernel bootstrapping**, before the
//! real page-frame allocator is online. Intermediate page-table frames come
//! from a [`ReserveAllocator`](kernel_alloc::reserve::ReserveAllocator)
//! handed in by the caller, not from this module.
//!
//! ## Design notes
//!
//! - HHDM: assumes a higher-half direct map where `HHDM_BASE + PA` is always
//!   mapped and writable.
//! - Avoids splitting the bootloader's 1 GiB huge mapping by offsetting the
//!   framebuffer mapping to [`VGA_LIKE_OFFSET`].

use kernel_alloc::phys_mapper::HhdmPhysMapper;
use kernel_alloc::reserve::ReserveAllocator;
use kernel_info::boot::{BootPixelFormat, FramebufferInfo};
use kernel_info::memory::HHDM_BASE;
use kernel_vmem::addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{AddressSpace, VirtualMemoryPageBits};

/// Offset inside the HHDM the framebuffer is remapped to, chosen so it never
/// overlaps the first 1 GiB huge-page identity mapping the bootloader set up.
const VGA_LIKE_OFFSET: u64 = (1u64 << 30) + 0x000B_8000;

/// Map the framebuffer's **physical memory** into the HHDM and return its VA slice.
///
/// This creates a 4 KiB-granular linear mapping of the framebuffer range
/// `[framebuffer_ptr, framebuffer_ptr + framebuffer_size)` to a virtual range
/// inside the HHDM starting at `HHDM_BASE + VGA_LIKE_OFFSET + offset_in_page`,
/// using `reserve` to supply intermediate page-table frames.
///
/// The mapping uses `WRITABLE`, `GLOBAL`, and `NX` leaf flags.
///
/// ### Parameters
/// - `fb`: Framebuffer information obtained from the loader. If the pixel
///   format is [`BootPixelFormat::BltOnly`], no mapping is created.
/// - `reserve`: the pre-PFA bump allocator supplying page-table frames.
///
/// ### Returns
/// `(va_start, len)` where `va_start` is the virtual address of the first
/// framebuffer byte (respecting the original physical offset within the
/// first page) and `len` is the byte length of the mapped region. Returns
/// `(0, 0)` for `BltOnly`.
///
/// ### Notes
/// Placing the framebuffer at `VGA_LIKE_OFFSET` avoids splitting the 1 GiB
/// huge mapping the bootstrap identity map installs at the start of the HHDM.
///
/// # Panics
/// Panics if `reserve` is exhausted before every framebuffer page is mapped.
pub fn map_framebuffer_into_hhdm(
    aspace: &AddressSpace<'_, HhdmPhysMapper>,
    reserve: &mut ReserveAllocator,
    fb: &FramebufferInfo,
) -> (VirtualAddress, u64) {
    if matches!(fb.framebuffer_format, BootPixelFormat::BltOnly) {
        return (VirtualAddress::new(0), 0);
    }

    let fb_pa = fb.framebuffer_ptr;
    let fb_len = fb.framebuffer_size;

    let page = 4096u64;
    let pa_start = fb_pa & !(page - 1);
    let pa_end = (fb_pa + fb_len + page - 1) & !(page - 1);

    let va_base = HHDM_BASE + VGA_LIKE_OFFSET;
    let va_start = va_base + (fb_pa - pa_start);

    let nonleaf_flags =
        VirtualMemoryPageBits { present: true, writable: true, ..Default::default() };
    let leaf_flags = VirtualMemoryPageBits {
        present: true,
        writable: true,
        global: true,
        no_execute: true,
        ..Default::default()
    };

    let mut pa = pa_start;
    let mut va = va_start & !(page - 1);
    while pa < pa_end {
        aspace
            .map_one::<ReserveAllocator, kernel_vmem::addresses::Size4K>(
                reserve,
                VirtualAddress::new(va),
                PhysicalAddress::new(pa),
                nonleaf_flags,
                leaf_flags,
            )
            .expect("map framebuffer page");
        pa += page;
        va += page;
    }

    (VirtualAddress::new(va_start), pa_end - pa_start)
}
