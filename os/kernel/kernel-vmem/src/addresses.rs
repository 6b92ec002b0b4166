//! # Virtual and Physical Memory Addresses
//!
//! Thin re-export of [`kernel_memory_addresses`]'s strongly-typed address and
//! page newtypes, so the rest of this crate refers to a single, coherent
//! family (`PhysicalAddress`, `VirtualAddress`, `PhysicalPage<S>`,
//! `VirtualPage<S>`, `Size4K`/`Size2M`/`Size1G`) instead of defining its own.

pub use kernel_memory_addresses::*;
