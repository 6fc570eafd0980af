#![doc = include_str!("../../README.md")]
#![cfg_attr(not(test), no_std)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("This project must target the 64bit-width pointer environment.");

extern crate alloc;

pub mod asid;
pub mod config;
pub mod error;
pub mod exits;
pub mod global_state;
pub mod host;
pub mod hypercall;
pub mod logger;
mod mtrr;
pub mod npt;
pub mod nsv;
pub mod platform;
pub mod rmt;
pub mod vcpu;
pub mod vm;
pub mod vmcb;
mod x86_instructions;

use alloc::boxed::Box;
use x86::current::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

/// The structure representing a single memory page (4KB).
//
// This does not _always_ have to be allocated at the page aligned address, but
// very often it is, so let us specify the alignment.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(4096))]
pub struct Page([u8; BASE_PAGE_SIZE]);
const _: () = assert!(core::mem::size_of::<Page>() == 0x1000);

impl Page {
    /// Allocates a zero-filled page on the heap.
    pub(crate) fn boxed_zeroed() -> Box<Self> {
        // Safety: an all-zero byte array is a valid `Page`.
        unsafe { Box::<Self>::new_zeroed().assume_init() }
    }

    /// Allocates `count` zero-filled, physically contiguous pages.
    pub(crate) fn boxed_slice_zeroed(count: usize) -> Box<[Self]> {
        // Safety: an all-zero byte array is a valid `Page`.
        unsafe { Box::<[Self]>::new_zeroed_slice(count).assume_init() }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Computes how many pages are needed for the given bytes.
pub(crate) fn size_to_pages(size: usize) -> usize {
    const PAGE_MASK: usize = 0xfff;

    (size >> BASE_PAGE_SHIFT) + usize::from((size & PAGE_MASK) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_for_sizes() {
        assert_eq!(size_to_pages(0), 0);
        assert_eq!(size_to_pages(1), 1);
        assert_eq!(size_to_pages(0x1000), 1);
        assert_eq!(size_to_pages(0x1001), 2);
        assert_eq!(size_to_pages(0x6000), 6);
    }
}
