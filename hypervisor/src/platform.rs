//! The module containing [`PlatformOps`], the interface of the OS-kernel
//! collaborators this crate is embedded into.
//!
//! The CVM core never calls an operating system directly. Memory comes from
//! the global allocator the embedder installs; everything else it needs from
//! the outside world — processor identity, cross-processor calls, image
//! ranges for hypercall caller validation, resident-page queries for guest
//! mapping — crosses this trait.
//!
//! Addressing model: the crate targets identity-mapped environments (UEFI, or
//! a kernel running with a physical mapping), so the address of a heap
//! allocation is its physical address. [`pa_of`] is the single place this
//! assumption lives.

use core::ops::Range;

/// Services provided by the embedding kernel.
pub trait PlatformOps: Sync + Send {
    /// Returns the index of the calling logical processor.
    fn current_processor(&self) -> u32;

    /// Returns the number of logical processors in the system.
    fn processor_count(&self) -> u32;

    /// Runs `worker` on every logical processor, passing each its index, and
    /// returns only after every processor has acknowledged completion.
    fn generic_call(&self, worker: &(dyn Fn(u32) + Sync));

    /// The address range of the hypervisor image itself. Callers of the
    /// unload hypercall must reside here.
    fn hypervisor_image(&self) -> Range<u64>;

    /// The address range of the layered hypervisor image. Callers of all CVM
    /// hypercalls must reside here.
    fn layered_image(&self) -> Range<u64>;

    /// The physical memory ranges actually backed by RAM. Drives the
    /// reverse-mapping table directory.
    fn physical_memory_ranges(&self) -> &[Range<u64>];

    /// Reports residency attributes of a host-virtual page, or [`None`] if
    /// the address is not mapped at all.
    fn query_page(&self, va: u64) -> Option<PageAttributes>;

    /// A coarse monotonic clock for the interception profiler, in
    /// platform-defined units.
    fn time(&self) -> u64;

    /// Fills `buffer` with cryptographically secure random bytes. Used to
    /// derive per-VM page-encryption keys.
    fn entropy(&self, buffer: &mut [u8]);
}

/// Residency attributes of one host-virtual page.
#[derive(Debug, Clone, Copy)]
pub struct PageAttributes {
    /// The page is present.
    pub valid: bool,
    /// The page is locked (cannot be paged out).
    pub locked: bool,
    /// The page is part of a large-page mapping.
    pub large_page: bool,
}

/// Returns the physical address of `object` under the identity-mapping
/// assumption stated in the module documentation.
pub(crate) fn pa_of<T: ?Sized>(object: &T) -> u64 {
    core::ptr::addr_of!(*object).cast::<u8>() as u64
}
