//! The module containing the [`AsidPool`] type.
//!
//! Address-space identifiers tag TLB entries so translations belonging to
//! different guests can coexist without a flush on every world switch. ASID 0
//! belongs to the hypervisor and is never handed out; ASID 1 is the
//! subverted host; when nested virtualization is enabled, the lower half of
//! the hardware-supported range is reserved for it and customizable VMs draw
//! from the upper half.

use crate::error::{HvError, Result};
use bit_vec::BitVec;
use spin::RwLock;

/// The "no ASID" sentinel stored in mappings whose address space has not
/// been allocated yet.
pub const ASID_NONE: u32 = 0xffff_ffff;

/// The ASID of the subverted host.
pub const HOST_ASID: u32 = 1;

/// The allocator for the customizable-VM ASID range.
#[derive(Debug)]
pub struct AsidPool {
    inner: RwLock<PoolBits>,
}

#[derive(Debug)]
struct PoolBits {
    /// Set bits are allocated. Bit `i` represents ASID `start + i`.
    bitmap: BitVec,
    /// The first ASID available to customizable VMs.
    start: u32,
}

impl AsidPool {
    /// Creates the pool for a processor supporting `asid_limit` address
    /// spaces. With `nested_virtualization`, ASIDs 2..limit/2 stay reserved
    /// for nested guests.
    pub fn new(asid_limit: u32, nested_virtualization: bool) -> Self {
        let start = if nested_virtualization {
            asid_limit >> 1
        } else {
            2
        };
        let count = (asid_limit - start) as usize;
        Self {
            inner: RwLock::new(PoolBits {
                bitmap: BitVec::from_elem(count, false),
                start,
            }),
        }
    }

    /// Allocates the lowest free ASID in the customizable-VM range.
    pub fn alloc(&self) -> Result<u32> {
        let mut pool = self.inner.write();
        let index = pool
            .bitmap
            .iter()
            .position(|taken| !taken)
            .ok_or(HvError::InsufficientResources)?;
        pool.bitmap.set(index, true);
        Ok(pool.start + index as u32)
    }

    /// Returns `asid` to the pool.
    pub fn free(&self, asid: u32) {
        let mut pool = self.inner.write();
        let index = (asid - pool.start) as usize;
        pool.bitmap.set(index, false);
    }

    /// Counts currently allocated ASIDs. Diagnostics only.
    pub fn allocated_count(&self) -> usize {
        self.inner
            .read()
            .bitmap
            .iter()
            .filter(|taken| *taken)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_from_range_start() {
        let pool = AsidPool::new(16, false);
        assert_eq!(pool.alloc().unwrap(), 2);
        assert_eq!(pool.alloc().unwrap(), 3);
        pool.free(2);
        assert_eq!(pool.alloc().unwrap(), 2);
    }

    #[test]
    fn nested_virtualization_halves_the_range() {
        let pool = AsidPool::new(16, true);
        assert_eq!(pool.alloc().unwrap(), 8);
    }

    #[test]
    fn exhaustion_reports_insufficient_resources() {
        // Only ASIDs 2 and 3 exist.
        let pool = AsidPool::new(4, false);
        assert_eq!(pool.alloc().unwrap(), 2);
        assert_eq!(pool.alloc().unwrap(), 3);
        assert_eq!(pool.alloc(), Err(HvError::InsufficientResources));
        pool.free(3);
        assert_eq!(pool.alloc().unwrap(), 3);
        assert_eq!(pool.allocated_count(), 2);
    }
}
