//! The module containing the reverse-mapping table (RMT).
//!
//! The RMT is the sidecar of the nested page tables: one 16-byte record per
//! host physical frame naming its current owner (the hypervisor itself, the
//! subverted host, an ordinary guest, or a secure guest), the owning address
//! space, and the guest frame it backs. Every page-ownership change goes
//! through the RMT first; the nested paging permissions are then recomputed
//! from it. Only RAM actually present is described: a directory of
//! contiguous sub-tables covers the platform's physical memory ranges.

use crate::{
    asid::HOST_ASID,
    error::{HvError, Result},
    platform::pa_of,
};
use alloc::{boxed::Box, vec::Vec};
use bitfield::bitfield;
use core::ops::Range;
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use x86::current::paging::BASE_PAGE_SHIFT;

/// The owner of one host physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageOwnership {
    /// Hypervisor-private. Never visible to any guest and never
    /// reassignable from the hypercall surface.
    Noirvisor = 0,
    /// The subverted host, ie, ordinary system memory.
    SubvertedHost = 1,
    /// A customizable guest without confidentiality.
    InsecureGuest = 2,
    /// A confidential (NSV) guest; contents are sealed from the host.
    SecureGuest = 3,
}

impl PageOwnership {
    fn from_raw(raw: u64) -> Self {
        match raw & 3 {
            0 => Self::Noirvisor,
            1 => Self::SubvertedHost,
            2 => Self::InsecureGuest,
            _ => Self::SecureGuest,
        }
    }
}

bitfield! {
    #[derive(Clone, Copy, Default)]
    struct RmtEntryLow(u64);
    impl Debug;
    ownership_raw, set_ownership_raw: 7, 0;
    shared_bit, set_shared_bit: 8;
    asid_field, set_asid_field: 63, 32;
}

bitfield! {
    #[derive(Clone, Copy, Default)]
    struct RmtEntryHigh(u64);
    impl Debug;
    guest_pfn_field, set_guest_pfn_field: 51, 0;
}

/// One reverse-mapping record.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RmtEntry {
    low: RmtEntryLow,
    high: RmtEntryHigh,
}
const _: () = assert!(core::mem::size_of::<RmtEntry>() == 16);

impl RmtEntry {
    /// The frame's current owner.
    pub fn ownership(&self) -> PageOwnership {
        PageOwnership::from_raw(self.low.ownership_raw())
    }

    /// The owning address space; 0 for hypervisor pages, 1 for the host.
    pub fn asid(&self) -> u32 {
        self.low.asid_field() as u32
    }

    /// The frame is shared between its owner and the host.
    pub fn shared(&self) -> bool {
        self.low.shared_bit()
    }

    /// The guest page frame this host frame backs.
    pub fn guest_pfn(&self) -> u64 {
        self.high.guest_pfn_field()
    }

    fn assign(&mut self, gpa: u64, asid: u32, shared: bool, ownership: PageOwnership) {
        self.low.set_ownership_raw(ownership as u64);
        self.low.set_shared_bit(shared);
        self.low.set_asid_field(u64::from(asid));
        self.high.set_guest_pfn_field(gpa >> BASE_PAGE_SHIFT);
    }
}

/// A page worth of reverse-mapping records; sub-tables are allocated in
/// page units so they can themselves be protected in the nested paging.
#[derive(Clone, Copy)]
#[repr(C, align(4096))]
struct RmtPage([RmtEntry; ENTRIES_PER_PAGE]);
const ENTRIES_PER_PAGE: usize = 0x1000 / core::mem::size_of::<RmtEntry>();

/// One contiguous sub-table of the directory.
struct RmtRegion {
    /// The host physical range covered, page aligned.
    hpa: Range<u64>,
    pages: Box<[RmtPage]>,
}

impl RmtRegion {
    fn entry(&self, hpa: u64) -> &RmtEntry {
        let index = ((hpa - self.hpa.start) >> BASE_PAGE_SHIFT) as usize;
        &self.pages[index / ENTRIES_PER_PAGE].0[index % ENTRIES_PER_PAGE]
    }

    fn entry_mut(&mut self, hpa: u64) -> &mut RmtEntry {
        let index = ((hpa - self.hpa.start) >> BASE_PAGE_SHIFT) as usize;
        &mut self.pages[index / ENTRIES_PER_PAGE].0[index % ENTRIES_PER_PAGE]
    }
}

/// The directory of reverse-mapping sub-tables.
pub struct RmtTables {
    regions: Vec<RmtRegion>,
}

impl RmtTables {
    /// Looks up the record of the frame containing `hpa`.
    pub fn entry(&self, hpa: u64) -> Option<&RmtEntry> {
        self.regions
            .iter()
            .find(|region| region.hpa.contains(&hpa))
            .map(|region| region.entry(hpa))
    }

    fn entry_mut(&mut self, hpa: u64) -> Option<&mut RmtEntry> {
        self.regions
            .iter_mut()
            .find(|region| region.hpa.contains(&hpa))
            .map(|region| region.entry_mut(hpa))
    }

    /// Updates the record of the frame containing `hpa`. The update is a
    /// single store of both words, so it is atomic with respect to the
    /// VMMCALL visibility window that invoked it.
    pub fn configure(
        &mut self,
        hpa: u64,
        gpa: u64,
        asid: u32,
        shared: bool,
        ownership: PageOwnership,
    ) -> Result<()> {
        self.entry_mut(hpa)
            .ok_or(HvError::InvalidParameter)?
            .assign(gpa, asid, shared, ownership);
        Ok(())
    }

    /// Checks whether a requested reassignment is legal before any record is
    /// touched. Illegal requests: frames not described by the directory,
    /// unaligned addresses, frames owned by the hypervisor (those never
    /// change hands from the hypercall surface), and an ASID that does not
    /// fit the new ownership class. Moving a frame *away* from a secure
    /// guest is legal — the crypto stage seals its contents first.
    pub fn validate_reassignment(
        &self,
        hpa_list: &[u64],
        gpa_list: &[u64],
        asid: u32,
        ownership: PageOwnership,
    ) -> bool {
        if hpa_list.len() != gpa_list.len() {
            return false;
        }
        let asid_fits = match ownership {
            PageOwnership::Noirvisor => asid == 0,
            PageOwnership::SubvertedHost => asid == HOST_ASID,
            PageOwnership::InsecureGuest | PageOwnership::SecureGuest => asid > HOST_ASID,
        };
        if !asid_fits {
            return false;
        }
        for (&hpa, &gpa) in hpa_list.iter().zip(gpa_list) {
            if (hpa & 0xfff) != 0 || (gpa & 0xfff) != 0 {
                return false;
            }
            match self.entry(hpa) {
                None => return false,
                Some(entry) if entry.ownership() == PageOwnership::Noirvisor => return false,
                Some(_) => (),
            }
        }
        true
    }

    /// Collects every (hpa, gpa) pair currently owned by `asid`. Used when a
    /// whole guest's memory changes hands, eg, on confidential-VM teardown.
    pub fn pages_owned_by(&self, asid: u32) -> Vec<(u64, u64)> {
        let mut pages = Vec::new();
        for region in &self.regions {
            let mut hpa = region.hpa.start;
            while hpa < region.hpa.end {
                let entry = region.entry(hpa);
                if entry.asid() == asid {
                    pages.push((hpa, entry.guest_pfn() << BASE_PAGE_SHIFT));
                }
                hpa += 0x1000;
            }
        }
        pages
    }

    /// Physical addresses of the sub-table pages themselves, for protection
    /// behind the nested paging.
    pub fn table_pages(&self) -> Vec<u64> {
        let mut pages = Vec::new();
        for region in &self.regions {
            for page in region.pages.iter() {
                pages.push(pa_of(page));
            }
        }
        pages
    }
}

/// The reverse-mapping table behind its pushlock.
pub struct ReverseMap {
    tables: RwLock<RmtTables>,
}

impl ReverseMap {
    /// Builds the directory for the given present-RAM ranges. Every
    /// described frame starts out owned by the subverted host under an
    /// identity guest mapping.
    pub fn new(memory_ranges: &[Range<u64>]) -> Self {
        let mut regions = Vec::with_capacity(memory_ranges.len());
        for range in memory_ranges {
            let start = range.start & !0xfff;
            let end = (range.end + 0xfff) & !0xfff;
            let frames = ((end - start) >> BASE_PAGE_SHIFT) as usize;
            let page_count = frames.div_ceil(ENTRIES_PER_PAGE);
            // Safety: `RmtPage` is plain integers; all-zero is a valid value.
            let mut pages =
                unsafe { Box::<[RmtPage]>::new_zeroed_slice(page_count).assume_init() };
            for (index, page) in pages.iter_mut().enumerate() {
                for (slot, entry) in page.0.iter_mut().enumerate() {
                    let hpa = start + (((index * ENTRIES_PER_PAGE) + slot) << BASE_PAGE_SHIFT) as u64;
                    entry.assign(hpa, HOST_ASID, false, PageOwnership::SubvertedHost);
                }
            }
            regions.push(RmtRegion {
                hpa: start..end,
                pages,
            });
        }
        Self {
            tables: RwLock::new(RmtTables { regions }),
        }
    }

    /// Acquires the pushlock shared, for lookups.
    pub fn read(&self) -> RwLockReadGuard<'_, RmtTables> {
        self.tables.read()
    }

    /// Acquires the pushlock exclusive, for reassignment. When the NPT lock
    /// is also needed, it must be taken before this one.
    pub fn write(&self) -> RwLockWriteGuard<'_, RmtTables> {
        self.tables.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn small_map() -> ReverseMap {
        ReverseMap::new(&[0..0x10_0000, 0x100000000..0x100100000])
    }

    #[test]
    fn defaults_to_subverted_host_identity() {
        let map = small_map();
        let tables = map.read();
        let entry = tables.entry(0x3000).unwrap();
        assert_eq!(entry.ownership(), PageOwnership::SubvertedHost);
        assert_eq!(entry.asid(), HOST_ASID);
        assert_eq!(entry.guest_pfn(), 3);
        // Above 4GB, covered by the second region.
        assert_eq!(tables.entry(0x100000000).unwrap().guest_pfn(), 0x100000);
        // A hole between the regions is not described.
        assert!(tables.entry(0x2000_0000).is_none());
    }

    #[test]
    fn configure_and_query() {
        let map = small_map();
        let mut tables = map.write();
        tables
            .configure(0x5000, 0x12000, 9, false, PageOwnership::SecureGuest)
            .unwrap();
        let entry = tables.entry(0x5000).unwrap();
        assert_eq!(entry.ownership(), PageOwnership::SecureGuest);
        assert_eq!(entry.asid(), 9);
        assert_eq!(entry.guest_pfn(), 0x12);
        assert!(!entry.shared());
        assert_eq!(tables.pages_owned_by(9), vec![(0x5000, 0x12000)]);
    }

    #[test]
    fn reassignment_validation() {
        let map = small_map();
        let mut tables = map.write();
        // Ordinary host pages can move to a guest.
        assert!(tables.validate_reassignment(
            &[0x5000, 0x6000],
            &[0x0, 0x1000],
            9,
            PageOwnership::SecureGuest
        ));
        // Unknown frames cannot.
        assert!(!tables.validate_reassignment(
            &[0x2000_0000],
            &[0x0],
            9,
            PageOwnership::InsecureGuest
        ));
        // Hypervisor frames never change hands.
        tables
            .configure(0x7000, 0x7000, 0, true, PageOwnership::Noirvisor)
            .unwrap();
        assert!(!tables.validate_reassignment(
            &[0x7000],
            &[0x0],
            9,
            PageOwnership::InsecureGuest
        ));
        // The ASID must fit the new ownership class.
        assert!(!tables.validate_reassignment(
            &[0x5000],
            &[0x0],
            HOST_ASID,
            PageOwnership::SecureGuest
        ));
        assert!(tables.validate_reassignment(
            &[0x5000],
            &[0x0],
            HOST_ASID,
            PageOwnership::SubvertedHost
        ));
        // Reclaiming a secure guest's page for the host is legal; the
        // crypto stage seals the contents before the move.
        tables
            .configure(0x8000, 0x0, 9, false, PageOwnership::SecureGuest)
            .unwrap();
        assert!(tables.validate_reassignment(
            &[0x8000],
            &[0x0],
            HOST_ASID,
            PageOwnership::SubvertedHost
        ));
    }

    #[test]
    fn table_pages_are_page_aligned() {
        let map = small_map();
        for pa in map.read().table_pages() {
            assert_eq!(pa & 0xfff, 0);
        }
    }
}
