//! The module containing the [`NptManager`] type, the per-address-space
//! nested page table.
//!
//! Two flavors share one type. The *identity* manager backs the subverted
//! host: the whole 48-bit space is pre-mapped HPA==GPA with 1GB pages whose
//! memory types are derived from the MTRRs, and entries are split on demand
//! when a single page needs distinct permissions (hypervisor-page
//! protection, ownership changes). The *sparse* manager backs a
//! customizable VM's mapping: it starts empty and grows as the layered
//! hypervisor installs translations.
//!
//! Split sub-tables are recorded in arenas with a sorted range index keyed
//! by the guest-physical start of the region each table covers.

use crate::{
    asid::ASID_NONE,
    error::{HvError, Result},
    mtrr::{self, MtrrState},
    platform::pa_of,
};
use alloc::{boxed::Box, vec::Vec};
use bitfield::bitfield;
use x86::current::paging::BASE_PAGE_SHIFT;

/// Bytes covered by one PDE (a large page).
pub const SIZE_2M: u64 = 1 << 21;
/// Bytes covered by one PDPTE (a huge page).
pub const SIZE_1G: u64 = 1 << 30;
/// Bytes covered by one PML4E.
pub const SIZE_512G: u64 = 1 << 39;

bitfield! {
    /// A nested paging entry at any level. SVM nested entries use the
    /// ordinary long-mode layout; the `user` bit must be set on every level
    /// because guest accesses are treated as user-mode accesses.
    ///
    /// See: 15.25.5 Nested Table Walk
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct NptEntry(u64);
    impl Debug;
    /// The translation is valid (and readable).
    pub present, set_present: 0;
    /// Writes are permitted.
    pub write, set_write: 1;
    /// User-mode accesses are permitted. Always set for live entries.
    pub user, set_user: 2;
    /// PAT index bit 0.
    pub pwt, set_pwt: 3;
    /// PAT index bit 1.
    pub pcd, set_pcd: 4;
    /// The entry has been used for a translation.
    pub accessed, set_accessed: 5;
    /// The entry has been used for a write.
    pub dirty, set_dirty: 6;
    /// This PDPTE/PDE maps a huge/large page instead of pointing to a
    /// lower table.
    pub huge, set_huge: 7;
    /// PAT index bit 2 of a 4KB PTE. Shares the bit with [`Self::huge`],
    /// which does not exist at PTE level.
    pub pat_small, set_pat_small: 7;
    /// Software: the memory type came from a variable MTRR, so later
    /// overlapping variable MTRRs merge instead of overriding.
    pub var_mtrr, set_var_mtrr: 9;
    /// PAT index bit 2 of a large or huge entry.
    pub pat_large, set_pat_large: 12;
    /// The mapped frame, or the next-level table.
    pub pfn, set_pfn: 51, 12;
    /// Instruction fetches are forbidden.
    pub no_execute, set_no_execute: 63;
}

impl NptEntry {
    /// The physical address this entry maps or points at.
    pub fn base(&self) -> u64 {
        self.pfn() << BASE_PAGE_SHIFT
    }

    /// Sets the physical address this entry maps or points at. Huge and
    /// large mappings pass a suitably aligned address.
    pub fn set_base(&mut self, pa: u64) {
        self.set_pfn(pa >> BASE_PAGE_SHIFT);
    }

    fn set_permissions(&mut self, r: bool, w: bool, x: bool) {
        self.set_present(r);
        self.set_write(w);
        self.set_no_execute(!x);
    }

    fn set_pat_index(&mut self, index: u8, small: bool) {
        self.set_pwt((index & 1) != 0);
        self.set_pcd((index & 2) != 0);
        if small {
            self.set_pat_small((index & 4) != 0);
        } else {
            self.set_pat_large((index & 4) != 0);
        }
    }

    fn pat_index(&self, small: bool) -> u8 {
        let high = if small {
            self.pat_small()
        } else {
            self.pat_large()
        };
        (u8::from(self.pwt())) | (u8::from(self.pcd()) << 1) | (u8::from(high) << 2)
    }
}

/// A single nested paging table (512 entries, one page).
#[derive(Clone, Copy)]
#[repr(C, align(4096))]
pub struct NptTable {
    /// The 512 entries.
    pub entries: [NptEntry; 512],
}
const _: () = assert!(core::mem::size_of::<NptTable>() == 0x1000);

impl NptTable {
    fn boxed_zeroed() -> Box<Self> {
        // Safety: an all-zero table is valid (every entry non-present).
        unsafe { Box::<Self>::new_zeroed().assume_init() }
    }
}

/// The contiguous block of 512 PDPT pages backing the identity map.
type PdptBlock = [NptTable; 512];

/// One split sub-table together with the guest-physical region it covers.
struct SubTable {
    table: Box<NptTable>,
    gpa_start: u64,
}

impl SubTable {
    fn pa(&self) -> u64 {
        pa_of(&*self.table)
    }
}

/// An arena of split sub-tables with a sorted range index. Each table in
/// one arena covers `span` bytes of guest-physical space.
struct SubTableArena {
    span: u64,
    tables: Vec<SubTable>,
}

impl SubTableArena {
    fn new(span: u64) -> Self {
        Self {
            span,
            tables: Vec::new(),
        }
    }

    /// Index of the table covering `gpa`, if one has been split off.
    fn find(&self, gpa: u64) -> Option<usize> {
        self.tables
            .binary_search_by(|sub| {
                if gpa < sub.gpa_start {
                    core::cmp::Ordering::Greater
                } else if gpa >= sub.gpa_start + self.span {
                    core::cmp::Ordering::Less
                } else {
                    core::cmp::Ordering::Equal
                }
            })
            .ok()
    }

    fn insert(&mut self, sub: SubTable) -> usize {
        let position = self
            .tables
            .partition_point(|existing| existing.gpa_start < sub.gpa_start);
        self.tables.insert(position, sub);
        position
    }
}

/// Attributes of one guest mapping installed by the layered hypervisor.
#[derive(Debug, Clone, Copy)]
pub struct MappingAttributes {
    /// The translation is valid.
    pub present: bool,
    /// Writes are permitted.
    pub write: bool,
    /// Instruction fetches are permitted.
    pub execute: bool,
    /// User-mode accesses are permitted.
    pub user: bool,
    /// The memory type (architectural encoding).
    pub caching: u8,
    /// Page size class: 0 for 4KB. Larger classes are not implemented.
    pub page_size: u32,
}

/// The outcome of a split request: the arena index of the covering table,
/// its own physical address, and whether this call created it.
pub(crate) struct Split {
    pub index: usize,
    pub pa: u64,
    pub created: bool,
}

/// A four-level nested page table and the arenas of its split sub-tables.
pub struct NptManager {
    ncr3: Box<NptTable>,
    /// Present only on the identity flavor.
    pdpt: Option<Box<PdptBlock>>,
    /// Sparse-flavor PDPT pages, each covering 512GB.
    pdpte_tables: SubTableArena,
    /// Split PDE tables, each covering 1GB.
    pde_tables: SubTableArena,
    /// Split PTE tables, each covering 2MB.
    pte_tables: SubTableArena,
    /// The TLB tag of this address space; [`ASID_NONE`] until allocated.
    pub asid: u32,
    host_pat: u64,
}

impl NptManager {
    /// Creates an empty address space for a customizable VM. Translations
    /// are installed later through [`Self::map_4k`].
    pub fn new_sparse(host_pat: u64) -> Self {
        Self {
            ncr3: NptTable::boxed_zeroed(),
            pdpt: None,
            pdpte_tables: SubTableArena::new(SIZE_512G),
            pde_tables: SubTableArena::new(SIZE_1G),
            pte_tables: SubTableArena::new(SIZE_2M),
            asid: ASID_NONE,
            host_pat,
        }
    }

    /// Builds the identity map for the subverted host: the NCR3 page plus a
    /// single 2MB block holding 512 PDPT pages, every entry a huge RWX page
    /// with the MTRR-default memory type, then overridden per the fixed and
    /// variable MTRRs.
    pub fn new_identity(mtrrs: &MtrrState, host_pat: u64) -> Result<Self> {
        let default_index =
            mtrr::pat_index_for(host_pat, mtrrs.default_type).ok_or(HvError::InvalidParameter)?;
        let mut ncr3 = NptTable::boxed_zeroed();
        // Safety: an all-zero block is valid (every entry non-present).
        let mut pdpt = unsafe { Box::<PdptBlock>::new_zeroed().assume_init() };
        let pdpt_base = pa_of(&*pdpt);
        for (i, page) in pdpt.iter_mut().enumerate() {
            for (j, entry) in page.entries.iter_mut().enumerate() {
                let k = ((i << 9) + j) as u64;
                entry.set_permissions(true, true, true);
                entry.set_user(true);
                entry.set_huge(true);
                entry.set_base(k * SIZE_1G);
                entry.set_pat_index(default_index, false);
            }
            let pml4e = &mut ncr3.entries[i];
            pml4e.set_permissions(true, true, true);
            pml4e.set_user(true);
            pml4e.set_base(pdpt_base + (i << BASE_PAGE_SHIFT) as u64);
        }
        let mut npt = Self {
            ncr3,
            pdpt: Some(pdpt),
            pdpte_tables: SubTableArena::new(SIZE_512G),
            pde_tables: SubTableArena::new(SIZE_1G),
            pte_tables: SubTableArena::new(SIZE_2M),
            asid: ASID_NONE,
            host_pat,
        };
        npt.apply_mtrr_typing(mtrrs)?;
        Ok(npt)
    }

    /// The physical address to program into the VMCB's NCR3 field.
    pub fn ncr3_pa(&self) -> u64 {
        pa_of(&*self.ncr3)
    }

    fn pdpte_entry(&self, gpa: u64) -> Option<NptEntry> {
        if let Some(pdpt) = &self.pdpt {
            let index = (gpa / SIZE_1G) as usize;
            (index < 512 * 512).then(|| pdpt[index >> 9].entries[index & 0x1ff])
        } else {
            let table = self.pdpte_tables.find(gpa)?;
            let index = ((gpa / SIZE_1G) & 0x1ff) as usize;
            Some(self.pdpte_tables.tables[table].table.entries[index])
        }
    }

    fn with_pdpte_entry(&mut self, gpa: u64, update: impl FnOnce(&mut NptEntry)) -> Result<()> {
        if let Some(pdpt) = &mut self.pdpt {
            let index = (gpa / SIZE_1G) as usize;
            if index >= 512 * 512 {
                return Err(HvError::InvalidParameter);
            }
            update(&mut pdpt[index >> 9].entries[index & 0x1ff]);
            Ok(())
        } else {
            let table = self
                .pdpte_tables
                .find(gpa)
                .ok_or(HvError::GuestPageAbsent)?;
            let index = ((gpa / SIZE_1G) & 0x1ff) as usize;
            update(&mut self.pdpte_tables.tables[table].table.entries[index]);
            Ok(())
        }
    }

    /// Ensures a PDPT page covering `gpa` exists on the sparse flavor and
    /// is wired into the PML4.
    fn ensure_pdpte_table(&mut self, gpa: u64) -> usize {
        if let Some(index) = self.pdpte_tables.find(gpa) {
            return index;
        }
        let sub = SubTable {
            table: NptTable::boxed_zeroed(),
            gpa_start: gpa & !(SIZE_512G - 1),
        };
        let pa = sub.pa();
        let pml4e = &mut self.ncr3.entries[((gpa / SIZE_512G) & 0x1ff) as usize];
        pml4e.set_permissions(true, true, true);
        pml4e.set_user(true);
        pml4e.set_base(pa);
        self.pdpte_tables.insert(sub)
    }

    /// Locates or creates the PDE table covering `gpa`'s 1GB region.
    ///
    /// On creation, every child entry is preseeded as a 2MB large page
    /// carved out of the parent huge PDPTE, so the split is
    /// translation-neutral. With `update_upper`, the parent PDPTE is
    /// re-pointed at the child table. Splitting is idempotent.
    pub(crate) fn split_pdpte(
        &mut self,
        gpa: u64,
        update_upper: bool,
        alloc: bool,
    ) -> Result<Option<Split>> {
        let found = self.pde_tables.find(gpa);
        let (index, created) = match found {
            Some(index) => (index, false),
            None => {
                if !alloc {
                    return Ok(None);
                }
                let parent = self.pdpte_entry(gpa);
                let mut table = NptTable::boxed_zeroed();
                let gpa_start = gpa & !(SIZE_1G - 1);
                if let Some(parent) = parent.filter(|e| e.present() && e.huge()) {
                    for (i, child) in table.entries.iter_mut().enumerate() {
                        child.set_permissions(parent.present(), parent.write(), !parent.no_execute());
                        child.set_user(parent.user());
                        child.set_huge(true);
                        child.set_base(parent.base() + i as u64 * SIZE_2M);
                        child.set_pat_index(parent.pat_index(false), false);
                        child.set_var_mtrr(parent.var_mtrr());
                    }
                }
                let index = self.pde_tables.insert(SubTable { table, gpa_start });
                (index, true)
            }
        };
        let pa = self.pde_tables.tables[index].pa();
        if update_upper {
            self.with_pdpte_entry(gpa, |entry| {
                entry.set_huge(false);
                entry.set_base(pa);
            })?;
        }
        Ok(Some(Split { index, pa, created }))
    }

    /// Locates or creates the PTE table covering `gpa`'s 2MB region, the
    /// symmetric counterpart of [`Self::split_pdpte`].
    pub(crate) fn split_pde(
        &mut self,
        gpa: u64,
        update_upper: bool,
        alloc: bool,
    ) -> Result<Option<Split>> {
        let found = self.pte_tables.find(gpa);
        let (index, created) = match found {
            Some(index) => (index, false),
            None => {
                if !alloc {
                    return Ok(None);
                }
                // The PDE level must be described before it can be split.
                let Some(upper) = self.split_pdpte(gpa, update_upper, alloc)? else {
                    return Ok(None);
                };
                let pde_index = ((gpa / SIZE_2M) & 0x1ff) as usize;
                let parent = self.pde_tables.tables[upper.index].table.entries[pde_index];
                let mut table = NptTable::boxed_zeroed();
                let gpa_start = gpa & !(SIZE_2M - 1);
                if parent.present() && parent.huge() {
                    for (i, child) in table.entries.iter_mut().enumerate() {
                        child.set_permissions(parent.present(), parent.write(), !parent.no_execute());
                        child.set_user(parent.user());
                        child.set_base(parent.base() + ((i as u64) << BASE_PAGE_SHIFT));
                        child.set_pat_index(parent.pat_index(false), true);
                        child.set_var_mtrr(parent.var_mtrr());
                    }
                }
                let index = self.pte_tables.insert(SubTable { table, gpa_start });
                (index, true)
            }
        };
        let pa = self.pte_tables.tables[index].pa();
        if update_upper {
            let upper = self
                .split_pdpte(gpa, update_upper, true)?
                .ok_or(HvError::GuestPageAbsent)?;
            let pde_index = ((gpa / SIZE_2M) & 0x1ff) as usize;
            let entry = &mut self.pde_tables.tables[upper.index].table.entries[pde_index];
            entry.set_huge(false);
            entry.set_base(pa);
        }
        Ok(Some(Split { index, pa, created }))
    }

    /// Updates the 4KB translation of `gpa`, splitting upper levels as
    /// needed. `pat_index` of [`None`] leaves the memory type alone.
    pub(crate) fn update_pte(
        &mut self,
        hpa: u64,
        gpa: u64,
        r: bool,
        w: bool,
        x: bool,
        pat_index: Option<u8>,
        alloc: bool,
    ) -> Result<()> {
        let split = self
            .split_pde(gpa, true, alloc)?
            .ok_or(HvError::InsufficientResources)?;
        let entry =
            &mut self.pte_tables.tables[split.index].table.entries[Self::pte_index(gpa)];
        entry.set_permissions(r, w, x);
        entry.set_user(true);
        entry.set_base(hpa);
        if let Some(index) = pat_index {
            entry.set_pat_index(index, true);
        }
        Ok(())
    }

    fn pde_index(gpa: u64) -> usize {
        ((gpa / SIZE_2M) & 0x1ff) as usize
    }

    fn pte_index(gpa: u64) -> usize {
        ((gpa >> BASE_PAGE_SHIFT) & 0x1ff) as usize
    }

    /// Installs one 4KB guest translation on the sparse flavor, creating
    /// and wiring intermediate tables as needed.
    pub fn map_4k(&mut self, gpa: u64, hpa: u64, attributes: MappingAttributes) -> Result<()> {
        if attributes.page_size != 0 {
            return Err(HvError::NotImplemented);
        }
        let pat_index = mtrr::pat_index_for(self.host_pat, attributes.caching)
            .ok_or(HvError::InvalidParameter)?;
        if self.pdpt.is_none() {
            let _ = self.ensure_pdpte_table(gpa);
        }
        let split = self
            .split_pde(gpa, true, true)?
            .ok_or(HvError::InsufficientResources)?;
        // Freshly created intermediate entries carry pointer permissions;
        // the leaf carries the policy.
        self.with_pdpte_entry(gpa, |entry| {
            if !entry.present() {
                entry.set_permissions(true, true, true);
                entry.set_user(true);
            }
        })?;
        let pde_split = self
            .split_pdpte(gpa, true, true)?
            .ok_or(HvError::InsufficientResources)?;
        let pde = &mut self.pde_tables.tables[pde_split.index].table.entries[Self::pde_index(gpa)];
        if !pde.present() {
            pde.set_permissions(true, true, true);
            pde.set_user(true);
        }
        let entry =
            &mut self.pte_tables.tables[split.index].table.entries[Self::pte_index(gpa)];
        entry.0 = 0;
        entry.set_permissions(attributes.present, attributes.write, attributes.execute);
        entry.set_user(attributes.user);
        entry.set_base(hpa);
        entry.set_pat_index(pat_index, true);
        Ok(())
    }

    /// Reports the accessed and dirty bits of the live entry translating
    /// `gpa`, or [`None`] when no translation exists.
    pub fn accessed_dirty(&self, gpa: u64) -> Option<(bool, bool)> {
        let pml4e = if self.pdpt.is_some() {
            // The identity PML4 is fully populated.
            NptEntry(1)
        } else {
            let index = ((gpa / SIZE_512G) & 0x1ff) as usize;
            self.ncr3.entries[index]
        };
        if !pml4e.present() {
            return None;
        }
        let pdpte = self.pdpte_entry(gpa)?;
        if !pdpte.present() {
            return None;
        }
        if pdpte.huge() {
            return Some((pdpte.accessed(), pdpte.dirty()));
        }
        let pde_table = self.pde_tables.find(gpa)?;
        let pde = self.pde_tables.tables[pde_table].table.entries[Self::pde_index(gpa)];
        if !pde.present() {
            return None;
        }
        if pde.huge() {
            return Some((pde.accessed(), pde.dirty()));
        }
        let pte_table = self.pte_tables.find(gpa)?;
        let pte = self.pte_tables.tables[pte_table].table.entries[Self::pte_index(gpa)];
        pte.present().then(|| (pte.accessed(), pte.dirty()))
    }

    /// Clears the accessed and dirty bits of the live entry translating
    /// `gpa`. Returns false when no translation exists.
    pub fn clear_accessed_dirty(&mut self, gpa: u64) -> bool {
        if self.accessed_dirty(gpa).is_none() {
            return false;
        }
        let clear = |entry: &mut NptEntry| {
            entry.set_accessed(false);
            entry.set_dirty(false);
        };
        let pdpte = self.pdpte_entry(gpa).unwrap();
        if pdpte.huge() {
            let _ = self.with_pdpte_entry(gpa, clear);
            return true;
        }
        let pde_table = self.pde_tables.find(gpa).unwrap();
        let pde = &mut self.pde_tables.tables[pde_table].table.entries[Self::pde_index(gpa)];
        if pde.huge() {
            clear(pde);
            return true;
        }
        let pte_table = self.pte_tables.find(gpa).unwrap();
        clear(&mut self.pte_tables.tables[pte_table].table.entries[Self::pte_index(gpa)]);
        true
    }

    /// The effective memory type of `gpa` per the live entry, for
    /// diagnostics and tests.
    pub(crate) fn memory_type_at(&self, gpa: u64) -> Option<u8> {
        let pdpte = self.pdpte_entry(gpa)?;
        if !pdpte.present() {
            return None;
        }
        if pdpte.huge() {
            return Some(mtrr::pat_type_of(self.host_pat, pdpte.pat_index(false)));
        }
        let pde_table = self.pde_tables.find(gpa)?;
        let pde = self.pde_tables.tables[pde_table].table.entries[Self::pde_index(gpa)];
        if pde.huge() {
            return Some(mtrr::pat_type_of(self.host_pat, pde.pat_index(false)));
        }
        let pte_table = self.pte_tables.find(gpa)?;
        let pte = self.pte_tables.tables[pte_table].table.entries[Self::pte_index(gpa)];
        pte.present()
            .then(|| mtrr::pat_type_of(self.host_pat, pte.pat_index(true)))
    }

    /// Overrides the identity map's memory types per the captured MTRRs:
    /// variable ranges first with overlap merging, then the fixed ranges
    /// over the first megabyte, which win outright.
    fn apply_mtrr_typing(&mut self, mtrrs: &MtrrState) -> Result<()> {
        if !mtrrs.enabled {
            return Ok(());
        }
        for range in mtrrs.variable.clone() {
            if range.mem_type != mtrrs.default_type {
                self.type_range(range.base, range.length, range.mem_type, false)?;
            }
        }
        for page in 0..256u64 {
            let gpa = page << BASE_PAGE_SHIFT;
            if let Some(fixed_type) = mtrrs.fixed_type_at(gpa) {
                self.type_range(gpa, 0x1000, fixed_type, true)?;
            }
        }
        Ok(())
    }

    /// Applies `mem_type` to [base, base+length), splitting as dictated by
    /// alignment: whole 1GB entries where possible, else 2MB, else 4KB.
    fn type_range(&mut self, base: u64, length: u64, mem_type: u8, force: bool) -> Result<()> {
        let mut gpa = base;
        let end = base + length;
        while gpa < end {
            if (gpa & (SIZE_1G - 1)) == 0 && end - gpa >= SIZE_1G {
                self.type_1g(gpa, mem_type, force)?;
                gpa += SIZE_1G;
            } else if (gpa & (SIZE_2M - 1)) == 0 && end - gpa >= SIZE_2M {
                self.type_2m(gpa, mem_type, force)?;
                gpa += SIZE_2M;
            } else {
                self.type_4k(gpa, mem_type, force)?;
                gpa += 0x1000;
            }
        }
        Ok(())
    }

    fn retype(&self, entry: &mut NptEntry, small: bool, mem_type: u8, force: bool) -> Result<()> {
        let merged = if entry.var_mtrr() {
            mtrr::merge_types(
                mtrr::pat_type_of(self.host_pat, entry.pat_index(small)),
                mem_type,
                force,
            )
        } else {
            mem_type
        };
        let index = mtrr::pat_index_for(self.host_pat, merged).ok_or(HvError::InvalidParameter)?;
        entry.set_pat_index(index, small);
        entry.set_var_mtrr(true);
        Ok(())
    }

    fn type_1g(&mut self, gpa: u64, mem_type: u8, force: bool) -> Result<()> {
        let pdpte = self.pdpte_entry(gpa).ok_or(HvError::GuestPageAbsent)?;
        if pdpte.huge() {
            let mut updated = pdpte;
            self.retype(&mut updated, false, mem_type, force)?;
            self.with_pdpte_entry(gpa, |entry| *entry = updated)
        } else {
            // Already split; apply at the finer granularities underneath.
            for half in 0..(SIZE_1G / SIZE_2M) {
                self.type_2m(gpa + half * SIZE_2M, mem_type, force)?;
            }
            Ok(())
        }
    }

    fn type_2m(&mut self, gpa: u64, mem_type: u8, force: bool) -> Result<()> {
        let split = self
            .split_pdpte(gpa, true, true)?
            .ok_or(HvError::InsufficientResources)?;
        let pde = self.pde_tables.tables[split.index].table.entries[Self::pde_index(gpa)];
        if pde.huge() {
            let mut updated = pde;
            self.retype(&mut updated, false, mem_type, force)?;
            self.pde_tables.tables[split.index].table.entries[Self::pde_index(gpa)] = updated;
            Ok(())
        } else {
            for page in 0..(SIZE_2M / 0x1000) {
                self.type_4k(gpa + page * 0x1000, mem_type, force)?;
            }
            Ok(())
        }
    }

    fn type_4k(&mut self, gpa: u64, mem_type: u8, force: bool) -> Result<()> {
        let split = self
            .split_pde(gpa, true, true)?
            .ok_or(HvError::InsufficientResources)?;
        let mut updated = self.pte_tables.tables[split.index].table.entries[Self::pte_index(gpa)];
        self.retype(&mut updated, true, mem_type, force)?;
        self.pte_tables.tables[split.index].table.entries[Self::pte_index(gpa)] = updated;
        Ok(())
    }

    /// Physical addresses of every page this manager itself occupies: the
    /// NCR3, the identity PDPT block, and every split sub-table. All of
    /// them belong to the hypervisor in the reverse map and are hidden
    /// behind the blank page.
    pub fn table_pages(&self) -> Vec<u64> {
        let mut pages = Vec::new();
        pages.push(self.ncr3_pa());
        if let Some(pdpt) = &self.pdpt {
            let base = pa_of(&**pdpt);
            for i in 0..512u64 {
                pages.push(base + (i << BASE_PAGE_SHIFT));
            }
        }
        for sub in self
            .pdpte_tables
            .tables
            .iter()
            .chain(&self.pde_tables.tables)
            .chain(&self.pte_tables.tables)
        {
            pages.push(sub.pa());
        }
        pages
    }

    /// Recomputes the host-visible permissions of a 4KB frame from its
    /// reverse-map row: hypervisor pages read-only, secure-guest pages
    /// unreachable, everything else fully accessible.
    pub(crate) fn remap_by_ownership(
        &mut self,
        hpa: u64,
        ownership: crate::rmt::PageOwnership,
    ) -> Result<()> {
        use crate::rmt::PageOwnership;
        let split = self
            .split_pde(hpa, true, false)?
            .ok_or(HvError::Unsuccessful)?;
        let entry =
            &mut self.pte_tables.tables[split.index].table.entries[Self::pte_index(hpa)];
        match ownership {
            PageOwnership::Noirvisor => {
                entry.set_present(true);
                entry.set_write(false);
                entry.set_user(true);
            }
            PageOwnership::SecureGuest => {
                entry.set_present(false);
                entry.set_write(false);
                entry.set_user(false);
            }
            PageOwnership::SubvertedHost | PageOwnership::InsecureGuest => {
                entry.set_present(true);
                entry.set_write(true);
                entry.set_user(true);
            }
        }
        entry.set_no_execute(false);
        Ok(())
    }

    /// The live 4KB leaf translating `gpa`, if the region is split that
    /// far.
    pub(crate) fn pte_at(&self, gpa: u64) -> Option<NptEntry> {
        let table = self.pte_tables.find(gpa)?;
        Some(self.pte_tables.tables[table].table.entries[Self::pte_index(gpa)])
    }

    /// Number of split PTE tables. Diagnostics and tests.
    pub(crate) fn pte_table_count(&self) -> usize {
        self.pte_tables.tables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtrr::{mem_type, FixedTypes, MtrrState, VariableRange, RESET_PAT};
    use alloc::vec;

    fn wb_mtrrs() -> MtrrState {
        MtrrState {
            default_type: mem_type::WRITE_BACK,
            enabled: true,
            fixed_enabled: false,
            fixed: FixedTypes::default(),
            variable: vec![],
        }
    }

    #[test]
    fn identity_map_covers_with_huge_pages() {
        let npt = NptManager::new_identity(&wb_mtrrs(), RESET_PAT).unwrap();
        let entry = npt.pdpte_entry(0x4000_0000).unwrap();
        assert!(entry.present() && entry.write() && entry.huge());
        assert_eq!(entry.base(), 0x4000_0000);
        assert_eq!(
            npt.memory_type_at(0x4000_0000),
            Some(mem_type::WRITE_BACK)
        );
        assert_ne!(npt.ncr3_pa(), 0);
    }

    #[test]
    fn split_is_idempotent() {
        let mut npt = NptManager::new_identity(&wb_mtrrs(), RESET_PAT).unwrap();
        let first = npt.split_pdpte(0x1234_5678, true, true).unwrap().unwrap();
        assert!(first.created);
        let second = npt.split_pdpte(0x1234_5678, true, true).unwrap().unwrap();
        assert!(!second.created);
        assert_eq!(first.index, second.index);
        // The split preserved the identity translation.
        assert_eq!(
            npt.pde_tables.tables[first.index].table.entries[0].base(),
            0
        );
        assert!(npt.pde_tables.tables[first.index].table.entries[0].huge());
    }

    #[test]
    fn update_pte_restricts_one_page() {
        let mut npt = NptManager::new_identity(&wb_mtrrs(), RESET_PAT).unwrap();
        npt.update_pte(0xbeef_0000, 0x20_0000, true, false, true, None, true)
            .unwrap();
        let split = npt.split_pde(0x20_0000, false, false).unwrap().unwrap();
        let entry = npt.pte_tables.tables[split.index].table.entries[0];
        assert!(entry.present() && !entry.write());
        assert_eq!(entry.base(), 0xbeef_0000);
        // Its 2MB neighborhood still translates identity.
        let sibling = npt.pte_tables.tables[split.index].table.entries[1];
        assert_eq!(sibling.base(), 0x20_1000);
        assert!(sibling.write());
    }

    #[test]
    fn last_entry_of_existing_table_needs_no_split() {
        let mut npt = NptManager::new_identity(&wb_mtrrs(), RESET_PAT).unwrap();
        npt.update_pte(0x0, 0x20_0000, true, true, true, None, true)
            .unwrap();
        let tables_before = npt.pte_table_count();
        // The last 4KB entry of the same 2MB region.
        npt.update_pte(0x0, 0x3f_f000, true, true, true, None, true)
            .unwrap();
        assert_eq!(npt.pte_table_count(), tables_before);
    }

    #[test]
    fn variable_mtrr_straddling_a_boundary_types_both_halves() {
        let mut mtrrs = wb_mtrrs();
        // 2MB of UC straddling the 2MB boundary at 0x200000.
        mtrrs.variable = vec![VariableRange {
            base: 0x10_0000,
            length: 0x20_0000,
            mem_type: mem_type::UNCACHEABLE,
        }];
        let npt = NptManager::new_identity(&mtrrs, RESET_PAT).unwrap();
        assert_eq!(npt.memory_type_at(0x18_0000), Some(mem_type::UNCACHEABLE));
        assert_eq!(npt.memory_type_at(0x2f_f000), Some(mem_type::UNCACHEABLE));
        assert_eq!(npt.memory_type_at(0x30_0000), Some(mem_type::WRITE_BACK));
        assert_eq!(npt.memory_type_at(0x40_0000), Some(mem_type::WRITE_BACK));
    }

    #[test]
    fn overlapping_variable_mtrrs_merge_to_the_stronger_type() {
        let mut mtrrs = wb_mtrrs();
        mtrrs.variable = vec![
            VariableRange {
                base: 0x4000_0000,
                length: SIZE_1G,
                mem_type: mem_type::WRITE_THROUGH,
            },
            VariableRange {
                base: 0x4000_0000,
                length: SIZE_1G,
                mem_type: mem_type::UNCACHEABLE,
            },
        ];
        let npt = NptManager::new_identity(&mtrrs, RESET_PAT).unwrap();
        assert_eq!(
            npt.memory_type_at(0x4000_0000),
            Some(mem_type::UNCACHEABLE)
        );
        // The reverse order merges to the same type.
        mtrrs.variable.reverse();
        let npt = NptManager::new_identity(&mtrrs, RESET_PAT).unwrap();
        assert_eq!(
            npt.memory_type_at(0x4000_0000),
            Some(mem_type::UNCACHEABLE)
        );
    }

    #[test]
    fn sparse_mapping_and_accessed_bits() {
        let mut npt = NptManager::new_sparse(RESET_PAT);
        let attributes = MappingAttributes {
            present: true,
            write: true,
            execute: true,
            user: true,
            caching: mem_type::WRITE_BACK,
            page_size: 0,
        };
        npt.map_4k(0x1000, 0xcafe_d000, attributes).unwrap();
        assert_eq!(npt.accessed_dirty(0x1000), Some((false, false)));
        assert_eq!(npt.accessed_dirty(0x2000), None);
        assert!(npt.clear_accessed_dirty(0x1000));
        assert!(!npt.clear_accessed_dirty(0x5000));
        assert_eq!(npt.memory_type_at(0x1000), Some(mem_type::WRITE_BACK));
    }

    #[test]
    fn remap_by_ownership_grades_permissions() {
        use crate::rmt::PageOwnership;
        let mut npt = NptManager::new_identity(&wb_mtrrs(), RESET_PAT).unwrap();
        npt.update_pte(0x5000, 0x5000, true, true, true, None, true)
            .unwrap();
        npt.remap_by_ownership(0x5000, PageOwnership::SecureGuest)
            .unwrap();
        let split = npt.split_pde(0x5000, false, false).unwrap().unwrap();
        let entry = npt.pte_tables.tables[split.index].table.entries[5];
        assert!(!entry.present() && !entry.write() && !entry.user());

        npt.remap_by_ownership(0x5000, PageOwnership::Noirvisor)
            .unwrap();
        let entry = npt.pte_tables.tables[split.index].table.entries[5];
        assert!(entry.present() && !entry.write());

        npt.remap_by_ownership(0x5000, PageOwnership::SubvertedHost)
            .unwrap();
        let entry = npt.pte_tables.tables[split.index].table.entries[5];
        assert!(entry.present() && entry.write());
    }
}
