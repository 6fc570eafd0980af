//! The module containing the [`CustomVm`] type: the container of vCPU
//! slots, per-mapping nested page tables, and the I/O and MSR permission
//! bitmaps shared by its vCPUs.

use crate::{
    asid::ASID_NONE,
    config::MAX_VCPUS_PER_VM,
    error::{HvError, Result},
    global_state::GlobalState,
    hypercall::HypercallCode,
    npt::{MappingAttributes, NptManager},
    nsv::NsvKeys,
    platform::pa_of,
    vcpu::CustomVcpu,
    Page,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use bit_vec::BitVec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::{Mutex, RwLock, RwLockReadGuard};
use x86::current::paging::BASE_PAGE_SHIFT;

/// One run of guest-physical space to back with host memory.
#[derive(Debug, Clone, Copy)]
pub struct AddressMapping {
    /// Guest-physical start, page aligned.
    pub gpa: u64,
    /// Host-virtual start of the backing memory, page aligned.
    pub hva: u64,
    /// Number of pages.
    pub pages: u32,
    /// Attributes applied to every page of the run.
    pub attributes: MappingAttributes,
}

/// A customizable virtual machine.
pub struct CustomVm {
    global: Arc<GlobalState>,
    /// The vCPU slot array. Shared while vCPUs run or are rescinded;
    /// exclusive while slots are created or freed.
    vcpus: RwLock<Vec<Option<Arc<CustomVcpu>>>>,
    /// One nested page table per mapping id.
    nptm: Vec<RwLock<NptManager>>,
    /// The I/O permission bitmap (all ports intercepted).
    iopm: Box<[Page]>,
    /// The minimal MSR permission bitmap: everything intercepted except the
    /// whitelist the exit handler can serve from the VMCB.
    msrpm: Box<[Page]>,
    /// The full MSR permission bitmap: everything intercepted.
    msrpm_full: Box<[Page]>,
    nsv_guest: AtomicBool,
    nsv_keys: Mutex<Option<NsvKeys>>,
    vcpu_count: AtomicU32,
}

impl CustomVm {
    /// Creates a VM with `mapping_count` address-space slots. The first
    /// mapping's ASID is allocated now; the rest stay unallocated until
    /// their first use.
    pub fn create(global: &Arc<GlobalState>, mapping_count: u32) -> Result<Arc<Self>> {
        if mapping_count == 0 {
            return Err(HvError::InvalidParameter);
        }
        let _creating = global.vm_list_exclusive();
        let host_pat = global.facts().host_pat;
        let mut nptm = Vec::with_capacity(mapping_count as usize);
        for _ in 0..mapping_count {
            nptm.push(RwLock::new(NptManager::new_sparse(host_pat)));
        }
        nptm[0].write().asid = global.asid_pool.alloc()?;
        let mut iopm = Page::boxed_slice_zeroed(3);
        let mut msrpm = Page::boxed_slice_zeroed(2);
        let mut msrpm_full = Page::boxed_slice_zeroed(2);
        // Mostly-unconditional exits: every port and MSR intercepted.
        for page in iopm.iter_mut().chain(msrpm.iter_mut()).chain(msrpm_full.iter_mut()) {
            page.bytes_mut().fill(0xff);
        }
        setup_msr_interception_exceptions(&mut msrpm);
        let vm = Arc::new(Self {
            global: Arc::clone(global),
            vcpus: RwLock::new(alloc::vec![None; MAX_VCPUS_PER_VM]),
            nptm,
            iopm,
            msrpm,
            msrpm_full,
            nsv_guest: AtomicBool::new(false),
            nsv_keys: Mutex::new(None),
            vcpu_count: AtomicU32::new(0),
        });
        drop(_creating);
        global.register_vm(&vm);
        Ok(vm)
    }

    /// Tears the VM down: drains every vCPU (taking the list exclusively
    /// rules running ones out of scheduling first) and drops the VM from
    /// the list. ASIDs return to the pool when the last reference dies.
    pub fn release(self: &Arc<Self>) {
        {
            let _tearing_down = self.global.vm_list_exclusive();
            let mut vcpus = self.vcpus.write();
            for slot in vcpus.iter_mut() {
                *slot = None;
            }
        }
        self.global.unregister_vm(Arc::as_ptr(self));
    }

    /// The owning global context.
    pub(crate) fn global(&self) -> &GlobalState {
        &self.global
    }

    /// Creates the vCPU in slot `vcpu_id` and initializes its VMCB through
    /// the hypercall surface (only hypervisor mode may touch a VMCB).
    pub fn create_vcpu(self: &Arc<Self>, vcpu_id: u32) -> Result<Arc<CustomVcpu>> {
        if vcpu_id as usize >= MAX_VCPUS_PER_VM {
            return Err(HvError::InvalidParameter);
        }
        let vcpu = {
            let mut vcpus = self.vcpus.write();
            let slot = &mut vcpus[vcpu_id as usize];
            if slot.is_some() {
                return Err(HvError::VcpuAlreadyCreated);
            }
            let vcpu = Arc::new(CustomVcpu::new(
                Arc::downgrade(self),
                vcpu_id,
                self.global.facts().xsave_size,
            ));
            *slot = Some(Arc::clone(&vcpu));
            vcpu
        };
        let _ = self.vcpu_count.fetch_add(1, Ordering::AcqRel);
        let _ = self
            .global
            .cvm_hypercall(HypercallCode::InitCustomVmcb, pa_of(&*vcpu));
        Ok(vcpu)
    }

    /// Frees the vCPU in slot `vcpu_id`.
    pub fn release_vcpu(&self, vcpu_id: u32) -> Result<()> {
        let mut vcpus = self.vcpus.write();
        let slot = vcpus
            .get_mut(vcpu_id as usize)
            .ok_or(HvError::InvalidParameter)?;
        if slot.take().is_none() {
            return Err(HvError::InvalidParameter);
        }
        let _ = self.vcpu_count.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Returns a reference to the vCPU in slot `vcpu_id`.
    pub fn vcpu(&self, vcpu_id: u32) -> Option<Arc<CustomVcpu>> {
        self.vcpus.read().get(vcpu_id as usize)?.clone()
    }

    /// Number of currently created vCPUs.
    pub fn vcpu_count(&self) -> u32 {
        self.vcpu_count.load(Ordering::Acquire)
    }

    /// Holds the vCPU list shared, as the run and rescind paths do.
    pub(crate) fn vcpu_list_shared(&self) -> RwLockReadGuard<'_, Vec<Option<Arc<CustomVcpu>>>> {
        self.vcpus.read()
    }

    /// Number of address-space mappings this VM was created with.
    pub fn mapping_count(&self) -> u32 {
        self.nptm.len() as u32
    }

    /// The ASID of the given mapping, [`ASID_NONE`] until first use.
    pub(crate) fn mapping_asid(&self, mapping_id: u32) -> Result<u32> {
        Ok(self
            .nptm
            .get(mapping_id as usize)
            .ok_or(HvError::InvalidParameter)?
            .read()
            .asid)
    }

    /// The NCR3 and ASID the VMCB needs for the given mapping.
    pub(crate) fn mapping_address_space(&self, mapping_id: u32) -> Result<(u64, u32)> {
        let npt = self
            .nptm
            .get(mapping_id as usize)
            .ok_or(HvError::InvalidParameter)?
            .read();
        Ok((npt.ncr3_pa(), npt.asid))
    }

    /// The VM's primary ASID (of mapping 0).
    pub fn asid(&self) -> u32 {
        self.nptm[0].read().asid
    }

    /// Installs a run of 4KB translations into the given mapping,
    /// allocating the mapping's ASID on first use. Backing pages must be
    /// resident and locked unless the mapping is non-present. Every vCPU's
    /// TLB is invalidated afterwards.
    pub fn set_mapping(&self, mapping_id: u32, mapping: &AddressMapping) -> Result<()> {
        let npt_lock = self
            .nptm
            .get(mapping_id as usize)
            .ok_or(HvError::InvalidParameter)?;
        {
            let mut npt = npt_lock.write();
            if npt.asid == ASID_NONE {
                npt.asid = self.global.asid_pool.alloc()?;
            }
            for i in 0..u64::from(mapping.pages) {
                let hva = mapping.hva + (i << BASE_PAGE_SHIFT);
                let gpa = mapping.gpa + (i << BASE_PAGE_SHIFT);
                let attributes = self
                    .global
                    .platform()
                    .query_page(hva)
                    .ok_or(HvError::UserPageViolation)?;
                if !(attributes.valid && attributes.locked) && mapping.attributes.present {
                    return Err(HvError::UserPageViolation);
                }
                // Identity-mapped embedding: the backing HPA is the HVA.
                npt.map_4k(gpa, hva, mapping.attributes)?;
            }
        }
        // Broadcast to all vCPUs that their TLBs are stale. The NPT lock is
        // dropped first; the run path takes locks in the other order.
        for slot in self.vcpus.read().iter().flatten() {
            slot.state().cache.tlb_valid = false;
        }
        Ok(())
    }

    /// Reports the accessed and dirty bits of `page_count` pages starting
    /// at `gpa_start` into `bitmap`: accessed at bit 2i, dirty at 2i+1.
    pub fn query_accessed_bitmap(
        &self,
        mapping_id: u32,
        gpa_start: u64,
        page_count: u32,
        bitmap: &mut BitVec,
    ) -> Result<()> {
        let npt_lock = self
            .nptm
            .get(mapping_id as usize)
            .ok_or(HvError::InvalidParameter)?;
        if bitmap.len() < page_count as usize * 2 {
            return Err(HvError::BufferTooSmall);
        }
        let npt = npt_lock.read();
        for i in 0..page_count as usize {
            let gpa = gpa_start + ((i as u64) << BASE_PAGE_SHIFT);
            let (accessed, dirty) = npt.accessed_dirty(gpa).ok_or(HvError::GuestPageAbsent)?;
            bitmap.set(i * 2, accessed);
            bitmap.set(i * 2 + 1, dirty);
        }
        Ok(())
    }

    /// Clears the accessed and dirty bits of `page_count` pages starting at
    /// `gpa_start`.
    pub fn clear_accessed_bits(
        &self,
        mapping_id: u32,
        gpa_start: u64,
        page_count: u32,
    ) -> Result<()> {
        let npt_lock = self
            .nptm
            .get(mapping_id as usize)
            .ok_or(HvError::InvalidParameter)?;
        let mut npt = npt_lock.write();
        for i in 0..u64::from(page_count) {
            let gpa = gpa_start + (i << BASE_PAGE_SHIFT);
            if !npt.clear_accessed_dirty(gpa) {
                return Err(HvError::GuestPageAbsent);
            }
        }
        Ok(())
    }

    /// The physical address of the I/O permission bitmap.
    pub(crate) fn iopm_pa(&self) -> u64 {
        pa_of(&self.iopm[0])
    }

    /// The physical address of the MSR permission bitmap; `full` selects
    /// the intercept-everything variant.
    pub(crate) fn msrpm_pa(&self, full: bool) -> u64 {
        if full {
            pa_of(&self.msrpm_full[0])
        } else {
            pa_of(&self.msrpm[0])
        }
    }

    /// Whether this VM runs in confidential (NSV) mode.
    pub fn is_nsv_guest(&self) -> bool {
        self.nsv_guest.load(Ordering::Acquire)
    }

    /// Flips confidential mode. The first activation derives the VM's
    /// page-encryption key from platform entropy.
    pub(crate) fn set_nsv_guest(&self, enabled: bool) {
        if enabled {
            let mut keys = self.nsv_keys.lock();
            if keys.is_none() {
                *keys = Some(NsvKeys::generate(self.global.platform()));
            }
        }
        self.nsv_guest.store(enabled, Ordering::Release);
    }

    /// Runs `operation` with the VM's page-encryption keys, if derived.
    pub(crate) fn with_nsv_keys<R>(&self, operation: impl FnOnce(&NsvKeys) -> R) -> Option<R> {
        self.nsv_keys.lock().as_ref().map(operation)
    }
}

impl Drop for CustomVm {
    fn drop(&mut self) {
        for npt in &mut self.nptm {
            let asid = npt.get_mut().asid;
            if asid != ASID_NONE {
                self.global.asid_pool.free(asid);
            }
        }
    }
}

/// Rules the MSRs the exit handler emulates from the VMCB out of the
/// minimal interception bitmap: the sysenter and syscall MSRs, the FS/GS
/// bases with the kernel GS swap, and the PAT.
fn setup_msr_interception_exceptions(msrpm: &mut [Page]) {
    const MSR_SYSENTER_CS: u32 = 0x174;
    const MSR_SYSENTER_ESP: u32 = 0x175;
    const MSR_SYSENTER_EIP: u32 = 0x176;
    const MSR_PAT: u32 = 0x277;
    const MSR_STAR: u32 = 0xc000_0081;
    const MSR_LSTAR: u32 = 0xc000_0082;
    const MSR_CSTAR: u32 = 0xc000_0083;
    const MSR_SFMASK: u32 = 0xc000_0084;
    const MSR_FS_BASE: u32 = 0xc000_0100;
    const MSR_GS_BASE: u32 = 0xc000_0101;
    const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;
    for msr in [
        MSR_SYSENTER_CS,
        MSR_SYSENTER_ESP,
        MSR_SYSENTER_EIP,
        MSR_PAT,
        MSR_STAR,
        MSR_LSTAR,
        MSR_CSTAR,
        MSR_SFMASK,
        MSR_FS_BASE,
        MSR_GS_BASE,
        MSR_KERNEL_GS_BASE,
    ] {
        clear_msr_interception(msrpm, msr);
    }
}

/// The MSR permission bitmap carries two bits per MSR (read, then write) in
/// three vectors: 0..0x2000 at offset 0, 0xc0000000..0xc0002000 at byte
/// 0x800, and 0xc0010000..0xc0012000 at byte 0x1000.
///
/// See: 15.11 MSR Intercepts
fn msrpm_bit_offset(msr: u32) -> Option<usize> {
    match msr {
        0x0000_0000..=0x0000_1fff => Some((msr as usize) * 2),
        0xc000_0000..=0xc000_1fff => Some(0x800 * 8 + ((msr - 0xc000_0000) as usize) * 2),
        0xc001_0000..=0xc001_1fff => Some(0x1000 * 8 + ((msr - 0xc001_0000) as usize) * 2),
        _ => None,
    }
}

fn clear_msr_interception(msrpm: &mut [Page], msr: u32) {
    if let Some(bit) = msrpm_bit_offset(msr) {
        for offset in [bit, bit + 1] {
            let byte = offset / 8;
            msrpm[byte >> BASE_PAGE_SHIFT].bytes_mut()[byte & 0xfff] &= !(1 << (offset & 7));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_state::tests::test_global;
    use crate::mtrr::mem_type;

    fn plain_mapping(gpa: u64, hva: u64, pages: u32) -> AddressMapping {
        AddressMapping {
            gpa,
            hva,
            pages,
            attributes: MappingAttributes {
                present: true,
                write: true,
                execute: true,
                user: true,
                caching: mem_type::WRITE_BACK,
                page_size: 0,
            },
        }
    }

    #[test]
    fn create_and_release_round_trips_global_counters() {
        let global = test_global();
        let before = global.asid_pool.allocated_count();
        let vm = CustomVm::create(&global, 2).unwrap();
        let _vcpu = vm.create_vcpu(0).unwrap();
        assert_eq!(global.asid_pool.allocated_count(), before + 1);
        vm.release_vcpu(0).unwrap();
        vm.release();
        drop(vm);
        assert_eq!(global.asid_pool.allocated_count(), before);
    }

    #[test]
    fn duplicate_vcpu_slot_is_rejected() {
        let global = test_global();
        let vm = CustomVm::create(&global, 1).unwrap();
        let _vcpu = vm.create_vcpu(3).unwrap();
        assert_eq!(vm.create_vcpu(3).err(), Some(HvError::VcpuAlreadyCreated));
        assert_eq!(vm.vcpu_count(), 1);
        assert!(vm.vcpu(3).is_some());
        assert!(vm.vcpu(4).is_none());
        vm.release();
    }

    #[test]
    fn zero_mappings_is_invalid() {
        let global = test_global();
        assert_eq!(
            CustomVm::create(&global, 0).err(),
            Some(HvError::InvalidParameter)
        );
    }

    #[test]
    fn set_mapping_allocates_asid_lazily_and_flags_tlbs() {
        let global = test_global();
        let vm = CustomVm::create(&global, 2).unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        vcpu.state().cache.tlb_valid = true;
        assert_eq!(vm.mapping_asid(1).unwrap(), crate::asid::ASID_NONE);
        vm.set_mapping(1, &plain_mapping(0, 0x40_0000, 4)).unwrap();
        assert_ne!(vm.mapping_asid(1).unwrap(), crate::asid::ASID_NONE);
        assert!(!vcpu.state().cache.tlb_valid);
        vm.release();
    }

    #[test]
    fn set_mapping_rejects_unresident_pages() {
        let global = test_global();
        let vm = CustomVm::create(&global, 1).unwrap();
        assert_eq!(
            vm.set_mapping(0, &plain_mapping(0, 0xdead_0000, 1)).err(),
            Some(HvError::UserPageViolation)
        );
        vm.release();
    }

    #[test]
    fn accessed_bitmap_queries() {
        let global = test_global();
        let vm = CustomVm::create(&global, 1).unwrap();
        vm.set_mapping(0, &plain_mapping(0x10_0000, 0x40_0000, 2))
            .unwrap();
        let mut bitmap = BitVec::from_elem(4, true);
        vm.query_accessed_bitmap(0, 0x10_0000, 2, &mut bitmap)
            .unwrap();
        assert!(!bitmap.get(0).unwrap());
        assert!(!bitmap.get(3).unwrap());
        // Unmapped GPA.
        assert_eq!(
            vm.query_accessed_bitmap(0, 0x90_0000, 1, &mut bitmap).err(),
            Some(HvError::GuestPageAbsent)
        );
        // Undersized buffer.
        let mut small = BitVec::from_elem(3, false);
        assert_eq!(
            vm.query_accessed_bitmap(0, 0x10_0000, 2, &mut small).err(),
            Some(HvError::BufferTooSmall)
        );
        vm.clear_accessed_bits(0, 0x10_0000, 2).unwrap();
        vm.release();
    }

    #[test]
    fn mapping_selection_retags_the_tlb() {
        let global = test_global();
        let vm = CustomVm::create(&global, 2).unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        vcpu.state().cache.asid_valid = true;
        vcpu.select_mapping(1).unwrap();
        assert_eq!(vcpu.selected_mapping(), 1);
        assert!(!vcpu.state().cache.asid_valid);
        // Re-selecting the same mapping does not invalidate again.
        vcpu.state().cache.asid_valid = true;
        vcpu.select_mapping(1).unwrap();
        assert!(vcpu.state().cache.asid_valid);
        assert_eq!(
            vcpu.select_mapping(2).err(),
            Some(HvError::InvalidParameter)
        );
        vm.release();
    }

    #[test]
    fn rescission_and_the_run_entry_checks() {
        let global = test_global();
        let vm = CustomVm::create(&global, 2).unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        // Rescinding twice reports the prior rescission.
        vcpu.rescind().unwrap();
        assert_eq!(vcpu.rescind().err(), Some(HvError::AlreadyRescinded));
        // The pending rescission cancels the next run before entry.
        vcpu.run().unwrap();
        assert_eq!(
            vcpu.state().exit_context.intercept,
            crate::vcpu::CvmIntercept::Rescission
        );
        // A mapping with no ASID yet cannot be entered.
        vcpu.select_mapping(1).unwrap();
        vcpu.run().unwrap();
        assert!(matches!(
            vcpu.state().exit_context.intercept,
            crate::vcpu::CvmIntercept::InvalidState(_)
        ));
        vm.release();
    }

    #[test]
    fn msrpm_whitelist_bits_are_clear() {
        let mut msrpm = Page::boxed_slice_zeroed(2);
        for page in msrpm.iter_mut() {
            page.bytes_mut().fill(0xff);
        }
        setup_msr_interception_exceptions(&mut msrpm);
        // STAR (0xc0000081): vector 2, bit offset 0x800*8 + 0x81*2.
        let bit = 0x800 * 8 + 0x81 * 2;
        let byte = msrpm[0].bytes()[bit / 8];
        assert_eq!(byte & (1 << (bit % 8)), 0);
        assert_eq!(byte & (1 << (bit % 8 + 1)), 0);
        // EFER (0xc0000080) stays intercepted for SVME shadowing.
        let efer_bit = 0x800 * 8 + 0x80 * 2;
        assert_ne!(msrpm[0].bytes()[efer_bit / 8] & (1 << (efer_bit % 8)), 0);
    }
}
