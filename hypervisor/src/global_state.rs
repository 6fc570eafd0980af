//! The module containing the [`GlobalState`] type.
//!
//! The singleton context shared by all processors and every customizable
//! VM: the ASID pool, the reverse-mapping table, the subverted host's
//! identity-mapped nested page table, the blank decoy page, the per-CPU
//! host vCPUs, and the VM list. It is created once by the embedder and
//! handed explicitly to every entry point.

use crate::{
    asid::AsidPool,
    config::HvOptions,
    error::{HvError, Result},
    host::HostCpu,
    hypercall::{self, HypercallCode},
    mtrr::MtrrState,
    npt::NptManager,
    platform::{pa_of, PlatformOps},
    rmt::{PageOwnership, ReverseMap},
    vm::CustomVm,
    x86_instructions::{debug_break, rdmsr, vmmcall},
    Page,
};
use alloc::{boxed::Box, sync::Arc, sync::Weak, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};

/// Hardware facts captured once at initialization, separated from
/// [`GlobalState::new`] so the rest of the crate never reads hardware
/// directly.
#[derive(Debug, Clone)]
pub struct HostFacts {
    /// The host PAT programming, which nested-paging memory types index.
    pub host_pat: u64,
    /// Number of address spaces the processor supports.
    pub asid_limit: u32,
    /// Size of an XSAVE area for every feature the host supports.
    pub xsave_size: usize,
    /// Family/model/stepping word reported by CPUID leaf 1, delivered in
    /// rdx after an emulated INIT.
    pub cpuid_fms: u32,
    /// The captured MTRR programming.
    pub(crate) mtrrs: MtrrState,
}

impl HostFacts {
    /// Reads the facts from the calling processor. Must run at CPL0.
    pub fn capture() -> Self {
        const MSR_PAT: u32 = 0x277;
        let fms = x86::cpuid::cpuid!(0x1).eax;
        let xsave = x86::cpuid::cpuid!(0xd, 0x0).ecx as usize;
        let asid_limit = x86::cpuid::cpuid!(0x8000_000a).ebx;
        Self {
            host_pat: rdmsr(MSR_PAT),
            asid_limit,
            xsave_size: xsave.max(0x240),
            cpuid_fms: fms,
            mtrrs: MtrrState::capture(),
        }
    }
}

/// The singleton context shared across all processors.
pub struct GlobalState {
    platform: &'static dyn PlatformOps,
    options: HvOptions,
    facts: HostFacts,
    /// The ASID allocator for customizable VMs.
    pub asid_pool: AsidPool,
    /// The reverse-mapping table over present RAM.
    pub rmt: ReverseMap,
    /// The subverted host's identity-mapped address space.
    pub(crate) primary_npt: RwLock<NptManager>,
    /// The all-zero page hypervisor-private frames are redirected to.
    blank_page: Box<Page>,
    host_cpus: Vec<Mutex<HostCpu>>,
    vm_list: RwLock<Vec<Weak<CustomVm>>>,
    /// Whether the world switch is armed: once set, hypercalls trap through
    /// VMMCALL; before that, host mode is hypervisor mode and the hypercall
    /// surface is a direct call.
    subverted: AtomicBool,
}

impl GlobalState {
    /// Builds the context: the identity map typed by the captured MTRRs,
    /// the reverse map over the platform's RAM ranges, the ASID pool, and
    /// one host vCPU per processor.
    pub fn new(
        platform: &'static dyn PlatformOps,
        options: HvOptions,
        facts: HostFacts,
    ) -> Result<Arc<Self>> {
        let primary_npt = NptManager::new_identity(&facts.mtrrs, facts.host_pat)?;
        let rmt = ReverseMap::new(platform.physical_memory_ranges());
        let asid_pool = AsidPool::new(facts.asid_limit, options.nested_virtualization);
        let mut host_cpus = Vec::new();
        for proc_id in 0..platform.processor_count() {
            host_cpus.push(Mutex::new(HostCpu::new(proc_id, facts.xsave_size)));
        }
        Ok(Arc::new(Self {
            platform,
            options,
            facts,
            asid_pool,
            rmt,
            primary_npt: RwLock::new(primary_npt),
            blank_page: Page::boxed_zeroed(),
            host_cpus,
            vm_list: RwLock::new(Vec::new()),
            subverted: AtomicBool::new(false),
        }))
    }

    /// The embedding platform.
    pub fn platform(&self) -> &'static dyn PlatformOps {
        self.platform
    }

    /// The process-wide options.
    pub fn options(&self) -> &HvOptions {
        &self.options
    }

    /// The captured hardware facts.
    pub fn facts(&self) -> &HostFacts {
        &self.facts
    }

    /// The physical address of the blank decoy page.
    pub fn blank_page_pa(&self) -> u64 {
        pa_of(&*self.blank_page)
    }

    /// The host vCPU of the given processor.
    pub fn host_cpu(&self, proc_id: u32) -> MutexGuard<'_, HostCpu> {
        self.host_cpus[proc_id as usize].lock()
    }

    /// Marks the world subverted (or torn down). Past this point hypercalls
    /// are issued with the VMMCALL instruction.
    pub fn mark_subverted(&self, subverted: bool) {
        self.subverted.store(subverted, Ordering::Release);
    }

    /// Issues a CVM hypercall: VMMCALL once the world is subverted, a
    /// direct dispatch before that (host mode *is* hypervisor mode then).
    pub fn cvm_hypercall(&self, code: HypercallCode, context: u64) -> u64 {
        if self.subverted.load(Ordering::Acquire) {
            vmmcall(code as u32, context)
        } else {
            hypercall::dispatch_direct(self, code, context)
        }
    }

    /// Registers a VM in the list. Exclusive, per the VM-list lock.
    pub(crate) fn register_vm(&self, vm: &Arc<CustomVm>) {
        self.vm_list.write().push(Arc::downgrade(vm));
    }

    /// Drops dead entries and the given VM from the list.
    pub(crate) fn unregister_vm(&self, vm: *const CustomVm) {
        self.vm_list
            .write()
            .retain(|weak| weak.as_ptr() != vm && weak.strong_count() != 0);
    }

    /// Takes the VM-list lock exclusively, ruling out concurrent VM
    /// creation and release.
    pub(crate) fn vm_list_exclusive(&self) -> RwLockWriteGuard<'_, Vec<Weak<CustomVm>>> {
        self.vm_list.write()
    }

    /// Redirects every hypervisor-private page — host VMCBs, host-save
    /// areas, the nested paging structures themselves, and the reverse-map
    /// sub-tables — through the blank page in the subverted host's address
    /// space, and records them as hypervisor-owned in the reverse map.
    /// Must run before the first vCPU is dispatched.
    pub fn protect_critical_pages(&self) -> Result<()> {
        let blank_pa = self.blank_page_pa();
        let mut npt = self.primary_npt.write();
        let mut rmt = self.rmt.write();
        // Host VMCBs and host-save areas read and write the decoy.
        let mut redirected = Vec::new();
        for cpu in &self.host_cpus {
            let cpu = cpu.lock();
            redirected.push(cpu.vmcb_pa);
            redirected.push(cpu.hsave_pa());
        }
        for &pa in &redirected {
            npt.update_pte(blank_pa, pa, true, true, true, None, true)?;
            Self::note_hypervisor_page(&mut rmt, pa)?;
        }
        // The paging structures themselves: write-protected in place. New
        // sub-tables appear while we work, so iterate to a fixed point.
        let mut protected = 0usize;
        loop {
            let pages = npt.table_pages();
            if protected >= pages.len() {
                break;
            }
            for &pa in &pages[protected..] {
                npt.update_pte(pa, pa, true, false, true, None, true)?;
                Self::note_hypervisor_page(&mut rmt, pa)?;
            }
            protected = pages.len();
        }
        // The reverse-map sub-tables are write-protected in place as well.
        for pa in rmt.table_pages() {
            npt.update_pte(pa, pa, true, false, true, None, true)?;
            Self::note_hypervisor_page(&mut rmt, pa)?;
        }
        // The blank page itself.
        npt.update_pte(blank_pa, blank_pa, true, false, true, None, true)?;
        Self::note_hypervisor_page(&mut rmt, blank_pa)?;
        Ok(())
    }

    /// The canonical page-ownership-change path: splits the host paging so
    /// each frame is a 4KB leaf, rewrites the reverse map, recomputes the
    /// host-visible permissions from the new rows, and broadcasts a TLB
    /// flush to every processor.
    ///
    /// The NPT pushlock is taken before the RMT pushlock; every other path
    /// holding both does the same. Callers must schedule the affected
    /// vCPUs out of execution first.
    pub fn reassign_page_ownership(
        &self,
        hpa_list: &[u64],
        gpa_list: &[u64],
        asid: u32,
        shared: bool,
        ownership: PageOwnership,
    ) -> Result<()> {
        {
            let mut npt = self.primary_npt.write();
            let mut rmt = self.rmt.write();
            // Stage 1: make every target a 4KB leaf; sub-tables created on
            // the way belong to the hypervisor and are protected in turn.
            for &hpa in hpa_list {
                let pde = npt
                    .split_pdpte(hpa, true, true)?
                    .ok_or(HvError::InsufficientResources)?;
                if pde.created {
                    Self::assign_table_page(&mut npt, &mut rmt, pde.pa)?;
                }
                let pte = npt
                    .split_pde(hpa, true, true)?
                    .ok_or(HvError::InsufficientResources)?;
                if pte.created {
                    Self::assign_table_page(&mut npt, &mut rmt, pte.pa)?;
                }
            }
            // Stage 2: rewrite the reverse map.
            if !rmt.validate_reassignment(hpa_list, gpa_list, asid, ownership) {
                log::warn!("Reverse-map reassignment failed validation");
                debug_break();
                return Err(HvError::InvalidParameter);
            }
            for (&hpa, &gpa) in hpa_list.iter().zip(gpa_list) {
                rmt.configure(hpa, gpa, asid, shared, ownership)?;
            }
            // Stage 3: recompute the host-visible permissions.
            for &hpa in hpa_list {
                npt.remap_by_ownership(hpa, ownership)?;
            }
        }
        // The mapping changed; every processor flushes before the new
        // ownership is considered visible.
        self.flush_tlb_all_processors();
        Ok(())
    }

    /// Records a hypervisor-private frame in the reverse map. Frames
    /// outside the described RAM ranges have no row and are skipped.
    fn note_hypervisor_page(rmt: &mut crate::rmt::RmtTables, pa: u64) -> Result<()> {
        match rmt.configure(pa, pa, 0, true, PageOwnership::Noirvisor) {
            Ok(()) | Err(HvError::InvalidParameter) => Ok(()),
            Err(other) => Err(other),
        }
    }

    /// Hands a freshly split sub-table to the hypervisor: records it in the
    /// reverse map (frames outside the described RAM have no row and are
    /// skipped) and write-protects it in the host paging. Splitting for the
    /// table's own address may create further tables, which are processed
    /// in turn.
    fn assign_table_page(
        npt: &mut NptManager,
        rmt: &mut crate::rmt::RmtTables,
        table_pa: u64,
    ) -> Result<()> {
        let mut queue = alloc::vec![table_pa];
        while let Some(pa) = queue.pop() {
            if let Some(split) = npt.split_pdpte(pa, true, true)? {
                if split.created {
                    queue.push(split.pa);
                }
            }
            if let Some(split) = npt.split_pde(pa, true, true)? {
                if split.created {
                    queue.push(split.pa);
                }
            }
            match rmt.configure(pa, pa, 0, true, PageOwnership::Noirvisor) {
                Ok(()) | Err(HvError::InvalidParameter) => (),
                Err(other) => return Err(other),
            }
            npt.update_pte(pa, pa, true, false, true, None, true)?;
        }
        Ok(())
    }

    /// Reassigns every frame a guest address space owns, eg, returning a
    /// confidential guest's memory to the host on teardown.
    pub fn reassign_all_pages_of(
        &self,
        owner_asid: u32,
        new_asid: u32,
        shared: bool,
        ownership: PageOwnership,
    ) -> Result<()> {
        let pages = self.rmt.read().pages_owned_by(owner_asid);
        if pages.is_empty() {
            return Ok(());
        }
        let hpa_list: Vec<u64> = pages.iter().map(|(hpa, _)| *hpa).collect();
        let gpa_list: Vec<u64> = pages.iter().map(|(_, gpa)| *gpa).collect();
        self.reassign_page_ownership(&hpa_list, &gpa_list, new_asid, shared, ownership)
    }

    /// Broadcasts a guest-TLB flush through the generic-call primitive,
    /// returning once every processor has acknowledged.
    pub fn flush_tlb_all_processors(&self) {
        self.platform.generic_call(&|_proc_id| {
            let _ = self.cvm_hypercall(HypercallCode::FlushTlb, 0);
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mtrr::{mem_type, FixedTypes, RESET_PAT};
    use crate::platform::PageAttributes;
    use alloc::vec;
    use core::ops::Range;

    /// A platform for unit tests: one processor, 16MB of RAM starting at
    /// zero, everything resident.
    #[derive(Debug)]
    pub(crate) struct TestPlatform {
        ranges: [Range<u64>; 1],
    }

    impl TestPlatform {
        pub(crate) const fn new() -> Self {
            Self {
                ranges: [0..0x100_0000],
            }
        }
    }

    impl PlatformOps for TestPlatform {
        fn current_processor(&self) -> u32 {
            0
        }

        fn processor_count(&self) -> u32 {
            1
        }

        fn generic_call(&self, worker: &(dyn Fn(u32) + Sync)) {
            worker(0);
        }

        fn hypervisor_image(&self) -> Range<u64> {
            0x1000_0000..0x1100_0000
        }

        fn layered_image(&self) -> Range<u64> {
            0x2000_0000..0x2100_0000
        }

        fn physical_memory_ranges(&self) -> &[Range<u64>] {
            &self.ranges
        }

        fn query_page(&self, va: u64) -> Option<PageAttributes> {
            // Mark one well-known address non-resident for negative tests.
            (va != 0xdead_0000).then_some(PageAttributes {
                valid: true,
                locked: true,
                large_page: false,
            })
        }

        fn time(&self) -> u64 {
            0
        }

        fn entropy(&self, buffer: &mut [u8]) {
            buffer.fill(0x5a);
        }
    }

    pub(crate) fn test_facts() -> HostFacts {
        HostFacts {
            host_pat: RESET_PAT,
            asid_limit: 16,
            xsave_size: 0x240,
            cpuid_fms: 0x00a2_0f10,
            mtrrs: MtrrState {
                default_type: mem_type::WRITE_BACK,
                enabled: true,
                fixed_enabled: false,
                fixed: FixedTypes::default(),
                variable: vec![],
            },
        }
    }

    pub(crate) fn test_global() -> Arc<GlobalState> {
        static PLATFORM: TestPlatform = TestPlatform::new();
        GlobalState::new(&PLATFORM, HvOptions::default(), test_facts()).unwrap()
    }

    #[test]
    fn reassignment_updates_rmt_and_host_permissions() {
        let global = test_global();
        let hpa_list = [0x10_0000, 0x10_1000, 0x10_2000];
        let gpa_list = [0x1_0000, 0x1_1000, 0x1_2000];
        global
            .reassign_page_ownership(&hpa_list, &gpa_list, 5, false, PageOwnership::SecureGuest)
            .unwrap();
        let rmt = global.rmt.read();
        let npt = global.primary_npt.read();
        for (&hpa, &gpa) in hpa_list.iter().zip(&gpa_list) {
            let entry = rmt.entry(hpa).unwrap();
            assert_eq!(entry.ownership(), PageOwnership::SecureGuest);
            assert_eq!(entry.asid(), 5);
            assert!(!entry.shared());
            assert_eq!(entry.guest_pfn(), gpa >> 12);
            // The subverted host has no access left to the frame.
            let pte = npt.pte_at(hpa).unwrap();
            assert!(!pte.present() && !pte.write() && !pte.user());
        }
    }

    #[test]
    fn reassignment_rejects_hypervisor_pages() {
        let global = test_global();
        global.protect_critical_pages().unwrap();
        let npt_page = {
            let npt = global.primary_npt.read();
            npt.table_pages()[0]
        };
        // NPT pages are in-RAM for the test platform only when below 16MB;
        // the heap usually is not, so synthesize the case instead.
        let target = if global.rmt.read().entry(npt_page).is_some() {
            npt_page
        } else {
            let mut rmt = global.rmt.write();
            rmt.configure(0x20_0000, 0x20_0000, 0, true, PageOwnership::Noirvisor)
                .unwrap();
            0x20_0000
        };
        assert_eq!(
            global.reassign_page_ownership(
                &[target],
                &[0x0],
                5,
                false,
                PageOwnership::InsecureGuest
            ),
            Err(HvError::InvalidParameter)
        );
    }
}
