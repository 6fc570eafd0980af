//! The module containing the [`HostCpu`] type: the subverted host's vCPU,
//! the per-CPU loader stack with its idle sentinel, the top-level exit
//! routing, and the guest-run trampoline.

use crate::{
    global_state::GlobalState,
    hypercall,
    platform::pa_of,
    vcpu::{self, ActivityState, CustomVcpu, GprState, VcpuState, XsaveArea},
    vmcb::{self, EventInjection, Vmcb},
    x86_instructions::{dr0_write, dr1_write, dr2_write, dr3_write, rdmsr, wrmsr},
    Page,
};
use alloc::boxed::Box;
use core::arch::global_asm;
use log::warn;

/// The register and extended state of one world, saved across a switch.
#[allow(missing_docs)]
pub struct WorldState {
    pub gpr: GprState,
    pub xcr0: u64,
    pub xsave: XsaveArea,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub cr2: u64,
}

impl WorldState {
    fn new(xsave_size: usize) -> Self {
        Self {
            gpr: GprState::default(),
            xcr0: 1,
            xsave: XsaveArea::new(xsave_size),
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            cr2: 0,
        }
    }
}

/// The per-CPU words the exit path consults first: which vCPU is loaded
/// and which VMCB the next VMRUN resumes. With no CVM vCPU loaded, the
/// idle sentinel makes exits attribute to the subverted host.
pub struct LoaderStack {
    /// The index of this processor.
    pub proc_id: u32,
    /// Address of the running [`CustomVcpu`], or 0 for the idle sentinel.
    custom_vcpu: usize,
    /// The VMCB the next VMRUN enters.
    pub guest_vmcb_pa: u64,
}

impl LoaderStack {
    pub(crate) fn set_running(&mut self, vcpu: &CustomVcpu, vmcb_pa: u64) {
        self.custom_vcpu = core::ptr::from_ref(vcpu) as usize;
        self.guest_vmcb_pa = vmcb_pa;
    }

    pub(crate) fn set_idle(&mut self, host_vmcb_pa: u64) {
        self.custom_vcpu = 0;
        self.guest_vmcb_pa = host_vmcb_pa;
    }

    /// No CVM vCPU is loaded; the next VMRUN resumes the subverted host.
    pub fn is_idle(&self) -> bool {
        self.custom_vcpu == 0
    }
}

/// The subverted host's vCPU on one processor.
#[allow(missing_docs)]
pub struct HostCpu {
    pub vmcb: Box<Vmcb>,
    /// Cached physical address of the VMCB.
    pub vmcb_pa: u64,
    /// The host state-save area VMRUN spills into.
    hsave: Box<Page>,
    /// The layered hypervisor's state parked across a CVM run.
    pub world: WorldState,
    pub loader: LoaderStack,
    /// INIT/SIPI sequencing state of this processor.
    pub activity: ActivityState,
}

impl HostCpu {
    pub(crate) fn new(proc_id: u32, xsave_size: usize) -> Self {
        let vmcb = Vmcb::boxed_zeroed();
        let vmcb_pa = pa_of(&*vmcb);
        Self {
            vmcb,
            vmcb_pa,
            hsave: Page::boxed_zeroed(),
            world: WorldState::new(xsave_size),
            loader: LoaderStack {
                proc_id,
                custom_vcpu: 0,
                guest_vmcb_pa: vmcb_pa,
            },
            activity: ActivityState::Active,
        }
    }

    /// The physical address of the host state-save area, programmed into
    /// the VM_HSAVE_PA MSR by the embedder.
    pub fn hsave_pa(&self) -> u64 {
        pa_of(&*self.hsave)
    }

    /// Enables SVM on the calling processor and points the hardware at
    /// this host vCPU's state-save area. Must run once per processor
    /// before the first VMRUN.
    pub fn enable_svm(&self) {
        const EFER_SVME: u64 = 1 << 12;
        const SVM_MSR_VM_HSAVE_PA: u32 = 0xc001_0117;
        wrmsr(x86::msr::IA32_EFER, rdmsr(x86::msr::IA32_EFER) | EFER_SVME);
        wrmsr(SVM_MSR_VM_HSAVE_PA, self.hsave_pa());
    }

    /// Emulates a startup IPI arriving at a processor parked by INIT.
    pub fn deliver_sipi(&mut self, vector: u8) {
        if self.activity == ActivityState::WaitForSipi {
            vcpu::emulate_sipi_signal(&mut self.vmcb, vector);
            self.activity = ActivityState::Active;
        }
    }
}

/// Handles a #VMEXIT of the subverted host. `exited_vmcb_pa` is the VMCB
/// the hardware just left, as latched by the exit trampoline; anything but
/// the host's own VMCB here is a dispatch bug.
///
/// CVM exits never arrive here: the run loop in [`run_cvm`] consumes them
/// synchronously.
pub fn handle_vm_exit(
    global: &GlobalState,
    host: &mut HostCpu,
    gprs: &mut GprState,
    exited_vmcb_pa: u64,
) {
    assert!(
        exited_vmcb_pa == host.vmcb_pa,
        "#VMEXIT from an unrecognised VMCB: {exited_vmcb_pa:#x}"
    );
    let exit_code = host.vmcb.control.exit_code as i64;
    // rax lives in the VMCB, not the captured frame.
    gprs.rax = host.vmcb.save.rax;
    host.vmcb.mark_all_clean();
    host.vmcb.control.tlb_control = vmcb::tlb_control::DO_NOTHING;
    match exit_code {
        // VMMCALL: the hypercall surface.
        0x81 => hypercall::handle_host_vmmcall(global, host, gprs),
        // #SX: an INIT signal redirected into an exception.
        0x5e => handle_host_security_exception(global, host, gprs),
        // CPUID: pass through, advertising hypervisor presence if asked.
        0x72 => handle_host_cpuid(global, host, gprs),
        _ => {
            // The remaining host intercepts (stealth hooks, MSR filters)
            // belong to subsystems outside this crate.
            warn!("Unhandled host #VMEXIT {exit_code:#x}");
        }
    }
    // The handler may have switched worlds; only write rax back if the
    // next VMRUN still resumes the host.
    if host.loader.guest_vmcb_pa == host.vmcb_pa {
        host.vmcb.save.rax = gprs.rax;
    }
}

/// INIT cannot be made to disappear on interception; it is redirected into
/// #SX and emulated here, parking the processor until a startup IPI.
fn handle_host_security_exception(global: &GlobalState, host: &mut HostCpu, gprs: &mut GprState) {
    const SX_INIT_REDIRECTION: u64 = 1;
    let error_code = host.vmcb.control.exit_info1;
    if error_code == SX_INIT_REDIRECTION {
        vcpu::emulate_init_signal(&mut host.vmcb, gprs, global.facts().cpuid_fms);
        dr0_write(0);
        dr1_write(0);
        dr2_write(0);
        dr3_write(0);
        host.activity = ActivityState::WaitForSipi;
    } else {
        // Unknown #SX reason; leave it to the guest.
        host.vmcb.inject_event(EventInjection::exception(30, Some(error_code as u32)));
    }
}

fn handle_host_cpuid(global: &GlobalState, host: &mut HostCpu, gprs: &mut GprState) {
    const CPUID_HV_PRESENT: u32 = 1 << 31;
    let leaf = gprs.rax as u32;
    let subleaf = gprs.rcx as u32;
    let mut info = x86::cpuid::cpuid!(leaf, subleaf);
    if leaf == 0x1 && global.options().cpuid_hv_presence {
        info.ecx |= CPUID_HV_PRESENT;
    }
    gprs.rax = u64::from(info.eax);
    gprs.rbx = u64::from(info.ebx);
    gprs.rcx = u64::from(info.ecx);
    gprs.rdx = u64::from(info.edx);
    host.vmcb.advance_rip();
}

/// Runs a CVM vCPU until one of its exits surfaces to the layered
/// hypervisor: switch worlds, enter the guest, dispatch each intercept,
/// and repeat while the handlers keep resuming.
pub(crate) fn run_cvm(
    global: &GlobalState,
    host: &mut HostCpu,
    vcpu: &CustomVcpu,
    state: &mut VcpuState,
    gprs: &mut GprState,
) {
    if !switch_to_guest(global, host, vcpu, state, gprs) {
        return;
    }
    loop {
        // Safety: the VMCB was initialized through the hypercall surface
        // and the guest state loaded per the state cache just above.
        unsafe { ncv_run_guest(gprs, state.vmcb_pa) };
        crate::exits::handle_cvm_exit(global, host, vcpu, state, gprs);
        if host.loader.is_idle() {
            break;
        }
    }
}

/// Loads a CVM vCPU onto this processor. Returns false when a
/// confidential guest's save area fails its integrity checks, in which
/// case nothing was entered.
pub(crate) fn switch_to_guest(
    global: &GlobalState,
    host: &mut HostCpu,
    vcpu: &CustomVcpu,
    state: &mut VcpuState,
    gprs: &mut GprState,
) -> bool {
    let Some(vm) = vcpu.vm.upgrade() else {
        return false;
    };
    // Migration to another processor invalidates everything the previous
    // one's VMCB cache may hold.
    if state.proc_id != host.loader.proc_id {
        state.proc_id = host.loader.proc_id;
        state.vmcb.mark_all_dirty();
    }
    vcpu::save_host_world(&mut host.world, gprs);
    if vm.is_nsv_guest() {
        if !crate::nsv::load_guest_vcpu(vcpu, state, gprs) {
            state.exit_context.intercept = vcpu::CvmIntercept::InvalidState(
                vcpu::InvalidStateReason::UnknownFailure,
            );
            vcpu::restore_host_world(&host.world);
            return false;
        }
    } else {
        *gprs = state.gpr;
        state.load_guest_state();
        state.load_guest_hardware_state();
    }
    state.program_event_injection();
    let Ok((ncr3, asid)) = vm.mapping_address_space(state.selected_mapping) else {
        vcpu::restore_host_world(&host.world);
        return false;
    };
    state.load_address_space(ncr3, asid);
    host.loader.set_running(vcpu, state.vmcb_pa);
    // If RFLAGS.IF were clear in both worlds, physical interrupts could
    // stay blocked forever.
    vcpu::enable_host_interrupts();
    true
}

/// Parks the CVM vCPU and restores the layered hypervisor's state; the
/// next VMRUN resumes the subverted host.
pub(crate) fn switch_to_host(
    host: &mut HostCpu,
    vcpu: &CustomVcpu,
    state: &mut VcpuState,
    gprs: &mut GprState,
    nsv_guest: bool,
) {
    if nsv_guest {
        let _ = crate::nsv::save_guest_vcpu(vcpu, state, gprs);
    } else {
        state.save_guest_state(gprs);
    }
    vcpu::restore_host_world(&host.world);
    *gprs = host.world.gpr;
    host.loader.set_idle(host.vmcb_pa);
}

extern "C" {
    /// Enters the guest described by `guest_vmcb_pa` with the generic
    /// registers at `gprs`, and returns when the next #VMEXIT occurs with
    /// `gprs` updated. rax and rsp travel through the VMCB.
    fn ncv_run_guest(gprs: *mut GprState, guest_vmcb_pa: u64);

    /// Loads a saved register frame and returns to it; rax carries the
    /// target rip, rcx the target rflags, rdx the target rsp.
    fn ncv_exit_trampoline(saved: *const GprState) -> !;
}
global_asm!(include_str!("run_guest.S"));

/// Returns to the pre-subversion caller through the saved-GPR frame. Never
/// returns.
///
/// # Safety
/// The frame's rax/rcx/rdx slots must carry a valid rip/rflags/rsp triple
/// for the destination context.
pub(crate) unsafe fn exit_trampoline(saved: &GprState) -> ! {
    // Safety: forwarded contract.
    unsafe { ncv_exit_trampoline(saved) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_stack_idle_sentinel() {
        let mut cpu = HostCpu::new(0, 0x240);
        assert!(cpu.loader.is_idle());
        assert_eq!(cpu.loader.guest_vmcb_pa, cpu.vmcb_pa);
        let vmcb_pa = cpu.vmcb_pa;
        cpu.loader.set_idle(vmcb_pa);
        assert!(cpu.loader.is_idle());
    }

    #[test]
    fn sipi_only_wakes_a_parked_processor() {
        let mut cpu = HostCpu::new(0, 0x240);
        cpu.vmcb.save.cs_selector = 0x1234;
        cpu.deliver_sipi(0x55);
        // Active processors ignore SIPIs.
        assert_eq!(cpu.vmcb.save.cs_selector, 0x1234);
        cpu.activity = ActivityState::WaitForSipi;
        cpu.deliver_sipi(0x55);
        assert_eq!(cpu.vmcb.save.cs_selector, 0x5500);
        assert_eq!(cpu.vmcb.save.cs_base, 0x55000);
        assert_eq!(cpu.vmcb.save.rip, 0);
        assert_eq!(cpu.activity, ActivityState::Active);
    }
}
