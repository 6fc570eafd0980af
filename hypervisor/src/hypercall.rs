//! The module containing the hypercall surface the layered hypervisor
//! drives the CVM core through.
//!
//! Every hypercall is the architectural VMMCALL instruction with the
//! function selector in rcx, a context value in rdx, and the status
//! returned in rax. Before honoring any CVM function, the host-side
//! handler verifies the caller's instruction pointer lies inside the
//! layered hypervisor's image (the unload function demands the
//! hypervisor's own image); anything else gets #UD to deter tampering.
//!
//! Before the world is subverted, host mode is hypervisor mode and the
//! same dispatch runs as a direct call; see
//! [`GlobalState::cvm_hypercall`](crate::global_state::GlobalState::cvm_hypercall).

use crate::{
    error::{status_of, HvError, Result, STATUS_SUCCESS},
    global_state::GlobalState,
    host::{self, HostCpu},
    npt::NptManager,
    nsv,
    rmt::PageOwnership,
    vcpu::{CustomVcpu, GprState},
    vm::CustomVm,
    vmcb::{self, clean, misc1, misc2, EventInjection, VirtualInterruptControl},
    x86_instructions::{cr3_write, cr4_write, lgdt, lidt, stgi, vmload},
};
use log::warn;
use x86::dtables::DescriptorTablePointer;

/// The hypercall function selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HypercallCode {
    /// Restore the pre-subversion processor state and return to the caller
    /// in host mode. Callable only from the hypervisor's own image.
    Callexit = 1,
    /// Initialize a fresh vCPU's VMCB interceptions and address space.
    InitCustomVmcb = 2,
    /// Enter a vCPU until an intercept surfaces.
    RunVcpu = 3,
    /// Pull a vCPU's VMCB into its logical view.
    DumpVcpuVmcb = 4,
    /// Recompute a vCPU's intercept vectors from its options.
    SetVcpuOptions = 5,
    /// Flush the guest TLB tag on the current VMCB.
    FlushTlb = 6,
    /// Stage 2 of page-ownership reassignment: rewrite the reverse map.
    NsvReassignRmt = 7,
    /// Stage 3 of page-ownership reassignment: recompute host permissions.
    NsvRemapByRmt = 8,
    /// Seal or unseal pages crossing a confidentiality boundary.
    NsvCryptoForRmt = 9,
}

impl HypercallCode {
    fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Callexit,
            2 => Self::InitCustomVmcb,
            3 => Self::RunVcpu,
            4 => Self::DumpVcpuVmcb,
            5 => Self::SetVcpuOptions,
            6 => Self::FlushTlb,
            7 => Self::NsvReassignRmt,
            8 => Self::NsvRemapByRmt,
            9 => Self::NsvCryptoForRmt,
            _ => return None,
        })
    }
}

/// The context of [`HypercallCode::NsvReassignRmt`].
#[derive(Debug)]
#[repr(C)]
pub struct RmtReassignmentContext {
    /// Pointer to the host-physical page list.
    pub hpa_list: u64,
    /// Pointer to the guest-physical page list, same length.
    pub gpa_list: u64,
    /// Number of pages.
    pub pages: u32,
    /// The new owning address space.
    pub asid: u32,
    /// The pages stay visible to the host.
    pub shared: bool,
    /// The new ownership class.
    pub ownership: PageOwnership,
    /// Out: whether validation passed and the table was rewritten.
    pub result: bool,
}

/// The context of [`HypercallCode::NsvRemapByRmt`].
#[derive(Debug)]
#[repr(C)]
pub struct RmtRemapContext {
    /// Pointer to the host-physical page list.
    pub hpa_list: u64,
    /// Number of pages.
    pub pages: u32,
    /// Out: the rax-style status of the remap.
    pub status: u64,
}

/// The context of [`HypercallCode::NsvCryptoForRmt`].
#[derive(Debug)]
#[repr(C)]
pub struct RmtCryptoContext {
    /// The VM whose key seals the pages.
    pub vm: u64,
    /// Pointer to the host-physical page list.
    pub hpa_list: u64,
    /// Number of pages.
    pub pages: u32,
}

/// Dispatches a hypercall issued as a direct call, before subversion.
pub(crate) fn dispatch_direct(global: &GlobalState, code: HypercallCode, context: u64) -> u64 {
    let mut host = global.host_cpu(global.platform().current_processor());
    let mut gprs = GprState::default();
    dispatch(global, &mut host, &mut gprs, code, context)
}

/// Handles a VMMCALL intercepted from the subverted host: validates the
/// caller's image, dispatches, advances rip, and reports the status in the
/// caller's rax.
pub(crate) fn handle_host_vmmcall(global: &GlobalState, host: &mut HostCpu, gprs: &mut GprState) {
    let function = gprs.rcx as u32;
    let context = gprs.rdx;
    let gip = host.vmcb.save.rip;
    let Some(code) = HypercallCode::from_raw(function) else {
        host.vmcb.inject_event(EventInjection::invalid_opcode());
        return;
    };
    let caller_ok = if code == HypercallCode::Callexit {
        global.platform().hypervisor_image().contains(&gip)
    } else {
        global.platform().layered_image().contains(&gip)
    };
    if !caller_ok {
        host.vmcb.inject_event(EventInjection::invalid_opcode());
        return;
    }
    let status = dispatch(global, host, gprs, code, context);
    gprs.rax = status;
    host.vmcb.advance_rip();
}

fn dispatch(
    global: &GlobalState,
    host: &mut HostCpu,
    gprs: &mut GprState,
    code: HypercallCode,
    context: u64,
) -> u64 {
    match code {
        HypercallCode::Callexit => status_of(callexit(host, gprs)),
        HypercallCode::InitCustomVmcb => status_of(with_vcpu(context, |vcpu| {
            initialize_cvm_vmcb(vcpu)
        })),
        HypercallCode::RunVcpu => status_of(with_vcpu(context, |vcpu| {
            let mut state = vcpu.state();
            state.stats.runtime_start = global.platform().time();
            host::run_cvm(global, host, vcpu, &mut state, gprs);
            Ok(())
        })),
        HypercallCode::DumpVcpuVmcb => status_of(with_vcpu(context, |vcpu| {
            vcpu.state().dump_guest_state();
            Ok(())
        })),
        HypercallCode::SetVcpuOptions => status_of(with_vcpu(context, |vcpu| {
            set_vcpu_options(vcpu)
        })),
        HypercallCode::FlushTlb => {
            host.vmcb.control.tlb_control = vmcb::tlb_control::FLUSH_GUEST;
            STATUS_SUCCESS
        }
        HypercallCode::NsvReassignRmt => status_of(nsv_reassign_rmt(global, context)),
        HypercallCode::NsvRemapByRmt => status_of(nsv_remap_by_rmt(global, host, context)),
        HypercallCode::NsvCryptoForRmt => status_of(nsv_crypto_for_rmt(global, context)),
    }
}

/// Resolves a context value into the vCPU it points at.
///
/// The pointer originates from the layered hypervisor, which owns the vCPU
/// through [`CustomVm::create_vcpu`] and keeps it alive across the call.
fn with_vcpu<R>(context: u64, operation: impl FnOnce(&CustomVcpu) -> Result<R>) -> Result<R> {
    if context == 0 {
        return Err(HvError::InvalidParameter);
    }
    // Safety: see the function documentation.
    let vcpu = unsafe { &*(context as *const CustomVcpu) };
    operation(vcpu)
}

/// Programs a fresh VMCB: every SVM instruction, CR4 accesses, #MC and
/// #SX, CPUID, HLT, INVD, INVLPGA, all I/O and MSR accesses, and shutdown
/// are intercepted; nested paging and virtual-interrupt masking are on;
/// the address space is the VM's first mapping.
fn initialize_cvm_vmcb(vcpu: &CustomVcpu) -> Result<()> {
    const CR4_BIT: u16 = 1 << 4;
    const MACHINE_CHECK: u32 = 1 << 18;
    const SECURITY_EXCEPTION: u32 = 1 << 30;
    let vm = vcpu.vm.upgrade().ok_or(HvError::InvalidParameter)?;
    let mut state = vcpu.state();
    let (ncr3, asid) = vm.mapping_address_space(0)?;
    let vmcb = &mut state.vmcb;
    // INIT redirection arrives as #SX; #MC must never reach the guest
    // unfiltered.
    vmcb.control.intercept_exception = MACHINE_CHECK | SECURITY_EXCEPTION;
    // CR4 accesses are intercepted so CR4.MCE can be shadowed.
    vmcb.control.intercept_cr_read = CR4_BIT;
    vmcb.control.intercept_cr_write = CR4_BIT;
    vmcb.control.intercept_misc1 = misc1::INTR
        | misc1::NMI
        | misc1::SMI
        | misc1::CPUID
        | misc1::INVD
        | misc1::HLT
        | misc1::INVLPGA
        | misc1::IO
        | misc1::MSR
        | misc1::SHUTDOWN;
    vmcb.control.intercept_misc2 = misc2::VMRUN
        | misc2::VMMCALL
        | misc2::VMLOAD
        | misc2::VMSAVE
        | misc2::STGI
        | misc2::CLGI
        | misc2::SKINIT;
    // Tag the TLB and flush anything a previous ASID holder left behind.
    vmcb.control.guest_asid = asid;
    vmcb.control.tlb_control = vmcb::tlb_control::FLUSH_GUEST;
    // Without virtual-interrupt masking the guest could block physical
    // interrupts from the host scheduler indefinitely.
    let mut vintr = VirtualInterruptControl(0);
    vintr.set_interrupt_masking(true);
    vmcb.control.vintr = vintr.0;
    vmcb.control.np_enable = 1;
    vmcb.control.ncr3 = ncr3;
    vmcb.control.iopm_base_pa = vm.iopm_pa();
    vmcb.control.msrpm_base_pa = vm.msrpm_pa(false);
    Ok(())
}

/// Recomputes the intercept vectors from the vCPU's options word and
/// exception bitmap. #MC and #SX stay intercepted no matter what the
/// layered hypervisor asked for.
fn set_vcpu_options(vcpu: &CustomVcpu) -> Result<()> {
    const CR3_BIT: u16 = 1 << 3;
    const MACHINE_CHECK: u32 = 1 << 18;
    const SECURITY_EXCEPTION: u32 = 1 << 30;
    let vm = vcpu.vm.upgrade().ok_or(HvError::InvalidParameter)?;
    let mut state = vcpu.state();
    let options = state.options;
    let exception_bitmap = state.exception_bitmap;
    let vmcb = &mut state.vmcb;
    vmcb.control.intercept_exception = if options.intercept_exceptions {
        exception_bitmap | MACHINE_CHECK | SECURITY_EXCEPTION
    } else {
        MACHINE_CHECK | SECURITY_EXCEPTION
    };
    if options.intercept_cr3 {
        vmcb.control.intercept_cr_read |= CR3_BIT;
        vmcb.control.intercept_cr_write |= CR3_BIT;
    } else {
        vmcb.control.intercept_cr_read &= !CR3_BIT;
        vmcb.control.intercept_cr_write &= !CR3_BIT;
    }
    let dr_intercepts = if options.intercept_drx { 0xffff } else { 0 };
    vmcb.control.intercept_dr_read = dr_intercepts;
    vmcb.control.intercept_dr_write = dr_intercepts;
    vmcb.control.msrpm_base_pa = vm.msrpm_pa(options.intercept_msr);
    if options.intercept_rsm {
        vmcb.control.intercept_misc1 |= misc1::RSM;
    } else {
        vmcb.control.intercept_misc1 &= !misc1::RSM;
    }
    vmcb.invalidate(clean::INTERCEPTS | clean::IOPM_MSRPM);
    Ok(())
}

/// Restores the pre-subversion processor state and returns to the caller
/// in host (non-guest) mode. Does not return on success.
fn callexit(host: &mut HostCpu, gprs: &GprState) -> Result<()> {
    // The saved-GPR trampoline frame: rax carries the return rip, rcx the
    // caller's rflags, rdx the caller's rsp.
    let mut saved = *gprs;
    saved.rax = host.vmcb.control.nrip;
    saved.rcx = host.vmcb.save.rflags;
    saved.rdx = host.vmcb.save.rsp;
    // Reload the hidden segment state, then the control registers and
    // descriptor tables the guest was running with.
    vmload(host.vmcb_pa);
    cr3_write(host.vmcb.save.cr3);
    cr4_write(host.vmcb.save.cr4);
    let idtr = DescriptorTablePointer::<u64> {
        limit: host.vmcb.save.idtr_limit as u16,
        base: host.vmcb.save.idtr_base as *const u64,
    };
    lidt(&idtr);
    let gdtr = DescriptorTablePointer::<u64> {
        limit: host.vmcb.save.gdtr_limit as u16,
        base: host.vmcb.save.gdtr_base as *const u64,
    };
    lgdt(&gdtr);
    // Set the GIF last; the host must be interruptible again.
    stgi();
    // Safety: the frame was fully populated above; the trampoline never
    // returns.
    unsafe { host::exit_trampoline(&saved) }
}

/// Stage 2 of page-ownership reassignment, invoked by the layered
/// hypervisor between scheduling epochs: validate, then rewrite the
/// reverse-map rows. The update happens under the exclusive pushlock, so
/// it is atomic with respect to the VMMCALL visibility window.
fn nsv_reassign_rmt(global: &GlobalState, context: u64) -> Result<()> {
    if context == 0 {
        return Err(HvError::InvalidParameter);
    }
    // Safety: the context block and its lists live in the layered
    // hypervisor's image for the duration of the call.
    let ctx = unsafe { &mut *(context as *mut RmtReassignmentContext) };
    let hpa_list = unsafe { core::slice::from_raw_parts(ctx.hpa_list as *const u64, ctx.pages as usize) };
    let gpa_list = unsafe { core::slice::from_raw_parts(ctx.gpa_list as *const u64, ctx.pages as usize) };
    let mut rmt = global.rmt.write();
    ctx.result = rmt.validate_reassignment(hpa_list, gpa_list, ctx.asid, ctx.ownership);
    if !ctx.result {
        warn!("Reverse-map reassignment failed validation");
        return Err(HvError::InvalidParameter);
    }
    for (&hpa, &gpa) in hpa_list.iter().zip(gpa_list) {
        rmt.configure(hpa, gpa, ctx.asid, ctx.shared, ctx.ownership)?;
    }
    Ok(())
}

/// Stage 3 of page-ownership reassignment: recompute the host-visible
/// permission of every listed frame from its reverse-map row and flush
/// the current TLB tag.
fn nsv_remap_by_rmt(global: &GlobalState, host: &mut HostCpu, context: u64) -> Result<()> {
    if context == 0 {
        return Err(HvError::InvalidParameter);
    }
    // Safety: as in `nsv_reassign_rmt`.
    let ctx = unsafe { &mut *(context as *mut RmtRemapContext) };
    let hpa_list = unsafe { core::slice::from_raw_parts(ctx.hpa_list as *const u64, ctx.pages as usize) };
    let result = remap_frames(&mut global.primary_npt.write(), global, hpa_list);
    ctx.status = status_of(result);
    host.vmcb.control.tlb_control = vmcb::tlb_control::FLUSH_GUEST;
    result
}

fn remap_frames(npt: &mut NptManager, global: &GlobalState, hpa_list: &[u64]) -> Result<()> {
    let rmt = global.rmt.read();
    for &hpa in hpa_list {
        let ownership = rmt.entry(hpa).ok_or(HvError::InvalidParameter)?.ownership();
        npt.remap_by_ownership(hpa, ownership)?;
    }
    Ok(())
}

/// Seals pages leaving a secure guest and unseals pages entering one, per
/// their current reverse-map rows.
fn nsv_crypto_for_rmt(global: &GlobalState, context: u64) -> Result<()> {
    if context == 0 {
        return Err(HvError::InvalidParameter);
    }
    // Safety: as in `nsv_reassign_rmt`; the VM pointer is kept alive by the
    // layered hypervisor across the call.
    let ctx = unsafe { &*(context as *const RmtCryptoContext) };
    if ctx.vm == 0 {
        return Err(HvError::InvalidParameter);
    }
    let vm = unsafe { &*(ctx.vm as *const CustomVm) };
    let hpa_list = unsafe { core::slice::from_raw_parts(ctx.hpa_list as *const u64, ctx.pages as usize) };
    let rmt = global.rmt.read();
    vm.with_nsv_keys(|keys| -> Result<()> {
        for &hpa in hpa_list {
            let entry = rmt.entry(hpa).ok_or(HvError::InvalidParameter)?;
            // Safety: the frame was validated against the reverse map and
            // is identity mapped.
            let page = unsafe { &mut *(hpa as *mut [u8; 0x1000]) };
            if entry.ownership() == PageOwnership::SecureGuest {
                nsv::decrypt_page(keys, page);
            } else {
                nsv::encrypt_page(keys, page);
            }
        }
        Ok(())
    })
    .ok_or(HvError::InvalidParameter)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_state::tests::test_global;
    use crate::vm::CustomVm;

    #[test]
    fn fresh_vmcb_intercepts_the_required_set() {
        let global = test_global();
        let vm = CustomVm::create(&global, 1).unwrap();
        // `create_vcpu` runs InitCustomVmcb through the direct dispatch.
        let vcpu = vm.create_vcpu(0).unwrap();
        let state = vcpu.state();
        let control = &state.vmcb.control;
        assert_ne!(control.intercept_misc1 & misc1::CPUID, 0);
        assert_ne!(control.intercept_misc1 & misc1::MSR, 0);
        assert_ne!(control.intercept_misc1 & misc1::IO, 0);
        assert_ne!(control.intercept_misc1 & misc1::SHUTDOWN, 0);
        assert_ne!(control.intercept_misc2 & misc2::VMRUN, 0);
        assert_ne!(control.intercept_misc2 & misc2::SKINIT, 0);
        // #MC and #SX.
        assert_eq!(control.intercept_exception, (1 << 18) | (1 << 30));
        // CR4 shadowing.
        assert_eq!(control.intercept_cr_read, 1 << 4);
        assert_eq!(control.intercept_cr_write, 1 << 4);
        assert_eq!(control.np_enable, 1);
        assert_ne!(control.ncr3, 0);
        // Never the hypervisor's ASID, never the subverted host's.
        assert!(control.guest_asid > crate::asid::HOST_ASID);
        assert!(VirtualInterruptControl(control.vintr).interrupt_masking());
        drop(state);
        vm.release();
    }

    #[test]
    fn option_recompute_keeps_mc_and_sx() {
        let global = test_global();
        let vm = CustomVm::create(&global, 1).unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        {
            let mut state = vcpu.state();
            state.options.intercept_exceptions = true;
            state.exception_bitmap = 1 << 14; // #PF only
            state.options.intercept_drx = true;
            state.options.intercept_msr = true;
            state.options.intercept_cr3 = true;
        }
        let _ = global.cvm_hypercall(HypercallCode::SetVcpuOptions, crate::platform::pa_of(&*vcpu));
        let state = vcpu.state();
        assert_eq!(
            state.vmcb.control.intercept_exception,
            (1 << 14) | (1 << 18) | (1 << 30)
        );
        assert_eq!(state.vmcb.control.intercept_dr_read, 0xffff);
        assert_eq!(state.vmcb.control.msrpm_base_pa, vm.msrpm_pa(true));
        assert_ne!(state.vmcb.control.intercept_cr_read & (1 << 3), 0);
        // The recompute invalidated the hardware's cached intercepts.
        assert_eq!(
            state.vmcb.control.vmcb_clean & u64::from(clean::INTERCEPTS | clean::IOPM_MSRPM),
            0
        );
        drop(state);
        vm.release();
    }

    #[test]
    fn unknown_function_is_rejected() {
        assert!(HypercallCode::from_raw(0).is_none());
        assert!(HypercallCode::from_raw(10).is_none());
        assert_eq!(HypercallCode::from_raw(3), Some(HypercallCode::RunVcpu));
    }
}
