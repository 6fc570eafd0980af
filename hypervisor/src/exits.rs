//! The module containing the CVM exit dispatcher: every intercept a
//! customizable guest can trigger is either emulated in place and resumed,
//! routed to the confidential-guest engine, or surfaced to the layered
//! hypervisor with a populated exit context.

use crate::{
    global_state::GlobalState,
    host::{self, HostCpu},
    nsv,
    vcpu::{
        self, ActivityState, CustomVcpu, CvmIntercept, GprState, InstructionBytes, InterceptClass,
        InvalidStateReason, IoAccess, Segment, VcpuState,
    },
    vmcb::{
        self, clean, misc1, CrAccessInfo, DrAccessInfo, EventInjection, IoAccessInfo,
        NptFaultCode, Vmcb,
    },
    x86_instructions::{dr0_write, dr1_write, dr2_write, dr3_write, wbinvd},
};

/// A decoded #VMEXIT code.
///
/// See: Appendix C SVM Intercept Exit Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub(crate) enum ExitCode {
    CrRead(u8),
    CrWrite(u8),
    DrRead(u8),
    DrWrite(u8),
    Exception(u8),
    Intr,
    Nmi,
    Smi,
    Init,
    Vintr,
    Cpuid,
    Rsm,
    Iret,
    Invd,
    Pause,
    Hlt,
    Invlpg,
    Invlpga,
    Io,
    Msr,
    TaskSwitch,
    Shutdown,
    Vmrun,
    Vmmcall,
    Vmload,
    Vmsave,
    Stgi,
    Clgi,
    Skinit,
    NestedPageFault,
    IncompleteIpi,
    UnacceleratedAvic,
    /// The processor rejected the VMCB at entry.
    InvalidState,
    VmsaBusy,
    IdleRequired,
    Unknown(i64),
}

impl ExitCode {
    pub(crate) fn decode(raw: i64) -> Self {
        match raw {
            -1 => Self::InvalidState,
            -2 => Self::VmsaBusy,
            -3 => Self::IdleRequired,
            0x00..=0x0f => Self::CrRead(raw as u8),
            0x10..=0x1f => Self::CrWrite((raw & 0xf) as u8),
            0x20..=0x2f => Self::DrRead((raw & 0xf) as u8),
            0x30..=0x3f => Self::DrWrite((raw & 0xf) as u8),
            0x40..=0x5f => Self::Exception((raw - 0x40) as u8),
            0x60 => Self::Intr,
            0x61 => Self::Nmi,
            0x62 => Self::Smi,
            0x63 => Self::Init,
            0x64 => Self::Vintr,
            0x72 => Self::Cpuid,
            0x73 => Self::Rsm,
            0x74 => Self::Iret,
            0x76 => Self::Invd,
            0x77 => Self::Pause,
            0x78 => Self::Hlt,
            0x79 => Self::Invlpg,
            0x7a => Self::Invlpga,
            0x7b => Self::Io,
            0x7c => Self::Msr,
            0x7d => Self::TaskSwitch,
            0x7f => Self::Shutdown,
            0x80 => Self::Vmrun,
            0x81 => Self::Vmmcall,
            0x82 => Self::Vmload,
            0x83 => Self::Vmsave,
            0x84 => Self::Stgi,
            0x85 => Self::Clgi,
            0x86 => Self::Skinit,
            0x400 => Self::NestedPageFault,
            0x401 => Self::IncompleteIpi,
            0x402 => Self::UnacceleratedAvic,
            other => Self::Unknown(other),
        }
    }
}

/// Dispatches one #VMEXIT of a customizable guest. On return either the
/// guest is ready to re-enter (the loader still names it) or the world has
/// been switched back and the exit context describes what surfaced.
pub(crate) fn handle_cvm_exit(
    global: &GlobalState,
    hostcpu: &mut HostCpu,
    vcpu: &CustomVcpu,
    state: &mut VcpuState,
    gprs: &mut GprState,
) {
    assert!(
        hostcpu.loader.guest_vmcb_pa == state.vmcb_pa,
        "#VMEXIT from an unrecognised VMCB: {:#x}",
        hostcpu.loader.guest_vmcb_pa
    );
    let entry_time = global.platform().time();
    state.stats.runtime += entry_time.wrapping_sub(state.stats.runtime_start);
    state.stats.selector = InterceptClass::Scheduler;
    let nsv_guest = vcpu
        .vm
        .upgrade()
        .is_some_and(|vm| vm.is_nsv_guest());
    // rax lives in the VMCB, not the captured frame.
    gprs.rax = state.vmcb.save.rax;
    state.vmcb.mark_all_clean();
    state.vmcb.control.tlb_control = vmcb::tlb_control::DO_NOTHING;
    // Hardware may have changed guest state behind the logical view.
    state.cache.synchronized = false;
    state.exit_context.vcpu_state.loaded = false;
    let code = ExitCode::decode(state.vmcb.control.exit_code as i64);
    match code {
        ExitCode::InvalidState => handle_invalid_state(global, hostcpu, vcpu, state, gprs, nsv_guest),
        ExitCode::CrRead(4) => emulate_cr4_read(state, gprs),
        ExitCode::CrWrite(4) => emulate_cr4_write(state, gprs),
        ExitCode::CrRead(cr) => surface_cr_access(global, hostcpu, vcpu, state, gprs, nsv_guest, cr, false),
        ExitCode::CrWrite(cr) => surface_cr_access(global, hostcpu, vcpu, state, gprs, nsv_guest, cr, true),
        ExitCode::DrRead(dr) => surface_dr_access(global, hostcpu, vcpu, state, gprs, nsv_guest, dr, false),
        ExitCode::DrWrite(dr) => surface_dr_access(global, hostcpu, vcpu, state, gprs, nsv_guest, dr, true),
        ExitCode::Exception(vector) => {
            handle_exception(global, hostcpu, vcpu, state, gprs, nsv_guest, vector);
        }
        // Physical events are retaken under host GIF after the switch.
        ExitCode::Intr | ExitCode::Nmi | ExitCode::Smi => {
            host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
            state.exit_context.intercept = CvmIntercept::SchedulerExit;
        }
        ExitCode::Cpuid => handle_cpuid(global, hostcpu, vcpu, state, gprs, nsv_guest),
        ExitCode::Rsm => {
            host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
            state.exit_context.intercept = CvmIntercept::Rsm;
            state.stats.selector = InterceptClass::Rsm;
        }
        ExitCode::Iret => handle_iret(global, hostcpu, vcpu, state, gprs, nsv_guest),
        ExitCode::Invd => {
            // INVD would drop dirty cache lines machine-wide; write back
            // instead.
            wbinvd();
            state.vmcb.advance_rip();
            state.stats.selector = InterceptClass::Emulation;
        }
        ExitCode::Hlt => {
            state.vmcb.advance_rip();
            host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
            state.exit_context.intercept = CvmIntercept::Hlt;
            state.stats.selector = InterceptClass::Halt;
        }
        ExitCode::Io => handle_io(global, hostcpu, vcpu, state, gprs, nsv_guest),
        ExitCode::Msr => handle_msr(global, hostcpu, vcpu, state, gprs, nsv_guest),
        ExitCode::TaskSwitch => {
            let selector = state.vmcb.control.exit_info1 as u16;
            let info2 = state.vmcb.control.exit_info2;
            host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
            state.exit_context.intercept = CvmIntercept::TaskSwitch {
                selector,
                error_code: info2 as u32,
                iret: (info2 & (1 << 36)) != 0,
                far_jump: (info2 & (1 << 38)) != 0,
            };
        }
        ExitCode::Shutdown => {
            host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
            state.exit_context.intercept = CvmIntercept::Shutdown;
        }
        // SVM instructions are not virtualized for CVM guests.
        ExitCode::Invlpga
        | ExitCode::Vmrun
        | ExitCode::Vmmcall
        | ExitCode::Vmload
        | ExitCode::Vmsave
        | ExitCode::Stgi
        | ExitCode::Clgi
        | ExitCode::Skinit => {
            state.vmcb.inject_event(EventInjection::invalid_opcode());
            state.vmcb.advance_rip();
            state.stats.selector = InterceptClass::Emulation;
        }
        ExitCode::NestedPageFault => {
            handle_nested_page_fault(global, hostcpu, vcpu, state, gprs, nsv_guest);
        }
        // AVIC assist exits carry no work on this path.
        ExitCode::IncompleteIpi | ExitCode::UnacceleratedAvic => (),
        ExitCode::Init
        | ExitCode::Vintr
        | ExitCode::Pause
        | ExitCode::Invlpg
        | ExitCode::VmsaBusy
        | ExitCode::IdleRequired
        | ExitCode::Unknown(_) => {
            // Nothing should produce these with the interceptions this
            // core programs.
            host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
            state.exit_context.intercept = CvmIntercept::SchedulerBug;
        }
    }
    if !hostcpu.loader.is_idle() {
        // Still in guest context; rax goes back into the VMCB.
        state.vmcb.save.rax = gprs.rax;
    } else if !nsv_guest {
        // For NSV guests the exit context stays sealed.
        if state.exit_context.intercept != CvmIntercept::SchedulerExit
            && !state.exit_context.vcpu_state.loaded
        {
            state.load_basic_exit_context();
        } else if vcpu.rescission_pending() {
            state.exit_context.intercept = CvmIntercept::Rescission;
        }
    }
    let class = state.stats.selector as usize;
    state.stats.classes[class].count += 1;
    state.stats.classes[class].time +=
        global.platform().time().wrapping_sub(entry_time);
}

/// Runs the VMCB consistency examinations and surfaces the first failed
/// one.
fn handle_invalid_state(
    _global: &GlobalState,
    hostcpu: &mut HostCpu,
    vcpu: &CustomVcpu,
    state: &mut VcpuState,
    gprs: &mut GprState,
    nsv_guest: bool,
) {
    let reason = examine_vmcb(&state.vmcb);
    host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
    state.exit_context.intercept = CvmIntercept::InvalidState(reason);
}

/// The consistency checks the processor applies before entry, so the
/// layered hypervisor can debug its own register programming.
///
/// See: 15.5.1 Basic Operation, Canonicalization and Consistency Checks
pub(crate) fn examine_vmcb(vmcb: &Vmcb) -> InvalidStateReason {
    const CR0_CD: u64 = 1 << 30;
    const CR0_NW: u64 = 1 << 29;
    const CR0_PG: u64 = 1 << 31;
    const CR0_PE: u64 = 1 << 0;
    const CR4_PAE: u64 = 1 << 5;
    const CR4_MBZ: u64 = 0xffff_ffff_ff08_f000;
    const EFER_LME: u64 = 1 << 8;
    const EFER_MBZ: u64 = 0xffff_ffff_fff9_0200;
    const CS_LONG: u16 = 1 << 9;
    const CS_DEFAULT: u16 = 1 << 10;
    let save = &vmcb.save;
    if (save.cr0 & CR0_CD) == 0 && (save.cr0 & CR0_NW) != 0 {
        return InvalidStateReason::Cr0CdClearNwSet;
    }
    if save.cr0 > 0xffff_ffff {
        return InvalidStateReason::Cr0UpperBitsSet;
    }
    if (save.cr3 >> 52) != 0 {
        return InvalidStateReason::Cr3MbzBitsSet;
    }
    if (save.cr4 & CR4_MBZ) != 0 {
        return InvalidStateReason::Cr4MbzBitsSet;
    }
    if save.dr6 > 0xffff_ffff {
        return InvalidStateReason::Dr6UpperBitsSet;
    }
    if save.dr7 > 0xffff_ffff {
        return InvalidStateReason::Dr7UpperBitsSet;
    }
    if (save.efer & EFER_MBZ) != 0 {
        return InvalidStateReason::EferMbzBitsSet;
    }
    let long_paged = (save.efer & EFER_LME) != 0 && (save.cr0 & CR0_PG) != 0;
    if long_paged && (save.cr4 & CR4_PAE) == 0 {
        return InvalidStateReason::LongModeWithoutPae;
    }
    if long_paged && (save.cr0 & CR0_PE) == 0 {
        return InvalidStateReason::LongModeWithoutProtection;
    }
    if long_paged
        && (save.cr4 & CR4_PAE) != 0
        && (save.cs_attrib & CS_LONG) != 0
        && (save.cs_attrib & CS_DEFAULT) != 0
    {
        return InvalidStateReason::LongModeWithCsDefaultSize;
    }
    let event = EventInjection(vmcb.control.event_inj);
    if event.valid() {
        let illegal_vector = event.event_type() == vmcb::event_type::EXCEPTION
            && (event.vector() >= 0x20 || event.vector() == 2);
        let reserved_type = event.event_type() == 1 || event.event_type() > 4;
        if illegal_vector || reserved_type {
            return InvalidStateReason::IllegalEventInjection;
        }
    }
    for base in [save.cs_base, save.ds_base, save.es_base, save.ss_base] {
        if base > 0x7fff_ffff_ffff && base < 0xffff_8000_0000_0000 {
            return InvalidStateReason::IncanonicalSegmentBase;
        }
    }
    InvalidStateReason::UnknownFailure
}

/// CR4 reads are emulated in place so CR4.MCE can be shadowed.
fn emulate_cr4_read(state: &mut VcpuState, gprs: &mut GprState) {
    const CR4_MCE: u64 = 1 << 6;
    let info = CrAccessInfo(state.vmcb.control.exit_info1);
    let mut value = state.vmcb.save.cr4;
    if !state.shadowed.mce {
        value &= !CR4_MCE;
    }
    gprs.set(info.gpr(), value);
    state.vmcb.advance_rip();
    state.stats.selector = InterceptClass::Emulation;
}

fn emulate_cr4_write(state: &mut VcpuState, gprs: &mut GprState) {
    const CR4_MCE: u64 = 1 << 6;
    let info = CrAccessInfo(state.vmcb.control.exit_info1);
    let value = gprs.get(info.gpr());
    state.shadowed.mce = (value & CR4_MCE) != 0;
    // The real MCE bit stays set so machine checks always reach the
    // host's interceptor.
    state.vmcb.save.cr4 = value | CR4_MCE;
    state.vmcb.invalidate(clean::CRX);
    state.vmcb.advance_rip();
    state.stats.selector = InterceptClass::Emulation;
}

#[allow(clippy::too_many_arguments)]
fn surface_cr_access(
    _global: &GlobalState,
    hostcpu: &mut HostCpu,
    vcpu: &CustomVcpu,
    state: &mut VcpuState,
    gprs: &mut GprState,
    nsv_guest: bool,
    cr: u8,
    write: bool,
) {
    let info = CrAccessInfo(state.vmcb.control.exit_info1);
    host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
    state.exit_context.intercept = CvmIntercept::CrAccess {
        cr,
        gpr: info.gpr() as u8,
        write,
        mov_instruction: info.mov_instruction(),
    };
    state.stats.selector = InterceptClass::Cr;
}

#[allow(clippy::too_many_arguments)]
fn surface_dr_access(
    _global: &GlobalState,
    hostcpu: &mut HostCpu,
    vcpu: &CustomVcpu,
    state: &mut VcpuState,
    gprs: &mut GprState,
    nsv_guest: bool,
    dr: u8,
    write: bool,
) {
    // Debug registers are only intercepted when the layered hypervisor
    // asked; no local policy applies.
    let info = DrAccessInfo(state.vmcb.control.exit_info1);
    host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
    state.exit_context.intercept = CvmIntercept::DrAccess {
        dr,
        gpr: info.gpr() as u8,
        write,
    };
    state.stats.selector = InterceptClass::Dr;
}

fn handle_exception(
    global: &GlobalState,
    hostcpu: &mut HostCpu,
    vcpu: &CustomVcpu,
    state: &mut VcpuState,
    gprs: &mut GprState,
    nsv_guest: bool,
    vector: u8,
) {
    const PAGE_FAULT: u8 = 14;
    const MACHINE_CHECK: u8 = 18;
    const SECURITY_EXCEPTION: u8 = 30;
    const SX_INIT_REDIRECTION: u64 = 1;
    match vector {
        MACHINE_CHECK => {
            // The layered hypervisor never owns #MC; control may come back
            // if it turns out correctable.
            host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
            state.exit_context.intercept = CvmIntercept::SchedulerExit;
        }
        SECURITY_EXCEPTION if state.vmcb.control.exit_info1 == SX_INIT_REDIRECTION => {
            // An INIT signal arrived while the guest was running and was
            // redirected into #SX. Schedule out, then emulate what the
            // INIT would have done to this processor.
            host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
            state.exit_context.intercept = CvmIntercept::SchedulerExit;
            vcpu::emulate_init_signal(&mut hostcpu.vmcb, gprs, global.facts().cpuid_fms);
            dr0_write(0);
            dr1_write(0);
            dr2_write(0);
            dr3_write(0);
            hostcpu.activity = ActivityState::WaitForSipi;
        }
        _ => {
            let error_code_valid = matches!(vector, 11 | 12 | 13 | 14 | 17 | 21 | 30);
            let error_code = state.vmcb.control.exit_info1 as u32;
            let fault_address = state.vmcb.control.exit_info2;
            let instruction_bytes = if vector == PAGE_FAULT {
                fetched_bytes(&state.vmcb)
            } else {
                InstructionBytes::default()
            };
            host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
            state.exit_context.intercept = CvmIntercept::Exception {
                vector,
                error_code: error_code_valid.then_some(error_code),
                fault_address: if vector == PAGE_FAULT { fault_address } else { 0 },
                instruction_bytes,
            };
            state.stats.selector = InterceptClass::Exception;
        }
    }
}

fn fetched_bytes(vmcb: &Vmcb) -> InstructionBytes {
    let (len, bytes) = vmcb.fetched_instruction();
    InstructionBytes {
        len: len.min(15),
        bytes,
    }
}

fn handle_cpuid(
    _global: &GlobalState,
    hostcpu: &mut HostCpu,
    vcpu: &CustomVcpu,
    state: &mut VcpuState,
    gprs: &mut GprState,
    nsv_guest: bool,
) {
    const HV_PRESENT: u32 = 1 << 31;
    const SVM_FEATURE: u32 = 1 << 2;
    let leaf = gprs.rax as u32;
    let subleaf = gprs.rcx as u32;
    if state.options.intercept_cpuid {
        host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
        state.exit_context.intercept = CvmIntercept::Cpuid { leaf, subleaf };
        state.stats.selector = InterceptClass::Cpuid;
        // rip advances only once the layered hypervisor completed the leaf.
        return;
    }
    let (eax, ebx, ecx, edx);
    if (leaf >> 30) == 1 {
        // The hypervisor leaf class.
        match leaf {
            0x4000_0000 => {
                eax = 0x4000_0001;
                ebx = u32::from_le_bytes(*b"Noir");
                ecx = u32::from_le_bytes(*b"Viso");
                edx = u32::from_le_bytes(*b"r ZT");
            }
            0x4000_0001 => {
                // The interface signature declares non-conformance to the
                // Microsoft hypervisor specification.
                eax = u32::from_le_bytes(*b"Hv#0");
                ebx = 0;
                ecx = 0;
                edx = 0;
            }
            _ => {
                eax = 0;
                ebx = 0;
                ecx = 0;
                edx = 0;
            }
        }
    } else {
        let mut info = x86::cpuid::cpuid!(leaf, subleaf);
        match leaf {
            0x0000_0001 => {
                info.ecx |= HV_PRESENT;
                // The local APIC id tracks the vCPU, not the host core.
                let vcpu_count = vcpu.vm.upgrade().map_or(1, |vm| vm.vcpu_count());
                info.ebx = (info.ebx & 0xffff)
                    | ((vcpu_count & 0xff) << 16)
                    | ((vcpu.id & 0xff) << 24);
            }
            0x8000_0001 => info.ecx &= !SVM_FEATURE,
            // SVM features and memory encryption are hidden entirely.
            0x8000_000a | 0x8000_001f => {
                info.eax = 0;
                info.ebx = 0;
                info.ecx = 0;
                info.edx = 0;
            }
            _ => (),
        }
        eax = info.eax;
        ebx = info.ebx;
        ecx = info.ecx;
        edx = info.edx;
    }
    gprs.rax = u64::from(eax);
    gprs.rbx = u64::from(ebx);
    gprs.rcx = u64::from(ecx);
    gprs.rdx = u64::from(edx);
    state.vmcb.advance_rip();
    state.stats.selector = InterceptClass::Emulation;
}

/// The iret instruction closes an NMI window: deliver the parked NMI, or
/// report the window if that is what the layered hypervisor wanted.
fn handle_iret(
    _global: &GlobalState,
    hostcpu: &mut HostCpu,
    vcpu: &CustomVcpu,
    state: &mut VcpuState,
    gprs: &mut GprState,
    nsv_guest: bool,
) {
    if state.prev_nmi {
        state.prev_nmi = false;
        // Inject the pending NMI now and keep watching iret; nested NMIs
        // queue behind the next window.
        let mut event = EventInjection(0);
        event.set_vector(u64::from(state.injected_event.vector));
        event.set_event_type(u64::from(state.injected_event.kind));
        event.set_valid(true);
        state.vmcb.control.event_inj = event.0;
    } else if state.options.intercept_nmi_window {
        host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
        state.exit_context.intercept = CvmIntercept::InterruptWindow {
            nmi: true,
            iret_passed: false,
        };
        state.vmcb.control.intercept_misc1 &= !misc1::IRET;
        state.vmcb.invalidate(clean::INTERCEPTS);
    }
    state.stats.selector = InterceptClass::Emulation;
}

fn handle_io(
    _global: &GlobalState,
    hostcpu: &mut HostCpu,
    vcpu: &CustomVcpu,
    state: &mut VcpuState,
    gprs: &mut GprState,
    nsv_guest: bool,
) {
    const UART_FIRST: u16 = 0x3f8;
    const UART_LAST: u16 = 0x3ff;
    let info = IoAccessInfo(state.vmcb.control.exit_info1 as u32);
    let port = info.port() as u16;
    if (UART_FIRST..=UART_LAST).contains(&port) {
        // The debug UART is hypervisor property. Reads are zero-filled,
        // writes vanish, and the instruction completes.
        if info.input() {
            gprs.rax &= match info.operand_size() {
                1 => !0xff,
                2 => !0xffff,
                _ => 0,
            };
        }
        // IOIO exits latch the following rip in EXITINFO2.
        state.vmcb.save.rip = state.vmcb.control.exit_info2;
        state.stats.selector = InterceptClass::Emulation;
        return;
    }
    let access = IoAccess {
        input: info.input(),
        string: info.string(),
        repeat: info.repeat(),
        operand_size: info.operand_size(),
        address_width: info.address_width(),
    };
    let (selector, attrib, limit, base) = state.vmcb.segment(u64::from(info.segment()));
    let segment = Segment {
        selector,
        attributes: vmcb::unpack_segment_attributes(attrib),
        limit,
        base,
    };
    let (rax, rcx, rsi, rdi) = (gprs.rax, gprs.rcx, gprs.rsi, gprs.rdi);
    host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
    state.exit_context.intercept = CvmIntercept::Io {
        access,
        port,
        rax,
        rcx,
        rsi,
        rdi,
        segment,
    };
    state.stats.selector = InterceptClass::Io;
}

/// The MSR classes the interception-refinement word can select.
fn msr_refinement_intercepts(state: &VcpuState, index: u32) -> bool {
    const APIC_BASE: u32 = 0x1b;
    const X2APIC_FIRST: u32 = 0x800;
    const X2APIC_LAST: u32 = 0x8ff;
    let refinement = &state.msr_interceptions;
    match index {
        APIC_BASE => refinement.intercept_apic,
        // The MTRR family plus the PAT.
        0xfe | 0x200..=0x20f | 0x250 | 0x258 | 0x259 | 0x268..=0x26f | 0x277 | 0x2ff => {
            refinement.intercept_mtrr
        }
        0x174..=0x176 => refinement.intercept_sysenter,
        // CET: U_CET, S_CET, the PLn shadow-stack pointers and ISST.
        0x6a0 | 0x6a2 | 0x6a4..=0x6a8 => refinement.intercept_cet,
        0xc000_0081..=0xc000_0084 | 0xc000_0100..=0xc000_0102 => refinement.intercept_syscall,
        // SMM: the SMI trigger, P-state controls, SMBASE and the TSEG
        // mask family.
        0xc001_0056 | 0xc001_0061..=0xc001_0063 | 0xc001_0111..=0xc001_0113 | 0xc001_011a => {
            refinement.intercept_smm
        }
        X2APIC_FIRST..=X2APIC_LAST => refinement.intercept_apic,
        _ => false,
    }
}

fn handle_msr(
    _global: &GlobalState,
    hostcpu: &mut HostCpu,
    vcpu: &CustomVcpu,
    state: &mut VcpuState,
    gprs: &mut GprState,
    nsv_guest: bool,
) {
    let write = state.vmcb.control.exit_info1 != 0;
    let index = gprs.rcx as u32;
    let value = (gprs.rdx << 32) | (gprs.rax & 0xffff_ffff);
    // The synthetic NSV window is handled before any interception policy;
    // it is how a guest becomes confidential in the first place.
    if nsv::msr::in_range(index) {
        handle_nsv_msr(hostcpu, vcpu, state, gprs, nsv_guest, write, index, value);
        return;
    }
    let surfaced = if state.options.intercept_msr {
        if state.msr_interceptions.valid {
            msr_refinement_intercepts(state, index)
        } else {
            true
        }
    } else {
        false
    };
    if surfaced {
        host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
        state.exit_context.intercept = if write {
            CvmIntercept::Wrmsr { index, value }
        } else {
            CvmIntercept::Rdmsr { index }
        };
        state.stats.selector = InterceptClass::Msr;
        return;
    }
    let served = if write {
        emulate_wrmsr(state, index, value)
    } else {
        match emulate_rdmsr(state, index) {
            Some(value) => {
                gprs.rax = value & 0xffff_ffff;
                gprs.rdx = value >> 32;
                true
            }
            None => false,
        }
    };
    if served {
        state.vmcb.advance_rip();
        state.stats.selector = InterceptClass::Emulation;
    } else if state.options.intercept_exceptions {
        // The layered hypervisor asked to see exceptions; give it the #GP
        // instead of injecting.
        host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
        state.exit_context.intercept = CvmIntercept::Exception {
            vector: 13,
            error_code: Some(0),
            fault_address: 0,
            instruction_bytes: InstructionBytes::default(),
        };
        state.stats.selector = InterceptClass::Exception;
    } else {
        state.vmcb.inject_event(EventInjection::general_protection());
        state.stats.selector = InterceptClass::Emulation;
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_nsv_msr(
    hostcpu: &mut HostCpu,
    vcpu: &CustomVcpu,
    state: &mut VcpuState,
    gprs: &mut GprState,
    nsv_guest: bool,
    write: bool,
    index: u32,
    value: u64,
) {
    state.stats.selector = InterceptClass::Emulation;
    if write {
        match nsv::handle_synthetic_wrmsr(state, nsv_guest, index, value) {
            nsv::SyntheticMsrOutcome::Handled => state.vmcb.advance_rip(),
            nsv::SyntheticMsrOutcome::Fault => {
                state.vmcb.inject_event(EventInjection::general_protection());
            }
            nsv::SyntheticMsrOutcome::Surface(intercept) => {
                if let CvmIntercept::NsvActivate { activated } = intercept {
                    if let Some(vm) = vcpu.vm.upgrade() {
                        vm.set_nsv_guest(activated);
                    }
                }
                state.vmcb.advance_rip();
                host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
                state.exit_context.intercept = intercept;
            }
        }
    } else {
        match nsv::handle_synthetic_rdmsr(state, index) {
            Ok(value) => {
                gprs.rax = value & 0xffff_ffff;
                gprs.rdx = value >> 32;
                state.vmcb.advance_rip();
            }
            Err(()) => {
                state.vmcb.inject_event(EventInjection::general_protection());
            }
        }
    }
}

/// The whitelist the core can serve from the VMCB without leaving guest
/// context, with EFER.SVME shadowed through the vCPU's shadow bits.
fn emulate_rdmsr(state: &mut VcpuState, index: u32) -> Option<u64> {
    const EFER_SVME: u64 = 1 << 12;
    Some(match index {
        0x174 => state.vmcb.save.sysenter_cs,
        0x175 => state.vmcb.save.sysenter_esp,
        0x176 => state.vmcb.save.sysenter_eip,
        0x277 => state.vmcb.save.gpat,
        0xc000_0080 => {
            let mut value = state.vmcb.save.efer;
            if !state.shadowed.svme {
                value &= !EFER_SVME;
            }
            value
        }
        0xc000_0081 => state.vmcb.save.star,
        0xc000_0082 => state.vmcb.save.lstar,
        0xc000_0083 => state.vmcb.save.cstar,
        0xc000_0084 => state.vmcb.save.sf_mask,
        0xc000_0100 => state.vmcb.save.fs_base,
        0xc000_0101 => state.vmcb.save.gs_base,
        0xc000_0102 => state.vmcb.save.kernel_gs_base,
        _ => return None,
    })
}

fn emulate_wrmsr(state: &mut VcpuState, index: u32, value: u64) -> bool {
    const EFER_SVME: u64 = 1 << 12;
    match index {
        0x174 => state.vmcb.save.sysenter_cs = value,
        0x175 => state.vmcb.save.sysenter_esp = value,
        0x176 => state.vmcb.save.sysenter_eip = value,
        0x277 => {
            state.vmcb.save.gpat = value;
            // The guest PAT is cached under the nested-paging clean bit.
            state.vmcb.invalidate(clean::NPT);
        }
        0xc000_0080 => {
            state.shadowed.svme = (value & EFER_SVME) != 0;
            state.vmcb.save.efer = value | EFER_SVME;
            state.vmcb.invalidate(clean::CRX);
        }
        0xc000_0081 => state.vmcb.save.star = value,
        0xc000_0082 => state.vmcb.save.lstar = value,
        0xc000_0083 => state.vmcb.save.cstar = value,
        0xc000_0084 => state.vmcb.save.sf_mask = value,
        0xc000_0100 => state.vmcb.save.fs_base = value,
        0xc000_0101 => state.vmcb.save.gs_base = value,
        0xc000_0102 => state.vmcb.save.kernel_gs_base = value,
        _ => return false,
    }
    true
}

fn handle_nested_page_fault(
    _global: &GlobalState,
    hostcpu: &mut HostCpu,
    vcpu: &CustomVcpu,
    state: &mut VcpuState,
    gprs: &mut GprState,
    nsv_guest: bool,
) {
    let fault = NptFaultCode(state.vmcb.control.exit_info1);
    let gpa = state.vmcb.control.exit_info2;
    if nsv_guest {
        // A confidential guest handles its own memory events through the
        // #VC vector so nothing about the access leaks; surfacing happens
        // only when no handler is registered, with the fetched bytes
        // withheld.
        if nsv::prepare_vc_dispatch(state, 0x400, state.vmcb.control.exit_info1, gpa) {
            state.stats.selector = InterceptClass::Npf;
            return;
        }
    }
    let instruction_bytes = if nsv_guest {
        InstructionBytes::default()
    } else {
        fetched_bytes(&state.vmcb)
    };
    host::switch_to_host(hostcpu, vcpu, state, gprs, nsv_guest);
    state.exit_context.intercept = CvmIntercept::MemoryAccess {
        gpa,
        read: fault.present(),
        write: fault.write(),
        execute: fault.execute(),
        user: fault.user(),
        instruction_bytes,
    };
    state.stats.selector = InterceptClass::Npf;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_state::tests::test_global;
    use crate::vm::CustomVm;
    use alloc::sync::Arc;

    struct Harness {
        global: Arc<crate::global_state::GlobalState>,
        vm: Arc<CustomVm>,
        vcpu: Arc<CustomVcpu>,
    }

    fn harness() -> Harness {
        let global = test_global();
        let vm = CustomVm::create(&global, 1).unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        Harness { global, vm, vcpu }
    }

    /// Drives one exit through the dispatcher the way the run loop does.
    fn dispatch(h: &Harness, gprs: &mut GprState, prepare: impl FnOnce(&mut VcpuState)) {
        let mut hostcpu = crate::host::HostCpu::new(0, 0x240);
        let mut state = h.vcpu.state();
        prepare(&mut state);
        hostcpu.loader.set_running(&h.vcpu, state.vmcb_pa);
        handle_cvm_exit(&h.global, &mut hostcpu, &h.vcpu, &mut state, gprs);
    }

    #[test]
    fn hlt_surfaces_with_rip_advanced() {
        let h = harness();
        let mut gprs = GprState::default();
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.exit_code = 0x78;
            state.vmcb.save.rip = 0;
            state.vmcb.control.nrip = 1;
        });
        let state = h.vcpu.state();
        assert_eq!(state.exit_context.intercept, CvmIntercept::Hlt);
        assert_eq!(state.exit_context.rip, 1);
        assert!(state.exit_context.vcpu_state.loaded);
        assert_eq!(state.stats.classes[InterceptClass::Halt as usize].count, 1);
        drop(state);
        h.vm.release();
    }

    #[test]
    fn cpuid_hypervisor_leaves_are_emulated_in_place() {
        let h = harness();
        let mut gprs = GprState {
            rax: 0x4000_0000,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.exit_code = 0x72;
            state.vmcb.save.rip = 0x100;
            state.vmcb.control.nrip = 0x102;
        });
        assert_eq!(gprs.rax, 0x4000_0001);
        assert_eq!(gprs.rbx, u64::from(u32::from_le_bytes(*b"Noir")));
        assert_eq!(gprs.rcx, u64::from(u32::from_le_bytes(*b"Viso")));
        assert_eq!(gprs.rdx, u64::from(u32::from_le_bytes(*b"r ZT")));
        let state = h.vcpu.state();
        // Emulated: no surfaced context, rip advanced, still resumable.
        assert_eq!(state.vmcb.save.rip, 0x102);
        drop(state);

        let mut gprs = GprState {
            rax: 0x4000_0001,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.exit_code = 0x72;
        });
        assert_eq!(gprs.rax, u64::from(u32::from_le_bytes(*b"Hv#0")));
        assert_eq!(gprs.rbx, 0);

        // The standard feature leaf reports hypervisor presence and the
        // vCPU topology; the extended one hides SVM.
        let mut gprs = GprState {
            rax: 0x1,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.exit_code = 0x72;
        });
        assert_ne!(gprs.rcx & (1 << 31), 0);
        assert_eq!((gprs.rbx >> 24) & 0xff, 0); // vCPU 0
        assert_eq!((gprs.rbx >> 16) & 0xff, 1); // one vCPU created

        let mut gprs = GprState {
            rax: 0x8000_0001,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.exit_code = 0x72;
        });
        assert_eq!(gprs.rcx & (1 << 2), 0);

        let mut gprs = GprState {
            rax: 0x8000_000a,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.exit_code = 0x72;
        });
        assert_eq!((gprs.rax, gprs.rbx, gprs.rcx, gprs.rdx), (0, 0, 0, 0));
        h.vm.release();
    }

    #[test]
    fn cpuid_interception_surfaces_the_leaf() {
        let h = harness();
        let mut gprs = GprState {
            rax: 0x1234,
            rcx: 0x5,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.options.intercept_cpuid = true;
            state.vmcb.control.exit_code = 0x72;
        });
        let state = h.vcpu.state();
        assert_eq!(
            state.exit_context.intercept,
            CvmIntercept::Cpuid {
                leaf: 0x1234,
                subleaf: 0x5
            }
        );
        drop(state);
        h.vm.release();
    }

    #[test]
    fn msr_refinement_surfaces_apic_and_emulates_star() {
        let h = harness();
        // Guest reads the APIC base: surfaced.
        let mut gprs = GprState {
            rcx: 0x1b,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.options.intercept_msr = true;
            state.msr_interceptions.valid = true;
            state.msr_interceptions.intercept_apic = true;
            state.vmcb.control.exit_code = 0x7c;
            state.vmcb.control.exit_info1 = 0; // read
        });
        {
            let state = h.vcpu.state();
            assert_eq!(
                state.exit_context.intercept,
                CvmIntercept::Rdmsr { index: 0x1b }
            );
        }
        // Guest reads STAR: served from the VMCB, no exit surfaced.
        let mut gprs = GprState {
            rcx: 0xc000_0081,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.save.star = 0x1122_3344_5566_7788;
            state.vmcb.control.exit_code = 0x7c;
            state.vmcb.control.exit_info1 = 0;
            state.vmcb.save.rip = 0x10;
            state.vmcb.control.nrip = 0x12;
        });
        assert_eq!(gprs.rax, 0x5566_7788);
        assert_eq!(gprs.rdx, 0x1122_3344);
        let state = h.vcpu.state();
        assert_eq!(state.vmcb.save.rip, 0x12);
        drop(state);
        h.vm.release();
    }

    #[test]
    fn msr_write_then_read_round_trips_with_svme_shadow() {
        let h = harness();
        // Write EFER with SVME clear.
        let mut gprs = GprState {
            rcx: 0xc000_0080,
            rax: 0x0d01,
            rdx: 0,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.exit_code = 0x7c;
            state.vmcb.control.exit_info1 = 1; // write
            state.vmcb.control.nrip = 0x2;
        });
        {
            let state = h.vcpu.state();
            // The hardware value carries SVME; the shadow remembers.
            assert_eq!(state.vmcb.save.efer, 0x1d01);
            assert!(!state.shadowed.svme);
        }
        // Read it back: SVME is masked off again.
        let mut gprs = GprState {
            rcx: 0xc000_0080,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.exit_code = 0x7c;
            state.vmcb.control.exit_info1 = 0;
        });
        assert_eq!(gprs.rax, 0x0d01);
        h.vm.release();
    }

    #[test]
    fn unknown_msr_injects_gp_or_surfaces_exception() {
        let h = harness();
        let mut gprs = GprState {
            rcx: 0x9999,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.exit_code = 0x7c;
            state.vmcb.control.exit_info1 = 0;
        });
        {
            let state = h.vcpu.state();
            let event = EventInjection(state.vmcb.control.event_inj);
            assert!(event.valid());
            assert_eq!(event.vector(), 13);
        }
        // With exception interception on, the #GP surfaces instead.
        let mut gprs = GprState {
            rcx: 0x9999,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.event_inj = 0;
            state.options.intercept_exceptions = true;
            state.vmcb.control.exit_code = 0x7c;
            state.vmcb.control.exit_info1 = 0;
        });
        let state = h.vcpu.state();
        assert!(matches!(
            state.exit_context.intercept,
            CvmIntercept::Exception { vector: 13, .. }
        ));
        drop(state);
        h.vm.release();
    }

    #[test]
    fn cr4_shadowing_hides_mce() {
        let h = harness();
        // Guest writes CR4 without MCE.
        let mut gprs = GprState {
            rbx: 0x20,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.exit_code = 0x14; // write CR4
            state.vmcb.control.exit_info1 = 3; // via rbx
        });
        {
            let state = h.vcpu.state();
            assert_eq!(state.vmcb.save.cr4, 0x20 | (1 << 6));
            assert!(!state.shadowed.mce);
        }
        // Guest reads CR4 back: MCE is hidden again.
        let mut gprs = GprState::default();
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.exit_code = 0x04; // read CR4
            state.vmcb.control.exit_info1 = 3;
        });
        assert_eq!(gprs.rbx, 0x20);
        h.vm.release();
    }

    #[test]
    fn uart_io_is_swallowed_and_other_io_surfaces() {
        let h = harness();
        // IN al, 0x3f8: zero-filled, resumed.
        let mut gprs = GprState {
            rax: 0xffff_ffff_ffff_ffff,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.save.rax = 0xffff_ffff_ffff_ffff;
            state.vmcb.control.exit_code = 0x7b;
            // IN, 8-bit, port 0x3f8.
            state.vmcb.control.exit_info1 = 0x03f8_0011;
            state.vmcb.control.exit_info2 = 0x77;
        });
        {
            let state = h.vcpu.state();
            assert_eq!(state.vmcb.save.rax & 0xff, 0);
            assert_eq!(state.vmcb.save.rip, 0x77);
        }
        // OUT 0x71 surfaces with the register file.
        let mut gprs = GprState {
            rax: 0xab,
            rcx: 1,
            rsi: 2,
            rdi: 3,
            ..GprState::default()
        };
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.save.rax = 0xab;
            state.vmcb.control.exit_code = 0x7b;
            state.vmcb.control.exit_info1 = 0x0071_0010;
        });
        let state = h.vcpu.state();
        match state.exit_context.intercept {
            CvmIntercept::Io {
                access,
                port,
                rax,
                rcx,
                rsi,
                rdi,
                ..
            } => {
                assert!(!access.input);
                assert_eq!(port, 0x71);
                assert_eq!((rax, rcx, rsi, rdi), (0xab, 1, 2, 3));
            }
            ref other => panic!("unexpected intercept {other:?}"),
        }
        drop(state);
        h.vm.release();
    }

    #[test]
    fn nested_page_fault_surfaces_with_fetched_bytes() {
        let h = harness();
        let mut gprs = GprState::default();
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.exit_code = 0x400;
            state.vmcb.control.exit_info1 = 0b10; // write, not present
            state.vmcb.control.exit_info2 = 0x1_0000;
            state.vmcb.control.bytes_fetched = 3;
            state.vmcb.control.guest_instruction_bytes[..3].copy_from_slice(&[0x88, 0x07, 0x90]);
        });
        let state = h.vcpu.state();
        match state.exit_context.intercept {
            CvmIntercept::MemoryAccess {
                gpa,
                read,
                write,
                instruction_bytes,
                ..
            } => {
                assert_eq!(gpa, 0x1_0000);
                assert!(!read);
                assert!(write);
                assert_eq!(instruction_bytes.len, 3);
                assert_eq!(&instruction_bytes.bytes[..3], &[0x88, 0x07, 0x90]);
            }
            ref other => panic!("unexpected intercept {other:?}"),
        }
        drop(state);
        h.vm.release();
    }

    #[test]
    fn invalid_state_reports_the_failed_examination() {
        let mut vmcb = Vmcb::boxed_zeroed();
        // NW set with CD clear.
        vmcb.save.cr0 = 1 << 29;
        assert_eq!(examine_vmcb(&vmcb), InvalidStateReason::Cr0CdClearNwSet);
        vmcb.save.cr0 = 0;
        vmcb.save.efer = (1 << 8) | (1 << 12);
        vmcb.save.cr0 = 1 << 31;
        assert_eq!(examine_vmcb(&vmcb), InvalidStateReason::LongModeWithoutPae);
        vmcb.save.cr4 = 1 << 5;
        assert_eq!(
            examine_vmcb(&vmcb),
            InvalidStateReason::LongModeWithoutProtection
        );
        vmcb.save.cr0 |= 1;
        vmcb.save.cs_attrib = (1 << 9) | (1 << 10);
        assert_eq!(
            examine_vmcb(&vmcb),
            InvalidStateReason::LongModeWithCsDefaultSize
        );
        vmcb.save.cs_attrib = 1 << 9;
        vmcb.save.ss_base = 0x8000_0000_0000;
        assert_eq!(
            examine_vmcb(&vmcb),
            InvalidStateReason::IncanonicalSegmentBase
        );
        vmcb.save.ss_base = 0;
        vmcb.inject_event(EventInjection::exception(2, None));
        assert_eq!(
            examine_vmcb(&vmcb),
            InvalidStateReason::IllegalEventInjection
        );
    }

    #[test]
    fn init_redirection_parks_the_processor() {
        let h = harness();
        let mut hostcpu = crate::host::HostCpu::new(0, 0x240);
        hostcpu.vmcb.save.cr0 = 0xc000_0033;
        let mut gprs = GprState::default();
        let mut state = h.vcpu.state();
        state.vmcb.control.exit_code = 0x5e;
        state.vmcb.control.exit_info1 = 1; // INIT redirection
        hostcpu.loader.set_running(&h.vcpu, state.vmcb_pa);
        handle_cvm_exit(&h.global, &mut hostcpu, &h.vcpu, &mut state, &mut gprs);
        assert_eq!(state.exit_context.intercept, CvmIntercept::SchedulerExit);
        assert_eq!(hostcpu.activity, ActivityState::WaitForSipi);
        // The host VMCB took the INIT reset.
        assert_eq!(hostcpu.vmcb.save.rip, 0xfff0);
        assert_eq!(hostcpu.vmcb.save.cs_selector, 0xf000);
        // CD survives; PG and PE are gone.
        assert_eq!(hostcpu.vmcb.save.cr0 & (1 << 30), 0x4000_0000);
        assert_eq!(hostcpu.vmcb.save.cr0 & 0x8000_0001, 0);
        // A startup IPI wakes it at the vectored segment.
        hostcpu.deliver_sipi(0x12);
        assert_eq!(hostcpu.vmcb.save.cs_selector, 0x1200);
        assert_eq!(hostcpu.vmcb.save.rip, 0);
        drop(state);
        h.vm.release();
    }

    #[test]
    fn rescission_overrides_a_scheduler_exit() {
        let h = harness();
        h.vcpu.rescind().unwrap();
        let mut gprs = GprState::default();
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.exit_code = 0x61; // physical NMI
        });
        let state = h.vcpu.state();
        assert_eq!(state.exit_context.intercept, CvmIntercept::Rescission);
        drop(state);
        // The bit was consumed; a fresh run would enter normally.
        assert!(!h.vcpu.rescission_pending());
        h.vm.release();
    }

    #[test]
    fn svm_instructions_get_ud() {
        let h = harness();
        let mut gprs = GprState::default();
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.exit_code = 0x80; // VMRUN
            state.vmcb.control.nrip = 0x3;
        });
        let state = h.vcpu.state();
        let event = EventInjection(state.vmcb.control.event_inj);
        assert!(event.valid());
        assert_eq!(event.vector(), 6);
        assert_eq!(state.vmcb.save.rip, 0x3);
        drop(state);
        h.vm.release();
    }

    #[test]
    fn nmi_window_via_iret() {
        let h = harness();
        // A pending NMI was parked at entry; iret delivers it.
        let mut gprs = GprState::default();
        dispatch(&h, &mut gprs, |state| {
            state.prev_nmi = true;
            state.injected_event.vector = 2;
            state.injected_event.kind = vmcb::event_type::NMI as u8;
            state.injected_event.valid = true;
            state.vmcb.control.exit_code = 0x74;
        });
        {
            let state = h.vcpu.state();
            let event = EventInjection(state.vmcb.control.event_inj);
            assert!(event.valid());
            assert_eq!(event.event_type(), vmcb::event_type::NMI);
            assert!(!state.prev_nmi);
        }
        // With the window interception armed instead, the iret surfaces.
        let mut gprs = GprState::default();
        dispatch(&h, &mut gprs, |state| {
            state.vmcb.control.event_inj = 0;
            state.options.intercept_nmi_window = true;
            state.vmcb.control.intercept_misc1 |= misc1::IRET;
            state.vmcb.control.exit_code = 0x74;
        });
        let state = h.vcpu.state();
        assert_eq!(
            state.exit_context.intercept,
            CvmIntercept::InterruptWindow {
                nmi: true,
                iret_passed: false
            }
        );
        assert_eq!(state.vmcb.control.intercept_misc1 & misc1::IRET, 0);
        drop(state);
        h.vm.release();
    }
}
