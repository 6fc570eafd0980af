//! The module containing the [`CustomVcpu`] type: the logical register
//! file, the state cache coordinating it with the hardware VMCB, the world
//! switch, and the scheduler facade the layered hypervisor calls.

use crate::{
    asid::ASID_NONE,
    error::{HvError, Result},
    hypercall::HypercallCode,
    nsv::NsvState,
    platform::pa_of,
    vm::CustomVm,
    vmcb::{self, clean, EventInjection, Vmcb, VirtualInterruptControl},
    x86_instructions::{
        cr2, cr2_write, dr0, dr0_write, dr1, dr1_write, dr2, dr2_write, dr3, dr3_write, sti,
        xgetbv, xrstor, xsave, xsetbv,
    },
};
use alloc::{boxed::Box, sync::Weak};
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

/// The guest general-purpose registers in hardware operand-numbering order,
/// as captured and loaded by the run trampoline.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
#[allow(missing_docs)]
pub struct GprState {
    pub rax: u64, // +0x00
    pub rcx: u64, // +0x08
    pub rdx: u64, // +0x10
    pub rbx: u64, // +0x18
    pub rsp: u64, // +0x20
    pub rbp: u64, // +0x28
    pub rsi: u64, // +0x30
    pub rdi: u64, // +0x38
    pub r8: u64,  // +0x40
    pub r9: u64,  // +0x48
    pub r10: u64, // +0x50
    pub r11: u64, // +0x58
    pub r12: u64, // +0x60
    pub r13: u64, // +0x68
    pub r14: u64, // +0x70
    pub r15: u64, // +0x78
}

impl GprState {
    /// Reads a register by its hardware number, as decode assists report
    /// operands.
    pub fn get(&self, index: u64) -> u64 {
        match index & 0xf {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    /// Writes a register by its hardware number.
    pub fn set(&mut self, index: u64, value: u64) {
        let slot = match index & 0xf {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            _ => &mut self.r15,
        };
        *slot = value;
    }
}

/// One segment register in the logical view. Attributes use the descriptor
/// format; the VMCB packing is applied on the way in and out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// The selector.
    pub selector: u16,
    /// Descriptor-format attributes (bits 40..56 of a descriptor).
    pub attributes: u16,
    /// The limit.
    pub limit: u32,
    /// The base address.
    pub base: u64,
}

/// All segment and descriptor-table registers of the logical view.
#[derive(Debug, Default, Clone, Copy)]
#[allow(missing_docs)]
pub struct SegmentState {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub ss: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub tr: Segment,
    pub ldtr: Segment,
    pub gdtr: Segment,
    pub idtr: Segment,
}

/// The control registers of the logical view.
#[derive(Debug, Default, Clone, Copy)]
#[allow(missing_docs)]
pub struct ControlRegs {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
}

/// The debug registers of the logical view.
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct DebugRegs {
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
}

impl Default for DebugRegs {
    fn default() -> Self {
        Self {
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr6: 0xffff_0ff0,
            dr7: 0x400,
        }
    }
}

/// The VMCB-resident MSRs of the logical view.
#[derive(Debug, Default, Clone, Copy)]
#[allow(missing_docs)]
pub struct MsrState {
    pub efer: u64,
    pub pat: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub kernel_gs_base: u64,
}

/// Per-field validity bits coordinating the logical view with the VMCB.
///
/// A set flag means the VMCB holds the field and may be trusted; a clear
/// flag means the layered hypervisor rewrote the logical view and the VMCB
/// must be refreshed on the next entry. `synchronized` reports whether the
/// logical view has been pulled back since the last guest run.
#[derive(Debug, Default, Clone, Copy)]
#[allow(missing_docs)]
pub struct StateCache {
    pub gpr_valid: bool,
    pub dr_valid: bool,
    pub cr_valid: bool,
    pub cr2_valid: bool,
    pub tpr_valid: bool,
    pub seg_valid: bool,
    pub fs_gs_valid: bool,
    pub tr_ldtr_valid: bool,
    pub dt_valid: bool,
    pub efer_valid: bool,
    pub pat_valid: bool,
    pub sysenter_valid: bool,
    pub syscall_valid: bool,
    pub asid_valid: bool,
    pub tlb_valid: bool,
    pub synchronized: bool,
}

impl StateCache {
    /// Marks every field as rewritten so the next entry pushes the whole
    /// logical view.
    pub fn invalidate_all(&mut self) {
        *self = Self::default();
    }
}

/// Behavior switches of one vCPU, set by the layered hypervisor.
#[derive(Debug, Default, Clone, Copy)]
#[allow(missing_docs)]
pub struct VcpuOptions {
    pub intercept_cpuid: bool,
    pub intercept_msr: bool,
    pub intercept_interrupt_window: bool,
    pub intercept_exceptions: bool,
    pub intercept_cr3: bool,
    pub intercept_drx: bool,
    pub intercept_rsm: bool,
    pub intercept_nmi_window: bool,
    pub blocking_by_nmi: bool,
    /// Kernel-priority scheduling: the scheduler facade issues exactly one
    /// run per call instead of looping over scheduler exits.
    pub kernel_priority: bool,
}

/// Refinement of MSR interception: when `valid`, only the named classes are
/// surfaced and everything else is emulated or passed through.
#[derive(Debug, Default, Clone, Copy)]
#[allow(missing_docs)]
pub struct MsrInterceptions {
    pub valid: bool,
    pub intercept_apic: bool,
    pub intercept_mtrr: bool,
    pub intercept_sysenter: bool,
    pub intercept_cet: bool,
    pub intercept_syscall: bool,
    pub intercept_smm: bool,
}

/// A pending event the layered hypervisor asked to deliver, kept as an
/// explicit value until it reaches the VMCB's injection field.
#[derive(Debug, Default, Clone, Copy)]
pub struct InjectedEvent {
    /// The vector.
    pub vector: u8,
    /// The hardware event type ([`vmcb::event_type`]).
    pub kind: u8,
    /// Delivery priority of an external interrupt, compared against the
    /// TPR by the virtual-interrupt hardware.
    pub priority: u8,
    /// An error code accompanies the event.
    pub error_code_valid: bool,
    /// The event is pending.
    pub valid: bool,
    /// The error code.
    pub error_code: u32,
}

/// Guest-visible bits that differ from what the hardware really runs with.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShadowedBits {
    /// The guest's view of EFER.SVME; the real bit is always set.
    pub svme: bool,
    /// The guest's view of CR4.MCE; the real bit is always set.
    pub mce: bool,
}

/// The processor activity state, for INIT/SIPI sequencing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    /// Executing normally.
    #[default]
    Active,
    /// Halted by an INIT signal until a startup IPI arrives.
    WaitForSipi,
}

/// Instruction bytes the hardware fetched at an intercept, up to 15.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InstructionBytes {
    /// How many bytes are valid.
    pub len: u8,
    /// The bytes.
    pub bytes: [u8; 15],
}

/// Decoded qualifiers of an intercepted I/O instruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct IoAccess {
    pub input: bool,
    pub string: bool,
    pub repeat: bool,
    pub operand_size: u16,
    pub address_width: u16,
}

/// Why the processor rejected the VMCB on entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum InvalidStateReason {
    /// No specific consistency check failed; the reason is unknown.
    #[default]
    UnknownFailure,
    /// CR0.CD is clear while CR0.NW is set.
    Cr0CdClearNwSet,
    /// The upper 32 bits of CR0 are not zero.
    Cr0UpperBitsSet,
    /// Must-be-zero bits of CR3 are set.
    Cr3MbzBitsSet,
    /// Must-be-zero bits of CR4 are set.
    Cr4MbzBitsSet,
    /// The upper 32 bits of DR6 are not zero.
    Dr6UpperBitsSet,
    /// The upper 32 bits of DR7 are not zero.
    Dr7UpperBitsSet,
    /// Must-be-zero bits of EFER are set.
    EferMbzBitsSet,
    /// EFER.LME and CR0.PG are set while CR4.PAE is clear.
    LongModeWithoutPae,
    /// EFER.LME and CR0.PG are set while CR0.PE is clear.
    LongModeWithoutProtection,
    /// EFER.LME, CR0.PG, CR4.PAE, CS.L and CS.D are all set.
    LongModeWithCsDefaultSize,
    /// The injected event is architecturally impossible.
    IllegalEventInjection,
    /// A segment base is not canonical.
    IncanonicalSegmentBase,
}

/// What the guest did to leave guest mode, surfaced to the layered
/// hypervisor in the exit context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CvmIntercept {
    /// The exit belongs to the host scheduler (physical interrupt, #MC,
    /// INIT); the guest did nothing of note.
    SchedulerExit,
    /// The dispatcher hit an exit it has no handler for.
    SchedulerBug,
    /// Another thread rescinded the run before entry.
    Rescission,
    /// The processor rejected the VMCB.
    InvalidState(InvalidStateReason),
    Hlt,
    Cpuid {
        leaf: u32,
        subleaf: u32,
    },
    CrAccess {
        cr: u8,
        gpr: u8,
        write: bool,
        mov_instruction: bool,
    },
    DrAccess {
        dr: u8,
        gpr: u8,
        write: bool,
    },
    Exception {
        vector: u8,
        error_code: Option<u32>,
        fault_address: u64,
        instruction_bytes: InstructionBytes,
    },
    Io {
        access: IoAccess,
        port: u16,
        rax: u64,
        rcx: u64,
        rsi: u64,
        rdi: u64,
        segment: Segment,
    },
    Rdmsr {
        index: u32,
    },
    Wrmsr {
        index: u32,
        value: u64,
    },
    MemoryAccess {
        gpa: u64,
        read: bool,
        write: bool,
        execute: bool,
        user: bool,
        instruction_bytes: InstructionBytes,
    },
    InterruptWindow {
        nmi: bool,
        iret_passed: bool,
    },
    TaskSwitch {
        selector: u16,
        error_code: u32,
        iret: bool,
        far_jump: bool,
    },
    Shutdown,
    Rsm,
    /// The guest toggled NSV mode through the activation MSR.
    NsvActivate {
        activated: bool,
    },
    /// The guest claimed security of a GPA window.
    NsvClaimSecurity {
        gpa_start: u64,
        gpa_end: u64,
    },
}

impl Default for CvmIntercept {
    fn default() -> Self {
        Self::SchedulerExit
    }
}

/// A snapshot of execution-mode facts accompanying an exit.
#[derive(Debug, Default, Clone, Copy)]
#[allow(missing_docs)]
pub struct ExitVcpuState {
    pub instruction_length: u8,
    pub interrupt_shadow: bool,
    pub pe: bool,
    pub lm: bool,
    pub cpl: u8,
    /// The snapshot has been filled for this exit.
    pub loaded: bool,
}

/// The record handed to the layered hypervisor when a run returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitContext {
    /// What happened.
    pub intercept: CvmIntercept,
    /// Mode snapshot, filled lazily for exits that surface.
    pub vcpu_state: ExitVcpuState,
    /// CS at the exit point.
    pub cs: Segment,
    /// rip at the exit point.
    pub rip: u64,
    /// rflags at the exit point.
    pub rflags: u64,
}

/// The interception classes the profiler attributes handler time to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
#[allow(missing_docs)]
pub enum InterceptClass {
    #[default]
    Scheduler = 0,
    Emulation,
    Cr,
    Dr,
    Exception,
    Cpuid,
    Halt,
    Io,
    Msr,
    Npf,
    Hypercall,
    Rsm,
}

/// Count of [`InterceptClass`] variants.
pub const INTERCEPT_CLASSES: usize = 12;

/// Counter and accumulated handler time of one interception class.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClassStats {
    /// How many exits fell in this class.
    pub count: u64,
    /// Accumulated time spent in the handler, in platform clock units.
    pub time: u64,
}

/// Per-vCPU execution statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct VcpuStatistics {
    /// Accumulated guest runtime.
    pub runtime: u64,
    /// Stamp of the last guest entry.
    pub runtime_start: u64,
    /// The class the current exit's handler selected for billing.
    pub selector: InterceptClass,
    /// Per-class counters.
    pub classes: [ClassStats; INTERCEPT_CLASSES],
}

/// An XSAVE area sized to the host-supported feature mask, with the 64-byte
/// alignment the instruction demands.
#[derive(Debug)]
pub struct XsaveArea {
    blocks: Box<[XsaveBlock]>,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, align(64))]
struct XsaveBlock([u8; 64]);

impl XsaveArea {
    /// Allocates a zeroed area of at least `size` bytes.
    pub fn new(size: usize) -> Self {
        let blocks = size.div_ceil(64);
        Self {
            // Safety: an all-zero XSAVE image is a legal initial state.
            blocks: unsafe { Box::<[XsaveBlock]>::new_zeroed_slice(blocks).assume_init() },
        }
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.blocks.as_ptr().cast()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.blocks.as_mut_ptr().cast()
    }

    /// The raw bytes.
    pub fn bytes(&self) -> &[u8] {
        // Safety: the area is plain bytes.
        unsafe { core::slice::from_raw_parts(self.as_ptr(), self.blocks.len() * 64) }
    }

    /// The raw bytes, mutably.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.blocks.len() * 64;
        // Safety: the area is plain bytes.
        unsafe { core::slice::from_raw_parts_mut(self.as_mut_ptr(), len) }
    }
}

/// Everything about one vCPU that the run path owns exclusively. Guarded by
/// the vCPU's state lock: held by the scheduler across a run, and by the
/// layered hypervisor's introspection calls between runs.
#[allow(missing_docs)]
pub struct VcpuState {
    pub vmcb: Box<Vmcb>,
    /// Cached physical address of the VMCB.
    pub vmcb_pa: u64,
    /// The logical general-purpose registers.
    pub gpr: GprState,
    pub rip: u64,
    pub rflags: u64,
    pub xcr0: u64,
    pub xsave: XsaveArea,
    pub crs: ControlRegs,
    pub drs: DebugRegs,
    pub seg: SegmentState,
    pub msrs: MsrState,
    pub injected_event: InjectedEvent,
    pub exception_bitmap: u32,
    pub options: VcpuOptions,
    pub msr_interceptions: MsrInterceptions,
    pub cache: StateCache,
    /// The last host processor that ran this vCPU; `u32::MAX` for never.
    pub proc_id: u32,
    /// Which of the VM's address spaces this vCPU uses.
    pub selected_mapping: u32,
    pub shadowed: ShadowedBits,
    /// An NMI was queued and the iret window is being watched.
    pub prev_nmi: bool,
    /// A virtual interrupt was programmed at the last entry.
    pub prev_virq: bool,
    pub activity: ActivityState,
    pub exit_context: ExitContext,
    pub stats: VcpuStatistics,
    /// Confidential-guest state; inert unless the VM is an NSV guest.
    pub nsv: NsvState,
}

/// Bit 63 of the special-state word: an out-of-band request to cancel the
/// next run.
const RESCISSION_BIT: u64 = 1 << 63;

/// One virtual processor of a customizable VM.
pub struct CustomVcpu {
    /// The owning VM. Non-owning; the VM owns the vCPU array.
    pub(crate) vm: Weak<CustomVm>,
    /// This vCPU's slot index, which doubles as its APIC ID.
    pub id: u32,
    /// Out-of-band flags probed without the state lock.
    special_state: AtomicU64,
    state: Mutex<VcpuState>,
}

impl CustomVcpu {
    pub(crate) fn new(vm: Weak<CustomVm>, id: u32, xsave_size: usize) -> Self {
        let vmcb = Vmcb::boxed_zeroed();
        let vmcb_pa = pa_of(&*vmcb);
        Self {
            vm,
            id,
            special_state: AtomicU64::new(0),
            state: Mutex::new(VcpuState {
                vmcb,
                vmcb_pa,
                gpr: GprState::default(),
                rip: 0,
                rflags: 2,
                xcr0: 1,
                xsave: XsaveArea::new(xsave_size),
                crs: ControlRegs::default(),
                drs: DebugRegs::default(),
                seg: SegmentState::default(),
                msrs: MsrState::default(),
                injected_event: InjectedEvent::default(),
                exception_bitmap: 0,
                options: VcpuOptions::default(),
                msr_interceptions: MsrInterceptions::default(),
                cache: StateCache::default(),
                proc_id: u32::MAX,
                selected_mapping: 0,
                shadowed: ShadowedBits::default(),
                prev_nmi: false,
                prev_virq: false,
                activity: ActivityState::default(),
                exit_context: ExitContext::default(),
                stats: VcpuStatistics::default(),
                nsv: NsvState::default(),
            }),
        }
    }

    /// Locks the vCPU state for introspection or mutation between runs.
    pub fn state(&self) -> MutexGuard<'_, VcpuState> {
        self.state.lock()
    }

    /// Runs this vCPU until an intercept surfaces to the caller.
    ///
    /// The VM's vCPU-list lock is held shared for the duration, which is
    /// what allows [`CustomVm::release`] to drain runners by taking it
    /// exclusively. The rescission bit is probed once, before entry.
    pub fn run(&self) -> Result<()> {
        let vm = self.vm.upgrade().ok_or(HvError::InvalidParameter)?;
        let _running = vm.vcpu_list_shared();
        if self.special_state.fetch_and(!RESCISSION_BIT, Ordering::AcqRel) & RESCISSION_BIT != 0 {
            self.state().exit_context.intercept = CvmIntercept::Rescission;
            return Ok(());
        }
        let kernel_priority = {
            let mut state = self.state();
            if vm.mapping_asid(state.selected_mapping)? == ASID_NONE {
                state.exit_context.intercept =
                    CvmIntercept::InvalidState(InvalidStateReason::UnknownFailure);
                return Ok(());
            }
            state.options.kernel_priority
        };
        loop {
            vm.global().cvm_hypercall(HypercallCode::RunVcpu, pa_of(self));
            if kernel_priority
                || self.state().exit_context.intercept != CvmIntercept::SchedulerExit
            {
                break;
            }
        }
        Ok(())
    }

    /// Cancels the next run of this vCPU from another thread.
    pub fn rescind(&self) -> Result<()> {
        let vm = self.vm.upgrade().ok_or(HvError::InvalidParameter)?;
        let _running = vm.vcpu_list_shared();
        if self.special_state.fetch_or(RESCISSION_BIT, Ordering::AcqRel) & RESCISSION_BIT != 0 {
            Err(HvError::AlreadyRescinded)
        } else {
            Ok(())
        }
    }

    /// Selects which of the VM's address spaces the vCPU runs under. Takes
    /// effect at the next entry with the TLB re-tagged.
    pub fn select_mapping(&self, mapping_id: u32) -> Result<()> {
        let vm = self.vm.upgrade().ok_or(HvError::InvalidParameter)?;
        if mapping_id >= vm.mapping_count() {
            return Err(HvError::InvalidParameter);
        }
        let mut state = self.state();
        if mapping_id != state.selected_mapping {
            state.selected_mapping = mapping_id;
            state.cache.asid_valid = false;
        }
        Ok(())
    }

    /// The currently selected address-space mapping.
    pub fn selected_mapping(&self) -> u32 {
        self.state().selected_mapping
    }

    pub(crate) fn rescission_pending(&self) -> bool {
        self.special_state.fetch_and(!RESCISSION_BIT, Ordering::AcqRel) & RESCISSION_BIT != 0
    }
}

impl VcpuState {
    /// Writes the logical guest view into the VMCB, honoring the state
    /// cache: only fields the layered hypervisor rewrote are pushed, and
    /// each push clears the matching hardware clean bit.
    pub(crate) fn load_guest_state(&mut self) {
        if !self.cache.gpr_valid {
            self.vmcb.save.rax = self.gpr.rax;
            self.vmcb.save.rsp = self.gpr.rsp;
            self.vmcb.save.rip = self.rip;
            self.vmcb.save.rflags = self.rflags;
            self.cache.gpr_valid = true;
        }
        if !self.cache.dr_valid {
            self.vmcb.save.dr6 = self.drs.dr6;
            self.vmcb.save.dr7 = self.drs.dr7;
            self.vmcb.invalidate(clean::DRX);
            self.cache.dr_valid = true;
        }
        if !self.cache.cr_valid {
            self.vmcb.save.cr0 = self.crs.cr0;
            self.vmcb.save.cr3 = self.crs.cr3;
            self.vmcb.save.cr4 = self.crs.cr4;
            self.vmcb.invalidate(clean::CRX);
            self.cache.cr_valid = true;
            // Control-register changes can invalidate cached translations.
            self.vmcb.control.tlb_control = vmcb::tlb_control::FLUSH_GUEST;
        }
        if !self.cache.cr2_valid {
            self.vmcb.save.cr2 = self.crs.cr2;
            self.vmcb.invalidate(clean::CR2);
            self.cache.cr2_valid = true;
        }
        if !self.cache.tpr_valid {
            let mut vintr = VirtualInterruptControl(self.vmcb.control.vintr);
            vintr.set_tpr(self.crs.cr8 & 0xf);
            self.vmcb.control.vintr = vintr.0;
            self.vmcb.invalidate(clean::TPR);
            self.cache.tpr_valid = true;
        }
        if !self.cache.seg_valid {
            self.vmcb.save.cs_selector = self.seg.cs.selector;
            self.vmcb.save.ds_selector = self.seg.ds.selector;
            self.vmcb.save.es_selector = self.seg.es.selector;
            self.vmcb.save.ss_selector = self.seg.ss.selector;
            self.vmcb.save.cs_attrib = vmcb::pack_segment_attributes(self.seg.cs.attributes);
            self.vmcb.save.ds_attrib = vmcb::pack_segment_attributes(self.seg.ds.attributes);
            self.vmcb.save.es_attrib = vmcb::pack_segment_attributes(self.seg.es.attributes);
            self.vmcb.save.ss_attrib = vmcb::pack_segment_attributes(self.seg.ss.attributes);
            self.vmcb.save.cs_limit = self.seg.cs.limit;
            self.vmcb.save.ds_limit = self.seg.ds.limit;
            self.vmcb.save.es_limit = self.seg.es.limit;
            self.vmcb.save.ss_limit = self.seg.ss.limit;
            self.vmcb.save.cs_base = self.seg.cs.base;
            self.vmcb.save.ds_base = self.seg.ds.base;
            self.vmcb.save.es_base = self.seg.es.base;
            self.vmcb.save.ss_base = self.seg.ss.base;
            self.vmcb.invalidate(clean::SEG);
            self.cache.seg_valid = true;
        }
        if !self.cache.fs_gs_valid {
            self.vmcb.save.fs_selector = self.seg.fs.selector;
            self.vmcb.save.gs_selector = self.seg.gs.selector;
            self.vmcb.save.fs_attrib = vmcb::pack_segment_attributes(self.seg.fs.attributes);
            self.vmcb.save.gs_attrib = vmcb::pack_segment_attributes(self.seg.gs.attributes);
            self.vmcb.save.fs_limit = self.seg.fs.limit;
            self.vmcb.save.gs_limit = self.seg.gs.limit;
            self.vmcb.save.fs_base = self.seg.fs.base;
            self.vmcb.save.gs_base = self.seg.gs.base;
            self.vmcb.save.kernel_gs_base = self.msrs.kernel_gs_base;
            // No clean bit: the vmload instruction reloads these.
            self.cache.fs_gs_valid = true;
        }
        if !self.cache.tr_ldtr_valid {
            self.vmcb.save.tr_selector = self.seg.tr.selector;
            self.vmcb.save.ldtr_selector = self.seg.ldtr.selector;
            self.vmcb.save.tr_attrib = vmcb::pack_segment_attributes(self.seg.tr.attributes);
            self.vmcb.save.ldtr_attrib = vmcb::pack_segment_attributes(self.seg.ldtr.attributes);
            self.vmcb.save.tr_limit = self.seg.tr.limit;
            self.vmcb.save.ldtr_limit = self.seg.ldtr.limit;
            self.vmcb.save.tr_base = self.seg.tr.base;
            self.vmcb.save.ldtr_base = self.seg.ldtr.base;
            // No clean bit: the vmload instruction reloads these.
            self.cache.tr_ldtr_valid = true;
        }
        if !self.cache.dt_valid {
            self.vmcb.save.gdtr_limit = self.seg.gdtr.limit;
            self.vmcb.save.idtr_limit = self.seg.idtr.limit;
            self.vmcb.save.gdtr_base = self.seg.gdtr.base;
            self.vmcb.save.idtr_base = self.seg.idtr.base;
            self.vmcb.invalidate(clean::DT);
            self.cache.dt_valid = true;
        }
        if !self.cache.efer_valid {
            const EFER_SVME: u64 = 1 << 12;
            // SVME shadowing: the guest may believe it is clear, but the
            // hardware requires it set.
            self.shadowed.svme = (self.msrs.efer & EFER_SVME) != 0;
            self.vmcb.save.efer = self.msrs.efer | EFER_SVME;
            self.vmcb.invalidate(clean::CRX);
            self.cache.efer_valid = true;
        }
        if !self.cache.pat_valid {
            self.vmcb.save.gpat = self.msrs.pat;
            self.vmcb.invalidate(clean::NPT);
            self.cache.pat_valid = true;
        }
        if !self.cache.sysenter_valid {
            self.vmcb.save.sysenter_cs = self.msrs.sysenter_cs;
            self.vmcb.save.sysenter_esp = self.msrs.sysenter_esp;
            self.vmcb.save.sysenter_eip = self.msrs.sysenter_eip;
            // No clean bit: the vmload instruction reloads these.
            self.cache.sysenter_valid = true;
        }
        if !self.cache.syscall_valid {
            self.vmcb.save.star = self.msrs.star;
            self.vmcb.save.lstar = self.msrs.lstar;
            self.vmcb.save.cstar = self.msrs.cstar;
            self.vmcb.save.sf_mask = self.msrs.sfmask;
            // No clean bit: the vmload instruction reloads these.
            self.cache.syscall_valid = true;
        }
    }

    /// Programs event injection for the next entry: NMIs open an iret
    /// window instead of injecting directly; exceptions and software
    /// interrupts use the injection field; external interrupts ride the
    /// virtual-interrupt mechanism so the hardware honors the TPR and
    /// RFLAGS.IF before delivery.
    pub(crate) fn program_event_injection(&mut self) {
        if self.injected_event.kind != 0 {
            if self.injected_event.valid && self.injected_event.vector == 2 {
                self.vmcb.control.intercept_misc1 |= vmcb::misc1::IRET;
                self.vmcb.invalidate(clean::INTERCEPTS);
                self.prev_nmi = true;
                self.options.blocking_by_nmi = true;
            } else if self.injected_event.valid {
                let mut event = EventInjection(0);
                event.set_vector(u64::from(self.injected_event.vector));
                event.set_event_type(u64::from(self.injected_event.kind));
                event.set_error_code_valid(self.injected_event.error_code_valid);
                event.set_error_code(u64::from(self.injected_event.error_code));
                event.set_valid(true);
                self.vmcb.control.event_inj = event.0;
            }
        } else {
            let mut vintr = VirtualInterruptControl(self.vmcb.control.vintr);
            vintr.set_virq(self.injected_event.valid);
            self.prev_virq = self.injected_event.valid;
            vintr.set_vector(u64::from(self.injected_event.vector));
            vintr.set_priority(u64::from(self.injected_event.priority));
            self.vmcb.control.vintr = vintr.0;
            // The virtual-interrupt word is cached under the TPR bit.
            self.vmcb.invalidate(clean::TPR);
        }
    }

    /// Programs the NCR3, ASID and TLB-flush fields for the next entry.
    /// `ncr3` and `asid` describe the selected mapping.
    pub(crate) fn load_address_space(&mut self, ncr3: u64, asid: u32) {
        if !self.cache.asid_valid {
            self.vmcb.control.ncr3 = ncr3;
            self.vmcb.invalidate(clean::NPT);
            self.vmcb.control.guest_asid = asid;
            self.vmcb.invalidate(clean::ASID);
            self.cache.asid_valid = true;
        }
        if !self.cache.tlb_valid {
            self.vmcb.control.tlb_control = vmcb::tlb_control::FLUSH_GUEST;
            self.cache.tlb_valid = true;
        }
    }

    /// Pulls the VMCB back into the logical view for every field the cache
    /// still marks valid (fields the layered hypervisor rewrote stay as
    /// written), then reports the view synchronized.
    pub fn dump_guest_state(&mut self) {
        if self.cache.cr_valid {
            self.crs.cr0 = self.vmcb.save.cr0;
            self.crs.cr3 = self.vmcb.save.cr3;
            self.crs.cr4 = self.vmcb.save.cr4;
        }
        if self.cache.cr2_valid {
            self.crs.cr2 = self.vmcb.save.cr2;
        }
        if self.cache.dr_valid {
            self.drs.dr6 = self.vmcb.save.dr6;
            self.drs.dr7 = self.vmcb.save.dr7;
        }
        if self.cache.seg_valid {
            self.seg.cs.selector = self.vmcb.save.cs_selector;
            self.seg.ds.selector = self.vmcb.save.ds_selector;
            self.seg.es.selector = self.vmcb.save.es_selector;
            self.seg.ss.selector = self.vmcb.save.ss_selector;
            self.seg.cs.attributes = vmcb::unpack_segment_attributes(self.vmcb.save.cs_attrib);
            self.seg.ds.attributes = vmcb::unpack_segment_attributes(self.vmcb.save.ds_attrib);
            self.seg.es.attributes = vmcb::unpack_segment_attributes(self.vmcb.save.es_attrib);
            self.seg.ss.attributes = vmcb::unpack_segment_attributes(self.vmcb.save.ss_attrib);
            self.seg.cs.limit = self.vmcb.save.cs_limit;
            self.seg.ds.limit = self.vmcb.save.ds_limit;
            self.seg.es.limit = self.vmcb.save.es_limit;
            self.seg.ss.limit = self.vmcb.save.ss_limit;
            self.seg.cs.base = self.vmcb.save.cs_base;
            self.seg.ds.base = self.vmcb.save.ds_base;
            self.seg.es.base = self.vmcb.save.es_base;
            self.seg.ss.base = self.vmcb.save.ss_base;
        }
        if self.cache.fs_gs_valid {
            self.seg.fs.selector = self.vmcb.save.fs_selector;
            self.seg.gs.selector = self.vmcb.save.gs_selector;
            self.seg.fs.attributes = vmcb::unpack_segment_attributes(self.vmcb.save.fs_attrib);
            self.seg.gs.attributes = vmcb::unpack_segment_attributes(self.vmcb.save.gs_attrib);
            self.seg.fs.limit = self.vmcb.save.fs_limit;
            self.seg.gs.limit = self.vmcb.save.gs_limit;
            self.seg.fs.base = self.vmcb.save.fs_base;
            self.seg.gs.base = self.vmcb.save.gs_base;
        }
        if self.cache.dt_valid {
            self.seg.gdtr.limit = self.vmcb.save.gdtr_limit;
            self.seg.idtr.limit = self.vmcb.save.idtr_limit;
            self.seg.gdtr.base = self.vmcb.save.gdtr_base;
            self.seg.idtr.base = self.vmcb.save.idtr_base;
        }
        if self.cache.tr_ldtr_valid {
            self.seg.ldtr.selector = self.vmcb.save.ldtr_selector;
            self.seg.ldtr.attributes = vmcb::unpack_segment_attributes(self.vmcb.save.ldtr_attrib);
            self.seg.ldtr.limit = self.vmcb.save.ldtr_limit;
            self.seg.ldtr.base = self.vmcb.save.ldtr_base;
            self.seg.tr.selector = self.vmcb.save.tr_selector;
            self.seg.tr.attributes = vmcb::unpack_segment_attributes(self.vmcb.save.tr_attrib);
            self.seg.tr.limit = self.vmcb.save.tr_limit;
            self.seg.tr.base = self.vmcb.save.tr_base;
        }
        if self.cache.syscall_valid {
            self.msrs.star = self.vmcb.save.star;
            self.msrs.lstar = self.vmcb.save.lstar;
            self.msrs.cstar = self.vmcb.save.cstar;
            self.msrs.sfmask = self.vmcb.save.sf_mask;
        }
        if self.cache.sysenter_valid {
            self.msrs.sysenter_cs = self.vmcb.save.sysenter_cs;
            self.msrs.sysenter_esp = self.vmcb.save.sysenter_esp;
            self.msrs.sysenter_eip = self.vmcb.save.sysenter_eip;
        }
        if self.cache.tpr_valid {
            self.crs.cr8 = VirtualInterruptControl(self.vmcb.control.vintr).tpr();
        }
        if self.cache.efer_valid {
            const EFER_SVME: u64 = 1 << 12;
            self.msrs.efer = self.vmcb.save.efer;
            if !self.shadowed.svme {
                self.msrs.efer &= !EFER_SVME;
            }
        }
        if self.cache.pat_valid {
            self.msrs.pat = self.vmcb.save.gpat;
        }
        self.cache.synchronized = true;
    }

    /// Fills the mode snapshot of the exit context from the VMCB.
    pub(crate) fn load_basic_exit_context(&mut self) {
        const CR0_PE: u64 = 1 << 0;
        const EFER_LMA: u64 = 1 << 10;
        let instruction_length = self.vmcb.control.nrip.wrapping_sub(self.vmcb.save.rip) as u8;
        self.exit_context.vcpu_state = ExitVcpuState {
            instruction_length,
            interrupt_shadow: self.vmcb.in_interrupt_shadow(),
            pe: (self.vmcb.save.cr0 & CR0_PE) != 0,
            lm: (self.vmcb.save.efer & EFER_LMA) != 0,
            cpl: self.vmcb.save.cpl,
            loaded: true,
        };
        self.exit_context.cs = Segment {
            selector: self.vmcb.save.cs_selector,
            attributes: vmcb::unpack_segment_attributes(self.vmcb.save.cs_attrib),
            limit: self.vmcb.save.cs_limit,
            base: self.vmcb.save.cs_base,
        };
        self.exit_context.rip = self.vmcb.save.rip;
        self.exit_context.rflags = self.vmcb.save.rflags;
    }

    /// Saves the hardware-held guest registers back into the logical view
    /// at a switch to host, and reconstructs an undelivered virtual
    /// interrupt into the pending-event slot.
    pub(crate) fn save_guest_state(&mut self, gprs: &GprState) {
        self.gpr = *gprs;
        self.gpr.rax = self.vmcb.save.rax;
        self.gpr.rsp = self.vmcb.save.rsp;
        self.rip = self.vmcb.save.rip;
        self.rflags = self.vmcb.save.rflags;
        self.xcr0 = xgetbv(0);
        self.drs.dr0 = dr0();
        self.drs.dr1 = dr1();
        self.drs.dr2 = dr2();
        self.drs.dr3 = dr3();
        xsave(self.xsave.as_mut_ptr());
        let event = EventInjection(self.vmcb.control.event_inj);
        if event.valid() {
            self.injected_event.vector = event.vector() as u8;
            self.injected_event.kind = event.event_type() as u8;
            self.injected_event.error_code_valid = event.error_code_valid();
            self.injected_event.error_code = event.error_code() as u32;
            self.injected_event.valid = true;
        } else {
            // The hardware cleared the slot; whatever remains pending is in
            // the virtual-interrupt word.
            let vintr = VirtualInterruptControl(self.vmcb.control.vintr);
            self.injected_event = InjectedEvent {
                vector: vintr.vector() as u8,
                kind: 0,
                priority: vintr.priority() as u8,
                error_code_valid: false,
                valid: vintr.virq(),
                error_code: 0,
            };
        }
    }

    /// Loads the guest's hardware-held registers for entry.
    pub(crate) fn load_guest_hardware_state(&mut self) {
        xrstor(self.xsave.as_ptr());
        xsetbv(0, self.xcr0);
        dr0_write(self.drs.dr0);
        dr1_write(self.drs.dr1);
        dr2_write(self.drs.dr2);
        dr3_write(self.drs.dr3);
    }
}

/// Saves the layered hypervisor's hardware-held state at a switch to guest.
pub(crate) fn save_host_world(world: &mut crate::host::WorldState, gprs: &GprState) {
    world.gpr = *gprs;
    world.xcr0 = xgetbv(0);
    xsave(world.xsave.as_mut_ptr());
    world.dr0 = dr0();
    world.dr1 = dr1();
    world.dr2 = dr2();
    world.dr3 = dr3();
    world.cr2 = cr2();
}

/// Restores the layered hypervisor's hardware-held state at a switch to
/// host. The guest's extended state must have been saved already.
pub(crate) fn restore_host_world(world: &crate::host::WorldState) {
    xrstor(world.xsave.as_ptr());
    xsetbv(0, world.xcr0);
    dr0_write(world.dr0);
    dr1_write(world.dr1);
    dr2_write(world.dr2);
    dr3_write(world.dr3);
    cr2_write(world.cr2);
}

/// Re-enables host interrupts just before resuming in guest context, so a
/// physical interrupt can always preempt the guest.
pub(crate) fn enable_host_interrupts() {
    sti();
}

/// Emulates the architectural effect of an INIT signal on `vmcb` and the
/// guest GPRs, leaving the processor in the wait-for-SIPI state. The
/// caller clears the hardware debug registers, which live outside the VMCB.
///
/// See: Table 14-1 Initial Processor State, AMD64 APM Volume 2
pub(crate) fn emulate_init_signal(vmcb: &mut Vmcb, gprs: &mut GprState, cpuid_fms: u32) {
    const EFER_SVME: u64 = 1 << 12;
    // CD and NW are unchanged by INIT; ET is always set.
    let cr0 = (vmcb.save.cr0 & 0x6000_0000) | 0x10;
    vmcb.save.cr0 = cr0;
    vmcb.save.cr2 = 0;
    vmcb.save.cr3 = 0;
    vmcb.save.cr4 = 0;
    vmcb.save.efer = EFER_SVME;
    vmcb.save.dr6 = 0xffff_0ff0;
    vmcb.save.dr7 = 0x400;
    vmcb.save.cs_selector = 0xf000;
    vmcb.save.cs_attrib = 0x9b;
    vmcb.save.cs_limit = 0xffff;
    vmcb.save.cs_base = 0xffff_0000;
    for (selector, attrib, limit, base) in [
        (&mut vmcb.save.ds_selector, &mut vmcb.save.ds_attrib, &mut vmcb.save.ds_limit, &mut vmcb.save.ds_base),
        (&mut vmcb.save.es_selector, &mut vmcb.save.es_attrib, &mut vmcb.save.es_limit, &mut vmcb.save.es_base),
        (&mut vmcb.save.fs_selector, &mut vmcb.save.fs_attrib, &mut vmcb.save.fs_limit, &mut vmcb.save.fs_base),
        (&mut vmcb.save.gs_selector, &mut vmcb.save.gs_attrib, &mut vmcb.save.gs_limit, &mut vmcb.save.gs_base),
        (&mut vmcb.save.ss_selector, &mut vmcb.save.ss_attrib, &mut vmcb.save.ss_limit, &mut vmcb.save.ss_base),
    ] {
        *selector = 0;
        *attrib = 0x93;
        *limit = 0xffff;
        *base = 0;
    }
    vmcb.save.ldtr_selector = 0;
    vmcb.save.ldtr_attrib = 0x82;
    vmcb.save.ldtr_limit = 0xffff;
    vmcb.save.ldtr_base = 0;
    vmcb.save.tr_selector = 0;
    vmcb.save.tr_attrib = 0x8b;
    vmcb.save.tr_limit = 0xffff;
    vmcb.save.tr_base = 0;
    vmcb.save.gdtr_limit = 0xffff;
    vmcb.save.gdtr_base = 0;
    vmcb.save.idtr_limit = 0xffff;
    vmcb.save.idtr_base = 0;
    vmcb.save.rsp = 0;
    vmcb.save.rip = 0xfff0;
    vmcb.save.rflags = 2;
    *gprs = GprState::default();
    gprs.rdx = u64::from(cpuid_fms);
    // Paging is off after INIT; nothing cached survives.
    vmcb.control.tlb_control = vmcb::tlb_control::FLUSH_GUEST;
    vmcb.invalidate(clean::CRX | clean::DRX | clean::DT | clean::SEG | clean::CR2);
}

/// Emulates a startup IPI with the given vector on a processor waiting in
/// the INIT state.
pub(crate) fn emulate_sipi_signal(vmcb: &mut Vmcb, vector: u8) {
    vmcb.save.cs_selector = u16::from(vector) << 8;
    vmcb.save.cs_base = u64::from(vector) << 12;
    vmcb.save.rip = 0;
    vmcb.invalidate(clean::SEG);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state() -> VcpuState {
        let vmcb = Vmcb::boxed_zeroed();
        let vmcb_pa = pa_of(&*vmcb);
        VcpuState {
            vmcb,
            vmcb_pa,
            gpr: GprState::default(),
            rip: 0,
            rflags: 2,
            xcr0: 1,
            xsave: XsaveArea::new(512),
            crs: ControlRegs::default(),
            drs: DebugRegs::default(),
            seg: SegmentState::default(),
            msrs: MsrState::default(),
            injected_event: InjectedEvent::default(),
            exception_bitmap: 0,
            options: VcpuOptions::default(),
            msr_interceptions: MsrInterceptions::default(),
            cache: StateCache::default(),
            proc_id: u32::MAX,
            selected_mapping: 0,
            shadowed: ShadowedBits::default(),
            prev_nmi: false,
            prev_virq: false,
            activity: ActivityState::default(),
            exit_context: ExitContext::default(),
            stats: VcpuStatistics::default(),
            nsv: NsvState::default(),
        }
    }

    #[test]
    fn gpr_indexing_follows_hardware_numbering() {
        let mut gprs = GprState::default();
        gprs.set(0, 0xa);
        gprs.set(4, 0xb);
        gprs.set(15, 0xc);
        assert_eq!(gprs.rax, 0xa);
        assert_eq!(gprs.rsp, 0xb);
        assert_eq!(gprs.r15, 0xc);
        assert_eq!(gprs.get(1), 0);
        assert_eq!(gprs.get(15), 0xc);
    }

    #[test]
    fn invalid_cache_flags_push_to_vmcb() {
        let mut state = fresh_state();
        state.crs.cr0 = 0x8000_0011;
        state.crs.cr3 = 0x1000;
        state.crs.cr4 = 0x20;
        state.msrs.efer = 0x500; // LME | LMA, SVME clear
        state.vmcb.mark_all_clean();
        state.load_guest_state();
        assert_eq!(state.vmcb.save.cr0, 0x8000_0011);
        assert_eq!(state.vmcb.save.cr3, 0x1000);
        // SVME is forced on, and the shadow remembers the guest's view.
        assert_eq!(state.vmcb.save.efer, 0x1500);
        assert!(!state.shadowed.svme);
        // The pushed fields dropped their hardware clean bits.
        assert_eq!(state.vmcb.control.vmcb_clean & u64::from(clean::CRX), 0);
        assert!(state.cache.cr_valid);
        // A second pass with a valid cache rewrites nothing.
        state.vmcb.save.cr3 = 0xdead_b000;
        state.load_guest_state();
        assert_eq!(state.vmcb.save.cr3, 0xdead_b000);
    }

    #[test]
    fn dump_honors_cache_validity_and_svme_shadow() {
        let mut state = fresh_state();
        state.load_guest_state();
        // Hardware ran; the VMCB now holds newer values.
        state.vmcb.save.cr0 = 0x11;
        state.vmcb.save.efer = 0x1d01;
        state.vmcb.save.gpat = 0x7040600070406;
        state.dump_guest_state();
        assert_eq!(state.crs.cr0, 0x11);
        // SVME was forced on by entry but shadowed off for the guest.
        assert_eq!(state.msrs.efer, 0x0d01);
        assert!(state.cache.synchronized);
        // A field the layered hypervisor rewrote (invalid flag) is not
        // overwritten by the dump.
        state.cache.cr_valid = false;
        state.crs.cr0 = 0x31;
        state.vmcb.save.cr0 = 0xffff;
        state.dump_guest_state();
        assert_eq!(state.crs.cr0, 0x31);
    }

    #[test]
    fn event_programming_prefers_iret_window_for_nmi() {
        let mut state = fresh_state();
        state.injected_event = InjectedEvent {
            vector: 2,
            kind: vmcb::event_type::NMI as u8,
            priority: 0,
            error_code_valid: false,
            valid: true,
            error_code: 0,
        };
        state.program_event_injection();
        assert!(state.prev_nmi);
        assert_ne!(state.vmcb.control.intercept_misc1 & vmcb::misc1::IRET, 0);
        assert_eq!(state.vmcb.control.event_inj, 0);
    }

    #[test]
    fn event_programming_exception_uses_injection_field() {
        let mut state = fresh_state();
        state.injected_event = InjectedEvent {
            vector: 14,
            kind: vmcb::event_type::EXCEPTION as u8,
            priority: 0,
            error_code_valid: true,
            valid: true,
            error_code: 0x2,
        };
        state.program_event_injection();
        let event = EventInjection(state.vmcb.control.event_inj);
        assert!(event.valid());
        assert_eq!(event.vector(), 14);
        assert_eq!(event.error_code(), 2);
    }

    #[test]
    fn external_interrupt_rides_the_virtual_interrupt_word() {
        let mut state = fresh_state();
        state.injected_event = InjectedEvent {
            vector: 0x30,
            kind: 0,
            priority: 3,
            error_code_valid: false,
            valid: true,
            error_code: 0,
        };
        state.program_event_injection();
        let vintr = VirtualInterruptControl(state.vmcb.control.vintr);
        assert!(vintr.virq());
        assert_eq!(vintr.vector(), 0x30);
        assert_eq!(vintr.priority(), 3);
        assert!(state.prev_virq);
    }

    #[test]
    fn address_space_load_flushes_tlb_once() {
        let mut state = fresh_state();
        state.cache.asid_valid = false;
        state.cache.tlb_valid = false;
        state.vmcb.mark_all_clean();
        state.load_address_space(0x7000, 5);
        assert_eq!(state.vmcb.control.ncr3, 0x7000);
        assert_eq!(state.vmcb.control.guest_asid, 5);
        assert_eq!(
            state.vmcb.control.tlb_control,
            vmcb::tlb_control::FLUSH_GUEST
        );
        assert_eq!(
            state.vmcb.control.vmcb_clean & u64::from(clean::NPT | clean::ASID),
            0
        );
    }

    #[test]
    fn init_signal_resets_to_real_mode() {
        let mut vmcb = Vmcb::boxed_zeroed();
        vmcb.save.cr0 = 0x6000_0033;
        vmcb.save.cr3 = 0x1000;
        vmcb.save.cr4 = 0x20;
        let mut gprs = GprState::default();
        gprs.rbx = 0x1234;
        emulate_init_signal(&mut vmcb, &mut gprs, 0x00a2_0f10);
        // CD/NW survive, ET appears, the rest of CR0 is cleared.
        assert_eq!(vmcb.save.cr0, 0x6000_0010);
        assert_eq!(vmcb.save.cr3, 0);
        assert_eq!(vmcb.save.cr4, 0);
        assert_eq!(vmcb.save.efer, 1 << 12);
        assert_eq!(vmcb.save.cs_selector, 0xf000);
        assert_eq!(vmcb.save.cs_base, 0xffff_0000);
        assert_eq!(vmcb.save.rip, 0xfff0);
        assert_eq!(vmcb.save.rflags, 2);
        assert_eq!(gprs.rbx, 0);
        assert_eq!(gprs.rdx, 0x00a2_0f10);

        emulate_sipi_signal(&mut vmcb, 0x9a);
        assert_eq!(vmcb.save.cs_selector, 0x9a00);
        assert_eq!(vmcb.save.cs_base, 0x9a000);
        assert_eq!(vmcb.save.rip, 0);
    }
}
