//! The module containing the layout of the virtual machine control block
//! (VMCB) and the decoders for its exit-information fields.
//!
//! All references to external resources (denoted with "See:") refer to
//! "AMD64 Architecture Programmer's Manual Volume 2: System Programming"
//! Revision 3.40 at
//! <https://developer.amd.com/resources/developer-guides-manuals/> unless
//! otherwise stated.

use alloc::boxed::Box;
use bitfield::bitfield;

/// The virtual machine control block (VMCB), which describes a virtual
/// machine (guest) to be executed.
///
/// See: Appendix B Layout of VMCB
#[derive(Debug, Default)]
#[repr(C, align(4096))]
pub struct Vmcb {
    /// The control area.
    pub control: ControlArea,
    /// The state-save area.
    pub save: StateSaveArea,
}
const _: () = assert!(core::mem::size_of::<Vmcb>() == 0x1000);

/// The "metadata" area where we can specify what operations to intercept and
/// can read details of #VMEXIT.
///
/// See: Table B-1. VMCB Layout, Control Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
#[allow(missing_docs)]
pub struct ControlArea {
    pub intercept_cr_read: u16,   // +0x000
    pub intercept_cr_write: u16,  // +0x002
    pub intercept_dr_read: u16,   // +0x004
    pub intercept_dr_write: u16,  // +0x006
    pub intercept_exception: u32, // +0x008
    pub intercept_misc1: u32,     // +0x00c
    pub intercept_misc2: u32,     // +0x010
    pub intercept_misc3: u32,     // +0x014
    #[derivative(Debug = "ignore", Default(value = "[0; 36]"))]
    _padding1: [u8; 0x03c - 0x018], // +0x018
    pub pause_filter_threshold: u16, // +0x03c
    pub pause_filter_count: u16,  // +0x03e
    pub iopm_base_pa: u64,        // +0x040
    pub msrpm_base_pa: u64,       // +0x048
    pub tsc_offset: u64,          // +0x050
    pub guest_asid: u32,          // +0x058
    pub tlb_control: u32,         // +0x05c
    pub vintr: u64,               // +0x060
    pub interrupt_shadow: u64,    // +0x068
    pub exit_code: u64,           // +0x070
    pub exit_info1: u64,          // +0x078
    pub exit_info2: u64,          // +0x080
    pub exit_int_info: u64,       // +0x088
    pub np_enable: u64,           // +0x090
    pub avic_apic_bar: u64,       // +0x098
    pub guest_pa_pf_ghcb: u64,    // +0x0a0
    pub event_inj: u64,           // +0x0a8
    pub ncr3: u64,                // +0x0b0
    pub lbr_virtualization_enable: u64, // +0x0b8
    pub vmcb_clean: u64,          // +0x0c0
    pub nrip: u64,                // +0x0c8
    pub bytes_fetched: u8,        // +0x0d0
    pub guest_instruction_bytes: [u8; 15], // +0x0d1
    pub avic_apic_backing_page_pointer: u64, // +0x0e0
    #[derivative(Debug = "ignore")]
    _padding2: u64, // +0x0e8
    pub avic_logical_table_pointer: u64, // +0x0f0
    pub avic_physical_table_pointer: u64, // +0x0f8
    #[derivative(Debug = "ignore")]
    _padding3: u64, // +0x100
    pub vmcb_save_state_pointer: u64, // +0x108
    #[derivative(Debug = "ignore", Default(value = "[0; 720]"))]
    _padding4: [u8; 0x3e0 - 0x110], // +0x110
    pub reserved_for_host: [u8; 0x20], // +0x3e0
}
const _: () = assert!(core::mem::size_of::<ControlArea>() == 0x400);

/// The area to specify and read guest register values.
///
/// See: Table B-2. VMCB Layout, State Save Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
#[allow(missing_docs)]
pub struct StateSaveArea {
    pub es_selector: u16,   // +0x000
    pub es_attrib: u16,     // +0x002
    pub es_limit: u32,      // +0x004
    pub es_base: u64,       // +0x008
    pub cs_selector: u16,   // +0x010
    pub cs_attrib: u16,     // +0x012
    pub cs_limit: u32,      // +0x014
    pub cs_base: u64,       // +0x018
    pub ss_selector: u16,   // +0x020
    pub ss_attrib: u16,     // +0x022
    pub ss_limit: u32,      // +0x024
    pub ss_base: u64,       // +0x028
    pub ds_selector: u16,   // +0x030
    pub ds_attrib: u16,     // +0x032
    pub ds_limit: u32,      // +0x034
    pub ds_base: u64,       // +0x038
    pub fs_selector: u16,   // +0x040
    pub fs_attrib: u16,     // +0x042
    pub fs_limit: u32,      // +0x044
    pub fs_base: u64,       // +0x048
    pub gs_selector: u16,   // +0x050
    pub gs_attrib: u16,     // +0x052
    pub gs_limit: u32,      // +0x054
    pub gs_base: u64,       // +0x058
    pub gdtr_selector: u16, // +0x060
    pub gdtr_attrib: u16,   // +0x062
    pub gdtr_limit: u32,    // +0x064
    pub gdtr_base: u64,     // +0x068
    pub ldtr_selector: u16, // +0x070
    pub ldtr_attrib: u16,   // +0x072
    pub ldtr_limit: u32,    // +0x074
    pub ldtr_base: u64,     // +0x078
    pub idtr_selector: u16, // +0x080
    pub idtr_attrib: u16,   // +0x082
    pub idtr_limit: u32,    // +0x084
    pub idtr_base: u64,     // +0x088
    pub tr_selector: u16,   // +0x090
    pub tr_attrib: u16,     // +0x092
    pub tr_limit: u32,      // +0x094
    pub tr_base: u64,       // +0x098
    #[derivative(Debug = "ignore", Default(value = "[0; 43]"))]
    _padding1: [u8; 0x0cb - 0x0a0], // +0x0a0
    pub cpl: u8,            // +0x0cb
    #[derivative(Debug = "ignore")]
    _padding2: u32, // +0x0cc
    pub efer: u64,          // +0x0d0
    #[derivative(Debug = "ignore", Default(value = "[0; 112]"))]
    _padding3: [u8; 0x148 - 0x0d8], // +0x0d8
    pub cr4: u64,           // +0x148
    pub cr3: u64,           // +0x150
    pub cr0: u64,           // +0x158
    pub dr7: u64,           // +0x160
    pub dr6: u64,           // +0x168
    pub rflags: u64,        // +0x170
    pub rip: u64,           // +0x178
    #[derivative(Debug = "ignore", Default(value = "[0; 88]"))]
    _padding4: [u8; 0x1d8 - 0x180], // +0x180
    pub rsp: u64,           // +0x1d8
    pub s_cet: u64,         // +0x1e0
    pub ssp: u64,           // +0x1e8
    pub isst_addr: u64,     // +0x1f0
    pub rax: u64,           // +0x1f8
    pub star: u64,          // +0x200
    pub lstar: u64,         // +0x208
    pub cstar: u64,         // +0x210
    pub sf_mask: u64,       // +0x218
    pub kernel_gs_base: u64, // +0x220
    pub sysenter_cs: u64,   // +0x228
    pub sysenter_esp: u64,  // +0x230
    pub sysenter_eip: u64,  // +0x238
    pub cr2: u64,           // +0x240
    #[derivative(Debug = "ignore", Default(value = "[0; 32]"))]
    _padding5: [u8; 0x268 - 0x248], // +0x248
    pub gpat: u64,          // +0x268
    pub dbg_ctl: u64,       // +0x270
    pub br_from: u64,       // +0x278
    pub br_to: u64,         // +0x280
    pub last_excep_from: u64, // +0x288
    pub last_excep_to: u64, // +0x290
    #[derivative(Debug = "ignore", Default(value = "[0; 71]"))]
    _padding6: [u8; 0x2df - 0x298], // +0x298
    pub spec_ctl: u64,      // +0x2e0
}
const _: () = assert!(core::mem::size_of::<StateSaveArea>() == 0x2e8);

/// VMCB clean-field bits. A clear bit tells the processor the corresponding
/// guest state in the VMCB changed and must be reloaded from memory.
///
/// See: 15.15.1 VMCB Clean Field
pub mod clean {
    #![allow(missing_docs)]
    pub const INTERCEPTS: u32 = 1 << 0;
    pub const IOPM_MSRPM: u32 = 1 << 1;
    pub const ASID: u32 = 1 << 2;
    pub const TPR: u32 = 1 << 3;
    pub const NPT: u32 = 1 << 4;
    pub const CRX: u32 = 1 << 5;
    pub const DRX: u32 = 1 << 6;
    pub const DT: u32 = 1 << 7;
    pub const SEG: u32 = 1 << 8;
    pub const CR2: u32 = 1 << 9;
    pub const LBR: u32 = 1 << 10;
    pub const AVIC: u32 = 1 << 11;
    pub const CET: u32 = 1 << 12;
}

/// Bits of [`ControlArea::intercept_misc1`].
///
/// See: Table B-1, offset 0x00c
pub mod misc1 {
    #![allow(missing_docs)]
    pub const INTR: u32 = 1 << 0;
    pub const NMI: u32 = 1 << 1;
    pub const SMI: u32 = 1 << 2;
    pub const INIT: u32 = 1 << 3;
    pub const VINTR: u32 = 1 << 4;
    pub const CPUID: u32 = 1 << 18;
    pub const RSM: u32 = 1 << 19;
    pub const IRET: u32 = 1 << 20;
    pub const INVD: u32 = 1 << 22;
    pub const PAUSE: u32 = 1 << 23;
    pub const HLT: u32 = 1 << 24;
    pub const INVLPGA: u32 = 1 << 26;
    pub const IO: u32 = 1 << 27;
    pub const MSR: u32 = 1 << 28;
    pub const TASK_SWITCH: u32 = 1 << 29;
    pub const SHUTDOWN: u32 = 1 << 31;
}

/// Bits of [`ControlArea::intercept_misc2`].
///
/// See: Table B-1, offset 0x010
pub mod misc2 {
    #![allow(missing_docs)]
    pub const VMRUN: u32 = 1 << 0;
    pub const VMMCALL: u32 = 1 << 1;
    pub const VMLOAD: u32 = 1 << 2;
    pub const VMSAVE: u32 = 1 << 3;
    pub const STGI: u32 = 1 << 4;
    pub const CLGI: u32 = 1 << 5;
    pub const SKINIT: u32 = 1 << 6;
}

/// Encodings of [`ControlArea::tlb_control`].
///
/// See: Table 15-9. TLB Control Byte Encodings
pub mod tlb_control {
    #![allow(missing_docs)]
    pub const DO_NOTHING: u32 = 0;
    pub const FLUSH_ENTIRE: u32 = 1;
    pub const FLUSH_GUEST: u32 = 3;
    pub const FLUSH_GUEST_NON_GLOBAL: u32 = 7;
}

bitfield! {
    /// The virtual-interrupt control word at control-area offset 0x60,
    /// carrying the TPR shadow and the virtual-interrupt request used to
    /// inject external interrupts without an event slot.
    ///
    /// See: 15.21.4 Injecting Virtual (INTR) Interrupts
    #[derive(Clone, Copy, Default)]
    pub struct VirtualInterruptControl(u64);
    impl Debug;
    /// The virtual TPR, compared against pending interrupt priorities.
    pub tpr, set_tpr: 3, 0;
    /// A virtual interrupt is pending.
    pub virq, set_virq: 8;
    /// Priority of the pending virtual interrupt.
    pub priority, set_priority: 19, 16;
    /// Deliver the virtual interrupt regardless of the TPR.
    pub ignore_tpr, set_ignore_tpr: 20;
    /// Only the virtual copy of RFLAGS.IF masks physical interrupts.
    pub interrupt_masking, set_interrupt_masking: 24;
    /// Vector of the pending virtual interrupt.
    pub vector, set_vector: 39, 32;
}

/// Event types usable in [`EventInjection`].
///
/// See: 15.20 Event Injection
pub mod event_type {
    #![allow(missing_docs)]
    pub const EXTERNAL: u64 = 0;
    pub const NMI: u64 = 2;
    pub const EXCEPTION: u64 = 3;
    pub const SOFTWARE_INT: u64 = 4;
}

bitfield! {
    /// The event-injection encoding at control-area offset 0xa8. The low 32
    /// bits describe the event; the high 32 bits carry its error code.
    ///
    /// See: 15.20 Event Injection
    #[derive(Clone, Copy, Default)]
    pub struct EventInjection(u64);
    impl Debug;
    /// The interrupt or exception vector.
    pub vector, set_vector: 7, 0;
    /// One of [`event_type`].
    pub event_type, set_event_type: 10, 8;
    /// The error code is pushed onto the guest stack.
    pub error_code_valid, set_error_code_valid: 11;
    /// The event is to be delivered on the next VMRUN.
    pub valid, set_valid: 31;
    /// The error code to push when [`Self::error_code_valid`].
    pub error_code, set_error_code: 63, 32;
}

impl EventInjection {
    /// Encodes a hardware exception, optionally with an error code.
    pub fn exception(vector: u8, error_code: Option<u32>) -> Self {
        let mut event = Self(0);
        event.set_vector(u64::from(vector));
        event.set_event_type(event_type::EXCEPTION);
        if let Some(code) = error_code {
            event.set_error_code_valid(true);
            event.set_error_code(u64::from(code));
        }
        event.set_valid(true);
        event
    }

    /// Encodes a non-maskable interrupt.
    pub fn nmi() -> Self {
        let mut event = Self(0);
        event.set_vector(2);
        event.set_event_type(event_type::NMI);
        event.set_valid(true);
        event
    }

    /// Encodes a #GP(0) fault.
    pub fn general_protection() -> Self {
        Self::exception(13, Some(0))
    }

    /// Encodes a #UD fault.
    pub fn invalid_opcode() -> Self {
        Self::exception(6, None)
    }
}

bitfield! {
    /// EXITINFO1 of a control-register access intercept.
    ///
    /// See: 15.35.4 CR Access Intercepts
    #[derive(Clone, Copy)]
    pub struct CrAccessInfo(u64);
    impl Debug;
    /// The general-purpose register operand, in hardware numbering.
    pub gpr, _: 3, 0;
    /// The access was a MOV-to/from-CR instruction.
    pub mov_instruction, _: 63;
}

bitfield! {
    /// EXITINFO1 of a debug-register access intercept.
    #[derive(Clone, Copy)]
    pub struct DrAccessInfo(u64);
    impl Debug;
    /// The general-purpose register operand, in hardware numbering.
    pub gpr, _: 3, 0;
}

bitfield! {
    /// EXITINFO1 of an IOIO intercept.
    ///
    /// See: 15.10.2 IN and OUT Behavior
    #[derive(Clone, Copy)]
    pub struct IoAccessInfo(u32);
    impl Debug;
    /// Set for IN, clear for OUT.
    pub input, _: 0;
    /// A string operation (INS/OUTS).
    pub string, _: 3;
    /// A repeated operation (REP prefix).
    pub repeat, _: 4;
    // Operand width and address size are one-hot in hardware.
    sz8, _: 4;
    sz16, _: 5;
    sz32, _: 6;
    addr16, _: 8;
    addr32, _: 9;
    /// The effective segment, in ES/CS/SS/DS/FS/GS order.
    pub segment, _: 12, 10;
    /// The port number.
    pub port, _: 31, 16;
}

impl IoAccessInfo {
    /// The operand width in bytes.
    pub fn operand_size(&self) -> u16 {
        if self.sz8() {
            1
        } else if self.sz16() {
            2
        } else {
            4
        }
    }

    /// The effective address width in bytes.
    pub fn address_width(&self) -> u16 {
        if self.addr16() {
            2
        } else if self.addr32() {
            4
        } else {
            8
        }
    }
}

bitfield! {
    /// EXITINFO1 of a nested page fault, following the #PF error-code
    /// layout.
    ///
    /// See: 15.25.6 Nested versus Guest Page Faults, Fault Ordering
    #[derive(Clone, Copy)]
    pub struct NptFaultCode(u64);
    impl Debug;
    /// The final translation was present (permission fault).
    pub present, _: 0;
    /// The access was a write.
    pub write, _: 1;
    /// The access originated at CPL3.
    pub user, _: 2;
    /// The access was an instruction fetch.
    pub execute, _: 4;
}

/// Converts descriptor-format segment attributes (bits 40..56 of a
/// descriptor) into the packed 12-bit form the VMCB stores.
pub fn pack_segment_attributes(attributes: u16) -> u16 {
    ((attributes & 0xff) | ((attributes & 0xf000) >> 4)) & 0xfff
}

/// The inverse of [`pack_segment_attributes`].
pub fn unpack_segment_attributes(attributes: u16) -> u16 {
    ((attributes & 0xf00) << 4) | (attributes & 0xff)
}

impl Vmcb {
    /// Allocates a zeroed VMCB directly on the heap. The block is a page
    /// and must not transit the stack.
    pub fn boxed_zeroed() -> Box<Self> {
        // Safety: the VMCB is plain integers; all-zero is a valid value.
        unsafe { Box::<Self>::new_zeroed().assume_init() }
    }

    /// Marks the given clean bits invalid so the processor reloads the
    /// corresponding state from the VMCB on the next VMRUN.
    pub fn invalidate(&mut self, bits: u32) {
        self.control.vmcb_clean &= !u64::from(bits);
    }

    /// Marks all guest state as cached.
    pub fn mark_all_clean(&mut self) {
        self.control.vmcb_clean = 0xffff_ffff;
    }

    /// Discards all cached state, eg, after cross-processor migration.
    pub fn mark_all_dirty(&mut self) {
        self.control.vmcb_clean = 0;
    }

    /// Moves the guest to the instruction following the intercepted one.
    /// Only legal for intercepts that latch the next sequential rip.
    pub fn advance_rip(&mut self) {
        self.save.rip = self.control.nrip;
    }

    /// Schedules `event` for delivery on the next VMRUN.
    pub fn inject_event(&mut self, event: EventInjection) {
        self.control.event_inj = event.0;
    }

    /// The instruction bytes the processor fetched for the intercepted
    /// instruction, up to 15.
    pub fn fetched_instruction(&self) -> (u8, [u8; 15]) {
        (self.control.bytes_fetched, self.control.guest_instruction_bytes)
    }

    /// Whether the guest is in an interrupt shadow.
    pub fn in_interrupt_shadow(&self) -> bool {
        (self.control.interrupt_shadow & 1) != 0
    }

    /// Reads a segment register by its decode-assist index
    /// (ES/CS/SS/DS/FS/GS).
    pub fn segment(&self, index: u64) -> (u16, u16, u32, u64) {
        let s = &self.save;
        match index {
            0 => (s.es_selector, s.es_attrib, s.es_limit, s.es_base),
            1 => (s.cs_selector, s.cs_attrib, s.cs_limit, s.cs_base),
            2 => (s.ss_selector, s.ss_attrib, s.ss_limit, s.ss_base),
            3 => (s.ds_selector, s.ds_attrib, s.ds_limit, s.ds_base),
            4 => (s.fs_selector, s.fs_attrib, s.fs_limit, s.fs_base),
            _ => (s.gs_selector, s.gs_attrib, s.gs_limit, s.gs_base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_attributes_round_trip() {
        // A long-mode code segment: type=0xb, S=1, DPL=0, P=1, L=1, G=1.
        let descriptor_attrib = 0xa09b_u16;
        let packed = pack_segment_attributes(descriptor_attrib);
        assert_eq!(packed, 0x29b);
        assert_eq!(unpack_segment_attributes(packed), descriptor_attrib);
    }

    #[test]
    fn event_injection_encoding() {
        let gp = EventInjection::general_protection();
        assert_eq!(gp.vector(), 13);
        assert_eq!(gp.event_type(), event_type::EXCEPTION);
        assert!(gp.error_code_valid());
        assert!(gp.valid());
        assert_eq!(gp.error_code(), 0);

        let ud = EventInjection::invalid_opcode();
        assert!(!ud.error_code_valid());
        assert_eq!(ud.vector(), 6);

        let nmi = EventInjection::nmi();
        assert_eq!(nmi.event_type(), event_type::NMI);
    }

    #[test]
    fn io_access_decoding() {
        // OUT dx, al: 8-bit output to port 0x3f8, 64-bit address size.
        let info = IoAccessInfo(0x03f8_0010);
        assert!(!info.input());
        assert_eq!(info.operand_size(), 1);
        assert_eq!(info.address_width(), 8);
        assert_eq!(info.port(), 0x3f8);
    }

    #[test]
    fn clean_bit_maintenance() {
        let mut vmcb = Vmcb::default();
        vmcb.mark_all_clean();
        vmcb.invalidate(clean::CRX | clean::CR2);
        assert_eq!(vmcb.control.vmcb_clean, 0xffff_ffff & !0x220);
        vmcb.mark_all_dirty();
        assert_eq!(vmcb.control.vmcb_clean, 0);
    }
}
