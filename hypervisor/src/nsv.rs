//! The module containing the NoirVisor Secure Virtualization (NSV)
//! engine.
//!
//! A VM that opts into NSV becomes confidential: the layered hypervisor
//! loses direct access to the logical vCPU view. Between world switches
//! the guest's general, debug and extended state lives in a per-vCPU
//! virtual-machine save area (VMSA) the guest itself provided through the
//! claim protocol, and page contents are sealed with the VM's AES-128 key
//! whenever ownership leaves the secure guest. A reserved synthetic MSR
//! window carries the GHCB address, the guest-owned #VC handler entry, and
//! the activation and claim commands.

use crate::{
    platform::{pa_of, PlatformOps},
    vcpu::{CustomVcpu, CvmIntercept, GprState, VcpuState},
    x86_instructions::{
        dr0, dr0_write, dr1, dr1_write, dr2, dr2_write, dr3, dr3_write, xgetbv, xrstor, xsave,
        xsetbv,
    },
};
use aes::{
    cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit},
    Aes128,
};
use bitfield::bitfield;

/// The synthetic MSR window. The range is reserved for this interface;
/// accesses from a guest that is not NSV-aware fault as unknown MSRs.
pub mod msr {
    #![allow(missing_docs)]
    /// "NV" << 16.
    pub const BASE: u32 = 0x4e56_0000;
    pub const GHCB: u32 = BASE;
    pub const VC_HANDLER_CS: u32 = BASE + 0x1;
    pub const VC_HANDLER_RSP: u32 = BASE + 0x2;
    pub const VC_HANDLER_RIP: u32 = BASE + 0x3;
    pub const VC_RETURN_CS: u32 = BASE + 0x4;
    pub const VC_RETURN_RSP: u32 = BASE + 0x5;
    pub const VC_RETURN_RIP: u32 = BASE + 0x6;
    pub const VC_RETURN_RFLAGS: u32 = BASE + 0x7;
    pub const VC_NEXT_RIP: u32 = BASE + 0x8;
    pub const VC_ERROR_CODE: u32 = BASE + 0x9;
    pub const VC_INFO1: u32 = BASE + 0xa;
    pub const VC_INFO2: u32 = BASE + 0xb;
    pub const ACTIVATION: u32 = BASE + 0x10;
    pub const CLAIM_GPA_CMD: u32 = BASE + 0x11;
    pub const CLAIM_GPA_START: u32 = BASE + 0x12;
    pub const CLAIM_GPA_END: u32 = BASE + 0x13;

    /// Whether `index` falls inside the synthetic window.
    pub fn in_range(index: u32) -> bool {
        (BASE..=CLAIM_GPA_END).contains(&index)
    }
}

bitfield! {
    /// The activation command: bit 0 selects the direction, everything
    /// else must be zero.
    #[derive(Clone, Copy)]
    pub struct ActivationCommand(u64);
    impl Debug;
    /// Activate (true) or deactivate confidential mode.
    pub activate, _: 0;
    /// Must be zero.
    pub reserved, _: 63, 1;
}

bitfield! {
    /// The claim command: bit 0 claims, everything else must be zero.
    #[derive(Clone, Copy)]
    pub struct ClaimCommand(u64);
    impl Debug;
    /// Claim (true) or release security of the window.
    pub claim, _: 0;
    /// Must be zero.
    pub reserved, _: 63, 1;
}

/// The #VC dispatch registers mirrored through the synthetic MSRs.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
#[allow(missing_docs)]
pub struct VcState {
    pub handler_cs: u64,
    pub handler_rsp: u64,
    pub handler_rip: u64,
    pub return_cs: u64,
    pub return_rsp: u64,
    pub return_rip: u64,
    pub return_rflags: u64,
    pub next_rip: u64,
    pub error_code: u64,
    pub info1: u64,
    pub info2: u64,
}

/// Bytes available for the sealed XSAVE image inside the VMSA page.
pub const VMSA_XSTATE_CAPACITY: usize = 4096 - 320;

/// The virtual-machine save area holding a confidential vCPU's register
/// state between runs. The leading back-pointers are the anti-tampering
/// seal: a switch aborts unless they still name the vCPU and VMCB the
/// page was claimed for.
#[derive(Debug)]
#[repr(C, align(4096))]
pub struct VmsaPage {
    /// Must equal the owning vCPU's address.
    pub parent_vcpu: u64,
    /// Must equal the owning vCPU's VMCB virtual address.
    pub vmcb_va: u64,
    /// Must equal the owning vCPU's VMCB physical address.
    pub vmcb_pa: u64,
    /// The sealed general-purpose registers.
    pub gpr: GprState,
    #[allow(missing_docs)]
    pub dr0: u64,
    #[allow(missing_docs)]
    pub dr1: u64,
    #[allow(missing_docs)]
    pub dr2: u64,
    #[allow(missing_docs)]
    pub dr3: u64,
    /// The sealed XCR0.
    pub xcr0: u64,
    /// The #VC dispatch registers.
    pub vc: VcState,
    _reserved: [u8; 40],
    /// The sealed XSAVE image; 64-byte aligned by the layout above.
    pub xstate: [u8; VMSA_XSTATE_CAPACITY],
}
const _: () = assert!(core::mem::size_of::<VmsaPage>() == 0x1000);
const _: () = assert!(core::mem::offset_of!(VmsaPage, xstate) % 64 == 0);

/// Per-vCPU NSV state kept in the open (non-sealed) vCPU record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NsvState {
    /// The guest-to-hypervisor communication block address.
    pub ghcb: u64,
    /// Start of the claim window.
    pub claim_gpa_start: u64,
    /// End of the claim window.
    pub claim_gpa_end: u64,
    /// Address of the claimed [`VmsaPage`], or 0 before the claim.
    pub vmsa: u64,
}

/// Resolves the claimed VMSA of a vCPU, verifying the anti-tampering
/// back-pointers: the embedded vCPU pointer guards against save-area
/// swaps, the VMCB pair against control-block swaps.
fn verified_vmsa<'a>(
    vcpu: &CustomVcpu,
    state: &'a VcpuState,
) -> Option<&'a mut VmsaPage> {
    if state.nsv.vmsa == 0 {
        return None;
    }
    // Safety: the claim protocol installed this address and the page is
    // hypervisor-owned for the lifetime of the claim.
    let vmsa = unsafe { &mut *(state.nsv.vmsa as *mut VmsaPage) };
    if vmsa.parent_vcpu != pa_of(vcpu) {
        return None;
    }
    if vmsa.vmcb_va != pa_of(&*state.vmcb) || vmsa.vmcb_pa != state.vmcb_pa {
        return None;
    }
    Some(vmsa)
}

/// Loads a confidential guest's registers from its VMSA for entry. The
/// state cache plays no part; the VMSA is authoritative. Returns false if
/// the integrity checks fail, in which case nothing was loaded.
pub(crate) fn load_guest_vcpu(vcpu: &CustomVcpu, state: &mut VcpuState, gprs: &mut GprState) -> bool {
    let Some(vmsa) = verified_vmsa(vcpu, state) else {
        return false;
    };
    *gprs = vmsa.gpr;
    dr0_write(vmsa.dr0);
    dr1_write(vmsa.dr1);
    dr2_write(vmsa.dr2);
    dr3_write(vmsa.dr3);
    xsetbv(0, vmsa.xcr0);
    xrstor(vmsa.xstate.as_ptr());
    true
}

/// Seals a confidential guest's registers into its VMSA at exit. Returns
/// false if the integrity checks fail.
pub(crate) fn save_guest_vcpu(vcpu: &CustomVcpu, state: &mut VcpuState, gprs: &GprState) -> bool {
    let rax = state.vmcb.save.rax;
    let rsp = state.vmcb.save.rsp;
    let Some(vmsa) = verified_vmsa(vcpu, state) else {
        return false;
    };
    vmsa.gpr = *gprs;
    vmsa.gpr.rax = rax;
    vmsa.gpr.rsp = rsp;
    vmsa.dr0 = dr0();
    vmsa.dr1 = dr1();
    vmsa.dr2 = dr2();
    vmsa.dr3 = dr3();
    vmsa.xcr0 = xgetbv(0);
    xsave(vmsa.xstate.as_mut_ptr());
    true
}

/// Bulk-transfers GPR/DR/XCR0/XSTATE between the open vCPU view and the
/// VMSA at an activation toggle. `to_vmsa` seals (CVM to NSV); the other
/// direction unseals.
pub(crate) fn synchronize_activation(state: &mut VcpuState, to_vmsa: bool) -> bool {
    if state.nsv.vmsa == 0 {
        return false;
    }
    // Safety: as in `verified_vmsa`; the back-pointers are installed by
    // this very transition when sealing.
    let vmsa = unsafe { &mut *(state.nsv.vmsa as *mut VmsaPage) };
    let copy = state.xsave.bytes().len().min(VMSA_XSTATE_CAPACITY);
    if to_vmsa {
        vmsa.gpr = state.gpr;
        vmsa.dr0 = state.drs.dr0;
        vmsa.dr1 = state.drs.dr1;
        vmsa.dr2 = state.drs.dr2;
        vmsa.dr3 = state.drs.dr3;
        vmsa.xcr0 = state.xcr0;
        vmsa.xstate[..copy].copy_from_slice(&state.xsave.bytes()[..copy]);
    } else {
        state.gpr = vmsa.gpr;
        state.drs.dr0 = vmsa.dr0;
        state.drs.dr1 = vmsa.dr1;
        state.drs.dr2 = vmsa.dr2;
        state.drs.dr3 = vmsa.dr3;
        state.xcr0 = vmsa.xcr0;
        let xstate = vmsa.xstate;
        state.xsave.bytes_mut()[..copy].copy_from_slice(&xstate[..copy]);
    }
    true
}

/// Stages the #VC dispatch: parks the interrupted context in the
/// return-register MSRs, loads the guest-owned handler entry, and masks
/// interrupts for the handler.
pub(crate) fn prepare_vc_dispatch(
    state: &mut VcpuState,
    error_code: u64,
    info1: u64,
    info2: u64,
) -> bool {
    const RFLAGS_IF: u64 = 1 << 9;
    let cs = state.vmcb.save.cs_selector;
    let ss = state.vmcb.save.ss_selector;
    let rsp = state.vmcb.save.rsp;
    let rip = state.vmcb.save.rip;
    let rflags = state.vmcb.save.rflags;
    let nrip = state.vmcb.control.nrip;
    if state.nsv.vmsa == 0 {
        return false;
    }
    // Safety: as in `verified_vmsa`.
    let vmsa = unsafe { &mut *(state.nsv.vmsa as *mut VmsaPage) };
    if vmsa.vc.handler_rip == 0 {
        return false;
    }
    vmsa.vc.return_cs = u64::from(cs) | (u64::from(ss) << 16);
    vmsa.vc.return_rsp = rsp;
    vmsa.vc.return_rip = rip;
    vmsa.vc.return_rflags = rflags;
    vmsa.vc.next_rip = nrip;
    vmsa.vc.error_code = error_code;
    vmsa.vc.info1 = info1;
    vmsa.vc.info2 = info2;
    let handler_cs = vmsa.vc.handler_cs;
    let handler_rsp = vmsa.vc.handler_rsp;
    let handler_rip = vmsa.vc.handler_rip;
    state.vmcb.save.cs_selector = handler_cs as u16;
    state.vmcb.save.ss_selector = (handler_cs >> 16) as u16;
    state.vmcb.invalidate(crate::vmcb::clean::SEG);
    state.vmcb.save.rsp = handler_rsp;
    state.vmcb.save.rip = handler_rip;
    state.vmcb.save.rflags &= !RFLAGS_IF;
    true
}

/// What a synthetic-MSR access resolved to.
pub(crate) enum SyntheticMsrOutcome {
    /// Emulated in place; advance past the instruction.
    Handled,
    /// Architecturally illegal; inject #GP(0).
    Fault,
    /// Surface the given intercept to the layered hypervisor.
    Surface(CvmIntercept),
}

/// Reads a synthetic MSR.
pub(crate) fn handle_synthetic_rdmsr(state: &mut VcpuState, index: u32) -> Result<u64, ()> {
    let vmsa = (state.nsv.vmsa != 0)
        // Safety: as in `verified_vmsa`.
        .then(|| unsafe { &*(state.nsv.vmsa as *const VmsaPage) });
    let value = match index {
        msr::GHCB => state.nsv.ghcb,
        msr::VC_HANDLER_CS => vmsa.ok_or(())?.vc.handler_cs,
        msr::VC_HANDLER_RSP => vmsa.ok_or(())?.vc.handler_rsp,
        msr::VC_HANDLER_RIP => vmsa.ok_or(())?.vc.handler_rip,
        msr::VC_RETURN_CS => vmsa.ok_or(())?.vc.return_cs,
        msr::VC_RETURN_RSP => vmsa.ok_or(())?.vc.return_rsp,
        msr::VC_RETURN_RIP => vmsa.ok_or(())?.vc.return_rip,
        msr::VC_RETURN_RFLAGS => vmsa.ok_or(())?.vc.return_rflags,
        msr::VC_NEXT_RIP => vmsa.ok_or(())?.vc.next_rip,
        msr::VC_ERROR_CODE => vmsa.ok_or(())?.vc.error_code,
        msr::VC_INFO1 => vmsa.ok_or(())?.vc.info1,
        msr::VC_INFO2 => vmsa.ok_or(())?.vc.info2,
        _ => return Err(()),
    };
    Ok(value)
}

/// Writes a synthetic MSR. `nsv_guest` reports whether the VM is already
/// confidential, which the claim command requires.
pub(crate) fn handle_synthetic_wrmsr(
    state: &mut VcpuState,
    nsv_guest: bool,
    index: u32,
    value: u64,
) -> SyntheticMsrOutcome {
    use SyntheticMsrOutcome::{Fault, Handled, Surface};
    match index {
        msr::GHCB => {
            state.nsv.ghcb = value;
            Handled
        }
        msr::ACTIVATION => {
            let command = ActivationCommand(value);
            if command.reserved() != 0 {
                return Fault;
            }
            if !synchronize_activation(state, command.activate()) {
                return Fault;
            }
            Surface(CvmIntercept::NsvActivate {
                activated: command.activate(),
            })
        }
        msr::CLAIM_GPA_CMD => {
            let command = ClaimCommand(value);
            if !nsv_guest || command.reserved() != 0 {
                return Fault;
            }
            if state.nsv.claim_gpa_end <= state.nsv.claim_gpa_start {
                return Fault;
            }
            let pages = (state.nsv.claim_gpa_end - state.nsv.claim_gpa_start) >> 12;
            if pages > u64::from(u32::MAX) {
                return Fault;
            }
            Surface(CvmIntercept::NsvClaimSecurity {
                gpa_start: state.nsv.claim_gpa_start,
                gpa_end: state.nsv.claim_gpa_end,
            })
        }
        msr::CLAIM_GPA_START => {
            if value & 0xfff != 0 {
                return Fault;
            }
            state.nsv.claim_gpa_start = value;
            Handled
        }
        msr::CLAIM_GPA_END => {
            if value & 0xfff != 0 {
                return Fault;
            }
            state.nsv.claim_gpa_end = value;
            Handled
        }
        msr::VC_HANDLER_CS | msr::VC_HANDLER_RSP | msr::VC_HANDLER_RIP => {
            if state.nsv.vmsa == 0 {
                return Fault;
            }
            // Safety: as in `verified_vmsa`.
            let vmsa = unsafe { &mut *(state.nsv.vmsa as *mut VmsaPage) };
            match index {
                msr::VC_HANDLER_CS => vmsa.vc.handler_cs = value,
                msr::VC_HANDLER_RSP => vmsa.vc.handler_rsp = value,
                _ => vmsa.vc.handler_rip = value,
            }
            Handled
        }
        _ => Fault,
    }
}

/// The per-VM page-encryption keys.
pub struct NsvKeys {
    cipher: Aes128,
}

impl NsvKeys {
    /// Derives a fresh key from platform entropy.
    pub(crate) fn generate(platform: &dyn PlatformOps) -> Self {
        let mut key = [0u8; 16];
        platform.entropy(&mut key);
        Self {
            cipher: Aes128::new(GenericArray::from_slice(&key)),
        }
    }
}

/// Seals one page in place with the VM's key.
pub(crate) fn encrypt_page(keys: &NsvKeys, page: &mut [u8; 0x1000]) {
    for block in page.chunks_exact_mut(16) {
        keys.cipher
            .encrypt_block(GenericArray::from_mut_slice(block));
    }
}

/// Unseals one page in place with the VM's key.
pub(crate) fn decrypt_page(keys: &NsvKeys, page: &mut [u8; 0x1000]) {
    for block in page.chunks_exact_mut(16) {
        keys.cipher
            .decrypt_block(GenericArray::from_mut_slice(block));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_state::tests::{test_global, TestPlatform};

    #[test]
    fn msr_window_bounds() {
        assert!(msr::in_range(msr::GHCB));
        assert!(msr::in_range(msr::CLAIM_GPA_END));
        assert!(!msr::in_range(msr::BASE - 1));
        assert!(!msr::in_range(msr::CLAIM_GPA_END + 1));
    }

    #[test]
    fn page_crypto_round_trips() {
        static PLATFORM: TestPlatform = TestPlatform::new();
        let keys = NsvKeys::generate(&PLATFORM);
        let mut page = [0u8; 0x1000];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let original = page;
        encrypt_page(&keys, &mut page);
        assert_ne!(page, original);
        decrypt_page(&keys, &mut page);
        assert_eq!(page, original);
    }

    #[test]
    fn claim_protocol_validation() {
        let global = test_global();
        let vm = crate::vm::CustomVm::create(&global, 1).unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        let mut state = vcpu.state();
        // Claiming before activation faults.
        assert!(matches!(
            handle_synthetic_wrmsr(&mut *state, false, msr::CLAIM_GPA_CMD, 1),
            SyntheticMsrOutcome::Fault
        ));
        // Unaligned window bounds fault.
        assert!(matches!(
            handle_synthetic_wrmsr(&mut *state, true, msr::CLAIM_GPA_START, 0x1234),
            SyntheticMsrOutcome::Fault
        ));
        // A well-formed claim surfaces to the layered hypervisor.
        assert!(matches!(
            handle_synthetic_wrmsr(&mut *state, true, msr::CLAIM_GPA_START, 0x10000),
            SyntheticMsrOutcome::Handled
        ));
        assert!(matches!(
            handle_synthetic_wrmsr(&mut *state, true, msr::CLAIM_GPA_END, 0x13000),
            SyntheticMsrOutcome::Handled
        ));
        match handle_synthetic_wrmsr(&mut *state, true, msr::CLAIM_GPA_CMD, 1) {
            SyntheticMsrOutcome::Surface(CvmIntercept::NsvClaimSecurity {
                gpa_start,
                gpa_end,
            }) => {
                assert_eq!(gpa_start, 0x10000);
                assert_eq!(gpa_end, 0x13000);
            }
            _ => panic!("claim did not surface"),
        }
        // Reserved activation bits fault.
        assert!(matches!(
            handle_synthetic_wrmsr(&mut *state, true, msr::ACTIVATION, 0x2),
            SyntheticMsrOutcome::Fault
        ));
        drop(state);
        vm.release();
    }

    #[test]
    fn vmsa_integrity_gates_the_switch() {
        let global = test_global();
        let vm = crate::vm::CustomVm::create(&global, 1).unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        let mut state = vcpu.state();
        let mut gprs = GprState::default();
        // No VMSA claimed: the switch aborts.
        assert!(!save_guest_vcpu(&vcpu, &mut *state, &gprs));
        // Install a VMSA with correct back-pointers.
        let mut vmsa = alloc::boxed::Box::new(VmsaPage {
            parent_vcpu: pa_of(&*vcpu),
            vmcb_va: pa_of(&*state.vmcb),
            vmcb_pa: state.vmcb_pa,
            gpr: GprState::default(),
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            xcr0: 1,
            vc: VcState::default(),
            _reserved: [0; 40],
            xstate: [0; VMSA_XSTATE_CAPACITY],
        });
        state.nsv.vmsa = pa_of(&mut *vmsa);
        // Activation sync now works both ways.
        state.gpr.rbx = 0x1122;
        assert!(synchronize_activation(&mut *state, true));
        assert_eq!(vmsa.gpr.rbx, 0x1122);
        vmsa.gpr.rbx = 0x3344;
        assert!(synchronize_activation(&mut *state, false));
        assert_eq!(state.gpr.rbx, 0x3344);
        // A tampered parent pointer aborts the switch.
        vmsa.parent_vcpu ^= 1;
        assert!(!save_guest_vcpu(&vcpu, &mut *state, &gprs));
        drop(state);
        vm.release();
    }

    #[test]
    fn vc_dispatch_stages_handler_entry() {
        let global = test_global();
        let vm = crate::vm::CustomVm::create(&global, 1).unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        let mut state = vcpu.state();
        let mut vmsa = alloc::boxed::Box::new(VmsaPage {
            parent_vcpu: pa_of(&*vcpu),
            vmcb_va: pa_of(&*state.vmcb),
            vmcb_pa: state.vmcb_pa,
            gpr: GprState::default(),
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            xcr0: 1,
            vc: VcState::default(),
            _reserved: [0; 40],
            xstate: [0; VMSA_XSTATE_CAPACITY],
        });
        state.nsv.vmsa = pa_of(&mut *vmsa);
        // No handler registered: nothing dispatched.
        assert!(!prepare_vc_dispatch(&mut *state, 0x400, 0, 0));
        vmsa.vc.handler_cs = 0x10 | (0x18 << 16);
        vmsa.vc.handler_rsp = 0x8000;
        vmsa.vc.handler_rip = 0x40_0000;
        state.vmcb.save.cs_selector = 0x33;
        state.vmcb.save.ss_selector = 0x2b;
        state.vmcb.save.rip = 0x1234;
        state.vmcb.save.rsp = 0x5678;
        state.vmcb.save.rflags = 0x202;
        state.vmcb.control.nrip = 0x1236;
        assert!(prepare_vc_dispatch(&mut *state, 0x400, 0x6, 0x7000));
        assert_eq!(vmsa.vc.return_cs, 0x33 | (0x2b << 16));
        assert_eq!(vmsa.vc.return_rip, 0x1234);
        assert_eq!(vmsa.vc.next_rip, 0x1236);
        assert_eq!(vmsa.vc.error_code, 0x400);
        assert_eq!(vmsa.vc.info2, 0x7000);
        assert_eq!(state.vmcb.save.cs_selector, 0x10);
        assert_eq!(state.vmcb.save.ss_selector, 0x18);
        assert_eq!(state.vmcb.save.rip, 0x40_0000);
        // The handler runs with interrupts masked.
        assert_eq!(state.vmcb.save.rflags & (1 << 9), 0);
        drop(state);
        vm.release();
    }
}
