//! The module containing wrapper functions for x86 instructions.
//!
//! Those instructions provided by the `x86` crate are `unsafe` functions, due
//! to the fact that they require certain preconditions. The wrappers provided
//! by this module encapsulate that `unsafe`-ness since this crate runs at
//! CPL0 and satisfies the preconditions. SVM-specific instructions the `x86`
//! crate does not cover are implemented with inline assembly.

#[cfg(not(test))]
mod hardware {
    use core::arch::asm;
    use x86::dtables::DescriptorTablePointer;

    /// Reads an MSR.
    pub(crate) fn rdmsr(msr: u32) -> u64 {
        // Safety: this code runs at CPL0.
        unsafe { x86::msr::rdmsr(msr) }
    }

    /// Writes a value to an MSR.
    pub(crate) fn wrmsr(msr: u32, value: u64) {
        // Safety: this code runs at CPL0.
        unsafe { x86::msr::wrmsr(msr, value) };
    }

    /// Reads 8-bits from an IO port.
    pub(crate) fn inb(port: u16) -> u8 {
        // Safety: this code runs at CPL0.
        unsafe { x86::io::inb(port) }
    }

    /// Writes 8-bits to an IO port.
    pub(crate) fn outb(port: u16, val: u8) {
        // Safety: this code runs at CPL0.
        unsafe { x86::io::outb(port, val) };
    }

    /// Enables maskable interrupts.
    pub(crate) fn sti() {
        // Safety: this code runs at CPL0.
        unsafe { x86::irq::enable() };
    }

    /// Reads the CR2 register.
    pub(crate) fn cr2() -> u64 {
        let value;
        // Safety: this code runs at CPL0.
        unsafe { asm!("mov {}, cr2", out(reg) value, options(nomem, nostack)) };
        value
    }

    /// Writes a value to the CR2 register.
    pub(crate) fn cr2_write(value: u64) {
        // Safety: this code runs at CPL0.
        unsafe { asm!("mov cr2, {}", in(reg) value, options(nomem, nostack)) };
    }

    /// Writes a value to the CR3 register.
    pub(crate) fn cr3_write(value: u64) {
        // Safety: this code runs at CPL0; the caller supplies a valid page table.
        unsafe { x86::controlregs::cr3_write(value) };
    }

    /// Writes a value to the CR4 register.
    pub(crate) fn cr4_write(value: u64) {
        // Safety: this code runs at CPL0; the caller supplies a legal CR4 image.
        unsafe { x86::controlregs::cr4_write(x86::controlregs::Cr4::from_bits_truncate(value as usize)) };
    }

    /// Loads the IDTR register.
    pub(crate) fn lidt<T>(idtr: &DescriptorTablePointer<T>) {
        // Safety: this code runs at CPL0; the caller supplies a valid table.
        unsafe { x86::dtables::lidt(idtr) };
    }

    /// Loads the GDTR register.
    pub(crate) fn lgdt<T>(gdtr: &DescriptorTablePointer<T>) {
        // Safety: this code runs at CPL0; the caller supplies a valid table.
        unsafe { x86::dtables::lgdt(gdtr) };
    }

    /// Reads the DR0 register.
    pub(crate) fn dr0() -> u64 {
        let value;
        // Safety: this code runs at CPL0.
        unsafe { asm!("mov {}, dr0", out(reg) value, options(nomem, nostack)) };
        value
    }

    /// Writes a value to the DR0 register.
    pub(crate) fn dr0_write(value: u64) {
        // Safety: this code runs at CPL0.
        unsafe { asm!("mov dr0, {}", in(reg) value, options(nomem, nostack)) };
    }

    /// Reads the DR1 register.
    pub(crate) fn dr1() -> u64 {
        let value;
        // Safety: this code runs at CPL0.
        unsafe { asm!("mov {}, dr1", out(reg) value, options(nomem, nostack)) };
        value
    }

    /// Writes a value to the DR1 register.
    pub(crate) fn dr1_write(value: u64) {
        // Safety: this code runs at CPL0.
        unsafe { asm!("mov dr1, {}", in(reg) value, options(nomem, nostack)) };
    }

    /// Reads the DR2 register.
    pub(crate) fn dr2() -> u64 {
        let value;
        // Safety: this code runs at CPL0.
        unsafe { asm!("mov {}, dr2", out(reg) value, options(nomem, nostack)) };
        value
    }

    /// Writes a value to the DR2 register.
    pub(crate) fn dr2_write(value: u64) {
        // Safety: this code runs at CPL0.
        unsafe { asm!("mov dr2, {}", in(reg) value, options(nomem, nostack)) };
    }

    /// Reads the DR3 register.
    pub(crate) fn dr3() -> u64 {
        let value;
        // Safety: this code runs at CPL0.
        unsafe { asm!("mov {}, dr3", out(reg) value, options(nomem, nostack)) };
        value
    }

    /// Writes a value to the DR3 register.
    pub(crate) fn dr3_write(value: u64) {
        // Safety: this code runs at CPL0.
        unsafe { asm!("mov dr3, {}", in(reg) value, options(nomem, nostack)) };
    }

    /// Reads an extended control register.
    pub(crate) fn xgetbv(index: u32) -> u64 {
        let (low, high): (u32, u32);
        // Safety: this code runs at CPL0 with CR4.OSXSAVE set.
        unsafe {
            asm!("xgetbv", in("ecx") index, out("eax") low, out("edx") high, options(nomem, nostack));
        }
        (u64::from(high) << 32) | u64::from(low)
    }

    /// Writes an extended control register.
    pub(crate) fn xsetbv(index: u32, value: u64) {
        // Safety: this code runs at CPL0 with CR4.OSXSAVE set; the caller
        // supplies a legal XCR image.
        unsafe {
            asm!("xsetbv", in("ecx") index, in("eax") value as u32, in("edx") (value >> 32) as u32,
                 options(nomem, nostack));
        }
    }

    /// Saves the enabled extended states into `area`, which must be 64-byte
    /// aligned and large enough for the host-supported feature mask.
    pub(crate) fn xsave(area: *mut u8) {
        // Safety: the caller guarantees alignment and size; this code runs at
        // CPL0 with CR4.OSXSAVE set.
        unsafe {
            asm!("xsave64 [{}]", in(reg) area, in("eax") u32::MAX, in("edx") u32::MAX);
        }
    }

    /// Loads the enabled extended states from `area`, with the requirements of
    /// [`xsave`].
    pub(crate) fn xrstor(area: *const u8) {
        // Safety: the caller guarantees alignment, size and a well-formed XSAVE
        // image; this code runs at CPL0 with CR4.OSXSAVE set.
        unsafe {
            asm!("xrstor64 [{}]", in(reg) area, in("eax") u32::MAX, in("edx") u32::MAX);
        }
    }

    /// Writes back and invalidates all caches.
    pub(crate) fn wbinvd() {
        // Safety: this code runs at CPL0.
        unsafe { asm!("wbinvd", options(nostack)) };
    }

    /// Invalidates TLB entries of the given virtual address under the given
    /// ASID.
    // dead_code: retained alongside the TLB-control path for targeted
    // invalidation; the hypercall surface currently flushes by ASID.
    #[allow(dead_code)]
    pub(crate) fn invlpga(va: u64, asid: u32) {
        // Safety: this code runs at CPL0 with EFER.SVME set.
        unsafe { asm!("invlpga", in("rax") va, in("ecx") asid, options(nostack)) };
    }

    /// Loads the VMCB-resident hidden state (FS/GS/TR/LDTR, syscall and
    /// sysenter MSRs) from the VMCB at `vmcb_pa`.
    pub(crate) fn vmload(vmcb_pa: u64) {
        // Safety: this code runs at CPL0 with EFER.SVME set; the caller supplies
        // a valid VMCB physical address.
        unsafe { asm!("vmload", in("rax") vmcb_pa, options(nostack)) };
    }

    /// Issues a hypercall with the architectural VMMCALL instruction. The
    /// function selector travels in rcx, the context in rdx, and the status
    /// comes back in rax.
    pub(crate) fn vmmcall(function: u32, context: u64) -> u64 {
        let status;
        // Safety: VMMCALL is intercepted by the hypervisor; it never executes
        // natively.
        unsafe {
            asm!("vmmcall", in("rcx") function, in("rdx") context, out("rax") status,
                 options(nostack));
        }
        status
    }

    /// Sets the global interrupt flag.
    pub(crate) fn stgi() {
        // Safety: this code runs at CPL0 with EFER.SVME set.
        unsafe { asm!("stgi", options(nomem, nostack)) };
    }

    /// Executes a breakpoint for the attached debugger. Used on broken internal
    /// invariants that are not recoverable but should be inspected.
    pub(crate) fn debug_break() {
        // Safety: this code runs at CPL0.
        unsafe { asm!("int3", options(nomem, nostack)) };
    }
}

#[cfg(not(test))]
pub(crate) use hardware::*;

// When unit tests run in user mode, the privileged wrappers are inert; the
// logic under test observes state through the VMCB and logical views.
#[cfg(test)]
mod stubbed;
#[cfg(test)]
pub(crate) use stubbed::*;
