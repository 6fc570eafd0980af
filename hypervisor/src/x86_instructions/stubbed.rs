//! Inert stand-ins for the privileged wrappers, compiled into unit tests
//! only. Reads report zero; writes and barriers do nothing. Tests assert
//! against the VMCB and the logical views, never against real hardware
//! registers.

use x86::dtables::DescriptorTablePointer;

pub(crate) fn rdmsr(_msr: u32) -> u64 {
    0
}

pub(crate) fn wrmsr(_msr: u32, _value: u64) {}

pub(crate) fn inb(_port: u16) -> u8 {
    0
}

pub(crate) fn outb(_port: u16, _val: u8) {}

pub(crate) fn sti() {}

pub(crate) fn cr2() -> u64 {
    0
}

pub(crate) fn cr2_write(_value: u64) {}

pub(crate) fn cr3_write(_value: u64) {}

pub(crate) fn cr4_write(_value: u64) {}

pub(crate) fn lidt<T>(_idtr: &DescriptorTablePointer<T>) {}

pub(crate) fn lgdt<T>(_gdtr: &DescriptorTablePointer<T>) {}

pub(crate) fn dr0() -> u64 {
    0
}

pub(crate) fn dr0_write(_value: u64) {}

pub(crate) fn dr1() -> u64 {
    0
}

pub(crate) fn dr1_write(_value: u64) {}

pub(crate) fn dr2() -> u64 {
    0
}

pub(crate) fn dr2_write(_value: u64) {}

pub(crate) fn dr3() -> u64 {
    0
}

pub(crate) fn dr3_write(_value: u64) {}

pub(crate) fn xgetbv(_index: u32) -> u64 {
    1
}

pub(crate) fn xsetbv(_index: u32, _value: u64) {}

pub(crate) fn xsave(_area: *mut u8) {}

pub(crate) fn xrstor(_area: *const u8) {}

pub(crate) fn wbinvd() {}

#[allow(dead_code)]
pub(crate) fn invlpga(_va: u64, _asid: u32) {}

pub(crate) fn vmmcall(_function: u32, _context: u64) -> u64 {
    0
}

pub(crate) fn vmload(_vmcb_pa: u64) {}

pub(crate) fn stgi() {}

pub(crate) fn debug_break() {}
