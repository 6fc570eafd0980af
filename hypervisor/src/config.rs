//! The module containing various constants that may be modified by developers,
//! and the process-wide option word recognised by the embedding kernel.

/// The logging level.
pub const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Info;

/// The number of vCPU slots in a VM. Bounded by what the physical APIC ID
/// table can describe.
pub const MAX_VCPUS_PER_VM: usize = 255;

/// Process-wide behavior switches, fixed at initialization.
///
/// Most of these drive subsystems outside this crate (the stealth hooks, the
/// enlightenment tables); they are carried here so that the CVM core can
/// consult them where behavior overlaps, eg, ASID partitioning under nested
/// virtualization.
#[derive(Debug, Clone, Copy, Default)]
pub struct HvOptions {
    /// Reserve an ASID range for guests that run their own hypervisors.
    pub nested_virtualization: bool,
    /// Hide the MSR hooks from the subverted host.
    pub stealth_msr_hook: bool,
    /// Hide the inline hooks from the subverted host.
    pub stealth_inline_hook: bool,
    /// The subverted host runs with KVA shadowing (Meltdown mitigation).
    pub kva_shadow_presence: bool,
    /// Report the hypervisor-present CPUID bit to the subverted host.
    pub cpuid_hv_presence: bool,
    /// Pass Microsoft TLFS leaves through to an underlying hypervisor.
    pub tlfs_passthrough: bool,
    /// Hide the hypervisor from processor-trace captures.
    pub hide_from_pt: bool,
    /// Use the software instruction decoder for MMIO instead of surfacing
    /// raw memory accesses.
    pub software_decoder: bool,
}
