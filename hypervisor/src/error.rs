//! The module containing the [`HvError`] type.

/// The closed set of failure codes returned by the scheduler facade and the
/// hypercall surface. Success is expressed as [`Ok`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvError {
    /// A generic failure that fits no other code.
    Unsuccessful,

    /// The requested operation is recognised but not implemented on this
    /// port (eg, guest-virtual address translation on the Type-I path).
    NotImplemented,

    /// An allocation failed, the ASID pool is exhausted, or a page-table
    /// sub-structure could not be created.
    InsufficientResources,

    /// A mapping id was out of range, a pointer was null, or a VM was
    /// created with zero total mappings.
    InvalidParameter,

    /// The vCPU slot is already occupied.
    VcpuAlreadyCreated,

    /// An accessed-bit query was issued against a GPA with no live
    /// translation.
    GuestPageAbsent,

    /// The host tried to map a non-resident or non-locked user page into a
    /// guest.
    UserPageViolation,

    /// The accessed-bitmap output buffer holds fewer than two bits per
    /// queried page.
    BufferTooSmall,

    /// The rescission bit was already set by an earlier caller.
    AlreadyRescinded,
}

impl HvError {
    /// The numeric status delivered in rax across the hypercall ABI.
    pub fn code(self) -> u64 {
        match self {
            Self::Unsuccessful => 1,
            Self::NotImplemented => 2,
            Self::InsufficientResources => 3,
            Self::InvalidParameter => 4,
            Self::VcpuAlreadyCreated => 5,
            Self::GuestPageAbsent => 6,
            Self::UserPageViolation => 7,
            Self::BufferTooSmall => 8,
            Self::AlreadyRescinded => 9,
        }
    }
}

/// The rax status of a successful hypercall.
pub const STATUS_SUCCESS: u64 = 0;

/// Folds a result into the rax status encoding.
pub fn status_of(result: Result<()>) -> u64 {
    match result {
        Ok(()) => STATUS_SUCCESS,
        Err(error) => error.code(),
    }
}

/// The crate-wide result alias.
pub type Result<T> = core::result::Result<T, HvError>;
