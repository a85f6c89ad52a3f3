//! Kernel-wide error types.
//!
//! Every fallible kernel operation reports one of these instead of a bare
//! status integer; the syscall layer is the only place they are flattened
//! into the in-band status codes user space sees.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No physical frame, no fitting virtual range, or heap exhaustion.
    OutOfMemory,
    /// A pid no longer refers to a live process.
    ProcessNotFound { pid: u64 },
    /// A tid does not exist inside the targeted process.
    ThreadNotFound { tid: u64 },
    /// The receiver's bounded message queue refused a send.
    QueueFull,
    /// A page-transfer send named a non-page-aligned or unmapped source.
    InvalidMemoryRange { addr: u64 },
    /// The operation requires driver privileges.
    PermissionDenied { operation: &'static str },
    /// Target object does not exist.
    NotFound { resource: &'static str, id: u64 },
    /// The requested range overlaps something already present.
    RangeOccupied { addr: u64 },
    /// Opcode unknown to this kernel build.
    UnsupportedSyscall { opcode: u64 },
    /// IPC-specific errors
    IpcError(IpcError),
    /// Scheduler-specific errors
    SchedulerError(SchedError),
}

/// IPC-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    QueueFull { capacity: usize },
    QueueEmpty,
    ProcessNotFound { pid: u64 },
    RegionNotFound { id: u64 },
    AlreadyAsleep,
}

/// Scheduler-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    AlreadyScheduled,
    NotScheduled,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::ProcessNotFound { pid } => write!(f, "process {} not found", pid),
            Self::ThreadNotFound { tid } => write!(f, "thread {} not found", tid),
            Self::QueueFull => write!(f, "receiver's message queue is full"),
            Self::InvalidMemoryRange { addr } => {
                write!(f, "invalid memory range at {:#x}", addr)
            }
            Self::PermissionDenied { operation } => {
                write!(f, "permission denied for {}", operation)
            }
            Self::NotFound { resource, id } => write!(f, "{} {} not found", resource, id),
            Self::RangeOccupied { addr } => write!(f, "range at {:#x} is occupied", addr),
            Self::UnsupportedSyscall { opcode } => write!(f, "unsupported syscall {}", opcode),
            Self::IpcError(e) => write!(f, "IPC error: {:?}", e),
            Self::SchedulerError(e) => write!(f, "scheduler error: {:?}", e),
        }
    }
}

impl From<IpcError> for KernelError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::QueueFull { .. } => Self::QueueFull,
            IpcError::ProcessNotFound { pid } => Self::ProcessNotFound { pid },
            _ => Self::IpcError(err),
        }
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::SchedulerError(err)
    }
}
