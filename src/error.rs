use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UvmError {
    #[error("Invalid address")]
    InvalidAddress,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid device")]
    InvalidDevice,

    #[error("Address span is out of range for the processor")]
    OutOfRange,

    #[error("Operation not supported")]
    NotSupported,

    /// Not a failure: user space completes the operation through another path.
    #[error("Nothing to do")]
    NothingToDo,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Resource busy, retry")]
    Busy,

    #[error("Resource in use")]
    InUse,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Address range [0x{start:x}, 0x{end:x}] is already in use")]
    AddressInUse { start: u64, end: u64 },

    #[error("Channel error on {channel}: {reason}")]
    ChannelError { channel: String, reason: String },

    #[error("Operation timed out")]
    WaitTimeout,
}

impl UvmError {
    /// The caller may retry the exact same call later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Warning class status: the call did not fail.
    #[must_use]
    pub const fn is_warning(&self) -> bool {
        matches!(self, Self::NothingToDo)
    }
}

// A convenient alias
pub type UvmResult<T> = Result<T, UvmError>;
