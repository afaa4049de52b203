//! Error codes
use core::fmt;

/// The result type of every fallible kernel operation.
pub type Result<T> = core::result::Result<T, KernelError>;

/// The closed error taxonomy of the kernel.
///
/// The discriminants are stable numeric codes; callers on a foreign-function
/// or wire boundary may rely on them. [`KernelError::code`] returns the raw
/// value.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelError {
    /// A blocking call timed out. Returned only when a timeout was requested.
    Timeout = 0x01,
    /// The object was deleted, possibly while the caller was waiting on it.
    ObjectDeleted = 0x05,
    /// The id failed its validity check (bad slot or stale generation).
    BadId = 0x06,
    /// No object of that name exists.
    ObjectNotFound = 0x09,
    /// The task pool is exhausted.
    NoTcb = 0x0e,
    /// The stack budget is exhausted.
    NoStack = 0x0f,
    /// The requested stack is below the configured minimum.
    TinyStack = 0x10,
    /// Priority out of the valid range.
    BadPriority = 0x11,
    /// The task was already started.
    Active = 0x12,
    /// The task was never started.
    NotActive = 0x13,
    /// The task is already suspended.
    Suspended = 0x14,
    /// The task is not suspended.
    NotSuspended = 0x15,
    /// Notepad register number out of range.
    BadRegister = 0x17,
    /// The queue pool is exhausted.
    NoQcb = 0x33,
    /// The message-buffer arena cannot satisfy the request.
    NoMsgBuffers = 0x34,
    /// The queue is at capacity.
    QueueFull = 0x35,
    /// The queue is empty. Returned only for no-wait receives.
    NoMessage = 0x37,
    /// The requested events are not pending. Returned only for no-wait
    /// receives.
    NoEvents = 0x3c,
    /// The semaphore pool is exhausted.
    NoScb = 0x41,
    /// The semaphore is unavailable. Returned only for no-wait acquires.
    NoSemaphore = 0x42,
    /// A tick count of zero (or otherwise out of range) was supplied.
    IllegalTicks = 0x4a,
    /// The timer pool is exhausted.
    NoTimers = 0x4b,
    /// The timer id names no armed timer.
    BadTimerId = 0x4c,
    /// A parameter failed validation.
    BadParam = 0x50,
    /// The operation was invoked from a context that cannot perform it.
    BadContext = 0x51,
}

impl KernelError {
    /// The stable numeric code of this error.
    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Debug for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Timeout => "Timeout",
            Self::ObjectDeleted => "ObjectDeleted",
            Self::BadId => "BadId",
            Self::ObjectNotFound => "ObjectNotFound",
            Self::NoTcb => "NoTcb",
            Self::NoStack => "NoStack",
            Self::TinyStack => "TinyStack",
            Self::BadPriority => "BadPriority",
            Self::Active => "Active",
            Self::NotActive => "NotActive",
            Self::Suspended => "Suspended",
            Self::NotSuspended => "NotSuspended",
            Self::BadRegister => "BadRegister",
            Self::NoQcb => "NoQcb",
            Self::NoMsgBuffers => "NoMsgBuffers",
            Self::QueueFull => "QueueFull",
            Self::NoMessage => "NoMessage",
            Self::NoEvents => "NoEvents",
            Self::NoScb => "NoScb",
            Self::NoSemaphore => "NoSemaphore",
            Self::IllegalTicks => "IllegalTicks",
            Self::NoTimers => "NoTimers",
            Self::BadTimerId => "BadTimerId",
            Self::BadParam => "BadParam",
            Self::BadContext => "BadContext",
        };
        write!(f, "{name}(0x{:02x})", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(KernelError::Timeout.code(), 0x01);
        assert_eq!(KernelError::ObjectDeleted.code(), 0x05);
        assert_eq!(KernelError::BadId.code(), 0x06);
        assert_eq!(KernelError::NoTcb.code(), 0x0e);
        assert_eq!(KernelError::QueueFull.code(), 0x35);
        assert_eq!(KernelError::NoEvents.code(), 0x3c);
        assert_eq!(KernelError::BadTimerId.code(), 0x4c);
    }
}
