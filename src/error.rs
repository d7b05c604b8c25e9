//! The CMSIS-RTOS style status taxonomy.
//!
//! The kernel never panics its way out of a caller-facing error; it returns
//! one of these. Discriminants are kept stable and match the magnitude
//! ordering of the original `osStatus_t` so a caller storing raw codes
//! across an FFI boundary gets the same numbers back.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    /// Operation completed successfully.
    Ok = 0,
    /// Operation not completed within the specified time.
    ErrorTimeout = -1,
    /// Resource not available (would block with a zero timeout, full/empty
    /// container, or the object was deleted while the caller waited on it).
    ErrorResource = -2,
    /// Parameter error (null handle, bad size/alignment, non-zero timeout
    /// from ISR context).
    ErrorParameter = -3,
    /// Not allowed in ISR context.
    ErrorIsr = -4,
    /// Out of memory (pool exhausted, no free slot).
    ErrorNoMemory = -5,
    /// Unspecified RTOS error.
    Error = -6,
}

impl Status {
    /// True for any outcome other than `Ok`.
    pub fn is_error(self) -> bool {
        !matches!(self, Status::Ok)
    }
}

pub type KernelResult<T> = Result<T, Status>;

/// Sentinel returned by an internal blocking handler to mean "the calling
/// thread has been moved to a wait state; its real return value will be in
/// `winfo.ret_val` once it is rescheduled". Mirrors the original's
/// `osThreadWait` constant. Never surfaced to application code directly —
/// the kernel gate (see [`crate::kernel`]) intercepts it.
pub const THREAD_WAIT: i32 = -16;
