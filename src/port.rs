//! The platform contract.
//!
//! Everything CPU- and board-specific lives outside this crate: the actual
//! context switch, interrupt masking, the supervisor-call trap, the tick
//! source and the pendable software interrupt. This module only pins down
//! the shape of that contract as a trait so the kernel core can be written
//! and tested without ever touching real hardware.
//!
//! An implementer provides one `Port` and installs it with
//! [`crate::kernel::Kernel::init`]. Tests in this crate use
//! [`TestPort`], a trivial same-thread stand-in.

/// Opaque, port-defined stack pointer value. The kernel core never
/// dereferences it; it is only ever threaded through `stack_init` and
/// `context_switch`.
pub type StackPointer = usize;

/// A thread entry point as seen by the port layer: argument in, never
/// returns (the port's exit trampoline handles fall-through).
pub type ThreadEntry = extern "C" fn(arg: usize);

/// CPU-level services the kernel core needs from its environment.
///
/// All methods are safe to call only from kernel context (i.e. with the
/// global kernel lock held, see [`crate::kernel::Kernel::critical`]);
/// the port is free to assume it is never reentered.
pub trait Port: Send + Sync {
    /// Mask all maskable interrupts. Must nest: an `irq_mask` while already
    /// masked is a no-op from the caller's point of view, but the port
    /// tracks nesting internally if it needs to (the kernel core itself
    /// does not nest critical sections).
    fn irq_mask(&self);

    /// Undo one `irq_mask`.
    fn irq_unmask(&self);

    /// True if the CPU is currently executing in interrupt context.
    fn irq_in_handler(&self) -> bool;

    /// True if interrupts are currently masked (by `irq_mask`, or because
    /// we are already inside a handler with interrupts disabled).
    fn irq_masked(&self) -> bool;

    /// Request the pendable (lowest priority, tail-chained) interrupt that
    /// performs the actual context switch. Idempotent: requesting it twice
    /// before it runs has the same effect as once.
    fn pendable_request(&self);

    /// Initialize a fresh stack for a new thread. Returns the initial
    /// saved stack pointer `context_switch` should use to resume it for
    /// the first time.
    ///
    /// # Safety
    /// `stack` must be a region of at least `size` bytes, valid for the
    /// lifetime of the thread, and not aliased by any other thread.
    unsafe fn stack_init(&self, stack: *mut u8, size: usize, entry: ThreadEntry, arg: usize) -> StackPointer;

    /// Perform the actual register/stack swap from the previously running
    /// thread to the next one. `prev_sp` receives the outgoing thread's
    /// saved stack pointer; `next_sp` is where execution resumes.
    ///
    /// # Safety
    /// Must be called only from the pendable interrupt handler with the
    /// scheduler's `run.curr`/`run.next` already updated.
    unsafe fn context_switch(&self, prev_sp: *mut StackPointer, next_sp: StackPointer);
}

/// A same-thread [`Port`] used by this crate's own test suite. There is no
/// real concurrency on the host, so context switches are represented only
/// as bookkeeping: the kernel core's scheduling *decisions* are what gets
/// exercised, not an actual register swap.
#[cfg(any(test, feature = "test-port"))]
pub struct TestPort {
    masked: core::sync::atomic::AtomicUsize,
    in_irq: core::sync::atomic::AtomicBool,
    pending: core::sync::atomic::AtomicBool,
}

#[cfg(any(test, feature = "test-port"))]
impl TestPort {
    pub const fn new() -> Self {
        Self {
            masked: core::sync::atomic::AtomicUsize::new(0),
            in_irq: core::sync::atomic::AtomicBool::new(false),
            pending: core::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Test helper: drive the pendable handler manually since there is no
    /// real interrupt controller on the host.
    pub fn take_pending(&self) -> bool {
        self.pending.swap(false, core::sync::atomic::Ordering::SeqCst)
    }

    pub fn enter_irq(&self) {
        self.in_irq.store(true, core::sync::atomic::Ordering::SeqCst);
    }

    pub fn exit_irq(&self) {
        self.in_irq.store(false, core::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "test-port"))]
impl Default for TestPort {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-port"))]
impl Port for TestPort {
    fn irq_mask(&self) {
        self.masked.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
    }

    fn irq_unmask(&self) {
        self.masked.fetch_sub(1, core::sync::atomic::Ordering::SeqCst);
    }

    fn irq_in_handler(&self) -> bool {
        self.in_irq.load(core::sync::atomic::Ordering::SeqCst)
    }

    fn irq_masked(&self) -> bool {
        self.masked.load(core::sync::atomic::Ordering::SeqCst) > 0
    }

    fn pendable_request(&self) {
        self.pending.store(true, core::sync::atomic::Ordering::SeqCst);
    }

    unsafe fn stack_init(&self, _stack: *mut u8, _size: usize, _entry: ThreadEntry, _arg: usize) -> StackPointer {
        0
    }

    unsafe fn context_switch(&self, prev_sp: *mut StackPointer, next_sp: StackPointer) {
        unsafe {
            *prev_sp = next_sp;
        }
    }
}
