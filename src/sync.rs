//! # Synchronization Primitives
//!
//! Interrupt-safe building blocks shared by the scheduler and its tasks.
//!
//! Everything here rests on the `critical-section` crate. On Cortex-M the
//! implementation comes from `cortex-m`'s `critical-section-single-core`
//! feature (PRIMASK save/disable/restore); host tests link the `std`
//! implementation.
//!
//! Any multi-step read-modify-write of tick values that an interrupt handler
//! may also touch goes through [`critical_section`] or an [`IrqGuard`].
//! ISRs themselves only ever touch a [`PreemptMask`], which is lock-free.

use core::marker::PhantomData;

use critical_section::{CriticalSection, RestoreState};
use portable_atomic::{AtomicU32, Ordering};

use crate::task::TaskId;

/// Execute a closure within a critical section (interrupts disabled).
///
/// Interrupts are disabled on entry and restored to their previous state on
/// exit, so this nests safely and may be called from ISR context.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

/// Scoped interrupt mask.
///
/// Interrupts are disabled while the guard lives and restored when it is
/// dropped. Guards must be dropped in the reverse order they were created,
/// which ordinary scoping guarantees. The guard is `!Send`: it restores the
/// state of the context that created it.
pub struct IrqGuard {
    restore: RestoreState,
    _not_send: PhantomData<*mut ()>,
}

impl IrqGuard {
    /// Disable interrupts until the returned guard is dropped.
    #[inline]
    pub fn new() -> Self {
        // Safety: the matching release happens in Drop, and guards cannot be
        // moved to another context, so acquire/release stay properly nested.
        let restore = unsafe { critical_section::acquire() };
        Self {
            restore,
            _not_send: PhantomData,
        }
    }

    /// Token for APIs that take a `CriticalSection` proof.
    #[inline]
    pub fn token(&self) -> CriticalSection<'_> {
        // Safety: interrupts are masked for as long as `self` is borrowed.
        unsafe { CriticalSection::new() }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    #[inline]
    fn drop(&mut self) {
        // Safety: restores exactly the state captured by `acquire` in `new`.
        unsafe { critical_section::release(self.restore) }
    }
}

/// Lock-free set of pending preempt requests, one bit per [`TaskId`].
///
/// Interrupt handlers call [`request`](Self::request); the scheduler drains
/// the mask with [`take`](Self::take) at the top of each pass and treats each
/// bit as `preempt(task)`. Requests for the same task coalesce.
pub struct PreemptMask(AtomicU32);

impl PreemptMask {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Ask the scheduler to run `task` at the next dispatch point.
    /// Safe to call from any ISR, with or without interrupts masked.
    #[inline]
    pub fn request(&self, task: TaskId) {
        self.0.fetch_or(task.bit(), Ordering::SeqCst);
    }

    /// Atomically read and clear all pending requests.
    #[inline]
    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::SeqCst)
    }

    /// True if any request is pending.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::SeqCst) != 0
    }
}

impl Default for PreemptMask {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use critical_section::Mutex;

    #[test]
    fn test_preempt_mask_coalesces() {
        let mask = PreemptMask::new();
        assert!(!mask.is_pending());
        mask.request(TaskId::MPIPE);
        mask.request(TaskId::MPIPE);
        mask.request(TaskId::OTAT);
        assert!(mask.is_pending());
        assert_eq!(mask.take(), TaskId::MPIPE.bit() | TaskId::OTAT.bit());
        assert_eq!(mask.take(), 0, "take clears the mask");
    }

    #[test]
    fn test_guard_and_closure_nest() {
        let shared = Mutex::new(Cell::new(0u32));
        {
            let guard = IrqGuard::new();
            let cell = shared.borrow(guard.token());
            cell.set(cell.get() + 1);
            critical_section(|cs| {
                let cell = shared.borrow(cs);
                cell.set(cell.get() + 1);
            });
        }
        let value = critical_section(|cs| shared.borrow(cs).get());
        assert_eq!(value, 2);
    }
}
