//! Interrupt-safe critical sections
//!
//! Tables that interrupt handlers touch (port table, ready flags, the master
//! registry reached by synchronous IPC) are only mutated inside an
//! `irq_lock` section. The section masks interrupts through hooks installed
//! by the platform and then takes a spin lock, so a handler never waits on a
//! sleeping owner.

use core::ops::{Deref, DerefMut};

/// Platform hooks masking and restoring local interrupts
#[derive(Clone, Copy)]
pub struct IrqOps {
    /// Mask interrupts, returning the previous state key
    pub disable: fn() -> usize,
    /// Restore the state saved by `disable`
    pub restore: fn(usize),
}

fn noop_disable() -> usize {
    0
}

fn noop_restore(_key: usize) {}

const NOOP_OPS: IrqOps = IrqOps {
    disable: noop_disable,
    restore: noop_restore,
};

static OPS: spin::Once<IrqOps> = spin::Once::new();

/// Install the platform interrupt hooks; only the first call takes effect
pub fn set_irq_ops(ops: IrqOps) -> bool {
    let mut installed = false;
    OPS.call_once(|| {
        installed = true;
        ops
    });
    installed
}

fn ops() -> &'static IrqOps {
    OPS.get().unwrap_or(&NOOP_OPS)
}

/// RAII guard of a masked-interrupt section
#[must_use]
pub struct IrqGuard {
    key: usize,
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        (ops().restore)(self.key);
    }
}

/// Mask interrupts until the returned guard is dropped; sections nest
pub fn irq_lock() -> IrqGuard {
    IrqGuard {
        key: (ops().disable)(),
    }
}

// ============================================================================
// IrqMutex
// ============================================================================

/// Spin lock taken with interrupts masked
pub struct IrqMutex<T> {
    inner: spin::Mutex<T>,
}

/// Guard of an [`IrqMutex`]; unlocks before interrupts are restored
pub struct IrqMutexGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> IrqMutex<T> {
    /// Create a new lock
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Mask interrupts and take the lock
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let irq = irq_lock();
        IrqMutexGuard {
            guard: self.inner.lock(),
            _irq: irq,
        }
    }
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static DISABLES: AtomicUsize = AtomicUsize::new(0);
    static RESTORES: AtomicUsize = AtomicUsize::new(0);

    fn counting_disable() -> usize {
        DISABLES.fetch_add(1, Ordering::SeqCst)
    }

    fn counting_restore(_key: usize) {
        RESTORES.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn mutex_masks_interrupts_around_the_lock() {
        set_irq_ops(IrqOps {
            disable: counting_disable,
            restore: counting_restore,
        });
        let m = IrqMutex::new(1u32);
        let before_d = DISABLES.load(Ordering::SeqCst);
        let before_r = RESTORES.load(Ordering::SeqCst);
        {
            let mut g = m.lock();
            *g += 1;
            assert!(DISABLES.load(Ordering::SeqCst) > before_d);
        }
        assert!(RESTORES.load(Ordering::SeqCst) > before_r);
        assert_eq!(*m.lock(), 2);
    }
}
