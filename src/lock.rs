//! Lock ordering and the power-management lock.
//!
//! Every lock in the crate has a fixed [`LockOrder`]. Locks must be acquired in
//! strictly increasing order; debug builds keep a per-thread record of held
//! locks and assert on any acquisition that would invert the hierarchy. Two
//! VA-space locks can never be held at once since they share an order.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::ops::Deref;

/// Lock hierarchy levels, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockOrder {
    /// Driver-wide suspend/resume exclusion.
    GlobalPm = 1,
    /// The CPU memory-map (VMA list) lock.
    MmapLock = 2,
    /// Per-VA-space range tree and policy lock.
    VaSpace = 3,
    /// Per-GPU mapping tree of an external range.
    ExtRangeTree = 4,
    SemaphorePoolTracker = 5,
    /// Per-block residency and mapping state.
    VaBlock = 6,
    PerfEvents = 7,
    /// Channel progress state. Always a leaf.
    Channel = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD_LOCKS: std::cell::RefCell<Vec<(LockOrder, LockMode)>> =
        const { std::cell::RefCell::new(Vec::new()) };
}

pub struct LockTracker;

impl LockTracker {
    /// Check whether acquiring `order` now keeps the hierarchy intact.
    #[cfg(debug_assertions)]
    #[must_use]
    pub fn check_acquire(order: LockOrder) -> bool {
        HELD_LOCKS.with(|held| {
            held.borrow()
                .iter()
                .map(|&(o, _)| o)
                .max()
                .is_none_or(|highest| order > highest)
        })
    }

    #[cfg(debug_assertions)]
    pub fn record_acquire(order: LockOrder, mode: LockMode) {
        assert!(
            Self::check_acquire(order),
            "lock order violation: acquiring {order:?} while holding {:?}",
            Self::held()
        );
        HELD_LOCKS.with(|held| held.borrow_mut().push((order, mode)));
    }

    #[cfg(debug_assertions)]
    pub fn record_release(order: LockOrder) {
        HELD_LOCKS.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&(o, _)| o == order) {
                held.remove(pos);
            }
        });
    }

    #[cfg(debug_assertions)]
    fn record_downgrade(order: LockOrder) {
        HELD_LOCKS.with(|held| {
            if let Some(entry) = held.borrow_mut().iter_mut().rev().find(|(o, _)| *o == order) {
                entry.1 = LockMode::Shared;
            }
        });
    }

    /// Locks held by the calling thread, in acquisition order.
    #[cfg(debug_assertions)]
    #[must_use]
    pub fn held() -> Vec<(LockOrder, LockMode)> {
        HELD_LOCKS.with(|held| held.borrow().clone())
    }

    #[cfg(debug_assertions)]
    #[must_use]
    pub fn is_held(order: LockOrder) -> bool {
        HELD_LOCKS.with(|held| held.borrow().iter().any(|&(o, _)| o == order))
    }

    #[cfg(debug_assertions)]
    #[must_use]
    pub fn is_held_exclusive(order: LockOrder) -> bool {
        HELD_LOCKS.with(|held| {
            held.borrow()
                .iter()
                .any(|&(o, m)| o == order && m == LockMode::Exclusive)
        })
    }

    // No-op versions for release builds
    #[cfg(not(debug_assertions))]
    #[must_use]
    pub fn check_acquire(_order: LockOrder) -> bool {
        true
    }

    #[cfg(not(debug_assertions))]
    pub fn record_acquire(_order: LockOrder, _mode: LockMode) {}

    #[cfg(not(debug_assertions))]
    pub fn record_release(_order: LockOrder) {}

    #[cfg(not(debug_assertions))]
    fn record_downgrade(_order: LockOrder) {}

    #[cfg(not(debug_assertions))]
    #[must_use]
    pub fn held() -> Vec<(LockOrder, LockMode)> {
        Vec::new()
    }

    #[cfg(not(debug_assertions))]
    #[must_use]
    pub fn is_held(_order: LockOrder) -> bool {
        true
    }

    #[cfg(not(debug_assertions))]
    #[must_use]
    pub fn is_held_exclusive(_order: LockOrder) -> bool {
        true
    }
}

/// Records one held lock for as long as it lives.
///
/// Guards keep this as their last field so the underlying lock is released
/// before the record is dropped.
#[derive(Debug)]
pub struct OrderToken {
    order: LockOrder,
}

impl OrderToken {
    #[must_use]
    pub fn acquire(order: LockOrder, mode: LockMode) -> Self {
        LockTracker::record_acquire(order, mode);
        Self { order }
    }

    /// Exclusive to shared, keeping the same position in the hierarchy.
    pub fn downgrade(&self) {
        LockTracker::record_downgrade(self.order);
    }

    #[must_use]
    pub const fn order(&self) -> LockOrder {
        self.order
    }
}

impl Drop for OrderToken {
    fn drop(&mut self) {
        LockTracker::record_release(self.order);
    }
}

/// Guard pairing a lock guard with its ordering record.
pub struct Ordered<G> {
    guard: G,
    _token: OrderToken,
}

impl<G> Ordered<G> {
    pub fn new(guard: G, token: OrderToken) -> Self {
        Self {
            guard,
            _token: token,
        }
    }

    pub fn into_parts(self) -> (G, OrderToken) {
        (self.guard, self._token)
    }
}

impl<G: Deref> Deref for Ordered<G> {
    type Target = G::Target;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<G: std::ops::DerefMut> std::ops::DerefMut for Ordered<G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

// ===============================================================================================
// Power management lock
// ===============================================================================================

/// Driver-wide suspend/resume lock.
///
/// Every externally triggered entry point holds it for read. A suspend holds it
/// for write, which makes entry points fail with `Busy` instead of blocking.
#[derive(Debug, Default)]
pub struct PmLock {
    lock: RwLock<()>,
}

pub type PmReadGuard<'a> = Ordered<RwLockReadGuard<'a, ()>>;
pub type PmWriteGuard<'a> = Ordered<RwLockWriteGuard<'a, ()>>;

impl PmLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lock: RwLock::new(()),
        }
    }

    /// Non-blocking entry for ioctl and fault paths.
    #[must_use]
    pub fn try_read(&self) -> Option<PmReadGuard<'_>> {
        let guard = self.lock.try_read()?;
        Some(Ordered::new(
            guard,
            OrderToken::acquire(LockOrder::GlobalPm, LockMode::Shared),
        ))
    }

    /// Blocking entry for internal work that must eventually run.
    pub fn read(&self) -> PmReadGuard<'_> {
        let token = OrderToken::acquire(LockOrder::GlobalPm, LockMode::Shared);
        Ordered::new(self.lock.read(), token)
    }

    /// Waits for every entry point to leave, then excludes new ones.
    pub fn suspend(&self) -> PmWriteGuard<'_> {
        let token = OrderToken::acquire(LockOrder::GlobalPm, LockMode::Exclusive);
        Ordered::new(self.lock.write(), token)
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.lock.is_locked_exclusive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ordered_acquire_and_release() {
        let a = OrderToken::acquire(LockOrder::VaSpace, LockMode::Exclusive);
        assert!(LockTracker::check_acquire(LockOrder::VaBlock));
        assert!(!LockTracker::check_acquire(LockOrder::MmapLock));

        let b = OrderToken::acquire(LockOrder::VaBlock, LockMode::Exclusive);
        drop(b);
        a.downgrade();
        assert!(LockTracker::is_held(LockOrder::VaSpace));
        drop(a);
        assert!(!LockTracker::is_held(LockOrder::VaSpace));
        assert!(LockTracker::check_acquire(LockOrder::GlobalPm));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_block_before_va_space_panics() {
        let _block = OrderToken::acquire(LockOrder::VaBlock, LockMode::Exclusive);
        let _space = OrderToken::acquire(LockOrder::VaSpace, LockMode::Shared);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_two_va_spaces_panics() {
        let _first = OrderToken::acquire(LockOrder::VaSpace, LockMode::Shared);
        let _second = OrderToken::acquire(LockOrder::VaSpace, LockMode::Shared);
    }

    #[test]
    fn test_pm_trylock_fails_while_suspended() {
        let pm = Arc::new(PmLock::new());
        let suspended = pm.suspend();
        assert!(pm.is_suspended());

        let other = Arc::clone(&pm);
        let entered = thread::spawn(move || other.try_read().is_some())
            .join()
            .unwrap();
        assert!(!entered);

        drop(suspended);
        assert!(pm.try_read().is_some());
    }
}
