//! Per-entry lock state machine.
//!
//! Each entry carries one [PageLock]: a reader/writer lock with three access levels
//! and a strict-FIFO queue of blocked waiters. The lock itself is a plain state
//! machine; it is always manipulated under the table lock, and waiters park on
//! oneshot channels outside it.
//!
//! [AccessMode::WriteCheap] is distinguished from [AccessMode::WriteExpensive]
//! because a caller that only mutates metadata should not pay for excluding its own
//! concurrent partial fetch. Once a full fetch is required while holding WriteCheap,
//! the lock is upgraded to WriteExpensive and stays there for the remainder of the
//! pin; downgrading back is deliberately not supported.

use crate::Error;
use futures::channel::oneshot;
use std::collections::VecDeque;

/// Requested access level for a pin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Shared read access.
    Read,
    /// Exclusive write access that still admits the holder's own partial fetch.
    WriteCheap,
    /// Fully exclusive write access.
    WriteExpensive,
}

/// Current holder state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Held {
    Unlocked,
    Shared(usize),
    Cheap,
    Expensive,
}

/// One blocked lock request.
pub(crate) struct Waiter {
    pub mode: AccessMode,
    pub tx: oneshot::Sender<Result<AccessMode, Error>>,
}

/// The per-entry lock.
pub(crate) struct PageLock {
    held: Held,
    waiters: VecDeque<Waiter>,
}

impl PageLock {
    /// A lock with no holder and no waiters.
    pub fn new() -> Self {
        Self {
            held: Held::Unlocked,
            waiters: VecDeque::new(),
        }
    }

    /// A lock born held at `mode` (entries created by `put` or a fetch are pinned by
    /// their creator before any other task can see them).
    pub fn held_at(mode: AccessMode) -> Self {
        let mut lock = Self::new();
        assert!(lock.try_acquire(mode));
        lock
    }

    /// Number of current holders (the entry's pin count).
    pub fn holders(&self) -> usize {
        match self.held {
            Held::Unlocked => 0,
            Held::Shared(n) => n,
            Held::Cheap | Held::Expensive => 1,
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.held == Held::Unlocked
    }

    /// Whether a writer currently holds the lock.
    pub fn write_locked(&self) -> bool {
        matches!(self.held, Held::Cheap | Held::Expensive)
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Whether `mode` could be granted to a new arrival right now. Strict FIFO:
    /// arrivals never overtake queued waiters, even when compatible.
    pub fn available(&self, mode: AccessMode) -> bool {
        if !self.waiters.is_empty() {
            return false;
        }
        self.compatible(mode)
    }

    fn compatible(&self, mode: AccessMode) -> bool {
        match (self.held, mode) {
            (Held::Unlocked, _) => true,
            (Held::Shared(_), AccessMode::Read) => true,
            _ => false,
        }
    }

    /// Grant `mode` to a new arrival if possible.
    pub fn try_acquire(&mut self, mode: AccessMode) -> bool {
        if !self.available(mode) {
            return false;
        }
        self.grant(mode);
        true
    }

    fn grant(&mut self, mode: AccessMode) {
        self.held = match (self.held, mode) {
            (Held::Unlocked, AccessMode::Read) => Held::Shared(1),
            (Held::Unlocked, AccessMode::WriteCheap) => Held::Cheap,
            (Held::Unlocked, AccessMode::WriteExpensive) => Held::Expensive,
            (Held::Shared(n), AccessMode::Read) => Held::Shared(n + 1),
            (held, mode) => unreachable!("grant of {mode:?} while {held:?}"),
        };
    }

    /// Queue a blocked request, returning the channel its grant will arrive on.
    pub fn enqueue(&mut self, mode: AccessMode) -> oneshot::Receiver<Result<AccessMode, Error>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter { mode, tx });
        rx
    }

    /// Release one holder at `mode`.
    ///
    /// The caller is responsible for pumping waiters afterwards (grants may also be
    /// blocked on entry-level busy states the lock knows nothing about).
    pub fn release(&mut self, mode: AccessMode) {
        self.held = match (self.held, mode) {
            (Held::Shared(1), AccessMode::Read) => Held::Unlocked,
            (Held::Shared(n), AccessMode::Read) if n > 1 => Held::Shared(n - 1),
            (Held::Cheap, AccessMode::WriteCheap) => Held::Unlocked,
            (Held::Expensive, AccessMode::WriteExpensive) => Held::Unlocked,
            (held, mode) => {
                debug_assert!(false, "release of {mode:?} while {held:?}");
                held
            }
        };
    }

    /// Upgrade the held WriteCheap lock to WriteExpensive (required before a full
    /// fetch). WriteCheap already excludes every other holder, so the upgrade is
    /// immediate. Never downgraded for the remainder of the pin.
    pub fn upgrade_cheap(&mut self) {
        debug_assert_eq!(self.held, Held::Cheap);
        self.held = Held::Expensive;
    }

    /// Convert a WriteExpensive hold into a single Read hold.
    ///
    /// Only used internally when a Read request had to run a partial fetch under an
    /// exclusive lock; the caller pumps waiters afterwards so queued readers join.
    pub fn expensive_to_read(&mut self) {
        debug_assert_eq!(self.held, Held::Expensive);
        self.held = Held::Shared(1);
    }

    /// Pop the next batch of FIFO-grantable waiters, applying their grants.
    ///
    /// A Read at the head is granted together with any immediately following Reads;
    /// a write grant is always alone. Returns the granted waiters so the caller can
    /// perform pre-wake side effects (e.g. checkpoint clone) and deliver the grants.
    pub fn pump(&mut self) -> Vec<Waiter> {
        let mut granted = Vec::new();
        while let Some(waiter) = self.waiters.front() {
            if !self.compatible(waiter.mode) {
                break;
            }
            let waiter = self.waiters.pop_front().unwrap();
            self.grant(waiter.mode);
            granted.push(waiter);
        }
        granted
    }

    /// Drain all waiters (entry is being destroyed); the caller fails each one.
    pub fn drain_waiters(&mut self) -> Vec<Waiter> {
        self.waiters.drain(..).collect()
    }
}
