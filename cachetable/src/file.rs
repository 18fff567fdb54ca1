//! Per-file registry state.
//!
//! A [CacheFile] is the cachetable's handle for one open backing file: a stable
//! file number, a swappable backing descriptor, and (internally) the set of owned
//! entries plus a count of outstanding background jobs that must drain before the
//! file may finish closing.

use crate::{entry::EntryIndex, FileNum};
use futures::channel::oneshot;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Shareable handle for one open backing file.
#[derive(Clone)]
pub struct CacheFile {
    num: FileNum,
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    /// Opaque backing descriptor slot. The page kind routes I/O through this value,
    /// which can be swapped while the file stays open (online file moves).
    backing: AtomicU64,
}

impl CacheFile {
    pub(crate) fn new(num: FileNum, name: impl Into<String>, backing: u64) -> Self {
        Self {
            num,
            shared: Arc::new(Shared {
                name: name.into(),
                backing: AtomicU64::new(backing),
            }),
        }
    }

    /// The stable file number.
    pub fn num(&self) -> FileNum {
        self.num
    }

    /// The file name supplied at open.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The current backing descriptor.
    pub fn backing(&self) -> u64 {
        self.shared.backing.load(Ordering::Acquire)
    }

    /// Swap the backing descriptor, returning the previous one. In-flight I/O
    /// started against the old descriptor completes against it; new fetches and
    /// flushes observe the new value.
    pub fn swap_backing(&self, backing: u64) -> u64 {
        self.shared.backing.swap(backing, Ordering::AcqRel)
    }
}

/// Table-side state for one open file. Guarded by the table lock.
pub(crate) struct FileState {
    pub handle: CacheFile,
    /// Entries owned by this file.
    pub entries: HashSet<EntryIndex>,
    /// Outstanding background jobs (flushes, expensive partial evictions,
    /// non-blocking preparation work).
    pub jobs: usize,
    /// Close waiters parked until `jobs` reaches zero.
    pub drain_waiters: Vec<oneshot::Sender<()>>,
    /// Set once close begins; rejects new pins and new jobs.
    pub closing: bool,
}

impl FileState {
    pub fn new(handle: CacheFile) -> Self {
        Self {
            handle,
            entries: HashSet::new(),
            jobs: 0,
            drain_waiters: Vec::new(),
            closing: false,
        }
    }

    pub fn job_started(&mut self) {
        self.jobs += 1;
    }

    /// Record a job completion; returns the drain waiters to wake when the last
    /// job finishes.
    pub fn job_finished(&mut self) -> Vec<oneshot::Sender<()>> {
        debug_assert!(self.jobs > 0, "job count underflow");
        self.jobs = self.jobs.saturating_sub(1);
        if self.jobs == 0 {
            std::mem::take(&mut self.drain_waiters)
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_backing() {
        let file = CacheFile::new(3, "main.ft", 17);
        assert_eq!(file.num(), 3);
        assert_eq!(file.name(), "main.ft");
        assert_eq!(file.backing(), 17);

        // Clones observe the swap.
        let other = file.clone();
        assert_eq!(file.swap_backing(42), 17);
        assert_eq!(other.backing(), 42);
    }

    #[test]
    fn test_job_drain() {
        let mut state = FileState::new(CacheFile::new(1, "f", 0));
        state.job_started();
        state.job_started();

        let (tx, mut rx) = oneshot::channel();
        state.drain_waiters.push(tx);

        assert!(state.job_finished().is_empty());
        assert!(rx.try_recv().unwrap().is_none());

        let waiters = state.job_finished();
        assert_eq!(waiters.len(), 1);
        for waiter in waiters {
            let _ = waiter.send(());
        }
        assert!(rx.try_recv().unwrap().is_some());
    }
}
