//! Mock [PageKind] implementation for tests and examples.
//!
//! [MockKind] is fully scriptable: fetch sizes, fetch failures, a gate that stalls
//! fetches until released, flush failures, partial eviction estimates and results.
//! Every flush is journaled so tests can assert exactly what was written, when, and
//! why.

use crate::{
    kind::{Cost, Estimate, Fetched, FlushReason, SizeInfo},
    Error, FileNum, PageId, PageKind,
};
use futures::channel::oneshot;
use std::{
    collections::{BTreeSet, HashSet},
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

/// The in-memory page used by [MockKind].
#[derive(Debug)]
pub struct MockPage {
    /// Mutable payload; tests mutate it while holding a write pin.
    pub value: Mutex<u64>,
    /// Resident portions, keyed by hint value. A full fetch makes every portion
    /// resident; a partial eviction drops them all.
    pub portions: Mutex<BTreeSet<u64>>,
    /// Whether the whole page is resident (cleared by partial eviction).
    pub complete: AtomicBool,
}

impl MockPage {
    /// A complete page with the given payload.
    pub fn new(value: u64) -> Self {
        Self {
            value: Mutex::new(value),
            portions: Mutex::new(BTreeSet::new()),
            complete: AtomicBool::new(true),
        }
    }

    /// Read the payload.
    pub fn get(&self) -> u64 {
        *self.value.lock().unwrap()
    }

    /// Overwrite the payload (caller must hold a write pin).
    pub fn set(&self, value: u64) {
        *self.value.lock().unwrap() = value;
    }
}

/// One journaled write-back.
#[derive(Clone, Debug)]
pub struct FlushRecord {
    pub file: FileNum,
    pub page: PageId,
    /// Payload at the time of the write.
    pub value: u64,
    pub reason: FlushReason,
    pub keep: bool,
}

/// Scriptable [PageKind]. Clones share all state.
#[derive(Clone, Default)]
pub struct MockKind {
    shared: Arc<Shared>,
}

struct Shared {
    /// Size reported by full fetches.
    fetch_size: Mutex<SizeInfo>,
    /// Whether fetched pages start dirty.
    dirty_on_fetch: AtomicBool,
    /// Whether fetched pages start incomplete (so portions must be partially
    /// fetched on demand).
    incomplete_fetch: AtomicBool,
    /// Keys whose next fetch fails.
    fail_fetches: Mutex<HashSet<(FileNum, PageId)>>,
    /// When set, the next fetch parks here until the gate is released.
    fetch_gate: Mutex<Option<oneshot::Receiver<()>>>,
    /// Remaining flushes to fail.
    fail_flushes: AtomicUsize,
    /// Journal of every write-back.
    flush_log: Mutex<Vec<FlushRecord>>,
    /// Estimate returned for partial evictions.
    estimate: Mutex<Estimate>,
    /// Size reported by partial evictions; `None` leaves the size unchanged.
    partial_result: Mutex<Option<SizeInfo>>,
    /// Bytes each partially fetched portion adds to the page size.
    portion_bytes: AtomicU64,
    /// Size reported by clean visits; `None` reports no work done.
    clean_result: Mutex<Option<SizeInfo>>,
    fetches: AtomicUsize,
    clones: AtomicUsize,
    cleans: AtomicUsize,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            fetch_size: Mutex::new(SizeInfo::of(1)),
            dirty_on_fetch: AtomicBool::new(false),
            incomplete_fetch: AtomicBool::new(false),
            fail_fetches: Mutex::new(HashSet::new()),
            fetch_gate: Mutex::new(None),
            fail_flushes: AtomicUsize::new(0),
            flush_log: Mutex::new(Vec::new()),
            estimate: Mutex::new(Estimate::none()),
            partial_result: Mutex::new(None),
            portion_bytes: AtomicU64::new(0),
            clean_result: Mutex::new(None),
            fetches: AtomicUsize::new(0),
            clones: AtomicUsize::new(0),
            cleans: AtomicUsize::new(0),
        }
    }
}

impl MockKind {
    /// Set the size reported by subsequent full fetches.
    pub fn set_fetch_size(&self, size: SizeInfo) {
        *self.shared.fetch_size.lock().unwrap() = size;
    }

    /// Make fetched pages start dirty.
    pub fn set_dirty_on_fetch(&self, dirty: bool) {
        self.shared.dirty_on_fetch.store(dirty, Ordering::Relaxed);
    }

    /// Make fetched pages start incomplete.
    pub fn set_incomplete_fetch(&self, incomplete: bool) {
        self.shared
            .incomplete_fetch
            .store(incomplete, Ordering::Relaxed);
    }

    /// Fail the next fetch of `(file, page)` with an I/O error.
    pub fn fail_next_fetch(&self, file: FileNum, page: PageId) {
        self.shared
            .fail_fetches
            .lock()
            .unwrap()
            .insert((file, page));
    }

    /// Stall the next fetch until the returned sender fires (or drops).
    pub fn gate_next_fetch(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.shared.fetch_gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Fail the next `n` flushes with an I/O error.
    pub fn fail_flushes(&self, n: usize) {
        self.shared.fail_flushes.store(n, Ordering::Relaxed);
    }

    /// Set the estimate returned for partial evictions.
    pub fn set_estimate(&self, bytes: u64, cost: Cost) {
        *self.shared.estimate.lock().unwrap() = Estimate { bytes, cost };
    }

    /// Set the size a partial eviction reports.
    pub fn set_partial_result(&self, size: SizeInfo) {
        *self.shared.partial_result.lock().unwrap() = Some(size);
    }

    /// Set the bytes each partially fetched portion adds.
    pub fn set_portion_bytes(&self, bytes: u64) {
        self.shared.portion_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Snapshot the flush journal.
    pub fn flushes(&self) -> Vec<FlushRecord> {
        self.shared.flush_log.lock().unwrap().clone()
    }

    /// Number of full fetches performed.
    pub fn fetch_count(&self) -> usize {
        self.shared.fetches.load(Ordering::Relaxed)
    }

    /// Number of checkpoint clones taken.
    pub fn clone_count(&self) -> usize {
        self.shared.clones.load(Ordering::Relaxed)
    }

    /// Set the size clean visits report.
    pub fn set_clean_result(&self, size: SizeInfo) {
        *self.shared.clean_result.lock().unwrap() = Some(size);
    }

    /// Number of clean visits performed.
    pub fn clean_count(&self) -> usize {
        self.shared.cleans.load(Ordering::Relaxed)
    }
}

impl PageKind for MockKind {
    type Page = MockPage;
    type Hint = u64;

    async fn fetch(&self, file: FileNum, page: PageId) -> Result<Fetched<MockPage>, Error> {
        let gate = self.shared.fetch_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.shared.fail_fetches.lock().unwrap().remove(&(file, page)) {
            return Err(Error::Io(io::Error::other("injected fetch failure")));
        }
        self.shared.fetches.fetch_add(1, Ordering::Relaxed);
        let fetched = MockPage::new(page);
        if self.shared.incomplete_fetch.load(Ordering::Relaxed) {
            fetched.complete.store(false, Ordering::Relaxed);
        }
        Ok(Fetched {
            page: fetched,
            size: *self.shared.fetch_size.lock().unwrap(),
            dirty: self.shared.dirty_on_fetch.load(Ordering::Relaxed),
        })
    }

    async fn flush(
        &self,
        file: FileNum,
        page: PageId,
        value: &MockPage,
        _size: SizeInfo,
        reason: FlushReason,
        keep: bool,
    ) -> Result<Option<SizeInfo>, Error> {
        let remaining = self.shared.fail_flushes.load(Ordering::Relaxed);
        if remaining > 0 {
            self.shared
                .fail_flushes
                .store(remaining - 1, Ordering::Relaxed);
            return Err(Error::Io(io::Error::other("injected flush failure")));
        }
        self.shared.flush_log.lock().unwrap().push(FlushRecord {
            file,
            page,
            value: value.get(),
            reason,
            keep,
        });
        Ok(None)
    }

    fn partial_evict_estimate(&self, value: &MockPage) -> Estimate {
        // Nothing left to shed once the page has been reduced to its shell.
        if !value.complete.load(Ordering::Relaxed) && value.portions.lock().unwrap().is_empty() {
            return Estimate::none();
        }
        *self.shared.estimate.lock().unwrap()
    }

    async fn partial_evict(&self, value: &MockPage, size: SizeInfo) -> Result<SizeInfo, Error> {
        value.portions.lock().unwrap().clear();
        value.complete.store(false, Ordering::Relaxed);
        Ok(self
            .shared
            .partial_result
            .lock()
            .unwrap()
            .unwrap_or(size))
    }

    fn partial_fetch_required(&self, value: &MockPage, hint: &u64) -> bool {
        !value.complete.load(Ordering::Relaxed) && !value.portions.lock().unwrap().contains(hint)
    }

    async fn partial_fetch(
        &self,
        _file: FileNum,
        _page: PageId,
        value: &MockPage,
        hint: &u64,
        size: SizeInfo,
    ) -> Result<SizeInfo, Error> {
        value.portions.lock().unwrap().insert(*hint);
        let mut size = size;
        size.total += self.shared.portion_bytes.load(Ordering::Relaxed);
        Ok(size)
    }

    async fn clean(
        &self,
        _file: FileNum,
        _page: PageId,
        _value: &MockPage,
        _size: SizeInfo,
    ) -> Result<Option<SizeInfo>, Error> {
        self.shared.cleans.fetch_add(1, Ordering::Relaxed);
        Ok(*self.shared.clean_result.lock().unwrap())
    }

    fn clone_for_checkpoint(&self, value: &MockPage) -> MockPage {
        self.shared.clones.fetch_add(1, Ordering::Relaxed);
        let clone = MockPage::new(value.get());
        *clone.portions.lock().unwrap() = value.portions.lock().unwrap().clone();
        clone
            .complete
            .store(value.complete.load(Ordering::Relaxed), Ordering::Relaxed);
        clone
    }
}
