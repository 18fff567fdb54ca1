//! The entry table and pin lifecycle.
//!
//! All table state lives in one [State] behind an async [RwLock]. The lock is held
//! only for short, non-blocking transitions; every fetch, flush, partial fetch, and
//! partial eviction runs with the lock released and the entry parked in an in-flight
//! state (`Fetching`, `flushing`, `partial_evicting`) that excludes conflicting work.
//! Tasks that must wait park on oneshot channels and are woken by whichever task
//! completes the transition they were blocked on.

use crate::{
    entry::{Arena, Entry, EntryIndex, EntryState, Frozen, Resident, Ring},
    file::{CacheFile, FileState},
    kind::{Fetched, FlushReason, SizeInfo},
    lock::{AccessMode, PageLock},
    metrics::Metrics,
    Config, Error, FileNum, PageKey, PageKind,
};
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, RwLock, Spawner};
use futures::channel::{mpsc, oneshot};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    future::Future,
    sync::{Arc, Mutex},
};
use tracing::{debug, warn};

/// A held pin on one cached page.
///
/// The guard is deliberately inert: it is released only by passing it back to
/// [Cachetable::unpin] or [Cachetable::unpin_and_remove], so a leaked guard is a
/// leaked pin and over-release is impossible by construction.
pub struct Pinned<P: PageKind> {
    pub(crate) index: EntryIndex,
    key: PageKey,
    mode: AccessMode,
    value: Arc<P::Page>,
    size: SizeInfo,
}

impl<P: PageKind> Pinned<P> {
    /// The pinned page's identity.
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// The access level actually held. May be stronger than requested: a WriteCheap
    /// pin that required a partial fetch is upgraded to WriteExpensive for the
    /// remainder of the pin.
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// The pinned value.
    pub fn value(&self) -> &P::Page {
        &self.value
    }

    /// A shared handle to the pinned value.
    pub fn share(&self) -> Arc<P::Page> {
        self.value.clone()
    }

    /// The size descriptor observed at pin time.
    pub fn size(&self) -> SizeInfo {
        self.size
    }
}

// Manual impl: the pinned value need not be Debug.
impl<P: PageKind> fmt::Debug for Pinned<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pinned")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Outcome of [Cachetable::get_and_pin_nonblocking].
pub enum TryPin<P: PageKind> {
    /// The pin was granted without blocking; the caller keeps its [Unlockers].
    Pinned(Pinned<P>),
    /// The pin would have blocked. The caller's [Unlockers] were drained and
    /// released, and any preparation work (fetch, partial fetch, checkpoint clone)
    /// was queued in the background; retry from scratch.
    Retry,
}

/// Pins a caller already holds, lent to the non-blocking path.
///
/// When [Cachetable::get_and_pin_nonblocking] cannot grant immediately, it releases
/// every pin in here (clean, sizes unchanged) before returning [TryPin::Retry], so a
/// caller assembling a multi-page pin set never sleeps while holding pins. On an
/// immediate grant the set is untouched and the caller still owns every pin in it.
#[derive(Default)]
pub struct Unlockers<P: PageKind> {
    pins: Vec<Pinned<P>>,
}

impl<P: PageKind> Unlockers<P> {
    pub fn new() -> Self {
        Self { pins: Vec::new() }
    }

    pub fn with(pins: Vec<Pinned<P>>) -> Self {
        Self { pins }
    }

    pub fn push(&mut self, pin: Pinned<P>) {
        self.pins.push(pin);
    }

    /// Reclaim the most recently pushed pin, if the set was not drained.
    pub fn pop(&mut self) -> Option<Pinned<P>> {
        self.pins.pop()
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

/// Point-in-time view of the table, for status endpoints and tests.
#[derive(Clone, Debug)]
pub struct Status {
    pub entries: usize,
    pub files: usize,
    pub totals: SizeInfo,
    pub low_watermark: u64,
    pub high_watermark: u64,
    pub eviction_runs: u64,
    pub checkpoint_pending: usize,
    pub flush_error: Option<String>,
}

/// In-flight checkpoint bookkeeping.
pub(crate) struct Checkpoint {
    /// Entries whose pre-checkpoint image has not yet reached storage.
    pub pending: HashSet<EntryIndex>,
    /// Tasks (the checkpointer) parked until some pending entry makes progress.
    pub waiters: Vec<oneshot::Sender<()>>,
}

/// All mutable table state, guarded by one async lock.
pub(crate) struct State<P: PageKind> {
    pub arena: Arena<P>,
    pub index: HashMap<PageKey, EntryIndex>,
    pub files: HashMap<FileNum, FileState>,
    pub ring: Ring,
    pub totals: SizeInfo,
    pub low: u64,
    pub high: u64,
    pub eviction_runs: u64,
    pub checkpoint: Option<Checkpoint>,
    /// Most recent write-back failure, surfaced through [Status].
    pub flush_error: Option<String>,
}

impl<P: PageKind> State<P> {
    fn new(cfg: &Config) -> Self {
        Self {
            arena: Arena::new(),
            index: HashMap::new(),
            files: HashMap::new(),
            ring: Ring::new(),
            totals: SizeInfo::default(),
            low: cfg.low_watermark,
            high: cfg.high_watermark,
            eviction_runs: 0,
            checkpoint: None,
            flush_error: None,
        }
    }

    pub fn over_high(&self) -> bool {
        self.totals.total > self.high
    }

    /// Grant queued lock waiters that are now admissible, retrying past dead
    /// receivers.
    pub fn pump(&mut self, index: EntryIndex) {
        loop {
            let Some(entry) = self.arena.get_mut(index) else {
                return;
            };
            if entry.busy() {
                return;
            }
            let granted = entry.lock.pump();
            if granted.is_empty() {
                return;
            }
            let mut redo = false;
            for waiter in granted {
                let mode = waiter.mode;
                if waiter.tx.send(Ok(mode)).is_err() {
                    // The waiter gave up; take its grant back.
                    entry.lock.release(mode);
                    redo = true;
                }
            }
            if !redo {
                return;
            }
        }
    }

    /// Record that `index` no longer owes the checkpoint anything.
    pub fn checkpoint_resolved(&mut self, index: EntryIndex) {
        if let Some(cp) = self.checkpoint.as_mut() {
            if cp.pending.remove(&index) {
                for waiter in cp.waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
        }
    }

    /// Wake the checkpointer so it re-examines its pending set.
    pub fn wake_checkpoint_waiters(&mut self) {
        if let Some(cp) = self.checkpoint.as_mut() {
            for waiter in cp.waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    /// Replace an entry's resident size, keeping the totals in sync.
    pub fn apply_size(&mut self, index: EntryIndex, new: SizeInfo) {
        let old = {
            let Some(entry) = self.arena.get_mut(index) else {
                return;
            };
            let Some(resident) = entry.resident_mut() else {
                return;
            };
            let old = resident.size;
            resident.size = new;
            old
        };
        self.totals.release(&old);
        self.totals.accumulate(&new);
    }

    /// Take the pre-checkpoint snapshot if this write grant would be the first
    /// mutation of a checkpoint-pending entry.
    pub fn maybe_freeze(&mut self, index: EntryIndex, metrics: &Metrics) {
        let size = {
            let Some(entry) = self.arena.get_mut(index) else {
                return;
            };
            let kind = entry.kind.clone();
            let Some(resident) = entry.resident_mut() else {
                return;
            };
            if !resident.checkpoint_pending || !resident.dirty || resident.frozen.is_some() {
                return;
            }
            let snapshot = kind.clone_for_checkpoint(&resident.value);
            let size = resident.size;
            resident.frozen = Some(Frozen {
                value: Arc::new(snapshot),
                size,
            });
            size
        };
        self.totals.accumulate(&size);
        metrics.checkpoint_clones.inc();
    }

    /// Remove an entry from every structure it participates in. Queued lock waiters
    /// are failed with `NotFound`, which the blocking pin path treats as a retry.
    pub fn remove_entry(&mut self, index: EntryIndex) -> Option<Entry<P>> {
        let mut entry = self.arena.remove(index)?;
        self.index.remove(&entry.key);
        if let Some(file) = self.files.get_mut(&entry.key.file) {
            file.entries.remove(&index);
        }
        if let Some(pos) = entry.ring_pos.take() {
            if let Some(moved) = self.ring.swap_remove(pos) {
                if let Some(moved_entry) = self.arena.get_mut(moved) {
                    moved_entry.ring_pos = Some(pos);
                }
            }
        }
        if let Some(resident) = entry.resident() {
            self.totals.release(&resident.size);
            if let Some(frozen) = &resident.frozen {
                self.totals.release(&frozen.size);
            }
        }
        self.checkpoint_resolved(index);
        for waiter in entry.lock.drain_waiters() {
            let _ = waiter
                .tx
                .send(Err(Error::NotFound(entry.key.file, entry.key.page)));
        }
        Some(entry)
    }
}

pub(crate) struct Inner<P: PageKind> {
    pub state: RwLock<State<P>>,
    /// Wakes the background evictor; sends fail harmlessly when it is disabled.
    pub evictor: mpsc::UnboundedSender<()>,
    /// Background task handles, aborted at close.
    pub tasks: Mutex<Vec<Handle<()>>>,
    pub metrics: Metrics,
}

/// The page cache.
///
/// Cheaply cloneable; clones share the same table.
pub struct Cachetable<E: Spawner + Clock + RuntimeMetrics, P: PageKind> {
    pub(crate) context: E,
    pub(crate) cfg: Config,
    pub(crate) inner: Arc<Inner<P>>,
}

impl<E: Spawner + Clock + RuntimeMetrics, P: PageKind> Clone for Cachetable<E, P> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            cfg: self.cfg.clone(),
            inner: self.inner.clone(),
        }
    }
}

/// Background work queued by the non-blocking path so a pure-non-blocking caller
/// eventually succeeds.
enum PrepJob<P: PageKind> {
    /// Complete the fetch of a just-created entry.
    Fetch(EntryIndex),
    /// Pin and immediately unpin, to drive a partial fetch or checkpoint clone.
    Warm {
        mode: AccessMode,
        hint: Option<P::Hint>,
    },
}

/// One step of the blocking pin loop, decided under the table lock.
enum Plan {
    Granted(AccessMode),
    WaitLock(oneshot::Receiver<Result<AccessMode, Error>>),
    WaitFetch(oneshot::Receiver<Result<(), Arc<Error>>>),
    Fetch(EntryIndex),
}

impl<E: Spawner + Clock + RuntimeMetrics, P: PageKind> Cachetable<E, P> {
    /// Create a cachetable and start its background tasks.
    pub fn init(context: E, cfg: Config) -> Result<Self, Error> {
        cfg.validate()?;
        let metrics = Metrics::init(context.clone());
        let (tx, rx) = mpsc::unbounded();
        let inner = Arc::new(Inner {
            state: RwLock::new(State::new(&cfg)),
            evictor: tx,
            tasks: Mutex::new(Vec::new()),
            metrics,
        });
        let table = Self {
            context,
            cfg,
            inner,
        };
        let mut tasks = Vec::new();
        if table.cfg.background_evictor {
            let worker = table.clone();
            tasks.push(
                table
                    .context
                    .with_label("evictor")
                    .spawn(move |_| crate::evictor::run_evictor(worker, rx)),
            );
        }
        if let Some(interval) = table.cfg.cleaner_interval {
            let worker = table.clone();
            tasks.push(
                table
                    .context
                    .with_label("cleaner")
                    .spawn(move |_| crate::evictor::run_cleaner(worker, interval)),
            );
        }
        *table.inner.tasks.lock().unwrap() = tasks;
        Ok(table)
    }

    /// Register a backing file.
    pub async fn open_file(
        &self,
        num: FileNum,
        name: impl Into<String>,
        backing: u64,
    ) -> Result<CacheFile, Error> {
        let mut state = self.inner.state.write().await;
        if state.files.contains_key(&num) {
            return Err(Error::FileExists(num));
        }
        let handle = CacheFile::new(num, name, backing);
        state.files.insert(num, FileState::new(handle.clone()));
        self.inner.metrics.files.set(state.files.len() as i64);
        debug!(file = num, "file opened");
        Ok(handle)
    }

    /// Look up an open file's handle.
    pub async fn file(&self, num: FileNum) -> Option<CacheFile> {
        let state = self.inner.state.read().await;
        state.files.get(&num).map(|f| f.handle.clone())
    }

    /// Run a caller-supplied job on a background task counted against `num`'s job
    /// pool, so [Cachetable::close_file] waits for it to complete before tearing the
    /// file down.
    pub async fn spawn_job<F, Fut, T>(&self, num: FileNum, job: F) -> Result<Handle<T>, Error>
    where
        F: FnOnce(E) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        {
            let mut state = self.inner.state.write().await;
            match state.files.get_mut(&num) {
                None => return Err(Error::UnknownFile(num)),
                Some(file) if file.closing => return Err(Error::FileClosing(num)),
                Some(file) => file.job_started(),
            }
        }
        let table = self.clone();
        Ok(self.context.with_label("job").spawn(move |context| async move {
            let out = job(context).await;
            table.finish_job(num).await;
            out
        }))
    }

    /// Pin a page, fetching it on miss and blocking until the requested access mode
    /// is grantable. `hint` lets the page kind demand a partial fetch when the
    /// resident portion is insufficient.
    pub async fn get_and_pin(
        &self,
        kind: &P,
        key: PageKey,
        mode: AccessMode,
        hint: Option<&P::Hint>,
    ) -> Result<Pinned<P>, Error> {
        let mut fetched = false;
        loop {
            let (plan, index) = {
                let mut state = self.inner.state.write().await;
                match state.index.get(&key).copied() {
                    Some(index) => {
                        let Some(entry) = state.arena.get_mut(index) else {
                            // Stale mapping; drop it and retry.
                            state.index.remove(&key);
                            continue;
                        };
                        match &mut entry.state {
                            EntryState::Fetching { waiters } => {
                                let (tx, rx) = oneshot::channel();
                                waiters.push(tx);
                                (Plan::WaitFetch(rx), index)
                            }
                            EntryState::Resident(resident) => {
                                let need = match hint {
                                    Some(h) => {
                                        entry.kind.partial_fetch_required(&resident.value, h)
                                    }
                                    None => false,
                                };
                                // A partial fetch runs under the exclusive lock even
                                // when the caller only asked for Read.
                                let eff = if need { AccessMode::WriteExpensive } else { mode };
                                let busy = resident.flushing || resident.partial_evicting;
                                if !busy && entry.lock.try_acquire(eff) {
                                    (Plan::Granted(eff), index)
                                } else {
                                    (Plan::WaitLock(entry.lock.enqueue(eff)), index)
                                }
                            }
                        }
                    }
                    None => {
                        match state.files.get(&key.file) {
                            None => return Err(Error::UnknownFile(key.file)),
                            Some(file) if file.closing => {
                                return Err(Error::FileClosing(key.file))
                            }
                            Some(_) => {}
                        }
                        let index = state.arena.insert(Entry::fetching(key, kind.clone()));
                        state.index.insert(key, index);
                        if let Some(file) = state.files.get_mut(&key.file) {
                            file.entries.insert(index);
                        }
                        self.inner.metrics.entries.set(state.arena.len() as i64);
                        (Plan::Fetch(index), index)
                    }
                }
            };
            let held = match plan {
                Plan::Fetch(index) => {
                    self.complete_fetch(kind, key, index).await?;
                    fetched = true;
                    continue;
                }
                Plan::WaitFetch(rx) => match rx.await {
                    Ok(Ok(())) => {
                        fetched = true;
                        continue;
                    }
                    Ok(Err(err)) => return Err(Error::FetchFailed(err)),
                    Err(_) => continue,
                },
                Plan::Granted(held) => held,
                Plan::WaitLock(rx) => match rx.await {
                    Ok(Ok(held)) => held,
                    // The entry was destroyed while we waited (evicted or removed);
                    // start over with a fresh fetch.
                    Ok(Err(Error::NotFound(..))) | Err(_) => continue,
                    Ok(Err(err)) => return Err(err),
                },
            };
            match self.finalize_pin(key, index, mode, held, hint).await? {
                Some(pin) => {
                    if !fetched {
                        self.inner.metrics.hits.inc();
                    }
                    return Ok(pin);
                }
                None => continue,
            }
        }
    }

    /// Pin a page only if that requires neither blocking nor I/O.
    ///
    /// Never fetches, never queues, and takes no side effects beyond the grant
    /// itself; in particular it refuses (returns `Ok(None)`) when a write grant
    /// would first have to clone the value for the in-flight checkpoint.
    pub async fn maybe_get_and_pin(
        &self,
        key: PageKey,
        mode: AccessMode,
    ) -> Result<Option<Pinned<P>>, Error> {
        let mut state = self.inner.state.write().await;
        let Some(&index) = state.index.get(&key) else {
            return Ok(None);
        };
        let Some(entry) = state.arena.get_mut(index) else {
            return Ok(None);
        };
        if entry.busy() {
            return Ok(None);
        }
        let Some(resident) = entry.resident() else {
            return Ok(None);
        };
        let write = matches!(mode, AccessMode::WriteCheap | AccessMode::WriteExpensive);
        if write && resident.checkpoint_pending && resident.dirty && resident.frozen.is_none() {
            return Ok(None);
        }
        if !entry.lock.try_acquire(mode) {
            return Ok(None);
        }
        entry.touch();
        let resident = entry
            .resident()
            .ok_or(Error::ContractViolation("granted pin on non-resident entry"))?;
        let pin = Pinned {
            index,
            key,
            mode,
            value: resident.value.clone(),
            size: resident.size,
        };
        self.inner.metrics.hits.inc();
        Ok(Some(pin))
    }

    /// Pin a page without ever blocking.
    ///
    /// On an immediate grant the caller's `unlockers` are untouched and the caller
    /// keeps every pin it surrendered. On any other outcome the `unlockers` are
    /// drained (released clean) first and [TryPin::Retry] is returned; whatever the
    /// grant was blocked on (fetch, partial fetch, checkpoint clone) is queued as
    /// background work so a retry loop makes progress.
    pub async fn get_and_pin_nonblocking(
        &self,
        kind: &P,
        key: PageKey,
        mode: AccessMode,
        hint: Option<&P::Hint>,
        unlockers: &mut Unlockers<P>,
    ) -> Result<TryPin<P>, Error> {
        enum Decision {
            Grant,
            Wait,
            NeedPartial,
            NeedClone,
        }
        enum Outcome<P: PageKind> {
            Pin(Pinned<P>),
            Retry(Option<PrepJob<P>>),
            Fail(Error),
        }
        let outcome = {
            let mut state = self.inner.state.write().await;
            match state.index.get(&key).copied() {
                None => match state.files.get(&key.file) {
                    None => Outcome::Fail(Error::UnknownFile(key.file)),
                    Some(file) if file.closing => Outcome::Fail(Error::FileClosing(key.file)),
                    Some(_) => {
                        let index = state.arena.insert(Entry::fetching(key, kind.clone()));
                        state.index.insert(key, index);
                        if let Some(file) = state.files.get_mut(&key.file) {
                            file.entries.insert(index);
                            file.job_started();
                        }
                        self.inner.metrics.entries.set(state.arena.len() as i64);
                        Outcome::Retry(Some(PrepJob::Fetch(index)))
                    }
                },
                Some(index) => {
                    let decision = {
                        match state.arena.get(index) {
                            None => Decision::Wait,
                            Some(entry) => match entry.resident() {
                                None => Decision::Wait,
                                Some(resident) => {
                                    let need = match hint {
                                        Some(h) => entry
                                            .kind
                                            .partial_fetch_required(&resident.value, h),
                                        None => false,
                                    };
                                    let write = matches!(
                                        mode,
                                        AccessMode::WriteCheap | AccessMode::WriteExpensive
                                    );
                                    if need {
                                        if entry.prep_queued {
                                            Decision::Wait
                                        } else {
                                            Decision::NeedPartial
                                        }
                                    } else if resident.flushing || resident.partial_evicting {
                                        Decision::Wait
                                    } else if write
                                        && resident.checkpoint_pending
                                        && resident.dirty
                                        && resident.frozen.is_none()
                                    {
                                        if entry.prep_queued {
                                            Decision::Wait
                                        } else {
                                            Decision::NeedClone
                                        }
                                    } else if entry.lock.available(mode) {
                                        Decision::Grant
                                    } else {
                                        Decision::Wait
                                    }
                                }
                            },
                        }
                    };
                    match decision {
                        Decision::Grant => {
                            let Some(entry) = state.arena.get_mut(index) else {
                                return Err(Error::ContractViolation(
                                    "entry vanished under the table lock",
                                ));
                            };
                            assert!(entry.lock.try_acquire(mode));
                            entry.touch();
                            let resident = entry.resident().ok_or(Error::ContractViolation(
                                "granted pin on non-resident entry",
                            ))?;
                            Outcome::Pin(Pinned {
                                index,
                                key,
                                mode,
                                value: resident.value.clone(),
                                size: resident.size,
                            })
                        }
                        Decision::Wait => Outcome::Retry(None),
                        Decision::NeedPartial | Decision::NeedClone => {
                            let job = match decision {
                                Decision::NeedPartial => PrepJob::Warm {
                                    mode: AccessMode::Read,
                                    hint: hint.cloned(),
                                },
                                _ => PrepJob::Warm {
                                    mode: AccessMode::WriteCheap,
                                    hint: None,
                                },
                            };
                            let queued = match state.files.get_mut(&key.file) {
                                Some(file) if !file.closing => {
                                    file.job_started();
                                    true
                                }
                                _ => false,
                            };
                            if queued {
                                if let Some(entry) = state.arena.get_mut(index) {
                                    entry.prep_queued = true;
                                }
                                Outcome::Retry(Some(job))
                            } else {
                                Outcome::Retry(None)
                            }
                        }
                    }
                }
            }
        };
        match outcome {
            Outcome::Pin(pin) => {
                self.inner.metrics.hits.inc();
                Ok(TryPin::Pinned(pin))
            }
            Outcome::Fail(err) => {
                self.release_unlockers(unlockers).await;
                Err(err)
            }
            Outcome::Retry(job) => {
                self.release_unlockers(unlockers).await;
                if let Some(job) = job {
                    self.spawn_prep(kind.clone(), key, job);
                }
                self.inner.metrics.retries.inc();
                Ok(TryPin::Retry)
            }
        }
    }

    /// Insert a freshly created page, pinned WriteExpensive and dirty.
    pub async fn put(
        &self,
        kind: &P,
        key: PageKey,
        page: P::Page,
        size: SizeInfo,
    ) -> Result<Pinned<P>, Error> {
        let (pin, over) = {
            let mut state = self.inner.state.write().await;
            match state.files.get(&key.file) {
                None => return Err(Error::UnknownFile(key.file)),
                Some(file) if file.closing => return Err(Error::FileClosing(key.file)),
                Some(_) => {}
            }
            if state.index.contains_key(&key) {
                return Err(Error::AlreadyCached(key.file, key.page));
            }
            let value = Arc::new(page);
            let entry = Entry {
                key,
                kind: kind.clone(),
                lock: PageLock::held_at(AccessMode::WriteExpensive),
                state: EntryState::Resident(Resident {
                    value: value.clone(),
                    size,
                    dirty: true,
                    checkpoint_pending: false,
                    frozen: None,
                    flushing: false,
                    partial_evicting: false,
                }),
                referenced: true,
                tried_partial: false,
                prep_queued: false,
                ring_pos: None,
            };
            let index = state.arena.insert(entry);
            state.index.insert(key, index);
            if let Some(file) = state.files.get_mut(&key.file) {
                file.entries.insert(index);
            }
            let pos = state.ring.push(index);
            if let Some(entry) = state.arena.get_mut(index) {
                entry.ring_pos = Some(pos);
            }
            state.totals.accumulate(&size);
            self.inner.metrics.entries.set(state.arena.len() as i64);
            self.inner.metrics.record_sizes(&state.totals);
            (
                Pinned {
                    index,
                    key,
                    mode: AccessMode::WriteExpensive,
                    value,
                    size,
                },
                state.over_high(),
            )
        };
        if over {
            self.pressure().await;
        }
        Ok(pin)
    }

    /// Release a pin. `dirty` marks the entry dirty; `new_size` replaces its size
    /// descriptor (writers that grew or shrank the value report it here).
    pub async fn unpin(
        &self,
        pin: Pinned<P>,
        dirty: bool,
        new_size: Option<SizeInfo>,
    ) -> Result<(), Error> {
        let over = {
            let mut state = self.inner.state.write().await;
            let pending_unlocked = {
                let entry = state
                    .arena
                    .get_mut(pin.index)
                    .ok_or(Error::ContractViolation("unpin of a removed entry"))?;
                {
                    let resident = entry
                        .resident_mut()
                        .ok_or(Error::ContractViolation("unpin of a non-resident entry"))?;
                    if dirty {
                        resident.dirty = true;
                    }
                }
                entry.touch();
                entry.lock.release(pin.mode);
                entry
                    .resident()
                    .map(|r| r.checkpoint_pending)
                    .unwrap_or(false)
                    && !entry.lock.write_locked()
            };
            if let Some(new) = new_size {
                state.apply_size(pin.index, new);
            }
            state.pump(pin.index);
            if pending_unlocked {
                // A pre-checkpoint writer released its pin; the checkpointer may
                // now flush the live value.
                state.wake_checkpoint_waiters();
            }
            self.inner.metrics.record_sizes(&state.totals);
            state.over_high()
        };
        if over {
            self.pressure().await;
        }
        Ok(())
    }

    /// Release a write pin and destroy the entry without writing it back.
    ///
    /// If the entry still owed the in-flight checkpoint its image, that debt is
    /// forgiven: a destroyed page has no post-recovery state to snapshot. A Read
    /// pin cannot remove; the guard is consumed (the pin is released) but the
    /// entry is retained and the call fails.
    pub async fn unpin_and_remove(&self, pin: Pinned<P>) -> Result<(), Error> {
        let mut state = self.inner.state.write().await;
        {
            let entry = state
                .arena
                .get_mut(pin.index)
                .ok_or(Error::ContractViolation("unpin of a removed entry"))?;
            entry.lock.release(pin.mode);
        }
        if pin.mode == AccessMode::Read {
            state.pump(pin.index);
            return Err(Error::ContractViolation("remove requires a write pin"));
        }
        state.remove_entry(pin.index);
        self.inner.metrics.entries.set(state.arena.len() as i64);
        self.inner.metrics.record_sizes(&state.totals);
        Ok(())
    }

    /// Mark every dirty entry checkpoint-pending. Returns the pending count.
    pub async fn begin_checkpoint(&self) -> Result<usize, Error> {
        let mut state = self.inner.state.write().await;
        if state.checkpoint.is_some() {
            return Err(Error::CheckpointInProgress);
        }
        let pending: HashSet<EntryIndex> = state
            .arena
            .iter()
            .filter(|(_, entry)| entry.resident().map(|r| r.dirty).unwrap_or(false))
            .map(|(index, _)| index)
            .collect();
        for &index in &pending {
            if let Some(entry) = state.arena.get_mut(index) {
                if let Some(resident) = entry.resident_mut() {
                    resident.checkpoint_pending = true;
                }
            }
        }
        let count = pending.len();
        state.checkpoint = Some(Checkpoint {
            pending,
            waiters: Vec::new(),
        });
        debug!(entries = count, "checkpoint began");
        Ok(count)
    }

    /// Write every pending entry's pre-checkpoint image and finish the checkpoint.
    ///
    /// Entries whose writers cloned a frozen snapshot have that snapshot written
    /// (and dropped) while the live value stays dirty; untouched entries have their
    /// live value written in place and become clean. The first write-back failure
    /// is surfaced after the remaining entries are processed.
    pub async fn end_checkpoint(&self) -> Result<(), Error> {
        enum Step<P: PageKind> {
            Done,
            Wait(oneshot::Receiver<()>),
            Flush {
                index: EntryIndex,
                key: PageKey,
                kind: P,
                value: Arc<P::Page>,
                size: SizeInfo,
                frozen: bool,
            },
        }
        let mut first_err: Option<Error> = None;
        loop {
            let step = {
                let mut state = self.inner.state.write().await;
                let Some(mut cp) = state.checkpoint.take() else {
                    return Err(Error::NoCheckpoint);
                };
                cp.pending.retain(|&index| {
                    state
                        .arena
                        .get(index)
                        .and_then(|entry| entry.resident())
                        .map(|r| r.checkpoint_pending)
                        .unwrap_or(false)
                });
                if cp.pending.is_empty() {
                    Step::Done
                } else {
                    let mut pick = None;
                    for &index in &cp.pending {
                        let Some(entry) = state.arena.get(index) else {
                            continue;
                        };
                        let Some(resident) = entry.resident() else {
                            continue;
                        };
                        if resident.flushing || resident.partial_evicting {
                            continue;
                        }
                        // A writer that was granted before the checkpoint began may
                        // still be mutating the live value; wait for its unpin.
                        if resident.frozen.is_none() && entry.lock.write_locked() {
                            continue;
                        }
                        pick = Some(index);
                        break;
                    }
                    match pick {
                        None => {
                            let (tx, rx) = oneshot::channel();
                            cp.waiters.push(tx);
                            state.checkpoint = Some(cp);
                            Step::Wait(rx)
                        }
                        Some(index) => {
                            state.checkpoint = Some(cp);
                            match state.arena.get_mut(index) {
                                Some(entry) => {
                                    let key = entry.key;
                                    let kind = entry.kind.clone();
                                    match entry.resident_mut() {
                                        Some(resident) => {
                                            resident.flushing = true;
                                            let (value, size, frozen) = match &resident.frozen {
                                                Some(f) => (f.value.clone(), f.size, true),
                                                None => {
                                                    (resident.value.clone(), resident.size, false)
                                                }
                                            };
                                            Step::Flush {
                                                index,
                                                key,
                                                kind,
                                                value,
                                                size,
                                                frozen,
                                            }
                                        }
                                        None => continue,
                                    }
                                }
                                None => continue,
                            }
                        }
                    }
                }
            };
            match step {
                Step::Done => {
                    debug!("checkpoint ended");
                    return match first_err {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
                Step::Wait(rx) => {
                    let _ = rx.await;
                }
                Step::Flush {
                    index,
                    key,
                    kind,
                    value,
                    size,
                    frozen,
                } => {
                    // A frozen snapshot is written and dropped; an untouched live
                    // value is written in place and kept.
                    let keep = !frozen;
                    let result = kind
                        .flush(key.file, key.page, &value, size, FlushReason::Checkpoint, keep)
                        .await;
                    let mut state = self.inner.state.write().await;
                    let mut frozen_size = None;
                    {
                        let Some(entry) = state.arena.get_mut(index) else {
                            continue;
                        };
                        let Some(resident) = entry.resident_mut() else {
                            continue;
                        };
                        resident.flushing = false;
                        resident.checkpoint_pending = false;
                        if result.is_ok() {
                            if frozen {
                                if let Some(f) = resident.frozen.take() {
                                    frozen_size = Some(f.size);
                                }
                            } else {
                                resident.dirty = false;
                            }
                        }
                    }
                    match result {
                        Ok(new_size) => {
                            if let Some(fs) = frozen_size {
                                state.totals.release(&fs);
                            }
                            if !frozen {
                                if let Some(new) = new_size {
                                    state.apply_size(index, new);
                                }
                            }
                            self.inner.metrics.flushes.inc();
                        }
                        Err(err) => {
                            warn!(?err, file = key.file, page = key.page, "checkpoint flush failed");
                            state.flush_error = Some(err.to_string());
                            self.inner.metrics.flush_failures.inc();
                            if first_err.is_none() {
                                first_err = Some(Error::FlushFailed(err.to_string()));
                            }
                        }
                    }
                    state.checkpoint_resolved(index);
                    state.pump(index);
                    self.inner.metrics.record_sizes(&state.totals);
                }
            }
        }
    }

    /// Close one backing file: drain its background jobs, write back its dirty
    /// entries, and drop them all.
    ///
    /// Fails if any of the file's pages are still pinned, or if a write-back fails;
    /// either way the file is reopened for retry.
    pub async fn close_file(&self, num: FileNum) -> Result<(), Error> {
        {
            let mut state = self.inner.state.write().await;
            match state.files.get_mut(&num) {
                None => return Err(Error::UnknownFile(num)),
                Some(file) if file.closing => return Err(Error::FileClosing(num)),
                Some(file) => file.closing = true,
            }
        }
        loop {
            let rx = {
                let mut state = self.inner.state.write().await;
                match state.files.get_mut(&num) {
                    None => None,
                    Some(file) if file.jobs == 0 => None,
                    Some(file) => {
                        let (tx, rx) = oneshot::channel();
                        file.drain_waiters.push(tx);
                        Some(rx)
                    }
                }
            };
            match rx {
                None => break,
                Some(rx) => {
                    let _ = rx.await;
                }
            }
        }
        if let Err(err) = self.drain_entries(num).await {
            let mut state = self.inner.state.write().await;
            if let Some(file) = state.files.get_mut(&num) {
                file.closing = false;
            }
            return Err(err);
        }
        let mut state = self.inner.state.write().await;
        state.files.remove(&num);
        self.inner.metrics.files.set(state.files.len() as i64);
        debug!(file = num, "file closed");
        Ok(())
    }

    /// Write back and drop every entry owned by a closing file.
    async fn drain_entries(&self, num: FileNum) -> Result<(), Error> {
        struct FlushPlan<P: PageKind> {
            index: EntryIndex,
            key: PageKey,
            kind: P,
            value: Arc<P::Page>,
            size: SizeInfo,
            frozen: bool,
        }
        loop {
            let plan: Option<FlushPlan<P>> = {
                let mut state = self.inner.state.write().await;
                let indices: Vec<EntryIndex> = match state.files.get(&num) {
                    None => return Ok(()),
                    Some(file) => file.entries.iter().copied().collect(),
                };
                let mut plan = None;
                for index in indices {
                    enum Action<P: PageKind> {
                        Drop,
                        Flush(FlushPlan<P>),
                    }
                    let action = {
                        let Some(entry) = state.arena.get(index) else {
                            continue;
                        };
                        if !entry.lock.is_unlocked() || entry.busy() {
                            return Err(Error::ContractViolation(
                                "file closed with active pages",
                            ));
                        }
                        let Some(resident) = entry.resident() else {
                            continue;
                        };
                        if let Some(frozen) = &resident.frozen {
                            Action::Flush(FlushPlan {
                                index,
                                key: entry.key,
                                kind: entry.kind.clone(),
                                value: frozen.value.clone(),
                                size: frozen.size,
                                frozen: true,
                            })
                        } else if resident.dirty {
                            Action::Flush(FlushPlan {
                                index,
                                key: entry.key,
                                kind: entry.kind.clone(),
                                value: resident.value.clone(),
                                size: resident.size,
                                frozen: false,
                            })
                        } else {
                            Action::Drop
                        }
                    };
                    match action {
                        Action::Drop => {
                            state.remove_entry(index);
                        }
                        Action::Flush(p) => {
                            if let Some(entry) = state.arena.get_mut(p.index) {
                                if let Some(resident) = entry.resident_mut() {
                                    resident.flushing = true;
                                }
                            }
                            plan = Some(p);
                            break;
                        }
                    }
                }
                self.inner.metrics.entries.set(state.arena.len() as i64);
                self.inner.metrics.record_sizes(&state.totals);
                plan
            };
            let Some(plan) = plan else {
                return Ok(());
            };
            let reason = if plan.frozen {
                FlushReason::Checkpoint
            } else {
                FlushReason::Close
            };
            let result = plan
                .kind
                .flush(plan.key.file, plan.key.page, &plan.value, plan.size, reason, false)
                .await;
            let mut state = self.inner.state.write().await;
            match result {
                Ok(_) => {
                    self.inner.metrics.flushes.inc();
                    if plan.frozen {
                        // The snapshot is durable; the live (dirty) value flushes on
                        // the next iteration.
                        let mut frozen_size = None;
                        if let Some(entry) = state.arena.get_mut(plan.index) {
                            if let Some(resident) = entry.resident_mut() {
                                resident.flushing = false;
                                resident.checkpoint_pending = false;
                                if let Some(f) = resident.frozen.take() {
                                    frozen_size = Some(f.size);
                                }
                            }
                        }
                        if let Some(fs) = frozen_size {
                            state.totals.release(&fs);
                        }
                        state.checkpoint_resolved(plan.index);
                    } else {
                        state.remove_entry(plan.index);
                    }
                    self.inner.metrics.entries.set(state.arena.len() as i64);
                    self.inner.metrics.record_sizes(&state.totals);
                }
                Err(err) => {
                    if let Some(entry) = state.arena.get_mut(plan.index) {
                        if let Some(resident) = entry.resident_mut() {
                            resident.flushing = false;
                        }
                    }
                    warn!(?err, file = plan.key.file, page = plan.key.page, "close flush failed");
                    state.flush_error = Some(err.to_string());
                    self.inner.metrics.flush_failures.inc();
                    return Err(Error::FlushFailed(err.to_string()));
                }
            }
        }
    }

    /// Stop background tasks and close every open file.
    pub async fn close(&self) -> Result<(), Error> {
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let nums: Vec<FileNum> = {
            let state = self.inner.state.read().await;
            state.files.keys().copied().collect()
        };
        for num in nums {
            self.close_file(num).await?;
        }
        debug!("cachetable closed");
        Ok(())
    }

    /// Snapshot the table's state.
    pub async fn status(&self) -> Status {
        let state = self.inner.state.read().await;
        Status {
            entries: state.arena.len(),
            files: state.files.len(),
            totals: state.totals,
            low_watermark: state.low,
            high_watermark: state.high,
            eviction_runs: state.eviction_runs,
            checkpoint_pending: state
                .checkpoint
                .as_ref()
                .map(|cp| cp.pending.len())
                .unwrap_or(0),
            flush_error: state.flush_error.clone(),
        }
    }

    /// Adjust the hysteresis watermarks. Only supported when the background evictor
    /// is disabled, so tests and maintenance tooling can steer eviction explicitly.
    pub async fn set_watermarks(&self, low: u64, high: u64) -> Result<(), Error> {
        if self.cfg.background_evictor {
            return Err(Error::ContractViolation(
                "watermarks are only adjustable with the background evictor disabled",
            ));
        }
        if high == 0 || low > high {
            return Err(Error::InvalidConfig(
                "low watermark must not exceed high watermark",
            ));
        }
        let mut state = self.inner.state.write().await;
        state.low = low;
        state.high = high;
        Ok(())
    }

    /// Run the fetch for a just-created `Fetching` entry, install the result, and
    /// wake everyone parked on it. On failure the entry is destroyed and the error
    /// is broadcast to the parked waiters.
    async fn complete_fetch(&self, kind: &P, key: PageKey, index: EntryIndex) -> Result<(), Error> {
        let result = kind.fetch(key.file, key.page).await;
        let mut state = self.inner.state.write().await;
        match result {
            Ok(Fetched { page, size, dirty }) => {
                {
                    let Some(entry) = state.arena.get_mut(index) else {
                        return Err(Error::NotFound(key.file, key.page));
                    };
                    let waiters = match std::mem::replace(
                        &mut entry.state,
                        EntryState::Resident(Resident {
                            value: Arc::new(page),
                            size,
                            dirty,
                            checkpoint_pending: false,
                            frozen: None,
                            flushing: false,
                            partial_evicting: false,
                        }),
                    ) {
                        EntryState::Fetching { waiters } => waiters,
                        EntryState::Resident(_) => Vec::new(),
                    };
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
                let pos = state.ring.push(index);
                if let Some(entry) = state.arena.get_mut(index) {
                    entry.ring_pos = Some(pos);
                }
                state.totals.accumulate(&size);
                self.inner.metrics.misses.inc();
                self.inner.metrics.record_sizes(&state.totals);
                let over = state.over_high();
                drop(state);
                if over {
                    self.pressure().await;
                }
                Ok(())
            }
            Err(err) => {
                let waiters = match state.remove_entry(index) {
                    Some(entry) => match entry.state {
                        EntryState::Fetching { waiters } => waiters,
                        EntryState::Resident(_) => Vec::new(),
                    },
                    None => Vec::new(),
                };
                self.inner.metrics.entries.set(state.arena.len() as i64);
                drop(state);
                if waiters.is_empty() {
                    return Err(err);
                }
                let shared = Arc::new(err);
                for waiter in waiters {
                    let _ = waiter.send(Err(shared.clone()));
                }
                Err(Error::FetchFailed(shared))
            }
        }
    }

    /// Complete a freshly granted pin: take the checkpoint snapshot for write
    /// grants, run a partial fetch if the hint demands one, downgrade a Read
    /// request that had to run under the exclusive lock, and build the guard.
    ///
    /// Returns `Ok(None)` when the grant became stale and the caller should retry
    /// from the top.
    async fn finalize_pin(
        &self,
        key: PageKey,
        index: EntryIndex,
        requested: AccessMode,
        mut held: AccessMode,
        hint: Option<&P::Hint>,
    ) -> Result<Option<Pinned<P>>, Error> {
        let mut grew = false;
        let partial = {
            let mut state = self.inner.state.write().await;
            if matches!(held, AccessMode::WriteCheap | AccessMode::WriteExpensive) {
                state.maybe_freeze(index, &self.inner.metrics);
            }
            let need = match (hint, state.arena.get(index)) {
                (_, None) => return Ok(None),
                (None, Some(entry)) => {
                    if entry.resident().is_none() {
                        return Ok(None);
                    }
                    false
                }
                (Some(h), Some(entry)) => match entry.resident() {
                    Some(resident) => entry.kind.partial_fetch_required(&resident.value, h),
                    None => return Ok(None),
                },
            };
            if need {
                let Some(entry) = state.arena.get_mut(index) else {
                    return Ok(None);
                };
                match held {
                    AccessMode::WriteCheap => {
                        entry.lock.upgrade_cheap();
                        held = AccessMode::WriteExpensive;
                    }
                    AccessMode::WriteExpensive => {}
                    AccessMode::Read => {
                        // Granted shared, but the value now demands an exclusive
                        // partial fetch; release and retry from the top.
                        entry.lock.release(AccessMode::Read);
                        state.pump(index);
                        return Ok(None);
                    }
                }
                let Some(entry) = state.arena.get(index) else {
                    return Ok(None);
                };
                entry
                    .resident()
                    .map(|r| (entry.kind.clone(), r.value.clone(), r.size))
            } else {
                None
            }
        };
        if let Some((kind, value, size)) = partial {
            let hint = hint.ok_or(Error::ContractViolation("partial fetch without a hint"))?;
            let result = kind
                .partial_fetch(key.file, key.page, &value, hint, size)
                .await;
            let mut state = self.inner.state.write().await;
            match result {
                Ok(new_size) => {
                    grew = new_size.total > size.total;
                    state.apply_size(index, new_size);
                }
                Err(err) => {
                    if let Some(entry) = state.arena.get_mut(index) {
                        entry.lock.release(held);
                    }
                    state.pump(index);
                    return Err(err);
                }
            }
        }
        let pin = {
            let mut state = self.inner.state.write().await;
            {
                let Some(entry) = state.arena.get_mut(index) else {
                    return Ok(None);
                };
                if held == AccessMode::WriteExpensive && requested == AccessMode::Read {
                    entry.lock.expensive_to_read();
                    held = AccessMode::Read;
                }
                entry.touch();
            }
            // Queued readers join a shared grant immediately.
            state.pump(index);
            let Some(entry) = state.arena.get(index) else {
                return Ok(None);
            };
            let Some(resident) = entry.resident() else {
                return Ok(None);
            };
            self.inner.metrics.record_sizes(&state.totals);
            Pinned {
                index,
                key,
                mode: held,
                value: resident.value.clone(),
                size: resident.size,
            }
        };
        if grew {
            self.maybe_pressure().await;
        }
        Ok(Some(pin))
    }

    async fn release_unlockers(&self, unlockers: &mut Unlockers<P>) {
        for pin in std::mem::take(&mut unlockers.pins) {
            let _ = self.unpin(pin, false, None).await;
        }
    }

    /// Run queued preparation work on a background task, counted against the file's
    /// job pool so close waits for it.
    fn spawn_prep(&self, kind: P, key: PageKey, job: PrepJob<P>) {
        let table = self.clone();
        self.context.with_label("prep").spawn(move |_| async move {
            match job {
                PrepJob::Fetch(index) => {
                    let _ = table.complete_fetch(&kind, key, index).await;
                }
                PrepJob::Warm { mode, hint } => {
                    match table.get_and_pin(&kind, key, mode, hint.as_ref()).await {
                        Ok(pin) => {
                            let _ = table.unpin(pin, false, None).await;
                        }
                        Err(err) => {
                            debug!(?err, file = key.file, page = key.page, "prep pin failed");
                        }
                    }
                    let mut state = table.inner.state.write().await;
                    if let Some(&index) = state.index.get(&key) {
                        if let Some(entry) = state.arena.get_mut(index) {
                            entry.prep_queued = false;
                        }
                    }
                }
            }
            table.finish_job(key.file).await;
        });
    }

    /// Record a background job completion, waking close if it was the last.
    pub(crate) async fn finish_job(&self, file: FileNum) {
        let waiters = {
            let mut state = self.inner.state.write().await;
            state
                .files
                .get_mut(&file)
                .map(|f| f.job_finished())
                .unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// React to the cache crossing the high watermark.
    pub(crate) async fn pressure(&self) {
        if self.cfg.background_evictor {
            let _ = self.inner.evictor.unbounded_send(());
        } else {
            self.evict_pass().await;
        }
    }

    async fn maybe_pressure(&self) {
        let over = {
            let state = self.inner.state.read().await;
            state.over_high()
        };
        if over {
            self.pressure().await;
        }
    }

    /// Assert that the recorded totals match a recount of every resident entry, and
    /// that the ring tracks exactly the resident entries.
    #[cfg(test)]
    pub(crate) async fn audit(&self) {
        let state = self.inner.state.read().await;
        let mut sum = SizeInfo::default();
        let mut resident = 0;
        for (_, entry) in state.arena.iter() {
            if let Some(r) = entry.resident() {
                resident += 1;
                sum.accumulate(&r.size);
                if let Some(frozen) = &r.frozen {
                    sum.accumulate(&frozen.size);
                }
                assert!(entry.ring_pos.is_some(), "resident entry missing from ring");
            }
        }
        assert_eq!(sum, state.totals, "size accounting drift");
        assert_eq!(resident, state.ring.len(), "ring tracks non-resident entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kind::FlushReason,
        mocks::{MockKind, MockPage},
    };
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Metrics as _, Runner};
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    async fn setup<E: Spawner + Clock + RuntimeMetrics>(
        context: E,
        budget: u64,
    ) -> (Cachetable<E, MockKind>, MockKind) {
        let mut cfg = Config::new(budget);
        cfg.background_evictor = false;
        let table = Cachetable::init(context.with_label("cachetable"), cfg).unwrap();
        table.open_file(1, "main.ft", 0).await.unwrap();
        (table, MockKind::default())
    }

    #[test_traced]
    fn test_get_and_pin_fetches_once() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            let key = PageKey::new(1, 7);

            let a = table
                .get_and_pin(&kind, key, AccessMode::Read, None)
                .await
                .unwrap();
            let b = table
                .get_and_pin(&kind, key, AccessMode::Read, None)
                .await
                .unwrap();
            assert_eq!(kind.fetch_count(), 1);
            assert_eq!(a.value().get(), 7);
            assert_eq!(a.mode(), AccessMode::Read);
            table.audit().await;

            table.unpin(a, false, None).await.unwrap();
            table.unpin(b, false, None).await.unwrap();
            table.audit().await;
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_unknown_file_rejected() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            let err = table
                .get_and_pin(&kind, PageKey::new(9, 0), AccessMode::Read, None)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::UnknownFile(9)));
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_put_and_already_cached() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            let key = PageKey::new(1, 3);

            let pin = table
                .put(&kind, key, MockPage::new(42), SizeInfo::of(5))
                .await
                .unwrap();
            assert_eq!(pin.mode(), AccessMode::WriteExpensive);
            table.unpin(pin, true, None).await.unwrap();

            let err = table
                .put(&kind, key, MockPage::new(43), SizeInfo::of(5))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::AlreadyCached(1, 3)));

            // The put value is served without a fetch.
            let pin = table
                .get_and_pin(&kind, key, AccessMode::Read, None)
                .await
                .unwrap();
            assert_eq!(pin.value().get(), 42);
            assert_eq!(kind.fetch_count(), 0);
            table.unpin(pin, false, None).await.unwrap();
            table.audit().await;
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_maybe_get_and_pin_respects_lock() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            let key = PageKey::new(1, 1);

            // Absent pages are never fetched by the maybe path.
            assert!(table
                .maybe_get_and_pin(key, AccessMode::Read)
                .await
                .unwrap()
                .is_none());
            assert_eq!(kind.fetch_count(), 0);

            let reader = table
                .get_and_pin(&kind, key, AccessMode::Read, None)
                .await
                .unwrap();
            // Writes blocked by the reader; reads share.
            assert!(table
                .maybe_get_and_pin(key, AccessMode::WriteExpensive)
                .await
                .unwrap()
                .is_none());
            let shared = table
                .maybe_get_and_pin(key, AccessMode::Read)
                .await
                .unwrap()
                .unwrap();
            table.unpin(shared, false, None).await.unwrap();
            table.unpin(reader, false, None).await.unwrap();

            let writer = table
                .maybe_get_and_pin(key, AccessMode::WriteExpensive)
                .await
                .unwrap()
                .unwrap();
            table.unpin(writer, false, None).await.unwrap();
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_blocking_writer_waits_for_reader() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context.clone(), 1 << 20).await;
            let key = PageKey::new(1, 5);

            let reader = table
                .get_and_pin(&kind, key, AccessMode::Read, None)
                .await
                .unwrap();

            let writer_table = table.clone();
            let writer_kind = kind.clone();
            let writer = context.clone().spawn(move |_| async move {
                let pin = writer_table
                    .get_and_pin(&writer_kind, key, AccessMode::WriteExpensive, None)
                    .await
                    .unwrap();
                pin.value().set(99);
                writer_table.unpin(pin, true, None).await.unwrap();
            });

            // Wait until the writer is queued: new reads stop being grantable.
            loop {
                match table.maybe_get_and_pin(key, AccessMode::Read).await.unwrap() {
                    Some(pin) => {
                        table.unpin(pin, false, None).await.unwrap();
                        context.sleep(Duration::from_millis(1)).await;
                    }
                    None => break,
                }
            }

            table.unpin(reader, false, None).await.unwrap();
            writer.await.unwrap();

            let pin = table
                .get_and_pin(&kind, key, AccessMode::Read, None)
                .await
                .unwrap();
            assert_eq!(pin.value().get(), 99);
            table.unpin(pin, false, None).await.unwrap();
            table.audit().await;
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_concurrent_fetch_deduplicates() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context.clone(), 1 << 20).await;
            let key = PageKey::new(1, 11);
            let gate = kind.gate_next_fetch();

            let t1 = table.clone();
            let k1 = kind.clone();
            let first = context.clone().spawn(move |_| async move {
                let pin = t1.get_and_pin(&k1, key, AccessMode::Read, None).await.unwrap();
                let value = pin.value().get();
                t1.unpin(pin, false, None).await.unwrap();
                value
            });
            let t2 = table.clone();
            let k2 = kind.clone();
            let second = context.clone().spawn(move |_| async move {
                let pin = t2.get_and_pin(&k2, key, AccessMode::Read, None).await.unwrap();
                let value = pin.value().get();
                t2.unpin(pin, false, None).await.unwrap();
                value
            });

            // Both callers are parked on the same fetch until the gate opens.
            context.sleep(Duration::from_millis(10)).await;
            gate.send(()).unwrap();

            assert_eq!(first.await.unwrap(), 11);
            assert_eq!(second.await.unwrap(), 11);
            assert_eq!(kind.fetch_count(), 1);
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_fetch_failure_broadcast() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context.clone(), 1 << 20).await;
            let key = PageKey::new(1, 13);
            kind.fail_next_fetch(1, 13);
            let gate = kind.gate_next_fetch();

            let t1 = table.clone();
            let k1 = kind.clone();
            let first = context.clone().spawn(move |_| async move {
                t1.get_and_pin(&k1, key, AccessMode::Read, None).await.err()
            });
            let t2 = table.clone();
            let k2 = kind.clone();
            let second = context.clone().spawn(move |_| async move {
                t2.get_and_pin(&k2, key, AccessMode::Read, None).await.err()
            });

            context.sleep(Duration::from_millis(10)).await;
            gate.send(()).unwrap();

            let errs = (first.await.unwrap(), second.await.unwrap());
            // One of the two was the creator (plain I/O error), the other shared
            // the broadcast failure; a later retry fetches anew.
            assert!(errs.0.is_some() && errs.1.is_some());
            let pin = table
                .get_and_pin(&kind, key, AccessMode::Read, None)
                .await
                .unwrap();
            table.unpin(pin, false, None).await.unwrap();
            table.audit().await;
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_nonblocking_retry_releases_unlockers() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            let key_a = PageKey::new(1, 1);
            let key_b = PageKey::new(1, 2);

            // Another task holds B exclusively.
            let holder = table
                .get_and_pin(&kind, key_b, AccessMode::WriteExpensive, None)
                .await
                .unwrap();

            let pin_a = table
                .get_and_pin(&kind, key_a, AccessMode::Read, None)
                .await
                .unwrap();
            let mut unlockers = Unlockers::new();
            unlockers.push(pin_a);
            let outcome = table
                .get_and_pin_nonblocking(&kind, key_b, AccessMode::Read, None, &mut unlockers)
                .await
                .unwrap();
            assert!(matches!(outcome, TryPin::Retry));
            assert!(unlockers.is_empty());

            // The retry released A: it is immediately write-grantable.
            let pin_a = table
                .maybe_get_and_pin(key_a, AccessMode::WriteExpensive)
                .await
                .unwrap()
                .unwrap();
            table.unpin(pin_a, false, None).await.unwrap();
            table.unpin(holder, false, None).await.unwrap();
            table.audit().await;
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_nonblocking_success_keeps_unlockers() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            let key_a = PageKey::new(1, 16);
            let key_b = PageKey::new(1, 17);

            // Make B resident and free.
            let pin = table
                .get_and_pin(&kind, key_b, AccessMode::Read, None)
                .await
                .unwrap();
            table.unpin(pin, false, None).await.unwrap();

            let pin_a = table
                .get_and_pin(&kind, key_a, AccessMode::Read, None)
                .await
                .unwrap();
            let mut unlockers = Unlockers::new();
            unlockers.push(pin_a);
            let pin_b = match table
                .get_and_pin_nonblocking(&kind, key_b, AccessMode::Read, None, &mut unlockers)
                .await
                .unwrap()
            {
                TryPin::Pinned(pin) => pin,
                TryPin::Retry => panic!("free resident page must grant immediately"),
            };

            // The grant left the lent pins alone: A is still read-locked and the
            // caller still owns the guard that releases it.
            assert_eq!(unlockers.len(), 1);
            assert!(table
                .maybe_get_and_pin(key_a, AccessMode::WriteExpensive)
                .await
                .unwrap()
                .is_none());
            let pin_a = unlockers.pop().unwrap();
            table.unpin(pin_a, false, None).await.unwrap();
            let pin_a = table
                .maybe_get_and_pin(key_a, AccessMode::WriteExpensive)
                .await
                .unwrap()
                .unwrap();
            table.unpin(pin_a, false, None).await.unwrap();
            table.unpin(pin_b, false, None).await.unwrap();
            table.audit().await;
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_nonblocking_write_retry_then_blocking_succeeds() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context.clone(), 1 << 20).await;
            let key = PageKey::new(1, 18);

            let holder = table
                .get_and_pin(&kind, key, AccessMode::WriteExpensive, None)
                .await
                .unwrap();

            // An exclusive pin of a held page comes straight back as a retry.
            let outcome = table
                .get_and_pin_nonblocking(
                    &kind,
                    key,
                    AccessMode::WriteExpensive,
                    None,
                    &mut Unlockers::new(),
                )
                .await
                .unwrap();
            assert!(matches!(outcome, TryPin::Retry));

            // A blocking re-issue parks until the holder lets go.
            let waiter_table = table.clone();
            let waiter_kind = kind.clone();
            let waiter = context.clone().spawn(move |_| async move {
                waiter_table
                    .get_and_pin(&waiter_kind, key, AccessMode::WriteExpensive, None)
                    .await
            });
            context.sleep(Duration::from_millis(10)).await;
            table.unpin(holder, false, None).await.unwrap();

            let pin = waiter.await.unwrap().unwrap();
            assert_eq!(pin.mode(), AccessMode::WriteExpensive);
            table.unpin(pin, false, None).await.unwrap();
            table.audit().await;
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_nonblocking_miss_queues_fetch() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context.clone(), 1 << 20).await;
            let key = PageKey::new(1, 21);

            let outcome = table
                .get_and_pin_nonblocking(&kind, key, AccessMode::Read, None, &mut Unlockers::new())
                .await
                .unwrap();
            assert!(matches!(outcome, TryPin::Retry));

            // The background job completes the fetch; a retry loop succeeds.
            let pin = loop {
                match table
                    .get_and_pin_nonblocking(&kind, key, AccessMode::Read, None, &mut Unlockers::new())
                    .await
                    .unwrap()
                {
                    TryPin::Pinned(pin) => break pin,
                    TryPin::Retry => context.sleep(Duration::from_millis(1)).await,
                }
            };
            assert_eq!(kind.fetch_count(), 1);
            table.unpin(pin, false, None).await.unwrap();
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_partial_fetch_with_hint() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            kind.set_incomplete_fetch(true);
            kind.set_portion_bytes(10);
            let key = PageKey::new(1, 4);

            // A read with a hint on an incomplete page runs the partial fetch under
            // the exclusive lock, then downgrades to the requested mode.
            let pin = table
                .get_and_pin(&kind, key, AccessMode::Read, Some(&5))
                .await
                .unwrap();
            assert_eq!(pin.mode(), AccessMode::Read);
            assert!(pin.value().portions.lock().unwrap().contains(&5));
            assert_eq!(pin.size().total, 11);
            table.audit().await;
            table.unpin(pin, false, None).await.unwrap();

            // The portion is now resident: the same hint no longer refetches.
            let pin = table
                .get_and_pin(&kind, key, AccessMode::Read, Some(&5))
                .await
                .unwrap();
            assert_eq!(pin.size().total, 11);
            table.unpin(pin, false, None).await.unwrap();

            // A different portion grows the page again.
            let pin = table
                .get_and_pin(&kind, key, AccessMode::Read, Some(&6))
                .await
                .unwrap();
            assert_eq!(pin.size().total, 21);
            table.unpin(pin, false, None).await.unwrap();
            table.audit().await;
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_write_cheap_upgrade_is_sticky() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            kind.set_incomplete_fetch(true);
            let key = PageKey::new(1, 8);

            let pin = table
                .get_and_pin(&kind, key, AccessMode::WriteCheap, Some(&1))
                .await
                .unwrap();
            // The partial fetch upgraded the pin for the rest of its lifetime.
            assert_eq!(pin.mode(), AccessMode::WriteExpensive);
            table.unpin(pin, true, None).await.unwrap();

            // Without a partial fetch, WriteCheap stays cheap.
            let pin = table
                .get_and_pin(&kind, key, AccessMode::WriteCheap, None)
                .await
                .unwrap();
            assert_eq!(pin.mode(), AccessMode::WriteCheap);
            table.unpin(pin, false, None).await.unwrap();
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_nonblocking_partial_fetch_prep() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context.clone(), 1 << 20).await;
            kind.set_incomplete_fetch(true);
            let key = PageKey::new(1, 9);

            // Make the page resident (incomplete).
            let pin = table
                .get_and_pin(&kind, key, AccessMode::Read, None)
                .await
                .unwrap();
            table.unpin(pin, false, None).await.unwrap();

            // The non-blocking path refuses to run the partial fetch inline.
            let outcome = table
                .get_and_pin_nonblocking(&kind, key, AccessMode::Read, Some(&3), &mut Unlockers::new())
                .await
                .unwrap();
            assert!(matches!(outcome, TryPin::Retry));

            let pin = loop {
                match table
                    .get_and_pin_nonblocking(
                        &kind,
                        key,
                        AccessMode::Read,
                        Some(&3),
                        &mut Unlockers::new(),
                    )
                    .await
                    .unwrap()
                {
                    TryPin::Pinned(pin) => break pin,
                    TryPin::Retry => context.sleep(Duration::from_millis(1)).await,
                }
            };
            assert!(pin.value().portions.lock().unwrap().contains(&3));
            table.unpin(pin, false, None).await.unwrap();
            table.audit().await;
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_unpin_resize_updates_totals() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            let key = PageKey::new(1, 2);

            let pin = table
                .get_and_pin(&kind, key, AccessMode::WriteExpensive, None)
                .await
                .unwrap();
            table
                .unpin(pin, true, Some(SizeInfo::of(500)))
                .await
                .unwrap();
            assert_eq!(table.status().await.totals.total, 500);
            table.audit().await;
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_unpin_and_remove() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            let key = PageKey::new(1, 6);

            // Removal requires a write pin.
            let pin = table
                .get_and_pin(&kind, key, AccessMode::Read, None)
                .await
                .unwrap();
            assert!(matches!(
                table.unpin_and_remove(pin).await,
                Err(Error::ContractViolation(_))
            ));
            // The failed removal consumed the guard along with its pin... re-pin.
            let pin = table
                .get_and_pin(&kind, key, AccessMode::WriteExpensive, None)
                .await
                .unwrap();
            table.unpin_and_remove(pin).await.unwrap();

            assert!(table
                .maybe_get_and_pin(key, AccessMode::Read)
                .await
                .unwrap()
                .is_none());
            assert_eq!(table.status().await.entries, 0);
            // Nothing was written back.
            assert!(kind.flushes().is_empty());
            table.audit().await;
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_checkpoint_clone_on_write() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            let key = PageKey::new(1, 40);

            let pin = table
                .put(&kind, key, MockPage::new(1), SizeInfo::of(8))
                .await
                .unwrap();
            table.unpin(pin, true, None).await.unwrap();

            assert_eq!(table.begin_checkpoint().await.unwrap(), 1);

            // Two successive writers during the window: one clone, not two.
            for value in [2u64, 3] {
                let pin = table
                    .get_and_pin(&kind, key, AccessMode::WriteExpensive, None)
                    .await
                    .unwrap();
                pin.value().set(value);
                table.unpin(pin, true, None).await.unwrap();
            }
            assert_eq!(kind.clone_count(), 1);
            table.audit().await;

            table.end_checkpoint().await.unwrap();
            // The checkpoint wrote the pre-write image and dropped the snapshot.
            let flushes = kind.flushes();
            assert_eq!(flushes.len(), 1);
            assert_eq!(flushes[0].value, 1);
            assert_eq!(flushes[0].reason, FlushReason::Checkpoint);
            assert!(!flushes[0].keep);
            table.audit().await;

            // The live (mutated) value is still dirty and flushes at close.
            table.close().await.unwrap();
            let flushes = kind.flushes();
            assert_eq!(flushes.len(), 2);
            assert_eq!(flushes[1].value, 3);
            assert_eq!(flushes[1].reason, FlushReason::Close);
        });
    }

    #[test_traced]
    fn test_checkpoint_untouched_entry_flushed_in_place() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            let key = PageKey::new(1, 41);

            let pin = table
                .put(&kind, key, MockPage::new(7), SizeInfo::of(8))
                .await
                .unwrap();
            table.unpin(pin, true, None).await.unwrap();

            assert_eq!(table.begin_checkpoint().await.unwrap(), 1);
            table.end_checkpoint().await.unwrap();

            let flushes = kind.flushes();
            assert_eq!(flushes.len(), 1);
            assert_eq!(flushes[0].value, 7);
            assert!(flushes[0].keep);
            assert_eq!(kind.clone_count(), 0);

            // The entry became clean: close writes nothing further.
            table.close().await.unwrap();
            assert_eq!(kind.flushes().len(), 1);
        });
    }

    #[test_traced]
    fn test_checkpoint_window_rules() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;

            assert!(matches!(
                table.end_checkpoint().await,
                Err(Error::NoCheckpoint)
            ));
            table.begin_checkpoint().await.unwrap();
            assert!(matches!(
                table.begin_checkpoint().await,
                Err(Error::CheckpointInProgress)
            ));

            // Entries dirtied after begin are not part of this checkpoint.
            let pin = table
                .put(&kind, PageKey::new(1, 50), MockPage::new(5), SizeInfo::of(1))
                .await
                .unwrap();
            table.unpin(pin, true, None).await.unwrap();
            table.end_checkpoint().await.unwrap();
            assert!(kind.flushes().is_empty());

            // A fresh checkpoint picks it up.
            assert_eq!(table.begin_checkpoint().await.unwrap(), 1);
            table.end_checkpoint().await.unwrap();
            assert_eq!(kind.flushes().len(), 1);
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_checkpoint_waits_for_prior_writer() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context.clone(), 1 << 20).await;
            let key = PageKey::new(1, 42);

            // Writer pinned before the checkpoint begins; no clone exists.
            let writer = table
                .get_and_pin(&kind, key, AccessMode::WriteExpensive, None)
                .await
                .unwrap();
            writer.value().set(10);
            let pin2 = table
                .put(&kind, PageKey::new(1, 43), MockPage::new(0), SizeInfo::of(1))
                .await
                .unwrap();
            table.unpin(pin2, true, None).await.unwrap();
            // The writer's entry must be dirty at begin to be pending.
            {
                let mut state = table.inner.state.write().await;
                let index = *state.index.get(&key).unwrap();
                state
                    .arena
                    .get_mut(index)
                    .unwrap()
                    .resident_mut()
                    .unwrap()
                    .dirty = true;
            }

            assert_eq!(table.begin_checkpoint().await.unwrap(), 2);

            let ender = table.clone();
            let end = context.clone().spawn(move |_| async move {
                ender.end_checkpoint().await.unwrap();
            });

            // The checkpointer is parked on the held writer.
            context.sleep(Duration::from_millis(20)).await;
            assert_eq!(table.status().await.checkpoint_pending, 1);

            writer.value().set(11);
            table.unpin(writer, true, None).await.unwrap();
            end.await.unwrap();

            // The post-unpin value was written in place.
            let record = kind
                .flushes()
                .into_iter()
                .find(|f| f.page == 42)
                .unwrap();
            assert_eq!(record.value, 11);
            assert!(record.keep);
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_remove_pending_entry_forgives_checkpoint() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            let key = PageKey::new(1, 44);

            let pin = table
                .put(&kind, key, MockPage::new(9), SizeInfo::of(4))
                .await
                .unwrap();
            table.unpin(pin, true, None).await.unwrap();
            assert_eq!(table.begin_checkpoint().await.unwrap(), 1);

            // Destroying the entry drops its snapshot obligation.
            let pin = table
                .get_and_pin(&kind, key, AccessMode::WriteExpensive, None)
                .await
                .unwrap();
            table.unpin_and_remove(pin).await.unwrap();

            table.end_checkpoint().await.unwrap();
            assert!(kind.flushes().is_empty());
            table.audit().await;
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_spawn_job_blocks_close() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, _) = setup(context.clone(), 1 << 20).await;
            let (tx, rx) = oneshot::channel::<()>();
            let done = Arc::new(AtomicBool::new(false));

            // The job parks until released; close_file must wait it out.
            let job_done = done.clone();
            let handle = table
                .spawn_job(1, move |_| async move {
                    let _ = rx.await;
                    job_done.store(true, Ordering::Relaxed);
                })
                .await
                .unwrap();

            let closer_table = table.clone();
            let closer = context
                .clone()
                .spawn(move |_| async move { closer_table.close_file(1).await });
            context.sleep(Duration::from_millis(10)).await;
            assert!(!done.load(Ordering::Relaxed));

            // A closing file rejects new jobs.
            assert!(matches!(
                table.spawn_job(1, |_| async {}).await,
                Err(Error::FileClosing(1))
            ));

            tx.send(()).unwrap();
            handle.await.unwrap();
            closer.await.unwrap().unwrap();
            assert!(done.load(Ordering::Relaxed));
            assert!(table.file(1).await.is_none());
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_close_file_flushes_dirty_entries() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;

            for page in 0..3u64 {
                let pin = table
                    .put(&kind, PageKey::new(1, page), MockPage::new(page), SizeInfo::of(4))
                    .await
                    .unwrap();
                table.unpin(pin, true, None).await.unwrap();
            }
            table.close_file(1).await.unwrap();

            let flushes = kind.flushes();
            assert_eq!(flushes.len(), 3);
            assert!(flushes.iter().all(|f| f.reason == FlushReason::Close && !f.keep));
            assert!(table.file(1).await.is_none());
            assert!(matches!(
                table.close_file(1).await,
                Err(Error::UnknownFile(1))
            ));
            assert!(matches!(
                table
                    .get_and_pin(&kind, PageKey::new(1, 0), AccessMode::Read, None)
                    .await,
                Err(Error::UnknownFile(1))
            ));
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_close_file_with_pinned_page_fails() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            let pin = table
                .get_and_pin(&kind, PageKey::new(1, 0), AccessMode::Read, None)
                .await
                .unwrap();
            assert!(matches!(
                table.close_file(1).await,
                Err(Error::ContractViolation(_))
            ));

            // The failed close reopened the file; it closes once the pin is gone.
            table.unpin(pin, false, None).await.unwrap();
            table.close_file(1).await.unwrap();
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_close_file_flush_failure_is_retryable() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, kind) = setup(context, 1 << 20).await;
            let pin = table
                .put(&kind, PageKey::new(1, 0), MockPage::new(0), SizeInfo::of(4))
                .await
                .unwrap();
            table.unpin(pin, true, None).await.unwrap();

            kind.fail_flushes(1);
            assert!(matches!(
                table.close_file(1).await,
                Err(Error::FlushFailed(_))
            ));
            assert!(table.status().await.flush_error.is_some());
            // The entry was retained dirty; the retry succeeds.
            table.close_file(1).await.unwrap();
            assert_eq!(kind.flushes().len(), 1);
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_swap_backing_visible_to_pins() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, _) = setup(context, 1 << 20).await;
            let file = table.file(1).await.unwrap();
            assert_eq!(file.swap_backing(33), 0);
            assert_eq!(table.file(1).await.unwrap().backing(), 33);
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_watermark_adjustment_rules() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (table, _) = setup(context.clone(), 1 << 20).await;
            table.set_watermarks(10, 20).await.unwrap();
            let status = table.status().await;
            assert_eq!(status.low_watermark, 10);
            assert_eq!(status.high_watermark, 20);
            assert!(matches!(
                table.set_watermarks(30, 20).await,
                Err(Error::InvalidConfig(_))
            ));
            table.close().await.unwrap();

            // With the background evictor running, watermarks are fixed.
            let cfg = Config::new(1 << 20);
            let table: Cachetable<_, MockKind> =
                Cachetable::init(context.with_label("bg"), cfg).unwrap();
            assert!(matches!(
                table.set_watermarks(10, 20).await,
                Err(Error::ContractViolation(_))
            ));
            table.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_size_accounting_under_churn() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            use rand::{rngs::StdRng, Rng, SeedableRng};
            let (table, kind) = setup(context, 1 << 30).await;
            let mut rng = StdRng::seed_from_u64(42);

            for round in 0..200u64 {
                let page = rng.gen_range(0..16u64);
                let key = PageKey::new(1, page);
                match rng.gen_range(0..3u8) {
                    0 => {
                        let pin = table
                            .get_and_pin(&kind, key, AccessMode::Read, None)
                            .await
                            .unwrap();
                        table.unpin(pin, false, None).await.unwrap();
                    }
                    1 => {
                        let pin = table
                            .get_and_pin(&kind, key, AccessMode::WriteExpensive, None)
                            .await
                            .unwrap();
                        let new = SizeInfo::of(rng.gen_range(1..1000u64));
                        table.unpin(pin, true, Some(new)).await.unwrap();
                    }
                    _ => {
                        if let Some(pin) = table
                            .maybe_get_and_pin(key, AccessMode::WriteExpensive)
                            .await
                            .unwrap()
                        {
                            table.unpin_and_remove(pin).await.unwrap();
                        }
                    }
                }
                if round % 10 == 0 {
                    table.audit().await;
                }
            }
            table.audit().await;
            table.close().await.unwrap();
        });
    }
}
