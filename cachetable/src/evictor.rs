//! Eviction engine: the clock sweep, partial and full eviction, and the cleaner.
//!
//! A sweep runs whenever resident bytes cross the high watermark and works the clock
//! ring until they return to the low watermark. Each unreferenced, unpinned entry is
//! first offered a partial eviction (shedding bytes while staying resident); only a
//! visit that finds partial eviction already attempted, or pointless, falls through
//! to full eviction. Cheap partial evictions run inline on the sweeping task,
//! expensive ones on spawned workers so the sweep never stalls behind one entry.

use crate::{
    entry::{EntryIndex, EntryState},
    kind::{Cost, Estimate, FlushReason, SizeInfo},
    lock::AccessMode,
    Cachetable, PageKey, PageKind,
};
use commonware_macros::select;
use commonware_runtime::{Clock, Metrics as RuntimeMetrics, Spawner};
use futures::{channel::mpsc, StreamExt};
use std::{sync::Arc, time::Duration};
use tracing::{trace, warn};

/// Snapshot of an entry chosen for partial eviction.
struct PartialPlan<P: PageKind> {
    index: EntryIndex,
    key: PageKey,
    kind: P,
    value: Arc<P::Page>,
    size: SizeInfo,
}

/// Snapshot of an entry chosen for full (flush-and-drop) eviction.
struct EvictPlan<P: PageKind> {
    index: EntryIndex,
    key: PageKey,
    kind: P,
    value: Arc<P::Page>,
    size: SizeInfo,
    /// Pre-checkpoint snapshot that must reach storage before the entry may go.
    frozen: Option<(Arc<P::Page>, SizeInfo)>,
    /// The in-flight checkpoint still expects this entry's image.
    pending: bool,
}

/// One unit of work produced by the sweep.
enum SweepAction<P: PageKind> {
    PartialInline(PartialPlan<P>),
    PartialBackground(PartialPlan<P>),
    Flush(EvictPlan<P>),
}

impl<E: Spawner + Clock + RuntimeMetrics, P: PageKind> Cachetable<E, P> {
    /// Advance the clock hand until it yields work or pressure is relieved.
    ///
    /// Clean unreferenced entries are dropped inline as the hand passes them; the
    /// scan is bounded to two revolutions so a ring full of pinned or referenced
    /// entries cannot spin the sweep.
    fn next_action(
        &self,
        state: &mut crate::storage::State<P>,
    ) -> Option<SweepAction<P>> {
        enum Visit<P: PageKind> {
            Advance,
            Partial(Cost, PartialPlan<P>),
            Flush(EvictPlan<P>),
            Remove,
        }
        let mut scanned = 0;
        while state.totals.total > state.low && scanned < 2 * state.ring.len() {
            let Some(index) = state.ring.current() else {
                return None;
            };
            scanned += 1;
            let visit = {
                let Some(entry) = state.arena.get_mut(index) else {
                    state.ring.advance();
                    continue;
                };
                if !entry.evictable() {
                    Visit::Advance
                } else if entry.referenced {
                    entry.referenced = false;
                    Visit::Advance
                } else {
                    let key = entry.key;
                    let kind = entry.kind.clone();
                    let first_try = !entry.tried_partial;
                    entry.tried_partial = true;
                    let EntryState::Resident(resident) = &mut entry.state else {
                        state.ring.advance();
                        continue;
                    };
                    let estimate = if first_try {
                        kind.partial_evict_estimate(&resident.value)
                    } else {
                        Estimate::none()
                    };
                    if estimate.bytes > 0 {
                        resident.partial_evicting = true;
                        Visit::Partial(
                            estimate.cost,
                            PartialPlan {
                                index,
                                key,
                                kind,
                                value: resident.value.clone(),
                                size: resident.size,
                            },
                        )
                    } else if resident.dirty || resident.frozen.is_some() {
                        resident.flushing = true;
                        Visit::Flush(EvictPlan {
                            index,
                            key,
                            kind,
                            value: resident.value.clone(),
                            size: resident.size,
                            frozen: resident
                                .frozen
                                .as_ref()
                                .map(|f| (f.value.clone(), f.size)),
                            pending: resident.checkpoint_pending,
                        })
                    } else {
                        Visit::Remove
                    }
                }
            };
            match visit {
                Visit::Advance => state.ring.advance(),
                Visit::Partial(cost, plan) => {
                    state.ring.advance();
                    return Some(match cost {
                        Cost::Cheap => SweepAction::PartialInline(plan),
                        Cost::Expensive => SweepAction::PartialBackground(plan),
                    });
                }
                Visit::Flush(plan) => {
                    state.ring.advance();
                    return Some(SweepAction::Flush(plan));
                }
                Visit::Remove => {
                    // swap_remove moves another entry under the hand, so it is
                    // visited next without advancing.
                    state.remove_entry(index);
                    self.inner.metrics.evictions.inc();
                    self.inner.metrics.entries.set(state.arena.len() as i64);
                    self.inner.metrics.record_sizes(&state.totals);
                }
            }
        }
        None
    }

    /// One bounded eviction pass: sweep until resident bytes return to the low
    /// watermark, the ring yields no further work, or the step cap is hit.
    pub(crate) async fn evict_pass(&self) {
        {
            let mut state = self.inner.state.write().await;
            if state.totals.total <= state.low {
                return;
            }
            state.eviction_runs += 1;
        }
        self.inner.metrics.eviction_runs.inc();
        let mut steps: usize = 0;
        loop {
            let action = {
                let mut state = self.inner.state.write().await;
                if steps > 4 * state.ring.len() + 8 {
                    None
                } else {
                    self.next_action(&mut state)
                }
            };
            steps += 1;
            match action {
                None => break,
                Some(SweepAction::PartialInline(plan)) => self.run_partial(plan).await,
                Some(SweepAction::PartialBackground(plan)) => {
                    let queued = {
                        let mut state = self.inner.state.write().await;
                        match state.files.get_mut(&plan.key.file) {
                            Some(file) if !file.closing => {
                                file.job_started();
                                true
                            }
                            _ => false,
                        }
                    };
                    if queued {
                        let file = plan.key.file;
                        let table = self.clone();
                        self.context.with_label("partial").spawn(move |_| async move {
                            table.run_partial(plan).await;
                            table.finish_job(file).await;
                            // Re-examine pressure once the reduction lands.
                            let _ = table.inner.evictor.unbounded_send(());
                        });
                    } else {
                        let mut state = self.inner.state.write().await;
                        if let Some(entry) = state.arena.get_mut(plan.index) {
                            if let Some(resident) = entry.resident_mut() {
                                resident.partial_evicting = false;
                            }
                        }
                        state.pump(plan.index);
                    }
                }
                Some(SweepAction::Flush(plan)) => {
                    if !self.run_evict_flush(plan).await {
                        break;
                    }
                }
            }
        }
    }

    /// Run one partial eviction and install its authoritative resulting size.
    async fn run_partial(&self, plan: PartialPlan<P>) {
        let result = plan.kind.partial_evict(&plan.value, plan.size).await;
        let mut state = self.inner.state.write().await;
        if let Some(entry) = state.arena.get_mut(plan.index) {
            if let Some(resident) = entry.resident_mut() {
                resident.partial_evicting = false;
            }
        }
        match result {
            Ok(new) => {
                state.apply_size(plan.index, new);
                self.inner.metrics.partial_evictions.inc();
                trace!(
                    file = plan.key.file,
                    page = plan.key.page,
                    freed = plan.size.total.saturating_sub(new.total),
                    "partial eviction"
                );
            }
            Err(err) => {
                warn!(?err, file = plan.key.file, page = plan.key.page, "partial eviction failed");
            }
        }
        state.pump(plan.index);
        state.wake_checkpoint_waiters();
        self.inner.metrics.record_sizes(&state.totals);
    }

    /// Flush and drop one entry. Returns false when a write-back failed and the
    /// pass should stop rather than retry the same entry forever.
    async fn run_evict_flush(&self, plan: EvictPlan<P>) -> bool {
        // An unflushed pre-checkpoint snapshot goes to storage first; the live
        // value must not overwrite it out of order.
        if let Some((value, size)) = &plan.frozen {
            let result = plan
                .kind
                .flush(
                    plan.key.file,
                    plan.key.page,
                    value,
                    *size,
                    FlushReason::Checkpoint,
                    false,
                )
                .await;
            let mut state = self.inner.state.write().await;
            match result {
                Ok(_) => {
                    let mut frozen_size = None;
                    if let Some(entry) = state.arena.get_mut(plan.index) {
                        if let Some(resident) = entry.resident_mut() {
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
                    self.inner.metrics.flushes.inc();
                }
                Err(err) => {
                    if let Some(entry) = state.arena.get_mut(plan.index) {
                        if let Some(resident) = entry.resident_mut() {
                            resident.flushing = false;
                        }
                    }
                    warn!(?err, file = plan.key.file, page = plan.key.page, "evict flush failed");
                    state.flush_error = Some(err.to_string());
                    self.inner.metrics.flush_failures.inc();
                    state.pump(plan.index);
                    state.wake_checkpoint_waiters();
                    return false;
                }
            }
        }
        // An entry that was pending but never cloned carries its pre-checkpoint
        // image in the live value; that write satisfies the checkpoint.
        let reason = if plan.pending && plan.frozen.is_none() {
            FlushReason::Checkpoint
        } else {
            FlushReason::Evict
        };
        let result = plan
            .kind
            .flush(plan.key.file, plan.key.page, &plan.value, plan.size, reason, false)
            .await;
        let mut state = self.inner.state.write().await;
        match result {
            Ok(_) => {
                state.remove_entry(plan.index);
                state.wake_checkpoint_waiters();
                self.inner.metrics.flushes.inc();
                self.inner.metrics.evictions.inc();
                self.inner.metrics.entries.set(state.arena.len() as i64);
                self.inner.metrics.record_sizes(&state.totals);
                true
            }
            Err(err) => {
                if let Some(entry) = state.arena.get_mut(plan.index) {
                    if let Some(resident) = entry.resident_mut() {
                        resident.flushing = false;
                    }
                }
                warn!(?err, file = plan.key.file, page = plan.key.page, "evict flush failed");
                state.flush_error = Some(err.to_string());
                self.inner.metrics.flush_failures.inc();
                state.pump(plan.index);
                state.wake_checkpoint_waiters();
                false
            }
        }
    }

    /// One cleaner visit: pick the dirty, unpinned entry with the most
    /// cache-pressure bytes and let its page kind reduce future flush cost.
    pub(crate) async fn clean_pass(&self) {
        struct CleanPlan<P: PageKind> {
            index: EntryIndex,
            key: PageKey,
            kind: P,
            value: Arc<P::Page>,
            size: SizeInfo,
        }
        let plan: Option<CleanPlan<P>> = {
            let mut state = self.inner.state.write().await;
            let mut best: Option<(EntryIndex, u64)> = None;
            for (index, entry) in state.arena.iter() {
                let Some(resident) = entry.resident() else {
                    continue;
                };
                if !resident.dirty
                    || resident.flushing
                    || resident.partial_evicting
                    || resident.size.cache_pressure == 0
                    || !entry.lock.available(AccessMode::WriteCheap)
                {
                    continue;
                }
                if best
                    .map(|(_, pressure)| resident.size.cache_pressure > pressure)
                    .unwrap_or(true)
                {
                    best = Some((index, resident.size.cache_pressure));
                }
            }
            match best {
                None => None,
                Some((index, _)) => {
                    // Cleaning mutates the value; a pending entry is snapshotted
                    // first, same as any other write grant.
                    state.maybe_freeze(index, &self.inner.metrics);
                    match state.arena.get_mut(index) {
                        None => None,
                        Some(entry) => {
                            assert!(entry.lock.try_acquire(AccessMode::WriteCheap));
                            let key = entry.key;
                            let kind = entry.kind.clone();
                            entry.resident().map(|resident| CleanPlan {
                                index,
                                key,
                                kind,
                                value: resident.value.clone(),
                                size: resident.size,
                            })
                        }
                    }
                }
            }
        };
        let Some(plan) = plan else {
            return;
        };
        let result = plan
            .kind
            .clean(plan.key.file, plan.key.page, &plan.value, plan.size)
            .await;
        let mut state = self.inner.state.write().await;
        match result {
            Ok(Some(new)) => state.apply_size(plan.index, new),
            Ok(None) => {}
            Err(err) => {
                warn!(?err, file = plan.key.file, page = plan.key.page, "clean failed");
            }
        }
        if let Some(entry) = state.arena.get_mut(plan.index) {
            entry.lock.release(AccessMode::WriteCheap);
        }
        state.pump(plan.index);
        state.wake_checkpoint_waiters();
        self.inner.metrics.cleaner_passes.inc();
        self.inner.metrics.record_sizes(&state.totals);
    }
}

/// Background evictor task: runs a pass when signaled by pressure and on a timer,
/// coalescing bursts of signals into one pass.
pub(crate) async fn run_evictor<E: Spawner + Clock + RuntimeMetrics, P: PageKind>(
    table: Cachetable<E, P>,
    mut wake: mpsc::UnboundedReceiver<()>,
) {
    loop {
        select! {
            msg = wake.next() => {
                if msg.is_none() {
                    return;
                }
                while let Ok(Some(())) = wake.try_next() {}
            },
            _ = table.context.sleep(table.cfg.evictor_interval) => {},
        }
        table.evict_pass().await;
    }
}

/// Background cleaner task: periodic [Cachetable::clean_pass] visits.
pub(crate) async fn run_cleaner<E: Spawner + Clock + RuntimeMetrics, P: PageKind>(
    table: Cachetable<E, P>,
    interval: Duration,
) {
    loop {
        table.context.sleep(interval).await;
        table.clean_pass().await;
    }
}
