//! The capability trait a page kind implements to participate in the cachetable.
//!
//! The tree layer implements [PageKind] once per page kind (e.g. internal node vs.
//! leaf) and injects it when an entry is created. All persistence happens behind this
//! trait; the cachetable never touches storage directly.

use crate::{Error, FileNum, PageId};
use std::future::Future;

/// Byte accounting for one cached page, tracked per category.
///
/// The categories are tracked separately because eviction policy and engine status
/// attribute memory by category. `total` is authoritative for watermark checks;
/// the remaining fields are attributions of (a subset of) it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SizeInfo {
    /// Total resident bytes for the page.
    pub total: u64,
    /// Bytes attributable to leaf data.
    pub leaf: u64,
    /// Bytes attributable to non-leaf (internal node) data.
    pub nonleaf: u64,
    /// Bytes attributable to rollback/undo data.
    pub rollback: u64,
    /// Bytes that would benefit from a cleaner pass (e.g. buffered messages whose
    /// flush would shrink a future write-back).
    pub cache_pressure: u64,
}

impl SizeInfo {
    /// A size descriptor with only the total populated.
    pub const fn of(total: u64) -> Self {
        Self {
            total,
            leaf: 0,
            nonleaf: 0,
            rollback: 0,
            cache_pressure: 0,
        }
    }

    /// Fold `add` into this descriptor.
    pub fn accumulate(&mut self, add: &SizeInfo) {
        self.total += add.total;
        self.leaf += add.leaf;
        self.nonleaf += add.nonleaf;
        self.rollback += add.rollback;
        self.cache_pressure += add.cache_pressure;
    }

    /// Remove `sub` from this descriptor.
    ///
    /// Saturates in release builds; per-category underflow indicates an accounting
    /// bug and is asserted in debug builds.
    pub fn release(&mut self, sub: &SizeInfo) {
        debug_assert!(self.total >= sub.total, "size accounting underflow");
        self.total = self.total.saturating_sub(sub.total);
        self.leaf = self.leaf.saturating_sub(sub.leaf);
        self.nonleaf = self.nonleaf.saturating_sub(sub.nonleaf);
        self.rollback = self.rollback.saturating_sub(sub.rollback);
        self.cache_pressure = self.cache_pressure.saturating_sub(sub.cache_pressure);
    }
}

/// Why a write-back is being issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushReason {
    /// The entry is being evicted under memory pressure.
    Evict,
    /// The pre-checkpoint image of the entry is being written for the in-flight
    /// checkpoint.
    Checkpoint,
    /// The entry's backing file is closing.
    Close,
}

/// Cost classification of a prospective partial eviction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cost {
    /// Fast enough to run inline on the sweeping task.
    Cheap,
    /// Handed to the background worker pool so the sweep is not blocked.
    Expensive,
}

/// Outcome of [PageKind::partial_evict_estimate].
///
/// The byte estimate is a scheduling hint only: the sweep uses it to decide whether a
/// partial eviction is worth attempting and where to run it. All size accounting uses
/// the authoritative [SizeInfo] returned by [PageKind::partial_evict].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Estimate {
    /// Estimated freeable bytes. Zero means partial eviction is pointless.
    pub bytes: u64,
    /// Where the reduction should run.
    pub cost: Cost,
}

impl Estimate {
    /// Nothing to free.
    pub const fn none() -> Self {
        Self {
            bytes: 0,
            cost: Cost::Cheap,
        }
    }
}

/// Result of a cold load via [PageKind::fetch].
#[derive(Clone, Debug)]
pub struct Fetched<T> {
    /// The in-memory value.
    pub page: T,
    /// Its size descriptor.
    pub size: SizeInfo,
    /// Whether the value is already dirty (e.g. recovery replayed messages into it).
    pub dirty: bool,
}

/// Per-page-kind capabilities, bound to an entry at creation.
///
/// Implementations must not call back into the cachetable for the same entry from any
/// of these methods; the entry is in an in-flight state while they run.
///
/// Mutating methods ([PageKind::partial_evict], [PageKind::partial_fetch],
/// [PageKind::clean]) receive a shared reference to the page because values are shared
/// with concurrent pin holders through `Arc`; page types use interior mutability for
/// the state these methods touch. Each such method returns the authoritative resulting
/// [SizeInfo], which is the only input to the engine's accounting.
pub trait PageKind: Clone + Send + Sync + 'static {
    /// The in-memory page representation.
    type Page: Send + Sync + 'static;

    /// Caller-supplied description of which portion of a page it needs (e.g. a key
    /// range bounding which partitions must be resident). `Clone` because the
    /// non-blocking path hands the hint to a background preparation job.
    type Hint: Clone + Send + Sync + 'static;

    /// Load a page on cache miss. May perform I/O.
    fn fetch(
        &self,
        file: FileNum,
        page: PageId,
    ) -> impl Future<Output = Result<Fetched<Self::Page>, Error>> + Send;

    /// Write a page back. If `keep` is false the implementation must also release any
    /// resources owned by the value; the cachetable drops its reference afterwards.
    /// Returns a replacement size when the write-back changed the resident footprint
    /// (only meaningful when `keep` is true).
    fn flush(
        &self,
        file: FileNum,
        page: PageId,
        value: &Self::Page,
        size: SizeInfo,
        reason: FlushReason,
        keep: bool,
    ) -> impl Future<Output = Result<Option<SizeInfo>, Error>> + Send;

    /// Classify a prospective partial eviction of `value`.
    fn partial_evict_estimate(&self, _value: &Self::Page) -> Estimate {
        Estimate::none()
    }

    /// Reduce the footprint of `value` without evicting it (e.g. drop decompressed
    /// child partitions while keeping the node shell). Returns the authoritative
    /// resulting size.
    fn partial_evict(
        &self,
        _value: &Self::Page,
        size: SizeInfo,
    ) -> impl Future<Output = Result<SizeInfo, Error>> + Send {
        async move { Ok(size) }
    }

    /// Whether the currently resident portion of `value` is insufficient for a caller
    /// with the given hint.
    fn partial_fetch_required(&self, _value: &Self::Page, _hint: &Self::Hint) -> bool {
        false
    }

    /// Load the missing portion of `value`. Runs under an exclusive lock on the entry.
    /// Returns the authoritative resulting size.
    fn partial_fetch(
        &self,
        _file: FileNum,
        _page: PageId,
        _value: &Self::Page,
        _hint: &Self::Hint,
        size: SizeInfo,
    ) -> impl Future<Output = Result<SizeInfo, Error>> + Send {
        async move { Ok(size) }
    }

    /// Background maintenance on a dirty entry with high cache-pressure bytes,
    /// invoked by the periodic cleaner to reduce future flush latency. Returns the
    /// resulting size when work was done.
    fn clean(
        &self,
        _file: FileNum,
        _page: PageId,
        _value: &Self::Page,
        _size: SizeInfo,
    ) -> impl Future<Output = Result<Option<SizeInfo>, Error>> + Send {
        async move { Ok(None) }
    }

    /// Produce an immutable snapshot of `value` for the in-flight checkpoint, so the
    /// live value can keep being mutated while the snapshot is written.
    fn clone_for_checkpoint(&self, value: &Self::Page) -> Self::Page;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_info_accumulate_release() {
        let mut totals = SizeInfo::default();
        let a = SizeInfo {
            total: 100,
            leaf: 60,
            nonleaf: 40,
            rollback: 0,
            cache_pressure: 10,
        };
        let b = SizeInfo::of(7);
        totals.accumulate(&a);
        totals.accumulate(&b);
        assert_eq!(totals.total, 107);
        assert_eq!(totals.leaf, 60);
        assert_eq!(totals.cache_pressure, 10);

        totals.release(&b);
        totals.release(&a);
        assert_eq!(totals, SizeInfo::default());
    }

    #[test]
    fn test_size_info_release_saturates() {
        let mut totals = SizeInfo::of(3);
        // Release across categories that were never accumulated.
        let bogus = SizeInfo {
            total: 3,
            leaf: 5,
            nonleaf: 0,
            rollback: 0,
            cache_pressure: 0,
        };
        totals.release(&bogus);
        assert_eq!(totals.total, 0);
        assert_eq!(totals.leaf, 0);
    }
}
