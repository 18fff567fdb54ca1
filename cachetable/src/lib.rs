//! A bounded, size-accounted page cache (buffer pool) for the ferrotree storage engine.
//!
//! The cachetable holds the in-memory working set of on-disk pages, serializes concurrent
//! readers and writers of each page, evicts entries under memory pressure with a cost-aware
//! partial/full eviction protocol, and cooperates with a checkpointer so a consistent
//! snapshot can be written without stalling ongoing traffic.
//!
//! # Components
//!
//! - [Cachetable]: the entry table, mapping `(file, page)` to at most one live entry.
//! - [PageKind]: the capability trait a page kind implements (fetch, flush, partial
//!   eviction, partial fetch, cleaning, checkpoint cloning). Persistence lives entirely
//!   behind this trait; the cachetable itself persists nothing.
//! - [CacheFile]: handle for one open backing file, grouping its entries and its
//!   outstanding background jobs.
//! - Eviction engine: a clock (second-chance) sweep over resident, unpinned entries that
//!   keeps the cache within its hysteresis watermarks. Partial eviction is attempted
//!   before full eviction; cheap reductions run inline while expensive ones are handed to
//!   the background worker pool.
//!
//! # Locking
//!
//! Each entry carries a three-level lock: [AccessMode::Read] (shared),
//! [AccessMode::WriteCheap] (exclusive, but compatible with the holder's own partial
//! fetch), and [AccessMode::WriteExpensive] (fully exclusive). Blocking waiters are
//! granted in FIFO order. The non-blocking path never queues: it returns
//! [TryPin::Retry] after releasing the caller's [Unlockers], which is the upper layer's
//! tool for deadlock-free multi-page access.
//!
//! # Checkpoints
//!
//! [Cachetable::begin_checkpoint] marks every dirty entry checkpoint-pending. A write
//! pin granted on a pending dirty entry first snapshots the value with
//! [PageKind::clone_for_checkpoint], so [Cachetable::end_checkpoint] always writes the
//! pre-checkpoint image, no matter how the live value is mutated in the meantime. Only
//! per-entry coordination is used; there is no global lock for the checkpoint window.
//!
//! # Example
//!
//! ```rust
//! use commonware_runtime::{deterministic, Runner};
//! use ferrotree_cachetable::{
//!     mocks::MockKind, AccessMode, Cachetable, Config, PageKey,
//! };
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     // Create a cachetable with a 1 MiB budget and background tasks disabled.
//!     let mut cfg = Config::new(1 << 20);
//!     cfg.background_evictor = false;
//!     let table = Cachetable::init(context, cfg).unwrap();
//!
//!     // Register a backing file and fetch a page through the mock page kind.
//!     let kind = MockKind::default();
//!     let file = table.open_file(1, "main.ft", 0).await.unwrap();
//!     let pin = table
//!         .get_and_pin(&kind, PageKey::new(file.num(), 7), AccessMode::Read, None)
//!         .await
//!         .unwrap();
//!     assert_eq!(pin.key().page, 7);
//!
//!     // Release the pin unchanged and shut down.
//!     table.unpin(pin, false, None).await.unwrap();
//!     table.close().await.unwrap();
//! });
//! ```

use std::{
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};
use thiserror::Error as ThisError;

mod entry;
mod evictor;
mod file;
mod kind;
mod lock;
mod metrics;
pub mod mocks;
mod storage;

pub use file::CacheFile;
pub use kind::{Cost, Estimate, Fetched, FlushReason, PageKind, SizeInfo};
pub use lock::AccessMode;
pub use storage::{Cachetable, Pinned, Status, TryPin, Unlockers};

/// Stable identifier of an open backing file.
pub type FileNum = u64;

/// Identifier of a page within a backing file.
pub type PageId = u64;

/// Identity of one cached page.
///
/// The hash of `(file, page)` is computed once at construction and reused for every
/// table probe, so hot paths never rehash the key. Callers that already know the hash
/// (e.g. the tree layer caches it next to each child pointer) can supply it with
/// [PageKey::with_hash].
#[derive(Clone, Copy, Debug, Eq)]
pub struct PageKey {
    /// The backing file the page belongs to.
    pub file: FileNum,
    /// The page identifier within the file.
    pub page: PageId,
    /// Precomputed hash of `(file, page)`.
    pub hash: u64,
}

impl PageKey {
    /// Build a key for `(file, page)`, computing the hash.
    pub fn new(file: FileNum, page: PageId) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        hasher.write_u64(file);
        hasher.write_u64(page);
        Self {
            file,
            page,
            hash: hasher.finish(),
        }
    }

    /// Build a key with a caller-supplied hash.
    ///
    /// The hash must be the same value [PageKey::new] would compute for `(file, page)`;
    /// a mismatched hash makes the key unfindable.
    pub const fn with_hash(file: FileNum, page: PageId, hash: u64) -> Self {
        Self { file, page, hash }
    }
}

impl PartialEq for PageKey {
    fn eq(&self, other: &Self) -> bool {
        self.file == other.file && self.page == other.page
    }
}

impl Hash for PageKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// Errors that can occur when interacting with the cachetable.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("file not registered: {0}")]
    UnknownFile(FileNum),
    #[error("file already registered: {0}")]
    FileExists(FileNum),
    #[error("file closing: {0}")]
    FileClosing(FileNum),
    #[error("page not found: file={0} page={1}")]
    NotFound(FileNum, PageId),
    #[error("page already cached: file={0} page={1}")]
    AlreadyCached(FileNum, PageId),
    #[error("fetch failed: {0}")]
    FetchFailed(Arc<Error>),
    #[error("flush failed: {0}")]
    FlushFailed(String),
    #[error("checkpoint already in progress")]
    CheckpointInProgress,
    #[error("no checkpoint in progress")]
    NoCheckpoint,
    #[error("caller contract violation: {0}")]
    ContractViolation(&'static str),
    #[error("shutdown")]
    Shutdown,
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for a [Cachetable].
#[derive(Clone, Debug)]
pub struct Config {
    /// Eviction target: a sweep runs until resident bytes return to this value.
    pub low_watermark: u64,

    /// Eviction trigger: crossing this value wakes the evictor (or, with the background
    /// evictor disabled, runs a bounded synchronous pass on the unpinning task).
    pub high_watermark: u64,

    /// Whether to run the background evictor task. Disable for deterministic
    /// single-step tests; eviction then only happens synchronously on unpin/put.
    pub background_evictor: bool,

    /// How often the background evictor re-checks pressure without being signaled.
    pub evictor_interval: Duration,

    /// How often the cleaner visits the dirty entry with the most cache-pressure
    /// bytes. `None` disables the cleaner.
    pub cleaner_interval: Option<Duration>,
}

impl Config {
    /// Default watermark hysteresis: the low watermark sits 1/8th below the budget.
    pub fn new(budget: u64) -> Self {
        Self {
            low_watermark: budget - budget / 8,
            high_watermark: budget,
            background_evictor: true,
            evictor_interval: Duration::from_secs(1),
            cleaner_interval: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.high_watermark == 0 {
            return Err(Error::InvalidConfig("high watermark must be non-zero"));
        }
        if self.low_watermark > self.high_watermark {
            return Err(Error::InvalidConfig(
                "low watermark must not exceed high watermark",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_key_identity() {
        let a = PageKey::new(1, 2);
        let b = PageKey::new(1, 2);
        let c = PageKey::new(1, 3);
        assert_eq!(a, b);
        assert_eq!(a.hash, b.hash);
        assert_ne!(a, c);

        // A caller-supplied hash participates in hashing but not equality.
        let d = PageKey::with_hash(1, 2, a.hash);
        assert_eq!(a, d);
    }

    #[test]
    fn test_config_validation() {
        let cfg = Config::new(1 << 20);
        assert!(cfg.validate().is_ok());
        assert!(cfg.low_watermark < cfg.high_watermark);

        let mut cfg = Config::new(8);
        cfg.low_watermark = 9;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        let mut cfg = Config::new(8);
        cfg.high_watermark = 0;
        cfg.low_watermark = 0;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }
}
