//! Optional observability hooks, mirroring the no-op-by-default pattern
//! used across this workspace: a global observer callers may register,
//! with every hook defaulting to doing nothing.

use std::any::Any;
use std::sync::OnceLock;

/// Low-cardinality counters and spans for store-level operations. All
/// methods default to no-ops so registering an observer is optional.
pub trait StoreObserver: Send + Sync {
    /// A `store` call committed a new blob of `bytes` plaintext bytes.
    fn blob_stored(&self, _bytes: u64) {}
    /// A `fetch` call returned `bytes` plaintext bytes.
    fn blob_fetched(&self, _bytes: u64) {}
    /// `sanitize` reset `count` objects that were corrupt, orphaned, or
    /// superseded duplicates.
    fn objects_reset(&self, _count: u64) {}
    /// Start an optional span; dropping the guard ends it.
    fn span(&self, _name: &'static str) -> StoreSpan {
        StoreSpan::noop()
    }
}

/// Guard object for an optional span. Holds a type-erased guard that ends
/// the span on drop.
pub struct StoreSpan {
    _guard: Option<Box<dyn Any + 'static>>,
}

impl StoreSpan {
    /// A span guard that does nothing.
    pub fn noop() -> Self {
        Self { _guard: None }
    }

    /// Wrap an arbitrary guard; dropping this drops it.
    pub fn from_guard<G: 'static>(guard: G) -> Self {
        Self { _guard: Some(Box::new(guard)) }
    }
}

struct NoopObserver;
impl StoreObserver for NoopObserver {}

static NOOP_OBSERVER: NoopObserver = NoopObserver;
static OBSERVER: OnceLock<&'static dyn StoreObserver> = OnceLock::new();

/// Register a global observer. Safe to call at most once; later calls are
/// ignored.
pub fn set_observer(observer: &'static dyn StoreObserver) {
    let _ = OBSERVER.set(observer);
}

pub(crate) fn observer() -> &'static dyn StoreObserver {
    OBSERVER.get().copied().unwrap_or(&NOOP_OBSERVER)
}
