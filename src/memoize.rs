use crate::in_flight::{Flight, InFlightRegistry, LeaderGuard, SyncTicket};
use crate::keys::{CacheableKey, RawKey};
use crate::lifetime::IdentityHandle;
use crate::persistence::{mirror_clear, mirror_del, mirror_put, JsonlMirror, PersistBackend};
use crate::stats::MemoStats;
use crate::store::CacheStore;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// A user-supplied key derivation replacing the default one.
pub type Keygen<A> = Box<dyn Fn(&A) -> RawKey + Send + Sync>;

/// Store plus its persistence mirror, mutated together under one lock so
/// mirror records always reflect committed state.
struct EngineState<V> {
    store: CacheStore<V>,
    backend: Option<Box<dyn PersistBackend<V>>>,
}

/// Configures and builds a [`Memoize`] engine.
///
/// All options are optional except that `build_keyed` requires a keygen:
///
/// - `size`: LRU bound; after an insertion pushes the store past it, least
///   recently used entries are evicted until it fits.
/// - `duration`: TTL bound; entries older than this are treated as absent.
/// - `keygen`: replaces the default argument-tuple key derivation.
/// - `persistent`: mirrors committed entries to a JSON-lines file that is
///   reloaded on the next construction.
///
/// # Examples
///
/// ```
/// use memorate::Memoize;
/// use std::time::Duration;
///
/// let memo: Memoize<u32, u64> = Memoize::builder()
///     .size(128)
///     .duration(Duration::from_secs(300))
///     .build();
/// assert_eq!(memo.call(&7, |n| u64::from(n * n)), 49);
/// ```
pub struct MemoizeBuilder<A, V, E = Infallible> {
    limit: Option<NonZeroUsize>,
    ttl: Option<Duration>,
    keygen: Option<Keygen<A>>,
    backend: Option<Box<dyn PersistBackend<V>>>,
    _errors: std::marker::PhantomData<fn() -> E>,
}

impl<A, V, E> Default for MemoizeBuilder<A, V, E> {
    fn default() -> Self {
        Self {
            limit: None,
            ttl: None,
            keygen: None,
            backend: None,
            _errors: std::marker::PhantomData,
        }
    }
}

impl<A, V, E> MemoizeBuilder<A, V, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the store at `size` entries, evicting least recently used
    /// entries beyond that. Must be positive.
    pub fn size(mut self, size: usize) -> Self {
        assert!(size > 0, "size bound must be positive");
        self.limit = NonZeroUsize::new(size);
        self
    }

    /// Expires entries `duration` after insertion. Must be non-zero.
    pub fn duration(mut self, duration: Duration) -> Self {
        assert!(!duration.is_zero(), "duration bound must be non-zero");
        self.ttl = Some(duration);
        self
    }

    /// Replaces the default key derivation. The keygen sees the full
    /// argument value and may omit parts of it from the key, for example a
    /// receiver, or normalize defaulted arguments so equivalent calls fold
    /// onto one entry.
    pub fn keygen(mut self, keygen: impl Fn(&A) -> RawKey + Send + Sync + 'static) -> Self {
        self.keygen = Some(Box::new(keygen));
        self
    }

    /// Mirrors committed entries to the JSON-lines file at `path` and
    /// reloads them when the engine is built again over the same file.
    /// Identity-keyed entries are excluded: their addresses cannot be
    /// reproduced in a later process.
    pub fn persistent(mut self, path: impl Into<PathBuf>) -> Self
    where
        V: Serialize + DeserializeOwned + Send + 'static,
    {
        self.backend = Some(Box::new(JsonlMirror::new(path)));
        self
    }

    fn into_parts(self) -> (Option<NonZeroUsize>, Option<Duration>, Option<Keygen<A>>, Option<Box<dyn PersistBackend<V>>>) {
        (self.limit, self.ttl, self.keygen, self.backend)
    }
}

impl<A, V: Clone, E> MemoizeBuilder<A, V, E> {
    /// Builds an engine using the default key derivation (the argument
    /// value's [`CacheableKey`] implementation), or the configured keygen if
    /// one was set.
    pub fn build(self) -> Memoize<A, V, E>
    where
        A: CacheableKey,
    {
        let (limit, ttl, keygen, backend) = self.into_parts();
        let keygen = keygen.unwrap_or_else(|| Box::new(|args: &A| args.raw_key()));
        Memoize::from_parts(limit, ttl, keygen, backend)
    }

    /// Builds an engine whose arguments need no [`CacheableKey`]
    /// implementation because a keygen was supplied.
    ///
    /// # Panics
    ///
    /// Panics if no keygen was configured.
    pub fn build_keyed(self) -> Memoize<A, V, E> {
        let (limit, ttl, keygen, backend) = self.into_parts();
        let keygen = keygen.expect("build_keyed requires a keygen");
        Memoize::from_parts(limit, ttl, keygen, backend)
    }
}

/// The synchronous memoization engine.
///
/// Wraps the admission of calls to one callable: each call derives a key
/// from its arguments, answers from the cache when a live entry exists,
/// joins an in-flight computation for the same key when one is running
/// (single-flight), and otherwise invokes the callable once and commits the
/// result.
///
/// Each engine owns its own store, in-flight registry, and persistence
/// mirror; there is no hidden global state, and administrative operations
/// act on the one instance they are called on.
///
/// Waiting on another caller's in-flight computation blocks the thread; the
/// task-suspending counterpart is [`AsyncMemoize`](crate::AsyncMemoize).
///
/// # Bounds and lifetimes
///
/// - With `size`, the engine is an LRU: the least recently touched entry is
///   evicted first, ties broken by insertion order.
/// - With `duration`, an entry is absent once it is older than the bound,
///   checked lazily on lookup and opportunistically on insertion.
/// - Entries keyed through [`Identity`](crate::Identity) arguments are
///   purged as soon as any tracked allocation is dropped, independent of
///   both bounds.
///
/// # Errors
///
/// [`try_call`](Memoize::try_call) propagates the callable's error verbatim
/// to the calling thread and, cloned, to every thread waiting on the same
/// key; failures are never cached. Persistence failures never surface
/// through the call path (see [`MemoStats::persist_errors`]).
///
/// # Examples
///
/// LRU behavior with `size = 2`:
///
/// ```
/// use memorate::Memoize;
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// let calls = AtomicU32::new(0);
/// let memo: Memoize<u32, u32> = Memoize::builder().size(2).build();
/// let mut double = |n: &u32| {
///     calls.fetch_add(1, Ordering::Relaxed);
///     n * 2
/// };
///
/// memo.call(&1, &mut double); // cache order [1]
/// memo.call(&2, &mut double); // cache order [1, 2]
/// memo.call(&1, &mut double); // cache order [2, 1], hit
/// memo.call(&3, &mut double); // evicts 2, cache order [1, 3]
/// memo.call(&2, &mut double); // recomputed
/// assert_eq!(calls.load(Ordering::Relaxed), 4);
/// ```
pub struct Memoize<A, V, E = Infallible> {
    state: Mutex<EngineState<V>>,
    in_flight: InFlightRegistry<SyncTicket<V, E>>,
    keygen: Keygen<A>,
    stats: MemoStats,
    generation: AtomicU64,
}

impl<A, V: Clone, E> Memoize<A, V, E> {
    /// Starts configuring an engine.
    pub fn builder() -> MemoizeBuilder<A, V, E> {
        MemoizeBuilder::new()
    }

    fn from_parts(
        limit: Option<NonZeroUsize>,
        ttl: Option<Duration>,
        keygen: Keygen<A>,
        mut backend: Option<Box<dyn PersistBackend<V>>>,
    ) -> Self {
        let stats = MemoStats::new();
        let mut store = CacheStore::new(limit, ttl);

        if let Some(active) = backend.as_mut() {
            match active.load(ttl) {
                Ok(outcome) => {
                    stats.record_persist_errors(outcome.skipped);
                    let mut tombstones = Vec::new();
                    for (key, entry) in outcome.entries {
                        tombstones.extend(store.insert_loaded(key, entry));
                    }
                    for key in tombstones {
                        if let Err(err) = active.remove(&key) {
                            warn!(key = %key, error = %err, "failed to mirror load-time eviction");
                            stats.record_persist_error();
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to load persistence mirror");
                    stats.record_persist_error();
                }
            }
        }

        Self {
            state: Mutex::new(EngineState { store, backend }),
            in_flight: InFlightRegistry::new(),
            keygen,
            stats,
            generation: AtomicU64::new(0),
        }
    }

    fn derive(&self, args: &A) -> (String, Vec<IdentityHandle>) {
        (self.keygen)(args).finish()
    }

    fn commit(
        &self,
        state: &mut EngineState<V>,
        key: &str,
        value: &V,
        handles: Vec<IdentityHandle>,
    ) {
        let identity_linked = !handles.is_empty();
        let evicted = state.store.insert(key.to_string(), value.clone(), handles);
        if !identity_linked {
            mirror_put(&mut state.backend, &self.stats, key, value);
        }
        for evicted_key in &evicted {
            mirror_del(&mut state.backend, &self.stats, evicted_key);
        }
    }

    /// Clears the store, identity links, eviction indexes, and the
    /// persistence mirror. Computations already in flight resolve naturally
    /// for their waiters, but their results are no longer committed.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut state = self.state.lock();
        state.store.reset();
        mirror_clear(&mut state.backend, &self.stats);
    }

    /// Current number of committed entries, including any not yet lazily
    /// expired or purged.
    pub fn len(&self) -> usize {
        self.state.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().store.is_empty()
    }

    /// Number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Access counters for this engine.
    pub fn stats(&self) -> &MemoStats {
        &self.stats
    }

    /// Drops the memo for `args`, if present.
    pub fn remove(&self, args: &A) -> bool {
        let (key, _) = self.derive(args);
        let mut state = self.state.lock();
        let removed = state.store.remove(&key);
        if removed {
            mirror_del(&mut state.backend, &self.stats, &key);
        }
        removed
    }

    /// Replaces the cached value for `args` only if a live memo exists.
    pub fn update(&self, args: &A, value: V) -> bool {
        let (key, _) = self.derive(args);
        let mut state = self.state.lock();
        if state.store.update(&key, value.clone()) {
            if !state.store.is_identity_linked(&key) {
                mirror_put(&mut state.backend, &self.stats, &key, &value);
            }
            true
        } else {
            false
        }
    }

    /// Replaces the cached value for `args`, inserting a fresh memo when
    /// none exists.
    pub fn upsert(&self, args: &A, value: V) {
        let (key, handles) = self.derive(args);
        let mut state = self.state.lock();
        if state.store.update(&key, value.clone()) {
            if !state.store.is_identity_linked(&key) {
                mirror_put(&mut state.backend, &self.stats, &key, &value);
            }
        } else {
            self.commit(&mut state, &key, &value, handles);
        }
    }
}

impl<A, V: Clone, E: Clone> Memoize<A, V, E> {
    /// Admits one fallible call: cache hit, join of an in-flight
    /// computation, or leadership of a new one.
    ///
    /// Exactly one caller per key executes `f`; concurrent callers with the
    /// same key block until it resolves and receive the same `Result`. `Ok`
    /// values are committed to the cache, `Err` values are propagated and
    /// never cached.
    pub fn try_call(&self, args: &A, f: impl FnOnce(&A) -> Result<V, E>) -> Result<V, E> {
        let (key, handles) = self.derive(args);
        let mut missed = false;
        loop {
            {
                let mut state = self.state.lock();
                if let Some(value) = state.store.get(&key) {
                    self.stats.record_hit();
                    return Ok(value);
                }
            }
            if !missed {
                self.stats.record_miss();
                missed = true;
            }

            match self.in_flight.join_or_create(&key, SyncTicket::new) {
                Flight::Waiter(ticket) => match ticket.wait() {
                    Some(result) => return result,
                    // Leader abandoned without resolving; race again.
                    None => continue,
                },
                Flight::Leader(ticket) => {
                    let _guard =
                        LeaderGuard::new(&self.in_flight, Arc::clone(&ticket), key.clone());
                    let generation = self.generation.load(Ordering::Acquire);
                    let result = f(args);
                    if let Ok(value) = &result {
                        let mut state = self.state.lock();
                        // A reset during the computation invalidates it.
                        if self.generation.load(Ordering::Acquire) == generation {
                            self.commit(&mut state, &key, value, handles.clone());
                        }
                    }
                    ticket.resolve(result.clone());
                    return result;
                }
            }
        }
    }
}

impl<A, V: Clone> Memoize<A, V, Infallible> {
    /// Admits one infallible call. See [`try_call`](Memoize::try_call) for
    /// the admission contract.
    pub fn call(&self, args: &A, f: impl FnOnce(&A) -> V) -> V {
        match self.try_call(args, |args| Ok(f(args))) {
            Ok(value) => value,
            Err(e) => match e {},
        }
    }
}

/// Binds a [`Memoize`] engine to one callable, so call sites need only the
/// arguments.
///
/// The wrapped callable may be a free function, a closure capturing a
/// receiver (a bound method), a constructor, or a computed-property
/// accessor; the engine treats them all as the underlying callable. The
/// engine stays reachable through [`engine`](Memoized::engine) for
/// administrative operations.
///
/// # Examples
///
/// ```
/// use memorate::{Memoize, Memoized};
///
/// let squared = Memoized::new(|n: &u32| n * n);
/// assert_eq!(squared.call(4), 16);
/// assert_eq!(squared.call(4), 16); // cached
/// assert_eq!(squared.engine().len(), 1);
///
/// squared.engine().reset();
/// assert_eq!(squared.engine().len(), 0);
/// ```
pub struct Memoized<A, V, F> {
    engine: Memoize<A, V>,
    f: F,
}

impl<A, V, F> Memoized<A, V, F>
where
    A: CacheableKey,
    V: Clone,
    F: Fn(&A) -> V,
{
    /// Wraps `f` with a default-configured engine.
    pub fn new(f: F) -> Self {
        Self::with_engine(Memoize::builder().build(), f)
    }
}

impl<A, V, F> Memoized<A, V, F>
where
    V: Clone,
    F: Fn(&A) -> V,
{
    /// Wraps `f` with a pre-configured engine.
    pub fn with_engine(engine: Memoize<A, V>, f: F) -> Self {
        Self { engine, f }
    }

    /// Calls through the memoization engine.
    pub fn call(&self, args: A) -> V {
        self.engine.call(&args, &self.f)
    }

    /// The engine behind this wrapper, for `reset`, `len`, and friends.
    pub fn engine(&self) -> &Memoize<A, V> {
        &self.engine
    }
}
