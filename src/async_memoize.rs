use crate::in_flight::{AsyncTicket, Flight, InFlightRegistry, LeaderGuard};
use crate::keys::{CacheableKey, RawKey};
use crate::lifetime::IdentityHandle;
use crate::persistence::{mirror_clear, mirror_del, mirror_put, JsonlMirror, PersistBackend};
use crate::stats::MemoStats;
use crate::store::CacheStore;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Key derivation for the async engine: either an ordinary closure or one
/// producing key parts that must be awaited before lookup.
enum KeygenKind<A> {
    Sync(Box<dyn Fn(&A) -> RawKey + Send + Sync>),
    Async(Box<dyn for<'a> Fn(&'a A) -> BoxFuture<'a, RawKey> + Send + Sync>),
}

struct EngineState<V> {
    store: CacheStore<V>,
    backend: Option<Box<dyn PersistBackend<V>>>,
}

/// Configures and builds an [`AsyncMemoize`] engine.
///
/// Carries the same options as [`MemoizeBuilder`](crate::MemoizeBuilder)
/// plus [`keygen_async`](AsyncMemoizeBuilder::keygen_async) for keys with
/// awaitable sub-parts. An async key part only exists here: the sync
/// builder cannot express one, which is what makes "async key part in a
/// synchronous call" unrepresentable.
pub struct AsyncMemoizeBuilder<A, V, E = Infallible> {
    limit: Option<NonZeroUsize>,
    ttl: Option<Duration>,
    keygen: Option<KeygenKind<A>>,
    backend: Option<Box<dyn PersistBackend<V>>>,
    _errors: std::marker::PhantomData<fn() -> E>,
}

impl<A, V, E> Default for AsyncMemoizeBuilder<A, V, E> {
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

impl<A, V, E> AsyncMemoizeBuilder<A, V, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the store at `size` entries. Must be positive.
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

    /// Replaces the default key derivation with a synchronous closure.
    pub fn keygen(mut self, keygen: impl Fn(&A) -> RawKey + Send + Sync + 'static) -> Self {
        self.keygen = Some(KeygenKind::Sync(Box::new(keygen)));
        self
    }

    /// Replaces the default key derivation with one whose key parts are
    /// resolved asynchronously; the produced future is awaited before the
    /// cache lookup.
    pub fn keygen_async(
        mut self,
        keygen: impl for<'a> Fn(&'a A) -> BoxFuture<'a, RawKey> + Send + Sync + 'static,
    ) -> Self {
        self.keygen = Some(KeygenKind::Async(Box::new(keygen)));
        self
    }

    /// Mirrors committed entries to the JSON-lines file at `path`; see
    /// [`MemoizeBuilder::persistent`](crate::MemoizeBuilder::persistent).
    pub fn persistent(mut self, path: impl Into<PathBuf>) -> Self
    where
        V: Serialize + DeserializeOwned + Send + 'static,
    {
        self.backend = Some(Box::new(JsonlMirror::new(path)));
        self
    }
}

impl<A, V: Clone, E> AsyncMemoizeBuilder<A, V, E> {
    /// Builds an engine using the default key derivation, or the configured
    /// keygen if one was set.
    pub fn build(self) -> AsyncMemoize<A, V, E>
    where
        A: CacheableKey,
    {
        let keygen = self
            .keygen
            .unwrap_or_else(|| KeygenKind::Sync(Box::new(|args: &A| args.raw_key())));
        AsyncMemoize::from_parts(self.limit, self.ttl, keygen, self.backend)
    }

    /// Builds an engine whose arguments need no [`CacheableKey`]
    /// implementation because a keygen was supplied.
    ///
    /// # Panics
    ///
    /// Panics if no keygen was configured.
    pub fn build_keyed(self) -> AsyncMemoize<A, V, E> {
        let keygen = self.keygen.expect("build_keyed requires a keygen");
        AsyncMemoize::from_parts(self.limit, self.ttl, keygen, self.backend)
    }
}

/// The task-suspending memoization engine.
///
/// Same admission contract as [`Memoize`](crate::Memoize) — key derivation,
/// cache lookup, single-flight join, leader computation — but every wait is
/// a suspension point instead of a blocked thread: waiting on another
/// task's in-flight computation yields to the scheduler, and key parts may
/// themselves be awaited.
///
/// Cache and registry operations never suspend; they take short
/// `parking_lot` locks, so many tasks on one thread or many threads in
/// parallel are both safe.
///
/// Cancellation: a caller dropped while waiting on an in-flight ticket just
/// leaves the waiter set. A *leader* dropped mid-computation abandons its
/// ticket, and the remaining waiters race to become the new leader, so no
/// waiter hangs on a computation nobody is running.
///
/// # Examples
///
/// ```
/// use memorate::AsyncMemoize;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let memo: AsyncMemoize<u64, u64> = AsyncMemoize::builder().build();
/// let value = memo.call(&21, |n| async move { n * 2 }).await;
/// assert_eq!(value, 42);
/// // Ten concurrent identical calls would execute the body once; the
/// // other nine suspend until the result is shared.
/// # }
/// ```
pub struct AsyncMemoize<A, V, E = Infallible> {
    state: Mutex<EngineState<V>>,
    in_flight: InFlightRegistry<AsyncTicket<V, E>>,
    keygen: KeygenKind<A>,
    stats: MemoStats,
    generation: AtomicU64,
}

impl<A, V: Clone, E> AsyncMemoize<A, V, E> {
    /// Starts configuring an engine.
    pub fn builder() -> AsyncMemoizeBuilder<A, V, E> {
        AsyncMemoizeBuilder::new()
    }

    fn from_parts(
        limit: Option<NonZeroUsize>,
        ttl: Option<Duration>,
        keygen: KeygenKind<A>,
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

    async fn derive(&self, args: &A) -> (String, Vec<IdentityHandle>) {
        match &self.keygen {
            KeygenKind::Sync(keygen) => keygen(args).finish(),
            KeygenKind::Async(keygen) => keygen(args).await.finish(),
        }
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
    /// persistence mirror. In-flight computations resolve for their waiters
    /// but are no longer committed.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut state = self.state.lock();
        state.store.reset();
        mirror_clear(&mut state.backend, &self.stats);
    }

    /// Current number of committed entries.
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
    pub async fn remove(&self, args: &A) -> bool {
        let (key, _) = self.derive(args).await;
        let mut state = self.state.lock();
        let removed = state.store.remove(&key);
        if removed {
            mirror_del(&mut state.backend, &self.stats, &key);
        }
        removed
    }

    /// Replaces the cached value for `args` only if a live memo exists.
    pub async fn update(&self, args: &A, value: V) -> bool {
        let (key, _) = self.derive(args).await;
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
    pub async fn upsert(&self, args: &A, value: V) {
        let (key, handles) = self.derive(args).await;
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

impl<A, V: Clone, E: Clone> AsyncMemoize<A, V, E> {
    /// Admits one fallible call; see
    /// [`Memoize::try_call`](crate::Memoize::try_call) for the contract.
    /// All waits suspend the task instead of blocking the thread.
    pub async fn try_call<'a, F, Fut>(&self, args: &'a A, f: F) -> Result<V, E>
    where
        F: FnOnce(&'a A) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let (key, handles) = self.derive(args).await;
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

            match self.in_flight.join_or_create(&key, AsyncTicket::new) {
                Flight::Waiter(ticket) => match ticket.wait().await {
                    Some(result) => return result,
                    // Leader abandoned without resolving; race again.
                    None => continue,
                },
                Flight::Leader(ticket) => {
                    let _guard =
                        LeaderGuard::new(&self.in_flight, Arc::clone(&ticket), key.clone());
                    let generation = self.generation.load(Ordering::Acquire);
                    let result = f(args).await;
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

impl<A, V: Clone> AsyncMemoize<A, V, Infallible> {
    /// Admits one infallible call; see [`try_call`](AsyncMemoize::try_call).
    pub async fn call<'a, F, Fut>(&self, args: &'a A, f: F) -> V
    where
        F: FnOnce(&'a A) -> Fut,
        Fut: Future<Output = V>,
    {
        let result = self
            .try_call(args, move |args| async move { Ok::<V, Infallible>(f(args).await) })
            .await;
        match result {
            Ok(value) => value,
            Err(e) => match e {},
        }
    }
}

/// Binds an [`AsyncMemoize`] engine to one async callable.
///
/// The callable returns a boxed future borrowing the arguments; build one
/// with [`FutureExt::boxed`](futures::FutureExt).
///
/// # Examples
///
/// ```
/// use futures::FutureExt;
/// use memorate::AsyncMemoized;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let fetch = AsyncMemoized::new(|id: &u64| {
///     let id = *id;
///     async move { format!("user-{id}") }.boxed()
/// });
/// assert_eq!(fetch.call(3).await, "user-3");
/// assert_eq!(fetch.engine().len(), 1);
/// # }
/// ```
pub struct AsyncMemoized<A, V, F> {
    engine: AsyncMemoize<A, V>,
    f: F,
}

impl<A, V, F> AsyncMemoized<A, V, F>
where
    A: CacheableKey,
    V: Clone,
    F: for<'a> Fn(&'a A) -> BoxFuture<'a, V>,
{
    /// Wraps `f` with a default-configured engine.
    pub fn new(f: F) -> Self {
        Self::with_engine(AsyncMemoize::builder().build(), f)
    }
}

impl<A, V, F> AsyncMemoized<A, V, F>
where
    V: Clone,
    F: for<'a> Fn(&'a A) -> BoxFuture<'a, V>,
{
    /// Wraps `f` with a pre-configured engine.
    pub fn with_engine(engine: AsyncMemoize<A, V>, f: F) -> Self {
        Self { engine, f }
    }

    /// Calls through the memoization engine.
    pub async fn call(&self, args: A) -> V {
        self.engine.call(&args, &self.f).await
    }

    /// The engine behind this wrapper.
    pub fn engine(&self) -> &AsyncMemoize<A, V> {
        &self.engine
    }
}
