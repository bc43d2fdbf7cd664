//! # Memorate
//!
//! A thread-safe memoization and rate-limiting library for Rust, with
//! matching blocking and async engines.
//!
//! ## Features
//!
//! - **Memoization**: cache a callable's results by a key derived from its
//!   arguments; identical calls return the cached value without re-running
//! - **Bounded caches**: optional LRU size limit and per-entry time-to-live
//! - **Single-flight**: concurrent identical calls share one execution;
//!   every caller gets the same result
//! - **Identity-aware keys**: entries keyed on an [`Identity`] argument are
//!   evicted once that allocation is dropped
//! - **Persistence**: optionally mirror cached entries to a JSON-lines file
//!   so they survive a restart
//! - **Rate limiting**: bound concurrency and, with a window, the number of
//!   calls started per sliding time span
//! - **Sync and async**: every engine comes in a thread-blocking and a
//!   task-suspending ([`tokio`]-based) rendition with the same semantics
//!
//! ## Quick Start
//!
//! Memoize a closure over its arguments:
//!
//! ```rust
//! use memorate::Memoized;
//!
//! let memo = memorate::Memoize::<u32, u64>::builder().build();
//! fn slow_square(n: &u32) -> u64 {
//!     u64::from(n * n)
//! }
//!
//! // First call computes, second is served from the cache.
//! assert_eq!(memo.call(&12, slow_square), 144);
//! assert_eq!(memo.call(&12, slow_square), 144);
//! assert_eq!(memo.stats().hits(), 1);
//!
//! // Or bind the engine to one callable up front.
//! let square = Memoized::new(|n: &u32| u64::from(n * n));
//! assert_eq!(square.call(12), 144);
//! ```
//!
//! Bound the cache and add an expiry:
//!
//! ```rust
//! use memorate::Memoize;
//! use std::time::Duration;
//!
//! let memo: Memoize<String, usize> = Memoize::builder()
//!     .size(1000)
//!     .duration(Duration::from_secs(60))
//!     .build();
//! let len = memo.call(&"hello".to_string(), |s| s.len());
//! assert_eq!(len, 5);
//! ```
//!
//! Rate-limit concurrent work:
//!
//! ```rust
//! use memorate::RateLimit;
//! use std::time::Duration;
//!
//! // At most 4 concurrent calls, at most 4 started per second.
//! let limit = RateLimit::windowed(4, Duration::from_secs(1));
//! let value = limit.call(|| expensive());
//! assert_eq!(value, 7);
//! # fn expensive() -> u32 { 7 }
//! ```
//!
//! ## Module Organization
//!
//! - [`Memoize`] / [`AsyncMemoize`] - the memoization engines and builders
//! - [`Memoized`] / [`AsyncMemoized`] - wrappers binding an engine to one
//!   callable
//! - [`RateLimit`] / [`AsyncRateLimit`] - the rate limiters and their RAII
//!   guards
//! - [`CacheableKey`] - key derivation for argument types, plus [`Identity`]
//!   for pointer-identity keys
//! - [`MemoStats`] - hit/miss/persistence counters per engine

mod async_memoize;
mod async_rate;
mod cache_entry;
mod error;
mod eviction;
mod in_flight;
mod keys;
mod lifetime;
mod memoize;
mod persistence;
mod rate;
mod stats;
mod store;

pub use async_memoize::{AsyncMemoize, AsyncMemoizeBuilder, AsyncMemoized};
pub use async_rate::{AsyncRateGuard, AsyncRateLimit};
pub use cache_entry::CacheEntry;
pub use error::{AdmissionTimeout, PersistError};
pub use keys::{CacheableKey, DefaultCacheableKey, Identity, RawKey};
pub use lifetime::IdentityHandle;
pub use memoize::{Keygen, Memoize, MemoizeBuilder, Memoized};
pub use rate::{RateGuard, RateLimit};
pub use stats::MemoStats;
