use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// A weak, non-owning liveness probe for one identity-hashed argument.
///
/// An `Identity`-keyed argument hashes by allocation address. Once the
/// underlying `Arc` is dropped that address can never be reproduced, so any
/// cache entry whose key was partly derived from it is unreachable forever.
/// The handle lets the cache detect that moment: `is_alive` reports whether
/// the tracked allocation still has strong references.
///
/// The handle never extends the argument's lifetime; it holds only a
/// [`Weak`] reference behind a type-erased probe.
pub struct IdentityHandle {
    addr: usize,
    probe: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl IdentityHandle {
    /// Builds a handle observing `target` without keeping it alive.
    pub fn of<T: Send + Sync + 'static>(target: &Arc<T>) -> Self {
        let weak: Weak<T> = Arc::downgrade(target);
        Self {
            addr: Arc::as_ptr(target) as usize,
            probe: Arc::new(move || weak.strong_count() > 0),
        }
    }

    /// The allocation address used as the identity-based key part.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Whether the tracked allocation is still reachable.
    pub fn is_alive(&self) -> bool {
        (self.probe)()
    }
}

impl Clone for IdentityHandle {
    fn clone(&self) -> Self {
        Self {
            addr: self.addr,
            probe: Arc::clone(&self.probe),
        }
    }
}

impl fmt::Debug for IdentityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityHandle")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Binds cache entries to the reachability of their identity-hashed arguments.
///
/// For every entry whose key involved at least one [`IdentityHandle`], the
/// tracker remembers the handles. An entry is live only while *all* of its
/// linked allocations still exist; as soon as any one is dropped the entry is
/// reported dead and the store purges it.
///
/// There is no drop-hook mechanism to fire eagerly when an argument goes
/// away, so liveness is checked lazily on every lookup and dead keys are
/// swept opportunistically on insertion. Observable behavior is the same: a
/// lookup never returns an entry whose identity links are gone.
#[derive(Debug, Default)]
pub(crate) struct LifetimeTracker {
    links: HashMap<String, Vec<IdentityHandle>>,
}

impl LifetimeTracker {
    /// Registers `handles` as the identity links of `key`. Empty handle sets
    /// are not tracked; such entries live by size/time bounds alone.
    pub(crate) fn bind(&mut self, key: &str, handles: Vec<IdentityHandle>) {
        if !handles.is_empty() {
            self.links.insert(key.to_string(), handles);
        }
    }

    /// Whether `key` is identity-linked at all.
    pub(crate) fn is_linked(&self, key: &str) -> bool {
        self.links.contains_key(key)
    }

    /// True when `key` has no links or every linked allocation is alive.
    pub(crate) fn is_live(&self, key: &str) -> bool {
        match self.links.get(key) {
            None => true,
            Some(handles) => handles.iter().all(IdentityHandle::is_alive),
        }
    }

    /// Drops the links for `key`, if any.
    pub(crate) fn unbind(&mut self, key: &str) {
        self.links.remove(key);
    }

    /// Keys with at least one dead link, ready to be purged.
    pub(crate) fn dead_keys(&self) -> Vec<String> {
        self.links
            .iter()
            .filter(|(_, handles)| handles.iter().any(|h| !h.is_alive()))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.links.clear();
    }
}
