use crate::lifetime::IdentityHandle;
use std::fmt::Debug;
use std::fmt::Write as _;
use std::sync::Arc;

/// Separator between encoded key parts. String parts are pushed through
/// `Debug` formatting, which escapes control characters, so the separator
/// cannot be forged from inside a part.
const PART_SEPARATOR: char = '\u{1f}';

/// An intermediate cache key under construction: the ordered encoded parts
/// of a call's arguments plus any identity handles those arguments
/// contributed.
///
/// A `RawKey` is produced once per call, either by the argument tuple's
/// [`CacheableKey`] implementation or by a user-supplied keygen, and then
/// collapsed into the final opaque `String` key. Identity handles travel
/// alongside the parts so the engine can bind the resulting entry's lifetime
/// to the tracked allocations.
///
/// # Examples
///
/// ```
/// use memorate::{CacheableKey, RawKey};
///
/// let mut key = RawKey::new();
/// key.push_part("user");
/// 42u64.append_to(&mut key);
/// assert_eq!(key.parts().len(), 2);
/// ```
#[derive(Debug, Default, Clone)]
pub struct RawKey {
    parts: Vec<String>,
    handles: Vec<IdentityHandle>,
}

impl RawKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one already-encoded part.
    pub fn push_part(&mut self, part: impl Into<String>) {
        self.parts.push(part.into());
    }

    /// Appends an identity handle contributed by an identity-hashed argument.
    pub fn push_handle(&mut self, handle: IdentityHandle) {
        self.handles.push(handle);
    }

    /// The encoded parts accumulated so far.
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Whether any part of this key is identity-based. Identity-keyed
    /// entries are never persisted: the addresses cannot be reproduced in a
    /// later process.
    pub fn has_identity(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Collapses the key into its final string form plus the handles that
    /// bind the entry's lifetime.
    pub(crate) fn finish(self) -> (String, Vec<IdentityHandle>) {
        let mut out = String::new();
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                out.push(PART_SEPARATOR);
            }
            out.push_str(part);
        }
        (out, self.handles)
    }
}

/// Derives cache key parts from a call argument.
///
/// The default key derivation treats the wrapped callable's argument tuple
/// as the canonical call shape: each element appends its encoded parts in
/// order, and two calls a user considers equivalent produce equal keys
/// because they are the same tuple. Supplying a keygen to the engine builder
/// replaces this derivation entirely (for example to omit a receiver from
/// the key, or to normalize defaulted arguments).
///
/// Implementations exist for integers, `bool`, `char`, strings, `Option`,
/// `Vec`, slices, references, and tuples up to arity 8. Anything else can be
/// keyed through [`DefaultCacheableKey`] (`Debug`-based) or [`Identity`]
/// (address-based).
pub trait CacheableKey {
    /// Appends this value's encoded parts (and identity handles, if any) to
    /// the key under construction.
    fn append_to(&self, key: &mut RawKey);

    /// Derives a complete key from this value alone.
    fn raw_key(&self) -> RawKey {
        let mut key = RawKey::new();
        self.append_to(&mut key);
        key
    }
}

/// Keys any `Debug` type by its debug representation.
///
/// Escape hatch for argument types without a [`CacheableKey`]
/// implementation. The debug string must be stable for values the caller
/// considers equal; derived `Debug` on value types satisfies that.
///
/// # Examples
///
/// ```
/// use memorate::{CacheableKey, DefaultCacheableKey};
///
/// #[derive(Debug)]
/// struct Params { depth: u8 }
///
/// let key = DefaultCacheableKey(Params { depth: 3 }).raw_key();
/// assert_eq!(key.parts(), ["Params { depth: 3 }"]);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DefaultCacheableKey<T>(pub T);

impl<T: Debug> CacheableKey for DefaultCacheableKey<T> {
    fn append_to(&self, key: &mut RawKey) {
        key.push_part(format!("{:?}", self.0));
    }
}

/// Keys a shared allocation by its address, binding dependent cache entries
/// to the allocation's lifetime.
///
/// This is the explicit form of an identity-based hash: two distinct
/// allocations are never equal, even with identical contents, and once the
/// allocation is dropped the key can never be produced again. Entries keyed
/// through an `Identity` argument are purged as soon as the tracked `Arc`
/// loses its last strong reference, independent of size and time bounds, and
/// are excluded from persistence.
///
/// # Examples
///
/// ```
/// use memorate::{Identity, Memoize};
/// use std::sync::Arc;
///
/// struct Session;
///
/// let memo: Memoize<Identity<Session>, u32> = Memoize::builder().build();
/// let session = Arc::new(Session);
/// memo.call(&Identity::of(&session), |_| 7);
/// assert_eq!(memo.len(), 1);
///
/// drop(session);
/// // The dropped allocation's entry is purged on the next lookup or
/// // insertion; no future call can ever derive its key again.
/// ```
#[derive(Debug)]
pub struct Identity<T>(pub Arc<T>);

impl<T> Identity<T> {
    /// Wraps a clone of `target` for identity-based keying.
    pub fn of(target: &Arc<T>) -> Self {
        Self(Arc::clone(target))
    }
}

impl<T> Clone for Identity<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Send + Sync + 'static> CacheableKey for Identity<T> {
    fn append_to(&self, key: &mut RawKey) {
        let handle = IdentityHandle::of(&self.0);
        let mut part = String::new();
        let _ = write!(part, "@{:#x}", handle.addr());
        key.push_part(part);
        key.push_handle(handle);
    }
}

macro_rules! impl_cacheable_key_display {
    ($($ty:ty),* $(,)?) => {
        $(
            impl CacheableKey for $ty {
                fn append_to(&self, key: &mut RawKey) {
                    key.push_part(self.to_string());
                }
            }
        )*
    };
}

impl_cacheable_key_display!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

impl CacheableKey for bool {
    fn append_to(&self, key: &mut RawKey) {
        key.push_part(if *self { "true" } else { "false" });
    }
}

impl CacheableKey for char {
    fn append_to(&self, key: &mut RawKey) {
        key.push_part(format!("{self:?}"));
    }
}

// Strings are Debug-escaped so embedded separators cannot collide with the
// part boundary.
impl CacheableKey for str {
    fn append_to(&self, key: &mut RawKey) {
        key.push_part(format!("{self:?}"));
    }
}

impl CacheableKey for String {
    fn append_to(&self, key: &mut RawKey) {
        self.as_str().append_to(key);
    }
}

impl<T: CacheableKey + ?Sized> CacheableKey for &T {
    fn append_to(&self, key: &mut RawKey) {
        (**self).append_to(key);
    }
}

impl<T: CacheableKey> CacheableKey for Option<T> {
    fn append_to(&self, key: &mut RawKey) {
        match self {
            None => key.push_part("None"),
            Some(inner) => {
                key.push_part("Some(");
                inner.append_to(key);
                key.push_part(")");
            }
        }
    }
}

impl<T: CacheableKey> CacheableKey for [T] {
    fn append_to(&self, key: &mut RawKey) {
        key.push_part("[");
        for item in self {
            item.append_to(key);
        }
        key.push_part("]");
    }
}

impl<T: CacheableKey> CacheableKey for Vec<T> {
    fn append_to(&self, key: &mut RawKey) {
        self.as_slice().append_to(key);
    }
}

impl CacheableKey for () {
    fn append_to(&self, key: &mut RawKey) {
        key.push_part("()");
    }
}

// Tuples group their elements so nesting stays unambiguous: (1, (2, 3)) and
// ((1, 2), 3) derive different keys.
macro_rules! impl_cacheable_key_tuple {
    ($($name:ident),+) => {
        impl<$($name: CacheableKey),+> CacheableKey for ($($name,)+) {
            fn append_to(&self, key: &mut RawKey) {
                #[allow(non_snake_case)]
                let ($($name,)+) = self;
                key.push_part("(");
                $($name.append_to(key);)+
                key.push_part(")");
            }
        }
    };
}

impl_cacheable_key_tuple!(A);
impl_cacheable_key_tuple!(A, B);
impl_cacheable_key_tuple!(A, B, C);
impl_cacheable_key_tuple!(A, B, C, D);
impl_cacheable_key_tuple!(A, B, C, D, E);
impl_cacheable_key_tuple!(A, B, C, D, E, F);
impl_cacheable_key_tuple!(A, B, C, D, E, F, G);
impl_cacheable_key_tuple!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use super::*;

    fn key_of(value: &impl CacheableKey) -> String {
        value.raw_key().finish().0
    }

    #[test]
    fn equal_values_derive_equal_keys() {
        assert_eq!(key_of(&(1u32, "a")), key_of(&(1u32, "a")));
        assert_ne!(key_of(&(1u32, "a")), key_of(&(2u32, "a")));
    }

    #[test]
    fn nested_tuples_do_not_collide() {
        assert_ne!(key_of(&(1u8, (2u8, 3u8))), key_of(&((1u8, 2u8), 3u8)));
        assert_ne!(key_of(&(1u8, 2u8, 3u8)), key_of(&((1u8, 2u8), 3u8)));
    }

    #[test]
    fn strings_with_separators_do_not_collide() {
        let joined = format!("a{}b", '\u{1f}');
        assert_ne!(key_of(&(joined.as_str(),)), key_of(&("a", "b")));
    }

    #[test]
    fn option_and_vec_encode_structure() {
        assert_ne!(key_of(&Some(1u8)), key_of(&1u8));
        assert_ne!(key_of(&vec![1u8, 2]), key_of(&vec![12u8]));
    }

    #[test]
    fn identity_contributes_a_handle() {
        let target = Arc::new(5u8);
        let raw = Identity::of(&target).raw_key();
        assert!(raw.has_identity());
        let (key, handles) = raw.finish();
        assert!(key.starts_with('@'));
        assert_eq!(handles.len(), 1);
        assert!(handles[0].is_alive());
    }

    #[test]
    fn distinct_allocations_derive_distinct_keys() {
        let a = Arc::new(7u8);
        let b = Arc::new(7u8);
        assert_ne!(key_of(&Identity::of(&a)), key_of(&Identity::of(&b)));
    }

    #[test]
    fn default_cacheable_key_uses_debug() {
        #[derive(Debug)]
        struct Point {
            x: i32,
        }
        let key = key_of(&DefaultCacheableKey(Point { x: 3 }));
        assert!(key.contains("x: 3"));
    }
}
