use alloc::{
    collections::{BTreeMap, BTreeSet},
    vec::Vec,
};
use core::{
    any::Any,
    cmp::Ordering,
    fmt::{self, Debug, Formatter},
    ops::Deref,
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
};

use crate::{
    any::TypeInfo,
    utils::thread_safety::{RcThreadSafety, SendSafety, SyncSafety},
};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_TUPLE_ID: AtomicU64 = AtomicU64::new(0);

/// Sort id of a scope key. Keys created earlier sort first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ScopeId(u64);

impl ScopeId {
    fn next() -> Self {
        Self(NEXT_SCOPE_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TupleId(u64);

impl TupleId {
    fn next() -> Self {
        Self(NEXT_TUPLE_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

/// Value carried by a scope tuple.
///
/// Values are compared with [`Ord`], so primitives and strings compare by value.
/// Wrap a shared pointer in [`ByRef`] to compare by reference identity instead.
pub trait ScopeValue: Ord + Clone + Debug + SendSafety + SyncSafety + 'static {}

impl<T> ScopeValue for T where T: Ord + Clone + Debug + SendSafety + SyncSafety + 'static {}

pub(crate) trait DynScopeValue: Debug + SendSafety + SyncSafety {
    fn as_any(&self) -> &dyn Any;

    fn type_info(&self) -> TypeInfo;

    fn dyn_cmp(&self, other: &dyn DynScopeValue) -> Ordering;
}

impl<T: ScopeValue> DynScopeValue for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }

    #[inline]
    fn type_info(&self) -> TypeInfo {
        TypeInfo::of::<T>()
    }

    fn dyn_cmp(&self, other: &dyn DynScopeValue) -> Ordering {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self.cmp(other),
            None => self.type_info().cmp(&other.type_info()),
        }
    }
}

#[derive(Clone)]
pub(crate) struct AnyScopeValue(RcThreadSafety<dyn DynScopeValue>);

impl AnyScopeValue {
    #[inline]
    #[must_use]
    pub(crate) fn new<T: ScopeValue>(value: T) -> Self {
        Self(RcThreadSafety::new(value))
    }

    #[inline]
    #[must_use]
    pub(crate) fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref()
    }

    #[inline]
    #[must_use]
    pub(crate) fn type_info(&self) -> TypeInfo {
        self.0.type_info()
    }
}

impl PartialEq for AnyScopeValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AnyScopeValue {}

impl PartialOrd for AnyScopeValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AnyScopeValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.dyn_cmp(&*other.0)
    }
}

impl Debug for AnyScopeValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

struct ScopeKeyInner {
    id: ScopeId,
    name: &'static str,
    default: AnyScopeValue,
}

/// Type-erased scope key, compared by identity.
#[derive(Clone)]
pub struct AnyScopeKey {
    inner: RcThreadSafety<ScopeKeyInner>,
}

impl AnyScopeKey {
    #[must_use]
    pub(crate) fn new(name: &'static str, default: AnyScopeValue) -> Self {
        Self {
            inner: RcThreadSafety::new(ScopeKeyInner {
                id: ScopeId::next(),
                name,
                default,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    #[inline]
    #[must_use]
    pub(crate) fn id(&self) -> ScopeId {
        self.inner.id
    }

    #[inline]
    #[must_use]
    pub(crate) fn default_tuple(&self) -> ScopeTuple {
        ScopeTuple::new(self.clone(), self.inner.default.clone())
    }
}

impl PartialEq for AnyScopeKey {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for AnyScopeKey {}

impl Debug for AnyScopeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyScopeKey")
            .field("name", &self.inner.name)
            .field("default", &self.inner.default)
            .finish()
    }
}

/// Token parameterizing molecule instances.
///
/// Two keys are never equal unless one is a clone of the other,
/// even when they share a name and a default value.
pub struct ScopeKey<T> {
    erased: AnyScopeKey,
    default: T,
}

impl<T: ScopeValue> ScopeKey<T> {
    #[must_use]
    pub fn new(name: &'static str, default: T) -> Self {
        Self {
            erased: AnyScopeKey::new(name, AnyScopeValue::new(default.clone())),
            default,
        }
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.erased.name()
    }

    #[inline]
    #[must_use]
    pub fn default_value(&self) -> &T {
        &self.default
    }

    #[inline]
    #[must_use]
    pub fn tuple(&self, value: T) -> ScopeTuple {
        ScopeTuple::new(self.erased.clone(), AnyScopeValue::new(value))
    }

    #[inline]
    #[must_use]
    pub fn default_tuple(&self) -> ScopeTuple {
        self.erased.default_tuple()
    }

    #[inline]
    #[must_use]
    pub fn as_any_scope_key(&self) -> &AnyScopeKey {
        &self.erased
    }
}

impl<T: Clone> Clone for ScopeKey<T> {
    fn clone(&self) -> Self {
        Self {
            erased: self.erased.clone(),
            default: self.default.clone(),
        }
    }
}

impl<T: Debug> Debug for ScopeKey<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeKey")
            .field("name", &self.erased.name())
            .field("default", &self.default)
            .finish()
    }
}

struct ScopeTupleInner {
    id: TupleId,
    key: AnyScopeKey,
    value: AnyScopeValue,
}

/// A `(scope key, value)` pair.
///
/// Tuples handed out by a subscription are canonical: while a lease is held,
/// every subscription asking for an equal pair gets the same tuple back,
/// which [`ScopeTuple::ptr_eq`] observes.
#[derive(Clone)]
pub struct ScopeTuple {
    inner: RcThreadSafety<ScopeTupleInner>,
}

impl ScopeTuple {
    #[must_use]
    pub(crate) fn new(key: AnyScopeKey, value: AnyScopeValue) -> Self {
        Self {
            inner: RcThreadSafety::new(ScopeTupleInner {
                id: TupleId::next(),
                key,
                value,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub(crate) fn id(&self) -> TupleId {
        self.inner.id
    }

    #[inline]
    #[must_use]
    pub(crate) fn key(&self) -> &AnyScopeKey {
        &self.inner.key
    }

    #[inline]
    #[must_use]
    pub(crate) fn scope_id(&self) -> ScopeId {
        self.inner.key.id()
    }

    #[inline]
    #[must_use]
    pub(crate) fn any_value(&self) -> &AnyScopeValue {
        &self.inner.value
    }

    #[inline]
    #[must_use]
    pub fn key_name(&self) -> &'static str {
        self.inner.key.name()
    }

    /// Returns the value if this tuple belongs to `key`.
    #[must_use]
    pub fn value<T: ScopeValue>(&self, key: &ScopeKey<T>) -> Option<&T> {
        if self.inner.key != key.erased {
            return None;
        }
        self.inner.value.downcast_ref()
    }

    #[inline]
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.inner.value == self.inner.key.inner.default
    }

    /// Same key and equal value, regardless of which tuple instance carries them.
    #[inline]
    #[must_use]
    pub fn is_same_scope(&self, other: &Self) -> bool {
        self.inner.key == other.inner.key && self.inner.value == other.inner.value
    }

    #[inline]
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        RcThreadSafety::ptr_eq(&this.inner, &other.inner)
    }
}

impl Debug for ScopeTuple {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ScopeTuple")
            .field(&self.inner.key.name())
            .field(&self.inner.value)
            .finish()
    }
}

/// Scope value compared by the address of the shared pointer it holds.
pub struct ByRef<T: ?Sized>(pub RcThreadSafety<T>);

impl<T: ?Sized> ByRef<T> {
    #[inline]
    fn addr(&self) -> usize {
        RcThreadSafety::as_ptr(&self.0).cast::<u8>() as usize
    }
}

impl<T: ?Sized> Clone for ByRef<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: ?Sized> PartialEq for ByRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl<T: ?Sized> Eq for ByRef<T> {}

impl<T: ?Sized> PartialOrd for ByRef<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ?Sized> Ord for ByRef<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr().cmp(&other.addr())
    }
}

impl<T: ?Sized> Debug for ByRef<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ByRef({:#x})", self.addr())
    }
}

impl<T: ?Sized> Deref for ByRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// Sorts tuples by scope id, keeping the last tuple supplied for each key.
#[must_use]
pub(crate) fn normalize(tuples: &[ScopeTuple]) -> Vec<ScopeTuple> {
    let mut by_scope = BTreeMap::new();
    for tuple in tuples {
        by_scope.insert(tuple.scope_id(), tuple.clone());
    }
    by_scope.into_values().collect()
}

/// Non-default tuples whose key is in `signature`, in scope id order.
///
/// `tuples` must be normalized.
#[must_use]
pub(crate) fn relevant(tuples: &[ScopeTuple], signature: &BTreeSet<ScopeId>) -> Vec<ScopeTuple> {
    tuples
        .iter()
        .filter(|tuple| signature.contains(&tuple.scope_id()) && !tuple.is_default())
        .cloned()
        .collect()
}
