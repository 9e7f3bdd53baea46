use alloc::{
    collections::{BTreeMap, BTreeSet},
    vec::Vec,
};
use core::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::{
    errors::LifecycleErrorKind,
    lifecycle::{Cleanup, CleanupId},
    scope::{AnyScopeValue, ScopeId, ScopeTuple},
    utils::thread_safety::RcThreadSafety,
};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct ScopeEntry {
    tuple: ScopeTuple,
    subscribers: BTreeSet<SubscriptionId>,
    cleanups: Vec<(u64, Cleanup)>,
}

#[derive(Default)]
struct ScoperInner {
    scopes: BTreeMap<ScopeId, BTreeMap<AnyScopeValue, ScopeEntry>>,
    subscriptions: BTreeMap<SubscriptionId, Vec<ScopeTuple>>,
    /// Canonical tuples each pending cleanup is attached to.
    registrations: BTreeMap<CleanupId, Vec<ScopeTuple>>,
    next_registration: u64,
}

impl ScoperInner {
    /// Detaches `released` cleanups from the entries that are still leased.
    fn forget_cleanups(&mut self, released: &[(u64, Cleanup)]) {
        for (_, cleanup) in released {
            let Some(tuples) = self.registrations.remove(&cleanup.id()) else {
                continue;
            };
            for tuple in tuples {
                if let Some(entry) = self
                    .scopes
                    .get_mut(&tuple.scope_id())
                    .and_then(|values| values.get_mut(tuple.any_value()))
                {
                    entry.cleanups.retain(|(_, pending)| pending.id() != cleanup.id());
                }
            }
        }
    }
}

/// Reference counts scope tuples across subscriptions.
///
/// An entry lives exactly as long as at least one subscription leases it.
/// There is no grace period: once the last lease is released the entry is
/// evicted, its cleanups run, and the next lease gets a new canonical tuple.
#[derive(Default)]
pub(crate) struct Scoper {
    inner: Mutex<ScoperInner>,
}

impl Scoper {
    #[inline]
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical tuple for the key and value of `tuple`, leased by `subscription`.
    pub(crate) fn lease_scope(&self, tuple: &ScopeTuple, subscription: SubscriptionId) -> ScopeTuple {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let entry = inner
            .scopes
            .entry(tuple.scope_id())
            .or_default()
            .entry(tuple.any_value().clone())
            .or_insert_with(|| {
                trace!(scope = tuple.key_name(), value = ?tuple.any_value(), "Canonical tuple created");
                ScopeEntry {
                    tuple: ScopeTuple::new(tuple.key().clone(), tuple.any_value().clone()),
                    subscribers: BTreeSet::new(),
                    cleanups: Vec::new(),
                }
            });

        if entry.subscribers.insert(subscription) {
            inner.subscriptions.entry(subscription).or_default().push(entry.tuple.clone());
        }
        entry.tuple.clone()
    }

    /// Releases every tuple leased by `subscription`, running the cleanups of tuples nobody else leases.
    pub(crate) fn unlease_scope(&self, subscription: SubscriptionId) {
        let mut released = Vec::new();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let Some(tuples) = inner.subscriptions.remove(&subscription) else {
                return;
            };
            for tuple in tuples {
                let Some(values) = inner.scopes.get_mut(&tuple.scope_id()) else {
                    continue;
                };

                let is_unused = match values.get_mut(tuple.any_value()) {
                    Some(entry) => {
                        entry.subscribers.remove(&subscription);
                        entry.subscribers.is_empty()
                    }
                    None => false,
                };
                if is_unused {
                    if let Some(entry) = values.remove(tuple.any_value()) {
                        debug!(scope = tuple.key_name(), cleanups = entry.cleanups.len(), "Last lease released");
                        released.extend(entry.cleanups);
                    }
                }
                if values.is_empty() {
                    inner.scopes.remove(&tuple.scope_id());
                }
            }
            inner.forget_cleanups(&released);
        }

        run_cleanups(released);
    }

    /// Attaches `cleanups` to the live entries of `tuples`.
    ///
    /// # Errors
    /// Returns [`LifecycleErrorKind::ScopeNotLeased`] if any tuple isn't the canonical tuple of a leased scope.
    /// Nothing is registered in that case.
    pub(crate) fn register_cleanups(&self, tuples: &[ScopeTuple], cleanups: &[Cleanup]) -> Result<(), LifecycleErrorKind> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        for tuple in tuples {
            let is_leased = inner
                .scopes
                .get(&tuple.scope_id())
                .and_then(|values| values.get(tuple.any_value()))
                .is_some_and(|entry| ScopeTuple::ptr_eq(&entry.tuple, tuple));
            if !is_leased {
                let err = LifecycleErrorKind::ScopeNotLeased { scope: tuple.key_name() };
                error!("{}", err);
                return Err(err);
            }
        }

        if tuples.is_empty() {
            return Ok(());
        }
        for cleanup in cleanups {
            let registration = inner.next_registration;
            inner.next_registration += 1;

            for tuple in tuples {
                if let Some(entry) = inner
                    .scopes
                    .get_mut(&tuple.scope_id())
                    .and_then(|values| values.get_mut(tuple.any_value()))
                {
                    entry.cleanups.push((registration, cleanup.clone()));
                }
            }
            inner
                .registrations
                .entry(cleanup.id())
                .or_default()
                .extend(tuples.iter().cloned());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.scopes.is_empty() && inner.subscriptions.is_empty() && inner.registrations.is_empty()
    }

    /// Number of cleanups attached across every live entry.
    #[cfg(test)]
    pub(crate) fn cleanup_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .scopes
            .values()
            .flat_map(BTreeMap::values)
            .map(|entry| entry.cleanups.len())
            .sum()
    }
}

/// Runs cleanups newest registration first, each at most once.
fn run_cleanups(mut cleanups: Vec<(u64, Cleanup)>) {
    cleanups.sort_by(|(left, _), (right, _)| right.cmp(left));

    let mut seen = BTreeSet::new();
    for (_, cleanup) in cleanups {
        if seen.insert(cleanup.id()) && cleanup.run() {
            trace!("Cleanup called");
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubscriptionState {
    Initial,
    Active,
    Stopped,
}

struct SubscriptionInner {
    id: SubscriptionId,
    scoper: RcThreadSafety<Scoper>,
    state: Mutex<SubscriptionState>,
    tuples: Mutex<Vec<ScopeTuple>>,
}

/// One consumer's hold on a set of scope tuples.
///
/// Tuples are leased as soon as they are expanded. The subscription moves
/// from initial to active on [`ScopeSubscription::start`] and releases its
/// leases on [`ScopeSubscription::stop`]. A stopped subscription can't be restarted.
#[derive(Clone)]
pub struct ScopeSubscription {
    inner: RcThreadSafety<SubscriptionInner>,
}

impl ScopeSubscription {
    #[must_use]
    pub(crate) fn new(scoper: RcThreadSafety<Scoper>) -> Self {
        Self {
            inner: RcThreadSafety::new(SubscriptionInner {
                id: SubscriptionId::next(),
                scoper,
                state: Mutex::new(SubscriptionState::Initial),
                tuples: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Leases `tuples` and returns their canonical tuples, in the same order.
    ///
    /// # Errors
    /// Returns [`LifecycleErrorKind::AlreadyStopped`] if the subscription was stopped.
    pub fn expand(&self, tuples: &[ScopeTuple]) -> Result<Vec<ScopeTuple>, LifecycleErrorKind> {
        let state = self.inner.state.lock();
        if *state == SubscriptionState::Stopped {
            let err = LifecycleErrorKind::AlreadyStopped;
            error!("{}", err);
            return Err(err);
        }

        let expanded: Vec<ScopeTuple> = tuples
            .iter()
            .map(|tuple| self.inner.scoper.lease_scope(tuple, self.inner.id))
            .collect();

        let mut leased = self.inner.tuples.lock();
        for tuple in &expanded {
            if !leased.iter().any(|leased| ScopeTuple::ptr_eq(leased, tuple)) {
                leased.push(tuple.clone());
            }
        }
        drop(state);

        Ok(expanded)
    }

    /// # Errors
    /// Returns [`LifecycleErrorKind::AlreadyStarted`] or [`LifecycleErrorKind::AlreadyStopped`]
    /// if the subscription left its initial state.
    pub fn start(&self) -> Result<(), LifecycleErrorKind> {
        let mut state = self.inner.state.lock();
        match *state {
            SubscriptionState::Initial => {
                *state = SubscriptionState::Active;
                debug!(tuples = self.inner.tuples.lock().len(), "Subscription started");
                Ok(())
            }
            SubscriptionState::Active => {
                let err = LifecycleErrorKind::AlreadyStarted;
                error!("{}", err);
                Err(err)
            }
            SubscriptionState::Stopped => {
                let err = LifecycleErrorKind::AlreadyStopped;
                error!("{}", err);
                Err(err)
            }
        }
    }

    /// Releases every lease of this subscription.
    ///
    /// # Errors
    /// Returns [`LifecycleErrorKind::AlreadyStopped`] on a second call.
    pub fn stop(&self) -> Result<(), LifecycleErrorKind> {
        {
            let mut state = self.inner.state.lock();
            if *state == SubscriptionState::Stopped {
                let err = LifecycleErrorKind::AlreadyStopped;
                error!("{}", err);
                return Err(err);
            }
            *state = SubscriptionState::Stopped;
        }

        self.inner.tuples.lock().clear();
        self.inner.scoper.unlease_scope(self.inner.id);
        debug!("Subscription stopped");
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        *self.inner.state.lock() == SubscriptionState::Active
    }

    /// Canonical tuples currently leased by this subscription.
    #[must_use]
    pub fn tuples(&self) -> Vec<ScopeTuple> {
        self.inner.tuples.lock().clone()
    }
}

/// Releases the leases of a started subscription.
#[must_use = "leases are held until `Unsubscribe::call` runs"]
pub struct Unsubscribe {
    subscription: ScopeSubscription,
}

impl Unsubscribe {
    #[inline]
    pub(crate) fn new(subscription: ScopeSubscription) -> Self {
        Self { subscription }
    }

    /// # Errors
    /// Returns [`LifecycleErrorKind::AlreadyStopped`] if the subscription was stopped through another handle.
    #[inline]
    pub fn call(self) -> Result<(), LifecycleErrorKind> {
        self.subscription.stop()
    }
}
