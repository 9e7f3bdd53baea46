use alloc::{
    boxed::Box,
    collections::{BTreeMap, BTreeSet},
    vec::Vec,
};
use core::{iter, sync::atomic::Ordering};
use parking_lot::Mutex;
use tracing::{debug, debug_span, error, info_span};

use crate::{
    any::TypeInfo,
    bindings::Bindings,
    cache::DeepCache,
    errors::{LifecycleErrorKind, ResolveErrorKind},
    getter::{run_molecule, Resolution},
    instance::{cache_path, CacheKey, MountedInstance},
    lifecycle::Cleanup,
    molecule::{AnyDependency, AnyMolecule, MoleculeId, MoleculeLike},
    scope::{normalize, relevant, ScopeId, ScopeTuple},
    scoper::{ScopeSubscription, Scoper, Unsubscribe},
    service::Service as _,
    utils::thread_safety::{RcAnyThreadSafety, RcThreadSafety, WeakThreadSafety},
};

pub(crate) struct InjectorInner {
    molecules: Mutex<DeepCache<CacheKey, RcThreadSafety<MountedInstance>>>,
    /// Scope sets observed per molecule, oldest first.
    signatures: Mutex<BTreeMap<MoleculeId, Vec<BTreeSet<ScopeId>>>>,
    scoper: RcThreadSafety<Scoper>,
    bindings: Bindings,
}

impl InjectorInner {
    /// Evicts `instance`, dropping its molecule's signatures once no instance of it is cached.
    fn purge(&self, instance: &RcThreadSafety<MountedInstance>) {
        let mut molecules = self.molecules.lock();
        let removed = molecules.remove_if(&instance.cache_path(), |cached| RcThreadSafety::ptr_eq(cached, instance));
        if removed.is_none() {
            return;
        }
        debug!(molecule = instance.molecule.name(), instance = instance.id, "Evicted from cache");

        let molecule = instance.molecule.id();
        if !molecules.contains_prefix(&[CacheKey::Molecule(molecule)]) && self.signatures.lock().remove(&molecule).is_some() {
            debug!(molecule = instance.molecule.name(), "Signatures dropped");
        }
    }
}

/// Resolves molecules to shared instances and tracks how long each instance lives.
///
/// Instances are cached per the scope tuples their factories actually read, and live
/// as long as some subscription leases those tuples. Injectors never share instances.
#[derive(Clone)]
pub struct Injector {
    pub(crate) inner: RcThreadSafety<InjectorInner>,
}

impl Default for Injector {
    fn default() -> Self {
        Self::new(Bindings::new())
    }
}

impl Injector {
    #[must_use]
    pub fn new(bindings: Bindings) -> Self {
        Self {
            inner: RcThreadSafety::new(InjectorInner {
                molecules: Mutex::new(DeepCache::new()),
                signatures: Mutex::new(BTreeMap::new()),
                scoper: RcThreadSafety::new(Scoper::new()),
                bindings,
            }),
        }
    }

    /// Resolves `molecule` under `tuples` and keeps its scopes leased.
    ///
    /// # Warning
    /// The leases taken here are never released, so the instance is never unmounted.
    /// Use [`Injector::use_molecule`] to control the lifetime.
    ///
    /// # Errors
    /// Returns any error produced while resolving the molecule.
    pub fn get<M: MoleculeLike>(&self, molecule: &M, tuples: &[ScopeTuple]) -> Result<RcThreadSafety<M::Provides>, ResolveErrorKind> {
        let (value, unsubscribe) = self.use_molecule(molecule, tuples)?;
        drop(unsubscribe);
        Ok(value)
    }

    /// Resolves and mounts `molecule`, returning the value and a handle releasing its scopes.
    ///
    /// # Errors
    /// Returns any error produced while resolving or mounting the molecule.
    /// Leases taken before the failure are released.
    pub fn use_molecule<M: MoleculeLike>(
        &self,
        molecule: &M,
        tuples: &[ScopeTuple],
    ) -> Result<(RcThreadSafety<M::Provides>, Unsubscribe), ResolveErrorKind> {
        let lazy = self.use_lazily(molecule, tuples)?;
        let value = lazy.start()?;
        Ok((value, Unsubscribe::new(lazy.subscription)))
    }

    /// Resolves `molecule` without mounting it.
    ///
    /// Scopes are leased right away; the instance is mounted on [`LazyMolecule::start`].
    ///
    /// # Errors
    /// Returns any error produced while resolving the molecule.
    /// Leases taken before the failure are released.
    pub fn use_lazily<M: MoleculeLike>(&self, molecule: &M, tuples: &[ScopeTuple]) -> Result<LazyMolecule<M::Provides>, ResolveErrorKind> {
        let span = info_span!("use", molecule = molecule.as_any_molecule().name());
        let _guard = span.enter();

        let subscription = self.create_subscription();
        let instance = self.resolve_root(molecule.as_any_molecule(), tuples, &subscription)?;

        match instance.value.clone().downcast::<M::Provides>() {
            Ok(value) => Ok(LazyMolecule {
                value,
                instance,
                subscription,
                injector: self.clone(),
            }),
            Err(_) => {
                if let Err(err) = subscription.stop() {
                    error!("{}", err);
                }
                let err = ResolveErrorKind::IncorrectType {
                    expected: TypeInfo::of::<M::Provides>(),
                    actual: instance.molecule.provides(),
                };
                error!("{}", err);
                Err(err)
            }
        }
    }

    /// Type-erased [`Injector::use_molecule`] that keeps the scopes leased, like [`Injector::get`].
    ///
    /// # Errors
    /// - Returns [`ResolveErrorKind::InvalidMolecule`] if `dependency` is a scope key.
    /// - Returns any error produced while resolving or mounting the molecule.
    pub fn get_any(&self, dependency: &AnyDependency, tuples: &[ScopeTuple]) -> Result<RcAnyThreadSafety, ResolveErrorKind> {
        let molecule = match dependency {
            AnyDependency::Molecule(molecule) => molecule,
            AnyDependency::Scope(key) => {
                let err = ResolveErrorKind::InvalidMolecule { name: key.name() };
                error!("{}", err);
                return Err(err);
            }
        };

        let span = info_span!("use", molecule = molecule.name());
        let _guard = span.enter();

        let subscription = self.create_subscription();
        let instance = self.resolve_root(molecule, tuples, &subscription)?;
        let lazy = LazyMolecule {
            value: instance.value.clone(),
            instance,
            subscription,
            injector: self.clone(),
        };
        lazy.start()
    }

    /// Leases `tuples` on a new started subscription and returns their canonical tuples.
    ///
    /// # Errors
    /// Returns a lifecycle error if the subscription can't be started.
    pub fn use_scopes(&self, tuples: &[ScopeTuple]) -> Result<(Vec<ScopeTuple>, Unsubscribe), LifecycleErrorKind> {
        let subscription = self.create_subscription();
        let expanded = subscription.expand(tuples)?;
        subscription.start()?;
        Ok((expanded, Unsubscribe::new(subscription)))
    }

    #[inline]
    #[must_use]
    pub fn create_subscription(&self) -> ScopeSubscription {
        ScopeSubscription::new(self.inner.scoper.clone())
    }
}

impl Injector {
    /// Resolves a top-level request, stopping `subscription` if anything fails.
    fn resolve_root(
        &self,
        molecule: &AnyMolecule,
        tuples: &[ScopeTuple],
        subscription: &ScopeSubscription,
    ) -> Result<RcThreadSafety<MountedInstance>, ResolveErrorKind> {
        let resolved = subscription
            .expand(tuples)
            .map_err(ResolveErrorKind::from)
            .and_then(|expanded| {
                let resolution = Resolution {
                    tuples: normalize(&expanded),
                    subscription: subscription.clone(),
                    chain: Vec::new(),
                };
                let molecule = self.true_molecule(molecule)?;
                self.get_internal(&molecule, &resolution)
            });

        if resolved.is_err() {
            if let Err(err) = subscription.stop() {
                error!("{}", err);
            }
        }
        resolved
    }

    /// Resolves a molecule requested by a factory that is being run.
    pub(crate) fn resolve_dependency(
        &self,
        molecule: &AnyMolecule,
        resolution: &Resolution,
    ) -> Result<RcThreadSafety<MountedInstance>, ResolveErrorKind> {
        let molecule = self.true_molecule(molecule)?;
        if resolution.chain.contains(&molecule) {
            let chain = resolution
                .chain
                .iter()
                .map(AnyMolecule::name)
                .chain(iter::once(molecule.name()))
                .collect::<Box<[_]>>();
            let err = ResolveErrorKind::CyclicDependency { chain };
            error!("{}", err);
            return Err(err);
        }
        self.get_internal(&molecule, resolution)
    }

    /// Applies bindings. Unbound interfaces can't be resolved.
    fn true_molecule(&self, molecule: &AnyMolecule) -> Result<AnyMolecule, ResolveErrorKind> {
        if let Some(bound) = self.inner.bindings.get(molecule) {
            debug!(from = molecule.name(), to = bound.name(), "Binding applied");
            return Ok(bound.clone());
        }
        if molecule.is_interface() {
            let err = ResolveErrorKind::UnboundInterface { name: molecule.name() };
            error!("{}", err);
            return Err(err);
        }
        Ok(molecule.clone())
    }

    fn get_internal(&self, molecule: &AnyMolecule, resolution: &Resolution) -> Result<RcThreadSafety<MountedInstance>, ResolveErrorKind> {
        let span = debug_span!("get", molecule = molecule.name());
        let _guard = span.enter();

        if let Some(instance) = self.find_cached(molecule, &resolution.tuples) {
            resolution.subscription.expand(&instance.default_tuples)?;
            debug!(instance = instance.id, "Found in cache");
            return Ok(instance);
        }
        debug!("Not found in cache");

        self.run_and_cache(molecule, resolution)
    }

    /// Probes every scope set recorded for `molecule`, newest first.
    fn find_cached(&self, molecule: &AnyMolecule, tuples: &[ScopeTuple]) -> Option<RcThreadSafety<MountedInstance>> {
        let signatures = self.inner.signatures.lock().get(&molecule.id()).cloned()?;
        let molecules = self.inner.molecules.lock();

        signatures.iter().rev().find_map(|signature| {
            let path = relevant(tuples, signature);
            molecules
                .get(&cache_path(molecule, &path))
                .filter(|instance| instance.matches(tuples))
        })
    }

    fn record_signature(&self, molecule: &AnyMolecule, all_scopes: &BTreeSet<ScopeId>) {
        let mut signatures = self.inner.signatures.lock();
        let recorded = signatures.entry(molecule.id()).or_default();
        if !recorded.contains(all_scopes) {
            recorded.push(all_scopes.clone());
        }
    }

    fn run_and_cache(&self, molecule: &AnyMolecule, resolution: &Resolution) -> Result<RcThreadSafety<MountedInstance>, ResolveErrorKind> {
        let Some(factory) = molecule.factory() else {
            let err = ResolveErrorKind::UnboundInterface { name: molecule.name() };
            error!("{}", err);
            return Err(err);
        };

        let mut inner_resolution = resolution.clone();
        inner_resolution.chain.push(molecule.clone());
        let run = match run_molecule(self, molecule, factory, inner_resolution) {
            Ok(run) => run,
            Err(err) => {
                error!("{}", err);
                return Err(err);
            }
        };

        let path = relevant(&resolution.tuples, &run.deps.all_scopes);
        let keys = cache_path(molecule, &path);
        let observed = run.deps.all_scopes.len();
        self.record_signature(molecule, &run.deps.all_scopes);

        let mut is_created = false;
        let instance = self.inner.molecules.lock().deep_cache(
            || {
                is_created = true;
                RcThreadSafety::new(MountedInstance::new(molecule.clone(), run.value, run.deps, path))
            },
            |_| {},
            &keys,
        )?;

        if !is_created {
            let recorded = instance.all_scopes.len();
            if recorded != observed {
                let err = ResolveErrorKind::ConditionalDependency {
                    molecule: molecule.name(),
                    recorded,
                    observed,
                };
                error!("{}", err);
                return Err(err);
            }

            resolution.subscription.expand(&instance.default_tuples)?;
            debug!(instance = instance.id, "Found in cache after run");
            return Ok(instance);
        }

        self.inner.scoper.register_cleanups(&instance.lease_tuples(), &[self.purge_cleanup(&instance)])?;
        debug!(
            instance = instance.id,
            scopes = instance.all_scopes.len(),
            dependencies = instance.dependencies.len(),
            "Cached"
        );
        Ok(instance)
    }

    fn purge_cleanup(&self, instance: &RcThreadSafety<MountedInstance>) -> Cleanup {
        let injector = RcThreadSafety::downgrade(&self.inner);
        let instance = instance.clone();
        Cleanup::new(Box::new(move || {
            if let Some(inner) = WeakThreadSafety::upgrade(&injector) {
                inner.purge(&instance);
            }
        }))
    }

    /// Mounts `instance` and its dependencies, dependencies first.
    ///
    /// Mounting an already mounted instance does nothing.
    fn run_mount(&self, instance: &RcThreadSafety<MountedInstance>) -> Result<(), ResolveErrorKind> {
        if instance.is_mounted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for buddy in &instance.buddies {
            self.run_mount(buddy)?;
        }

        let callbacks = instance.mount_callbacks.lock().clone();
        let mut unmounts = Vec::with_capacity(callbacks.len());
        for mut callback in callbacks {
            if let Ok(Some(unmount)) = callback.call(()) {
                unmounts.push(unmount);
            }
        }
        debug!(molecule = instance.molecule.name(), instance = instance.id, "Mounted");

        let injector = RcThreadSafety::downgrade(&self.inner);
        let target = instance.clone();
        let teardown = Cleanup::new(Box::new(move || {
            for unmount in unmounts.into_iter().rev() {
                unmount();
            }
            target.is_mounted.store(false, Ordering::SeqCst);
            if let Some(inner) = WeakThreadSafety::upgrade(&injector) {
                inner.purge(&target);
            }
            debug!(molecule = target.molecule.name(), instance = target.id, "Unmounted");
        }));

        if let Err(err) = self.inner.scoper.register_cleanups(&instance.lease_tuples(), &[teardown.clone()]) {
            teardown.run();
            return Err(err.into());
        }
        Ok(())
    }
}

/// Resolved molecule that isn't mounted until [`LazyMolecule::start`].
pub struct LazyMolecule<T: ?Sized> {
    value: RcThreadSafety<T>,
    instance: RcThreadSafety<MountedInstance>,
    subscription: ScopeSubscription,
    injector: Injector,
}

impl<T: ?Sized> LazyMolecule<T> {
    /// Value of the resolved instance, usable before the instance is mounted.
    #[inline]
    #[must_use]
    pub fn value(&self) -> &RcThreadSafety<T> {
        &self.value
    }

    /// Starts the subscription and mounts the instance.
    ///
    /// # Errors
    /// Returns a lifecycle error if the subscription left its initial state.
    /// The subscription is stopped if mounting fails.
    pub fn start(&self) -> Result<RcThreadSafety<T>, ResolveErrorKind> {
        self.subscription.start()?;
        if let Err(err) = self.injector.run_mount(&self.instance) {
            if let Err(stop_err) = self.subscription.stop() {
                error!("{}", stop_err);
            }
            return Err(err);
        }
        Ok(self.value.clone())
    }

    /// Releases the scopes leased for this molecule.
    ///
    /// # Errors
    /// Returns [`LifecycleErrorKind::AlreadyStopped`] on a second call.
    #[inline]
    pub fn stop(&self) -> Result<(), LifecycleErrorKind> {
        self.subscription.stop()
    }

    #[inline]
    #[must_use]
    pub fn subscription(&self) -> &ScopeSubscription {
        &self.subscription
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::Injector;
    use crate::{
        errors::{InstantiateErrorKind, ResolveErrorKind},
        molecule::{AnyDependency, Molecule, MoleculeLike as _},
        scope::ScopeKey,
        utils::thread_safety::RcThreadSafety,
    };

    use alloc::{
        format,
        string::{String, ToString as _},
    };
    use core::sync::atomic::{AtomicU8, Ordering};
    use tracing::debug;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_get_caches_unscoped_molecule() {
        let call_count = RcThreadSafety::new(AtomicU8::new(0));
        let counter = Molecule::new("counter", {
            let call_count = call_count.clone();
            move |_| {
                call_count.fetch_add(1, Ordering::SeqCst);
                debug!("Factory called");
                Ok(call_count.load(Ordering::SeqCst))
            }
        });

        let injector = Injector::default();
        let first = injector.get(&counter, &[]).unwrap();
        let second = injector.get(&counter, &[]).unwrap();

        assert!(RcThreadSafety::ptr_eq(&first, &second));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[traced_test]
    fn test_factory_error_releases_leases() {
        let user = ScopeKey::new("user", 0u32);
        let failing = Molecule::new("failing", {
            let user = user.clone();
            move |getter| {
                getter.inject(&user)?;
                Err::<u8, _>(InstantiateErrorKind::Custom(anyhow::anyhow!("boom")))
            }
        });

        let injector = Injector::default();
        assert!(matches!(
            injector.get(&failing, &[user.tuple(1)]),
            Err(ResolveErrorKind::Instantiate(InstantiateErrorKind::Custom(_))),
        ));
        assert!(injector.inner.scoper.is_empty());
        assert!(injector.inner.molecules.lock().is_empty());
    }

    #[test]
    #[traced_test]
    fn test_get_any_rejects_scope_key() {
        let user = ScopeKey::new("user", 0u32);
        let injector = Injector::default();

        assert!(matches!(
            injector.get_any(&AnyDependency::Scope(user.as_any_scope_key().clone()), &[]),
            Err(ResolveErrorKind::InvalidMolecule { name: "user" }),
        ));
    }

    #[test]
    #[traced_test]
    fn test_get_any_resolves_molecule() {
        let molecule = Molecule::new("name", |_| Ok(String::from("example.com")));
        let injector = Injector::default();

        let value = injector
            .get_any(&AnyDependency::Molecule(molecule.as_any_molecule().clone()), &[])
            .unwrap();
        assert_eq!(value.downcast_ref::<String>().map(String::as_str), Some("example.com"));
    }

    #[test]
    #[traced_test]
    fn test_stop_evicts_and_unmounts() {
        let user = ScopeKey::new("user", 0u32);
        let molecule = Molecule::new("per user", {
            let user = user.clone();
            move |getter| Ok(getter.inject(&user)?)
        });

        let injector = Injector::default();
        let lazy = injector.use_lazily(&molecule, &[user.tuple(1)]).unwrap();
        lazy.start().unwrap();
        assert!(lazy.instance.is_mounted.load(Ordering::SeqCst));
        assert!(!injector.inner.molecules.lock().is_empty());

        lazy.stop().unwrap();
        assert!(!lazy.instance.is_mounted.load(Ordering::SeqCst));
        assert!(injector.inner.molecules.lock().is_empty());
        assert!(injector.inner.scoper.is_empty());
    }

    #[test]
    #[traced_test]
    fn test_short_lived_instances_leave_no_cleanups_behind() {
        let user = ScopeKey::new("user", 0u32);
        let shared = Molecule::new("shared", |_| Ok(()));
        let per_user = Molecule::new("per user", {
            let user = user.clone();
            let shared = shared.clone();
            move |getter| Ok((getter.inject(&user)?, getter.inject(&shared)?))
        });

        let injector = Injector::default();
        injector.get(&shared, &[]).unwrap();
        let before = injector.inner.scoper.cleanup_count();

        for id in 1..=100 {
            let (value, unsubscribe) = injector.use_molecule(&per_user, &[user.tuple(id)]).unwrap();
            assert_eq!(value.0, id);
            unsubscribe.call().unwrap();
        }
        assert_eq!(injector.inner.scoper.cleanup_count(), before);
    }

    #[test]
    #[traced_test]
    fn test_signatures_dropped_with_last_instance() {
        let user = ScopeKey::new("user", 0u32);
        let per_user = Molecule::new("per user", {
            let user = user.clone();
            move |getter| Ok(getter.inject(&user)?)
        });

        let injector = Injector::default();
        let (_, first) = injector.use_molecule(&per_user, &[user.tuple(1)]).unwrap();
        let (_, second) = injector.use_molecule(&per_user, &[user.tuple(2)]).unwrap();

        first.call().unwrap();
        assert!(injector.inner.signatures.lock().contains_key(&per_user.as_any_molecule().id()));

        second.call().unwrap();
        assert!(injector.inner.signatures.lock().is_empty());

        let (value, unsubscribe) = injector.use_molecule(&per_user, &[user.tuple(3)]).unwrap();
        assert_eq!(*value, 3);
        unsubscribe.call().unwrap();
    }

    #[test]
    #[traced_test]
    fn test_unstarted_instance_is_evicted() {
        let user = ScopeKey::new("user", 0u32);
        let molecule = Molecule::new("per user", {
            let user = user.clone();
            move |getter| Ok(getter.inject(&user)?)
        });

        let injector = Injector::default();
        let lazy = injector.use_lazily(&molecule, &[user.tuple(1)]).unwrap();
        assert_eq!(**lazy.value(), 1);
        assert!(!lazy.instance.is_mounted.load(Ordering::SeqCst));

        lazy.stop().unwrap();
        assert!(injector.inner.molecules.lock().is_empty());
        assert!(injector.inner.scoper.is_empty());
    }
}
