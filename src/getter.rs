use alloc::{boxed::Box, vec::Vec};
use core::fmt::{self, Debug, Formatter};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{
    any::TypeInfo,
    errors::ResolveErrorKind,
    injector::Injector,
    instance::Deps,
    lifecycle::{boxed_mount_callback, MountCallback, Unmount},
    molecule::{AnyDependency, AnyMolecule, BoxedCloneFactory, Dependency, Resolved},
    scope::{AnyScopeKey, ScopeTuple},
    scoper::ScopeSubscription,
    service::Service as _,
    utils::thread_safety::{RcAnyThreadSafety, RcThreadSafety, SendSafety, SyncSafety},
};

/// Context a molecule is resolved in.
#[derive(Clone)]
pub(crate) struct Resolution {
    /// Normalized canonical tuples leased by `subscription`.
    pub(crate) tuples: Vec<ScopeTuple>,
    pub(crate) subscription: ScopeSubscription,
    /// Molecules currently being constructed, outermost first.
    pub(crate) chain: Vec<AnyMolecule>,
}

struct Tracking {
    injector: Injector,
    resolution: Resolution,
    deps: Deps,
}

/// Handle a factory uses to read scopes and other molecules.
///
/// A getter is only usable while its factory runs. Clones escaping the factory,
/// e.g. into a spawned task, fail with [`ResolveErrorKind::Inactive`] afterwards.
#[derive(Clone)]
pub struct Getter {
    molecule: &'static str,
    tracking: RcThreadSafety<Mutex<Option<Tracking>>>,
}

impl Getter {
    /// Name of the molecule whose factory owns this getter.
    #[inline]
    #[must_use]
    pub fn molecule_name(&self) -> &'static str {
        self.molecule
    }

    /// Resolves a scope value or a molecule and records it as a dependency.
    ///
    /// # Errors
    /// - Returns [`ResolveErrorKind::Inactive`] if the factory already returned.
    /// - Returns any error resolving the dependency produced, including
    ///   [`ResolveErrorKind::CyclicDependency`] and [`ResolveErrorKind::UnboundInterface`].
    pub fn inject<D: Dependency>(&self, dependency: &D) -> Result<D::Output, ResolveErrorKind> {
        let resolved = self.inject_any(&dependency.as_dependency())?;
        D::from_resolved(resolved)
    }

    /// Type-erased [`Getter::inject`].
    ///
    /// # Errors
    /// See [`Getter::inject`].
    pub fn inject_any(&self, dependency: &AnyDependency) -> Result<Resolved, ResolveErrorKind> {
        match dependency {
            AnyDependency::Scope(key) => self.use_scope(key).map(Resolved::Scope),
            AnyDependency::Molecule(molecule) => self.use_molecule(molecule).map(|(value, provides)| Resolved::Molecule {
                value,
                provides,
            }),
        }
    }

    /// Registers a callback run when the instance being built is mounted.
    ///
    /// # Errors
    /// Returns [`ResolveErrorKind::Inactive`] if the factory already returned.
    pub fn on_mount<M>(&self, callback: M) -> Result<(), ResolveErrorKind>
    where
        M: MountCallback + SendSafety + SyncSafety,
    {
        let mut guard = self.tracking.lock();
        let Some(tracking) = guard.as_mut() else {
            return Err(self.inactive());
        };
        tracking.deps.mount_callbacks.push(boxed_mount_callback(callback));
        Ok(())
    }

    /// Registers a callback run when the instance being built is unmounted.
    ///
    /// # Errors
    /// Returns [`ResolveErrorKind::Inactive`] if the factory already returned.
    pub fn on_unmount<F>(&self, callback: F) -> Result<(), ResolveErrorKind>
    where
        F: FnOnce() + SendSafety + SyncSafety + 'static,
    {
        let slot = RcThreadSafety::new(Mutex::new(Some(callback)));
        self.on_mount(move || {
            let slot = slot.clone();
            Some(Box::new(move || {
                let callback = slot.lock().take();
                if let Some(callback) = callback {
                    callback();
                }
            }) as Unmount)
        })
    }

    fn new(molecule: &'static str, tracking: Tracking) -> Self {
        Self {
            molecule,
            tracking: RcThreadSafety::new(Mutex::new(Some(tracking))),
        }
    }

    fn inactive(&self) -> ResolveErrorKind {
        let err = ResolveErrorKind::Inactive { molecule: self.molecule };
        error!("{}", err);
        err
    }

    /// Ends the factory's window, returning what it touched.
    fn deactivate(&self) -> Option<Deps> {
        self.tracking.lock().take().map(|tracking| tracking.deps)
    }

    fn use_scope(&self, key: &AnyScopeKey) -> Result<ScopeTuple, ResolveErrorKind> {
        let mut guard = self.tracking.lock();
        let Some(tracking) = guard.as_mut() else {
            return Err(self.inactive());
        };

        tracking.deps.all_scopes.insert(key.id());
        let explicit = tracking
            .resolution
            .tuples
            .iter()
            .find(|tuple| tuple.scope_id() == key.id() && !tuple.is_default());
        if let Some(tuple) = explicit {
            return Ok(tuple.clone());
        }

        tracking.deps.default_scopes.insert(key.id());
        if let Some(tuple) = tracking.deps.default_tuples.iter().find(|tuple| tuple.scope_id() == key.id()) {
            return Ok(tuple.clone());
        }

        let mut leased = tracking.resolution.subscription.expand(&[key.default_tuple()])?;
        let Some(tuple) = leased.pop() else {
            return Err(self.inactive());
        };
        debug!(scope = key.name(), "Default scope leased");
        tracking.deps.default_tuples.push(tuple.clone());
        Ok(tuple)
    }

    fn use_molecule(&self, molecule: &AnyMolecule) -> Result<(RcAnyThreadSafety, TypeInfo), ResolveErrorKind> {
        let (injector, resolution) = {
            let guard = self.tracking.lock();
            let Some(tracking) = guard.as_ref() else {
                return Err(self.inactive());
            };
            (tracking.injector.clone(), tracking.resolution.clone())
        };

        let instance = injector.resolve_dependency(molecule, &resolution)?;

        let mut guard = self.tracking.lock();
        let Some(tracking) = guard.as_mut() else {
            return Err(self.inactive());
        };
        tracking.deps.merge(&instance);
        Ok((instance.value.clone(), instance.molecule.provides()))
    }
}

impl Debug for Getter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Getter")
            .field("molecule", &self.molecule)
            .field("is_active", &self.tracking.lock().is_some())
            .finish()
    }
}

/// Deactivates the getter when the factory returns or unwinds.
struct ActiveWindow<'a> {
    getter: &'a Getter,
}

impl ActiveWindow<'_> {
    fn close(self) -> Option<Deps> {
        self.getter.deactivate()
    }
}

impl Drop for ActiveWindow<'_> {
    fn drop(&mut self) {
        drop(self.getter.deactivate());
    }
}

pub(crate) struct RunOutput {
    pub(crate) value: RcAnyThreadSafety,
    pub(crate) deps: Deps,
}

/// Runs `factory` for `molecule`, tracking every dependency it reads.
pub(crate) fn run_molecule(
    injector: &Injector,
    molecule: &AnyMolecule,
    mut factory: BoxedCloneFactory,
    resolution: Resolution,
) -> Result<RunOutput, ResolveErrorKind> {
    let getter = Getter::new(
        molecule.name(),
        Tracking {
            injector: injector.clone(),
            resolution,
            deps: Deps::default(),
        },
    );
    let window = ActiveWindow { getter: &getter };

    getter.use_scope(molecule.global_scope())?;
    let value = factory.call(getter.clone());
    let deps = window.close();

    let value = value.map_err(ResolveErrorKind::from)?;
    let Some(deps) = deps else {
        return Err(getter.inactive());
    };
    Ok(RunOutput { value, deps })
}
