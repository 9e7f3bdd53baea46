use alloc::{collections::BTreeSet, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use parking_lot::Mutex;

use crate::{
    lifecycle::BoxedCloneMountCallback,
    molecule::{AnyMolecule, MoleculeId},
    scope::{relevant, ScopeId, ScopeTuple, TupleId},
    utils::thread_safety::{RcAnyThreadSafety, RcThreadSafety},
};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

/// Key of an instance in the molecule cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum CacheKey {
    Molecule(MoleculeId),
    Scope(TupleId),
}

#[must_use]
pub(crate) fn cache_path(molecule: &AnyMolecule, path: &[ScopeTuple]) -> Vec<CacheKey> {
    let mut keys = Vec::with_capacity(path.len() + 1);
    keys.push(CacheKey::Molecule(molecule.id()));
    keys.extend(path.iter().map(|tuple| CacheKey::Scope(tuple.id())));
    keys
}

/// What a single factory run touched.
#[derive(Default)]
pub(crate) struct Deps {
    /// Every scope read, directly or through a dependency.
    pub(crate) all_scopes: BTreeSet<ScopeId>,
    /// Scopes that were read without an explicit tuple.
    pub(crate) default_scopes: BTreeSet<ScopeId>,
    /// Canonical default tuples leased for `default_scopes`.
    pub(crate) default_tuples: Vec<ScopeTuple>,
    pub(crate) dependencies: BTreeSet<MoleculeId>,
    /// Instances to mount before this one, in discovery order.
    pub(crate) buddies: Vec<RcThreadSafety<MountedInstance>>,
    pub(crate) mount_callbacks: Vec<BoxedCloneMountCallback>,
}

impl Deps {
    /// Folds the dependencies of `instance` into these, as if this run read them itself.
    pub(crate) fn merge(&mut self, instance: &RcThreadSafety<MountedInstance>) {
        self.all_scopes.extend(instance.all_scopes.iter().copied());
        self.default_scopes.extend(instance.default_scopes.iter().copied());
        for tuple in &instance.default_tuples {
            if !self.default_tuples.iter().any(|leased| ScopeTuple::ptr_eq(leased, tuple)) {
                self.default_tuples.push(tuple.clone());
            }
        }

        self.dependencies.insert(instance.molecule.id());
        self.dependencies.extend(instance.dependencies.iter().copied());
        if !self.buddies.iter().any(|buddy| RcThreadSafety::ptr_eq(buddy, instance)) {
            self.buddies.push(instance.clone());
        }
    }
}

pub(crate) struct MountedInstance {
    pub(crate) id: u64,
    pub(crate) molecule: AnyMolecule,
    pub(crate) value: RcAnyThreadSafety,
    pub(crate) all_scopes: BTreeSet<ScopeId>,
    pub(crate) default_scopes: BTreeSet<ScopeId>,
    pub(crate) default_tuples: Vec<ScopeTuple>,
    pub(crate) dependencies: BTreeSet<MoleculeId>,
    pub(crate) buddies: Vec<RcThreadSafety<MountedInstance>>,
    pub(crate) mount_callbacks: Mutex<Vec<BoxedCloneMountCallback>>,
    /// Non-default tuples of `all_scopes` this instance was created under, in scope id order.
    pub(crate) path: Vec<ScopeTuple>,
    pub(crate) is_mounted: AtomicBool,
}

impl MountedInstance {
    #[must_use]
    pub(crate) fn new(molecule: AnyMolecule, value: RcAnyThreadSafety, deps: Deps, path: Vec<ScopeTuple>) -> Self {
        let Deps {
            all_scopes,
            default_scopes,
            default_tuples,
            dependencies,
            buddies,
            mount_callbacks,
        } = deps;

        Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            molecule,
            value,
            all_scopes,
            default_scopes,
            default_tuples,
            dependencies,
            buddies,
            mount_callbacks: Mutex::new(mount_callbacks),
            path,
            is_mounted: AtomicBool::new(false),
        }
    }

    #[inline]
    #[must_use]
    pub(crate) fn cache_path(&self) -> Vec<CacheKey> {
        cache_path(&self.molecule, &self.path)
    }

    /// Every tuple the instance lives on: its path and the defaults it leased.
    #[must_use]
    pub(crate) fn lease_tuples(&self) -> Vec<ScopeTuple> {
        self.path.iter().chain(&self.default_tuples).cloned().collect()
    }

    /// Whether a caller providing `tuples` would get this instance from a fresh run.
    ///
    /// `tuples` must be normalized and canonical.
    #[must_use]
    pub(crate) fn matches(&self, tuples: &[ScopeTuple]) -> bool {
        let expected = relevant(tuples, &self.all_scopes);
        expected.len() == self.path.len()
            && expected
                .iter()
                .zip(&self.path)
                .all(|(expected, actual)| ScopeTuple::ptr_eq(expected, actual))
    }
}

#[cfg(test)]
mod tests {
    use super::{cache_path, CacheKey, Deps, MountedInstance};
    use crate::{
        molecule::{Molecule, MoleculeLike as _},
        scope::{normalize, ScopeKey, ScopeTuple},
        utils::thread_safety::RcThreadSafety,
    };

    use alloc::{collections::BTreeSet, vec, vec::Vec};

    fn instance(molecule: &Molecule<u8>, deps: Deps, path: Vec<ScopeTuple>) -> RcThreadSafety<MountedInstance> {
        RcThreadSafety::new(MountedInstance::new(
            molecule.as_any_molecule().clone(),
            RcThreadSafety::new(0u8),
            deps,
            path,
        ))
    }

    #[test]
    fn test_cache_path_starts_with_molecule() {
        let molecule = Molecule::new("counter", |_| Ok(0u8));
        let user = ScopeKey::new("user", 0u32);
        let tuple = user.tuple(1);

        let path = cache_path(molecule.as_any_molecule(), &[tuple.clone()]);
        assert_eq!(
            path,
            [CacheKey::Molecule(molecule.as_any_molecule().id()), CacheKey::Scope(tuple.id())],
        );
    }

    #[test]
    fn test_matches_compares_canonical_tuples() {
        let molecule = Molecule::new("counter", |_| Ok(0u8));
        let user = ScopeKey::new("user", 0u32);
        let company = ScopeKey::new("company", "example.com");
        let tuple = user.tuple(1);

        let deps = Deps {
            all_scopes: BTreeSet::from_iter(vec![user.as_any_scope_key().id()]),
            ..Deps::default()
        };
        let instance = instance(&molecule, deps, vec![tuple.clone()]);

        assert!(instance.matches(&normalize(&[tuple.clone(), company.tuple("foo.example.com")])));
        assert!(!instance.matches(&[user.tuple(1)]));
        assert!(!instance.matches(&[]));
    }

    #[test]
    fn test_merge_dedupes_buddies() {
        let molecule = Molecule::new("counter", |_| Ok(0u8));
        let user = ScopeKey::new("user", 0u32);
        let default = user.default_tuple();

        let buddy_deps = Deps {
            all_scopes: BTreeSet::from_iter(vec![user.as_any_scope_key().id()]),
            default_scopes: BTreeSet::from_iter(vec![user.as_any_scope_key().id()]),
            default_tuples: vec![default.clone()],
            ..Deps::default()
        };
        let buddy = instance(&molecule, buddy_deps, Vec::new());

        let mut deps = Deps::default();
        deps.merge(&buddy);
        deps.merge(&buddy);

        assert_eq!(deps.buddies.len(), 1);
        assert_eq!(deps.default_tuples.len(), 1);
        assert!(deps.all_scopes.contains(&user.as_any_scope_key().id()));
        assert!(deps.dependencies.contains(&molecule.as_any_molecule().id()));
    }
}
