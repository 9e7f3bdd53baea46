use alloc::boxed::Box;
use core::{
    fmt::{self, Debug, Formatter},
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    any::TypeInfo,
    errors::{InstantiateErrorKind, ResolveErrorKind},
    getter::Getter,
    scope::{AnyScopeKey, AnyScopeValue, ScopeKey, ScopeTuple, ScopeValue},
    service::{service_fn, BoxCloneService},
    utils::thread_safety::{RcAnyThreadSafety, RcThreadSafety, SendSafety, SyncSafety},
};

static NEXT_MOLECULE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct MoleculeId(u64);

pub(crate) type BoxedCloneFactory = BoxCloneService<Getter, RcAnyThreadSafety, InstantiateErrorKind>;

#[must_use]
fn boxed_factory<T, F>(mut factory: F) -> BoxedCloneFactory
where
    T: SendSafety + SyncSafety + 'static,
    F: FnMut(&Getter) -> Result<T, InstantiateErrorKind> + Clone + SendSafety + SyncSafety + 'static,
{
    BoxCloneService(Box::new(service_fn(move |getter: Getter| {
        let value = factory(&getter)?;
        Ok::<_, InstantiateErrorKind>(RcThreadSafety::new(value) as RcAnyThreadSafety)
    })))
}

enum MoleculeKind {
    Factory(BoxedCloneFactory),
    Interface,
}

struct MoleculeInner {
    id: MoleculeId,
    name: &'static str,
    provides: TypeInfo,
    kind: MoleculeKind,
    global_scope: AnyScopeKey,
}

/// Type-erased molecule or molecule interface, compared by identity.
#[derive(Clone)]
pub struct AnyMolecule {
    inner: RcThreadSafety<MoleculeInner>,
}

impl AnyMolecule {
    fn new(name: &'static str, provides: TypeInfo, kind: MoleculeKind) -> Self {
        Self {
            inner: RcThreadSafety::new(MoleculeInner {
                id: MoleculeId(NEXT_MOLECULE_ID.fetch_add(1, Ordering::Relaxed)),
                name,
                provides,
                kind,
                global_scope: AnyScopeKey::new(name, AnyScopeValue::new(())),
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
    pub fn provides(&self) -> TypeInfo {
        self.inner.provides
    }

    #[inline]
    #[must_use]
    pub fn is_interface(&self) -> bool {
        matches!(self.inner.kind, MoleculeKind::Interface)
    }

    #[inline]
    #[must_use]
    pub(crate) fn id(&self) -> MoleculeId {
        self.inner.id
    }

    /// Scope every instance of this molecule implicitly depends on.
    #[inline]
    #[must_use]
    pub(crate) fn global_scope(&self) -> &AnyScopeKey {
        &self.inner.global_scope
    }

    #[inline]
    #[must_use]
    pub(crate) fn factory(&self) -> Option<BoxedCloneFactory> {
        match &self.inner.kind {
            MoleculeKind::Factory(factory) => Some(factory.clone()),
            MoleculeKind::Interface => None,
        }
    }
}

impl PartialEq for AnyMolecule {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for AnyMolecule {}

impl Debug for AnyMolecule {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyMolecule")
            .field("name", &self.inner.name)
            .field("provides", &self.inner.provides.name)
            .field("is_interface", &self.is_interface())
            .finish()
    }
}

/// Declarative factory of shared values of type `T`.
///
/// The factory runs once per distinct combination of the scopes it actually reads,
/// and its result is shared by everyone resolving the molecule under that combination.
pub struct Molecule<T> {
    erased: AnyMolecule,
    _marker: PhantomData<fn() -> T>,
}

impl<T: SendSafety + SyncSafety + 'static> Molecule<T> {
    #[must_use]
    pub fn new<F>(name: &'static str, factory: F) -> Self
    where
        F: FnMut(&Getter) -> Result<T, InstantiateErrorKind> + Clone + SendSafety + SyncSafety + 'static,
    {
        Self {
            erased: AnyMolecule::new(name, TypeInfo::of::<T>(), MoleculeKind::Factory(boxed_factory(factory))),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Molecule<T> {
    fn clone(&self) -> Self {
        Self {
            erased: self.erased.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Debug for Molecule<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Molecule").field(&self.erased.name()).finish()
    }
}

/// Binding key for a molecule supplied when the injector is created.
///
/// An interface has no factory: resolving it without a binding fails with
/// [`ResolveErrorKind::UnboundInterface`].
pub struct MoleculeInterface<T> {
    erased: AnyMolecule,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> MoleculeInterface<T> {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            erased: AnyMolecule::new(name, TypeInfo::of::<T>(), MoleculeKind::Interface),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for MoleculeInterface<T> {
    fn clone(&self) -> Self {
        Self {
            erased: self.erased.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Debug for MoleculeInterface<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MoleculeInterface").field(&self.erased.name()).finish()
    }
}

/// Anything the injector can resolve to a shared value: a molecule or a molecule interface.
pub trait MoleculeLike {
    type Provides: SendSafety + SyncSafety + 'static;

    fn as_any_molecule(&self) -> &AnyMolecule;
}

impl<T: SendSafety + SyncSafety + 'static> MoleculeLike for Molecule<T> {
    type Provides = T;

    #[inline]
    fn as_any_molecule(&self) -> &AnyMolecule {
        &self.erased
    }
}

impl<T: SendSafety + SyncSafety + 'static> MoleculeLike for MoleculeInterface<T> {
    type Provides = T;

    #[inline]
    fn as_any_molecule(&self) -> &AnyMolecule {
        &self.erased
    }
}

/// Everything a factory can depend on.
#[derive(Clone, Debug)]
pub enum AnyDependency {
    Molecule(AnyMolecule),
    Scope(AnyScopeKey),
}

impl From<AnyMolecule> for AnyDependency {
    fn from(molecule: AnyMolecule) -> Self {
        Self::Molecule(molecule)
    }
}

impl From<AnyScopeKey> for AnyDependency {
    fn from(key: AnyScopeKey) -> Self {
        Self::Scope(key)
    }
}

/// Value a dependency resolved to.
pub enum Resolved {
    Molecule { value: RcAnyThreadSafety, provides: TypeInfo },
    Scope(ScopeTuple),
}

impl Resolved {
    fn incorrect_type<T: 'static>(&self) -> ResolveErrorKind {
        let actual = match self {
            Resolved::Molecule { provides, .. } => *provides,
            Resolved::Scope(tuple) => tuple.any_value().type_info(),
        };
        ResolveErrorKind::IncorrectType {
            expected: TypeInfo::of::<T>(),
            actual,
        }
    }
}

/// Typed view over [`AnyDependency`], used by [`Getter::inject`].
pub trait Dependency {
    type Output;

    fn as_dependency(&self) -> AnyDependency;

    /// # Errors
    /// Returns [`ResolveErrorKind::IncorrectType`] if `resolved` doesn't hold this dependency's output.
    fn from_resolved(resolved: Resolved) -> Result<Self::Output, ResolveErrorKind>;
}

fn molecule_from_resolved<T: SendSafety + SyncSafety + 'static>(resolved: Resolved) -> Result<RcThreadSafety<T>, ResolveErrorKind> {
    let err = resolved.incorrect_type::<T>();
    match resolved {
        Resolved::Molecule { value, .. } => value.downcast::<T>().map_err(|_| err),
        Resolved::Scope(_) => Err(err),
    }
}

impl<T: SendSafety + SyncSafety + 'static> Dependency for Molecule<T> {
    type Output = RcThreadSafety<T>;

    #[inline]
    fn as_dependency(&self) -> AnyDependency {
        AnyDependency::Molecule(self.erased.clone())
    }

    #[inline]
    fn from_resolved(resolved: Resolved) -> Result<Self::Output, ResolveErrorKind> {
        molecule_from_resolved(resolved)
    }
}

impl<T: SendSafety + SyncSafety + 'static> Dependency for MoleculeInterface<T> {
    type Output = RcThreadSafety<T>;

    #[inline]
    fn as_dependency(&self) -> AnyDependency {
        AnyDependency::Molecule(self.erased.clone())
    }

    #[inline]
    fn from_resolved(resolved: Resolved) -> Result<Self::Output, ResolveErrorKind> {
        molecule_from_resolved(resolved)
    }
}

impl<T: ScopeValue> Dependency for ScopeKey<T> {
    type Output = T;

    #[inline]
    fn as_dependency(&self) -> AnyDependency {
        AnyDependency::Scope(self.as_any_scope_key().clone())
    }

    fn from_resolved(resolved: Resolved) -> Result<Self::Output, ResolveErrorKind> {
        if let Resolved::Scope(tuple) = &resolved {
            if let Some(value) = tuple.any_value().downcast_ref::<T>() {
                return Ok(value.clone());
            }
        }
        Err(resolved.incorrect_type::<T>())
    }
}
