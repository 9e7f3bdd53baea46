#![no_std]

extern crate alloc;

pub(crate) mod any;
pub(crate) mod bindings;
pub(crate) mod cache;
pub(crate) mod errors;
pub(crate) mod getter;
pub(crate) mod injector;
pub(crate) mod instance;
pub(crate) mod lifecycle;
pub(crate) mod molecule;
pub(crate) mod scope;
pub(crate) mod scoper;
pub(crate) mod service;

#[cfg(feature = "thread_safe")]
pub mod global;

pub mod utils;

pub use any::TypeInfo;
pub use bindings::Bindings;
pub use cache::DeepCache;
pub use errors::{DeepCacheErrorKind, GlobalErrorKind, InstantiateErrorKind, LifecycleErrorKind, ResolveErrorKind};
pub use getter::Getter;
pub use injector::{Injector, LazyMolecule};
pub use lifecycle::{MountCallback, Unmount};
pub use molecule::{AnyDependency, AnyMolecule, Dependency, Molecule, MoleculeInterface, MoleculeLike, Resolved};
pub use scope::{AnyScopeKey, ByRef, ScopeKey, ScopeTuple, ScopeValue};
pub use scoper::{ScopeSubscription, Unsubscribe};
