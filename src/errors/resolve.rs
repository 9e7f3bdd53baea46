use alloc::boxed::Box;
use core::fmt::{self, Display, Formatter};

use super::{DeepCacheErrorKind, InstantiateErrorKind, LifecycleErrorKind};
use crate::any::TypeInfo;

#[derive(thiserror::Error, Debug)]
pub enum ResolveErrorKind {
    #[error("Expected a molecule or a molecule interface, got scope key `{name}`")]
    InvalidMolecule { name: &'static str },
    #[error("Molecule interface `{name}` has no binding in this injector")]
    UnboundInterface { name: &'static str },
    #[error(
        "\
        Getter of molecule `{molecule}` used after the factory returned. \
        Dependencies must be declared synchronously, before any deferred work.\
        "
    )]
    Inactive { molecule: &'static str },
    #[error("{}", CyclicChain(.chain))]
    CyclicDependency { chain: Box<[&'static str]> },
    #[error(
        "\
        Conditional dependencies not supported: molecule `{molecule}` was cached with {recorded} scope dependencies, \
        but a new run under the same cache path used {observed}\
        "
    )]
    ConditionalDependency {
        molecule: &'static str,
        recorded: usize,
        observed: usize,
    },
    #[error("Incorrect provided type. Actual: {actual}, expected: {expected}")]
    IncorrectType { expected: TypeInfo, actual: TypeInfo },
    #[error(transparent)]
    Lifecycle(#[from] LifecycleErrorKind),
    #[error(transparent)]
    Cache(#[from] DeepCacheErrorKind),
    #[error(transparent)]
    Instantiate(InstantiateErrorKind),
}

impl From<InstantiateErrorKind> for ResolveErrorKind {
    fn from(err: InstantiateErrorKind) -> Self {
        match err {
            InstantiateErrorKind::Resolve(err) => *err,
            err @ InstantiateErrorKind::Custom(_) => Self::Instantiate(err),
        }
    }
}

struct CyclicChain<'a>(&'a [&'static str]);

impl Display for CyclicChain<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Cyclic dependency detected: ")?;
        for (index, name) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{name}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ResolveErrorKind;
    use crate::errors::InstantiateErrorKind;

    use alloc::{boxed::Box, string::ToString as _};

    #[test]
    fn test_cyclic_chain_display() {
        let err = ResolveErrorKind::CyclicDependency {
            chain: Box::new(["a", "b", "a"]),
        };
        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> b -> a");
    }

    #[test]
    fn test_instantiate_unwraps_resolve() {
        let err: ResolveErrorKind = InstantiateErrorKind::from(ResolveErrorKind::UnboundInterface { name: "http" }).into();
        assert!(matches!(err, ResolveErrorKind::UnboundInterface { name: "http" }));

        let err: ResolveErrorKind = InstantiateErrorKind::Custom(anyhow::anyhow!("boom")).into();
        assert!(matches!(err, ResolveErrorKind::Instantiate(InstantiateErrorKind::Custom(_))));
    }
}
