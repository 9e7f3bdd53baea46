use alloc::collections::BTreeMap;

use crate::molecule::{AnyMolecule, Molecule, MoleculeId, MoleculeLike};

/// Replacements an injector applies before resolving a molecule.
///
/// Keys are molecule interfaces or molecules; values are the molecules
/// resolved in their place. Binding the same key twice keeps the last binding.
#[derive(Default, Clone)]
pub struct Bindings {
    replacements: BTreeMap<MoleculeId, (AnyMolecule, AnyMolecule)>,
}

impl Bindings {
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            replacements: BTreeMap::new(),
        }
    }

    /// Resolves `to` wherever `from` is requested.
    #[inline]
    #[must_use]
    pub fn bind<M: MoleculeLike>(mut self, from: &M, to: &Molecule<M::Provides>) -> Self {
        self.add_binding(from.as_any_molecule().clone(), to.as_any_molecule().clone());
        self
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.replacements.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty()
    }

    pub(crate) fn add_binding(&mut self, from: AnyMolecule, to: AnyMolecule) -> Option<AnyMolecule> {
        self.replacements
            .insert(from.id(), (from, to))
            .map(|(_, previous)| previous)
    }

    #[inline]
    #[must_use]
    pub(crate) fn get(&self, molecule: &AnyMolecule) -> Option<&AnyMolecule> {
        self.replacements.get(&molecule.id()).map(|(_, to)| to)
    }
}

/// Type-erased pairs; the provided types are not checked until resolution.
impl FromIterator<(AnyMolecule, AnyMolecule)> for Bindings {
    fn from_iter<I: IntoIterator<Item = (AnyMolecule, AnyMolecule)>>(iter: I) -> Self {
        let mut bindings = Self::new();
        for (from, to) in iter {
            bindings.add_binding(from, to);
        }
        bindings
    }
}

/// Builds [`Bindings`] from `from => to` pairs.
///
/// ```
/// use molecula::{bindings, Molecule, MoleculeInterface};
///
/// let http = MoleculeInterface::<&'static str>::new("http");
/// let mock = Molecule::new("mock http", |_| Ok("mock"));
///
/// let bindings = bindings! { http => mock };
/// assert_eq!(bindings.len(), 1);
/// ```
#[macro_export]
macro_rules! bindings {
    ( $( $from:expr => $to:expr ),* $(,)? ) => {{
        let bindings = $crate::Bindings::new();
        $(
            let bindings = bindings.bind(&$from, &$to);
        )*
        bindings
    }};
}

#[cfg(test)]
mod tests {
    use super::Bindings;
    use crate::molecule::{Molecule, MoleculeInterface, MoleculeLike as _};

    use alloc::vec;

    #[test]
    fn test_last_binding_wins() {
        let http = MoleculeInterface::<&'static str>::new("http");
        let first = Molecule::new("first", |_| Ok("first"));
        let second = Molecule::new("second", |_| Ok("second"));

        let bindings = Bindings::new().bind(&http, &first).bind(&http, &second);

        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings.get(http.as_any_molecule()), Some(second.as_any_molecule()));
        assert_eq!(bindings.get(first.as_any_molecule()), None);
    }

    #[test]
    fn test_bind_molecule_to_molecule() {
        let real = Molecule::new("real", |_| Ok(1u8));
        let mock = Molecule::new("mock", |_| Ok(2u8));

        let bindings = bindings! { real => mock };

        assert_eq!(bindings.get(real.as_any_molecule()), Some(mock.as_any_molecule()));
    }

    #[test]
    fn test_from_iter() {
        let http = MoleculeInterface::<u8>::new("http");
        let real = Molecule::new("real", |_| Ok(1u8));

        let bindings = Bindings::from_iter(vec![(http.as_any_molecule().clone(), real.as_any_molecule().clone())]);

        assert!(!bindings.is_empty());
        assert_eq!(bindings.get(http.as_any_molecule()), Some(real.as_any_molecule()));
    }
}
