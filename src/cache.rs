use alloc::collections::BTreeMap;
use tracing::error;

use crate::errors::DeepCacheErrorKind;

struct Node<K, V> {
    value: Option<V>,
    children: BTreeMap<K, Node<K, V>>,
}

impl<K, V> Node<K, V> {
    const fn new() -> Self {
        Self {
            value: None,
            children: BTreeMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }
}

/// Tree cache keyed by an ordered sequence of keys.
///
/// `[a, b]` and `[b, a]` are different entries. Nodes left without a value
/// and without children are pruned on [`DeepCache::remove`], so the tree
/// holds nothing for paths nobody stores under.
pub struct DeepCache<K, V> {
    root: Node<K, V>,
}

impl<K, V> Default for DeepCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> DeepCache<K, V> {
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self { root: Node::new() }
    }
}

impl<K: Ord + Clone, V: Clone> DeepCache<K, V> {
    /// Returns the value stored at `path`, calling `found` on it,
    /// or stores and returns the value made by `create`.
    pub fn deep_cache(
        &mut self,
        create: impl FnOnce() -> V,
        found: impl FnOnce(&V),
        path: &[K],
    ) -> Result<V, DeepCacheErrorKind> {
        if path.is_empty() {
            let err = DeepCacheErrorKind::EmptyPath;
            error!("{}", err);
            return Err(err);
        }

        let node = self.node_mut(path);
        match &node.value {
            Some(value) => {
                found(value);
                Ok(value.clone())
            }
            None => {
                let value = create();
                node.value = Some(value.clone());
                Ok(value)
            }
        }
    }

    #[must_use]
    pub fn get(&self, path: &[K]) -> Option<V> {
        let mut node = &self.root;
        for key in path {
            node = node.children.get(key)?;
        }
        node.value.clone()
    }

    pub fn set(&mut self, path: &[K], value: V) -> Result<Option<V>, DeepCacheErrorKind> {
        if path.is_empty() {
            let err = DeepCacheErrorKind::EmptyPath;
            error!("{}", err);
            return Err(err);
        }
        Ok(self.node_mut(path).value.replace(value))
    }

    /// Clears the value at `path` and returns it.
    pub fn remove(&mut self, path: &[K]) -> Option<V> {
        Self::remove_from(&mut self.root, path)
    }

    /// Clears the value at `path` only if `predicate` accepts it.
    pub fn remove_if(&mut self, path: &[K], predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        if self.get_ref(path).is_some_and(predicate) {
            self.remove(path)
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Returns `true` if any value is stored at `prefix` or below it.
    #[must_use]
    pub fn contains_prefix(&self, prefix: &[K]) -> bool {
        let mut node = &self.root;
        for key in prefix {
            match node.children.get(key) {
                Some(child) => node = child,
                None => return false,
            }
        }
        !node.is_empty()
    }

    fn get_ref(&self, path: &[K]) -> Option<&V> {
        let mut node = &self.root;
        for key in path {
            node = node.children.get(key)?;
        }
        node.value.as_ref()
    }

    fn node_mut(&mut self, path: &[K]) -> &mut Node<K, V> {
        let mut node = &mut self.root;
        for key in path {
            node = node.children.entry(key.clone()).or_insert_with(Node::new);
        }
        node
    }

    fn remove_from(node: &mut Node<K, V>, path: &[K]) -> Option<V> {
        let Some((key, rest)) = path.split_first() else {
            return node.value.take();
        };

        let child = node.children.get_mut(key)?;
        let removed = Self::remove_from(child, rest);
        if child.is_empty() {
            node.children.remove(key);
        }
        removed
    }
}
