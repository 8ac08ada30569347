//! Variable bindings for evaluation.
//!
//! The `Activation` trait resolves variable names to values during
//! evaluation. Hierarchical activations implement comprehension scopes,
//! where iteration variables shadow outer bindings.

use std::collections::HashMap;

use crate::value::Value;

/// Trait for resolving variable bindings during evaluation.
pub trait Activation: Send + Sync {
    /// Resolve a variable name to its value.
    fn resolve(&self, name: &str) -> Option<Value>;

    /// Check whether a variable is bound.
    fn has(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }
}

/// A simple activation backed by a HashMap.
#[derive(Debug, Clone, Default)]
pub struct MapActivation {
    bindings: HashMap<String, Value>,
}

impl MapActivation {
    /// Create an empty activation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a binding.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.bindings.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl FromIterator<(String, Value)> for MapActivation {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            bindings: iter.into_iter().collect(),
        }
    }
}

impl Activation for MapActivation {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).cloned()
    }

    fn has(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }
}

/// An activation that delegates to a parent when a name is not bound
/// locally.
pub struct HierarchicalActivation<'a> {
    parent: &'a dyn Activation,
    local: HashMap<String, Value>,
}

impl<'a> HierarchicalActivation<'a> {
    /// Create a scope over a parent activation.
    pub fn new(parent: &'a dyn Activation) -> Self {
        Self {
            parent,
            local: HashMap::new(),
        }
    }

    /// Add a local binding that shadows the parent.
    pub fn with_binding(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.local.insert(name.into(), value.into());
        self
    }

    /// Insert a local binding.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.local.insert(name.into(), value.into());
    }
}

impl Activation for HierarchicalActivation<'_> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.local
            .get(name)
            .cloned()
            .or_else(|| self.parent.resolve(name))
    }

    fn has(&self, name: &str) -> bool {
        self.local.contains_key(name) || self.parent.has(name)
    }
}

/// An activation with no bindings.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyActivation;

impl Activation for EmptyActivation {
    fn resolve(&self, _name: &str) -> Option<Value> {
        None
    }

    fn has(&self, _name: &str) -> bool {
        false
    }
}

impl<T: Activation + ?Sized> Activation for &T {
    fn resolve(&self, name: &str) -> Option<Value> {
        (**self).resolve(name)
    }

    fn has(&self, name: &str) -> bool {
        (**self).has(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_activation() {
        let mut activation = MapActivation::new();
        activation.insert("x", 42i64);
        assert_eq!(activation.resolve("x"), Some(Value::Int(42)));
        assert_eq!(activation.resolve("unknown"), None);
        assert!(activation.has("x"));
    }

    #[test]
    fn hierarchical_shadowing() {
        let mut parent = MapActivation::new();
        parent.insert("x", 1i64);
        parent.insert("y", 2i64);

        let child = HierarchicalActivation::new(&parent).with_binding("x", 10i64);
        assert_eq!(child.resolve("x"), Some(Value::Int(10)));
        assert_eq!(child.resolve("y"), Some(Value::Int(2)));
        assert_eq!(child.resolve("z"), None);
    }
}
