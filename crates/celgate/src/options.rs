//! Rule options and their merge semantics.
//!
//! Options flow through the five-scope hierarchy by merging: maps combine
//! key-wise with the later source winning conflicting keys, which makes
//! merging associative by construction. Options are never mutated any
//! other way.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::typemap::{DeclaredType, FunctionSignature};

/// Global declarations: string constants and named macro sources.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Globals {
    /// Constant name to string value.
    pub constants: BTreeMap<String, String>,
    /// Macro name to expression source. A call to the name inlines the
    /// parsed body at the call site.
    pub functions: BTreeMap<String, String>,
}

impl Globals {
    /// Merge `other` over `self`; `other` wins conflicting keys.
    pub fn merge(&mut self, other: &Globals) {
        for (name, value) in &other.constants {
            self.constants.insert(name.clone(), value.clone());
        }
        for (name, source) in &other.functions {
            self.functions.insert(name.clone(), source.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty() && self.functions.is_empty()
    }
}

/// Custom overload declarations: typed functions and variables.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Overloads {
    /// Function name to signature.
    pub functions: BTreeMap<String, FunctionSignature>,
    /// Variable name to type.
    pub variables: BTreeMap<String, DeclaredType>,
}

impl Overloads {
    /// Merge `other` over `self`; `other` wins conflicting keys.
    pub fn merge(&mut self, other: &Overloads) {
        for (name, signature) in &other.functions {
            self.functions.insert(name.clone(), signature.clone());
        }
        for (name, declared) in &other.variables {
            self.variables.insert(name.clone(), declared.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.variables.is_empty()
    }
}

/// The full option set attached to a rule.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuleOptions {
    pub globals: Globals,
    pub overloads: Overloads,
    /// When set, declarations and schema field names suppress colliding
    /// standard library names instead of conflicting with them.
    pub stdlib_overriding: bool,
}

impl RuleOptions {
    /// Merge `other` over `self`.
    ///
    /// Map entries from `other` win; the stdlib override flag is sticky
    /// once any source in the chain enables it.
    pub fn merge(&mut self, other: &RuleOptions) {
        self.globals.merge(&other.globals);
        self.overloads.merge(&other.overloads);
        self.stdlib_overriding |= other.stdlib_overriding;
    }

    /// Merge two option sets into a new one; `b` wins conflicting keys.
    pub fn merged(mut a: RuleOptions, b: &RuleOptions) -> RuleOptions {
        a.merge(b);
        a
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty() && self.overloads.is_empty() && !self.stdlib_overriding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constants(pairs: &[(&str, &str)]) -> RuleOptions {
        let mut options = RuleOptions::default();
        for (name, value) in pairs {
            options
                .globals
                .constants
                .insert(name.to_string(), value.to_string());
        }
        options
    }

    #[test]
    fn later_source_wins_conflicts() {
        let mut merged = constants(&[("env", "dev"), ("region", "us")]);
        merged.merge(&constants(&[("env", "prod")]));

        assert_eq!(merged.globals.constants["env"], "prod");
        assert_eq!(merged.globals.constants["region"], "us");
    }

    #[test]
    fn disjoint_merge_is_union() {
        let mut merged = constants(&[("a", "1")]);
        merged.merge(&constants(&[("b", "2")]));
        assert_eq!(merged.globals.constants.len(), 2);
    }

    #[test]
    fn merge_is_associative() {
        let a = constants(&[("x", "a"), ("y", "a")]);
        let b = constants(&[("y", "b"), ("z", "b")]);
        let c = constants(&[("z", "c")]);

        // (a ⊕ b) ⊕ c
        let left = RuleOptions::merged(RuleOptions::merged(a.clone(), &b), &c);
        // a ⊕ (b ⊕ c)
        let right = RuleOptions::merged(a, &RuleOptions::merged(b, &c));

        assert_eq!(left, right);
        assert_eq!(left.globals.constants["y"], "b");
        assert_eq!(left.globals.constants["z"], "c");
    }

    #[test]
    fn stdlib_override_is_sticky() {
        let mut options = RuleOptions {
            stdlib_overriding: true,
            ..Default::default()
        };
        options.merge(&RuleOptions::default());
        assert!(options.stdlib_overriding);
    }
}
