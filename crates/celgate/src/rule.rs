//! Rules and the per-scope rule tree.
//!
//! A [`Rule`] is a set of options plus an ordered list of program
//! declarations. Scope rules nest a rule with their child scopes; the
//! resolver merges them across the hierarchy before compilation.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::options::RuleOptions;

/// A single named expression declaration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProgramDecl {
    /// Identifier reported when the program fails.
    pub id: String,
    /// The boolean expression source.
    pub expression: String,
}

impl ProgramDecl {
    pub fn new(id: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            expression: expression.into(),
        }
    }
}

/// Options plus program declarations for one scope.
///
/// A rule with zero programs compiles to a validator that always passes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Rule {
    #[serde(flatten)]
    pub options: RuleOptions,
    pub programs: Vec<ProgramDecl>,
}

impl Rule {
    pub fn is_empty(&self) -> bool {
        self.options.is_empty() && self.programs.is_empty()
    }
}

/// Rule attached to a field, plus the required-field flag.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FieldRule {
    #[serde(flatten)]
    pub rule: Rule,
    /// Fails validation when the field has no value.
    pub required: bool,
}

/// Rule attached to a message, with per-field child rules.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MessageRule {
    #[serde(flatten)]
    pub rule: Rule,
    /// Child rules keyed by field name.
    pub fields: BTreeMap<String, FieldRule>,
}

/// Rule attached to a method.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MethodRule {
    #[serde(flatten)]
    pub rule: Rule,
}

/// Rule attached to a service, with per-method child rules.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServiceRule {
    #[serde(flatten)]
    pub rule: Rule,
    /// Child rules keyed by method name.
    pub methods: BTreeMap<String, MethodRule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_rule() {
        assert!(Rule::default().is_empty());
        let rule = Rule {
            programs: vec![ProgramDecl::new("p", "true")],
            ..Default::default()
        };
        assert!(!rule.is_empty());
    }
}
