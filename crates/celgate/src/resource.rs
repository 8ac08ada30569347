//! Resource name patterns and the field rules synthesized from them.
//!
//! Messages annotated with a resource descriptor declare the name patterns
//! their instances live under (`shelves/{shelf}/books/{book}`). Fields that
//! reference a resource type get an auto-generated rule: the field value
//! must match one of the referenced type's patterns. An exact `type`
//! reference anchors the regex at both ends; a `child_type` reference
//! anchors only the start, so any name under the resource's namespace
//! matches.

use std::collections::BTreeMap;

use prost_reflect::{DescriptorPool, FieldDescriptor};
use tracing::debug;

use crate::error::Error;
use crate::extension::{self, ResourceReference};
use crate::rule::ProgramDecl;

/// Regex fragment substituted for each `{...}` placeholder.
const SEGMENT_PATTERN: &str = r"[\w\-.]+";

/// Alternation regexes keyed by resource type name, unanchored.
pub type PatternMap = BTreeMap<String, String>;

/// Scan every message in the pool for resource annotations and build the
/// pattern map.
pub fn generate_pattern_map(pool: &DescriptorPool) -> PatternMap {
    let mut patterns = PatternMap::new();
    for message in pool.all_messages() {
        let Some(annotation) = extension::resource(&message) else {
            continue;
        };
        if annotation.type_name.is_empty() || annotation.patterns.is_empty() {
            continue;
        }
        let alternation = annotation
            .patterns
            .iter()
            .map(|pattern| pattern_to_regex(pattern))
            .collect::<Vec<_>>()
            .join("|");
        debug!(
            resource = %annotation.type_name,
            regex = %alternation,
            "synthesized resource pattern"
        );
        patterns.insert(annotation.type_name, alternation);
    }
    patterns
}

/// Rewrite a name pattern into a regex: literal segments are escaped,
/// `{...}` placeholders become generic segment matchers.
fn pattern_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 16);
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        regex.push_str(&regex::escape(&rest[..open]));
        match rest[open..].find('}') {
            Some(close) => {
                regex.push_str(SEGMENT_PATTERN);
                rest = &rest[open + close + 1..];
            }
            None => {
                // Unbalanced brace, treat the rest literally.
                regex.push_str(&regex::escape(&rest[open..]));
                rest = "";
            }
        }
    }
    regex.push_str(&regex::escape(rest));
    regex
}

/// The rule expression synthesized for a resource-referencing field, if the
/// field carries a reference annotation.
///
/// Returns `None` for unannotated fields and wildcard (`"*"`) references.
pub fn field_reference_rule(
    field: &FieldDescriptor,
    patterns: &PatternMap,
) -> Result<Option<ProgramDecl>, Error> {
    let Some(reference) = extension::resource_reference(field) else {
        return Ok(None);
    };
    synthesize_reference_rule(field.name(), field.is_list(), &reference, patterns)
}

/// Build the match expression for a reference annotation.
///
/// Split from [`field_reference_rule`] so the synthesis logic is usable
/// against references from any source.
pub fn synthesize_reference_rule(
    field_name: &str,
    repeated: bool,
    reference: &ResourceReference,
    patterns: &PatternMap,
) -> Result<Option<ProgramDecl>, Error> {
    let (resource_type, exact) = match (&reference.type_name, &reference.child_type) {
        (t, c) if !t.is_empty() && !c.is_empty() => {
            return Err(Error::ConflictingResourceReference(field_name.to_string()));
        }
        (t, _) if !t.is_empty() => (t, true),
        (_, c) if !c.is_empty() => (c, false),
        _ => return Ok(None),
    };
    if resource_type == "*" {
        return Ok(None);
    }
    let Some(alternation) = patterns.get(resource_type) else {
        return Err(Error::UnknownResourceType {
            type_name: resource_type.clone(),
            field: field_name.to_string(),
        });
    };

    // An exact reference is the whole name; a child reference is a prefix.
    let anchored = if exact {
        format!("^(?:{})$", alternation)
    } else {
        format!("^(?:{})", alternation)
    };
    let literal = cel_string_literal(&anchored);
    let expression = if repeated {
        format!("{}.all(s, s.matches({}))", field_name, literal)
    } else {
        format!("{}.matches({})", field_name, literal)
    };
    Ok(Some(ProgramDecl::new(
        format!("{}_resource_reference", field_name),
        expression,
    )))
}

/// Quote a string as a CEL single-quoted literal.
fn cel_string_literal(value: &str) -> String {
    let mut literal = String::with_capacity(value.len() + 2);
    literal.push('\'');
    for c in value.chars() {
        match c {
            '\\' => literal.push_str("\\\\"),
            '\'' => literal.push_str("\\'"),
            c => literal.push(c),
        }
    }
    literal.push('\'');
    literal
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn patterns(pairs: &[(&str, &[&str])]) -> PatternMap {
        pairs
            .iter()
            .map(|(name, pats)| {
                let alternation = pats
                    .iter()
                    .map(|p| pattern_to_regex(p))
                    .collect::<Vec<_>>()
                    .join("|");
                (name.to_string(), alternation)
            })
            .collect()
    }

    fn exact(type_name: &str) -> ResourceReference {
        ResourceReference {
            type_name: type_name.to_string(),
            ..Default::default()
        }
    }

    fn child(child_type: &str) -> ResourceReference {
        ResourceReference {
            child_type: child_type.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn placeholder_becomes_segment_matcher() {
        let regex = Regex::new(&format!("^(?:{})$", pattern_to_regex("a/{id}"))).unwrap();
        assert!(regex.is_match("a/123"));
        assert!(regex.is_match("a/x-y.z"));
        assert!(!regex.is_match("b/123"));
        assert!(!regex.is_match("a/123/extra"));
    }

    #[test]
    fn child_reference_anchors_start_only() {
        let map = patterns(&[("T", &["a/{id}"])]);
        let decl = synthesize_reference_rule("name", false, &child("T"), &map)
            .unwrap()
            .unwrap();
        // The synthesized expression embeds a prefix-anchored pattern.
        assert!(decl.expression.contains("^(?:"));
        assert!(!decl.expression.contains("$"));

        let regex = Regex::new(&format!("^(?:{})", map["T"])).unwrap();
        assert!(regex.is_match("a/123/extra"));
    }

    #[test]
    fn multiple_patterns_join_as_alternation() {
        let map = patterns(&[("T", &["a/{x}", "b/{x}/c/{y}"])]);
        let regex = Regex::new(&format!("^(?:{})$", map["T"])).unwrap();
        assert!(regex.is_match("a/1"));
        assert!(regex.is_match("b/1/c/2"));
        assert!(!regex.is_match("b/1/c"));
    }

    #[test]
    fn singular_and_repeated_forms() {
        let map = patterns(&[("T", &["a/{id}"])]);
        let singular = synthesize_reference_rule("ref", false, &exact("T"), &map)
            .unwrap()
            .unwrap();
        assert!(singular.expression.starts_with("ref.matches("));

        let repeated = synthesize_reference_rule("refs", true, &exact("T"), &map)
            .unwrap()
            .unwrap();
        assert!(repeated.expression.starts_with("refs.all(s, s.matches("));
    }

    #[test]
    fn synthesized_expression_parses_and_evaluates() {
        use celgate_cel::activation::MapActivation;
        use celgate_cel::{parse, Value};

        let map = patterns(&[("T", &["a/{id}"])]);
        let decl = synthesize_reference_rule("ref", false, &exact("T"), &map)
            .unwrap()
            .unwrap();
        let expr = parse(&decl.expression).unwrap();

        let env = celgate_cel::Env::with_standard_library();
        let registry = env.runtime_functions();
        let evaluator = celgate_cel::eval::Evaluator::new(&registry);

        let mut activation = MapActivation::new();
        activation.insert("ref", "a/123");
        assert_eq!(evaluator.eval(&expr, &activation), Value::Bool(true));

        let mut activation = MapActivation::new();
        activation.insert("ref", "b/123");
        assert_eq!(evaluator.eval(&expr, &activation), Value::Bool(false));
    }

    #[test]
    fn conflicting_reference_is_an_error() {
        let map = patterns(&[("T", &["a/{id}"])]);
        let both = ResourceReference {
            type_name: "T".to_string(),
            child_type: "T".to_string(),
        };
        assert!(matches!(
            synthesize_reference_rule("f", false, &both, &map),
            Err(Error::ConflictingResourceReference(_))
        ));
    }

    #[test]
    fn unknown_type_is_an_error_and_wildcard_is_not() {
        let map = PatternMap::new();
        assert!(matches!(
            synthesize_reference_rule("f", false, &exact("Missing"), &map),
            Err(Error::UnknownResourceType { .. })
        ));
        assert!(synthesize_reference_rule("f", false, &exact("*"), &map)
            .unwrap()
            .is_none());
    }
}
