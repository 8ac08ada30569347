//! Five-scope rule resolution.
//!
//! The effective rule for a scope merges up to four precedence sources, in
//! order: (a) externally supplied configuration matched by fully-qualified
//! name, (b) rule data embedded in the owning file's options, (c) the
//! enclosing scope's already-merged rule (service for methods, message for
//! fields), and (d) rule data embedded in the scope's own options. Options
//! merge cumulatively with (d) winning ties; programs come from the most
//! specific source that declares any, the scope's own declarations ahead
//! of inherited ones.

use prost_reflect::{
    FieldDescriptor, FileDescriptor, MessageDescriptor, MethodDescriptor, ServiceDescriptor,
};

use crate::config::Config;
use crate::error::Error;
use crate::extension;
use crate::options::RuleOptions;
use crate::resource::{self, PatternMap};
use crate::rule::{FieldRule, MessageRule, MethodRule, Rule, ServiceRule};

/// Resolves merged rules for descriptors against a configuration and the
/// schema's resource pattern map.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    config: &'a Config,
    patterns: &'a PatternMap,
}

impl<'a> Resolver<'a> {
    pub fn new(config: &'a Config, patterns: &'a PatternMap) -> Self {
        Self { config, patterns }
    }

    /// The merged file-level rule.
    pub fn file_rule(&self, file: &FileDescriptor) -> Result<Rule, Error> {
        let own = extension::file_rule(file)?;
        Ok(merge_sources(
            self.config.file_rule(file.name()),
            None,
            None,
            own,
        ))
    }

    /// The merged service rule, with every method's rule resolved beneath
    /// it.
    pub fn service_rule(&self, service: &ServiceDescriptor) -> Result<ServiceRule, Error> {
        let file = service.parent_file();
        let file_ext = extension::file_rule(&file)?;
        let enclosing = self.file_rule(&file)?;
        let own = extension::service_rule(service)?;

        let rule = merge_sources(
            self.config
                .service_rule(service.full_name())
                .map(|s| &s.rule),
            file_ext.as_ref(),
            Some(&enclosing),
            own,
        );

        let mut methods = std::collections::BTreeMap::new();
        for method in service.methods() {
            methods.insert(
                method.name().to_string(),
                self.method_rule(&method, &rule)?,
            );
        }
        Ok(ServiceRule { rule, methods })
    }

    /// The merged rule for a method, given its service's merged rule.
    pub fn method_rule(
        &self,
        method: &MethodDescriptor,
        service: &Rule,
    ) -> Result<MethodRule, Error> {
        let service_desc = method.parent_service();
        let file_ext = extension::file_rule(&service_desc.parent_file())?;
        let own = extension::method_rule(method)?;

        let rule = merge_sources(
            self.config
                .method_rule(service_desc.full_name(), method.name())
                .map(|m| &m.rule),
            file_ext.as_ref(),
            Some(service),
            own,
        );
        Ok(MethodRule { rule })
    }

    /// The merged message rule, with every field's rule resolved beneath
    /// it (including synthesized resource reference rules).
    pub fn message_rule(&self, message: &MessageDescriptor) -> Result<MessageRule, Error> {
        let file = message.parent_file();
        let file_ext = extension::file_rule(&file)?;
        let enclosing = self.file_rule(&file)?;
        let own = extension::message_rule(message)?;

        let rule = merge_sources(
            self.config
                .message_rule(message.full_name())
                .map(|m| &m.rule),
            file_ext.as_ref(),
            Some(&enclosing),
            own,
        );

        let mut fields = std::collections::BTreeMap::new();
        for field in message.fields() {
            let resolved = self.field_rule(&field, message, &rule)?;
            // Rule-free fields stay out of the map so validators know the
            // field needs no work.
            if !resolved.rule.is_empty() || resolved.required {
                fields.insert(field.name().to_string(), resolved);
            }
        }
        Ok(MessageRule { rule, fields })
    }

    /// The merged rule for a field, given its enclosing message and the
    /// message's merged rule.
    pub fn field_rule(
        &self,
        field: &FieldDescriptor,
        message_desc: &MessageDescriptor,
        message: &Rule,
    ) -> Result<FieldRule, Error> {
        let config = self.config.field_rule(message_desc.full_name(), field.name());
        let own = extension::field_rule(field)?;
        let file_ext = extension::file_rule(&message_desc.parent_file())?;

        let mut rule = merge_sources(
            config.map(|f| &f.rule),
            file_ext.as_ref(),
            Some(message),
            own.as_ref().map(|f| f.rule.clone()),
        );
        if let Some(synthesized) = resource::field_reference_rule(field, self.patterns)? {
            rule.programs.push(synthesized);
        }

        let required = own.map(|f| f.required).unwrap_or(false)
            || config.map(|f| f.required).unwrap_or(false)
            || extension::field_required(field);
        Ok(FieldRule { rule, required })
    }
}

/// Merge the four precedence sources into one rule.
///
/// Options accumulate in `(a) config → (b) file → (c) enclosing → (d) own`
/// order so later sources win conflicting keys. Programs come from the
/// most specific source that declares any: the scope's own declarations
/// (embedded first, then configured) fully replace inherited ones, so a
/// method with its own programs never also runs its service's.
fn merge_sources(
    config: Option<&Rule>,
    file: Option<&Rule>,
    enclosing: Option<&Rule>,
    own: Option<Rule>,
) -> Rule {
    let mut options = RuleOptions::default();
    for source in [config, file, enclosing, own.as_ref()].into_iter().flatten() {
        options.merge(&source.options);
    }

    let programs = [own.as_ref(), config, enclosing, file]
        .into_iter()
        .flatten()
        .map(|rule| &rule.programs)
        .find(|programs| !programs.is_empty())
        .cloned()
        .unwrap_or_default();

    Rule { options, programs }
}
