//! Externally supplied configuration.
//!
//! Hosts can supply rule data with the same shape as the extension-embedded
//! declarations, keyed by file name and fully-qualified descriptor names.
//! This is the lowest-precedence source in resolution: extension data and
//! more specific scopes merge over it. Loading the configuration from YAML
//! or JSON is the host's concern; the types here only define the shape.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::rule::{FieldRule, MessageRule, MethodRule, Rule, ServiceRule};

/// Externally supplied rule configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// File-level rules keyed by file path (e.g. `demo/v1/demo.proto`).
    pub files: BTreeMap<String, Rule>,
    /// Service rules keyed by fully-qualified service name.
    pub services: BTreeMap<String, ServiceRule>,
    /// Message rules keyed by fully-qualified message name.
    pub messages: BTreeMap<String, MessageRule>,
}

impl Config {
    pub fn file_rule(&self, file_name: &str) -> Option<&Rule> {
        self.files.get(file_name)
    }

    pub fn service_rule(&self, service: &str) -> Option<&ServiceRule> {
        self.services.get(service)
    }

    pub fn method_rule(&self, service: &str, method: &str) -> Option<&MethodRule> {
        self.services.get(service)?.methods.get(method)
    }

    pub fn message_rule(&self, message: &str) -> Option<&MessageRule> {
        self.messages.get(message)
    }

    pub fn field_rule(&self, message: &str, field: &str) -> Option<&FieldRule> {
        self.messages.get(message)?.fields.get(field)
    }
}
