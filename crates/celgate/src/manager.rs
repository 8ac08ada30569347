//! Validator construction, memoization, and the manager registry.
//!
//! A [`Manager`] owns one schema pool and builds validators for its
//! descriptors at most once each, no matter how many threads ask first.
//! Construction happens inside the cache's entry lock, so contending first
//! callers serialize on the shard and later callers get the memoized value.
//!
//! Managers register in an explicit [`Registry`] keyed by package name;
//! [`Registry::load_library`] broadcasts an expression library to every
//! manager whose package matches a glob. Injection is rejected once a
//! manager has built any validator, keeping what already-built validators
//! observed deterministic.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use globset::Glob;
use prost_reflect::{
    DescriptorPool, DynamicMessage, MessageDescriptor, ReflectMessage, ServiceDescriptor,
};
use prost_types::FieldMask;
use tracing::debug;

use crate::compile::compile_rule;
use crate::config::Config;
use crate::envbuild::{EnvBuilder, EnvScope, Library, MessageValidate, ValidateBinding};
use crate::error::Error;
use crate::extension;
use crate::resolve::Resolver;
use crate::resource::{self, PatternMap};
use crate::validator::{
    FieldValidator, MessageValidator, MethodValidator, ServiceValidator, ValidatorSource,
};

/// Builds and caches validators for one schema pool.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    pool: DescriptorPool,
    package: String,
    config: Config,
    patterns: PatternMap,
    services: DashMap<String, Arc<ServiceValidator>>,
    messages: DashMap<String, Arc<MessageValidator>>,
    libraries: RwLock<Vec<Library>>,
    built: AtomicBool,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("package", &self.inner.package)
            .field("services", &self.inner.services.len())
            .field("messages", &self.inner.messages.len())
            .finish()
    }
}

impl Manager {
    /// Create a manager over an already-linked descriptor pool.
    ///
    /// The resource pattern map is derived from the pool's annotations once
    /// here.
    pub fn new(pool: DescriptorPool, config: Config) -> Manager {
        let patterns = resource::generate_pattern_map(&pool);
        let package = derive_package(&pool);
        Manager {
            inner: Arc::new(ManagerInner {
                pool,
                package,
                config,
                patterns,
                services: DashMap::new(),
                messages: DashMap::new(),
                libraries: RwLock::new(Vec::new()),
                built: AtomicBool::new(false),
            }),
        }
    }

    /// The package name this manager registers under.
    pub fn package(&self) -> &str {
        &self.inner.package
    }

    /// The schema pool this manager wraps.
    pub fn pool(&self) -> &DescriptorPool {
        &self.inner.pool
    }

    /// Inject an expression library into every environment this manager
    /// builds from now on.
    ///
    /// Rejected once any validator has been built: validators compiled
    /// without the library would silently disagree with ones compiled
    /// after it.
    pub fn load_library(&self, library: Library) -> Result<(), Error> {
        if self.inner.built.load(Ordering::SeqCst) {
            return Err(Error::LibraryAfterBuild {
                package: self.inner.package.clone(),
                library: library.name,
            });
        }
        debug!(package = %self.inner.package, library = %library.name, "library loaded");
        let mut libraries = self
            .inner
            .libraries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        libraries.push(library);
        Ok(())
    }

    /// The validator for a service, built at most once.
    pub fn get_service_validator(
        &self,
        service: &ServiceDescriptor,
    ) -> Result<Arc<ServiceValidator>, Error> {
        if let Some(validator) = self.inner.services.get(service.full_name()) {
            return Ok(validator.value().clone());
        }
        match self.inner.services.entry(service.full_name().to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(slot) => {
                self.inner.built.store(true, Ordering::SeqCst);
                debug!(service = %service.full_name(), "building service validator");
                let validator = Arc::new(self.build_service_validator(service)?);
                slot.insert(validator.clone());
                Ok(validator)
            }
        }
    }

    /// The validator for a service, looked up by fully-qualified name.
    pub fn get_service_validator_by_name(
        &self,
        name: &str,
    ) -> Result<Arc<ServiceValidator>, Error> {
        let service = self
            .inner
            .pool
            .get_service_by_name(name)
            .ok_or_else(|| Error::MissingDescriptor(name.to_string()))?;
        self.get_service_validator(&service)
    }

    /// The validator for a message, built at most once.
    pub fn get_message_validator(
        &self,
        message: &MessageDescriptor,
    ) -> Result<Arc<MessageValidator>, Error> {
        if let Some(validator) = self.inner.messages.get(message.full_name()) {
            return Ok(validator.value().clone());
        }
        match self.inner.messages.entry(message.full_name().to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(slot) => {
                self.inner.built.store(true, Ordering::SeqCst);
                debug!(message = %message.full_name(), "building message validator");
                let validator = Arc::new(self.build_message_validator(message)?);
                slot.insert(validator.clone());
                Ok(validator)
            }
        }
    }

    /// The validator for a message, looked up by fully-qualified name.
    pub fn get_message_validator_by_name(
        &self,
        name: &str,
    ) -> Result<Arc<MessageValidator>, Error> {
        let message = self
            .inner
            .pool
            .get_message_by_name(name)
            .ok_or_else(|| Error::MissingDescriptor(name.to_string()))?;
        self.get_message_validator(&message)
    }

    /// Eagerly build every validator in the pool so startup surfaces
    /// compile errors before traffic does.
    pub fn build_all(&self) -> Result<(), Error> {
        for file in self.inner.pool.files() {
            let package = file.package_name();
            if package.starts_with("google.") || package == "celgate" {
                continue;
            }
            for service in file.services() {
                self.get_service_validator(&service)?;
            }
            let mut stack: Vec<MessageDescriptor> = file.messages().collect();
            while let Some(message) = stack.pop() {
                stack.extend(message.child_messages());
                if self.message_has_rule(&message) {
                    self.get_message_validator(&message)?;
                }
            }
        }
        Ok(())
    }

    fn build_service_validator(
        &self,
        service: &ServiceDescriptor,
    ) -> Result<ServiceValidator, Error> {
        let resolver = Resolver::new(&self.inner.config, &self.inner.patterns);
        let resolved = resolver.service_rule(service)?;
        let libraries = self.libraries_snapshot();
        let has_rule = |message: &MessageDescriptor| self.message_has_rule(message);

        let env = EnvBuilder::new(EnvScope::Service, &resolved.rule.options, &self.inner.pool)
            .with_libraries(&libraries)
            .build()?;
        let programs = compile_rule(&resolved.rule, &env, service.full_name())?;

        let mut methods = BTreeMap::new();
        for method in service.methods() {
            let Some(rule) = resolved.methods.get(method.name()) else {
                continue;
            };
            let request = method.input();
            let env = EnvBuilder::new(
                EnvScope::Method { request: &request },
                &rule.rule.options,
                &self.inner.pool,
            )
            .with_libraries(&libraries)
            .with_validate_binding(self.validate_binding(), &has_rule)
            .build()?;
            let programs = compile_rule(&rule.rule, &env, method.full_name())?;
            methods.insert(
                method.name().to_string(),
                MethodValidator::new(method.clone(), programs),
            );
        }
        Ok(ServiceValidator::new(service.clone(), programs, methods))
    }

    fn build_message_validator(
        &self,
        message: &MessageDescriptor,
    ) -> Result<MessageValidator, Error> {
        let resolver = Resolver::new(&self.inner.config, &self.inner.patterns);
        let resolved = resolver.message_rule(message)?;
        let libraries = self.libraries_snapshot();
        let has_rule = |message: &MessageDescriptor| self.message_has_rule(message);

        let env = EnvBuilder::new(
            EnvScope::Message { message },
            &resolved.rule.options,
            &self.inner.pool,
        )
        .with_libraries(&libraries)
        .with_validate_binding(self.validate_binding(), &has_rule)
        .build()?;
        let programs = compile_rule(&resolved.rule, &env, message.full_name())?;

        let mut fields = BTreeMap::new();
        for (name, field_rule) in &resolved.fields {
            let Some(field) = message.get_field_by_name(name) else {
                return Err(Error::MissingDescriptor(format!(
                    "{}.{}",
                    message.full_name(),
                    name
                )));
            };
            let env = EnvBuilder::new(
                EnvScope::Field { message },
                &field_rule.rule.options,
                &self.inner.pool,
            )
            .with_libraries(&libraries)
            .with_validate_binding(self.validate_binding(), &has_rule)
            .build()?;
            let programs = compile_rule(&field_rule.rule, &env, field.full_name())?;
            fields.insert(
                name.clone(),
                FieldValidator::new(field, field_rule.required, programs),
            );
        }

        Ok(MessageValidator::new(message.clone(), programs, fields)
            .with_source(Arc::new(ManagerHook {
                inner: Arc::downgrade(&self.inner),
            })))
    }

    /// Whether the descriptor carries rule data directly: an embedded or
    /// configured message rule, or any field with a rule, required flag, or
    /// resource reference.
    fn message_has_rule(&self, message: &MessageDescriptor) -> bool {
        let configured = self
            .inner
            .config
            .message_rule(message.full_name())
            .map(|m| !m.rule.is_empty() || !m.fields.is_empty())
            .unwrap_or(false);
        if configured {
            return true;
        }
        if matches!(extension::message_rule(message), Ok(Some(_))) {
            return true;
        }
        message.fields().any(|field| {
            matches!(extension::field_rule(&field), Ok(Some(_)))
                || extension::field_required(&field)
                || extension::resource_reference(&field).is_some()
        })
    }

    fn libraries_snapshot(&self) -> Vec<Library> {
        self.inner
            .libraries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn validate_binding(&self) -> ValidateBinding {
        ValidateBinding::OnDemand(Arc::new(ManagerHook {
            inner: Arc::downgrade(&self.inner),
        }))
    }
}

/// Resolves `validate()` calls and nested-mask recursion back through the
/// owning manager. Holds a weak reference so cached validators do not keep
/// the manager alive through a cycle.
struct ManagerHook {
    inner: Weak<ManagerInner>,
}

impl ManagerHook {
    fn manager(&self) -> Result<Manager, Error> {
        self.inner
            .upgrade()
            .map(|inner| Manager { inner })
            .ok_or_else(|| Error::MissingDescriptor("manager released".to_string()))
    }
}

impl MessageValidate for ManagerHook {
    fn validate(&self, message: &DynamicMessage, mask: Option<&FieldMask>) -> Result<(), Error> {
        let validator = self
            .manager()?
            .get_message_validator(&message.descriptor())?;
        match mask {
            Some(mask) => validator.validate_with_mask(message, Some(mask)),
            None => validator.validate(message),
        }
    }
}

impl ValidatorSource for ManagerHook {
    fn message_validator(
        &self,
        message: &MessageDescriptor,
    ) -> Result<Arc<MessageValidator>, Error> {
        self.manager()?.get_message_validator(message)
    }
}

/// The package a manager registers under: the first non-ambient package in
/// its pool.
fn derive_package(pool: &DescriptorPool) -> String {
    pool.files()
        .map(|file| file.package_name().to_string())
        .find(|package| {
            !package.is_empty() && !package.starts_with("google.") && package != "celgate"
        })
        .unwrap_or_default()
}

/// An explicit, injectable registry of managers keyed by package name.
#[derive(Debug, Default)]
pub struct Registry {
    managers: DashMap<String, Manager>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Register a manager under its package name.
    pub fn register(&self, manager: Manager) -> Result<(), Error> {
        match self.managers.entry(manager.package().to_string()) {
            Entry::Occupied(entry) => Err(Error::DuplicateRegistration(entry.key().clone())),
            Entry::Vacant(slot) => {
                debug!(package = %manager.package(), "manager registered");
                slot.insert(manager);
                Ok(())
            }
        }
    }

    /// The manager registered for a package, if any.
    pub fn manager(&self, package: &str) -> Option<Manager> {
        self.managers.get(package).map(|entry| entry.value().clone())
    }

    /// Broadcast a library to every manager whose package matches the
    /// glob.
    ///
    /// Managers that already built a validator reject the injection; the
    /// first rejection is reported after the remaining matches were still
    /// attempted.
    pub fn load_library(&self, pattern: &str, library: Library) -> Result<(), Error> {
        let glob = Glob::new(pattern)
            .map_err(|err| Error::InvalidPattern {
                pattern: pattern.to_string(),
                reason: err.to_string(),
            })?
            .compile_matcher();

        let mut result = Ok(());
        for entry in self.managers.iter() {
            if !glob.is_match(entry.key()) {
                continue;
            }
            debug!(package = %entry.key(), library = %library.name, "broadcasting library");
            if let Err(err) = entry.value().load_library(library.clone()) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, MethodDescriptorProto,
        ServiceDescriptorProto,
    };

    fn demo_pool() -> DescriptorPool {
        use prost_types::field_descriptor_proto::Type;
        let file = FileDescriptorProto {
            name: Some("demo/v1/demo.proto".to_string()),
            package: Some("demo.v1".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![
                DescriptorProto {
                    name: Some("PingRequest".to_string()),
                    field: vec![FieldDescriptorProto {
                        name: Some("ping".to_string()),
                        number: Some(1),
                        r#type: Some(Type::String as i32),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                DescriptorProto {
                    name: Some("PingResponse".to_string()),
                    ..Default::default()
                },
            ],
            service: vec![ServiceDescriptorProto {
                name: Some("Demo".to_string()),
                method: vec![MethodDescriptorProto {
                    name: Some("Send".to_string()),
                    input_type: Some(".demo.v1.PingRequest".to_string()),
                    output_type: Some(".demo.v1.PingResponse".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut pool = DescriptorPool::new();
        pool.add_file_descriptor_proto(file).unwrap();
        pool
    }

    #[test]
    fn package_is_derived_from_the_pool() {
        let manager = Manager::new(demo_pool(), Config::default());
        assert_eq!(manager.package(), "demo.v1");
    }

    #[test]
    fn validators_are_memoized() {
        let manager = Manager::new(demo_pool(), Config::default());
        let first = manager
            .get_message_validator_by_name("demo.v1.PingRequest")
            .unwrap();
        let second = manager
            .get_message_validator_by_name("demo.v1.PingRequest")
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn missing_descriptor_is_an_error() {
        let manager = Manager::new(demo_pool(), Config::default());
        assert!(matches!(
            manager.get_message_validator_by_name("demo.v1.Nope"),
            Err(Error::MissingDescriptor(_))
        ));
    }

    #[test]
    fn library_injection_closes_after_first_build() {
        let manager = Manager::new(demo_pool(), Config::default());
        manager.load_library(Library::new("early")).unwrap();

        manager
            .get_message_validator_by_name("demo.v1.PingRequest")
            .unwrap();
        assert!(matches!(
            manager.load_library(Library::new("late")),
            Err(Error::LibraryAfterBuild { .. })
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = Registry::new();
        registry
            .register(Manager::new(demo_pool(), Config::default()))
            .unwrap();
        assert!(matches!(
            registry.register(Manager::new(demo_pool(), Config::default())),
            Err(Error::DuplicateRegistration(_))
        ));
    }

    #[test]
    fn broadcast_matches_by_glob() {
        let registry = Registry::new();
        let manager = Manager::new(demo_pool(), Config::default());
        registry.register(manager.clone()).unwrap();

        registry
            .load_library("demo.*", Library::new("lib"))
            .unwrap();
        // Unmatched globs are a no-op, bad globs are errors.
        registry
            .load_library("other.*", Library::new("lib"))
            .unwrap();
        assert!(matches!(
            registry.load_library("[", Library::new("lib")),
            Err(Error::InvalidPattern { .. })
        ));
    }

    #[test]
    fn concurrent_first_access_builds_once() {
        let manager = Manager::new(demo_pool(), Config::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    manager
                        .get_message_validator_by_name("demo.v1.PingRequest")
                        .unwrap()
                })
            })
            .collect();
        let validators: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for validator in &validators[1..] {
            assert!(Arc::ptr_eq(&validators[0], validator));
        }
    }
}
