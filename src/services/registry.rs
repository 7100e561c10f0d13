//! Service type registration and the service registry

use futures::future::join_all;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use tracing::{info, warn};

use super::{alertmanager, elasticsearch, pagerduty, prometheus};
use super::{Service, ServiceConfig, ServiceError};
use crate::agents::tool::Tool;

/// Identity of a configured service, handed to its factory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub service_type: String,
    pub description: String,
}

/// Options decoded by a type's parser, waiting for its factory
pub type ParsedOptions = Box<dyn Any + Send + Sync>;

type OptionsParser = dyn Fn(&str, &Value) -> Result<ParsedOptions, ServiceError> + Send + Sync;
type ServiceFactory = dyn Fn(ServiceSpec, ParsedOptions) -> Result<Arc<dyn Service>, ServiceError> + Send + Sync;

/// Maps a service type tag to its options parser and its factory
#[derive(Default)]
pub struct ServiceTypeRegistry {
    parsers: RwLock<HashMap<String, Arc<OptionsParser>>>,
    factories: RwLock<HashMap<String, Arc<ServiceFactory>>>,
}

impl ServiceTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type whose options decode into `O`
    pub fn register<O, F>(&self, service_type: &str, factory: F)
    where
        O: DeserializeOwned + Send + Sync + 'static,
        F: Fn(ServiceSpec, O) -> Result<Arc<dyn Service>, ServiceError> + Send + Sync + 'static,
    {
        let parser: Arc<OptionsParser> = Arc::new(|name: &str, raw: &Value| {
            let raw = if raw.is_null() {
                Value::Object(Default::default())
            } else {
                raw.clone()
            };
            let options: O = serde_json::from_value(raw).map_err(|e| ServiceError::InvalidOptions {
                service: name.to_string(),
                message: e.to_string(),
            })?;
            Ok(Box::new(options) as ParsedOptions)
        });

        let type_tag = service_type.to_string();
        let factory: Arc<ServiceFactory> = Arc::new(move |spec: ServiceSpec, options: ParsedOptions| {
            let options = options.downcast::<O>().map_err(|_| ServiceError::InvalidOptions {
                service: spec.name.clone(),
                message: format!("options were not parsed for type {}", type_tag),
            })?;
            factory(spec, *options)
        });

        self.parsers.write().insert(service_type.to_string(), parser);
        self.factories.write().insert(service_type.to_string(), factory);
    }

    pub fn is_registered(&self, service_type: &str) -> bool {
        self.parsers.read().contains_key(service_type)
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.parsers.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Decode the opaque options of one service
    pub fn parse(&self, name: &str, service_type: &str, options: &Value) -> Result<ParsedOptions, ServiceError> {
        let parser = self
            .parsers
            .read()
            .get(service_type)
            .cloned()
            .ok_or_else(|| ServiceError::NoParser(service_type.to_string()))?;
        parser(name, options)
    }

    pub fn create(&self, spec: ServiceSpec, options: ParsedOptions) -> Result<Arc<dyn Service>, ServiceError> {
        let factory = self
            .factories
            .read()
            .get(&spec.service_type)
            .cloned()
            .ok_or_else(|| ServiceError::NoFactory(spec.service_type.clone()))?;
        factory(spec, options)
    }
}

static SERVICE_TYPES: Lazy<ServiceTypeRegistry> = Lazy::new(ServiceTypeRegistry::new);
static BUILTINS: Once = Once::new();

/// The process-wide type registry
pub fn service_types() -> &'static ServiceTypeRegistry {
    &SERVICE_TYPES
}

/// Register the built-in service types in the process-wide registry; idempotent
pub fn register_builtin_services() {
    BUILTINS.call_once(|| {
        let types = service_types();
        prometheus::register(types);
        alertmanager::register(types);
        elasticsearch::register(types);
        pagerduty::register(types);
    });
}

/// Owns every enabled service
pub struct ServiceRegistry {
    services: Vec<Arc<dyn Service>>,
    index: HashMap<String, usize>,
    closed: AtomicBool,
}

impl ServiceRegistry {
    pub fn empty() -> Self {
        Self {
            services: Vec::new(),
            index: HashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Instantiate each enabled service: parse its options, then call its factory
    pub fn build<'a>(
        types: &ServiceTypeRegistry,
        configs: impl IntoIterator<Item = (&'a String, &'a ServiceConfig)>,
    ) -> Result<Self, ServiceError> {
        let mut configs: Vec<_> = configs.into_iter().filter(|(_, c)| c.enabled).collect();
        configs.sort_by(|a, b| a.0.cmp(b.0));

        let mut registry = Self::empty();
        for (name, config) in configs {
            let options = types.parse(name, &config.service_type, &config.options)?;
            let spec = ServiceSpec {
                name: name.clone(),
                service_type: config.service_type.clone(),
                description: config.description.clone(),
            };
            let service = types.create(spec, options)?;
            info!(service = %name, service_type = %config.service_type, "Service registered");
            registry.insert(service);
        }
        Ok(registry)
    }

    /// Add a constructed service; a later service with the same name replaces it
    pub fn insert(&mut self, service: Arc<dyn Service>) {
        let name = service.name().to_string();
        match self.index.get(&name) {
            Some(&i) => self.services[i] = service,
            None => {
                self.index.insert(name, self.services.len());
                self.services.push(service);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.index.get(name).map(|&i| self.services[i].clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// One tool per service, in registration order
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.services.iter().map(|s| s.clone().as_tool()).collect()
    }

    /// Tools of the services with the given type tag
    pub fn tools_of_type(&self, service_type: &str) -> Vec<Arc<dyn Tool>> {
        self.services
            .iter()
            .filter(|s| s.service_type() == service_type)
            .map(|s| s.clone().as_tool())
            .collect()
    }

    /// Run every health check concurrently
    pub async fn health_all(&self) -> Vec<(String, Result<(), ServiceError>)> {
        let checks = self.services.iter().map(|service| async move {
            (service.name().to_string(), service.health().await)
        });
        join_all(checks).await
    }

    /// Close every service in reverse order, collecting failures
    ///
    /// Only the first call closes anything.
    pub async fn close_all(&self) -> Vec<String> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let mut errors = Vec::new();
        for service in self.services.iter().rev() {
            if let Err(e) = service.close().await {
                warn!(service = %service.name(), error = %e, "Failed to close service");
                errors.push(format!("service {}: {}", service.name(), e));
            }
        }
        errors
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
