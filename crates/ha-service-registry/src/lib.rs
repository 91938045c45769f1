//! Registry of callable services
//!
//! Integrations register async handlers under `domain.service`. Service data
//! can be checked against a JSON schema before the handler sees it, and a
//! handler may return a response when the caller asks for one.

use dashmap::DashMap;
use ha_core::events::CallServiceData;
use ha_core::{Context, ServiceCall, SupportsResponse};
use ha_event_bus::EventBus;
use jsonschema::JSONSchema;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub type ServiceResult = Result<Option<serde_json::Value>, ServiceError>;

pub type ServiceFuture = Pin<Box<dyn Future<Output = ServiceResult> + Send>>;

pub type ServiceHandler = Arc<dyn Fn(ServiceCall) -> ServiceFuture + Send + Sync>;

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("service not found: {domain}.{service}")]
    NotFound { domain: String, service: String },

    #[error("service call failed: {0}")]
    CallFailed(String),

    #[error("invalid service data: {0}")]
    InvalidData(String),

    #[error("invalid schema for {service}: {message}")]
    InvalidSchema { service: String, message: String },

    #[error("service does not support responses")]
    ResponseNotSupported,

    #[error("service {0} only returns a response, call it with return_response")]
    ResponseRequired(String),
}

/// Metadata of a registered service
#[derive(Debug, Clone)]
pub struct ServiceDescription {
    pub domain: String,
    pub service: String,
    pub name: Option<String>,
    pub description: Option<String>,
    /// JSON schema for the service data
    pub schema: Option<serde_json::Value>,
    /// Entity domain the service targets, for entity services
    pub target: Option<String>,
    pub supports_response: SupportsResponse,
}

impl ServiceDescription {
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            name: None,
            description: None,
            schema: None,
            target: None,
            supports_response: SupportsResponse::None,
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_target(mut self, domain: impl Into<String>) -> Self {
        self.target = Some(domain.into());
        self
    }

    pub fn with_response(mut self, supports_response: SupportsResponse) -> Self {
        self.supports_response = supports_response;
        self
    }

    fn key(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }
}

struct RegisteredService {
    handler: ServiceHandler,
    validator: Option<Arc<JSONSchema>>,
    description: ServiceDescription,
}

pub struct ServiceRegistry {
    services: DashMap<String, RegisteredService>,
    event_bus: Option<Arc<EventBus>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            event_bus: None,
        }
    }

    /// Registry that announces every call with a `call_service` event
    pub fn with_bus(event_bus: Arc<EventBus>) -> Self {
        Self {
            services: DashMap::new(),
            event_bus: Some(event_bus),
        }
    }

    /// Register a handler under `domain.service`
    ///
    /// Replaces an existing registration with the same name.
    pub fn register<F, Fut>(
        &self,
        domain: impl Into<String>,
        service: impl Into<String>,
        handler: F,
        schema: Option<serde_json::Value>,
        supports_response: SupportsResponse,
    ) -> Result<(), ServiceError>
    where
        F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        let mut description = ServiceDescription::new(domain, service)
            .with_response(supports_response);
        description.schema = schema;
        self.register_with_description(description, handler)
    }

    #[instrument(skip(self, handler), fields(service = %description.key()))]
    pub fn register_with_description<F, Fut>(
        &self,
        description: ServiceDescription,
        handler: F,
    ) -> Result<(), ServiceError>
    where
        F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        let key = description.key();

        let validator = match &description.schema {
            Some(schema) => {
                let compiled =
                    JSONSchema::compile(schema).map_err(|e| ServiceError::InvalidSchema {
                        service: key.clone(),
                        message: e.to_string(),
                    })?;
                Some(Arc::new(compiled))
            }
            None => None,
        };

        debug!("Registering service");

        let handler: ServiceHandler =
            Arc::new(move |call| Box::pin(handler(call)) as ServiceFuture);

        self.services.insert(
            key,
            RegisteredService {
                handler,
                validator,
                description,
            },
        );
        Ok(())
    }

    /// Call a service
    ///
    /// The response is only passed back when `return_response` is set.
    #[instrument(skip(self, service_data, context))]
    pub async fn call(
        &self,
        domain: &str,
        service: &str,
        service_data: serde_json::Value,
        context: Context,
        return_response: bool,
    ) -> ServiceResult {
        let key = format!("{}.{}", domain, service);

        let registered = self.services.get(&key).ok_or_else(|| {
            warn!("Service not found");
            ServiceError::NotFound {
                domain: domain.to_string(),
                service: service.to_string(),
            }
        })?;

        match registered.description.supports_response {
            SupportsResponse::None if return_response => {
                return Err(ServiceError::ResponseNotSupported)
            }
            SupportsResponse::Only if !return_response => {
                return Err(ServiceError::ResponseRequired(key))
            }
            _ => {}
        }

        if let Some(validator) = &registered.validator {
            if let Err(errors) = validator.validate(&service_data) {
                let message = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
                return Err(ServiceError::InvalidData(message));
            }
        }

        let handler = registered.handler.clone();
        // Release the map guard before awaiting the handler
        drop(registered);

        if let Some(bus) = &self.event_bus {
            bus.fire_typed(
                CallServiceData {
                    domain: domain.to_string(),
                    service: service.to_string(),
                    service_data: service_data.clone(),
                },
                context.clone(),
            );
        }

        let mut call = ServiceCall::new(domain, service, service_data, context);
        call.return_response = return_response;

        debug!("Calling service");
        let result = handler(call).await?;

        if return_response {
            Ok(result)
        } else {
            Ok(None)
        }
    }

    pub fn has_service(&self, domain: &str, service: &str) -> bool {
        self.services.contains_key(&format!("{}.{}", domain, service))
    }

    pub fn get_service(&self, domain: &str, service: &str) -> Option<ServiceDescription> {
        self.services
            .get(&format!("{}.{}", domain, service))
            .map(|s| s.description.clone())
    }

    pub fn domain_services(&self, domain: &str) -> Vec<ServiceDescription> {
        self.services
            .iter()
            .filter(|s| s.description.domain == domain)
            .map(|s| s.description.clone())
            .collect()
    }

    /// All registered services grouped by domain
    pub fn all_services(&self) -> HashMap<String, Vec<ServiceDescription>> {
        let mut result: HashMap<String, Vec<ServiceDescription>> = HashMap::new();
        for entry in self.services.iter() {
            result
                .entry(entry.description.domain.clone())
                .or_default()
                .push(entry.description.clone());
        }
        result
    }

    #[instrument(skip(self))]
    pub fn unregister(&self, domain: &str, service: &str) -> bool {
        let removed = self
            .services
            .remove(&format!("{}.{}", domain, service))
            .is_some();
        if removed {
            debug!("Unregistered service");
        }
        removed
    }

    /// Remove every service of a domain, returning how many were removed
    #[instrument(skip(self))]
    pub fn unregister_domain(&self, domain: &str) -> usize {
        let before = self.services.len();
        self.services.retain(|_, s| s.description.domain != domain);
        let count = before - self.services.len();
        debug!(count, "Unregistered domain services");
        count
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedServiceRegistry = Arc<ServiceRegistry>;
