//! Service call type for invoking registered services

use crate::{Context, ATTR_ENTITY_ID};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A call to `domain.service` with its data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub service_data: Value,
    pub context: Context,
    /// Whether the caller asked for the service response
    #[serde(default)]
    pub return_response: bool,
}

impl ServiceCall {
    pub fn new(
        domain: impl Into<String>,
        service: impl Into<String>,
        service_data: Value,
        context: Context,
    ) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data,
            context,
            return_response: false,
        }
    }

    /// `domain.service`
    pub fn service_id(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }

    /// Typed value from the service data
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.service_data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Target entity ids, accepting a single string, a comma separated
    /// string or a list
    pub fn entity_ids(&self) -> Vec<String> {
        match self.service_data.get(ATTR_ENTITY_ID) {
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Some(Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => vec![],
        }
    }

    /// `entity_id: all` targets every entity of the platform
    pub fn targets_all(&self) -> bool {
        self.service_data.get(ATTR_ENTITY_ID).and_then(Value::as_str) == Some("all")
    }

    /// Service data without the targeting keys
    pub fn data_without_target(&self) -> Map<String, Value> {
        let mut data = self.service_data.as_object().cloned().unwrap_or_default();
        data.remove(ATTR_ENTITY_ID);
        data.remove("device_id");
        data
    }
}

/// Whether a service returns a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportsResponse {
    /// Service never returns data
    #[default]
    None,
    Optional,
    /// Callers must ask for the response
    Only,
}
