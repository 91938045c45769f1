//! Config flows
//!
//! A flow is a short multi-step dialog that ends in a new config entry or an
//! abort. Each step either shows a form (a list of [`FormField`]s), creates
//! the entry, or aborts with a reason.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;

use crate::entry::{ConfigEntry, ConfigEntrySource, EntryData};
use crate::manager::ConfigEntries;

/// Reason a flow aborts when the unique id already has an entry
pub const ABORT_ALREADY_CONFIGURED: &str = "already_configured";
pub const ABORT_ALREADY_IN_PROGRESS: &str = "already_in_progress";
pub const ABORT_REAUTH_SUCCESSFUL: &str = "reauth_successful";
pub const ABORT_SINGLE_INSTANCE: &str = "single_instance_allowed";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("no config flow registered for '{0}'")]
    UnknownHandler(String),

    #[error("flow '{0}' not found")]
    UnknownFlow(String),

    #[error("flow '{handler}' has no step '{step_id}'")]
    UnknownStep { handler: String, step_id: String },

    #[error("invalid value for '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    /// Raised from a step to end the flow with an abort result
    #[error("aborted: {0}")]
    Abort(String),

    #[error("config entry '{0}' not found")]
    UnknownEntry(String),

    /// Storing the resulting entry failed
    #[error("{0}")]
    Entry(String),
}

/// Error keys a form can show next to a field or under `base`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormErrorKey {
    CannotConnect,
    InvalidAuth,
    Unknown,
}

impl FormErrorKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormErrorKey::CannotConnect => "cannot_connect",
            FormErrorKey::InvalidAuth => "invalid_auth",
            FormErrorKey::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FormErrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Password,
    Integer,
    Float,
    Boolean,
}

/// One input of a form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FormField {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Coerce a submitted value to the field type
    fn coerce(&self, value: Value) -> Result<Value, FlowError> {
        let invalid = |reason: &str| FlowError::InvalidInput {
            field: self.name.clone(),
            reason: reason.to_string(),
        };
        match (self.field_type, value) {
            (FieldType::String | FieldType::Password, Value::String(s)) => Ok(Value::String(s)),
            (FieldType::String | FieldType::Password, v @ (Value::Number(_) | Value::Bool(_))) => {
                Ok(Value::String(v.to_string()))
            }
            (FieldType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => {
                Ok(Value::Number(n))
            }
            (FieldType::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| invalid("expected an integer")),
            (FieldType::Float, Value::Number(n)) => Ok(Value::Number(n)),
            (FieldType::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| invalid("expected a number")),
            (FieldType::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
            (FieldType::Boolean, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "on" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "off" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(invalid("expected a boolean")),
            },
            (FieldType::Integer, _) => Err(invalid("expected an integer")),
            (FieldType::Float, _) => Err(invalid("expected a number")),
            (FieldType::Boolean, _) => Err(invalid("expected a boolean")),
            (_, _) => Err(invalid("expected a string")),
        }
    }
}

/// Check submitted input against a form, filling defaults
pub fn validate_input(schema: &[FormField], mut input: EntryData) -> Result<EntryData, FlowError> {
    if let Some(extra) = input
        .keys()
        .find(|key| !schema.iter().any(|field| &field.name == *key))
    {
        return Err(FlowError::InvalidInput {
            field: extra.clone(),
            reason: "extra keys not allowed".to_string(),
        });
    }

    let mut validated = EntryData::new();
    for field in schema {
        match input.remove(&field.name) {
            Some(Value::Null) | None => {
                if let Some(default) = &field.default {
                    validated.insert(field.name.clone(), default.clone());
                } else if field.required {
                    return Err(FlowError::InvalidInput {
                        field: field.name.clone(),
                        reason: "required key not provided".to_string(),
                    });
                }
            }
            Some(value) => {
                validated.insert(field.name.clone(), field.coerce(value)?);
            }
        }
    }
    Ok(validated)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowResultType {
    Form,
    CreateEntry,
    Abort,
}

/// What a step returns to the caller
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    pub flow_id: String,
    pub handler: String,
    #[serde(rename = "type")]
    pub result_type: FlowResultType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data_schema: Vec<FormField>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub errors: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub description_placeholders: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<EntryData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Entry id once a `create_entry` result was stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl FlowResult {
    fn new(flow_id: &str, handler: &str, result_type: FlowResultType) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            handler: handler.to_string(),
            result_type,
            step_id: None,
            data_schema: Vec::new(),
            errors: HashMap::new(),
            description_placeholders: HashMap::new(),
            title: None,
            data: None,
            reason: None,
            result: None,
        }
    }

    pub fn with_schema(mut self, schema: Vec<FormField>) -> Self {
        self.data_schema = schema;
        self
    }

    pub fn with_error(mut self, field: impl Into<String>, key: FormErrorKey) -> Self {
        self.errors.insert(field.into(), key.as_str().to_string());
        self
    }

    pub fn with_errors(mut self, errors: HashMap<String, String>) -> Self {
        self.errors.extend(errors);
        self
    }

    pub fn with_placeholder(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.description_placeholders.insert(key.into(), value.into());
        self
    }

    pub fn is_form(&self) -> bool {
        self.result_type == FlowResultType::Form
    }
}

/// Per-flow handle passed to every step
pub struct FlowContext {
    flow_id: String,
    handler: String,
    source: ConfigEntrySource,
    unique_id: Option<String>,
    entry_id: Option<String>,
    entries: Weak<ConfigEntries>,
}

impl FlowContext {
    pub(crate) fn new(
        flow_id: String,
        handler: String,
        source: ConfigEntrySource,
        entry_id: Option<String>,
        entries: &Arc<ConfigEntries>,
    ) -> Self {
        Self {
            flow_id,
            handler,
            source,
            unique_id: None,
            entry_id,
            entries: Arc::downgrade(entries),
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub fn source(&self) -> ConfigEntrySource {
        self.source
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    /// Entry being re-authenticated, if this is a reauth flow
    pub fn entry_id(&self) -> Option<&str> {
        self.entry_id.as_deref()
    }

    /// Claim a unique id for this flow
    ///
    /// Aborts with `already_in_progress` when another flow of the same
    /// handler holds it.
    pub fn set_unique_id(&mut self, unique_id: impl Into<String>) -> Result<(), FlowError> {
        let unique_id = unique_id.into();
        if let Some(entries) = self.entries.upgrade() {
            if entries.flow_claims_unique_id(&self.handler, &unique_id, &self.flow_id) {
                return Err(FlowError::Abort(ABORT_ALREADY_IN_PROGRESS.to_string()));
            }
            entries.claim_flow_unique_id(&self.flow_id, &self.handler, &unique_id);
        }
        self.unique_id = Some(unique_id);
        Ok(())
    }

    pub fn abort_if_unique_id_configured(&self) -> Result<(), FlowError> {
        let (Some(unique_id), Some(entries)) = (&self.unique_id, self.entries.upgrade()) else {
            return Ok(());
        };
        if entries.get_by_unique_id(&self.handler, unique_id).is_some() {
            return Err(FlowError::Abort(ABORT_ALREADY_CONFIGURED.to_string()));
        }
        Ok(())
    }

    /// Entries already configured for this handler
    pub fn configured_entries(&self) -> Vec<ConfigEntry> {
        self.entries
            .upgrade()
            .map(|entries| entries.get_by_domain(&self.handler))
            .unwrap_or_default()
    }

    pub fn reauth_entry(&self) -> Option<ConfigEntry> {
        let entry_id = self.entry_id.as_deref()?;
        self.entries.upgrade()?.get(entry_id)
    }

    pub fn show_form(&self, step_id: impl Into<String>) -> FlowResult {
        let mut result = FlowResult::new(&self.flow_id, &self.handler, FlowResultType::Form);
        result.step_id = Some(step_id.into());
        result
    }

    pub fn create_entry(&self, title: impl Into<String>, data: EntryData) -> FlowResult {
        let mut result =
            FlowResult::new(&self.flow_id, &self.handler, FlowResultType::CreateEntry);
        result.title = Some(title.into());
        result.data = Some(data);
        result
    }

    pub fn abort(&self, reason: impl Into<String>) -> FlowResult {
        let mut result = FlowResult::new(&self.flow_id, &self.handler, FlowResultType::Abort);
        result.reason = Some(reason.into());
        result
    }
}

/// A config flow of one integration
///
/// `step` is called with the step id of the last shown form and the
/// validated input, or with `None` input when a step is entered fresh.
#[async_trait]
pub trait ConfigFlow: Send {
    async fn step(
        &mut self,
        step_id: &str,
        input: Option<EntryData>,
        ctx: &mut FlowContext,
    ) -> Result<FlowResult, FlowError>;
}

/// Builds a fresh flow for every `flow_init`
pub type FlowFactory = Arc<dyn Fn() -> Box<dyn ConfigFlow> + Send + Sync>;

/// Summary of a flow that is waiting for input
#[derive(Debug, Clone, Serialize)]
pub struct FlowProgress {
    pub flow_id: String,
    pub handler: String,
    pub source: ConfigEntrySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}
