//! Running config flows
//!
//! Flows in progress live next to the entries they create. Each flow sits
//! behind its own mutex so two submissions to the same flow run one after
//! the other while unrelated flows proceed.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::entry::{ConfigEntry, ConfigEntrySource, ConfigEntryUpdate, EntryData};
use crate::flow::{
    validate_input, ConfigFlow, FlowContext, FlowError, FlowFactory, FlowProgress, FlowResult,
    FlowResultType, FormField, ABORT_ALREADY_CONFIGURED, ABORT_ALREADY_IN_PROGRESS,
    ABORT_REAUTH_SUCCESSFUL,
};
use crate::manager::{ConfigEntries, ConfigEntriesError};

pub(crate) struct FlowState {
    flow: Box<dyn ConfigFlow>,
    ctx: FlowContext,
    step_id: String,
    schema: Vec<FormField>,
}

pub(crate) struct FlowSlot {
    handler: String,
    source: ConfigEntrySource,
    entry_id: Option<String>,
    state: Arc<Mutex<FlowState>>,
}

impl ConfigEntries {
    pub fn register_flow(&self, domain: impl Into<String>, factory: FlowFactory) {
        self.flow_factories.insert(domain.into(), factory);
    }

    pub fn has_flow(&self, domain: &str) -> bool {
        self.flow_factories.contains_key(domain)
    }

    /// Start a flow and run its first step
    pub async fn flow_init(
        self: &Arc<Self>,
        handler: &str,
        source: ConfigEntrySource,
        data: Option<EntryData>,
    ) -> Result<FlowResult, FlowError> {
        self.init_flow(handler, source, None, data).await
    }

    /// Start a reauth flow for an entry whose credentials stopped working
    pub async fn start_reauth(self: &Arc<Self>, entry_id: &str) -> Result<FlowResult, FlowError> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| FlowError::UnknownEntry(entry_id.to_string()))?;

        let running = self.flows.iter().any(|slot| {
            slot.source == ConfigEntrySource::Reauth && slot.entry_id.as_deref() == Some(entry_id)
        });
        if running {
            return Err(FlowError::Abort(ABORT_ALREADY_IN_PROGRESS.to_string()));
        }

        info!(entry_id, domain = %entry.domain, "Starting reauth flow");
        self.init_flow(
            &entry.domain,
            ConfigEntrySource::Reauth,
            Some(entry_id.to_string()),
            Some(entry.data),
        )
        .await
    }

    async fn init_flow(
        self: &Arc<Self>,
        handler: &str,
        source: ConfigEntrySource,
        entry_id: Option<String>,
        data: Option<EntryData>,
    ) -> Result<FlowResult, FlowError> {
        let factory = self
            .flow_factories
            .get(handler)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| FlowError::UnknownHandler(handler.to_string()))?;

        let flow_id = ulid::Ulid::new().to_string();
        let ctx = FlowContext::new(
            flow_id.clone(),
            handler.to_string(),
            source,
            entry_id.clone(),
            self,
        );
        let state = Arc::new(Mutex::new(FlowState {
            flow: factory(),
            ctx,
            step_id: source.step_id().to_string(),
            schema: Vec::new(),
        }));
        self.flows.insert(
            flow_id.clone(),
            FlowSlot {
                handler: handler.to_string(),
                source,
                entry_id,
                state: Arc::clone(&state),
            },
        );
        debug!(flow_id = %flow_id, handler, ?source, "Flow started");

        let mut state = state.lock().await;
        self.run_step(&mut state, source.step_id(), data).await
    }

    /// Submit input to the form a flow is showing
    pub async fn flow_configure(
        self: &Arc<Self>,
        flow_id: &str,
        input: EntryData,
    ) -> Result<FlowResult, FlowError> {
        let state = self
            .flows
            .get(flow_id)
            .map(|slot| Arc::clone(&slot.state))
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;

        let mut state = state.lock().await;
        // Finished while this call waited for the lock
        if !self.flows.contains_key(flow_id) {
            return Err(FlowError::UnknownFlow(flow_id.to_string()));
        }

        let input = validate_input(&state.schema, input)?;
        let step_id = state.step_id.clone();
        self.run_step(&mut state, &step_id, Some(input)).await
    }

    pub fn flow_abort(&self, flow_id: &str) -> Result<(), FlowError> {
        if self.remove_flow(flow_id) {
            debug!(flow_id, "Flow aborted");
            Ok(())
        } else {
            Err(FlowError::UnknownFlow(flow_id.to_string()))
        }
    }

    pub fn flows_in_progress(&self) -> Vec<FlowProgress> {
        self.flows
            .iter()
            .map(|slot| FlowProgress {
                flow_id: slot.key().clone(),
                handler: slot.handler.clone(),
                source: slot.source,
                // A flow busy with a step reports no step id
                step_id: slot.state.try_lock().ok().map(|s| s.step_id.clone()),
            })
            .collect()
    }

    pub(crate) fn flow_claims_unique_id(&self, handler: &str, unique_id: &str, except: &str) -> bool {
        self.flow_unique_ids.iter().any(|claim| {
            claim.key() != except && claim.0 == handler && claim.1 == unique_id
        })
    }

    pub(crate) fn claim_flow_unique_id(&self, flow_id: &str, handler: &str, unique_id: &str) {
        self.flow_unique_ids.insert(
            flow_id.to_string(),
            (handler.to_string(), unique_id.to_string()),
        );
    }

    fn remove_flow(&self, flow_id: &str) -> bool {
        self.flow_unique_ids.remove(flow_id);
        self.flows.remove(flow_id).is_some()
    }

    pub(crate) fn abort_flows_for_entry(&self, entry_id: &str) {
        let flow_ids: Vec<String> = self
            .flows
            .iter()
            .filter(|slot| slot.entry_id.as_deref() == Some(entry_id))
            .map(|slot| slot.key().clone())
            .collect();
        for flow_id in flow_ids {
            self.remove_flow(&flow_id);
        }
    }

    async fn run_step(
        self: &Arc<Self>,
        state: &mut FlowState,
        step_id: &str,
        input: Option<EntryData>,
    ) -> Result<FlowResult, FlowError> {
        let outcome = {
            let FlowState { flow, ctx, .. } = &mut *state;
            flow.step(step_id, input, ctx).await
        };

        let result = match outcome {
            Ok(result) => result,
            Err(FlowError::Abort(reason)) => state.ctx.abort(reason),
            Err(err @ FlowError::InvalidInput { .. }) => return Err(err),
            Err(err) => {
                self.remove_flow(state.ctx.flow_id());
                return Err(err);
            }
        };

        match result.result_type {
            FlowResultType::Form => {
                state.step_id = result
                    .step_id
                    .clone()
                    .unwrap_or_else(|| step_id.to_string());
                state.schema = result.data_schema.clone();
                Ok(result)
            }
            FlowResultType::Abort => {
                self.remove_flow(state.ctx.flow_id());
                debug!(flow_id = state.ctx.flow_id(), reason = ?result.reason, "Flow aborted");
                Ok(result)
            }
            FlowResultType::CreateEntry => {
                self.remove_flow(state.ctx.flow_id());
                self.finish_flow(&state.ctx, result).await
            }
        }
    }

    /// Store the entry a flow produced and set it up
    ///
    /// A reauth flow updates the entry it was started for and reloads it
    /// instead of creating a new one.
    async fn finish_flow(
        self: &Arc<Self>,
        ctx: &FlowContext,
        mut result: FlowResult,
    ) -> Result<FlowResult, FlowError> {
        let data = result.data.clone().unwrap_or_default();

        if let (ConfigEntrySource::Reauth, Some(entry_id)) = (ctx.source(), ctx.entry_id()) {
            self.update(entry_id, ConfigEntryUpdate::new().data(data))
                .await
                .map_err(|e| FlowError::Entry(e.to_string()))?;
            if let Err(err) = self.reload(entry_id).await {
                warn!(entry_id, "Reload after reauth failed: {}", err);
            }
            return Ok(ctx.abort(ABORT_REAUTH_SUCCESSFUL));
        }

        let mut entry = ConfigEntry::new(ctx.handler(), result.title.clone().unwrap_or_default())
            .with_data(data)
            .with_source(ctx.source());
        if let Some(unique_id) = ctx.unique_id() {
            entry = entry.with_unique_id(unique_id);
        }

        let entry = match self.add(entry).await {
            Ok(entry) => entry,
            Err(ConfigEntriesError::AlreadyExists { .. }) => {
                return Ok(ctx.abort(ABORT_ALREADY_CONFIGURED));
            }
            Err(err) => return Err(FlowError::Entry(err.to_string())),
        };

        if let Err(err) = self.setup(&entry.entry_id).await {
            warn!(entry_id = %entry.entry_id, "Setup after flow failed: {}", err);
        }
        result.result = Some(entry.entry_id);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FieldType, FormErrorKey};
    use crate::handler::{EntryHandler, SetupError};
    use crate::ConfigEntryState;
    use async_trait::async_trait;
    use ha_registries::Storage;
    use serde_json::json;
    use tempfile::TempDir;

    struct AlwaysReady;

    #[async_trait]
    impl EntryHandler for AlwaysReady {
        async fn setup_entry(
            &self,
            _entries: &Arc<ConfigEntries>,
            _entry: &ConfigEntry,
        ) -> Result<(), SetupError> {
            Ok(())
        }

        async fn unload_entry(
            &self,
            _entries: &Arc<ConfigEntries>,
            _entry: &ConfigEntry,
        ) -> Result<bool, SetupError> {
            Ok(true)
        }
    }

    /// Asks for a host, rejects "unreachable", then asks for a name
    struct TwoStepFlow {
        host: Option<String>,
    }

    #[async_trait]
    impl ConfigFlow for TwoStepFlow {
        async fn step(
            &mut self,
            step_id: &str,
            input: Option<EntryData>,
            ctx: &mut FlowContext,
        ) -> Result<FlowResult, FlowError> {
            match (step_id, input) {
                ("user", None) => Ok(host_form(ctx)),
                ("user", Some(input)) => {
                    let host = input["host"].as_str().unwrap_or_default().to_string();
                    if host == "unreachable" {
                        return Ok(host_form(ctx).with_error("base", FormErrorKey::CannotConnect));
                    }
                    ctx.set_unique_id(format!("device-{host}"))?;
                    ctx.abort_if_unique_id_configured()?;
                    self.host = Some(host);
                    Ok(ctx.show_form("name").with_schema(vec![FormField::optional(
                        "name",
                        FieldType::String,
                    )
                    .with_default("Device")]))
                }
                ("name", Some(input)) => {
                    let mut data = EntryData::new();
                    data.insert("host".to_string(), json!(self.host));
                    let title = input["name"].as_str().unwrap_or("Device").to_string();
                    Ok(ctx.create_entry(title, data))
                }
                _ => Err(FlowError::UnknownStep {
                    handler: ctx.handler().to_string(),
                    step_id: step_id.to_string(),
                }),
            }
        }
    }

    fn host_form(ctx: &FlowContext) -> FlowResult {
        ctx.show_form("user")
            .with_schema(vec![FormField::required("host", FieldType::String)])
    }

    fn manager(dir: &TempDir) -> Arc<ConfigEntries> {
        let entries = Arc::new(ConfigEntries::new(Storage::new(dir.path())));
        entries.register_handler("demo", Arc::new(AlwaysReady));
        entries.register_flow(
            "demo",
            Arc::new(|| Box::new(TwoStepFlow { host: None }) as Box<dyn ConfigFlow>),
        );
        entries
    }

    fn input(pairs: &[(&str, serde_json::Value)]) -> EntryData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_flow_creates_and_sets_up_entry() {
        let dir = TempDir::new().unwrap();
        let entries = manager(&dir);

        let form = entries
            .flow_init("demo", ConfigEntrySource::User, None)
            .await
            .unwrap();
        assert!(form.is_form());
        assert_eq!(form.step_id.as_deref(), Some("user"));

        let retry = entries
            .flow_configure(&form.flow_id, input(&[("host", json!("unreachable"))]))
            .await
            .unwrap();
        assert_eq!(retry.errors.get("base").map(String::as_str), Some("cannot_connect"));

        let next = entries
            .flow_configure(&form.flow_id, input(&[("host", json!("10.0.0.9"))]))
            .await
            .unwrap();
        assert_eq!(next.step_id.as_deref(), Some("name"));

        let done = entries
            .flow_configure(&form.flow_id, EntryData::new())
            .await
            .unwrap();
        assert_eq!(done.result_type, FlowResultType::CreateEntry);
        assert_eq!(done.title.as_deref(), Some("Device"));

        let entry_id = done.result.unwrap();
        let entry = entries.get(&entry_id).unwrap();
        assert_eq!(entry.unique_id.as_deref(), Some("device-10.0.0.9"));
        assert_eq!(entry.state, ConfigEntryState::Loaded);
        assert!(entries.flows_in_progress().is_empty());
        assert!(matches!(
            entries.flow_configure(&form.flow_id, EntryData::new()).await,
            Err(FlowError::UnknownFlow(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_unique_id_aborts() {
        let dir = TempDir::new().unwrap();
        let entries = manager(&dir);
        entries
            .add(ConfigEntry::new("demo", "Existing").with_unique_id("device-10.0.0.9"))
            .await
            .unwrap();

        let form = entries
            .flow_init("demo", ConfigEntrySource::User, None)
            .await
            .unwrap();
        let result = entries
            .flow_configure(&form.flow_id, input(&[("host", json!("10.0.0.9"))]))
            .await
            .unwrap();
        assert_eq!(result.result_type, FlowResultType::Abort);
        assert_eq!(result.reason.as_deref(), Some(ABORT_ALREADY_CONFIGURED));
        assert!(entries.flows_in_progress().is_empty());
    }

    #[tokio::test]
    async fn test_parallel_flows_for_same_device() {
        let dir = TempDir::new().unwrap();
        let entries = manager(&dir);

        let first = entries
            .flow_init("demo", ConfigEntrySource::User, None)
            .await
            .unwrap();
        let second = entries
            .flow_init("demo", ConfigEntrySource::User, None)
            .await
            .unwrap();
        assert_eq!(entries.flows_in_progress().len(), 2);

        entries
            .flow_configure(&first.flow_id, input(&[("host", json!("10.0.0.9"))]))
            .await
            .unwrap();
        let result = entries
            .flow_configure(&second.flow_id, input(&[("host", json!("10.0.0.9"))]))
            .await
            .unwrap();
        assert_eq!(result.reason.as_deref(), Some(ABORT_ALREADY_IN_PROGRESS));
    }

    #[tokio::test]
    async fn test_invalid_input_keeps_flow() {
        let dir = TempDir::new().unwrap();
        let entries = manager(&dir);

        let form = entries
            .flow_init("demo", ConfigEntrySource::User, None)
            .await
            .unwrap();
        let err = entries
            .flow_configure(&form.flow_id, EntryData::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidInput { .. }));
        assert_eq!(entries.flows_in_progress().len(), 1);

        entries.flow_abort(&form.flow_id).unwrap();
        assert!(entries.flows_in_progress().is_empty());
        assert!(entries.flow_abort(&form.flow_id).is_err());
    }

    #[tokio::test]
    async fn test_unknown_handler_and_step() {
        let dir = TempDir::new().unwrap();
        let entries = manager(&dir);

        assert_eq!(
            entries
                .flow_init("nope", ConfigEntrySource::User, None)
                .await
                .unwrap_err(),
            FlowError::UnknownHandler("nope".to_string())
        );
        let err = entries
            .flow_init("demo", ConfigEntrySource::Import, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::UnknownStep { step_id, .. } if step_id == "import"));
        assert!(entries.flows_in_progress().is_empty());
    }
}
