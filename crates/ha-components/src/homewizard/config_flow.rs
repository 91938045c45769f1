use std::collections::HashMap;

use async_trait::async_trait;
use ha_config_entries::{
    ConfigFlow, EntryData, FieldType, FlowContext, FlowError, FlowResult, FormErrorKey, FormField,
};
use serde_json::json;
use tracing::{error, info};

use super::api::{Device, HomeWizardClient, HomeWizardError};

pub const CONF_IP_ADDRESS: &str = "ip_address";
pub const ERROR_API_NOT_ENABLED: &str = "api_not_enabled";
pub const ABORT_UNSUPPORTED_API_VERSION: &str = "unsupported_api_version";

/// Asks for the IP address of a device and checks its local API is on
pub struct HomeWizardFlow {
    http: reqwest::Client,
}

impl HomeWizardFlow {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn user_form(ctx: &FlowContext) -> FlowResult {
        ctx.show_form("user")
            .with_schema(vec![FormField::required(CONF_IP_ADDRESS, FieldType::String)])
    }

    /// Reach the device; `Err` holds the form error to show
    async fn validate(&self, ip_address: &str) -> Result<Device, Result<String, FlowError>> {
        let client = HomeWizardClient::new(self.http.clone(), ip_address);
        client.device().await.map_err(|err| match err {
            HomeWizardError::Disabled => {
                error!(ip_address, "API disabled, API must be enabled in the app");
                Ok(ERROR_API_NOT_ENABLED.to_string())
            }
            HomeWizardError::UnsupportedVersion(version) => {
                error!(ip_address, %version, "API version unsupported");
                Err(FlowError::Abort(ABORT_UNSUPPORTED_API_VERSION.to_string()))
            }
            HomeWizardError::Network(err) => {
                error!(ip_address, %err, "Could not reach device");
                Ok(FormErrorKey::CannotConnect.to_string())
            }
            HomeWizardError::InvalidResponse(message) => {
                error!(ip_address, %message, "Unexpected response from device");
                Ok(FormErrorKey::Unknown.to_string())
            }
        })
    }

    async fn step_user(
        &mut self,
        input: Option<EntryData>,
        ctx: &mut FlowContext,
    ) -> Result<FlowResult, FlowError> {
        let Some(input) = input else {
            return Ok(Self::user_form(ctx));
        };
        let ip_address = input
            .get(CONF_IP_ADDRESS)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string();

        let device = match self.validate(&ip_address).await {
            Ok(device) => device,
            Err(form_error) => {
                let errors = HashMap::from([("base".to_string(), form_error?)]);
                return Ok(Self::user_form(ctx).with_errors(errors));
            }
        };

        ctx.set_unique_id(device.unique_id())?;
        ctx.abort_if_unique_id_configured()?;
        info!(product = %device.product_name, serial = %device.serial, "Adding HomeWizard device");

        let data = EntryData::from([(CONF_IP_ADDRESS.to_string(), json!(ip_address))]);
        Ok(ctx.create_entry(device.product_name, data))
    }

    /// Shown after the local API was switched off on a configured device
    async fn step_reauth_confirm(
        &mut self,
        input: Option<EntryData>,
        ctx: &mut FlowContext,
    ) -> Result<FlowResult, FlowError> {
        let entry = ctx
            .reauth_entry()
            .ok_or_else(|| FlowError::UnknownEntry(ctx.entry_id().unwrap_or_default().to_string()))?;
        if input.is_none() {
            return Ok(ctx.show_form("reauth_confirm"));
        }

        let ip_address = entry.data_str(CONF_IP_ADDRESS).unwrap_or_default();
        match self.validate(ip_address).await {
            Ok(_) => Ok(ctx.create_entry(entry.title.clone(), entry.data.clone())),
            Err(form_error) => {
                let errors = HashMap::from([("base".to_string(), form_error?)]);
                Ok(ctx.show_form("reauth_confirm").with_errors(errors))
            }
        }
    }
}

#[async_trait]
impl ConfigFlow for HomeWizardFlow {
    async fn step(
        &mut self,
        step_id: &str,
        input: Option<EntryData>,
        ctx: &mut FlowContext,
    ) -> Result<FlowResult, FlowError> {
        match step_id {
            "user" => self.step_user(input, ctx).await,
            // Started with the entry data; go straight to the confirmation form
            "reauth" => self.step_reauth_confirm(None, ctx).await,
            "reauth_confirm" => self.step_reauth_confirm(input, ctx).await,
            _ => Err(FlowError::UnknownStep {
                handler: ctx.handler().to_string(),
                step_id: step_id.to_string(),
            }),
        }
    }
}
