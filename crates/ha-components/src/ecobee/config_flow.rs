use std::collections::HashMap;

use async_trait::async_trait;
use ha_config_entries::{
    ConfigEntrySource, ConfigFlow, EntryData, FieldType, FlowContext, FlowError, FlowResult,
    FormErrorKey, FormField, ABORT_SINGLE_INSTANCE,
};
use serde_json::json;
use tracing::{error, info};

use super::api::{EcobeeClient, EcobeeError, PinResponse, Tokens};

pub const CONF_API_KEY: &str = "api_key";
pub const CONF_ACCESS_TOKEN: &str = "access_token";
pub const CONF_REFRESH_TOKEN: &str = "refresh_token";

pub const ERROR_PIN_REQUEST_FAILED: &str = "pin_request_failed";
pub const ERROR_TOKEN_REQUEST_FAILED: &str = "token_request_failed";

const DEFAULT_TITLE: &str = "ecobee";

/// Entry data holding the API key and tokens
pub fn entry_data(api_key: &str, tokens: &Tokens) -> EntryData {
    EntryData::from([
        (CONF_API_KEY.to_string(), json!(api_key)),
        (CONF_ACCESS_TOKEN.to_string(), json!(tokens.access_token)),
        (CONF_REFRESH_TOKEN.to_string(), json!(tokens.refresh_token)),
    ])
}

/// PIN authorisation: request a PIN for the API key, let the user enter
/// it on ecobee.com, then trade it for tokens
pub struct EcobeeFlow {
    http: reqwest::Client,
    base_url: String,
    pending: Option<(EcobeeClient, PinResponse)>,
}

impl EcobeeFlow {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.to_string(),
            pending: None,
        }
    }

    fn user_form(ctx: &FlowContext) -> FlowResult {
        ctx.show_form("user")
            .with_schema(vec![FormField::required(CONF_API_KEY, FieldType::String)])
    }

    fn authorize_form(ctx: &FlowContext, pin: &PinResponse) -> FlowResult {
        ctx.show_form("authorize")
            .with_placeholder("pin", pin.ecobee_pin.clone())
            .with_placeholder("auth_url", "https://www.ecobee.com/consumerportal/index.html")
    }

    fn form_error(err: &EcobeeError, on_api_error: &str) -> String {
        match err {
            EcobeeError::InvalidResponse(_) => FormErrorKey::Unknown.to_string(),
            _ => on_api_error.to_string(),
        }
    }

    async fn step_user(
        &mut self,
        input: Option<EntryData>,
        ctx: &mut FlowContext,
    ) -> Result<FlowResult, FlowError> {
        if ctx.source() != ConfigEntrySource::Reauth && !ctx.configured_entries().is_empty() {
            return Ok(ctx.abort(ABORT_SINGLE_INSTANCE));
        }
        let Some(input) = input else {
            return Ok(Self::user_form(ctx));
        };
        let api_key = input
            .get(CONF_API_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string();

        let client = EcobeeClient::new(self.http.clone(), &self.base_url, &api_key, Tokens::default());
        match client.request_pin().await {
            Ok(pin) => {
                info!(pin = %pin.ecobee_pin, "Enter the PIN in the ecobee portal to authorize");
                let form = Self::authorize_form(ctx, &pin);
                self.pending = Some((client, pin));
                Ok(form)
            }
            Err(err) => {
                error!(%err, "Could not request an ecobee PIN");
                let errors = HashMap::from([(
                    "base".to_string(),
                    Self::form_error(&err, ERROR_PIN_REQUEST_FAILED),
                )]);
                Ok(Self::user_form(ctx).with_errors(errors))
            }
        }
    }

    /// Submitted once the user entered the PIN on ecobee.com
    async fn step_authorize(&mut self, ctx: &mut FlowContext) -> Result<FlowResult, FlowError> {
        let Some((client, pin)) = &self.pending else {
            return Ok(Self::user_form(ctx));
        };
        match client.request_tokens(&pin.code).await {
            Ok(tokens) => {
                let data = entry_data(client.api_key(), &tokens);
                let title = ctx
                    .reauth_entry()
                    .map(|entry| entry.title)
                    .unwrap_or_else(|| DEFAULT_TITLE.to_string());
                Ok(ctx.create_entry(title, data))
            }
            Err(err) => {
                error!(%err, "Could not trade the ecobee PIN for tokens");
                let errors = HashMap::from([(
                    "base".to_string(),
                    Self::form_error(&err, ERROR_TOKEN_REQUEST_FAILED),
                )]);
                Ok(Self::authorize_form(ctx, pin).with_errors(errors))
            }
        }
    }
}

#[async_trait]
impl ConfigFlow for EcobeeFlow {
    async fn step(
        &mut self,
        step_id: &str,
        input: Option<EntryData>,
        ctx: &mut FlowContext,
    ) -> Result<FlowResult, FlowError> {
        match step_id {
            "user" => self.step_user(input, ctx).await,
            "authorize" => self.step_authorize(ctx).await,
            // Started with the entry data; ask for a new PIN with the stored key
            "reauth" => {
                let api_key = input
                    .as_ref()
                    .and_then(|data| data.get(CONF_API_KEY))
                    .cloned()
                    .unwrap_or_default();
                let data = EntryData::from([(CONF_API_KEY.to_string(), api_key)]);
                self.step_user(Some(data), ctx).await
            }
            _ => Err(FlowError::UnknownStep {
                handler: ctx.handler().to_string(),
                step_id: step_id.to_string(),
            }),
        }
    }
}
