//! Client for the ecobee cloud API
//!
//! Authorisation uses the ecobee PIN flow: the app requests a PIN for its
//! API key, the user enters the PIN on ecobee.com, and the code that came
//! with the PIN is exchanged for an access and a refresh token. Access
//! tokens expire after an hour and are renewed with the refresh token.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const API_BASE_URL: &str = "https://api.ecobee.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// `status.code` of a thermostat request made with an expired token
const STATUS_TOKEN_EXPIRED: i64 = 14;
/// `status.code` when the token does not grant access to the thermostat
const STATUS_NOT_AUTHORIZED: i64 = 16;

#[derive(Debug, Error)]
pub enum EcobeeError {
    #[error("the access token has expired")]
    TokenExpired,

    /// The API key or refresh token was rejected
    #[error("authorization rejected: {0}")]
    Unauthorized(String),

    #[error("could not reach ecobee: {0}")]
    Network(#[source] reqwest::Error),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("ecobee returned status {code}: {message}")]
    Api { code: i64, message: String },
}

impl From<reqwest::Error> for EcobeeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            EcobeeError::InvalidResponse(err.to_string())
        } else {
            EcobeeError::Network(err)
        }
    }
}

impl EcobeeError {
    /// Whether the user has to authorise the app again
    pub fn is_auth(&self) -> bool {
        matches!(self, EcobeeError::TokenExpired | EcobeeError::Unauthorized(_))
    }
}

/// `GET /authorize`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PinResponse {
    #[serde(rename = "ecobeePin")]
    pub ecobee_pin: String,
    /// Exchanged for tokens once the PIN was entered on ecobee.com
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Status {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThermostatResponse {
    #[serde(default)]
    thermostat_list: Vec<Thermostat>,
    #[serde(default)]
    status: Status,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: Status,
}

/// A thermostat with the parts the integration selects
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Thermostat {
    pub identifier: String,
    pub name: String,
    pub model_number: String,
    pub runtime: Runtime,
    pub settings: Settings,
    pub program: Program,
    pub events: Vec<Event>,
    /// Comma separated list of running equipment, empty when idle
    pub equipment_status: String,
    pub remote_sensors: Vec<RemoteSensor>,
}

/// Live readings; temperatures are in tenths of a degree Fahrenheit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Runtime {
    pub connected: bool,
    pub actual_temperature: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_humidity: Option<i64>,
    pub desired_heat: i64,
    pub desired_cool: i64,
    pub desired_humidity: i64,
    pub desired_fan_mode: String,
    /// Fields the integration does not interpret
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub hvac_mode: String,
    pub heat_stages: i64,
    pub cool_stages: i64,
    pub has_heat_pump: bool,
    pub has_humidifier: bool,
    pub humidifier_mode: String,
    /// What a hold set from the thermostat lasts for, e.g. `nextPeriod`
    pub hold_action: String,
    /// Minimum gap between heat and cool setpoints in auto mode, in tenths
    pub heat_cool_min_delta: i64,
    pub fan_min_on_time: i64,
    pub heat_range_low: i64,
    pub cool_range_high: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Program {
    pub climates: Vec<Climate>,
    pub current_climate_ref: String,
}

/// A comfort setting of the schedule, such as Home or Sleep
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Climate {
    pub climate_ref: String,
    pub name: String,
}

/// Something overriding the schedule: a hold, a vacation, ...
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub name: String,
    pub running: bool,
    pub hold_climate_ref: String,
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteSensor {
    pub id: String,
    pub name: String,
    /// `thermostat` for the sensor built into the thermostat
    #[serde(rename = "type")]
    pub sensor_type: String,
    pub code: Option<String>,
    pub in_use: bool,
    pub capability: Vec<Capability>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Capability {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Number as text, or `unknown`
    pub value: String,
}

/// How long a hold lasts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HoldType {
    NextTransition,
    Indefinite,
    HoldHours,
}

/// A thermostat function for `POST /1/thermostat`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Function {
    #[serde(rename = "type")]
    pub function_type: String,
    pub params: Value,
}

impl Function {
    pub fn resume_program(resume_all: bool) -> Self {
        Self {
            function_type: "resumeProgram".into(),
            params: json!({ "resumeAll": resume_all }),
        }
    }

    /// Hold the given setpoints, in tenths of a degree Fahrenheit
    pub fn hold_temperature(
        heat: i64,
        cool: i64,
        hold_type: HoldType,
        hold_hours: Option<u32>,
    ) -> Self {
        Self::hold(
            json!({ "heatHoldTemp": heat, "coolHoldTemp": cool }),
            hold_type,
            hold_hours,
        )
    }

    /// Hold a comfort setting of the schedule
    pub fn hold_climate(climate_ref: &str, hold_type: HoldType, hold_hours: Option<u32>) -> Self {
        Self::hold(json!({ "holdClimateRef": climate_ref }), hold_type, hold_hours)
    }

    pub fn hold_fan(fan_mode: &str, hold_type: HoldType, hold_hours: Option<u32>) -> Self {
        Self::hold(json!({ "fan": fan_mode }), hold_type, hold_hours)
    }

    pub fn delete_vacation(name: &str) -> Self {
        Self {
            function_type: "deleteVacation".into(),
            params: json!({ "name": name }),
        }
    }

    fn hold(mut params: Value, hold_type: HoldType, hold_hours: Option<u32>) -> Self {
        params["holdType"] = json!(hold_type);
        if let (HoldType::HoldHours, Some(hours)) = (hold_type, hold_hours) {
            params["holdHours"] = json!(hours);
        }
        Self {
            function_type: "setHold".into(),
            params,
        }
    }
}

/// Called with the new tokens after a refresh so they can be persisted
pub type TokensRefreshed = Arc<dyn Fn(Tokens) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub struct EcobeeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    tokens: Arc<RwLock<Tokens>>,
    on_refresh: Option<TokensRefreshed>,
}

impl EcobeeClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str, tokens: Tokens) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            tokens: Arc::new(RwLock::new(tokens)),
            on_refresh: None,
        }
    }

    pub fn with_refresh_hook(mut self, hook: TokensRefreshed) -> Self {
        self.on_refresh = Some(hook);
        self
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn tokens(&self) -> Tokens {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_tokens(&self, tokens: Tokens) {
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner) = tokens;
    }

    /// Ask for a PIN the user enters in the ecobee portal
    pub async fn request_pin(&self) -> Result<PinResponse, EcobeeError> {
        let url = format!("{}/authorize", self.base_url);
        debug!(%url, "Requesting ecobee PIN");
        let response = self
            .http
            .get(&url)
            .query(&[
                ("response_type", "ecobeePin"),
                ("client_id", self.api_key.as_str()),
                ("scope", "smartWrite"),
            ])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::token_endpoint_result(response).await
    }

    /// Exchange the code of an entered PIN for tokens and keep them
    pub async fn request_tokens(&self, code: &str) -> Result<Tokens, EcobeeError> {
        let tokens = self
            .post_token(&[("grant_type", "ecobeePin"), ("code", code)])
            .await?;
        self.set_tokens(tokens.clone());
        info!("Obtained ecobee tokens");
        Ok(tokens)
    }

    /// Renew the access token and hand the new tokens to the refresh hook
    pub async fn refresh_tokens(&self) -> Result<Tokens, EcobeeError> {
        let refresh_token = self.tokens().refresh_token;
        let tokens = self
            .post_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .await?;
        self.set_tokens(tokens.clone());
        debug!("Refreshed ecobee tokens");
        if let Some(hook) = &self.on_refresh {
            hook(tokens.clone()).await;
        }
        Ok(tokens)
    }

    async fn post_token(&self, params: &[(&str, &str)]) -> Result<Tokens, EcobeeError> {
        let url = format!("{}/token", self.base_url);
        let response = self
            .http
            .post(&url)
            .query(params)
            .query(&[("client_id", self.api_key.as_str())])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::token_endpoint_result(response).await
    }

    async fn token_endpoint_result<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, EcobeeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<TokenError>(&body) {
            Ok(err) => Err(EcobeeError::Unauthorized(
                err.error_description.unwrap_or(err.error),
            )),
            Err(_) => Err(EcobeeError::InvalidResponse(format!("HTTP {status}: {body}"))),
        }
    }

    async fn api_request<T: DeserializeOwned>(
        &self,
        method: Method,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T, EcobeeError> {
        let url = format!("{}/1/thermostat", self.base_url);
        debug!(%method, %url, "ecobee request");

        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(self.tokens().access_token)
            .query(query)
            .timeout(REQUEST_TIMEOUT);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(EcobeeError::TokenExpired);
        }

        let body: Value = response.json().await?;
        let api_status: Status = body
            .get("status")
            .cloned()
            .and_then(|s| serde_json::from_value(s).ok())
            .unwrap_or_default();
        match api_status.code {
            0 if status.is_success() => {
                serde_json::from_value(body).map_err(|e| EcobeeError::InvalidResponse(e.to_string()))
            }
            STATUS_TOKEN_EXPIRED => Err(EcobeeError::TokenExpired),
            STATUS_NOT_AUTHORIZED => Err(EcobeeError::Unauthorized(api_status.message)),
            0 => Err(EcobeeError::InvalidResponse(format!("HTTP {status}"))),
            code => Err(EcobeeError::Api {
                code,
                message: api_status.message,
            }),
        }
    }

    /// Make a thermostat request, refreshing the token once if it expired
    async fn authorized<T: DeserializeOwned>(
        &self,
        method: Method,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T, EcobeeError> {
        match self.api_request(method.clone(), query, body).await {
            Err(EcobeeError::TokenExpired) => {
                warn!("ecobee access token expired, refreshing");
                self.refresh_tokens().await?;
                self.api_request(method, query, body).await
            }
            result => result,
        }
    }

    /// Every thermostat registered to the account
    pub async fn thermostats(&self) -> Result<Vec<Thermostat>, EcobeeError> {
        let selection = json!({
            "selection": {
                "selectionType": "registered",
                "selectionMatch": "",
                "includeRuntime": true,
                "includeSettings": true,
                "includeProgram": true,
                "includeEquipmentStatus": true,
                "includeEvents": true,
                "includeSensors": true,
            }
        });
        let response: ThermostatResponse = self
            .authorized(Method::GET, &[("json", selection.to_string())], None)
            .await?;
        if response.status.code != 0 {
            return Err(EcobeeError::Api {
                code: response.status.code,
                message: response.status.message,
            });
        }
        Ok(response.thermostat_list)
    }

    /// Run functions and apply settings on one thermostat
    pub async fn update_thermostat(
        &self,
        identifier: &str,
        functions: Vec<Function>,
        settings: Option<Value>,
    ) -> Result<(), EcobeeError> {
        let mut body = json!({
            "selection": {
                "selectionType": "thermostats",
                "selectionMatch": identifier,
            },
        });
        if !functions.is_empty() {
            body["functions"] = json!(functions);
        }
        if let Some(settings) = settings {
            body["thermostat"] = json!({ "settings": settings });
        }
        let _: StatusResponse = self
            .authorized(Method::POST, &[("format", "json".to_string())], Some(&body))
            .await?;
        Ok(())
    }

    pub async fn resume_program(&self, identifier: &str, resume_all: bool) -> Result<(), EcobeeError> {
        self.update_thermostat(identifier, vec![Function::resume_program(resume_all)], None)
            .await
    }

    /// `mode` is an ecobee mode: `heat`, `cool`, `auto` or `off`
    pub async fn set_hvac_mode(&self, identifier: &str, mode: &str) -> Result<(), EcobeeError> {
        self.update_thermostat(identifier, Vec::new(), Some(json!({ "hvacMode": mode })))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Mutex;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> EcobeeClient {
        EcobeeClient::new(
            reqwest::Client::new(),
            &server.uri(),
            "API_KEY",
            Tokens {
                access_token: "old-access".into(),
                refresh_token: "old-refresh".into(),
            },
        )
    }

    fn ok_status() -> Value {
        json!({"status": {"code": 0, "message": ""}})
    }

    #[test]
    fn test_hold_function_params() {
        let function = Function::hold_temperature(700, 750, HoldType::HoldHours, Some(2));
        assert_eq!(function.function_type, "setHold");
        assert_eq!(
            function.params,
            json!({"heatHoldTemp": 700, "coolHoldTemp": 750, "holdType": "holdHours", "holdHours": 2})
        );

        let function = Function::hold_climate("away", HoldType::Indefinite, None);
        assert_eq!(
            function.params,
            json!({"holdClimateRef": "away", "holdType": "indefinite"})
        );
    }

    #[tokio::test]
    async fn test_pin_and_token_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/authorize"))
            .and(query_param("response_type", "ecobeePin"))
            .and(query_param("client_id", "API_KEY"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ecobeePin": "bv29",
                "code": "AUTH_CODE",
                "scope": "smartWrite",
                "expires_in": 9,
                "interval": 30,
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(query_param("grant_type", "ecobeePin"))
            .and(query_param("code", "AUTH_CODE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-access",
                "token_type": "Bearer",
                "refresh_token": "new-refresh",
                "expires_in": 3599,
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let pin = client.request_pin().await.unwrap();
        assert_eq!(pin.ecobee_pin, "bv29");

        let tokens = client.request_tokens(&pin.code).await.unwrap();
        assert_eq!(tokens.access_token, "new-access");
        assert_eq!(client.tokens(), tokens);
    }

    #[tokio::test]
    async fn test_token_errors_are_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "authorization_pending",
                "error_description": "Waiting for user to authorize application.",
            })))
            .mount(&server)
            .await;

        let err = client(&server).request_tokens("AUTH_CODE").await.unwrap_err();
        assert!(err.is_auth());
        assert!(err.to_string().contains("Waiting for user"));
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1/thermostat"))
            .and(header("authorization", "Bearer old-access"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "status": {"code": 14, "message": "Authentication token has expired."}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(query_param("grant_type", "refresh_token"))
            .and(query_param("refresh_token", "old-refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh",
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/1/thermostat"))
            .and(header("authorization", "Bearer new-access"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "thermostatList": [{"identifier": "511863391017", "name": "Hallway"}],
                "status": {"code": 0, "message": ""},
            })))
            .mount(&server)
            .await;

        let saved = Arc::new(Mutex::new(None));
        let hook_saved = saved.clone();
        let client = client(&server).with_refresh_hook(Arc::new(move |tokens| {
            let saved = hook_saved.clone();
            async move {
                *saved.lock().unwrap() = Some(tokens);
            }
            .boxed()
        }));

        let thermostats = client.thermostats().await.unwrap();
        assert_eq!(thermostats[0].name, "Hallway");
        assert_eq!(
            saved.lock().unwrap().as_ref().map(|t| t.refresh_token.as_str()),
            Some("new-refresh")
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1/thermostat"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
            .mount(&server)
            .await;

        let err = client(&server).thermostats().await.unwrap_err();
        assert!(matches!(err, EcobeeError::Unauthorized(ref m) if m == "invalid_grant"));
    }

    #[tokio::test]
    async fn test_update_selects_one_thermostat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/1/thermostat"))
            .and(body_partial_json(json!({
                "selection": {"selectionType": "thermostats", "selectionMatch": "511863391017"},
                "functions": [{"type": "resumeProgram", "params": {"resumeAll": true}}],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_status()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/1/thermostat"))
            .and(body_partial_json(json!({"thermostat": {"settings": {"hvacMode": "cool"}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_status()))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        client.resume_program("511863391017", true).await.unwrap();
        client.set_hvac_mode("511863391017", "cool").await.unwrap();
    }

    #[tokio::test]
    async fn test_api_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/1/thermostat"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "status": {"code": 3, "message": "Validation error. Hold temperatures out of range."}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .update_thermostat(
                "511863391017",
                vec![Function::hold_temperature(1200, 1300, HoldType::NextTransition, None)],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EcobeeError::Api { code: 3, .. }));
    }
}
