//! Client for the local HomeWizard Energy API, version 1

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const SUPPORTED_API_VERSION: &str = "v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HomeWizardError {
    /// The user has not switched on "Local API" in the HomeWizard app
    #[error("the local API is disabled on the device")]
    Disabled,

    #[error("could not reach the device: {0}")]
    Network(#[source] reqwest::Error),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("device reports API version {0}")]
    UnsupportedVersion(String),
}

impl From<reqwest::Error> for HomeWizardError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            HomeWizardError::InvalidResponse(err.to_string())
        } else {
            HomeWizardError::Network(err)
        }
    }
}

/// `GET /api`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Device {
    pub product_name: String,
    pub product_type: String,
    pub serial: String,
    pub firmware_version: String,
    pub api_version: String,
}

impl Device {
    /// Unique id of the config entry for this device
    pub fn unique_id(&self) -> String {
        format!("{}_{}", self.product_type, self.serial)
    }

    pub fn is_energy_socket(&self) -> bool {
        self.product_type == PRODUCT_ENERGY_SOCKET
    }

    /// Battery powered water meters have no status light to blink
    pub fn supports_identify(&self) -> bool {
        matches!(
            self.product_type.as_str(),
            PRODUCT_P1_METER | PRODUCT_ENERGY_SOCKET
        )
    }
}

pub const PRODUCT_P1_METER: &str = "HWE-P1";
pub const PRODUCT_ENERGY_SOCKET: &str = "HWE-SKT";
pub const PRODUCT_WATERMETER: &str = "HWE-WTR";

/// Meter attached to a P1 meter over M-Bus, such as a gas meter
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExternalDevice {
    pub unique_id: String,
    #[serde(rename = "type")]
    pub meter_type: String,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub timestamp: Option<u64>,
}

impl ExternalDevice {
    /// Key the entities of this meter are registered under
    pub fn key(&self) -> String {
        format!("{}_{}", self.meter_type, self.unique_id)
    }
}

/// `GET /api/v1/data`; which fields are present depends on the product and
/// the connected smart meter
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Measurement {
    pub wifi_ssid: Option<String>,
    pub wifi_strength: Option<i64>,
    pub smr_version: Option<i64>,
    pub meter_model: Option<String>,
    /// Hex encoded ASCII
    #[serde(rename = "unique_id")]
    pub unique_meter_id: Option<String>,
    pub active_tariff: Option<i64>,

    pub total_power_import_kwh: Option<f64>,
    pub total_power_import_t1_kwh: Option<f64>,
    pub total_power_import_t2_kwh: Option<f64>,
    pub total_power_import_t3_kwh: Option<f64>,
    pub total_power_import_t4_kwh: Option<f64>,
    pub total_power_export_kwh: Option<f64>,
    pub total_power_export_t1_kwh: Option<f64>,
    pub total_power_export_t2_kwh: Option<f64>,
    pub total_power_export_t3_kwh: Option<f64>,
    pub total_power_export_t4_kwh: Option<f64>,

    pub active_power_w: Option<f64>,
    pub active_power_l1_w: Option<f64>,
    pub active_power_l2_w: Option<f64>,
    pub active_power_l3_w: Option<f64>,
    pub active_voltage_v: Option<f64>,
    pub active_voltage_l1_v: Option<f64>,
    pub active_voltage_l2_v: Option<f64>,
    pub active_voltage_l3_v: Option<f64>,
    pub active_current_a: Option<f64>,
    pub active_current_l1_a: Option<f64>,
    pub active_current_l2_a: Option<f64>,
    pub active_current_l3_a: Option<f64>,
    pub active_frequency_hz: Option<f64>,
    pub active_apparent_power_va: Option<f64>,
    pub active_reactive_power_var: Option<f64>,
    pub active_power_factor: Option<f64>,

    pub voltage_sag_l1_count: Option<i64>,
    pub voltage_sag_l2_count: Option<i64>,
    pub voltage_sag_l3_count: Option<i64>,
    pub voltage_swell_l1_count: Option<i64>,
    pub voltage_swell_l2_count: Option<i64>,
    pub voltage_swell_l3_count: Option<i64>,
    pub any_power_fail_count: Option<i64>,
    pub long_power_fail_count: Option<i64>,
    pub active_power_average_w: Option<f64>,
    // Misspelled by the device firmware
    #[serde(rename = "montly_power_peak_w", alias = "monthly_power_peak_w")]
    pub monthly_power_peak_w: Option<f64>,

    pub active_liter_lpm: Option<f64>,
    pub total_liter_m3: Option<f64>,

    pub external: Vec<ExternalDevice>,
}

impl Measurement {
    /// Meter identifier decoded from hex, as printed on the meter
    pub fn meter_id(&self) -> Option<String> {
        let hex = self.unique_meter_id.as_deref()?;
        decode_hex_ascii(hex).or_else(|| Some(hex.to_string()))
    }
}

fn decode_hex_ascii(hex: &str) -> Option<String> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// `GET /api/v1/state`, energy sockets only
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SocketState {
    pub power_on: bool,
    pub switch_lock: bool,
    pub brightness: u8,
}

/// Body of `PUT /api/v1/state`; unset fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SocketStateUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub switch_lock: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct HomeWizardClient {
    http: reqwest::Client,
    base_url: String,
}

impl HomeWizardClient {
    /// `host` is an IP address or host name, optionally with a port
    pub fn new(http: reqwest::Client, host: &str) -> Self {
        let host = host.trim_end_matches('/');
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&SocketStateUpdate>,
    ) -> Result<T, HomeWizardError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "HomeWizard request");

        let mut request = self
            .http
            .request(method, &url)
            .timeout(REQUEST_TIMEOUT);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        match response.status() {
            StatusCode::FORBIDDEN => Err(HomeWizardError::Disabled),
            status if !status.is_success() => Err(HomeWizardError::InvalidResponse(format!(
                "{path} returned HTTP {status}"
            ))),
            _ => Ok(response.json().await?),
        }
    }

    /// Identify the device; fails for firmware speaking another API version
    pub async fn device(&self) -> Result<Device, HomeWizardError> {
        let device: Device = self.request(Method::GET, "/api", None).await?;
        if device.api_version != SUPPORTED_API_VERSION {
            return Err(HomeWizardError::UnsupportedVersion(device.api_version));
        }
        Ok(device)
    }

    pub async fn data(&self) -> Result<Measurement, HomeWizardError> {
        self.request(Method::GET, "/api/v1/data", None).await
    }

    pub async fn state(&self) -> Result<SocketState, HomeWizardError> {
        self.request(Method::GET, "/api/v1/state", None).await
    }

    /// Change the socket state and return the resulting state
    pub async fn set_state(
        &self,
        update: &SocketStateUpdate,
    ) -> Result<SocketState, HomeWizardError> {
        self.request(Method::PUT, "/api/v1/state", Some(update)).await
    }

    /// Blink the status light
    pub async fn identify(&self) -> Result<(), HomeWizardError> {
        let _: serde_json::Value = self.request(Method::PUT, "/api/v1/identify", None).await?;
        Ok(())
    }
}
