use std::sync::Arc;

use ha_helpers::CoordinatorEntity;
use ha_registries::{DeviceIdentifier, DeviceInfo};

use super::api::Thermostat;
use super::coordinator::EcobeeCoordinator;
use super::DOMAIN;

pub const MANUFACTURER: &str = "ecobee";

fn model_name(model_number: &str) -> Option<&'static str> {
    Some(match model_number {
        "idtSmart" => "ecobee Smart",
        "idtEms" => "ecobee Smart EMS",
        "siSmart" => "ecobee Si Smart",
        "siEms" => "ecobee Si EMS",
        "athenaSmart" => "ecobee3 Smart",
        "athenaEms" => "ecobee3 EMS",
        "corSmart" => "Carrier/Bryant Cor",
        "nikeSmart" => "ecobee3 lite Smart",
        "nikeEms" => "ecobee3 lite EMS",
        "apolloSmart" => "ecobee4 Smart",
        "vulcanSmart" => "ecobee4 Smart",
        "aresSmart" => "ecobee Smart Premium",
        "artemisSmart" => "ecobee Smart Enhanced",
        _ => return None,
    })
}

/// Device of a thermostat
pub fn thermostat_device(thermostat: &Thermostat) -> DeviceInfo {
    DeviceInfo {
        identifiers: vec![DeviceIdentifier::new(DOMAIN, &thermostat.identifier)],
        name: Some(thermostat.name.clone()),
        manufacturer: Some(MANUFACTURER.to_string()),
        model: model_name(&thermostat.model_number).map(|name| format!("{name} Thermostat")),
        ..Default::default()
    }
}

/// Shared part of the entities of one thermostat
pub struct EcobeeEntity {
    pub base: CoordinatorEntity<Vec<Thermostat>>,
    pub identifier: String,
}

impl EcobeeEntity {
    pub fn new(coordinator: Arc<EcobeeCoordinator>, identifier: &str) -> Self {
        Self {
            base: CoordinatorEntity::new(coordinator),
            identifier: identifier.to_string(),
        }
    }

    /// Run `f` on the latest data of this thermostat
    pub fn with_thermostat<R>(&self, f: impl FnOnce(&Thermostat) -> R) -> Option<R> {
        let data = self.base.data()?;
        data.iter().find(|t| t.identifier == self.identifier).map(f)
    }

    /// The coordinator succeeded and the thermostat is online
    pub fn available(&self) -> bool {
        self.base.available() && self.with_thermostat(|t| t.runtime.connected) == Some(true)
    }
}
