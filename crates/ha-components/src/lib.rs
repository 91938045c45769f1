//! Built-in integrations
//!
//! - [`statistics`]: sensors computing characteristics over the recent
//!   states of another entity, configured in YAML
//! - [`homewizard`]: HomeWizard Energy devices on the local network
//! - [`ecobee`]: ecobee thermostats through the ecobee cloud

pub mod ecobee;
pub mod homewizard;
pub mod statistics;

use std::sync::Arc;

use ha_helpers::Integration;

pub use ecobee::Ecobee;
pub use homewizard::HomeWizard;
pub use statistics::Statistics;

/// Every integration shipped with the server
pub fn builtin_integrations(http: reqwest::Client) -> Vec<Arc<dyn Integration>> {
    vec![
        Arc::new(Statistics),
        Arc::new(HomeWizard::new(http.clone())),
        Arc::new(Ecobee::new(http)),
    ]
}
