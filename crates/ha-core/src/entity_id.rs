//! Entity ids (`domain.object_id`) and the slug rules used to build them

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Why a string is not an entity id
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityIdError {
    /// No dot separating domain and object id
    #[error("entity_id must have the form <domain>.<object_id>")]
    InvalidFormat,

    #[error("domain '{0}' is not a valid slug")]
    InvalidDomain(String),

    #[error("object_id '{0}' is not a valid slug")]
    InvalidObjectId(String),
}

/// Identifier of an entity, e.g. `sensor.kitchen_power`
///
/// Both halves are slugs: lowercase ASCII letters, digits and underscores,
/// not starting or ending with an underscore. The domain additionally may
/// not contain a double underscore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    domain: String,
    object_id: String,
}

impl EntityId {
    /// Validate both halves
    pub fn new(
        domain: impl Into<String>,
        object_id: impl Into<String>,
    ) -> Result<Self, EntityIdError> {
        let domain = domain.into();
        let object_id = object_id.into();

        if !is_slug(&domain) || domain.contains("__") {
            return Err(EntityIdError::InvalidDomain(domain));
        }
        if !is_slug(&object_id) {
            return Err(EntityIdError::InvalidObjectId(object_id));
        }

        Ok(Self { domain, object_id })
    }

    /// Part before the dot, usually a platform name
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }
}

fn is_slug(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('_')
        && !s.ends_with('_')
        && s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Turn free text into a slug usable as an object id
///
/// Runs of characters that are not ASCII alphanumerics collapse into a
/// single underscore. Text with nothing usable becomes `unknown`.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_sep = false;

    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(c);
        } else {
            pending_sep = true;
        }
    }

    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (domain, object_id) = s.split_once('.').ok_or(EntityIdError::InvalidFormat)?;
        if object_id.contains('.') {
            return Err(EntityIdError::InvalidFormat);
        }
        Self::new(domain, object_id)
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String {
        id.to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.object_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id: EntityId = "sensor.grid_power".parse().unwrap();
        assert_eq!(id.domain(), "sensor");
        assert_eq!(id.object_id(), "grid_power");
        assert_eq!(id.to_string(), "sensor.grid_power");
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert_eq!(
            "sensor".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidFormat
        );
        assert_eq!(
            "sensor.a.b".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidFormat
        );
        assert!(matches!(
            ".power".parse::<EntityId>(),
            Err(EntityIdError::InvalidDomain(_))
        ));
        assert!(matches!(
            "sensor.".parse::<EntityId>(),
            Err(EntityIdError::InvalidObjectId(_))
        ));
    }

    #[test]
    fn test_slug_rules() {
        assert!("sensor.Power".parse::<EntityId>().is_err());
        assert!("sensor._power".parse::<EntityId>().is_err());
        assert!("sensor.power_".parse::<EntityId>().is_err());
        assert!("bin__sensor.power".parse::<EntityId>().is_err());
        assert!("sensor.grid__power".parse::<EntityId>().is_ok());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Energy Socket"), "energy_socket");
        assert_eq!(slugify("  P1 meter: Power (W) "), "p1_meter_power_w");
        assert_eq!(slugify("Wi-Fi strength"), "wi_fi_strength");
        assert_eq!(slugify("!!!"), "unknown");
    }

    #[test]
    fn test_serde_as_string() {
        let id = EntityId::new("switch", "socket").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"switch.socket\"");
        assert_eq!(serde_json::from_str::<EntityId>(&json).unwrap(), id);
        assert!(serde_json::from_str::<EntityId>("\"nope\"").is_err());
    }
}
