//! Context type linking state writes and service calls to their cause

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Origin of an action
///
/// A context is created when something external happens (a poll result, a
/// user pressing a button, a service call). Work triggered by that action
/// carries a child context so the chain can be followed in logs and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// ULID, so ids sort by creation time
    pub id: String,

    /// User that initiated the action, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Context this one was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    /// Fresh context with a new ULID and no user or parent
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: None,
            parent_id: None,
        }
    }

    /// Context for an action initiated by a user
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::new()
        }
    }

    /// Derive a context for work caused by this one
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: self.user_id.clone(),
            parent_id: Some(self.id.clone()),
        }
    }

    /// True when `other` is the direct parent of this context
    pub fn is_child_of(&self, other: &Context) -> bool {
        self.parent_id.as_deref() == Some(other.id.as_str())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_keeps_user_and_links_parent() {
        let parent = Context::for_user("abc");
        let child = parent.child();

        assert_ne!(child.id, parent.id);
        assert_eq!(child.user_id.as_deref(), Some("abc"));
        assert!(child.is_child_of(&parent));
        assert!(!parent.is_child_of(&child));
    }

    #[test]
    fn test_serialization_omits_empty_fields() {
        let ctx = Context::new();
        let json = serde_json::to_value(&ctx).unwrap();
        assert!(json.get("user_id").is_none());
        assert!(json.get("parent_id").is_none());
    }
}
