//! Per-kit configuration blocks from the remote configuration document.
//!
//! A snapshot is an ordered JSON array; each element configures one kit:
//!
//! ```json
//! {
//!   "id": 1,
//!   "enabled": true,
//!   "settings": { "apiKey": "abc" },
//!   "eventFilters": { "eventNames": { "Internal Ping": false } },
//!   "attributeFilters": { "single": { "email": false }, "list": {} },
//!   "identityForwardingRules": { "7": false },
//!   "projectionRules": [],
//!   "bracketing": { "low": 0, "high": 50 }
//! }
//! ```
//!
//! A parsed [`KitConfiguration`] is immutable. Updates build a new value and
//! swap it in; in-flight dispatch keeps reading the one it started with.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::filter::{AttributeFilters, EventFilters, IdentityRules};
use crate::projection::{ProjectionRule, SourceKind};
use crate::types::{Attributes, CommerceEvent, Event, IdentityType, KitId};

/// Opaque settings handed to the kit.
pub type Settings = BTreeMap<String, serde_json::Value>;

/// Setting that lets a kit keep running for opted-out users.
pub const HONOR_OPT_OUT_SETTING: &str = "honorOptOut";

/// User bucket window a kit is enabled for: `low <= bucket < high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Bracketing {
    #[serde(default)]
    pub low: u8,
    #[serde(default = "default_high")]
    pub high: u8,
}

fn default_high() -> u8 {
    100
}

impl Bracketing {
    pub fn contains(&self, bucket: u8) -> bool {
        bucket >= self.low && bucket < self.high
    }
}

/// Configuration of a single kit.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KitConfiguration {
    pub id: KitId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub event_filters: EventFilters,
    #[serde(default)]
    pub attribute_filters: AttributeFilters,
    #[serde(default)]
    pub identity_forwarding_rules: IdentityRules,
    #[serde(default)]
    pub projection_rules: Vec<ProjectionRule>,
    #[serde(default)]
    pub bracketing: Option<Bracketing>,
}

fn default_enabled() -> bool {
    true
}

impl KitConfiguration {
    /// An enabled configuration with no filters, rules or settings.
    pub fn new(id: KitId) -> Self {
        Self {
            id,
            enabled: true,
            settings: Settings::new(),
            event_filters: EventFilters::default(),
            attribute_filters: AttributeFilters::default(),
            identity_forwarding_rules: IdentityRules::default(),
            projection_rules: Vec::new(),
            bracketing: None,
        }
    }

    /// Read the kit id of a raw block without parsing the rest of it.
    pub fn extract_id(block: &serde_json::Value) -> Option<KitId> {
        block
            .get("id")
            .and_then(|v| v.as_i64())
            .and_then(|id| KitId::try_from(id).ok())
    }

    /// Parse one configuration block.
    pub fn from_json(block: &serde_json::Value) -> Result<Self> {
        let kit_id = Self::extract_id(block).ok_or_else(|| {
            Error::Config("kit configuration block has no integer id".to_string())
        })?;
        serde_json::from_value(block.clone()).map_err(|e| Error::MalformedKitConfig {
            kit_id,
            message: e.to_string(),
        })
    }

    /// Look up a setting as a string, stringifying scalars.
    pub fn setting(&self, key: &str) -> Option<String> {
        match self.settings.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Whether the kit stays enabled for opted-out users.
    pub fn honors_opt_out(&self) -> bool {
        self.setting(HONOR_OPT_OUT_SETTING)
            .map(|v| !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true)
    }

    pub fn passes_bracketing(&self, user_bucket: u8) -> bool {
        self.bracketing
            .map(|b| b.contains(user_bucket))
            .unwrap_or(true)
    }

    /// Whether the kit must not receive anything under the given host state.
    pub fn is_disabled(&self, user_bucket: u8, opted_out: bool) -> bool {
        !self.enabled
            || !self.passes_bracketing(user_bucket)
            || (opted_out && self.honors_opt_out())
    }

    // ============================================
    // Filter store contract
    // ============================================

    pub fn should_log_event(&self, event: &Event) -> bool {
        self.event_filters.should_log_event(event)
    }

    pub fn should_log_screen(&self, name: &str) -> bool {
        self.event_filters.should_log_screen(name)
    }

    pub fn filter_event_attributes(&self, event: &Event) -> Attributes {
        self.event_filters.filter_event_attributes(event)
    }

    pub fn filter_screen_attributes(&self, name: &str, attributes: &Attributes) -> Attributes {
        self.event_filters.filter_screen_attributes(name, attributes)
    }

    pub fn filter_commerce_event(&self, event: &CommerceEvent) -> Option<CommerceEvent> {
        self.event_filters.filter_commerce_event(event)
    }

    pub fn should_forward_attribute(&self, key: &str) -> bool {
        self.attribute_filters.should_forward_single(key)
    }

    pub fn should_forward_attribute_list(&self, key: &str) -> bool {
        self.attribute_filters.should_forward_list(key)
    }

    pub fn filter_user_attributes(&self, attributes: &Attributes) -> Attributes {
        self.attribute_filters.filter_single(attributes)
    }

    pub fn filter_user_attribute_lists(
        &self,
        attributes: &BTreeMap<String, Vec<String>>,
    ) -> BTreeMap<String, Vec<String>> {
        self.attribute_filters.filter_lists(attributes)
    }

    pub fn should_set_identity(&self, identity_type: IdentityType) -> bool {
        self.identity_forwarding_rules
            .should_set_identity(identity_type)
    }

    /// Projection rules that apply to a source kind, in declaration order.
    pub fn projections(&self, kind: SourceKind) -> Vec<&ProjectionRule> {
        self.projection_rules
            .iter()
            .filter(|rule| rule.matcher.source == kind)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventType;
    use serde_json::json;

    #[test]
    fn test_parse_minimal_block() {
        let block = json!({"id": 1, "enabled": true, "eventFilters": {}, "projectionRules": []});
        let config = KitConfiguration::from_json(&block).unwrap();
        assert_eq!(config.id, 1);
        assert!(config.enabled);
        assert!(config.projection_rules.is_empty());
        assert!(!config.is_disabled(0, false));
    }

    #[test]
    fn test_enabled_defaults_to_true() {
        let config = KitConfiguration::from_json(&json!({"id": 9})).unwrap();
        assert!(config.enabled);
    }

    #[test]
    fn test_malformed_block_reports_kit_id() {
        let block = json!({"id": 5, "eventFilters": {"eventNames": {"abc": "yes"}}});
        match KitConfiguration::from_json(&block) {
            Err(Error::MalformedKitConfig { kit_id, .. }) => assert_eq!(kit_id, 5),
            other => panic!("expected malformed config error, got {other:?}"),
        }

        assert!(KitConfiguration::from_json(&json!({"enabled": true})).is_err());
    }

    #[test]
    fn test_bracketing_and_opt_out() {
        let block = json!({"id": 2, "bracketing": {"low": 10, "high": 20}});
        let config = KitConfiguration::from_json(&block).unwrap();
        assert!(config.is_disabled(5, false));
        assert!(!config.is_disabled(10, false));
        assert!(config.is_disabled(20, false));

        let config = KitConfiguration::new(3);
        assert!(config.is_disabled(0, true));

        let block = json!({"id": 4, "settings": {"honorOptOut": "false"}});
        let config = KitConfiguration::from_json(&block).unwrap();
        assert!(!config.is_disabled(0, true));
    }

    #[test]
    fn test_filters_parse_from_document() {
        let block = json!({
            "id": 7,
            "eventFilters": {"eventNames": {"Secret": false}},
            "attributeFilters": {"single": {"email": false}, "list": {"tags": false}},
            "identityForwardingRules": {"7": false}
        });
        let config = KitConfiguration::from_json(&block).unwrap();
        assert!(!config.should_log_event(&Event::new("Secret", EventType::Other)));
        assert!(config.should_log_event(&Event::new("Public", EventType::Other)));
        assert!(!config.should_forward_attribute("email"));
        assert!(config.should_forward_attribute("tags"));
        assert!(!config.should_forward_attribute_list("tags"));
        assert!(!config.should_set_identity(IdentityType::Email));
        assert_eq!(config.setting("missing"), None);
    }
}
