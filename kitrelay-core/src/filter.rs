//! Filter store
//!
//! Per-kit allow/deny rules for events, attributes and identities. Every
//! evaluation here is a pure function of the rules and its input: nothing is
//! mutated, and filtered collections are always fresh copies, so filters can be
//! evaluated on any thread without holding a lock.
//!
//! ## Keys
//!
//! Rule documents map a key to `true` (allow) or `false` (deny). Keys that
//! parse as a 32-bit integer are treated as hashes produced by [`key_hash`];
//! any other key is a plain, case-insensitive name. Anything not mentioned is
//! forwarded.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use crate::types::{Attributes, CommerceEvent, Event, IdentityType, SCREEN_TYPE_CODE};

/// Hash a filter key the way remote configuration does.
///
/// The key is lowercased, then folded with the 31-multiplier string hash over
/// its UTF-16 code units using wrapping 32-bit arithmetic.
pub fn key_hash(input: &str) -> i32 {
    input
        .to_lowercase()
        .encode_utf16()
        .fold(0i32, |hash, unit| {
            hash.wrapping_shl(5)
                .wrapping_sub(hash)
                .wrapping_add(unit as i32)
        })
}

/// A set of allow/deny rules keyed by hashed or plain names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "BTreeMap<String, bool>")]
pub struct FilterRules {
    hashed: HashMap<i32, bool>,
    plain: HashMap<String, bool>,
}

impl From<BTreeMap<String, bool>> for FilterRules {
    fn from(entries: BTreeMap<String, bool>) -> Self {
        let mut rules = FilterRules::default();
        for (key, allow) in entries {
            match key.trim().parse::<i32>() {
                Ok(hash) => {
                    rules.hashed.insert(hash, allow);
                }
                Err(_) => {
                    rules.plain.insert(key.to_lowercase(), allow);
                }
            }
        }
        rules
    }
}

impl FilterRules {
    pub fn is_empty(&self) -> bool {
        self.hashed.is_empty() && self.plain.is_empty()
    }

    /// Deny a plain key.
    pub fn deny(mut self, key: &str) -> Self {
        self.plain.insert(key.to_lowercase(), false);
        self
    }

    /// Deny the hash of `hash_input`.
    pub fn deny_hashed(mut self, hash_input: &str) -> Self {
        self.hashed.insert(key_hash(hash_input), false);
        self
    }

    /// Evaluate the rules for a key.
    ///
    /// `plain_key` is matched against plain entries, `hash_input` is hashed and
    /// matched against hashed entries. A plain entry wins when both exist.
    pub fn allows(&self, hash_input: &str, plain_key: &str) -> bool {
        if let Some(allow) = self.plain.get(&plain_key.to_lowercase()) {
            return *allow;
        }
        if self.hashed.is_empty() {
            return true;
        }
        self.hashed
            .get(&key_hash(hash_input))
            .copied()
            .unwrap_or(true)
    }

    /// Evaluate the rules for a key that is hashed as-is.
    pub fn should_forward(&self, key: &str) -> bool {
        self.allows(key, key)
    }

    /// Copy the entries of `attributes` that pass the rules.
    ///
    /// `hash_input` builds the hashed form of each key (e.g. prefixing an event
    /// type code and name). The input map is never modified.
    pub fn filter<V, F>(&self, attributes: &BTreeMap<String, V>, hash_input: F) -> BTreeMap<String, V>
    where
        V: Clone,
        F: Fn(&str) -> String,
    {
        if self.is_empty() {
            return attributes.clone();
        }
        attributes
            .iter()
            .filter(|(key, _)| self.allows(&hash_input(key.as_str()), key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Event, screen and commerce filters of one kit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventFilters {
    pub event_types: FilterRules,
    pub event_names: FilterRules,
    pub event_attributes: FilterRules,
    pub screen_names: FilterRules,
    pub screen_attributes: FilterRules,
    pub commerce_attributes: FilterRules,
    pub commerce_entities: FilterRules,
}

impl EventFilters {
    /// Whether a generic event passes the type and name rules.
    pub fn should_log_event(&self, event: &Event) -> bool {
        let code = event.event_type.code();
        self.event_types
            .allows(&code.to_string(), event.event_type.as_str())
            && self
                .event_names
                .allows(&format!("{code}{}", event.name), &event.name)
    }

    /// Whether a screen view passes the screen name rules.
    pub fn should_log_screen(&self, name: &str) -> bool {
        self.screen_names
            .allows(&format!("{SCREEN_TYPE_CODE}{name}"), name)
    }

    pub fn filter_event_attributes(&self, event: &Event) -> Attributes {
        let prefix = format!("{}{}", event.event_type.code(), event.name);
        self.event_attributes
            .filter(&event.attributes, |key| format!("{prefix}{key}"))
    }

    pub fn filter_screen_attributes(&self, name: &str, attributes: &Attributes) -> Attributes {
        let prefix = format!("{SCREEN_TYPE_CODE}{name}");
        self.screen_attributes
            .filter(attributes, |key| format!("{prefix}{key}"))
    }

    /// Produce the filtered copy of a commerce event, or `None` when the
    /// whole event is denied.
    pub fn filter_commerce_event(&self, event: &CommerceEvent) -> Option<CommerceEvent> {
        let code = event.type_code();
        if !self
            .event_types
            .allows(&code.to_string(), event.action_name())
        {
            return None;
        }

        let mut filtered = event.clone();
        filtered.attributes = self
            .commerce_attributes
            .filter(&event.attributes, |key| format!("{code}{key}"));
        if !self.commerce_entities.should_forward("products") {
            filtered.products.clear();
        }
        if !self.commerce_entities.should_forward("promotions") {
            filtered.promotions.clear();
        }
        if !self.commerce_entities.should_forward("impressions") {
            filtered.impressions.clear();
        }
        Some(filtered)
    }
}

/// User attribute filters, split by value shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AttributeFilters {
    pub single: FilterRules,
    pub list: FilterRules,
}

impl AttributeFilters {
    pub fn should_forward_single(&self, key: &str) -> bool {
        self.single.should_forward(key)
    }

    pub fn should_forward_list(&self, key: &str) -> bool {
        self.list.should_forward(key)
    }

    pub fn filter_single(&self, attributes: &Attributes) -> Attributes {
        self.single.filter(attributes, str::to_string)
    }

    pub fn filter_lists(
        &self,
        attributes: &BTreeMap<String, Vec<String>>,
    ) -> BTreeMap<String, Vec<String>> {
        self.list.filter(attributes, str::to_string)
    }
}

/// Which identity types a kit may receive, keyed by identity code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "BTreeMap<String, bool>")]
pub struct IdentityRules(HashMap<i32, bool>);

impl From<BTreeMap<String, bool>> for IdentityRules {
    fn from(entries: BTreeMap<String, bool>) -> Self {
        IdentityRules(
            entries
                .into_iter()
                .filter_map(|(key, allow)| match key.trim().parse::<i32>() {
                    Ok(code) => Some((code, allow)),
                    Err(_) => {
                        tracing::debug!(key = %key, "Ignoring non-numeric identity rule key");
                        None
                    }
                })
                .collect(),
        )
    }
}

impl IdentityRules {
    pub fn deny(mut self, identity_type: IdentityType) -> Self {
        self.0.insert(identity_type.code(), false);
        self
    }

    pub fn should_set_identity(&self, identity_type: IdentityType) -> bool {
        self.0.get(&identity_type.code()).copied().unwrap_or(true)
    }
}
