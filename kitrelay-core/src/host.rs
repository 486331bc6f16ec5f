//! Host contracts
//!
//! The engine pulls current runtime state from the host application when it
//! activates a kit, and hands attribution results back to it. Everything here
//! is owned by collaborators outside the engine; [`StaticHost`] is a simple
//! in-memory implementation for tools and tests.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::config::HostConfig;
use crate::types::{
    Activity, Attributes, AttributionError, AttributionResult, IdentityType, KitId,
    PushRegistration,
};

/// Identities and attributes of the current user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserSnapshot {
    pub identities: BTreeMap<IdentityType, String>,
    pub attributes: Attributes,
    pub attribute_lists: BTreeMap<String, Vec<String>>,
}

/// Runtime state the engine reads from the host.
pub trait HostState: Send + Sync {
    /// The foreground screen container, if one is showing.
    fn current_activity(&self) -> Option<Activity> {
        None
    }

    fn current_user(&self) -> Option<UserSnapshot> {
        None
    }

    fn push_registration(&self) -> Option<PushRegistration> {
        None
    }

    fn install_referrer(&self) -> Option<String> {
        None
    }

    /// Bucket (0-99) the user falls into, for kit bracketing.
    fn user_bucket(&self) -> u8 {
        0
    }

    fn is_opted_out(&self) -> bool {
        false
    }

    /// Drop attributes the host stored on behalf of a removed kit.
    fn clear_integration_attributes(&self, _kit_id: KitId) {}
}

/// Receives attribution outcomes reported by kits.
pub trait AttributionListener: Send + Sync {
    fn on_result(&self, result: &AttributionResult);

    fn on_error(&self, error: &AttributionError);
}

#[derive(Debug, Default)]
struct StaticHostState {
    activity: Option<Activity>,
    user: Option<UserSnapshot>,
    push_registration: Option<PushRegistration>,
    install_referrer: Option<String>,
    user_bucket: u8,
    opted_out: bool,
    integration_attributes: BTreeMap<KitId, Attributes>,
}

/// Host state held in memory and set explicitly.
#[derive(Debug, Default)]
pub struct StaticHost {
    state: RwLock<StaticHostState>,
}

impl StaticHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &HostConfig) -> Self {
        let host = Self::new();
        host.set_user_bucket(config.user_bucket);
        host.set_opted_out(config.opted_out);
        host
    }

    fn update(&self, f: impl FnOnce(&mut StaticHostState)) {
        match self.state.write() {
            Ok(mut state) => f(&mut state),
            Err(e) => tracing::warn!(error = %e, "Host state lock poisoned; update dropped"),
        }
    }

    fn read<T: Default>(&self, f: impl FnOnce(&StaticHostState) -> T) -> T {
        self.state.read().map(|state| f(&state)).unwrap_or_default()
    }

    pub fn set_activity(&self, activity: Option<Activity>) {
        self.update(|s| s.activity = activity);
    }

    pub fn set_user(&self, user: Option<UserSnapshot>) {
        self.update(|s| s.user = user);
    }

    pub fn set_push_registration(&self, registration: Option<PushRegistration>) {
        self.update(|s| s.push_registration = registration);
    }

    pub fn set_install_referrer(&self, referrer: Option<String>) {
        self.update(|s| s.install_referrer = referrer);
    }

    pub fn set_user_bucket(&self, bucket: u8) {
        self.update(|s| s.user_bucket = bucket);
    }

    pub fn set_opted_out(&self, opted_out: bool) {
        self.update(|s| s.opted_out = opted_out);
    }

    pub fn set_integration_attributes(&self, kit_id: KitId, attributes: Attributes) {
        self.update(|s| {
            s.integration_attributes.insert(kit_id, attributes);
        });
    }

    pub fn integration_attributes(&self, kit_id: KitId) -> Option<Attributes> {
        self.read(|s| s.integration_attributes.get(&kit_id).cloned())
    }
}

impl HostState for StaticHost {
    fn current_activity(&self) -> Option<Activity> {
        self.read(|s| s.activity.clone())
    }

    fn current_user(&self) -> Option<UserSnapshot> {
        self.read(|s| s.user.clone())
    }

    fn push_registration(&self) -> Option<PushRegistration> {
        self.read(|s| s.push_registration.clone())
    }

    fn install_referrer(&self) -> Option<String> {
        self.read(|s| s.install_referrer.clone())
    }

    fn user_bucket(&self) -> u8 {
        self.read(|s| s.user_bucket)
    }

    fn is_opted_out(&self) -> bool {
        self.read(|s| s.opted_out)
    }

    fn clear_integration_attributes(&self, kit_id: KitId) {
        self.update(|s| {
            s.integration_attributes.remove(&kit_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_host_round_trips_values() {
        let host = StaticHost::from_config(&HostConfig {
            user_bucket: 30,
            opted_out: true,
        });
        assert_eq!(host.user_bucket(), 30);
        assert!(host.is_opted_out());
        assert!(host.current_activity().is_none());

        host.set_activity(Some(Activity::new("MainActivity")));
        assert_eq!(host.current_activity(), Some(Activity::new("MainActivity")));
    }

    #[test]
    fn test_clear_integration_attributes() {
        let host = StaticHost::new();
        let mut attrs = Attributes::new();
        attrs.insert("campaign".to_string(), "x".to_string());
        host.set_integration_attributes(4, attrs);
        assert!(host.integration_attributes(4).is_some());

        host.clear_integration_attributes(4);
        assert!(host.integration_attributes(4).is_none());
    }
}
