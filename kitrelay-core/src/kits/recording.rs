//! Recording kit
//!
//! Implements every capability listener and keeps an ordered log of the calls
//! it received. It can be told to fail (or panic) on every forwarding call, to
//! refuse list attributes, and to claim push messages.
//!
//! When built from settings, it reads:
//!
//! | Setting | Meaning |
//! |---------|---------|
//! | `capabilities` | Comma-separated capability names (all when absent) |
//! | `name` | Kit name used in logs |
//! | `supportsAttributeLists` | `false` to receive joined list values |
//! | `fail` | `true` to fail every forwarding call |
//! | `claimsPush` | `true` to claim push messages |

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{KitConfiguration, Settings};
use crate::error::{KitError, KitResult};
use crate::kit::{
    ActivityListener, ActivityStage, ApplicationStateListener, AttributeListener,
    CommerceListener, Delivery, EventListener, IdentityListener, Kit, KitFactory, KitInstance,
    PushListener, ScreenListener, SessionListener,
};
use crate::types::{
    Activity, Attributes, Capability, CommerceEvent, Event, IdentityType, KitId, PushMessage,
    PushRegistration,
};

/// One call a recording kit received.
#[derive(Debug, Clone, PartialEq)]
pub enum KitCall {
    Created(Settings),
    SettingsUpdated(Settings),
    Destroyed,
    CleanedUp,
    OptOut(bool),
    InstallReferrer(String),
    Event(Event),
    Breadcrumb(String),
    Error(String),
    Exception(String),
    Commerce(CommerceEvent),
    LtvIncrease {
        increased: f64,
        total: f64,
        event_name: String,
    },
    Screen(String, Attributes),
    UserAttribute(String, String),
    UserAttributeList(String, Vec<String>),
    AllUserAttributes(Attributes, BTreeMap<String, Vec<String>>),
    RemoveUserAttribute(String),
    Identity(IdentityType, String),
    RemoveIdentity(IdentityType),
    Logout,
    PushMessage(PushMessage),
    PushRegistration(PushRegistration),
    Activity(ActivityStage, String),
    SessionStart,
    SessionEnd,
    Foreground,
    Background,
}

/// A kit that records what it receives.
pub struct RecordingKit {
    id: KitId,
    name: String,
    capabilities: Capability,
    supports_lists: bool,
    claims_push: bool,
    failing: AtomicBool,
    panicking: AtomicBool,
    instance: KitInstance,
    calls: Mutex<Vec<KitCall>>,
}

impl RecordingKit {
    pub fn new(id: KitId, capabilities: Capability) -> Self {
        Self {
            id,
            name: format!("recording-{id}"),
            capabilities,
            supports_lists: true,
            claims_push: false,
            failing: AtomicBool::new(false),
            panicking: AtomicBool::new(false),
            instance: Arc::new(id),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Build a kit from the `settings` object of a configuration block.
    pub fn from_settings(id: KitId, settings: &Settings) -> Self {
        let setting = |key: &str| -> Option<String> {
            match settings.get(key)? {
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            }
        };
        let flag = |key: &str| setting(key).map(|v| v.eq_ignore_ascii_case("true"));

        let capabilities = setting("capabilities")
            .map(|list| Capability::parse_list(&list))
            .unwrap_or_else(Capability::all_bits);
        let mut kit = Self::new(id, capabilities);
        if let Some(name) = setting("name") {
            kit.name = name;
        }
        kit.supports_lists = flag("supportsAttributeLists").unwrap_or(true);
        kit.claims_push = flag("claimsPush").unwrap_or(false);
        kit.failing.store(flag("fail").unwrap_or(false), Ordering::Relaxed);
        kit
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn without_list_support(mut self) -> Self {
        self.supports_lists = false;
        self
    }

    pub fn claiming_push(mut self) -> Self {
        self.claims_push = true;
        self
    }

    /// Fail every forwarding call from now on.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Panic in every forwarding call from now on.
    pub fn set_panicking(&self, panicking: bool) {
        self.panicking.store(panicking, Ordering::Relaxed);
    }

    pub fn id(&self) -> KitId {
        self.id
    }

    /// Register this instance as the constructor result for its id.
    pub fn register(factory: &mut KitFactory, kit: Arc<RecordingKit>) {
        factory.register(kit.id, move |_| Ok(Arc::clone(&kit) as Arc<dyn Kit>));
    }

    /// Register one recording kit per block of a configuration snapshot.
    pub fn register_snapshot(
        factory: &mut KitFactory,
        snapshot: &[serde_json::Value],
    ) -> BTreeMap<KitId, Arc<RecordingKit>> {
        let mut kits = BTreeMap::new();
        for block in snapshot {
            let Some(id) = KitConfiguration::extract_id(block) else {
                continue;
            };
            let settings: Settings = block
                .get("settings")
                .and_then(|s| s.as_object())
                .map(|s| s.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            let kit = Arc::new(Self::from_settings(id, &settings));
            Self::register(factory, Arc::clone(&kit));
            kits.insert(id, kit);
        }
        kits
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<KitCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Events received through the event handler.
    pub fn events(&self) -> Vec<Event> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                KitCall::Event(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&KitCall) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn push(&self, call: KitCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    /// Record a forwarding call, honoring failure modes.
    fn record(&self, call: KitCall) -> KitResult<()> {
        if self.panicking.load(Ordering::Relaxed) {
            panic!("{} panicked handling {:?}", self.name, call);
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(KitError::failed(format!("{} rejected the call", self.name)));
        }
        self.push(call);
        Ok(())
    }

    fn forward(&self, call: KitCall) -> KitResult<Delivery> {
        self.record(call).map(|()| Delivery::Forwarded)
    }
}

impl Kit for RecordingKit {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capability {
        self.capabilities
    }

    fn on_kit_create(&self, settings: &Settings) -> KitResult<()> {
        self.push(KitCall::Created(settings.clone()));
        Ok(())
    }

    fn on_settings_updated(&self, settings: &Settings) -> KitResult<()> {
        self.push(KitCall::SettingsUpdated(settings.clone()));
        Ok(())
    }

    fn on_kit_destroy(&self) -> KitResult<()> {
        self.push(KitCall::Destroyed);
        Ok(())
    }

    fn on_kit_cleanup(&self) -> KitResult<()> {
        self.push(KitCall::CleanedUp);
        Ok(())
    }

    fn set_opt_out(&self, opted_out: bool) -> KitResult<Delivery> {
        self.forward(KitCall::OptOut(opted_out))
    }

    fn set_install_referrer(&self, referrer: &str) -> KitResult<()> {
        self.record(KitCall::InstallReferrer(referrer.to_string()))
    }

    fn instance(&self) -> Option<KitInstance> {
        Some(Arc::clone(&self.instance))
    }

    fn as_event_listener(&self) -> Option<&dyn EventListener> {
        Some(self)
    }

    fn as_commerce_listener(&self) -> Option<&dyn CommerceListener> {
        Some(self)
    }

    fn as_screen_listener(&self) -> Option<&dyn ScreenListener> {
        Some(self)
    }

    fn as_attribute_listener(&self) -> Option<&dyn AttributeListener> {
        Some(self)
    }

    fn as_identity_listener(&self) -> Option<&dyn IdentityListener> {
        Some(self)
    }

    fn as_push_listener(&self) -> Option<&dyn PushListener> {
        Some(self)
    }

    fn as_activity_listener(&self) -> Option<&dyn ActivityListener> {
        Some(self)
    }

    fn as_session_listener(&self) -> Option<&dyn SessionListener> {
        Some(self)
    }

    fn as_application_state_listener(&self) -> Option<&dyn ApplicationStateListener> {
        Some(self)
    }
}

impl EventListener for RecordingKit {
    fn log_event(&self, event: &Event) -> KitResult<Delivery> {
        self.forward(KitCall::Event(event.clone()))
    }

    fn leave_breadcrumb(&self, breadcrumb: &str) -> KitResult<Delivery> {
        self.forward(KitCall::Breadcrumb(breadcrumb.to_string()))
    }

    fn log_error(&self, message: &str, _attributes: &Attributes) -> KitResult<Delivery> {
        self.forward(KitCall::Error(message.to_string()))
    }

    fn log_exception(
        &self,
        exception: &str,
        _message: &str,
        _attributes: &Attributes,
    ) -> KitResult<Delivery> {
        self.forward(KitCall::Exception(exception.to_string()))
    }
}

impl CommerceListener for RecordingKit {
    fn log_commerce_event(&self, event: &CommerceEvent) -> KitResult<Delivery> {
        self.forward(KitCall::Commerce(event.clone()))
    }

    fn log_ltv_increase(
        &self,
        value_increased: f64,
        value_total: f64,
        event_name: &str,
        _attributes: &Attributes,
    ) -> KitResult<Delivery> {
        self.forward(KitCall::LtvIncrease {
            increased: value_increased,
            total: value_total,
            event_name: event_name.to_string(),
        })
    }
}

impl ScreenListener for RecordingKit {
    fn log_screen(&self, name: &str, attributes: &Attributes) -> KitResult<Delivery> {
        self.forward(KitCall::Screen(name.to_string(), attributes.clone()))
    }
}

impl AttributeListener for RecordingKit {
    fn set_user_attribute(&self, key: &str, value: &str) -> KitResult<()> {
        self.record(KitCall::UserAttribute(key.to_string(), value.to_string()))
    }

    fn set_user_attribute_list(&self, key: &str, values: &[String]) -> KitResult<()> {
        self.record(KitCall::UserAttributeList(key.to_string(), values.to_vec()))
    }

    fn set_all_user_attributes(
        &self,
        attributes: &Attributes,
        attribute_lists: &BTreeMap<String, Vec<String>>,
    ) -> KitResult<()> {
        self.record(KitCall::AllUserAttributes(
            attributes.clone(),
            attribute_lists.clone(),
        ))
    }

    fn remove_user_attribute(&self, key: &str) -> KitResult<()> {
        self.record(KitCall::RemoveUserAttribute(key.to_string()))
    }

    fn supports_attribute_lists(&self) -> bool {
        self.supports_lists
    }
}

impl IdentityListener for RecordingKit {
    fn set_user_identity(&self, identity_type: IdentityType, value: &str) -> KitResult<()> {
        self.record(KitCall::Identity(identity_type, value.to_string()))
    }

    fn remove_user_identity(&self, identity_type: IdentityType) -> KitResult<()> {
        self.record(KitCall::RemoveIdentity(identity_type))
    }

    fn logout(&self) -> KitResult<()> {
        self.record(KitCall::Logout)
    }
}

impl PushListener for RecordingKit {
    fn will_handle_push_message(&self, _message: &PushMessage) -> bool {
        self.claims_push
    }

    fn on_push_message_received(&self, message: &PushMessage) -> KitResult<()> {
        self.record(KitCall::PushMessage(message.clone()))
    }

    fn on_push_registration(&self, registration: &PushRegistration) -> KitResult<Delivery> {
        self.forward(KitCall::PushRegistration(registration.clone()))
    }
}

impl ActivityListener for RecordingKit {
    fn on_activity(&self, stage: ActivityStage, activity: &Activity) -> KitResult<()> {
        self.record(KitCall::Activity(stage, activity.name.clone()))
    }
}

impl SessionListener for RecordingKit {
    fn on_session_start(&self) -> KitResult<()> {
        self.record(KitCall::SessionStart)
    }

    fn on_session_end(&self) -> KitResult<()> {
        self.record(KitCall::SessionEnd)
    }
}

impl ApplicationStateListener for RecordingKit {
    fn on_application_foreground(&self) -> KitResult<()> {
        self.record(KitCall::Foreground)
    }

    fn on_application_background(&self) -> KitResult<()> {
        self.record(KitCall::Background)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventType;
    use serde_json::json;

    #[test]
    fn test_from_settings() {
        let mut settings = Settings::new();
        settings.insert("capabilities".to_string(), json!("event, screen"));
        settings.insert("supportsAttributeLists".to_string(), json!(false));
        settings.insert("name".to_string(), json!("web"));

        let kit = RecordingKit::from_settings(4, &settings);
        assert_eq!(kit.name(), "web");
        assert_eq!(kit.capabilities(), Capability::Event | Capability::Screen);
        assert!(!kit.supports_attribute_lists());
    }

    #[test]
    fn test_failing_kit_records_nothing() {
        let kit = RecordingKit::new(1, Capability::Event);
        kit.set_failing(true);
        assert!(kit.log_event(&Event::new("x", EventType::Other)).is_err());
        assert!(kit.calls().is_empty());

        kit.set_failing(false);
        assert_eq!(
            kit.log_event(&Event::new("x", EventType::Other)),
            Ok(Delivery::Forwarded)
        );
        assert_eq!(kit.events().len(), 1);
    }

    #[test]
    fn test_register_snapshot() {
        let snapshot = vec![
            json!({"id": 1, "settings": {"capabilities": "push", "claimsPush": "true"}}),
            json!({"id": 2}),
            json!({"settings": {}}),
        ];
        let mut factory = KitFactory::new();
        let kits = RecordingKit::register_snapshot(&mut factory, &snapshot);

        assert_eq!(factory.supported_kits(), vec![1, 2]);
        assert_eq!(kits[&1].capabilities(), Capability::Push);
        assert!(kits[&1].will_handle_push_message(&PushMessage::default()));
        assert_eq!(kits[&2].capabilities(), Capability::all_bits());
    }
}
