//! Kit abstraction
//!
//! A kit is a downstream destination. Every kit implements [`Kit`], declares
//! the set of capabilities it handles, and exposes one listener trait per
//! declared capability through the `as_*` accessors:
//!
//! | Capability | Listener trait |
//! |------------|----------------|
//! | `Event` | [`EventListener`] |
//! | `Commerce` | [`CommerceListener`] |
//! | `Screen` | [`ScreenListener`] |
//! | `Attribute` | [`AttributeListener`] |
//! | `Identity` | [`IdentityListener`] |
//! | `Push` | [`PushListener`] |
//! | `Activity` | [`ActivityListener`] |
//! | `Session` | [`SessionListener`] |
//! | `ApplicationState` | [`ApplicationStateListener`] |
//!
//! The router only calls a listener when the capability is declared *and*
//! the accessor returns it. Handlers are synchronous: a kit is expected to
//! enqueue its own transport work and return quickly.
//!
//! ## Example
//!
//! ```rust,ignore
//! struct Analytics;
//!
//! impl Kit for Analytics {
//!     fn name(&self) -> &str { "analytics" }
//!     fn capabilities(&self) -> Capability { Capability::Event }
//!     fn on_kit_create(&self, _settings: &Settings) -> KitResult<()> { Ok(()) }
//!     fn as_event_listener(&self) -> Option<&dyn EventListener> { Some(self) }
//! }
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::Settings;
use crate::error::{KitError, KitResult};
use crate::types::{
    Activity, Attributes, Capability, CommerceEvent, Event, IdentityType, KitId, PushMessage,
    PushRegistration,
};

/// Outcome of a forwarding call that a kit may decline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The kit accepted the call; a reporting message is recorded.
    Forwarded,
    /// The kit chose not to handle the call.
    Declined,
}

impl Delivery {
    pub fn is_forwarded(&self) -> bool {
        matches!(self, Delivery::Forwarded)
    }
}

/// Opaque handle a kit may expose to the host application.
pub type KitInstance = Arc<dyn Any + Send + Sync>;

/// Base contract every destination implements.
pub trait Kit: Send + Sync {
    /// Human-readable kit name, used in logs.
    fn name(&self) -> &str;

    /// Capabilities this kit handles. Fixed for the lifetime of the instance.
    fn capabilities(&self) -> Capability;

    /// Called once, right after construction, with the kit's settings.
    fn on_kit_create(&self, settings: &Settings) -> KitResult<()>;

    /// Called when a configuration update replaced the kit's settings.
    fn on_settings_updated(&self, _settings: &Settings) -> KitResult<()> {
        Ok(())
    }

    /// First half of teardown.
    fn on_kit_destroy(&self) -> KitResult<()> {
        Ok(())
    }

    /// Second half of teardown; release anything the kit persisted.
    fn on_kit_cleanup(&self) -> KitResult<()> {
        Ok(())
    }

    fn set_opt_out(&self, _opted_out: bool) -> KitResult<Delivery> {
        Ok(Delivery::Declined)
    }

    fn set_install_referrer(&self, _referrer: &str) -> KitResult<()> {
        Ok(())
    }

    /// Handle to the underlying third-party object, if any.
    fn instance(&self) -> Option<KitInstance> {
        None
    }

    fn as_event_listener(&self) -> Option<&dyn EventListener> {
        None
    }

    fn as_commerce_listener(&self) -> Option<&dyn CommerceListener> {
        None
    }

    fn as_screen_listener(&self) -> Option<&dyn ScreenListener> {
        None
    }

    fn as_attribute_listener(&self) -> Option<&dyn AttributeListener> {
        None
    }

    fn as_identity_listener(&self) -> Option<&dyn IdentityListener> {
        None
    }

    fn as_push_listener(&self) -> Option<&dyn PushListener> {
        None
    }

    fn as_activity_listener(&self) -> Option<&dyn ActivityListener> {
        None
    }

    fn as_session_listener(&self) -> Option<&dyn SessionListener> {
        None
    }

    fn as_application_state_listener(&self) -> Option<&dyn ApplicationStateListener> {
        None
    }
}

// ============================================
// Capability listeners
// ============================================

/// Generic events, breadcrumbs, errors and exceptions.
pub trait EventListener {
    fn log_event(&self, event: &Event) -> KitResult<Delivery>;

    fn leave_breadcrumb(&self, _breadcrumb: &str) -> KitResult<Delivery> {
        Ok(Delivery::Declined)
    }

    fn log_error(&self, _message: &str, _attributes: &Attributes) -> KitResult<Delivery> {
        Ok(Delivery::Declined)
    }

    fn log_exception(
        &self,
        _exception: &str,
        _message: &str,
        _attributes: &Attributes,
    ) -> KitResult<Delivery> {
        Ok(Delivery::Declined)
    }
}

pub trait CommerceListener {
    fn log_commerce_event(&self, event: &CommerceEvent) -> KitResult<Delivery>;

    /// A lifetime-value increase of `value_increased`, bringing the total to
    /// `value_total`.
    fn log_ltv_increase(
        &self,
        value_increased: f64,
        value_total: f64,
        event_name: &str,
        attributes: &Attributes,
    ) -> KitResult<Delivery>;
}

pub trait ScreenListener {
    fn log_screen(&self, name: &str, attributes: &Attributes) -> KitResult<Delivery>;
}

/// User attribute updates.
///
/// Kits that return `false` from [`supports_attribute_lists`] never receive
/// [`set_user_attribute_list`]; list values arrive joined into a single
/// string through [`set_user_attribute`].
///
/// [`supports_attribute_lists`]: AttributeListener::supports_attribute_lists
/// [`set_user_attribute_list`]: AttributeListener::set_user_attribute_list
/// [`set_user_attribute`]: AttributeListener::set_user_attribute
pub trait AttributeListener {
    fn set_user_attribute(&self, key: &str, value: &str) -> KitResult<()>;

    fn set_user_attribute_list(&self, key: &str, values: &[String]) -> KitResult<()>;

    fn set_all_user_attributes(
        &self,
        attributes: &Attributes,
        attribute_lists: &BTreeMap<String, Vec<String>>,
    ) -> KitResult<()>;

    fn remove_user_attribute(&self, key: &str) -> KitResult<()>;

    fn supports_attribute_lists(&self) -> bool {
        true
    }
}

pub trait IdentityListener {
    fn set_user_identity(&self, identity_type: IdentityType, value: &str) -> KitResult<()>;

    fn remove_user_identity(&self, identity_type: IdentityType) -> KitResult<()>;

    fn logout(&self) -> KitResult<()>;
}

pub trait PushListener {
    /// Whether this kit owns the message.
    fn will_handle_push_message(&self, message: &PushMessage) -> bool;

    fn on_push_message_received(&self, message: &PushMessage) -> KitResult<()>;

    fn on_push_registration(&self, registration: &PushRegistration) -> KitResult<Delivery>;
}

/// Stage of a foreground screen container's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityStage {
    Created,
    Started,
    Resumed,
    Paused,
    Stopped,
    SaveInstanceState,
    Destroyed,
}

impl ActivityStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStage::Created => "created",
            ActivityStage::Started => "started",
            ActivityStage::Resumed => "resumed",
            ActivityStage::Paused => "paused",
            ActivityStage::Stopped => "stopped",
            ActivityStage::SaveInstanceState => "save_instance_state",
            ActivityStage::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for ActivityStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait ActivityListener {
    fn on_activity(&self, stage: ActivityStage, activity: &Activity) -> KitResult<()>;
}

pub trait SessionListener {
    fn on_session_start(&self) -> KitResult<()>;

    fn on_session_end(&self) -> KitResult<()>;
}

pub trait ApplicationStateListener {
    fn on_application_foreground(&self) -> KitResult<()>;

    fn on_application_background(&self) -> KitResult<()>;
}

// ============================================
// Factory
// ============================================

/// Builds a kit instance for a configured id.
pub type KitConstructor = Box<dyn Fn(KitId) -> KitResult<Arc<dyn Kit>> + Send + Sync>;

/// The set of kits this runtime knows how to build.
#[derive(Default)]
pub struct KitFactory {
    constructors: BTreeMap<KitId, KitConstructor>,
}

impl KitFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for a kit id, replacing any previous one.
    pub fn register<F>(&mut self, kit_id: KitId, constructor: F)
    where
        F: Fn(KitId) -> KitResult<Arc<dyn Kit>> + Send + Sync + 'static,
    {
        tracing::debug!(kit_id, "Registered kit constructor");
        self.constructors.insert(kit_id, Box::new(constructor));
    }

    /// Keep only the listed kit ids.
    pub fn restrict_to(&mut self, kit_ids: &[KitId]) {
        self.constructors.retain(|id, _| kit_ids.contains(id));
    }

    pub fn is_supported(&self, kit_id: KitId) -> bool {
        self.constructors.contains_key(&kit_id)
    }

    pub fn supported_kits(&self) -> Vec<KitId> {
        self.constructors.keys().copied().collect()
    }

    /// Build a kit; unknown ids fail with a construction error.
    pub fn create(&self, kit_id: KitId) -> KitResult<Arc<dyn Kit>> {
        let constructor = self.constructors.get(&kit_id).ok_or_else(|| {
            KitError::Construction(format!("no constructor registered for kit {kit_id}"))
        })?;
        constructor(kit_id)
    }
}

impl fmt::Debug for KitFactory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KitFactory")
            .field("supported_kits", &self.supported_kits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Minimal;

    impl Kit for Minimal {
        fn name(&self) -> &str {
            "minimal"
        }

        fn capabilities(&self) -> Capability {
            Capability::Event
        }

        fn on_kit_create(&self, _settings: &Settings) -> KitResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_factory_supports_registered_ids() {
        let mut factory = KitFactory::new();
        factory.register(1, |_| Ok(Arc::new(Minimal) as Arc<dyn Kit>));
        factory.register(2, |_| Ok(Arc::new(Minimal) as Arc<dyn Kit>));

        assert!(factory.is_supported(1));
        assert!(!factory.is_supported(3));
        assert_eq!(factory.supported_kits(), vec![1, 2]);
        assert!(factory.create(1).is_ok());
        assert!(matches!(
            factory.create(3),
            Err(KitError::Construction(_))
        ));

        factory.restrict_to(&[2]);
        assert_eq!(factory.supported_kits(), vec![2]);
    }

    #[test]
    fn test_listener_accessors_default_to_none() {
        let kit = Minimal;
        assert!(kit.as_event_listener().is_none());
        assert!(kit.as_push_listener().is_none());
        assert!(kit.instance().is_none());
        assert_eq!(kit.set_opt_out(true), Ok(Delivery::Declined));
    }
}
