//! Core domain types for kitrelay
//!
//! These types describe what flows into the engine from upstream: generic
//! events, screen views, commerce events, identity values and the handful of
//! runtime values (activity, push registration, attribution) that destinations
//! react to. The engine never decides what these look like; it only filters,
//! projects and forwards them.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Kit** | A downstream destination that receives a subset of forwarded events |
//! | **Capability** | A named contract (Event, Commerce, Screen, ...) a kit may implement |
//! | **Type code** | The integer code of an event type, used when hashing filter keys |

use std::collections::BTreeMap;
use std::fmt;

use bitmask_enum::bitmask;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable integer identifier of a kit, as assigned by remote configuration.
pub type KitId = i32;

/// Attribute map carried by events; ordered so projections and reports are
/// reproducible.
pub type Attributes = BTreeMap<String, String>;

// ============================================
// Capabilities
// ============================================

/// Capability contracts a kit may implement.
///
/// This type is a bitmask: a kit declares the union of everything it handles,
/// and the router asks for a single flag at dispatch time.
#[bitmask(u16)]
#[bitmask_config(vec_debug)]
pub enum Capability {
    /// Generic events, breadcrumbs, errors and exceptions.
    Event,
    /// Commerce events and lifetime-value increases.
    Commerce,
    /// Screen views.
    Screen,
    /// User attributes.
    Attribute,
    /// User identities and logout.
    Identity,
    /// Push registration and push messages.
    Push,
    /// Activity lifecycle callbacks.
    Activity,
    /// Session start/end.
    Session,
    /// Application foreground/background.
    ApplicationState,
}

const CAPABILITY_NAMES: &[(Capability, &str)] = &[
    (Capability::Event, "event"),
    (Capability::Commerce, "commerce"),
    (Capability::Screen, "screen"),
    (Capability::Attribute, "attribute"),
    (Capability::Identity, "identity"),
    (Capability::Push, "push"),
    (Capability::Activity, "activity"),
    (Capability::Session, "session"),
    (Capability::ApplicationState, "application_state"),
];

impl Capability {
    /// Parse a single capability from its lowercase name.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        CAPABILITY_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(cap, _)| *cap)
    }

    /// Parse a comma-separated capability list, ignoring unknown names.
    pub fn parse_list(list: &str) -> Self {
        list.split(',')
            .filter_map(Self::from_name)
            .fold(Self::none(), |acc, cap| acc | cap)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<&str> = CAPABILITY_NAMES
            .iter()
            .filter(|(cap, _)| self.contains(*cap))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

// ============================================
// Generic events
// ============================================

/// Category of a generic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Navigation,
    Location,
    Search,
    Transaction,
    UserContent,
    UserPreference,
    Social,
    #[default]
    Other,
    Media,
}

impl EventType {
    /// Integer code used in filter key hashes.
    pub fn code(&self) -> i32 {
        match self {
            EventType::Navigation => 1,
            EventType::Location => 2,
            EventType::Search => 3,
            EventType::Transaction => 4,
            EventType::UserContent => 5,
            EventType::UserPreference => 6,
            EventType::Social => 7,
            EventType::Other => 8,
            EventType::Media => 9,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Navigation => "Navigation",
            EventType::Location => "Location",
            EventType::Search => "Search",
            EventType::Transaction => "Transaction",
            EventType::UserContent => "UserContent",
            EventType::UserPreference => "UserPreference",
            EventType::Social => "Social",
            EventType::Other => "Other",
            EventType::Media => "Media",
        }
    }
}

/// Type code used for screen views when hashing filter keys.
pub const SCREEN_TYPE_CODE: i32 = 0;

/// A generic custom event, also used as the payload of a screen view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event (or screen) name
    pub name: String,
    /// Event category
    #[serde(default)]
    pub event_type: EventType,
    /// Custom attributes
    #[serde(default)]
    pub attributes: Attributes,
}

impl Event {
    pub fn new(name: impl Into<String>, event_type: EventType) -> Self {
        Self {
            name: name.into(),
            event_type,
            attributes: Attributes::new(),
        }
    }

    /// Add an attribute, replacing any previous value for the key.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }
}

// ============================================
// Commerce events
// ============================================

/// Product-level commerce action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductAction {
    AddToCart,
    RemoveFromCart,
    Checkout,
    CheckoutOption,
    Click,
    ViewDetail,
    Purchase,
    Refund,
    AddToWishlist,
    RemoveFromWishlist,
}

impl ProductAction {
    pub fn code(&self) -> i32 {
        match self {
            ProductAction::AddToCart => 10,
            ProductAction::RemoveFromCart => 11,
            ProductAction::Checkout => 12,
            ProductAction::CheckoutOption => 13,
            ProductAction::Click => 14,
            ProductAction::ViewDetail => 15,
            ProductAction::Purchase => 16,
            ProductAction::Refund => 17,
            ProductAction::AddToWishlist => 20,
            ProductAction::RemoveFromWishlist => 21,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductAction::AddToCart => "add_to_cart",
            ProductAction::RemoveFromCart => "remove_from_cart",
            ProductAction::Checkout => "checkout",
            ProductAction::CheckoutOption => "checkout_option",
            ProductAction::Click => "click",
            ProductAction::ViewDetail => "view_detail",
            ProductAction::Purchase => "purchase",
            ProductAction::Refund => "refund",
            ProductAction::AddToWishlist => "add_to_wishlist",
            ProductAction::RemoveFromWishlist => "remove_from_wishlist",
        }
    }
}

/// Promotion-level commerce action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionAction {
    View,
    Click,
}

impl PromotionAction {
    pub fn code(&self) -> i32 {
        match self {
            PromotionAction::View => 18,
            PromotionAction::Click => 19,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PromotionAction::View => "view",
            PromotionAction::Click => "click",
        }
    }
}

/// Type code of an impression-only commerce event.
pub const IMPRESSION_TYPE_CODE: i32 = 22;

/// A product line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    pub sku: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default = "default_quantity")]
    pub quantity: f64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

fn default_quantity() -> f64 {
    1.0
}

impl Product {
    pub fn new(name: impl Into<String>, sku: impl Into<String>, price: f64) -> Self {
        Self {
            name: name.into(),
            sku: sku.into(),
            price,
            quantity: 1.0,
            category: None,
            brand: None,
            variant: None,
            attributes: Attributes::new(),
        }
    }

    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = quantity;
        self
    }

    /// Flatten the product into the attribute shape used by derived events.
    pub fn to_attributes(&self) -> Attributes {
        let mut out = Attributes::new();
        out.insert("Name".to_string(), self.name.clone());
        out.insert("Id".to_string(), self.sku.clone());
        out.insert("Item Price".to_string(), self.price.to_string());
        out.insert("Quantity".to_string(), self.quantity.to_string());
        out.insert(
            "Total Product Amount".to_string(),
            (self.price * self.quantity).to_string(),
        );
        if let Some(category) = &self.category {
            out.insert("Category".to_string(), category.clone());
        }
        if let Some(brand) = &self.brand {
            out.insert("Brand".to_string(), brand.clone());
        }
        if let Some(variant) = &self.variant {
            out.insert("Variant".to_string(), variant.clone());
        }
        for (key, value) in &self.attributes {
            out.insert(key.clone(), value.clone());
        }
        out
    }
}

/// An internal promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promotion {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub creative: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
}

/// A list of products shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Impression {
    pub list_name: String,
    #[serde(default)]
    pub products: Vec<Product>,
}

/// Totals of a purchase or refund.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransactionAttributes {
    pub id: String,
    #[serde(default)]
    pub revenue: Option<f64>,
    #[serde(default)]
    pub tax: Option<f64>,
    #[serde(default)]
    pub shipping: Option<f64>,
    #[serde(default)]
    pub affiliation: Option<String>,
    #[serde(default)]
    pub coupon_code: Option<String>,
}

/// A commerce event: product action, promotion action and/or impressions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommerceEvent {
    /// Explicit event name; derived from the action when absent
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub product_action: Option<ProductAction>,
    #[serde(default)]
    pub promotion_action: Option<PromotionAction>,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub promotions: Vec<Promotion>,
    #[serde(default)]
    pub impressions: Vec<Impression>,
    #[serde(default)]
    pub transaction: Option<TransactionAttributes>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub screen: Option<String>,
    /// Custom attributes
    #[serde(default)]
    pub attributes: Attributes,
}

impl CommerceEvent {
    pub fn product(action: ProductAction) -> Self {
        Self {
            product_action: Some(action),
            ..Default::default()
        }
    }

    pub fn promotion(action: PromotionAction) -> Self {
        Self {
            promotion_action: Some(action),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_product(mut self, product: Product) -> Self {
        self.products.push(product);
        self
    }

    pub fn with_promotion(mut self, promotion: Promotion) -> Self {
        self.promotions.push(promotion);
        self
    }

    pub fn with_impression(mut self, impression: Impression) -> Self {
        self.impressions.push(impression);
        self
    }

    pub fn with_transaction(mut self, transaction: TransactionAttributes) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Integer code used in filter key hashes.
    pub fn type_code(&self) -> i32 {
        if let Some(action) = self.product_action {
            action.code()
        } else if let Some(action) = self.promotion_action {
            action.code()
        } else if !self.impressions.is_empty() {
            IMPRESSION_TYPE_CODE
        } else {
            EventType::Other.code()
        }
    }

    /// Name of the action this event carries.
    pub fn action_name(&self) -> &'static str {
        if let Some(action) = self.product_action {
            action.as_str()
        } else if let Some(action) = self.promotion_action {
            action.as_str()
        } else if !self.impressions.is_empty() {
            "impression"
        } else {
            "unknown"
        }
    }

    /// The explicit name, or `eCommerce - <action>` when none was given.
    pub fn event_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("eCommerce - {}", self.action_name()),
        }
    }
}

// ============================================
// Domain event envelope
// ============================================

/// The shapes of event the router can fan out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    Event(Event),
    Screen(Event),
    Commerce(CommerceEvent),
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::Event(_) => "event",
            DomainEvent::Screen(_) => "screen",
            DomainEvent::Commerce(_) => "commerce",
        }
    }

    pub fn name(&self) -> String {
        match self {
            DomainEvent::Event(event) | DomainEvent::Screen(event) => event.name.clone(),
            DomainEvent::Commerce(event) => event.event_name(),
        }
    }
}

// ============================================
// Identity
// ============================================

/// Kinds of user identity a kit may receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityType {
    Other,
    CustomerId,
    Facebook,
    Twitter,
    Google,
    Microsoft,
    Yahoo,
    Email,
    Alias,
    FacebookCustomAudienceId,
    Other2,
    Other3,
    Other4,
}

impl IdentityType {
    /// Integer code used as the key of identity forwarding rules.
    pub fn code(&self) -> i32 {
        match self {
            IdentityType::Other => 0,
            IdentityType::CustomerId => 1,
            IdentityType::Facebook => 2,
            IdentityType::Twitter => 3,
            IdentityType::Google => 4,
            IdentityType::Microsoft => 5,
            IdentityType::Yahoo => 6,
            IdentityType::Email => 7,
            IdentityType::Alias => 8,
            IdentityType::FacebookCustomAudienceId => 9,
            IdentityType::Other2 => 10,
            IdentityType::Other3 => 11,
            IdentityType::Other4 => 12,
        }
    }
}

// ============================================
// Runtime values
// ============================================

/// Handle to the foreground screen container the host is showing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
}

impl Activity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Latest push registration known to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRegistration {
    pub token: String,
    pub sender_id: String,
}

/// A push message delivered to the host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(default)]
    pub payload: Attributes,
}

/// Attribution data reported by a kit; the engine keeps only the latest per kit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionResult {
    pub kit_id: KitId,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl AttributionResult {
    pub fn new(kit_id: KitId) -> Self {
        Self {
            kit_id,
            link: None,
            parameters: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }
}

/// Attribution failure reported by a kit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionError {
    pub kit_id: KitId,
    pub message: String,
}
