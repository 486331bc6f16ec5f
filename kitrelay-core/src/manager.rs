//! Kit manager: registry lifecycle and dispatch routing
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          KIT MANAGER                              │
//! │                                                                   │
//! │  config snapshot ──► reconcile() ──► KitRegistry (copy-on-write)  │
//! │                        │  create / activate / update / teardown   │
//! │                        └──► KitSignal broadcast                   │
//! │                                                                   │
//! │  domain event ──► snapshot of enabled kits                        │
//! │                     │ for each kit with the capability:           │
//! │                     │   filters ──► projection ──► handler call   │
//! │                     │   (panics and errors isolated per kit)      │
//! │                     └──► ReportingManager                         │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reconciliation and lifecycle notifications are expected to run on the
//! single coordination context (see [`crate::coordinator`]). Dispatch may run
//! on any thread, concurrently with reconciliation: each dispatch iterates one
//! registry snapshot, which may predate or postdate an in-flight update.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let manager = KitManager::new(factory, host, sink, &config.engine);
//! manager.reconcile(&snapshot);
//! let summary = manager.log_event(&Event::new("Play", EventType::Media));
//! ```

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::broadcast;

use crate::commerce;
use crate::config::{EngineConfig, KitConfiguration};
use crate::error::{Error, KitError, KitResult, Result};
use crate::host::{AttributionListener, HostState, UserSnapshot};
use crate::kit::{
    ActivityListener, ActivityStage, ApplicationStateListener, AttributeListener,
    CommerceListener, Delivery, EventListener, IdentityListener, Kit, KitFactory, KitInstance,
    PushListener, ScreenListener, SessionListener,
};
use crate::projection::{project, DerivedEvent, ProjectionResult, ProjectionSource, SourceKind};
use crate::registry::{KitEntry, KitRegistry};
use crate::reporting::{
    MessageType, ProjectionReport, ReportingManager, ReportingMessage, ReportingSink,
};
use crate::types::{
    Activity, Attributes, AttributionError, AttributionResult, Capability, CommerceEvent,
    DomainEvent, Event, EventType, IdentityType, KitId, PushMessage, PushRegistration,
};

/// Attribute naming the upstream method that produced a generic event.
pub const METHOD_NAME_ATTRIBUTE: &str = "$MethodName";

/// Method name marking a lifetime-value increase.
pub const LTV_METHOD_NAME: &str = "LogLTVIncrease";

/// Attribute carrying the lifetime-value amount.
pub const LTV_AMOUNT_ATTRIBUTE: &str = "$Amount";

/// Activation and teardown notices for other subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KitSignal {
    Activated(KitId),
    Deactivated(KitId),
}

/// Platform lifecycle notification forwarded to kits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleNotice {
    Activity(ActivityStage, Activity),
    SessionStart,
    SessionEnd,
    ApplicationForeground,
    ApplicationBackground,
}

/// What one reconciliation did, per kit id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<KitId>,
    pub activated: Vec<KitId>,
    pub updated: Vec<KitId>,
    pub removed: Vec<KitId>,
    pub skipped_unsupported: Vec<KitId>,
    pub failed: Vec<KitId>,
    /// Blocks without a usable id
    pub invalid_blocks: usize,
}

/// Outcome of one dispatch call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Kits that reported a successful forward, in dispatch order
    pub forwarded: Vec<KitId>,
    /// The call was held until kit configuration arrives
    pub queued: bool,
}

impl DispatchSummary {
    fn queued() -> Self {
        Self {
            forwarded: Vec::new(),
            queued: true,
        }
    }

    pub fn was_forwarded_to(&self, kit_id: KitId) -> bool {
        self.forwarded.contains(&kit_id)
    }
}

/// A dispatch call held before the first configuration arrives.
#[derive(Debug, Clone)]
enum PendingCall {
    Event(Event),
    Screen(String, Attributes),
    Commerce(CommerceEvent),
    Breadcrumb(String),
    Error(String, Attributes),
    Exception(String, String, Attributes),
}

#[derive(Debug)]
struct PendingQueue {
    enabled: bool,
    capacity: usize,
    calls: VecDeque<PendingCall>,
}

/// Owns the live kit set and fans calls out to it.
pub struct KitManager {
    factory: KitFactory,
    registry: KitRegistry,
    host: Arc<dyn HostState>,
    reporting: ReportingManager,
    attribution_listener: Option<Arc<dyn AttributionListener>>,
    attribution: RwLock<BTreeMap<KitId, AttributionResult>>,
    signals: broadcast::Sender<KitSignal>,
    list_delimiter: String,
    pending: Mutex<PendingQueue>,
}

impl KitManager {
    pub fn new(
        mut factory: KitFactory,
        host: Arc<dyn HostState>,
        sink: Arc<dyn ReportingSink>,
        config: &EngineConfig,
    ) -> Self {
        if let Some(supported) = &config.supported_kits {
            factory.restrict_to(supported);
        }
        let (signals, _) = broadcast::channel(config.signal_capacity.max(1));

        tracing::info!(
            supported_kits = ?factory.supported_kits(),
            queue_until_configured = config.queue_until_configured,
            "Kit manager created"
        );

        Self {
            factory,
            registry: KitRegistry::new(),
            host,
            reporting: ReportingManager::new(sink),
            attribution_listener: None,
            attribution: RwLock::new(BTreeMap::new()),
            signals,
            list_delimiter: config.list_delimiter.clone(),
            pending: Mutex::new(PendingQueue {
                enabled: config.queue_until_configured,
                capacity: config.replay_queue_capacity.max(1),
                calls: VecDeque::new(),
            }),
        }
    }

    pub fn with_attribution_listener(mut self, listener: Arc<dyn AttributionListener>) -> Self {
        self.attribution_listener = Some(listener);
        self
    }

    /// Receive activation and teardown signals.
    pub fn subscribe(&self) -> broadcast::Receiver<KitSignal> {
        self.signals.subscribe()
    }

    // ============================================
    // Reconciliation
    // ============================================

    /// Bring the registry in line with a configuration snapshot.
    ///
    /// Each block is handled on its own; a failure for one kit never stops
    /// the others. Kits whose ids are missing from the snapshot are torn
    /// down afterwards, then calls held before the first configuration are
    /// replayed.
    pub fn reconcile(&self, snapshot: &[serde_json::Value]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut seen = BTreeSet::new();

        tracing::info!(blocks = snapshot.len(), "Reconciling kit configuration");

        for block in snapshot {
            let Some(kit_id) = KitConfiguration::extract_id(block) else {
                tracing::error!("Kit configuration block has no id; skipping");
                report.invalid_blocks += 1;
                continue;
            };

            if !self.factory.is_supported(kit_id) {
                tracing::debug!(kit_id, "Kit not supported by this runtime; skipping");
                report.skipped_unsupported.push(kit_id);
                continue;
            }
            seen.insert(kit_id);

            let configuration = match KitConfiguration::from_json(block) {
                Ok(configuration) => configuration,
                Err(e) => {
                    tracing::error!(kit_id, error = %e, "Malformed kit configuration; skipping");
                    report.failed.push(kit_id);
                    continue;
                }
            };

            match self.registry.get(kit_id) {
                Some(entry) => self.update_kit(&entry, configuration, &mut report),
                None => self.create_kit(configuration, &mut report),
            }
        }

        for kit_id in self.registry.ids() {
            if seen.contains(&kit_id) {
                continue;
            }
            if let Some(entry) = self.registry.get(kit_id) {
                self.teardown(&entry);
                report.removed.push(kit_id);
            }
        }

        tracing::info!(
            created = report.created.len(),
            activated = report.activated.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "Kit reconciliation complete"
        );

        self.replay_pending();
        report
    }

    fn create_kit(&self, configuration: KitConfiguration, report: &mut ReconcileReport) {
        let kit_id = configuration.id;
        let constructed = panic::catch_unwind(AssertUnwindSafe(|| self.factory.create(kit_id)))
            .unwrap_or_else(|payload| Err(KitError::Panicked(panic_message(payload.as_ref()))));
        let kit = match constructed {
            Ok(kit) => kit,
            Err(e) => {
                tracing::warn!(kit_id, error = %e, "Kit construction failed");
                report.failed.push(kit_id);
                return;
            }
        };

        let entry = Arc::new(KitEntry::new(kit, configuration));
        let settings = entry.configuration();
        if self
            .invoke(&entry, "create", |kit| kit.on_kit_create(&settings.settings))
            .is_none()
        {
            report.failed.push(kit_id);
            return;
        }

        self.registry.insert(Arc::clone(&entry));
        report.created.push(kit_id);
        tracing::debug!(kit_id, kit = entry.name(), capabilities = %entry.capabilities(), "Kit created");

        if self.is_disabled(&settings) {
            tracing::debug!(kit_id, kit = entry.name(), "Kit disabled; activation deferred");
            return;
        }
        if self.activate(&entry) {
            report.activated.push(kit_id);
        }
    }

    fn update_kit(
        &self,
        entry: &Arc<KitEntry>,
        configuration: KitConfiguration,
        report: &mut ReconcileReport,
    ) {
        let disabled = self.is_disabled(&configuration);
        entry.replace_configuration(configuration);
        let settings = entry.configuration();
        self.invoke(entry, "settings", |kit| {
            kit.on_settings_updated(&settings.settings)
        });
        report.updated.push(entry.id());

        if !disabled && !entry.is_active() && self.activate(entry) {
            report.activated.push(entry.id());
        }
    }

    /// Run the activation sequence once. Returns `false` if it already ran.
    fn activate(&self, entry: &KitEntry) -> bool {
        if !entry.mark_active() {
            return false;
        }
        let kit_id = entry.id();

        if let Some(activity) = self.host.current_activity() {
            for stage in [
                ActivityStage::Created,
                ActivityStage::Started,
                ActivityStage::Resumed,
            ] {
                self.invoke(entry, "activity", |kit| match activity_listener(kit) {
                    Some(listener) => listener.on_activity(stage, &activity),
                    None => Ok(()),
                });
            }
        }

        self.signal(KitSignal::Activated(kit_id));

        if let Some(user) = self.host.current_user() {
            self.sync_user(entry, &user);
        }

        if let Some(registration) = self.host.push_registration() {
            let forwarded = self.forwarded(entry, "push", |kit| match push_listener(kit) {
                Some(listener) => listener.on_push_registration(&registration),
                None => Ok(Delivery::Declined),
            });
            if forwarded {
                self.reporting
                    .log(ReportingMessage::new(kit_id, MessageType::PushRegistration));
            }
        }

        if let Some(referrer) = self.host.install_referrer() {
            self.invoke(entry, "install_referrer", |kit| {
                kit.set_install_referrer(&referrer)
            });
        }

        tracing::info!(kit_id, kit = entry.name(), "Kit activated");
        true
    }

    /// Push the current user's identities and attributes into a new kit.
    fn sync_user(&self, entry: &KitEntry, user: &UserSnapshot) {
        let configuration = entry.configuration();

        self.invoke(entry, "identity", |kit| {
            let Some(listener) = identity_listener(kit) else {
                return Ok(());
            };
            for (identity_type, value) in &user.identities {
                if configuration.should_set_identity(*identity_type) {
                    listener.set_user_identity(*identity_type, value)?;
                }
            }
            Ok(())
        });

        let attributes = configuration.filter_user_attributes(&user.attributes);
        let lists = configuration.filter_user_attribute_lists(&user.attribute_lists);
        self.invoke(entry, "attribute", |kit| match attribute_listener(kit) {
            Some(listener) => self.set_all_attributes(listener, &attributes, &lists),
            None => Ok(()),
        });
    }

    fn set_all_attributes(
        &self,
        listener: &dyn AttributeListener,
        attributes: &Attributes,
        lists: &BTreeMap<String, Vec<String>>,
    ) -> KitResult<()> {
        if listener.supports_attribute_lists() {
            return listener.set_all_user_attributes(attributes, lists);
        }
        let mut merged = attributes.clone();
        for (key, values) in lists {
            merged.insert(key.clone(), values.join(&self.list_delimiter));
        }
        listener.set_all_user_attributes(&merged, &BTreeMap::new())
    }

    fn teardown(&self, entry: &KitEntry) {
        let kit_id = entry.id();
        self.host.clear_integration_attributes(kit_id);
        self.invoke(entry, "destroy", |kit| kit.on_kit_destroy());
        self.invoke(entry, "cleanup", |kit| kit.on_kit_cleanup());
        self.registry.remove(kit_id);
        self.signal(KitSignal::Deactivated(kit_id));
        tracing::info!(kit_id, kit = entry.name(), "Kit torn down");
    }

    /// Tear down every kit and stop queueing.
    pub fn shutdown(&self) {
        {
            let mut pending = self.pending_queue();
            pending.enabled = false;
            pending.calls.clear();
        }
        for entry in self.registry.snapshot().values() {
            self.teardown(entry);
        }
        tracing::info!("Kit manager shut down");
    }

    fn signal(&self, signal: KitSignal) {
        if self.signals.send(signal).is_err() {
            tracing::trace!(?signal, "No signal subscribers");
        }
    }

    // ============================================
    // Pre-configuration queue
    // ============================================

    fn pending_queue(&self) -> MutexGuard<'_, PendingQueue> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold a call if no configuration has been applied yet.
    fn defer(&self, call: impl FnOnce() -> PendingCall) -> bool {
        let mut pending = self.pending_queue();
        if !pending.enabled {
            return false;
        }
        if pending.calls.len() >= pending.capacity {
            pending.calls.pop_front();
            tracing::warn!(capacity = pending.capacity, "Pending call queue full; dropping oldest");
        }
        pending.calls.push_back(call());
        true
    }

    fn replay_pending(&self) {
        let calls = {
            let mut pending = self.pending_queue();
            if !pending.enabled {
                return;
            }
            pending.enabled = false;
            std::mem::take(&mut pending.calls)
        };
        if calls.is_empty() {
            return;
        }

        tracing::info!(count = calls.len(), "Replaying calls held before configuration");
        for call in calls {
            match call {
                PendingCall::Event(event) => {
                    self.log_event(&event);
                }
                PendingCall::Screen(name, attributes) => {
                    self.log_screen(&name, &attributes);
                }
                PendingCall::Commerce(event) => {
                    self.log_commerce_event(&event);
                }
                PendingCall::Breadcrumb(breadcrumb) => {
                    self.leave_breadcrumb(&breadcrumb);
                }
                PendingCall::Error(message, attributes) => {
                    self.log_error(&message, &attributes);
                }
                PendingCall::Exception(exception, message, attributes) => {
                    self.log_exception(&exception, &message, &attributes);
                }
            }
        }
    }

    // ============================================
    // Dispatch helpers
    // ============================================

    fn is_disabled(&self, configuration: &KitConfiguration) -> bool {
        configuration.is_disabled(self.host.user_bucket(), self.host.is_opted_out())
    }

    /// Active, enabled kits from one registry snapshot.
    fn enabled_kits(&self) -> Vec<Arc<KitEntry>> {
        let bucket = self.host.user_bucket();
        let opted_out = self.host.is_opted_out();
        self.registry
            .snapshot()
            .values()
            .filter(|entry| {
                entry.is_active() && !entry.configuration().is_disabled(bucket, opted_out)
            })
            .cloned()
            .collect()
    }

    fn kits_with(&self, capability: Capability) -> Vec<Arc<KitEntry>> {
        self.enabled_kits()
            .into_iter()
            .filter(|entry| entry.has_capability(capability))
            .collect()
    }

    /// Call into a kit, isolating errors and panics.
    fn invoke<T>(
        &self,
        entry: &KitEntry,
        capability: &'static str,
        call: impl FnOnce(&dyn Kit) -> KitResult<T>,
    ) -> Option<T> {
        let kit = entry.kit().as_ref();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| call(kit)))
            .unwrap_or_else(|payload| Err(KitError::Panicked(panic_message(payload.as_ref()))));
        match outcome {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(
                    kit_id = entry.id(),
                    kit = entry.name(),
                    capability,
                    error = %e,
                    "Kit call failed"
                );
                None
            }
        }
    }

    fn forwarded(
        &self,
        entry: &KitEntry,
        capability: &'static str,
        call: impl FnOnce(&dyn Kit) -> KitResult<Delivery>,
    ) -> bool {
        self.invoke(entry, capability, call)
            .is_some_and(|delivery| delivery.is_forwarded())
    }

    /// Forward projected events; the message carries one report per
    /// derived event the kit accepted.
    fn forward_projections(
        &self,
        entry: &KitEntry,
        mut message: ReportingMessage,
        results: &[ProjectionResult],
    ) -> Option<ReportingMessage> {
        let mut any = false;
        for result in results {
            if self.forwarded(entry, "projection", |kit| deliver_derived(kit, &result.event)) {
                message.add_projection_report(ProjectionReport::from_result(result));
                any = true;
            }
        }
        any.then_some(message)
    }

    fn finish(&self, summary: &mut DispatchSummary, messages: Vec<ReportingMessage>) {
        summary
            .forwarded
            .extend(messages.iter().map(|m| m.destination_id));
        self.reporting.log_all(messages);
    }

    // ============================================
    // Event dispatch
    // ============================================

    /// Route a domain event to kits declaring `capability`.
    ///
    /// Fails only when the event shape and capability do not belong together.
    pub fn dispatch(&self, event: &DomainEvent, capability: Capability) -> Result<DispatchSummary> {
        match event {
            DomainEvent::Event(e) if capability == Capability::Event => Ok(self.log_event(e)),
            DomainEvent::Screen(e) if capability == Capability::Screen => {
                Ok(self.log_screen(&e.name, &e.attributes))
            }
            DomainEvent::Commerce(e) if capability == Capability::Commerce => {
                Ok(self.log_commerce_event(e))
            }
            _ => Err(Error::CapabilityMismatch {
                event: event.kind(),
                capability,
            }),
        }
    }

    /// Forward a generic event.
    ///
    /// Projection rules are applied first. Events marked as lifetime-value
    /// increases that no rule projected go to the LTV handler of commerce
    /// kits instead of the plain event handler.
    pub fn log_event(&self, event: &Event) -> DispatchSummary {
        if self.defer(|| PendingCall::Event(event.clone())) {
            return DispatchSummary::queued();
        }

        let ltv_amount = ltv_amount(event);
        let mut summary = DispatchSummary::default();
        let mut messages = Vec::new();

        for entry in self.enabled_kits() {
            let is_event_kit = entry.has_capability(Capability::Event);
            let is_ltv_kit = ltv_amount.is_some() && entry.has_capability(Capability::Commerce);
            if !is_event_kit && !is_ltv_kit {
                continue;
            }

            let configuration = entry.configuration();
            if !configuration.should_log_event(event) {
                tracing::trace!(kit_id = entry.id(), event = %event.name, "Event filtered");
                continue;
            }
            let filtered = Event {
                attributes: configuration.filter_event_attributes(event),
                ..event.clone()
            };

            if is_event_kit {
                let rules = configuration.projections(SourceKind::Event);
                let projected = project(ProjectionSource::Event(&filtered), &rules);
                if !projected.is_empty() {
                    if let Some(message) = self.forward_projections(
                        &entry,
                        ReportingMessage::for_event(entry.id(), &filtered),
                        &projected,
                    ) {
                        messages.push(message);
                    }
                    continue;
                }
            }

            let forwarded = match (is_ltv_kit, ltv_amount) {
                (true, Some(amount)) => self.forwarded(&entry, "commerce", |kit| {
                    match commerce_listener(kit) {
                        Some(listener) => listener.log_ltv_increase(
                            amount,
                            amount,
                            &filtered.name,
                            &filtered.attributes,
                        ),
                        None => Ok(Delivery::Declined),
                    }
                }),
                _ => self.forwarded(&entry, "event", |kit| match event_listener(kit) {
                    Some(listener) => listener.log_event(&filtered),
                    None => Ok(Delivery::Declined),
                }),
            };
            if forwarded {
                messages.push(ReportingMessage::for_event(entry.id(), &filtered));
            }
        }

        self.finish(&mut summary, messages);
        summary
    }

    /// Forward a screen view.
    pub fn log_screen(&self, name: &str, attributes: &Attributes) -> DispatchSummary {
        if self.defer(|| PendingCall::Screen(name.to_string(), attributes.clone())) {
            return DispatchSummary::queued();
        }

        let mut summary = DispatchSummary::default();
        let mut messages = Vec::new();

        for entry in self.kits_with(Capability::Screen) {
            let configuration = entry.configuration();
            if !configuration.should_log_screen(name) {
                tracing::trace!(kit_id = entry.id(), screen = name, "Screen filtered");
                continue;
            }
            let screen = Event::new(name, EventType::Navigation)
                .with_attributes(configuration.filter_screen_attributes(name, attributes));

            let rules = configuration.projections(SourceKind::Screen);
            let projected = project(ProjectionSource::Screen(&screen), &rules);
            if projected.is_empty() {
                let forwarded = self.forwarded(&entry, "screen", |kit| match screen_listener(kit) {
                    Some(listener) => listener.log_screen(&screen.name, &screen.attributes),
                    None => Ok(Delivery::Declined),
                });
                if forwarded {
                    messages.push(ReportingMessage::for_screen(entry.id(), &screen));
                }
            } else if let Some(message) = self.forward_projections(
                &entry,
                ReportingMessage::for_screen(entry.id(), &screen),
                &projected,
            ) {
                messages.push(message);
            }
        }

        self.finish(&mut summary, messages);
        summary
    }

    /// Forward a commerce event.
    ///
    /// Kits without a commerce handler but with an event handler receive the
    /// event expanded into generic events.
    pub fn log_commerce_event(&self, event: &CommerceEvent) -> DispatchSummary {
        if self.defer(|| PendingCall::Commerce(event.clone())) {
            return DispatchSummary::queued();
        }

        let mut summary = DispatchSummary::default();
        let mut messages = Vec::new();

        for entry in self.enabled_kits() {
            let is_commerce_kit = entry.has_capability(Capability::Commerce);
            if !is_commerce_kit && !entry.has_capability(Capability::Event) {
                continue;
            }

            let configuration = entry.configuration();
            let Some(filtered) = configuration.filter_commerce_event(event) else {
                tracing::trace!(kit_id = entry.id(), event = %event.event_name(), "Commerce event filtered");
                continue;
            };
            let message = ReportingMessage::for_commerce(entry.id(), &filtered);

            let rules = configuration.projections(SourceKind::Commerce);
            let projected = project(ProjectionSource::Commerce(&filtered), &rules);
            if !projected.is_empty() {
                if let Some(message) = self.forward_projections(&entry, message, &projected) {
                    messages.push(message);
                }
                continue;
            }

            let forwarded = if is_commerce_kit {
                self.forwarded(&entry, "commerce", |kit| match commerce_listener(kit) {
                    Some(listener) => listener.log_commerce_event(&filtered),
                    None => Ok(Delivery::Declined),
                })
            } else {
                let expanded = commerce::expand(&filtered);
                let mut any = false;
                for item in &expanded {
                    any |= self.forwarded(&entry, "event", |kit| match event_listener(kit) {
                        Some(listener) => listener.log_event(item),
                        None => Ok(Delivery::Declined),
                    });
                }
                any
            };
            if forwarded {
                messages.push(message);
            }
        }

        self.finish(&mut summary, messages);
        summary
    }

    pub fn leave_breadcrumb(&self, breadcrumb: &str) -> DispatchSummary {
        if self.defer(|| PendingCall::Breadcrumb(breadcrumb.to_string())) {
            return DispatchSummary::queued();
        }
        self.forward_to_event_kits(MessageType::Breadcrumb, breadcrumb, None, |listener| {
            listener.leave_breadcrumb(breadcrumb)
        })
    }

    pub fn log_error(&self, message: &str, attributes: &Attributes) -> DispatchSummary {
        if self.defer(|| PendingCall::Error(message.to_string(), attributes.clone())) {
            return DispatchSummary::queued();
        }
        self.forward_to_event_kits(MessageType::Error, message, Some(attributes), |listener| {
            listener.log_error(message, attributes)
        })
    }

    pub fn log_exception(
        &self,
        exception: &str,
        message: &str,
        attributes: &Attributes,
    ) -> DispatchSummary {
        if self.defer(|| {
            PendingCall::Exception(exception.to_string(), message.to_string(), attributes.clone())
        }) {
            return DispatchSummary::queued();
        }
        self.forward_to_event_kits(MessageType::Exception, exception, Some(attributes), |listener| {
            listener.log_exception(exception, message, attributes)
        })
    }

    fn forward_to_event_kits(
        &self,
        message_type: MessageType,
        name: &str,
        attributes: Option<&Attributes>,
        call: impl Fn(&dyn EventListener) -> KitResult<Delivery>,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let mut messages = Vec::new();
        for entry in self.kits_with(Capability::Event) {
            let forwarded = self.forwarded(&entry, "event", |kit| match event_listener(kit) {
                Some(listener) => call(listener),
                None => Ok(Delivery::Declined),
            });
            if forwarded {
                let mut message = ReportingMessage::new(entry.id(), message_type).with_name(name);
                if let Some(attributes) = attributes {
                    message = message.with_attributes(attributes.clone());
                }
                messages.push(message);
            }
        }
        self.finish(&mut summary, messages);
        summary
    }

    // ============================================
    // User attributes and identities
    // ============================================

    pub fn set_user_attribute(&self, key: &str, value: &str) {
        for entry in self.kits_with(Capability::Attribute) {
            if !entry.configuration().should_forward_attribute(key) {
                tracing::trace!(kit_id = entry.id(), key, "User attribute filtered");
                continue;
            }
            self.invoke(&entry, "attribute", |kit| match attribute_listener(kit) {
                Some(listener) => listener.set_user_attribute(key, value),
                None => Ok(()),
            });
        }
    }

    /// Forward a list attribute; kits without list support receive the
    /// values joined into one string instead.
    pub fn set_user_attribute_list(&self, key: &str, values: &[String]) {
        for entry in self.kits_with(Capability::Attribute) {
            if !entry.configuration().should_forward_attribute_list(key) {
                tracing::trace!(kit_id = entry.id(), key, "User attribute list filtered");
                continue;
            }
            self.invoke(&entry, "attribute", |kit| {
                let Some(listener) = attribute_listener(kit) else {
                    return Ok(());
                };
                if listener.supports_attribute_lists() {
                    listener.set_user_attribute_list(key, values)
                } else {
                    listener.set_user_attribute(key, &values.join(&self.list_delimiter))
                }
            });
        }
    }

    /// Replace the full attribute state in every attribute kit.
    pub fn on_user_attributes_received(
        &self,
        attributes: &Attributes,
        attribute_lists: &BTreeMap<String, Vec<String>>,
    ) {
        for entry in self.kits_with(Capability::Attribute) {
            let configuration = entry.configuration();
            let filtered = configuration.filter_user_attributes(attributes);
            let filtered_lists = configuration.filter_user_attribute_lists(attribute_lists);
            self.invoke(&entry, "attribute", |kit| match attribute_listener(kit) {
                Some(listener) => self.set_all_attributes(listener, &filtered, &filtered_lists),
                None => Ok(()),
            });
        }
    }

    pub fn remove_user_attribute(&self, key: &str) {
        for entry in self.kits_with(Capability::Attribute) {
            if !entry.configuration().should_forward_attribute(key) {
                continue;
            }
            self.invoke(&entry, "attribute", |kit| match attribute_listener(kit) {
                Some(listener) => listener.remove_user_attribute(key),
                None => Ok(()),
            });
        }
    }

    pub fn set_user_identity(&self, identity_type: IdentityType, value: &str) {
        for entry in self.kits_with(Capability::Identity) {
            if !entry.configuration().should_set_identity(identity_type) {
                tracing::trace!(kit_id = entry.id(), ?identity_type, "Identity filtered");
                continue;
            }
            self.invoke(&entry, "identity", |kit| match identity_listener(kit) {
                Some(listener) => listener.set_user_identity(identity_type, value),
                None => Ok(()),
            });
        }
    }

    pub fn remove_user_identity(&self, identity_type: IdentityType) {
        for entry in self.kits_with(Capability::Identity) {
            if !entry.configuration().should_set_identity(identity_type) {
                continue;
            }
            self.invoke(&entry, "identity", |kit| match identity_listener(kit) {
                Some(listener) => listener.remove_user_identity(identity_type),
                None => Ok(()),
            });
        }
    }

    pub fn logout(&self) {
        for entry in self.kits_with(Capability::Identity) {
            self.invoke(&entry, "identity", |kit| match identity_listener(kit) {
                Some(listener) => listener.logout(),
                None => Ok(()),
            });
        }
    }

    // ============================================
    // Push
    // ============================================

    /// Offer a push message to push kits in registry order; the first kit
    /// that claims it handles it. Returns that kit's id.
    pub fn on_push_message_received(&self, message: &PushMessage) -> Option<KitId> {
        for entry in self.kits_with(Capability::Push) {
            let claimed = self
                .invoke(&entry, "push", |kit| {
                    Ok(push_listener(kit).is_some_and(|l| l.will_handle_push_message(message)))
                })
                .unwrap_or(false);
            if !claimed {
                continue;
            }

            let handled = self
                .invoke(&entry, "push", |kit| match push_listener(kit) {
                    Some(listener) => listener.on_push_message_received(message),
                    None => Ok(()),
                })
                .is_some();
            if handled {
                self.reporting.log(
                    ReportingMessage::new(entry.id(), MessageType::PushReceived)
                        .with_attributes(message.payload.clone()),
                );
            }
            return Some(entry.id());
        }
        None
    }

    /// Hand a new push registration to the first push kit.
    pub fn on_push_registration(&self, registration: &PushRegistration) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        if let Some(entry) = self.kits_with(Capability::Push).into_iter().next() {
            let forwarded = self.forwarded(&entry, "push", |kit| match push_listener(kit) {
                Some(listener) => listener.on_push_registration(registration),
                None => Ok(Delivery::Declined),
            });
            if forwarded {
                self.finish(
                    &mut summary,
                    vec![ReportingMessage::new(entry.id(), MessageType::PushRegistration)],
                );
            }
        }
        summary
    }

    // ============================================
    // Runtime notifications
    // ============================================

    /// Forward a platform lifecycle notification to matching kits.
    pub fn notify(&self, notice: &LifecycleNotice) {
        match notice {
            LifecycleNotice::Activity(stage, activity) => {
                for entry in self.kits_with(Capability::Activity) {
                    self.invoke(&entry, "activity", |kit| match activity_listener(kit) {
                        Some(listener) => listener.on_activity(*stage, activity),
                        None => Ok(()),
                    });
                }
            }
            LifecycleNotice::SessionStart | LifecycleNotice::SessionEnd => {
                let start = matches!(notice, LifecycleNotice::SessionStart);
                for entry in self.kits_with(Capability::Session) {
                    self.invoke(&entry, "session", |kit| match session_listener(kit) {
                        Some(listener) if start => listener.on_session_start(),
                        Some(listener) => listener.on_session_end(),
                        None => Ok(()),
                    });
                }
            }
            LifecycleNotice::ApplicationForeground | LifecycleNotice::ApplicationBackground => {
                let foreground = matches!(notice, LifecycleNotice::ApplicationForeground);
                for entry in self.kits_with(Capability::ApplicationState) {
                    self.invoke(&entry, "application_state", |kit| {
                        match application_state_listener(kit) {
                            Some(listener) if foreground => listener.on_application_foreground(),
                            Some(listener) => listener.on_application_background(),
                            None => Ok(()),
                        }
                    });
                }
            }
        }
    }

    /// Forward the opt-out state to every enabled kit.
    pub fn set_opt_out(&self, opted_out: bool) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let mut messages = Vec::new();
        for entry in self.enabled_kits() {
            if self.forwarded(&entry, "opt_out", |kit| kit.set_opt_out(opted_out)) {
                messages.push(
                    ReportingMessage::new(entry.id(), MessageType::OptOut)
                        .with_attribute("opt_out", opted_out.to_string()),
                );
            }
        }
        self.finish(&mut summary, messages);
        summary
    }

    pub fn install_referrer_updated(&self, referrer: &str) {
        for entry in self.enabled_kits() {
            self.invoke(&entry, "install_referrer", |kit| {
                kit.set_install_referrer(referrer)
            });
        }
    }

    // ============================================
    // Attribution
    // ============================================

    /// Store the latest attribution result of a kit and pass it on.
    pub fn on_attribution_result(&self, result: AttributionResult) {
        if let Some(listener) = &self.attribution_listener {
            listener.on_result(&result);
        }
        match self.attribution.write() {
            Ok(mut results) => {
                results.insert(result.kit_id, result);
            }
            Err(e) => tracing::warn!(error = %e, "Attribution store poisoned; result dropped"),
        }
    }

    pub fn on_attribution_error(&self, error: AttributionError) {
        tracing::debug!(kit_id = error.kit_id, message = %error.message, "Kit attribution failed");
        if let Some(listener) = &self.attribution_listener {
            listener.on_error(&error);
        }
    }

    /// Latest attribution result per kit id.
    pub fn attribution_results(&self) -> BTreeMap<KitId, AttributionResult> {
        self.attribution
            .read()
            .map(|results| results.clone())
            .unwrap_or_default()
    }

    // ============================================
    // Introspection
    // ============================================

    /// Ids of kits that are active and currently enabled.
    pub fn active_kit_ids(&self) -> Vec<KitId> {
        self.enabled_kits().iter().map(|entry| entry.id()).collect()
    }

    pub fn is_kit_active(&self, kit_id: KitId) -> bool {
        self.active_kit_ids().contains(&kit_id)
    }

    /// The registry entry of a kit, active or not.
    pub fn entry(&self, kit_id: KitId) -> Option<Arc<KitEntry>> {
        self.registry.get(kit_id)
    }

    pub fn kit_instance(&self, kit_id: KitId) -> Option<KitInstance> {
        self.registry.get(kit_id).and_then(|entry| entry.kit().instance())
    }

    pub fn supported_kits(&self) -> Vec<KitId> {
        self.factory.supported_kits()
    }
}

// ============================================
// Capability lookups
// ============================================

fn event_listener(kit: &dyn Kit) -> Option<&dyn EventListener> {
    kit.capabilities()
        .contains(Capability::Event)
        .then(|| kit.as_event_listener())
        .flatten()
}

fn commerce_listener(kit: &dyn Kit) -> Option<&dyn CommerceListener> {
    kit.capabilities()
        .contains(Capability::Commerce)
        .then(|| kit.as_commerce_listener())
        .flatten()
}

fn screen_listener(kit: &dyn Kit) -> Option<&dyn ScreenListener> {
    kit.capabilities()
        .contains(Capability::Screen)
        .then(|| kit.as_screen_listener())
        .flatten()
}

fn attribute_listener(kit: &dyn Kit) -> Option<&dyn AttributeListener> {
    kit.capabilities()
        .contains(Capability::Attribute)
        .then(|| kit.as_attribute_listener())
        .flatten()
}

fn identity_listener(kit: &dyn Kit) -> Option<&dyn IdentityListener> {
    kit.capabilities()
        .contains(Capability::Identity)
        .then(|| kit.as_identity_listener())
        .flatten()
}

fn push_listener(kit: &dyn Kit) -> Option<&dyn PushListener> {
    kit.capabilities()
        .contains(Capability::Push)
        .then(|| kit.as_push_listener())
        .flatten()
}

fn activity_listener(kit: &dyn Kit) -> Option<&dyn ActivityListener> {
    kit.capabilities()
        .contains(Capability::Activity)
        .then(|| kit.as_activity_listener())
        .flatten()
}

fn session_listener(kit: &dyn Kit) -> Option<&dyn SessionListener> {
    kit.capabilities()
        .contains(Capability::Session)
        .then(|| kit.as_session_listener())
        .flatten()
}

fn application_state_listener(kit: &dyn Kit) -> Option<&dyn ApplicationStateListener> {
    kit.capabilities()
        .contains(Capability::ApplicationState)
        .then(|| kit.as_application_state_listener())
        .flatten()
}

/// Deliver one projected event through the matching handler.
fn deliver_derived(kit: &dyn Kit, derived: &DerivedEvent) -> KitResult<Delivery> {
    match derived {
        DerivedEvent::Custom(event) => {
            if let Some(listener) = event_listener(kit) {
                listener.log_event(event)
            } else if let Some(listener) = screen_listener(kit) {
                listener.log_screen(&event.name, &event.attributes)
            } else {
                Ok(Delivery::Declined)
            }
        }
        DerivedEvent::Commerce(event) => match commerce_listener(kit) {
            Some(listener) => listener.log_commerce_event(event),
            None => Ok(Delivery::Declined),
        },
    }
}

/// The LTV amount of an event marked as a lifetime-value increase.
fn ltv_amount(event: &Event) -> Option<f64> {
    let is_ltv = event
        .attributes
        .get(METHOD_NAME_ATTRIBUTE)
        .is_some_and(|method| method == LTV_METHOD_NAME);
    if !is_ltv {
        return None;
    }
    let raw = event.attributes.get(LTV_AMOUNT_ATTRIBUTE);
    match raw.and_then(|amount| amount.trim().parse::<f64>().ok()) {
        Some(amount) => Some(amount),
        None => {
            tracing::warn!(
                event = %event.name,
                amount = ?raw,
                "LTV event without a numeric amount; forwarding as a generic event"
            );
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
