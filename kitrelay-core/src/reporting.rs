//! Reporting aggregator
//!
//! Every successful forward produces a [`ReportingMessage`]: an audit record
//! of what a kit actually received. Messages are appended in forwarding order
//! and handed verbatim to a [`ReportingSink`] (durable storage and upload live
//! outside the engine). Nothing is deduplicated or retried.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::projection::{DerivedEvent, ProjectionResult};
use crate::types::{Attributes, CommerceEvent, Event, EventType, KitId};

/// What kind of call a reporting message records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Event,
    CommerceEvent,
    ScreenView,
    Breadcrumb,
    Error,
    Exception,
    PushRegistration,
    PushReceived,
    OptOut,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Event => "event",
            MessageType::CommerceEvent => "commerce_event",
            MessageType::ScreenView => "screen_view",
            MessageType::Breadcrumb => "breadcrumb",
            MessageType::Error => "error",
            MessageType::Exception => "exception",
            MessageType::PushRegistration => "push_registration",
            MessageType::PushReceived => "push_received",
            MessageType::OptOut => "opt_out",
        }
    }
}

/// Which projection rule produced which derived event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionReport {
    pub projection_id: i32,
    pub derived_message_type: MessageType,
    pub derived_event_name: String,
}

impl ProjectionReport {
    pub fn from_result(result: &ProjectionResult) -> Self {
        let derived_message_type = match &result.event {
            DerivedEvent::Custom(_) => MessageType::Event,
            DerivedEvent::Commerce(_) => MessageType::CommerceEvent,
        };
        Self {
            projection_id: result.projection_id,
            derived_message_type,
            derived_event_name: result.event.name(),
        }
    }
}

/// Audit record of one forward to one kit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportingMessage {
    pub id: Uuid,
    pub destination_id: KitId,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    #[serde(skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub projection_reports: Vec<ProjectionReport>,
}

impl ReportingMessage {
    pub fn new(destination_id: KitId, message_type: MessageType) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination_id,
            message_type,
            timestamp: Utc::now(),
            event_name: None,
            event_type: None,
            attributes: Attributes::new(),
            projection_reports: Vec::new(),
        }
    }

    /// Record of a generic event forward.
    pub fn for_event(destination_id: KitId, event: &Event) -> Self {
        Self::new(destination_id, MessageType::Event).with_event(event)
    }

    /// Record of a screen view forward.
    pub fn for_screen(destination_id: KitId, screen: &Event) -> Self {
        Self::new(destination_id, MessageType::ScreenView)
            .with_name(screen.name.clone())
            .with_attributes(screen.attributes.clone())
    }

    /// Record of a commerce event forward.
    pub fn for_commerce(destination_id: KitId, event: &CommerceEvent) -> Self {
        let mut message = Self::new(destination_id, MessageType::CommerceEvent)
            .with_name(event.event_name())
            .with_attributes(event.attributes.clone());
        message.event_type = Some(EventType::Transaction);
        message
    }

    pub fn with_event(mut self, event: &Event) -> Self {
        self.event_name = Some(event.name.clone());
        self.event_type = Some(event.event_type);
        self.attributes = event.attributes.clone();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = Some(name.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn add_projection_report(&mut self, report: ProjectionReport) {
        self.projection_reports.push(report);
    }
}

/// External collaborator that persists or uploads reporting messages.
pub trait ReportingSink: Send + Sync {
    fn report(&self, messages: Vec<ReportingMessage>);
}

/// Append-only front of the reporting sink.
#[derive(Clone)]
pub struct ReportingManager {
    sink: Arc<dyn ReportingSink>,
}

impl ReportingManager {
    pub fn new(sink: Arc<dyn ReportingSink>) -> Self {
        Self { sink }
    }

    pub fn log(&self, message: ReportingMessage) {
        self.log_all(vec![message]);
    }

    pub fn log_all(&self, messages: Vec<ReportingMessage>) {
        if messages.is_empty() {
            return;
        }
        tracing::trace!(count = messages.len(), "Reporting forwarded messages");
        self.sink.report(messages);
    }
}

/// Sink that keeps every message in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<ReportingMessage>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far.
    pub fn messages(&self) -> Vec<ReportingMessage> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Remove and return everything reported so far.
    pub fn take(&self) -> Vec<ReportingMessage> {
        self.messages
            .lock()
            .map(|mut m| std::mem::take(&mut *m))
            .unwrap_or_default()
    }
}

impl ReportingSink for MemorySink {
    fn report(&self, messages: Vec<ReportingMessage>) {
        match self.messages.lock() {
            Ok(mut stored) => stored.extend(messages),
            Err(e) => tracing::warn!(error = %e, "Reporting buffer poisoned; dropping messages"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_preserves_order() {
        let sink = Arc::new(MemorySink::new());
        let manager = ReportingManager::new(sink.clone());

        manager.log(ReportingMessage::for_event(
            1,
            &Event::new("first", EventType::Other),
        ));
        manager.log_all(vec![
            ReportingMessage::new(2, MessageType::Breadcrumb).with_name("second"),
            ReportingMessage::new(3, MessageType::OptOut),
        ]);

        let messages = sink.messages();
        let ids: Vec<KitId> = messages.iter().map(|m| m.destination_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(messages[0].event_name.as_deref(), Some("first"));

        assert_eq!(sink.take().len(), 3);
        assert!(sink.messages().is_empty());
    }

    #[test]
    fn test_serialized_shape() {
        let mut message = ReportingMessage::for_commerce(
            5,
            &CommerceEvent::product(crate::types::ProductAction::Purchase),
        );
        message.add_projection_report(ProjectionReport {
            projection_id: 12,
            derived_message_type: MessageType::Event,
            derived_event_name: "Bought".to_string(),
        });

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["destination_id"], 5);
        assert_eq!(json["message_type"], "commerce_event");
        assert_eq!(json["event_name"], "eCommerce - purchase");
        assert_eq!(json["projection_reports"][0]["projection_id"], 12);
        assert!(json.get("attributes").is_none());
    }
}
