//! Projection engine
//!
//! Turns one source event into zero or more kit-specific derived events under
//! an ordered list of rules.
//!
//! ## Evaluation
//!
//! ```text
//!   source event ──► rule 1 ──► match? ──► template ──► derived event(s)
//!                 ├► rule 2 ──► ...
//!                 └► (no explicit rule matched) ──► first matching default rule
//! ```
//!
//! - Rules are evaluated in declaration order; every matching rule contributes.
//! - Default rules (`isDefault`) only apply when no explicit rule of the same
//!   source kind matched.
//! - A template that needs a `required` attribute the source lacks yields
//!   nothing for that rule; optional missing attributes are simply omitted.
//! - An empty result means "forward the original event unchanged".
//!
//! [`project`] borrows the source and never mutates it. Output depends only on
//! the event and the rules, so repeated calls produce identical, identically
//! ordered results.

use serde::{Deserialize, Serialize};

use crate::types::{Attributes, CommerceEvent, Event, EventType, Product, ProductAction};

/// Shape of event a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Event,
    Screen,
    Commerce,
}

/// A single projection rule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionRule {
    /// Identifier reported back in projection reports
    pub projection_id: i32,
    /// Applies only when no explicit rule matched
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub matcher: Matcher,
    pub output: OutputTemplate,
}

/// Predicate over a source event.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Matcher {
    pub source: SourceKind,
    /// Case-insensitive event name
    pub event_name: Option<String>,
    /// Event type; commerce sources count as `transaction`
    pub event_type: Option<EventType>,
    /// All conditions must hold
    pub attributes: Vec<AttributeCondition>,
}

/// Condition on one attribute. With no `values`, the key only has to exist.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AttributeCondition {
    pub key: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Template for the derived event(s) a rule produces.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputTemplate {
    pub shape: OutputShape,
    #[serde(default)]
    pub attributes: Vec<AttributeMapping>,
    /// Carry source attributes that no mapping consumed
    #[serde(default)]
    pub append_unmapped: bool,
    /// Cap on the number of unmapped attributes carried over
    #[serde(default)]
    pub max_custom_params: Option<usize>,
    /// For commerce sources, emit one derived event per product line
    #[serde(default)]
    pub per_product: bool,
}

/// Output event shape.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutputShape {
    /// A generic custom event
    Custom {
        #[serde(default)]
        event_name: Option<String>,
        #[serde(default)]
        event_type: Option<EventType>,
    },
    /// A commerce event; only valid for commerce sources
    Commerce {
        #[serde(default)]
        event_name: Option<String>,
        #[serde(default)]
        product_action: Option<ProductAction>,
    },
}

/// Maps one output attribute from the source.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AttributeMapping {
    pub target: String,
    pub source: MappingSource,
    #[serde(default)]
    pub required: bool,
}

/// Where a mapped attribute value comes from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MappingSource {
    /// A source attribute (for per-product rules, product fields included)
    Field(String),
    /// A fixed value
    Static(String),
    /// The source event name
    EventName,
}

/// Borrowed view of the event being projected.
#[derive(Debug, Clone, Copy)]
pub enum ProjectionSource<'a> {
    Event(&'a Event),
    Screen(&'a Event),
    Commerce(&'a CommerceEvent),
}

impl ProjectionSource<'_> {
    pub fn kind(&self) -> SourceKind {
        match self {
            ProjectionSource::Event(_) => SourceKind::Event,
            ProjectionSource::Screen(_) => SourceKind::Screen,
            ProjectionSource::Commerce(_) => SourceKind::Commerce,
        }
    }

    fn name(&self) -> String {
        match self {
            ProjectionSource::Event(e) | ProjectionSource::Screen(e) => e.name.clone(),
            ProjectionSource::Commerce(e) => e.event_name(),
        }
    }

    fn event_type(&self) -> EventType {
        match self {
            ProjectionSource::Event(e) => e.event_type,
            ProjectionSource::Screen(_) => EventType::Navigation,
            ProjectionSource::Commerce(_) => EventType::Transaction,
        }
    }

    fn attributes(&self) -> &Attributes {
        match self {
            ProjectionSource::Event(e) | ProjectionSource::Screen(e) => &e.attributes,
            ProjectionSource::Commerce(e) => &e.attributes,
        }
    }
}

/// A derived event produced by a rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DerivedEvent {
    Custom(Event),
    Commerce(CommerceEvent),
}

impl DerivedEvent {
    pub fn name(&self) -> String {
        match self {
            DerivedEvent::Custom(e) => e.name.clone(),
            DerivedEvent::Commerce(e) => e.event_name(),
        }
    }
}

/// One derived event with the rule that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionResult {
    pub projection_id: i32,
    pub event: DerivedEvent,
}

impl Matcher {
    /// Whether the matcher accepts the source event.
    pub fn matches(&self, source: &ProjectionSource<'_>) -> bool {
        if self.source != source.kind() {
            return false;
        }
        if let Some(name) = &self.event_name {
            if !name.eq_ignore_ascii_case(&source.name()) {
                return false;
            }
        }
        if let Some(event_type) = self.event_type {
            if event_type != source.event_type() {
                return false;
            }
        }
        let attributes = source.attributes();
        self.attributes.iter().all(|cond| match attributes.get(&cond.key) {
            None => false,
            Some(value) => {
                cond.values.is_empty() || cond.values.iter().any(|v| v.eq_ignore_ascii_case(value))
            }
        })
    }
}

impl OutputTemplate {
    /// Build the output attributes from one attribute scope.
    ///
    /// Returns `None` when a required mapping has no value.
    fn bind(&self, scope: &Attributes, event_name: &str) -> Option<Attributes> {
        let mut out = Attributes::new();
        let mut consumed: Vec<&str> = Vec::new();

        for mapping in &self.attributes {
            let value = match &mapping.source {
                MappingSource::Field(key) => {
                    consumed.push(key.as_str());
                    scope.get(key).cloned()
                }
                MappingSource::Static(value) => Some(value.clone()),
                MappingSource::EventName => Some(event_name.to_string()),
            };
            match value {
                Some(value) => {
                    out.insert(mapping.target.clone(), value);
                }
                None if mapping.required => {
                    tracing::trace!(target_key = %mapping.target, "Required projection attribute missing");
                    return None;
                }
                None => {}
            }
        }

        if self.append_unmapped {
            let limit = self.max_custom_params.unwrap_or(usize::MAX);
            let unmapped = scope
                .iter()
                .filter(|(key, _)| !consumed.contains(&key.as_str()) && !out.contains_key(*key))
                .take(limit)
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect::<Vec<_>>();
            out.extend(unmapped);
        }

        Some(out)
    }

    fn instantiate(
        &self,
        source: &ProjectionSource<'_>,
        scope: &Attributes,
        product: Option<&Product>,
    ) -> Option<DerivedEvent> {
        let source_name = source.name();
        let attributes = self.bind(scope, &source_name)?;

        match &self.shape {
            OutputShape::Custom {
                event_name,
                event_type,
            } => {
                let name = event_name.clone().unwrap_or(source_name);
                let event_type = event_type.unwrap_or_else(|| source.event_type());
                Some(DerivedEvent::Custom(
                    Event::new(name, event_type).with_attributes(attributes),
                ))
            }
            OutputShape::Commerce {
                event_name,
                product_action,
            } => {
                let ProjectionSource::Commerce(commerce) = source else {
                    tracing::debug!("Commerce output template ignored for non-commerce source");
                    return None;
                };
                let mut derived = (*commerce).clone();
                if let Some(name) = event_name {
                    derived.name = Some(name.clone());
                }
                if let Some(action) = product_action {
                    derived.product_action = Some(*action);
                }
                if let Some(product) = product {
                    derived.products = vec![product.clone()];
                }
                derived.attributes = attributes;
                Some(DerivedEvent::Commerce(derived))
            }
        }
    }

    /// Produce every derived event this template yields for the source.
    fn apply(&self, source: &ProjectionSource<'_>) -> Vec<DerivedEvent> {
        match source {
            ProjectionSource::Commerce(commerce) if self.per_product => commerce
                .products
                .iter()
                .filter_map(|product| {
                    let mut scope = commerce.attributes.clone();
                    scope.extend(product.to_attributes());
                    self.instantiate(source, &scope, Some(product))
                })
                .collect(),
            _ => self
                .instantiate(source, source.attributes(), None)
                .into_iter()
                .collect(),
        }
    }
}

/// Project a source event through an ordered rule set.
pub fn project(source: ProjectionSource<'_>, rules: &[&ProjectionRule]) -> Vec<ProjectionResult> {
    let mut results = Vec::new();
    let mut matched_explicit = false;

    for rule in rules.iter().filter(|r| !r.is_default) {
        if !rule.matcher.matches(&source) {
            continue;
        }
        matched_explicit = true;
        results.extend(rule.output.apply(&source).into_iter().map(|event| {
            ProjectionResult {
                projection_id: rule.projection_id,
                event,
            }
        }));
    }

    if !matched_explicit {
        if let Some(rule) = rules
            .iter()
            .find(|r| r.is_default && r.matcher.matches(&source))
        {
            results.extend(rule.output.apply(&source).into_iter().map(|event| {
                ProjectionResult {
                    projection_id: rule.projection_id,
                    event,
                }
            }));
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(value: serde_json::Value) -> ProjectionRule {
        serde_json::from_value(value).expect("valid rule")
    }

    fn rename_rule(id: i32, from: &str, to: &str) -> ProjectionRule {
        rule(json!({
            "projectionId": id,
            "matcher": {"eventName": from},
            "output": {
                "shape": {"type": "custom", "eventName": to},
                "attributes": [{"target": "song_title", "source": {"field": "song"}}]
            }
        }))
    }

    #[test]
    fn test_no_match_yields_nothing() {
        let event = Event::new("Play", EventType::Media);
        let rules = [rename_rule(1, "Pause", "Paused")];
        let refs: Vec<&ProjectionRule> = rules.iter().collect();
        assert!(project(ProjectionSource::Event(&event), &refs).is_empty());
    }

    #[test]
    fn test_matching_rules_in_declaration_order() {
        let event = Event::new("Play", EventType::Media).with_attribute("song", "Blue");
        let rules = [rename_rule(10, "play", "First"), rename_rule(11, "Play", "Second")];
        let refs: Vec<&ProjectionRule> = rules.iter().collect();

        let results = project(ProjectionSource::Event(&event), &refs);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].projection_id, 10);
        assert_eq!(results[0].event.name(), "First");
        assert_eq!(results[1].projection_id, 11);
        match &results[0].event {
            DerivedEvent::Custom(e) => {
                assert_eq!(e.attributes.get("song_title").map(String::as_str), Some("Blue"));
                assert_eq!(e.event_type, EventType::Media);
            }
            other => panic!("unexpected derived event {other:?}"),
        }
        // source untouched
        assert_eq!(event.attributes.len(), 1);
    }

    #[test]
    fn test_projection_is_deterministic() {
        let event = Event::new("Play", EventType::Media)
            .with_attribute("song", "Blue")
            .with_attribute("artist", "X")
            .with_attribute("album", "Y");
        let rules = [rule(json!({
            "projectionId": 3,
            "matcher": {"eventName": "Play"},
            "output": {
                "shape": {"type": "custom"},
                "appendUnmapped": true
            }
        }))];
        let refs: Vec<&ProjectionRule> = rules.iter().collect();

        let first = project(ProjectionSource::Event(&event), &refs);
        let second = project(ProjectionSource::Event(&event), &refs);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_missing_optional_attribute_is_omitted() {
        let event = Event::new("Play", EventType::Media);
        let rules = [rename_rule(1, "Play", "Played")];
        let refs: Vec<&ProjectionRule> = rules.iter().collect();
        let results = project(ProjectionSource::Event(&event), &refs);
        assert_eq!(results.len(), 1);
        match &results[0].event {
            DerivedEvent::Custom(e) => assert!(e.attributes.is_empty()),
            other => panic!("unexpected derived event {other:?}"),
        }
    }

    #[test]
    fn test_missing_required_attribute_drops_rule_output() {
        let event = Event::new("Play", EventType::Media);
        let rules = [rule(json!({
            "projectionId": 4,
            "matcher": {"eventName": "Play"},
            "output": {
                "shape": {"type": "custom"},
                "attributes": [{"target": "t", "source": {"field": "song"}, "required": true}]
            }
        }))];
        let refs: Vec<&ProjectionRule> = rules.iter().collect();
        assert!(project(ProjectionSource::Event(&event), &refs).is_empty());
    }

    #[test]
    fn test_default_rule_only_when_nothing_matched() {
        let event = Event::new("Play", EventType::Media);
        let rules = [
            rule(json!({
                "projectionId": 99,
                "isDefault": true,
                "output": {"shape": {"type": "custom", "eventName": "Fallback"}}
            })),
            rename_rule(1, "Pause", "Paused"),
        ];
        let refs: Vec<&ProjectionRule> = rules.iter().collect();
        let results = project(ProjectionSource::Event(&event), &refs);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].projection_id, 99);

        let pause = Event::new("Pause", EventType::Media);
        let results = project(ProjectionSource::Event(&pause), &refs);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].projection_id, 1);
    }

    #[test]
    fn test_attribute_conditions_and_unmapped_cap() {
        let event = Event::new("Search", EventType::Search)
            .with_attribute("a", "1")
            .with_attribute("b", "2")
            .with_attribute("term", "Shoes");
        let rules = [rule(json!({
            "projectionId": 5,
            "matcher": {"attributes": [{"key": "term", "values": ["shoes"]}], "eventType": "search"},
            "output": {
                "shape": {"type": "custom", "eventName": "Shoe Search"},
                "attributes": [{"target": "query", "source": {"field": "term"}},
                               {"target": "origin", "source": "eventName"},
                               {"target": "fixed", "source": {"static": "yes"}}],
                "appendUnmapped": true,
                "maxCustomParams": 1
            }
        }))];
        let refs: Vec<&ProjectionRule> = rules.iter().collect();
        let results = project(ProjectionSource::Event(&event), &refs);
        assert_eq!(results.len(), 1);
        match &results[0].event {
            DerivedEvent::Custom(e) => {
                assert_eq!(e.attributes.get("query").map(String::as_str), Some("Shoes"));
                assert_eq!(e.attributes.get("origin").map(String::as_str), Some("Search"));
                assert_eq!(e.attributes.get("fixed").map(String::as_str), Some("yes"));
                assert_eq!(e.attributes.get("a").map(String::as_str), Some("1"));
                assert!(!e.attributes.contains_key("b"));
                assert!(!e.attributes.contains_key("term"));
            }
            other => panic!("unexpected derived event {other:?}"),
        }
    }

    #[test]
    fn test_per_product_commerce_projection() {
        let event = CommerceEvent::product(ProductAction::Purchase)
            .with_name("Purchase")
            .with_product(Product::new("Shoe", "s-1", 10.0))
            .with_product(Product::new("Hat", "h-1", 5.0));
        let rules = [rule(json!({
            "projectionId": 7,
            "matcher": {"source": "commerce", "eventName": "Purchase"},
            "output": {
                "shape": {"type": "custom", "eventName": "Bought Item"},
                "attributes": [{"target": "sku", "source": {"field": "Id"}, "required": true}],
                "perProduct": true
            }
        }))];
        let refs: Vec<&ProjectionRule> = rules.iter().collect();
        let results = project(ProjectionSource::Commerce(&event), &refs);
        assert_eq!(results.len(), 2);
        let skus: Vec<String> = results
            .iter()
            .map(|r| match &r.event {
                DerivedEvent::Custom(e) => e.attributes["sku"].clone(),
                other => panic!("unexpected derived event {other:?}"),
            })
            .collect();
        assert_eq!(skus, vec!["s-1".to_string(), "h-1".to_string()]);
    }

    #[test]
    fn test_commerce_output_requires_commerce_source() {
        let event = Event::new("Play", EventType::Media);
        let rules = [rule(json!({
            "projectionId": 8,
            "matcher": {"eventName": "Play"},
            "output": {"shape": {"type": "commerce", "productAction": "purchase"}}
        }))];
        let refs: Vec<&ProjectionRule> = rules.iter().collect();
        assert!(project(ProjectionSource::Event(&event), &refs).is_empty());

        let commerce = CommerceEvent::product(ProductAction::AddToCart);
        let rules = [rule(json!({
            "projectionId": 9,
            "matcher": {"source": "commerce"},
            "output": {"shape": {"type": "commerce", "productAction": "purchase"}}
        }))];
        let refs: Vec<&ProjectionRule> = rules.iter().collect();
        let results = project(ProjectionSource::Commerce(&commerce), &refs);
        match &results[0].event {
            DerivedEvent::Commerce(e) => assert_eq!(e.product_action, Some(ProductAction::Purchase)),
            other => panic!("unexpected derived event {other:?}"),
        }
    }
}
