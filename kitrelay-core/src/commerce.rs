//! Commerce expansion
//!
//! Kits that handle generic events but not commerce events still receive
//! commerce activity, flattened into one generic event per meaningful
//! sub-action: one per product line, one per promotion, one per impressed
//! product. Output order follows the order of the lists on the source event.

use crate::types::{Attributes, CommerceEvent, Event, EventType, Promotion};

/// Attribute carrying the impression list name on expanded impression events.
pub const IMPRESSION_LIST_ATTRIBUTE: &str = "Product Impression List";

/// Attribute carrying the currency code on expanded events.
pub const CURRENCY_ATTRIBUTE: &str = "Currency Code";

/// Flatten a commerce event into generic events.
///
/// Products come first, then promotions, then impressions. Event-level custom
/// attributes are copied into every expanded event; item fields win on key
/// collisions.
pub fn expand(event: &CommerceEvent) -> Vec<Event> {
    let mut base = event.attributes.clone();
    if let Some(currency) = &event.currency {
        base.insert(CURRENCY_ATTRIBUTE.to_string(), currency.clone());
    }

    let mut expanded = Vec::new();

    if let Some(action) = event.product_action {
        let name = item_event_name(action.as_str());
        for product in &event.products {
            let mut attributes = base.clone();
            attributes.extend(product.to_attributes());
            expanded.push(Event::new(name.clone(), EventType::Transaction).with_attributes(attributes));
        }
    }

    if let Some(action) = event.promotion_action {
        let name = item_event_name(action.as_str());
        for promotion in &event.promotions {
            let mut attributes = base.clone();
            attributes.extend(promotion_attributes(promotion));
            expanded.push(Event::new(name.clone(), EventType::Transaction).with_attributes(attributes));
        }
    }

    let impression_name = item_event_name("impression");
    for impression in &event.impressions {
        for product in &impression.products {
            let mut attributes = base.clone();
            attributes.extend(product.to_attributes());
            attributes.insert(
                IMPRESSION_LIST_ATTRIBUTE.to_string(),
                impression.list_name.clone(),
            );
            expanded.push(
                Event::new(impression_name.clone(), EventType::Transaction)
                    .with_attributes(attributes),
            );
        }
    }

    tracing::trace!(
        source = %event.event_name(),
        expanded = expanded.len(),
        "Expanded commerce event"
    );
    expanded
}

fn item_event_name(action: &str) -> String {
    format!("eCommerce - {action} - Item")
}

fn promotion_attributes(promotion: &Promotion) -> Attributes {
    let mut out = Attributes::new();
    out.insert("Id".to_string(), promotion.id.clone());
    if let Some(name) = &promotion.name {
        out.insert("Name".to_string(), name.clone());
    }
    if let Some(creative) = &promotion.creative {
        out.insert("Creative".to_string(), creative.clone());
    }
    if let Some(position) = &promotion.position {
        out.insert("Position".to_string(), position.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Impression, Product, ProductAction, PromotionAction};

    #[test]
    fn test_one_event_per_product_in_order() {
        let event = CommerceEvent::product(ProductAction::Purchase)
            .with_product(Product::new("Shoe", "s-1", 10.0))
            .with_product(Product::new("Hat", "h-1", 5.0).with_quantity(2.0))
            .with_product(Product::new("Sock", "k-1", 1.0))
            .with_attribute("coupon", "SPRING");

        let expanded = expand(&event);
        assert_eq!(expanded.len(), 3);
        let skus: Vec<&str> = expanded
            .iter()
            .map(|e| e.attributes["Id"].as_str())
            .collect();
        assert_eq!(skus, vec!["s-1", "h-1", "k-1"]);
        assert!(expanded
            .iter()
            .all(|e| e.name == "eCommerce - purchase - Item"
                && e.event_type == EventType::Transaction
                && e.attributes["coupon"] == "SPRING"));
        assert_eq!(expanded[1].attributes["Total Product Amount"], "10");
    }

    #[test]
    fn test_promotions_and_impressions() {
        let event = CommerceEvent::promotion(PromotionAction::Click)
            .with_promotion(Promotion {
                id: "promo-1".to_string(),
                name: Some("Spring".to_string()),
                creative: None,
                position: None,
            })
            .with_impression(Impression {
                list_name: "Search Results".to_string(),
                products: vec![Product::new("Shoe", "s-1", 10.0)],
            });

        let expanded = expand(&event);
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].name, "eCommerce - click - Item");
        assert_eq!(expanded[0].attributes["Id"], "promo-1");
        assert_eq!(expanded[1].name, "eCommerce - impression - Item");
        assert_eq!(
            expanded[1].attributes[IMPRESSION_LIST_ATTRIBUTE],
            "Search Results"
        );
    }

    #[test]
    fn test_empty_commerce_event_expands_to_nothing() {
        let event = CommerceEvent::product(ProductAction::Checkout);
        assert!(expand(&event).is_empty());
    }
}
