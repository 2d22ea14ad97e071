//! Structural payload validation for marketsync.
//!
//! A [`SchemaValidator`] checks one raw document against the declared shape
//! of an entity node before normalization: the payload must be a JSON
//! object, required fields must be present, and present fields must be
//! coercible to their declared types. Validation never mutates the document
//! and is never fatal to the run; a rejected document is logged with its
//! natural key, when one can be extracted, and skipped.

use crate::normalize::{FieldValue, RawDocument};
use crate::schema::EntityNode;
use serde_json::Value as JsonValue;
use tracing::warn;

/// Why a document was rejected, with a best-effort identity hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Human-readable reason
    pub reason: String,
    /// Natural key, when enough of the document was usable to build one
    pub natural_key: Option<String>,
}

/// Structural validator for one entity node's declared shape.
pub struct SchemaValidator<'a> {
    node: &'a EntityNode,
}

impl<'a> SchemaValidator<'a> {
    /// Create a validator for one node.
    pub fn new(node: &'a EntityNode) -> Self {
        Self { node }
    }

    /// Accept the document or reject it with a reason.
    pub fn validate(&self, doc: &RawDocument) -> Result<(), Rejection> {
        if !doc.is_object() {
            return Err(self.reject(doc, "payload is not a JSON object"));
        }

        for spec in &self.node.fields {
            let raw = doc.pointer(&spec.pointer());
            match raw {
                Some(value) if !value.is_null() => {
                    if let Err(reason) = FieldValue::coerce(value, &spec.field_type) {
                        return Err(self.reject(
                            doc,
                            format!("field '{}': {}", spec.column, reason),
                        ));
                    }
                }
                _ if spec.required => {
                    return Err(self.reject(
                        doc,
                        format!("required field '{}' is absent", spec.column),
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn reject(&self, doc: &RawDocument, reason: impl Into<String>) -> Rejection {
        let reason = reason.into();
        let natural_key = self.key_hint(doc);
        warn!(
            table = %self.node.table,
            natural_key = natural_key.as_deref().unwrap_or("<unknown>"),
            "Rejected document: {}",
            reason
        );
        Rejection {
            reason,
            natural_key,
        }
    }

    /// Best-effort natural key from whatever key components are present.
    fn key_hint(&self, doc: &RawDocument) -> Option<String> {
        let mut key = self.node.key_template.clone();
        for token in self.node.key_template_tokens() {
            let spec = self.node.get_field(&token)?;
            let raw = doc.pointer(&spec.pointer())?;
            let value = match raw {
                JsonValue::Null => return None,
                other => FieldValue::coerce(other, &spec.field_type).ok()?,
            };
            key = key.replace(&format!("{{{}}}", token), &value.as_key_string());
        }
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityNode, FieldSpec, FieldType};
    use serde_json::json;

    fn node() -> EntityNode {
        EntityNode::new("offers", "{merchant_id}-{offer_id}")
            .field(FieldSpec::new("merchant_id", FieldType::Text).required(true))
            .field(FieldSpec::new("offer_id", FieldType::Text).required(true))
            .field(FieldSpec::new("quantity", FieldType::Integer))
    }

    #[test]
    fn test_accepts_valid_document() {
        let node = node();
        let doc = json!({"merchant_id": "m1", "offer_id": "o1", "quantity": 3});
        assert!(SchemaValidator::new(&node).validate(&doc).is_ok());
    }

    #[test]
    fn test_rejects_missing_required_field() {
        let node = node();
        let doc = json!({"merchant_id": "m1", "quantity": 3});
        let rejection = SchemaValidator::new(&node).validate(&doc).unwrap_err();
        assert!(rejection.reason.contains("offer_id"));
        // Key hint needs both key components.
        assert_eq!(rejection.natural_key, None);
    }

    #[test]
    fn test_rejects_uncoercible_field_with_key_hint() {
        let node = node();
        let doc = json!({"merchant_id": "m1", "offer_id": "o1", "quantity": "lots"});
        let rejection = SchemaValidator::new(&node).validate(&doc).unwrap_err();
        assert!(rejection.reason.contains("quantity"));
        assert_eq!(rejection.natural_key, Some("m1-o1".to_string()));
    }

    #[test]
    fn test_rejects_non_object_payload() {
        let node = node();
        let rejection = SchemaValidator::new(&node)
            .validate(&json!(["not", "an", "object"]))
            .unwrap_err();
        assert!(rejection.reason.contains("not a JSON object"));
    }

    #[test]
    fn test_absent_optional_field_is_fine() {
        let node = node();
        let doc = json!({"merchant_id": "m1", "offer_id": "o1"});
        assert!(SchemaValidator::new(&node).validate(&doc).is_ok());
    }

    #[test]
    fn test_validation_does_not_mutate() {
        let node = node();
        let doc = json!({"merchant_id": "m1", "offer_id": "o1", "quantity": 3});
        let before = doc.clone();
        let _ = SchemaValidator::new(&node).validate(&doc);
        assert_eq!(doc, before);
    }
}
