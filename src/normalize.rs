//! Nested-document normalization for marketsync.
//!
//! The [`Normalizer`] decomposes one validated raw document into an ordered
//! tree of [`NormalizedRecord`]s, one per target table: the top-level record
//! gets a deterministic natural key composed from its own fields, every child
//! record carries a parent reference back to that key, and parallel-array
//! attributes fan out into one sibling record per index. Monetary and
//! quantity fields are coerced into fixed-point decimals, never floats.

use crate::error::{Error, Result};
use crate::schema::{ChildSource, EntityGraph, EntityNode, FieldSpec, FieldType};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// The as-fetched nested JSON object for one remote entity.
pub type RawDocument = JsonValue;

/// A typed cell value bound for one warehouse column.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// SQL NULL
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Integer(i64),
    /// Fixed-point decimal (money, quantities)
    Decimal(BigDecimal),
    /// Text
    Text(String),
    /// Timestamp
    Timestamp(DateTime<Utc>),
    /// JSON document column
    Json(JsonValue),
}

impl FieldValue {
    /// Coerce a raw JSON value into the declared type.
    pub fn coerce(raw: &JsonValue, field_type: &FieldType) -> std::result::Result<Self, String> {
        if raw.is_null() {
            return Ok(FieldValue::Null);
        }
        match field_type {
            FieldType::Boolean => match raw {
                JsonValue::Bool(b) => Ok(FieldValue::Bool(*b)),
                JsonValue::String(s) => match s.as_str() {
                    "true" | "TRUE" | "1" => Ok(FieldValue::Bool(true)),
                    "false" | "FALSE" | "0" => Ok(FieldValue::Bool(false)),
                    _ => Err(format!("'{}' is not a boolean", s)),
                },
                other => Err(format!("{} is not a boolean", other)),
            },
            FieldType::Integer | FieldType::BigInt => match raw {
                JsonValue::Number(n) => n
                    .as_i64()
                    .map(FieldValue::Integer)
                    .ok_or_else(|| format!("{} is not an integer", n)),
                JsonValue::String(s) => s
                    .parse::<i64>()
                    .map(FieldValue::Integer)
                    .map_err(|_| format!("'{}' is not an integer", s)),
                other => Err(format!("{} is not an integer", other)),
            },
            FieldType::Decimal { .. } => match raw {
                // serde_json keeps the literal digits, so going through the
                // string form avoids any float round-trip.
                JsonValue::Number(n) => BigDecimal::from_str(&n.to_string())
                    .map(FieldValue::Decimal)
                    .map_err(|_| format!("{} is not a decimal", n)),
                JsonValue::String(s) => BigDecimal::from_str(s.trim())
                    .map(FieldValue::Decimal)
                    .map_err(|_| format!("'{}' is not a decimal", s)),
                other => Err(format!("{} is not a decimal", other)),
            },
            FieldType::Text => match raw {
                JsonValue::String(s) => Ok(FieldValue::Text(s.clone())),
                JsonValue::Number(n) => Ok(FieldValue::Text(n.to_string())),
                JsonValue::Bool(b) => Ok(FieldValue::Text(b.to_string())),
                other => Err(format!("{} is not text", other)),
            },
            FieldType::Timestamp => match raw {
                JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
                    .map(|dt| FieldValue::Timestamp(dt.with_timezone(&Utc)))
                    .map_err(|e| format!("'{}' is not an RFC 3339 timestamp: {}", s, e)),
                other => Err(format!("{} is not a timestamp", other)),
            },
            FieldType::Json => Ok(FieldValue::Json(raw.clone())),
        }
    }

    /// Typed zero/empty default for a non-nullable column with no declared
    /// default.
    pub fn type_default(field_type: &FieldType) -> Self {
        match field_type {
            FieldType::Boolean => FieldValue::Bool(false),
            FieldType::Integer | FieldType::BigInt => FieldValue::Integer(0),
            FieldType::Decimal { .. } => FieldValue::Decimal(BigDecimal::from(0)),
            FieldType::Text => FieldValue::Text(String::new()),
            FieldType::Timestamp => FieldValue::Timestamp(DateTime::<Utc>::UNIX_EPOCH),
            FieldType::Json => FieldValue::Json(JsonValue::Null),
        }
    }

    /// Canonical string form used in natural key templates.
    pub fn as_key_string(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Integer(n) => n.to_string(),
            FieldValue::Decimal(d) => d.normalized().to_string(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::Timestamp(t) => t.to_rfc3339(),
            FieldValue::Json(v) => v.to_string(),
        }
    }

    /// Whether this cell is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_key_string())
    }
}

/// Link from a child record back to its reconciled parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    /// Parent table
    pub table: String,
    /// Parent natural key
    pub natural_key: String,
}

/// One flat record bound for one warehouse table, with its child records.
///
/// `natural_key` is unique within `table`; children always reference a table
/// reconciled earlier in the same depth-first walk.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    /// Target table
    pub table: String,
    /// Deterministic natural key
    pub natural_key: String,
    /// Parent link, absent on the root record
    pub parent: Option<ParentRef>,
    /// Column values in declaration order
    pub attributes: IndexMap<String, FieldValue>,
    /// Child records in declared reconcile order
    pub children: Vec<NormalizedRecord>,
}

impl NormalizedRecord {
    /// Records of the tree in reconcile order (depth-first, parents first).
    pub fn walk(&self) -> Vec<&NormalizedRecord> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }

    /// Total records in the tree.
    pub fn record_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.record_count()).sum::<usize>()
    }
}

/// Turns one raw document into a [`NormalizedRecord`] tree per the declared
/// entity graph.
pub struct Normalizer<'a> {
    graph: &'a EntityGraph,
}

impl<'a> Normalizer<'a> {
    /// Create a normalizer over one entity graph.
    pub fn new(graph: &'a EntityGraph) -> Self {
        Self { graph }
    }

    /// Normalize one document, starting at the graph's root node.
    ///
    /// Re-normalizing the same document yields identical natural keys for the
    /// parent and every child, in the same order.
    pub fn normalize(&self, doc: &RawDocument) -> Result<NormalizedRecord> {
        let root = self.graph.root_node()?;
        self.build(root, doc, None, None)
    }

    fn build(
        &self,
        node: &EntityNode,
        scope: &JsonValue,
        parent: Option<&ParentRef>,
        index: Option<usize>,
    ) -> Result<NormalizedRecord> {
        let attributes = self.extract_attributes(node, scope)?;
        let natural_key = render_key(node, &attributes, parent, index)?;

        let self_ref = ParentRef {
            table: node.table.clone(),
            natural_key: natural_key.clone(),
        };

        let mut children = Vec::new();
        for child_spec in &node.children {
            let child_node = self.graph.node(&child_spec.table).ok_or_else(|| {
                Error::normalize(&node.table, format!("undeclared child '{}'", child_spec.table))
            })?;

            match &child_spec.source {
                ChildSource::Collection { path } => {
                    match scope.pointer(path) {
                        Some(JsonValue::Array(elements)) => {
                            for (i, element) in elements.iter().enumerate() {
                                children.push(self.build(
                                    child_node,
                                    element,
                                    Some(&self_ref),
                                    Some(i),
                                )?);
                            }
                        }
                        Some(JsonValue::Null) | None => {}
                        Some(other) => {
                            return Err(Error::normalize(
                                &child_node.table,
                                format!("'{}' is not an array ({})", path, json_kind(other)),
                            ));
                        }
                    }
                }
                ChildSource::Object { path } => match scope.pointer(path) {
                    Some(element @ JsonValue::Object(_)) => {
                        children.push(self.build(child_node, element, Some(&self_ref), None)?);
                    }
                    Some(JsonValue::Null) | None => {}
                    Some(other) => {
                        return Err(Error::normalize(
                            &child_node.table,
                            format!("'{}' is not an object ({})", path, json_kind(other)),
                        ));
                    }
                },
                ChildSource::Zip { arrays } => {
                    children.extend(self.fan_out(child_node, scope, arrays, &self_ref)?);
                }
            }
        }

        Ok(NormalizedRecord {
            table: node.table.clone(),
            natural_key,
            parent: parent.cloned(),
            attributes,
            children,
        })
    }

    /// Fan out parallel arrays into one sibling record per index.
    fn fan_out(
        &self,
        node: &EntityNode,
        scope: &JsonValue,
        arrays: &IndexMap<String, String>,
        parent: &ParentRef,
    ) -> Result<Vec<NormalizedRecord>> {
        let mut resolved: Vec<(&str, &[JsonValue])> = Vec::with_capacity(arrays.len());
        for (alias, path) in arrays {
            match scope.pointer(path) {
                Some(JsonValue::Array(elements)) => resolved.push((alias.as_str(), elements)),
                Some(JsonValue::Null) | None => resolved.push((alias.as_str(), &[])),
                Some(other) => {
                    return Err(Error::normalize(
                        &node.table,
                        format!("'{}' is not an array ({})", path, json_kind(other)),
                    ));
                }
            }
        }

        let len = resolved.first().map(|(_, a)| a.len()).unwrap_or(0);
        if resolved.iter().any(|(_, a)| a.len() != len) {
            return Err(Error::normalize(
                &node.table,
                format!(
                    "parallel arrays have unequal lengths: {}",
                    resolved
                        .iter()
                        .map(|(alias, a)| format!("{}={}", alias, a.len()))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            ));
        }

        let mut records = Vec::with_capacity(len);
        for i in 0..len {
            let mut synthetic = serde_json::Map::new();
            for (alias, elements) in &resolved {
                synthetic.insert(alias.to_string(), elements[i].clone());
            }
            records.push(self.build(
                node,
                &JsonValue::Object(synthetic),
                Some(parent),
                Some(i),
            )?);
        }
        Ok(records)
    }

    fn extract_attributes(
        &self,
        node: &EntityNode,
        scope: &JsonValue,
    ) -> Result<IndexMap<String, FieldValue>> {
        let mut attributes = IndexMap::with_capacity(node.fields.len());
        for spec in &node.fields {
            let value = extract_field(node, spec, scope)?;
            attributes.insert(spec.column.clone(), value);
        }
        Ok(attributes)
    }
}

fn extract_field(node: &EntityNode, spec: &FieldSpec, scope: &JsonValue) -> Result<FieldValue> {
    match scope.pointer(&spec.pointer()) {
        Some(raw) if !raw.is_null() => FieldValue::coerce(raw, &spec.field_type)
            .map_err(|reason| Error::normalize(&node.table, format!("field '{}': {}", spec.column, reason))),
        _ => {
            if spec.required {
                return Err(Error::normalize(
                    &node.table,
                    format!("required field '{}' is absent", spec.column),
                ));
            }
            if spec.nullable {
                // Absence is preserved for nullable columns.
                return Ok(FieldValue::Null);
            }
            match &spec.default {
                Some(default) => FieldValue::coerce(default, &spec.field_type).map_err(|reason| {
                    Error::normalize(
                        &node.table,
                        format!("default for '{}': {}", spec.column, reason),
                    )
                }),
                None => Ok(FieldValue::type_default(&spec.field_type)),
            }
        }
    }
}

/// Render a natural key template against extracted attributes.
///
/// Tokens are column names plus `{parent.key}` and `{index}` for child
/// records.
pub fn render_key(
    node: &EntityNode,
    attributes: &IndexMap<String, FieldValue>,
    parent: Option<&ParentRef>,
    index: Option<usize>,
) -> Result<String> {
    let mut key = node.key_template.clone();
    for token in node.key_template_tokens() {
        let replacement = match token.as_str() {
            "parent.key" => parent
                .map(|p| p.natural_key.clone())
                .ok_or_else(|| {
                    Error::normalize(&node.table, "key template uses {parent.key} on a root record")
                })?,
            "index" => index
                .map(|i| i.to_string())
                .ok_or_else(|| {
                    Error::normalize(&node.table, "key template uses {index} outside a collection")
                })?,
            column => {
                let value = attributes.get(column).ok_or_else(|| {
                    Error::normalize(
                        &node.table,
                        format!("key template references unknown column '{}'", column),
                    )
                })?;
                if value.is_null() {
                    return Err(Error::normalize(
                        &node.table,
                        format!("key component '{}' is null", column),
                    ));
                }
                value.as_key_string()
            }
        };
        key = key.replace(&format!("{{{}}}", token), &replacement);
    }
    Ok(key)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
