//! Entity shape declarations and DDL generation for marketsync.
//!
//! An [`EntityGraph`] is the static, per-integration declaration of how one
//! remote entity type maps onto warehouse tables: which fields each table
//! carries, how natural keys are composed, and which child tables a parent
//! document fans out into (and in what order they must be written).

use crate::cursor::PagingConfig;
use crate::error::{Error, Result};
use crate::http::RequestTemplate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Column types the engine can coerce remote values into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Boolean
    Boolean,
    /// Integer (4 bytes)
    Integer,
    /// Big integer (8 bytes)
    BigInt,
    /// Decimal/Numeric with precision and scale.
    ///
    /// Monetary and quantity fields must use this, never a float, so repeated
    /// re-ingestion of the same document cannot drift.
    Decimal {
        /// Precision (total digits)
        precision: u8,
        /// Scale (digits after decimal)
        scale: u8,
    },
    /// Text (unlimited length)
    Text,
    /// Timestamp with timezone
    Timestamp,
    /// JSON
    Json,
}

impl FieldType {
    /// Convert to Postgres type string.
    pub fn to_postgres(&self) -> String {
        match self {
            FieldType::Boolean => "BOOLEAN".to_string(),
            FieldType::Integer => "INTEGER".to_string(),
            FieldType::BigInt => "BIGINT".to_string(),
            FieldType::Decimal { precision, scale } => {
                format!("NUMERIC({}, {})", precision, scale)
            }
            FieldType::Text => "TEXT".to_string(),
            FieldType::Timestamp => "TIMESTAMPTZ".to_string(),
            FieldType::Json => "JSONB".to_string(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_postgres())
    }
}

/// Declared mapping from one remote field to one warehouse column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawFieldSpec")]
pub struct FieldSpec {
    /// Location in the raw document: a JSON pointer ("/price/amount") or a
    /// bare top-level field name ("offer_id").
    pub source: String,

    /// Target column name. Defaults to the source name when not declared.
    pub column: String,

    /// Declared column type.
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Validation rejects documents missing this field.
    #[serde(default)]
    pub required: bool,

    /// Whether the target column accepts NULL. Non-nullable columns get a
    /// typed default when the remote field is absent.
    #[serde(default = "default_true")]
    pub nullable: bool,

    /// Default applied when the field is absent and the column is non-nullable.
    #[serde(default)]
    pub default: Option<serde_json::Value>,

    /// Whether the reconciler may overwrite this column on update. Identity
    /// and creation fields are declared immutable.
    #[serde(default = "default_true")]
    pub mutable: bool,
}

/// Declaration-file shape of [`FieldSpec`]; the column name is optional and
/// falls back to the source name.
#[derive(Deserialize)]
struct RawFieldSpec {
    source: String,
    #[serde(default)]
    column: Option<String>,
    #[serde(rename = "type")]
    field_type: FieldType,
    #[serde(default)]
    required: bool,
    #[serde(default = "default_true")]
    nullable: bool,
    #[serde(default)]
    default: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    mutable: bool,
}

impl From<RawFieldSpec> for FieldSpec {
    fn from(raw: RawFieldSpec) -> Self {
        let column = raw
            .column
            .unwrap_or_else(|| column_from_source(&raw.source));
        Self {
            source: raw.source,
            column,
            field_type: raw.field_type,
            required: raw.required,
            nullable: raw.nullable,
            default: raw.default,
            mutable: raw.mutable,
        }
    }
}

fn column_from_source(source: &str) -> String {
    source.trim_start_matches('/').replace('/', "_")
}

impl FieldSpec {
    /// Create a field spec with the column named after the source field.
    pub fn new(source: impl Into<String>, field_type: FieldType) -> Self {
        let source = source.into();
        let column = column_from_source(&source);
        Self {
            source,
            column,
            field_type,
            required: false,
            nullable: true,
            default: None,
            mutable: true,
        }
    }

    /// Set the target column name.
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Mark the field as required for validation.
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Set target column nullability.
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set the absent-value default.
    pub fn default_value(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Mark the field as immutable across updates.
    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// The source location as a JSON pointer.
    pub fn pointer(&self) -> String {
        if self.source.starts_with('/') {
            self.source.clone()
        } else {
            format!("/{}", self.source)
        }
    }
}

/// Where a child table's records come from inside the parent document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ChildSource {
    /// A nested array: one child record per element.
    Collection {
        /// JSON pointer to the array
        path: String,
    },
    /// A single nested object: one child record when present.
    Object {
        /// JSON pointer to the object
        path: String,
    },
    /// Parallel arrays of equal length fanned out by index: one sibling child
    /// record per index, each seeing `{alias: array[alias][i]}`.
    Zip {
        /// alias -> JSON pointer to each source array
        arrays: indexmap::IndexMap<String, String>,
    },
}

/// Declared child table under a parent node, in reconcile order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSpec {
    /// Target table of the child; must name a declared [`EntityNode`].
    pub table: String,
    /// Where the child's records come from.
    pub source: ChildSource,
}

/// Declaration of one warehouse table fed by one level of the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityNode {
    /// Target table name.
    pub table: String,

    /// Natural key template, e.g. `"{merchant_id}-{offer_id}"`. Tokens are
    /// column names; child templates may also use `{parent.key}` and
    /// `{index}`.
    pub key_template: String,

    /// Uniqueness tuple for tables without a single unique natural key
    /// (lookup falls back to the `natural_key` column when unset).
    #[serde(default)]
    pub key_columns: Option<Vec<String>>,

    /// Declared field mappings.
    pub fields: Vec<FieldSpec>,

    /// Child tables in reconcile order.
    #[serde(default)]
    pub children: Vec<ChildSpec>,
}

impl EntityNode {
    /// Create a node with no fields or children.
    pub fn new(table: impl Into<String>, key_template: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_template: key_template.into(),
            key_columns: None,
            fields: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Add a field mapping.
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    /// Add a child table.
    pub fn child(mut self, table: impl Into<String>, source: ChildSource) -> Self {
        self.children.push(ChildSpec {
            table: table.into(),
            source,
        });
        self
    }

    /// Get a field spec by column name.
    pub fn get_field(&self, column: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.column == column)
    }

    /// Column names the reconciler may overwrite on update.
    pub fn mutable_columns(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.mutable)
            .map(|f| f.column.as_str())
            .collect()
    }

    /// Tokens referenced by the key template, e.g. `["merchant_id", "offer_id"]`.
    pub fn key_template_tokens(&self) -> Vec<String> {
        template_tokens(&self.key_template)
    }

    /// Generate CREATE TABLE DDL for Postgres.
    ///
    /// Every table carries a unique `natural_key`, a `last_synced_at`
    /// write timestamp, and, for child tables, a `parent_key` foreign key
    /// with cascading delete back to the parent's natural key.
    pub fn to_postgres_ddl(&self, parent_table: Option<&str>) -> String {
        let mut cols = vec![
            "    natural_key TEXT NOT NULL UNIQUE".to_string(),
        ];

        if let Some(parent) = parent_table {
            cols.push(format!(
                "    parent_key TEXT REFERENCES {} (natural_key) ON DELETE CASCADE ON UPDATE CASCADE",
                parent
            ));
        }

        for f in &self.fields {
            let null_ddl = if f.nullable { "" } else { " NOT NULL" };
            cols.push(format!(
                "    {} {}{}",
                f.column,
                f.field_type.to_postgres(),
                null_ddl
            ));
        }

        cols.push("    last_synced_at TIMESTAMPTZ NOT NULL DEFAULT now()".to_string());

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
            self.table,
            cols.join(",\n")
        )
    }
}

/// The static per-integration declaration for one entity type: request
/// template, paging style, and the table forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityGraph {
    /// Entity type name, e.g. "offers" or "orders".
    pub name: String,

    /// Enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Remote list endpoint to paginate.
    pub request: RequestTemplate,

    /// Paging style and envelope layout of the remote API.
    #[serde(default)]
    pub paging: PagingConfig,

    /// Table of the top-level record.
    pub root: String,

    /// All declared nodes (root plus children), parents before children.
    pub nodes: Vec<EntityNode>,
}

impl EntityGraph {
    /// Look up a node by table name.
    pub fn node(&self, table: &str) -> Option<&EntityNode> {
        self.nodes.iter().find(|n| n.table == table)
    }

    /// The root node.
    pub fn root_node(&self) -> Result<&EntityNode> {
        self.node(&self.root)
            .ok_or_else(|| Error::schema(format!("root table '{}' not declared", self.root)))
    }

    /// Parent table of a node, if it is declared as someone's child.
    pub fn parent_of(&self, table: &str) -> Option<&str> {
        self.nodes.iter().find_map(|n| {
            n.children
                .iter()
                .any(|c| c.table == table)
                .then_some(n.table.as_str())
        })
    }

    /// Tables in reconcile order: depth-first from the root, parents first.
    pub fn tables_in_order(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.as_str()];
        while let Some(table) = stack.pop() {
            out.push(table);
            if let Some(node) = self.node(table) {
                for child in node.children.iter().rev() {
                    stack.push(child.table.as_str());
                }
            }
        }
        out
    }

    /// Validate the declaration at configuration-load time.
    ///
    /// Checked here, once, instead of at every record: the root is declared,
    /// child references resolve and form a DAG, key templates only reference
    /// declared columns, and uniqueness tuples name declared columns.
    pub fn validate(&self) -> Result<()> {
        self.root_node()?;

        let declared: HashSet<&str> = self.nodes.iter().map(|n| n.table.as_str()).collect();
        if declared.len() != self.nodes.len() {
            return Err(Error::schema(format!(
                "entity '{}' declares a table more than once",
                self.name
            )));
        }

        for node in &self.nodes {
            for child in &node.children {
                if !declared.contains(child.table.as_str()) {
                    return Err(Error::schema(format!(
                        "entity '{}': child table '{}' of '{}' is not declared",
                        self.name, child.table, node.table
                    )));
                }
            }

            let columns: HashSet<&str> = node.fields.iter().map(|f| f.column.as_str()).collect();
            for token in node.key_template_tokens() {
                if token == "parent.key" || token == "index" {
                    continue;
                }
                if !columns.contains(token.as_str()) {
                    return Err(Error::schema(format!(
                        "entity '{}': key template of '{}' references undeclared column '{}'",
                        self.name, node.table, token
                    )));
                }
            }

            if let Some(ref key_cols) = node.key_columns {
                for col in key_cols {
                    if !columns.contains(col.as_str()) {
                        return Err(Error::schema(format!(
                            "entity '{}': uniqueness tuple of '{}' names undeclared column '{}'",
                            self.name, node.table, col
                        )));
                    }
                }
            }
        }

        // Cycle check over child references, walking from the root.
        let mut visiting: Vec<&str> = Vec::new();
        self.check_cycle(&self.root, &mut visiting)?;

        Ok(())
    }

    fn check_cycle<'a>(&'a self, table: &'a str, visiting: &mut Vec<&'a str>) -> Result<()> {
        if visiting.contains(&table) {
            return Err(Error::schema(format!(
                "entity '{}': cycle through table '{}'",
                self.name, table
            )));
        }
        visiting.push(table);
        if let Some(node) = self.node(table) {
            for child in &node.children {
                self.check_cycle(&child.table, visiting)?;
            }
        }
        visiting.pop();
        Ok(())
    }
}

/// Extract `{token}` names from a key template.
pub(crate) fn template_tokens(template: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        tokens.push(rest[open + 1..open + close].to_string());
        rest = &rest[open + close + 1..];
    }
    tokens
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;
    use indexmap::IndexMap;

    fn offer_graph() -> EntityGraph {
        EntityGraph {
            name: "offers".into(),
            enabled: true,
            request: RequestTemplate::new(HttpMethod::Get, "/v1/offers"),
            paging: PagingConfig::default(),
            root: "offers".into(),
            nodes: vec![
                EntityNode::new("offers", "{merchant_id}-{offer_id}")
                    .field(FieldSpec::new("merchant_id", FieldType::Text).required(true))
                    .field(FieldSpec::new("offer_id", FieldType::Text).required(true))
                    .child(
                        "offer_outlets",
                        ChildSource::Collection {
                            path: "/outlets".into(),
                        },
                    ),
                EntityNode::new("offer_outlets", "{parent.key}-{outlet_id}")
                    .field(FieldSpec::new("outlet_id", FieldType::Text).required(true)),
            ],
        }
    }

    #[test]
    fn test_template_tokens() {
        assert_eq!(
            template_tokens("{merchant_id}-{offer_id}"),
            vec!["merchant_id", "offer_id"]
        );
        assert_eq!(template_tokens("{parent.key}:{index}"), vec!["parent.key", "index"]);
        assert!(template_tokens("no tokens").is_empty());
    }

    #[test]
    fn test_graph_validates() {
        offer_graph().validate().unwrap();
    }

    #[test]
    fn test_graph_rejects_undeclared_child() {
        let mut graph = offer_graph();
        graph.nodes[0].children.push(ChildSpec {
            table: "missing".into(),
            source: ChildSource::Object { path: "/x".into() },
        });
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_graph_rejects_unknown_key_token() {
        let mut graph = offer_graph();
        graph.nodes[0].key_template = "{merchant_id}-{nope}".into();
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_graph_rejects_cycle() {
        let mut graph = offer_graph();
        graph.nodes[1].children.push(ChildSpec {
            table: "offers".into(),
            source: ChildSource::Object { path: "/x".into() },
        });
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_graph_rejects_bad_uniqueness_tuple() {
        let mut graph = offer_graph();
        graph.nodes[0].key_columns = Some(vec!["merchant_id".into(), "extraction_date".into()]);
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_tables_in_order_parents_first() {
        let graph = offer_graph();
        assert_eq!(graph.tables_in_order(), vec!["offers", "offer_outlets"]);
        assert_eq!(graph.parent_of("offer_outlets"), Some("offers"));
        assert_eq!(graph.parent_of("offers"), None);
    }

    #[test]
    fn test_root_ddl() {
        let graph = offer_graph();
        let ddl = graph.nodes[0].to_postgres_ddl(None);
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS offers"));
        assert!(ddl.contains("natural_key TEXT NOT NULL UNIQUE"));
        assert!(ddl.contains("last_synced_at TIMESTAMPTZ NOT NULL DEFAULT now()"));
        assert!(!ddl.contains("parent_key"));
    }

    #[test]
    fn test_child_ddl_has_cascading_fk() {
        let graph = offer_graph();
        let ddl = graph.nodes[1].to_postgres_ddl(Some("offers"));
        assert!(ddl.contains("parent_key TEXT REFERENCES offers (natural_key) ON DELETE CASCADE"));
    }

    #[test]
    fn test_decimal_ddl() {
        let spec = FieldSpec::new("unit_price", FieldType::Decimal {
            precision: 18,
            scale: 4,
        })
        .nullable(false);
        let node = EntityNode::new("t", "{unit_price}").field(spec);
        let ddl = node.to_postgres_ddl(None);
        assert!(ddl.contains("unit_price NUMERIC(18, 4) NOT NULL"));
    }

    #[test]
    fn test_zip_source_roundtrip() {
        let mut arrays = IndexMap::new();
        arrays.insert("quality".to_string(), "/qualities".to_string());
        arrays.insert("quantity".to_string(), "/quantities".to_string());
        let src = ChildSource::Zip { arrays };
        let json = serde_json::to_string(&src).unwrap();
        assert!(json.contains("\"kind\":\"zip\""));
        let back: ChildSource = serde_json::from_str(&json).unwrap();
        match back {
            ChildSource::Zip { arrays } => assert_eq!(arrays.len(), 2),
            _ => panic!("expected zip"),
        }
    }

    #[test]
    fn test_field_spec_column_defaults_from_source() {
        let spec: FieldSpec =
            serde_json::from_str(r#"{"source": "/price/amount", "type": "text"}"#).unwrap();
        assert_eq!(spec.column, "price_amount");
        assert!(spec.mutable);
        assert!(spec.nullable);

        let spec: FieldSpec = serde_json::from_str(
            r#"{"source": "/price/amount", "column": "unit_price", "type": "text"}"#,
        )
        .unwrap();
        assert_eq!(spec.column, "unit_price");
    }

    #[test]
    fn test_field_spec_pointer() {
        assert_eq!(FieldSpec::new("offer_id", FieldType::Text).pointer(), "/offer_id");
        assert_eq!(
            FieldSpec::new("/price/amount", FieldType::Text).pointer(),
            "/price/amount"
        );
    }
}
