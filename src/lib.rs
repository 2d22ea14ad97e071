//! # Marketsync
//!
//! A Rust engine for syncing marketplace API data into a relational warehouse.
//!
//! ## Features
//!
//! - **Pagination**: Offset and continuation-token endpoints, with fixed
//!   backoff on rate limiting (429)
//! - **Validation**: Raw documents are checked against the declared shape
//!   before any write; bad documents are rejected, never partially written
//! - **Normalization**: Deeply nested documents flatten into foreign-key
//!   linked record trees with deterministic natural keys
//! - **Idempotent reconciliation**: Re-running a sync updates rows in place
//!   instead of duplicating them
//! - **Concurrency**: Entity types sync in parallel under a bounded semaphore
//! - **Progress tracking**: Real-time progress updates via callbacks
//! - **Metrics**: Built-in metrics for observability
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use marketsync::{SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::from_file("marketsync.toml")?;
//!
//!     let engine = SyncEngine::connect(config).await?;
//!     let summary = engine.run().await?;
//!
//!     println!("Created {} records", summary.total_created());
//!     Ok(())
//! }
//! ```
//!
//! ## Declaring entities
//!
//! Each remote entity type is declared as an [`schema::EntityGraph`]: which
//! warehouse tables it feeds, how natural keys are composed, and how nested
//! collections fan out into child tables:
//!
//! ```rust
//! use marketsync::schema::{ChildSource, EntityNode, FieldSpec, FieldType};
//!
//! let offers = EntityNode::new("offers", "{merchant_id}-{offer_id}")
//!     .field(FieldSpec::new("merchant_id", FieldType::Text).required(true).immutable())
//!     .field(FieldSpec::new("offer_id", FieldType::Text).required(true).immutable())
//!     .field(FieldSpec::new("/price/amount", FieldType::Decimal { precision: 18, scale: 4 }))
//!     .child("offer_outlets", ChildSource::Collection { path: "/outlets".into() });
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod cursor;
pub mod error;
pub mod http;
pub mod metrics;
pub mod normalize;
pub mod paginator;
pub mod reconcile;
pub mod schema;
pub mod sync;
pub mod validate;
pub mod warehouse;

// Re-exports for convenience
pub use config::{ApiConfig, SyncConfig, SyncConfigBuilder, WarehouseConfig};
pub use cursor::{PageCursor, PagingConfig, PagingStyle};
pub use error::{Error, Result};
pub use http::{ApiClient, HttpApiClient, RequestTemplate};
pub use normalize::{FieldValue, NormalizedRecord, Normalizer};
pub use paginator::{PageFetch, Paginator};
pub use reconcile::{ReconcileAction, ReconcileOutcome, Reconciler};
pub use schema::{EntityGraph, EntityNode, FieldSpec, FieldType};
pub use sync::{EntityRunResult, RunSummary, SyncEngine, SyncProgress};
pub use warehouse::{MemoryWarehouse, PostgresWarehouse, Warehouse};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
