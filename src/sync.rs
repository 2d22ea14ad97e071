//! Core sync orchestration for marketsync.
//!
//! One run walks every enabled entity graph: paginate the remote endpoint,
//! validate and normalize each raw document, and reconcile the resulting
//! record trees into the warehouse. Entity types run concurrently under a
//! semaphore; a fatal error in one entity run never aborts its siblings.

use crate::config::{SyncBehaviorConfig, SyncConfig};
use crate::cursor::PageCursor;
use crate::error::{Error, Result};
use crate::http::{ApiClient, HttpApiClient};
use crate::metrics::Metrics;
use crate::normalize::Normalizer;
use crate::paginator::{PageFetch, Paginator};
use crate::reconcile::{ReconcileAction, Reconciler};
use crate::schema::EntityGraph;
use crate::validate::SchemaValidator;
use crate::warehouse::{PostgresWarehouse, Warehouse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Result of one full sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique id of this run
    pub run_id: Uuid,
    /// Whether every entity run finished without a fatal error
    pub success: bool,
    /// Per-entity results, keyed by entity name
    pub entities: HashMap<String, EntityRunResult>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Timestamp when the run completed
    pub completed_at: String,
    /// Error message if failed
    pub error: Option<String>,
}

impl RunSummary {
    /// Total rows created across all entities.
    pub fn total_created(&self) -> u64 {
        self.entities.values().map(|e| e.records_created).sum()
    }

    /// Total rows updated across all entities.
    pub fn total_updated(&self) -> u64 {
        self.entities.values().map(|e| e.records_updated).sum()
    }

    /// Total records skipped across all entities.
    pub fn total_skipped(&self) -> u64 {
        self.entities.values().map(|e| e.records_skipped).sum()
    }

    /// Total documents rejected across all entities.
    pub fn total_rejected(&self) -> u64 {
        self.entities.values().map(|e| e.documents_rejected).sum()
    }
}

/// Per-entity sync result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRunResult {
    /// Entity name
    pub entity: String,
    /// Whether the run finished without a fatal error
    pub success: bool,
    /// Pages fetched
    pub pages_fetched: u64,
    /// Pages that failed
    pub page_failures: u64,
    /// Raw documents accepted by validation
    pub documents_validated: u64,
    /// Raw documents rejected by validation or normalization
    pub documents_rejected: u64,
    /// Rows created
    pub records_created: u64,
    /// Rows updated
    pub records_updated: u64,
    /// Records whose uniqueness predicate matched multiple rows
    pub duplicates_detected: u64,
    /// Records skipped because the write failed
    pub records_skipped: u64,
    /// Natural keys that matched multiple rows
    pub duplicate_keys: Vec<String>,
    /// Natural keys of rejected documents, where one was extractable
    pub rejected_keys: Vec<String>,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Error message if failed
    pub error: Option<String>,
}

impl EntityRunResult {
    fn failed(entity: &str, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            entity: entity.to_string(),
            success: false,
            duration_ms,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Sync progress callback.
pub type ProgressCallback = Box<dyn Fn(SyncProgress) + Send + Sync>;

/// Sync progress update.
#[derive(Debug, Clone)]
pub struct SyncProgress {
    /// Entity being synced
    pub entity: String,
    /// Current phase
    pub phase: SyncPhase,
    /// Pages fetched so far
    pub pages_fetched: u64,
    /// Records written so far
    pub records_written: u64,
    /// Total items declared by the API, if known
    pub total_items: Option<u64>,
}

/// Sync phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Preparing warehouse tables
    Preparing,
    /// Fetching a page from the API
    Fetching,
    /// Writing records to the warehouse
    Reconciling,
    /// Completed
    Completed,
    /// Failed
    Failed,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Preparing => write!(f, "preparing"),
            SyncPhase::Fetching => write!(f, "fetching"),
            SyncPhase::Reconciling => write!(f, "reconciling"),
            SyncPhase::Completed => write!(f, "completed"),
            SyncPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Main sync engine.
pub struct SyncEngine {
    config: SyncConfig,
    client: Arc<dyn ApiClient>,
    warehouse: Arc<dyn Warehouse>,
    metrics: Arc<Metrics>,
    progress_callback: Option<Arc<ProgressCallback>>,
}

impl SyncEngine {
    /// Create an engine over already-built clients. This is the seam used
    /// by tests and embedders; [`SyncEngine::connect`] builds the stock
    /// HTTP/Postgres pair.
    pub fn new(
        config: SyncConfig,
        client: Arc<dyn ApiClient>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            config,
            client,
            warehouse,
            metrics: Arc::new(Metrics::new()),
            progress_callback: None,
        }
    }

    /// Connect to the remote API and the warehouse.
    #[instrument(skip(config))]
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        info!("Initializing sync engine...");

        let client = HttpApiClient::new(&config.api)?;
        let warehouse = PostgresWarehouse::connect(&config.warehouse, &config.retry).await?;

        Ok(Self::new(config, Arc::new(client), Arc::new(warehouse)))
    }

    /// Set progress callback.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(SyncProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(Box::new(callback)));
        self
    }

    /// The metrics collector shared by all entity runs.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Test connectivity to the warehouse and the remote API.
    pub async fn test_connectivity(&self) -> Result<()> {
        info!("Testing connectivity...");

        self.warehouse.ping().await?;
        info!("Warehouse: OK");

        if let Some(graph) = self.config.enabled_entities().next() {
            let query = vec![(graph.paging.limit_param.clone(), "1".to_string())];
            let response = self
                .client
                .call(graph.request.method, &graph.request.path, &query)
                .await?;
            if response.is_auth_failure() {
                return Err(Error::Auth {
                    path: graph.request.path.clone(),
                    status: response.status,
                });
            }
            info!("API: OK (status {})", response.status);
        }

        Ok(())
    }

    /// Row counts for every table fed by the enabled entity graphs.
    pub async fn table_counts(&self) -> Result<HashMap<String, i64>> {
        let mut counts = HashMap::new();
        for graph in self.config.enabled_entities() {
            for table in graph.tables_in_order() {
                let count = self.warehouse.count(table).await?;
                counts.insert(table.to_string(), count);
            }
        }
        Ok(counts)
    }

    /// Run a full sync across all enabled entity types.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<RunSummary> {
        let start = Instant::now();
        let run_id = Uuid::new_v4();

        let enabled: Vec<EntityGraph> = self.config.enabled_entities().cloned().collect();
        info!(
            run_id = %run_id,
            entities = enabled.len(),
            "Starting sync run"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.sync.max_concurrent_entities));
        let mut tasks = JoinSet::new();

        for graph in enabled {
            let semaphore = Arc::clone(&semaphore);
            let client = Arc::clone(&self.client);
            let warehouse = Arc::clone(&self.warehouse);
            let metrics = Arc::clone(&self.metrics);
            let behavior = self.config.sync.clone();
            let progress = self.progress_callback.clone();

            tasks.spawn(async move {
                // Closed only when the JoinSet is dropped mid-run.
                let _permit = semaphore.acquire_owned().await;
                let name = graph.name.clone();
                let entity_start = Instant::now();
                let result =
                    run_entity(graph, client, warehouse, Arc::clone(&metrics), behavior, progress)
                        .await;
                let duration_ms = entity_start.elapsed().as_millis() as u64;
                (name, result, duration_ms)
            });
        }

        let mut entity_results = HashMap::new();
        let mut overall_success = true;

        while let Some(joined) = tasks.join_next().await {
            let (name, result, duration_ms) = match joined {
                Ok(v) => v,
                Err(e) => {
                    error!("Entity task panicked: {}", e);
                    overall_success = false;
                    continue;
                }
            };

            let entity_result = match result {
                Ok(mut r) => {
                    r.duration_ms = duration_ms;
                    r
                }
                Err(e) => {
                    error!(entity = %name, "Entity run failed: {}", e);
                    overall_success = false;
                    EntityRunResult::failed(&name, e.to_string(), duration_ms)
                }
            };

            self.metrics
                .record_entity_run(entity_result.success, duration_ms);
            if !entity_result.success {
                overall_success = false;
            }
            entity_results.insert(name, entity_result);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let summary = RunSummary {
            run_id,
            success: overall_success,
            entities: entity_results,
            duration_ms,
            completed_at: chrono::Utc::now().to_rfc3339(),
            error: if overall_success {
                None
            } else {
                Some("Some entities failed to sync".into())
            },
        };

        if overall_success {
            info!(
                "Sync run completed in {}ms. Created: {}, updated: {}, skipped: {}",
                duration_ms,
                summary.total_created(),
                summary.total_updated(),
                summary.total_skipped()
            );
        } else {
            warn!(
                "Sync run completed with errors in {}ms. Failed entities: {}",
                duration_ms,
                summary.entities.values().filter(|e| !e.success).count()
            );
        }

        Ok(summary)
    }
}

/// Sync one entity type end to end.
#[instrument(skip_all, fields(entity = %graph.name))]
async fn run_entity(
    graph: EntityGraph,
    client: Arc<dyn ApiClient>,
    warehouse: Arc<dyn Warehouse>,
    metrics: Arc<Metrics>,
    behavior: SyncBehaviorConfig,
    progress: Option<Arc<ProgressCallback>>,
) -> Result<EntityRunResult> {
    let mut result = EntityRunResult {
        entity: graph.name.clone(),
        success: true,
        ..Default::default()
    };

    let report = |phase: SyncPhase, result: &EntityRunResult, total: Option<u64>| {
        if let Some(ref callback) = progress {
            callback(SyncProgress {
                entity: graph.name.clone(),
                phase,
                pages_fetched: result.pages_fetched,
                records_written: result.records_created + result.records_updated,
                total_items: total,
            });
        }
    };

    // Parents before children, so child foreign keys have a referent.
    if behavior.auto_create_tables {
        report(SyncPhase::Preparing, &result, None);
        for table in graph.tables_in_order() {
            let node = graph
                .node(table)
                .ok_or_else(|| Error::schema(format!("table '{}' not declared", table)))?;
            warehouse.ensure_table(node, graph.parent_of(table)).await?;
        }
    }

    let root = graph.root_node()?;
    let validator = SchemaValidator::new(root);
    let normalizer = Normalizer::new(&graph);
    let reconciler = Reconciler::new(&graph, warehouse.as_ref());

    let mut paginator = Paginator::new(client.as_ref(), &graph.request, &graph.paging)
        .rate_limit_backoff(behavior.rate_limit_backoff())
        .max_rate_limit_retries(behavior.max_rate_limit_retries)
        .max_pages(behavior.max_pages);
    let mut cursor = PageCursor::for_style(graph.paging.style, behavior.page_size);

    loop {
        report(SyncPhase::Fetching, &result, cursor.total_count);

        let documents = match paginator.next_page(&mut cursor).await? {
            PageFetch::Page(documents) => {
                metrics.record_page();
                result.pages_fetched += 1;
                documents
            }
            PageFetch::Exhausted => break,
            PageFetch::Failed { status, reason } => {
                metrics.record_page_failure();
                result.page_failures += 1;
                warn!(status, reason = %reason, "Page failed; stopping pagination for entity");
                report(SyncPhase::Failed, &result, cursor.total_count);
                break;
            }
        };

        report(SyncPhase::Reconciling, &result, cursor.total_count);

        for document in &documents {
            if let Err(rejection) = validator.validate(document) {
                metrics.record_document(false);
                result.documents_rejected += 1;
                if let Some(key) = rejection.natural_key {
                    result.rejected_keys.push(key);
                }
                debug!(reason = %rejection.reason, "Document rejected");
                continue;
            }

            let record = match normalizer.normalize(document) {
                Ok(record) => record,
                Err(e) => {
                    // Structurally valid but not normalizable (bad fan-out
                    // lengths, null key component). Rejected, not fatal.
                    metrics.record_document(false);
                    result.documents_rejected += 1;
                    warn!("Document failed normalization: {}", e);
                    continue;
                }
            };
            metrics.record_document(true);
            result.documents_validated += 1;

            for outcome in reconciler.reconcile_tree(&record).await? {
                match outcome.action {
                    ReconcileAction::Created => {
                        metrics.record_created();
                        result.records_created += 1;
                    }
                    ReconcileAction::Updated => {
                        metrics.record_updated();
                        result.records_updated += 1;
                    }
                    ReconcileAction::DuplicateDetected => {
                        metrics.record_duplicate();
                        result.duplicates_detected += 1;
                        result.duplicate_keys.push(outcome.natural_key);
                    }
                    ReconcileAction::Skipped => {
                        metrics.record_skipped();
                        result.records_skipped += 1;
                        warn!(
                            table = %outcome.table,
                            key = %outcome.natural_key,
                            reason = outcome.reason.as_deref().unwrap_or("unknown"),
                            "Record skipped"
                        );
                    }
                }
            }
        }
    }

    metrics.record_rate_limit_waits(paginator.rate_limit_waits());
    report(SyncPhase::Completed, &result, cursor.total_count);

    info!(
        pages = result.pages_fetched,
        created = result.records_created,
        updated = result.records_updated,
        rejected = result.documents_rejected,
        skipped = result.records_skipped,
        "Entity run complete"
    );
    Ok(result)
}
