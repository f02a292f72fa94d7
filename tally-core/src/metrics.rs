//! Metrics collection for observability
//!
//! Every ledger owns its own Prometheus registry, so several ledgers (or
//! tests) can live in one process.
//!
//! # Metrics
//!
//! - `tally_operations_total{operation,outcome}` - Mutations by result
//! - `tally_conflict_retries_total` - Units re-run after a store conflict
//! - `tally_operation_duration_seconds{operation}` - Latency including retries
//! - `tally_ids_generated_total` - Identifiers handed out

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct LedgerMetrics {
    /// Mutations by operation and outcome
    pub operations: IntCounterVec,

    /// Conflict retries
    pub retries: IntCounter,

    /// Operation latency
    pub duration: HistogramVec,

    /// Identifiers generated
    pub ids_generated: IntCounter,

    registry: Arc<Registry>,
}

impl LedgerMetrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let operations = IntCounterVec::new(
            Opts::new("tally_operations_total", "Ledger mutations by outcome"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(operations.clone()))?;

        let retries = IntCounter::new(
            "tally_conflict_retries_total",
            "Units re-run after a store conflict",
        )?;
        registry.register(Box::new(retries.clone()))?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "tally_operation_duration_seconds",
                "Ledger operation latency including retries",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
            &["operation"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        let ids_generated =
            IntCounter::new("tally_ids_generated_total", "Identifiers handed out")?;
        registry.register(Box::new(ids_generated.clone()))?;

        Ok(Self {
            operations,
            retries,
            duration,
            ids_generated,
            registry,
        })
    }

    /// Record the outcome of a mutation
    pub fn record_outcome(&self, operation: &str, outcome: &str) {
        self.operations
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Record operation latency
    pub fn record_duration(&self, operation: &str, duration_seconds: f64) {
        self.duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    /// Count of a given operation/outcome pair
    pub fn outcome_count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations
            .with_label_values(&[operation, outcome])
            .get()
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render in the Prometheus text exposition format
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for LedgerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerMetrics")
            .field("retries", &self.retries.get())
            .field("ids_generated", &self.ids_generated.get())
            .finish()
    }
}
