/*!
Logging and metrics setup.

- Structured logging through `tracing-subscriber`, plain or JSON
- Prometheus counters for rows moved through the transfer engine (feature
  `metrics`)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{DumpError, Result};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVE: &str = "tabledump=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<DumpMetrics>> = OnceLock::new();

/// Counters for the archive engine
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct DumpMetrics {
    pub rows_dumped_total: Counter,
    pub rows_restored_total: Counter,
    pub rows_rejected_total: Counter,
    pub batch_fallbacks_total: Counter,
    pub table_seconds: Histogram,
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl DumpMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::new(name, help)
                .map_err(|e| DumpError::config(format!("Failed to create {name} metric: {e}")))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| DumpError::config(format!("Failed to register {name}: {e}")))?;
            Ok(counter)
        };

        let rows_dumped_total = counter("tabledump_rows_dumped_total", "Rows written into archives")?;
        let rows_restored_total =
            counter("tabledump_rows_restored_total", "Rows inserted from archives")?;
        let rows_rejected_total = counter(
            "tabledump_rows_rejected_total",
            "Rows that failed even when inserted on their own",
        )?;
        let batch_fallbacks_total = counter(
            "tabledump_batch_fallbacks_total",
            "Insert batches retried row by row",
        )?;

        let table_seconds = Histogram::with_opts(HistogramOpts::new(
            "tabledump_table_seconds",
            "Time spent dumping or restoring one table",
        ))
        .map_err(|e| DumpError::config(format!("Failed to create table_seconds metric: {e}")))?;
        registry
            .register(Box::new(table_seconds.clone()))
            .map_err(|e| DumpError::config(format!("Failed to register table_seconds: {e}")))?;

        Ok(Self {
            rows_dumped_total,
            rows_restored_total,
            rows_rejected_total,
            batch_fallbacks_total,
            table_seconds,
            registry,
        })
    }

    /// Process-wide metrics, or `None` if registration failed
    pub fn global() -> Option<&'static DumpMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    /// Render every metric in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| DumpError::config(format!("Failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| DumpError::config(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over [`DEFAULT_DIRECTIVE`]. With `json` every event is one
/// JSON object per line.
pub fn init_observability(json: bool) -> Result<()> {
    init_observability_with(json, DEFAULT_DIRECTIVE)
}

/// [`init_observability`] with a different fallback filter directive.
pub fn init_observability_with(json: bool, directive: &str) -> Result<()> {
    #[cfg(feature = "metrics")]
    DumpMetrics::global();

    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(directive)
            .map_err(|e| DumpError::config(format!("Invalid log directive: {e}")))
    })?;
    let registry = TracingRegistry::default().with(filter);

    let installed = if json {
        set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(false),
            ),
        )
    } else {
        set_global_default(registry.with(tracing_subscriber::fmt::layer().with_target(false)))
    };
    installed.map_err(|e| {
        DumpError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("tabledump observability initialized");
    Ok(())
}
