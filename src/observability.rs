// Centralized Observability Infrastructure for EngramDB
// Structured logging, operation tracing and lightweight metrics for the
// graph adapter, the migration engine and the cloud sync layer.

use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

// Global atomic counters for metrics
static QUERY_COUNTER: AtomicU64 = AtomicU64::new(0);
static ERROR_COUNTER: AtomicU64 = AtomicU64::new(0);
static MIGRATION_COUNTER: AtomicU64 = AtomicU64::new(0);
static SYNC_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize the logging and tracing infrastructure
/// This should be called once at application startup
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    // Determine the filter level based on flags
    let filter_level = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("engramdb=debug,info")
    } else {
        // Default: warnings and errors for engramdb, only errors for
        // dependencies. RUST_LOG can widen this.
        EnvFilter::new("engramdb=warn,error")
    };

    // Quiet flag takes precedence over the environment variable
    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(filter_level)
    } else {
        filter_level
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_line_number(!quiet)
        .with_file(!quiet)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            if !quiet {
                info!("EngramDB observability initialized");
            }
            Ok(())
        }
        Err(_) => {
            // Already initialized, which is fine in test environments
            Ok(())
        }
    }
}

/// Metric types for performance monitoring
#[derive(Debug, Clone)]
pub enum MetricType {
    Counter {
        name: &'static str,
        value: u64,
    },
    Gauge {
        name: &'static str,
        value: f64,
    },
    Timer {
        name: &'static str,
        duration: Duration,
    },
}

/// Record a metric
pub fn record_metric(metric: MetricType) {
    match metric {
        MetricType::Counter { name, value } => {
            debug!("metric.counter {} = {}", name, value);
            match name {
                "graph.queries" => QUERY_COUNTER.fetch_add(value, Ordering::Relaxed),
                "graph.errors" => ERROR_COUNTER.fetch_add(value, Ordering::Relaxed),
                "migration.runs" => MIGRATION_COUNTER.fetch_add(value, Ordering::Relaxed),
                "cloud.syncs" => SYNC_COUNTER.fetch_add(value, Ordering::Relaxed),
                _ => 0,
            };
        }
        MetricType::Gauge { name, value } => {
            debug!("metric.gauge {} = {}", name, value);
        }
        MetricType::Timer { name, duration } => {
            debug!("metric.timer {} = {:?}", name, duration);
        }
    }
}

/// Execute a future under a fresh trace id, logging start, completion
/// and failure with elapsed time.
pub async fn with_trace_id<F, T>(operation: &str, f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let trace_id = Uuid::new_v4();

    debug!(
        trace_id = %trace_id,
        "Starting operation: {}", operation
    );

    let start = Instant::now();
    let result = f.await;
    let elapsed = start.elapsed();

    match &result {
        Ok(_) => {
            debug!(
                trace_id = %trace_id,
                elapsed_ms = elapsed.as_millis(),
                "Operation completed successfully: {}", operation
            );
            record_metric(MetricType::Timer {
                name: "operation.duration",
                duration: elapsed,
            });
        }
        Err(e) => {
            error!(
                trace_id = %trace_id,
                elapsed_ms = elapsed.as_millis(),
                error = %e,
                "Operation failed: {}", operation
            );
            record_metric(MetricType::Counter {
                name: "graph.errors",
                value: 1,
            });
        }
    }

    result
}

/// Get current metrics snapshot
pub fn get_metrics() -> serde_json::Value {
    serde_json::json!({
        "operations": {
            "queries": QUERY_COUNTER.load(Ordering::Relaxed),
            "errors": ERROR_COUNTER.load(Ordering::Relaxed),
            "migrations": MIGRATION_COUNTER.load(Ordering::Relaxed),
            "cloud_syncs": SYNC_COUNTER.load(Ordering::Relaxed),
        },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        record_metric(MetricType::Counter {
            name: "graph.queries",
            value: 2,
        });
        record_metric(MetricType::Gauge {
            name: "test.gauge",
            value: std::f64::consts::PI,
        });
        record_metric(MetricType::Timer {
            name: "test.timer",
            duration: Duration::from_millis(123),
        });

        let metrics = get_metrics();
        assert!(metrics["timestamp"].is_string());
        assert!(metrics["operations"]["queries"].as_u64().unwrap() >= 2);
    }

    #[tokio::test]
    async fn test_with_trace_id() {
        let result = with_trace_id("test_async_op", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, anyhow::Error>(42)
        })
        .await;

        assert_eq!(result.expect("Test operation should succeed"), 42);
    }

    #[tokio::test]
    async fn test_with_trace_id_failure_counted() {
        let before = get_metrics()["operations"]["errors"].as_u64().unwrap();
        let result: Result<()> =
            with_trace_id("failing_op", async { anyhow::bail!("expected failure") }).await;
        assert!(result.is_err());
        let after = get_metrics()["operations"]["errors"].as_u64().unwrap();
        assert!(after > before);
    }

    #[test]
    fn test_logging_level_configurations() {
        let configs = vec![
            ("quiet", "error"),
            ("verbose", "engramdb=debug,info"),
            ("default", "engramdb=warn,error"),
        ];

        for (mode, filter_str) in configs {
            assert!(
                EnvFilter::try_new(filter_str).is_ok(),
                "Failed to create filter for {} mode with filter: {}",
                mode,
                filter_str
            );
        }
    }
}
