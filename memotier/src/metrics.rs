//! Metrics sink and optional `metrics`-crate recorder.
//!
//! The engine reports outcomes through the [`MetricsSink`] trait. The
//! default sink is a no-op; hosts either implement the trait or enable the
//! `metrics` cargo feature and use [`RecorderSink`], which publishes
//! labeled counters and histograms through the `metrics` facade.

use std::time::Duration;

/// Sink for per-operation cache metrics.
///
/// All methods default to no-ops so implementations only override what
/// they record.
pub trait MetricsSink: Send + Sync {
    /// A read was served from cache.
    fn hit(&self, method_id: &str) {
        let _ = method_id;
    }

    /// A miss was computed by the factory.
    fn miss(&self, method_id: &str) {
        let _ = method_id;
    }

    /// An operation failed.
    fn error(&self, method_id: &str, reason: &str) {
        let _ = (method_id, reason);
    }

    /// Observed factory latency for a computed miss.
    fn latency(&self, method_id: &str, elapsed: Duration) {
        let _ = (method_id, elapsed);
    }
}

/// The default sink: records nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {}

#[cfg(feature = "metrics")]
mod recorder {
    use super::MetricsSink;
    use lazy_static::lazy_static;
    use std::time::Duration;

    lazy_static! {
        /// Track number of cache hit events.
        pub static ref CACHE_HIT_COUNTER: &'static str = {
            metrics::describe_counter!(
                "cache_hit_count",
                "Total number of cache hit events by method."
            );
            "cache_hit_count"
        };
        /// Track number of cache miss events.
        pub static ref CACHE_MISS_COUNTER: &'static str = {
            metrics::describe_counter!(
                "cache_miss_count",
                "Total number of cache miss events by method."
            );
            "cache_miss_count"
        };
        /// Track number of cache operation errors.
        pub static ref CACHE_ERROR_COUNTER: &'static str = {
            metrics::describe_counter!(
                "cache_error_count",
                "Total number of cache operation errors by method and reason."
            );
            "cache_error_count"
        };
        /// Factory latency histogram for computed misses.
        pub static ref CACHE_FACTORY_HISTOGRAM: &'static str = {
            metrics::describe_histogram!(
                "cache_factory_duration_seconds",
                metrics::Unit::Seconds,
                "Factory latencies for computed misses in seconds."
            );
            "cache_factory_duration_seconds"
        };
    }

    /// Sink publishing through the `metrics` facade.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct RecorderSink;

    impl MetricsSink for RecorderSink {
        fn hit(&self, method_id: &str) {
            metrics::counter!(*CACHE_HIT_COUNTER, "method" => method_id.to_string()).increment(1);
        }

        fn miss(&self, method_id: &str) {
            metrics::counter!(*CACHE_MISS_COUNTER, "method" => method_id.to_string()).increment(1);
        }

        fn error(&self, method_id: &str, reason: &str) {
            metrics::counter!(
                *CACHE_ERROR_COUNTER,
                "method" => method_id.to_string(),
                "reason" => reason.to_string()
            )
            .increment(1);
        }

        fn latency(&self, method_id: &str, elapsed: Duration) {
            metrics::histogram!(
                *CACHE_FACTORY_HISTOGRAM,
                "method" => method_id.to_string()
            )
            .record(elapsed.as_secs_f64());
        }
    }
}

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub use recorder::RecorderSink;
