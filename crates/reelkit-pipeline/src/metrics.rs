//! Per-stage metrics collection.
//!
//! Not on the critical path: a lock-protected append store with a
//! serializable summary. Spans record one stage invocation each; warning
//! counters track degraded behavior (substituted images, degraded
//! transitions, aligner fallbacks).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// One recorded stage invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpan {
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub success: bool,
    pub items_processed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Aggregate view returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub avg_duration_by_stage: HashMap<String, f64>,
    pub warnings: HashMap<String, u64>,
    pub spans: Vec<StageSpan>,
}

#[derive(Default)]
struct Inner {
    spans: Vec<StageSpan>,
    warnings: HashMap<String, u64>,
}

/// Thread-safe metrics collector shared across stages.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Inner>>,
}

/// An open span; finish it with [`MetricsCollector::end_span`].
pub struct OpenSpan {
    stage: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a stage invocation.
    pub fn start_span(&self, stage: &str) -> OpenSpan {
        OpenSpan {
            stage: stage.to_string(),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Finish a span.
    pub fn end_span(
        &self,
        span: OpenSpan,
        success: bool,
        items_processed: usize,
        error_kind: Option<ErrorKind>,
    ) {
        let recorded = StageSpan {
            stage: span.stage,
            started_at: span.started_at,
            duration_secs: span.started.elapsed().as_secs_f64(),
            success,
            items_processed,
            error_kind,
        };
        tracing::debug!(
            stage = %recorded.stage,
            success = recorded.success,
            items = recorded.items_processed,
            duration_secs = recorded.duration_secs,
            "stage span recorded"
        );
        self.inner.lock().unwrap().spans.push(recorded);
    }

    /// Bump a named warning counter.
    pub fn warning(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        *inner.warnings.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Current count of a warning, 0 when never raised.
    pub fn warning_count(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .warnings
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Aggregate summary of everything recorded so far.
    pub fn summary(&self) -> MetricsSummary {
        let inner = self.inner.lock().unwrap();

        let mut totals: HashMap<String, (f64, usize)> = HashMap::new();
        for span in &inner.spans {
            let entry = totals.entry(span.stage.clone()).or_insert((0.0, 0));
            entry.0 += span.duration_secs;
            entry.1 += 1;
        }
        let avg_duration_by_stage = totals
            .into_iter()
            .map(|(stage, (sum, count))| (stage, sum / count as f64))
            .collect();

        MetricsSummary {
            total: inner.spans.len(),
            successful: inner.spans.iter().filter(|s| s.success).count(),
            failed: inner.spans.iter().filter(|s| !s.success).count(),
            avg_duration_by_stage,
            warnings: inner.warnings.clone(),
            spans: inner.spans.clone(),
        }
    }
}

/// Warning counter names used across the pipeline.
pub mod warnings {
    pub const TRANSITION_DEGRADED: &str = "transition_degraded";
    pub const ALIGNER_UNAVAILABLE: &str = "aligner_unavailable";
    pub const IMAGE_SUBSTITUTED: &str = "image_substituted";
    pub const IMAGE_PLACEHOLDER: &str = "image_placeholder";
    pub const OPTIONAL_ASSET_MISSING: &str = "optional_asset_missing";
    pub const CONCAT_STREAM_COPY: &str = "concat_stream_copy";
    pub const CONCAT_REENCODE: &str = "concat_reencode";
    pub const SEGMENT_RENDER_FAILED: &str = "segment_render_failed";
}
