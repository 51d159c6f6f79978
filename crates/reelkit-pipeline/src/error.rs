//! Pipeline error taxonomy.
//!
//! Stages fail with a [`PipelineError`] carrying the stage name and an
//! [`ErrorKind`] so callers can discriminate without string matching. The
//! user-visible failure is the flattened [`JobFailure`] record.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failure kinds, per stage semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Schema or semantic rule violation
    Validation,
    /// Required asset missing or unreadable after download
    Asset,
    /// Transient network or HTTP failure while fetching
    Download,
    /// Generic processor failure (filter graph, subprocess exit)
    Processing,
    /// Final join failed
    Concatenation,
    /// Sink failure after retries
    Upload,
    /// Scope setup or teardown failure
    Resource,
    /// A bounded wait exceeded its deadline
    Timeout,
    /// Cooperative cancellation observed
    Cancelled,
    /// Engine-level contract violation (missing context key, bad wiring)
    Pipeline,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Asset => "asset",
            ErrorKind::Download => "download",
            ErrorKind::Processing => "processing",
            ErrorKind::Concatenation => "concatenation",
            ErrorKind::Upload => "upload",
            ErrorKind::Resource => "resource",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Pipeline => "pipeline",
        }
    }

    /// Whether a failure of this kind may be retried by a retryable stage.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Download | ErrorKind::Upload | ErrorKind::Timeout)
    }
}

/// A stage failure with its kind and original cause chain.
#[derive(Debug, Error)]
#[error("Stage '{stage}' failed ({}): {message}", kind.as_str())]
pub struct PipelineError {
    pub stage: &'static str,
    pub kind: ErrorKind,
    pub message: String,
    /// Segment this failure is scoped to, when applicable
    pub segment_id: Option<String>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PipelineError {
    pub fn new(stage: &'static str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            segment_id: None,
            source: None,
        }
    }

    /// Wrap a causing error, preserving the chain.
    pub fn with_source(
        stage: &'static str,
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            segment_id: None,
            source: Some(Box::new(source)),
        }
    }

    pub fn for_segment(mut self, segment_id: impl Into<String>) -> Self {
        self.segment_id = Some(segment_id.into());
        self
    }

    pub fn cancelled(stage: &'static str) -> Self {
        Self::new(stage, ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn timeout(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, ErrorKind::Timeout, message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Classify a media error under the given stage.
    pub fn from_media(stage: &'static str, err: reelkit_media::MediaError) -> Self {
        use reelkit_media::MediaError;
        let kind = match &err {
            MediaError::Cancelled => ErrorKind::Cancelled,
            MediaError::Timeout(_) => ErrorKind::Timeout,
            MediaError::FileNotFound(_) => ErrorKind::Asset,
            _ => ErrorKind::Processing,
        };
        Self::with_source(stage, kind, err.to_string(), err)
    }
}

/// User-visible failure record for a whole job.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,
    pub message: String,
    /// One line per cause in the error chain
    pub cause_summary: String,
    /// Local artifact kept for recovery after an upload failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retained_path: Option<PathBuf>,
}

impl JobFailure {
    pub fn from_error(err: &PipelineError) -> Self {
        let mut causes = Vec::new();
        let mut current: Option<&(dyn std::error::Error + 'static)> = err.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static));
        while let Some(cause) = current {
            causes.push(cause.to_string());
            current = cause.source();
        }

        Self {
            kind: err.kind,
            stage: err.stage.to_string(),
            segment_id: err.segment_id.clone(),
            message: err.message.clone(),
            cause_summary: causes.join(" <- "),
            retained_path: None,
        }
    }

    pub fn with_retained_path(mut self, path: PathBuf) -> Self {
        self.retained_path = Some(path);
        self
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] stage={}", self.kind.as_str(), self.stage)?;
        if let Some(segment) = &self.segment_id {
            write!(f, " segment={segment}")?;
        }
        write!(f, ": {}", self.message)
    }
}
