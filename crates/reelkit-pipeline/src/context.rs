//! Typed pipeline context.
//!
//! A string-keyed map over a closed vocabulary; values are downcast to their
//! concrete types at the access site. Writes are producer-only: a key set
//! once can never be overwritten, which keeps cross-stage data flow
//! one-directional.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use reelkit_models::JobId;

use crate::cancel::CancelSignal;
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::metrics::MetricsCollector;
use crate::scope::ResourceScope;
use crate::settings::Settings;

/// The closed key vocabulary. Each stage reads earlier keys and produces
/// exactly one later key.
pub mod keys {
    pub const JOB: &str = "job";
    pub const VALIDATED_JOB: &str = "validated_job";
    pub const DOWNLOADED_JOB: &str = "downloaded_job";
    pub const FIXED_JOB: &str = "fixed_job";
    pub const ALIGNED_JOB: &str = "aligned_job";
    pub const SEGMENT_CLIPS: &str = "segment_clips";
    pub const FINAL_CLIP_PATH: &str = "final_clip_path";
    pub const UPLOAD_URL: &str = "upload_url";
}

/// Context object passed through pipeline stages.
pub struct PipelineContext {
    values: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
    /// Free-form string metadata, mutable across stages
    pub metadata: HashMap<String, String>,
    job_id: JobId,
    scope: Arc<ResourceScope>,
    settings: Arc<Settings>,
    metrics: MetricsCollector,
    cancel: CancelSignal,
}

impl PipelineContext {
    pub fn new(
        job_id: JobId,
        scope: Arc<ResourceScope>,
        settings: Arc<Settings>,
        metrics: MetricsCollector,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            values: HashMap::new(),
            metadata: HashMap::new(),
            job_id,
            scope,
            settings,
            metrics,
            cancel,
        }
    }

    /// Set a key. Fails if the key was already produced by another stage.
    pub fn set<T: Any + Send + Sync>(&mut self, key: &'static str, value: T) -> PipelineResult<()> {
        if self.values.contains_key(key) {
            return Err(PipelineError::new(
                "context",
                ErrorKind::Pipeline,
                format!("context key '{key}' was already produced"),
            ));
        }
        self.values.insert(key, Box::new(value));
        Ok(())
    }

    /// Borrow a key's value.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> PipelineResult<&T> {
        self.values
            .get(key)
            .ok_or_else(|| {
                PipelineError::new(
                    "context",
                    ErrorKind::Pipeline,
                    format!("context key '{key}' is missing"),
                )
            })?
            .downcast_ref::<T>()
            .ok_or_else(|| {
                PipelineError::new(
                    "context",
                    ErrorKind::Pipeline,
                    format!("context key '{key}' has an unexpected type"),
                )
            })
    }

    /// Clone a key's value out of the context.
    pub fn get_cloned<T: Any + Send + Sync + Clone>(&self, key: &str) -> PipelineResult<T> {
        self.get::<T>(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn scope(&self) -> &ResourceScope {
        &self.scope
    }

    pub fn scope_arc(&self) -> Arc<ResourceScope> {
        Arc::clone(&self.scope)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_arc(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn cancel(&self) -> &CancelSignal {
        &self.cancel
    }
}
