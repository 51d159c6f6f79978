//! Staged video-composition pipeline.
//!
//! A declarative JSON job document goes in; a single uploaded MP4 comes out.
//! The pipeline runs `validate -> download -> image_auto -> align_text ->
//! render_segments -> concatenate -> upload`, each stage reading and writing
//! named keys on a typed [`context::PipelineContext`] bound to a
//! [`scope::ResourceScope`] that is released whatever the outcome.
//!
//! The process surface is [`runner::JobRunner::run_job`].

pub mod cancel;
pub mod context;
pub mod engine;
pub mod error;
pub mod fsops;
pub mod llm;
pub mod metrics;
pub mod processor;
pub mod retry;
pub mod runner;
pub mod scope;
pub mod settings;
pub mod stages;

pub use cancel::{CancelHandle, CancelSignal};
pub use context::{keys, PipelineContext};
pub use error::{ErrorKind, JobFailure, PipelineError, PipelineResult};
pub use metrics::{MetricsCollector, MetricsSummary};
pub use runner::{JobRunner, RunOutput};
pub use settings::Settings;
