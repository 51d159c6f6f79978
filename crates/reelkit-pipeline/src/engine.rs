//! Pipeline engine.
//!
//! A pipeline is an ordered list of [`StageSpec`]s executed sequentially
//! against one [`PipelineContext`]. The engine checks declared inputs before
//! each stage, wraps every invocation in a metric span, enforces the
//! producer-only context contract, observes cancellation between stages, and
//! releases the resource scope whatever the outcome. Fan-out happens inside
//! batch stages, never between stages.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::context::PipelineContext;
use crate::error::{ErrorKind, PipelineError, PipelineResult};

/// A stage body: a named unit of work over the context. Both processor-backed
/// stages and plain functions implement this.
#[async_trait]
pub trait ContextStage: Send + Sync {
    async fn run(&self, ctx: &mut PipelineContext) -> PipelineResult<()>;
}

type StageFn = Box<
    dyn for<'a> Fn(&'a mut PipelineContext) -> futures::future::BoxFuture<'a, PipelineResult<()>>
        + Send
        + Sync,
>;

/// Adapter turning a plain async function into a stage body, for named
/// side-effects over the context that don't warrant a processor.
pub struct FnStage {
    f: StageFn,
}

impl FnStage {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut PipelineContext) -> futures::future::BoxFuture<'a, PipelineResult<()>>
            + Send
            + Sync
            + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl ContextStage for FnStage {
    async fn run(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        (self.f)(ctx).await
    }
}

/// What to do when a stage fails.
pub enum FailurePolicy {
    /// Fail the pipeline (default)
    Abort,
    /// Log and continue with the next stage
    Skip,
    /// Run the named stage instead, then continue
    FallbackTo(&'static str),
}

type Condition = Box<dyn Fn(&PipelineContext) -> bool + Send + Sync>;

/// A named stage with declared context inputs and outputs.
pub struct StageSpec {
    pub name: &'static str,
    pub requires: &'static [&'static str],
    pub produces: &'static [&'static str],
    pub body: Box<dyn ContextStage>,
    pub condition: Option<Condition>,
    pub on_failure: FailurePolicy,
}

impl StageSpec {
    pub fn new(name: &'static str, body: Box<dyn ContextStage>) -> Self {
        Self {
            name,
            requires: &[],
            produces: &[],
            body,
            condition: None,
            on_failure: FailurePolicy::Abort,
        }
    }

    pub fn requires(mut self, keys: &'static [&'static str]) -> Self {
        self.requires = keys;
        self
    }

    pub fn produces(mut self, keys: &'static [&'static str]) -> Self {
        self.produces = keys;
        self
    }

    pub fn when<F: Fn(&PipelineContext) -> bool + Send + Sync + 'static>(
        mut self,
        condition: F,
    ) -> Self {
        self.condition = Some(Box::new(condition));
        self
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }
}

/// Sequential pipeline over an ordered stage list.
pub struct Pipeline {
    stages: Vec<StageSpec>,
}

impl Pipeline {
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name).collect()
    }

    /// Execute all stages; the scope is released before returning, on every
    /// path.
    pub async fn execute(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        let result = self.execute_stages(ctx).await;
        ctx.scope().release().await;
        result
    }

    async fn execute_stages(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        for stage in &self.stages {
            if ctx.cancel().is_cancelled() {
                return Err(PipelineError::cancelled(stage.name));
            }

            if let Some(condition) = &stage.condition {
                if !condition(ctx) {
                    debug!(stage = stage.name, "condition false, skipping stage");
                    continue;
                }
            }

            match self.run_stage(stage, ctx).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => match &stage.on_failure {
                    FailurePolicy::Abort => return Err(e),
                    FailurePolicy::Skip => {
                        warn!(stage = stage.name, error = %e, "stage failed, skipping");
                    }
                    FailurePolicy::FallbackTo(name) => {
                        warn!(
                            stage = stage.name,
                            fallback = name,
                            error = %e,
                            "stage failed, running fallback stage"
                        );
                        let fallback = self.stages.iter().find(|s| s.name == *name).ok_or_else(
                            || {
                                PipelineError::new(
                                    stage.name,
                                    ErrorKind::Pipeline,
                                    format!("fallback stage '{name}' not found"),
                                )
                            },
                        )?;
                        self.run_stage(fallback, ctx).await?;
                    }
                },
            }
        }
        Ok(())
    }

    async fn run_stage(&self, stage: &StageSpec, ctx: &mut PipelineContext) -> PipelineResult<()> {
        for key in stage.requires {
            if !ctx.contains(key) {
                return Err(PipelineError::new(
                    stage.name,
                    ErrorKind::Pipeline,
                    format!("required context key '{key}' is missing"),
                ));
            }
        }

        info!(stage = stage.name, "executing stage");
        let span = ctx.metrics().start_span(stage.name);

        let result = stage.body.run(ctx).await;

        match result {
            Ok(()) => {
                ctx.metrics().end_span(span, true, 1, None);

                for key in stage.produces {
                    if !ctx.contains(key) {
                        return Err(PipelineError::new(
                            stage.name,
                            ErrorKind::Pipeline,
                            format!("stage did not produce declared key '{key}'"),
                        ));
                    }
                }
                Ok(())
            }
            Err(e) => {
                ctx.metrics().end_span(span, false, 0, Some(e.kind));
                if e.stage == stage.name {
                    Err(e)
                } else {
                    // Re-attribute errors raised by helpers to the stage
                    let kind = e.kind;
                    let message = e.message.clone();
                    let segment_id = e.segment_id.clone();
                    let mut wrapped =
                        PipelineError::with_source(stage.name, kind, message, e);
                    wrapped.segment_id = segment_id;
                    Err(wrapped)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSignal;
    use crate::context::keys;
    use crate::metrics::MetricsCollector;
    use crate::scope::ResourceScope;
    use crate::settings::Settings;
    use reelkit_models::JobId;
    use std::sync::Arc;
    use std::time::Duration;

    struct SetKey {
        key: &'static str,
        value: u32,
    }

    #[async_trait]
    impl ContextStage for SetKey {
        async fn run(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
            ctx.set(self.key, self.value)
        }
    }

    struct Fails;

    #[async_trait]
    impl ContextStage for Fails {
        async fn run(&self, _ctx: &mut PipelineContext) -> PipelineResult<()> {
            Err(PipelineError::new("fails", ErrorKind::Processing, "boom"))
        }
    }

    fn context(cancel: CancelSignal) -> (tempfile::TempDir, PipelineContext) {
        let root = tempfile::tempdir().unwrap();
        let scope =
            ResourceScope::create(root.path(), "engine", 1, Duration::from_millis(1)).unwrap();
        let ctx = PipelineContext::new(
            JobId::from_string("engine"),
            Arc::new(scope),
            Arc::new(Settings::default()),
            MetricsCollector::new(),
            cancel,
        );
        (root, ctx)
    }

    #[tokio::test]
    async fn test_stages_run_in_order_and_release_scope() {
        let (_root, mut ctx) = context(CancelSignal::never());
        let temp = ctx.scope().temp_dir().to_path_buf();

        let pipeline = Pipeline::new(vec![
            StageSpec::new("first", Box::new(SetKey { key: keys::JOB, value: 1 }))
                .produces(&[keys::JOB]),
            StageSpec::new("second", Box::new(SetKey { key: keys::VALIDATED_JOB, value: 2 }))
                .requires(&[keys::JOB])
                .produces(&[keys::VALIDATED_JOB]),
        ]);

        pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(*ctx.get::<u32>(keys::VALIDATED_JOB).unwrap(), 2);
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_missing_required_key_is_pipeline_error() {
        let (_root, mut ctx) = context(CancelSignal::never());

        let pipeline = Pipeline::new(vec![StageSpec::new(
            "needs_input",
            Box::new(SetKey { key: keys::VALIDATED_JOB, value: 1 }),
        )
        .requires(&[keys::JOB])]);

        let err = pipeline.execute(&mut ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Pipeline);
        assert_eq!(err.stage, "needs_input");
    }

    #[tokio::test]
    async fn test_skip_policy_continues() {
        let (_root, mut ctx) = context(CancelSignal::never());

        let pipeline = Pipeline::new(vec![
            StageSpec::new("fails", Box::new(Fails)).on_failure(FailurePolicy::Skip),
            StageSpec::new("after", Box::new(SetKey { key: keys::JOB, value: 9 })),
        ]);

        pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(*ctx.get::<u32>(keys::JOB).unwrap(), 9);
    }

    #[tokio::test]
    async fn test_abort_policy_stops() {
        let (_root, mut ctx) = context(CancelSignal::never());

        let pipeline = Pipeline::new(vec![
            StageSpec::new("fails", Box::new(Fails)),
            StageSpec::new("after", Box::new(SetKey { key: keys::JOB, value: 9 })),
        ]);

        let err = pipeline.execute(&mut ctx).await.unwrap_err();
        assert_eq!(err.stage, "fails");
        assert!(!ctx.contains(keys::JOB));
    }

    #[tokio::test]
    async fn test_condition_skips_stage() {
        let (_root, mut ctx) = context(CancelSignal::never());

        let pipeline = Pipeline::new(vec![StageSpec::new(
            "conditional",
            Box::new(SetKey { key: keys::JOB, value: 1 }),
        )
        .when(|_| false)]);

        pipeline.execute(&mut ctx).await.unwrap();
        assert!(!ctx.contains(keys::JOB));
    }

    #[tokio::test]
    async fn test_fallback_policy_runs_named_stage() {
        let (_root, mut ctx) = context(CancelSignal::never());

        let pipeline = Pipeline::new(vec![
            StageSpec::new("fails", Box::new(Fails))
                .on_failure(FailurePolicy::FallbackTo("rescue")),
            StageSpec::new("rescue", Box::new(SetKey { key: keys::JOB, value: 3 }))
                // Never runs on its own; only as a fallback target
                .when(|_| false),
        ]);

        pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(*ctx.get::<u32>(keys::JOB).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_before_stage() {
        let (handle, signal) = CancelSignal::pair();
        let (_root, mut ctx) = context(signal);
        handle.cancel();

        let pipeline = Pipeline::new(vec![StageSpec::new(
            "never_runs",
            Box::new(SetKey { key: keys::JOB, value: 1 }),
        )]);

        let err = pipeline.execute(&mut ctx).await.unwrap_err();
        assert!(err.is_cancelled());
        // Scope still released on the cancellation path
        assert!(ctx.scope().is_released());
    }

    #[tokio::test]
    async fn test_function_stage() {
        let (_root, mut ctx) = context(CancelSignal::never());

        let stage = FnStage::new(|ctx: &mut PipelineContext| {
            Box::pin(async move {
                ctx.metadata.insert("touched".to_string(), "yes".to_string());
                ctx.set(keys::JOB, 5u32)
            })
        });
        let pipeline = Pipeline::new(vec![
            StageSpec::new("side_effect", Box::new(stage)).produces(&[keys::JOB])
        ]);

        pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.metadata.get("touched").map(String::as_str), Some("yes"));
        assert_eq!(*ctx.get::<u32>(keys::JOB).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_undeclared_produce_is_error() {
        let (_root, mut ctx) = context(CancelSignal::never());

        let pipeline = Pipeline::new(vec![StageSpec::new(
            "claims_but_does_not_produce",
            Box::new(SetKey { key: keys::JOB, value: 1 }),
        )
        .produces(&[keys::UPLOAD_URL])]);

        let err = pipeline.execute(&mut ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Pipeline);
    }
}
