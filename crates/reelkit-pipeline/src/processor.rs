//! Processor framework.
//!
//! A processor is one unit of work with a single `process` operation. Two
//! variants, explicitly tagged by trait: [`Processor`] for I/O-bound work
//! (cooperatively concurrent) and [`SyncProcessor`] for CPU-bound work (run
//! on the blocking pool). The framework wraps every invocation in a metric
//! span and converts errors into the typed pipeline family.
//!
//! [`run_batch`] fans a per-item operation out under a semaphore and returns
//! results in input order; item failures are isolated unless `strict`.

use std::future::Future;
use std::sync::Arc;

use reelkit_models::JobId;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::metrics::MetricsCollector;
use crate::scope::ResourceScope;
use crate::settings::Settings;

/// Shared services handed to every processor invocation.
#[derive(Clone)]
pub struct StageServices {
    pub job_id: JobId,
    pub settings: Arc<Settings>,
    pub scope: Arc<ResourceScope>,
    pub metrics: MetricsCollector,
    pub cancel: CancelSignal,
}

/// I/O-bound processor: may suspend while awaiting network or subprocess
/// completion.
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    type Input: Send;
    type Output: Send;

    fn name(&self) -> &'static str;

    async fn process(
        &self,
        input: Self::Input,
        services: &StageServices,
    ) -> PipelineResult<Self::Output>;
}

/// CPU-bound processor: synchronous, scheduled on a worker thread from the
/// bounded blocking pool by [`run_cpu`].
pub trait SyncProcessor: Send + Sync {
    type Input: Send;
    type Output: Send;

    fn name(&self) -> &'static str;

    fn process(
        &self,
        input: Self::Input,
        services: &StageServices,
    ) -> PipelineResult<Self::Output>;
}

/// Run an I/O-bound processor inside a metric span.
pub async fn run_io<P: Processor>(
    processor: &P,
    input: P::Input,
    services: &StageServices,
) -> PipelineResult<P::Output> {
    let span = services.metrics.start_span(processor.name());
    let result = processor.process(input, services).await;
    match &result {
        Ok(_) => services.metrics.end_span(span, true, 1, None),
        Err(e) => services.metrics.end_span(span, false, 0, Some(e.kind)),
    }
    result
}

/// Run a CPU-bound processor on the blocking pool inside a metric span.
pub async fn run_cpu<P>(
    processor: Arc<P>,
    input: P::Input,
    services: &StageServices,
) -> PipelineResult<P::Output>
where
    P: SyncProcessor + 'static,
    P::Input: 'static,
    P::Output: 'static,
{
    let span = services.metrics.start_span(processor.name());
    let name = processor.name();
    let services_owned = services.clone();

    let result = tokio::task::spawn_blocking(move || processor.process(input, &services_owned))
        .await
        .map_err(|e| {
            PipelineError::new(
                name,
                ErrorKind::Processing,
                format!("worker thread panicked: {e}"),
            )
        })
        .and_then(|r| r);

    match &result {
        Ok(_) => services.metrics.end_span(span, true, 1, None),
        Err(e) => services.metrics.end_span(span, false, 0, Some(e.kind)),
    }
    result
}

/// Outcome of one batch item, reported instead of raised.
#[derive(Debug)]
pub struct ItemOutcome<T> {
    pub index: usize,
    pub result: PipelineResult<T>,
}

impl<T> ItemOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Batch execution policy.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub name: &'static str,
    pub max_concurrent: usize,
    /// Fail the whole batch on any item failure
    pub strict: bool,
}

/// Fan a per-item operation out over `items` with bounded concurrency.
///
/// Results come back in input order. The batch itself fails only if every
/// item fails, if `strict` is set and any item fails, or on cancellation.
pub async fn run_batch<T, O, F, Fut>(
    items: Vec<T>,
    options: &BatchOptions,
    services: &StageServices,
    per_item: F,
) -> PipelineResult<Vec<ItemOutcome<O>>>
where
    T: Send,
    O: Send,
    F: Fn(usize, T) -> Fut,
    Fut: Future<Output = PipelineResult<O>>,
{
    let total = items.len();
    let span = services.metrics.start_span(options.name);
    let semaphore = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
    let cancel = services.cancel.clone();

    debug!(
        batch = options.name,
        total,
        max_concurrent = options.max_concurrent,
        "starting batch"
    );

    let futures = items.into_iter().enumerate().map(|(index, item)| {
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let fut = per_item(index, item);
        async move {
            let _permit = semaphore.acquire_owned().await.map_err(|_| {
                PipelineError::new(options.name, ErrorKind::Pipeline, "semaphore closed")
            })?;
            if cancel.is_cancelled() {
                return Err(PipelineError::cancelled(options.name));
            }
            fut.await
        }
    });

    let results = futures::future::join_all(futures).await;

    let outcomes: Vec<ItemOutcome<O>> = results
        .into_iter()
        .enumerate()
        .map(|(index, result)| ItemOutcome { index, result })
        .collect();

    let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
    let failed = total - succeeded;

    let saw_cancellation = outcomes
        .iter()
        .any(|o| matches!(&o.result, Err(e) if e.is_cancelled()));
    if saw_cancellation {
        services.metrics.end_span(span, false, succeeded, Some(ErrorKind::Cancelled));
        return Err(PipelineError::cancelled(options.name));
    }

    if failed > 0 {
        warn!(
            batch = options.name,
            failed, succeeded, "batch completed with item failures"
        );
    }

    if total > 0 && succeeded == 0 {
        services.metrics.end_span(span, false, 0, Some(ErrorKind::Processing));
        let first = outcomes
            .iter()
            .find_map(|o| o.result.as_ref().err())
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        return Err(PipelineError::new(
            options.name,
            ErrorKind::Processing,
            format!("all {total} batch items failed; first error: {first}"),
        ));
    }

    if options.strict && failed > 0 {
        services.metrics.end_span(span, false, succeeded, Some(ErrorKind::Processing));
        return Err(PipelineError::new(
            options.name,
            ErrorKind::Processing,
            format!("{failed}/{total} batch items failed in strict mode"),
        ));
    }

    services.metrics.end_span(span, true, succeeded, None);
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    fn services(dir: &Path) -> StageServices {
        let scope = ResourceScope::create(dir, "proc", 1, Duration::from_millis(1)).unwrap();
        StageServices {
            job_id: JobId::from_string("proc"),
            settings: Arc::new(Settings::default()),
            scope: Arc::new(scope),
            metrics: MetricsCollector::new(),
            cancel: CancelSignal::never(),
        }
    }

    struct Doubler;

    #[async_trait::async_trait]
    impl Processor for Doubler {
        type Input = u32;
        type Output = u32;

        fn name(&self) -> &'static str {
            "doubler"
        }

        async fn process(&self, input: u32, _services: &StageServices) -> PipelineResult<u32> {
            Ok(input * 2)
        }
    }

    struct SyncSquarer;

    impl SyncProcessor for SyncSquarer {
        type Input = u32;
        type Output = u32;

        fn name(&self) -> &'static str {
            "squarer"
        }

        fn process(&self, input: u32, _services: &StageServices) -> PipelineResult<u32> {
            Ok(input * input)
        }
    }

    #[tokio::test]
    async fn test_run_io_records_span() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path());

        let out = run_io(&Doubler, 21, &services).await.unwrap();
        assert_eq!(out, 42);

        let summary = services.metrics.summary();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.successful, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_cpu_on_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path());

        let out = run_cpu(Arc::new(SyncSquarer), 6, &services).await.unwrap();
        assert_eq!(out, 36);
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path());
        let options = BatchOptions {
            name: "batch",
            max_concurrent: 2,
            strict: false,
        };

        let outcomes = run_batch(vec![1u32, 2, 3, 4], &options, &services, |i, n| async move {
            if n == 3 {
                Err(PipelineError::new("batch", ErrorKind::Processing, "boom"))
            } else {
                Ok((i, n * 10))
            }
        })
        .await
        .unwrap();

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].is_ok());
        assert!(!outcomes[2].is_ok());
        assert!(outcomes[3].is_ok());
        // Input order survives concurrent execution
        assert_eq!(outcomes[3].result.as_ref().unwrap().0, 3);
    }

    #[tokio::test]
    async fn test_batch_fails_when_all_items_fail() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path());
        let options = BatchOptions {
            name: "batch",
            max_concurrent: 2,
            strict: false,
        };

        let result = run_batch(vec![1u32, 2], &options, &services, |_, _| async {
            Err::<u32, _>(PipelineError::new("batch", ErrorKind::Processing, "down"))
        })
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_batch_strict_fails_on_any_failure() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path());
        let options = BatchOptions {
            name: "batch",
            max_concurrent: 2,
            strict: true,
        };

        let result = run_batch(vec![1u32, 2], &options, &services, |_, n| async move {
            if n == 2 {
                Err(PipelineError::new("batch", ErrorKind::Processing, "boom"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_batch_observes_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let mut services = services(dir.path());
        let (handle, signal) = CancelSignal::pair();
        services.cancel = signal;
        handle.cancel();

        let options = BatchOptions {
            name: "batch",
            max_concurrent: 1,
            strict: false,
        };
        let result = run_batch(vec![1u32], &options, &services, |_, n| async move { Ok(n) }).await;
        assert!(matches!(result, Err(e) if e.is_cancelled()));
    }
}
