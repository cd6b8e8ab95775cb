//! End-to-end tests: job creation → queues → orchestrator → job state store.
//!
//! Verifies:
//! - steps advance exactly once, even under duplicate delivery
//! - retries are bounded and end in `Failed`
//! - dead-lettered, cancelled and stale messages settle the pipeline correctly
//! - the worker pool drives whole pipelines to completion on every backend

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::{Barrier, Notify};
    use tokio_util::sync::CancellationToken;

    use docpipe_core::{
        Artifact, ArtifactKind, DocumentId, DomainError, FailureKind, FileDetails, IndexName,
        Pipeline, PipelineStatus, StepName,
    };

    use crate::config::PipelineSettings;
    use crate::handlers::{HandlerRegistry, RegistryError, StepResult};
    use crate::orchestrator::{Disposition, NewJob, Orchestrator, OrchestratorError, RetryPolicy};
    use crate::queue::{
        DeadLetterEntry, Delivery, EnqueueOutcome, FileQueueBackend, InMemoryQueue,
        InMemoryQueueBackend, MessageQueue, QueueBackend, QueueError, QueueMessage, QueueOptions,
        Receipt,
    };
    use crate::store::{FileJobStore, InMemoryJobStore, JobStateStore, StoreError};
    use crate::workers::WorkerPool;

    const VISIBILITY: Duration = Duration::from_secs(30);

    fn step(name: &str) -> StepName {
        StepName::parse(name).unwrap()
    }

    fn doc(id: &str) -> DocumentId {
        DocumentId::parse(id).unwrap()
    }

    fn index() -> IndexName {
        IndexName::default_index()
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            visibility_timeout: VISIBILITY,
            handler_timeout: Duration::from_secs(5),
            queue: QueueOptions {
                poll_interval: Duration::from_millis(20),
                max_delivery_count: 10,
            },
            workers_per_step: 1,
            retry: RetryPolicy::exponential(2, Duration::from_millis(100), Duration::from_secs(1)),
            poll_error_backoff: Duration::from_millis(10),
            poll_error_backoff_max: Duration::from_millis(100),
            ..PipelineSettings::default()
        }
    }

    fn job(id: &str, steps: &[&str]) -> NewJob {
        NewJob::new(index(), steps.iter().map(|s| step(s)).collect())
            .with_document_id(doc(id))
            .with_file(FileDetails::new("f1", "report.pdf", "application/pdf", 2048))
    }

    fn succeed(registry: &mut HandlerRegistry, name: &str) {
        registry
            .register_fn(step(name), |p, _cancel| async move { StepResult::success(p) })
            .unwrap();
    }

    /// `extract` handler that attaches one text artifact to every file.
    fn extract_text(registry: &mut HandlerRegistry) {
        registry
            .register_fn(step("extract"), |mut p, _cancel| async move {
                for file in p.files.values_mut() {
                    let key = format!("{}.extract.txt", file.name);
                    file.add_artifact(
                        key,
                        Artifact::new(
                            ArtifactKind::ExtractedText,
                            StepName::parse("extract").unwrap(),
                            "text/plain",
                            json!("quarterly revenue grew"),
                        ),
                    );
                }
                StepResult::success(p)
            })
            .unwrap();
    }

    fn counting(registry: &mut HandlerRegistry, name: &str, calls: Arc<AtomicUsize>) {
        registry
            .register_fn(step(name), move |p, _cancel| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    StepResult::success(p)
                }
            })
            .unwrap();
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        store: Arc<InMemoryJobStore>,
        queues: Arc<InMemoryQueueBackend>,
    }

    impl Harness {
        async fn new(settings: PipelineSettings, registry: HandlerRegistry) -> Self {
            let store = InMemoryJobStore::arc();
            let queues = Arc::new(InMemoryQueueBackend::new("test", settings.queue));
            let orchestrator =
                Orchestrator::new(settings, store.clone(), queues.as_ref(), registry)
                    .await
                    .unwrap();
            Self {
                orchestrator: Arc::new(orchestrator),
                store,
                queues,
            }
        }

        fn queue(&self, name: &str) -> Arc<InMemoryQueue> {
            self.queues.queue(&step(name)).unwrap()
        }

        async fn deliver(&self, name: &str) -> Disposition {
            let delivery = next_delivery(&self.queue(name)).await;
            self.orchestrator
                .process_delivery(&step(name), delivery, &CancellationToken::new())
                .await
                .unwrap()
        }
    }

    async fn next_delivery(queue: &InMemoryQueue) -> Delivery {
        for _ in 0..1_000 {
            if let Some(delivery) = queue.dequeue(VISIBILITY).await.unwrap() {
                return delivery;
            }
        }
        panic!("no delivery on {}", queue.name());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_step_advances_and_dispatches_the_next() {
        docpipe_observability::init();
        let mut registry = HandlerRegistry::new();
        extract_text(&mut registry);
        succeed(&mut registry, "embed");
        let h = Harness::new(settings(), registry).await;

        let id = h.orchestrator.create_job(job("doc-1", &["extract", "embed"])).await.unwrap();
        assert_eq!(h.queue("extract").pending_ids(), vec!["default+doc-1+extract"]);

        assert_eq!(h.deliver("extract").await, Disposition::Advanced);

        let stored = h.store.load(&index(), &id).await.unwrap();
        assert_eq!(stored.cursor, 1);
        assert_eq!(stored.status, PipelineStatus::Queued);
        let file = &stored.files["f1"];
        assert!(file.artifacts.contains_key("report.pdf.extract.txt"));
        assert!(file.already_processed_by(&step("extract")));

        assert_eq!(h.queue("extract").pending(), 0);
        assert_eq!(h.queue("embed").pending_ids(), vec!["default+doc-1+embed"]);

        assert_eq!(h.deliver("embed").await, Disposition::Completed);
        let snap = h.orchestrator.status(&index(), &id).await.unwrap();
        assert!(snap.completed);
        assert_eq!(snap.completed_steps, vec![step("extract"), step("embed")]);
        assert!(snap.remaining_steps.is_empty());
        assert_eq!(h.queue("embed").pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_stop_after_the_retry_limit() {
        let mut registry = HandlerRegistry::new();
        succeed(&mut registry, "extract");
        registry
            .register_fn(step("embed"), |p, _cancel| async move {
                StepResult::transient(p, "embedding service unavailable")
            })
            .unwrap();
        let h = Harness::new(settings(), registry).await;

        let id = h.orchestrator.create_job(job("doc-1", &["extract", "embed"])).await.unwrap();
        assert_eq!(h.deliver("extract").await, Disposition::Advanced);

        assert_eq!(h.deliver("embed").await, Disposition::Retrying);
        assert_eq!(h.deliver("embed").await, Disposition::Retrying);
        assert_eq!(h.deliver("embed").await, Disposition::Failed);

        let snap = h.orchestrator.status(&index(), &id).await.unwrap();
        assert_eq!(snap.status, PipelineStatus::Failed);
        assert_eq!(snap.failure, Some(FailureKind::RetriesExhausted));
        assert_eq!(snap.attempts[&step("embed")], 3);
        assert_eq!(snap.last_error.as_deref(), Some("embedding service unavailable"));
        assert_eq!(snap.completed_steps, vec![step("extract")]);
        assert_eq!(h.queue("embed").pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retried_step_waits_for_its_backoff() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(step("extract"), |p, _cancel| async move {
                StepResult::transient(p, "timeout")
            })
            .unwrap();
        let h = Harness::new(settings(), registry).await;
        h.orchestrator.create_job(job("doc-1", &["extract"])).await.unwrap();

        assert_eq!(h.deliver("extract").await, Disposition::Retrying);

        // First retry is delayed by base_delay * 2 = 200ms.
        let queue = h.queue("extract");
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(queue.dequeue(Duration::ZERO).await.is_ok_and(|d| d.is_none()));
        tokio::time::advance(Duration::from_millis(60)).await;
        let delivery = queue.dequeue(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(delivery.delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_deliveries_advance_the_cursor_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));
        let mut registry = HandlerRegistry::new();
        {
            let calls = calls.clone();
            registry
                .register_fn(step("extract"), move |p, _cancel| {
                    let calls = calls.clone();
                    let barrier = barrier.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        barrier.wait().await;
                        StepResult::success(p)
                    }
                })
                .unwrap();
        }
        succeed(&mut registry, "embed");
        let h = Harness::new(settings(), registry).await;
        let id = h.orchestrator.create_job(job("doc-1", &["extract", "embed"])).await.unwrap();

        // Worker A's lease expires while it is still busy; worker B gets the same message.
        let queue = h.queue("extract");
        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        let second = queue.dequeue(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(first.message.id, second.message.id);
        assert_eq!(second.delivery_count, 2);

        let shutdown = CancellationToken::new();
        let extract = step("extract");
        let (a, b) = tokio::join!(
            h.orchestrator.process_delivery(&extract, first, &shutdown),
            h.orchestrator.process_delivery(&extract, second, &shutdown),
        );
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|d| format!("{d:?}"));
        assert_eq!(outcomes, vec![Disposition::Advanced, Disposition::Stale]);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let stored = h.store.load(&index(), &id).await.unwrap();
        assert_eq!(stored.cursor, 1);
        assert_eq!(stored.revision, 3);
        assert_eq!(h.queue("extract").pending(), 0);
        assert_eq!(h.queue("embed").pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_fails_without_retrying() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(step("extract"), |p, _cancel| async move {
                StepResult::permanent(p, "unsupported mime type")
            })
            .unwrap();
        succeed(&mut registry, "embed");
        let h = Harness::new(settings(), registry).await;
        let id = h.orchestrator.create_job(job("doc-1", &["extract", "embed"])).await.unwrap();

        assert_eq!(h.deliver("extract").await, Disposition::Failed);

        let snap = h.orchestrator.status(&index(), &id).await.unwrap();
        assert!(snap.failed);
        assert_eq!(snap.failure, Some(FailureKind::Rejected));
        assert_eq!(snap.last_error.as_deref(), Some("unsupported mime type"));
        assert_eq!(h.queue("extract").pending(), 0);
        assert_eq!(h.queue("embed").pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_lettered_message_fails_the_pipeline() {
        let mut registry = HandlerRegistry::new();
        succeed(&mut registry, "extract");
        let mut s = settings();
        s.queue.max_delivery_count = 2;
        let h = Harness::new(s, registry).await;
        let id = h.orchestrator.create_job(job("doc-1", &["extract"])).await.unwrap();

        // Two deliveries whose workers never come back.
        let queue = h.queue("extract");
        for _ in 0..2 {
            queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
            tokio::time::advance(Duration::from_millis(20)).await;
        }

        let Err(QueueError::DeadLettered {
            message,
            delivery_count,
        }) = queue.dequeue(VISIBILITY).await
        else {
            panic!("expected the message to be dead-lettered");
        };
        assert_eq!(delivery_count, 3);

        let outcome = h
            .orchestrator
            .handle_dead_letter(&message, delivery_count)
            .await
            .unwrap();
        assert_eq!(outcome, Disposition::Failed);

        let snap = h.orchestrator.status(&index(), &id).await.unwrap();
        assert_eq!(snap.status, PipelineStatus::Failed);
        assert_eq!(snap.failure, Some(FailureKind::DeadLettered));
        assert_eq!(snap.last_error.as_deref(), Some("dead-lettered"));

        let dead = h.orchestrator.dead_letters(&step("extract"), 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.document_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_pipeline_drops_its_messages() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        counting(&mut registry, "extract", calls.clone());
        let h = Harness::new(settings(), registry).await;
        let id = h.orchestrator.create_job(job("doc-1", &["extract"])).await.unwrap();

        let snap = h.orchestrator.cancel(&index(), &id).await.unwrap();
        assert_eq!(snap.failure, Some(FailureKind::Cancelled));
        assert_eq!(snap.last_error.as_deref(), Some("cancelled"));

        assert_eq!(h.deliver("extract").await, Disposition::Stale);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.queue("extract").pending(), 0);

        let again = h.orchestrator.cancel(&index(), &id).await;
        assert!(matches!(
            again,
            Err(OrchestratorError::Domain(DomainError::InvalidTransition(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn message_for_unknown_pipeline_is_dropped() {
        let mut registry = HandlerRegistry::new();
        succeed(&mut registry, "extract");
        let h = Harness::new(settings(), registry).await;

        let orphan = QueueMessage::new(index(), doc("ghost"), step("extract"));
        h.queue("extract").enqueue(orphan, Duration::ZERO).await.unwrap();

        assert_eq!(h.deliver("extract").await, Disposition::Stale);
        assert_eq!(h.queue("extract").pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivered_finished_step_redispatches_the_current_one() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        counting(&mut registry, "extract", calls.clone());
        succeed(&mut registry, "embed");
        let h = Harness::new(settings(), registry).await;
        let id = h.orchestrator.create_job(job("doc-1", &["extract", "embed"])).await.unwrap();

        // Crash window: the success was persisted but the next step was never enqueued.
        let mut stored = h.store.load(&index(), &id).await.unwrap();
        stored.complete_step(&step("extract"), &Default::default()).unwrap();
        h.store.compare_and_swap(&stored, stored.revision).await.unwrap();
        assert_eq!(h.queue("embed").pending(), 0);

        assert_eq!(h.deliver("extract").await, Disposition::Stale);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.queue("extract").pending(), 0);
        assert_eq!(h.queue("embed").pending_ids(), vec!["default+doc-1+embed"]);

        assert_eq!(h.deliver("embed").await, Disposition::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_restores_a_lost_message() {
        let mut registry = HandlerRegistry::new();
        succeed(&mut registry, "extract");
        let h = Harness::new(settings(), registry).await;
        let id = h.orchestrator.create_job(job("doc-1", &["extract"])).await.unwrap();

        assert_eq!(
            h.orchestrator.resume(&index(), &id).await.unwrap(),
            EnqueueOutcome::AlreadyPending
        );

        let queue = h.queue("extract");
        let lost = next_delivery(&queue).await;
        queue.acknowledge(&lost.receipt).await.unwrap();
        assert_eq!(queue.pending(), 0);

        assert_eq!(
            h.orchestrator.resume(&index(), &id).await.unwrap(),
            EnqueueOutcome::Queued
        );
        assert_eq!(h.deliver("extract").await, Disposition::Completed);
        assert!(h.orchestrator.resume(&index(), &id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn handler_timeout_counts_as_transient_failure() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(step("extract"), |p, _cancel| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                StepResult::success(p)
            })
            .unwrap();
        let mut s = settings();
        s.handler_timeout = Duration::from_secs(1);
        let h = Harness::new(s, registry).await;
        let id = h.orchestrator.create_job(job("doc-1", &["extract"])).await.unwrap();

        assert_eq!(h.deliver("extract").await, Disposition::Retrying);

        let snap = h.orchestrator.status(&index(), &id).await.unwrap();
        assert_eq!(snap.status, PipelineStatus::Queued);
        assert_eq!(snap.attempts[&step("extract")], 1);
        assert!(snap.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_counts_as_transient_failure() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(step("extract"), |p, _cancel| async move {
                assert!(p.files.is_empty(), "parser bug");
                StepResult::success(p)
            })
            .unwrap();
        let h = Harness::new(settings(), registry).await;
        let id = h.orchestrator.create_job(job("doc-1", &["extract"])).await.unwrap();

        assert_eq!(h.deliver("extract").await, Disposition::Retrying);
        let snap = h.orchestrator.status(&index(), &id).await.unwrap();
        assert_eq!(snap.last_error.as_deref(), Some("handler panicked"));
    }

    #[tokio::test]
    async fn create_job_validates_steps() {
        let mut registry = HandlerRegistry::new();
        succeed(&mut registry, "extract");
        let h = Harness::new(settings(), registry).await;

        let unknown = h.orchestrator.create_job(job("doc-1", &["extract", "summarize"])).await;
        assert!(matches!(
            unknown,
            Err(OrchestratorError::Registry(RegistryError::Unregistered(s))) if s.as_str() == "summarize"
        ));

        let duplicate = h.orchestrator.create_job(job("doc-2", &["extract", "extract"])).await;
        assert!(matches!(duplicate, Err(OrchestratorError::Domain(_))));
        assert!(h.store.is_empty());

        let id = h.orchestrator.create_job(job("doc-3", &[])).await.unwrap();
        let snap = h.orchestrator.status(&index(), &id).await.unwrap();
        assert!(snap.completed);
        assert_eq!(h.queue("extract").pending(), 0);

        let again = h.orchestrator.create_job(job("doc-3", &["extract"])).await;
        assert!(matches!(
            again,
            Err(OrchestratorError::Store(StoreError::AlreadyExists { .. }))
        ));
    }

    async fn wait_until_terminal(
        orchestrator: &Orchestrator,
        ids: &[DocumentId],
    ) -> Vec<docpipe_core::PipelineSnapshot> {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let mut snaps = Vec::new();
                for id in ids {
                    snaps.push(orchestrator.status(&index(), id).await.unwrap());
                }
                if snaps.iter().all(|s| s.status.is_terminal()) {
                    return snaps;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pipelines did not finish in time")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_pool_runs_pipelines_to_completion() {
        docpipe_observability::init();
        let mut registry = HandlerRegistry::new();
        extract_text(&mut registry);
        succeed(&mut registry, "partition");
        succeed(&mut registry, "embed");
        let mut s = settings();
        s.workers_per_step = 2;
        let h = Harness::new(s, registry).await;
        let pool = WorkerPool::spawn(h.orchestrator.clone()).unwrap();
        assert_eq!(pool.worker_count(), 6);

        let mut ids = Vec::new();
        for n in 0..5 {
            let id = h
                .orchestrator
                .create_job(job(&format!("doc-{n}"), &["extract", "partition", "embed"]))
                .await
                .unwrap();
            ids.push(id);
        }

        let snaps = wait_until_terminal(&h.orchestrator, &ids).await;
        assert!(snaps.iter().all(|s| s.completed));

        let stats = pool.shutdown().await;
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.advanced, 10);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.deliveries, 15);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_releases_an_interrupted_message() {
        let started = Arc::new(Notify::new());
        let mut registry = HandlerRegistry::new();
        {
            let started = started.clone();
            registry
                .register_fn(step("extract"), move |p, cancel| {
                    let started = started.clone();
                    async move {
                        started.notify_one();
                        cancel.cancelled().await;
                        StepResult::transient(p, "interrupted")
                    }
                })
                .unwrap();
        }
        let h = Harness::new(settings(), registry).await;
        let pool = WorkerPool::spawn(h.orchestrator.clone()).unwrap();
        let id = h.orchestrator.create_job(job("doc-1", &["extract"])).await.unwrap();

        started.notified().await;
        let stats = pool.shutdown().await;
        assert_eq!(stats.released, 1);
        assert_eq!(stats.retried, 0);

        let stored = h.store.load(&index(), &id).await.unwrap();
        assert_eq!(stored.attempts_for(&step("extract")), 0);
        assert!(!stored.is_terminal());
        assert_eq!(h.queue("extract").pending(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_pool_runs_on_file_backends() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings();
        let store = Arc::new(FileJobStore::new(dir.path().join("pipelines")));
        let queues = FileQueueBackend::new(dir.path().join("queues"), "docpipe", settings.queue);

        let mut registry = HandlerRegistry::new();
        extract_text(&mut registry);
        succeed(&mut registry, "embed");
        let orchestrator = Arc::new(
            Orchestrator::new(settings, store.clone(), &queues, registry)
                .await
                .unwrap(),
        );
        let pool = WorkerPool::spawn(orchestrator.clone()).unwrap();

        let ids = vec![
            orchestrator.create_job(job("a", &["extract", "embed"])).await.unwrap(),
            orchestrator.create_job(job("b", &["extract", "embed"])).await.unwrap(),
        ];
        let snaps = wait_until_terminal(&orchestrator, &ids).await;
        assert!(snaps.iter().all(|s| s.completed));
        pool.shutdown().await;

        // Survives a reopen of the store.
        let reopened = FileJobStore::new(dir.path().join("pipelines"));
        let stored = reopened.load(&index(), &doc("a")).await.unwrap();
        assert!(stored.is_completed());
        assert!(stored.files["f1"].artifacts.contains_key("report.pdf.extract.txt"));
    }

    async fn eventually(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time")
    }

    /// Store whose loads fail while `offline` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryJobStore,
        offline: AtomicBool,
    }

    #[async_trait]
    impl JobStateStore for FlakyStore {
        async fn create(&self, pipeline: &Pipeline) -> Result<u64, StoreError> {
            self.inner.create(pipeline).await
        }

        async fn load(
            &self,
            index: &IndexName,
            document_id: &DocumentId,
        ) -> Result<Pipeline, StoreError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(StoreError::Storage("connection reset".into()));
            }
            self.inner.load(index, document_id).await
        }

        async fn compare_and_swap(
            &self,
            pipeline: &Pipeline,
            expected: u64,
        ) -> Result<u64, StoreError> {
            self.inner.compare_and_swap(pipeline, expected).await
        }
    }

    /// Queue whose dequeues fail while `offline` is set.
    struct FlakyQueue {
        inner: Arc<InMemoryQueue>,
        offline: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MessageQueue for FlakyQueue {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn enqueue(
            &self,
            message: QueueMessage,
            delay: Duration,
        ) -> Result<EnqueueOutcome, QueueError> {
            self.inner.enqueue(message, delay).await
        }

        async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>, QueueError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(QueueError::Unavailable("broker restarting".into()));
            }
            self.inner.dequeue(visibility_timeout).await
        }

        async fn acknowledge(&self, receipt: &Receipt) -> Result<(), QueueError> {
            self.inner.acknowledge(receipt).await
        }

        async fn requeue(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError> {
            self.inner.requeue(receipt, delay).await
        }

        async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
            self.inner.dead_letters(limit).await
        }
    }

    struct FlakyQueueBackend {
        inner: InMemoryQueueBackend,
        offline: Arc<AtomicBool>,
    }

    #[async_trait]
    impl QueueBackend for FlakyQueueBackend {
        async fn open(&self, step: &StepName) -> Result<Arc<dyn MessageQueue>, QueueError> {
            Ok(Arc::new(FlakyQueue {
                inner: self.inner.queue(step)?,
                offline: self.offline.clone(),
            }))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_pool_polls_through_a_queue_outage() {
        let offline = Arc::new(AtomicBool::new(false));
        let settings = settings();
        let queues = FlakyQueueBackend {
            inner: InMemoryQueueBackend::new("test", settings.queue),
            offline: offline.clone(),
        };
        let mut registry = HandlerRegistry::new();
        succeed(&mut registry, "extract");
        let orchestrator = Arc::new(
            Orchestrator::new(settings, InMemoryJobStore::arc(), &queues, registry)
                .await
                .unwrap(),
        );
        let id = orchestrator.create_job(job("doc-1", &["extract"])).await.unwrap();

        offline.store(true, Ordering::SeqCst);
        let pool = WorkerPool::spawn(orchestrator.clone()).unwrap();
        eventually(|| pool.stats().poll_errors >= 3).await;
        assert_eq!(pool.stats().deliveries, 0);
        offline.store(false, Ordering::SeqCst);

        let snaps = wait_until_terminal(&orchestrator, &[id]).await;
        assert_eq!(snaps[0].status, PipelineStatus::Completed);

        let stats = pool.shutdown().await;
        assert!(stats.poll_errors >= 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.deliveries, 1);
        assert_eq!(stats.errors, 0);
    }

    /// Lease the message `times` times with a short lease, letting each expire.
    async fn let_leases_expire(queue: &InMemoryQueue, times: u32) {
        for _ in 0..times {
            queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dead_letter_is_recorded_once_the_store_recovers() {
        let mut settings = settings();
        settings.queue.max_delivery_count = 2;
        let store = Arc::new(FlakyStore::default());
        let queues = InMemoryQueueBackend::new("test", settings.queue);
        let mut registry = HandlerRegistry::new();
        succeed(&mut registry, "extract");
        let orchestrator = Arc::new(
            Orchestrator::new(settings, store.clone(), &queues, registry)
                .await
                .unwrap(),
        );
        let id = orchestrator.create_job(job("doc-1", &["extract"])).await.unwrap();
        let queue = queues.queue(&step("extract")).unwrap();
        let_leases_expire(&queue, 2).await;

        store.offline.store(true, Ordering::SeqCst);
        let pool = WorkerPool::spawn(orchestrator.clone()).unwrap();
        eventually(|| pool.stats().dead_lettered == 1 && pool.stats().errors >= 2).await;
        assert!(!store.inner.load(&index(), &id).await.unwrap().is_terminal());
        store.offline.store(false, Ordering::SeqCst);

        let snaps = wait_until_terminal(&orchestrator, &[id]).await;
        assert_eq!(snaps[0].status, PipelineStatus::Failed);
        assert_eq!(snaps[0].failure, Some(FailureKind::DeadLettered));

        let stats = pool.shutdown().await;
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.failed, 1);
        assert!(stats.errors >= 2);
        assert_eq!(queue.dead_letters(10).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unrecorded_dead_letter_is_recovered_on_start() {
        let mut settings = settings();
        settings.queue.max_delivery_count = 2;
        let mut registry = HandlerRegistry::new();
        succeed(&mut registry, "extract");
        let h = Harness::new(settings, registry).await;
        let done = h.orchestrator.create_job(job("done", &["extract"])).await.unwrap();
        h.deliver("extract").await;
        let id = h.orchestrator.create_job(job("doc-1", &["extract"])).await.unwrap();

        // A worker dies right after the queue dead-letters the message.
        let queue = h.queue("extract");
        let_leases_expire(&queue, 2).await;
        assert!(matches!(
            queue.dequeue(VISIBILITY).await,
            Err(QueueError::DeadLettered { .. })
        ));
        assert!(!h.store.load(&index(), &id).await.unwrap().is_terminal());

        let pool = WorkerPool::spawn(h.orchestrator.clone()).unwrap();
        let snaps = wait_until_terminal(&h.orchestrator, &[id.clone()]).await;
        assert_eq!(snaps[0].failure, Some(FailureKind::DeadLettered));
        pool.shutdown().await;

        // Recovery is idempotent and leaves finished pipelines alone.
        let failed = h
            .orchestrator
            .recover_dead_letters(&step("extract"), 10)
            .await
            .unwrap();
        assert_eq!(failed, 0);
        assert!(h.store.load(&index(), &done).await.unwrap().is_completed());
    }
}
