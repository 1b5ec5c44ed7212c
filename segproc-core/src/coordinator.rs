use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::{sleep, Duration, Instant};

use crate::batch_processor::BatchProcessor;
use crate::config::Configuration;
use crate::error::ProcessorError;
use crate::message_source::{EventStream, MessageSource};
use crate::segment::Segment;
use crate::status::StatusRegistry;
use crate::token_store::TokenStore;
use crate::validator::EventValidator;
use crate::work_package::WorkPackage;

/// After this many consecutive source-read failures, the Coordinator flips
/// to `is_error()` without stopping — it keeps retrying.
const SOURCE_FAILURE_THRESHOLD: usize = 5;

/// The reader's currently open cursor, plus the claim set it was opened
/// against — `pull_and_fan_out` reopens at `min(claimedTokens)` only when
/// that set changes, rather than on every pass.
struct OpenStream<P> {
    cursor: Box<dyn EventStream<P> + Send>,
    claimed: HashSet<u32>,
}

/// Owns the event reader loop, claims and releases segments, spawns and
/// retires Work Packages, and fans events out to them.
pub struct Coordinator<P> {
    name: String,
    config: Arc<Configuration>,
    token_store: Arc<dyn TokenStore>,
    message_source: Arc<dyn MessageSource<P>>,
    validator: Arc<dyn EventValidator<P>>,
    batch_processor: Arc<dyn BatchProcessor<P>>,
    status: Arc<StatusRegistry>,
    packages: AsyncMutex<HashMap<u32, Arc<WorkPackage<P>>>>,
    stream: AsyncMutex<Option<OpenStream<P>>>,
    started: AtomicBool,
    running: AtomicBool,
    error: AtomicBool,
    shutdown: AtomicBool,
    consecutive_failures: AtomicUsize,
    loop_exited: watch::Sender<bool>,
    release_deadlines: StdMutex<HashMap<u32, Instant>>,
    idle_delay: Duration,
}

impl<P> Coordinator<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        config: Arc<Configuration>,
        token_store: Arc<dyn TokenStore>,
        message_source: Arc<dyn MessageSource<P>>,
        validator: Arc<dyn EventValidator<P>>,
        batch_processor: Arc<dyn BatchProcessor<P>>,
    ) -> Arc<Self> {
        let (loop_exited, _) = watch::channel(false);
        Arc::new(Coordinator {
            name: name.into(),
            config,
            token_store,
            message_source,
            validator,
            batch_processor,
            status: Arc::new(StatusRegistry::new()),
            packages: AsyncMutex::new(HashMap::new()),
            stream: AsyncMutex::new(None),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            error: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            consecutive_failures: AtomicUsize::new(0),
            loop_exited,
            release_deadlines: StdMutex::new(HashMap::new()),
            idle_delay: Duration::from_millis(50),
        })
    }

    pub fn status_registry(&self) -> Arc<StatusRegistry> {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    /// Idempotent on the first call: once running, later calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.started.store(true, Ordering::SeqCst);
        self.shutdown.store(false, Ordering::SeqCst);
        let this = Arc::clone(self);
        let executor = Arc::clone(&self.config.coordinator_executor);
        executor.spawn(Box::pin(async move {
            this.run_reader_loop().await;
        }));
    }

    /// Signals "do not reclaim this segment before `deadline`"; aborts the
    /// live package for it (no cause) if one is currently held.
    pub async fn release_until(self: &Arc<Self>, segment_id: u32, deadline: Instant) {
        self.release_deadlines
            .lock()
            .expect("coordinator poisoned")
            .insert(segment_id, deadline);
        let package = {
            let mut packages = self.packages.lock().await;
            packages.remove(&segment_id)
        };
        if let Some(package) = package {
            package.abort(None).await;
            let _ = self.token_store.release_claim(&self.name, segment_id).await;
        }
    }

    /// Resolves once every live Work Package has resolved its abort, the
    /// reader loop has exited, and all claims are released. Idempotent.
    pub async fn stop(self: &Arc<Self>) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);

        let mut exited_rx = self.loop_exited.subscribe();
        while !*exited_rx.borrow() {
            if exited_rx.changed().await.is_err() {
                break;
            }
        }

        let snapshot: Vec<(u32, Arc<WorkPackage<P>>)> = {
            let packages = self.packages.lock().await;
            packages.iter().map(|(id, p)| (*id, Arc::clone(p))).collect()
        };
        for (_, package) in &snapshot {
            package.abort(None).await;
        }
        let mut packages = self.packages.lock().await;
        for (segment_id, _) in snapshot {
            packages.remove(&segment_id);
            let _ = self.token_store.release_claim(&self.name, segment_id).await;
        }
        *self.stream.lock().await = None;
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run_reader_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.reader_pass().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            sleep(self.idle_delay).await;
        }
        let _ = self.loop_exited.send(true);
    }

    async fn reader_pass(self: &Arc<Self>) {
        self.prune_terminated().await;
        self.claim_step().await;

        match self.pull_and_fan_out().await {
            Ok(_) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::warn!(error = %err, failures, "message source read failed");
                if failures >= SOURCE_FAILURE_THRESHOLD {
                    self.error.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    async fn prune_terminated(self: &Arc<Self>) {
        let mut packages = self.packages.lock().await;
        let terminated: Vec<u32> = packages
            .iter()
            .filter(|(_, p)| p.is_terminated())
            .map(|(id, _)| *id)
            .collect();
        for segment_id in terminated {
            packages.remove(&segment_id);
            if let Err(err) = self.token_store.release_claim(&self.name, segment_id).await {
                tracing::warn!(segment_id, error = %err, "releaseClaim failed after termination");
            }
        }
    }

    async fn claim_step(self: &Arc<Self>) {
        let mut segments = match self.token_store.fetch_segments(&self.name).await {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "fetchSegments failed");
                return;
            }
        };

        if segments.is_empty() {
            let initial_token = match &self.config.initial_token {
                Some(f) => f(),
                None => self.message_source.create_tail_token(),
            };
            if let Err(err) = self
                .token_store
                .initialize_token_segments(&self.name, self.config.initial_segment_count, initial_token)
                .await
            {
                tracing::warn!(error = %err, "initializeTokenSegments failed");
                return;
            }
            segments = (0..self.config.initial_segment_count).collect();
        }

        let now = Instant::now();
        let deadlines: HashMap<u32, Instant> = self
            .release_deadlines
            .lock()
            .expect("coordinator poisoned")
            .clone();
        let segment_count = self.config.initial_segment_count;

        let mut packages = self.packages.lock().await;
        for segment_id in segments {
            if packages.contains_key(&segment_id) {
                continue;
            }
            if let Some(deadline) = deadlines.get(&segment_id) {
                if *deadline > now {
                    continue;
                }
            }
            match self.token_store.fetch_token(&self.name, segment_id).await {
                Ok(token) => {
                    let segment = Segment::new(segment_id, segment_count);
                    let package = WorkPackage::new(
                        segment,
                        self.name.clone(),
                        token,
                        Arc::clone(&self.config),
                        Arc::clone(&self.token_store),
                        Arc::clone(&self.validator),
                        Arc::clone(&self.batch_processor),
                        Arc::clone(&self.status),
                    );
                    packages.insert(segment_id, package);
                }
                Err(ProcessorError::ClaimContention { .. }) => {
                    tracing::debug!(segment_id, "claim contention, retrying next pass");
                }
                Err(err) => {
                    tracing::warn!(segment_id, error = %err, "fetchToken failed");
                }
            }
        }
    }

    /// Consumes one batch from the reader's open cursor, (re)opening it at
    /// `min(claimedTokens)` only when the claim set has changed since it was
    /// last opened, then fans each event out to every live package whose
    /// segment matches it. Reopening on every pass instead would keep
    /// replaying the same leading window whenever the slowest package's
    /// token doesn't move, starving every other package once the backlog
    /// exceeds one batch.
    async fn pull_and_fan_out(self: &Arc<Self>) -> Result<(), ProcessorError> {
        let packages = self.packages.lock().await;
        if packages.is_empty() {
            return Ok(());
        }
        let claimed: HashSet<u32> = packages.keys().copied().collect();
        let min_token = packages
            .values()
            .map(|p| p.last_delivered_token())
            .min()
            .expect("non-empty map has a minimum");

        let mut stream = self.stream.lock().await;
        let needs_reopen = !matches!(&*stream, Some(open) if open.claimed == claimed);
        if needs_reopen {
            let cursor = self.message_source.open_stream(min_token).await?;
            *stream = Some(OpenStream { cursor, claimed });
        }
        let open = stream.as_mut().expect("just populated above");
        let batch = open.cursor.next_batch(self.config.batch_size).await?;

        if batch.is_empty() {
            for package in packages.values() {
                package.schedule_worker();
            }
            return Ok(());
        }

        let mut touched: HashSet<u32> = HashSet::new();
        for event in batch {
            for (segment_id, package) in packages.iter() {
                if package.segment().matches(event.routing_key())
                    && event.token() > package.last_delivered_token()
                {
                    package.schedule_event(event.clone());
                    touched.insert(*segment_id);
                }
            }
            if packages.values().all(|p| !p.has_remaining_capacity()) {
                break;
            }
        }
        for (segment_id, package) in packages.iter() {
            if !touched.contains(segment_id) {
                package.schedule_worker();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::batch_processor::UnitOfWork;
    use crate::config::ConfigurationBuilder;
    use crate::event::EventMessage;
    use crate::executor::TokioExecutor;
    use crate::message_source::InMemoryMessageSource;
    use crate::token::GlobalSequenceToken;
    use crate::token_store::InMemoryTokenStore;
    use crate::validator::SegmentMatchValidator;

    struct NoopProcessor;

    #[async_trait]
    impl BatchProcessor<u32> for NoopProcessor {
        async fn process_batch(
            &self,
            _events: &[EventMessage<u32>],
            _unit_of_work: &UnitOfWork,
            _segment: &Segment,
        ) -> Result<(), ProcessorError> {
            Ok(())
        }
    }

    fn test_config() -> Arc<Configuration> {
        Arc::new(
            ConfigurationBuilder::new()
                .name("orders")
                .initial_segment_count(2)
                .worker_executor(Arc::new(TokioExecutor))
                .coordinator_executor(Arc::new(TokioExecutor))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn start_bootstraps_segments_and_claims_them() {
        let token_store = Arc::new(InMemoryTokenStore::new());
        let source: Arc<InMemoryMessageSource<u32>> = Arc::new(InMemoryMessageSource::new());
        let coordinator = Coordinator::new(
            "orders",
            test_config(),
            token_store.clone(),
            source,
            Arc::new(SegmentMatchValidator),
            Arc::new(NoopProcessor),
        );

        coordinator.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(coordinator.is_running());
        assert_eq!(token_store.fetch_segments("orders").await.unwrap().len(), 2);

        coordinator.stop().await;
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let token_store = Arc::new(InMemoryTokenStore::new());
        let source: Arc<InMemoryMessageSource<u32>> = Arc::new(InMemoryMessageSource::new());
        let coordinator = Coordinator::new(
            "orders",
            test_config(),
            token_store,
            source,
            Arc::new(SegmentMatchValidator),
            Arc::new(NoopProcessor),
        );

        coordinator.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.stop().await;
        coordinator.stop().await;
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn fans_out_events_delivered_after_start() {
        let token_store = Arc::new(InMemoryTokenStore::new());
        let source: Arc<InMemoryMessageSource<u32>> = Arc::new(InMemoryMessageSource::new());
        let coordinator = Coordinator::new(
            "orders",
            test_config(),
            token_store,
            source.clone(),
            Arc::new(SegmentMatchValidator),
            Arc::new(NoopProcessor),
        );

        coordinator.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        source.append(0, 99);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let statuses = coordinator.status_registry().all();
        assert!(statuses
            .iter()
            .any(|(_, status)| status.current_token > GlobalSequenceToken::ZERO));

        coordinator.stop().await;
    }

    /// With a cached cursor the reader keeps advancing past a leading run of
    /// events that all belong to one segment, instead of repeatedly
    /// reopening the same `batch_size`-wide window at the laggard's token
    /// and never reaching the event further down the log that the other
    /// segment is waiting on.
    #[tokio::test]
    async fn reader_advances_past_events_for_other_segments() {
        let token_store = Arc::new(InMemoryTokenStore::new());
        let source: Arc<InMemoryMessageSource<u32>> = Arc::new(InMemoryMessageSource::new());
        let config = Arc::new(
            ConfigurationBuilder::new()
                .name("orders")
                .initial_segment_count(2)
                .batch_size(1)
                .worker_executor(Arc::new(TokioExecutor))
                .coordinator_executor(Arc::new(TokioExecutor))
                .build()
                .unwrap(),
        );
        let coordinator = Coordinator::new(
            "orders",
            config,
            token_store,
            source.clone(),
            Arc::new(SegmentMatchValidator),
            Arc::new(NoopProcessor),
        );

        source.append(0, 1);
        source.append(0, 2);
        source.append(1, 3);

        coordinator.start();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let statuses = coordinator.status_registry().all();
        let segment_one = statuses
            .iter()
            .find(|(id, _)| *id == 1)
            .expect("segment 1 status present");
        assert_eq!(segment_one.1.current_token, GlobalSequenceToken::new(3));

        coordinator.stop().await;
    }
}
