use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;

use crate::batch_processor::{BatchProcessor, UnitOfWork};
use crate::config::Configuration;
use crate::error::AbortCause;
use crate::event::EventMessage;
use crate::segment::Segment;
use crate::status::{StatusRegistry, TrackerStatus};
use crate::token::GlobalSequenceToken;
use crate::token_store::TokenStore;
use crate::validator::EventValidator;

#[derive(Clone)]
enum WpState {
    Active,
    Aborting(Option<AbortCause>),
    Terminated(Option<AbortCause>),
}

/// Per-segment worker: ingests events, filters them through the validator,
/// batches accepted ones into the batch processor, advances and persists
/// its token, and extends its claim while idle.
///
/// Every public method that can trigger the processing routine takes
/// `self: &Arc<Self>` — the routine runs as a detached task on the worker
/// executor, so scheduling it means handing out another owning reference.
pub struct WorkPackage<P> {
    segment: Segment,
    processor_name: String,
    inbox_tx: mpsc::Sender<EventMessage<P>>,
    inbox_rx: AsyncMutex<mpsc::Receiver<EventMessage<P>>>,
    inbox_size: AtomicUsize,
    last_delivered: StdMutex<GlobalSequenceToken>,
    last_stored: StdMutex<GlobalSequenceToken>,
    last_store_time: StdMutex<Instant>,
    scheduled: AtomicBool,
    state: watch::Sender<WpState>,
    config: Arc<Configuration>,
    token_store: Arc<dyn TokenStore>,
    validator: Arc<dyn EventValidator<P>>,
    batch_processor: Arc<dyn BatchProcessor<P>>,
    status: Arc<StatusRegistry>,
}

impl<P> WorkPackage<P>
where
    P: Send + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        segment: Segment,
        processor_name: String,
        initial_token: GlobalSequenceToken,
        config: Arc<Configuration>,
        token_store: Arc<dyn TokenStore>,
        validator: Arc<dyn EventValidator<P>>,
        batch_processor: Arc<dyn BatchProcessor<P>>,
        status: Arc<StatusRegistry>,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity);
        let (state_tx, _state_rx) = watch::channel(WpState::Active);
        status.update_with(segment.id(), |_| {
            Some(TrackerStatus::initial(segment, initial_token))
        });
        Arc::new(WorkPackage {
            segment,
            processor_name,
            inbox_tx,
            inbox_rx: AsyncMutex::new(inbox_rx),
            inbox_size: AtomicUsize::new(0),
            last_delivered: StdMutex::new(initial_token),
            last_stored: StdMutex::new(initial_token),
            last_store_time: StdMutex::new(Instant::now()),
            scheduled: AtomicBool::new(false),
            state: state_tx,
            config,
            token_store,
            validator,
            batch_processor,
            status,
        })
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }

    pub fn last_delivered_token(&self) -> GlobalSequenceToken {
        *self.last_delivered.lock().expect("work package poisoned")
    }

    pub fn last_stored_token(&self) -> GlobalSequenceToken {
        *self.last_stored.lock().expect("work package poisoned")
    }

    pub fn has_remaining_capacity(&self) -> bool {
        self.inbox_size.load(Ordering::SeqCst) < self.config.inbox_capacity
    }

    pub fn is_abort_triggered(&self) -> bool {
        !matches!(&*self.state.borrow(), WpState::Active)
    }

    /// True once the processing routine has published `absent` and exited
    /// for good — the Coordinator uses this to prune its live-package map
    /// and release the segment's claim.
    pub fn is_terminated(&self) -> bool {
        matches!(&*self.state.borrow(), WpState::Terminated(_))
    }

    /// Enqueue an event whose token is strictly greater than
    /// `last_delivered_token`; events already covered are silently dropped.
    pub fn schedule_event(self: &Arc<Self>, event: EventMessage<P>) {
        if self.is_abort_triggered() {
            return;
        }
        let token = event.token();
        {
            let mut last = self.last_delivered.lock().expect("work package poisoned");
            if last.covers(&token) {
                return;
            }
            if self.inbox_tx.try_send(event).is_err() {
                return;
            }
            *last = token;
        }
        self.inbox_size.fetch_add(1, Ordering::SeqCst);
        self.ensure_scheduled();
    }

    /// Ensure the routine runs even with no new event — used by the
    /// Coordinator to drive claim extension on idle packages.
    pub fn schedule_worker(self: &Arc<Self>) {
        self.ensure_scheduled();
    }

    fn ensure_scheduled(self: &Arc<Self>) {
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let this = Arc::clone(self);
            let executor = Arc::clone(&self.config.worker_executor);
            executor.spawn(Box::pin(async move {
                this.process_pass().await;
            }));
        }
    }

    /// Idempotent: repeated calls all resolve to the *first* recorded cause.
    pub async fn abort(self: &Arc<Self>, cause: Option<AbortCause>) -> Option<AbortCause> {
        let mut rx = self.state.subscribe();
        let _ = self.state.send_if_modified(|state| {
            if matches!(state, WpState::Active) {
                *state = WpState::Aborting(cause.clone());
                true
            } else {
                false
            }
        });
        self.ensure_scheduled();
        loop {
            if let WpState::Terminated(recorded) = &*rx.borrow_and_update() {
                return recorded.clone();
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Aborts with no cause and resolves with `last_stored_token` after the
    /// final processing pass.
    pub async fn stop_package(self: &Arc<Self>) -> GlobalSequenceToken {
        self.abort(None).await;
        self.last_stored_token()
    }

    fn inbox_is_empty(&self) -> bool {
        self.inbox_size.load(Ordering::SeqCst) == 0
    }

    fn terminate(&self, cause: Option<AbortCause>) {
        self.status.update_with(self.segment.id(), |_| None);
        let _ = self.state.send(WpState::Terminated(cause));
        self.scheduled.store(false, Ordering::SeqCst);
    }

    /// The processing routine: at most one in-flight per package, enforced
    /// by the `scheduled` claim flag plus this single-runnable resubmission
    /// loop — the routine is never more than once in the executor's queue.
    async fn process_pass(self: Arc<Self>) {
        loop {
            if let WpState::Aborting(cause) = &*self.state.borrow() {
                let cause = cause.clone();
                self.terminate(cause);
                return;
            }

            let mut accepted = Vec::new();
            let mut drained_tokens = Vec::new();
            {
                let mut rx = self.inbox_rx.lock().await;
                for _ in 0..self.config.batch_size {
                    match rx.try_recv() {
                        Ok(event) => {
                            self.inbox_size.fetch_sub(1, Ordering::SeqCst);
                            drained_tokens.push(event.token());
                            if self.validator.should_handle(&event, &self.segment) {
                                accepted.push(event);
                            }
                        }
                        Err(_) => break,
                    }
                }
            }

            if !accepted.is_empty() {
                let unit_of_work = UnitOfWork::new(self.segment);
                if let Err(err) = self
                    .batch_processor
                    .process_batch(&accepted, &unit_of_work, &self.segment)
                    .await
                {
                    let cause: AbortCause = Arc::new(err);
                    let current_position = self.last_delivered_token();
                    self.status.update_with(self.segment.id(), |existing| {
                        let base = existing
                            .unwrap_or_else(|| TrackerStatus::initial(self.segment, current_position));
                        Some(base.with_error(cause.clone()))
                    });
                    self.state.send_if_modified(|state| {
                        if matches!(state, WpState::Active) {
                            *state = WpState::Aborting(Some(cause.clone()));
                            true
                        } else {
                            false
                        }
                    });
                    continue;
                }
            }

            if let Some(new_token) = drained_tokens.iter().copied().max() {
                let should_store = new_token > self.last_stored_token();
                if should_store {
                    match self
                        .token_store
                        .store_token(new_token, &self.processor_name, self.segment.id())
                        .await
                    {
                        Ok(()) => {
                            *self.last_stored.lock().expect("work package poisoned") = new_token;
                            *self.last_store_time.lock().expect("work package poisoned") =
                                Instant::now();
                            self.status.update_with(self.segment.id(), |existing| {
                                Some(
                                    existing
                                        .unwrap_or_else(|| {
                                            TrackerStatus::initial(self.segment, new_token)
                                        })
                                        .with_position(new_token),
                                )
                            });
                        }
                        Err(err) => {
                            tracing::warn!(
                                segment = self.segment.id(),
                                error = %err,
                                "storeToken failed, will retry next pass"
                            );
                        }
                    }
                }
            }

            if accepted.is_empty() {
                let stale = {
                    let last = *self.last_store_time.lock().expect("work package poisoned");
                    last.elapsed() >= self.config.claim_extension_threshold
                };
                if stale {
                    match self
                        .token_store
                        .extend_claim(&self.processor_name, self.segment.id())
                        .await
                    {
                        Ok(()) => {
                            *self.last_store_time.lock().expect("work package poisoned") =
                                Instant::now();
                        }
                        Err(err) => {
                            tracing::warn!(
                                segment = self.segment.id(),
                                error = %err,
                                "extendClaim failed"
                            );
                        }
                    }
                }
            }

            if self.inbox_is_empty() {
                self.scheduled.store(false, Ordering::SeqCst);
                if !self.inbox_is_empty()
                    && self
                        .scheduled
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    continue;
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    use crate::error::ProcessorError;
    use crate::executor::TokioExecutor;
    use crate::token_store::InMemoryTokenStore;
    use crate::validator::SegmentMatchValidator;

    struct AcceptAll;
    impl EventValidator<u32> for AcceptAll {
        fn should_handle(&self, _event: &EventMessage<u32>, _segment: &Segment) -> bool {
            true
        }
    }

    struct RejectAll;
    impl EventValidator<u32> for RejectAll {
        fn should_handle(&self, _event: &EventMessage<u32>, _segment: &Segment) -> bool {
            false
        }
    }

    struct RecordingProcessor {
        seen: StdMutex<Vec<u64>>,
        fail_on: Option<u64>,
    }

    impl RecordingProcessor {
        fn new() -> Arc<Self> {
            Arc::new(RecordingProcessor {
                seen: StdMutex::new(Vec::new()),
                fail_on: None,
            })
        }

        fn failing_on(token: u64) -> Arc<Self> {
            Arc::new(RecordingProcessor {
                seen: StdMutex::new(Vec::new()),
                fail_on: Some(token),
            })
        }
    }

    #[async_trait]
    impl BatchProcessor<u32> for RecordingProcessor {
        async fn process_batch(
            &self,
            events: &[EventMessage<u32>],
            _unit_of_work: &UnitOfWork,
            _segment: &Segment,
        ) -> Result<(), ProcessorError> {
            for event in events {
                if Some(event.token().0) == self.fail_on {
                    return Err(ProcessorError::HandlerFailure("boom".to_string()));
                }
                self.seen.lock().unwrap().push(event.token().0);
            }
            Ok(())
        }
    }

    async fn new_package(
        validator: Arc<dyn EventValidator<u32>>,
        processor: Arc<dyn BatchProcessor<u32>>,
    ) -> (Arc<WorkPackage<u32>>, Arc<InMemoryTokenStore>, Arc<StatusRegistry>) {
        let token_store = Arc::new(InMemoryTokenStore::new());
        token_store
            .initialize_token_segments("proc", 1, GlobalSequenceToken::ZERO)
            .await
            .unwrap();
        token_store.fetch_token("proc", 0).await.unwrap();
        let status = Arc::new(StatusRegistry::new());
        let config = Arc::new(
            crate::config::ConfigurationBuilder::new()
                .name("proc")
                .worker_executor(Arc::new(TokioExecutor))
                .coordinator_executor(Arc::new(TokioExecutor))
                .claim_extension_threshold(Duration::from_millis(1))
                .build()
                .unwrap(),
        );
        let package = WorkPackage::new(
            Segment::new(0, 1),
            "proc".to_string(),
            GlobalSequenceToken::ZERO,
            config,
            token_store.clone(),
            validator,
            processor,
            status.clone(),
        );
        (package, token_store, status)
    }

    #[tokio::test]
    async fn already_covered_event_is_dropped() {
        let (package, _store, _status) =
            new_package(Arc::new(AcceptAll), RecordingProcessor::new()).await;
        package.schedule_event(EventMessage::new(GlobalSequenceToken::ZERO, 0, 0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(package.last_delivered_token(), GlobalSequenceToken::ZERO);
        assert!(package.has_remaining_capacity());
    }

    #[tokio::test]
    async fn happy_path_stores_token_once() {
        let processor = RecordingProcessor::new();
        let (package, store, status) =
            new_package(Arc::new(AcceptAll), processor.clone()).await;
        package.schedule_event(EventMessage::new(GlobalSequenceToken::new(1), 0, 42));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.seen.lock().unwrap().as_slice(), &[1]);
        assert_eq!(package.last_stored_token(), GlobalSequenceToken::new(1));
        assert_eq!(
            store.fetch_segments("proc").await.unwrap(),
            vec![0]
        );
        let snapshot = status.snapshot(0).unwrap();
        assert_eq!(snapshot.current_token, GlobalSequenceToken::new(1));
    }

    #[tokio::test]
    async fn handler_failure_publishes_error_then_absent() {
        let processor = RecordingProcessor::failing_on(1);
        let (package, _store, status) =
            new_package(Arc::new(AcceptAll), processor).await;
        package.schedule_event(EventMessage::new(GlobalSequenceToken::new(1), 0, 1));
        let cause = package.abort(None).await;
        assert!(cause.is_some());
        assert!(status.snapshot(0).is_none());
    }

    #[tokio::test]
    async fn rejected_only_batch_still_advances_token() {
        let (package, store, _status) =
            new_package(Arc::new(RejectAll), RecordingProcessor::new()).await;
        package.schedule_event(EventMessage::new(GlobalSequenceToken::new(1), 0, 7));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(package.last_stored_token(), GlobalSequenceToken::new(1));
        let _ = store;
    }

    #[tokio::test]
    async fn abort_precedence_keeps_first_cause() {
        let (package, _store, _status) =
            new_package(Arc::new(SegmentMatchValidator), RecordingProcessor::new()).await;
        let first = Arc::new(ProcessorError::HandlerFailure("first".to_string()));
        let second = Arc::new(ProcessorError::HandlerFailure("second".to_string()));

        let package_a = package.clone();
        let first_clone = first.clone();
        let handle_a = tokio::spawn(async move { package_a.abort(Some(first_clone)).await });
        let resolved_b = package.abort(Some(second)).await;
        let resolved_a = handle_a.await.unwrap();

        assert_eq!(resolved_a.unwrap().to_string(), first.to_string());
        assert_eq!(resolved_b.unwrap().to_string(), first.to_string());
    }

    #[tokio::test]
    async fn claim_extension_fires_after_threshold() {
        let processor = RecordingProcessor::new();
        let (package, store, _status) =
            new_package(Arc::new(AcceptAll), processor).await;
        package.schedule_event(EventMessage::new(GlobalSequenceToken::new(1), 0, 1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        package.schedule_worker();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // the claim is still held after the idle pass observed the stale
        // threshold and renewed it.
        assert!(store.extend_claim("proc", 0).await.is_ok());
    }
}
