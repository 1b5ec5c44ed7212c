use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ProcessorError;
use crate::event::EventMessage;
use crate::token::GlobalSequenceToken;

/// A forward-only, single-consumer cursor over tracked events, opened at a
/// position by `MessageSource::open_stream`. Events come out in
/// non-decreasing token order.
#[async_trait]
pub trait EventStream<P>: Send {
    async fn next_batch(&mut self, max: usize) -> Result<Vec<EventMessage<P>>, ProcessorError>;
}

/// Produces a positional stream of tracked events. `open_stream` supports
/// opening at any previously-observed token, which is how the Coordinator
/// replays from `min(claimedTokens)` after a rebalance.
#[async_trait]
pub trait MessageSource<P>: Send + Sync {
    async fn open_stream(
        &self,
        at: GlobalSequenceToken,
    ) -> Result<Box<dyn EventStream<P> + Send>, ProcessorError>;

    /// Only used for bootstrap: the token a brand new segment should start
    /// at when there is no prior position to resume from.
    fn create_tail_token(&self) -> GlobalSequenceToken;
}

/// An in-memory, append-only event log. Every event carries a routing key a
/// `Segment` tests membership against; tokens are assigned by append order.
pub struct InMemoryMessageSource<P> {
    events: Mutex<Vec<EventMessage<P>>>,
}

impl<P: Clone> InMemoryMessageSource<P> {
    pub fn new() -> Self {
        InMemoryMessageSource {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Appends `payload` under the next sequential token, returning it.
    pub fn append(&self, routing_key: u64, payload: P) -> GlobalSequenceToken {
        let mut events = self.events.lock().expect("message source poisoned");
        let token = GlobalSequenceToken::new(events.len() as u64 + 1);
        events.push(EventMessage::new(token, routing_key, payload));
        token
    }
}

impl<P: Clone> Default for InMemoryMessageSource<P> {
    fn default() -> Self {
        InMemoryMessageSource::new()
    }
}

struct VecCursor<P> {
    events: Vec<EventMessage<P>>,
    position: usize,
}

#[async_trait]
impl<P: Clone + Send> EventStream<P> for VecCursor<P> {
    async fn next_batch(&mut self, max: usize) -> Result<Vec<EventMessage<P>>, ProcessorError> {
        let end = (self.position + max).min(self.events.len());
        let batch = self.events[self.position..end].to_vec();
        self.position = end;
        Ok(batch)
    }
}

#[async_trait]
impl<P: Clone + Send + Sync + 'static> MessageSource<P> for InMemoryMessageSource<P> {
    async fn open_stream(
        &self,
        at: GlobalSequenceToken,
    ) -> Result<Box<dyn EventStream<P> + Send>, ProcessorError> {
        let events = self.events.lock().expect("message source poisoned");
        let position = events.partition_point(|e| e.token() <= at);
        Ok(Box::new(VecCursor {
            events: events.clone(),
            position,
        }))
    }

    fn create_tail_token(&self) -> GlobalSequenceToken {
        let events = self.events.lock().expect("message source poisoned");
        events
            .last()
            .map(|e| e.token())
            .unwrap_or(GlobalSequenceToken::ZERO)
    }
}
