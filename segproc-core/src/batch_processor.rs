use async_trait::async_trait;

use crate::error::ProcessorError;
use crate::event::EventMessage;
use crate::segment::Segment;

/// The scope of a single batch's commit. The core never constructs one
/// except to pass it through to the handler — the transaction manager that
/// would back this in a real deployment is named in scope-out (§1) and has
/// no implementation here.
pub struct UnitOfWork {
    segment: Segment,
}

impl UnitOfWork {
    pub fn new(segment: Segment) -> Self {
        UnitOfWork { segment }
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }
}

/// Invokes the user's handler for an accepted batch inside a unit of work.
/// Returning `Err` signals handler failure and terminates the owning Work
/// Package with that cause; the commit itself is assumed to have already
/// happened (or rolled back) inside `process_batch` before it returns.
#[async_trait]
pub trait BatchProcessor<P>: Send + Sync {
    async fn process_batch(
        &self,
        events: &[EventMessage<P>],
        unit_of_work: &UnitOfWork,
        segment: &Segment,
    ) -> Result<(), ProcessorError>;
}
