use crate::event::EventMessage;
use crate::segment::Segment;

/// Decides whether a given segment should handle a given event. Pure from
/// the core's point of view; any side effects a host attaches to its own
/// implementation are the host's business.
pub trait EventValidator<P>: Send + Sync {
    fn should_handle(&self, event: &EventMessage<P>, segment: &Segment) -> bool;
}

/// The default validator: a segment handles an event iff its mask matches
/// the event's routing key, with no further filtering.
pub struct SegmentMatchValidator;

impl<P> EventValidator<P> for SegmentMatchValidator {
    fn should_handle(&self, event: &EventMessage<P>, segment: &Segment) -> bool {
        segment.matches(event.routing_key())
    }
}
