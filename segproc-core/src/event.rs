use crate::token::GlobalSequenceToken;

/// A single immutable unit pulled from the message source: a payload plus
/// the token identifying its position, and the routing key a `Segment`
/// tests membership against.
#[derive(Clone, Debug)]
pub struct EventMessage<P> {
    token: GlobalSequenceToken,
    routing_key: u64,
    payload: P,
}

impl<P> EventMessage<P> {
    pub fn new(token: GlobalSequenceToken, routing_key: u64, payload: P) -> Self {
        EventMessage {
            token,
            routing_key,
            payload,
        }
    }

    pub fn token(&self) -> GlobalSequenceToken {
        self.token
    }

    pub fn routing_key(&self) -> u64 {
        self.routing_key
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}
