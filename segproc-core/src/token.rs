use serde::{Deserialize, Serialize};

/// Opaque, totally ordered position in the event stream.
///
/// The core only ever needs to compare tokens and ask "does this one cover
/// that one", never inspect their internal structure — so a single global
/// sequence number is enough for every in-memory collaborator and every
/// test double in this crate. A durable store backed by a different
/// representation (vector clocks, per-partition offsets) would implement
/// the same `covers` relation over its own wire format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalSequenceToken(pub u64);

impl GlobalSequenceToken {
    pub const ZERO: GlobalSequenceToken = GlobalSequenceToken(0);

    pub fn new(position: u64) -> Self {
        GlobalSequenceToken(position)
    }

    /// `self.covers(other)` iff `other` is at or before `self`'s position —
    /// i.e. a package already at `self` has no work left to do for `other`.
    pub fn covers(&self, other: &GlobalSequenceToken) -> bool {
        other.0 <= self.0
    }

    pub fn next(&self) -> Self {
        GlobalSequenceToken(self.0 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_is_inclusive_of_equal_tokens() {
        let t = GlobalSequenceToken::new(5);
        assert!(t.covers(&GlobalSequenceToken::new(5)));
        assert!(t.covers(&GlobalSequenceToken::new(4)));
        assert!(!t.covers(&GlobalSequenceToken::new(6)));
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(GlobalSequenceToken::new(1) < GlobalSequenceToken::new(2));
    }
}
