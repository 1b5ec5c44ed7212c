use serde::{Deserialize, Serialize};

/// A logical partition of the event stream, identified within
/// `[0, segment_count)` and deciding membership by `key_hash % segment_count`.
/// Segments never change identity for the lifetime of a processor —
/// splitting or merging them is out of scope here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    segment_id: u32,
    segment_count: u32,
}

impl Segment {
    pub fn new(segment_id: u32, segment_count: u32) -> Self {
        Segment {
            segment_id,
            segment_count,
        }
    }

    /// The default segment set a Coordinator bootstraps with: `count`
    /// segments, each owning one residue class mod `count`.
    pub fn initial(count: u32) -> Vec<Segment> {
        (0..count).map(|id| Segment::new(id, count)).collect()
    }

    pub fn id(&self) -> u32 {
        self.segment_id
    }

    /// True iff this segment owns `key_hash` under `key_hash % segment_count`.
    /// Plain modulo rather than a power-of-two bitmask, so any
    /// `segment_count >= 1` partitions the hash space exactly — no segment
    /// id goes unclaimed the way a rounded-up bitmask would for a
    /// non-power-of-two count.
    pub fn matches(&self, key_hash: u64) -> bool {
        (key_hash % self.segment_count as u64) as u32 == self.segment_id
    }
}
