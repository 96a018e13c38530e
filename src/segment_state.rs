use serde::{Deserialize, Serialize};

/// Lifecycle of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentState {
    /// Not allocated, may be handed out.
    Free,
    /// Receiving writes.
    Nvram,
    /// Fully written and destaged, holding valid blocks.
    Ssd,
    /// Selected by GC for copy-out.
    Victim,
}

impl SegmentState {
    pub fn can_transition_to(&self, next: SegmentState) -> bool {
        use SegmentState::*;

        match (self, next) {
            (Free, Nvram) => true,
            (Free, _) => false,
            (Nvram, Ssd) => true,
            (Nvram, Free) => true,
            (Nvram, _) => false,
            (Ssd, Victim) => true,
            (Ssd, Free) => true,
            (Ssd, _) => false,
            (Victim, Free) => true,
            (Victim, Ssd) => true,
            (Victim, _) => false,
        }
    }

    /// Moves to `next`, aborting on an illegal transition.
    pub(crate) fn transition(&mut self, next: SegmentState, segment_id: u32) {
        assert!(
            self.can_transition_to(next),
            "segment {} performed illegal state transition from {:?} to {:?}. \
             please report this bug!",
            segment_id,
            self,
            next
        );
        log::trace!("segment {} {:?} -> {:?}", segment_id, self, next);
        *self = next;
    }
}
