use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::gc::{CopierMeta, StripeCopier};
use crate::scheduler::Event;

/// Loads the reverse map of every stripe of a victim segment and, once
/// all loads settled, starts one stripe copier per copy lane.
#[derive(Debug)]
pub struct StripeCopySubmission {
    meta: Arc<CopierMeta>,
    slot: usize,
    loads_issued: AtomicBool,
}

impl StripeCopySubmission {
    pub fn new(meta: Arc<CopierMeta>, slot: usize) -> StripeCopySubmission {
        StripeCopySubmission { meta, slot, loads_issued: AtomicBool::new(false) }
    }

    fn is_ready_to_copy(&self) -> bool {
        self.meta.victim_stripes(self.slot).iter().all(|victim| victim.is_load_settled())
    }
}

impl Event for StripeCopySubmission {
    fn execute(&self) -> bool {
        if !self.loads_issued.swap(true, Ordering::AcqRel) {
            let base = self.meta.base_stripe(self.slot);
            for (offset, victim) in self.meta.victim_stripes(self.slot).iter().enumerate() {
                victim.load(base + offset as u32);
            }
        }

        if !self.is_ready_to_copy() {
            return false;
        }

        let lanes = self.meta.copy_lanes().min(self.meta.address_info().stripes_per_segment);
        log::debug!(
            "starting {} copy lanes for victim segment {}",
            lanes,
            self.meta.victim_segment(self.slot)
        );
        for lane in 0..lanes {
            let copier = StripeCopier::new(self.meta.clone(), self.slot, lane);
            self.meta.scheduler().enqueue_event(Arc::new(copier));
        }
        true
    }

    fn name(&self) -> &'static str {
        "stripe copy submission"
    }
}
