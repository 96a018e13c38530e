//! The copier is the long-lived event driving garbage collection. It
//! loops over picking a victim, starting the stripe copy submission for
//! it and waiting for every stripe of the victim to have its copies
//! issued. The cycle is recorded in the GC status once those copies
//! complete, which may be after the next victim was picked.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::gc::{
    CopierMeta, CopyPipeline, GcDependencies, GcStatus, StripeCopySubmission,
};
use crate::scheduler::{Event, EventRef};
use crate::{Config, GcMode, SegmentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CopierState {
    ThresholdCheck,
    CopyPrepare,
    CopyComplete,
    ReadyToEnd,
}

#[derive(Debug)]
struct CopierProgress {
    state: CopierState,
    victim: Option<SegmentId>,
    slot: Option<usize>,
}

pub struct Copier {
    meta: Arc<CopierMeta>,
    status: Arc<GcStatus>,
    progress: Mutex<CopierProgress>,
    threshold_check: AtomicBool,
    stop_requested: AtomicBool,
    ready_to_end: AtomicBool,
    paused: AtomicBool,
}

impl fmt::Debug for Copier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Copier")
            .field("progress", &*self.progress.lock())
            .field("stopping", &self.is_stopped())
            .field("paused", &self.is_paused())
            .field("meta", &self.meta)
            .finish()
    }
}

impl Copier {
    pub fn new(
        config: &Config,
        deps: GcDependencies,
        status: Arc<GcStatus>,
    ) -> Arc<Copier> {
        Arc::new(Copier {
            meta: Arc::new(CopierMeta::new(config, deps, status.clone())),
            status,
            progress: Mutex::new(CopierProgress {
                state: CopierState::ThresholdCheck,
                victim: None,
                slot: None,
            }),
            threshold_check: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
            ready_to_end: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> CopierState {
        self.progress.lock().state
    }

    pub fn meta(&self) -> &Arc<CopierMeta> {
        &self.meta
    }

    fn threshold_check_state(&self, progress: &mut CopierProgress) {
        let context = self.meta.context();
        let mode = context.current_gc_mode();
        if self.threshold_check.load(Ordering::Acquire) && mode == GcMode::NoGc {
            return;
        }

        let Some(victim) = context.allocate_gc_victim_segment() else {
            return;
        };

        log::debug!(
            "gc picked victim segment {} in mode {:?} with {} free segments",
            victim,
            mode,
            context.num_free_segments()
        );
        if mode == GcMode::Normal {
            context.permit_user_blk_alloc();
        }
        self.status.begin_copy(victim);
        progress.victim = Some(victim);
        progress.state = CopierState::CopyPrepare;
    }

    fn copy_prepare_state(&self, progress: &mut CopierProgress) {
        let Some(victim) = progress.victim else {
            progress.state = CopierState::ThresholdCheck;
            return;
        };
        // the previous victim may still hold both slots
        let Some(slot) = self.meta.acquire_victim_slot(victim) else {
            return;
        };

        let submission = StripeCopySubmission::new(self.meta.clone(), slot);
        self.meta.scheduler().enqueue_event(Arc::new(submission));

        progress.slot = Some(slot);
        progress.state = CopierState::CopyComplete;
    }

    fn copy_complete_state(&self, progress: &mut CopierProgress) {
        let (Some(victim), Some(slot)) = (progress.victim, progress.slot) else {
            progress.state = CopierState::ThresholdCheck;
            return;
        };
        if !self.meta.is_copy_issued(slot) {
            return;
        }

        log::debug!(
            "copies of victim segment {} issued, {} valid blocks",
            victim,
            self.meta.issued_block_count(slot)
        );

        progress.victim = None;
        progress.slot = None;
        progress.state = CopierState::ThresholdCheck;
        self.threshold_check.store(true, Ordering::Release);
    }

    fn stop_state(&self, progress: &mut CopierProgress) {
        if !self.meta.is_all_victim_segment_copy_done() {
            return;
        }

        let stripe_manager = self.meta.stripe_manager();
        stripe_manager.flush_active_stripes();
        if !stripe_manager.is_all_finished() {
            return;
        }

        log::info!("copier stopped");
        progress.state = CopierState::ReadyToEnd;
        self.stop_requested.store(false, Ordering::Release);
    }
}

impl Event for Copier {
    fn execute(&self) -> bool {
        let mut progress = self.progress.lock();

        if progress.state == CopierState::ReadyToEnd {
            return self.ready_to_end.load(Ordering::Acquire);
        }
        if self.stop_requested.load(Ordering::Acquire) {
            self.stop_state(&mut progress);
            return false;
        }
        if self.is_paused() {
            return false;
        }

        match progress.state {
            CopierState::ThresholdCheck => self.threshold_check_state(&mut progress),
            CopierState::CopyPrepare => self.copy_prepare_state(&mut progress),
            CopierState::CopyComplete => self.copy_complete_state(&mut progress),
            CopierState::ReadyToEnd => {}
        }
        false
    }

    fn name(&self) -> &'static str {
        "copier"
    }
}

impl CopyPipeline for Copier {
    fn stop(&self) {
        log::info!("stopping copier");
        self.stop_requested.store(true, Ordering::Release);
    }

    fn is_stopped(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    fn ready_to_end(&self) {
        self.ready_to_end.store(true, Ordering::Release);
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn disable_threshold_check(&self) {
        self.threshold_check.store(false, Ordering::Release);
    }

    fn is_threshold_check_enabled(&self) -> bool {
        self.threshold_check.load(Ordering::Acquire)
    }

    fn copy_error_count(&self) -> u64 {
        self.meta.copy_error_count()
    }

    fn as_event(self: Arc<Self>) -> EventRef {
        self
    }
}
