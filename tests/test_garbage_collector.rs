mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use logseg::gc::{CopierFactory, CopyPipeline, GarbageCollector, GcStatus};
use logseg::scheduler::{Event, EventRef, ManualScheduler};
use logseg::state::{StateManager, SystemState};
use logseg::{Error, SegmentState};

use common::{Harness, small_config};

/// Reports itself stopped after `stop_polls` polls of `is_stopped`.
#[derive(Default)]
struct MockPipeline {
    stop_polls: AtomicUsize,
    stopping: AtomicBool,
    ready: AtomicBool,
    paused: AtomicBool,
    threshold_disabled: AtomicBool,
}

impl Event for MockPipeline {
    fn execute(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl CopyPipeline for MockPipeline {
    fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        if !self.stopping.load(Ordering::SeqCst) {
            return false;
        }
        let left = self.stop_polls.load(Ordering::SeqCst);
        if left == 0 {
            self.stopping.store(false, Ordering::SeqCst);
            return false;
        }
        self.stop_polls.store(left - 1, Ordering::SeqCst);
        true
    }

    fn ready_to_end(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn disable_threshold_check(&self) {
        self.threshold_disabled.store(true, Ordering::SeqCst);
    }

    fn is_threshold_check_enabled(&self) -> bool {
        !self.threshold_disabled.load(Ordering::SeqCst)
    }

    fn copy_error_count(&self) -> u64 {
        7
    }

    fn as_event(self: Arc<Self>) -> EventRef {
        self
    }
}

struct Fixture {
    h: Harness,
    state: Arc<StateManager>,
    scheduler: Arc<ManualScheduler>,
    built: Arc<Mutex<Vec<Arc<MockPipeline>>>>,
    gc: Arc<GarbageCollector>,
}

fn fixture(available: bool) -> Fixture {
    common::setup_logger();
    let h = Harness::new(small_config());
    let state = Arc::new(StateManager::new(SystemState::Normal));
    let scheduler = ManualScheduler::new();
    let built: Arc<Mutex<Vec<Arc<MockPipeline>>>> = Arc::default();

    let factory: CopierFactory = {
        let built = built.clone();
        Box::new(move |_status| {
            if !available {
                return None;
            }
            let pipeline = Arc::new(MockPipeline {
                stop_polls: AtomicUsize::new(3),
                ..MockPipeline::default()
            });
            built.lock().push(pipeline.clone());
            let pipeline: Arc<dyn CopyPipeline> = pipeline;
            Some(pipeline)
        })
    };

    let gc = GarbageCollector::new(
        h.context.clone(),
        state.clone(),
        scheduler.clone(),
        Arc::new(GcStatus::new(4)),
        factory,
    );

    Fixture { h, state, scheduler, built, gc }
}

#[test]
fn init_subscribes_and_starts_once() {
    let f = fixture(true);
    f.gc.init().unwrap();

    assert!(f.gc.is_running());
    assert!(f.gc.status().is_running());
    assert!(f.state.is_subscribed("gc"));
    assert_eq!(f.scheduler.len(), 1);

    f.gc.start().unwrap();
    assert_eq!(f.built.lock().len(), 1);
    assert_eq!(f.scheduler.len(), 1);
    assert_eq!(f.gc.copy_error_count(), 7);
}

#[test]
fn init_without_a_copier_unsubscribes() {
    let f = fixture(false);
    assert_eq!(f.gc.init(), Err(Error::CopierUnavailable));
    assert!(!f.state.is_subscribed("gc"));
    assert!(!f.gc.is_running());
    assert!(f.scheduler.is_empty());
}

#[test]
fn controls_need_an_active_copier() {
    let f = fixture(true);
    assert_eq!(f.gc.pause(), Err(Error::NoActiveCopier));
    assert_eq!(f.gc.resume(), Err(Error::NoActiveCopier));
    assert_eq!(f.gc.disable_threshold_check(), Err(Error::NoActiveCopier));
    assert!(!f.gc.is_paused());
    assert_eq!(f.gc.copy_error_count(), 0);
    // ending an idle collector does nothing
    f.gc.end();

    f.gc.start().unwrap();
    f.gc.pause().unwrap();
    assert!(f.gc.is_paused());
    f.gc.resume().unwrap();
    assert!(!f.gc.is_paused());

    f.gc.disable_threshold_check().unwrap();
    assert!(!f.built.lock()[0].is_threshold_check_enabled());
    assert_eq!(
        f.gc.disable_threshold_check(),
        Err(Error::ThresholdCheckAlreadyDisabled)
    );
}

#[test]
fn system_state_gates_and_pauses() {
    let f = fixture(true);
    f.gc.init().unwrap();
    assert!(f.gc.is_enabled());

    f.state.set_state(SystemState::Busy);
    assert!(f.gc.is_enabled());
    assert!(!f.gc.is_paused());

    f.state.set_state(SystemState::Pause);
    assert!(!f.gc.is_enabled());
    assert!(f.gc.is_paused());

    f.state.set_state(SystemState::Stop);
    assert!(f.gc.is_paused());

    f.state.set_state(SystemState::Normal);
    assert!(f.gc.is_enabled());
    assert!(!f.gc.is_paused());
}

#[test]
fn end_waits_for_the_copier_and_resets_victims() {
    let f = fixture(true);
    f.h.write_blocks(0..16, 1);
    assert_eq!(f.h.context.allocate_gc_victim_segment(), Some(0));
    assert_eq!(f.h.context.segment_state(0), SegmentState::Victim);

    f.gc.init().unwrap();
    f.gc.end();

    let first = f.built.lock()[0].clone();
    assert!(!first.stopping.load(Ordering::SeqCst));
    assert_eq!(first.stop_polls.load(Ordering::SeqCst), 0);
    assert!(first.ready.load(Ordering::SeqCst));
    assert!(f.scheduler.run_until_idle(10));

    assert!(!f.gc.is_running());
    assert!(!f.gc.status().is_running());
    assert!(f.gc.status().gc_end_time().is_some());
    assert_eq!(f.h.context.segment_state(0), SegmentState::Ssd);

    f.gc.start().unwrap();
    assert_eq!(f.built.lock().len(), 2);
    f.gc.shutdown();
    assert!(!f.state.is_subscribed("gc"));
}
