//! Starts, stops and steers the copy pipeline.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::gc::{Copier, GcDependencies, GcStatus};
use crate::scheduler::{Event, EventRef, EventScheduler};
use crate::state::{StateControl, StateObserver, SystemState};
use crate::{Config, ContextManager, Error, Result};

const OBSERVER_NAME: &str = "gc";

/// The control surface of a running copy pipeline.
pub trait CopyPipeline: Event {
    /// Requests a cooperative stop.
    fn stop(&self);

    /// True from `stop` until the pipeline drained its in-flight work.
    fn is_stopped(&self) -> bool;

    /// Lets the pipeline's event finish.
    fn ready_to_end(&self);

    fn pause(&self);

    fn resume(&self);

    fn is_paused(&self) -> bool;

    fn disable_threshold_check(&self);

    fn is_threshold_check_enabled(&self) -> bool;

    fn copy_error_count(&self) -> u64;

    fn as_event(self: Arc<Self>) -> EventRef;
}

/// Builds the pipeline of a new GC run. `None` means no pipeline could be
/// built.
pub type CopierFactory =
    Box<dyn Fn(Arc<GcStatus>) -> Option<Arc<dyn CopyPipeline>> + Send + Sync>;

pub struct GarbageCollector {
    context: Arc<ContextManager>,
    state: Arc<dyn StateControl>,
    scheduler: Arc<dyn EventScheduler>,
    factory: CopierFactory,
    status: Arc<GcStatus>,
    copier: Mutex<Option<Arc<dyn CopyPipeline>>>,
}

impl fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("running", &self.is_running())
            .field("status", &self.status)
            .finish()
    }
}

impl GarbageCollector {
    pub fn new(
        context: Arc<ContextManager>,
        state: Arc<dyn StateControl>,
        scheduler: Arc<dyn EventScheduler>,
        status: Arc<GcStatus>,
        factory: CopierFactory,
    ) -> Arc<GarbageCollector> {
        Arc::new(GarbageCollector {
            context,
            state,
            scheduler,
            factory,
            status,
            copier: Mutex::new(None),
        })
    }

    /// A collector whose runs are driven by `Copier`.
    pub fn with_copier(
        config: &Config,
        deps: GcDependencies,
        state: Arc<dyn StateControl>,
    ) -> Arc<GarbageCollector> {
        let status = Arc::new(GcStatus::new(config.gc_history_capacity));
        let context = deps.context.clone();
        let scheduler = deps.scheduler.clone();
        let config = config.clone();
        let factory: CopierFactory = Box::new(move |status| {
            let copier: Arc<dyn CopyPipeline> = Copier::new(&config, deps.clone(), status);
            Some(copier)
        });
        GarbageCollector::new(context, state, scheduler, status, factory)
    }

    /// Subscribes to system state changes and starts a first run.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        let observer = Arc::new(GcStateObserver { gc: Arc::downgrade(self) });
        self.state.subscribe(observer, OBSERVER_NAME);

        if let Err(e) = self.start() {
            log::error!("garbage collector failed to start: {}", e);
            self.state.unsubscribe(OBSERVER_NAME);
            return Err(e);
        }
        Ok(())
    }

    /// Ends the current run and stops following system state.
    pub fn shutdown(&self) {
        self.end();
        self.state.unsubscribe(OBSERVER_NAME);
    }

    /// Starts a run unless one is active. System state is not consulted,
    /// see `is_enabled`.
    pub fn start(&self) -> Result<()> {
        let mut copier = self.copier.lock();
        if copier.is_some() {
            return Ok(());
        }

        let Some(pipeline) = (self.factory)(self.status.clone()) else {
            return Err(Error::CopierUnavailable);
        };

        self.status.set_gc_running(true);
        self.scheduler.enqueue_event(pipeline.clone().as_event());
        *copier = Some(pipeline);

        log::info!("garbage collection started");
        Ok(())
    }

    /// Stops the active run and waits for its pipeline to drain. The wait
    /// is unbounded; a slow pipeline is reported periodically.
    pub fn end(&self) {
        let Some(copier) = self.copier.lock().clone() else {
            log::debug!("garbage collection is not running");
            return;
        };

        copier.stop();

        let started = Instant::now();
        let mut next_report = Duration::from_secs(1);
        while copier.is_stopped() {
            thread::sleep(Duration::from_millis(1));
            if started.elapsed() >= next_report {
                log::warn!(
                    "still waiting for the copier to stop after {:?}",
                    started.elapsed()
                );
                next_report *= 2;
            }
        }

        copier.ready_to_end();
        self.gc_done();
        *self.copier.lock() = None;

        log::info!("garbage collection ended");
    }

    fn gc_done(&self) {
        self.status.set_gc_running(false);
        let reset = self.context.reset_ex_victim_segments();
        if !reset.is_empty() {
            log::info!("returned unfinished victim segments {:?} to ssd", reset);
        }
    }

    /// Whether the system state allows garbage collection.
    pub fn is_enabled(&self) -> bool {
        matches!(self.state.get_state(), SystemState::Normal | SystemState::Busy)
    }

    pub fn is_running(&self) -> bool {
        self.copier.lock().is_some()
    }

    fn active_copier(&self) -> Result<Arc<dyn CopyPipeline>> {
        match &*self.copier.lock() {
            Some(copier) => Ok(copier.clone()),
            None => {
                log::debug!("no active copier");
                Err(Error::NoActiveCopier)
            }
        }
    }

    pub fn pause(&self) -> Result<()> {
        self.active_copier()?.pause();
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.active_copier()?.resume();
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.active_copier().is_ok_and(|copier| copier.is_paused())
    }

    /// Makes the active run collect regardless of the free segment count
    /// until its next victim is done.
    pub fn disable_threshold_check(&self) -> Result<()> {
        let copier = self.active_copier()?;
        if !copier.is_threshold_check_enabled() {
            return Err(Error::ThresholdCheckAlreadyDisabled);
        }
        copier.disable_threshold_check();
        Ok(())
    }

    pub fn status(&self) -> &Arc<GcStatus> {
        &self.status
    }

    pub fn copy_error_count(&self) -> u64 {
        self.active_copier().map_or(0, |copier| copier.copy_error_count())
    }
}

/// Holds the collector weakly so the state manager does not keep it
/// alive.
struct GcStateObserver {
    gc: Weak<GarbageCollector>,
}

impl StateObserver for GcStateObserver {
    fn state_changed(&self, prev: SystemState, next: SystemState) {
        let Some(gc) = self.gc.upgrade() else {
            return;
        };
        let enabled = matches!(next, SystemState::Normal | SystemState::Busy);
        let was_enabled = matches!(prev, SystemState::Normal | SystemState::Busy);
        log::debug!("gc sees system state {:?} -> {:?}", prev, next);

        let res = match (was_enabled, enabled) {
            (true, false) => gc.pause(),
            (false, true) => gc.resume(),
            _ => Ok(()),
        };
        if let Err(e) = res {
            log::debug!("gc did not follow the state change: {}", e);
        }
    }
}
