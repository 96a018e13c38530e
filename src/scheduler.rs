//! Cooperative event scheduling. An event is a short, non-blocking unit of
//! work; `execute` returns `true` when it is done and `false` when it
//! wants to be run again later.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::Result;

pub trait Event: Send + Sync {
    fn execute(&self) -> bool;

    fn name(&self) -> &'static str {
        "event"
    }
}

pub type EventRef = Arc<dyn Event>;

pub trait EventScheduler: Send + Sync + fmt::Debug {
    /// Fire and forget.
    fn enqueue_event(&self, event: EventRef);
}

enum WorkerMessage {
    Run(EventRef),
    Shutdown,
}

/// Runs events on a fixed set of named worker threads fed by a channel.
/// An event that is not done goes to the back of the queue.
pub struct WorkerScheduler {
    sender: Sender<WorkerMessage>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl fmt::Debug for WorkerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerScheduler")
            .field("workers", &self.workers.lock().len())
            .field("pending", &self.pending())
            .finish()
    }
}

impl WorkerScheduler {
    pub fn start(threads: usize) -> Result<Arc<WorkerScheduler>> {
        let (sender, receiver) = unbounded();
        let pending = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let receiver = receiver.clone();
            let worker_sender = sender.clone();
            let pending = pending.clone();
            let spawn_res = thread::Builder::new()
                .name(format!("logseg-event-{}", id))
                .spawn(move || perform_work(receiver, worker_sender, pending));

            match spawn_res {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    log::error!("failed to spawn event worker {}: {:?}", id, e);
                    for _ in &workers {
                        let _ = sender.send(WorkerMessage::Shutdown);
                    }
                    return Err(e.into());
                }
            }
        }

        log::debug!("started {} event workers", threads);

        Ok(Arc::new(WorkerScheduler { sender, workers: Mutex::new(workers), pending }))
    }

    /// Events enqueued and not finished yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Waits until no event is pending. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Stops every worker. Events still queued are dropped.
    pub fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for _ in &workers {
            let _ = self.sender.send(WorkerMessage::Shutdown);
        }
        for worker in workers {
            if worker.join().is_err() {
                log::error!("event worker panicked");
            }
        }
    }
}

impl Drop for WorkerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EventScheduler for WorkerScheduler {
    fn enqueue_event(&self, event: EventRef) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(WorkerMessage::Run(event)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            log::error!("event enqueued after the scheduler shut down");
        }
    }
}

fn perform_work(
    receiver: Receiver<WorkerMessage>,
    sender: Sender<WorkerMessage>,
    pending: Arc<AtomicUsize>,
) {
    while let Ok(message) = receiver.recv() {
        let event = match message {
            WorkerMessage::Run(event) => event,
            WorkerMessage::Shutdown => return,
        };

        if event.execute() {
            pending.fetch_sub(1, Ordering::AcqRel);
            continue;
        }

        log::trace!("re-enqueueing {}", event.name());
        if sender.send(WorkerMessage::Run(event)).is_err() {
            pending.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        if receiver.len() <= 1 {
            thread::yield_now();
        }
    }
}

/// Single-threaded scheduler driven explicitly by the caller. Events run
/// in enqueue order; unfinished events go to the back of the queue.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<EventRef>>,
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler").field("queued", &self.len()).finish()
    }
}

impl ManualScheduler {
    pub fn new() -> Arc<ManualScheduler> {
        Arc::new(ManualScheduler::default())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Runs the event at the front of the queue. Returns `false` if the
    /// queue was empty.
    pub fn run_one(&self) -> bool {
        let Some(event) = self.queue.lock().pop_front() else {
            return false;
        };
        if !event.execute() {
            self.queue.lock().push_back(event);
        }
        true
    }

    /// Runs events until the queue is empty or `max_steps` events ran.
    /// Returns `true` if the queue drained.
    pub fn run_until_idle(&self, max_steps: usize) -> bool {
        for _ in 0..max_steps {
            if !self.run_one() {
                return true;
            }
        }
        self.is_empty()
    }

    /// Runs events until `condition` holds. Returns `false` if it did not
    /// within `max_steps` events.
    pub fn run_until<F: Fn() -> bool>(&self, max_steps: usize, condition: F) -> bool {
        for _ in 0..max_steps {
            if condition() {
                return true;
            }
            if !self.run_one() {
                return condition();
            }
        }
        condition()
    }
}

impl EventScheduler for ManualScheduler {
    fn enqueue_event(&self, event: EventRef) {
        self.queue.lock().push_back(event);
    }
}
