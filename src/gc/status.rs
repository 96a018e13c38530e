use std::collections::VecDeque;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;

use crate::SegmentId;

/// Statistics of one victim segment's copy cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyInfo {
    pub segment_id: SegmentId,
    pub invalid_block_count: u32,
    pub copied_block_count: u32,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
}

#[derive(Debug, Default)]
struct StatusInner {
    running: bool,
    gc_start_time: Option<SystemTime>,
    gc_end_time: Option<SystemTime>,
    // victims whose copies are still running, oldest first
    open: Vec<CopyInfo>,
    history: VecDeque<CopyInfo>,
}

/// Bounded history of finished copy cycles plus the one in progress.
#[derive(Debug)]
pub struct GcStatus {
    capacity: usize,
    inner: Mutex<StatusInner>,
}

impl GcStatus {
    pub fn new(capacity: usize) -> GcStatus {
        GcStatus { capacity, inner: Mutex::default() }
    }

    pub fn set_gc_running(&self, running: bool) {
        let mut inner = self.inner.lock();
        if inner.running == running {
            return;
        }
        inner.running = running;
        if running {
            inner.gc_start_time = Some(SystemTime::now());
            inner.gc_end_time = None;
        } else {
            inner.gc_end_time = Some(SystemTime::now());
            for stale in inner.open.drain(..) {
                log::debug!(
                    "dropping unfinished copy record of segment {}",
                    stale.segment_id
                );
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    pub fn gc_start_time(&self) -> Option<SystemTime> {
        self.inner.lock().gc_start_time
    }

    pub fn gc_end_time(&self) -> Option<SystemTime> {
        self.inner.lock().gc_end_time
    }

    /// Opens the record for a new victim. Records of earlier victims stay
    /// open until their copies complete.
    pub fn begin_copy(&self, segment_id: SegmentId) {
        let mut inner = self.inner.lock();
        inner.open.retain(|info| info.segment_id != segment_id);
        inner.open.push(CopyInfo {
            segment_id,
            invalid_block_count: 0,
            copied_block_count: 0,
            start_time: SystemTime::now(),
            end_time: None,
        });
    }

    /// Closes the record of `segment_id` and moves it into the history,
    /// dropping the oldest entry when full.
    pub fn end_copy(
        &self,
        segment_id: SegmentId,
        invalid_block_count: u32,
        copied_block_count: u32,
    ) {
        let now = SystemTime::now();
        let mut inner = self.inner.lock();

        let position = inner.open.iter().position(|info| info.segment_id == segment_id);
        let mut info = match position {
            Some(index) => inner.open.remove(index),
            None => {
                log::warn!("closing copy record of segment {} that was never opened", segment_id);
                CopyInfo {
                    segment_id,
                    invalid_block_count: 0,
                    copied_block_count: 0,
                    start_time: now,
                    end_time: None,
                }
            }
        };
        info.invalid_block_count = invalid_block_count;
        info.copied_block_count = copied_block_count;
        info.end_time = Some(now);

        if self.capacity == 0 {
            return;
        }
        while inner.history.len() >= self.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(info);
    }

    /// The most recently started cycle that has not completed.
    pub fn current(&self) -> Option<CopyInfo> {
        self.inner.lock().open.last().cloned()
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<CopyInfo> {
        self.inner.lock().history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_drops_oldest() {
        let status = GcStatus::new(2);
        for segment_id in 0..3 {
            status.begin_copy(segment_id);
            assert_eq!(status.current().map(|c| c.segment_id), Some(segment_id));
            status.end_copy(segment_id, 10 - segment_id, segment_id);
        }
        assert_eq!(status.current(), None);

        let history = status.history();
        assert_eq!(history.iter().map(|c| c.segment_id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(history[1].invalid_block_count, 8);
        assert_eq!(history[1].copied_block_count, 2);
        assert!(history.iter().all(|c| c.end_time.is_some()));
    }

    #[test]
    fn overlapping_cycles_close_independently() {
        let status = GcStatus::new(4);
        status.set_gc_running(true);
        status.begin_copy(3);
        status.begin_copy(5);
        assert_eq!(status.current().map(|c| c.segment_id), Some(5));

        status.end_copy(3, 12, 4);
        assert_eq!(status.current().map(|c| c.segment_id), Some(5));
        assert_eq!(status.history()[0].segment_id, 3);

        // a stopped run drops what never completed
        status.set_gc_running(false);
        assert_eq!(status.current(), None);
        assert_eq!(status.history().len(), 1);
    }

    #[test]
    fn running_flag_records_times() {
        let status = GcStatus::new(4);
        assert!(!status.is_running());
        status.set_gc_running(true);
        assert!(status.is_running());
        assert!(status.gc_start_time().is_some());
        assert!(status.gc_end_time().is_none());
        status.set_gc_running(false);
        assert!(status.gc_end_time().is_some());
    }
}
