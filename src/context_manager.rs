//! Owns the segment and rebuild contexts and is the single entry point the
//! I/O path, the garbage collector and the rebuild worker go through.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::allocator_ctx::AllocatorCtx;
use crate::meta_file::{MetaDirectory, MetaFile};
use crate::rebuild_ctx::RebuildCtx;
use crate::segment_ctx::SegmentCtx;
use crate::{
    AddressInfo, Config, Error, Result, SegmentId, SegmentState, StripeId,
    VirtualBlkAddr,
};

pub const SEGMENT_CTX_FILE: &str = "segment_ctx";
pub const REBUILD_CTX_FILE: &str = "rebuild_ctx";
pub const ALLOCATOR_CTX_FILE: &str = "allocator_ctx";

/// How hard the garbage collector should be working, derived from the
/// number of free segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcMode {
    NoGc,
    Normal,
    Urgent,
}

#[derive(Debug)]
pub struct ContextManager {
    address: AddressInfo,
    gc_normal_threshold: u32,
    gc_urgent_threshold: u32,
    segment_ctx: Arc<SegmentCtx>,
    rebuild_ctx: Arc<RebuildCtx>,
    allocator_ctx: Arc<AllocatorCtx>,
    user_alloc_prohibited: AtomicBool,
    flush_in_progress: Arc<AtomicBool>,
    last_gc_mode: Mutex<GcMode>,
}

impl ContextManager {
    /// Opens every context from files in a metadata directory.
    pub fn open(
        config: &Config,
        dir: &MetaDirectory,
    ) -> Result<ContextManager> {
        ContextManager::with_files(
            config,
            Arc::new(dir.file(SEGMENT_CTX_FILE)),
            Arc::new(dir.file(REBUILD_CTX_FILE)),
            Arc::new(dir.file(ALLOCATOR_CTX_FILE)),
        )
    }

    pub fn with_files(
        config: &Config,
        segment_file: Arc<dyn MetaFile>,
        rebuild_file: Arc<dyn MetaFile>,
        allocator_file: Arc<dyn MetaFile>,
    ) -> Result<ContextManager> {
        config.validate()?;
        let address = config.address_info();

        let rebuild_ctx =
            Arc::new(RebuildCtx::new(rebuild_file, address.num_segments));
        rebuild_ctx.init()?;

        let segment_ctx = Arc::new(SegmentCtx::new(
            address,
            segment_file,
            rebuild_ctx.clone(),
        ));
        segment_ctx.init()?;

        let allocator_ctx =
            Arc::new(AllocatorCtx::new(allocator_file, address));
        allocator_ctx.init()?;
        resume_active_segments(&segment_ctx, &allocator_ctx);

        let context = ContextManager {
            address,
            gc_normal_threshold: config.gc_normal_threshold,
            gc_urgent_threshold: config.gc_urgent_threshold,
            segment_ctx,
            rebuild_ctx,
            allocator_ctx,
            user_alloc_prohibited: AtomicBool::new(false),
            flush_in_progress: Arc::new(AtomicBool::new(false)),
            last_gc_mode: Mutex::new(GcMode::NoGc),
        };
        let free = context.num_free_segments();
        *context.last_gc_mode.lock() = context.gc_mode_for(free);

        Ok(context)
    }

    pub fn close(&self) {
        self.segment_ctx.close();
        self.rebuild_ctx.close();
        self.allocator_ctx.close();
    }

    pub fn address_info(&self) -> AddressInfo {
        self.address
    }

    pub fn segment_ctx(&self) -> &Arc<SegmentCtx> {
        &self.segment_ctx
    }

    pub fn rebuild_ctx(&self) -> &Arc<RebuildCtx> {
        &self.rebuild_ctx
    }

    pub fn allocator_ctx(&self) -> &Arc<AllocatorCtx> {
        &self.allocator_ctx
    }

    /// Holds back user stripe allocation so the remaining free segments
    /// stay available to GC.
    pub fn prohibit_user_blk_alloc(&self) {
        if !self.user_alloc_prohibited.swap(true, Ordering::AcqRel) {
            log::warn!(
                "user stripe allocation prohibited with {} free segments",
                self.num_free_segments()
            );
        }
    }

    pub fn permit_user_blk_alloc(&self) {
        if self.user_alloc_prohibited.swap(false, Ordering::AcqRel) {
            log::info!(
                "user stripe allocation permitted with {} free segments",
                self.num_free_segments()
            );
        }
    }

    pub fn is_user_blk_alloc_prohibited(&self) -> bool {
        self.user_alloc_prohibited.load(Ordering::Acquire)
    }

    // a segment may have been freed
    fn segments_released(&self) {
        if self.is_user_blk_alloc_prohibited()
            && self.current_gc_mode() != GcMode::Urgent
        {
            self.permit_user_blk_alloc();
        }
    }

    pub fn allocate_free_segment(&self) -> Option<SegmentId> {
        let ret = self.segment_ctx.allocate_free_segment();
        if ret.is_none() {
            log::warn!("no free segment left to allocate");
        }
        self.current_gc_mode();
        ret
    }

    pub fn allocate_gc_victim_segment(&self) -> Option<SegmentId> {
        self.segment_ctx.get_gc_victim_segment()
    }

    fn gc_mode_for(&self, free: u32) -> GcMode {
        if free <= self.gc_urgent_threshold {
            GcMode::Urgent
        } else if free <= self.gc_normal_threshold {
            GcMode::Normal
        } else {
            GcMode::NoGc
        }
    }

    pub fn current_gc_mode(&self) -> GcMode {
        let free = self.num_free_segments();
        let mode = self.gc_mode_for(free);

        let mut last = self.last_gc_mode.lock();
        if *last != mode {
            log::info!(
                "gc mode changed from {:?} to {:?} with {} free segments",
                *last,
                mode,
                free
            );
            *last = mode;
        }

        mode
    }

    pub fn num_free_segments(&self) -> u32 {
        self.segment_ctx.num_free_segments()
    }

    /// Accounts `count` newly written blocks starting at `vsa`.
    pub fn validate_blocks(&self, vsa: VirtualBlkAddr, count: u32) -> u32 {
        let segment_id = self.address.segment_of_vsa(vsa);
        self.segment_ctx.increase_valid_block_count(segment_id, count)
    }

    /// Accounts `count` blocks starting at `vsa` that were overwritten or
    /// moved. May free the segment.
    pub fn invalidate_blocks(&self, vsa: VirtualBlkAddr, count: u32) -> u32 {
        let segment_id = self.address.segment_of_vsa(vsa);
        let valid =
            self.segment_ctx.decrease_valid_block_count(segment_id, count);
        self.segments_released();
        valid
    }

    pub fn update_occupied_stripe_count(&self, lsid: StripeId) -> bool {
        let freed = self.segment_ctx.update_occupied_stripe_count(lsid);
        self.segments_released();
        freed
    }

    pub fn free_user_data_segment(&self, segment_id: SegmentId) {
        self.segment_ctx.free_user_data_segment(segment_id);
        self.segments_released();
    }

    pub fn reset_ex_victim_segments(&self) -> Vec<SegmentId> {
        self.segment_ctx.reset_ex_victim_segments()
    }

    pub fn segment_state(&self, segment_id: SegmentId) -> SegmentState {
        self.segment_ctx.segment_state(segment_id)
    }

    /// Returns `Err(Error::Retry)` if the target set is busy.
    pub fn get_rebuild_target_segment(&self) -> Result<Option<SegmentId>> {
        self.rebuild_ctx.get_rebuild_target_segment(|segment_id| {
            self.segment_ctx.segment_state(segment_id) == SegmentState::Free
        })
    }

    /// Returns `Err(Error::Retry)` if the target set is busy.
    pub fn release_rebuild_segment(&self, segment_id: SegmentId) -> Result<()> {
        self.rebuild_ctx.release_rebuild_segment(segment_id)
    }

    /// Marks every allocated segment for rebuild. Returns the number of
    /// targets.
    pub fn make_rebuild_target(&self) -> Result<usize> {
        let allocated = self.segment_ctx.allocated_segments();
        self.rebuild_ctx.make_rebuild_target(allocated)
    }

    pub fn stop_rebuilding(&self) -> Result<()> {
        self.rebuild_ctx.stop_rebuilding()
    }

    pub fn need_rebuild_again(&self) -> bool {
        self.rebuild_ctx.need_rebuild_again()
    }

    /// Stores every context. Fails with `Error::Retry` while another
    /// flush is running.
    pub fn flush_contexts(&self) -> Result<()> {
        if self
            .flush_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("context flush already in progress");
            return Err(Error::Retry);
        }

        let ret = self
            .rebuild_ctx
            .store()
            .and_then(|()| self.allocator_ctx.store())
            .and_then(|()| self.segment_ctx.store_segment_info_sync());

        self.flush_in_progress.store(false, Ordering::Release);
        ret
    }

    /// Stores the rebuild and allocator contexts and submits the segment
    /// context write. `done` runs once the segment context is durable or
    /// failed.
    pub fn flush_contexts_async<F>(&self, done: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if self
            .flush_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("context flush already in progress");
            return Err(Error::Retry);
        }

        let stored =
            self.rebuild_ctx.store().and_then(|()| self.allocator_ctx.store());
        if let Err(e) = stored {
            self.flush_in_progress.store(false, Ordering::Release);
            return Err(e);
        }

        let flush_in_progress = self.flush_in_progress.clone();
        self.segment_ctx.store_segment_info_async(move |res| {
            flush_in_progress.store(false, Ordering::Release);
            if let Err(e) = &res {
                log::error!("failed to flush segment context: {}", e);
            }
            done(res)
        });

        Ok(())
    }

    pub fn is_flush_in_progress(&self) -> bool {
        self.flush_in_progress.load(Ordering::Acquire)
    }
}

/// Keeps the cursors of segments still being filled and reports NVRAM
/// segments no allocator will come back to.
fn resume_active_segments(
    segment_ctx: &SegmentCtx,
    allocator_ctx: &AllocatorCtx,
) {
    let dropped = allocator_ctx.retain_cursors(|id| {
        segment_ctx.segment_state(id) == SegmentState::Nvram
    });
    if !dropped.is_empty() {
        log::debug!("segments {:?} are no longer being filled", dropped);
    }

    let active = allocator_ctx.active_segments();
    let address = segment_ctx.address_info();
    for segment_id in 0..address.num_segments {
        if segment_ctx.segment_state(segment_id) == SegmentState::Nvram
            && !active.contains(&segment_id)
        {
            log::warn!(
                "segment {} was allocated after the last context flush and \
                 will not be filled further",
                segment_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_file::MemFile;

    fn config() -> Config {
        Config::new()
            .num_segments(8)
            .stripes_per_segment(2)
            .blocks_per_stripe(2)
            .gc_copy_lanes(1)
            .gc_buffer_count(4)
            .gc_normal_threshold(4)
            .gc_urgent_threshold(2)
    }

    fn context() -> ContextManager {
        ContextManager::with_files(
            &config(),
            Arc::new(MemFile::new(SEGMENT_CTX_FILE)),
            Arc::new(MemFile::new(REBUILD_CTX_FILE)),
            Arc::new(MemFile::new(ALLOCATOR_CTX_FILE)),
        )
        .unwrap()
    }

    #[test]
    fn gc_mode_follows_free_segments() {
        let context = context();
        assert_eq!(context.current_gc_mode(), GcMode::NoGc);
        for _ in 0..4 {
            context.allocate_free_segment().unwrap();
        }
        assert_eq!(context.current_gc_mode(), GcMode::Normal);
        for _ in 0..2 {
            context.allocate_free_segment().unwrap();
        }
        assert_eq!(context.current_gc_mode(), GcMode::Urgent);
    }

    #[test]
    fn rebuild_targets_every_allocated_segment() {
        let context = context();
        let a = context.allocate_free_segment().unwrap();
        let b = context.allocate_free_segment().unwrap();
        assert_eq!(context.make_rebuild_target().unwrap(), 2);

        assert_eq!(context.get_rebuild_target_segment(), Ok(Some(a)));

        // b is freed by GC before rebuild reaches it
        context.free_user_data_segment(b);
        context.release_rebuild_segment(a).unwrap();
        assert_eq!(context.get_rebuild_target_segment(), Ok(None));

        context.make_rebuild_target().unwrap();
        context.stop_rebuilding().unwrap();
        assert_eq!(context.rebuild_ctx().target_count(), 0);
    }

    #[test]
    fn concurrent_flush_is_rejected() {
        let context = context();
        context.flush_in_progress.store(true, Ordering::SeqCst);
        assert_eq!(context.flush_contexts(), Err(Error::Retry));
        context.flush_in_progress.store(false, Ordering::SeqCst);
        context.flush_contexts().unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        context
            .flush_contexts_async(move |res| tx.send(res.is_ok()).unwrap())
            .unwrap();
        assert!(rx.recv().unwrap());
        assert!(!context.is_flush_in_progress());
    }
}
