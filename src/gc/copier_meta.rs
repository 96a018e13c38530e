//! State shared by every event of one copier: the victim slots, the
//! staging buffer pool and the destination stripe manager.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::buffer_pool::BufferPool;
use crate::gc::{GcDependencies, GcStatus, GcStripeManager, VictimStripe};
use crate::io::IoSubmitter;
use crate::scheduler::EventScheduler;
use crate::{AddressInfo, Config, ContextManager, SegmentId, StripeId};

/// Victim segments that may be in flight at once: one whose stripes are
/// being walked and the previous one whose last copies are completing.
pub const GC_VICTIM_SEGMENT_COUNT: usize = 2;

struct VictimSlot {
    in_use: AtomicBool,
    segment_id: AtomicU32,
    stripes: Vec<Arc<VictimStripe>>,
    // stripes whose copies were all issued
    issued_stripes: AtomicU32,
    // stripes whose copies all completed
    done_stripes: AtomicU32,
    valid_blocks: AtomicU32,
    failed_blocks: AtomicU32,
}

pub struct CopierMeta {
    address: AddressInfo,
    copy_lanes: u32,
    buffer_retry_limit: u32,
    deps: GcDependencies,
    status: Arc<GcStatus>,
    buffer_pool: Arc<BufferPool>,
    stripe_manager: Arc<GcStripeManager>,
    slots: Vec<VictimSlot>,
    copy_errors: AtomicU64,
}

impl fmt::Debug for CopierMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopierMeta")
            .field("copy_lanes", &self.copy_lanes)
            .field("buffers_available", &self.buffer_pool.available())
            .field(
                "victims",
                &self
                    .slots
                    .iter()
                    .filter(|s| s.in_use.load(Ordering::Acquire))
                    .map(|s| s.segment_id.load(Ordering::Acquire))
                    .collect::<Vec<_>>(),
            )
            .field("copy_errors", &self.copy_error_count())
            .finish()
    }
}

impl CopierMeta {
    pub fn new(config: &Config, deps: GcDependencies, status: Arc<GcStatus>) -> CopierMeta {
        let address = deps.context.address_info();
        let buffer_pool =
            Arc::new(BufferPool::new(config.gc_buffer_count, config.block_size));
        let stripe_manager =
            Arc::new(GcStripeManager::new(&deps, buffer_pool.clone()));

        let slots = (0..GC_VICTIM_SEGMENT_COUNT)
            .map(|_| VictimSlot {
                in_use: AtomicBool::new(false),
                segment_id: AtomicU32::new(SegmentId::MAX),
                stripes: (0..address.stripes_per_segment)
                    .map(|_| {
                        VictimStripe::new(
                            deps.reverse_map.clone(),
                            deps.vsa_map.clone(),
                        )
                    })
                    .collect(),
                issued_stripes: AtomicU32::new(0),
                done_stripes: AtomicU32::new(0),
                valid_blocks: AtomicU32::new(0),
                failed_blocks: AtomicU32::new(0),
            })
            .collect();

        CopierMeta {
            address,
            copy_lanes: config.gc_copy_lanes,
            buffer_retry_limit: config.gc_buffer_retry_limit,
            deps,
            status,
            buffer_pool,
            stripe_manager,
            slots,
            copy_errors: AtomicU64::new(0),
        }
    }

    pub fn address_info(&self) -> AddressInfo {
        self.address
    }

    pub fn copy_lanes(&self) -> u32 {
        self.copy_lanes
    }

    pub fn buffer_retry_limit(&self) -> u32 {
        self.buffer_retry_limit
    }

    pub fn context(&self) -> &Arc<ContextManager> {
        &self.deps.context
    }

    pub fn io(&self) -> &Arc<dyn IoSubmitter> {
        &self.deps.io
    }

    pub fn scheduler(&self) -> &Arc<dyn EventScheduler> {
        &self.deps.scheduler
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    pub fn stripe_manager(&self) -> &Arc<GcStripeManager> {
        &self.stripe_manager
    }

    /// Claims a free victim slot for `segment_id`.
    pub fn acquire_victim_slot(&self, segment_id: SegmentId) -> Option<usize> {
        let index = self.slots.iter().position(|slot| {
            slot.in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })?;

        let slot = &self.slots[index];
        slot.segment_id.store(segment_id, Ordering::Release);
        slot.issued_stripes.store(0, Ordering::Release);
        slot.done_stripes.store(0, Ordering::Release);
        slot.valid_blocks.store(0, Ordering::Release);
        slot.failed_blocks.store(0, Ordering::Release);

        log::debug!("victim segment {} copied through slot {}", segment_id, index);
        Some(index)
    }

    pub fn victim_segment(&self, slot: usize) -> SegmentId {
        self.slots[slot].segment_id.load(Ordering::Acquire)
    }

    pub fn victim_stripe(&self, slot: usize, stripe_offset: u32) -> &Arc<VictimStripe> {
        &self.slots[slot].stripes[stripe_offset as usize]
    }

    pub fn victim_stripes(&self, slot: usize) -> &[Arc<VictimStripe>] {
        &self.slots[slot].stripes
    }

    pub fn base_stripe(&self, slot: usize) -> StripeId {
        self.address.first_stripe_of(self.victim_segment(slot))
    }

    /// Records that every copy of one stripe was issued, `valid` of them.
    pub fn stripe_copy_issued(&self, slot: usize, valid: u32) {
        let slot = &self.slots[slot];
        slot.valid_blocks.fetch_add(valid, Ordering::AcqRel);
        slot.issued_stripes.fetch_add(1, Ordering::AcqRel);
    }

    /// Records that every copy of one stripe completed. With the last
    /// stripe of its segment the cycle is recorded in the GC status and
    /// the slot is released.
    pub fn stripe_copy_done(&self, slot_index: usize) {
        let slot = &self.slots[slot_index];
        let done = slot.done_stripes.fetch_add(1, Ordering::AcqRel) + 1;
        assert!(
            done <= self.address.stripes_per_segment,
            "victim slot {} finished {} stripes of a {} stripe segment. \
             please report this bug!",
            slot_index,
            done,
            self.address.stripes_per_segment
        );
        if done == self.address.stripes_per_segment {
            let segment_id = slot.segment_id.load(Ordering::Acquire);
            let valid = slot.valid_blocks.load(Ordering::Acquire);
            let copied = valid - slot.failed_blocks.load(Ordering::Acquire);
            let invalid = self.address.blocks_per_segment() - valid;
            log::debug!(
                "all copies of victim segment {} completed, {} copied {} invalid",
                segment_id,
                copied,
                invalid
            );
            self.status.end_copy(segment_id, invalid, copied);
            slot.in_use.store(false, Ordering::Release);
        }
    }

    /// True once every stripe of the slot's victim had its copies issued.
    pub fn is_copy_issued(&self, slot: usize) -> bool {
        self.slots[slot].issued_stripes.load(Ordering::Acquire)
            == self.address.stripes_per_segment
    }

    pub fn issued_block_count(&self, slot: usize) -> u32 {
        self.slots[slot].valid_blocks.load(Ordering::Acquire)
    }

    pub fn is_all_victim_segment_copy_done(&self) -> bool {
        self.slots.iter().all(|slot| !slot.in_use.load(Ordering::Acquire))
    }

    /// Counts one block of the slot's victim that could not be copied.
    pub fn copy_failed(&self, slot: usize) {
        self.slots[slot].failed_blocks.fetch_add(1, Ordering::AcqRel);
        self.copy_errors.fetch_add(1, Ordering::AcqRel);
    }

    pub fn copy_error_count(&self) -> u64 {
        self.copy_errors.load(Ordering::Acquire)
    }
}
