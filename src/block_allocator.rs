use std::sync::Arc;

use crate::allocator_ctx::{StripeCursor, StripeOwner};
use crate::{ContextManager, Error, GcMode, Result, SegmentId, StripeId};

/// Hands out stripes one segment at a time. Moving to a new segment
/// allocates it from the segment context (FREE -> NVRAM). The position
/// inside the segment lives in the allocator context, so it is persisted
/// with the other contexts and shared by allocators of the same owner.
///
/// User allocation stops when a new segment would be needed in urgent GC
/// mode, leaving the last free segments to the collector.
#[derive(Debug)]
pub struct StripeAllocator {
    context: Arc<ContextManager>,
    owner: StripeOwner,
}

impl StripeAllocator {
    pub fn new(context: Arc<ContextManager>, owner: StripeOwner) -> StripeAllocator {
        StripeAllocator { context, owner }
    }

    pub fn owner(&self) -> StripeOwner {
        self.owner
    }

    pub fn allocate_stripe(&self) -> Result<StripeId> {
        let is_user = self.owner == StripeOwner::User;
        if is_user && self.context.is_user_blk_alloc_prohibited() {
            return Err(Error::UserAllocationProhibited);
        }

        let address = self.context.address_info();
        let allocator_ctx = self.context.allocator_ctx();

        allocator_ctx.with_cursor(self.owner, |cursor| {
            let current = match *cursor {
                Some(c) if c.next_offset < address.stripes_per_segment => c,
                _ => {
                    if self.context.current_gc_mode() == GcMode::Urgent {
                        self.context.prohibit_user_blk_alloc();
                        if is_user {
                            return Err(Error::UserAllocationProhibited);
                        }
                    }
                    let segment_id = self
                        .context
                        .allocate_free_segment()
                        .ok_or(Error::NoFreeSegment)?;
                    StripeCursor { segment_id, next_offset: 0 }
                }
            };

            let lsid = address.first_stripe_of(current.segment_id) + current.next_offset;
            *cursor = Some(StripeCursor {
                segment_id: current.segment_id,
                next_offset: current.next_offset + 1,
            });

            log::trace!(
                "allocated {:?} stripe {} in segment {}",
                self.owner,
                lsid,
                current.segment_id
            );

            Ok(lsid)
        })
    }

    pub fn active_segment(&self) -> Option<SegmentId> {
        self.context.allocator_ctx().cursor(self.owner).map(|c| c.segment_id)
    }
}
