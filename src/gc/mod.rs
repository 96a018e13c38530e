//! Garbage collection: victim selection, the cooperative copy pipeline
//! and the collector that starts and stops it.
//!
//! A `Copier` event picks a victim segment, `StripeCopySubmission` loads
//! the reverse map of every stripe in it, and one `StripeCopier` per copy
//! lane walks the stripes, reading each valid block into a staging buffer
//! and handing it to the `GcStripeManager`, which appends it to a GC
//! destination stripe. Once every valid block of the victim has moved, the
//! victim's valid count reaches zero and it is freed through the ordinary
//! counter path.

use std::fmt;
use std::sync::Arc;

use crate::allocator_ctx::StripeOwner;
use crate::block_allocator::StripeAllocator;
use crate::io::IoSubmitter;
use crate::reverse_map::{ReverseMap, VsaMap};
use crate::scheduler::EventScheduler;
use crate::ContextManager;

mod collector;
mod copier;
mod copier_meta;
mod gc_stripe_manager;
mod status;
mod stripe_copier;
mod stripe_copy_submission;
mod victim_stripe;

pub use self::collector::{CopierFactory, CopyPipeline, GarbageCollector};
pub use self::copier::{Copier, CopierState};
pub use self::copier_meta::{CopierMeta, GC_VICTIM_SEGMENT_COUNT};
pub use self::gc_stripe_manager::GcStripeManager;
pub use self::status::{CopyInfo, GcStatus};
pub use self::stripe_copier::StripeCopier;
pub use self::stripe_copy_submission::StripeCopySubmission;
pub use self::victim_stripe::{BlkInfo, VictimStripe};

/// The collaborators a copy pipeline works against.
#[derive(Clone)]
pub struct GcDependencies {
    pub context: Arc<ContextManager>,
    pub io: Arc<dyn IoSubmitter>,
    pub reverse_map: Arc<dyn ReverseMap>,
    pub vsa_map: Arc<dyn VsaMap>,
    pub scheduler: Arc<dyn EventScheduler>,
    /// Destination stripes for copied blocks. Shared across copier
    /// instances so a partially used destination segment is filled up by
    /// the next run.
    pub allocator: Arc<StripeAllocator>,
}

impl fmt::Debug for GcDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcDependencies")
            .field("address", &self.context.address_info())
            .field("io", &self.io)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl GcDependencies {
    pub fn new(
        context: Arc<ContextManager>,
        io: Arc<dyn IoSubmitter>,
        reverse_map: Arc<dyn ReverseMap>,
        vsa_map: Arc<dyn VsaMap>,
        scheduler: Arc<dyn EventScheduler>,
    ) -> GcDependencies {
        let allocator =
            Arc::new(StripeAllocator::new(context.clone(), StripeOwner::Gc));
        GcDependencies { context, io, reverse_map, vsa_map, scheduler, allocator }
    }
}
