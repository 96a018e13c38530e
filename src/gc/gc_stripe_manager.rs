//! Destination side of the copy pipeline. Copied blocks are appended to a
//! GC stripe per volume; a full stripe has its reverse map flushed, its
//! segment's occupied count bumped and is finished.

use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::block_allocator::StripeAllocator;
use crate::buffer_pool::BufferPool;
use crate::gc::{BlkInfo, GcDependencies};
use crate::io::{IoDirection, IoSubmitter, Ubio};
use crate::reverse_map::{ReverseMap, VsaMap};
use crate::stripe::Stripe;
use crate::{BlkOffset, ContextManager, Result, VirtualBlkAddr, VolumeId};

/// Called once per copied block with `Ok(true)` if the block moved,
/// `Ok(false)` if it was overwritten while in flight.
pub type BlockCopyDone = Box<dyn FnOnce(Result<bool>) + Send>;

#[derive(Debug)]
struct ActiveGcStripe {
    stripe: Arc<Stripe>,
    next_offset: BlkOffset,
}

pub struct GcStripeManager {
    blocks_per_stripe: u32,
    context: Arc<ContextManager>,
    io: Arc<dyn IoSubmitter>,
    reverse_map: Arc<dyn ReverseMap>,
    vsa_map: Arc<dyn VsaMap>,
    allocator: Arc<StripeAllocator>,
    buffer_pool: Arc<BufferPool>,
    active: Mutex<FnvHashMap<VolumeId, ActiveGcStripe>>,
    // assigned and not finished
    outstanding: AtomicU32,
}

impl fmt::Debug for GcStripeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcStripeManager")
            .field("active_volumes", &self.active.lock().len())
            .field("outstanding", &self.outstanding_stripes())
            .finish()
    }
}

impl GcStripeManager {
    pub fn new(deps: &GcDependencies, buffer_pool: Arc<BufferPool>) -> GcStripeManager {
        GcStripeManager {
            blocks_per_stripe: deps.context.address_info().blocks_per_stripe,
            context: deps.context.clone(),
            io: deps.io.clone(),
            reverse_map: deps.reverse_map.clone(),
            vsa_map: deps.vsa_map.clone(),
            allocator: deps.allocator.clone(),
            buffer_pool,
            active: Mutex::default(),
            outstanding: AtomicU32::new(0),
        }
    }

    pub fn outstanding_stripes(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// True when no destination stripe is partially filled or waiting
    /// for its writes or flush.
    pub fn is_all_finished(&self) -> bool {
        self.active.lock().is_empty() && self.outstanding_stripes() == 0
    }

    /// Writes `buffer` as the new home of `info` and repoints the block.
    /// The buffer goes back to the pool before `done` runs.
    pub fn write_block(self: &Arc<Self>, info: BlkInfo, buffer: Vec<u8>, done: BlockCopyDone) {
        let (stripe, offset) = match self.allocate_block(info.volume_id) {
            Ok(dest) => dest,
            Err(e) => {
                log::error!(
                    "no destination for block {:?} of volume {}: {}",
                    info.vsa,
                    info.volume_id,
                    e
                );
                self.buffer_pool.return_buffer(buffer);
                done(Err(e));
                return;
            }
        };

        let new_vsa = VirtualBlkAddr::new(stripe.user_lsid(), offset);
        let ubio = Ubio { direction: IoDirection::Write, addr: new_vsa, buffer };
        let manager = self.clone();

        self.io.submit(
            ubio,
            Box::new(move |ubio, res| {
                manager.buffer_pool.return_buffer(ubio.buffer);
                let moved = match res {
                    Ok(()) => manager.commit_block(&stripe, offset, info, new_vsa),
                    Err(e) => Err(e),
                };
                manager.block_written(&stripe, 1);
                done(moved)
            }),
        );
    }

    fn commit_block(
        &self,
        stripe: &Stripe,
        offset: BlkOffset,
        info: BlkInfo,
        new_vsa: VirtualBlkAddr,
    ) -> Result<bool> {
        stripe.update_reverse_map_entry(offset, info.rba, info.volume_id)?;
        stripe.update_victim_vsa(offset, info.vsa);

        // the new location is counted before the forward map points at it
        self.context.validate_blocks(new_vsa, 1);
        if self.vsa_map.compare_and_set_vsa(info.volume_id, info.rba, info.vsa, new_vsa) {
            self.context.invalidate_blocks(info.vsa, 1);
            Ok(true)
        } else {
            log::debug!(
                "block {} of volume {} was overwritten while being copied from {:?}",
                info.rba,
                info.volume_id,
                info.vsa
            );
            self.context.invalidate_blocks(new_vsa, 1);
            Ok(false)
        }
    }

    fn allocate_block(&self, volume_id: VolumeId) -> Result<(Arc<Stripe>, BlkOffset)> {
        let mut active = self.active.lock();

        let current = match active.entry(volume_id) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let lsid = self.allocator.allocate_stripe()?;
                let stripe = Arc::new(Stripe::new(self.blocks_per_stripe));
                stripe.assign(lsid, None, lsid, volume_id, &*self.reverse_map)?;
                self.outstanding.fetch_add(1, Ordering::AcqRel);
                log::debug!("gc destination stripe {} for volume {}", lsid, volume_id);
                vacant.insert(ActiveGcStripe { stripe, next_offset: 0 })
            }
        };

        let offset = current.next_offset;
        let stripe = current.stripe.clone();
        current.next_offset += 1;
        if current.next_offset == self.blocks_per_stripe {
            active.remove(&volume_id);
        }

        Ok((stripe, offset))
    }

    fn block_written(self: &Arc<Self>, stripe: &Arc<Stripe>, count: u32) {
        if stripe.decrease_blks_remaining(count) == 0 {
            self.flush_stripe(stripe.clone());
        }
    }

    fn flush_stripe(self: &Arc<Self>, stripe: Arc<Stripe>) {
        let manager = self.clone();
        let finished = stripe.clone();
        let res = stripe.flush(Box::new(move |res| manager.stripe_flushed(&finished, res)));
        if let Err(e) = res {
            panic!(
                "gc stripe {} lost its reverse map before flushing: {}. \
                 please report this bug!",
                stripe.vsid(),
                e
            );
        }
    }

    fn stripe_flushed(&self, stripe: &Stripe, res: Result<()>) {
        let lsid = stripe.user_lsid();
        if let Err(e) = res {
            log::error!("failed to flush the reverse map of gc stripe {}: {}", lsid, e);
        }
        let freed = self.context.update_occupied_stripe_count(lsid);
        stripe.set_finished();

        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(prev, 0, "gc stripe {} finished twice. please report this bug!", lsid);
        log::debug!("gc stripe {} finished, segment freed: {}", lsid, freed);
    }

    /// Closes every partially filled destination stripe. The unused tail
    /// counts as written so the stripe flushes once its in-flight blocks
    /// land.
    pub fn flush_active_stripes(self: &Arc<Self>) {
        let partial: Vec<ActiveGcStripe> = self.active.lock().drain().map(|(_, a)| a).collect();
        for active in partial {
            let pad = self.blocks_per_stripe - active.next_offset;
            log::debug!(
                "padding gc stripe {} with {} unused blocks",
                active.stripe.user_lsid(),
                pad
            );
            self.block_written(&active.stripe, pad);
        }
    }
}
