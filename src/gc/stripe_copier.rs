//! Copies the valid blocks of one victim stripe, then hands its lane to
//! the stripe `copy_lanes` further into the segment.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::gc::{BlkInfo, CopierMeta};
use crate::io::{IoDirection, Ubio};
use crate::scheduler::Event;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyStep {
    LoadValidBlocks,
    AcquireBuffers { retries: u32 },
    Issued,
}

#[derive(Debug)]
pub struct StripeCopier {
    meta: Arc<CopierMeta>,
    slot: usize,
    stripe_offset: u32,
    step: Mutex<CopyStep>,
}

impl StripeCopier {
    pub fn new(meta: Arc<CopierMeta>, slot: usize, stripe_offset: u32) -> StripeCopier {
        StripeCopier { meta, slot, stripe_offset, step: Mutex::new(CopyStep::LoadValidBlocks) }
    }

    pub fn stripe_offset(&self) -> u32 {
        self.stripe_offset
    }

    fn issue_copies(&self, blocks: Vec<BlkInfo>, buffers: Vec<Vec<u8>>) {
        let progress = Arc::new(StripeCopyProgress {
            meta: self.meta.clone(),
            slot: self.slot,
            stripe_offset: self.stripe_offset,
            remaining: AtomicU32::new(blocks.len() as u32),
        });

        // completions may run before submit returns
        self.meta.stripe_copy_issued(self.slot, blocks.len() as u32);

        for (info, buffer) in blocks.into_iter().zip(buffers) {
            let progress = progress.clone();
            let ubio = Ubio { direction: IoDirection::Read, addr: info.vsa, buffer };
            self.meta.io().submit(
                ubio,
                Box::new(move |ubio, res| match res {
                    Ok(()) => {
                        let meta = progress.meta.clone();
                        meta.stripe_manager().write_block(
                            info,
                            ubio.buffer,
                            Box::new(move |res| progress.block_done(res)),
                        );
                    }
                    Err(e) => {
                        progress.meta.buffer_pool().return_buffer(ubio.buffer);
                        progress.block_done(Err(e));
                    }
                }),
            );
        }
    }
}

impl Event for StripeCopier {
    fn execute(&self) -> bool {
        let victim = self.meta.victim_stripe(self.slot, self.stripe_offset).clone();
        let mut step = self.step.lock();

        match *step {
            CopyStep::LoadValidBlocks => {
                if victim.load_valid_blocks() {
                    *step = CopyStep::AcquireBuffers { retries: 0 };
                }
                false
            }
            CopyStep::AcquireBuffers { retries } => {
                let blocks = victim.block_infos();
                if blocks.is_empty() {
                    *step = CopyStep::Issued;
                    drop(step);
                    self.meta.stripe_copy_issued(self.slot, 0);
                    self.meta.stripe_copy_done(self.slot);
                    enqueue_next_stripe(&self.meta, self.slot, self.stripe_offset);
                    return true;
                }

                let Some(buffers) = self.meta.buffer_pool().try_get_buffers(blocks.len()) else {
                    let retries = retries + 1;
                    if retries > self.meta.buffer_retry_limit() {
                        panic!(
                            "could not get {} staging buffers for victim stripe {} \
                             after {} attempts",
                            blocks.len(),
                            victim.lsid(),
                            retries - 1
                        );
                    }
                    *step = CopyStep::AcquireBuffers { retries };
                    return false;
                };

                *step = CopyStep::Issued;
                drop(step);
                log::trace!(
                    "copying {} blocks of victim stripe {}",
                    blocks.len(),
                    victim.lsid()
                );
                self.issue_copies(blocks, buffers);
                true
            }
            CopyStep::Issued => true,
        }
    }

    fn name(&self) -> &'static str {
        "stripe copier"
    }
}

/// Counts the in-flight copies of one stripe.
struct StripeCopyProgress {
    meta: Arc<CopierMeta>,
    slot: usize,
    stripe_offset: u32,
    remaining: AtomicU32,
}

impl StripeCopyProgress {
    fn block_done(&self, res: Result<bool>) {
        if let Err(e) = res {
            log::error!(
                "copy out of stripe {} of victim segment {} failed: {}",
                self.stripe_offset,
                self.meta.victim_segment(self.slot),
                e
            );
            self.meta.copy_failed(self.slot);
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.meta.stripe_copy_done(self.slot);
            enqueue_next_stripe(&self.meta, self.slot, self.stripe_offset);
        }
    }
}

fn enqueue_next_stripe(meta: &Arc<CopierMeta>, slot: usize, stripe_offset: u32) {
    let next = stripe_offset + meta.copy_lanes();
    if next < meta.address_info().stripes_per_segment {
        let copier = StripeCopier::new(meta.clone(), slot, next);
        meta.scheduler().enqueue_event(Arc::new(copier));
    }
}
