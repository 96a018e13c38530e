//! Per-segment state and counters.
//!
//! Each segment has its own lock guarding its `SegmentState` and
//! `SegmentInfo`. The allocation bitmap has a separate lock and is never
//! taken while a segment lock is held. Freed segments are reported to the
//! `RebuildCtx` after their segment lock is released.
//!
//! On-disk layout:
//! `[u32 signature][u32 version][u32 valid_block_count; N][u32 occupied_stripe_count; N]`

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::bitmap::Bitmap;
use crate::meta_file::{AsyncMetaIo, MetaFile, MetaIoOpcode};
use crate::rebuild_ctx::RebuildCtx;
use crate::segment_info::{self, SegmentInfo};
use crate::{AddressInfo, Result, SegmentId, SegmentState, StripeId};

pub const SEGMENT_CTX_SIGNATURE: u32 = 0x5345_4743;

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Segment {
    state: SegmentState,
    info: SegmentInfo,
}

impl Segment {
    const fn free() -> Segment {
        Segment {
            state: SegmentState::Free,
            info: SegmentInfo { valid_block_count: 0, occupied_stripe_count: 0 },
        }
    }

    fn reset(&mut self, segment_id: SegmentId) {
        self.state.transition(SegmentState::Free, segment_id);
        self.info = SegmentInfo::default();
    }
}

#[derive(Debug)]
pub struct SegmentCtx {
    address: AddressInfo,
    segments: Vec<Mutex<Segment>>,
    bitmap: Mutex<Bitmap>,
    // version written by the most recent store
    version: AtomicU32,
    stored_version: AtomicU32,
    file: Arc<dyn MetaFile>,
    rebuild_ctx: Arc<RebuildCtx>,
}

impl SegmentCtx {
    pub fn new(
        address: AddressInfo,
        file: Arc<dyn MetaFile>,
        rebuild_ctx: Arc<RebuildCtx>,
    ) -> SegmentCtx {
        SegmentCtx {
            address,
            segments: (0..address.num_segments).map(|_| Mutex::new(Segment::free())).collect(),
            bitmap: Mutex::new(Bitmap::new(address.num_segments)),
            version: AtomicU32::new(0),
            stored_version: AtomicU32::new(0),
            file,
            rebuild_ctx,
        }
    }

    pub fn address_info(&self) -> AddressInfo {
        self.address
    }

    pub fn file_size(&self) -> u64 {
        (HEADER_LEN + segment_info::encoded_len(self.address.num_segments as usize)) as u64
    }

    /// Loads the persisted counters, or creates and stores an empty
    /// context if the metadata file does not exist yet.
    pub fn init(&self) -> Result<()> {
        if !self.file.exists() {
            self.file.create(self.file_size())?;
            self.file.open()?;
            self.store_segment_info_sync()?;
            log::debug!("created segment context file {}", self.file.name());
            return Ok(());
        }
        self.file.open()?;
        self.load()
    }

    pub fn close(&self) {
        self.file.close();
    }

    fn load(&self) -> Result<()> {
        let mut buf = vec![0_u8; self.file_size() as usize];
        self.file.read_at(0, &mut buf)?;

        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(
            signature,
            SEGMENT_CTX_SIGNATURE,
            "segment context {} has signature {:#x}, expected {:#x}. \
             the metadata is corrupted",
            self.file.name(),
            signature,
            SEGMENT_CTX_SIGNATURE
        );
        let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

        let infos = segment_info::deserialize(&buf[HEADER_LEN..], self.segments.len())?;

        let mut bitmap = self.bitmap.lock();
        bitmap.clear_all();

        for (segment_id, info) in infos.into_iter().enumerate() {
            let segment_id = segment_id as SegmentId;
            self.assert_counters(segment_id, &info);

            let state = if info.occupied_stripe_count == 0 && info.valid_block_count == 0 {
                SegmentState::Free
            } else if info.occupied_stripe_count == self.address.stripes_per_segment {
                if info.valid_block_count == 0 {
                    SegmentState::Free
                } else {
                    SegmentState::Ssd
                }
            } else {
                SegmentState::Nvram
            };

            let mut segment = self.segments[segment_id as usize].lock();
            segment.state = state;
            segment.info = if state == SegmentState::Free { SegmentInfo::default() } else { info };
            if state != SegmentState::Free {
                bitmap.set(segment_id);
            }
        }

        self.version.store(version, Ordering::Release);
        self.stored_version.store(version, Ordering::Release);

        log::info!(
            "loaded segment context version {}, {} of {} segments in use",
            version,
            bitmap.num_set(),
            bitmap.num_bits()
        );

        Ok(())
    }

    fn assert_counters(&self, segment_id: SegmentId, info: &SegmentInfo) {
        assert!(
            info.valid_block_count <= self.address.blocks_per_segment(),
            "segment {} valid block count {} exceeds capacity {}. \
             please report this bug!",
            segment_id,
            info.valid_block_count,
            self.address.blocks_per_segment()
        );
        assert!(
            info.occupied_stripe_count <= self.address.stripes_per_segment,
            "segment {} occupied stripe count {} exceeds capacity {}. \
             please report this bug!",
            segment_id,
            info.occupied_stripe_count,
            self.address.stripes_per_segment
        );
    }

    fn encode(&self) -> (u32, Vec<u8>) {
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let infos: Vec<SegmentInfo> = self.segments.iter().map(|s| s.lock().info).collect();

        let mut buf = Vec::with_capacity(self.file_size() as usize);
        buf.extend_from_slice(&SEGMENT_CTX_SIGNATURE.to_le_bytes());
        buf.extend_from_slice(&version.to_le_bytes());
        segment_info::serialize_into(&infos, &mut buf);
        (version, buf)
    }

    pub fn store_segment_info_sync(&self) -> Result<()> {
        let (version, buf) = self.encode();
        self.file.write_at(0, &buf)?;
        self.stored_version.fetch_max(version, Ordering::AcqRel);
        log::trace!("stored segment context version {}", version);
        Ok(())
    }

    pub fn store_segment_info_async<F>(self: &Arc<Self>, done: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let (version, buffer) = self.encode();
        let this = self.clone();
        self.file.submit_async(
            AsyncMetaIo { opcode: MetaIoOpcode::Write, offset: 0, buffer },
            Box::new(move |_io, res| {
                if res.is_ok() {
                    this.stored_version.fetch_max(version, Ordering::AcqRel);
                    log::trace!("stored segment context version {}", version);
                }
                done(res)
            }),
        );
    }

    /// Version written by the most recent successful store.
    pub fn stored_version(&self) -> u32 {
        self.stored_version.load(Ordering::Acquire)
    }

    pub fn increase_valid_block_count(&self, segment_id: SegmentId, count: u32) -> u32 {
        let mut segment = self.segments[segment_id as usize].lock();
        let capacity = self.address.blocks_per_segment();
        let current = segment.info.valid_block_count;

        let Some(new) = current.checked_add(count).filter(|n| *n <= capacity) else {
            panic!(
                "valid block count overflow on segment {} ({:?}): {} + {} exceeds \
                 capacity {}. please report this bug!",
                segment_id, segment.state, current, count, capacity
            );
        };

        segment.info.valid_block_count = new;
        new
    }

    /// Frees the segment if it is fully occupied and no valid block is left.
    pub fn decrease_valid_block_count(&self, segment_id: SegmentId, count: u32) -> u32 {
        let (new, freed) = {
            let mut segment = self.segments[segment_id as usize].lock();
            let current = segment.info.valid_block_count;

            let Some(new) = current.checked_sub(count) else {
                panic!(
                    "valid block count underflow on segment {} ({:?}): {} - {}. \
                     please report this bug!",
                    segment_id, segment.state, current, count
                );
            };

            segment.info.valid_block_count = new;

            let freed = new == 0
                && segment.info.occupied_stripe_count == self.address.stripes_per_segment;
            if freed {
                segment.reset(segment_id);
            }
            (new, freed)
        };

        if freed {
            self.segment_freed(segment_id);
        }

        new
    }

    /// Counts a fully destaged stripe. Returns `true` if this freed the
    /// segment.
    pub fn update_occupied_stripe_count(&self, lsid: StripeId) -> bool {
        let segment_id = self.address.segment_of(lsid);

        let freed = {
            let mut segment = self.segments[segment_id as usize].lock();
            let occupied = segment.info.occupied_stripe_count + 1;
            assert!(
                occupied <= self.address.stripes_per_segment,
                "segment {} ({:?}) occupied stripe count {} exceeds capacity {}. \
                 please report this bug!",
                segment_id,
                segment.state,
                occupied,
                self.address.stripes_per_segment
            );
            segment.info.occupied_stripe_count = occupied;

            if occupied < self.address.stripes_per_segment {
                false
            } else if segment.info.valid_block_count == 0 {
                segment.reset(segment_id);
                true
            } else {
                segment.state.transition(SegmentState::Ssd, segment_id);
                false
            }
        };

        if freed {
            self.segment_freed(segment_id);
        }

        freed
    }

    /// Greedily picks the SSD segment with the fewest valid blocks and
    /// marks it as a victim.
    pub fn get_gc_victim_segment(&self) -> Option<SegmentId> {
        let mut best: Option<(SegmentId, u32)> = None;

        for (segment_id, segment) in self.segments.iter().enumerate() {
            let segment = segment.lock();
            let valid = segment.info.valid_block_count;
            if segment.state != SegmentState::Ssd || valid == 0 {
                continue;
            }
            if best.is_none_or(|(_, best_valid)| valid < best_valid) {
                best = Some((segment_id as SegmentId, valid));
            }
        }

        let (segment_id, _) = best?;

        let mut segment = self.segments[segment_id as usize].lock();
        if segment.state != SegmentState::Ssd || segment.info.valid_block_count == 0 {
            log::debug!(
                "victim candidate {} changed to {:?} with {} valid blocks during the scan",
                segment_id,
                segment.state,
                segment.info.valid_block_count
            );
            return None;
        }
        segment.state.transition(SegmentState::Victim, segment_id);

        log::debug!(
            "selected victim segment {} with {} valid blocks",
            segment_id,
            segment.info.valid_block_count
        );

        Some(segment_id)
    }

    /// Hands out the next free segment that is not waiting for rebuild.
    pub fn allocate_free_segment(&self) -> Option<SegmentId> {
        let segment_id = self
            .bitmap
            .lock()
            .set_next_clear_bit(|id| !self.rebuild_ctx.is_rebuild_target_segment(id))?;

        self.segments[segment_id as usize]
            .lock()
            .state
            .transition(SegmentState::Nvram, segment_id);

        log::debug!("allocated free segment {}", segment_id);
        Some(segment_id)
    }

    /// Frees a segment regardless of its counters.
    pub fn free_user_data_segment(&self, segment_id: SegmentId) {
        {
            let mut segment = self.segments[segment_id as usize].lock();
            if segment.state == SegmentState::Free {
                log::warn!("segment {} is already free", segment_id);
                return;
            }
            segment.reset(segment_id);
        }
        self.segment_freed(segment_id);
    }

    fn segment_freed(&self, segment_id: SegmentId) {
        if let Err(e) = self.rebuild_ctx.free_segment_in_rebuild_target(segment_id) {
            log::error!(
                "failed to drop freed segment {} from the rebuild targets: {}",
                segment_id,
                e
            );
        }

        let cleared = self.bitmap.lock().clear(segment_id);
        assert!(
            cleared,
            "freed segment {} was not allocated. please report this bug!",
            segment_id
        );

        log::debug!("segment {} freed", segment_id);
    }

    /// Returns victims that were never reclaimed to the SSD state so that
    /// they can be selected again.
    pub fn reset_ex_victim_segments(&self) -> Vec<SegmentId> {
        let mut reset = vec![];
        for (segment_id, segment) in self.segments.iter().enumerate() {
            let segment_id = segment_id as SegmentId;
            let mut segment = segment.lock();
            if segment.state == SegmentState::Victim {
                segment.state.transition(SegmentState::Ssd, segment_id);
                reset.push(segment_id);
            }
        }
        if !reset.is_empty() {
            log::info!("reset ex-victim segments {:?} to SSD", reset);
        }
        reset
    }

    pub fn num_free_segments(&self) -> u32 {
        self.bitmap.lock().num_clear()
    }

    pub fn allocated_segments(&self) -> Vec<SegmentId> {
        self.bitmap.lock().set_bits().collect()
    }

    pub fn segment_state(&self, segment_id: SegmentId) -> SegmentState {
        self.segments[segment_id as usize].lock().state
    }

    pub fn segment_info(&self, segment_id: SegmentId) -> SegmentInfo {
        self.segments[segment_id as usize].lock().info
    }

    pub fn valid_block_count(&self, segment_id: SegmentId) -> u32 {
        self.segment_info(segment_id).valid_block_count
    }

    pub fn occupied_stripe_count(&self, segment_id: SegmentId) -> u32 {
        self.segment_info(segment_id).occupied_stripe_count
    }
}
