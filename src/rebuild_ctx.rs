//! Tracks which segments still have to be rebuilt after a device failure.
//!
//! The target set is persisted as `[u32 count][u32 segment id; count]`,
//! zero padded to a fixed file size. Acquiring and releasing targets never
//! blocks: a contended lock is reported as `Error::Retry` so a cooperative
//! rebuild task can yield and come back.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::meta_file::{AsyncMetaIo, MetaFile, MetaIoOpcode};
use crate::{Error, Result, SegmentId};

#[derive(Debug, Default)]
struct RebuildTargets {
    segments: BTreeSet<SegmentId>,
    under_rebuild: Option<SegmentId>,
}

#[derive(Debug)]
pub struct RebuildCtx {
    file: Arc<dyn MetaFile>,
    num_segments: u32,
    targets: Mutex<RebuildTargets>,
    need_continue: AtomicBool,
}

impl RebuildCtx {
    pub fn new(file: Arc<dyn MetaFile>, num_segments: u32) -> RebuildCtx {
        RebuildCtx {
            file,
            num_segments,
            targets: Mutex::new(RebuildTargets::default()),
            need_continue: AtomicBool::new(false),
        }
    }

    pub fn file_size(&self) -> u64 {
        4 * (1 + u64::from(self.num_segments))
    }

    /// Loads the persisted target set, creating an empty one if the file
    /// does not exist yet.
    pub fn init(&self) -> Result<()> {
        let mut targets = self.targets.lock();

        if !self.file.exists() {
            self.file.create(self.file_size())?;
            self.file.open()?;
            targets.segments.clear();
            targets.under_rebuild = None;
            self.store_locked(&targets)?;
            log::debug!("created empty rebuild target file {}", self.file.name());
            return Ok(());
        }

        self.file.open()?;
        let mut buf = vec![0_u8; self.file_size() as usize];
        self.file.read_at(0, &mut buf)?;
        targets.segments = decode(&buf, self.num_segments, self.file.name())?;
        targets.under_rebuild = None;

        if !targets.segments.is_empty() {
            log::info!(
                "{} segments still need rebuild: {:?}",
                targets.segments.len(),
                targets.segments
            );
            self.need_continue.store(true, Ordering::Release);
        }

        Ok(())
    }

    pub fn close(&self) {
        self.file.close();
    }

    /// Picks the next segment to rebuild. Targets that GC freed in the
    /// meantime are discarded on the way.
    ///
    /// Returns `Err(Error::Retry)` if the target set is busy.
    pub fn get_rebuild_target_segment<F>(&self, is_free: F) -> Result<Option<SegmentId>>
    where
        F: Fn(SegmentId) -> bool,
    {
        let mut targets = self.targets.try_lock().ok_or(Error::Retry)?;

        let mut discarded = false;
        let mut chosen = None;
        while let Some(&segment_id) = targets.segments.first() {
            if is_free(segment_id) {
                log::debug!(
                    "rebuild target {} was freed before rebuild reached it",
                    segment_id
                );
                targets.segments.remove(&segment_id);
                discarded = true;
                continue;
            }
            chosen = Some(segment_id);
            break;
        }

        targets.under_rebuild = chosen;

        if discarded {
            self.store_locked(&targets)?;
        }

        if let Some(segment_id) = chosen {
            log::info!("segment {} is now under rebuild", segment_id);
        }

        Ok(chosen)
    }

    /// Drops a rebuilt segment from the target set and flushes the set in
    /// the background. Releasing a segment that is already gone is a no-op.
    ///
    /// Returns `Err(Error::Retry)` if the target set is busy.
    pub fn release_rebuild_segment(&self, segment_id: SegmentId) -> Result<()> {
        let mut targets = self.targets.try_lock().ok_or(Error::Retry)?;

        if targets.under_rebuild == Some(segment_id) {
            targets.under_rebuild = None;
        }

        if !targets.segments.remove(&segment_id) {
            log::debug!(
                "segment {} already left the rebuild target set",
                segment_id
            );
            return Ok(());
        }

        let buf = self.encode(&targets);
        drop(targets);

        log::info!("segment {} rebuild done", segment_id);
        self.flush_async(buf);
        Ok(())
    }

    /// Called when a segment is freed. The segment currently under rebuild
    /// is left in place; any other target is removed and the set is
    /// stored immediately. Returns whether the set changed.
    pub fn free_segment_in_rebuild_target(&self, segment_id: SegmentId) -> Result<bool> {
        let mut targets = self.targets.lock();

        if targets.under_rebuild == Some(segment_id) {
            log::info!(
                "segment {} was freed while under rebuild, keeping it as a target",
                segment_id
            );
            return Ok(false);
        }

        if !targets.segments.remove(&segment_id) {
            return Ok(false);
        }

        log::debug!("segment {} freed, removed from rebuild targets", segment_id);
        self.store_locked(&targets)?;
        Ok(true)
    }

    /// Returns `true` if the segment was not a target yet.
    pub fn emplace_rebuild_target_segment(&self, segment_id: SegmentId) -> bool {
        assert!(segment_id < self.num_segments);
        self.targets.lock().segments.insert(segment_id)
    }

    /// Adds `segments` to the target set and stores it. Returns the
    /// number of targets.
    pub fn make_rebuild_target<I>(&self, segments: I) -> Result<usize>
    where
        I: IntoIterator<Item = SegmentId>,
    {
        let mut targets = self.targets.lock();
        if !targets.segments.is_empty() {
            log::warn!(
                "starting a new rebuild while {} targets remain, merging them",
                targets.segments.len()
            );
        }
        for segment_id in segments {
            assert!(segment_id < self.num_segments);
            targets.segments.insert(segment_id);
        }
        self.store_locked(&targets)?;
        log::info!("{} segments marked for rebuild", targets.segments.len());
        Ok(targets.segments.len())
    }

    /// Abandons the rebuild: clears every target and stores the empty set.
    pub fn stop_rebuilding(&self) -> Result<()> {
        let mut targets = self.targets.lock();
        if targets.segments.is_empty() && targets.under_rebuild.is_none() {
            return Ok(());
        }
        log::info!(
            "stop rebuilding with {} targets left",
            targets.segments.len()
        );
        targets.segments.clear();
        targets.under_rebuild = None;
        self.need_continue.store(false, Ordering::Release);
        self.store_locked(&targets)
    }

    pub fn is_rebuild_target_segment(&self, segment_id: SegmentId) -> bool {
        self.targets.lock().segments.contains(&segment_id)
    }

    pub fn target_count(&self) -> usize {
        self.targets.lock().segments.len()
    }

    pub fn targets(&self) -> Vec<SegmentId> {
        self.targets.lock().segments.iter().copied().collect()
    }

    pub fn under_rebuild_segment(&self) -> Option<SegmentId> {
        self.targets.lock().under_rebuild
    }

    /// Whether a rebuild was in progress when the set was last loaded.
    pub fn need_rebuild_again(&self) -> bool {
        self.need_continue.load(Ordering::Acquire)
    }

    /// Stores the current set synchronously.
    pub fn store(&self) -> Result<()> {
        let targets = self.targets.lock();
        self.store_locked(&targets)
    }

    fn store_locked(&self, targets: &RebuildTargets) -> Result<()> {
        let buf = self.encode(targets);
        self.file.write_at(0, &buf)
    }

    fn flush_async(&self, buffer: Vec<u8>) {
        let name = self.file.name().to_owned();
        self.file.submit_async(
            AsyncMetaIo { opcode: MetaIoOpcode::Write, offset: 0, buffer },
            Box::new(move |_io, res| match res {
                Ok(()) => log::trace!("flushed rebuild targets to {}", name),
                Err(e) => {
                    log::error!("failed to flush rebuild targets to {}: {}", name, e)
                }
            }),
        );
    }

    fn encode(&self, targets: &RebuildTargets) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.file_size() as usize);
        buf.extend_from_slice(&(targets.segments.len() as u32).to_le_bytes());
        for segment_id in &targets.segments {
            buf.extend_from_slice(&segment_id.to_le_bytes());
        }
        buf.resize(self.file_size() as usize, 0);
        buf
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn decode(buf: &[u8], num_segments: u32, file: &str) -> Result<BTreeSet<SegmentId>> {
    let corrupt = |reason: String| Error::Corruption { file: file.to_owned(), reason };

    if buf.len() < 4 {
        return Err(corrupt(format!("file is only {} bytes", buf.len())));
    }

    let count = read_u32(&buf[..4]);
    if count > num_segments {
        return Err(corrupt(format!(
            "target count {} exceeds the number of segments {}",
            count, num_segments
        )));
    }

    let end = 4 + 4 * count as usize;
    if buf.len() < end {
        return Err(corrupt(format!(
            "target count {} needs {} bytes but the file holds {}",
            count,
            end,
            buf.len()
        )));
    }

    let mut segments = BTreeSet::new();
    for chunk in buf[4..end].chunks_exact(4) {
        let segment_id = read_u32(chunk);
        if segment_id >= num_segments {
            return Err(corrupt(format!(
                "target segment {} is out of range {}",
                segment_id, num_segments
            )));
        }
        if !segments.insert(segment_id) {
            return Err(corrupt(format!("target segment {} is duplicated", segment_id)));
        }
    }

    Ok(segments)
}
