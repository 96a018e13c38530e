//! Address translation collaborators.
//!
//! The reverse map translates a stripe offset back to the volume block
//! that owns it and is persisted per stripe. The forward `VsaMap`
//! translates a volume block to its current virtual address. Both are
//! consumed through traits; the in-memory implementations here back the
//! tests and single-process setups.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::{BlkOffset, Error, Rba, Result, StripeId, VirtualBlkAddr, VolumeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReverseMapEntry {
    pub rba: Rba,
    pub volume_id: VolumeId,
}

pub type ReverseMapFlushCallback = Box<dyn FnOnce(Result<()>) + Send>;

pub type ReverseMapLoadCallback =
    Box<dyn FnOnce(Result<Vec<Option<ReverseMapEntry>>>) + Send>;

/// Reverse map entries of one stripe while it is being written.
pub trait ReverseMapPack: Send + Sync + fmt::Debug {
    fn vsid(&self) -> StripeId;

    fn set_reverse_map_entry(
        &self,
        offset: BlkOffset,
        rba: Rba,
        volume_id: VolumeId,
    ) -> Result<()>;

    fn get_reverse_map_entry(&self, offset: BlkOffset) -> Option<ReverseMapEntry>;

    /// Persists the entries. `done` is called exactly once.
    fn flush(&self, done: ReverseMapFlushCallback);

    fn unlink(&self);
}

pub trait ReverseMap: Send + Sync + fmt::Debug {
    /// `wb_lsid` is the write buffer stripe backing the stripe, `None` for
    /// in-memory GC staging stripes.
    fn alloc_reverse_map_pack(
        &self,
        vsid: StripeId,
        wb_lsid: Option<StripeId>,
    ) -> Arc<dyn ReverseMapPack>;

    /// Reads the persisted entries of a stripe. `done` is called exactly
    /// once, possibly on another thread.
    fn load(&self, vsid: StripeId, done: ReverseMapLoadCallback);
}

pub trait VsaMap: Send + Sync + fmt::Debug {
    fn get_vsa(&self, volume_id: VolumeId, rba: Rba) -> Option<VirtualBlkAddr>;

    /// Returns the previous address.
    fn set_vsa(
        &self,
        volume_id: VolumeId,
        rba: Rba,
        vsa: VirtualBlkAddr,
    ) -> Option<VirtualBlkAddr>;

    /// Points the block at `new` only if it still points at `expected`.
    fn compare_and_set_vsa(
        &self,
        volume_id: VolumeId,
        rba: Rba,
        expected: VirtualBlkAddr,
        new: VirtualBlkAddr,
    ) -> bool;
}

type StripeEntries = Vec<Option<ReverseMapEntry>>;

#[derive(Debug, Default)]
struct MemReverseMapShared {
    persisted: Mutex<FnvHashMap<StripeId, StripeEntries>>,
    fail_flush: AtomicBool,
    fail_load: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct MemReverseMap {
    blocks_per_stripe: u32,
    shared: Arc<MemReverseMapShared>,
}

impl MemReverseMap {
    pub fn new(blocks_per_stripe: u32) -> MemReverseMap {
        MemReverseMap { blocks_per_stripe, shared: Arc::default() }
    }

    pub fn set_fail_flush(&self, fail: bool) {
        self.shared.fail_flush.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_load(&self, fail: bool) {
        self.shared.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn persisted_entries(&self, vsid: StripeId) -> Option<StripeEntries> {
        self.shared.persisted.lock().get(&vsid).cloned()
    }
}

impl ReverseMap for MemReverseMap {
    fn alloc_reverse_map_pack(
        &self,
        vsid: StripeId,
        wb_lsid: Option<StripeId>,
    ) -> Arc<dyn ReverseMapPack> {
        log::trace!("reverse map pack for stripe {} (write buffer {:?})", vsid, wb_lsid);
        Arc::new(MemReverseMapPack {
            vsid,
            entries: Mutex::new(vec![None; self.blocks_per_stripe as usize]),
            linked: AtomicBool::new(true),
            shared: self.shared.clone(),
        })
    }

    fn load(&self, vsid: StripeId, done: ReverseMapLoadCallback) {
        if self.shared.fail_load.load(Ordering::SeqCst) {
            done(Err(Error::Io(std::io::Error::other(format!(
                "injected reverse map load failure for stripe {}",
                vsid
            )))));
            return;
        }
        let entries = self
            .shared
            .persisted
            .lock()
            .get(&vsid)
            .cloned()
            .unwrap_or_else(|| vec![None; self.blocks_per_stripe as usize]);
        done(Ok(entries))
    }
}

#[derive(Debug)]
struct MemReverseMapPack {
    vsid: StripeId,
    entries: Mutex<StripeEntries>,
    linked: AtomicBool,
    shared: Arc<MemReverseMapShared>,
}

impl ReverseMapPack for MemReverseMapPack {
    fn vsid(&self) -> StripeId {
        self.vsid
    }

    fn set_reverse_map_entry(
        &self,
        offset: BlkOffset,
        rba: Rba,
        volume_id: VolumeId,
    ) -> Result<()> {
        if !self.linked.load(Ordering::Acquire) {
            return Err(Error::MissingReverseMap);
        }
        let mut entries = self.entries.lock();
        let Some(slot) = entries.get_mut(offset as usize) else {
            return Err(Error::ReportableBug(format!(
                "reverse map offset {} out of range for stripe {}",
                offset, self.vsid
            )));
        };
        *slot = Some(ReverseMapEntry { rba, volume_id });
        Ok(())
    }

    fn get_reverse_map_entry(&self, offset: BlkOffset) -> Option<ReverseMapEntry> {
        self.entries.lock().get(offset as usize).copied().flatten()
    }

    fn flush(&self, done: ReverseMapFlushCallback) {
        if self.shared.fail_flush.load(Ordering::SeqCst) {
            done(Err(Error::Io(std::io::Error::other(format!(
                "injected reverse map flush failure for stripe {}",
                self.vsid
            )))));
            return;
        }
        let entries = self.entries.lock().clone();
        self.shared.persisted.lock().insert(self.vsid, entries);
        done(Ok(()))
    }

    fn unlink(&self) {
        self.linked.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub struct MemVsaMap {
    map: Mutex<FnvHashMap<(VolumeId, Rba), VirtualBlkAddr>>,
}

impl MemVsaMap {
    pub fn new() -> MemVsaMap {
        MemVsaMap::default()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl VsaMap for MemVsaMap {
    fn get_vsa(&self, volume_id: VolumeId, rba: Rba) -> Option<VirtualBlkAddr> {
        self.map.lock().get(&(volume_id, rba)).copied()
    }

    fn set_vsa(
        &self,
        volume_id: VolumeId,
        rba: Rba,
        vsa: VirtualBlkAddr,
    ) -> Option<VirtualBlkAddr> {
        self.map.lock().insert((volume_id, rba), vsa)
    }

    fn compare_and_set_vsa(
        &self,
        volume_id: VolumeId,
        rba: Rba,
        expected: VirtualBlkAddr,
        new: VirtualBlkAddr,
    ) -> bool {
        let mut map = self.map.lock();
        match map.get_mut(&(volume_id, rba)) {
            Some(current) if *current == expected => {
                *current = new;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushed_entries_can_be_loaded() {
        let map = MemReverseMap::new(4);
        let pack = map.alloc_reverse_map_pack(9, Some(1));
        pack.set_reverse_map_entry(2, 77, 1).unwrap();
        assert!(pack.set_reverse_map_entry(4, 0, 0).is_err());

        pack.flush(Box::new(|res| res.unwrap()));
        pack.unlink();
        assert_eq!(pack.set_reverse_map_entry(0, 1, 1), Err(Error::MissingReverseMap));

        let (tx, rx) = crossbeam_channel::bounded(1);
        map.load(9, Box::new(move |res| tx.send(res).unwrap()));
        let entries = rx.recv().unwrap().unwrap();
        assert_eq!(entries[2], Some(ReverseMapEntry { rba: 77, volume_id: 1 }));
        assert_eq!(entries.iter().filter(|e| e.is_some()).count(), 1);
    }

    #[test]
    fn vsa_compare_and_set() {
        let map = MemVsaMap::new();
        let old = VirtualBlkAddr::new(1, 1);
        let new = VirtualBlkAddr::new(2, 0);
        assert_eq!(map.set_vsa(0, 5, old), None);
        assert!(!map.compare_and_set_vsa(0, 5, new, new));
        assert!(map.compare_and_set_vsa(0, 5, old, new));
        assert_eq!(map.get_vsa(0, 5), Some(new));
        assert!(!map.compare_and_set_vsa(0, 6, old, new));
    }
}
