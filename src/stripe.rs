//! A stripe is the append unit: it is assigned, written block by block,
//! flushed, and finished. Block completions race on `remaining` to find the
//! last writer without taking a lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::reverse_map::{ReverseMap, ReverseMapEntry, ReverseMapFlushCallback, ReverseMapPack};
use crate::{BlkOffset, Error, Rba, Result, StripeId, VirtualBlkAddr, VolumeId};

/// Counts the stripes of one flush batch that are not durable yet.
#[derive(Debug)]
pub struct FlushGroup {
    outstanding: AtomicU32,
}

impl FlushGroup {
    pub fn new(stripes: u32) -> Arc<FlushGroup> {
        Arc::new(FlushGroup { outstanding: AtomicU32::new(stripes) })
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_durable(&self) -> bool {
        self.outstanding() == 0
    }

    fn stripe_finished(&self) -> u32 {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(
            prev, 0,
            "flush group finished more stripes than it holds. please report this bug!"
        );
        prev - 1
    }
}

#[derive(Debug)]
struct StripeLayout {
    volume_id: VolumeId,
    vsid: StripeId,
    wb_lsid: Option<StripeId>,
    user_lsid: StripeId,
    old_vsa_list: Vec<VirtualBlkAddr>,
    reverse_map: Option<Arc<dyn ReverseMapPack>>,
    flush_group: Option<Arc<FlushGroup>>,
}

#[derive(Debug)]
pub struct Stripe {
    blocks_per_stripe: u32,
    layout: Mutex<StripeLayout>,
    remaining: AtomicU32,
    refcount: AtomicU32,
    finished: AtomicBool,
}

impl Stripe {
    pub fn new(blocks_per_stripe: u32) -> Stripe {
        Stripe {
            blocks_per_stripe,
            layout: Mutex::new(StripeLayout {
                volume_id: 0,
                vsid: StripeId::MAX,
                wb_lsid: None,
                user_lsid: StripeId::MAX,
                old_vsa_list: vec![VirtualBlkAddr::UNMAP; blocks_per_stripe as usize],
                reverse_map: None,
                flush_group: None,
            }),
            remaining: AtomicU32::new(0),
            refcount: AtomicU32::new(0),
            // unassigned stripes are reusable
            finished: AtomicBool::new(true),
        }
    }

    /// Prepares the stripe for a new round of writes. `wb_lsid` is `None`
    /// for GC staging stripes that are not backed by a write buffer.
    pub fn assign(
        &self,
        vsid: StripeId,
        wb_lsid: Option<StripeId>,
        user_lsid: StripeId,
        volume_id: VolumeId,
        reverse_map: &dyn ReverseMap,
    ) -> Result<()> {
        let mut layout = self.layout.lock();
        if layout.reverse_map.is_some() {
            return Err(Error::ReverseMapAlreadyLinked);
        }

        layout.vsid = vsid;
        layout.wb_lsid = wb_lsid;
        layout.user_lsid = user_lsid;
        layout.volume_id = volume_id;
        layout.old_vsa_list.iter_mut().for_each(|vsa| *vsa = VirtualBlkAddr::UNMAP);
        layout.reverse_map = Some(reverse_map.alloc_reverse_map_pack(vsid, wb_lsid));
        layout.flush_group = None;

        self.remaining.store(self.blocks_per_stripe, Ordering::Release);
        self.finished.store(false, Ordering::Release);

        log::trace!(
            "assigned stripe vsid {} user lsid {} wb lsid {:?} volume {}",
            vsid,
            user_lsid,
            wb_lsid,
            volume_id
        );
        Ok(())
    }

    pub fn link_reverse_map(&self, pack: Arc<dyn ReverseMapPack>) -> Result<()> {
        let mut layout = self.layout.lock();
        if layout.reverse_map.is_some() {
            return Err(Error::ReverseMapAlreadyLinked);
        }
        layout.reverse_map = Some(pack);
        Ok(())
    }

    pub fn unlink_reverse_map(&self) {
        if let Some(pack) = self.layout.lock().reverse_map.take() {
            pack.unlink();
        }
    }

    pub fn has_reverse_map(&self) -> bool {
        self.layout.lock().reverse_map.is_some()
    }

    /// Returns the number of blocks still to be written. Exactly one
    /// caller observes zero.
    pub fn decrease_blks_remaining(&self, count: u32) -> u32 {
        let prev = self.remaining.fetch_sub(count, Ordering::AcqRel);
        assert!(
            prev >= count,
            "stripe {} had {} blocks remaining but {} were written. \
             please report this bug!",
            self.vsid(),
            prev,
            count
        );
        prev - count
    }

    pub fn blks_remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn refer(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops `count` references. Dropping more than are held is logged and
    /// leaves the count at zero.
    pub fn derefer(&self, count: u32) -> u32 {
        let prev = match self.refcount.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
            Some(c.saturating_sub(count))
        }) {
            Ok(prev) | Err(prev) => prev,
        };
        if prev < count {
            log::error!(
                "stripe {} dereferenced {} times with only {} references held",
                self.vsid(),
                count,
                prev
            );
        }
        prev.saturating_sub(count)
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn is_ok_to_free(&self) -> bool {
        self.refcount() == 0
    }

    /// Persists the stripe's reverse map. `done` is called once the
    /// reverse map is durable or failed.
    pub fn flush(&self, done: ReverseMapFlushCallback) -> Result<()> {
        let pack = self.layout.lock().reverse_map.clone();
        let Some(pack) = pack else {
            return Err(Error::MissingReverseMap);
        };
        pack.flush(done);
        Ok(())
    }

    /// Releases the reverse map and reports to the flush group, if any.
    pub fn set_finished(&self) {
        let group = {
            let mut layout = self.layout.lock();
            if let Some(pack) = layout.reverse_map.take() {
                pack.unlink();
            }
            layout.flush_group.take()
        };

        self.finished.store(true, Ordering::Release);

        if let Some(group) = group {
            let left = group.stripe_finished();
            log::trace!("stripe {} finished, {} left in its flush group", self.vsid(), left);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_flush_group(&self, group: Arc<FlushGroup>) {
        self.layout.lock().flush_group = Some(group);
    }

    pub fn update_reverse_map_entry(
        &self,
        offset: BlkOffset,
        rba: Rba,
        volume_id: VolumeId,
    ) -> Result<()> {
        let pack = self.layout.lock().reverse_map.clone();
        pack.ok_or(Error::MissingReverseMap)?
            .set_reverse_map_entry(offset, rba, volume_id)
    }

    pub fn get_reverse_map_entry(&self, offset: BlkOffset) -> Result<Option<ReverseMapEntry>> {
        let layout = self.layout.lock();
        let pack = layout.reverse_map.as_ref().ok_or(Error::MissingReverseMap)?;
        Ok(pack.get_reverse_map_entry(offset))
    }

    /// Remembers the address a block had before it was written here.
    pub fn update_victim_vsa(&self, offset: BlkOffset, vsa: VirtualBlkAddr) {
        self.layout.lock().old_vsa_list[offset as usize] = vsa;
    }

    pub fn victim_vsa(&self, offset: BlkOffset) -> VirtualBlkAddr {
        self.layout.lock().old_vsa_list[offset as usize]
    }

    pub fn blocks_per_stripe(&self) -> u32 {
        self.blocks_per_stripe
    }

    pub fn vsid(&self) -> StripeId {
        self.layout.lock().vsid
    }

    pub fn user_lsid(&self) -> StripeId {
        self.layout.lock().user_lsid
    }

    pub fn wb_lsid(&self) -> Option<StripeId> {
        self.layout.lock().wb_lsid
    }

    pub fn volume_id(&self) -> VolumeId {
        self.layout.lock().volume_id
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::reverse_map::MemReverseMap;

    #[test]
    fn exactly_one_writer_sees_the_last_block() {
        for _ in 0..100 {
            let reverse_map = MemReverseMap::new(64);
            let stripe = Arc::new(Stripe::new(64));
            stripe.assign(3, Some(0), 3, 1, &reverse_map).unwrap();

            let threads: Vec<_> = [24, 40]
                .into_iter()
                .map(|n| {
                    let stripe = stripe.clone();
                    thread::spawn(move || stripe.decrease_blks_remaining(n))
                })
                .collect();

            let results: Vec<u32> = threads.into_iter().map(|t| t.join().unwrap()).collect();
            assert_eq!(results.iter().filter(|r| **r == 0).count(), 1);
            assert_eq!(stripe.blks_remaining(), 0);
        }
    }

    #[test]
    fn second_partial_write_reaches_zero() {
        let reverse_map = MemReverseMap::new(8);
        let stripe = Stripe::new(8);
        stripe.assign(0, None, 0, 0, &reverse_map).unwrap();
        assert_eq!(stripe.decrease_blks_remaining(5), 3);
        assert_eq!(stripe.decrease_blks_remaining(3), 0);
    }

    #[test]
    fn derefer_clamps_at_zero() {
        let stripe = Stripe::new(4);
        stripe.refer();
        stripe.refer();
        assert!(!stripe.is_ok_to_free());
        assert_eq!(stripe.derefer(1), 1);
        assert_eq!(stripe.derefer(5), 0);
        assert!(stripe.is_ok_to_free());
    }

    #[test]
    fn flush_and_finish_release_the_reverse_map() {
        let reverse_map = MemReverseMap::new(4);
        let stripe = Stripe::new(4);
        assert_eq!(stripe.flush(Box::new(|_| ())), Err(Error::MissingReverseMap));

        stripe.assign(7, Some(2), 7, 1, &reverse_map).unwrap();
        assert!(!stripe.is_finished());
        assert_eq!(
            stripe.assign(8, None, 8, 1, &reverse_map),
            Err(Error::ReverseMapAlreadyLinked)
        );
        stripe.update_reverse_map_entry(1, 100, 1).unwrap();
        assert_eq!(
            stripe.get_reverse_map_entry(1).unwrap(),
            Some(ReverseMapEntry { rba: 100, volume_id: 1 })
        );

        let group = FlushGroup::new(2);
        stripe.set_flush_group(group.clone());

        let (tx, rx) = crossbeam_channel::bounded(1);
        stripe.flush(Box::new(move |res| tx.send(res).unwrap())).unwrap();
        rx.recv().unwrap().unwrap();
        stripe.set_finished();

        assert!(stripe.is_finished());
        assert!(!stripe.has_reverse_map());
        assert_eq!(group.outstanding(), 1);
        assert!(!group.is_durable());
        assert_eq!(reverse_map.persisted_entries(7).unwrap()[1].map(|e| e.rba), Some(100));

        // finished stripes may be assigned again
        stripe.assign(9, None, 9, 1, &reverse_map).unwrap();
        assert_eq!(stripe.victim_vsa(0), VirtualBlkAddr::UNMAP);
    }
}
