use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::reverse_map::{ReverseMap, ReverseMapEntry, VsaMap};
use crate::{Rba, StripeId, VirtualBlkAddr, VolumeId};

/// A block still owned by the victim stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkInfo {
    pub rba: Rba,
    pub volume_id: VolumeId,
    pub vsa: VirtualBlkAddr,
}

#[derive(Debug)]
enum LoadState {
    Idle,
    Loading,
    Loaded(Vec<Option<ReverseMapEntry>>),
    Failed,
}

#[derive(Debug)]
struct VictimInner {
    lsid: StripeId,
    load: LoadState,
    valid: Option<Vec<BlkInfo>>,
}

/// One stripe of a victim segment: its persisted reverse map and the
/// subset of blocks the forward map still points at.
pub struct VictimStripe {
    reverse_map: Arc<dyn ReverseMap>,
    vsa_map: Arc<dyn VsaMap>,
    inner: Mutex<VictimInner>,
}

impl fmt::Debug for VictimStripe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VictimStripe")
            .field("lsid", &inner.lsid)
            .field("valid", &inner.valid.as_ref().map(Vec::len))
            .finish()
    }
}

impl VictimStripe {
    pub fn new(reverse_map: Arc<dyn ReverseMap>, vsa_map: Arc<dyn VsaMap>) -> Arc<VictimStripe> {
        Arc::new(VictimStripe {
            reverse_map,
            vsa_map,
            inner: Mutex::new(VictimInner {
                lsid: StripeId::MAX,
                load: LoadState::Idle,
                valid: None,
            }),
        })
    }

    pub fn lsid(&self) -> StripeId {
        self.inner.lock().lsid
    }

    /// Starts reading the reverse map of `lsid`, forgetting anything known
    /// about the previous stripe.
    pub fn load(self: &Arc<Self>, lsid: StripeId) {
        {
            let mut inner = self.inner.lock();
            inner.lsid = lsid;
            inner.valid = None;
            inner.load = LoadState::Loading;
        }
        self.issue_load(lsid);
    }

    fn issue_load(self: &Arc<Self>, lsid: StripeId) {
        let victim = self.clone();
        // the user area has no separate virtual stripe space
        self.reverse_map.load(
            lsid,
            Box::new(move |res| {
                let mut inner = victim.inner.lock();
                if inner.lsid != lsid {
                    log::debug!("dropping stale reverse map load of stripe {}", lsid);
                    return;
                }
                inner.load = match res {
                    Ok(entries) => LoadState::Loaded(entries),
                    Err(e) => {
                        log::error!(
                            "failed to load the reverse map of victim stripe {}: {}",
                            lsid,
                            e
                        );
                        LoadState::Failed
                    }
                };
            }),
        );
    }

    /// True once the load completed, successfully or not.
    pub fn is_load_settled(&self) -> bool {
        matches!(self.inner.lock().load, LoadState::Loaded(_) | LoadState::Failed)
    }

    /// Computes the valid block list from the loaded reverse map. Returns
    /// `false` while the reverse map is not available. A failed load is
    /// issued again.
    pub fn load_valid_blocks(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock();
        if inner.valid.is_some() {
            return true;
        }

        let lsid = inner.lsid;
        let entries = match &inner.load {
            LoadState::Loaded(entries) => entries,
            LoadState::Loading => return false,
            LoadState::Idle | LoadState::Failed => {
                log::warn!("reloading the reverse map of victim stripe {}", lsid);
                inner.load = LoadState::Loading;
                drop(inner);
                self.issue_load(lsid);
                return false;
            }
        };

        let mut valid = vec![];
        for (offset, entry) in entries.iter().enumerate() {
            let Some(entry) = entry else {
                continue;
            };
            let vsa = VirtualBlkAddr::new(lsid, offset as u32);
            if self.vsa_map.get_vsa(entry.volume_id, entry.rba) == Some(vsa) {
                valid.push(BlkInfo { rba: entry.rba, volume_id: entry.volume_id, vsa });
            }
        }

        log::trace!("victim stripe {} has {} valid blocks", lsid, valid.len());
        inner.valid = Some(valid);
        inner.load = LoadState::Idle;
        true
    }

    /// The blocks found valid by the last `load_valid_blocks`.
    pub fn block_infos(&self) -> Vec<BlkInfo> {
        self.inner.lock().valid.clone().unwrap_or_default()
    }

    pub fn valid_block_count(&self) -> usize {
        self.inner.lock().valid.as_ref().map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reverse_map::{MemReverseMap, MemVsaMap};

    #[test]
    fn only_blocks_still_mapped_here_are_valid() {
        let reverse_map = Arc::new(MemReverseMap::new(4));
        let vsa_map = Arc::new(MemVsaMap::new());

        let pack = reverse_map.alloc_reverse_map_pack(5, Some(0));
        for offset in 0..3 {
            pack.set_reverse_map_entry(offset, 100 + offset as u64, 1).unwrap();
            vsa_map.set_vsa(1, 100 + offset as u64, VirtualBlkAddr::new(5, offset));
        }
        pack.flush(Box::new(|res| res.unwrap()));
        // overwritten elsewhere
        vsa_map.set_vsa(1, 101, VirtualBlkAddr::new(9, 0));

        let victim = VictimStripe::new(reverse_map.clone(), vsa_map.clone());
        victim.load(5);
        assert!(victim.is_load_settled());
        assert!(victim.load_valid_blocks());

        let rbas: Vec<_> = victim.block_infos().iter().map(|b| b.rba).collect();
        assert_eq!(rbas, vec![100, 102]);
    }

    #[test]
    fn failed_load_is_retried() {
        let reverse_map = Arc::new(MemReverseMap::new(2));
        let vsa_map = Arc::new(MemVsaMap::new());
        let victim = VictimStripe::new(reverse_map.clone(), vsa_map);

        reverse_map.set_fail_load(true);
        victim.load(3);
        assert!(victim.is_load_settled());
        assert!(!victim.load_valid_blocks());
        assert!(!victim.load_valid_blocks());

        reverse_map.set_fail_load(false);
        assert!(!victim.load_valid_blocks());
        assert!(victim.load_valid_blocks());
        assert_eq!(victim.valid_block_count(), 0);
    }
}
