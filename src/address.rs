use serde::{Deserialize, Serialize};

/// Dense segment index in `[0, num_segments)`.
pub type SegmentId = u32;

/// Stripe index. User-area stripes are numbered contiguously, so stripe
/// `s` lives in segment `s / stripes_per_segment`.
pub type StripeId = u32;

/// Block offset within a stripe.
pub type BlkOffset = u32;

/// Identifier of a volume owning logical blocks.
pub type VolumeId = u32;

/// Logical block address inside a volume.
pub type Rba = u64;

/// Location of a block in virtual stripe space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct VirtualBlkAddr {
    pub stripe_id: StripeId,
    pub offset: BlkOffset,
}

impl VirtualBlkAddr {
    /// Marks an address slot that does not point anywhere.
    pub const UNMAP: VirtualBlkAddr =
        VirtualBlkAddr { stripe_id: StripeId::MAX, offset: BlkOffset::MAX };

    pub const fn new(stripe_id: StripeId, offset: BlkOffset) -> VirtualBlkAddr {
        VirtualBlkAddr { stripe_id, offset }
    }

    pub const fn is_unmapped(&self) -> bool {
        self.stripe_id == StripeId::MAX
    }
}

/// Fixed geometry of the array, decided at creation time and persisted
/// next to the segment metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub num_segments: u32,
    pub stripes_per_segment: u32,
    pub blocks_per_stripe: u32,
}

impl AddressInfo {
    pub const fn blocks_per_segment(&self) -> u32 {
        self.stripes_per_segment * self.blocks_per_stripe
    }

    pub const fn num_user_stripes(&self) -> u32 {
        self.num_segments * self.stripes_per_segment
    }

    /// Segment containing the given user-area stripe.
    pub fn segment_of(&self, lsid: StripeId) -> SegmentId {
        assert!(
            lsid < self.num_user_stripes(),
            "stripe {} is outside of the user area ({} stripes)",
            lsid,
            self.num_user_stripes()
        );
        lsid / self.stripes_per_segment
    }

    /// First user-area stripe of a segment.
    pub fn first_stripe_of(&self, segment_id: SegmentId) -> StripeId {
        assert!(segment_id < self.num_segments);
        segment_id * self.stripes_per_segment
    }

    pub fn segment_of_vsa(&self, vsa: VirtualBlkAddr) -> SegmentId {
        self.segment_of(vsa.stripe_id)
    }
}
