//! Remembers where each stripe allocator stands inside its active segment,
//! so that a restart continues filling that segment instead of leaving it
//! half allocated in NVRAM.
//!
//! Layout: `[u32 signature]` followed by one `[u32 segment id][u32 next
//! offset]` pair per `StripeOwner`, where a segment id of `u32::MAX` means
//! the owner has no active segment.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::meta_file::MetaFile;
use crate::{AddressInfo, Error, Result, SegmentId};

pub const ALLOCATOR_CTX_SIGNATURE: u32 = 0x414c_4f43;

const NO_SEGMENT: u32 = u32::MAX;

/// Who a stripe allocator hands stripes to. Each owner fills its own
/// segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StripeOwner {
    User,
    Gc,
}

impl StripeOwner {
    const ALL: [StripeOwner; 2] = [StripeOwner::User, StripeOwner::Gc];

    const fn index(self) -> usize {
        match self {
            StripeOwner::User => 0,
            StripeOwner::Gc => 1,
        }
    }
}

/// The segment an allocator is filling and the next stripe offset in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeCursor {
    pub segment_id: SegmentId,
    pub next_offset: u32,
}

type Cursors = [Option<StripeCursor>; 2];

#[derive(Debug)]
pub struct AllocatorCtx {
    file: Arc<dyn MetaFile>,
    address: AddressInfo,
    cursors: Mutex<Cursors>,
}

impl AllocatorCtx {
    pub fn new(file: Arc<dyn MetaFile>, address: AddressInfo) -> AllocatorCtx {
        AllocatorCtx { file, address, cursors: Mutex::new([None; 2]) }
    }

    pub fn file_size(&self) -> u64 {
        4 + 8 * StripeOwner::ALL.len() as u64
    }

    /// Loads the persisted cursors, creating the file with no active
    /// segments if it does not exist yet.
    pub fn init(&self) -> Result<()> {
        let mut cursors = self.cursors.lock();

        if !self.file.exists() {
            self.file.create(self.file_size())?;
            self.file.open()?;
            *cursors = [None; 2];
            self.file.write_at(0, &self.encode(&cursors))?;
            log::debug!("created allocator context file {}", self.file.name());
            return Ok(());
        }

        self.file.open()?;
        let mut buf = vec![0_u8; self.file_size() as usize];
        self.file.read_at(0, &mut buf)?;
        *cursors = decode(&buf, self.address, self.file.name())?;

        log::debug!("loaded stripe cursors {:?}", *cursors);
        Ok(())
    }

    pub fn close(&self) {
        self.file.close();
    }

    pub fn cursor(&self, owner: StripeOwner) -> Option<StripeCursor> {
        self.cursors.lock()[owner.index()]
    }

    /// Runs `f` on the owner's cursor with the cursors locked.
    pub fn with_cursor<F, R>(&self, owner: StripeOwner, f: F) -> R
    where
        F: FnOnce(&mut Option<StripeCursor>) -> R,
    {
        let mut cursors = self.cursors.lock();
        f(&mut cursors[owner.index()])
    }

    /// Drops every cursor whose segment fails `keep`. Returns the dropped
    /// segments.
    pub fn retain_cursors<F>(&self, keep: F) -> Vec<SegmentId>
    where
        F: Fn(SegmentId) -> bool,
    {
        let mut dropped = vec![];
        for cursor in self.cursors.lock().iter_mut() {
            if let Some(c) = *cursor {
                if !keep(c.segment_id) {
                    dropped.push(c.segment_id);
                    *cursor = None;
                }
            }
        }
        dropped
    }

    /// Segments some allocator is currently filling.
    pub fn active_segments(&self) -> Vec<SegmentId> {
        self.cursors.lock().iter().flatten().map(|c| c.segment_id).collect()
    }

    pub fn store(&self) -> Result<()> {
        let buf = self.encode(&self.cursors.lock());
        self.file.write_at(0, &buf)
    }

    fn encode(&self, cursors: &Cursors) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.file_size() as usize);
        buf.extend_from_slice(&ALLOCATOR_CTX_SIGNATURE.to_le_bytes());
        for cursor in cursors {
            let (segment_id, next_offset) = match cursor {
                Some(c) => (c.segment_id, c.next_offset),
                None => (NO_SEGMENT, 0),
            };
            buf.extend_from_slice(&segment_id.to_le_bytes());
            buf.extend_from_slice(&next_offset.to_le_bytes());
        }
        buf
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn decode(buf: &[u8], address: AddressInfo, file: &str) -> Result<Cursors> {
    let corrupt = |reason: String| Error::Corruption { file: file.to_owned(), reason };

    let expected = 4 + 8 * StripeOwner::ALL.len();
    if buf.len() < expected {
        return Err(corrupt(format!(
            "file is {} bytes, expected {}",
            buf.len(),
            expected
        )));
    }

    let signature = read_u32(&buf[..4]);
    if signature != ALLOCATOR_CTX_SIGNATURE {
        return Err(corrupt(format!(
            "signature {:#x}, expected {:#x}",
            signature, ALLOCATOR_CTX_SIGNATURE
        )));
    }

    let mut cursors: Cursors = [None; 2];
    for owner in StripeOwner::ALL {
        let at = 4 + 8 * owner.index();
        let segment_id = read_u32(&buf[at..]);
        let next_offset = read_u32(&buf[at + 4..]);
        if segment_id == NO_SEGMENT {
            continue;
        }
        if segment_id >= address.num_segments
            || next_offset > address.stripes_per_segment
        {
            return Err(corrupt(format!(
                "{:?} cursor at segment {} offset {} is outside the array",
                owner, segment_id, next_offset
            )));
        }
        cursors[owner.index()] = Some(StripeCursor { segment_id, next_offset });
    }

    if let [Some(user), Some(gc)] = cursors {
        if user.segment_id == gc.segment_id {
            return Err(corrupt(format!(
                "user and gc allocators share segment {}",
                user.segment_id
            )));
        }
    }

    Ok(cursors)
}
