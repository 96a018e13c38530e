use crate::{Error, Result};

/// Per-segment counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub valid_block_count: u32,
    pub occupied_stripe_count: u32,
}

/// Bytes used by `n` segments' counters in the flat on-disk layout.
pub const fn encoded_len(n: usize) -> usize {
    n * 2 * std::mem::size_of::<u32>()
}

/// Appends all valid block counts followed by all occupied stripe counts,
/// little endian.
pub fn serialize_into(infos: &[SegmentInfo], buf: &mut Vec<u8>) {
    buf.reserve(encoded_len(infos.len()));
    for info in infos {
        buf.extend_from_slice(&info.valid_block_count.to_le_bytes());
    }
    for info in infos {
        buf.extend_from_slice(&info.occupied_stripe_count.to_le_bytes());
    }
}

pub fn deserialize(buf: &[u8], n: usize) -> Result<Vec<SegmentInfo>> {
    let expected = encoded_len(n);
    if buf.len() < expected {
        return Err(Error::Corruption {
            file: "segment info".into(),
            reason: format!(
                "{} bytes cannot hold counters for {} segments ({} bytes)",
                buf.len(),
                n,
                expected
            ),
        });
    }

    let (valid, occupied) = buf[..expected].split_at(expected / 2);
    let read_u32 = |c: &[u8]| u32::from_le_bytes([c[0], c[1], c[2], c[3]]);

    Ok(valid
        .chunks_exact(4)
        .zip(occupied.chunks_exact(4))
        .map(|(v, o)| SegmentInfo {
            valid_block_count: read_u32(v),
            occupied_stripe_count: read_u32(o),
        })
        .collect())
}
