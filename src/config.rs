use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{AddressInfo, Error, Result};

const DEFAULT_PATH: &str = "default.logseg";

macro_rules! supported {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            return Err(Error::Unsupported($msg.to_owned()));
        }
    };
}

macro_rules! builder {
    ($(($name:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc=$desc]
            pub fn $name(mut self, to: $t) -> Config {
                self.$name = to;
                self
            }
        )*
    }
}

/// Top-level configuration for the segment allocator and its garbage
/// collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub path: PathBuf,
    pub num_segments: u32,
    pub stripes_per_segment: u32,
    pub blocks_per_stripe: u32,
    pub block_size: usize,
    pub gc_copy_lanes: u32,
    pub gc_buffer_count: usize,
    pub gc_buffer_retry_limit: u32,
    pub gc_history_capacity: usize,
    pub gc_normal_threshold: u32,
    pub gc_urgent_threshold: u32,
    pub scheduler_threads: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: PathBuf::from(DEFAULT_PATH),
            num_segments: 64,
            stripes_per_segment: 64,
            blocks_per_stripe: 64,
            block_size: 4096,
            gc_copy_lanes: 16,
            gc_buffer_count: 512,
            gc_buffer_retry_limit: 10_000,
            gc_history_capacity: 20,
            gc_normal_threshold: 20,
            gc_urgent_threshold: 5,
            scheduler_threads: 4,
        }
    }
}

impl Config {
    /// Returns a default `Config`
    pub fn new() -> Config {
        Config::default()
    }

    /// Set the directory holding the metadata files (builder).
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Config {
        self.path = path.as_ref().to_path_buf();
        self
    }

    builder!(
        (num_segments, u32, "number of segments in the array"),
        (stripes_per_segment, u32, "number of stripes in each segment"),
        (blocks_per_stripe, u32, "number of blocks in each stripe"),
        (block_size, usize, "size in bytes of a single block"),
        (gc_copy_lanes, u32, "number of stripe copiers running per victim segment"),
        (gc_buffer_count, usize, "number of block-sized staging buffers for copying"),
        (gc_buffer_retry_limit, u32, "failed buffer requests before a copier gives up"),
        (gc_history_capacity, usize, "number of finished copy cycles kept in the GC history"),
        (gc_normal_threshold, u32, "free segment count at or below which GC runs"),
        (gc_urgent_threshold, u32, "free segment count at or below which GC is urgent"),
        (scheduler_threads, usize, "number of worker threads used by the event scheduler")
    );

    /// Array geometry derived from this configuration.
    pub fn address_info(&self) -> AddressInfo {
        AddressInfo {
            num_segments: self.num_segments,
            stripes_per_segment: self.stripes_per_segment,
            blocks_per_stripe: self.blocks_per_stripe,
        }
    }

    /// Returns `Error::Unsupported` for settings the system cannot run with.
    pub fn validate(&self) -> Result<()> {
        supported!(self.num_segments > 0, "num_segments must be above 0");
        supported!(
            self.stripes_per_segment > 0,
            "stripes_per_segment must be above 0"
        );
        supported!(
            self.blocks_per_stripe > 0,
            "blocks_per_stripe must be above 0"
        );
        let total_blocks = u64::from(self.num_segments)
            * u64::from(self.stripes_per_segment)
            * u64::from(self.blocks_per_stripe);
        supported!(
            total_blocks < u64::from(u32::MAX),
            "array geometry overflows 32-bit block addressing"
        );
        supported!(self.block_size > 0, "block_size must be above 0");
        supported!(self.gc_copy_lanes > 0, "gc_copy_lanes must be above 0");
        supported!(
            self.gc_copy_lanes <= self.stripes_per_segment,
            "gc_copy_lanes cannot exceed stripes_per_segment"
        );
        supported!(
            self.gc_buffer_count >= self.blocks_per_stripe as usize,
            format!(
                "gc_buffer_count must hold at least one stripe ({} blocks)",
                self.blocks_per_stripe
            )
        );
        supported!(
            self.gc_history_capacity > 0,
            "gc_history_capacity must be above 0"
        );
        supported!(
            self.gc_urgent_threshold <= self.gc_normal_threshold,
            "gc_urgent_threshold cannot exceed gc_normal_threshold"
        );
        supported!(
            self.scheduler_threads > 0,
            "scheduler_threads must be above 0"
        );
        Ok(())
    }
}
