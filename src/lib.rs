//! `logseg` is the allocation and space reclamation core of a
//! log-structured block store.
//!
//! It tracks which segments of the array are free, receiving writes,
//! destaged or being reclaimed; hands out stripes inside segments to the
//! write path; and runs a garbage collector that picks lightly used
//! segments, copies their live blocks elsewhere and returns them to the
//! free pool. Segment counters and the rebuild target set are persisted
//! in metadata files so the state survives a restart.
//!
//! ```no_run
//! # fn main() -> logseg::Result<()> {
//! use logseg::{Config, ContextManager, MetaDirectory};
//!
//! let config = Config::new().path("my_array_meta");
//! let dir = MetaDirectory::open(&config)?;
//! let context = ContextManager::open(&config, &dir)?;
//!
//! let segment = context.allocate_free_segment();
//! assert!(segment.is_some());
//!
//! context.flush_contexts()?;
//! context.close();
//! # Ok(())
//! # }
//! ```

mod address;
mod allocator_ctx;
mod bitmap;
mod block_allocator;
mod buffer_pool;
mod config;
mod context_manager;
pub mod gc;
pub mod io;
mod meta_file;
mod rebuild_ctx;
mod result;
pub mod reverse_map;
pub mod scheduler;
mod segment_ctx;
mod segment_info;
mod segment_state;
pub mod state;
mod stripe;

pub use crate::address::{
    AddressInfo, BlkOffset, Rba, SegmentId, StripeId, VirtualBlkAddr, VolumeId,
};
pub use crate::allocator_ctx::{
    ALLOCATOR_CTX_SIGNATURE, AllocatorCtx, StripeCursor, StripeOwner,
};
pub use crate::bitmap::Bitmap;
pub use crate::block_allocator::StripeAllocator;
pub use crate::buffer_pool::BufferPool;
pub use crate::config::Config;
pub use crate::context_manager::{
    ALLOCATOR_CTX_FILE, ContextManager, GcMode, REBUILD_CTX_FILE,
    SEGMENT_CTX_FILE,
};
pub use crate::meta_file::{
    AsyncMetaIo, AsyncMetaIoCallback, FileStore, MemFile, MetaDirectory,
    MetaFile, MetaIoOpcode,
};
pub use crate::rebuild_ctx::RebuildCtx;
pub use crate::result::{Error, Result};
pub use crate::segment_ctx::{SEGMENT_CTX_SIGNATURE, SegmentCtx};
pub use crate::segment_info::SegmentInfo;
pub use crate::segment_state::SegmentState;
pub use crate::stripe::{FlushGroup, Stripe};
