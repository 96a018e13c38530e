//! The physical I/O path as seen by the copy pipeline: submit a block
//! request, get the request back in a completion.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::{Error, Result, VirtualBlkAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// A single-block request. The buffer is owned by the request and handed
/// back to the completion.
#[derive(Debug)]
pub struct Ubio {
    pub direction: IoDirection,
    pub addr: VirtualBlkAddr,
    pub buffer: Vec<u8>,
}

pub type IoCompletion = Box<dyn FnOnce(Ubio, Result<()>) + Send>;

pub trait IoSubmitter: Send + Sync + fmt::Debug {
    /// `done` is called exactly once, possibly before `submit` returns.
    fn submit(&self, ubio: Ubio, done: IoCompletion);
}

/// Block storage held in memory. Requests complete on the submitting
/// thread.
#[derive(Debug)]
pub struct MemDevice {
    block_size: usize,
    blocks: Mutex<FnvHashMap<VirtualBlkAddr, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDevice {
    pub fn new(block_size: usize) -> MemDevice {
        MemDevice {
            block_size,
            blocks: Mutex::default(),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn read_block(&self, addr: VirtualBlkAddr) -> Option<Vec<u8>> {
        self.blocks.lock().get(&addr).cloned()
    }

    /// Returns (reads, writes) completed so far.
    pub fn counters(&self) -> (u64, u64) {
        (self.reads.load(Ordering::Acquire), self.writes.load(Ordering::Acquire))
    }

    fn execute(&self, ubio: &mut Ubio) -> Result<()> {
        if ubio.buffer.len() != self.block_size {
            return Err(Error::Unsupported(format!(
                "request buffer of {} bytes, block size is {}",
                ubio.buffer.len(),
                self.block_size
            )));
        }
        match ubio.direction {
            IoDirection::Read => {
                if self.fail_reads.load(Ordering::SeqCst) {
                    return Err(Error::Io(io::Error::other(format!(
                        "injected read failure at {:?}",
                        ubio.addr
                    ))));
                }
                match self.blocks.lock().get(&ubio.addr) {
                    Some(data) => ubio.buffer.copy_from_slice(data),
                    None => ubio.buffer.fill(0),
                }
                self.reads.fetch_add(1, Ordering::AcqRel);
            }
            IoDirection::Write => {
                if self.fail_writes.load(Ordering::SeqCst) {
                    return Err(Error::Io(io::Error::other(format!(
                        "injected write failure at {:?}",
                        ubio.addr
                    ))));
                }
                self.blocks.lock().insert(ubio.addr, ubio.buffer.clone());
                self.writes.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }
}

impl IoSubmitter for MemDevice {
    fn submit(&self, mut ubio: Ubio, done: IoCompletion) {
        let res = self.execute(&mut ubio);
        if let Err(e) = &res {
            log::warn!("{:?} at {:?} failed: {}", ubio.direction, ubio.addr, e);
        }
        done(ubio, res)
    }
}
