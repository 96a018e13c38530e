use crossbeam_queue::ArrayQueue;

/// Fixed set of block-sized staging buffers shared by the GC copy lanes.
/// Running out of buffers is not an error: callers retry later.
#[derive(Debug)]
pub struct BufferPool {
    free: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(count: usize, buffer_size: usize) -> BufferPool {
        let free = ArrayQueue::new(count.max(1));
        for _ in 0..count {
            // capacity equals count
            let _ = free.push(vec![0; buffer_size]);
        }
        BufferPool { free, buffer_size }
    }

    /// Takes `count` buffers, or none at all.
    pub fn try_get_buffers(&self, count: usize) -> Option<Vec<Vec<u8>>> {
        let mut taken = Vec::with_capacity(count);
        while taken.len() < count {
            match self.free.pop() {
                Some(buffer) => taken.push(buffer),
                None => {
                    log::trace!(
                        "staging pool exhausted, wanted {} got {}",
                        count,
                        taken.len()
                    );
                    for buffer in taken {
                        self.return_buffer(buffer);
                    }
                    return None;
                }
            }
        }
        Some(taken)
    }

    pub fn return_buffer(&self, mut buffer: Vec<u8>) {
        buffer.resize(self.buffer_size, 0);
        if self.free.push(buffer).is_err() {
            log::error!("staging buffer returned to a full pool");
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}
