//! Packet buffers
//!
//! A single data region split into equally sized slots. Stages pass
//! [`BufferDescriptor`]s (offset + length) through the rings instead of
//! copying packet bytes.

use tracing::debug;

/// Default slot size: a full Ethernet frame plus headroom
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Location of a packet inside the data region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub offset: usize,
    pub len: usize,
}

/// Fixed pool of packet buffers over one contiguous data region
pub struct BufferPool {
    region: Box<[u8]>,
    buffer_size: usize,
    free: Vec<BufferDescriptor>,
    count: usize,
}

impl BufferPool {
    /// Allocate `count` buffers of `buffer_size` bytes each.
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let region = vec![0u8; count * buffer_size].into_boxed_slice();
        // Reverse so the lowest offsets are handed out first
        let free = (0..count)
            .rev()
            .map(|i| BufferDescriptor {
                offset: i * buffer_size,
                len: 0,
            })
            .collect();

        debug!(count, buffer_size, "buffer pool created");

        Self {
            region,
            buffer_size,
            free,
            count,
        }
    }

    /// Take a free buffer; its length starts at zero.
    pub fn alloc(&mut self) -> Option<BufferDescriptor> {
        self.free.pop()
    }

    /// Take a free buffer and copy `data` into it.
    ///
    /// Returns None when the pool is empty or `data` does not fit.
    pub fn alloc_from(&mut self, data: &[u8]) -> Option<BufferDescriptor> {
        if data.len() > self.buffer_size {
            return None;
        }
        let mut desc = self.alloc()?;
        desc.len = data.len();
        self.bytes_mut(desc).copy_from_slice(data);
        Some(desc)
    }

    /// Return a buffer to the pool
    pub fn free(&mut self, desc: BufferDescriptor) {
        debug_assert!(self.free.len() < self.count, "double free of packet buffer");
        self.free.push(BufferDescriptor {
            offset: desc.offset,
            len: 0,
        });
    }

    /// Packet bytes described by `desc`
    pub fn bytes(&self, desc: BufferDescriptor) -> &[u8] {
        &self.region[desc.offset..desc.offset + desc.len]
    }

    pub fn bytes_mut(&mut self, desc: BufferDescriptor) -> &mut [u8] {
        &mut self.region[desc.offset..desc.offset + desc.len]
    }

    /// The whole slot behind `desc`, for writing a new packet
    pub fn slot_mut(&mut self, desc: BufferDescriptor) -> &mut [u8] {
        &mut self.region[desc.offset..desc.offset + self.buffer_size]
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of free buffers
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.count
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.free.len())
            .field("capacity", &self.count)
            .finish()
    }
}
