//! Per-frame constant data rings
//!
//! Every draw call needs a little scratch space for per-object uniform
//! data (transforms, bone matrices, light parameters). Allocating GPU
//! buffers per draw would be absurd, so each frame-in-flight owns a
//! [`ConstantDataPool`]: a fixed ring of small writable buffers created
//! when the pass set changes and rewound every frame once the fence says
//! the GPU is done reading them.
//!
//! Draining the pool is a capacity tuning bug and panics; writing past a
//! buffer's byte capacity is data corruption waiting to happen and also
//! panics.

use bytemuck::Pod;

use crate::gpu::{BufferUsage, GpuBuffer, GpuDevice, GpuResult};

/// Handle to one buffer in a [`ConstantDataPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantBufferHandle {
    index: u32,
}

impl ConstantBufferHandle {
    /// Position of the buffer within its pool.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }
}

/// Fixed ring of small writable GPU buffers, one instance per
/// frame-in-flight.
pub struct ConstantDataPool {
    buffers: Vec<Box<dyn GpuBuffer>>,
    buffer_len: usize,
    next: u32,
}

impl ConstantDataPool {
    /// Create `buffer_count` buffers of `buffer_len` bytes each.
    ///
    /// # Errors
    /// Propagates buffer creation failure from the device.
    pub fn new(device: &dyn GpuDevice, buffer_count: u32, buffer_len: usize) -> GpuResult<Self> {
        let mut buffers = Vec::with_capacity(buffer_count as usize);
        for _ in 0..buffer_count {
            buffers.push(device.create_buffer(buffer_len, BufferUsage::Constant)?);
        }
        log::debug!("Constant data pool: {buffer_count} buffers x {buffer_len} bytes");
        Ok(Self { buffers, buffer_len, next: 0 })
    }

    /// Hand out the next buffer in the ring.
    ///
    /// The sequence of handles after a [`reset`](Self::reset) is identical
    /// to the sequence after construction, which is what makes command
    /// stream replay deterministic.
    ///
    /// # Panics
    /// When the pool is drained. Size the pool to the stream's draw
    /// count; this is a configuration bug, not a transient failure.
    pub fn next(&mut self) -> ConstantBufferHandle {
        let count = u32::try_from(self.buffers.len()).expect("pool size fits in u32");
        assert!(
            self.next < count,
            "constant data pool drained ({count} buffers); the command stream needs more per-draw scratch space than configured",
        );
        let handle = ConstantBufferHandle { index: self.next };
        self.next += 1;
        handle
    }

    /// Rewind the ring cursor. Called once per frame after the fence
    /// confirms the GPU has finished reading.
    pub fn reset(&mut self) {
        self.next = 0;
    }

    /// The buffer a handle refers to.
    #[must_use]
    pub fn buffer(&self, handle: ConstantBufferHandle) -> &dyn GpuBuffer {
        self.buffers[handle.index as usize].as_ref()
    }

    /// Sequential writer over a handle's buffer.
    #[must_use]
    pub fn writer(&self, handle: ConstantBufferHandle) -> ConstantBufferWriter<'_> {
        ConstantBufferWriter {
            buffer: self.buffers[handle.index as usize].as_ref(),
            offset: 0,
            capacity: self.buffer_len,
        }
    }

    /// Buffers handed out since the last reset.
    #[must_use]
    pub const fn in_use(&self) -> u32 {
        self.next
    }

    /// Total buffers in the ring.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        u32::try_from(self.buffers.len()).expect("pool size fits in u32")
    }
}

/// Sequential byte writer over one constant buffer.
///
/// `write` copies raw bytes at an internally advancing offset; `advance`
/// skips bytes for manual padding, e.g. padding a bone-matrix array out
/// to the fixed stride the shader expects.
pub struct ConstantBufferWriter<'a> {
    buffer: &'a dyn GpuBuffer,
    offset: usize,
    capacity: usize,
}

impl ConstantBufferWriter<'_> {
    /// Copy `value`'s bytes at the current offset and advance past them.
    ///
    /// # Panics
    /// When the write would run past the buffer's byte capacity.
    pub fn write<T: Pod>(&mut self, value: &T) {
        let bytes = bytemuck::bytes_of(value);
        assert!(
            self.offset + bytes.len() <= self.capacity,
            "constant buffer overrun: write of {} bytes at offset {} exceeds capacity {}",
            bytes.len(),
            self.offset,
            self.capacity,
        );
        self.buffer
            .write(self.offset, bytes)
            .unwrap_or_else(|e| panic!("constant buffer write failed: {e}"));
        self.offset += bytes.len();
    }

    /// Skip `bytes` without writing, for fixed-stride padding.
    ///
    /// # Panics
    /// When the skip would run past the buffer's byte capacity.
    pub fn advance(&mut self, bytes: usize) {
        assert!(
            self.offset + bytes <= self.capacity,
            "constant buffer overrun: advance of {bytes} bytes at offset {} exceeds capacity {}",
            self.offset,
            self.capacity,
        );
        self.offset += bytes;
    }

    /// Bytes consumed so far (written plus skipped).
    #[must_use]
    pub const fn written(&self) -> usize {
        self.offset
    }
}
