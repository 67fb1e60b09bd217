//! Descriptor handle allocation
//!
//! Two allocators with very different disciplines share this module:
//!
//! - [`DescriptorPool`] owns one CPU-visible heap per descriptor kind,
//!   partitioned into a *static* region (engine-lifetime views, explicit
//!   release through a LIFO free list) and one *dynamic* sub-region per
//!   frame-in-flight (ephemeral per-draw views, reclaimed wholesale once
//!   the frame's fence confirms the GPU is done with them).
//! - [`ShaderVisibleDescriptorAllocator`] owns a shader-visible heap used
//!   to build one contiguous descriptor table per draw. It is a pure bump
//!   ring with no free list: reset once per frame, O(1) allocation, zero
//!   fragmentation.
//!
//! Pools are fixed capacity on purpose. Growth would require heap
//! recreation, which is a distinct, expensive operation; running out is a
//! build-time sizing defect and panics with a diagnostic rather than
//! returning an error.

use crate::gpu::{DescriptorKind, GpuDevice, GpuResult};

/// Opaque reference to one descriptor slot.
///
/// Pairs a CPU-addressable handle with (optionally) a GPU-addressable
/// handle. The default value is null; handles are plain values and the
/// pool, not the handle, owns the backing slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorHandle {
    /// CPU-visible slot address.
    pub cpu: u64,
    /// GPU-visible slot address; zero when the slot is not shader visible.
    pub gpu: u64,
}

impl DescriptorHandle {
    /// Whether this is the null handle.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.cpu == 0
    }

    /// Whether the slot is reachable from shader code.
    #[must_use]
    pub const fn is_shader_visible(&self) -> bool {
        self.gpu != 0
    }
}

/// Fixed-capacity CPU-visible descriptor pool with a static/dynamic split.
pub struct DescriptorPool {
    kind: DescriptorKind,
    cpu_base: u64,
    gpu_base: u64,
    stride: u64,
    static_capacity: u32,
    dynamic_per_frame: u32,
    static_next: u32,
    free_list: Vec<u32>,
    dynamic_cursors: Vec<u32>,
}

impl DescriptorPool {
    /// Create the pool's backing heap and partition it.
    ///
    /// Layout: `[0, static_capacity)` is the static region, followed by
    /// one `dynamic_per_frame` sub-region per frame-in-flight.
    ///
    /// # Errors
    /// Propagates heap creation failure from the device.
    pub fn new(
        device: &dyn GpuDevice,
        kind: DescriptorKind,
        static_capacity: u32,
        dynamic_per_frame: u32,
        frames_in_flight: usize,
        shader_visible: bool,
    ) -> GpuResult<Self> {
        let frames = u32::try_from(frames_in_flight).expect("frames_in_flight fits in u32");
        let total = static_capacity + dynamic_per_frame * frames;
        let heap = device.create_descriptor_heap(kind, total, shader_visible)?;
        log::debug!(
            "Descriptor pool {kind:?}: {static_capacity} static + {dynamic_per_frame}x{frames} dynamic = {total} slots"
        );
        Ok(Self {
            kind,
            cpu_base: heap.cpu_base,
            gpu_base: heap.gpu_base,
            stride: u64::from(heap.stride),
            static_capacity,
            dynamic_per_frame,
            static_next: 0,
            free_list: Vec::new(),
            dynamic_cursors: vec![0; frames_in_flight],
        })
    }

    /// The semantic kind of every slot in this pool.
    #[must_use]
    pub const fn kind(&self) -> DescriptorKind {
        self.kind
    }

    fn handle_at(&self, index: u32) -> DescriptorHandle {
        let offset = u64::from(index) * self.stride;
        DescriptorHandle {
            cpu: self.cpu_base + offset,
            gpu: if self.gpu_base == 0 { 0 } else { self.gpu_base + offset },
        }
    }

    /// Allocate a slot from the static region.
    ///
    /// Prefers indices from the free list (LIFO) before advancing the
    /// bump index.
    ///
    /// # Panics
    /// When the static region is exhausted. This is a pool sizing defect,
    /// not a runtime condition to retry.
    pub fn allocate_static(&mut self) -> DescriptorHandle {
        if let Some(index) = self.free_list.pop() {
            return self.handle_at(index);
        }
        assert!(
            self.static_next < self.static_capacity,
            "static descriptor region exhausted ({:?}, capacity {}); raise the pool size in RendererConfig",
            self.kind,
            self.static_capacity,
        );
        let index = self.static_next;
        self.static_next += 1;
        self.handle_at(index)
    }

    /// Return a static slot to the free list.
    ///
    /// The slot index is recomputed from the handle's address offset.
    /// Live slots are never compacted or relocated; a stale copy of a
    /// released handle is caller error by engine convention.
    ///
    /// # Panics
    /// When the handle does not point into this pool's static region.
    pub fn release_static(&mut self, handle: DescriptorHandle) {
        assert!(!handle.is_null(), "released a null descriptor handle");
        let offset = handle.cpu.checked_sub(self.cpu_base).unwrap_or_else(|| {
            panic!("released handle below {:?} pool base", self.kind)
        });
        assert!(
            offset % self.stride == 0,
            "released handle not slot-aligned ({:?} pool)",
            self.kind
        );
        let index = u32::try_from(offset / self.stride).expect("slot index fits in u32");
        assert!(
            index < self.static_capacity,
            "released handle outside the static region ({:?} pool, slot {index})",
            self.kind
        );
        debug_assert!(
            !self.free_list.contains(&index),
            "double release of {:?} slot {index}",
            self.kind
        );
        self.free_list.push(index);
    }

    /// Allocate the next slot in `frame`'s dynamic sub-region.
    ///
    /// # Panics
    /// When the frame's dynamic capacity is exceeded (sizing defect), or
    /// when `frame` is out of range.
    pub fn allocate_dynamic(&mut self, frame: usize) -> DescriptorHandle {
        let cursor = self.dynamic_cursors[frame];
        assert!(
            cursor < self.dynamic_per_frame,
            "dynamic descriptor region exhausted ({:?}, frame {frame}, capacity {}); raise dynamic_per_frame in RendererConfig",
            self.kind,
            self.dynamic_per_frame,
        );
        let frame_u32 = u32::try_from(frame).expect("frame index fits in u32");
        let index = self.static_capacity + frame_u32 * self.dynamic_per_frame + cursor;
        self.dynamic_cursors[frame] = cursor + 1;
        self.handle_at(index)
    }

    /// Rewind `frame`'s dynamic cursor to its region base.
    ///
    /// Called exactly once per frame, after the fence confirms the GPU
    /// has finished consuming that frame's previous allocations.
    pub fn reset_dynamic(&mut self, frame: usize) {
        self.dynamic_cursors[frame] = 0;
    }

    /// Number of live static slots (allocated minus released).
    #[must_use]
    pub fn static_in_use(&self) -> u32 {
        self.static_next - u32::try_from(self.free_list.len()).expect("free list fits in u32")
    }

    /// Dynamic slots handed out to `frame` since its last reset.
    #[must_use]
    pub fn dynamic_in_use(&self, frame: usize) -> u32 {
        self.dynamic_cursors[frame]
    }
}

/// GPU-visible bump ring for per-draw descriptor tables.
pub struct ShaderVisibleDescriptorAllocator {
    cpu_base: u64,
    gpu_base: u64,
    stride: u64,
    capacity: u32,
    next: u32,
}

/// A contiguous run of shader-visible slots allocated for one table.
#[derive(Debug, Clone, Copy)]
pub struct TableSlice {
    /// Handle of the first slot.
    pub base: DescriptorHandle,
    /// Ring index of the first slot.
    pub base_index: u32,
    /// Number of slots.
    pub count: u32,
    stride: u64,
}

impl TableSlice {
    /// Handle of slot `i` within the run.
    ///
    /// # Panics
    /// When `i` is outside the run.
    #[must_use]
    pub fn slot(&self, i: u32) -> DescriptorHandle {
        assert!(i < self.count, "table slot {i} out of range (count {})", self.count);
        let offset = u64::from(i) * self.stride;
        DescriptorHandle { cpu: self.base.cpu + offset, gpu: self.base.gpu + offset }
    }
}

impl ShaderVisibleDescriptorAllocator {
    /// Create the shader-visible heap.
    ///
    /// # Errors
    /// Propagates heap creation failure from the device.
    pub fn new(device: &dyn GpuDevice, kind: DescriptorKind, capacity: u32) -> GpuResult<Self> {
        let heap = device.create_descriptor_heap(kind, capacity, true)?;
        Ok(Self {
            cpu_base: heap.cpu_base,
            gpu_base: heap.gpu_base,
            stride: u64::from(heap.stride),
            capacity,
            next: 0,
        })
    }

    /// Allocate `count` contiguous slots, returning the run.
    ///
    /// # Panics
    /// When the ring is exhausted. Size the ring to the worst-case
    /// per-frame consumption: draw-call count times per-draw table width.
    pub fn allocate(&mut self, count: u32) -> TableSlice {
        assert!(
            self.next + count <= self.capacity,
            "shader-visible descriptor ring exhausted ({} + {count} > {}); raise shader_visible_capacity in RendererConfig",
            self.next,
            self.capacity,
        );
        let base_index = self.next;
        self.next += count;
        let offset = u64::from(base_index) * self.stride;
        TableSlice {
            base: DescriptorHandle {
                cpu: self.cpu_base + offset,
                gpu: self.gpu_base + offset,
            },
            base_index,
            count,
            stride: self.stride,
        }
    }

    /// Zero the ring index. Called once per frame before recording
    /// begins, after the frame's prior GPU work is confirmed complete.
    pub fn reset(&mut self) {
        self.next = 0;
    }

    /// Slots handed out since the last reset.
    #[must_use]
    pub const fn allocated(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;

    fn pool(static_capacity: u32, dynamic_per_frame: u32, frames: usize) -> DescriptorPool {
        let device = HeadlessDevice::new();
        DescriptorPool::new(
            &device,
            DescriptorKind::ShaderResource,
            static_capacity,
            dynamic_per_frame,
            frames,
            false,
        )
        .expect("pool")
    }

    #[test]
    fn test_null_handle_default() {
        let handle = DescriptorHandle::default();
        assert!(handle.is_null());
        assert!(!handle.is_shader_visible());
    }

    #[test]
    fn test_static_allocations_never_alias() {
        let mut pool = pool(4, 2, 2);
        let a = pool.allocate_static();
        let b = pool.allocate_static();
        pool.release_static(a);
        let c = pool.allocate_static();
        let d = pool.allocate_static();
        // c reuses a's slot (LIFO), d takes a fresh one; live handles must
        // all be distinct.
        assert_eq!(c, a);
        assert_ne!(d, b);
        assert_ne!(d, c);
    }

    #[test]
    fn test_static_scenario_four_succeed() {
        let mut pool = pool(4, 2, 2);
        let handles: Vec<_> = (0..4).map(|_| pool.allocate_static()).collect();
        for pair in handles.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert_eq!(pool.static_in_use(), 4);
    }

    #[test]
    #[should_panic(expected = "static descriptor region exhausted")]
    fn test_fifth_static_allocation_is_fatal() {
        let mut pool = pool(4, 2, 2);
        for _ in 0..5 {
            pool.allocate_static();
        }
    }

    #[test]
    fn test_dynamic_two_per_frame() {
        let mut pool = pool(4, 2, 2);
        let a = pool.allocate_dynamic(0);
        let b = pool.allocate_dynamic(0);
        assert_ne!(a, b);
        assert_eq!(pool.dynamic_in_use(0), 2);
        // Frame 1 has its own sub-region.
        let c = pool.allocate_dynamic(1);
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    #[should_panic(expected = "dynamic descriptor region exhausted")]
    fn test_third_dynamic_allocation_is_fatal() {
        let mut pool = pool(4, 2, 2);
        pool.allocate_dynamic(0);
        pool.allocate_dynamic(0);
        pool.allocate_dynamic(0);
    }

    #[test]
    fn test_reset_dynamic_permits_reallocation() {
        let mut pool = pool(4, 2, 2);
        let first = pool.allocate_dynamic(0);
        pool.allocate_dynamic(0);
        pool.reset_dynamic(0);
        let again = pool.allocate_dynamic(0);
        pool.allocate_dynamic(0);
        assert_eq!(first, again);
    }

    #[test]
    #[should_panic(expected = "outside the static region")]
    fn test_releasing_dynamic_handle_is_fatal() {
        let mut pool = pool(4, 2, 2);
        let handle = pool.allocate_dynamic(0);
        pool.release_static(handle);
    }

    #[test]
    fn test_shader_visible_reset_restarts_at_zero() {
        let device = HeadlessDevice::new();
        let mut ring =
            ShaderVisibleDescriptorAllocator::new(&device, DescriptorKind::ShaderResource, 64)
                .expect("ring");
        let first = ring.allocate(8);
        assert_eq!(first.base_index, 0);
        let second = ring.allocate(4);
        assert_eq!(second.base_index, 8);
        ring.reset();
        let after_reset = ring.allocate(3);
        assert_eq!(after_reset.base_index, 0);
        assert_eq!(after_reset.base, first.base);
    }

    #[test]
    #[should_panic(expected = "shader-visible descriptor ring exhausted")]
    fn test_shader_visible_overflow_is_fatal() {
        let device = HeadlessDevice::new();
        let mut ring =
            ShaderVisibleDescriptorAllocator::new(&device, DescriptorKind::ShaderResource, 8)
                .expect("ring");
        ring.allocate(6);
        ring.allocate(3);
    }

    #[test]
    fn test_table_slice_slot_addresses_are_contiguous() {
        let device = HeadlessDevice::new();
        let mut ring =
            ShaderVisibleDescriptorAllocator::new(&device, DescriptorKind::ShaderResource, 16)
                .expect("ring");
        let run = ring.allocate(4);
        let s0 = run.slot(0);
        let s1 = run.slot(1);
        assert_eq!(s1.cpu - s0.cpu, s1.gpu - s0.gpu);
        assert!(s1.cpu > s0.cpu);
    }
}
