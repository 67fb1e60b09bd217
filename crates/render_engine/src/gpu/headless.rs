//! Headless reference backend
//!
//! A complete in-process implementation of the [`crate::gpu`] traits with
//! no graphics API behind it: heap addresses are invented, buffers and
//! textures live in host memory, and submitted work "completes"
//! immediately. The unit tests and the demo app run against it, and it
//! doubles as the reference for what a native backend must implement.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::config::RendererConfig;
use crate::gpu::{
    BufferUsage, CommandRecorder, DescriptorHeapInfo, DescriptorKind, DescriptorTable, GpuBuffer,
    GpuDevice, GpuError, GpuFence, GpuResult, GpuTexture, PassAttachments, PipelineDesc,
    PipelineId, PresentSurface, ResourceState, ResourceTransition, ShaderSource, TextureDesc,
    TextureFormat, TextureDimension,
};

/// Byte stride between descriptor slots in every headless heap.
const DESCRIPTOR_STRIDE: u32 = 32;

/// Gap left between heap address ranges, to catch cross-heap arithmetic.
const HEAP_GAP: u64 = 0x1000;

/// Backend factory registered under `"headless"`.
///
/// # Errors
/// Never fails in practice; the signature matches the registry contract.
pub fn create(
    config: &RendererConfig,
) -> GpuResult<(Arc<dyn GpuDevice>, Box<dyn PresentSurface>)> {
    let device = Arc::new(HeadlessDevice::new());
    let mut back_buffers = Vec::with_capacity(config.frames_in_flight);
    for _ in 0..config.frames_in_flight {
        back_buffers.push(device.next_resource_id());
    }
    let surface = Box::new(HeadlessSurface {
        extent: (config.surface.width, config.surface.height),
        scale_factor: config.surface.scale_factor,
        back_buffers,
        presented: 0,
    });
    Ok((device, surface))
}

#[derive(Default)]
struct DeviceState {
    next_resource: u64,
    next_address: u64,
    next_pipeline: u64,
    pipelines: HashMap<u64, PipelineDesc>,
    views: HashMap<u64, (DescriptorKind, u64)>,
    descriptor_copies: u64,
}

/// In-process device context.
pub struct HeadlessDevice {
    state: Mutex<DeviceState>,
}

impl HeadlessDevice {
    /// New device with empty address and resource spaces.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState {
                next_resource: 1,
                next_address: HEAP_GAP,
                next_pipeline: 1,
                ..DeviceState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().expect("headless device state poisoned")
    }

    /// Allocate a fresh resource identity (used for back buffers).
    #[must_use]
    pub fn next_resource_id(&self) -> u64 {
        let mut state = self.lock();
        let id = state.next_resource;
        state.next_resource += 1;
        id
    }

    /// Look up the description a pipeline was created with.
    #[must_use]
    pub fn pipeline_desc(&self, pipeline: PipelineId) -> Option<PipelineDesc> {
        self.lock().pipelines.get(&pipeline.0).cloned()
    }

    /// The resource a CPU descriptor slot currently views, if any.
    #[must_use]
    pub fn view_resource(&self, cpu_descriptor: u64) -> Option<u64> {
        self.lock().views.get(&cpu_descriptor).map(|(_, r)| *r)
    }

    /// Total descriptors staged through [`GpuDevice::copy_descriptors`].
    #[must_use]
    pub fn descriptor_copies(&self) -> u64 {
        self.lock().descriptor_copies
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HeadlessDevice {
    fn backend_name(&self) -> &'static str {
        "headless"
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorKind,
        capacity: u32,
        shader_visible: bool,
    ) -> GpuResult<DescriptorHeapInfo> {
        if capacity == 0 {
            return Err(GpuError::HeapCreation(format!(
                "zero-capacity {kind:?} heap requested"
            )));
        }
        let mut state = self.lock();
        let span = u64::from(capacity) * u64::from(DESCRIPTOR_STRIDE) + HEAP_GAP;
        let cpu_base = state.next_address;
        state.next_address += span;
        let gpu_base = if shader_visible {
            let base = state.next_address;
            state.next_address += span;
            base
        } else {
            0
        };
        log::debug!(
            "Created {kind:?} heap: {capacity} slots, cpu_base={cpu_base:#x}, shader_visible={shader_visible}"
        );
        Ok(DescriptorHeapInfo { cpu_base, gpu_base, stride: DESCRIPTOR_STRIDE })
    }

    fn create_buffer(&self, len: usize, usage: BufferUsage) -> GpuResult<Box<dyn GpuBuffer>> {
        if len == 0 {
            return Err(GpuError::BufferCreation("zero-length buffer requested".to_string()));
        }
        let mut state = self.lock();
        let id = state.next_resource;
        state.next_resource += 1;
        log::trace!("Created {usage:?} buffer {id}: {len} bytes");
        Ok(Box::new(HeadlessBuffer { id, data: Mutex::new(vec![0; len]) }))
    }

    fn create_texture(&self, desc: &TextureDesc) -> GpuResult<Box<dyn GpuTexture>> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 {
            return Err(GpuError::TextureCreation(format!(
                "degenerate texture description: {desc:?}"
            )));
        }
        let mut state = self.lock();
        let id = state.next_resource;
        state.next_resource += 1;
        log::trace!("Created texture {id}: {}x{} {:?}", desc.width, desc.height, desc.format);
        Ok(Box::new(HeadlessTexture { id, desc: desc.clone(), data: Mutex::new(None) }))
    }

    fn create_pipeline(&self, desc: &PipelineDesc, source: &ShaderSource) -> GpuResult<PipelineId> {
        if source.vertex.trim().is_empty() || source.fragment.trim().is_empty() {
            return Err(GpuError::PipelineCreation(
                "empty shader stage source".to_string(),
            ));
        }
        let mut state = self.lock();
        let id = state.next_pipeline;
        state.next_pipeline += 1;
        state.pipelines.insert(id, desc.clone());
        Ok(PipelineId(id))
    }

    fn pipeline_table_layout(&self, pipeline: PipelineId) -> Option<crate::gpu::TableLayout> {
        self.lock().pipelines.get(&pipeline.0).map(|d| d.table_layout)
    }

    fn create_recorder(&self) -> GpuResult<Box<dyn CommandRecorder>> {
        Ok(Box::new(HeadlessRecorder { ops: Vec::new(), pass_open: false }))
    }

    fn create_fence(&self) -> GpuResult<Box<dyn GpuFence>> {
        Ok(Box::new(HeadlessFence { completed: Mutex::new(0), signalled: Condvar::new() }))
    }

    fn create_view(&self, cpu_descriptor: u64, kind: DescriptorKind, resource: u64) {
        self.lock().views.insert(cpu_descriptor, (kind, resource));
    }

    fn copy_descriptors(&self, dst_cpu: u64, src_cpu: u64, count: u32, kind: DescriptorKind) {
        let mut state = self.lock();
        for slot in 0..u64::from(count) {
            let stride = u64::from(DESCRIPTOR_STRIDE);
            let src = src_cpu + slot * stride;
            if let Some(view) = state.views.get(&src).copied() {
                state.views.insert(dst_cpu + slot * stride, view);
            }
        }
        state.descriptor_copies += u64::from(count);
        log::trace!("Copied {count} {kind:?} descriptors {src_cpu:#x} -> {dst_cpu:#x}");
    }

    fn submit(
        &self,
        recorder: &mut dyn CommandRecorder,
        fence: &dyn GpuFence,
        ticket: u64,
    ) -> GpuResult<()> {
        let open = recorder
            .as_any()
            .downcast_ref::<HeadlessRecorder>()
            .is_some_and(|r| r.pass_open);
        if open {
            return Err(GpuError::Submit("recorder submitted with an open pass".to_string()));
        }
        // The headless "GPU" completes instantly.
        fence.signal(ticket);
        log::trace!("Submitted command stream, signalled ticket {ticket}");
        Ok(())
    }
}

/// Host-memory buffer resource.
pub struct HeadlessBuffer {
    id: u64,
    data: Mutex<Vec<u8>>,
}

impl HeadlessBuffer {
    /// Snapshot of the buffer contents, for test inspection.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().expect("headless buffer poisoned").clone()
    }
}

impl GpuBuffer for HeadlessBuffer {
    fn len(&self) -> usize {
        self.data.lock().expect("headless buffer poisoned").len()
    }

    fn write(&self, offset: usize, data: &[u8]) -> GpuResult<()> {
        let mut bytes = self.data.lock().expect("headless buffer poisoned");
        let end = offset + data.len();
        if end > bytes.len() {
            return Err(GpuError::WriteOutOfRange {
                offset,
                len: data.len(),
                capacity: bytes.len(),
            });
        }
        bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn resource_id(&self) -> u64 {
        self.id
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Host-memory texture resource.
pub struct HeadlessTexture {
    id: u64,
    desc: TextureDesc,
    data: Mutex<Option<Vec<u8>>>,
}

impl HeadlessTexture {
    fn base_level_len(desc: &TextureDesc) -> usize {
        let bytes_per_pixel = match desc.format {
            TextureFormat::Rgba8 | TextureFormat::Depth32 => 4,
            TextureFormat::Rgba16Float => 8,
        };
        let faces = match desc.dimension {
            TextureDimension::Tex2d => 1,
            TextureDimension::Cube => 6,
        };
        desc.width as usize * desc.height as usize * bytes_per_pixel * faces
    }

    /// Whether pixel data has been uploaded yet.
    #[must_use]
    pub fn is_uploaded(&self) -> bool {
        self.data.lock().expect("headless texture poisoned").is_some()
    }
}

impl GpuTexture for HeadlessTexture {
    fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    fn upload(&self, data: &[u8]) -> GpuResult<()> {
        let expected = Self::base_level_len(&self.desc);
        if data.len() < expected {
            return Err(GpuError::TextureCreation(format!(
                "upload of {} bytes, expected at least {expected}",
                data.len()
            )));
        }
        *self.data.lock().expect("headless texture poisoned") = Some(data.to_vec());
        Ok(())
    }

    fn resource_id(&self) -> u64 {
        self.id
    }
}

/// One operation recorded by the headless recorder.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedOp {
    /// Pass opened.
    BeginPass {
        /// Colour attachment resource, if any.
        color: Option<u64>,
        /// Depth attachment resource, if any.
        depth: Option<u64>,
        /// Clear colour, if clearing.
        clear_color: Option<[f32; 4]>,
        /// Viewport extent.
        viewport: (u32, u32),
    },
    /// Pipeline bound.
    BindPipeline(PipelineId),
    /// Descriptor table bound.
    BindTable {
        /// Ring index of the first slot.
        base_index: u32,
        /// Entries in slot order.
        entries: Vec<crate::gpu::TableEntry>,
    },
    /// Mesh buffers bound.
    BindMesh {
        /// Vertex buffer resource.
        vertex: u64,
        /// Index buffer resource.
        index: u64,
    },
    /// Indexed draw recorded.
    DrawIndexed {
        /// Number of indices.
        index_count: u32,
    },
    /// Pass closed with the given transitions.
    EndPass {
        /// Transitions applied, as (resource, from, to).
        transitions: Vec<(u64, ResourceState, ResourceState)>,
    },
}

/// Command recorder that keeps an inspectable op list.
pub struct HeadlessRecorder {
    ops: Vec<RecordedOp>,
    pass_open: bool,
}

impl HeadlessRecorder {
    /// The operations recorded since the last reset.
    #[must_use]
    pub fn ops(&self) -> &[RecordedOp] {
        &self.ops
    }
}

impl CommandRecorder for HeadlessRecorder {
    fn reset(&mut self) {
        self.ops.clear();
        self.pass_open = false;
    }

    fn begin_pass(&mut self, attachments: &PassAttachments) {
        debug_assert!(!self.pass_open, "begin_pass inside an open pass");
        self.pass_open = true;
        self.ops.push(RecordedOp::BeginPass {
            color: attachments.color.map(|a| a.resource),
            depth: attachments.depth.map(|a| a.resource),
            clear_color: attachments.clear_color,
            viewport: attachments.viewport,
        });
    }

    fn bind_pipeline(&mut self, pipeline: PipelineId) {
        self.ops.push(RecordedOp::BindPipeline(pipeline));
    }

    fn bind_descriptor_table(&mut self, table: &DescriptorTable) {
        self.ops.push(RecordedOp::BindTable {
            base_index: table.base_index,
            entries: table.entries.clone(),
        });
    }

    fn bind_mesh(&mut self, vertex_buffer: u64, index_buffer: u64) {
        self.ops.push(RecordedOp::BindMesh { vertex: vertex_buffer, index: index_buffer });
    }

    fn draw_indexed(&mut self, index_count: u32) {
        self.ops.push(RecordedOp::DrawIndexed { index_count });
    }

    fn end_pass(&mut self, transitions: &[ResourceTransition]) {
        debug_assert!(self.pass_open, "end_pass without an open pass");
        self.pass_open = false;
        self.ops.push(RecordedOp::EndPass {
            transitions: transitions.iter().map(|t| (t.resource, t.from, t.to)).collect(),
        });
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Condvar-backed frame ticket.
pub struct HeadlessFence {
    completed: Mutex<u64>,
    signalled: Condvar,
}

impl GpuFence for HeadlessFence {
    fn signal(&self, value: u64) {
        let mut completed = self.completed.lock().expect("fence poisoned");
        if value > *completed {
            *completed = value;
        }
        self.signalled.notify_all();
    }

    fn completed_value(&self) -> u64 {
        *self.completed.lock().expect("fence poisoned")
    }

    fn wait_until(&self, ticket: u64) {
        let mut completed = self.completed.lock().expect("fence poisoned");
        while *completed < ticket {
            completed = self.signalled.wait(completed).expect("fence poisoned");
        }
    }
}

/// Presentable surface with invented back buffers.
pub struct HeadlessSurface {
    extent: (u32, u32),
    scale_factor: f32,
    back_buffers: Vec<u64>,
    presented: u64,
}

impl HeadlessSurface {
    /// Number of frames presented so far.
    #[must_use]
    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl PresentSurface for HeadlessSurface {
    fn extent(&self) -> (u32, u32) {
        self.extent
    }

    fn scale_factor(&self) -> f32 {
        self.scale_factor
    }

    fn acquire(&mut self, frame_index: usize) -> u64 {
        self.back_buffers[frame_index % self.back_buffers.len()]
    }

    fn present(&mut self) -> GpuResult<()> {
        self.presented += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_addresses_do_not_overlap() {
        let device = HeadlessDevice::new();
        let a = device
            .create_descriptor_heap(DescriptorKind::ShaderResource, 16, false)
            .expect("heap a");
        let b = device
            .create_descriptor_heap(DescriptorKind::RenderTarget, 16, false)
            .expect("heap b");
        let a_end = a.cpu_base + 16 * u64::from(a.stride);
        assert!(b.cpu_base >= a_end);
    }

    #[test]
    fn test_shader_visible_heap_has_gpu_base() {
        let device = HeadlessDevice::new();
        let info = device
            .create_descriptor_heap(DescriptorKind::ShaderResource, 16, true)
            .expect("heap");
        assert_ne!(info.gpu_base, 0);
    }

    #[test]
    fn test_buffer_write_round_trips() {
        let device = HeadlessDevice::new();
        let buffer = device.create_buffer(16, BufferUsage::Constant).expect("buffer");
        buffer.write(4, &[1, 2, 3, 4]).expect("write");
        let headless = buffer.as_any().downcast_ref::<HeadlessBuffer>().expect("headless");
        assert_eq!(&headless.contents()[4..8], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_buffer_write_past_end_fails() {
        let device = HeadlessDevice::new();
        let buffer = device.create_buffer(8, BufferUsage::Constant).expect("buffer");
        assert!(matches!(
            buffer.write(6, &[0; 4]),
            Err(GpuError::WriteOutOfRange { .. })
        ));
    }

    #[test]
    fn test_empty_shader_source_fails_pipeline_creation() {
        let device = HeadlessDevice::new();
        let desc = PipelineDesc {
            blend: crate::gpu::BlendState::disabled(),
            depth: crate::gpu::DepthState {
                test: true,
                write: true,
                compare: crate::gpu::CompareOp::Less,
            },
            fill: crate::gpu::FillMode::Solid,
            topology: crate::gpu::PrimitiveTopology::TriangleList,
            vertex_layout: crate::gpu::VertexLayout::PositionNormalUv,
            color_format: Some(TextureFormat::Rgba8),
            depth_format: Some(TextureFormat::Depth32),
            table_layout: crate::gpu::TableLayout {
                constant_buffers: 1,
                light_slots: 0,
                shadow_slots: 0,
                texture_slots: 0,
            },
        };
        let source = ShaderSource { vertex: String::new(), fragment: "void main() {}".to_string() };
        assert!(device.create_pipeline(&desc, &source).is_err());
    }

    #[test]
    fn test_fence_wait_returns_after_signal() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence().expect("fence");
        fence.signal(3);
        fence.wait_until(2);
        assert_eq!(fence.completed_value(), 3);
    }

    #[test]
    fn test_fence_never_regresses() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence().expect("fence");
        fence.signal(5);
        fence.signal(2);
        assert_eq!(fence.completed_value(), 5);
    }
}
