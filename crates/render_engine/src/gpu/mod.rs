//! Backend abstraction for GPU device access
//!
//! The renderer core never talks to a graphics API directly. It talks to
//! an explicit device context ([`GpuDevice`]) constructed once at startup
//! and passed by reference to every component that needs it, plus a small
//! set of capability traits ([`GpuBuffer`], [`GpuTexture`],
//! [`CommandRecorder`], [`GpuFence`], [`PresentSurface`]) implemented once
//! per backend. Backends are selected by name through
//! [`registry::BackendRegistry`].
//!
//! Descriptors are modelled the way descriptor heaps actually work: a heap
//! is a contiguous block of fixed-stride slots, and a descriptor is an
//! address computed from the heap base. All pool arithmetic in
//! [`crate::render::descriptor`] is pure address math over the
//! [`DescriptorHeapInfo`] a backend returns.

pub mod headless;
pub mod registry;

use thiserror::Error;

/// Result type for device operations.
pub type GpuResult<T> = Result<T, GpuError>;

/// Device and driver level failures.
///
/// Everything in here is fatal to the renderer: resource creation happens
/// at startup or on explicit pass-set changes, and a failed creation means
/// the device cannot host the configured workload.
#[derive(Debug, Error)]
pub enum GpuError {
    /// Descriptor heap creation failed.
    #[error("descriptor heap creation failed: {0}")]
    HeapCreation(String),

    /// Buffer creation failed.
    #[error("buffer creation failed: {0}")]
    BufferCreation(String),

    /// Texture creation failed.
    #[error("texture creation failed: {0}")]
    TextureCreation(String),

    /// Pipeline state creation failed.
    #[error("pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Buffer write outside the resource's byte range.
    #[error("buffer write out of range: offset {offset} + len {len} > capacity {capacity}")]
    WriteOutOfRange {
        /// Write offset in bytes.
        offset: usize,
        /// Write length in bytes.
        len: usize,
        /// Buffer capacity in bytes.
        capacity: usize,
    },

    /// Command submission failed.
    #[error("command submission failed: {0}")]
    Submit(String),

    /// Surface presentation failed.
    #[error("present failed: {0}")]
    Present(String),

    /// No backend registered under the requested name.
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),
}

/// Semantic kind of a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Shader-resource and constant-buffer views.
    ShaderResource,
    /// Render-target views.
    RenderTarget,
    /// Depth-stencil views.
    DepthStencil,
    /// Sampler descriptors.
    Sampler,
}

/// Address arithmetic basis for a descriptor heap.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorHeapInfo {
    /// CPU-addressable base of slot 0.
    pub cpu_base: u64,
    /// GPU-addressable base of slot 0; zero when the heap is not shader
    /// visible.
    pub gpu_base: u64,
    /// Byte stride between adjacent slots.
    pub stride: u32,
}

/// Intended use of a buffer resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Small per-draw constant data, CPU written every frame.
    Constant,
    /// Vertex data, uploaded once.
    Vertex,
    /// Index data, uploaded once.
    Index,
}

/// Texture dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureDimension {
    /// Plain 2D texture.
    Tex2d,
    /// Six-faced cube map.
    Cube,
}

/// Pixel formats the core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    /// 8-bit RGBA, presentable.
    Rgba8,
    /// Half-float RGBA for HDR intermediate targets.
    Rgba16Float,
    /// 32-bit depth.
    Depth32,
}

/// Description of a texture resource.
#[derive(Debug, Clone)]
pub struct TextureDesc {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: TextureFormat,
    /// 2D or cube.
    pub dimension: TextureDimension,
    /// Mip chain length (>= 1).
    pub mip_levels: u32,
}

impl TextureDesc {
    /// Plain 2D RGBA texture with a single mip.
    #[must_use]
    pub const fn tex2d(width: u32, height: u32) -> Self {
        Self { width, height, format: TextureFormat::Rgba8, dimension: TextureDimension::Tex2d, mip_levels: 1 }
    }

    /// Cube map with a single mip per face.
    #[must_use]
    pub const fn cube(edge: u32) -> Self {
        Self { width: edge, height: edge, format: TextureFormat::Rgba8, dimension: TextureDimension::Cube, mip_levels: 1 }
    }
}

/// Compiled shader stage sources, as produced by a material graph.
#[derive(Debug, Clone)]
pub struct ShaderSource {
    /// Vertex stage source text.
    pub vertex: String,
    /// Fragment stage source text.
    pub fragment: String,
}

/// Opaque, backend-issued pipeline state identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(pub u64);

/// Blend factor for the fixed-function blend stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    /// Factor of 1.
    One,
    /// Factor of 0.
    Zero,
    /// Source alpha.
    SrcAlpha,
    /// One minus source alpha.
    InvSrcAlpha,
}

/// Blend stage configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendState {
    /// Whether blending is enabled at all.
    pub enabled: bool,
    /// Source factor.
    pub src: BlendFactor,
    /// Destination factor.
    pub dst: BlendFactor,
}

impl BlendState {
    /// Blending disabled; source overwrites destination.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { enabled: false, src: BlendFactor::One, dst: BlendFactor::Zero }
    }

    /// Classic transparency: src-alpha / inv-src-alpha.
    #[must_use]
    pub const fn alpha() -> Self {
        Self { enabled: true, src: BlendFactor::SrcAlpha, dst: BlendFactor::InvSrcAlpha }
    }

    /// Light accumulation: one / src-alpha.
    #[must_use]
    pub const fn additive() -> Self {
        Self { enabled: true, src: BlendFactor::One, dst: BlendFactor::SrcAlpha }
    }
}

/// Depth comparison function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// Pass when nearer.
    Less,
    /// Pass when nearer or equal (additive re-draws of the same geometry).
    LessEqual,
    /// Always pass.
    Always,
}

/// Depth stage configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthState {
    /// Whether the depth test runs.
    pub test: bool,
    /// Whether passing fragments write depth.
    pub write: bool,
    /// Comparison function.
    pub compare: CompareOp,
}

/// Rasterizer fill mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Filled triangles.
    Solid,
    /// Wireframe rendering.
    Wireframe,
}

/// Primitive assembly topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveTopology {
    /// Triangle list.
    TriangleList,
    /// Line list.
    LineList,
}

/// Vertex input layouts the engine's meshes use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexLayout {
    /// Position, normal, uv.
    PositionNormalUv,
    /// Position, normal, uv, bone indices/weights.
    PositionNormalUvSkinned,
}

/// Shape of the contiguous descriptor table a pipeline expects per draw.
///
/// Slot order is fixed engine-wide: constant buffers first, then light and
/// shadow resources, then the material's variable-length texture list.
/// The renderer validates every built table against the pipeline's layout
/// when recording a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    /// Leading constant-buffer view slots.
    pub constant_buffers: u32,
    /// Per-light constant slots (additive passes only).
    pub light_slots: u32,
    /// Shadow-map resource slots (additive passes only).
    pub shadow_slots: u32,
    /// Material texture slots.
    pub texture_slots: u32,
}

impl TableLayout {
    /// Total descriptor slots in the table.
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.constant_buffers + self.light_slots + self.shadow_slots + self.texture_slots
    }
}

/// Full fixed-function pipeline description handed to the backend.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    /// Blend stage.
    pub blend: BlendState,
    /// Depth stage.
    pub depth: DepthState,
    /// Rasterizer fill mode.
    pub fill: FillMode,
    /// Primitive topology.
    pub topology: PrimitiveTopology,
    /// Vertex input layout.
    pub vertex_layout: VertexLayout,
    /// Colour attachment format; `None` for depth-only (shadow) pipelines.
    pub color_format: Option<TextureFormat>,
    /// Depth attachment format.
    pub depth_format: Option<TextureFormat>,
    /// Descriptor table shape this pipeline reads.
    pub table_layout: TableLayout,
}

/// One entry of a built descriptor table, for validation and replay
/// inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableEntry {
    /// A constant-buffer view over the given resource.
    ConstantBuffer {
        /// Backing resource identity.
        resource: u64,
    },
    /// A shader-resource view over the given resource; zero means a null
    /// (fallback) binding.
    ShaderResource {
        /// Backing resource identity.
        resource: u64,
    },
}

/// A contiguous shader-visible descriptor table bound for one draw.
#[derive(Debug, Clone)]
pub struct DescriptorTable {
    /// GPU address of the first slot.
    pub gpu_base: u64,
    /// Ring index of the first slot.
    pub base_index: u32,
    /// Entries in slot order.
    pub entries: Vec<TableEntry>,
}

/// Attachment reference for pass begin.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentRef {
    /// CPU descriptor address of the view.
    pub cpu_descriptor: u64,
    /// Backing resource identity.
    pub resource: u64,
}

/// Everything a backend needs to open a render pass.
#[derive(Debug, Clone)]
pub struct PassAttachments {
    /// Colour attachment, absent for depth-only passes.
    pub color: Option<AttachmentRef>,
    /// Depth attachment.
    pub depth: Option<AttachmentRef>,
    /// Clear colour, when the pass clears.
    pub clear_color: Option<[f32; 4]>,
    /// Clear depth, when the pass clears.
    pub clear_depth: Option<f32>,
    /// Viewport extent in pixels.
    pub viewport: (u32, u32),
}

/// Resource state for barrier-style transitions at pass end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Writable colour target.
    RenderTarget,
    /// Readable in shaders.
    ShaderResource,
    /// Writable depth target.
    DepthWrite,
    /// Ready for presentation.
    Present,
}

/// A single resource state transition.
#[derive(Debug, Clone, Copy)]
pub struct ResourceTransition {
    /// Resource identity.
    pub resource: u64,
    /// State before.
    pub from: ResourceState,
    /// State after.
    pub to: ResourceState,
}

/// The explicit device context.
///
/// Constructed once at startup by a backend factory and shared by
/// reference; there is no global device singleton.
pub trait GpuDevice {
    /// Stable backend name, as registered.
    fn backend_name(&self) -> &'static str;

    /// Create a descriptor heap of `capacity` fixed-stride slots.
    ///
    /// # Errors
    /// Fails when the device cannot host a heap of the requested size.
    fn create_descriptor_heap(
        &self,
        kind: DescriptorKind,
        capacity: u32,
        shader_visible: bool,
    ) -> GpuResult<DescriptorHeapInfo>;

    /// Create a buffer resource.
    ///
    /// # Errors
    /// Fails on device-level allocation failure.
    fn create_buffer(&self, len: usize, usage: BufferUsage) -> GpuResult<Box<dyn GpuBuffer>>;

    /// Create a texture resource. Pixel data is uploaded separately via
    /// [`GpuTexture::upload`].
    ///
    /// # Errors
    /// Fails on device-level allocation failure.
    fn create_texture(&self, desc: &TextureDesc) -> GpuResult<Box<dyn GpuTexture>>;

    /// Compile a full pipeline state object from fixed-function state and
    /// shader source.
    ///
    /// # Errors
    /// Fails when the source does not compile or the state combination is
    /// unsupported.
    fn create_pipeline(&self, desc: &PipelineDesc, source: &ShaderSource) -> GpuResult<PipelineId>;

    /// Look up the descriptor-table layout a pipeline was created with.
    fn pipeline_table_layout(&self, pipeline: PipelineId) -> Option<TableLayout>;

    /// Create a command recorder.
    ///
    /// # Errors
    /// Fails on device-level allocation failure.
    fn create_recorder(&self) -> GpuResult<Box<dyn CommandRecorder>>;

    /// Create a CPU-GPU fence starting at completed value 0.
    ///
    /// # Errors
    /// Fails on device-level allocation failure.
    fn create_fence(&self) -> GpuResult<Box<dyn GpuFence>>;

    /// Write a resource view into a CPU-visible descriptor slot.
    fn create_view(&self, cpu_descriptor: u64, kind: DescriptorKind, resource: u64);

    /// Stage `count` CPU-visible descriptors into shader-visible slots
    /// starting at `dst_cpu`.
    fn copy_descriptors(&self, dst_cpu: u64, src_cpu: u64, count: u32, kind: DescriptorKind);

    /// Submit a finished recorder and signal `fence` with `ticket` once
    /// the GPU completes the work.
    ///
    /// # Errors
    /// Fails when the queue rejects the submission.
    fn submit(
        &self,
        recorder: &mut dyn CommandRecorder,
        fence: &dyn GpuFence,
        ticket: u64,
    ) -> GpuResult<()>;
}

/// A buffer capability: raw byte writes plus resource identity.
pub trait GpuBuffer {
    /// Byte capacity.
    fn len(&self) -> usize;

    /// Whether the buffer has zero capacity.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` into the buffer at `offset`.
    ///
    /// # Errors
    /// Fails with [`GpuError::WriteOutOfRange`] past the end of the
    /// buffer.
    fn write(&self, offset: usize, data: &[u8]) -> GpuResult<()>;

    /// Stable resource identity for views and tables.
    fn resource_id(&self) -> u64;

    /// Downcast support for backend-specific inspection.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// A texture capability.
pub trait GpuTexture {
    /// The creation description.
    fn desc(&self) -> &TextureDesc;

    /// Upload pixel data for the whole resource.
    ///
    /// # Errors
    /// Fails when the data length does not match the description.
    fn upload(&self, data: &[u8]) -> GpuResult<()>;

    /// Stable resource identity for views and tables.
    fn resource_id(&self) -> u64;
}

/// Records one frame's command stream.
pub trait CommandRecorder {
    /// Discard recorded commands and start over. Only safe after the
    /// fence for the recorder's previous submission has been observed.
    fn reset(&mut self);

    /// Open a render pass: bind targets, clear, set viewport.
    fn begin_pass(&mut self, attachments: &PassAttachments);

    /// Bind a pipeline state object.
    fn bind_pipeline(&mut self, pipeline: PipelineId);

    /// Bind one contiguous descriptor table for the next draw.
    fn bind_descriptor_table(&mut self, table: &DescriptorTable);

    /// Bind vertex and index buffers by resource identity.
    fn bind_mesh(&mut self, vertex_buffer: u64, index_buffer: u64);

    /// Record an indexed draw.
    fn draw_indexed(&mut self, index_count: u32);

    /// Close the current pass, applying resource transitions.
    fn end_pass(&mut self, transitions: &[ResourceTransition]);

    /// Downcast support for backend-specific inspection.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// The frame ticket: a monotonically increasing completion counter.
///
/// Once [`GpuFence::completed_value`] is observed at or above a frame's
/// submitted ticket, every resource that frame touched is safe to reuse.
pub trait GpuFence {
    /// Queue-side signal, invoked by [`GpuDevice::submit`].
    fn signal(&self, value: u64);

    /// Latest value the GPU has signalled.
    fn completed_value(&self) -> u64;

    /// Block the calling thread until `completed_value() >= ticket`,
    /// using a native wait primitive rather than spinning.
    fn wait_until(&self, ticket: u64);
}

/// The window/swapchain collaborator.
pub trait PresentSurface {
    /// Current surface extent in pixels.
    fn extent(&self) -> (u32, u32);

    /// Screen scale factor.
    fn scale_factor(&self) -> f32;

    /// Acquire the back buffer for a frame slot, returning its resource
    /// identity.
    fn acquire(&mut self, frame_index: usize) -> u64;

    /// Hand the most recently submitted frame to the presentation engine.
    ///
    /// # Errors
    /// Fails when the surface was lost.
    fn present(&mut self) -> GpuResult<()>;
}
