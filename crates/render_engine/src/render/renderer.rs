//! The frame-pipelined renderer
//!
//! [`Renderer`] owns the device context, the descriptor pools, one
//! [`FrameContext`] per frame-in-flight, and the compiled command stream.
//! `set_render_passes` is the expensive edge (shadow targets, pipeline
//! compilation, constant-ring sizing); `render` replays the stream,
//! writing per-draw constants and staging descriptor tables into the
//! current frame's rings.
//!
//! The per-frame path never allocates device resources and never returns
//! an error: everything that can fail there is a capacity or contract
//! violation and panics with a diagnostic instead.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;

use slotmap::SlotMap;

use crate::config::RendererConfig;
use crate::foundation::math::{to_columns, Mat4};
use crate::gpu::registry::BackendRegistry;
use crate::gpu::{
    AttachmentRef, BufferUsage, DescriptorKind, GpuBuffer, GpuDevice, GpuFence, GpuTexture,
    PassAttachments, PresentSurface, ResourceState, ResourceTransition, ShaderSource, TableEntry,
    TextureDesc, TextureFormat, VertexLayout,
};
use crate::render::constants::ConstantDataPool;
use crate::render::descriptor::{DescriptorHandle, DescriptorPool};
use crate::render::frame::{CachedConstant, FrameContext};
use crate::render::graph::{
    LightType, MaterialGraph, MeshKey, PassTarget, RenderEntity, RenderPass, RenderTarget,
    SceneLight, ShadowMap, TargetFormatFlags, TextureBinding, TextureKey, Vertex,
};
use crate::render::material::MaterialPipelineCache;
use crate::render::queue::{LightBinding, RenderCommand, RenderQueueBuilder};
use crate::render::RenderError;

/// Upper bound on bone matrices written per skinned draw. The shader
/// declares a fixed-size palette, so the constant-buffer region is always
/// padded out to this count.
pub const MAX_BONES: usize = 60;

/// Byte stride of one bone matrix in the constant buffer.
const BONE_STRIDE: usize = mem::size_of::<[[f32; 4]; 4]>();

/// Per-draw transform constants, written at the head of every entity's
/// constant buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct DrawConstants {
    mvp: [[f32; 4]; 4],
    model: [[f32; 4]; 4],
}

/// Per-light constants for additive draws.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct LightConstants {
    color: [f32; 4],
    position: [f32; 4],
    direction: [f32; 4],
    /// x: intensity, y: light type tag, z: shadow flag, w: unused.
    params: [f32; 4],
    view_proj: [[f32; 4]; 4],
}

struct MeshRecord {
    vertex: Box<dyn GpuBuffer>,
    index: Box<dyn GpuBuffer>,
    index_count: u32,
}

struct TextureRecord {
    texture: Box<dyn GpuTexture>,
    srv: DescriptorHandle,
    /// Pixel data held until the first pass that samples the texture.
    pixels: Vec<u8>,
}

const DEPTH_ONLY_VS: &str = "layout(location = 0) in vec3 position;\n\
                             layout(binding = 0) uniform Draw { mat4 mvp; mat4 model; };\n\
                             void main() { gl_Position = mvp * vec4(position, 1.0); }\n";
const DEPTH_ONLY_FS: &str = "void main() {}\n";

/// Position-only graph used for shadow map rendering.
struct DepthOnlyGraph;

impl MaterialGraph for DepthOnlyGraph {
    fn shader_source(
        &self,
        _light: LightType,
        _target: TargetFormatFlags,
    ) -> Result<ShaderSource, RenderError> {
        Ok(ShaderSource {
            vertex: DEPTH_ONLY_VS.to_string(),
            fragment: DEPTH_ONLY_FS.to_string(),
        })
    }

    fn texture_bindings(&self) -> Vec<TextureBinding> {
        Vec::new()
    }
}

const QUAD_VERTICES: [Vertex; 4] = [
    Vertex { position: [-1.0, -1.0, 0.0], normal: [0.0, 0.0, 1.0], uv: [0.0, 1.0] },
    Vertex { position: [1.0, -1.0, 0.0], normal: [0.0, 0.0, 1.0], uv: [1.0, 1.0] },
    Vertex { position: [1.0, 1.0, 0.0], normal: [0.0, 0.0, 1.0], uv: [1.0, 0.0] },
    Vertex { position: [-1.0, 1.0, 0.0], normal: [0.0, 0.0, 1.0], uv: [0.0, 0.0] },
];
const QUAD_INDICES: [u32; 6] = [0, 1, 2, 0, 2, 3];

/// The renderer: device context, resource registries, frame pipeline.
pub struct Renderer {
    device: Arc<dyn GpuDevice>,
    surface: Box<dyn PresentSurface>,
    config: RendererConfig,
    fence: Box<dyn GpuFence>,
    frames: Vec<FrameContext>,
    frame_index: usize,
    frame_number: u64,
    srv_pool: DescriptorPool,
    rtv_pool: DescriptorPool,
    dsv_pool: DescriptorPool,
    meshes: SlotMap<MeshKey, MeshRecord>,
    textures: SlotMap<TextureKey, TextureRecord>,
    uploaded: HashSet<TextureKey>,
    cache: MaterialPipelineCache,
    shadow_graph: Arc<dyn MaterialGraph>,
    post_graph: Arc<dyn MaterialGraph>,
    quad_mesh: MeshKey,
    depth_target: Arc<RenderTarget>,
    commands: Vec<RenderCommand>,
    shadow_maps: HashMap<(usize, usize), Arc<ShadowMap>>,
}

impl Renderer {
    /// Create a renderer on the backend registered under `backend`.
    ///
    /// `post_graph` is the material graph of the implicit full-screen
    /// post-processing stage; its first texture slot receives the final
    /// offscreen colour target.
    ///
    /// # Errors
    /// Configuration validation failure, unknown backend name, or device
    /// resource creation failure.
    pub fn new(
        backend: &str,
        config: RendererConfig,
        post_graph: Arc<dyn MaterialGraph>,
    ) -> Result<Self, RenderError> {
        config.validate()?;
        let registry = BackendRegistry::with_builtin();
        let (device, surface) = registry.create(backend, &config)?;
        log::info!(
            "Renderer starting on '{}', {} frames in flight",
            device.backend_name(),
            config.frames_in_flight,
        );

        let fence = device.create_fence()?;
        let srv_pool = DescriptorPool::new(
            device.as_ref(),
            DescriptorKind::ShaderResource,
            config.descriptors.shader_resource.static_capacity,
            config.descriptors.shader_resource.dynamic_per_frame,
            config.frames_in_flight,
            false,
        )?;
        let mut rtv_pool = DescriptorPool::new(
            device.as_ref(),
            DescriptorKind::RenderTarget,
            config.descriptors.render_target.static_capacity,
            config.descriptors.render_target.dynamic_per_frame,
            config.frames_in_flight,
            false,
        )?;
        let dsv_pool = DescriptorPool::new(
            device.as_ref(),
            DescriptorKind::DepthStencil,
            config.descriptors.depth_stencil.static_capacity,
            config.descriptors.depth_stencil.dynamic_per_frame,
            config.frames_in_flight,
            false,
        )?;

        let mut frames = Vec::with_capacity(config.frames_in_flight);
        for _ in 0..config.frames_in_flight {
            let rtv = rtv_pool.allocate_static();
            frames.push(FrameContext::new(device.as_ref(), &config, rtv)?);
        }

        let mut renderer = Self {
            device,
            surface,
            config,
            fence,
            frames,
            frame_index: 0,
            frame_number: 0,
            srv_pool,
            rtv_pool,
            dsv_pool,
            meshes: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            uploaded: HashSet::new(),
            cache: MaterialPipelineCache::new(),
            shadow_graph: Arc::new(DepthOnlyGraph),
            post_graph,
            quad_mesh: MeshKey::default(),
            // Placeholder until the real depth target exists below.
            depth_target: Arc::new(RenderTarget {
                texture: Box::new(NullTexture),
                rtv: DescriptorHandle::default(),
                dsv: DescriptorHandle::default(),
                srv: DescriptorHandle::default(),
                width: 0,
                height: 0,
            }),
            commands: Vec::new(),
            shadow_maps: HashMap::new(),
        };

        let (width, height) = renderer.surface.extent();
        renderer.depth_target = renderer.create_depth_target(width, height)?;
        renderer.quad_mesh = renderer.create_mesh(&QUAD_VERTICES, &QUAD_INDICES)?;
        Ok(renderer)
    }

    /// The backend this renderer runs on.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.device.backend_name()
    }

    /// Number of pipelines compiled so far.
    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.cache.len()
    }

    /// Upload vertex and index data, returning a logical mesh handle.
    ///
    /// # Errors
    /// Device buffer creation or upload failure (zero-length meshes are
    /// rejected by the device).
    pub fn create_mesh(
        &mut self,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> Result<MeshKey, RenderError> {
        let vertex = self
            .device
            .create_buffer(mem::size_of_val(vertices), BufferUsage::Vertex)?;
        vertex.write(0, bytemuck::cast_slice(vertices))?;
        let index = self
            .device
            .create_buffer(mem::size_of_val(indices), BufferUsage::Index)?;
        index.write(0, bytemuck::cast_slice(indices))?;
        let index_count =
            u32::try_from(indices.len()).map_err(|_| {
                crate::gpu::GpuError::BufferCreation("index count exceeds u32".to_string())
            })?;
        log::debug!("Created mesh: {} vertices, {index_count} indices", vertices.len());
        Ok(self.meshes.insert(MeshRecord { vertex, index, index_count }))
    }

    /// Register a texture. The pixel data is uploaded lazily, once, at
    /// the start of the first pass that samples it.
    ///
    /// # Errors
    /// Device texture creation failure.
    pub fn register_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: Vec<u8>,
    ) -> Result<TextureKey, RenderError> {
        let texture = self.device.create_texture(desc)?;
        let srv = self.srv_pool.allocate_static();
        self.device
            .create_view(srv.cpu, DescriptorKind::ShaderResource, texture.resource_id());
        Ok(self.textures.insert(TextureRecord { texture, srv, pixels }))
    }

    /// Drop a texture and return its descriptor to the static free list.
    pub fn release_texture(&mut self, key: TextureKey) {
        if let Some(record) = self.textures.remove(key) {
            self.srv_pool.release_static(record.srv);
            self.uploaded.remove(&key);
        }
    }

    /// Create an offscreen HDR colour target with render-target and
    /// shader-resource views from the static descriptor regions.
    ///
    /// # Errors
    /// Device texture creation failure.
    pub fn create_render_target(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<Arc<RenderTarget>, RenderError> {
        let texture = self.device.create_texture(&TextureDesc {
            width,
            height,
            format: TextureFormat::Rgba16Float,
            dimension: crate::gpu::TextureDimension::Tex2d,
            mip_levels: 1,
        })?;
        let rtv = self.rtv_pool.allocate_static();
        self.device
            .create_view(rtv.cpu, DescriptorKind::RenderTarget, texture.resource_id());
        let srv = self.srv_pool.allocate_static();
        self.device
            .create_view(srv.cpu, DescriptorKind::ShaderResource, texture.resource_id());
        Ok(Arc::new(RenderTarget {
            texture,
            rtv,
            dsv: DescriptorHandle::default(),
            srv,
            width,
            height,
        }))
    }

    /// Create a depth target (shadow maps, the shared scene depth
    /// buffer), sampleable through its shader-resource view.
    ///
    /// # Errors
    /// Device texture creation failure.
    pub fn create_depth_target(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<Arc<RenderTarget>, RenderError> {
        let texture = self.device.create_texture(&TextureDesc {
            width,
            height,
            format: TextureFormat::Depth32,
            dimension: crate::gpu::TextureDimension::Tex2d,
            mip_levels: 1,
        })?;
        let dsv = self.dsv_pool.allocate_static();
        self.device
            .create_view(dsv.cpu, DescriptorKind::DepthStencil, texture.resource_id());
        let srv = self.srv_pool.allocate_static();
        self.device
            .create_view(srv.cpu, DescriptorKind::ShaderResource, texture.resource_id());
        Ok(Arc::new(RenderTarget {
            texture,
            rtv: DescriptorHandle::default(),
            dsv,
            srv,
            width,
            height,
        }))
    }

    /// Return a target's static descriptors to their pools' free lists.
    ///
    /// The caller must not record draws referencing the target afterward;
    /// released slots are reused by the next static allocation.
    pub fn release_target(&mut self, target: &RenderTarget) {
        if !target.rtv.is_null() {
            self.rtv_pool.release_static(target.rtv);
        }
        if !target.dsv.is_null() {
            self.dsv_pool.release_static(target.dsv);
        }
        if !target.srv.is_null() {
            self.srv_pool.release_static(target.srv);
        }
    }

    /// Recompile the command stream for a new pass set.
    ///
    /// Waits for all in-flight frames, creates shadow depth targets for
    /// shadow-casting lights, compiles any missing pipelines, and resizes
    /// each frame's constant ring to the stream's draw budget.
    ///
    /// # Errors
    /// Shader generation, pipeline creation, or resource creation
    /// failure.
    ///
    /// # Panics
    /// When the final pass does not target the screen.
    pub fn set_render_passes(&mut self, passes: &[Arc<RenderPass>]) -> Result<(), RenderError> {
        self.wait_idle();
        self.commands.clear();

        let stale: Vec<Arc<ShadowMap>> = self.shadow_maps.drain().map(|(_, m)| m).collect();
        for map in stale {
            self.release_target(&map.depth);
        }

        let scene_pass_count = passes.len().saturating_sub(1);
        for (pass_index, pass) in passes.iter().take(scene_pass_count).enumerate() {
            for (light_index, light) in pass.scene.lights.iter().enumerate() {
                if let Some(shadow) = &light.shadow {
                    let depth = self.create_depth_target(shadow.resolution, shadow.resolution)?;
                    self.shadow_maps.insert(
                        (pass_index, light_index),
                        Arc::new(ShadowMap { depth, camera: shadow.camera }),
                    );
                }
            }
        }

        let build = RenderQueueBuilder::new(
            self.device.as_ref(),
            &mut self.cache,
            Arc::clone(&self.shadow_graph),
            Arc::clone(&self.post_graph),
            self.quad_mesh,
        )
        .build(passes, &self.shadow_maps)?;

        // Worst case two constant buffers per draw: entity plus light.
        let draw_budget = u32::try_from(build.draw_count.saturating_mul(2))
            .unwrap_or(u32::MAX)
            .max(self.config.constant_pool.min_buffers);
        for frame in &mut self.frames {
            frame.rebuild_constants(
                self.device.as_ref(),
                draw_budget,
                self.config.constant_pool.buffer_len as usize,
            )?;
        }

        self.commands = build.commands;
        log::info!(
            "Pass set installed: {} commands, {} pipelines cached, {draw_budget} constant buffers per frame",
            self.commands.len(),
            self.cache.len(),
        );
        Ok(())
    }

    /// Record, submit, and present one frame by replaying the compiled
    /// command stream into the current frame context.
    ///
    /// # Errors
    /// Submission or presentation failure.
    ///
    /// # Panics
    /// On capacity exhaustion in any per-frame ring, or when a draw
    /// references an unregistered mesh or texture.
    pub fn render(&mut self) -> Result<(), RenderError> {
        self.frame_number += 1;
        let frame_index = self.frame_index;
        self.frames[frame_index].begin(self.fence.as_ref());
        self.srv_pool.reset_dynamic(frame_index);

        let backbuffer = self.surface.acquire(frame_index);
        let frame = &mut self.frames[frame_index];
        frame.backbuffer_resource = backbuffer;
        self.device
            .create_view(frame.backbuffer_rtv.cpu, DescriptorKind::RenderTarget, backbuffer);

        let commands = mem::take(&mut self.commands);
        let result = self.execute(&commands);
        self.commands = commands;
        result?;

        self.frame_index = (self.frame_index + 1) % self.frames.len();
        Ok(())
    }

    /// Block until every in-flight frame's GPU work has completed.
    pub fn wait_idle(&self) {
        for frame in &self.frames {
            self.fence.wait_until(frame.fence_value);
        }
    }

    fn execute(&mut self, commands: &[RenderCommand]) -> Result<(), RenderError> {
        let Self {
            device,
            surface,
            fence,
            frames,
            frame_index,
            frame_number,
            srv_pool,
            meshes,
            textures,
            uploaded,
            depth_target,
            ..
        } = self;
        let device: &dyn GpuDevice = device.as_ref();
        let FrameContext {
            recorder,
            fence_value,
            shader_visible,
            constants,
            backbuffer_rtv,
            backbuffer_resource,
            entity_constants,
            light_constants,
        } = &mut frames[*frame_index];

        for command in commands {
            match command {
                RenderCommand::PassStart { pass } => {
                    upload_pass_textures(pass, textures, uploaded)?;
                    let attachments = pass_attachments(
                        pass,
                        *backbuffer_rtv,
                        *backbuffer_resource,
                        depth_target,
                        surface.extent(),
                    );
                    recorder.begin_pass(&attachments);
                }
                RenderCommand::Draw { pass, entity, light, pipeline, shadow } => {
                    recorder.bind_pipeline(*pipeline);

                    let layout = device.pipeline_table_layout(*pipeline).unwrap_or_else(|| {
                        panic!("pipeline {pipeline:?} is not known to the backend")
                    });
                    let slice = shader_visible.allocate(layout.total());
                    let mut entries = Vec::with_capacity(layout.total() as usize);
                    let mut slot = 0u32;

                    let (view, resource) = entity_constant(
                        device,
                        constants,
                        entity_constants,
                        srv_pool,
                        *frame_index,
                        *frame_number,
                        pass,
                        entity,
                    );
                    device.copy_descriptors(
                        slice.slot(slot).cpu,
                        view.cpu,
                        1,
                        DescriptorKind::ShaderResource,
                    );
                    entries.push(TableEntry::ConstantBuffer { resource });
                    slot += 1;

                    if layout.light_slots > 0 {
                        let LightBinding::Scene { index, .. } = *light else {
                            panic!(
                                "additive pipeline {pipeline:?} drawn with an ambient light binding"
                            );
                        };
                        let (view, resource) = light_constant(
                            device,
                            constants,
                            light_constants,
                            srv_pool,
                            *frame_index,
                            *frame_number,
                            pass,
                            index,
                            &pass.scene.lights[index],
                            shadow.as_deref(),
                        );
                        device.copy_descriptors(
                            slice.slot(slot).cpu,
                            view.cpu,
                            1,
                            DescriptorKind::ShaderResource,
                        );
                        entries.push(TableEntry::ConstantBuffer { resource });
                        slot += 1;
                    }

                    if layout.shadow_slots > 0 {
                        // Shadowless lights still occupy the slot, with a
                        // null binding, so the table shape matches the
                        // pipeline layout.
                        match shadow {
                            Some(map) => {
                                device.copy_descriptors(
                                    slice.slot(slot).cpu,
                                    map.depth.srv().cpu,
                                    1,
                                    DescriptorKind::ShaderResource,
                                );
                                entries.push(TableEntry::ShaderResource {
                                    resource: map.depth.resource_id(),
                                });
                            }
                            None => entries.push(TableEntry::ShaderResource { resource: 0 }),
                        }
                        slot += 1;
                    }

                    if layout.texture_slots > 0 {
                        for binding in entity.graph.texture_bindings() {
                            let (src_cpu, resource) = match binding {
                                TextureBinding::Key { texture, .. } => {
                                    let record = textures.get(texture).unwrap_or_else(|| {
                                        panic!("draw references an unregistered texture")
                                    });
                                    (record.srv.cpu, record.texture.resource_id())
                                }
                                TextureBinding::Target(target) => {
                                    (target.srv().cpu, target.resource_id())
                                }
                            };
                            device.copy_descriptors(
                                slice.slot(slot).cpu,
                                src_cpu,
                                1,
                                DescriptorKind::ShaderResource,
                            );
                            entries.push(TableEntry::ShaderResource { resource });
                            slot += 1;
                        }
                    }

                    assert_eq!(
                        entries.len(),
                        layout.total() as usize,
                        "descriptor table built for pipeline {pipeline:?} does not match its declared layout",
                    );
                    recorder.bind_descriptor_table(&crate::gpu::DescriptorTable {
                        gpu_base: slice.base.gpu,
                        base_index: slice.base_index,
                        entries,
                    });

                    let mesh = meshes.get(entity.mesh).unwrap_or_else(|| {
                        panic!("draw references an unregistered mesh")
                    });
                    recorder.bind_mesh(mesh.vertex.resource_id(), mesh.index.resource_id());
                    recorder.draw_indexed(mesh.index_count);
                }
                RenderCommand::PassEnd { pass } => {
                    let transitions = pass_transitions(pass, *backbuffer_resource);
                    recorder.end_pass(&transitions);
                }
                RenderCommand::Present => {
                    device.submit(recorder.as_mut(), fence.as_ref(), *frame_number)?;
                    *fence_value = *frame_number;
                    surface.present()?;
                    log::trace!("Frame {frame_number} submitted and presented");
                }
            }
        }
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // Teardown must not race in-flight GPU reads of pool memory.
        self.wait_idle();
        log::debug!("Renderer shut down after {} frames", self.frame_number);
    }
}

/// Stand-in texture for the depth target slot during construction.
struct NullTexture;

impl GpuTexture for NullTexture {
    fn desc(&self) -> &TextureDesc {
        const DESC: TextureDesc = TextureDesc::tex2d(0, 0);
        &DESC
    }

    fn upload(&self, _data: &[u8]) -> crate::gpu::GpuResult<()> {
        Ok(())
    }

    fn resource_id(&self) -> u64 {
        0
    }
}

fn upload_pass_textures(
    pass: &RenderPass,
    textures: &SlotMap<TextureKey, TextureRecord>,
    uploaded: &mut HashSet<TextureKey>,
) -> Result<(), RenderError> {
    for entity in &pass.scene.entities {
        for binding in entity.graph.texture_bindings() {
            let TextureBinding::Key { texture, .. } = binding else {
                continue;
            };
            if uploaded.contains(&texture) {
                continue;
            }
            let record = textures
                .get(texture)
                .unwrap_or_else(|| panic!("pass '{}' samples an unregistered texture", pass.name));
            record.texture.upload(&record.pixels)?;
            uploaded.insert(texture);
            log::debug!("Uploaded texture for pass '{}'", pass.name);
        }
    }
    Ok(())
}

fn pass_attachments(
    pass: &RenderPass,
    backbuffer_rtv: DescriptorHandle,
    backbuffer_resource: u64,
    depth_target: &RenderTarget,
    surface_extent: (u32, u32),
) -> PassAttachments {
    match &pass.target {
        PassTarget::Offscreen(target) if target.is_depth() => PassAttachments {
            color: None,
            depth: Some(AttachmentRef {
                cpu_descriptor: target.dsv.cpu,
                resource: target.resource_id(),
            }),
            clear_color: None,
            clear_depth: Some(1.0),
            viewport: target.extent(),
        },
        PassTarget::Offscreen(target) => PassAttachments {
            color: Some(AttachmentRef {
                cpu_descriptor: target.rtv.cpu,
                resource: target.resource_id(),
            }),
            depth: Some(AttachmentRef {
                cpu_descriptor: depth_target.dsv.cpu,
                resource: depth_target.resource_id(),
            }),
            clear_color: Some(pass.clear_color),
            clear_depth: Some(1.0),
            viewport: target.extent(),
        },
        PassTarget::Screen => PassAttachments {
            color: Some(AttachmentRef {
                cpu_descriptor: backbuffer_rtv.cpu,
                resource: backbuffer_resource,
            }),
            depth: Some(AttachmentRef {
                cpu_descriptor: depth_target.dsv.cpu,
                resource: depth_target.resource_id(),
            }),
            clear_color: Some(pass.clear_color),
            clear_depth: Some(1.0),
            viewport: surface_extent,
        },
    }
}

fn pass_transitions(pass: &RenderPass, backbuffer_resource: u64) -> Vec<ResourceTransition> {
    match &pass.target {
        PassTarget::Offscreen(target) if target.is_depth() => vec![ResourceTransition {
            resource: target.resource_id(),
            from: ResourceState::DepthWrite,
            to: ResourceState::ShaderResource,
        }],
        PassTarget::Offscreen(target) => vec![ResourceTransition {
            resource: target.resource_id(),
            from: ResourceState::RenderTarget,
            to: ResourceState::ShaderResource,
        }],
        PassTarget::Screen => vec![ResourceTransition {
            resource: backbuffer_resource,
            from: ResourceState::RenderTarget,
            to: ResourceState::Present,
        }],
    }
}

#[allow(clippy::too_many_arguments)]
fn entity_constant(
    device: &dyn GpuDevice,
    constants: &mut ConstantDataPool,
    cache: &mut HashMap<(usize, usize), CachedConstant>,
    srv_pool: &mut DescriptorPool,
    frame_index: usize,
    frame_number: u64,
    pass: &Arc<RenderPass>,
    entity: &Arc<RenderEntity>,
) -> (DescriptorHandle, u64) {
    let key = (Arc::as_ptr(pass) as usize, Arc::as_ptr(entity) as usize);
    if let Some(cached) = cache.get(&key) {
        if cached.stamp == frame_number {
            return (cached.view, cached.resource);
        }
    }

    let handle = constants.next();
    let model = entity.transform.get();
    let mvp: Mat4 = pass.camera.view_projection() * model;
    let mut writer = constants.writer(handle);
    writer.write(&DrawConstants { mvp: to_columns(&mvp), model: to_columns(&model) });

    if matches!(entity.layout, VertexLayout::PositionNormalUvSkinned) {
        let bones = entity.bones.borrow();
        let palette_len = bones.as_ref().map_or(0, |p| p.matrices.len());
        assert!(
            palette_len <= MAX_BONES,
            "bone palette of {palette_len} matrices exceeds the {MAX_BONES}-bone limit",
        );
        if let Some(palette) = bones.as_ref() {
            for matrix in &palette.matrices {
                writer.write(&to_columns(matrix));
            }
        }
        // Pad out to the fixed palette stride the shader declares.
        writer.advance((MAX_BONES - palette_len) * BONE_STRIDE);
    }

    let resource = constants.buffer(handle).resource_id();
    let view = srv_pool.allocate_dynamic(frame_index);
    device.create_view(view.cpu, DescriptorKind::ShaderResource, resource);
    cache.insert(key, CachedConstant { view, resource, stamp: frame_number });
    (view, resource)
}

#[allow(clippy::too_many_arguments)]
fn light_constant(
    device: &dyn GpuDevice,
    constants: &mut ConstantDataPool,
    cache: &mut HashMap<(usize, usize), CachedConstant>,
    srv_pool: &mut DescriptorPool,
    frame_index: usize,
    frame_number: u64,
    pass: &Arc<RenderPass>,
    light_index: usize,
    light: &SceneLight,
    shadow: Option<&ShadowMap>,
) -> (DescriptorHandle, u64) {
    let key = (Arc::as_ptr(pass) as usize, light_index);
    if let Some(cached) = cache.get(&key) {
        if cached.stamp == frame_number {
            return (cached.view, cached.resource);
        }
    }

    let kind_tag = match light.kind {
        LightType::Ambient => 0.0,
        LightType::Directional => 1.0,
        LightType::Point => 2.0,
        LightType::Spot => 3.0,
    };
    let view_proj = shadow.map_or_else(Mat4::identity, |m| m.camera.view_projection());
    let handle = constants.next();
    let mut writer = constants.writer(handle);
    writer.write(&LightConstants {
        color: [light.color.x, light.color.y, light.color.z, 1.0],
        position: [light.position.x, light.position.y, light.position.z, 1.0],
        direction: [light.direction.x, light.direction.y, light.direction.z, 0.0],
        params: [light.intensity, kind_tag, if shadow.is_some() { 1.0 } else { 0.0 }, 0.0],
        view_proj: to_columns(&view_proj),
    });

    let resource = constants.buffer(handle).resource_id();
    let view = srv_pool.allocate_dynamic(frame_index);
    device.create_view(view.cpu, DescriptorKind::ShaderResource, resource);
    cache.insert(key, CachedConstant { view, resource, stamp: frame_number });
    (view, resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use crate::gpu::headless::{HeadlessRecorder, RecordedOp};
    use crate::render::graph::{BonePalette, Camera, SceneView};

    struct FlatGraph {
        textures: Vec<TextureBinding>,
    }

    impl MaterialGraph for FlatGraph {
        fn shader_source(
            &self,
            _light: LightType,
            _target: TargetFormatFlags,
        ) -> Result<ShaderSource, RenderError> {
            Ok(ShaderSource {
                vertex: "void vs_main() {}".to_string(),
                fragment: "void fs_main() {}".to_string(),
            })
        }

        fn texture_bindings(&self) -> Vec<TextureBinding> {
            self.textures.clone()
        }
    }

    fn flat_graph() -> Arc<dyn MaterialGraph> {
        Arc::new(FlatGraph { textures: Vec::new() })
    }

    fn renderer(config: RendererConfig) -> Renderer {
        Renderer::new("headless", config, flat_graph()).expect("renderer")
    }

    fn triangle(renderer: &mut Renderer) -> MeshKey {
        let vertices = [
            Vertex { position: [0.0, 0.0, 0.0], normal: [0.0, 0.0, 1.0], uv: [0.0, 0.0] },
            Vertex { position: [1.0, 0.0, 0.0], normal: [0.0, 0.0, 1.0], uv: [1.0, 0.0] },
            Vertex { position: [0.0, 1.0, 0.0], normal: [0.0, 0.0, 1.0], uv: [0.0, 1.0] },
        ];
        renderer.create_mesh(&vertices, &[0, 1, 2]).expect("mesh")
    }

    fn lit_passes(
        renderer: &mut Renderer,
        graph: &Arc<dyn MaterialGraph>,
        lights: Vec<SceneLight>,
    ) -> Vec<Arc<RenderPass>> {
        let mesh = triangle(renderer);
        let target = renderer.create_render_target(128, 128).expect("target");
        let entity = Arc::new(RenderEntity::new(mesh, Arc::clone(graph)));
        let scene = Arc::new(SceneView { entities: vec![entity], lights });
        vec![
            Arc::new(RenderPass {
                name: "scene".to_string(),
                target: PassTarget::Offscreen(target),
                scene: Arc::clone(&scene),
                camera: Camera::identity(),
                clear_color: [0.1, 0.1, 0.1, 1.0],
            }),
            Arc::new(RenderPass {
                name: "screen".to_string(),
                target: PassTarget::Screen,
                scene: Arc::new(SceneView { entities: Vec::new(), lights: Vec::new() }),
                camera: Camera::identity(),
                clear_color: [0.0, 0.0, 0.0, 1.0],
            }),
        ]
    }

    fn frame_ops(renderer: &Renderer, frame: usize) -> Vec<RecordedOp> {
        renderer.frames[frame]
            .recorder
            .as_any()
            .downcast_ref::<HeadlessRecorder>()
            .expect("headless recorder")
            .ops()
            .to_vec()
    }

    #[test]
    fn test_render_records_pass_and_draw_sequence() {
        let mut r = renderer(RendererConfig::default());
        let graph = flat_graph();
        let light = SceneLight::directional(-Vec3::y(), Vec3::new(1.0, 1.0, 1.0), 1.0);
        let passes = lit_passes(&mut r, &graph, vec![light]);
        r.set_render_passes(&passes).expect("passes");
        r.render().expect("frame");

        let ops = frame_ops(&r, 0);
        // Scene pass: begin, ambient draw (pipeline/table/mesh/draw), light
        // draw, end. Post pass: begin, one draw, end.
        let begins = ops.iter().filter(|o| matches!(o, RecordedOp::BeginPass { .. })).count();
        let draws = ops.iter().filter(|o| matches!(o, RecordedOp::DrawIndexed { .. })).count();
        let ends = ops.iter().filter(|o| matches!(o, RecordedOp::EndPass { .. })).count();
        assert_eq!(begins, 2);
        assert_eq!(draws, 3);
        assert_eq!(ends, 2);
        assert!(matches!(ops[0], RecordedOp::BeginPass { color: Some(_), depth: Some(_), .. }));

        // Offscreen colour goes readable at scene pass end; the back
        // buffer goes to present at the final pass end.
        let end_transitions: Vec<_> = ops
            .iter()
            .filter_map(|o| match o {
                RecordedOp::EndPass { transitions } => Some(transitions.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            end_transitions[0][0].1,
            ResourceState::RenderTarget,
        );
        assert_eq!(end_transitions[0][0].2, ResourceState::ShaderResource);
        assert_eq!(end_transitions[1][0].2, ResourceState::Present);
    }

    #[test]
    fn test_additive_draw_binds_light_table() {
        let mut r = renderer(RendererConfig::default());
        let graph = flat_graph();
        let light = SceneLight::point(Vec3::new(0.0, 2.0, 0.0), Vec3::new(1.0, 0.0, 0.0), 3.0);
        let passes = lit_passes(&mut r, &graph, vec![light]);
        r.set_render_passes(&passes).expect("passes");
        r.render().expect("frame");

        let ops = frame_ops(&r, 0);
        let tables: Vec<_> = ops
            .iter()
            .filter_map(|o| match o {
                RecordedOp::BindTable { entries, .. } => Some(entries.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(tables.len(), 3);
        // Ambient table: entity constants only.
        assert_eq!(tables[0].len(), 1);
        assert!(matches!(tables[0][0], TableEntry::ConstantBuffer { .. }));
        // Additive table: entity constants, light constants, null shadow.
        assert_eq!(tables[1].len(), 3);
        assert!(matches!(tables[1][1], TableEntry::ConstantBuffer { .. }));
        assert!(matches!(tables[1][2], TableEntry::ShaderResource { resource: 0 }));
        // Post table: entity constants plus the sampled scene target.
        assert_eq!(tables[2].len(), 2);
        assert!(matches!(tables[2][1], TableEntry::ShaderResource { resource } if resource != 0));
    }

    #[test]
    fn test_replay_is_deterministic_across_frames() {
        let mut r = renderer(RendererConfig::default());
        let graph = flat_graph();
        let light = SceneLight::directional(-Vec3::y(), Vec3::new(1.0, 1.0, 1.0), 1.0);
        let passes = lit_passes(&mut r, &graph, vec![light]);
        r.set_render_passes(&passes).expect("passes");

        r.render().expect("frame 1");
        let first = frame_ops(&r, 0);
        r.render().expect("frame 2");
        r.render().expect("frame 3");
        // Frame 3 reused frame context 0; identical inputs must produce an
        // identical recording, descriptor indices and resources included.
        let third = frame_ops(&r, 0);
        assert_eq!(first, third);
    }

    #[test]
    fn test_textures_upload_exactly_once() {
        let mut r = renderer(RendererConfig::default());
        let key = r
            .register_texture(&TextureDesc::tex2d(2, 2), vec![0u8; 16])
            .expect("texture");
        let graph: Arc<dyn MaterialGraph> = Arc::new(FlatGraph {
            textures: vec![TextureBinding::Key {
                texture: key,
                sampler: crate::render::graph::SamplerKind::LinearWrap,
            }],
        });
        let passes = lit_passes(&mut r, &graph, Vec::new());
        r.set_render_passes(&passes).expect("passes");

        r.render().expect("frame 1");
        r.render().expect("frame 2");
        assert_eq!(r.uploaded.len(), 1);
        assert!(r.uploaded.contains(&key));
    }

    #[test]
    fn test_fence_tracks_submitted_frames() {
        let mut r = renderer(RendererConfig::default());
        let graph = flat_graph();
        let passes = lit_passes(&mut r, &graph, Vec::new());
        r.set_render_passes(&passes).expect("passes");

        r.render().expect("frame 1");
        r.render().expect("frame 2");
        assert_eq!(r.fence.completed_value(), 2);
        r.wait_idle();
    }

    #[test]
    fn test_constant_pool_sized_to_draw_budget() {
        let mut config = RendererConfig::default();
        config.constant_pool.min_buffers = 4;
        let mut r = renderer(config);
        let graph = flat_graph();
        let light = SceneLight::directional(-Vec3::y(), Vec3::new(1.0, 1.0, 1.0), 1.0);
        let passes = lit_passes(&mut r, &graph, vec![light]);
        r.set_render_passes(&passes).expect("passes");

        // Three draws (ambient, light, post quad) times two buffers each.
        for frame in &r.frames {
            assert_eq!(frame.constants.capacity(), 6);
        }
    }

    #[test]
    fn test_shadow_light_gets_depth_pass_and_bound_map() {
        let mut r = renderer(RendererConfig::default());
        let graph = flat_graph();
        let light = SceneLight::directional(-Vec3::y(), Vec3::new(1.0, 1.0, 1.0), 1.0)
            .with_shadow(Camera::identity(), 256);
        let passes = lit_passes(&mut r, &graph, vec![light]);
        r.set_render_passes(&passes).expect("passes");
        assert_eq!(r.shadow_maps.len(), 1);
        r.render().expect("frame");

        let ops = frame_ops(&r, 0);
        // First pass is the injected shadow pass: depth-only attachment.
        assert!(matches!(ops[0], RecordedOp::BeginPass { color: None, depth: Some(_), .. }));
        // The additive draw's table carries the shadow map, not a null.
        let shadow_resource = r.shadow_maps[&(0, 0)].depth.resource_id();
        let bound = ops.iter().any(|o| match o {
            RecordedOp::BindTable { entries, .. } => entries
                .iter()
                .any(|e| matches!(e, TableEntry::ShaderResource { resource } if *resource == shadow_resource)),
            _ => false,
        });
        assert!(bound);
    }

    fn skinned_passes(
        r: &mut Renderer,
        graph: &Arc<dyn MaterialGraph>,
        palette_len: usize,
    ) -> Vec<Arc<RenderPass>> {
        let mesh = triangle(r);
        let target = r.create_render_target(64, 64).expect("target");
        let mut entity = RenderEntity::new(mesh, Arc::clone(graph));
        entity.layout = VertexLayout::PositionNormalUvSkinned;
        *entity.bones.borrow_mut() =
            Some(BonePalette { matrices: vec![Mat4::identity(); palette_len] });
        let scene = Arc::new(SceneView { entities: vec![Arc::new(entity)], lights: Vec::new() });
        vec![
            Arc::new(RenderPass {
                name: "scene".to_string(),
                target: PassTarget::Offscreen(target),
                scene,
                camera: Camera::identity(),
                clear_color: [0.0, 0.0, 0.0, 1.0],
            }),
            Arc::new(RenderPass {
                name: "screen".to_string(),
                target: PassTarget::Screen,
                scene: Arc::new(SceneView { entities: Vec::new(), lights: Vec::new() }),
                camera: Camera::identity(),
                clear_color: [0.0, 0.0, 0.0, 1.0],
            }),
        ]
    }

    #[test]
    fn test_skinned_draw_with_full_palette_renders() {
        let mut r = renderer(RendererConfig::default());
        let graph = flat_graph();
        let passes = skinned_passes(&mut r, &graph, MAX_BONES);
        r.set_render_passes(&passes).expect("passes");
        r.render().expect("frame");

        // Skinned ambient draw plus the post quad.
        let ops = frame_ops(&r, 0);
        let draws = ops.iter().filter(|o| matches!(o, RecordedOp::DrawIndexed { .. })).count();
        assert_eq!(draws, 2);
    }

    #[test]
    #[should_panic(expected = "exceeds the 60-bone limit")]
    fn test_oversized_bone_palette_is_fatal() {
        let mut r = renderer(RendererConfig::default());
        let graph = flat_graph();
        let passes = skinned_passes(&mut r, &graph, MAX_BONES + 1);
        r.set_render_passes(&passes).expect("passes");
        let _ = r.render();
    }

    #[test]
    fn test_release_texture_returns_static_slot() {
        let mut r = renderer(RendererConfig::default());
        let before = r.srv_pool.static_in_use();
        let key = r
            .register_texture(&TextureDesc::tex2d(2, 2), vec![0u8; 16])
            .expect("texture");
        assert_eq!(r.srv_pool.static_in_use(), before + 1);
        r.release_texture(key);
        assert_eq!(r.srv_pool.static_in_use(), before);
    }

    #[test]
    fn test_unknown_backend_fails_construction() {
        let result = Renderer::new("vulkan", RendererConfig::default(), flat_graph());
        assert!(result.is_err());
    }
}
