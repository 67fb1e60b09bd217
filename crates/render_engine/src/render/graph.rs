//! Collaborator interfaces
//!
//! The renderer consumes the rest of the engine through narrow seams
//! defined here: a material graph that resolves to shader source plus an
//! ordered resource list, scene views of enumerable entities and lights,
//! cameras, and render pass descriptions. Nothing in this module talks to
//! the device.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use bitflags::bitflags;
use slotmap::new_key_type;

use crate::foundation::math::{Mat4, Point3, Vec3};
use crate::gpu::{PrimitiveTopology, ShaderSource, VertexLayout};
use crate::render::descriptor::DescriptorHandle;
use crate::render::RenderError;

new_key_type! {
    /// Logical handle to a registered mesh.
    pub struct MeshKey;

    /// Logical handle to a registered texture or cube map.
    pub struct TextureKey;
}

/// Interleaved vertex as meshes supply it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    /// Object-space position.
    pub position: [f32; 3],
    /// Object-space normal.
    pub normal: [f32; 3],
    /// Texture coordinates.
    pub uv: [f32; 2],
}

/// Sampler configurations the engine exposes; bound as static samplers so
/// draws carry no sampler descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    /// Bilinear filtering, clamped addressing.
    LinearClamp,
    /// Bilinear filtering, wrapped addressing.
    LinearWrap,
    /// Nearest filtering, clamped addressing.
    PointClamp,
}

/// One texture slot a material graph wants bound, in table order.
#[derive(Clone)]
pub enum TextureBinding {
    /// A texture from the logical-handle registry.
    Key {
        /// Registered texture.
        texture: TextureKey,
        /// Sampler to pair with it.
        sampler: SamplerKind,
    },
    /// A render target sampled as a texture (post-processing input).
    Target(Arc<RenderTarget>),
}

bitflags! {
    /// Target-format hints handed to shader generation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TargetFormatFlags: u32 {
        /// Half-float HDR colour target.
        const HDR = 1 << 0;
        /// sRGB swapchain target.
        const SRGB = 1 << 1;
        /// Depth-only target (shadow rendering).
        const DEPTH_ONLY = 1 << 2;
    }
}

/// The render-graph collaborator: a declarative description of how a
/// material's outputs are computed, able to compile itself to shader
/// source for a given light type and target format.
///
/// Identity matters: the pipeline cache is keyed by the `Arc` pointer of
/// the graph, not its content. Two identical-looking graphs compile
/// separate pipelines.
pub trait MaterialGraph {
    /// Compiled vertex/fragment source for this graph under `light` and
    /// `target`.
    ///
    /// # Errors
    /// [`RenderError::ShaderGeneration`] when the graph cannot express
    /// the requested combination.
    fn shader_source(
        &self,
        light: LightType,
        target: TargetFormatFlags,
    ) -> Result<ShaderSource, RenderError>;

    /// Ordered list of texture bindings to attach per draw.
    fn texture_bindings(&self) -> Vec<TextureBinding>;

    /// Whether ambient draws of this material blend as transparent.
    fn transparent(&self) -> bool {
        false
    }
}

/// Light taxonomy. `Ambient` is the base pass every entity gets; the
/// other types accumulate additively on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightType {
    /// Untinted base lighting.
    Ambient,
    /// Infinitely distant light with a direction.
    Directional,
    /// Omnidirectional light with a position and range.
    Point,
    /// Cone light with position and direction.
    Spot,
}

/// Shadow projection riding along with a shadow-casting light.
#[derive(Debug, Clone)]
pub struct ShadowCamera {
    /// View/projection from the light's point of view.
    pub camera: Camera,
    /// Shadow map edge length in texels.
    pub resolution: u32,
}

/// One light in a scene's lighting rig.
#[derive(Clone)]
pub struct SceneLight {
    /// Light type; `Ambient` entries are ignored (the base pass covers
    /// ambient).
    pub kind: LightType,
    /// Linear RGB colour.
    pub color: Vec3,
    /// World-space position (point/spot).
    pub position: Vec3,
    /// World-space direction (directional/spot).
    pub direction: Vec3,
    /// Scalar intensity.
    pub intensity: f32,
    /// Present when the light casts shadows.
    pub shadow: Option<ShadowCamera>,
}

impl SceneLight {
    /// A directional light without shadows.
    #[must_use]
    pub fn directional(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            kind: LightType::Directional,
            color,
            position: Vec3::zeros(),
            direction: direction.normalize(),
            intensity,
            shadow: None,
        }
    }

    /// A point light without shadows.
    #[must_use]
    pub fn point(position: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            kind: LightType::Point,
            color,
            position,
            direction: -Vec3::y(),
            intensity,
            shadow: None,
        }
    }

    /// Attach a shadow camera to this light.
    #[must_use]
    pub fn with_shadow(mut self, camera: Camera, resolution: u32) -> Self {
        self.shadow = Some(ShadowCamera { camera, resolution });
        self
    }
}

/// View and projection for one pass.
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    /// World-to-view transform.
    pub view: Mat4,
    /// View-to-clip transform.
    pub projection: Mat4,
}

impl Camera {
    /// Identity camera (full-screen passes).
    #[must_use]
    pub fn identity() -> Self {
        Self { view: Mat4::identity(), projection: Mat4::identity() }
    }

    /// Right-handed look-at camera with a perspective projection.
    #[must_use]
    pub fn look_at(eye: Point3, target: Point3, up: Vec3, aspect: f32, fovy: f32) -> Self {
        Self {
            view: Mat4::look_at_rh(&eye, &target, &up),
            projection: nalgebra::Perspective3::new(aspect, fovy, 0.1, 1000.0).to_homogeneous(),
        }
    }

    /// Combined view-projection matrix.
    #[must_use]
    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }
}

/// Bone palette for skinned entities.
#[derive(Debug, Clone)]
pub struct BonePalette {
    /// One matrix per bone, palette order.
    pub matrices: Vec<Mat4>,
}

/// An enumerable entity as the scene collaborator exposes it.
///
/// Transform and bones are interior-mutable so the engine can animate
/// them between frames while the compiled command stream keeps stable
/// references; the stream itself is never rebuilt for animation.
pub struct RenderEntity {
    /// Mesh to draw.
    pub mesh: MeshKey,
    /// Material graph driving shading.
    pub graph: Arc<dyn MaterialGraph>,
    /// Object-to-world transform.
    pub transform: Cell<Mat4>,
    /// Bone palette for skinned meshes.
    pub bones: RefCell<Option<BonePalette>>,
    /// Primitive topology.
    pub topology: PrimitiveTopology,
    /// Wireframe rasterization flag.
    pub wireframe: bool,
    /// Vertex input layout of the mesh.
    pub layout: VertexLayout,
}

impl RenderEntity {
    /// Solid triangle-list entity with an identity transform.
    #[must_use]
    pub fn new(mesh: MeshKey, graph: Arc<dyn MaterialGraph>) -> Self {
        Self {
            mesh,
            graph,
            transform: Cell::new(Mat4::identity()),
            bones: RefCell::new(None),
            topology: PrimitiveTopology::TriangleList,
            wireframe: false,
            layout: VertexLayout::PositionNormalUv,
        }
    }

    /// Switch to wireframe rasterization.
    #[must_use]
    pub const fn with_wireframe(mut self) -> Self {
        self.wireframe = true;
        self
    }

    /// Switch to line-list topology.
    #[must_use]
    pub const fn with_lines(mut self) -> Self {
        self.topology = PrimitiveTopology::LineList;
        self
    }
}

/// The scene collaborator: enumerable entities plus a lighting rig.
pub struct SceneView {
    /// Entities to draw, in declaration order.
    pub entities: Vec<Arc<RenderEntity>>,
    /// Lights, in declaration order (ordering decides additive
    /// accumulation order).
    pub lights: Vec<SceneLight>,
}

/// A colour or depth target owned by the renderer.
///
/// Descriptors come from the static regions of the renderer's pools and
/// are released explicitly via [`crate::render::renderer::Renderer`];
/// the target itself never frees them.
pub struct RenderTarget {
    pub(crate) texture: Box<dyn crate::gpu::GpuTexture>,
    pub(crate) rtv: DescriptorHandle,
    pub(crate) dsv: DescriptorHandle,
    pub(crate) srv: DescriptorHandle,
    pub(crate) width: u32,
    pub(crate) height: u32,
}

impl RenderTarget {
    /// Target extent in pixels.
    #[must_use]
    pub const fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Whether this is a depth-only target.
    #[must_use]
    pub const fn is_depth(&self) -> bool {
        !self.dsv.is_null() && self.rtv.is_null()
    }

    /// Backing resource identity.
    #[must_use]
    pub fn resource_id(&self) -> u64 {
        self.texture.resource_id()
    }

    /// Shader-resource view for sampling this target.
    #[must_use]
    pub const fn srv(&self) -> DescriptorHandle {
        self.srv
    }
}

/// Where a pass renders.
#[derive(Clone)]
pub enum PassTarget {
    /// An offscreen render target.
    Offscreen(Arc<RenderTarget>),
    /// The presentable back buffer.
    Screen,
}

/// One bound-target + scene + camera combination to rasterize.
pub struct RenderPass {
    /// Diagnostic name.
    pub name: String,
    /// Output target.
    pub target: PassTarget,
    /// Scene to draw.
    pub scene: Arc<SceneView>,
    /// Camera for the pass.
    pub camera: Camera,
    /// Clear colour applied at pass start.
    pub clear_color: [f32; 4],
}

/// A rendered shadow map attached to draws of the light that cast it.
pub struct ShadowMap {
    /// Depth target holding the shadow map.
    pub depth: Arc<RenderTarget>,
    /// The light-space camera it was rendered with.
    pub camera: Camera,
}
