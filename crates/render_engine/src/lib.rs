//! # Render Engine
//!
//! A frame-pipelined rendering core: fixed-capacity GPU descriptor pools,
//! per-frame constant-data rings, a lazily populated material pipeline
//! cache, and a render-queue compiler that turns declarative render passes
//! into a linear, replayable command stream.
//!
//! The crate deliberately does not own a scene graph, a shading language,
//! or a windowing layer. Those are consumed through narrow interfaces
//! (see [`render::graph`]): a material graph that resolves to shader
//! source plus an ordered resource list, a texture provider keyed by
//! logical handle, and a presentable-surface abstraction.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use render_engine::prelude::*;
//!
//! # struct MyPostGraph;
//! # impl MaterialGraph for MyPostGraph {
//! #     fn shader_source(&self, _: LightType, _: TargetFormatFlags)
//! #         -> Result<ShaderSource, RenderError> { unimplemented!() }
//! #     fn texture_bindings(&self) -> Vec<TextureBinding> { Vec::new() }
//! # }
//! fn main() -> Result<(), RenderError> {
//!     let config = RendererConfig::default();
//!     let post: Arc<dyn MaterialGraph> = Arc::new(MyPostGraph);
//!     let mut renderer = Renderer::new("headless", config, post)?;
//!     // renderer.set_render_passes(...);
//!     // loop { renderer.render()?; }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod foundation;
pub mod gpu;
pub mod render;

/// Commonly used types, re-exported for application code.
pub mod prelude {
    pub use crate::config::{Config, RendererConfig};
    pub use crate::foundation::math::{Mat4, Vec2, Vec3, Vec4};
    pub use crate::gpu::{
        DescriptorKind, GpuDevice, GpuError, PipelineId, ShaderSource, TextureDesc,
    };
    pub use crate::render::graph::{
        Camera, LightType, MaterialGraph, PassTarget, RenderEntity, RenderPass, SceneLight,
        SceneView, TargetFormatFlags, TextureBinding, Vertex,
    };
    pub use crate::render::renderer::Renderer;
    pub use crate::render::RenderError;
}
