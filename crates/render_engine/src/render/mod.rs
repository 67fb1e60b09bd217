//! The rendering core
//!
//! Dependency order, leaves first: [`descriptor`] (fixed-capacity
//! descriptor pools), [`constants`] (per-frame constant-data rings),
//! [`graph`] (collaborator interfaces), [`material`] (pipeline cache),
//! [`queue`] (render command compilation), [`frame`] + [`renderer`]
//! (the frame pipeline itself).

pub mod constants;
pub mod descriptor;
pub mod frame;
pub mod graph;
pub mod material;
pub mod queue;
pub mod renderer;

use thiserror::Error;

use crate::gpu::GpuError;

/// Failures surfaced by the rendering core.
///
/// These are all fatal to startup or to a pass-set change; nothing in the
/// per-frame path returns an error. Capacity and contract violations
/// panic instead (see the crate-level error taxonomy).
#[derive(Debug, Error)]
pub enum RenderError {
    /// Device or driver failure underneath.
    #[error("gpu error: {0}")]
    Gpu(#[from] GpuError),

    /// A material graph failed to produce shader source.
    #[error("shader generation failed: {0}")]
    ShaderGeneration(String),

    /// Renderer configuration rejected at startup.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}
