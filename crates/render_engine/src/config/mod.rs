//! Configuration system
//!
//! Pool and pipeline sizing is a build-time decision: every allocator in
//! the renderer is fixed-capacity, and exhausting one at runtime is a
//! configuration defect, not a recoverable state. This module holds the
//! sizing knobs and the file plumbing to load them.

pub use serde::{Deserialize, Serialize};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

        // Try different formats
        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A sizing value that would make an allocator unusable
    #[error("Invalid renderer configuration: {0}")]
    Invalid(String),
}

/// Capacity split for one CPU-visible descriptor pool.
///
/// The static region holds engine-lifetime views (render targets,
/// textures); the dynamic region is carved into one sub-region per
/// frame-in-flight and reclaimed wholesale every frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolSize {
    /// Slots reserved for explicitly released, long-lived descriptors.
    pub static_capacity: u32,
    /// Slots available to each frame-in-flight for ephemeral views.
    pub dynamic_per_frame: u32,
}

/// Per-kind descriptor pool sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DescriptorPoolConfig {
    /// Shader-resource views and per-draw constant-buffer views.
    pub shader_resource: PoolSize,
    /// Render-target views.
    pub render_target: PoolSize,
    /// Depth-stencil views.
    pub depth_stencil: PoolSize,
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        Self {
            shader_resource: PoolSize { static_capacity: 1024, dynamic_per_frame: 512 },
            render_target: PoolSize { static_capacity: 64, dynamic_per_frame: 0 },
            depth_stencil: PoolSize { static_capacity: 32, dynamic_per_frame: 0 },
        }
    }
}

/// Sizing for the per-frame constant-data rings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConstantPoolConfig {
    /// Lower bound on buffers per frame, regardless of draw count.
    pub min_buffers: u32,
    /// Byte capacity of each buffer in the ring.
    pub buffer_len: u32,
}

impl Default for ConstantPoolConfig {
    fn default() -> Self {
        Self { min_buffers: 256, buffer_len: 4096 }
    }
}

/// Presentable surface dimensions for backends without a native window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SurfaceConfig {
    /// Surface width in pixels.
    pub width: u32,
    /// Surface height in pixels.
    pub height: u32,
    /// Screen scale factor (HiDPI).
    pub scale_factor: f32,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self { width: 1280, height: 720, scale_factor: 1.0 }
    }
}

/// Top-level renderer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Number of frames the CPU may record ahead of the GPU (typically 2-3).
    pub frames_in_flight: usize,
    /// CPU-visible descriptor pool sizing, per descriptor kind.
    pub descriptors: DescriptorPoolConfig,
    /// Capacity of each frame's shader-visible descriptor ring. Must cover
    /// the worst-case draw count times per-draw descriptor width.
    pub shader_visible_capacity: u32,
    /// Constant-data ring sizing.
    pub constant_pool: ConstantPoolConfig,
    /// Surface dimensions used by headless backends.
    pub surface: SurfaceConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            descriptors: DescriptorPoolConfig::default(),
            shader_visible_capacity: 4096,
            constant_pool: ConstantPoolConfig::default(),
            surface: SurfaceConfig::default(),
        }
    }
}

impl Config for RendererConfig {}

impl RendererConfig {
    /// Check the sizing values for internal consistency.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] when a value would make an
    /// allocator unusable at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames_in_flight == 0 || self.frames_in_flight > 4 {
            return Err(ConfigError::Invalid(format!(
                "frames_in_flight must be in 1..=4, got {}",
                self.frames_in_flight
            )));
        }
        if self.shader_visible_capacity == 0 {
            return Err(ConfigError::Invalid(
                "shader_visible_capacity must be non-zero".to_string(),
            ));
        }
        if self.constant_pool.min_buffers == 0 || self.constant_pool.buffer_len == 0 {
            return Err(ConfigError::Invalid(
                "constant pool sizing must be non-zero".to_string(),
            ));
        }
        if self.descriptors.shader_resource.dynamic_per_frame == 0 {
            return Err(ConfigError::Invalid(
                "shader_resource.dynamic_per_frame must be non-zero (per-draw constant views)"
                    .to_string(),
            ));
        }
        if self.surface.width == 0 || self.surface.height == 0 {
            return Err(ConfigError::Invalid("surface extent must be non-zero".to_string()));
        }
        Ok(())
    }
}
