//! Material pipeline cache
//!
//! Maps (render-graph identity, light type) to a compiled pipeline state
//! object. Compilation is idempotent and triggered on first miss: the
//! graph is asked for shader source, fixed-function state is derived from
//! the light type and entity flags, and the backend compiles the bundle.
//!
//! Entries are keyed by graph *identity* (the `Arc` pointer), not
//! content. Two identical-looking graph instances compile separate
//! pipelines; content hashing is a deliberate non-goal.

use std::collections::HashMap;
use std::sync::Arc;

use crate::gpu::{
    BlendState, CompareOp, DepthState, FillMode, GpuDevice, PipelineDesc, PipelineId, TableLayout,
    TextureFormat,
};
use crate::render::graph::{LightType, MaterialGraph, RenderEntity, TargetFormatFlags};
use crate::render::RenderError;

/// Cache key: graph pointer identity plus light type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialCacheKey {
    graph: *const (),
    light: LightType,
}

impl MaterialCacheKey {
    fn new(graph: &Arc<dyn MaterialGraph>, light: LightType) -> Self {
        Self { graph: Arc::as_ptr(graph).cast::<()>(), light }
    }
}

/// Lazily populated pipeline state cache.
#[derive(Default)]
pub struct MaterialPipelineCache {
    pipelines: HashMap<MaterialCacheKey, PipelineId>,
}

impl MaterialPipelineCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the pipeline for `(graph, light)`, compiling it on first
    /// miss.
    ///
    /// The entity supplies the vertex layout, topology, and wireframe
    /// flag threaded into the pipeline descriptor; `target` carries the
    /// output-format hints. Note that `graph` may differ from
    /// `entity.graph` (shadow passes draw entities through the depth-only
    /// graph).
    ///
    /// # Errors
    /// Shader generation or device pipeline-creation failure. Both are
    /// fatal at startup / pass-set change time; the per-frame path never
    /// compiles.
    pub fn get_or_create(
        &mut self,
        device: &dyn GpuDevice,
        graph: &Arc<dyn MaterialGraph>,
        light: LightType,
        entity: &RenderEntity,
        target: TargetFormatFlags,
    ) -> Result<PipelineId, RenderError> {
        let key = MaterialCacheKey::new(graph, light);
        if let Some(&pipeline) = self.pipelines.get(&key) {
            return Ok(pipeline);
        }

        let source = graph.shader_source(light, target)?;
        let desc = Self::pipeline_desc(graph, light, entity, target);
        let pipeline = device.create_pipeline(&desc, &source)?;
        log::debug!(
            "Compiled pipeline {pipeline:?} for graph {:p}, light {light:?}, target {target:?}",
            Arc::as_ptr(graph),
        );
        self.pipelines.insert(key, pipeline);
        Ok(pipeline)
    }

    /// Number of compiled pipelines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Fixed pipeline-state rules.
    ///
    /// Ambient passes write depth; additive light passes re-test at
    /// `LessEqual` without writing, so multiple lights accumulate over
    /// the ambient base without re-fighting the depth buffer. Ambient
    /// blending is enabled only for graphs marked transparent; additive
    /// passes always blend one / src-alpha.
    fn pipeline_desc(
        graph: &Arc<dyn MaterialGraph>,
        light: LightType,
        entity: &RenderEntity,
        target: TargetFormatFlags,
    ) -> PipelineDesc {
        let depth_only = target.contains(TargetFormatFlags::DEPTH_ONLY);

        let blend = if depth_only {
            BlendState::disabled()
        } else {
            match light {
                LightType::Ambient => {
                    if graph.transparent() {
                        BlendState::alpha()
                    } else {
                        BlendState::disabled()
                    }
                }
                _ => BlendState::additive(),
            }
        };

        let depth = match light {
            LightType::Ambient => DepthState { test: true, write: true, compare: CompareOp::Less },
            _ => DepthState { test: true, write: false, compare: CompareOp::LessEqual },
        };

        let color_format = if depth_only {
            None
        } else if target.contains(TargetFormatFlags::HDR) {
            Some(TextureFormat::Rgba16Float)
        } else {
            Some(TextureFormat::Rgba8)
        };

        let table_layout = Self::table_layout(graph, light, depth_only);

        PipelineDesc {
            blend,
            depth,
            fill: if entity.wireframe { FillMode::Wireframe } else { FillMode::Solid },
            topology: entity.topology,
            vertex_layout: entity.layout,
            color_format,
            depth_format: Some(TextureFormat::Depth32),
            table_layout,
        }
    }

    /// The descriptor-table shape declared at pipeline creation and
    /// validated against at draw-record time.
    ///
    /// Slot order engine-wide: one per-draw constant buffer, then (for
    /// additive passes) one light constant buffer and one shadow-map
    /// slot, then the graph's ordered texture list. Additive pipelines
    /// always reserve the shadow slot; shadowless lights bind a null
    /// entry so the table shape stays a pure function of the key.
    fn table_layout(graph: &Arc<dyn MaterialGraph>, light: LightType, depth_only: bool) -> TableLayout {
        let additive = !matches!(light, LightType::Ambient);
        let texture_slots = if depth_only {
            0
        } else {
            u32::try_from(graph.texture_bindings().len()).expect("texture count fits in u32")
        };
        TableLayout {
            constant_buffers: 1,
            light_slots: u32::from(additive),
            shadow_slots: u32::from(additive),
            texture_slots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;
    use crate::gpu::{BlendFactor, ShaderSource};
    use crate::render::graph::{MeshKey, TextureBinding};

    struct TestGraph {
        transparent: bool,
    }

    impl MaterialGraph for TestGraph {
        fn shader_source(
            &self,
            light: LightType,
            _target: TargetFormatFlags,
        ) -> Result<ShaderSource, RenderError> {
            Ok(ShaderSource {
                vertex: "void vs_main() {}".to_string(),
                fragment: format!("// {light:?}\nvoid fs_main() {{}}"),
            })
        }

        fn texture_bindings(&self) -> Vec<TextureBinding> {
            Vec::new()
        }

        fn transparent(&self) -> bool {
            self.transparent
        }
    }

    fn graph(transparent: bool) -> Arc<dyn MaterialGraph> {
        Arc::new(TestGraph { transparent })
    }

    fn entity(graph: &Arc<dyn MaterialGraph>) -> RenderEntity {
        RenderEntity::new(MeshKey::default(), Arc::clone(graph))
    }

    #[test]
    fn test_same_key_returns_identical_pipeline() {
        let device = HeadlessDevice::new();
        let mut cache = MaterialPipelineCache::new();
        let g = graph(false);
        let e = entity(&g);
        let a = cache
            .get_or_create(&device, &g, LightType::Ambient, &e, TargetFormatFlags::HDR)
            .expect("pipeline");
        let b = cache
            .get_or_create(&device, &g, LightType::Ambient, &e, TargetFormatFlags::HDR)
            .expect("pipeline");
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_different_light_type_compiles_distinct_pipeline() {
        let device = HeadlessDevice::new();
        let mut cache = MaterialPipelineCache::new();
        let g = graph(false);
        let e = entity(&g);
        let ambient = cache
            .get_or_create(&device, &g, LightType::Ambient, &e, TargetFormatFlags::HDR)
            .expect("pipeline");
        let directional = cache
            .get_or_create(&device, &g, LightType::Directional, &e, TargetFormatFlags::HDR)
            .expect("pipeline");
        assert_ne!(ambient, directional);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_distinct_graph_instances_do_not_share() {
        let device = HeadlessDevice::new();
        let mut cache = MaterialPipelineCache::new();
        let g1 = graph(false);
        let g2 = graph(false);
        let e = entity(&g1);
        let a = cache
            .get_or_create(&device, &g1, LightType::Ambient, &e, TargetFormatFlags::HDR)
            .expect("pipeline");
        let b = cache
            .get_or_create(&device, &g2, LightType::Ambient, &e, TargetFormatFlags::HDR)
            .expect("pipeline");
        assert_ne!(a, b);
    }

    #[test]
    fn test_ambient_opaque_writes_depth_without_blending() {
        let device = HeadlessDevice::new();
        let mut cache = MaterialPipelineCache::new();
        let g = graph(false);
        let e = entity(&g);
        let id = cache
            .get_or_create(&device, &g, LightType::Ambient, &e, TargetFormatFlags::HDR)
            .expect("pipeline");
        let desc = device.pipeline_desc(id).expect("desc");
        assert!(desc.depth.write);
        assert_eq!(desc.depth.compare, CompareOp::Less);
        assert!(!desc.blend.enabled);
    }

    #[test]
    fn test_ambient_transparent_blends_alpha() {
        let device = HeadlessDevice::new();
        let mut cache = MaterialPipelineCache::new();
        let g = graph(true);
        let e = entity(&g);
        let id = cache
            .get_or_create(&device, &g, LightType::Ambient, &e, TargetFormatFlags::HDR)
            .expect("pipeline");
        let desc = device.pipeline_desc(id).expect("desc");
        assert!(desc.blend.enabled);
        assert_eq!(desc.blend.src, BlendFactor::SrcAlpha);
        assert_eq!(desc.blend.dst, BlendFactor::InvSrcAlpha);
    }

    #[test]
    fn test_additive_light_pass_does_not_write_depth() {
        let device = HeadlessDevice::new();
        let mut cache = MaterialPipelineCache::new();
        let g = graph(false);
        let e = entity(&g);
        let id = cache
            .get_or_create(&device, &g, LightType::Point, &e, TargetFormatFlags::HDR)
            .expect("pipeline");
        let desc = device.pipeline_desc(id).expect("desc");
        assert!(!desc.depth.write);
        assert_eq!(desc.depth.compare, CompareOp::LessEqual);
        assert!(desc.blend.enabled);
        assert_eq!(desc.blend.src, BlendFactor::One);
        assert_eq!(desc.blend.dst, BlendFactor::SrcAlpha);
        // Additive pipelines reserve light + shadow slots.
        assert_eq!(desc.table_layout.light_slots, 1);
        assert_eq!(desc.table_layout.shadow_slots, 1);
    }

    #[test]
    fn test_wireframe_flag_threads_through() {
        let device = HeadlessDevice::new();
        let mut cache = MaterialPipelineCache::new();
        let g = graph(false);
        let e = entity(&g).with_wireframe();
        let id = cache
            .get_or_create(&device, &g, LightType::Ambient, &e, TargetFormatFlags::HDR)
            .expect("pipeline");
        let desc = device.pipeline_desc(id).expect("desc");
        assert_eq!(desc.fill, FillMode::Wireframe);
    }

    #[test]
    fn test_depth_only_target_has_no_color_format() {
        let device = HeadlessDevice::new();
        let mut cache = MaterialPipelineCache::new();
        let g = graph(false);
        let e = entity(&g);
        let id = cache
            .get_or_create(&device, &g, LightType::Ambient, &e, TargetFormatFlags::DEPTH_ONLY)
            .expect("pipeline");
        let desc = device.pipeline_desc(id).expect("desc");
        assert!(desc.color_format.is_none());
        assert_eq!(desc.table_layout.texture_slots, 0);
    }
}
