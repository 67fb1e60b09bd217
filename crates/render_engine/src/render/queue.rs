//! Render command compilation
//!
//! [`RenderQueueBuilder`] compiles a declared set of render passes into a
//! linear, replayable [`RenderCommand`] stream: pass-start, draws,
//! pass-end, with implicit shadow passes injected ahead of the passes
//! whose lights cast them and an implicit full-screen post-processing
//! pass plus `Present` appended at the end.
//!
//! The stream is produced once per pass-set change and replayed unchanged
//! every frame; per-draw ordering inside a pass is declaration order,
//! ambient base first, then one additive draw per light. Additive
//! blending makes that ordering a correctness requirement, not a
//! preference.

use std::collections::HashMap;
use std::sync::Arc;

use crate::gpu::{GpuDevice, PipelineId, ShaderSource};
use crate::render::graph::{
    LightType, MaterialGraph, MeshKey, PassTarget, RenderEntity, RenderPass, ShadowMap,
    TargetFormatFlags, TextureBinding,
};
use crate::render::material::MaterialPipelineCache;
use crate::render::RenderError;

/// Which light a draw accumulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightBinding {
    /// The ambient base pass.
    Ambient,
    /// An additive pass for one scene light.
    Scene {
        /// Index into the pass scene's light list.
        index: usize,
        /// The light's type.
        kind: LightType,
    },
}

/// One element of the compiled command stream.
#[derive(Clone)]
pub enum RenderCommand {
    /// Bind targets, clear, set viewport; lazily upload any
    /// not-yet-uploaded textures the pass samples.
    PassStart {
        /// The pass being opened.
        pass: Arc<RenderPass>,
    },
    /// One (entity, light) draw.
    Draw {
        /// The pass this draw belongs to.
        pass: Arc<RenderPass>,
        /// Entity being drawn.
        entity: Arc<RenderEntity>,
        /// Light accumulated by this draw.
        light: LightBinding,
        /// Pipeline resolved at compile time.
        pipeline: PipelineId,
        /// Shadow map for the light, when it casts one.
        shadow: Option<Arc<ShadowMap>>,
    },
    /// Transition pass outputs back to a readable state.
    PassEnd {
        /// The pass being closed.
        pass: Arc<RenderPass>,
    },
    /// Submit and hand the surface to presentation.
    Present,
}

/// Result of one compilation: the stream plus the draw count the renderer
/// sizes its per-frame constant pools from.
pub struct QueueBuild {
    /// The compiled command stream.
    pub commands: Vec<RenderCommand>,
    /// Number of `Draw` commands in the stream.
    pub draw_count: usize,
}

/// Wraps the engine's post-processing graph so its first texture slot
/// samples the final offscreen colour target of the current pass set.
struct ScreenOutputGraph {
    inner: Arc<dyn MaterialGraph>,
    source: Option<TextureBinding>,
}

impl MaterialGraph for ScreenOutputGraph {
    fn shader_source(
        &self,
        light: LightType,
        target: TargetFormatFlags,
    ) -> Result<ShaderSource, RenderError> {
        self.inner.shader_source(light, target)
    }

    fn texture_bindings(&self) -> Vec<TextureBinding> {
        let mut bindings = Vec::new();
        if let Some(source) = &self.source {
            bindings.push(source.clone());
        }
        bindings.extend(self.inner.texture_bindings());
        bindings
    }
}

/// Compiles render passes into a command stream.
pub struct RenderQueueBuilder<'a> {
    device: &'a dyn GpuDevice,
    cache: &'a mut MaterialPipelineCache,
    shadow_graph: Arc<dyn MaterialGraph>,
    post_graph: Arc<dyn MaterialGraph>,
    quad_mesh: MeshKey,
}

impl<'a> RenderQueueBuilder<'a> {
    /// Builder over the renderer's device, pipeline cache, internal
    /// graphs, and full-screen quad mesh.
    pub fn new(
        device: &'a dyn GpuDevice,
        cache: &'a mut MaterialPipelineCache,
        shadow_graph: Arc<dyn MaterialGraph>,
        post_graph: Arc<dyn MaterialGraph>,
        quad_mesh: MeshKey,
    ) -> Self {
        Self { device, cache, shadow_graph, post_graph, quad_mesh }
    }

    /// Compile `passes` into a command stream.
    ///
    /// `shadow_maps` is keyed by (pass index, light index) and supplies
    /// the pre-created depth targets for shadow-casting lights.
    ///
    /// # Panics
    /// When the final pass does not target the screen. Wiring passes
    /// without a screen output is a programmer error, not a runtime
    /// condition.
    ///
    /// # Errors
    /// Shader generation or pipeline creation failure while resolving
    /// materials.
    pub fn build(
        mut self,
        passes: &[Arc<RenderPass>],
        shadow_maps: &HashMap<(usize, usize), Arc<ShadowMap>>,
    ) -> Result<QueueBuild, RenderError> {
        assert!(
            matches!(passes.last().map(|p| &p.target), Some(PassTarget::Screen)),
            "render pass list must end with a screen-target pass",
        );

        let mut commands = Vec::new();
        let mut draw_count = 0usize;

        // All passes except the trailing screen pass render their scenes;
        // the screen pass anchors the synthetic post stage below.
        let scene_passes = &passes[..passes.len() - 1];

        for (pass_index, pass) in scene_passes.iter().enumerate() {
            self.emit_shadow_passes(pass_index, pass, shadow_maps, &mut commands, &mut draw_count)?;
            self.emit_scene_pass(pass_index, pass, shadow_maps, &mut commands, &mut draw_count)?;
        }

        self.emit_post_pass(passes, scene_passes, &mut commands, &mut draw_count)?;
        commands.push(RenderCommand::Present);

        log::info!(
            "Compiled render queue: {} passes, {draw_count} draws, {} commands",
            scene_passes.len(),
            commands.len(),
        );
        Ok(QueueBuild { commands, draw_count })
    }

    fn emit_shadow_passes(
        &mut self,
        pass_index: usize,
        pass: &Arc<RenderPass>,
        shadow_maps: &HashMap<(usize, usize), Arc<ShadowMap>>,
        commands: &mut Vec<RenderCommand>,
        draw_count: &mut usize,
    ) -> Result<(), RenderError> {
        for (light_index, _light) in pass.scene.lights.iter().enumerate() {
            let Some(map) = shadow_maps.get(&(pass_index, light_index)) else {
                continue;
            };
            let shadow_pass = Arc::new(RenderPass {
                name: format!("{}.shadow{light_index}", pass.name),
                target: PassTarget::Offscreen(Arc::clone(&map.depth)),
                scene: Arc::clone(&pass.scene),
                camera: map.camera,
                clear_color: [0.0; 4],
            });
            commands.push(RenderCommand::PassStart { pass: Arc::clone(&shadow_pass) });
            for entity in &shadow_pass.scene.entities {
                let pipeline = self.cache.get_or_create(
                    self.device,
                    &self.shadow_graph,
                    LightType::Ambient,
                    entity,
                    TargetFormatFlags::DEPTH_ONLY,
                )?;
                commands.push(RenderCommand::Draw {
                    pass: Arc::clone(&shadow_pass),
                    entity: Arc::clone(entity),
                    light: LightBinding::Ambient,
                    pipeline,
                    shadow: None,
                });
                *draw_count += 1;
            }
            commands.push(RenderCommand::PassEnd { pass: shadow_pass });
        }
        Ok(())
    }

    fn emit_scene_pass(
        &mut self,
        pass_index: usize,
        pass: &Arc<RenderPass>,
        shadow_maps: &HashMap<(usize, usize), Arc<ShadowMap>>,
        commands: &mut Vec<RenderCommand>,
        draw_count: &mut usize,
    ) -> Result<(), RenderError> {
        let target_flags = match &pass.target {
            PassTarget::Offscreen(_) => TargetFormatFlags::HDR,
            PassTarget::Screen => TargetFormatFlags::SRGB,
        };

        commands.push(RenderCommand::PassStart { pass: Arc::clone(pass) });
        for entity in &pass.scene.entities {
            // Ambient base draw first; additive lights accumulate on top.
            let pipeline = self.cache.get_or_create(
                self.device,
                &entity.graph,
                LightType::Ambient,
                entity,
                target_flags,
            )?;
            commands.push(RenderCommand::Draw {
                pass: Arc::clone(pass),
                entity: Arc::clone(entity),
                light: LightBinding::Ambient,
                pipeline,
                shadow: None,
            });
            *draw_count += 1;

            for (light_index, light) in pass.scene.lights.iter().enumerate() {
                if matches!(light.kind, LightType::Ambient) {
                    // The base draw already covers ambient contribution.
                    continue;
                }
                let pipeline = self.cache.get_or_create(
                    self.device,
                    &entity.graph,
                    light.kind,
                    entity,
                    target_flags,
                )?;
                commands.push(RenderCommand::Draw {
                    pass: Arc::clone(pass),
                    entity: Arc::clone(entity),
                    light: LightBinding::Scene { index: light_index, kind: light.kind },
                    pipeline,
                    shadow: shadow_maps.get(&(pass_index, light_index)).cloned(),
                });
                *draw_count += 1;
            }
        }
        commands.push(RenderCommand::PassEnd { pass: Arc::clone(pass) });
        Ok(())
    }

    fn emit_post_pass(
        &mut self,
        passes: &[Arc<RenderPass>],
        scene_passes: &[Arc<RenderPass>],
        commands: &mut Vec<RenderCommand>,
        draw_count: &mut usize,
    ) -> Result<(), RenderError> {
        // The post stage samples the last offscreen colour target.
        let source = scene_passes.iter().rev().find_map(|p| match &p.target {
            PassTarget::Offscreen(target) if !target.is_depth() => {
                Some(TextureBinding::Target(Arc::clone(target)))
            }
            _ => None,
        });
        if source.is_none() {
            log::debug!("No offscreen colour pass; post stage runs without a scene input");
        }

        let screen_pass = passes.last().expect("validated non-empty");
        let output_graph: Arc<dyn MaterialGraph> = Arc::new(ScreenOutputGraph {
            inner: Arc::clone(&self.post_graph),
            source,
        });
        let quad = Arc::new(RenderEntity::new(self.quad_mesh, Arc::clone(&output_graph)));

        let post_pass = Arc::new(RenderPass {
            name: "post".to_string(),
            target: PassTarget::Screen,
            scene: Arc::new(crate::render::graph::SceneView {
                entities: vec![Arc::clone(&quad)],
                lights: Vec::new(),
            }),
            camera: screen_pass.camera,
            clear_color: screen_pass.clear_color,
        });

        let pipeline = self.cache.get_or_create(
            self.device,
            &output_graph,
            LightType::Ambient,
            &quad,
            TargetFormatFlags::SRGB,
        )?;

        commands.push(RenderCommand::PassStart { pass: Arc::clone(&post_pass) });
        commands.push(RenderCommand::Draw {
            pass: Arc::clone(&post_pass),
            entity: quad,
            light: LightBinding::Ambient,
            pipeline,
            shadow: None,
        });
        commands.push(RenderCommand::PassEnd { pass: post_pass });
        *draw_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;
    use crate::render::descriptor::DescriptorHandle;
    use crate::render::graph::{Camera, RenderTarget, SceneLight, SceneView};
    use crate::foundation::math::Vec3;

    struct StubGraph;

    impl MaterialGraph for StubGraph {
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
            Vec::new()
        }
    }

    fn stub_graph() -> Arc<dyn MaterialGraph> {
        Arc::new(StubGraph)
    }

    fn offscreen_target(device: &HeadlessDevice) -> Arc<RenderTarget> {
        Arc::new(RenderTarget {
            texture: device
                .create_texture(&crate::gpu::TextureDesc::tex2d(64, 64))
                .expect("texture"),
            rtv: DescriptorHandle { cpu: 0x10, gpu: 0 },
            dsv: DescriptorHandle::default(),
            srv: DescriptorHandle { cpu: 0x20, gpu: 0 },
            width: 64,
            height: 64,
        })
    }

    fn scene(entity_count: usize, lights: Vec<SceneLight>) -> Arc<SceneView> {
        let graph = stub_graph();
        let entities = (0..entity_count)
            .map(|_| Arc::new(RenderEntity::new(MeshKey::default(), Arc::clone(&graph))))
            .collect();
        Arc::new(SceneView { entities, lights })
    }

    fn pass(name: &str, target: PassTarget, scene: Arc<SceneView>) -> Arc<RenderPass> {
        Arc::new(RenderPass {
            name: name.to_string(),
            target,
            scene,
            camera: Camera::identity(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
        })
    }

    fn build(
        device: &HeadlessDevice,
        cache: &mut MaterialPipelineCache,
        passes: &[Arc<RenderPass>],
    ) -> QueueBuild {
        RenderQueueBuilder::new(device, cache, stub_graph(), stub_graph(), MeshKey::default())
            .build(passes, &HashMap::new())
            .expect("build")
    }

    #[test]
    fn test_post_pass_is_always_appended_last() {
        let device = HeadlessDevice::new();
        let mut cache = MaterialPipelineCache::new();
        let target = offscreen_target(&device);
        let passes = vec![
            pass("A", PassTarget::Offscreen(target), scene(2, Vec::new())),
            pass("B", PassTarget::Screen, scene(0, Vec::new())),
        ];
        let built = build(&device, &mut cache, &passes);

        // PassStart(A), Draw x2, PassEnd(A), PassStart(post), Draw(quad),
        // PassEnd(post), Present.
        assert_eq!(built.commands.len(), 8);
        assert!(matches!(&built.commands[0], RenderCommand::PassStart { pass } if pass.name == "A"));
        assert!(matches!(&built.commands[1], RenderCommand::Draw { .. }));
        assert!(matches!(&built.commands[2], RenderCommand::Draw { .. }));
        assert!(matches!(&built.commands[3], RenderCommand::PassEnd { pass } if pass.name == "A"));
        assert!(
            matches!(&built.commands[4], RenderCommand::PassStart { pass } if pass.name == "post")
        );
        assert!(matches!(&built.commands[5], RenderCommand::Draw { .. }));
        assert!(matches!(&built.commands[6], RenderCommand::PassEnd { pass } if pass.name == "post"));
        assert!(matches!(&built.commands[7], RenderCommand::Present));
        assert_eq!(built.draw_count, 3);
    }

    #[test]
    #[should_panic(expected = "must end with a screen-target pass")]
    fn test_missing_screen_pass_is_fatal() {
        let device = HeadlessDevice::new();
        let mut cache = MaterialPipelineCache::new();
        let target = offscreen_target(&device);
        let passes = vec![pass("A", PassTarget::Offscreen(target), scene(1, Vec::new()))];
        build(&device, &mut cache, &passes);
    }

    #[test]
    #[should_panic(expected = "must end with a screen-target pass")]
    fn test_empty_pass_list_is_fatal() {
        let device = HeadlessDevice::new();
        let mut cache = MaterialPipelineCache::new();
        build(&device, &mut cache, &[]);
    }

    #[test]
    fn test_ambient_draw_precedes_light_draws_per_entity() {
        let device = HeadlessDevice::new();
        let mut cache = MaterialPipelineCache::new();
        let target = offscreen_target(&device);
        let lights = vec![
            SceneLight::directional(-Vec3::y(), Vec3::new(1.0, 1.0, 1.0), 1.0),
            SceneLight::point(Vec3::new(1.0, 2.0, 3.0), Vec3::new(1.0, 0.0, 0.0), 2.0),
        ];
        let passes = vec![
            pass("lit", PassTarget::Offscreen(target), scene(2, lights)),
            pass("screen", PassTarget::Screen, scene(0, Vec::new())),
        ];
        let built = build(&device, &mut cache, &passes);

        let draws: Vec<&RenderCommand> = built
            .commands
            .iter()
            .filter(|c| matches!(c, RenderCommand::Draw { .. }))
            .collect();
        // Two entities x (ambient + 2 lights) + post quad.
        assert_eq!(draws.len(), 7);
        for chunk in draws[..6].chunks(3) {
            assert!(matches!(
                chunk[0],
                RenderCommand::Draw { light: LightBinding::Ambient, .. }
            ));
            assert!(matches!(
                chunk[1],
                RenderCommand::Draw {
                    light: LightBinding::Scene { index: 0, kind: LightType::Directional },
                    ..
                }
            ));
            assert!(matches!(
                chunk[2],
                RenderCommand::Draw {
                    light: LightBinding::Scene { index: 1, kind: LightType::Point },
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_shadow_pass_injected_before_its_scene_pass() {
        let device = HeadlessDevice::new();
        let mut cache = MaterialPipelineCache::new();
        let color = offscreen_target(&device);
        let depth = Arc::new(RenderTarget {
            texture: device
                .create_texture(&crate::gpu::TextureDesc {
                    width: 512,
                    height: 512,
                    format: crate::gpu::TextureFormat::Depth32,
                    dimension: crate::gpu::TextureDimension::Tex2d,
                    mip_levels: 1,
                })
                .expect("texture"),
            rtv: DescriptorHandle::default(),
            dsv: DescriptorHandle { cpu: 0x30, gpu: 0 },
            srv: DescriptorHandle { cpu: 0x40, gpu: 0 },
            width: 512,
            height: 512,
        });
        let light = SceneLight::directional(-Vec3::y(), Vec3::new(1.0, 1.0, 1.0), 1.0)
            .with_shadow(Camera::identity(), 512);
        let passes = vec![
            pass("lit", PassTarget::Offscreen(color), scene(1, vec![light])),
            pass("screen", PassTarget::Screen, scene(0, Vec::new())),
        ];
        let mut shadow_maps = HashMap::new();
        shadow_maps.insert(
            (0usize, 0usize),
            Arc::new(ShadowMap { depth, camera: Camera::identity() }),
        );

        let built = RenderQueueBuilder::new(
            &device,
            &mut cache,
            stub_graph(),
            stub_graph(),
            MeshKey::default(),
        )
        .build(&passes, &shadow_maps)
        .expect("build");

        // Shadow pass comes first and the lit draw carries the map.
        assert!(matches!(
            &built.commands[0],
            RenderCommand::PassStart { pass } if pass.name == "lit.shadow0"
        ));
        let lit_light_draw = built.commands.iter().find(|c| {
            matches!(c, RenderCommand::Draw { light: LightBinding::Scene { .. }, .. })
        });
        assert!(matches!(
            lit_light_draw,
            Some(RenderCommand::Draw { shadow: Some(_), .. })
        ));
    }
}
