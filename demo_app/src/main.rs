//! Demo scene on the headless backend
//!
//! Builds a small lit scene (textured ground plane, spinning pyramid, a
//! shadow-casting sun and a point lamp), installs an offscreen-plus-screen
//! pass set, and renders a few hundred frames. Run with
//! `RUST_LOG=debug` to watch pool sizing and pipeline compilation.

use std::sync::Arc;

use render_engine::foundation::math::Point3;
use render_engine::prelude::*;
use render_engine::render::graph::{SamplerKind, TextureKey};

const LIT_VS: &str = "\
layout(location = 0) in vec3 position;
layout(location = 1) in vec3 normal;
layout(location = 2) in vec2 uv;
layout(binding = 0) uniform Draw { mat4 mvp; mat4 model; };
out vec3 v_normal;
out vec2 v_uv;
void main() {
    v_normal = mat3(model) * normal;
    v_uv = uv;
    gl_Position = mvp * vec4(position, 1.0);
}
";

const AMBIENT_FS: &str = "\
in vec3 v_normal;
in vec2 v_uv;
layout(binding = 1) uniform sampler2D albedo;
out vec4 color;
void main() { color = texture(albedo, v_uv) * 0.2; }
";

const ADDITIVE_FS: &str = "\
in vec3 v_normal;
in vec2 v_uv;
layout(binding = 1) uniform Light { vec4 color; vec4 position; vec4 direction; vec4 params; mat4 view_proj; } light;
layout(binding = 2) uniform sampler2D shadow_map;
layout(binding = 3) uniform sampler2D albedo;
out vec4 color;
void main() {
    float diffuse = max(dot(normalize(v_normal), -light.direction.xyz), 0.0);
    color = texture(albedo, v_uv) * light.color * diffuse * light.params.x;
}
";

const TONEMAP_FS: &str = "\
in vec2 v_uv;
layout(binding = 1) uniform sampler2D scene;
out vec4 color;
void main() {
    vec3 hdr = texture(scene, v_uv).rgb;
    color = vec4(hdr / (hdr + vec3(1.0)), 1.0);
}
";

/// Textured, lit material used by every scene entity.
struct LitGraph {
    texture: TextureKey,
}

impl MaterialGraph for LitGraph {
    fn shader_source(
        &self,
        light: LightType,
        _target: TargetFormatFlags,
    ) -> Result<ShaderSource, RenderError> {
        let fragment = match light {
            LightType::Ambient => AMBIENT_FS,
            _ => ADDITIVE_FS,
        };
        Ok(ShaderSource { vertex: LIT_VS.to_string(), fragment: fragment.to_string() })
    }

    fn texture_bindings(&self) -> Vec<TextureBinding> {
        vec![TextureBinding::Key { texture: self.texture, sampler: SamplerKind::LinearWrap }]
    }
}

/// Reinhard tone map for the implicit post stage.
struct ToneMapGraph;

impl MaterialGraph for ToneMapGraph {
    fn shader_source(
        &self,
        _light: LightType,
        _target: TargetFormatFlags,
    ) -> Result<ShaderSource, RenderError> {
        Ok(ShaderSource { vertex: LIT_VS.to_string(), fragment: TONEMAP_FS.to_string() })
    }

    fn texture_bindings(&self) -> Vec<TextureBinding> {
        Vec::new()
    }
}

fn checkerboard() -> Vec<u8> {
    let mut pixels = Vec::with_capacity(4 * 4 * 4);
    for y in 0..4u32 {
        for x in 0..4u32 {
            let v = if (x + y) % 2 == 0 { 220 } else { 60 };
            pixels.extend_from_slice(&[v, v, v, 255]);
        }
    }
    pixels
}

fn ground_vertices() -> [Vertex; 4] {
    let up = [0.0, 1.0, 0.0];
    [
        Vertex { position: [-5.0, 0.0, -5.0], normal: up, uv: [0.0, 0.0] },
        Vertex { position: [5.0, 0.0, -5.0], normal: up, uv: [4.0, 0.0] },
        Vertex { position: [5.0, 0.0, 5.0], normal: up, uv: [4.0, 4.0] },
        Vertex { position: [-5.0, 0.0, 5.0], normal: up, uv: [0.0, 4.0] },
    ]
}

fn pyramid_vertices() -> [Vertex; 5] {
    [
        Vertex { position: [0.0, 1.5, 0.0], normal: [0.0, 1.0, 0.0], uv: [0.5, 0.0] },
        Vertex { position: [-1.0, 0.0, -1.0], normal: [-0.5, 0.5, -0.5], uv: [0.0, 1.0] },
        Vertex { position: [1.0, 0.0, -1.0], normal: [0.5, 0.5, -0.5], uv: [1.0, 1.0] },
        Vertex { position: [1.0, 0.0, 1.0], normal: [0.5, 0.5, 0.5], uv: [1.0, 0.0] },
        Vertex { position: [-1.0, 0.0, 1.0], normal: [-0.5, 0.5, 0.5], uv: [0.0, 0.0] },
    ]
}

const PYRAMID_INDICES: [u32; 18] = [0, 1, 2, 0, 2, 3, 0, 3, 4, 0, 4, 1, 1, 4, 3, 1, 3, 2];

fn main() -> Result<(), RenderError> {
    env_logger::init();

    let config = RendererConfig::default();
    let mut renderer = Renderer::new("headless", config, Arc::new(ToneMapGraph))?;

    let texture = renderer.register_texture(&TextureDesc::tex2d(4, 4), checkerboard())?;
    let graph: Arc<dyn MaterialGraph> = Arc::new(LitGraph { texture });

    let ground_mesh = renderer.create_mesh(&ground_vertices(), &[0, 2, 1, 0, 3, 2])?;
    let pyramid_mesh = renderer.create_mesh(&pyramid_vertices(), &PYRAMID_INDICES)?;
    let ground = Arc::new(RenderEntity::new(ground_mesh, Arc::clone(&graph)));
    let pyramid = Arc::new(RenderEntity::new(pyramid_mesh, Arc::clone(&graph)));

    let sun_camera = Camera::look_at(
        Point3::new(6.0, 10.0, 4.0),
        Point3::origin(),
        Vec3::y(),
        1.0,
        std::f32::consts::FRAC_PI_4,
    );
    let sun = SceneLight::directional(
        Vec3::new(-0.4, -1.0, -0.3),
        Vec3::new(1.0, 0.95, 0.9),
        1.2,
    )
    .with_shadow(sun_camera, 1024);
    let lamp = SceneLight::point(Vec3::new(-2.0, 2.0, 2.0), Vec3::new(0.9, 0.3, 0.2), 3.0);

    let scene = Arc::new(SceneView {
        entities: vec![Arc::clone(&ground), Arc::clone(&pyramid)],
        lights: vec![sun, lamp],
    });

    let target = renderer.create_render_target(1280, 720)?;
    let camera = Camera::look_at(
        Point3::new(4.0, 3.0, 6.0),
        Point3::new(0.0, 0.5, 0.0),
        Vec3::y(),
        1280.0 / 720.0,
        std::f32::consts::FRAC_PI_3,
    );

    let passes = vec![
        Arc::new(RenderPass {
            name: "scene".to_string(),
            target: PassTarget::Offscreen(target),
            scene,
            camera,
            clear_color: [0.05, 0.07, 0.1, 1.0],
        }),
        Arc::new(RenderPass {
            name: "screen".to_string(),
            target: PassTarget::Screen,
            scene: Arc::new(SceneView { entities: Vec::new(), lights: Vec::new() }),
            camera,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }),
    ];
    renderer.set_render_passes(&passes)?;

    let mut angle = 0.0f32;
    for _ in 0..240 {
        angle += 0.02;
        pyramid.transform.set(Mat4::new_rotation(Vec3::y() * angle));
        renderer.render()?;
    }

    log::info!(
        "Rendered 240 frames on '{}', {} pipelines compiled",
        renderer.backend_name(),
        renderer.pipeline_count(),
    );
    Ok(())
}
