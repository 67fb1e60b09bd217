//! Per-frame pipelining state
//!
//! The renderer records frame N while the GPU consumes frame N-1. Every
//! resource a frame writes while recording lives in its [`FrameContext`]:
//! the command recorder, the shader-visible descriptor ring, the constant
//! data ring, and the per-frame constant caches. A context is only
//! touched again once the shared fence confirms its previous submission
//! completed, so nothing in here needs further synchronisation.

use std::collections::HashMap;

use crate::config::RendererConfig;
use crate::gpu::{CommandRecorder, DescriptorKind, GpuDevice, GpuFence, GpuResult};
use crate::render::constants::ConstantDataPool;
use crate::render::descriptor::{DescriptorHandle, ShaderVisibleDescriptorAllocator};

/// A constant-buffer view written earlier in the current frame.
///
/// `stamp` is the frame number the entry was written under; entries from
/// previous frames are stale because the constant ring rewinds every
/// frame.
pub(crate) struct CachedConstant {
    /// CPU descriptor slot holding the view.
    pub(crate) view: DescriptorHandle,
    /// Backing buffer resource identity.
    pub(crate) resource: u64,
    /// Frame number the entry was written under.
    pub(crate) stamp: u64,
}

/// All recording state owned by one frame-in-flight.
pub struct FrameContext {
    pub(crate) recorder: Box<dyn CommandRecorder>,
    /// Fence ticket of this context's last submission; zero before the
    /// first use, which every fence reports as already completed.
    pub(crate) fence_value: u64,
    pub(crate) shader_visible: ShaderVisibleDescriptorAllocator,
    pub(crate) constants: ConstantDataPool,
    /// Static render-target view slot rewritten to each frame's acquired
    /// back buffer.
    pub(crate) backbuffer_rtv: DescriptorHandle,
    pub(crate) backbuffer_resource: u64,
    /// Per-(pass, entity) constant views, keyed by pointer identity.
    pub(crate) entity_constants: HashMap<(usize, usize), CachedConstant>,
    /// Per-(pass, light index) constant views.
    pub(crate) light_constants: HashMap<(usize, usize), CachedConstant>,
}

impl FrameContext {
    /// Create one frame's recorder, descriptor ring, and constant ring.
    ///
    /// # Errors
    /// Propagates device-level creation failure.
    pub(crate) fn new(
        device: &dyn GpuDevice,
        config: &RendererConfig,
        backbuffer_rtv: DescriptorHandle,
    ) -> GpuResult<Self> {
        Ok(Self {
            recorder: device.create_recorder()?,
            fence_value: 0,
            shader_visible: ShaderVisibleDescriptorAllocator::new(
                device,
                DescriptorKind::ShaderResource,
                config.shader_visible_capacity,
            )?,
            constants: ConstantDataPool::new(
                device,
                config.constant_pool.min_buffers,
                config.constant_pool.buffer_len as usize,
            )?,
            backbuffer_rtv,
            backbuffer_resource: 0,
            entity_constants: HashMap::new(),
            light_constants: HashMap::new(),
        })
    }

    /// Block until this context's previous submission completed, then
    /// rewind everything it owns for re-recording.
    pub(crate) fn begin(&mut self, fence: &dyn GpuFence) {
        fence.wait_until(self.fence_value);
        self.recorder.reset();
        self.shader_visible.reset();
        self.constants.reset();
    }

    /// Replace the constant ring after a pass-set change resized the
    /// per-frame draw budget. Cached views point into the old ring and
    /// are dropped with it.
    pub(crate) fn rebuild_constants(
        &mut self,
        device: &dyn GpuDevice,
        buffer_count: u32,
        buffer_len: usize,
    ) -> GpuResult<()> {
        self.constants = ConstantDataPool::new(device, buffer_count, buffer_len)?;
        self.entity_constants.clear();
        self.light_constants.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;

    fn context(device: &HeadlessDevice) -> FrameContext {
        let config = RendererConfig::default();
        FrameContext::new(device, &config, DescriptorHandle { cpu: 0x10, gpu: 0 })
            .expect("frame context")
    }

    #[test]
    fn test_begin_rewinds_rings() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence().expect("fence");
        let mut frame = context(&device);

        frame.shader_visible.allocate(8);
        frame.constants.next();
        frame.begin(fence.as_ref());
        assert_eq!(frame.shader_visible.allocated(), 0);
        assert_eq!(frame.constants.in_use(), 0);
    }

    #[test]
    fn test_begin_waits_for_prior_submission() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence().expect("fence");
        let mut frame = context(&device);

        // Fresh contexts carry ticket zero and must not block.
        frame.begin(fence.as_ref());

        frame.fence_value = 7;
        fence.signal(7);
        frame.begin(fence.as_ref());
    }

    #[test]
    fn test_rebuild_constants_drops_cached_views() {
        let device = HeadlessDevice::new();
        let mut frame = context(&device);
        frame.entity_constants.insert(
            (1, 2),
            CachedConstant { view: DescriptorHandle { cpu: 0x20, gpu: 0 }, resource: 9, stamp: 1 },
        );
        frame.rebuild_constants(&device, 8, 256).expect("rebuild");
        assert!(frame.entity_constants.is_empty());
        assert_eq!(frame.constants.capacity(), 8);
    }
}
