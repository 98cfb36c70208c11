//! Per-frame global uniforms.
//!
//! [`GlobalUbo`] must match the shader's set 0, binding 0 uniform block. It uses
//! `#[repr(C)]` and implements `Pod` and `Zeroable` for byte casting.
//!
//! [`FrameUniforms`] keeps one aligned instance of it per frame slot in a single uniform
//! buffer, plus one descriptor set per slot pointing at that instance. Updating a slot
//! touches only its own instance, so the CPU never writes memory a frame in flight reads.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use tracing::debug;

use frameline_rhi::buffer::{BufferUsage, GpuBuffer};
use frameline_rhi::descriptor::{DescriptorPool, DescriptorSetLayout, DescriptorWriter};
use frameline_rhi::gpu::GpuDevice;
use frameline_rhi::{RhiError, RhiResult};

use crate::MAX_FRAMES_IN_FLIGHT;
use crate::frame::{FrameIndex, PerFrame};

/// Global uniform block.
///
/// # Memory Layout
///
/// - Offset 0: projection matrix (64 bytes)
/// - Offset 64: view matrix (64 bytes)
/// - Offset 128: inverse view matrix (64 bytes)
/// - Offset 192: ambient light color, w is intensity (16 bytes)
/// - Total size: 208 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct GlobalUbo {
    pub projection: Mat4,
    pub view: Mat4,
    pub inverse_view: Mat4,
    pub ambient_light_color: Vec4,
}

impl GlobalUbo {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Builds the block from camera matrices. The inverse view is derived from `view`.
    pub fn new(projection: Mat4, view: Mat4) -> Self {
        Self {
            projection,
            view,
            inverse_view: view.inverse(),
            ..Self::default()
        }
    }
}

impl Default for GlobalUbo {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            inverse_view: Mat4::IDENTITY,
            ambient_light_color: Vec4::new(1.0, 1.0, 1.0, 0.02),
        }
    }
}

/// Global uniform buffer with one instance and one descriptor set per frame slot.
pub struct FrameUniforms {
    // Sets are owned by the pool. Pool and layout go before the buffer they reference.
    sets: PerFrame<vk::DescriptorSet>,
    pool: DescriptorPool,
    layout: DescriptorSetLayout,
    buffer: GpuBuffer,
}

impl FrameUniforms {
    /// Binding of the uniform block in the global set.
    pub const BINDING: u32 = 0;

    /// Creates the buffer, maps it for the lifetime of `self`, and writes the sets.
    ///
    /// # Errors
    ///
    /// Returns an error if buffer, layout, pool or set creation fails.
    pub fn new(device: Arc<dyn GpuDevice>) -> RhiResult<Self> {
        let mut buffer = GpuBuffer::from_usage(
            device.clone(),
            BufferUsage::Uniform,
            GlobalUbo::SIZE as vk::DeviceSize,
            MAX_FRAMES_IN_FLIGHT as u32,
        )?;
        buffer.map_all()?;

        let layout = DescriptorSetLayout::builder()
            .uniform_buffer(Self::BINDING, vk::ShaderStageFlags::ALL_GRAPHICS)
            .build(device.clone())?;
        let pool = DescriptorPool::builder()
            .max_sets(MAX_FRAMES_IN_FLIGHT as u32)
            .add_pool_size(
                vk::DescriptorType::UNIFORM_BUFFER,
                MAX_FRAMES_IN_FLIGHT as u32,
            )
            .build(device)?;

        let sets = PerFrame::try_new(|slot| {
            DescriptorWriter::new(&layout, &pool)
                .write_buffer(Self::BINDING, buffer.descriptor_info_for_index(slot as u32))
                .build()?
                .ok_or(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
        })?;

        debug!(
            "Frame uniforms created: {} x {} bytes (aligned to {})",
            MAX_FRAMES_IN_FLIGHT,
            GlobalUbo::SIZE,
            buffer.alignment_size()
        );

        Ok(Self {
            sets,
            pool,
            layout,
            buffer,
        })
    }

    /// Writes `ubo` into `frame`'s instance and flushes that instance only.
    pub fn update(&mut self, frame: FrameIndex, ubo: &GlobalUbo) -> RhiResult<()> {
        let index = frame.get() as u32;
        self.buffer.write_pod_to_index(ubo, index);
        self.buffer.flush_index(index)
    }

    /// Descriptor set bound to `frame`'s instance.
    #[inline]
    pub fn descriptor_set(&self, frame: FrameIndex) -> vk::DescriptorSet {
        self.sets[frame]
    }

    /// Layout of the global set, for pipeline layouts.
    #[inline]
    pub fn layout(&self) -> &DescriptorSetLayout {
        &self.layout
    }

    #[inline]
    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frameline_rhi::gpu::DescriptorResource;
    use frameline_rhi::mock::{MockDevice, ObjectKind};
    use glam::Vec3;

    #[test]
    fn test_global_ubo_size() {
        // 3 Mat4 (3 * 64) + Vec4 (16) = 208 bytes
        assert_eq!(GlobalUbo::SIZE, 208);
        assert_eq!(std::mem::align_of::<GlobalUbo>(), 16);
    }

    #[test]
    fn test_global_ubo_new_derives_inverse_view() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let ubo = GlobalUbo::new(Mat4::IDENTITY, view);
        assert!((ubo.inverse_view * view).abs_diff_eq(Mat4::IDENTITY, 1e-5));
        assert_eq!(ubo.ambient_light_color.w, 0.02);
    }

    #[test]
    fn test_sets_point_at_their_own_instance() {
        let mock = MockDevice::new();
        let uniforms = FrameUniforms::new(mock.as_device()).unwrap();
        assert_eq!(uniforms.buffer().alignment_size(), 256);

        let writes = mock.descriptor_writes();
        assert_eq!(writes.len(), MAX_FRAMES_IN_FLIGHT);
        for (slot, write) in writes.iter().enumerate() {
            assert_eq!(write.set, uniforms.descriptor_set(FrameIndex::new(slot)));
            assert_eq!(write.binding, FrameUniforms::BINDING);
            let DescriptorResource::Buffer(info) = write.resource else {
                panic!("expected a buffer descriptor");
            };
            assert_eq!(info.offset, slot as u64 * 256);
            assert_eq!(info.range, GlobalUbo::SIZE as u64);
        }
    }

    #[test]
    fn test_update_touches_only_its_frame() {
        let mock = MockDevice::new();
        let mut uniforms = FrameUniforms::new(mock.as_device()).unwrap();

        let ubo = GlobalUbo {
            ambient_light_color: Vec4::splat(1.0),
            ..GlobalUbo::default()
        };
        uniforms.update(FrameIndex::new(1), &ubo).unwrap();

        let bytes = mock.buffer_contents(uniforms.buffer().handle());
        assert!(bytes[..256].iter().all(|&b| b == 0));
        assert_eq!(&bytes[256..256 + GlobalUbo::SIZE], bytemuck::bytes_of(&ubo));
    }

    #[test]
    fn test_drop_releases_everything() {
        let mock = MockDevice::new();
        {
            let _uniforms = FrameUniforms::new(mock.as_device()).unwrap();
            assert_eq!(mock.live_objects_of(ObjectKind::Buffer), 1);
            assert_eq!(mock.live_objects_of(ObjectKind::DescriptorPool), 1);
        }
        assert_eq!(mock.live_objects(), 0);
    }
}
