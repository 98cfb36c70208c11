//! Per-object data for the demo scene.
//!
//! Each frame slot owns a region of `MAX_OBJECTS` records in one storage buffer. Live objects
//! are packed densely into the current frame's region, so the record index is the draw's
//! instance index.

use std::sync::Arc;

use anyhow::{Result, ensure};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3, Vec4};

use frameline_renderer::{FrameIndex, MAX_FRAMES_IN_FLIGHT, PerFrame};
use frameline_rhi::buffer::{BufferUsage, GpuBuffer};
use frameline_rhi::descriptor::{DescriptorPool, DescriptorSetLayout, DescriptorWriter};
use frameline_rhi::gpu::GpuDevice;
use frameline_rhi::{RhiError, RhiResult, vk};
use frameline_scene::Registry;

/// Records per frame region.
pub const MAX_OBJECTS: u32 = 64;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ObjectData {
    pub model: Mat4,
    pub color: Vec4,
}

#[derive(Debug)]
pub struct SceneObject {
    pub position: Vec3,
    pub spin: f32,
    pub color: Vec4,
}

impl SceneObject {
    fn data(&self, time: f32) -> ObjectData {
        ObjectData {
            model: Mat4::from_rotation_translation(Quat::from_rotation_y(time * self.spin), self.position),
            color: self.color,
        }
    }
}

/// Storage buffer holding one region of object records per frame slot.
pub struct ObjectBuffers {
    sets: PerFrame<vk::DescriptorSet>,
    _pool: DescriptorPool,
    _layout: DescriptorSetLayout,
    buffer: GpuBuffer,
}

impl ObjectBuffers {
    pub fn new(device: Arc<dyn GpuDevice>) -> RhiResult<Self> {
        let frames = MAX_FRAMES_IN_FLIGHT as u32;
        // Written by the host every frame, so it must be mappable.
        let mut buffer = GpuBuffer::new(
            device.clone(),
            std::mem::size_of::<ObjectData>() as vk::DeviceSize,
            MAX_OBJECTS * frames,
            BufferUsage::Storage.to_vk_usage(),
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            BufferUsage::Storage.min_offset_alignment(&device.limits()),
        )?;
        buffer.map_all()?;

        let layout = DescriptorSetLayout::builder()
            .storage_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build(device.clone())?;
        let pool = DescriptorPool::builder()
            .max_sets(frames)
            .add_pool_size(vk::DescriptorType::STORAGE_BUFFER, frames)
            .build(device)?;

        let sets = PerFrame::try_new(|slot| {
            let (offset, size) = region(&buffer, slot);
            DescriptorWriter::new(&layout, &pool)
                .write_buffer(0, buffer.descriptor_info(size, offset))
                .build()?
                .ok_or(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
        })?;

        Ok(Self {
            sets,
            _pool: pool,
            _layout: layout,
            buffer,
        })
    }

    /// Packs every live object into `frame`'s region and flushes it. Returns the number of
    /// records written.
    ///
    /// Fails without writing anything if the objects do not fit in one region.
    pub fn update(&mut self, frame: FrameIndex, objects: &Registry<SceneObject>, time: f32) -> Result<u32> {
        ensure!(
            objects.len() <= MAX_OBJECTS as usize,
            "{} objects exceed the per-frame capacity of {}",
            objects.len(),
            MAX_OBJECTS
        );

        let first = frame.get() as u32 * MAX_OBJECTS;
        let mut count = 0;
        for (_, object) in objects.iter() {
            self.buffer.write_pod_to_index(&object.data(time), first + count);
            count += 1;
        }

        let (offset, size) = region(&self.buffer, frame.get());
        self.buffer.flush(size, offset)?;
        Ok(count)
    }

    pub fn descriptor_set(&self, frame: FrameIndex) -> vk::DescriptorSet {
        self.sets[frame]
    }
}

/// Byte offset and size of a frame slot's region.
fn region(buffer: &GpuBuffer, slot: usize) -> (vk::DeviceSize, vk::DeviceSize) {
    let offset = buffer.layout().index_offset(slot as u32 * MAX_OBJECTS);
    (offset, buffer.alignment_size() * MAX_OBJECTS as vk::DeviceSize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use frameline_rhi::gpu::DescriptorResource;
    use frameline_rhi::mock::MockDevice;
    use pretty_assertions::assert_eq;

    const STRIDE: usize = 256;
    const REGION: usize = STRIDE * MAX_OBJECTS as usize;

    fn scene(count: usize) -> Registry<SceneObject> {
        let mut registry = Registry::new();
        for i in 0..count {
            registry.insert(SceneObject {
                position: Vec3::new(i as f32, 0.0, 0.0),
                spin: 1.0,
                color: Vec4::new(1.0, 0.5, 0.25, 1.0),
            });
        }
        registry
    }

    fn slot(index: usize) -> FrameIndex {
        FrameIndex::all().nth(index).unwrap()
    }

    #[test]
    fn test_buffer_is_host_visible_and_mapped() {
        let mock = MockDevice::new();
        let objects = ObjectBuffers::new(mock.as_device()).unwrap();
        assert!(objects.buffer.is_mapped());
        assert!(
            objects
                .buffer
                .memory_property_flags()
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        );
        assert_eq!(objects.buffer.alignment_size(), STRIDE as u64);
    }

    #[test]
    fn test_each_set_covers_its_own_region() {
        let mock = MockDevice::new();
        let objects = ObjectBuffers::new(mock.as_device()).unwrap();

        let writes = mock.descriptor_writes();
        assert_eq!(writes.len(), MAX_FRAMES_IN_FLIGHT);
        for (index, write) in writes.iter().enumerate() {
            assert_eq!(write.set, objects.descriptor_set(slot(index)));
            let DescriptorResource::Buffer(info) = write.resource else {
                panic!("expected a buffer descriptor");
            };
            assert_eq!(info.offset, (index * REGION) as u64);
            assert_eq!(info.range, REGION as u64);
        }
    }

    #[test]
    fn test_update_packs_objects_into_its_frame_only() {
        let mock = MockDevice::new();
        let mut objects = ObjectBuffers::new(mock.as_device()).unwrap();
        let registry = scene(3);

        assert_eq!(objects.update(slot(1), &registry, 0.5).unwrap(), 3);

        let bytes = mock.buffer_contents(objects.buffer.handle());
        assert!(bytes[..REGION].iter().all(|&b| b == 0));
        for (i, (_, object)) in registry.iter().enumerate() {
            let at = REGION + i * STRIDE;
            let record = object.data(0.5);
            assert_eq!(&bytes[at..at + size_of::<ObjectData>()], bytemuck::bytes_of(&record));
        }
    }

    #[test]
    fn test_full_region_stays_inside_its_frame() {
        let mock = MockDevice::new();
        let mut objects = ObjectBuffers::new(mock.as_device()).unwrap();

        let written = objects
            .update(slot(0), &scene(MAX_OBJECTS as usize), 0.0)
            .unwrap();
        assert_eq!(written, MAX_OBJECTS);

        let bytes = mock.buffer_contents(objects.buffer.handle());
        let last = (MAX_OBJECTS as usize - 1) * STRIDE;
        assert!(bytes[last..last + size_of::<ObjectData>()].iter().any(|&b| b != 0));
        assert!(bytes[REGION..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_update_rejects_more_objects_than_a_region_holds() {
        let mock = MockDevice::new();
        let mut objects = ObjectBuffers::new(mock.as_device()).unwrap();

        let err = objects
            .update(slot(0), &scene(MAX_OBJECTS as usize + 1), 0.0)
            .unwrap_err();
        assert!(err.to_string().contains("per-frame capacity"));

        let bytes = mock.buffer_contents(objects.buffer.handle());
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
