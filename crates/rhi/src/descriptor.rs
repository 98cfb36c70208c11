//! Descriptor set management for shader resource binding.
//!
//! This module provides:
//! - [`DescriptorSetLayout`], built binding by binding with [`DescriptorSetLayout::builder`]
//! - [`DescriptorPool`], built with [`DescriptorPool::builder`], which allocates sets
//! - [`DescriptorWriter`], which allocates a set and fills it in one go
//!
//! Pool exhaustion is not an error: allocation returns `Ok(None)` and the caller decides
//! whether to grow, reset or give up.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use frameline_rhi::descriptor::{DescriptorPool, DescriptorSetLayout, DescriptorWriter};
//! use frameline_rhi::gpu::GpuDevice;
//! use frameline_rhi::vk;
//!
//! # fn example(device: Arc<dyn GpuDevice>, ubo: vk::DescriptorBufferInfo) -> Result<(), frameline_rhi::RhiError> {
//! let layout = DescriptorSetLayout::builder()
//!     .uniform_buffer(0, vk::ShaderStageFlags::ALL_GRAPHICS)
//!     .build(device.clone())?;
//!
//! let pool = DescriptorPool::builder()
//!     .max_sets(2)
//!     .add_pool_size(vk::DescriptorType::UNIFORM_BUFFER, 2)
//!     .build(device)?;
//!
//! let set = DescriptorWriter::new(&layout, &pool)
//!     .write_buffer(0, ubo)
//!     .build()?
//!     .expect("pool sized for this set");
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, warn};

use crate::error::RhiResult;
use crate::gpu::{DescriptorResource, DescriptorWrite, GpuDevice};

/// Builder for [`DescriptorSetLayout`].
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: BTreeMap<u32, vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayoutBuilder {
    /// Adds a binding.
    ///
    /// # Panics
    ///
    /// Panics if `binding` was already added.
    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        assert!(
            !self.bindings.contains_key(&binding),
            "Binding {} already in use",
            binding
        );
        self.bindings.insert(
            binding,
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::UNIFORM_BUFFER, stage_flags, 1)
    }

    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::STORAGE_BUFFER, stage_flags, 1)
    }

    pub fn combined_image_sampler(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            stage_flags,
            1,
        )
    }

    /// Creates the layout.
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation fails.
    pub fn build(self, device: Arc<dyn GpuDevice>) -> RhiResult<DescriptorSetLayout> {
        let bindings: Vec<_> = self.bindings.values().copied().collect();
        let layout = device.create_descriptor_set_layout(&bindings)?;

        debug!(
            "Created descriptor set layout with {} binding(s)",
            bindings.len()
        );

        Ok(DescriptorSetLayout {
            device,
            layout,
            bindings: self.bindings,
        })
    }
}

/// Descriptor set layout wrapper.
///
/// Keeps its bindings so writers can check what they write against the layout.
pub struct DescriptorSetLayout {
    device: Arc<dyn GpuDevice>,
    layout: vk::DescriptorSetLayout,
    bindings: BTreeMap<u32, vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayout {
    /// Starts a layout with no bindings.
    pub fn builder() -> DescriptorSetLayoutBuilder {
        DescriptorSetLayoutBuilder::default()
    }

    /// Returns the Vulkan descriptor set layout handle.
    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Returns the description of `binding`, if the layout has it.
    #[inline]
    pub fn binding(&self, binding: u32) -> Option<&vk::DescriptorSetLayoutBinding<'static>> {
        self.bindings.get(&binding)
    }

    /// Number of bindings in the layout.
    #[inline]
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.layout);
        debug!("Destroyed descriptor set layout");
    }
}

/// Builder for [`DescriptorPool`].
pub struct DescriptorPoolBuilder {
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    max_sets: u32,
    flags: vk::DescriptorPoolCreateFlags,
}

impl Default for DescriptorPoolBuilder {
    fn default() -> Self {
        Self {
            pool_sizes: Vec::new(),
            max_sets: 1000,
            flags: vk::DescriptorPoolCreateFlags::empty(),
        }
    }
}

impl DescriptorPoolBuilder {
    /// Reserves room for `count` descriptors of type `descriptor_type`.
    pub fn add_pool_size(mut self, descriptor_type: vk::DescriptorType, count: u32) -> Self {
        self.pool_sizes.push(
            vk::DescriptorPoolSize::default()
                .ty(descriptor_type)
                .descriptor_count(count),
        );
        self
    }

    /// Sets creation flags. `FREE_DESCRIPTOR_SET` is needed for [`DescriptorPool::free`].
    pub fn pool_flags(mut self, flags: vk::DescriptorPoolCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the maximum number of sets (default 1000).
    pub fn max_sets(mut self, max_sets: u32) -> Self {
        self.max_sets = max_sets;
        self
    }

    /// Creates the pool.
    pub fn build(self, device: Arc<dyn GpuDevice>) -> RhiResult<DescriptorPool> {
        let pool = device.create_descriptor_pool(self.max_sets, &self.pool_sizes, self.flags)?;

        debug!(
            "Created descriptor pool: max_sets={}, pool_sizes={}",
            self.max_sets,
            self.pool_sizes.len()
        );

        Ok(DescriptorPool {
            device,
            pool,
            max_sets: self.max_sets,
        })
    }
}

/// Descriptor pool for allocating descriptor sets.
///
/// Sets allocated from the pool become invalid when it is reset or dropped.
pub struct DescriptorPool {
    device: Arc<dyn GpuDevice>,
    pool: vk::DescriptorPool,
    max_sets: u32,
}

impl DescriptorPool {
    /// Starts a pool with no pool sizes and room for 1000 sets.
    pub fn builder() -> DescriptorPoolBuilder {
        DescriptorPoolBuilder::default()
    }

    /// Allocates one set with `layout`.
    ///
    /// Returns `Ok(None)` when the pool is exhausted or fragmented.
    ///
    /// # Errors
    ///
    /// Returns an error for any other allocation failure.
    pub fn allocate(&self, layout: &DescriptorSetLayout) -> RhiResult<Option<vk::DescriptorSet>> {
        match self.device.allocate_descriptor_set(self.pool, layout.handle()) {
            Ok(set) => Ok(Some(set)),
            Err(e @ (vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL)) => {
                warn!("Descriptor pool exhausted ({:?})", e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns sets to the pool.
    pub fn free(&self, sets: &[vk::DescriptorSet]) -> RhiResult<()> {
        self.device.free_descriptor_sets(self.pool, sets)?;
        debug!("Freed {} descriptor set(s)", sets.len());
        Ok(())
    }

    /// Returns every set to the pool at once.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_descriptor_pool(self.pool)?;
        debug!("Reset descriptor pool");
        Ok(())
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    #[inline]
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    fn device(&self) -> &dyn GpuDevice {
        self.device.as_ref()
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(self.pool);
        debug!("Destroyed descriptor pool");
    }
}

/// Collects writes for one set, then allocates and fills it.
pub struct DescriptorWriter<'a> {
    layout: &'a DescriptorSetLayout,
    pool: &'a DescriptorPool,
    writes: Vec<(u32, vk::DescriptorType, DescriptorResource)>,
}

impl<'a> DescriptorWriter<'a> {
    pub fn new(layout: &'a DescriptorSetLayout, pool: &'a DescriptorPool) -> Self {
        Self {
            layout,
            pool,
            writes: Vec::new(),
        }
    }

    /// Writes a buffer descriptor to `binding`.
    ///
    /// # Panics
    ///
    /// Panics if the layout has no such binding or it holds more than one descriptor.
    pub fn write_buffer(self, binding: u32, info: vk::DescriptorBufferInfo) -> Self {
        self.push(binding, DescriptorResource::Buffer(info))
    }

    /// Writes an image descriptor to `binding`.
    ///
    /// # Panics
    ///
    /// Same conditions as [`write_buffer`](Self::write_buffer).
    pub fn write_image(self, binding: u32, info: vk::DescriptorImageInfo) -> Self {
        self.push(binding, DescriptorResource::Image(info))
    }

    fn push(mut self, binding: u32, resource: DescriptorResource) -> Self {
        let description = self
            .layout
            .binding(binding)
            .unwrap_or_else(|| panic!("Layout does not contain binding {}", binding));
        assert!(
            description.descriptor_count == 1,
            "Binding {} expects {} descriptors, but a single descriptor was written",
            binding,
            description.descriptor_count
        );
        self.writes
            .push((binding, description.descriptor_type, resource));
        self
    }

    /// Allocates a set from the pool and applies the writes.
    ///
    /// Returns `Ok(None)` if the pool is exhausted; nothing is written in that case.
    pub fn build(self) -> RhiResult<Option<vk::DescriptorSet>> {
        let Some(set) = self.pool.allocate(self.layout)? else {
            return Ok(None);
        };
        self.overwrite(set);
        Ok(Some(set))
    }

    /// Applies the writes to an existing set.
    pub fn overwrite(self, set: vk::DescriptorSet) {
        let writes: Vec<DescriptorWrite> = self
            .writes
            .iter()
            .map(|&(binding, descriptor_type, resource)| DescriptorWrite {
                set,
                binding,
                descriptor_type,
                resource,
            })
            .collect();
        if writes.is_empty() {
            return;
        }
        self.pool.device().update_descriptor_sets(&writes);
        debug!("Wrote {} descriptor(s)", writes.len());
    }
}

/// Builds a [`vk::DescriptorImageInfo`].
#[inline]
pub fn image_info(
    sampler: vk::Sampler,
    image_view: vk::ImageView,
    image_layout: vk::ImageLayout,
) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo::default()
        .sampler(sampler)
        .image_view(image_view)
        .image_layout(image_layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, ObjectKind};

    fn layout(mock: &Arc<MockDevice>) -> DescriptorSetLayout {
        DescriptorSetLayout::builder()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT)
            .add_binding(
                2,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::ShaderStageFlags::COMPUTE,
                4,
            )
            .build(mock.as_device())
            .unwrap()
    }

    fn pool(mock: &Arc<MockDevice>, max_sets: u32) -> DescriptorPool {
        DescriptorPool::builder()
            .max_sets(max_sets)
            .add_pool_size(vk::DescriptorType::UNIFORM_BUFFER, max_sets)
            .pool_flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .build(mock.as_device())
            .unwrap()
    }

    fn ubo_info(offset: vk::DeviceSize) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: vk::Buffer::null(),
            offset,
            range: 64,
        }
    }

    #[test]
    fn test_layout_keeps_bindings() {
        let mock = MockDevice::new();
        let layout = layout(&mock);
        assert_eq!(layout.binding_count(), 3);

        let binding = layout.binding(1).unwrap();
        assert_eq!(
            binding.descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(binding.stage_flags, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(layout.binding(2).unwrap().descriptor_count, 4);
        assert!(layout.binding(3).is_none());
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn test_duplicate_binding_panics() {
        let _ = DescriptorSetLayout::builder()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .storage_buffer(0, vk::ShaderStageFlags::VERTEX);
    }

    #[test]
    fn test_pool_builder_defaults() {
        let mock = MockDevice::new();
        let pool = DescriptorPool::builder().build(mock.as_device()).unwrap();
        assert_eq!(pool.max_sets(), 1000);
    }

    #[test]
    fn test_pool_exhaustion_returns_none() {
        let mock = MockDevice::new();
        let layout = layout(&mock);
        let pool = pool(&mock, 2);

        let first = pool.allocate(&layout).unwrap();
        let second = pool.allocate(&layout).unwrap();
        assert!(first.is_some() && second.is_some());
        assert!(pool.allocate(&layout).unwrap().is_none());

        pool.free(&[first.unwrap()]).unwrap();
        assert!(pool.allocate(&layout).unwrap().is_some());

        pool.reset().unwrap();
        assert!(pool.allocate(&layout).unwrap().is_some());
        assert!(pool.allocate(&layout).unwrap().is_some());
    }

    #[test]
    fn test_writer_allocates_and_writes() {
        let mock = MockDevice::new();
        let layout = layout(&mock);
        let pool = pool(&mock, 4);
        let image = image_info(
            vk::Sampler::null(),
            vk::ImageView::null(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );

        let set = DescriptorWriter::new(&layout, &pool)
            .write_buffer(0, ubo_info(256))
            .write_image(1, image)
            .build()
            .unwrap()
            .unwrap();

        let writes = mock.descriptor_writes();
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|w| w.set == set));
        assert_eq!(writes[0].binding, 0);
        assert_eq!(writes[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert!(matches!(
            writes[0].resource,
            DescriptorResource::Buffer(info) if info.offset == 256
        ));
        assert!(matches!(
            writes[1].resource,
            DescriptorResource::Image(info)
                if info.image_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        ));
    }

    #[test]
    fn test_writer_on_exhausted_pool_writes_nothing() {
        let mock = MockDevice::new();
        let layout = layout(&mock);
        let pool = pool(&mock, 1);
        pool.allocate(&layout).unwrap().unwrap();

        let set = DescriptorWriter::new(&layout, &pool)
            .write_buffer(0, ubo_info(0))
            .build()
            .unwrap();
        assert!(set.is_none());
        assert!(mock.descriptor_writes().is_empty());
    }

    #[test]
    fn test_overwrite_targets_existing_set() {
        let mock = MockDevice::new();
        let layout = layout(&mock);
        let pool = pool(&mock, 1);
        let set = pool.allocate(&layout).unwrap().unwrap();

        DescriptorWriter::new(&layout, &pool)
            .write_buffer(0, ubo_info(512))
            .overwrite(set);

        let writes = mock.descriptor_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].set, set);
    }

    #[test]
    #[should_panic(expected = "does not contain binding 7")]
    fn test_writer_missing_binding_panics() {
        let mock = MockDevice::new();
        let layout = layout(&mock);
        let pool = pool(&mock, 1);
        let _ = DescriptorWriter::new(&layout, &pool).write_buffer(7, ubo_info(0));
    }

    #[test]
    #[should_panic(expected = "expects 4 descriptors")]
    fn test_writer_array_binding_panics() {
        let mock = MockDevice::new();
        let layout = layout(&mock);
        let pool = pool(&mock, 1);
        let _ = DescriptorWriter::new(&layout, &pool).write_buffer(2, ubo_info(0));
    }

    #[test]
    fn test_layout_and_pool_are_released() {
        let mock = MockDevice::new();
        {
            let _layout = layout(&mock);
            let _pool = pool(&mock, 1);
            assert_eq!(mock.live_objects_of(ObjectKind::DescriptorSetLayout), 1);
            assert_eq!(mock.live_objects_of(ObjectKind::DescriptorPool), 1);
        }
        assert_eq!(mock.live_objects(), 0);
    }
}
