//! GPU buffer management.
//!
//! A [`GpuBuffer`] owns one block of GPU-accessible memory holding `instance_count`
//! equally sized instances. Each instance starts on a multiple of the device's minimum
//! offset alignment, so one buffer can back many dynamic uniform or storage bindings.
//!
//! # Overview
//!
//! - [`BufferLayout`] computes the aligned instance stride and byte ranges
//! - [`BufferUsage`] gives usage flags and memory properties for common buffer kinds
//! - [`GpuBuffer`] wraps the buffer, its host mapping, and the flush/invalidate calls
//!
//! Instance `i` occupies exactly `[i * alignment_size, i * alignment_size + instance_size)`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use frameline_rhi::buffer::{BufferUsage, GpuBuffer};
//! use frameline_rhi::gpu::GpuDevice;
//!
//! # fn example(device: Arc<dyn GpuDevice>) -> Result<(), frameline_rhi::RhiError> {
//! let mut objects = GpuBuffer::from_usage(device, BufferUsage::Uniform, 68, 3)?;
//! objects.map_all()?;
//! objects.write_to_index(&[0u8; 68], 1);
//! objects.flush_index(1)?;
//! # Ok(())
//! # }
//! ```

use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::error::{RhiError, RhiResult};
use crate::gpu::{DeviceLimits, GpuDevice};

/// Buffer usage type.
///
/// Presets for the usage flags, memory properties and offset alignment of common buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// Vertex buffer - stores vertex data
    Vertex,
    /// Index buffer - stores index data
    Index,
    /// Uniform buffer - stores shader uniform data
    Uniform,
    /// Storage buffer - general-purpose GPU storage
    Storage,
    /// Staging buffer - CPU-writable for data upload
    Staging,
}

impl BufferUsage {
    /// Converts to Vulkan buffer usage flags.
    pub fn to_vk_usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Index => {
                vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Uniform => {
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }

    /// Returns the memory properties requested for this buffer type.
    pub fn memory_properties(self) -> vk::MemoryPropertyFlags {
        match self {
            // Storage buffers are filled by the GPU or by transfers.
            BufferUsage::Storage => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            BufferUsage::Vertex
            | BufferUsage::Index
            | BufferUsage::Uniform
            | BufferUsage::Staging => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }

    /// Minimum offset alignment the device requires between instances of this type.
    pub fn min_offset_alignment(self, limits: &DeviceLimits) -> vk::DeviceSize {
        match self {
            BufferUsage::Uniform => limits.min_uniform_buffer_offset_alignment,
            BufferUsage::Storage => limits.min_storage_buffer_offset_alignment,
            BufferUsage::Vertex | BufferUsage::Index | BufferUsage::Staging => 1,
        }
    }

    /// Returns a human-readable name for the buffer type.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Vertex => "vertex",
            BufferUsage::Index => "index",
            BufferUsage::Uniform => "uniform",
            BufferUsage::Storage => "storage",
            BufferUsage::Staging => "staging",
        }
    }
}

/// Placement of equally sized instances in a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLayout {
    /// Bytes of meaningful data per instance.
    pub instance_size: vk::DeviceSize,
    /// Number of instances.
    pub instance_count: u32,
    /// Stride between instances.
    pub alignment_size: vk::DeviceSize,
}

impl BufferLayout {
    /// Lays out `instance_count` instances with the given minimum offset alignment.
    pub fn new(
        instance_size: vk::DeviceSize,
        instance_count: u32,
        min_offset_alignment: vk::DeviceSize,
    ) -> Self {
        Self {
            instance_size,
            instance_count,
            alignment_size: Self::alignment(instance_size, min_offset_alignment),
        }
    }

    /// Rounds `instance_size` up to a multiple of `min_offset_alignment`.
    ///
    /// An alignment of zero means the device imposes none.
    pub fn alignment(instance_size: vk::DeviceSize, min_offset_alignment: vk::DeviceSize) -> vk::DeviceSize {
        if min_offset_alignment > 0 {
            instance_size.div_ceil(min_offset_alignment) * min_offset_alignment
        } else {
            instance_size
        }
    }

    /// Total buffer size in bytes.
    #[inline]
    pub fn buffer_size(&self) -> vk::DeviceSize {
        self.alignment_size * vk::DeviceSize::from(self.instance_count)
    }

    /// Byte offset of instance `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below `instance_count`.
    pub fn index_offset(&self, index: u32) -> vk::DeviceSize {
        assert!(
            index < self.instance_count,
            "instance index {} out of range (count {})",
            index,
            self.instance_count
        );
        vk::DeviceSize::from(index) * self.alignment_size
    }

    /// Byte range touched by instance `index`.
    pub fn index_range(&self, index: u32) -> Range<vk::DeviceSize> {
        let start = self.index_offset(index);
        start..start + self.instance_size
    }
}

#[derive(Clone, Copy, Debug)]
struct Mapping {
    /// Start of the buffer's memory, not of the mapped range.
    base: NonNull<u8>,
    range: (vk::DeviceSize, vk::DeviceSize),
}

impl Mapping {
    fn contains(&self, offset: vk::DeviceSize, len: vk::DeviceSize) -> bool {
        let (start, size) = self.range;
        offset >= start && offset + len <= start + size
    }
}

/// GPU buffer holding indexed, alignment-padded instances.
///
/// The buffer is created with the requested memory properties and may be mapped for
/// host access. Writes take `&mut self`, so a mapped buffer is never aliased.
pub struct GpuBuffer {
    device: Arc<dyn GpuDevice>,
    buffer: vk::Buffer,
    layout: BufferLayout,
    usage_flags: vk::BufferUsageFlags,
    memory_property_flags: vk::MemoryPropertyFlags,
    mapped: Option<Mapping>,
}

// SAFETY: the mapped pointer is only dereferenced through `&mut self`, and the memory it
// points to lives until `Drop` destroys the buffer.
unsafe impl Send for GpuBuffer {}
// SAFETY: shared references never touch the mapped pointer.
unsafe impl Sync for GpuBuffer {}

impl GpuBuffer {
    /// Creates a buffer for `instance_count` instances of `instance_size` bytes.
    ///
    /// # Arguments
    ///
    /// * `device` - The device
    /// * `instance_size` - Bytes of data per instance
    /// * `instance_count` - Number of instances
    /// * `usage` - Vulkan buffer usage flags
    /// * `memory_properties` - Required memory properties
    /// * `min_offset_alignment` - Stride alignment, usually a device limit (0 for none)
    ///
    /// # Errors
    ///
    /// Returns an error if the size is zero or the device cannot provide memory with
    /// `memory_properties`.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        instance_size: vk::DeviceSize,
        instance_count: u32,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
        min_offset_alignment: vk::DeviceSize,
    ) -> RhiResult<Self> {
        let layout = BufferLayout::new(instance_size, instance_count, min_offset_alignment);
        if layout.buffer_size() == 0 {
            return Err(RhiError::InvalidHandle(
                "Buffer size must be greater than 0".to_string(),
            ));
        }

        let allocation = device.create_buffer(layout.buffer_size(), usage, memory_properties)?;

        debug!(
            "Created buffer: {} x {} bytes (stride {}, {} total)",
            instance_count,
            instance_size,
            layout.alignment_size,
            layout.buffer_size()
        );

        Ok(Self {
            device,
            buffer: allocation.buffer,
            layout,
            usage_flags: usage,
            memory_property_flags: allocation.memory_properties,
            mapped: None,
        })
    }

    /// Creates a buffer from a [`BufferUsage`] preset, aligning to the device limits.
    pub fn from_usage(
        device: Arc<dyn GpuDevice>,
        usage: BufferUsage,
        instance_size: vk::DeviceSize,
        instance_count: u32,
    ) -> RhiResult<Self> {
        let alignment = usage.min_offset_alignment(&device.limits());
        Self::new(
            device,
            instance_size,
            instance_count,
            usage.to_vk_usage(),
            usage.memory_properties(),
            alignment,
        )
    }

    /// Maps `[offset, offset + size)` for host access. `vk::WHOLE_SIZE` maps to the end.
    ///
    /// Remapping replaces the previous range.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::MemoryNotHostVisible`] if the memory cannot be mapped.
    ///
    /// # Panics
    ///
    /// Panics if the range extends past the end of the buffer.
    pub fn map(&mut self, size: vk::DeviceSize, offset: vk::DeviceSize) -> RhiResult<()> {
        let size = self.resolve_size(size, offset);
        if !self
            .memory_property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(RhiError::MemoryNotHostVisible);
        }

        self.unmap();
        let base = self.device.map_buffer(self.buffer)?;
        self.mapped = Some(Mapping {
            base,
            range: (offset, size),
        });
        Ok(())
    }

    /// Maps the whole buffer.
    pub fn map_all(&mut self) -> RhiResult<()> {
        self.map(vk::WHOLE_SIZE, 0)
    }

    /// Releases the host mapping. Does nothing if the buffer isn't mapped.
    pub fn unmap(&mut self) {
        if self.mapped.take().is_some() {
            self.device.unmap_buffer(self.buffer);
        }
    }

    /// Returns true while a host mapping exists.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Copies `data` to byte `offset` of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer isn't mapped or the write leaves the mapped range.
    pub fn write_to_buffer(&mut self, data: &[u8], offset: vk::DeviceSize) {
        let mapping = self
            .mapped
            .expect("write_to_buffer called on a buffer that is not mapped");
        let len = data.len() as vk::DeviceSize;
        assert!(
            mapping.contains(offset, len),
            "write of {} bytes at offset {} leaves mapped range {:?}",
            len,
            offset,
            mapping.range
        );

        // SAFETY: the range is inside the mapped region of a live buffer, and `&mut self`
        // rules out concurrent host access.
        unsafe {
            let dst = mapping.base.as_ptr().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
    }

    /// Copies `data` into instance `index`.
    ///
    /// # Panics
    ///
    /// Panics if `data` is larger than one instance, or as [`write_to_buffer`](Self::write_to_buffer).
    pub fn write_to_index(&mut self, data: &[u8], index: u32) {
        assert!(
            data.len() as vk::DeviceSize <= self.layout.instance_size,
            "{} bytes do not fit an instance of {} bytes",
            data.len(),
            self.layout.instance_size
        );
        let offset = self.layout.index_offset(index);
        self.write_to_buffer(data, offset);
    }

    /// Writes a plain-old-data value at byte `offset`.
    pub fn write_pod<T: bytemuck::Pod>(&mut self, value: &T, offset: vk::DeviceSize) {
        self.write_to_buffer(bytemuck::bytes_of(value), offset);
    }

    /// Writes a plain-old-data value into instance `index`.
    pub fn write_pod_to_index<T: bytemuck::Pod>(&mut self, value: &T, index: u32) {
        self.write_to_index(bytemuck::bytes_of(value), index);
    }

    /// Makes host writes in `[offset, offset + size)` visible to the device.
    ///
    /// Does nothing on host-coherent memory.
    pub fn flush(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> RhiResult<()> {
        if self.is_coherent() {
            return Ok(());
        }
        self.device.flush_buffer(self.buffer, offset, size)
    }

    /// Makes device writes in `[offset, offset + size)` visible to the host.
    ///
    /// Does nothing on host-coherent memory.
    pub fn invalidate(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> RhiResult<()> {
        if self.is_coherent() {
            return Ok(());
        }
        self.device.invalidate_buffer(self.buffer, offset, size)
    }

    /// Flushes instance `index`.
    pub fn flush_index(&self, index: u32) -> RhiResult<()> {
        self.flush(self.layout.instance_size, self.layout.index_offset(index))
    }

    /// Invalidates instance `index`.
    pub fn invalidate_index(&self, index: u32) -> RhiResult<()> {
        self.invalidate(self.layout.instance_size, self.layout.index_offset(index))
    }

    /// Descriptor info for `[offset, offset + size)`.
    pub fn descriptor_info(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset,
            range: size,
        }
    }

    /// Descriptor info covering instance `index`.
    pub fn descriptor_info_for_index(&self, index: u32) -> vk::DescriptorBufferInfo {
        self.descriptor_info(self.layout.instance_size, self.layout.index_offset(index))
    }

    /// Returns the Vulkan buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Returns the instance layout.
    #[inline]
    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    #[inline]
    pub fn instance_size(&self) -> vk::DeviceSize {
        self.layout.instance_size
    }

    #[inline]
    pub fn instance_count(&self) -> u32 {
        self.layout.instance_count
    }

    #[inline]
    pub fn alignment_size(&self) -> vk::DeviceSize {
        self.layout.alignment_size
    }

    #[inline]
    pub fn buffer_size(&self) -> vk::DeviceSize {
        self.layout.buffer_size()
    }

    #[inline]
    pub fn usage_flags(&self) -> vk::BufferUsageFlags {
        self.usage_flags
    }

    /// Properties of the memory actually backing the buffer.
    #[inline]
    pub fn memory_property_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_property_flags
    }

    fn is_coherent(&self) -> bool {
        self.memory_property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    fn resolve_size(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> vk::DeviceSize {
        let total = self.layout.buffer_size();
        assert!(
            offset <= total,
            "offset {} past end of {}-byte buffer",
            offset,
            total
        );
        if size == vk::WHOLE_SIZE {
            return total - offset;
        }
        assert!(
            offset + size <= total,
            "range [{}, {}) past end of {}-byte buffer",
            offset,
            offset + size,
            total
        );
        size
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.unmap();
        self.device.destroy_buffer(self.buffer);
        debug!("Destroyed buffer ({} bytes)", self.layout.buffer_size());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockEvent};
    use pretty_assertions::assert_eq;

    const UNIFORM: vk::BufferUsageFlags = vk::BufferUsageFlags::UNIFORM_BUFFER;

    fn host_visible(coherent: bool) -> vk::MemoryPropertyFlags {
        if coherent {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::HOST_VISIBLE
        }
    }

    #[test]
    fn test_layout_of_three_68_byte_instances() {
        let layout = BufferLayout::new(68, 3, 64);
        assert_eq!(layout.alignment_size, 128);
        assert_eq!(layout.buffer_size(), 384);
        assert_eq!(layout.index_range(1), 128..196);
    }

    #[test]
    fn test_alignment_properties() {
        for size in [1u64, 4, 63, 64, 65, 68, 200, 256, 1000] {
            for align in [1u64, 4, 16, 64, 256] {
                let aligned = BufferLayout::alignment(size, align);
                assert_eq!(aligned % align, 0, "size {size} align {align}");
                assert!(aligned >= size);
                assert!(aligned - size < align);
            }
        }
        assert_eq!(BufferLayout::alignment(68, 0), 68);
    }

    #[test]
    fn test_index_ranges_do_not_overlap() {
        let layout = BufferLayout::new(68, 5, 64);
        for i in 1..layout.instance_count {
            let prev = layout.index_range(i - 1);
            let next = layout.index_range(i);
            assert!(prev.end <= next.start);
            assert!(next.end <= layout.buffer_size());
        }
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_index_offset_out_of_range_panics() {
        BufferLayout::new(68, 3, 64).index_offset(3);
    }

    #[test]
    fn test_write_to_index_touches_only_its_range() {
        let mock = MockDevice::new();
        let mut buffer = GpuBuffer::new(mock.clone(), 68, 3, UNIFORM, host_visible(true), 64).unwrap();
        buffer.map_all().unwrap();
        buffer.write_to_index(&[0xAB; 68], 1);

        let contents = mock.buffer_contents(buffer.handle());
        assert_eq!(contents.len(), 384);
        for (i, byte) in contents.iter().enumerate() {
            let expected = if (128..196).contains(&i) { 0xAB } else { 0 };
            assert_eq!(*byte, expected, "byte {i}");
        }
    }

    #[test]
    fn test_write_pod_to_index() {
        let mock = MockDevice::new();
        let mut buffer = GpuBuffer::new(mock.clone(), 4, 2, UNIFORM, host_visible(true), 16).unwrap();
        buffer.map_all().unwrap();
        buffer.write_pod_to_index(&0x0102_0304u32, 1);
        let contents = mock.buffer_contents(buffer.handle());
        assert_eq!(&contents[16..20], &0x0102_0304u32.to_ne_bytes());
    }

    #[test]
    #[should_panic(expected = "not mapped")]
    fn test_write_unmapped_panics() {
        let mock = MockDevice::new();
        let mut buffer = GpuBuffer::new(mock, 16, 1, UNIFORM, host_visible(true), 0).unwrap();
        buffer.write_to_buffer(&[1, 2, 3], 0);
    }

    #[test]
    #[should_panic(expected = "leaves mapped range")]
    fn test_write_outside_mapped_range_panics() {
        let mock = MockDevice::new();
        let mut buffer = GpuBuffer::new(mock, 16, 4, UNIFORM, host_visible(true), 0).unwrap();
        buffer.map(16, 0).unwrap();
        buffer.write_to_buffer(&[0; 4], 14);
    }

    #[test]
    #[should_panic(expected = "do not fit")]
    fn test_write_to_index_larger_than_instance_panics() {
        let mock = MockDevice::new();
        let mut buffer = GpuBuffer::new(mock, 8, 2, UNIFORM, host_visible(true), 0).unwrap();
        buffer.map_all().unwrap();
        buffer.write_to_index(&[0; 9], 0);
    }

    #[test]
    fn test_map_device_local_fails() {
        let mock = MockDevice::new();
        let mut buffer = GpuBuffer::new(
            mock,
            64,
            1,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            0,
        )
        .unwrap();
        assert!(matches!(buffer.map_all(), Err(RhiError::MemoryNotHostVisible)));
        assert!(!buffer.is_mapped());
    }

    #[test]
    fn test_unsatisfiable_memory_properties_fail() {
        let mock = MockDevice::new();
        mock.set_supported_memory(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        let result = GpuBuffer::new(mock.clone(), 64, 1, UNIFORM, host_visible(true), 0);
        assert!(matches!(
            result,
            Err(RhiError::UnsupportedMemoryProperties(_))
        ));
        assert_eq!(mock.live_objects(), 0);
    }

    #[test]
    fn test_flush_is_noop_on_coherent_memory() {
        let mock = MockDevice::new();
        let buffer = GpuBuffer::new(mock.clone(), 68, 3, UNIFORM, host_visible(true), 64).unwrap();
        buffer.flush_index(1).unwrap();
        buffer.invalidate_index(1).unwrap();
        assert!(mock.events().is_empty());
    }

    #[test]
    fn test_flush_index_on_non_coherent_memory() {
        let mock = MockDevice::new();
        let buffer = GpuBuffer::new(mock.clone(), 68, 3, UNIFORM, host_visible(false), 64).unwrap();
        buffer.flush_index(1).unwrap();
        buffer.invalidate_index(2).unwrap();
        assert_eq!(
            mock.events(),
            vec![
                MockEvent::Flush {
                    buffer: buffer.handle(),
                    offset: 128,
                    size: 68,
                },
                MockEvent::Invalidate {
                    buffer: buffer.handle(),
                    offset: 256,
                    size: 68,
                },
            ]
        );
    }

    #[test]
    fn test_descriptor_info_for_index() {
        let mock = MockDevice::new();
        let buffer = GpuBuffer::new(mock, 68, 3, UNIFORM, host_visible(true), 64).unwrap();
        let info = buffer.descriptor_info_for_index(2);
        assert_eq!(info.buffer, buffer.handle());
        assert_eq!(info.offset, 256);
        assert_eq!(info.range, 68);
    }

    #[test]
    fn test_from_usage_uses_device_alignment() {
        let mock = MockDevice::new();
        let buffer = GpuBuffer::from_usage(mock.clone(), BufferUsage::Uniform, 68, 2).unwrap();
        assert_eq!(buffer.alignment_size(), 256);
        assert_eq!(buffer.buffer_size(), 512);
        assert!(buffer.usage_flags().contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
    }

    #[test]
    fn test_drop_releases_buffer() {
        let mock = MockDevice::new();
        {
            let mut buffer = GpuBuffer::new(mock.clone(), 16, 1, UNIFORM, host_visible(true), 0).unwrap();
            buffer.map_all().unwrap();
            assert_eq!(mock.live_objects(), 1);
        }
        assert_eq!(mock.live_objects(), 0);
    }

    #[test]
    fn test_buffer_usage_presets() {
        assert!(
            BufferUsage::Vertex
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::VERTEX_BUFFER)
        );
        assert!(
            BufferUsage::Staging
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::TRANSFER_SRC)
        );
        assert_eq!(
            BufferUsage::Storage.memory_properties(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        );
        assert!(
            BufferUsage::Uniform
                .memory_properties()
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        );
        assert_eq!(BufferUsage::Index.name(), "index");
        assert_eq!(
            BufferUsage::Vertex.min_offset_alignment(&DeviceLimits::default()),
            1
        );
    }
}
