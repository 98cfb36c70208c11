//! The device seam used by everything above raw Vulkan.
//!
//! # Overview
//!
//! [`GpuDevice`] is the set of device operations the presentation chain, frame manager,
//! GPU buffers and descriptor layer need. [`Device`](crate::device::Device) implements it
//! on top of `ash` and `gpu-allocator`; the `mock` feature provides a recording
//! implementation that checks the frame synchronization protocol without a GPU.
//!
//! Handles cross the seam as plain `vk::*` values. Ownership stays with the RAII wrappers
//! in this crate ([`GpuBuffer`](crate::buffer::GpuBuffer), [`Fence`](crate::sync::Fence),
//! [`Swapchain`](crate::swapchain::Swapchain), ...), which call the matching `destroy_*`
//! method on drop.
//!
//! Results of `acquire_next_image` and `queue_present` are returned as raw `vk::Result`
//! so callers can tell out-of-date from fatal errors.

use std::ptr::NonNull;

use ash::vk;

use crate::error::RhiResult;
use crate::swapchain::SwapchainSupportDetails;

/// Device limits the core depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Required alignment of dynamic uniform buffer offsets.
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
    /// Required alignment of storage buffer offsets.
    pub min_storage_buffer_offset_alignment: vk::DeviceSize,
    /// Granularity of flush/invalidate ranges on non-coherent memory.
    pub non_coherent_atom_size: vk::DeviceSize,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 256,
            non_coherent_atom_size: 64,
        }
    }
}

/// Parameters for creating a swapchain.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainDesc {
    /// Color format and color space of the presentable images.
    pub surface_format: vk::SurfaceFormatKHR,
    /// Presentation mode.
    pub present_mode: vk::PresentModeKHR,
    /// Image extent.
    pub extent: vk::Extent2D,
    /// Requested number of images.
    pub min_image_count: u32,
    /// Surface transform reported by the surface capabilities.
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Swapchain being replaced, or null.
    pub old_swapchain: vk::SwapchainKHR,
}

/// A single queue submission.
#[derive(Clone, Copy, Debug)]
pub struct QueueSubmit<'a> {
    /// Command buffers to execute.
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphores waited on before execution.
    pub wait_semaphores: &'a [vk::Semaphore],
    /// Pipeline stage at which each wait semaphore is waited on.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    /// Semaphores signaled when execution completes.
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Parameters for beginning a render pass instance.
#[derive(Clone, Copy)]
pub struct RenderPassBegin<'a> {
    /// Render pass to begin.
    pub render_pass: vk::RenderPass,
    /// Framebuffer of the acquired image.
    pub framebuffer: vk::Framebuffer,
    /// Render area, starting at the origin.
    pub extent: vk::Extent2D,
    /// One clear value per attachment.
    pub clear_values: &'a [vk::ClearValue],
}

/// A freshly created buffer and the properties of the memory actually bound to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferAllocation {
    /// Buffer handle.
    pub buffer: vk::Buffer,
    /// Properties of the memory type backing the buffer.
    pub memory_properties: vk::MemoryPropertyFlags,
}

/// Resource referenced by a descriptor write.
#[derive(Clone, Copy, Debug)]
pub enum DescriptorResource {
    /// Uniform or storage buffer range.
    Buffer(vk::DescriptorBufferInfo),
    /// Sampled image, storage image or sampler.
    Image(vk::DescriptorImageInfo),
}

/// One descriptor to write into a set.
#[derive(Clone, Copy, Debug)]
pub struct DescriptorWrite {
    /// Destination set.
    pub set: vk::DescriptorSet,
    /// Destination binding.
    pub binding: u32,
    /// Descriptor type declared for the binding.
    pub descriptor_type: vk::DescriptorType,
    /// Resource to bind.
    pub resource: DescriptorResource,
}

/// Device operations required by the frame pipeline.
///
/// Implementations must be shareable across threads; the core itself drives them from a
/// single submission thread.
pub trait GpuDevice: Send + Sync {
    /// Returns the limits relevant to buffer layout and flushing.
    fn limits(&self) -> DeviceLimits;

    /// Queries surface capabilities, formats and present modes.
    fn surface_support(&self) -> RhiResult<SwapchainSupportDetails>;

    /// Returns the first candidate format supporting `features` with the given tiling.
    fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> RhiResult<vk::Format>;

    /// Blocks until the device has finished all submitted work.
    fn wait_idle(&self) -> RhiResult<()>;

    // Synchronization

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Waits until all `fences` are signaled. `vk::Result::TIMEOUT` is an error here.
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> RhiResult<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()>;
    /// Returns true if the fence is signaled, without blocking.
    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool>;

    // Commands

    fn create_command_pool(&self) -> RhiResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;
    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin<'_>);
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);
    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport);
    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D);

    /// Submits work to the graphics queue, signaling `fence` on completion.
    fn queue_submit(&self, submit: &QueueSubmit<'_>, fence: vk::Fence) -> RhiResult<()>;

    // Presentation

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RhiResult<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>>;
    /// Returns `(image_index, suboptimal)`.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result>;
    /// Presents on the present queue. Returns true if the swapchain is suboptimal.
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result>;

    // Images and attachments

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> RhiResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Creates a device-local 2D image with bound memory.
    fn create_attachment_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> RhiResult<vk::Image>;
    /// Destroys an image created by `create_attachment_image` and frees its memory.
    fn destroy_image(&self, image: vk::Image);
    /// Creates a single-subpass render pass with one color and one depth attachment.
    fn create_render_pass(
        &self,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> RhiResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> RhiResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Buffers

    /// Creates a buffer bound to memory with at least `properties`.
    ///
    /// Fails with [`RhiError::UnsupportedMemoryProperties`](crate::RhiError::UnsupportedMemoryProperties)
    /// if no memory type provides them.
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> RhiResult<BufferAllocation>;
    /// Destroys the buffer and frees its memory.
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// Returns a host pointer to the start of the buffer's memory.
    fn map_buffer(&self, buffer: vk::Buffer) -> RhiResult<NonNull<u8>>;
    fn unmap_buffer(&self, buffer: vk::Buffer);
    fn flush_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> RhiResult<()>;
    fn invalidate_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> RhiResult<()>;

    // Descriptors

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        flags: vk::DescriptorPoolCreateFlags,
    ) -> RhiResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()>;
    /// Allocates one set. Pool exhaustion comes back as the raw `vk::Result`.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result>;
    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> RhiResult<()>;
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);
}
