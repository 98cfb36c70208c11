//! Vulkan logical device and queue management.
//!
//! This module handles VkDevice creation, queue retrieval, gpu-allocator initialization,
//! and the [`GpuDevice`] implementation the rest of the workspace runs on.
//!
//! # Overview
//!
//! The [`Device`] owns:
//! - the logical device with `VK_KHR_swapchain` enabled
//! - one graphics queue and one present queue (possibly the same queue)
//! - the swapchain loader bound to the window surface
//! - a gpu-allocator [`Allocator`] plus the allocations backing every buffer and
//!   attachment image created through [`GpuDevice`]
//!
//! # Example
//!
//! ```no_run
//! use frameline_rhi::device::Device;
//! use frameline_rhi::instance::Instance;
//! use frameline_rhi::physical_device::select_physical_device;
//! use ash::vk;
//!
//! let instance = Instance::new("demo", false, &[]).expect("Failed to create instance");
//! let surface: vk::SurfaceKHR = vk::SurfaceKHR::null(); // normally from the window
//! let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
//!
//! let info = select_physical_device(instance.handle(), surface, &surface_loader)
//!     .expect("No suitable GPU found");
//! let device = Device::new(&instance, &info, surface).expect("Failed to create device");
//! ```

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use tracing::{debug, error, info, warn};

use crate::error::{RhiError, RhiResult};
use crate::gpu::{
    BufferAllocation, DescriptorResource, DescriptorWrite, DeviceLimits, GpuDevice, QueueSubmit,
    RenderPassBegin, SwapchainDesc,
};
use crate::instance::Instance;
use crate::physical_device::{PhysicalDeviceInfo, QueueFamilyIndices};
use crate::swapchain::SwapchainSupportDetails;

/// Required device extensions.
const DEVICE_EXTENSIONS: &[&std::ffi::CStr] = &[ash::khr::swapchain::NAME];

/// Vulkan logical device wrapper.
///
/// # Thread Safety
///
/// Shared across threads through `Arc`. The allocator and the allocation tables are
/// protected by `Mutex`es.
pub struct Device {
    device: ash::Device,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    buffer_allocations: Mutex<HashMap<vk::Buffer, Allocation>>,
    image_allocations: Mutex<HashMap<vk::Image, Allocation>>,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    queue_families: QueueFamilyIndices,
    limits: DeviceLimits,
}

impl Device {
    /// Creates a new logical device bound to the window surface.
    ///
    /// # Arguments
    ///
    /// * `instance` - The Vulkan instance
    /// * `physical_device_info` - The GPU picked by
    ///   [`select_physical_device`](crate::physical_device::select_physical_device)
    /// * `surface` - The window surface; must outlive the device
    ///
    /// # Errors
    ///
    /// Returns an error if device creation or allocator initialization fails.
    pub fn new(
        instance: &Instance,
        physical_device_info: &PhysicalDeviceInfo,
        surface: vk::SurfaceKHR,
    ) -> Result<Arc<Self>, RhiError> {
        let queue_families = physical_device_info.queue_families;
        let (Some(graphics_family), Some(present_family)) =
            (queue_families.graphics_family, queue_families.present_family)
        else {
            return Err(RhiError::NoSuitableGpu);
        };

        let queue_priorities = [1.0f32];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extension_names: Vec<*const std::ffi::c_char> =
            DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features);

        // SAFETY: the physical device belongs to `instance`; create_info outlives the call.
        let device = unsafe {
            instance
                .handle()
                .create_device(physical_device_info.device, &create_info, None)?
        };
        info!(
            "Logical device created with {} extension(s)",
            DEVICE_EXTENSIONS.len()
        );

        // SAFETY: both families were requested with one queue each.
        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };
        debug!(
            "Queues retrieved: graphics family {}, present family {}",
            graphics_family, present_family
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: physical_device_info.device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;
        info!("GPU memory allocator initialized");

        let hw = physical_device_info.properties.limits;
        let limits = DeviceLimits {
            min_uniform_buffer_offset_alignment: hw.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: hw.min_storage_buffer_offset_alignment,
            non_coherent_atom_size: hw.non_coherent_atom_size,
        };

        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
        let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), &device);

        Ok(Arc::new(Self {
            device,
            instance: instance.handle().clone(),
            physical_device: physical_device_info.device,
            surface,
            surface_loader,
            swapchain_loader,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            buffer_allocations: Mutex::new(HashMap::new()),
            image_allocations: Mutex::new(HashMap::new()),
            graphics_queue,
            present_queue,
            queue_families,
            limits,
        }))
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Returns the physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Returns the graphics queue handle.
    #[inline]
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Returns the presentation queue handle.
    #[inline]
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Returns the queue family indices.
    #[inline]
    pub fn queue_families(&self) -> &QueueFamilyIndices {
        &self.queue_families
    }

    fn allocator(&self) -> MutexGuard<'_, Allocator> {
        // A poisoned allocator only means another thread panicked mid-allocation;
        // the allocator's own state is still consistent.
        self.allocator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
    ) -> RhiResult<Allocation> {
        Ok(self.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?)
    }

    fn free(&self, allocation: Allocation) {
        if let Err(e) = self.allocator().free(allocation) {
            error!("Failed to free GPU allocation: {:?}", e);
        }
    }

    /// Builds the memory range for a flush or invalidate, widened to the atom size.
    fn mapped_range(
        &self,
        allocation: &Allocation,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> vk::MappedMemoryRange<'static> {
        let (start, size) = atom_aligned_range(
            allocation.offset(),
            allocation.size(),
            offset,
            size,
            self.limits.non_coherent_atom_size,
        );
        vk::MappedMemoryRange::default()
            // SAFETY: the allocation is live while it sits in the allocation table.
            .memory(unsafe { allocation.memory() })
            .offset(start)
            .size(size)
    }

    fn with_buffer_range(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        op: impl FnOnce(&vk::MappedMemoryRange<'_>) -> Result<(), vk::Result>,
    ) -> RhiResult<()> {
        let allocations = lock(&self.buffer_allocations);
        let allocation = allocations
            .get(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown buffer {:?}", buffer)))?;
        if allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }
        let range = self.mapped_range(allocation, offset, size);
        op(&range)?;
        Ok(())
    }
}

/// Locks a table mutex, recovering the data on poison.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Maps requested memory properties onto a gpu-allocator location.
fn memory_location(properties: vk::MemoryPropertyFlags) -> MemoryLocation {
    if !properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        MemoryLocation::GpuOnly
    } else if properties.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
        MemoryLocation::GpuToCpu
    } else {
        MemoryLocation::CpuToGpu
    }
}

impl GpuDevice for Device {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn surface_support(&self) -> RhiResult<SwapchainSupportDetails> {
        SwapchainSupportDetails::query(self.physical_device, self.surface, &self.surface_loader)
    }

    fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> RhiResult<vk::Format> {
        candidates
            .iter()
            .copied()
            .find(|&format| {
                // SAFETY: the physical device belongs to the instance.
                let props = unsafe {
                    self.instance
                        .get_physical_device_format_properties(self.physical_device, format)
                };
                match tiling {
                    vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                    vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
                    _ => false,
                }
            })
            .ok_or_else(|| RhiError::UnsupportedFormat(candidates.to_vec()))
    }

    fn wait_idle(&self) -> RhiResult<()> {
        // SAFETY: the device is valid.
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        // SAFETY: the device is valid.
        Ok(unsafe { self.device.create_semaphore(&create_info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: the owner guarantees no pending queue operation references it.
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: the device is valid.
        Ok(unsafe { self.device.create_fence(&create_info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        // SAFETY: the owner waited on the fence before dropping it.
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> RhiResult<()> {
        // SAFETY: the fences were created on this device.
        unsafe { self.device.wait_for_fences(fences, true, timeout)? };
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        // SAFETY: the fences are not pending on any queue (callers wait first).
        unsafe { self.device.reset_fences(fences)? };
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        // SAFETY: the fence was created on this device.
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn create_command_pool(&self) -> RhiResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.queue_families.graphics_family.unwrap_or(0));
        // SAFETY: the device is valid.
        let pool = unsafe { self.device.create_command_pool(&create_info, None)? };
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: no command buffer from this pool is pending.
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        // SAFETY: the pool was created on this device.
        Ok(unsafe { self.device.allocate_command_buffers(&allocate_info)? })
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        // SAFETY: none of the buffers is pending execution.
        unsafe { self.device.free_command_buffers(pool, buffers) };
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        // SAFETY: the pool allows per-buffer reset and the buffer is not pending.
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?
        };
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: the buffer is in the initial state.
        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)?
        };
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        // SAFETY: the buffer is recording.
        unsafe { self.device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin<'_>) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: begin.extent,
            })
            .clear_values(begin.clear_values);
        // SAFETY: the buffer is recording outside a render pass.
        unsafe {
            self.device.cmd_begin_render_pass(
                command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            )
        };
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        // SAFETY: the buffer is recording inside a render pass.
        unsafe { self.device.cmd_end_render_pass(command_buffer) };
    }

    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        // SAFETY: the buffer is recording.
        unsafe { self.device.cmd_set_viewport(command_buffer, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        // SAFETY: the buffer is recording.
        unsafe { self.device.cmd_set_scissor(command_buffer, 0, &[scissor]) };
    }

    fn queue_submit(&self, submit: &QueueSubmit<'_>, fence: vk::Fence) -> RhiResult<()> {
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(submit.wait_semaphores)
            .wait_dst_stage_mask(submit.wait_stages)
            .command_buffers(submit.command_buffers)
            .signal_semaphores(submit.signal_semaphores);
        // SAFETY: all handles were created on this device and the fence is unsignaled.
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], fence)?
        };
        Ok(())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RhiResult<vk::SwapchainKHR> {
        let graphics = self.queue_families.graphics_family.unwrap_or(0);
        let present = self.queue_families.present_family.unwrap_or(graphics);
        let family_indices = [graphics, present];
        let (sharing_mode, family_slice) = if graphics != present {
            (vk::SharingMode::CONCURRENT, &family_indices[..])
        } else {
            (vk::SharingMode::EXCLUSIVE, &[][..])
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.surface_format.format)
            .image_color_space(desc.surface_format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(family_slice)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);

        // SAFETY: the surface outlives the device; old_swapchain is null or live.
        Ok(unsafe { self.swapchain_loader.create_swapchain(&create_info, None)? })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        // SAFETY: no image of this swapchain is in use by pending work.
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>> {
        // SAFETY: the swapchain is live.
        Ok(unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? })
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        // SAFETY: the semaphore is unsignaled with no pending signal operation.
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout, semaphore, vk::Fence::null())
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        // SAFETY: the image was acquired and the semaphore has a pending signal.
        unsafe {
            self.swapchain_loader
                .queue_present(self.present_queue, &present_info)
        }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> RhiResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        // SAFETY: the image is live.
        Ok(unsafe { self.device.create_image_view(&create_info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        // SAFETY: no framebuffer using the view is referenced by pending work.
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_attachment_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> RhiResult<vk::Image> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: the device is valid.
        let image = unsafe { self.device.create_image(&create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate("attachment", requirements, MemoryLocation::GpuOnly) {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: the image has no memory bound and is unused.
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        // SAFETY: the allocation satisfies the image's requirements.
        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            self.free(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(e.into());
        }

        lock(&self.image_allocations).insert(image, allocation);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        // SAFETY: views of the image were destroyed first.
        unsafe { self.device.destroy_image(image, None) };
        if let Some(allocation) = lock(&self.image_allocations).remove(&image) {
            self.free(allocation);
        }
    }

    fn create_render_pass(
        &self,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> RhiResult<vk::RenderPass> {
        let attachments = [
            vk::AttachmentDescription::default()
                .format(color_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
            vk::AttachmentDescription::default()
                .format(depth_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        ];

        let color_refs = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
        let depth_ref = vk::AttachmentReference::default()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)];

        // Attachment writes wait for the previous frame's use of the same image.
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependencies = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(stages)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        // SAFETY: all referenced arrays outlive the call.
        Ok(unsafe { self.device.create_render_pass(&create_info, None)? })
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        // SAFETY: no pending work uses the render pass.
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> RhiResult<vk::Framebuffer> {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        // SAFETY: the views are compatible with the render pass.
        Ok(unsafe { self.device.create_framebuffer(&create_info, None)? })
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        // SAFETY: no pending work uses the framebuffer.
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> RhiResult<BufferAllocation> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the device is valid.
        let buffer = unsafe { self.device.create_buffer(&create_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate("buffer", requirements, memory_location(properties)) {
            Ok(allocation) if allocation.memory_properties().contains(properties) => allocation,
            Ok(allocation) => {
                warn!(
                    "Memory type {:?} lacks requested properties {:?}",
                    allocation.memory_properties(),
                    properties
                );
                self.free(allocation);
                // SAFETY: the buffer has no memory bound and is unused.
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(RhiError::UnsupportedMemoryProperties(properties));
            }
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        // SAFETY: the allocation satisfies the buffer's requirements.
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        let memory_properties = allocation.memory_properties();
        lock(&self.buffer_allocations).insert(buffer, allocation);
        Ok(BufferAllocation {
            buffer,
            memory_properties,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: the owner guarantees the buffer is not referenced by pending work.
        unsafe { self.device.destroy_buffer(buffer, None) };
        if let Some(allocation) = lock(&self.buffer_allocations).remove(&buffer) {
            self.free(allocation);
        }
    }

    fn map_buffer(&self, buffer: vk::Buffer) -> RhiResult<NonNull<u8>> {
        // Host-visible allocations are persistently mapped by gpu-allocator.
        lock(&self.buffer_allocations)
            .get(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown buffer {:?}", buffer)))?
            .mapped_ptr()
            .map(NonNull::cast)
            .ok_or(RhiError::MemoryNotHostVisible)
    }

    fn unmap_buffer(&self, _buffer: vk::Buffer) {
        // The persistent mapping ends when the allocation is freed.
    }

    fn flush_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> RhiResult<()> {
        self.with_buffer_range(buffer, offset, size, |range| {
            // SAFETY: the range lies within a mapped allocation.
            unsafe {
                self.device
                    .flush_mapped_memory_ranges(std::slice::from_ref(range))
            }
        })
    }

    fn invalidate_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> RhiResult<()> {
        self.with_buffer_range(buffer, offset, size, |range| {
            // SAFETY: the range lies within a mapped allocation.
            unsafe {
                self.device
                    .invalidate_mapped_memory_ranges(std::slice::from_ref(range))
            }
        })
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        // SAFETY: the bindings outlive the call.
        Ok(unsafe {
            self.device
                .create_descriptor_set_layout(&create_info, None)?
        })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        // SAFETY: the layout was created on this device.
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        flags: vk::DescriptorPoolCreateFlags,
    ) -> RhiResult<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(flags)
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        // SAFETY: the pool sizes outlive the call.
        Ok(unsafe { self.device.create_descriptor_pool(&create_info, None)? })
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: no set from the pool is used by pending work.
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        // SAFETY: no set from the pool is used by pending work.
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?
        };
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let layouts = [layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        // SAFETY: the pool and layout were created on this device.
        let sets = unsafe { self.device.allocate_descriptor_sets(&allocate_info)? };
        sets.into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
    }

    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> RhiResult<()> {
        // SAFETY: the pool was created with FREE_DESCRIPTOR_SET.
        unsafe { self.device.free_descriptor_sets(pool, sets)? };
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let vk_writes: Vec<vk::WriteDescriptorSet<'_>> = writes
            .iter()
            .map(|write| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .dst_array_element(0)
                    .descriptor_type(write.descriptor_type);
                match &write.resource {
                    DescriptorResource::Buffer(info) => {
                        base.buffer_info(std::slice::from_ref(info))
                    }
                    DescriptorResource::Image(info) => base.image_info(std::slice::from_ref(info)),
                }
            })
            .collect();
        // SAFETY: the referenced infos live in `writes` for the duration of the call.
        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // SAFETY: the device is valid until destroy_device below.
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
        }

        let leaked_buffers: Vec<Allocation> = lock(&self.buffer_allocations)
            .drain()
            .map(|(_, a)| a)
            .collect();
        let leaked_images: Vec<Allocation> = lock(&self.image_allocations)
            .drain()
            .map(|(_, a)| a)
            .collect();
        if !leaked_buffers.is_empty() || !leaked_images.is_empty() {
            warn!(
                "Device dropped with {} buffer and {} image allocation(s) still live",
                leaked_buffers.len(),
                leaked_images.len()
            );
        }
        for allocation in leaked_buffers.into_iter().chain(leaked_images) {
            self.free(allocation);
        }

        // SAFETY: the allocator must go before the device it allocates from, and is never
        // touched again.
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

// SAFETY: ash::Device and the loaders are Send + Sync; raw handles are plain values;
// the allocator and allocation tables are behind Mutexes.
/// Widens `[offset, offset + size)` of an allocation placed at `allocation_offset` in its
/// memory object to whole atoms.
///
/// Returns the start within the memory object and the range size. A range whose rounded end
/// reaches the end of the allocation uses `vk::WHOLE_SIZE`, since rounding could otherwise
/// run past the memory object.
fn atom_aligned_range(
    allocation_offset: vk::DeviceSize,
    allocation_size: vk::DeviceSize,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    atom: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let atom = atom.max(1);
    let size = if size == vk::WHOLE_SIZE {
        allocation_size.saturating_sub(offset)
    } else {
        size
    };
    let start = (allocation_offset + offset) / atom * atom;
    let end = (allocation_offset + offset + size).div_ceil(atom) * atom;
    if end >= allocation_offset + allocation_size {
        (start, vk::WHOLE_SIZE)
    } else {
        (start, end - start)
    }
}

unsafe impl Send for Device {}
unsafe impl Sync for Device {}
