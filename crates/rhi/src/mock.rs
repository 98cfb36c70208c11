//! Recording [`GpuDevice`] for tests.
//!
//! [`MockDevice`] hands out fake handles, keeps host-side memory for buffers, and models
//! just enough queue behavior to check the frame synchronization protocol:
//!
//! - a fence submitted with work is *pending* until it is waited on or the device idles
//! - waiting on a fence nobody submitted returns `TIMEOUT` instead of hanging
//! - submissions must wait on a semaphore signaled by a successful acquire, and present
//!   must wait on a semaphore signaled by a submission
//! - beginning a command buffer whose last submission is still pending panics
//! - resetting a pending fence panics
//!
//! Acquire and present results can be scripted to simulate resizes and surface changes.
//! Every call of interest is appended to an event log.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk::{self, Handle};

use crate::error::{RhiError, RhiResult};
use crate::gpu::{
    BufferAllocation, DescriptorWrite, DeviceLimits, GpuDevice, QueueSubmit, RenderPassBegin,
    SwapchainDesc,
};
use crate::swapchain::SwapchainSupportDetails;

/// Kinds of objects whose lifetime the mock tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Semaphore,
    Fence,
    CommandPool,
    CommandBuffer,
    Swapchain,
    Image,
    ImageView,
    RenderPass,
    Framebuffer,
    Buffer,
    DescriptorSetLayout,
    DescriptorPool,
}

/// Calls recorded by the mock, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockEvent {
    WaitIdle,
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    AllocateCommandBuffers(u32),
    FreeCommandBuffers(usize),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    },
    EndRenderPass,
    SetViewport(vk::Extent2D),
    SetScissor(vk::Extent2D),
    Submit {
        command_buffers: Vec<vk::CommandBuffer>,
        wait: Vec<vk::Semaphore>,
        signal: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    Acquire {
        image_index: u32,
    },
    AcquireFailed(vk::Result),
    Present {
        image_index: u32,
        wait: vk::Semaphore,
    },
    CreateSwapchain {
        swapchain: vk::SwapchainKHR,
        extent: vk::Extent2D,
        image_count: u32,
        old: vk::SwapchainKHR,
    },
    DestroySwapchain(vk::SwapchainKHR),
    Flush {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    },
    Invalidate {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

struct MockSwapchain {
    images: Vec<vk::Image>,
    next_image: u32,
}

struct MockBuffer {
    memory: Box<[u8]>,
    properties: vk::MemoryPropertyFlags,
}

struct MockPool {
    max_sets: u32,
    allocated: u32,
}

struct MockState {
    next_handle: u64,
    live: HashMap<u64, ObjectKind>,
    fences: HashMap<vk::Fence, FenceState>,
    signaled_semaphores: HashSet<vk::Semaphore>,
    pool_of: HashMap<vk::CommandBuffer, vk::CommandPool>,
    last_fence: HashMap<vk::CommandBuffer, vk::Fence>,
    recording: HashSet<vk::CommandBuffer>,
    swapchains: HashMap<vk::SwapchainKHR, MockSwapchain>,
    buffers: HashMap<vk::Buffer, MockBuffer>,
    descriptor_pools: HashMap<vk::DescriptorPool, MockPool>,
    descriptor_writes: Vec<DescriptorWrite>,
    surface: SwapchainSupportDetails,
    supported_memory: vk::MemoryPropertyFlags,
    depth_formats: Vec<vk::Format>,
    acquire_script: VecDeque<Result<bool, vk::Result>>,
    present_script: VecDeque<Result<bool, vk::Result>>,
    device_lost: bool,
    events: Vec<MockEvent>,
}

impl MockState {
    fn alloc<H: Handle>(&mut self, kind: ObjectKind) -> H {
        self.next_handle += 1;
        self.live.insert(self.next_handle, kind);
        H::from_raw(self.next_handle)
    }

    fn release<H: Handle>(&mut self, handle: H) {
        self.live.remove(&handle.as_raw());
    }
}

/// A [`GpuDevice`] that records calls and checks the synchronization protocol.
pub struct MockDevice {
    state: Mutex<MockState>,
    limits: DeviceLimits,
}

impl MockDevice {
    /// Creates a mock with a 800x600 surface allowing 2..=3 images, FIFO and MAILBOX, and
    /// `B8G8R8A8_SRGB` / `B8G8R8A8_UNORM` formats.
    pub fn new() -> Arc<Self> {
        Self::with_surface(Self::default_surface())
    }

    /// Creates a mock presenting to a surface with the given support details.
    pub fn with_surface(surface: SwapchainSupportDetails) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_handle: 0,
                live: HashMap::new(),
                fences: HashMap::new(),
                signaled_semaphores: HashSet::new(),
                pool_of: HashMap::new(),
                last_fence: HashMap::new(),
                recording: HashSet::new(),
                swapchains: HashMap::new(),
                buffers: HashMap::new(),
                descriptor_pools: HashMap::new(),
                descriptor_writes: Vec::new(),
                surface,
                supported_memory: vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_CACHED,
                depth_formats: vec![vk::Format::D32_SFLOAT, vk::Format::D24_UNORM_S8_UINT],
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                device_lost: false,
                events: Vec::new(),
            }),
            limits: DeviceLimits::default(),
        })
    }

    /// Surface details used by [`MockDevice::new`].
    pub fn default_surface() -> SwapchainSupportDetails {
        SwapchainSupportDetails {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 3,
                current_extent: vk::Extent2D {
                    width: 800,
                    height: 600,
                },
                min_image_extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                max_image_extent: vk::Extent2D {
                    width: 4096,
                    height: 4096,
                },
                max_image_array_layers: 1,
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    /// Upcasts to the trait object used by the rest of the crate.
    pub fn as_device(self: &Arc<Self>) -> Arc<dyn GpuDevice> {
        self.clone()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // Recover from poison so a failed assertion in one call doesn't turn every
        // later Drop into a double panic.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues the result of a future `acquire_next_image` call. `Ok(true)` is suboptimal.
    pub fn script_acquire(&self, result: Result<bool, vk::Result>) {
        self.state().acquire_script.push_back(result);
    }

    /// Queues the result of a future `queue_present` call. `Ok(true)` is suboptimal.
    pub fn script_present(&self, result: Result<bool, vk::Result>) {
        self.state().present_script.push_back(result);
    }

    /// Changes the extent the surface reports from now on.
    pub fn set_surface_extent(&self, extent: vk::Extent2D) {
        self.state().surface.capabilities.current_extent = extent;
    }

    /// Changes the formats the surface reports from now on.
    pub fn set_surface_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state().surface.formats = formats;
    }

    /// Restricts which memory properties buffer allocations can satisfy.
    pub fn set_supported_memory(&self, properties: vk::MemoryPropertyFlags) {
        self.state().supported_memory = properties;
    }

    /// Makes every later fence wait, submit and acquire report device loss.
    pub fn set_device_lost(&self) {
        self.state().device_lost = true;
    }

    /// Number of live objects of every kind.
    pub fn live_objects(&self) -> usize {
        self.state().live.len()
    }

    /// Number of live objects of one kind.
    pub fn live_objects_of(&self, kind: ObjectKind) -> usize {
        self.state().live.values().filter(|&&k| k == kind).count()
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<MockEvent> {
        self.state().events.clone()
    }

    /// Empties the event log.
    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Descriptor writes applied so far, in order.
    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.state().descriptor_writes.clone()
    }

    /// Copy of a buffer's backing memory.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.state()
            .buffers
            .get(&buffer)
            .map(|b| b.memory.to_vec())
            .unwrap_or_default()
    }

    /// Marks every pending fence as signaled, as if the GPU caught up.
    pub fn complete_all(&self) {
        for state in self.state().fences.values_mut() {
            if *state == FenceState::Pending {
                *state = FenceState::Signaled;
            }
        }
    }
}

impl GpuDevice for MockDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn surface_support(&self) -> RhiResult<SwapchainSupportDetails> {
        Ok(self.state().surface.clone())
    }

    fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        _tiling: vk::ImageTiling,
        _features: vk::FormatFeatureFlags,
    ) -> RhiResult<vk::Format> {
        let state = self.state();
        candidates
            .iter()
            .copied()
            .find(|f| state.depth_formats.contains(f))
            .ok_or_else(|| RhiError::UnsupportedFormat(candidates.to_vec()))
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.state().events.push(MockEvent::WaitIdle);
        self.complete_all();
        Ok(())
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        Ok(self.state().alloc(ObjectKind::Semaphore))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state();
        state.signaled_semaphores.remove(&semaphore);
        state.release(semaphore);
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let mut state = self.state();
        let fence = state.alloc(ObjectKind::Fence);
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(fence, initial);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state();
        state.fences.remove(&fence);
        state.release(fence);
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout: u64) -> RhiResult<()> {
        let mut state = self.state();
        if state.device_lost {
            return Err(RhiError::DeviceLost);
        }
        for &fence in fences {
            state.events.push(MockEvent::WaitFence(fence));
            match state.fences.get_mut(&fence) {
                Some(s @ FenceState::Pending) => *s = FenceState::Signaled,
                Some(FenceState::Signaled) => {}
                Some(FenceState::Unsignaled) => return Err(vk::Result::TIMEOUT.into()),
                None => return Err(RhiError::InvalidHandle(format!("{:?}", fence))),
            }
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        let mut state = self.state();
        for &fence in fences {
            state.events.push(MockEvent::ResetFence(fence));
            let s = state
                .fences
                .get_mut(&fence)
                .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", fence)))?;
            assert!(
                *s != FenceState::Pending,
                "fence {:?} reset while its submission is still pending",
                fence
            );
            *s = FenceState::Unsignaled;
        }
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        let state = self.state();
        if state.device_lost {
            return Err(RhiError::DeviceLost);
        }
        Ok(state.fences.get(&fence) == Some(&FenceState::Signaled))
    }

    fn create_command_pool(&self) -> RhiResult<vk::CommandPool> {
        Ok(self.state().alloc(ObjectKind::CommandPool))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state();
        let owned: Vec<vk::CommandBuffer> = state
            .pool_of
            .iter()
            .filter(|&(_, &p)| p == pool)
            .map(|(&cb, _)| cb)
            .collect();
        for cb in owned {
            state.pool_of.remove(&cb);
            state.release(cb);
        }
        state.release(pool);
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state();
        state.events.push(MockEvent::AllocateCommandBuffers(count));
        Ok((0..count)
            .map(|_| {
                let cb: vk::CommandBuffer = state.alloc(ObjectKind::CommandBuffer);
                state.pool_of.insert(cb, pool);
                cb
            })
            .collect())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state();
        state.events.push(MockEvent::FreeCommandBuffers(buffers.len()));
        for &cb in buffers {
            if let Some(&fence) = state.last_fence.get(&cb) {
                assert!(
                    state.fences.get(&fence) != Some(&FenceState::Pending),
                    "command buffer {:?} freed while its submission is pending",
                    cb
                );
            }
            state.pool_of.remove(&cb);
            state.last_fence.remove(&cb);
            state.recording.remove(&cb);
            state.release(cb);
        }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let state = self.state();
        if let Some(&fence) = state.last_fence.get(&command_buffer) {
            assert!(
                state.fences.get(&fence) != Some(&FenceState::Pending),
                "command buffer {:?} reset while its submission is pending",
                command_buffer
            );
        }
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.state();
        if let Some(&fence) = state.last_fence.get(&command_buffer) {
            assert!(
                state.fences.get(&fence) != Some(&FenceState::Pending),
                "command buffer {:?} re-recorded while its submission is pending",
                command_buffer
            );
        }
        assert!(
            state.recording.insert(command_buffer),
            "command buffer {:?} begun twice",
            command_buffer
        );
        state
            .events
            .push(MockEvent::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.state();
        assert!(
            state.recording.remove(&command_buffer),
            "command buffer {:?} ended without begin",
            command_buffer
        );
        state.events.push(MockEvent::EndCommandBuffer(command_buffer));
        Ok(())
    }

    fn cmd_begin_render_pass(&self, _command_buffer: vk::CommandBuffer, begin: &RenderPassBegin<'_>) {
        self.state().events.push(MockEvent::BeginRenderPass {
            render_pass: begin.render_pass,
            framebuffer: begin.framebuffer,
            extent: begin.extent,
        });
    }

    fn cmd_end_render_pass(&self, _command_buffer: vk::CommandBuffer) {
        self.state().events.push(MockEvent::EndRenderPass);
    }

    fn cmd_set_viewport(&self, _command_buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        self.state().events.push(MockEvent::SetViewport(vk::Extent2D {
            width: viewport.width as u32,
            height: viewport.height as u32,
        }));
    }

    fn cmd_set_scissor(&self, _command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.state()
            .events
            .push(MockEvent::SetScissor(scissor.extent));
    }

    fn queue_submit(&self, submit: &QueueSubmit<'_>, fence: vk::Fence) -> RhiResult<()> {
        let mut state = self.state();
        if state.device_lost {
            return Err(RhiError::DeviceLost);
        }
        for semaphore in submit.wait_semaphores {
            assert!(
                state.signaled_semaphores.remove(semaphore),
                "submission waits on {:?}, which no acquire signaled",
                semaphore
            );
        }
        for &cb in submit.command_buffers {
            assert!(
                !state.recording.contains(&cb),
                "command buffer {:?} submitted while still recording",
                cb
            );
            state.last_fence.insert(cb, fence);
        }
        state
            .signaled_semaphores
            .extend(submit.signal_semaphores.iter().copied());
        if fence != vk::Fence::null() {
            let s = state
                .fences
                .get_mut(&fence)
                .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", fence)))?;
            assert!(
                *s == FenceState::Unsignaled,
                "submission fence {:?} must be unsignaled, was {:?}",
                fence,
                s
            );
            *s = FenceState::Pending;
        }
        state.events.push(MockEvent::Submit {
            command_buffers: submit.command_buffers.to_vec(),
            wait: submit.wait_semaphores.to_vec(),
            signal: submit.signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RhiResult<vk::SwapchainKHR> {
        let mut state = self.state();
        let swapchain: vk::SwapchainKHR = state.alloc(ObjectKind::Swapchain);
        let images = (0..desc.min_image_count)
            .map(|i| vk::Image::from_raw(0xA000_0000 + swapchain.as_raw() * 16 + u64::from(i)))
            .collect();
        state.swapchains.insert(
            swapchain,
            MockSwapchain {
                images,
                next_image: 0,
            },
        );
        state.events.push(MockEvent::CreateSwapchain {
            swapchain,
            extent: desc.extent,
            image_count: desc.min_image_count,
            old: desc.old_swapchain,
        });
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state();
        state.swapchains.remove(&swapchain);
        state.events.push(MockEvent::DestroySwapchain(swapchain));
        state.release(swapchain);
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>> {
        self.state()
            .swapchains
            .get(&swapchain)
            .map(|s| s.images.clone())
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", swapchain)))
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        let mut state = self.state();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let suboptimal = match state.acquire_script.pop_front() {
            Some(Err(e)) => {
                state.events.push(MockEvent::AcquireFailed(e));
                return Err(e);
            }
            Some(Ok(suboptimal)) => suboptimal,
            None => false,
        };
        let chain = state
            .swapchains
            .get_mut(&swapchain)
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        let image_index = chain.next_image;
        chain.next_image = (image_index + 1) % chain.images.len() as u32;
        assert!(
            state.signaled_semaphores.insert(semaphore),
            "acquire signals {:?}, which is already signaled",
            semaphore
        );
        state.events.push(MockEvent::Acquire { image_index });
        Ok((image_index, suboptimal))
    }

    fn queue_present(
        &self,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        let mut state = self.state();
        assert!(
            state.signaled_semaphores.remove(&wait_semaphore),
            "present waits on {:?}, which no submission signals",
            wait_semaphore
        );
        state.events.push(MockEvent::Present {
            image_index,
            wait: wait_semaphore,
        });
        state.present_script.pop_front().unwrap_or(Ok(false))
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> RhiResult<vk::ImageView> {
        Ok(self.state().alloc(ObjectKind::ImageView))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state().release(view);
    }

    fn create_attachment_image(
        &self,
        _extent: vk::Extent2D,
        _format: vk::Format,
        _usage: vk::ImageUsageFlags,
    ) -> RhiResult<vk::Image> {
        Ok(self.state().alloc(ObjectKind::Image))
    }

    fn destroy_image(&self, image: vk::Image) {
        self.state().release(image);
    }

    fn create_render_pass(
        &self,
        _color_format: vk::Format,
        _depth_format: vk::Format,
    ) -> RhiResult<vk::RenderPass> {
        Ok(self.state().alloc(ObjectKind::RenderPass))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state().release(render_pass);
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> RhiResult<vk::Framebuffer> {
        Ok(self.state().alloc(ObjectKind::Framebuffer))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state().release(framebuffer);
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> RhiResult<BufferAllocation> {
        let mut state = self.state();
        if !state.supported_memory.contains(properties) {
            return Err(RhiError::UnsupportedMemoryProperties(properties));
        }
        let buffer: vk::Buffer = state.alloc(ObjectKind::Buffer);
        state.buffers.insert(
            buffer,
            MockBuffer {
                memory: vec![0u8; size as usize].into_boxed_slice(),
                properties,
            },
        );
        Ok(BufferAllocation {
            buffer,
            memory_properties: properties,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state();
        state.buffers.remove(&buffer);
        state.release(buffer);
    }

    fn map_buffer(&self, buffer: vk::Buffer) -> RhiResult<NonNull<u8>> {
        let mut state = self.state();
        let entry = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", buffer)))?;
        if !entry
            .properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(RhiError::MemoryNotHostVisible);
        }
        // The boxed slice never moves while the buffer is live.
        NonNull::new(entry.memory.as_mut_ptr())
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", buffer)))
    }

    fn unmap_buffer(&self, _buffer: vk::Buffer) {}

    fn flush_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> RhiResult<()> {
        self.state().events.push(MockEvent::Flush {
            buffer,
            offset,
            size,
        });
        Ok(())
    }

    fn invalidate_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> RhiResult<()> {
        self.state().events.push(MockEvent::Invalidate {
            buffer,
            offset,
            size,
        });
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        Ok(self.state().alloc(ObjectKind::DescriptorSetLayout))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state().release(layout);
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
        _flags: vk::DescriptorPoolCreateFlags,
    ) -> RhiResult<vk::DescriptorPool> {
        let mut state = self.state();
        let pool: vk::DescriptorPool = state.alloc(ObjectKind::DescriptorPool);
        state.descriptor_pools.insert(
            pool,
            MockPool {
                max_sets,
                allocated: 0,
            },
        );
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state();
        state.descriptor_pools.remove(&pool);
        state.release(pool);
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        if let Some(p) = self.state().descriptor_pools.get_mut(&pool) {
            p.allocated = 0;
        }
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let mut state = self.state();
        let p = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if p.allocated >= p.max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        p.allocated += 1;
        state.next_handle += 1;
        Ok(vk::DescriptorSet::from_raw(state.next_handle))
    }

    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> RhiResult<()> {
        if let Some(p) = self.state().descriptor_pools.get_mut(&pool) {
            p.allocated = p.allocated.saturating_sub(sets.len() as u32);
        }
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        self.state().descriptor_writes.extend_from_slice(writes);
    }
}
