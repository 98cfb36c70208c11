//! Command pool and command buffer management.
//!
//! # Overview
//!
//! - [`CommandPool`] owns a graphics-queue command pool and allocates primary buffers
//! - [`CommandBuffer`] is a cheap handle with methods for recording commands
//!
//! Command buffers do not own their `vk::CommandBuffer`: it is freed explicitly through
//! [`CommandPool::free`] or implicitly when the pool is destroyed. The frame manager frees
//! and reallocates its buffers only on chain rebuild, after the device is idle.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use frameline_rhi::command::CommandPool;
//! use frameline_rhi::gpu::GpuDevice;
//!
//! # fn example(device: Arc<dyn GpuDevice>) -> Result<(), frameline_rhi::RhiError> {
//! let pool = CommandPool::new(device)?;
//! let buffers = pool.allocate_command_buffers(2)?;
//!
//! buffers[0].begin()?;
//! // ... record rendering commands ...
//! buffers[0].end()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::info;

use crate::error::RhiResult;
use crate::gpu::{GpuDevice, RenderPassBegin};

/// Command pool for the graphics queue family.
///
/// Created with `RESET_COMMAND_BUFFER`, so buffers can be reset one at a time.
pub struct CommandPool {
    device: Arc<dyn GpuDevice>,
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Creates a new command pool on the device's graphics queue family.
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new(device: Arc<dyn GpuDevice>) -> RhiResult<Self> {
        let pool = device.create_command_pool()?;
        info!("Command pool created");
        Ok(Self { device, pool })
    }

    /// Returns the Vulkan command pool handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Allocates `count` primary command buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn allocate_command_buffers(&self, count: u32) -> RhiResult<Vec<CommandBuffer>> {
        let buffers = self.device.allocate_command_buffers(self.pool, count)?;
        Ok(buffers
            .into_iter()
            .map(|buffer| CommandBuffer::from_handle(self.device.clone(), buffer))
            .collect())
    }

    /// Returns command buffers to the pool.
    ///
    /// The caller must make sure none of them is pending execution.
    pub fn free(&self, buffers: &[CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        let handles: Vec<vk::CommandBuffer> = buffers.iter().map(CommandBuffer::handle).collect();
        self.device.free_command_buffers(self.pool, &handles);
    }

    /// Returns a reference to the device.
    #[inline]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.device.destroy_command_pool(self.pool);
        info!("Command pool destroyed");
    }
}

/// Command buffer handle with recording helpers.
///
/// Commands are recorded between [`begin`](Self::begin) and [`end`](Self::end).
/// Cloning copies the handle, not the buffer.
#[derive(Clone)]
pub struct CommandBuffer {
    device: Arc<dyn GpuDevice>,
    buffer: vk::CommandBuffer,
}

impl CommandBuffer {
    /// Wraps a command buffer allocated elsewhere.
    #[inline]
    pub fn from_handle(device: Arc<dyn GpuDevice>, buffer: vk::CommandBuffer) -> Self {
        Self { device, buffer }
    }

    /// Returns the raw Vulkan command buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    // =========================================================================
    // Recording Control
    // =========================================================================

    /// Begins one-time-submit recording.
    ///
    /// # Errors
    ///
    /// Returns an error if beginning fails (e.g., if already recording).
    pub fn begin(&self) -> RhiResult<()> {
        self.device.begin_command_buffer(self.buffer)
    }

    /// Ends recording. The buffer is then ready for submission.
    pub fn end(&self) -> RhiResult<()> {
        self.device.end_command_buffer(self.buffer)
    }

    /// Resets the buffer to its initial state so it can be re-recorded.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_command_buffer(self.buffer)
    }

    // =========================================================================
    // Render Pass
    // =========================================================================

    /// Begins a render pass instance with inline subpass contents.
    pub fn begin_render_pass(&self, begin: &RenderPassBegin<'_>) {
        self.device.cmd_begin_render_pass(self.buffer, begin);
    }

    /// Ends the current render pass instance.
    pub fn end_render_pass(&self) {
        self.device.cmd_end_render_pass(self.buffer);
    }

    // =========================================================================
    // Dynamic State
    // =========================================================================

    pub fn set_viewport(&self, viewport: vk::Viewport) {
        self.device.cmd_set_viewport(self.buffer, viewport);
    }

    pub fn set_scissor(&self, scissor: vk::Rect2D) {
        self.device.cmd_set_scissor(self.buffer, scissor);
    }
}

impl PartialEq for CommandBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.buffer == other.buffer
    }
}

impl Eq for CommandBuffer {}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CommandBuffer").field(&self.buffer).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockEvent, ObjectKind};

    #[test]
    fn test_command_buffer_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandBuffer>();
    }

    #[test]
    fn test_command_pool_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandPool>();
    }

    #[test]
    fn test_allocate_and_record() {
        let mock = MockDevice::new();
        let pool = CommandPool::new(mock.clone()).unwrap();
        let buffers = pool.allocate_command_buffers(2).unwrap();
        assert_eq!(buffers.len(), 2);
        assert_ne!(buffers[0], buffers[1]);

        buffers[0].begin().unwrap();
        buffers[0].end().unwrap();
        assert_eq!(
            mock.events(),
            vec![
                MockEvent::AllocateCommandBuffers(2),
                MockEvent::BeginCommandBuffer(buffers[0].handle()),
                MockEvent::EndCommandBuffer(buffers[0].handle()),
            ]
        );
    }

    #[test]
    fn test_free_and_pool_drop_release_buffers() {
        let mock = MockDevice::new();
        {
            let pool = CommandPool::new(mock.clone()).unwrap();
            let first = pool.allocate_command_buffers(2).unwrap();
            pool.free(&first);
            assert_eq!(mock.live_objects_of(ObjectKind::CommandBuffer), 0);

            let _second = pool.allocate_command_buffers(3).unwrap();
            assert_eq!(mock.live_objects_of(ObjectKind::CommandBuffer), 3);
        }
        assert_eq!(mock.live_objects(), 0);
    }
}
