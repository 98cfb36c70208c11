//! Frame pipeline management.
//!
//! This module provides the [`FrameManager`], which drives the presentation chain through
//! one frame at a time:
//!
//! ```text
//! begin_frame   wait slot fence, acquire image, reset + begin the slot's command buffer
//! (caller)      begin_render_pass, record draws, end_render_pass
//! end_frame     end recording, submit, present, advance the slot
//! ```
//!
//! # Rebuilds
//!
//! When the chain goes out of date (on acquire or present), reports suboptimal, or the
//! window was resized, the chain is rebuilt. Out-of-date on acquire rebuilds immediately
//! and `begin_frame` returns `None`; everything seen at the end of a frame defers the
//! rebuild to the next `begin_frame`. A rebuild is skipped while the window is minimized.
//!
//! Each rebuild leaves a [`ChainRebuild`] to be picked up with
//! [`FrameManager::take_rebuild`], so code holding pipelines built against the old render
//! pass can recreate them.
//!
//! # Example
//!
//! ```no_run
//! use frameline_renderer::{FrameManager, WindowSurface};
//!
//! # fn example(frames: &mut FrameManager, window: &mut impl WindowSurface) -> Result<(), frameline_rhi::RhiError> {
//! if let Some(cmd) = frames.begin_frame(window)? {
//!     frames.begin_render_pass(&cmd);
//!     // ... record draws ...
//!     frames.end_render_pass(&cmd);
//!     frames.end_frame(window)?;
//! }
//! if let Some(_rebuild) = frames.take_rebuild() {
//!     // recreate pipelines against rebuild.render_pass
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info, warn};

use frameline_rhi::RhiResult;
use frameline_rhi::command::{CommandBuffer, CommandPool};
use frameline_rhi::gpu::{GpuDevice, RenderPassBegin};
use frameline_rhi::swapchain::{AcquireOutcome, ChainState, Swapchain, SwapchainConfig};

use crate::MAX_FRAMES_IN_FLIGHT;
use crate::config::RendererConfig;
use crate::frame::{FrameIndex, PerFrame};

/// The window as seen by the frame manager.
pub trait WindowSurface {
    /// Drawable size in pixels. Zero in either dimension while minimized.
    fn extent(&self) -> vk::Extent2D;

    /// True if the window was resized since the flag was last reset.
    fn was_resized(&self) -> bool;

    fn reset_resized_flag(&mut self);
}

impl WindowSurface for frameline_platform::Window {
    fn extent(&self) -> vk::Extent2D {
        frameline_platform::Window::extent(self)
    }

    fn was_resized(&self) -> bool {
        frameline_platform::Window::was_resized(self)
    }

    fn reset_resized_flag(&mut self) {
        frameline_platform::Window::reset_resized_flag(self);
    }
}

/// Emitted after every chain rebuild.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainRebuild {
    /// Render pass of the new chain.
    pub render_pass: vk::RenderPass,
    pub extent: vk::Extent2D,
    pub image_count: usize,
    /// False if the color or depth format changed, invalidating pipelines.
    pub formats_compatible: bool,
}

/// Runs the acquire, record, submit and present cycle.
///
/// # Thread Safety
///
/// Driven from the single submission thread.
pub struct FrameManager {
    // Drop order: the chain waits on its own fences before the pool frees the buffers.
    swapchain: Swapchain,
    command_pool: CommandPool,
    command_buffers: PerFrame<CommandBuffer>,
    device: Arc<dyn GpuDevice>,
    swapchain_config: SwapchainConfig,
    clear_color: [f32; 4],
    current_image_index: u32,
    frame_started: bool,
    needs_rebuild: bool,
    last_rebuild: Option<ChainRebuild>,
}

impl FrameManager {
    /// Creates the chain, the command pool and one command buffer per frame slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain or command buffers cannot be created.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        window: &impl WindowSurface,
        config: &RendererConfig,
    ) -> RhiResult<Self> {
        let swapchain = Swapchain::new(device.clone(), window.extent(), &config.swapchain)?;
        let command_pool = CommandPool::new(device.clone())?;
        let command_buffers = Self::allocate_command_buffers(&command_pool)?;

        info!(
            "Frame manager created: {} frames in flight, {} swapchain images",
            MAX_FRAMES_IN_FLIGHT,
            swapchain.image_count()
        );

        Ok(Self {
            swapchain,
            command_pool,
            command_buffers,
            device,
            swapchain_config: config.swapchain.clone(),
            clear_color: config.clear_color,
            current_image_index: 0,
            frame_started: false,
            needs_rebuild: false,
            last_rebuild: None,
        })
    }

    fn allocate_command_buffers(pool: &CommandPool) -> RhiResult<PerFrame<CommandBuffer>> {
        let buffers = pool.allocate_command_buffers(MAX_FRAMES_IN_FLIGHT as u32)?;
        Ok(PerFrame::from_vec(buffers))
    }

    /// Starts a frame.
    ///
    /// Returns the frame's command buffer in the recording state, or `None` if no frame
    /// could be started (the chain was just rebuilt, or the window is minimized). On
    /// `None` the caller skips the frame and tries again.
    ///
    /// # Panics
    ///
    /// Panics if a frame is already in progress.
    ///
    /// # Errors
    ///
    /// Returns an error on fatal device failures, including device loss.
    pub fn begin_frame(&mut self, window: &impl WindowSurface) -> RhiResult<Option<CommandBuffer>> {
        assert!(
            !self.frame_started,
            "Can't call begin_frame while a frame is in progress"
        );

        if self.needs_rebuild && !self.rebuild(window.extent())? {
            return Ok(None);
        }

        let image_index = match self.swapchain.acquire_next_image()? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    debug!("Acquired image {} from a suboptimal swapchain", image_index);
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                self.rebuild(window.extent())?;
                return Ok(None);
            }
        };

        self.current_image_index = image_index;
        let command_buffer = &self.command_buffers[self.slot()];
        command_buffer.reset()?;
        command_buffer.begin()?;
        self.frame_started = true;

        Ok(Some(command_buffer.clone()))
    }

    /// Ends the frame: finishes recording, submits, presents and advances the frame slot.
    ///
    /// A stale chain or a resized window schedules a rebuild for the next
    /// [`begin_frame`](Self::begin_frame) and clears the window's resize flag.
    ///
    /// # Panics
    ///
    /// Panics if no frame is in progress.
    pub fn end_frame(&mut self, window: &mut impl WindowSurface) -> RhiResult<()> {
        assert!(
            self.frame_started,
            "Can't call end_frame while frame is not in progress"
        );
        self.frame_started = false;

        let command_buffer = &self.command_buffers[self.slot()];
        command_buffer.end()?;
        let outcome = self
            .swapchain
            .submit_command_buffers(&[command_buffer.handle()], self.current_image_index)?;

        let resized = window.was_resized();
        if outcome.needs_rebuild() || resized || self.swapchain.state() == ChainState::Stale {
            debug!(
                "Scheduling swapchain rebuild (present: {:?}, window resized: {})",
                outcome, resized
            );
            window.reset_resized_flag();
            self.needs_rebuild = true;
        }

        Ok(())
    }

    /// Begins the chain's render pass on the acquired image and sets the viewport and
    /// scissor to the full extent.
    ///
    /// # Panics
    ///
    /// Panics if no frame is in progress or `command_buffer` belongs to another frame.
    pub fn begin_render_pass(&self, command_buffer: &CommandBuffer) {
        self.assert_frame_buffer(command_buffer, "begin");

        let extent = self.swapchain.extent();
        let clear_values = self.clear_values();
        command_buffer.begin_render_pass(&RenderPassBegin {
            render_pass: self.swapchain.render_pass(),
            framebuffer: self.swapchain.framebuffer(self.current_image_index),
            extent,
            clear_values: &clear_values,
        });

        command_buffer.set_viewport(vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        command_buffer.set_scissor(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        });
    }

    /// # Panics
    ///
    /// Same conditions as [`begin_render_pass`](Self::begin_render_pass).
    pub fn end_render_pass(&self, command_buffer: &CommandBuffer) {
        self.assert_frame_buffer(command_buffer, "end");
        command_buffer.end_render_pass();
    }

    fn assert_frame_buffer(&self, command_buffer: &CommandBuffer, what: &str) {
        assert!(
            self.frame_started,
            "Can't {} render pass when frame not in progress",
            what
        );
        assert!(
            *command_buffer == self.command_buffers[self.slot()],
            "Can't {} render pass on command buffer from a different frame",
            what
        );
    }

    /// Clear values for the color and depth attachments.
    pub fn clear_values(&self) -> [vk::ClearValue; 2] {
        [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ]
    }

    /// Rebuilds the chain for `extent`. Returns false if skipped because the window is
    /// minimized; the rebuild then stays scheduled.
    fn rebuild(&mut self, extent: vk::Extent2D) -> RhiResult<bool> {
        if extent.width == 0 || extent.height == 0 {
            debug!("Window minimized, deferring swapchain rebuild");
            self.needs_rebuild = true;
            return Ok(false);
        }

        self.device.wait_idle()?;

        let old_formats = self.swapchain.formats();
        self.swapchain.recreate(extent, &self.swapchain_config)?;
        let formats_compatible = self.swapchain.formats().is_compatible_with(&old_formats);
        if !formats_compatible {
            warn!(
                "Swapchain formats changed: {:?} -> {:?}",
                old_formats,
                self.swapchain.formats()
            );
        }

        self.command_pool.free(self.command_buffers.as_slice());
        self.command_buffers = Self::allocate_command_buffers(&self.command_pool)?;

        self.needs_rebuild = false;
        let rebuild = ChainRebuild {
            render_pass: self.swapchain.render_pass(),
            extent: self.swapchain.extent(),
            image_count: self.swapchain.image_count(),
            formats_compatible,
        };
        info!(
            "Swapchain rebuilt: {}x{}, {} images",
            rebuild.extent.width, rebuild.extent.height, rebuild.image_count
        );
        self.last_rebuild = Some(rebuild);
        Ok(true)
    }

    /// Returns the last rebuild not yet taken.
    pub fn take_rebuild(&mut self) -> Option<ChainRebuild> {
        self.last_rebuild.take()
    }

    #[inline]
    fn slot(&self) -> FrameIndex {
        FrameIndex::new(self.swapchain.current_frame())
    }

    /// # Panics
    ///
    /// Panics if no frame is in progress.
    pub fn current_command_buffer(&self) -> &CommandBuffer {
        assert!(
            self.frame_started,
            "Cannot get command buffer when frame not in progress"
        );
        &self.command_buffers[self.slot()]
    }

    /// Slot of the frame being recorded.
    ///
    /// # Panics
    ///
    /// Panics if no frame is in progress.
    pub fn frame_index(&self) -> FrameIndex {
        assert!(
            self.frame_started,
            "Cannot get frame index when frame not in progress"
        );
        self.slot()
    }

    /// Image acquired for the frame being recorded.
    pub fn image_index(&self) -> u32 {
        self.current_image_index
    }

    #[inline]
    pub fn is_frame_in_progress(&self) -> bool {
        self.frame_started
    }

    /// True if a rebuild is scheduled for the next frame.
    #[inline]
    pub fn is_rebuild_pending(&self) -> bool {
        self.needs_rebuild
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.swapchain.extent_aspect_ratio()
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.swapchain.render_pass()
    }

    #[inline]
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }
}

impl Drop for FrameManager {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle during frame manager drop: {}", e);
        }
    }
}
