//! Swapchain management.
//!
//! The [`Swapchain`] is the presentation chain: the presentable images, one depth
//! attachment and framebuffer per image, the render pass, and the per-frame
//! synchronization objects that pace acquire, submit and present.
//!
//! # Overview
//!
//! A frame goes through two calls:
//!
//! 1. [`Swapchain::acquire_next_image`] waits on the current frame slot's fence, then
//!    acquires an image, signaling the slot's image-available semaphore.
//! 2. [`Swapchain::submit_command_buffers`] waits for any other slot still rendering into
//!    that image, submits (waiting on image-available, signaling render-finished and the
//!    slot fence), presents (waiting on render-finished) and advances the frame slot.
//!
//! The slot advances on every submit whatever the present result, so slot usage always
//! cycles `0, 1, 0, 1, ...`.
//!
//! Out-of-date and suboptimal results are returned as [`AcquireOutcome`] and
//! [`PresentOutcome`] and mark the chain [`ChainState::Stale`]. The owner rebuilds with
//! [`Swapchain::with_previous`], which keeps the old chain alive as *retired* until its
//! last submissions finish.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use frameline_rhi::gpu::GpuDevice;
//! use frameline_rhi::swapchain::{AcquireOutcome, Swapchain, SwapchainConfig};
//! use frameline_rhi::vk;
//!
//! # fn example(device: Arc<dyn GpuDevice>, cmd: vk::CommandBuffer) -> Result<(), frameline_rhi::RhiError> {
//! let extent = vk::Extent2D { width: 800, height: 600 };
//! let mut chain = Swapchain::new(device.clone(), extent, &SwapchainConfig::default())?;
//!
//! if let AcquireOutcome::Acquired { image_index, .. } = chain.acquire_next_image()? {
//!     // ... record `cmd` against chain.framebuffer(image_index) ...
//!     let outcome = chain.submit_command_buffers(&[cmd], image_index)?;
//!     if outcome.needs_rebuild() {
//!         chain = Swapchain::with_previous(device, extent, &SwapchainConfig::default(), chain)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info, warn};

use crate::depth_buffer::{DEFAULT_DEPTH_CANDIDATES, DepthBuffer, find_depth_format};
use crate::error::{RhiError, RhiResult};
use crate::gpu::{GpuDevice, QueueSubmit, SwapchainDesc};
use crate::render_pass::{Framebuffer, RenderPass};
use crate::sync::{FrameSync, MAX_FRAMES_IN_FLIGHT};

/// Swapchain surface support details.
///
/// Contains information about what the surface supports for swapchain creation.
#[derive(Debug, Clone)]
pub struct SwapchainSupportDetails {
    /// Surface capabilities (min/max image count, extents, transforms, etc.)
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats (format and color space combinations)
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes (FIFO, MAILBOX, IMMEDIATE, etc.)
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    /// Queries swapchain support details for a physical device and surface.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the queries fail.
    pub fn query(
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> Result<Self, RhiError> {
        // SAFETY: the physical device and surface belong to the loader's instance.
        let (capabilities, formats, present_modes) = unsafe {
            (
                surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?,
                surface_loader.get_physical_device_surface_formats(physical_device, surface)?,
                surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?,
            )
        };

        debug!(
            "Swapchain support: {} formats, {} present modes, image count: {}-{}",
            formats.len(),
            present_modes.len(),
            capabilities.min_image_count,
            if capabilities.max_image_count == 0 {
                "unlimited".to_string()
            } else {
                capabilities.max_image_count.to_string()
            }
        );

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// Returns true if at least one format and one present mode are available.
    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Preferences used when building a chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapchainConfig {
    /// Preferred color format and color space.
    pub surface_format: vk::SurfaceFormatKHR,
    /// Preferred present mode. FIFO is used when the surface lacks it.
    pub present_mode: vk::PresentModeKHR,
    /// Depth formats tried in order.
    pub depth_candidates: Vec<vk::Format>,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_mode: vk::PresentModeKHR::MAILBOX,
            depth_candidates: DEFAULT_DEPTH_CANDIDATES.to_vec(),
        }
    }
}

/// Lifecycle state of a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainState {
    /// Usable for acquire and present.
    Ready,
    /// The surface changed; the chain should be rebuilt.
    Stale,
    /// Replaced by a newer chain and waiting for its last frames to finish.
    Retired,
}

/// Result of [`Swapchain::acquire_next_image`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is ready for rendering once the image-available semaphore signals.
    Acquired { image_index: u32, suboptimal: bool },
    /// The surface no longer matches the chain. Nothing was acquired.
    OutOfDate,
}

/// Result of [`Swapchain::submit_command_buffers`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented, but the chain no longer matches the surface exactly.
    Suboptimal,
    /// Not presented; the chain must be rebuilt.
    OutOfDate,
}

impl PresentOutcome {
    /// Returns true if the chain should be rebuilt before the next frame.
    #[inline]
    pub fn needs_rebuild(self) -> bool {
        !matches!(self, PresentOutcome::Presented)
    }
}

/// Color and depth formats of a chain.
///
/// Pipelines built against one chain stay valid for another with compatible formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapFormats {
    pub color: vk::Format,
    pub depth: vk::Format,
}

impl SwapFormats {
    /// True iff both color and depth formats match.
    #[inline]
    pub fn is_compatible_with(&self, other: &SwapFormats) -> bool {
        self.color == other.color && self.depth == other.depth
    }
}

struct ColorView {
    device: Arc<dyn GpuDevice>,
    view: vk::ImageView,
}

impl Drop for ColorView {
    fn drop(&mut self) {
        self.device.destroy_image_view(self.view);
    }
}

/// One presentable image and the attachments rendered with it.
struct SwapImage {
    // Declaration order is drop order: the framebuffer goes before its attachments.
    framebuffer: Framebuffer,
    depth: DepthBuffer,
    color: ColorView,
    /// Frame slot whose submission last rendered into this image.
    in_flight: Option<usize>,
}

/// The presentation chain.
///
/// Not thread-safe; driven from the single submission thread.
pub struct Swapchain {
    device: Arc<dyn GpuDevice>,
    swapchain: vk::SwapchainKHR,
    images: Vec<SwapImage>,
    render_pass: RenderPass,
    frames: Vec<FrameSync>,
    surface_format: vk::SurfaceFormatKHR,
    depth_format: vk::Format,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    current_frame: usize,
    state: ChainState,
    /// The chain this one replaced, kept until its frames finish.
    retired: Option<Box<Swapchain>>,
}

impl Swapchain {
    /// Creates a chain for a window whose drawable area is `window_extent` pixels.
    ///
    /// # Errors
    ///
    /// Returns an error if the surface cannot support a chain, no depth candidate is
    /// usable, or any object creation fails.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        window_extent: vk::Extent2D,
        config: &SwapchainConfig,
    ) -> RhiResult<Self> {
        Self::build(device, window_extent, config, None)
    }

    /// Creates a chain replacing `previous`.
    ///
    /// The new chain passes the old handle to the driver, continues from the old frame
    /// slot, and holds `previous` as retired until all of its frame fences signal.
    pub fn with_previous(
        device: Arc<dyn GpuDevice>,
        window_extent: vk::Extent2D,
        config: &SwapchainConfig,
        mut previous: Swapchain,
    ) -> RhiResult<Self> {
        // Only one generation is kept around.
        previous.retired = None;
        let mut chain = Self::build(
            device,
            window_extent,
            config,
            Some((previous.swapchain, previous.current_frame)),
        )?;
        previous.state = ChainState::Retired;
        chain.retired = Some(Box::new(previous));
        Ok(chain)
    }

    /// Rebuilds the chain in place, for owners that hold it in a field.
    ///
    /// Behaves like [`with_previous`](Self::with_previous): the replaced chain becomes the
    /// retired one. On error `self` is left as it was, minus any older retired chain.
    pub fn recreate(&mut self, window_extent: vk::Extent2D, config: &SwapchainConfig) -> RhiResult<()> {
        self.retired = None;
        let fresh = Self::build(
            self.device.clone(),
            window_extent,
            config,
            Some((self.swapchain, self.current_frame)),
        )?;
        let mut previous = std::mem::replace(self, fresh);
        previous.state = ChainState::Retired;
        self.retired = Some(Box::new(previous));
        Ok(())
    }

    fn build(
        device: Arc<dyn GpuDevice>,
        window_extent: vk::Extent2D,
        config: &SwapchainConfig,
        previous: Option<(vk::SwapchainKHR, usize)>,
    ) -> RhiResult<Self> {
        let support = device.surface_support()?;
        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "Inadequate swapchain support (no formats or present modes)".to_string(),
            ));
        }

        let surface_format = choose_surface_format(&support.formats, config.surface_format);
        let present_mode = choose_present_mode(&support.present_modes, config.present_mode);
        let extent = choose_extent(&support.capabilities, window_extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::SwapchainError(format!(
                "Cannot create a {}x{} swapchain",
                extent.width, extent.height
            )));
        }
        let image_count = determine_image_count(&support.capabilities);
        let depth_format = find_depth_format(&*device, &config.depth_candidates)?;

        let render_pass = RenderPass::new(device.clone(), surface_format.format, depth_format)?;
        let frames = FrameSync::for_all_frames(&device)?;

        let (old_swapchain, current_frame) =
            previous.unwrap_or((vk::SwapchainKHR::null(), 0));
        let swapchain = device.create_swapchain(&SwapchainDesc {
            surface_format,
            present_mode,
            extent,
            min_image_count: image_count,
            pre_transform: support.capabilities.current_transform,
            old_swapchain,
        })?;

        let mut chain = Self {
            device,
            swapchain,
            images: Vec::new(),
            render_pass,
            frames,
            surface_format,
            depth_format,
            present_mode,
            extent,
            current_frame,
            state: ChainState::Ready,
            retired: None,
        };
        // On failure `chain` drops and releases whatever was created so far.
        chain.create_images()?;

        info!(
            "Swapchain created: {}x{}, format {:?}, depth {:?}, present mode {:?}, {} images{}",
            extent.width,
            extent.height,
            surface_format.format,
            depth_format,
            present_mode,
            chain.images.len(),
            if previous.is_some() { " (replacing previous)" } else { "" }
        );

        Ok(chain)
    }

    fn create_images(&mut self) -> RhiResult<()> {
        let images = self.device.swapchain_images(self.swapchain)?;
        self.images.reserve(images.len());
        for image in images {
            let color = ColorView {
                device: self.device.clone(),
                view: self.device.create_image_view(
                    image,
                    self.surface_format.format,
                    vk::ImageAspectFlags::COLOR,
                )?,
            };
            let depth = DepthBuffer::new(self.device.clone(), self.extent, self.depth_format)?;
            let framebuffer = Framebuffer::new(
                self.device.clone(),
                &self.render_pass,
                &[color.view, depth.image_view()],
                self.extent,
            )?;
            self.images.push(SwapImage {
                framebuffer,
                depth,
                color,
                in_flight: None,
            });
        }
        debug!("Created views, depth buffers and framebuffers for {} images", self.images.len());
        Ok(())
    }

    /// Waits for the current frame slot, then acquires the next image.
    ///
    /// Also drops the retired chain once its frames have finished.
    ///
    /// # Errors
    ///
    /// Fails on any result other than success, suboptimal and out-of-date.
    pub fn acquire_next_image(&mut self) -> RhiResult<AcquireOutcome> {
        self.release_retired();

        let frame = &self.frames[self.current_frame];
        frame.in_flight().wait(u64::MAX)?;

        match self.device.acquire_next_image(
            self.swapchain,
            u64::MAX,
            frame.image_available().handle(),
        ) {
            Ok((image_index, suboptimal)) => {
                if suboptimal {
                    self.state = ChainState::Stale;
                }
                Ok(AcquireOutcome::Acquired {
                    image_index,
                    suboptimal,
                })
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("Swapchain out of date on acquire");
                self.state = ChainState::Stale;
                Ok(AcquireOutcome::OutOfDate)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Submits `command_buffers` for the acquired image and presents it.
    ///
    /// The frame slot advances whatever the present result.
    ///
    /// # Panics
    ///
    /// Panics if `image_index` is not an image of this chain.
    pub fn submit_command_buffers(
        &mut self,
        command_buffers: &[vk::CommandBuffer],
        image_index: u32,
    ) -> RhiResult<PresentOutcome> {
        let index = image_index as usize;
        assert!(
            index < self.images.len(),
            "image index {} out of range ({} images)",
            image_index,
            self.images.len()
        );

        // Another slot may still be rendering into this image.
        if let Some(other) = self.images[index].in_flight
            && other != self.current_frame
        {
            self.frames[other].in_flight().wait(u64::MAX)?;
        }
        self.images[index].in_flight = Some(self.current_frame);

        let frame = &self.frames[self.current_frame];
        frame.in_flight().reset()?;

        let wait_semaphores = [frame.image_available().handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.render_finished().handle()];
        self.device.queue_submit(
            &QueueSubmit {
                command_buffers,
                wait_semaphores: &wait_semaphores,
                wait_stages: &wait_stages,
                signal_semaphores: &signal_semaphores,
            },
            frame.in_flight().handle(),
        )?;

        let result = self
            .device
            .queue_present(self.swapchain, image_index, signal_semaphores[0]);

        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => {
                self.state = ChainState::Stale;
                Ok(PresentOutcome::Suboptimal)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("Swapchain out of date on present");
                self.state = ChainState::Stale;
                Ok(PresentOutcome::OutOfDate)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// True iff both chains use the same color and depth formats.
    pub fn compare_swap_formats(&self, other: &Swapchain) -> bool {
        self.formats().is_compatible_with(&other.formats())
    }

    fn release_retired(&mut self) {
        let finished = self.retired.as_ref().is_some_and(|old| {
            old.frames
                .iter()
                .all(|frame| frame.in_flight().is_signaled())
        });
        if finished {
            self.retired = None;
            debug!("Released retired swapchain");
        }
    }

    /// Returns the swapchain handle.
    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    #[inline]
    pub fn formats(&self) -> SwapFormats {
        SwapFormats {
            color: self.surface_format.format,
            depth: self.depth_format,
        }
    }

    #[inline]
    pub fn image_format(&self) -> vk::Format {
        self.surface_format.format
    }

    #[inline]
    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    #[inline]
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass.handle()
    }

    /// Returns the framebuffer of image `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn framebuffer(&self, index: u32) -> vk::Framebuffer {
        self.images[index as usize].framebuffer.handle()
    }

    /// Returns the color view of image `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn image_view(&self, index: u32) -> vk::ImageView {
        self.images[index as usize].color.view
    }

    /// Returns the frame slot that last rendered into image `index`, if any.
    #[inline]
    pub fn image_in_flight(&self, index: u32) -> Option<usize> {
        self.images[index as usize].in_flight
    }

    /// Returns the number of presentable images.
    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.extent.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.extent.height
    }

    /// Width over height of the chain extent.
    #[inline]
    pub fn extent_aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height as f32
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    #[inline]
    pub fn state(&self) -> ChainState {
        self.state
    }

    /// Index of the frame slot the next acquire uses.
    #[inline]
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Synchronization objects of frame slot `slot`.
    #[inline]
    pub fn frame_sync(&self, slot: usize) -> &FrameSync {
        &self.frames[slot]
    }

    /// Returns true while a replaced chain is still waiting for its frames.
    #[inline]
    pub fn has_retired(&self) -> bool {
        self.retired.is_some()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let pending = self
            .frames
            .iter()
            .any(|frame| !frame.in_flight().is_signaled());
        if pending && let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle before destroying swapchain: {}", e);
        }

        // Views and framebuffers must go before the images they reference.
        self.images.clear();
        self.device.destroy_swapchain(self.swapchain);

        info!(
            "Swapchain destroyed (was {}x{}, {:?})",
            self.extent.width, self.extent.height, self.state
        );
    }
}

/// Chooses the surface format.
///
/// Returns `preferred` if the surface supports it (or leaves the choice open), otherwise
/// the first reported format.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> vk::SurfaceFormatKHR {
    if let [only] = formats
        && only.format == vk::Format::UNDEFINED
    {
        return preferred;
    }

    if formats
        .iter()
        .any(|f| f.format == preferred.format && f.color_space == preferred.color_space)
    {
        debug!(
            "Selected preferred surface format: {:?} with {:?}",
            preferred.format, preferred.color_space
        );
        return preferred;
    }

    warn!(
        "Preferred surface format {:?} unavailable, using {:?}",
        preferred.format, formats[0].format
    );
    formats[0]
}

/// Chooses the present mode: `preferred` if available, otherwise FIFO.
pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if present_modes.contains(&preferred) {
        debug!("Selected {:?} present mode", preferred);
        return preferred;
    }

    // FIFO is the only mode every surface must support.
    debug!("{:?} unavailable, selected FIFO present mode", preferred);
    vk::PresentModeKHR::FIFO
}

/// Chooses the swapchain extent.
///
/// Uses the surface's current extent when defined, otherwise clamps the window size to
/// the surface limits.
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        debug!(
            "Using current surface extent: {}x{}",
            capabilities.current_extent.width, capabilities.current_extent.height
        );
        return capabilities.current_extent;
    }

    let extent = vk::Extent2D {
        width: window_extent.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window_extent.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    };

    debug!(
        "Calculated extent: {}x{} (requested: {}x{})",
        extent.width, extent.height, window_extent.width, window_extent.height
    );

    extent
}

/// One more image than the minimum, capped by the maximum when there is one.
pub fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockEvent, ObjectKind};
    use pretty_assertions::assert_eq;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    fn chain(mock: &Arc<MockDevice>) -> Swapchain {
        Swapchain::new(mock.as_device(), EXTENT, &SwapchainConfig::default()).unwrap()
    }

    fn run_frame(chain: &mut Swapchain) -> (u32, PresentOutcome) {
        let AcquireOutcome::Acquired { image_index, .. } = chain.acquire_next_image().unwrap() else {
            panic!("expected an image");
        };
        let outcome = chain.submit_command_buffers(&[], image_index).unwrap();
        (image_index, outcome)
    }

    #[test]
    fn test_choose_surface_format_prefers_configured() {
        let formats = vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        let selected = choose_surface_format(&formats, SwapchainConfig::default().surface_format);
        assert_eq!(selected.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(selected.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn test_choose_surface_format_falls_back_to_first() {
        let formats = vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        let selected = choose_surface_format(&formats, SwapchainConfig::default().surface_format);
        assert_eq!(selected.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn test_choose_present_mode() {
        let modes = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_choose_extent_uses_current() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };

        let extent = choose_extent(&capabilities, EXTENT);
        assert_eq!(extent.width, 1920);
        assert_eq!(extent.height, 1080);
    }

    #[test]
    fn test_choose_extent_clamps_to_limits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 2000,
                height: 2000,
            },
            ..Default::default()
        };

        let extent = choose_extent(&capabilities, vk::Extent2D { width: 3000, height: 50 });
        assert_eq!(extent.width, 2000);
        assert_eq!(extent.height, 100);

        let extent = choose_extent(&capabilities, EXTENT);
        assert_eq!(extent, EXTENT);
    }

    #[test]
    fn test_determine_image_count() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capabilities), 3);

        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capabilities), 3);

        // 0 means no limit
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capabilities), 3);
    }

    #[test]
    fn test_swapchain_support_details_is_adequate() {
        let adequate = SwapchainSupportDetails {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![vk::SurfaceFormatKHR::default()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(adequate.is_adequate());

        let no_modes = SwapchainSupportDetails {
            present_modes: vec![],
            ..adequate
        };
        assert!(!no_modes.is_adequate());
    }

    #[test]
    fn test_present_outcome_needs_rebuild() {
        assert!(!PresentOutcome::Presented.needs_rebuild());
        assert!(PresentOutcome::Suboptimal.needs_rebuild());
        assert!(PresentOutcome::OutOfDate.needs_rebuild());
    }

    #[test]
    fn test_new_chain_negotiates_images_and_formats() {
        let mock = MockDevice::new();
        let chain = chain(&mock);

        assert_eq!(chain.state(), ChainState::Ready);
        assert_eq!(chain.image_count(), 3);
        assert_eq!(chain.extent(), EXTENT);
        assert_eq!(chain.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            chain.formats(),
            SwapFormats {
                color: vk::Format::B8G8R8A8_SRGB,
                depth: vk::Format::D32_SFLOAT,
            }
        );
        assert_eq!(mock.live_objects_of(ObjectKind::Framebuffer), 3);
        assert_eq!(mock.live_objects_of(ObjectKind::Fence), MAX_FRAMES_IN_FLIGHT);
        assert!((chain.extent_aspect_ratio() - 800.0 / 600.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_frame_slots_cycle() {
        let mock = MockDevice::new();
        let mut chain = chain(&mock);

        let mut slots = Vec::new();
        let mut images = Vec::new();
        for _ in 0..5 {
            slots.push(chain.current_frame());
            let (image, outcome) = run_frame(&mut chain);
            assert_eq!(outcome, PresentOutcome::Presented);
            images.push(image);
        }
        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
        assert_eq!(images, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_image_claimed_by_other_slot_is_waited_on() {
        let mock = MockDevice::new();
        let mut chain = chain(&mock);
        let slot0_fence = chain.frame_sync(0).in_flight().handle();
        let slot1_fence = chain.frame_sync(1).in_flight().handle();

        for _ in 0..3 {
            run_frame(&mut chain);
        }
        // Frame 3 runs on slot 1 and gets image 0, last rendered by slot 0.
        mock.clear_events();
        let (image, _) = run_frame(&mut chain);
        assert_eq!(image, 0);
        assert_eq!(chain.image_in_flight(0), Some(1));

        let events = mock.events();
        assert_eq!(events[0], MockEvent::WaitFence(slot1_fence));
        assert_eq!(events[1], MockEvent::Acquire { image_index: 0 });
        assert_eq!(events[2], MockEvent::WaitFence(slot0_fence));
        assert_eq!(events[3], MockEvent::ResetFence(slot1_fence));
    }

    #[test]
    fn test_out_of_date_acquire_marks_stale() {
        let mock = MockDevice::new();
        let mut chain = chain(&mock);
        mock.script_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));

        assert_eq!(chain.acquire_next_image().unwrap(), AcquireOutcome::OutOfDate);
        assert_eq!(chain.state(), ChainState::Stale);
        assert_eq!(chain.current_frame(), 0);
    }

    #[test]
    fn test_present_results_advance_frame_and_mark_stale() {
        let mock = MockDevice::new();
        let mut chain = chain(&mock);

        mock.script_present(Ok(true));
        let (_, outcome) = run_frame(&mut chain);
        assert_eq!(outcome, PresentOutcome::Suboptimal);
        assert_eq!(chain.state(), ChainState::Stale);
        assert_eq!(chain.current_frame(), 1);

        mock.script_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        let (_, outcome) = run_frame(&mut chain);
        assert_eq!(outcome, PresentOutcome::OutOfDate);
        assert_eq!(chain.current_frame(), 0);
    }

    #[test]
    fn test_device_lost_is_fatal() {
        let mock = MockDevice::new();
        let mut chain = chain(&mock);
        run_frame(&mut chain);

        mock.set_device_lost();
        let err = chain.acquire_next_image().unwrap_err();
        assert!(err.is_device_lost());
    }

    #[test]
    fn test_rebuild_from_previous_chain() {
        let mock = MockDevice::new();
        let mut old = chain(&mock);
        run_frame(&mut old);
        let old_handle = old.handle();
        let old_formats = old.formats();

        mock.set_surface_extent(vk::Extent2D {
            width: 1024,
            height: 768,
        });
        mock.wait_idle().unwrap();
        let mut new = Swapchain::with_previous(
            mock.as_device(),
            EXTENT,
            &SwapchainConfig::default(),
            old,
        )
        .unwrap();

        assert_eq!(new.state(), ChainState::Ready);
        assert_eq!(new.current_frame(), 1);
        assert_eq!(new.extent().width, 1024);
        assert!(new.formats().is_compatible_with(&old_formats));
        assert!(new.has_retired());
        assert!(mock.events().contains(&MockEvent::CreateSwapchain {
            swapchain: new.handle(),
            extent: new.extent(),
            image_count: 3,
            old: old_handle,
        }));

        // The old chain's fences have signaled, so the next acquire releases it.
        run_frame(&mut new);
        assert!(!new.has_retired());
        assert_eq!(mock.live_objects_of(ObjectKind::Swapchain), 1);
        assert_eq!(mock.live_objects_of(ObjectKind::Framebuffer), 3);
    }

    #[test]
    fn test_recreate_in_place_retires_old_chain() {
        let mock = MockDevice::new();
        let mut chain = chain(&mock);
        run_frame(&mut chain);
        let old_handle = chain.handle();

        mock.wait_idle().unwrap();
        chain.recreate(EXTENT, &SwapchainConfig::default()).unwrap();
        assert_ne!(chain.handle(), old_handle);
        assert_eq!(chain.current_frame(), 1);
        assert!(chain.has_retired());
        assert_eq!(mock.live_objects_of(ObjectKind::Swapchain), 2);

        run_frame(&mut chain);
        assert!(!chain.has_retired());
        assert_eq!(mock.live_objects_of(ObjectKind::Swapchain), 1);
    }

    #[test]
    fn test_compare_swap_formats() {
        let mock = MockDevice::new();
        let a = chain(&mock);
        let b = chain(&mock);
        assert!(a.compare_swap_formats(&b));

        let other = SwapFormats {
            color: vk::Format::B8G8R8A8_UNORM,
            depth: vk::Format::D32_SFLOAT,
        };
        assert!(!a.formats().is_compatible_with(&other));
    }

    #[test]
    fn test_drop_releases_everything() {
        let mock = MockDevice::new();
        {
            let mut chain = chain(&mock);
            run_frame(&mut chain);
        }
        assert_eq!(mock.live_objects(), 0);
        assert!(mock.events().contains(&MockEvent::WaitIdle));
    }
}
