//! Synchronization primitives.
//!
//! This module provides owning wrappers for the objects that pace the frame pipeline:
//! - [`Semaphore`] - GPU-to-GPU ordering between acquire, submit and present
//! - [`Fence`] - GPU-to-CPU completion signal the host waits on
//! - [`FrameSync`] - the set owned by one frame slot
//!
//! # Overview
//!
//! Each frame slot carries an image-available semaphore (signaled by acquire, waited on
//! by submit), a render-finished semaphore (signaled by submit, waited on by present) and
//! an in-flight fence (signaled when the slot's submission retires). Waiting on the fence
//! before touching the slot again is what bounds the CPU to at most
//! [`MAX_FRAMES_IN_FLIGHT`] frames ahead of the GPU.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use frameline_rhi::gpu::GpuDevice;
//! use frameline_rhi::sync::{Fence, Semaphore};
//!
//! # fn example(device: Arc<dyn GpuDevice>) -> Result<(), frameline_rhi::RhiError> {
//! let image_available = Semaphore::new(device.clone())?;
//! let in_flight = Fence::new(device.clone(), true)?;
//!
//! in_flight.wait(u64::MAX)?;
//! in_flight.reset()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::error::RhiResult;
use crate::gpu::GpuDevice;

/// Number of frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Semaphore wrapper, created unsignaled.
pub struct Semaphore {
    device: Arc<dyn GpuDevice>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates a new semaphore.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<dyn GpuDevice>) -> RhiResult<Self> {
        let semaphore = device.create_semaphore()?;
        debug!("Created semaphore");
        Ok(Self { device, semaphore })
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.semaphore);
        debug!("Destroyed semaphore");
    }
}

/// Fence wrapper.
///
/// The owner must make sure no submission still references the fence when it is dropped;
/// [`FrameSync`] owners do so by waiting on it first.
pub struct Fence {
    device: Arc<dyn GpuDevice>,
    fence: vk::Fence,
}

impl Fence {
    /// Creates a new fence.
    ///
    /// # Arguments
    ///
    /// * `device` - The device
    /// * `signaled` - Create in the signaled state, so the first wait returns immediately
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn new(device: Arc<dyn GpuDevice>, signaled: bool) -> RhiResult<Self> {
        let fence = device.create_fence(signaled)?;
        debug!("Created fence (signaled: {})", signaled);
        Ok(Self { device, fence })
    }

    /// Returns the Vulkan fence handle.
    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Blocks until the fence is signaled or `timeout` nanoseconds elapse.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DeviceLost`](crate::RhiError::DeviceLost) if the device was lost,
    /// or `VulkanError(TIMEOUT)` if the timeout expired.
    pub fn wait(&self, timeout: u64) -> RhiResult<()> {
        self.device.wait_for_fences(&[self.fence], timeout)
    }

    /// Returns the fence to the unsignaled state.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_fences(&[self.fence])
    }

    /// Non-blocking status query. Errors (including device loss) read as unsignaled.
    pub fn is_signaled(&self) -> bool {
        self.device.fence_status(self.fence).unwrap_or(false)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
        debug!("Destroyed fence");
    }
}

/// Synchronization objects of one frame slot.
pub struct FrameSync {
    image_available: Semaphore,
    render_finished: Semaphore,
    in_flight: Fence,
}

impl FrameSync {
    /// Creates the slot's semaphores and a signaled in-flight fence.
    pub fn new(device: Arc<dyn GpuDevice>) -> RhiResult<Self> {
        Ok(Self {
            image_available: Semaphore::new(device.clone())?,
            render_finished: Semaphore::new(device.clone())?,
            in_flight: Fence::new(device, true)?,
        })
    }

    /// Creates one [`FrameSync`] per frame slot.
    pub fn for_all_frames(device: &Arc<dyn GpuDevice>) -> RhiResult<Vec<Self>> {
        (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| Self::new(device.clone()))
            .collect()
    }

    /// Semaphore signaled when the acquired image is ready to be rendered into.
    #[inline]
    pub fn image_available(&self) -> &Semaphore {
        &self.image_available
    }

    /// Semaphore signaled when the slot's submission has finished rendering.
    #[inline]
    pub fn render_finished(&self) -> &Semaphore {
        &self.render_finished
    }

    /// Fence signaled when the slot's submission retires.
    #[inline]
    pub fn in_flight(&self) -> &Fence {
        &self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn test_max_frames_in_flight_constant() {
        assert_eq!(MAX_FRAMES_IN_FLIGHT, 2);
    }

    #[test]
    fn test_sync_objects_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore>();
        assert_send_sync::<Fence>();
        assert_send_sync::<FrameSync>();
    }

    #[test]
    fn test_signaled_fence_wait_returns_immediately() {
        let mock = MockDevice::new();
        let fence = Fence::new(mock.clone(), true).unwrap();
        assert!(fence.is_signaled());
        fence.wait(u64::MAX).unwrap();
        fence.reset().unwrap();
        assert!(!fence.is_signaled());
    }

    #[test]
    fn test_unsubmitted_fence_wait_times_out() {
        let mock = MockDevice::new();
        let fence = Fence::new(mock.clone(), false).unwrap();
        let err = fence.wait(1_000).unwrap_err();
        assert!(matches!(
            err,
            crate::RhiError::VulkanError(vk::Result::TIMEOUT)
        ));
    }

    #[test]
    fn test_frame_sync_objects_are_released() {
        let mock = MockDevice::new();
        {
            let frames = FrameSync::for_all_frames(&mock.as_device()).unwrap();
            assert_eq!(frames.len(), MAX_FRAMES_IN_FLIGHT);
            assert_eq!(mock.live_objects(), 3 * MAX_FRAMES_IN_FLIGHT);
        }
        assert_eq!(mock.live_objects(), 0);
    }
}
