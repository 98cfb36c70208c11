//! RHI-specific error types.
//!
//! Only fatal conditions live here. Out-of-date and suboptimal presentation results are
//! reported as [`AcquireOutcome`](crate::swapchain::AcquireOutcome) and
//! [`PresentOutcome`](crate::swapchain::PresentOutcome) values, and descriptor pool exhaustion
//! as `None` from the allocation calls.

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(vk::Result),

    /// The logical device was lost. Never retried.
    #[error("Vulkan device lost")]
    DeviceLost,

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Surface creation or query error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// None of the candidate formats support the requested features
    #[error("No supported format among {0:?}")]
    UnsupportedFormat(Vec<vk::Format>),

    /// Attempted to map memory that is not host visible
    #[error("Buffer memory is not host visible")]
    MemoryNotHostVisible,

    /// The device has no memory type with the requested properties
    #[error("No memory type satisfies {0:?}")]
    UnsupportedMemoryProperties(vk::MemoryPropertyFlags),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
}

impl RhiError {
    /// Returns true if this error means the device is gone for good.
    #[inline]
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

impl From<vk::Result> for RhiError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            other => Self::VulkanError(other),
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
