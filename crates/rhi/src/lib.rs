//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! This crate provides a safe abstraction over Vulkan using the `ash` crate.
//! It handles:
//! - Instance and device creation
//! - The presentation chain and its per-frame synchronization
//! - Command buffer recording
//! - GPU buffers with aligned per-instance layout
//! - Descriptor set layouts, pools and writes
//!
//! Everything above raw Vulkan talks to the device through [`gpu::GpuDevice`], so the
//! frame protocol can be exercised against the recording device from the `mock` feature.

mod error;

pub mod buffer;
pub mod command;
pub mod depth_buffer;
pub mod descriptor;
pub mod device;
pub mod gpu;
pub mod instance;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod physical_device;
pub mod render_pass;
pub mod swapchain;
pub mod sync;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
