//! Platform layer for frameline.
//!
//! This crate provides:
//! - Window management via winit, with resize tracking
//! - Vulkan surface creation through ash-window

mod window;

pub use window::{ResizeState, Surface, Window, required_extensions};

// Re-export winit types that users might need
pub use winit::event::WindowEvent;
pub use winit::event_loop::{ActiveEventLoop, EventLoop};
