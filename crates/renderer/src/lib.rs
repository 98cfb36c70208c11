//! Frame pipeline for frameline.
//!
//! This crate drives the presentation chain from the rhi crate:
//! - [`FrameManager`]: the begin/end frame cycle and chain rebuilds
//! - [`PerFrame`] and [`FrameIndex`]: per-slot resources
//! - [`FrameUniforms`]: the per-frame global uniform buffer and its descriptor sets
//! - [`Renderer`]: bootstrap from a window

pub mod config;
pub mod frame;
pub mod frame_manager;
pub mod renderer;
pub mod uniforms;

pub use config::RendererConfig;
pub use frame::{FrameIndex, FrameInfo, PerFrame};
pub use frame_manager::{ChainRebuild, FrameManager, WindowSurface};
pub use renderer::Renderer;
pub use uniforms::{FrameUniforms, GlobalUbo};

/// Maximum number of frames that can be in flight simultaneously.
pub use frameline_rhi::sync::MAX_FRAMES_IN_FLIGHT;
