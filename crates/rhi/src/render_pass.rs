//! Render pass and framebuffer wrappers.
//!
//! The chain renders through a single-subpass pass with one color attachment (the
//! presentable image, cleared and stored for presentation) and one depth attachment
//! (cleared, contents discarded).

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::error::RhiResult;
use crate::gpu::GpuDevice;

/// Color + depth render pass.
pub struct RenderPass {
    device: Arc<dyn GpuDevice>,
    render_pass: vk::RenderPass,
    color_format: vk::Format,
    depth_format: vk::Format,
}

impl RenderPass {
    pub fn new(device: Arc<dyn GpuDevice>, color_format: vk::Format, depth_format: vk::Format) -> RhiResult<Self> {
        let render_pass = device.create_render_pass(color_format, depth_format)?;
        debug!(
            "Created render pass (color {:?}, depth {:?})",
            color_format, depth_format
        );
        Ok(Self {
            device,
            render_pass,
            color_format,
            depth_format,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    #[inline]
    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    #[inline]
    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.device.destroy_render_pass(self.render_pass);
        debug!("Destroyed render pass");
    }
}

/// Framebuffer binding one color view and one depth view to a render pass.
pub struct Framebuffer {
    device: Arc<dyn GpuDevice>,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
}

impl Framebuffer {
    /// Creates a framebuffer. `attachments` follow the render pass order: color, depth.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        render_pass: &RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> RhiResult<Self> {
        let framebuffer = device.create_framebuffer(render_pass.handle(), attachments, extent)?;
        Ok(Self {
            device,
            framebuffer,
            extent,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.device.destroy_framebuffer(self.framebuffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, ObjectKind};

    #[test]
    fn test_render_pass_and_framebuffer_lifetime() {
        let mock = MockDevice::new();
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        {
            let pass = RenderPass::new(
                mock.clone(),
                vk::Format::B8G8R8A8_SRGB,
                vk::Format::D32_SFLOAT,
            )
            .unwrap();
            assert_eq!(pass.depth_format(), vk::Format::D32_SFLOAT);

            let framebuffer = Framebuffer::new(mock.clone(), &pass, &[], extent).unwrap();
            assert_eq!(framebuffer.extent(), extent);
            assert_eq!(mock.live_objects_of(ObjectKind::RenderPass), 1);
            assert_eq!(mock.live_objects_of(ObjectKind::Framebuffer), 1);
        }
        assert_eq!(mock.live_objects(), 0);
    }
}
