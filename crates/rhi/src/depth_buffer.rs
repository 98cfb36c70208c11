//! Depth attachment management.
//!
//! Each presentable image of the chain gets its own [`DepthBuffer`]: a device-local depth
//! image and its view, sized to the chain extent.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::error::RhiResult;
use crate::gpu::GpuDevice;

/// Depth formats tried in order when none is configured.
pub const DEFAULT_DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Picks the first candidate usable as an optimal-tiling depth/stencil attachment.
///
/// # Errors
///
/// Returns [`RhiError::UnsupportedFormat`](crate::RhiError::UnsupportedFormat) if none is.
pub fn find_depth_format(device: &dyn GpuDevice, candidates: &[vk::Format]) -> RhiResult<vk::Format> {
    device.find_supported_format(
        candidates,
        vk::ImageTiling::OPTIMAL,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
    )
}

/// Returns true if the format carries a stencil component.
pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT
    )
}

/// Depth image and view.
///
/// Resources are destroyed view first, then the image and its memory.
pub struct DepthBuffer {
    device: Arc<dyn GpuDevice>,
    image: vk::Image,
    image_view: vk::ImageView,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl DepthBuffer {
    /// Creates a depth buffer of the given extent and format.
    ///
    /// # Errors
    ///
    /// Returns an error if image, memory or view creation fails.
    pub fn new(device: Arc<dyn GpuDevice>, extent: vk::Extent2D, format: vk::Format) -> RhiResult<Self> {
        let image = device.create_attachment_image(
            extent,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;
        let image_view = match device.create_image_view(image, format, vk::ImageAspectFlags::DEPTH) {
            Ok(view) => view,
            Err(e) => {
                device.destroy_image(image);
                return Err(e);
            }
        };

        debug!(
            "Created depth buffer: {}x{}, format {:?}",
            extent.width, extent.height, format
        );

        Ok(Self {
            device,
            image,
            image_view,
            format,
            extent,
        })
    }

    #[inline]
    pub fn image(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn image_view(&self) -> vk::ImageView {
        self.image_view
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for DepthBuffer {
    fn drop(&mut self) {
        self.device.destroy_image_view(self.image_view);
        self.device.destroy_image(self.image);
        debug!(
            "Destroyed depth buffer ({}x{})",
            self.extent.width, self.extent.height
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, ObjectKind};

    #[test]
    fn test_find_depth_format_prefers_first_supported() {
        let mock = MockDevice::new();
        let format = find_depth_format(&*mock, &DEFAULT_DEPTH_CANDIDATES).unwrap();
        assert_eq!(format, vk::Format::D32_SFLOAT);

        let format = find_depth_format(
            &*mock,
            &[vk::Format::D16_UNORM, vk::Format::D24_UNORM_S8_UINT],
        )
        .unwrap();
        assert_eq!(format, vk::Format::D24_UNORM_S8_UINT);
    }

    #[test]
    fn test_find_depth_format_none_supported() {
        let mock = MockDevice::new();
        let err = find_depth_format(&*mock, &[vk::Format::D16_UNORM]).unwrap_err();
        assert!(matches!(err, crate::RhiError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_has_stencil_component() {
        assert!(!has_stencil_component(vk::Format::D32_SFLOAT));
        assert!(has_stencil_component(vk::Format::D24_UNORM_S8_UINT));
    }

    #[test]
    fn test_depth_buffer_releases_image_and_view() {
        let mock = MockDevice::new();
        let extent = vk::Extent2D {
            width: 640,
            height: 480,
        };
        {
            let depth = DepthBuffer::new(mock.clone(), extent, vk::Format::D32_SFLOAT).unwrap();
            assert_eq!(depth.extent(), extent);
            assert_eq!(mock.live_objects_of(ObjectKind::Image), 1);
            assert_eq!(mock.live_objects_of(ObjectKind::ImageView), 1);
        }
        assert_eq!(mock.live_objects(), 0);
    }
}
