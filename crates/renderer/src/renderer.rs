//! Renderer bootstrap.
//!
//! [`Renderer`] brings up the instance, window surface, device and frame manager for a
//! window, and tears them down in reverse.

use std::mem::ManuallyDrop;
use std::sync::Arc;

use tracing::{error, info};

use frameline_platform::{Surface, Window};
use frameline_rhi::device::Device;
use frameline_rhi::gpu::GpuDevice;
use frameline_rhi::instance::Instance;
use frameline_rhi::physical_device::select_physical_device;
use frameline_rhi::{RhiError, RhiResult};

use crate::config::RendererConfig;
use crate::frame_manager::FrameManager;

/// Owns the Vulkan objects behind a window.
///
/// # Resource Destruction Order
///
/// 1. Frame manager (waits for the device, then the chain and command pool)
/// 2. Device
/// 3. Surface
/// 4. Instance
///
/// Everything created from [`device`](Self::device) must be dropped before the renderer.
/// If a device reference is still alive at that point, the surface and instance are leaked
/// rather than destroyed under it.
pub struct Renderer {
    frame_manager: ManuallyDrop<FrameManager>,
    device: ManuallyDrop<Arc<Device>>,
    surface: ManuallyDrop<Surface>,
    instance: ManuallyDrop<Instance>,
}

impl Renderer {
    /// Creates a renderer for `window`.
    ///
    /// # Errors
    ///
    /// Returns an error if any Vulkan object creation fails or no GPU can present to the
    /// window.
    pub fn new(window: &Window, config: &RendererConfig) -> RhiResult<Self> {
        let extent = window.extent();
        info!("Initializing renderer ({}x{})", extent.width, extent.height);

        let surface_extensions = window
            .required_extensions()
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?;
        let instance = Instance::new(&config.app_name, config.enable_validation, &surface_extensions)?;

        let surface = window
            .create_surface(instance.entry(), instance.handle())
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?;

        let physical_device_info =
            select_physical_device(instance.handle(), surface.handle(), surface.loader())?;
        let device = Device::new(&instance, &physical_device_info, surface.handle())?;

        let gpu: Arc<dyn GpuDevice> = device.clone();
        let frame_manager = FrameManager::new(gpu, window, config)?;

        info!("Renderer initialized on {}", physical_device_info.device_name());

        Ok(Self {
            frame_manager: ManuallyDrop::new(frame_manager),
            device: ManuallyDrop::new(device),
            surface: ManuallyDrop::new(surface),
            instance: ManuallyDrop::new(instance),
        })
    }

    /// The device, for creating buffers and descriptor resources.
    pub fn device(&self) -> Arc<dyn GpuDevice> {
        (*self.device).clone()
    }

    #[inline]
    pub fn frames(&self) -> &FrameManager {
        &self.frame_manager
    }

    #[inline]
    pub fn frames_mut(&mut self) -> &mut FrameManager {
        &mut self.frame_manager
    }

    /// Blocks until the device has finished all submitted work.
    pub fn wait_idle(&self) -> RhiResult<()> {
        self.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // SAFETY: each field is dropped at most once, here, in dependency order.
        unsafe {
            ManuallyDrop::drop(&mut self.frame_manager);
        }

        if unsafe { release_device(&mut self.device) } {
            unsafe {
                ManuallyDrop::drop(&mut self.surface);
                ManuallyDrop::drop(&mut self.instance);
            }
            info!("Renderer destroyed");
        } else {
            // The device is still in use, so the surface and instance under it stay alive.
            error!("Device references outlive the renderer; leaking surface and instance");
        }
    }
}

/// Drops one reference to the device. Returns true if it was the last one.
///
/// # Safety
///
/// `device` must not be used or dropped again.
unsafe fn release_device<T: ?Sized>(device: &mut ManuallyDrop<Arc<T>>) -> bool {
    let last = Arc::strong_count(&**device) == 1;
    unsafe { ManuallyDrop::drop(device) };
    last
}
