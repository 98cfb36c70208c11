//! Window management using winit.
//!
//! This module provides window creation, resize tracking and Vulkan surface creation.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window as WinitWindow, WindowAttributes};

use frameline_core::{Error, Result};

/// RAII wrapper for a Vulkan surface.
///
/// # Ownership
/// The surface is destroyed automatically when this struct is dropped.
/// The caller must ensure that the Vulkan instance outlives this surface, and that every
/// device and swapchain created against it is gone first.
pub struct Surface {
    handle: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Get the raw Vulkan surface handle.
    ///
    /// # Note
    /// The returned handle is valid only as long as this `Surface` instance exists.
    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Get a reference to the surface loader.
    #[inline]
    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        // SAFETY: The surface handle was created by ash_window::create_surface with the
        // instance the loader was built from. This is the only place it is destroyed.
        unsafe {
            self.surface_loader.destroy_surface(self.handle, None);
        }
        tracing::debug!("Vulkan surface destroyed");
    }
}

/// Framebuffer size plus a sticky "resized since last check" flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeState {
    width: u32,
    height: u32,
    resized: bool,
}

impl ResizeState {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            resized: false,
        }
    }

    /// Records a new size. Raises the flag even when the size is unchanged, since
    /// some platforms report a resize to the same size after the surface changed.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.resized = true;
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }

    /// True while either dimension is zero.
    pub fn is_minimized(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn was_resized(&self) -> bool {
        self.resized
    }

    pub fn reset_resized_flag(&mut self) {
        self.resized = false;
    }
}

/// A window wrapper that tracks the framebuffer size and creates Vulkan surfaces.
pub struct Window {
    window: Arc<WinitWindow>,
    size: ResizeState,
}

impl Window {
    /// Create a new resizable window with the given dimensions and title.
    pub fn new(event_loop: &ActiveEventLoop, width: u32, height: u32, title: &str) -> Result<Self> {
        let attrs = WindowAttributes::default()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height))
            .with_resizable(true);

        let window = event_loop
            .create_window(attrs)
            .map_err(|e| Error::Window(e.to_string()))?;

        let actual = window.inner_size();
        tracing::info!("Window created: {}x{}", actual.width, actual.height);

        Ok(Self {
            window: Arc::new(window),
            size: ResizeState::new(actual.width, actual.height),
        })
    }

    /// Get a reference to the underlying winit window.
    pub fn inner(&self) -> &WinitWindow {
        &self.window
    }

    /// Get the id of the underlying winit window.
    pub fn id(&self) -> winit::window::WindowId {
        self.window.id()
    }

    /// Current framebuffer extent in pixels.
    pub fn extent(&self) -> vk::Extent2D {
        self.size.extent()
    }

    pub fn is_minimized(&self) -> bool {
        self.size.is_minimized()
    }

    /// Records a `WindowEvent::Resized` and raises the resized flag.
    pub fn handle_resize(&mut self, width: u32, height: u32) {
        self.size.resize(width, height);
        tracing::debug!("Window resized: {}x{}", width, height);
    }

    /// True if the window was resized since the flag was last reset.
    pub fn was_resized(&self) -> bool {
        self.size.was_resized()
    }

    pub fn reset_resized_flag(&mut self) {
        self.size.reset_resized_flag();
    }

    /// Request a redraw of the window.
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    /// Instance extensions needed to create a surface for this window.
    pub fn required_extensions(&self) -> Result<Vec<*const std::ffi::c_char>> {
        let display_handle = self
            .window
            .display_handle()
            .map_err(|e| Error::Window(format!("Failed to get display handle: {}", e)))?;
        required_extensions(display_handle.as_raw())
    }

    /// Create a Vulkan surface for this window.
    ///
    /// # Arguments
    /// * `entry` - The Vulkan entry point
    /// * `instance` - The Vulkan instance (must outlive the returned `Surface`)
    ///
    /// # Errors
    /// Returns an error if the window handles are unavailable or surface creation fails.
    pub fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> Result<Surface> {
        let display_handle = self
            .window
            .display_handle()
            .map_err(|e| Error::Window(format!("Failed to get display handle: {}", e)))?;

        let window_handle = self
            .window
            .window_handle()
            .map_err(|e| Error::Window(format!("Failed to get window handle: {}", e)))?;

        // SAFETY: entry and instance are valid for the call. The handles come from a live
        // winit window. The surface is destroyed in Surface::drop.
        let handle = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| Error::Vulkan(format!("Failed to create Vulkan surface: {}", e)))?
        };

        let surface_loader = ash::khr::surface::Instance::new(entry, instance);

        tracing::info!("Vulkan surface created");

        Ok(Surface {
            handle,
            surface_loader,
        })
    }
}

/// Get the Vulkan instance extensions needed for surface creation on the current platform.
///
/// The returned pointers reference static strings owned by the Vulkan loader.
///
/// # Errors
/// Returns an error if the platform is not supported.
pub fn required_extensions(
    display_handle: raw_window_handle::RawDisplayHandle,
) -> Result<Vec<*const std::ffi::c_char>> {
    let extensions = ash_window::enumerate_required_extensions(display_handle)
        .map_err(|e| Error::Vulkan(format!("Failed to enumerate required extensions: {}", e)))?;

    tracing::debug!(
        "Required Vulkan extensions for surface: {:?}",
        extensions
            .iter()
            // SAFETY: ash_window returns valid, null-terminated static C strings.
            .map(|&ext| unsafe { std::ffi::CStr::from_ptr(ext) })
            .collect::<Vec<_>>()
    );

    Ok(extensions.to_vec())
}
