//! frameline demo.
//!
//! Opens a window and drives the frame pipeline: per-frame global uniforms, a registry of
//! spinning objects written into a per-frame storage buffer, and a cleared render pass.
//! Resizing and minimizing the window exercise the presentation chain rebuild.

mod objects;

use anyhow::Result;
use glam::{Mat4, Vec3, Vec4};
use tracing::{error, info, trace};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use frameline_core::Timer;
use frameline_platform::Window;
use frameline_renderer::{FrameInfo, FrameManager, FrameUniforms, GlobalUbo, Renderer, RendererConfig};
use frameline_rhi::vk;
use frameline_scene::Registry;

use objects::{ObjectBuffers, SceneObject};

/// Everything tied to the window. Fields drop in order, so GPU resources go before the
/// renderer and the renderer before the window.
struct RenderState {
    objects: ObjectBuffers,
    uniforms: FrameUniforms,
    renderer: Renderer,
    window: Window,
}

impl RenderState {
    fn new(event_loop: &ActiveEventLoop, config: &RendererConfig) -> Result<Self> {
        let window = Window::new(event_loop, 1280, 720, "frameline")?;
        let renderer = Renderer::new(&window, config)?;
        let uniforms = FrameUniforms::new(renderer.device())?;
        let objects = ObjectBuffers::new(renderer.device())?;
        Ok(Self {
            objects,
            uniforms,
            renderer,
            window,
        })
    }

    fn draw(&mut self, scene: &Registry<SceneObject>, timer: &mut Timer) -> Result<()> {
        let frame_time = timer.delta_secs();
        let frames = self.renderer.frames_mut();

        let command_buffer = frames.begin_frame(&self.window)?;
        if let Some(rebuild) = frames.take_rebuild() {
            info!(
                "Chain rebuilt at {}x{} with {} images",
                rebuild.extent.width, rebuild.extent.height, rebuild.image_count
            );
        }
        let Some(command_buffer) = command_buffer else {
            return Ok(());
        };

        let view = Mat4::look_at_rh(Vec3::new(0.0, 2.0, 6.0), Vec3::ZERO, Vec3::Y);
        let projection = Mat4::perspective_rh(45f32.to_radians(), frames.aspect_ratio(), 0.1, 100.0);
        let frame_index = frames.frame_index();
        let info = FrameInfo {
            frame_index,
            frame_time,
            command_buffer: &command_buffer,
            global_descriptor_set: self.uniforms.descriptor_set(frame_index),
        };

        self.uniforms.update(info.frame_index, &GlobalUbo::new(projection, view))?;
        let object_count = self.objects.update(info.frame_index, scene, timer.elapsed_secs())?;
        record_frame(frames, &info, self.objects.descriptor_set(info.frame_index), object_count);

        frames.end_frame(&mut self.window)?;
        Ok(())
    }
}

/// Records the frame's commands into `info.command_buffer`.
fn record_frame(frames: &FrameManager, info: &FrameInfo<'_>, object_set: vk::DescriptorSet, object_count: u32) {
    frames.begin_render_pass(info.command_buffer);
    trace!(
        "Frame slot {} ({:.2} ms): {} objects, global set {:?}, object set {:?}",
        info.frame_index.get(),
        info.frame_time * 1000.0,
        object_count,
        info.global_descriptor_set,
        object_set
    );
    frames.end_render_pass(info.command_buffer);
}

struct App {
    config: RendererConfig,
    state: Option<RenderState>,
    scene: Registry<SceneObject>,
    timer: Timer,
}

impl App {
    fn new(config: RendererConfig) -> Self {
        let mut scene = Registry::new();
        for i in 0..8 {
            let angle = i as f32 / 8.0 * std::f32::consts::TAU;
            scene.insert(SceneObject {
                position: Vec3::new(angle.cos() * 2.5, 0.0, angle.sin() * 2.5),
                spin: 0.5 + i as f32 * 0.25,
                color: Vec4::new(i as f32 / 8.0, 0.4, 1.0 - i as f32 / 8.0, 1.0),
            });
        }

        Self {
            config,
            state: None,
            scene,
            timer: Timer::new(),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }
        match RenderState::new(event_loop, &self.config) {
            Ok(state) => {
                info!("Initialization complete, entering main loop");
                self.timer.reset();
                self.state = Some(state);
            }
            Err(e) => {
                error!("Failed to initialize: {:#}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(state) = self.state.as_mut() else {
            return;
        };

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                if let Err(e) = state.renderer.wait_idle() {
                    error!("Failed to wait for device: {}", e);
                }
                self.state = None;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                info!("Window resized to {}x{}", size.width, size.height);
                state.window.handle_resize(size.width, size.height);
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = state.draw(&self.scene, &mut self.timer) {
                    error!("Render error: {:#}", e);
                    event_loop.exit();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    frameline_core::init_logging();
    info!("Starting frameline");

    let config = RendererConfig::from_env()?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    info!("Rendered {} frames", app.timer.frame_count());
    Ok(())
}
