//! Frame pipeline scenarios against the recording mock device.
//!
//! The mock panics on any synchronization misuse (re-recording a command buffer whose
//! submission is pending, submitting without an acquired image, presenting before the
//! submission signaled), so every scenario also checks the protocol itself.

use std::sync::Arc;

use frameline_renderer::{ChainRebuild, FrameManager, RendererConfig, WindowSurface};
use frameline_rhi::mock::{MockDevice, MockEvent, ObjectKind};
use frameline_rhi::swapchain::ChainState;
use frameline_rhi::vk;
use pretty_assertions::assert_eq;

struct TestWindow {
    extent: vk::Extent2D,
    resized: bool,
}

impl TestWindow {
    fn new(width: u32, height: u32) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            resized: false,
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.extent = vk::Extent2D { width, height };
        self.resized = true;
    }
}

impl WindowSurface for TestWindow {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn was_resized(&self) -> bool {
        self.resized
    }

    fn reset_resized_flag(&mut self) {
        self.resized = false;
    }
}

fn setup() -> (Arc<MockDevice>, TestWindow, FrameManager) {
    let mock = MockDevice::new();
    let window = TestWindow::new(800, 600);
    let frames = FrameManager::new(mock.as_device(), &window, &RendererConfig::default()).unwrap();
    (mock, window, frames)
}

/// Runs one full frame. Returns `(frame_index, image_index)`, or `None` if the frame was
/// skipped.
fn run_frame(frames: &mut FrameManager, window: &mut TestWindow) -> Option<(usize, u32)> {
    let cmd = frames.begin_frame(window).unwrap()?;
    let slot = frames.frame_index().get();
    let image = frames.image_index();
    frames.begin_render_pass(&cmd);
    frames.end_render_pass(&cmd);
    frames.end_frame(window).unwrap();
    Some((slot, image))
}

fn submit_count(mock: &MockDevice) -> usize {
    mock.events()
        .iter()
        .filter(|e| matches!(e, MockEvent::Submit { .. }))
        .count()
}

#[test]
fn test_five_frames_cycle_two_slots_over_three_images() {
    let (_mock, mut window, mut frames) = setup();

    let ran: Vec<_> = (0..5)
        .map(|_| run_frame(&mut frames, &mut window).unwrap())
        .collect();

    assert_eq!(ran, vec![(0, 0), (1, 1), (0, 2), (1, 0), (0, 1)]);
    assert!(!frames.is_frame_in_progress());
    assert!(frames.take_rebuild().is_none());
}

#[test]
fn test_slot_fence_is_waited_before_its_command_buffer_is_reused() {
    let (mock, mut window, mut frames) = setup();
    run_frame(&mut frames, &mut window).unwrap();
    run_frame(&mut frames, &mut window).unwrap();

    let slot0_fence = frames.swapchain().frame_sync(0).in_flight().handle();
    mock.clear_events();

    let cmd = frames.begin_frame(&window).unwrap().unwrap();
    let events = mock.events();
    let waited = events
        .iter()
        .position(|e| *e == MockEvent::WaitFence(slot0_fence))
        .expect("slot fence waited");
    let begun = events
        .iter()
        .position(|e| *e == MockEvent::BeginCommandBuffer(cmd.handle()))
        .expect("command buffer begun");
    assert!(waited < begun);
    frames.end_frame(&mut window).unwrap();
}

#[test]
fn test_out_of_date_on_third_frame_rebuilds_without_losing_a_frame() {
    let (mock, mut window, mut frames) = setup();
    let old_render_pass = frames.render_pass();

    assert_eq!(run_frame(&mut frames, &mut window), Some((0, 0)));
    assert_eq!(run_frame(&mut frames, &mut window), Some((1, 1)));

    mock.script_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
    assert_eq!(run_frame(&mut frames, &mut window), None);
    assert_eq!(submit_count(&mock), 2);

    let rebuild = frames.take_rebuild().expect("chain rebuilt");
    assert_eq!(
        rebuild,
        ChainRebuild {
            render_pass: frames.render_pass(),
            extent: vk::Extent2D {
                width: 800,
                height: 600
            },
            image_count: 3,
            formats_compatible: true,
        }
    );
    assert_ne!(rebuild.render_pass, old_render_pass);
    assert_eq!(frames.swapchain().state(), ChainState::Ready);
    assert!(frames.take_rebuild().is_none());

    // The slot that hit out-of-date is the next one used; images restart on the new chain.
    assert_eq!(run_frame(&mut frames, &mut window), Some((0, 0)));
    assert_eq!(run_frame(&mut frames, &mut window), Some((1, 1)));
    assert_eq!(submit_count(&mock), 4);

    // The retired chain is gone once its frames finished.
    assert!(!frames.swapchain().has_retired());
    assert_eq!(mock.live_objects_of(ObjectKind::Swapchain), 1);
    assert_eq!(mock.live_objects_of(ObjectKind::Framebuffer), 3);
    assert_eq!(mock.live_objects_of(ObjectKind::CommandBuffer), 2);
}

#[test]
fn test_rebuild_waits_idle_and_reallocates_command_buffers() {
    let (mock, mut window, mut frames) = setup();
    run_frame(&mut frames, &mut window).unwrap();

    mock.clear_events();
    mock.script_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
    assert!(frames.begin_frame(&window).unwrap().is_none());

    let events = mock.events();
    let idle = events.iter().position(|e| *e == MockEvent::WaitIdle).unwrap();
    let freed = events
        .iter()
        .position(|e| *e == MockEvent::FreeCommandBuffers(2))
        .unwrap();
    let allocated = events
        .iter()
        .position(|e| *e == MockEvent::AllocateCommandBuffers(2))
        .unwrap();
    assert!(idle < freed && freed < allocated);
}

#[test]
fn test_present_out_of_date_still_advances_and_defers_rebuild() {
    let (mock, mut window, mut frames) = setup();

    mock.script_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
    assert_eq!(run_frame(&mut frames, &mut window), Some((0, 0)));
    assert!(frames.is_rebuild_pending());
    assert!(frames.take_rebuild().is_none());

    // The next frame rebuilds first, then renders on slot 1.
    assert_eq!(run_frame(&mut frames, &mut window), Some((1, 0)));
    assert!(frames.take_rebuild().is_some());
    assert!(!frames.is_rebuild_pending());
}

#[test]
fn test_suboptimal_present_defers_rebuild() {
    let (mock, mut window, mut frames) = setup();

    mock.script_present(Ok(true));
    run_frame(&mut frames, &mut window).unwrap();
    assert!(frames.is_rebuild_pending());
    assert_eq!(frames.swapchain().state(), ChainState::Stale);

    run_frame(&mut frames, &mut window).unwrap();
    assert_eq!(frames.swapchain().state(), ChainState::Ready);
    assert!(frames.take_rebuild().unwrap().formats_compatible);
}

#[test]
fn test_window_resize_clears_flag_and_rebuilds_at_new_extent() {
    let (mock, mut window, mut frames) = setup();
    run_frame(&mut frames, &mut window).unwrap();

    window.resize(1024, 768);
    mock.set_surface_extent(vk::Extent2D {
        width: 1024,
        height: 768,
    });
    run_frame(&mut frames, &mut window).unwrap();
    assert!(!window.was_resized());
    assert!(frames.is_rebuild_pending());

    run_frame(&mut frames, &mut window).unwrap();
    let rebuild = frames.take_rebuild().unwrap();
    assert_eq!(rebuild.extent.width, 1024);
    assert_eq!(rebuild.extent.height, 768);
    assert!((frames.aspect_ratio() - 1024.0 / 768.0).abs() < f32::EPSILON);
}

#[test]
fn test_minimized_window_skips_frames_until_restored() {
    let (mock, mut window, mut frames) = setup();
    run_frame(&mut frames, &mut window).unwrap();

    window.resize(0, 0);
    run_frame(&mut frames, &mut window).unwrap();
    assert!(frames.is_rebuild_pending());

    let submitted = submit_count(&mock);
    for _ in 0..3 {
        assert_eq!(run_frame(&mut frames, &mut window), None);
    }
    assert_eq!(submit_count(&mock), submitted);
    assert!(frames.take_rebuild().is_none());
    assert!(frames.is_rebuild_pending());

    window.resize(800, 600);
    assert!(run_frame(&mut frames, &mut window).is_some());
    assert!(frames.take_rebuild().is_some());
}

#[test]
fn test_format_change_is_reported() {
    let (mock, mut window, mut frames) = setup();
    run_frame(&mut frames, &mut window).unwrap();

    mock.set_surface_formats(vec![vk::SurfaceFormatKHR {
        format: vk::Format::R8G8B8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    }]);
    mock.script_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
    assert_eq!(run_frame(&mut frames, &mut window), None);

    let rebuild = frames.take_rebuild().unwrap();
    assert!(!rebuild.formats_compatible);
    assert_eq!(
        frames.swapchain().image_format(),
        vk::Format::R8G8B8A8_UNORM
    );
}

#[test]
fn test_device_lost_is_fatal() {
    let (mock, mut window, mut frames) = setup();
    run_frame(&mut frames, &mut window).unwrap();

    mock.set_device_lost();
    let err = frames.begin_frame(&window).unwrap_err();
    assert!(err.is_device_lost());
    assert!(!frames.is_frame_in_progress());
}

#[test]
fn test_teardown_releases_every_object() {
    let (mock, mut window, mut frames) = setup();
    for _ in 0..3 {
        run_frame(&mut frames, &mut window).unwrap();
    }
    drop(frames);
    assert_eq!(mock.live_objects(), 0);
}
