//! Shared harness for the device-gated integration tests.
//!
//! [`TestContext::new`] opens a small real window and brings up a device
//! context and allocator on it. It returns `None` whenever that is not
//! possible (no display server, no Vulkan driver, no discrete GPU), so
//! tests skip cleanly on headless CI instead of failing.

use std::time::Duration;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::application::ApplicationHandler;
use winit::error::EventLoopError;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowId};

use vermilion_graphics::{DeviceContext, GpuAllocator, InstanceParameters};

const WINDOW_WIDTH: u32 = 320;
const WINDOW_HEIGHT: u32 = 240;

/// Everything a GPU test needs: a live device, its allocator and the window
/// backing the surface.
///
/// Field order is drop order: GPU objects go down before the window and the
/// window before the event loop.
pub struct TestContext {
    pub allocator: GpuAllocator,
    pub ctx: DeviceContext,
    _window: Window,
    _event_loop: EventLoop<()>,
}

impl TestContext {
    pub fn new() -> Option<Self> {
        let mut event_loop = match build_event_loop() {
            Ok(event_loop) => event_loop,
            Err(e) => {
                eprintln!("Event loop unavailable: {e}");
                return None;
            }
        };

        let mut app = WindowApp::default();
        for _ in 0..100 {
            let status =
                event_loop.pump_app_events(Some(Duration::from_millis(10)), &mut app);
            if matches!(status, PumpStatus::Exit(_)) || app.window.is_some() || app.failed {
                break;
            }
        }
        let window = app.window?;

        let display_handle = window.display_handle().ok()?.as_raw();
        let window_handle = window.window_handle().ok()?.as_raw();

        let ctx = match DeviceContext::new(
            &InstanceParameters::default(),
            display_handle,
            window_handle,
        ) {
            Ok(ctx) => ctx,
            Err(e) => {
                eprintln!("Device context unavailable: {e}");
                return None;
            }
        };

        let allocator = match GpuAllocator::new(&ctx) {
            Ok(allocator) => allocator,
            Err(e) => {
                eprintln!("Allocator creation failed: {e}");
                return None;
            }
        };

        Some(Self {
            allocator,
            ctx,
            _window: window,
            _event_loop: event_loop,
        })
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.ctx.wait_idle();
    }
}

/// Deterministic byte pattern for upload round trips.
pub fn generate_test_pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

#[cfg(target_os = "linux")]
fn build_event_loop() -> Result<EventLoop<()>, EventLoopError> {
    use winit::platform::x11::EventLoopBuilderExtX11;
    // The test runner is not the main thread.
    EventLoop::builder().with_any_thread(true).build()
}

#[cfg(target_os = "windows")]
fn build_event_loop() -> Result<EventLoop<()>, EventLoopError> {
    use winit::platform::windows::EventLoopBuilderExtWindows;
    EventLoop::builder().with_any_thread(true).build()
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn build_event_loop() -> Result<EventLoop<()>, EventLoopError> {
    EventLoop::new()
}

#[derive(Default)]
struct WindowApp {
    window: Option<Window>,
    failed: bool,
}

impl ApplicationHandler for WindowApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.failed {
            return;
        }
        let attributes = Window::default_attributes()
            .with_title("vermilion graphics tests")
            .with_inner_size(winit::dpi::LogicalSize::new(WINDOW_WIDTH, WINDOW_HEIGHT))
            .with_visible(true);
        match event_loop.create_window(attributes) {
            Ok(window) => self.window = Some(window),
            Err(e) => {
                eprintln!("Window creation failed: {e}");
                self.failed = true;
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        _event: WindowEvent,
    ) {
    }
}
