// SPDX-License-Identifier: CEPL-1.0
//! A single winit window driven by the pump-events API, so the render loop
//! owns the thread and can block on window events while minimized.

use anyhow::{bail, Context, Result};
use kiln_render::{RenderSize, SurfaceProvider};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use std::time::Duration;
use tracing::{debug, info};

pub use winit;

use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    error::OsError,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowAttributes, WindowId},
};

const STARTUP_PUMPS: usize = 200;

/// What the frame loop needs to know about the window, updated from events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceState {
    extent: RenderSize,
    resized: bool,
    close_requested: bool,
}

impl SurfaceState {
    pub fn new(extent: RenderSize) -> Self {
        Self {
            extent,
            resized: false,
            close_requested: false,
        }
    }

    pub fn handle(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                let next = RenderSize::new(size.width, size.height);
                if next != self.extent {
                    debug!("Resized → {}x{}", next.width, next.height);
                    self.extent = next;
                    self.resized = true;
                }
            }
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.close_requested = true;
            }
            WindowEvent::Destroyed => {
                info!("Destroyed");
                self.close_requested = true;
            }
            _ => {}
        }
    }

    pub fn extent(&self) -> RenderSize {
        self.extent
    }

    pub fn resized(&self) -> bool {
        self.resized
    }

    pub fn reset_resized(&mut self) {
        self.resized = false;
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    fn request_close(&mut self) {
        self.close_requested = true;
    }
}

struct WindowState {
    pending: Option<WindowAttributes>,
    created: Option<Window>,
    create_error: Option<OsError>,
    window_id: Option<WindowId>,
    surface: SurfaceState,
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(attrs) = self.pending.take() {
            match event_loop.create_window(attrs) {
                Ok(window) => {
                    self.window_id = Some(window.id());
                    self.created = Some(window);
                }
                Err(e) => self.create_error = Some(e),
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if self.window_id != Some(window_id) {
            return;
        }
        self.surface.handle(&event);
    }
}

pub struct AppWindow {
    // Dropped before the event loop.
    window: Window,
    event_loop: EventLoop<()>,
    state: WindowState,
}

impl AppWindow {
    pub fn new(title: &str, size: RenderSize) -> Result<Self> {
        let mut event_loop = EventLoop::new().context("create event loop")?;
        let attrs = Window::default_attributes()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(size.width.max(1), size.height.max(1)));

        let mut state = WindowState {
            pending: Some(attrs),
            created: None,
            create_error: None,
            window_id: None,
            surface: SurfaceState::new(size),
        };

        for _ in 0..STARTUP_PUMPS {
            if let PumpStatus::Exit(code) =
                event_loop.pump_app_events(Some(Duration::from_millis(5)), &mut state)
            {
                bail!("event loop exited during startup (code {code})");
            }
            if let Some(e) = state.create_error.take() {
                return Err(e).context("create_window");
            }
            if let Some(window) = state.created.take() {
                let inner = window.inner_size();
                state.surface = SurfaceState::new(RenderSize::new(inner.width, inner.height));
                info!("window ready ({}x{})", inner.width, inner.height);
                return Ok(Self {
                    window,
                    event_loop,
                    state,
                });
            }
        }
        bail!("window was not created after {STARTUP_PUMPS} event pumps")
    }

    /// Process pending events without blocking.
    pub fn poll_events(&mut self) {
        self.pump(Some(Duration::ZERO));
    }

    fn pump(&mut self, timeout: Option<Duration>) {
        if let PumpStatus::Exit(code) = self.event_loop.pump_app_events(timeout, &mut self.state) {
            info!("event loop exit (code {code})");
            self.state.surface.request_close();
        }
    }

    pub fn should_close(&self) -> bool {
        self.state.surface.close_requested()
    }
}

impl SurfaceProvider for AppWindow {
    fn extent(&self) -> RenderSize {
        self.state.surface.extent()
    }

    fn was_resized(&self) -> bool {
        self.state.surface.resized()
    }

    fn reset_resized_flag(&mut self) {
        self.state.surface.reset_resized();
    }

    fn wait_events(&mut self) {
        self.pump(None);
    }

    fn is_closing(&self) -> bool {
        self.should_close()
    }
}

impl HasWindowHandle for AppWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for AppWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_sets_flag_until_reset() {
        let mut s = SurfaceState::new(RenderSize::new(800, 600));
        assert!(!s.resized());

        s.handle(&WindowEvent::Resized(PhysicalSize::new(1024, 768)));
        assert!(s.resized());
        assert_eq!(s.extent(), RenderSize::new(1024, 768));
        assert!(s.resized(), "reading the flag must not clear it");

        s.reset_resized();
        assert!(!s.resized());
        assert_eq!(s.extent(), RenderSize::new(1024, 768));
    }

    #[test]
    fn same_size_resize_is_not_an_edge() {
        let mut s = SurfaceState::new(RenderSize::new(800, 600));
        s.handle(&WindowEvent::Resized(PhysicalSize::new(800, 600)));
        assert!(!s.resized());
    }

    #[test]
    fn minimize_reports_zero_extent() {
        let mut s = SurfaceState::new(RenderSize::new(800, 600));
        s.handle(&WindowEvent::Resized(PhysicalSize::new(0, 0)));
        assert!(s.extent().is_empty());
        assert!(s.resized());
    }

    #[test]
    fn close_request_is_sticky() {
        let mut s = SurfaceState::new(RenderSize::new(800, 600));
        s.handle(&WindowEvent::Focused(true));
        assert!(!s.close_requested());
        s.handle(&WindowEvent::CloseRequested);
        s.handle(&WindowEvent::Focused(false));
        assert!(s.close_requested());
    }

    #[test]
    fn destroyed_window_also_closes() {
        let mut s = SurfaceState::new(RenderSize::new(800, 600));
        s.handle(&WindowEvent::Destroyed);
        assert!(s.close_requested());
        assert!(!s.resized());
    }
}
