// SPDX-License-Identifier: CEPL-1.0
use crate::RenderSize;

/// The window side of the frame loop. Polled only at frame boundaries and
/// while a recreation waits for a usable size.
pub trait SurfaceProvider {
    /// Current drawable size in pixels.
    fn extent(&self) -> RenderSize;

    /// Edge-triggered: set by a resize, stays set until [`reset_resized_flag`](Self::reset_resized_flag).
    fn was_resized(&self) -> bool;

    fn reset_resized_flag(&mut self);

    /// Block until at least one window event has been processed.
    fn wait_events(&mut self);

    /// The window is going away; a pending recreation should give up instead
    /// of waiting for a size that will never come.
    fn is_closing(&self) -> bool {
        false
    }
}
