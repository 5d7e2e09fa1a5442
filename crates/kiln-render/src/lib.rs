// SPDX-License-Identifier: CEPL-1.0
pub mod chain;
pub mod device;
pub mod error;
pub mod frame;
pub mod orchestrator;
pub mod surface;

#[cfg(test)]
mod mock;

pub use chain::PresentationChain;
pub use device::{ClearValues, PresentDevice, PresentStatus, SwapchainTargets};
pub use error::FrameError;
pub use frame::{push_block_bytes, FrameInfo, RenderSystem, MAX_PUSH_BLOCK_SIZE};
pub use orchestrator::FrameOrchestrator;
pub use surface::SurfaceProvider;

/// Frames the CPU may run ahead of the GPU. Independent of the swapchain image count.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimized window reports zero in at least one dimension.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            return 1.0;
        }
        self.width as f32 / self.height as f32
    }
}
