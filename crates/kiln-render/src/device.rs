// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use std::fmt::Debug;

use crate::RenderSize;

/// Outcome of an acquire or present that did not fail outright.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Ok,
    /// Still presentable, but no longer matches the surface exactly.
    Suboptimal,
    /// Unusable until the presentation targets are rebuilt.
    OutOfDate,
}

impl PresentStatus {
    pub fn needs_recreate(self) -> bool {
        !matches!(self, PresentStatus::Ok)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.01, 0.01, 0.01, 1.0],
            depth: 1.0,
            stencil: 0,
        }
    }
}

/// One generation of presentable images with everything that is sized by
/// them: views, depth attachments, framebuffers and the render pass they use.
/// Dropping it releases all of that.
pub trait SwapchainTargets {
    type RenderPass: Copy + Debug;

    fn image_count(&self) -> usize;
    fn extent(&self) -> RenderSize;
    fn render_pass(&self) -> Self::RenderPass;
}

/// GPU device operations the frame core needs.
///
/// Implementations are cheap handles onto a shared device; every clone talks to
/// the same queue and command pool. Calls come from the render thread only.
pub trait PresentDevice: Clone {
    type CommandBuffer: Copy + PartialEq + Debug;
    type Fence: Copy + PartialEq + Debug;
    type Semaphore: Copy + Debug;
    type PipelineLayout: Copy + Debug;
    type Targets: SwapchainTargets;

    /// Build a new generation of targets. `previous` is still alive during the
    /// call so the backend can hand its swapchain over and reuse its render
    /// pass when the formats did not change.
    fn create_targets(&self, extent: RenderSize, previous: Option<&Self::Targets>) -> Result<Self::Targets>;

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence>;
    fn destroy_fence(&self, fence: Self::Fence);
    fn create_semaphore(&self) -> Result<Self::Semaphore>;
    fn destroy_semaphore(&self, semaphore: Self::Semaphore);
    fn wait_for_fence(&self, fence: Self::Fence) -> Result<()>;
    fn reset_fence(&self, fence: Self::Fence) -> Result<()>;

    /// Blocks until the presentation engine hands out an image; `signal` fires
    /// once the image is actually ready to be written. An `OutOfDate` result
    /// signals nothing.
    fn acquire_next_image(&self, targets: &Self::Targets, signal: Self::Semaphore) -> Result<(u32, PresentStatus)>;

    fn submit(
        &self,
        cmd: Self::CommandBuffer,
        wait: Self::Semaphore,
        signal: Self::Semaphore,
        fence: Self::Fence,
    ) -> Result<()>;

    fn present(&self, targets: &Self::Targets, image_index: u32, wait: Self::Semaphore) -> Result<PresentStatus>;

    fn allocate_command_buffers(&self, count: usize) -> Result<Vec<Self::CommandBuffer>>;
    fn free_command_buffers(&self, bufs: &[Self::CommandBuffer]);
    /// Implicitly resets the buffer.
    fn begin_command_buffer(&self, cmd: Self::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, cmd: Self::CommandBuffer) -> Result<()>;

    fn cmd_begin_render_pass(
        &self,
        cmd: Self::CommandBuffer,
        targets: &Self::Targets,
        image_index: u32,
        clear: &ClearValues,
    );
    fn cmd_set_viewport_scissor(&self, cmd: Self::CommandBuffer, extent: RenderSize);
    fn cmd_end_render_pass(&self, cmd: Self::CommandBuffer);
    /// Push `bytes` at offset 0 of `layout`'s vertex and fragment range.
    fn cmd_push_constants(&self, cmd: Self::CommandBuffer, layout: Self::PipelineLayout, bytes: &[u8]);

    fn wait_idle(&self) -> Result<()>;
}
