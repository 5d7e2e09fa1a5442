// SPDX-License-Identifier: CEPL-1.0
//! Per-frame state machine and presentation-chain recreation policy.
//!
//! ```text
//!            begin_frame (Ok / Suboptimal)
//!   Idle ─────────────────────────────────▶ Recording
//!    ▲  │ begin_frame (OutOfDate):                 │
//!    │  └─ recreate, return None                   │ end_frame: submit + present,
//!    └─────────────────────────────────────────────┘ recreate if stale or resized
//! ```

use anyhow::{anyhow, Context};
use bytemuck::Pod;
use tracing::{debug, info, warn};

use crate::chain::PresentationChain;
use crate::device::{ClearValues, PresentDevice, PresentStatus, SwapchainTargets};
use crate::error::FrameError;
use crate::frame::push_block_bytes;
use crate::surface::SurfaceProvider;
use crate::RenderSize;

pub struct FrameOrchestrator<D: PresentDevice, S: SurfaceProvider> {
    command_buffers: Vec<D::CommandBuffer>,
    chain: Option<PresentationChain<D>>,
    device: D,
    surface: S,

    current_image_index: u32,
    frame_started: bool,
    clear: ClearValues,
    generation: u64,
}

impl<D: PresentDevice, S: SurfaceProvider> FrameOrchestrator<D, S> {
    /// Builds the first chain generation (waiting out a minimized window if
    /// needed) and one command buffer per image slot.
    pub fn new(device: D, surface: S) -> Result<Self, FrameError> {
        let mut r = Self {
            command_buffers: Vec::new(),
            chain: None,
            device,
            surface,
            current_image_index: 0,
            frame_started: false,
            clear: ClearValues::default(),
            generation: 0,
        };
        r.recreate_chain()?;
        Ok(r)
    }

    /// Open a frame. `Ok(None)` means the chain was stale and has been rebuilt;
    /// skip this pass and call again next iteration.
    pub fn begin_frame(&mut self) -> Result<Option<D::CommandBuffer>, FrameError> {
        if self.frame_started {
            return Err(FrameError::AlreadyRecording);
        }

        let (image_index, status) = self.chain_mut()?.acquire_next_image()?;
        if status == PresentStatus::OutOfDate {
            debug!("acquire reported out-of-date; recreating");
            self.recreate_chain()?;
            return Ok(None);
        }

        // The slot's buffer may still be read by its last submission.
        self.chain_mut()?.wait_for_image(image_index)?;

        let cmd = *self
            .command_buffers
            .get(image_index as usize)
            .ok_or_else(|| anyhow!("no command buffer for image {image_index}"))?;
        self.device
            .begin_command_buffer(cmd)
            .context("begin command buffer")?;

        self.current_image_index = image_index;
        self.frame_started = true;
        Ok(Some(cmd))
    }

    /// Close the open frame, submit it and present. Stale presentation or a
    /// pending window resize triggers recreation after the submission.
    pub fn end_frame(&mut self) -> Result<(), FrameError> {
        let cmd = self.current_command_buffer()?;
        self.device
            .end_command_buffer(cmd)
            .context("end command buffer")?;

        let image_index = self.current_image_index;
        let submitted = self.chain_mut()?.submit_and_present(cmd, image_index);
        self.frame_started = false;
        let status = submitted?;

        let resized = self.surface.was_resized();
        if status.needs_recreate() || resized {
            debug!("end of frame: present={:?} resized={}; recreating", status, resized);
            self.surface.reset_resized_flag();
            self.recreate_chain()?;
        }
        Ok(())
    }

    /// Begin the swapchain render pass on the open frame and set viewport and
    /// scissor to the current extent.
    pub fn begin_render_pass(&mut self, cmd: D::CommandBuffer) -> Result<(), FrameError> {
        self.check_open(cmd)?;
        let chain = self.chain()?;
        self.device
            .cmd_begin_render_pass(cmd, chain.targets(), self.current_image_index, &self.clear);
        self.device.cmd_set_viewport_scissor(cmd, chain.extent());
        Ok(())
    }

    pub fn end_render_pass(&mut self, cmd: D::CommandBuffer) -> Result<(), FrameError> {
        self.check_open(cmd)?;
        self.device.cmd_end_render_pass(cmd);
        Ok(())
    }

    /// Push a per-draw block into the open frame. Blocks larger than
    /// [`MAX_PUSH_BLOCK_SIZE`](crate::MAX_PUSH_BLOCK_SIZE) or not a multiple of
    /// 4 bytes are rejected before anything is recorded.
    pub fn push_block<T: Pod>(
        &mut self,
        cmd: D::CommandBuffer,
        layout: D::PipelineLayout,
        block: &T,
    ) -> Result<(), FrameError> {
        self.check_open(cmd)?;
        let bytes = push_block_bytes(block)?;
        self.device.cmd_push_constants(cmd, layout, bytes);
        Ok(())
    }

    fn check_open(&self, cmd: D::CommandBuffer) -> Result<(), FrameError> {
        if self.current_command_buffer()? != cmd {
            return Err(FrameError::ForeignCommandBuffer);
        }
        Ok(())
    }

    fn recreate_chain(&mut self) -> Result<(), FrameError> {
        let mut extent = self.surface.extent();
        while extent.is_empty() {
            if self.surface.is_closing() {
                return Err(FrameError::SurfaceClosed);
            }
            debug!("surface is {}x{}; waiting for a usable size", extent.width, extent.height);
            self.surface.wait_events();
            extent = self.surface.extent();
        }
        // This rebuild consumes whatever resize was pending.
        self.surface.reset_resized_flag();

        self.device
            .wait_idle()
            .context("wait for device idle before recreation")?;

        let chain = match self.chain.take() {
            Some(previous) => PresentationChain::from_previous(self.device.clone(), extent, previous)?,
            None => PresentationChain::new(self.device.clone(), extent)?,
        };
        let image_count = chain.image_count();
        self.chain = Some(chain);
        self.generation += 1;

        if image_count != self.command_buffers.len() {
            if !self.command_buffers.is_empty() {
                info!(
                    "image count changed {} -> {}; reallocating command buffers",
                    self.command_buffers.len(),
                    image_count
                );
            }
            self.free_command_buffers();
            self.command_buffers = self
                .device
                .allocate_command_buffers(image_count)
                .context("allocate command buffers")?;
        }
        Ok(())
    }

    fn free_command_buffers(&mut self) {
        if !self.command_buffers.is_empty() {
            self.device.free_command_buffers(&self.command_buffers);
            self.command_buffers.clear();
        }
    }

    fn chain(&self) -> Result<&PresentationChain<D>, FrameError> {
        self.chain.as_ref().ok_or(FrameError::ChainLost)
    }

    fn chain_mut(&mut self) -> Result<&mut PresentationChain<D>, FrameError> {
        self.chain.as_mut().ok_or(FrameError::ChainLost)
    }

    pub fn frame_in_progress(&self) -> bool {
        self.frame_started
    }

    pub fn current_command_buffer(&self) -> Result<D::CommandBuffer, FrameError> {
        if !self.frame_started {
            return Err(FrameError::NotRecording);
        }
        self.command_buffers
            .get(self.current_image_index as usize)
            .copied()
            .ok_or(FrameError::NotRecording)
    }

    /// Frame-in-flight slot for per-frame resources, in `0..MAX_FRAMES_IN_FLIGHT`.
    /// Read from the chain, so a new generation starts again at slot 0.
    pub fn frame_index(&self) -> usize {
        self.chain.as_ref().map_or(0, PresentationChain::current_frame)
    }

    /// Image slot of the open frame.
    pub fn image_index(&self) -> Result<u32, FrameError> {
        if !self.frame_started {
            return Err(FrameError::NotRecording);
        }
        Ok(self.current_image_index)
    }

    pub fn image_count(&self) -> Result<usize, FrameError> {
        Ok(self.chain()?.image_count())
    }

    pub fn extent(&self) -> Result<RenderSize, FrameError> {
        Ok(self.chain()?.extent())
    }

    pub fn aspect_ratio(&self) -> Result<f32, FrameError> {
        Ok(self.chain()?.aspect_ratio())
    }

    /// Render pass pipelines must be compatible with. Stable across
    /// recreations unless the surface format changes.
    pub fn render_pass(&self) -> Result<<D::Targets as SwapchainTargets>::RenderPass, FrameError> {
        Ok(self.chain()?.render_pass())
    }

    /// Number of chain generations built so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear.color = rgba;
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn wait_idle(&self) -> Result<(), FrameError> {
        self.device.wait_idle().context("wait for device idle")?;
        Ok(())
    }
}

// Teardown: GPU idle, then command buffers, then the chain. The device handle
// and the surface drop afterwards as plain fields.
impl<D: PresentDevice, S: SurfaceProvider> Drop for FrameOrchestrator<D, S> {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            warn!("wait_idle during teardown failed: {e:#}");
        }
        self.free_command_buffers();
        self.chain = None;
    }
}
