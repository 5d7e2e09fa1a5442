// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend for the frame core, built on `ash`.

use anyhow::{anyhow, Context, Result};
use ash::vk;
use kiln_render::{ClearValues, PresentDevice, PresentStatus, RenderSize};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use tracing::warn;

mod context;
mod swapchain;

use context::VkContext;
pub use swapchain::{VkPresentConfig, VkSwapchainTargets, VkVsyncMode};

/// Cheap, clonable handle onto one device and its graphics/present queue.
#[derive(Clone)]
pub struct VkPresentDevice {
    ctx: Arc<VkContext>,
    cfg: VkPresentConfig,
}

impl VkPresentDevice {
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        cfg: VkPresentConfig,
    ) -> Result<Self> {
        let ctx = VkContext::new(window, display)?;
        Ok(Self {
            ctx: Arc::new(ctx),
            cfg,
        })
    }
}

/// Recoverable staleness comes back as a status; every other failure is fatal.
fn classify(result: ash::prelude::VkResult<bool>, what: &str) -> Result<PresentStatus> {
    match result {
        Ok(false) => Ok(PresentStatus::Ok),
        Ok(true) => Ok(PresentStatus::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
        Err(e) => Err(anyhow!("{what}: {e:?}")),
    }
}

impl PresentDevice for VkPresentDevice {
    type CommandBuffer = vk::CommandBuffer;
    type Fence = vk::Fence;
    type Semaphore = vk::Semaphore;
    type PipelineLayout = vk::PipelineLayout;
    type Targets = VkSwapchainTargets;

    fn create_targets(&self, extent: RenderSize, previous: Option<&VkSwapchainTargets>) -> Result<VkSwapchainTargets> {
        VkSwapchainTargets::new(&self.ctx, &self.cfg, extent, previous)
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        unsafe { self.ctx.device.create_fence(&info, None) }.context("create_fence")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.ctx.device.destroy_fence(fence, None) }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        unsafe { self.ctx.device.create_semaphore(&info, None) }.context("create_semaphore")
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.ctx.device.destroy_semaphore(semaphore, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.ctx.device.wait_for_fences(&[fence], true, u64::MAX) }.context("wait_for_fences")
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.ctx.device.reset_fences(&[fence]) }.context("reset_fences")
    }

    fn acquire_next_image(&self, targets: &VkSwapchainTargets, signal: vk::Semaphore) -> Result<(u32, PresentStatus)> {
        let result = unsafe {
            self.ctx
                .swapchain_loader
                .acquire_next_image(targets.swapchain, u64::MAX, signal, vk::Fence::null())
        };
        let image_index = result.as_ref().map_or(0, |&(i, _)| i);
        let status = classify(result.map(|(_, suboptimal)| suboptimal), "acquire_next_image")?;
        Ok((image_index, status))
    }

    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &signal,
            ..Default::default()
        };
        unsafe {
            self.ctx
                .device
                .queue_submit(self.ctx.queue, std::slice::from_ref(&submit), fence)
        }
        .context("queue_submit")
    }

    fn present(&self, targets: &VkSwapchainTargets, image_index: u32, wait: vk::Semaphore) -> Result<PresentStatus> {
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &targets.swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        let result = unsafe { self.ctx.swapchain_loader.queue_present(self.ctx.queue, &present) };
        classify(result, "queue_present")
    }

    fn allocate_command_buffers(&self, count: usize) -> Result<Vec<vk::CommandBuffer>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.ctx.cmd_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count as u32,
            ..Default::default()
        };
        unsafe { self.ctx.device.allocate_command_buffers(&alloc_info) }.context("allocate_command_buffers")
    }

    fn free_command_buffers(&self, bufs: &[vk::CommandBuffer]) {
        if bufs.is_empty() {
            return;
        }
        unsafe { self.ctx.device.free_command_buffers(self.ctx.cmd_pool, bufs) }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            ..Default::default()
        };
        // The pool was created with RESET_COMMAND_BUFFER, so begin resets.
        unsafe { self.ctx.device.begin_command_buffer(cmd, &begin) }.context("begin_command_buffer")
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.ctx.device.end_command_buffer(cmd) }.context("end_command_buffer")
    }

    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        targets: &VkSwapchainTargets,
        image_index: u32,
        clear: &ClearValues,
    ) {
        let Some(framebuffer) = targets.framebuffer(image_index) else {
            warn!("vk: no framebuffer for image {image_index}; render pass skipped");
            return;
        };
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: clear.color },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: clear.depth,
                    stencil: clear.stencil,
                },
            },
        ];
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: kiln_render::SwapchainTargets::render_pass(targets),
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: targets.vk_extent(),
            },
            clear_value_count: clear_values.len() as u32,
            p_clear_values: clear_values.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.ctx
                .device
                .cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE)
        }
    }

    fn cmd_set_viewport_scissor(&self, cmd: vk::CommandBuffer, extent: RenderSize) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: extent.width,
                height: extent.height,
            },
        };
        unsafe {
            self.ctx.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.ctx.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.ctx.device.cmd_end_render_pass(cmd) }
    }

    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, layout: vk::PipelineLayout, bytes: &[u8]) {
        unsafe {
            self.ctx.device.cmd_push_constants(
                cmd,
                layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                bytes,
            )
        }
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.ctx.device.device_wait_idle() }.context("device_wait_idle")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_results_map_to_status() {
        assert_eq!(classify(Ok(false), "present").unwrap(), PresentStatus::Ok);
        assert_eq!(classify(Ok(true), "present").unwrap(), PresentStatus::Suboptimal);
        assert_eq!(
            classify(Err(vk::Result::ERROR_OUT_OF_DATE_KHR), "present").unwrap(),
            PresentStatus::OutOfDate
        );
    }

    #[test]
    fn other_errors_are_fatal_and_named() {
        let err = classify(Err(vk::Result::ERROR_DEVICE_LOST), "queue_present").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("queue_present"), "{msg}");
        assert!(msg.contains("DEVICE_LOST"), "{msg}");
    }

    #[test]
    fn surface_lost_is_not_treated_as_stale() {
        assert!(classify(Err(vk::Result::ERROR_SURFACE_LOST_KHR), "acquire_next_image").is_err());
    }
}
