// SPDX-License-Identifier: CEPL-1.0
//! Presentable images plus the fences and semaphores that gate their reuse.
//!
//! Two independent rings are in play. Frame slots (`MAX_FRAMES_IN_FLIGHT` of
//! them) own a semaphore pair and a fence each and rotate on every submission.
//! Image slots (one per swapchain image) only remember which frame fence last
//! wrote them, so a slot is never handed to the GPU again before that fence
//! has signalled.

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::device::{PresentDevice, PresentStatus, SwapchainTargets};
use crate::{RenderSize, MAX_FRAMES_IN_FLIGHT};

struct FrameSync<D: PresentDevice> {
    device: D,
    image_available: Vec<D::Semaphore>,
    render_finished: Vec<D::Semaphore>,
    in_flight: Vec<D::Fence>,
}

impl<D: PresentDevice> FrameSync<D> {
    fn new(device: D) -> Result<Self> {
        let mut sync = FrameSync {
            device,
            image_available: Vec::with_capacity(MAX_FRAMES_IN_FLIGHT),
            render_finished: Vec::with_capacity(MAX_FRAMES_IN_FLIGHT),
            in_flight: Vec::with_capacity(MAX_FRAMES_IN_FLIGHT),
        };
        // Partially built sets are released by Drop on the error path.
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            let s = sync.device.create_semaphore().context("create image-available semaphore")?;
            sync.image_available.push(s);
            let s = sync.device.create_semaphore().context("create render-finished semaphore")?;
            sync.render_finished.push(s);
            // Signalled so the first wait on each frame slot returns at once.
            let f = sync.device.create_fence(true).context("create in-flight fence")?;
            sync.in_flight.push(f);
        }
        Ok(sync)
    }
}

impl<D: PresentDevice> Drop for FrameSync<D> {
    fn drop(&mut self) {
        for &f in &self.in_flight {
            self.device.destroy_fence(f);
        }
        for &s in self.render_finished.iter().chain(&self.image_available) {
            self.device.destroy_semaphore(s);
        }
    }
}

/// One generation of the presentation chain.
///
/// Field order is teardown order: synchronization objects go first, then the
/// targets they guarded.
pub struct PresentationChain<D: PresentDevice> {
    sync: FrameSync<D>,
    targets: D::Targets,
    images_in_flight: Vec<Option<D::Fence>>,
    current_frame: usize,
    device: D,
}

impl<D: PresentDevice> PresentationChain<D> {
    pub fn new(device: D, extent: RenderSize) -> Result<Self> {
        Self::build(device, extent, None)
    }

    /// Build the successor of `previous`, which is consumed: its swapchain and
    /// compatible resources are offered to the backend, then it is released
    /// before this returns.
    pub fn from_previous(device: D, extent: RenderSize, previous: Self) -> Result<Self> {
        Self::build(device, extent, Some(previous))
    }

    fn build(device: D, extent: RenderSize, previous: Option<Self>) -> Result<Self> {
        let targets = device
            .create_targets(extent, previous.as_ref().map(|p| &p.targets))
            .context("create swapchain targets")?;
        drop(previous);

        let image_count = targets.image_count();
        if image_count == 0 {
            bail!("swapchain reported no images");
        }
        let sync = FrameSync::new(device.clone())?;

        let got = targets.extent();
        info!(
            "presentation chain ready ({}x{}, {} images, {} frames in flight)",
            got.width, got.height, image_count, MAX_FRAMES_IN_FLIGHT
        );

        Ok(Self {
            sync,
            targets,
            images_in_flight: vec![None; image_count],
            current_frame: 0,
            device,
        })
    }

    /// Wait for the current frame slot's previous submission, then take the
    /// next image from the presentation engine. This is where the render loop
    /// is paced against the display.
    pub fn acquire_next_image(&mut self) -> Result<(u32, PresentStatus)> {
        let frame = self.current_frame;
        self.device
            .wait_for_fence(self.sync.in_flight[frame])
            .context("wait for frame fence")?;

        let (image_index, status) = self
            .device
            .acquire_next_image(&self.targets, self.sync.image_available[frame])
            .context("acquire next image")?;

        if status != PresentStatus::OutOfDate && image_index as usize >= self.image_count() {
            bail!(
                "acquired image {} but the chain only has {}",
                image_index,
                self.image_count()
            );
        }
        Ok((image_index, status))
    }

    /// Block until the last submission that wrote `image_index` has finished.
    pub fn wait_for_image(&mut self, image_index: u32) -> Result<()> {
        let slot = self.slot(image_index)?;
        if let Some(fence) = self.images_in_flight[slot] {
            self.device
                .wait_for_fence(fence)
                .context("wait for image fence")?;
        }
        Ok(())
    }

    /// Submit `cmd` for `image_index` and queue the image for presentation.
    ///
    /// The frame counter advances once the submission reached the queue, no
    /// matter what presentation reports.
    pub fn submit_and_present(&mut self, cmd: D::CommandBuffer, image_index: u32) -> Result<PresentStatus> {
        self.wait_for_image(image_index)?;

        let slot = self.slot(image_index)?;
        let frame = self.current_frame;
        let fence = self.sync.in_flight[frame];
        self.images_in_flight[slot] = Some(fence);

        self.device.reset_fence(fence).context("reset frame fence")?;
        self.device
            .submit(
                cmd,
                self.sync.image_available[frame],
                self.sync.render_finished[frame],
                fence,
            )
            .context("queue submit")?;

        let presented = self
            .device
            .present(&self.targets, image_index, self.sync.render_finished[frame]);
        self.current_frame = (frame + 1) % MAX_FRAMES_IN_FLIGHT;

        let status = presented.context("queue present")?;
        if status != PresentStatus::Ok {
            debug!("present of image {} reported {:?}", image_index, status);
        }
        Ok(status)
    }

    fn slot(&self, image_index: u32) -> Result<usize> {
        let slot = image_index as usize;
        if slot >= self.images_in_flight.len() {
            bail!("image index {} out of range ({} images)", image_index, self.images_in_flight.len());
        }
        Ok(slot)
    }

    pub fn image_count(&self) -> usize {
        self.targets.image_count()
    }

    pub fn extent(&self) -> RenderSize {
        self.targets.extent()
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.extent().aspect_ratio()
    }

    pub fn render_pass(&self) -> <D::Targets as SwapchainTargets>::RenderPass {
        self.targets.render_pass()
    }

    pub fn targets(&self) -> &D::Targets {
        &self.targets
    }

    /// Frame-in-flight slot the next acquire will use.
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Fence of the submission that last wrote `image_index`, if any.
    pub fn frame_fence_for_image(&self, image_index: u32) -> Option<D::Fence> {
        self.images_in_flight.get(image_index as usize).copied().flatten()
    }
}
