// SPDX-License-Identifier: CEPL-1.0
//! One generation of presentation targets: swapchain, per-image views, depth
//! attachments and framebuffers. The render pass is shared between
//! generations as long as the color and depth formats stay the same.

use anyhow::{anyhow, bail, Context, Result};
use ash::vk;
use kiln_render::{RenderSize, SwapchainTargets};
use std::sync::Arc;
use tracing::info;

use crate::context::{find_memory_type, VkContext};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VkVsyncMode {
    #[default]
    Fifo,
    Mailbox,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VkPresentConfig {
    pub vsync: bool,
    pub vsync_mode: VkVsyncMode,
    /// Requested lower bound on swapchain images; 0 means "platform minimum + 1".
    pub min_image_count: u32,
}

impl Default for VkPresentConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            vsync_mode: VkVsyncMode::Fifo,
            min_image_count: 0,
        }
    }
}

pub(crate) struct RenderPass {
    ctx: Arc<VkContext>,
    raw: vk::RenderPass,
    color_format: vk::Format,
    depth_format: vk::Format,
}

impl RenderPass {
    // Single subpass: color cleared and stored for present, depth cleared and discarded.
    unsafe fn new(ctx: &Arc<VkContext>, color_format: vk::Format, depth_format: vk::Format) -> Result<Self> {
        let attachments = [
            vk::AttachmentDescription {
                format: color_format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                ..Default::default()
            },
            vk::AttachmentDescription {
                format: depth_format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::DONT_CARE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ..Default::default()
            },
        ];
        let color_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let subpass = vk::SubpassDescription {
            pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
            color_attachment_count: 1,
            p_color_attachments: &color_ref,
            p_depth_stencil_attachment: &depth_ref,
            ..Default::default()
        };

        // Waits for the acquire semaphore's stage before the first write.
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: stages,
            src_access_mask: vk::AccessFlags::empty(),
            dst_stage_mask: stages,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ..Default::default()
        };

        let rp_info = vk::RenderPassCreateInfo {
            s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            subpass_count: 1,
            p_subpasses: &subpass,
            dependency_count: 1,
            p_dependencies: &dependency,
            ..Default::default()
        };
        let raw = ctx
            .device
            .create_render_pass(&rp_info, None)
            .context("create_render_pass")?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            raw,
            color_format,
            depth_format,
        })
    }

    fn compatible(&self, color_format: vk::Format, depth_format: vk::Format) -> bool {
        self.color_format == color_format && self.depth_format == depth_format
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_render_pass(self.raw, None) };
    }
}

struct DepthImage {
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
}

pub struct VkSwapchainTargets {
    ctx: Arc<VkContext>,
    pub(crate) swapchain: vk::SwapchainKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    depth: Vec<DepthImage>,
    framebuffers: Vec<vk::Framebuffer>,
    // Destroyed after the framebuffers (Drop body runs before fields drop).
    render_pass: Arc<RenderPass>,
}

impl VkSwapchainTargets {
    pub(crate) fn new(
        ctx: &Arc<VkContext>,
        cfg: &VkPresentConfig,
        want: RenderSize,
        previous: Option<&VkSwapchainTargets>,
    ) -> Result<Self> {
        unsafe {
            let surf_i = &ctx.surface_loader;
            let caps = surf_i
                .get_physical_device_surface_capabilities(ctx.phys, ctx.surface)
                .context("surface capabilities")?;
            let formats = surf_i
                .get_physical_device_surface_formats(ctx.phys, ctx.surface)
                .context("surface formats")?;
            let modes = surf_i
                .get_physical_device_surface_present_modes(ctx.phys, ctx.surface)
                .context("surface present modes")?;

            let (surf_format, pick_reason) =
                pick_surface_format(&formats).ok_or_else(|| anyhow!("surface reports no formats"))?;
            let present_mode = choose_present_mode(&modes, cfg.vsync, cfg.vsync_mode);
            let extent = extent_from_caps(&caps, want);
            if extent.width == 0 || extent.height == 0 {
                bail!("surface extent is {}x{}", extent.width, extent.height);
            }
            let min_count = pick_image_count(&caps, cfg.min_image_count);

            // Prefer IDENTITY if supported, otherwise use current to avoid extra blits.
            let pre_transform = if caps
                .supported_transforms
                .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
            {
                vk::SurfaceTransformFlagsKHR::IDENTITY
            } else {
                caps.current_transform
            };

            let render_pass = match previous {
                Some(p) if p.render_pass.compatible(surf_format.format, ctx.depth_format) => {
                    Arc::clone(&p.render_pass)
                }
                _ => Arc::new(RenderPass::new(ctx, surf_format.format, ctx.depth_format)?),
            };

            let old_swapchain = previous.map_or(vk::SwapchainKHR::null(), |p| p.swapchain);
            let swap_info = vk::SwapchainCreateInfoKHR {
                s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
                surface: ctx.surface,
                min_image_count: min_count,
                image_format: surf_format.format,
                image_color_space: surf_format.color_space,
                image_extent: extent,
                image_array_layers: 1,
                image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                image_sharing_mode: vk::SharingMode::EXCLUSIVE,
                pre_transform,
                composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                present_mode,
                clipped: vk::TRUE,
                old_swapchain,
                ..Default::default()
            };

            let swapchain = ctx
                .swapchain_loader
                .create_swapchain(&swap_info, None)
                .context("create_swapchain")?;

            // From here on, partial state is released by Drop if a step fails.
            let mut targets = Self {
                ctx: Arc::clone(ctx),
                swapchain,
                extent,
                images: Vec::new(),
                views: Vec::new(),
                depth: Vec::new(),
                framebuffers: Vec::new(),
                render_pass,
            };
            targets.images = ctx
                .swapchain_loader
                .get_swapchain_images(swapchain)
                .context("get_swapchain_images")?;

            for &img in &targets.images {
                let view = create_view(ctx, img, surf_format.format, vk::ImageAspectFlags::COLOR)?;
                targets.views.push(view);
            }
            for _ in 0..targets.images.len() {
                let depth = create_depth_image(ctx, extent)?;
                targets.depth.push(depth);
            }
            for (view, depth) in targets.views.iter().zip(&targets.depth) {
                let attachments = [*view, depth.view];
                let fb_info = vk::FramebufferCreateInfo {
                    s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                    render_pass: targets.render_pass.raw,
                    attachment_count: attachments.len() as u32,
                    p_attachments: attachments.as_ptr(),
                    width: extent.width,
                    height: extent.height,
                    layers: 1,
                    ..Default::default()
                };
                let fb = ctx
                    .device
                    .create_framebuffer(&fb_info, None)
                    .context("create_framebuffer")?;
                targets.framebuffers.push(fb);
            }

            info!(
                "vk: swapchain {}x{} format={:?}/{:?} ({}) present_mode={:?} vsync={} images(min={} → got={}) depth={:?} pass={}",
                extent.width,
                extent.height,
                surf_format.format,
                surf_format.color_space,
                pick_reason,
                present_mode,
                cfg.vsync,
                min_count,
                targets.images.len(),
                ctx.depth_format,
                if previous.is_some_and(|p| Arc::ptr_eq(&p.render_pass, &targets.render_pass)) {
                    "reused"
                } else {
                    "new"
                },
            );
            Ok(targets)
        }
    }

    pub(crate) fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }

    pub(crate) fn vk_extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl SwapchainTargets for VkSwapchainTargets {
    type RenderPass = vk::RenderPass;

    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn extent(&self) -> RenderSize {
        RenderSize::new(self.extent.width, self.extent.height)
    }

    fn render_pass(&self) -> vk::RenderPass {
        self.render_pass.raw
    }
}

// STRICT TEARDOWN ORDER: framebuffers, depth, views, swapchain; the render pass
// goes with the last generation that shares it.
impl Drop for VkSwapchainTargets {
    fn drop(&mut self) {
        unsafe {
            let d = &self.ctx.device;
            for &fb in &self.framebuffers {
                d.destroy_framebuffer(fb, None);
            }
            for depth in &self.depth {
                d.destroy_image_view(depth.view, None);
                d.destroy_image(depth.image, None);
                d.free_memory(depth.memory, None);
            }
            for &iv in &self.views {
                d.destroy_image_view(iv, None);
            }
            self.ctx.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

unsafe fn create_view(
    ctx: &VkContext,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let view_ci = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    ctx.device
        .create_image_view(&view_ci, None)
        .context("create_image_view")
}

unsafe fn create_depth_image(ctx: &VkContext, extent: vk::Extent2D) -> Result<DepthImage> {
    let d = &ctx.device;
    let img_ci = vk::ImageCreateInfo {
        s_type: vk::StructureType::IMAGE_CREATE_INFO,
        image_type: vk::ImageType::TYPE_2D,
        format: ctx.depth_format,
        extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
        mip_levels: 1,
        array_layers: 1,
        samples: vk::SampleCountFlags::TYPE_1,
        tiling: vk::ImageTiling::OPTIMAL,
        usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        ..Default::default()
    };
    let image = d.create_image(&img_ci, None).context("create depth image")?;

    let mem_req = d.get_image_memory_requirements(image);
    let Some(type_index) = find_memory_type(
        &ctx.memory_props,
        mem_req.memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    ) else {
        d.destroy_image(image, None);
        bail!("no device-local memory type for the depth image");
    };
    let alloc = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: mem_req.size,
        memory_type_index: type_index,
        ..Default::default()
    };
    let memory = match d.allocate_memory(&alloc, None) {
        Ok(m) => m,
        Err(e) => {
            d.destroy_image(image, None);
            return Err(e).context("allocate depth memory");
        }
    };
    let view = d
        .bind_image_memory(image, memory, 0)
        .context("bind depth memory")
        .and_then(|()| create_view(ctx, image, ctx.depth_format, depth_aspect(ctx.depth_format)));
    match view {
        Ok(view) => Ok(DepthImage { image, memory, view }),
        Err(e) => {
            d.destroy_image(image, None);
            d.free_memory(memory, None);
            Err(e)
        }
    }
}

fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

pub(crate) fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    vsync: bool,
    mode: VkVsyncMode,
) -> vk::PresentModeKHR {
    let preference: &[vk::PresentModeKHR] = match (vsync, mode) {
        (false, _) => &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX],
        (true, VkVsyncMode::Mailbox) => &[vk::PresentModeKHR::MAILBOX],
        (true, VkVsyncMode::Fifo) => &[],
    };
    // FIFO is the only mode every implementation must support.
    preference
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub(crate) fn pick_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Option<(vk::SurfaceFormatKHR, &'static str)> {
    if let Some(f) = formats
        .iter()
        .copied()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB)
    {
        return Some((f, "bgra8_srgb"));
    }
    if let Some(f) = formats
        .iter()
        .copied()
        .find(|f| f.format == vk::Format::R8G8B8A8_SRGB)
    {
        return Some((f, "rgba8_srgb"));
    }
    if let Some(f) = formats.iter().copied().find(|f| {
        f.format == vk::Format::B8G8R8A8_UNORM && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    }) {
        return Some((f, "bgra8_unorm_srgbcs"));
    }
    formats.first().map(|&f| (f, "driver_default"))
}

/// The surface's fixed size when it has one, otherwise the window size clamped
/// to what the surface accepts.
pub(crate) fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum for overlap, raised to `requested`, capped by the
/// maximum (0 == "no max").
pub(crate) fn pick_image_count(caps: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let want = (caps.min_image_count + 1).max(requested);
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}
