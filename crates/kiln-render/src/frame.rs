// SPDX-License-Identifier: CEPL-1.0
use anyhow::{bail, Result};
use bytemuck::Pod;
use kiln_math::Camera;

/// Smallest push-constant range every Vulkan implementation guarantees.
pub const MAX_PUSH_BLOCK_SIZE: usize = 128;

/// Everything a render system gets for one frame. The frame index is passed
/// by value; there is no global "current frame".
#[derive(Clone, Copy, Debug)]
pub struct FrameInfo<'a, C> {
    /// Frame-in-flight slot, in `0..MAX_FRAMES_IN_FLIGHT`.
    pub frame_index: usize,
    /// Seconds since the previous frame.
    pub frame_time: f32,
    pub command_buffer: C,
    pub camera: &'a Camera,
}

/// Records draw work into an open frame. Called between
/// `begin_render_pass` and `end_render_pass`.
pub trait RenderSystem<C> {
    fn render(&mut self, frame: &FrameInfo<'_, C>) -> Result<()>;
}

/// Bytes of a per-draw push block. The contents are opaque here; only the size
/// is checked against [`MAX_PUSH_BLOCK_SIZE`] and the push-constant alignment.
pub fn push_block_bytes<T: Pod>(block: &T) -> Result<&[u8]> {
    let size = std::mem::size_of::<T>();
    if size > MAX_PUSH_BLOCK_SIZE {
        bail!("push block of {size} bytes exceeds the {MAX_PUSH_BLOCK_SIZE}-byte limit");
    }
    if size % 4 != 0 {
        bail!("push block size {size} is not a multiple of 4");
    }
    Ok(bytemuck::bytes_of(block))
}
