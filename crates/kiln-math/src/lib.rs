// SPDX-License-Identifier: CEPL-1.0
pub use glam::{Mat4, Vec3};

/// View-projection state handed to render systems each frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    projection: Mat4,
    view: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
        }
    }
}

impl Camera {
    /// Right-handed, depth 0..1 (Vulkan clip space).
    pub fn set_perspective(&mut self, fovy: f32, aspect: f32, near: f32, far: f32) {
        debug_assert!(aspect.is_finite() && aspect > 0.0, "aspect must be positive");
        self.projection = Mat4::perspective_rh(fovy, aspect, near, far);
    }

    pub fn look_at(&mut self, eye: Vec3, target: Vec3, up: Vec3) {
        self.view = Mat4::look_at_rh(eye, target, up);
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    pub fn view(&self) -> Mat4 {
        self.view
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }
}
