//! Camera and view management.
//!
//! World space is right-handed with +Z up.

use glam::{Mat4, Vec2, Vec3};
use std::f32::consts::FRAC_PI_2;

/// World up axis.
pub const WORLD_UP: Vec3 = Vec3::Z;

/// Latitude limit of the orbit camera, just inside the poles.
pub const MAX_LATITUDE: f32 = FRAC_PI_2 - 1.0e-6;

/// Perspective camera looking at a target.
#[derive(Debug, Clone)]
pub struct Camera {
    pub eye: Vec3,
    pub target: Vec3,
    /// Vertical field of view in radians.
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: Vec3::new(0.0, 3.0, 0.0),
            target: Vec3::ZERO,
            fov: 60f32.to_radians(),
            aspect: 16.0 / 9.0,
            near: 0.01,
            far: 100.0,
        }
    }
}

impl Camera {
    /// Set the aspect ratio from a render area, ignoring empty areas.
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, self.target, WORLD_UP)
    }

    /// Perspective projection with depth in `[0, 1]`.
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far)
    }

    /// Get the view-projection matrix.
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }
}

/// Camera orbiting a centre point on a sphere.
#[derive(Debug, Clone)]
pub struct OrbitCamera {
    /// Angle above the XY plane in radians.
    pub latitude: f32,
    /// Angle around the Z axis in radians, 0 looking from +Y.
    pub longitude: f32,
    pub radius: f32,
    pub center: Vec3,
    /// Radians per unit of drag in normalized device coordinates.
    pub orbit_speed: f32,
    /// Relative radius change per scroll step.
    pub zoom_speed: f32,
}

impl Default for OrbitCamera {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            radius: 3.0,
            center: Vec3::ZERO,
            orbit_speed: 2.0,
            zoom_speed: 0.1,
        }
    }
}

impl OrbitCamera {
    /// Position on the orbit sphere.
    pub fn eye(&self) -> Vec3 {
        let (sin_lat, cos_lat) = self.latitude.sin_cos();
        let (sin_long, cos_long) = self.longitude.sin_cos();
        self.center + self.radius * Vec3::new(cos_lat * sin_long, cos_lat * cos_long, sin_lat)
    }

    /// Rotate by a drag of `delta` in normalized device coordinates.
    pub fn drag(&mut self, delta: Vec2) {
        self.longitude += delta.x * self.orbit_speed;
        self.latitude = (self.latitude - delta.y * self.orbit_speed).clamp(-MAX_LATITUDE, MAX_LATITUDE);
    }

    /// Move closer for positive `steps`, further for negative, keeping the
    /// radius within `[near, far]`.
    pub fn zoom(&mut self, steps: f32, near: f32, far: f32) {
        let factor = (1.0 + self.zoom_speed).powf(-steps);
        self.radius = (self.radius * factor).clamp(near, far);
    }

    /// Point `camera` at the centre from the current orbit position.
    pub fn apply(&self, camera: &mut Camera) {
        camera.eye = self.eye();
        camera.target = self.center;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn assert_vec3_eq(a: Vec3, b: Vec3) {
        assert_relative_eq!(a.x, b.x, epsilon = 1e-5);
        assert_relative_eq!(a.y, b.y, epsilon = 1e-5);
        assert_relative_eq!(a.z, b.z, epsilon = 1e-5);
    }

    #[test]
    fn orbit_starts_on_positive_y() {
        let orbit = OrbitCamera::default();
        assert_vec3_eq(orbit.eye(), Vec3::new(0.0, 3.0, 0.0));

        let orbit = OrbitCamera {
            latitude: MAX_LATITUDE,
            ..OrbitCamera::default()
        };
        assert_vec3_eq(orbit.eye(), Vec3::new(0.0, 0.0, 3.0));
    }

    #[test]
    fn orbit_keeps_radius_around_center() {
        let orbit = OrbitCamera {
            latitude: 0.4,
            longitude: 2.1,
            radius: 5.0,
            center: Vec3::new(1.0, -2.0, 0.5),
            ..OrbitCamera::default()
        };
        assert_relative_eq!(orbit.eye().distance(orbit.center), 5.0, epsilon = 1e-5);
    }

    #[test]
    fn drag_clamps_latitude() {
        let mut orbit = OrbitCamera::default();
        orbit.drag(Vec2::new(0.0, -10.0));
        assert_relative_eq!(orbit.latitude, MAX_LATITUDE);
        orbit.drag(Vec2::new(0.5, 20.0));
        assert_relative_eq!(orbit.latitude, -MAX_LATITUDE);
        assert_relative_eq!(orbit.longitude, 1.0);
    }

    #[test]
    fn zoom_stays_within_clip_range() {
        let mut orbit = OrbitCamera::default();
        orbit.zoom(1.0, 0.01, 100.0);
        assert_relative_eq!(orbit.radius, 3.0 / 1.1, epsilon = 1e-5);
        orbit.zoom(-1.0, 0.01, 100.0);
        assert_relative_eq!(orbit.radius, 3.0, epsilon = 1e-5);

        orbit.zoom(-1000.0, 0.01, 100.0);
        assert_relative_eq!(orbit.radius, 100.0);
        orbit.zoom(1000.0, 0.01, 100.0);
        assert_relative_eq!(orbit.radius, 0.01);
    }

    #[test]
    fn view_puts_target_in_front() {
        let mut camera = Camera::default();
        OrbitCamera::default().apply(&mut camera);
        let target = camera.view_matrix().transform_point3(camera.target);
        assert_vec3_eq(target, Vec3::new(0.0, 0.0, -3.0));

        // World up stays up on screen
        let above = camera.view_matrix().transform_point3(Vec3::Z);
        assert!(above.y > 0.0);
    }

    #[test]
    fn projection_depth_is_zero_to_one() {
        let camera = Camera::default();
        let proj = camera.projection_matrix();
        let near = proj.project_point3(Vec3::new(0.0, 0.0, -camera.near));
        let far = proj.project_point3(Vec3::new(0.0, 0.0, -camera.far));
        assert_relative_eq!(near.z, 0.0, epsilon = 1e-5);
        assert_relative_eq!(far.z, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn empty_viewport_keeps_aspect() {
        let mut camera = Camera::default();
        camera.set_viewport(800, 600);
        assert_relative_eq!(camera.aspect, 800.0 / 600.0);
        camera.set_viewport(0, 600);
        assert_relative_eq!(camera.aspect, 800.0 / 600.0);
    }
}
