//! Axis-aligned boxes and three-way frustum classification.
//!
//! The terrain is laid out on the XY plane with Z up. Planes are stored as
//! `Vec4(nx, ny, nz, d)` with inward-pointing unit normals, so a point `p` is
//! inside a plane when `n.dot(p) + d >= 0`.

use glam::{Mat4, Vec3, Vec4};

/// An axis-aligned bounding box in world space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    /// Minimum corner of the bounding box.
    pub min: Vec3,
    /// Maximum corner of the bounding box.
    pub max: Vec3,
}

impl Aabb {
    /// Create a new AABB from min and max corners.
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Returns the center point of the AABB.
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Returns the half-extents (half-size along each axis).
    pub fn extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Squared distance from `point` to the closest point of the box
    /// (zero when the point is inside).
    pub fn min_distance_sq(&self, point: Vec3) -> f32 {
        let clamped = point.clamp(self.min, self.max);
        clamped.distance_squared(point)
    }

    /// Squared distance from `point` to the farthest corner of the box.
    pub fn max_distance_sq(&self, point: Vec3) -> f32 {
        let near = (point - self.min).abs();
        let far = (point - self.max).abs();
        near.max(far).length_squared()
    }

    /// Whether the box touches the sphere of squared radius `radius_sq`.
    pub fn intersects_sphere_sq(&self, center: Vec3, radius_sq: f32) -> bool {
        self.min_distance_sq(center) <= radius_sq
    }
}

/// Result of testing a box against the frustum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intersection {
    /// The box is entirely inside the frustum.
    Inside,
    /// The box straddles one or more planes.
    Intersecting,
    /// The box is entirely outside the frustum.
    Outside,
}

/// Plane indices into the frustum planes array.
const LEFT: usize = 0;
const RIGHT: usize = 1;
const BOTTOM: usize = 2;
const TOP: usize = 3;
const NEAR: usize = 4;
const FAR: usize = 5;

/// Six inward-pointing planes: left, right, bottom, top, near, far.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    /// Extract frustum planes from a view-projection matrix with a `[0, 1]`
    /// depth range using the Gribb/Hartmann method.
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let rows = [vp.row(0), vp.row(1), vp.row(2), vp.row(3)];

        let mut planes = [Vec4::ZERO; 6];
        planes[LEFT] = rows[3] + rows[0];
        planes[RIGHT] = rows[3] - rows[0];
        planes[BOTTOM] = rows[3] + rows[1];
        planes[TOP] = rows[3] - rows[1];
        planes[NEAR] = rows[2];
        planes[FAR] = rows[3] - rows[2];

        Self::from_planes(planes)
    }

    /// Build a frustum from six caller-supplied planes, normalizing each one.
    pub fn from_planes(mut planes: [Vec4; 6]) -> Self {
        for plane in &mut planes {
            let len = plane.truncate().length();
            if len > 1e-8 {
                *plane /= len;
            }
        }
        Self { planes }
    }

    /// A frustum that classifies every box as `Inside`.
    pub fn infinite() -> Self {
        Self {
            planes: [Vec4::W; 6],
        }
    }

    /// The normalized planes.
    pub fn planes(&self) -> &[Vec4; 6] {
        &self.planes
    }

    /// Classify an AABB against all six planes.
    pub fn test_aabb(&self, aabb: &Aabb) -> Intersection {
        let center = aabb.center();
        let half_extents = aabb.extents();
        let mut all_inside = true;

        for plane in &self.planes {
            let normal = plane.truncate();

            // Projection of the half extents onto the plane normal.
            let effective_radius = half_extents.x * normal.x.abs()
                + half_extents.y * normal.y.abs()
                + half_extents.z * normal.z.abs();

            let signed_dist = normal.dot(center) + plane.w;

            if signed_dist < -effective_radius {
                return Intersection::Outside;
            }
            if signed_dist < effective_radius {
                all_inside = false;
            }
        }

        if all_inside {
            Intersection::Inside
        } else {
            Intersection::Intersecting
        }
    }
}

impl Default for Frustum {
    fn default() -> Self {
        Self::infinite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Camera 100 m above the origin looking along +X, Z up.
    fn camera_vp() -> Mat4 {
        let view = Mat4::look_to_rh(Vec3::new(0.0, 0.0, 100.0), Vec3::X, Vec3::Z);
        let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 1.0, 5000.0);
        proj * view
    }

    #[test]
    fn test_box_ahead_is_visible() {
        let frustum = Frustum::from_view_projection(&camera_vp());
        let aabb = Aabb::new(Vec3::new(50.0, -5.0, 95.0), Vec3::new(60.0, 5.0, 105.0));
        assert_eq!(frustum.test_aabb(&aabb), Intersection::Inside);
    }

    #[test]
    fn test_box_behind_is_outside() {
        let frustum = Frustum::from_view_projection(&camera_vp());
        let aabb = Aabb::new(Vec3::new(-60.0, -5.0, 95.0), Vec3::new(-50.0, 5.0, 105.0));
        assert_eq!(frustum.test_aabb(&aabb), Intersection::Outside);
    }

    #[test]
    fn test_box_beyond_far_plane_is_outside() {
        let frustum = Frustum::from_view_projection(&camera_vp());
        let aabb = Aabb::new(Vec3::new(6000.0, -5.0, 95.0), Vec3::new(6010.0, 5.0, 105.0));
        assert_eq!(frustum.test_aabb(&aabb), Intersection::Outside);
    }

    #[test]
    fn test_box_straddling_plane_intersects() {
        let frustum = Frustum::from_view_projection(&camera_vp());
        let aabb = Aabb::new(Vec3::new(-10.0, -5.0, 95.0), Vec3::new(10.0, 5.0, 105.0));
        assert_eq!(frustum.test_aabb(&aabb), Intersection::Intersecting);
    }

    #[test]
    fn test_infinite_frustum_accepts_everything() {
        let frustum = Frustum::infinite();
        let aabb = Aabb::new(Vec3::splat(-1.0e6), Vec3::splat(1.0e6));
        assert_eq!(frustum.test_aabb(&aabb), Intersection::Inside);
    }

    #[test]
    fn test_planes_are_normalized() {
        let frustum = Frustum::from_view_projection(&camera_vp());
        for plane in frustum.planes() {
            let len = plane.truncate().length();
            assert!((len - 1.0).abs() < 1e-4, "plane normal not normalized: {len}");
        }
    }

    #[test]
    fn test_distance_queries() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::new(10.0, 10.0, 2.0));
        assert_eq!(aabb.min_distance_sq(Vec3::new(5.0, 5.0, 1.0)), 0.0);
        assert_eq!(aabb.min_distance_sq(Vec3::new(13.0, 5.0, 1.0)), 9.0);
        assert_eq!(aabb.max_distance_sq(Vec3::ZERO), 204.0);
        assert!(aabb.intersects_sphere_sq(Vec3::new(13.0, 5.0, 1.0), 9.0));
        assert!(!aabb.intersects_sphere_sq(Vec3::new(13.0, 5.0, 1.0), 8.9));
    }
}
