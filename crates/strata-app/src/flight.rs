//! Scripted camera flight: a circle around the world center at a fixed
//! clearance above the terrain, looking along the direction of travel.

use std::f32::consts::TAU;

use glam::{Mat4, Vec2, Vec3};
use strata_cdlod::Frustum;
use strata_config::Config;
use strata_terrain::HeightmapSampler;

const CLEARANCE: f32 = 40.0;
const SPEED: f32 = 60.0;
const PITCH_DOWN: f32 = 0.25;
const NEAR_PLANE: f32 = 0.5;
const ASPECT: f32 = 16.0 / 9.0;

/// Camera pose at one point of the flight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlightCamera {
    pub position: Vec3,
    /// Unit view direction.
    pub forward: Vec3,
}

/// Circular flight path over the configured world.
#[derive(Clone, Debug)]
pub struct FlightPath {
    center: Vec2,
    radius: f32,
    angular_speed: f32,
    fov_y: f32,
    far: f32,
}

impl FlightPath {
    pub fn new(center: Vec2, radius: f32, fov_y: f32, far: f32) -> Self {
        let radius = radius.max(1.0);
        Self {
            center,
            radius,
            angular_speed: SPEED / radius,
            fov_y,
            far: far.max(NEAR_PLANE * 2.0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let origin = Vec2::from(config.world.origin);
        let size = Vec2::from(config.world.size);
        Self::new(
            origin + size * 0.5,
            size.min_element() * 0.35,
            config.camera.fov_y_degrees.to_radians(),
            config.lod.max_visibility_distance,
        )
    }

    /// Ground position at `time` seconds.
    pub fn ground_position(&self, time: f64) -> Vec2 {
        let angle = self.angle(time);
        self.center + Vec2::new(angle.cos(), angle.sin()) * self.radius
    }

    fn angle(&self, time: f64) -> f32 {
        ((time * self.angular_speed as f64) % TAU as f64) as f32
    }

    /// Camera pose at `time`, `CLEARANCE` meters above the terrain.
    pub fn camera(&self, time: f64, sampler: &HeightmapSampler) -> FlightCamera {
        let ground = self.ground_position(time);
        let angle = self.angle(time);
        let tangent = Vec2::new(-angle.sin(), angle.cos());
        FlightCamera {
            position: ground.extend(sampler.height_at(ground) + CLEARANCE),
            forward: tangent.extend(-PITCH_DOWN).normalize(),
        }
    }

    /// View-projection matrix with `[0, 1]` depth and Z up.
    pub fn view_projection(&self, camera: &FlightCamera) -> Mat4 {
        let view = Mat4::look_to_rh(camera.position, camera.forward, Vec3::Z);
        let projection = Mat4::perspective_rh(self.fov_y, ASPECT, NEAR_PLANE, self.far);
        projection * view
    }

    pub fn frustum(&self, camera: &FlightCamera) -> Frustum {
        Frustum::from_view_projection(&self.view_projection(camera))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_cdlod::{Aabb, Intersection};
    use strata_terrain::HeightmapParams;

    fn flat_sampler(height: f64) -> HeightmapSampler {
        HeightmapSampler::new(HeightmapParams {
            amplitude: 0.0,
            base_height: height,
            ..HeightmapParams::default()
        })
    }

    #[test]
    fn test_path_stays_on_circle() {
        let path = FlightPath::from_config(&Config::default());
        for frame in 0..100 {
            let p = path.ground_position(frame as f64 * 0.5);
            assert!((p.distance(Vec2::splat(1024.0)) - 2048.0 * 0.35).abs() < 1e-2);
        }
    }

    /// The camera keeps its clearance over the terrain below it.
    #[test]
    fn test_camera_clears_terrain() {
        let path = FlightPath::from_config(&Config::default());
        let camera = path.camera(3.0, &flat_sampler(120.0));
        assert!((camera.position.z - (120.0 + CLEARANCE)).abs() < 1e-3);
        assert!((camera.forward.length() - 1.0).abs() < 1e-5);
        assert!(camera.forward.z < 0.0);
    }

    /// What lies ahead is visible, what lies behind is culled.
    #[test]
    fn test_frustum_follows_heading() {
        let path = FlightPath::from_config(&Config::default());
        let camera = path.camera(0.0, &flat_sampler(0.0));
        let frustum = path.frustum(&camera);

        let ahead = camera.position + camera.forward * 200.0;
        let behind = camera.position - camera.forward * 200.0;
        let boxed = |p: Vec3| Aabb::new(p - Vec3::splat(5.0), p + Vec3::splat(5.0));
        assert_ne!(frustum.test_aabb(&boxed(ahead)), Intersection::Outside);
        assert_eq!(frustum.test_aabb(&boxed(behind)), Intersection::Outside);
    }
}
