//! Math types for PetalSonic Pool

pub use glam::{Quat, Vec3};

/// Listener position and orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * (-Vec3::Z)
    }

    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    /// Stereo pan in `[-1, 1]` for a world-space point, -1 being hard left.
    ///
    /// Points at the listener's position are centered.
    pub fn pan_towards(&self, point: Vec3) -> f32 {
        let offset = point - self.position;
        if offset.length_squared() <= f32::EPSILON {
            return 0.0;
        }
        offset.normalize().dot(self.right()).clamp(-1.0, 1.0)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pan_follows_listener_right_axis() {
        let pose = Pose::identity();
        assert!((pose.pan_towards(Vec3::new(5.0, 0.0, 0.0)) - 1.0).abs() < 1e-6);
        assert!((pose.pan_towards(Vec3::new(-5.0, 0.0, 0.0)) + 1.0).abs() < 1e-6);
        assert_eq!(pose.pan_towards(Vec3::ZERO), 0.0);
        assert!(pose.pan_towards(pose.forward()).abs() < 1e-6);
    }
}
