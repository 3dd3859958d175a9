use crate::math::{Pose, Vec3};

/// Inverse distance attenuation, clamped below `reference_distance`.
///
/// `reference / (reference + rolloff * (distance - reference))`, which is 1.0 up
/// to the reference distance and falls off smoothly after it.
pub fn distance_gain(distance: f32, reference_distance: f32, rolloff: f32) -> f32 {
    let reference = reference_distance.max(f32::EPSILON);
    let distance = distance.max(reference);
    reference / (reference + rolloff.max(0.0) * (distance - reference))
}

/// Equal-power left/right gains for a mono source at `position`.
///
/// A source straight ahead (or exactly on the listener) gets `sqrt(0.5)` on both
/// sides; a source on the listener's right axis plays only on the right.
pub fn pan_gains(listener: &Pose, position: Vec3) -> (f32, f32) {
    let offset = position - listener.position;
    let pan = match offset.try_normalize() {
        Some(direction) => direction.dot(listener.right()).clamp(-1.0, 1.0),
        None => 0.0,
    };

    let angle = (pan + 1.0) * std::f32::consts::FRAC_PI_4;
    (angle.cos(), angle.sin())
}
