//! Joint-angle ↔ tick-space conversion.
//!
//! Tick-space is the u16 coordinate the controllers work in: encoder
//! position plus [`POSITION_BIAS`] so negative positions survive the
//! unsigned registers.

use robolink_protocol::{NO_READING, POSITION_BIAS};

use crate::config::JointConfig;

const BIAS: i32 = POSITION_BIAS as i32;

fn sign(joint: &JointConfig) -> f64 {
    if joint.invert {
        -1.0
    } else {
        1.0
    }
}

/// Angle in radians to a biased wire tick, clamped into the legal range.
pub fn angle_to_tick(joint: &JointConfig, angle: f64) -> u16 {
    let ticks = ((sign(joint) * angle + joint.offset) / joint.enc_to_rad).round() as i32;
    (ticks + BIAS).clamp(0, 2 * BIAS) as u16
}

/// Inverse of [`angle_to_tick`].
pub fn tick_to_angle(joint: &JointConfig, tick: u16) -> f64 {
    sign(joint) * ((tick as i32 - BIAS) as f64 * joint.enc_to_rad - joint.offset)
}

/// Convert a raw feedback encoder position. Returns `None` for the
/// no-fresh-reading sentinel; the caller keeps its previous value.
pub fn encoder_to_angle(joint: &JointConfig, encoder: i16) -> Option<f64> {
    if encoder == NO_READING {
        return None;
    }
    Some(sign(joint) * (encoder as f64 * joint.enc_to_rad - joint.offset))
}

/// Joint velocity in rad/s to the motor-tick velocity register value. The
/// controllers misbehave on zero, so the floor is 1.
pub fn velocity_to_motor(joint: &JointConfig, velocity: f64) -> u16 {
    let ticks = (velocity.abs() / joint.mot_to_rad).round() as i64;
    ticks.clamp(1, u16::MAX as i64) as u16
}

/// Per-axis `enc_to_mot` scale shipped in the device configuration:
/// `256 · enc_to_rad / mot_to_rad`.
pub fn enc_to_mot(joint: &JointConfig) -> u16 {
    let scaled = (256.0 * joint.enc_to_rad / joint.mot_to_rad).round() as i64;
    scaled.clamp(0, u16::MAX as i64) as u16
}
