//! Real-time keyframe player for host-driven playback.
//!
//! A keyframe list is first compiled into a timeline: one item per target
//! pose with the point in time at which it should be reached, plus hold
//! items for pauses and, for looped motions, a closing item back to the
//! first pose. Playback then advances a slider through real time; the
//! commanded target is always the *next* item, with per-joint velocities
//! chosen so every joint arrives exactly on schedule. Velocity adaption
//! nudges those speeds using measured feedback so small disturbances do
//! not accumulate into lag.

use std::collections::BTreeMap;

use crate::keyframe::{DigitalOutput, Keyframe};

/// Maximum servo speed in rad/s.
pub const SERVO_SPEED_MAX: f64 = 4.0;
/// Player step rate in Hz.
pub const MOTION_SAMPLE_RATE: f64 = 50.0;

const DEFAULT_TIME_CORRECTION: f64 = 0.08;
const DEFAULT_ADAPTION_STRENGTH: f64 = 0.15;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AxisTarget {
    pub angle: f64,
    pub velocity: f64,
}

#[derive(Clone, Debug)]
pub struct TimelineItem {
    pub joints: BTreeMap<String, AxisTarget>,
    /// Time to move here from the previous item, seconds.
    pub relative_time: f64,
    /// Time since the head of the timeline, seconds.
    pub absolute_time: f64,
    pub output: DigitalOutput,
}

impl TimelineItem {
    fn from_angles(angles: &BTreeMap<String, f64>, speed_limit: f64) -> Self {
        TimelineItem {
            joints: angles
                .iter()
                .map(|(name, angle)| {
                    (
                        name.clone(),
                        AxisTarget {
                            angle: *angle,
                            velocity: speed_limit,
                        },
                    )
                })
                .collect(),
            relative_time: 0.0,
            absolute_time: 0.0,
            output: DigitalOutput::Ignore,
        }
    }
}

/// Compile an authored keyframe list into a playback timeline. Needs at
/// least two keyframes; returns an empty timeline otherwise.
pub fn build_timeline(frames: &[Keyframe], looped: bool, speed_limit: f64) -> Vec<TimelineItem> {
    if frames.len() < 2 {
        return Vec::new();
    }

    let mut timeline: Vec<TimelineItem> = Vec::new();

    let mut head = TimelineItem::from_angles(&frames[0].joint_angles, speed_limit);
    head.output = frames[0].output;
    timeline.push(head);

    for (i, frame) in frames.iter().enumerate() {
        if frame.pause > 0.0 {
            let mut hold = TimelineItem::from_angles(&frame.joint_angles, speed_limit);
            hold.relative_time = frame.pause;
            hold.absolute_time = timeline.last().unwrap().absolute_time + frame.pause;
            timeline.push(hold);
        }

        let Some(next) = frames.get(i + 1) else {
            break;
        };

        // Segment time from the L∞ keyframe distance: the slowest joint
        // limits how fast the pose can be reached.
        let time = frame.distance(next) / (0.01 * next.speed as f64 * speed_limit);

        let mut item = TimelineItem::from_angles(&next.joint_angles, speed_limit);
        item.relative_time = time;
        item.absolute_time = timeline.last().unwrap().absolute_time + time;
        item.output = next.output;
        timeline.push(item);
    }

    if looped {
        let first = &frames[0];
        let time = frames.last().unwrap().distance(first) / (0.01 * first.speed as f64 * speed_limit);

        let mut item = TimelineItem::from_angles(&first.joint_angles, speed_limit);
        item.relative_time = time;
        item.absolute_time = timeline.last().unwrap().absolute_time + time;
        item.output = first.output;
        timeline.push(item);
    }

    // Nominal per-joint velocities so each joint arrives on schedule.
    for i in 0..timeline.len() - 1 {
        let (current, next) = timeline.split_at_mut(i + 1);
        let current = current.last_mut().unwrap();
        let next = &next[0];

        for (name, target) in current.joints.iter_mut() {
            let Some(next_target) = next.joints.get(name) else {
                continue;
            };
            let distance = next_target.angle - target.angle;
            target.velocity = if distance == 0.0 || next.relative_time == 0.0 {
                speed_limit
            } else {
                (distance / next.relative_time).abs()
            };
        }
    }

    timeline
}

/// One 50 Hz output sample.
#[derive(Clone, Debug)]
pub struct StepSample {
    pub angles: BTreeMap<String, f64>,
    pub velocities: BTreeMap<String, f64>,
    pub finished: bool,
}

pub struct KeyframePlayer {
    timeline: Vec<TimelineItem>,
    looped: bool,
    interpolating: bool,
    velocity_adaption: bool,
    time_correction: f64,
    adaption_strength: f64,
    speed_limit: f64,
    slider: f64,
    current: usize,
    playing: bool,
    tx_angles: BTreeMap<String, f64>,
    tx_velocities: BTreeMap<String, f64>,
    correction: BTreeMap<String, f64>,
}

impl KeyframePlayer {
    pub fn new() -> Self {
        KeyframePlayer {
            timeline: Vec::new(),
            looped: false,
            interpolating: false,
            velocity_adaption: true,
            time_correction: DEFAULT_TIME_CORRECTION,
            adaption_strength: DEFAULT_ADAPTION_STRENGTH,
            speed_limit: SERVO_SPEED_MAX,
            slider: 0.0,
            current: 0,
            playing: false,
            tx_angles: BTreeMap::new(),
            tx_velocities: BTreeMap::new(),
            correction: BTreeMap::new(),
        }
    }

    /// Speed limit as a percentage of [`SERVO_SPEED_MAX`].
    pub fn set_speed_limit(&mut self, percent: u32) {
        self.speed_limit = 0.01 * percent as f64 * SERVO_SPEED_MAX;
    }

    /// Adaption headroom; too much of it causes oscillations.
    pub fn set_time_correction(&mut self, percent: u32) {
        self.time_correction = 0.01 * percent as f64 * 0.5;
    }

    pub fn set_looped(&mut self, looped: bool) {
        self.looped = looped;
    }

    pub fn set_interpolating(&mut self, interpolating: bool) {
        self.interpolating = interpolating;
    }

    pub fn set_velocity_adaption(&mut self, enabled: bool) {
        self.velocity_adaption = enabled;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn stop(&mut self) {
        self.playing = false;
    }

    /// The compiled timeline of the current motion. Valid until the next
    /// [`KeyframePlayer::play_frames`] call; this is what the uploader
    /// translates into device keyframes.
    pub fn timeline(&self) -> &[TimelineItem] {
        &self.timeline
    }

    /// Compile and arm a motion. Returns false when there is nothing to
    /// play (fewer than two keyframes).
    pub fn play_frames(&mut self, frames: &[Keyframe]) -> bool {
        self.timeline = build_timeline(frames, self.looped, self.speed_limit);
        if self.timeline.is_empty() {
            return false;
        }

        self.slider = 0.0;
        self.current = 0;
        self.tx_angles = frames[0].joint_angles.clone();
        self.tx_velocities = self
            .tx_angles
            .keys()
            .map(|k| (k.clone(), self.speed_limit))
            .collect();
        self.correction = self.tx_angles.keys().map(|k| (k.clone(), 1.0)).collect();
        self.playing = true;
        true
    }

    /// Feed back the currently measured joint angles. Per-joint correction
    /// factors are derived from the remaining error and the time left to
    /// the next item.
    pub fn joint_angles_in(&mut self, measured: &BTreeMap<String, f64>) {
        let adapting = self.velocity_adaption && self.current + 1 < self.timeline.len();
        let keys: Vec<String> = self.correction.keys().cloned().collect();

        for key in keys {
            let factor = if adapting {
                let Some(rx) = measured.get(&key) else {
                    continue;
                };
                let delta_s = (self.tx_angles[&key] - rx).abs();
                let delta_t = self.timeline[self.current + 1].absolute_time - self.slider
                    + self.time_correction;
                let nominal = delta_t * self.tx_velocities[&key];
                if nominal <= 0.0 {
                    1.0
                } else {
                    (delta_s / nominal)
                        .clamp(1.0 - self.adaption_strength, 1.0 + self.adaption_strength)
                }
            } else {
                1.0
            };
            self.correction.insert(key, factor);
        }
    }

    /// Advance playback by `dt` seconds and produce the next sample.
    /// Returns `None` when the player is idle.
    pub fn step(&mut self, dt: f64) -> Option<StepSample> {
        if !self.playing {
            return None;
        }

        self.slider += dt;

        // Multiple items may have been stepped over in one tick.
        while self.current + 1 < self.timeline.len()
            && self.timeline[self.current + 1].absolute_time < self.slider
        {
            self.current += 1;
        }

        if self.current + 1 >= self.timeline.len() {
            let last = &self.timeline[self.current];
            for (name, target) in &last.joints {
                self.tx_angles.insert(name.clone(), target.angle);
                self.tx_velocities.insert(name.clone(), self.speed_limit);
            }

            if self.looped {
                self.slider -= last.absolute_time;
                self.current = 0;
            } else {
                self.playing = false;
                return Some(StepSample {
                    angles: self.tx_angles.clone(),
                    velocities: self.tx_velocities.clone(),
                    finished: true,
                });
            }
        } else {
            let current = &self.timeline[self.current];
            let next = &self.timeline[self.current + 1];

            for (name, target) in &current.joints {
                let Some(next_target) = next.joints.get(name) else {
                    continue;
                };
                let distance = next_target.angle - target.angle;

                let angle = if self.interpolating {
                    let progress = ((self.slider - current.absolute_time) / next.relative_time)
                        .clamp(0.0, 1.0);
                    // A zero-length segment divides to NaN; clamp treats
                    // that as "already there".
                    let progress = if progress.is_nan() { 1.0 } else { progress };
                    target.angle + distance * progress
                } else {
                    next_target.angle
                };

                let velocity = if distance == 0.0 || next.relative_time == 0.0 {
                    self.speed_limit
                } else {
                    let factor = self.correction.get(name).copied().unwrap_or(1.0);
                    factor * (distance / (next.relative_time + self.time_correction)).abs()
                };

                self.tx_angles.insert(name.clone(), angle);
                self.tx_velocities.insert(name.clone(), velocity);
            }
        }

        Some(StepSample {
            angles: self.tx_angles.clone(),
            velocities: self.tx_velocities.clone(),
            finished: false,
        })
    }
}

impl Default for KeyframePlayer {
    fn default() -> Self {
        KeyframePlayer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(angle: f64, speed: u32, pause: f64) -> Keyframe {
        let mut kf = Keyframe::default();
        kf.set_speed(speed);
        kf.set_pause(pause);
        kf.joint_angles.insert("A1".into(), angle);
        kf
    }

    #[test]
    fn segment_time_follows_distance_and_speed() {
        // 0.4 rad at 50% of 4 rad/s => 0.2 s.
        let timeline = build_timeline(
            &[frame(0.0, 50, 0.0), frame(0.4, 50, 0.0)],
            false,
            SERVO_SPEED_MAX,
        );
        assert_eq!(timeline.len(), 2);
        assert!((timeline[1].relative_time - 0.2).abs() < 1e-9);
        assert!((timeline[1].absolute_time - 0.2).abs() < 1e-9);
        // Nominal velocity: 0.4 rad over 0.2 s.
        assert!((timeline[0].joints["A1"].velocity - 2.0).abs() < 1e-9);
    }

    #[test]
    fn pauses_insert_hold_items() {
        let timeline = build_timeline(
            &[frame(0.0, 50, 1.5), frame(0.4, 50, 0.0)],
            false,
            SERVO_SPEED_MAX,
        );
        // Head, hold, target.
        assert_eq!(timeline.len(), 3);
        assert!((timeline[1].relative_time - 1.5).abs() < 1e-9);
        assert_eq!(timeline[1].joints["A1"].angle, 0.0);
        assert!((timeline[2].absolute_time - 1.7).abs() < 1e-9);
    }

    #[test]
    fn looped_timelines_close_the_ring() {
        let timeline = build_timeline(
            &[frame(0.0, 50, 0.0), frame(0.4, 50, 0.0)],
            true,
            SERVO_SPEED_MAX,
        );
        assert_eq!(timeline.len(), 3);
        assert_eq!(timeline[2].joints["A1"].angle, 0.0);
    }

    #[test]
    fn fewer_than_two_frames_is_not_playable() {
        let mut player = KeyframePlayer::new();
        assert!(!player.play_frames(&[frame(0.0, 50, 0.0)]));
        assert!(!player.is_playing());
    }

    #[test]
    fn interpolation_tracks_the_segment() {
        let mut player = KeyframePlayer::new();
        player.set_interpolating(true);
        player.set_velocity_adaption(false);
        assert!(player.play_frames(&[frame(0.0, 50, 0.0), frame(0.4, 50, 0.0)]));

        let sample = player.step(0.1).unwrap();
        // Halfway through the 0.2 s segment.
        assert!((sample.angles["A1"] - 0.2).abs() < 1e-9);
        assert!(!sample.finished);
    }

    #[test]
    fn snap_mode_commands_the_next_pose() {
        let mut player = KeyframePlayer::new();
        player.set_velocity_adaption(false);
        assert!(player.play_frames(&[frame(0.0, 50, 0.0), frame(0.4, 50, 0.0)]));

        let sample = player.step(0.05).unwrap();
        assert_eq!(sample.angles["A1"], 0.4);
        // Velocity is scheduled, not bang-bang: |0.4| / (0.2 + 0.08).
        assert!((sample.velocities["A1"] - 0.4 / 0.28).abs() < 1e-9);
    }

    #[test]
    fn completion_emits_a_final_sample() {
        let mut player = KeyframePlayer::new();
        player.set_velocity_adaption(false);
        assert!(player.play_frames(&[frame(0.0, 50, 0.0), frame(0.4, 50, 0.0)]));

        let sample = player.step(0.5).unwrap();
        assert!(sample.finished);
        assert_eq!(sample.angles["A1"], 0.4);
        assert!(!player.is_playing());
        assert!(player.step(0.02).is_none());
    }

    #[test]
    fn looped_playback_wraps_the_slider() {
        let mut player = KeyframePlayer::new();
        player.set_looped(true);
        player.set_velocity_adaption(false);
        assert!(player.play_frames(&[frame(0.0, 50, 0.0), frame(0.4, 50, 0.0)]));

        // Two full segments (0.2 s each: there and back).
        for _ in 0..30 {
            let sample = player.step(0.02).unwrap();
            assert!(!sample.finished);
        }
        assert!(player.is_playing());
    }

    #[test]
    fn adaption_factor_is_clamped() {
        let mut player = KeyframePlayer::new();
        assert!(player.play_frames(&[frame(0.0, 50, 0.0), frame(0.4, 50, 0.0)]));
        player.step(0.02);

        // Feedback far behind the commanded pose: factor rails high.
        let measured: BTreeMap<String, f64> = [("A1".to_string(), -10.0)].into();
        player.joint_angles_in(&measured);
        let sample = player.step(0.02).unwrap();
        let nominal = 0.4 / (0.2 + DEFAULT_TIME_CORRECTION);
        assert!((sample.velocities["A1"] - nominal * (1.0 + DEFAULT_ADAPTION_STRENGTH)).abs() < 1e-6);

        // Perfectly on track: factor rails low.
        let measured: BTreeMap<String, f64> = [("A1".to_string(), 0.4)].into();
        player.joint_angles_in(&measured);
        let sample = player.step(0.02).unwrap();
        assert!((sample.velocities["A1"] - nominal * (1.0 - DEFAULT_ADAPTION_STRENGTH)).abs() < 1e-6);
    }
}
