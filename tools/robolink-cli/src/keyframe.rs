//! Authored keyframes and their line-based text form.
//!
//! One keyframe per line, whitespace-separated `key:value` tokens: the
//! optional `speed:`, `pause:` and `output:` metadata first, then one token
//! per joint. Token order is not significant to the parser; the validation
//! expression accepts any subset of leading metadata followed by any number
//! of joint tokens.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use regex::Regex;
use thiserror::Error;

/// Digital-output action attached to a keyframe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DigitalOutput {
    #[default]
    Ignore,
    Set,
    Reset,
}

impl DigitalOutput {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(DigitalOutput::Ignore),
            1 => Some(DigitalOutput::Set),
            2 => Some(DigitalOutput::Reset),
            _ => None,
        }
    }

    pub fn index(self) -> u32 {
        match self {
            DigitalOutput::Ignore => 0,
            DigitalOutput::Set => 1,
            DigitalOutput::Reset => 2,
        }
    }
}

pub const SPEED_MIN: u32 = 1;
pub const SPEED_MAX: u32 = 100;
pub const PAUSE_MAX_S: f64 = 1000.0;

/// A target joint configuration with timing and output annotations.
#[derive(Clone, Debug, PartialEq)]
pub struct Keyframe {
    /// Percent of the configured maximum speed, 1..=100.
    pub speed: u32,
    /// Seconds to stay in this keyframe before moving on.
    pub pause: f64,
    pub output: DigitalOutput,
    pub joint_angles: BTreeMap<String, f64>,
}

impl Default for Keyframe {
    fn default() -> Self {
        Keyframe {
            speed: 50,
            pause: 0.0,
            output: DigitalOutput::Ignore,
            joint_angles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("line {0} is not a valid keyframe")]
    InvalidLine(usize),
    #[error("could not extract a value from '{0}'")]
    BadToken(String),
}

impl Keyframe {
    /// Maximum-norm distance across the joint angles. The slowest joint
    /// limits a segment, so this is what segment times derive from.
    pub fn distance(&self, other: &Keyframe) -> f64 {
        let mut distance: f64 = 0.0;
        for (name, angle) in &self.joint_angles {
            if let Some(other_angle) = other.joint_angles.get(name) {
                distance = distance.max((angle - other_angle).abs());
            }
        }
        distance
    }

    pub fn set_speed(&mut self, speed: u32) {
        self.speed = speed.clamp(SPEED_MIN, SPEED_MAX);
    }

    pub fn set_pause(&mut self, pause: f64) {
        self.pause = pause.clamp(0.0, PAUSE_MAX_S);
    }

    /// One text line, without the trailing newline.
    pub fn to_line(&self) -> String {
        let mut line = String::new();
        let _ = write!(line, "speed:{} pause:{} output:{}", self.speed, self.pause, self.output.index());
        for (name, angle) in &self.joint_angles {
            let _ = write!(line, " {}:{}", name, angle);
        }
        line
    }

    pub fn from_line(line: &str) -> Result<Keyframe, ParseError> {
        if !validate_line(line) {
            return Err(ParseError::InvalidLine(1));
        }

        let mut keyframe = Keyframe::default();
        for token in line.split_whitespace() {
            let Some((key, value)) = token.split_once(':') else {
                return Err(ParseError::BadToken(token.to_string()));
            };
            let bad = || ParseError::BadToken(token.to_string());

            match key {
                "speed" => keyframe.set_speed(value.parse().map_err(|_| bad())?),
                "pause" => keyframe.set_pause(value.parse().map_err(|_| bad())?),
                "output" => {
                    let index: u32 = value.parse().map_err(|_| bad())?;
                    keyframe.output = DigitalOutput::from_index(index).ok_or_else(bad)?;
                }
                joint => {
                    let angle: f64 = value.parse().map_err(|_| bad())?;
                    keyframe.joint_angles.insert(joint.to_string(), angle);
                }
            }
        }

        Ok(keyframe)
    }
}

/// The line grammar. The semantic speed range (1..=100) is tighter than
/// the `\d{1,3}` the expression accepts; the parser clamps on ingestion.
pub fn validate_line(line: &str) -> bool {
    static PATTERN: &str =
        r"^((speed:\d{1,3})?(\s)?(pause:\d{1,3}(\.\d{1,})?)?(\s)?(output:\d)?((\s)?[\w()]{1,}:-?\d{1,}(\.\d{1,})?)*\n?){1,}$";
    let expression = Regex::new(PATTERN).unwrap();
    expression.is_match(line)
}

/// Parse a whole sequence, one keyframe per line. Blank lines are skipped.
pub fn sequence_from_str(text: &str) -> Result<Vec<Keyframe>, ParseError> {
    let mut frames = Vec::new();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if !validate_line(line) {
            return Err(ParseError::InvalidLine(number + 1));
        }
        frames.push(Keyframe::from_line(line)?);
    }
    Ok(frames)
}

pub fn sequence_to_string(frames: &[Keyframe]) -> String {
    let mut text = String::new();
    for frame in frames {
        text.push_str(&frame.to_line());
        text.push('\n');
    }
    text
}

pub fn load_sequence(path: &Path) -> anyhow::Result<Vec<Keyframe>> {
    let text = fs::read_to_string(path)?;
    Ok(sequence_from_str(&text)?)
}

pub fn save_sequence(path: &Path, frames: &[Keyframe]) -> anyhow::Result<()> {
    fs::write(path, sequence_to_string(frames))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Keyframe {
        let mut kf = Keyframe {
            speed: 40,
            pause: 1.5,
            output: DigitalOutput::Set,
            joint_angles: BTreeMap::new(),
        };
        kf.joint_angles.insert("Rotate(base)".into(), 0.785);
        kf.joint_angles.insert("Tilt1".into(), -0.25);
        kf
    }

    #[test]
    fn line_round_trips() {
        let kf = frame();
        let line = kf.to_line();
        let parsed = Keyframe::from_line(&line).unwrap();
        assert_eq!(parsed, kf);

        // Re-serialising the parsed frame gives back an equal structure.
        assert_eq!(Keyframe::from_line(&parsed.to_line()).unwrap(), parsed);
    }

    #[test]
    fn metadata_tokens_are_optional() {
        let parsed = Keyframe::from_line("Tilt1:0.5").unwrap();
        assert_eq!(parsed.joint_angles["Tilt1"], 0.5);
        assert_eq!(parsed.speed, Keyframe::default().speed);
        assert_eq!(parsed.output, DigitalOutput::Ignore);
    }

    #[test]
    fn token_order_is_free() {
        let a = Keyframe::from_line("speed:30 pause:2 Tilt1:0.5").unwrap();
        let b = Keyframe::from_line("Tilt1:0.5 speed:30 pause:2").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn speed_is_clamped_to_semantic_range() {
        let parsed = Keyframe::from_line("speed:999 Tilt1:0.5").unwrap();
        assert_eq!(parsed.speed, SPEED_MAX);

        let parsed = Keyframe::from_line("speed:0 Tilt1:0.5").unwrap();
        assert_eq!(parsed.speed, SPEED_MIN);
    }

    #[test]
    fn invalid_lines_are_rejected() {
        assert!(Keyframe::from_line("speed:abc").is_err());
        assert!(Keyframe::from_line("Tilt 1:0.5").is_err());
        assert!(!validate_line("Tilt#:0.5"));
    }

    #[test]
    fn parenthesised_names_are_accepted() {
        assert!(validate_line("speed:50 Rotate(base):-1.25"));
    }

    #[test]
    fn distance_is_the_maximum_norm() {
        let mut a = frame();
        let mut b = frame();
        a.joint_angles.insert("Tilt1".into(), 0.0);
        b.joint_angles.insert("Tilt1".into(), 0.3);
        a.joint_angles.insert("Rotate(base)".into(), 0.0);
        b.joint_angles.insert("Rotate(base)".into(), -0.1);
        assert!((a.distance(&b) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn sequence_round_trips_through_text() {
        let frames = vec![frame(), {
            let mut kf = frame();
            kf.set_speed(80);
            kf.joint_angles.insert("Tilt1".into(), 0.7);
            kf
        }];

        let text = sequence_to_string(&frames);
        let parsed = sequence_from_str(&text).unwrap();
        assert_eq!(parsed, frames);
    }

    #[test]
    fn sequence_errors_carry_the_line_number() {
        let err = sequence_from_str("Tilt1:0.5\nbogus line\n").unwrap_err();
        assert_eq!(err, ParseError::InvalidLine(2));
    }
}
