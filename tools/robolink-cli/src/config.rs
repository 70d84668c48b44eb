//! Joint configuration file handling.
//!
//! The configuration is a grouped key-value file: a `[global]` table plus
//! one `[JointN]` table per joint, numbered contiguously from zero. Joint
//! bus addresses must likewise be contiguous from 1 with no repeats.
//! Validation failures produce a single structured message and leave no
//! partial state behind.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Default velocity-correction look-ahead in milliseconds.
pub const DEFAULT_LOOKAHEAD_MS: u32 = 200;

/// Axis kinds known to the visualisation; the motion stack itself treats
/// them opaquely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JointKind {
    X,
    Z,
}

#[derive(Clone, Debug)]
pub struct JointConfig {
    pub name: String,
    pub kind: JointKind,
    /// 1-based RS-485 bus address.
    pub address: u8,
    pub upper_limit: f64,
    pub lower_limit: f64,
    /// Zero offset in radians.
    pub offset: f64,
    /// Radians per encoder tick (2π / encoder steps per turn).
    pub enc_to_rad: f64,
    /// Radians per motor tick (2π / motor steps per turn).
    pub mot_to_rad: f64,
    /// Nominal run and hold current settings, restored when leaving
    /// hardware compliance.
    pub max_current: u32,
    pub hold_current: u32,
    /// Axis length in metres; negative when not specified.
    pub length: f64,
    pub invert: bool,
    /// Assigned joystick axis, negative when disabled.
    pub joystick_axis: i32,
    pub joystick_invert: bool,
}

impl JointConfig {
    pub fn clamp_angle(&self, angle: f64) -> f64 {
        angle.clamp(self.lower_limit, self.upper_limit)
    }
}

#[derive(Clone, Debug)]
pub struct JointTable {
    joints: Vec<JointConfig>,
    pub lookahead_ms: u32,
}

impl JointTable {
    pub fn joints(&self) -> &[JointConfig] {
        &self.joints
    }

    pub fn joint(&self, name: &str) -> Option<&JointConfig> {
        self.joints.iter().find(|j| j.name == name)
    }

    /// Highest bus address in use (== axis count, addresses are gap-free).
    pub fn active_axes(&self) -> u8 {
        self.joints.iter().map(|j| j.address).max().unwrap_or(0)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration file is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid group in configuration file: '{0}'")]
    InvalidGroup(String),
    #[error("group '{group}' has no '{key}' setting, which is mandatory")]
    MissingKey { group: String, key: &'static str },
    #[error(
        "the name '{0}' contains invalid characters; \
         only alphanumeric characters and parentheses are allowed"
    )]
    BadName(String),
    #[error("joint name '{0}' is used more than once")]
    DuplicateName(String),
    #[error("unknown joint type '{0}'")]
    BadKind(String),
    #[error("invalid steps-per-turn value in group '{0}'")]
    BadResolution(String),
    #[error("address '{0}' is used more than once")]
    DuplicateAddress(u8),
    #[error("address '{0}' is not used; addresses should be chosen without gaps")]
    AddressGap(u8),
    #[error("gap in joint specification at index '{0}'; make sure all joints are numbered correctly")]
    IndexGap(usize),
}

#[derive(Debug, Default, Deserialize)]
struct RawGlobal {
    lookahead: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawJoint {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    address: Option<u8>,
    encoder_steps_per_turn: Option<f64>,
    motor_steps_per_turn: Option<f64>,
    lower_limit: Option<f64>,
    upper_limit: Option<f64>,
    offset: Option<f64>,
    length: Option<f64>,
    invert: Option<u8>,
    max_current: Option<u32>,
    hold_current: Option<u32>,
    joystick_axis: Option<i32>,
    joystick_invert: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    global: RawGlobal,
    #[serde(flatten)]
    groups: BTreeMap<String, RawJoint>,
}

pub fn load_from_file(path: &Path) -> Result<JointTable, ConfigError> {
    let text = fs::read_to_string(path)?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<JointTable, ConfigError> {
    let raw: RawConfig = toml::from_str(text)?;

    let group_exp = Regex::new(r"^Joint(\d+)$").unwrap();
    // Must match the token grammar of the keyframe line format.
    let name_exp = Regex::new(r"^[\w()]+$").unwrap();

    let mut slots: BTreeMap<usize, JointConfig> = BTreeMap::new();
    let mut addresses: Vec<u8> = Vec::new();

    for (group, joint) in &raw.groups {
        let Some(captures) = group_exp.captures(group) else {
            return Err(ConfigError::InvalidGroup(group.clone()));
        };
        let index: usize = captures[1]
            .parse()
            .map_err(|_| ConfigError::InvalidGroup(group.clone()))?;

        let missing = |key: &'static str| ConfigError::MissingKey {
            group: group.clone(),
            key,
        };

        let name = joint.name.clone().ok_or_else(|| missing("name"))?;
        if !name_exp.is_match(&name) {
            return Err(ConfigError::BadName(name));
        }
        let kind = match joint.kind.as_deref().ok_or_else(|| missing("type"))? {
            "X" => JointKind::X,
            "Z" => JointKind::Z,
            other => return Err(ConfigError::BadKind(other.to_string())),
        };
        let address = joint.address.ok_or_else(|| missing("address"))?;
        let encoder_steps = joint
            .encoder_steps_per_turn
            .ok_or_else(|| missing("encoder_steps_per_turn"))?;
        let motor_steps = joint
            .motor_steps_per_turn
            .ok_or_else(|| missing("motor_steps_per_turn"))?;
        if encoder_steps <= 0.0 || motor_steps <= 0.0 {
            return Err(ConfigError::BadResolution(group.clone()));
        }

        if address == 0 {
            return Err(ConfigError::AddressGap(0));
        }
        if addresses.contains(&address) {
            return Err(ConfigError::DuplicateAddress(address));
        }
        if slots.values().any(|j| j.name == name) {
            return Err(ConfigError::DuplicateName(name));
        }
        addresses.push(address);

        slots.insert(
            index,
            JointConfig {
                name,
                kind,
                address,
                lower_limit: joint.lower_limit.unwrap_or(-1.0),
                upper_limit: joint.upper_limit.unwrap_or(1.0),
                offset: joint.offset.unwrap_or(0.0),
                enc_to_rad: 2.0 * PI / encoder_steps,
                mot_to_rad: 2.0 * PI / motor_steps,
                max_current: joint.max_current.unwrap_or(50),
                hold_current: joint.hold_current.unwrap_or(20),
                length: joint.length.unwrap_or(-1.0),
                invert: joint.invert.unwrap_or(0) != 0,
                joystick_axis: joint.joystick_axis.unwrap_or(-1),
                joystick_invert: joint.joystick_invert.unwrap_or(0) != 0,
            },
        );
    }

    // Joint indices must be contiguous from zero.
    for (expected, index) in slots.keys().enumerate() {
        if *index != expected {
            return Err(ConfigError::IndexGap(expected));
        }
    }

    // Addresses must be contiguous from one.
    for address in 1..=addresses.len() as u8 {
        if !addresses.contains(&address) {
            return Err(ConfigError::AddressGap(address));
        }
    }

    Ok(JointTable {
        joints: slots.into_values().collect(),
        lookahead_ms: raw.global.lookahead.unwrap_or(DEFAULT_LOOKAHEAD_MS),
    })
}
