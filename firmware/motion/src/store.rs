//! Keyframe and configuration persistence.
//!
//! The non-volatile layout is a linear array of wire-form keyframes followed
//! by a single [`Config`] record. Writes are wear-aware: a block is only
//! rewritten when its content actually changed.

use robolink_protocol::{Config, Keyframe, WirePayload, MAX_KEYFRAMES};

use crate::hal::Eeprom;

const KEYFRAME_BASE: usize = 0;
const CONFIG_BASE: usize = KEYFRAME_BASE + MAX_KEYFRAMES * Keyframe::SIZE;

/// Total number of EEPROM bytes used by the store.
pub const STORE_SIZE: usize = CONFIG_BASE + Config::SIZE;

pub struct SequenceStore<E: Eeprom> {
    eeprom: E,
}

impl<E: Eeprom> SequenceStore<E> {
    pub fn new(eeprom: E) -> Self {
        SequenceStore { eeprom }
    }

    /// Load the configuration record. An erased or corrupted record
    /// (`active_axes == 0xFFFF` or an impossible keyframe count) yields the
    /// defaults (4 axes, no keyframes) and `false`.
    pub fn load_config(&self) -> (Config, bool) {
        let mut raw = [0u8; Config::SIZE];
        self.eeprom.read(CONFIG_BASE, &mut raw);
        let config = Config::read(&raw);

        if config.active_axes == 0xFFFF || config.num_keyframes as usize >= MAX_KEYFRAMES {
            (
                Config {
                    num_keyframes: 0,
                    active_axes: 4,
                    ..config
                },
                false,
            )
        } else {
            (config, true)
        }
    }

    pub fn save_config(&mut self, config: &Config) {
        let mut raw = [0u8; Config::SIZE];
        config.write(&mut raw);
        self.update(CONFIG_BASE, &raw);
    }

    pub fn read_keyframe(&self, index: u8) -> Keyframe {
        let mut raw = [0u8; Keyframe::SIZE];
        self.eeprom
            .read(KEYFRAME_BASE + index as usize * Keyframe::SIZE, &mut raw);
        Keyframe::read(&raw)
    }

    pub fn save_keyframe(&mut self, index: u8, keyframe: &Keyframe) {
        let mut raw = [0u8; Keyframe::SIZE];
        keyframe.write(&mut raw);
        self.update(KEYFRAME_BASE + index as usize * Keyframe::SIZE, &raw);
    }

    /// Persist a whole sequence plus its configuration.
    pub fn save_sequence(&mut self, config: &Config, buffer: &[Keyframe]) {
        let count = (config.num_keyframes as usize).min(buffer.len());
        for (i, keyframe) in buffer.iter().take(count).enumerate() {
            self.save_keyframe(i as u8, keyframe);
        }
        self.save_config(config);
    }

    fn update(&mut self, addr: usize, data: &[u8]) {
        let mut current = [0u8; SCRATCH_SIZE];
        let current = &mut current[..data.len()];
        self.eeprom.read(addr, current);
        if current != data {
            self.eeprom.write(addr, data);
        }
    }
}

/// Large enough for either record kind.
const SCRATCH_SIZE: usize = if Keyframe::SIZE > Config::SIZE {
    Keyframe::SIZE
} else {
    Config::SIZE
};
