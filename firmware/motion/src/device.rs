//! Top-level firmware state: passthrough shovelling, the extended-mode
//! command dispatcher and the autonomous button workflow.
//!
//! Only the host→bus passthrough direction runs through [`Device::poll`];
//! the bus→host direction is pure byte forwarding and stays in the UART
//! receive interrupt.

use robolink_protocol::{
    encode_message, simple_frame, Command, Config, Decoder, Frame, Keyframe, Motion, Play,
    ReadKeyframe, Reset, SaveKeyframe, WirePayload, NUM_AXES, PLAY_FLAG_LOOP, RESET_KEY,
};

use heapless::Vec;

use crate::bus::{MotorBus, STATE_COMPLIANCE, STATE_IDLE, STATE_RESET, STATE_SEARCH};
use crate::hal::{BusPort, DeviceIo, Eeprom, HostLink};
use crate::passthrough::{InitMatcher, MatchOutcome};
use crate::sequencer::Sequencer;
use crate::store::SequenceStore;

/// Extended mode drops back to passthrough after this many milliseconds
/// without a complete valid packet.
const EXTENDED_IDLE_MS: u32 = 255;
/// Abandon motor-controller initialisation after this many consecutive
/// state-poll failures; playback is disabled in that case.
const INIT_ERROR_LIMIT: u16 = 200;
/// Pause between initialisation polling rounds.
const INIT_ROUND_DELAY_MS: u32 = 200;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Passthrough,
    Extended,
}

enum Startup {
    Pending {
        error_count: u16,
        program_running: [bool; NUM_AXES],
        last_round_ms: u32,
    },
    Done,
}

pub struct Device<P: BusPort, E: Eeprom, IO: DeviceIo> {
    bus: MotorBus<P>,
    store: SequenceStore<E>,
    io: IO,
    sequencer: Sequencer,
    decoder: Decoder,
    matcher: InitMatcher,
    mode: Mode,
    last_packet_ms: u32,
    startup: Startup,
}

impl<P: BusPort, E: Eeprom, IO: DeviceIo> Device<P, E, IO> {
    /// Boot: restore config and sequence from the store, start in
    /// passthrough mode with the motor controllers untouched.
    pub fn new(port: P, eeprom: E, io: IO) -> Self {
        let store = SequenceStore::new(eeprom);
        let mut sequencer = Sequencer::new(Config::default());
        sequencer.load_from_store(&store);

        Device {
            bus: MotorBus::new(port),
            store,
            io,
            sequencer,
            decoder: Decoder::new(),
            matcher: InitMatcher::new(),
            mode: Mode::Passthrough,
            last_packet_ms: 0,
            startup: Startup::Pending {
                error_count: 0,
                program_running: [false; NUM_AXES],
                last_round_ms: 0,
            },
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn store(&self) -> &SequenceStore<E> {
        &self.store
    }

    /// One cooperative iteration of the main loop.
    pub fn poll<L: HostLink>(&mut self, link: &mut L) {
        if self.sequencer.is_playing() {
            self.sequencer.poll(&mut self.bus, &mut self.io);
            // Keep parsing host packets mid-motion so a Stop (or a config
            // request) can always get through.
            self.drain_extended(link);
            return;
        }

        match self.mode {
            Mode::Passthrough => {
                if self.io.button() {
                    self.button_step();
                }
                self.drain_passthrough(link);
            }
            Mode::Extended => {
                self.drain_extended(link);
                let now = self.io.now_ms();
                if now.wrapping_sub(self.last_packet_ms) >= EXTENDED_IDLE_MS {
                    self.leave_extended();
                }
            }
        }
    }

    fn enter_extended<L: HostLink>(&mut self, link: &mut L) {
        // Anything queued behind the mode switch was meant for the bus;
        // drop it rather than parsing it as packets.
        while link.read_byte().is_some() {}

        self.mode = Mode::Extended;
        self.decoder.reset();
        self.last_packet_ms = self.io.now_ms();
        link.write(&simple_frame(Command::Init));
    }

    fn leave_extended(&mut self) {
        self.mode = Mode::Passthrough;
        self.matcher.reset();
    }

    fn drain_passthrough<L: HostLink>(&mut self, link: &mut L) {
        let mut forward: Vec<u8, 128> = Vec::new();

        while let Some(byte) = link.read_byte() {
            match self.matcher.push(byte) {
                MatchOutcome::Pending => {}
                MatchOutcome::Forward(replay) => {
                    if forward.extend_from_slice(&replay).is_err() {
                        self.bus.forward_raw(&forward);
                        forward.clear();
                        let _ = forward.extend_from_slice(&replay);
                    }
                }
                MatchOutcome::Matched => {
                    if !forward.is_empty() {
                        self.bus.forward_raw(&forward);
                        forward.clear();
                    }
                    self.enter_extended(link);
                    return;
                }
            }
        }

        if !forward.is_empty() {
            self.bus.forward_raw(&forward);
        }
    }

    fn drain_extended<L: HostLink>(&mut self, link: &mut L) {
        while let Some(byte) = link.read_byte() {
            if let Some(frame) = self.decoder.push(byte) {
                self.last_packet_ms = self.io.now_ms();
                self.handle_frame(&frame, link);
            }
        }
    }

    fn handle_frame<L: HostLink>(&mut self, frame: &Frame, link: &mut L) {
        match frame.command {
            Command::Init => {
                link.write(&simple_frame(Command::Init));
            }

            Command::Exit => {
                link.write(&simple_frame(Command::Exit));
                self.leave_extended();
            }

            Command::SaveKeyframe => {
                let Some(save) = frame.decode::<SaveKeyframe>() else {
                    return;
                };
                if self.sequencer.is_playing() {
                    return;
                }
                if self.sequencer.write_keyframe(save.index, save.keyframe) {
                    link.write(&simple_frame(Command::SaveKeyframe));
                }
            }

            Command::ReadKeyframe => {
                let Some(read) = frame.decode::<ReadKeyframe>() else {
                    return;
                };
                let keyframe: Keyframe = self.store.read_keyframe(read.index);
                self.reply(link, Command::ReadKeyframe, &keyframe);
            }

            Command::Config => {
                if self.sequencer.is_playing() {
                    return;
                }
                if frame.payload.is_empty() {
                    let config = self.sequencer.config;
                    self.reply(link, Command::Config, &config);
                } else if let Some(config) = frame.decode::<Config>() {
                    self.sequencer.config = config;
                    // Fire the first output command right away if the arm
                    // already sits on the starting pose.
                    self.sequencer
                        .is_in_start_position(&mut self.bus, &mut self.io);
                    link.write(&simple_frame(Command::Config));
                }
            }

            Command::Reset => {
                let Some(reset) = frame.decode::<Reset>() else {
                    return;
                };
                if reset.key == RESET_KEY {
                    self.io.enter_bootloader();
                }
            }

            Command::Commit => {
                if self.sequencer.is_playing() {
                    return;
                }
                self.sequencer.commit(&mut self.store);
                link.write(&simple_frame(Command::Commit));
            }

            Command::Play => {
                let Some(play) = frame.decode::<Play>() else {
                    return;
                };
                link.write(&simple_frame(Command::Play));
                self.sequencer.start_play(play.flags & PLAY_FLAG_LOOP != 0);
            }

            Command::Stop => {
                self.sequencer.stop();
                link.write(&simple_frame(Command::Stop));
            }

            Command::Feedback => {
                let feedback = self.sequencer.feedback(&mut self.bus);
                self.reply(link, Command::Feedback, &feedback);
            }

            Command::Motion => {
                let Some(motion) = frame.decode::<Motion>() else {
                    return;
                };
                self.sequencer
                    .execute_motion(&mut self.bus, &mut self.io, &motion);
                let feedback = self.sequencer.feedback(&mut self.bus);
                self.reply(link, Command::Motion, &feedback);
            }
        }
    }

    fn reply<L: HostLink, M: WirePayload>(&mut self, link: &mut L, command: Command, msg: &M) {
        let mut raw = [0u8; 64];
        if let Ok(len) = encode_message(command, msg, &mut raw) {
            link.write(&raw[..len]);
        }
    }

    /// One stage of the autonomous button workflow: initialise the motor
    /// controllers, then move to the start keyframe, then play. The button
    /// is a switch; holding it walks through the stages and keeps the
    /// sequence looping.
    fn button_step(&mut self) {
        match &mut self.startup {
            Startup::Pending {
                error_count,
                program_running,
                last_round_ms,
            } => {
                let now = self.io.now_ms();
                if now.wrapping_sub(*last_round_ms) < INIT_ROUND_DELAY_MS {
                    return;
                }
                *last_round_ms = now;

                let active = (self.sequencer.config.active_axes as usize).min(NUM_AXES);
                let mut ready = true;

                for j in 0..active {
                    let id = j as u8 + 1;
                    let Some(state) = self.bus.state(id) else {
                        *error_count += 1;
                        if *error_count == INIT_ERROR_LIMIT {
                            // A controller is missing. Carry on, but with
                            // playback disabled.
                            self.sequencer.config.num_keyframes = 0;
                            self.startup = Startup::Done;
                            return;
                        }
                        ready = false;
                        continue;
                    };

                    if state != STATE_RESET {
                        program_running[j] = true;
                    }
                    if !program_running[j] {
                        program_running[j] = self.bus.start_program(id);
                        ready = false;
                        continue;
                    }

                    match state {
                        STATE_RESET => {
                            self.bus.set_state(id, STATE_SEARCH);
                            ready = false;
                        }
                        STATE_SEARCH => ready = false,
                        STATE_IDLE | STATE_COMPLIANCE => {}
                        _ => {}
                    }
                }

                if ready {
                    self.startup = Startup::Done;
                    self.sequencer
                        .is_in_start_position(&mut self.bus, &mut self.io);
                }
            }

            Startup::Done => {
                if self
                    .sequencer
                    .is_in_start_position(&mut self.bus, &mut self.io)
                {
                    self.sequencer.start_play(false);
                } else {
                    self.sequencer.start_move_to_start();
                }
            }
        }
    }
}
