//! Keyframe playback engine.
//!
//! The sequencer owns the in-RAM keyframe buffer and the active
//! configuration. Playback is a stepped state machine: every call to
//! [`Sequencer::poll`] performs at most one axis pass, so the surrounding
//! main loop keeps servicing host commands between iterations and a `Stop`
//! can always get through mid-motion.
//!
//! Velocity control works by looking `lookahead` milliseconds into the
//! future along the keyframe timeline, computing where the axis ought to be
//! by then, and commanding whatever motor speed closes the gap between that
//! point and the measured encoder position in exactly the look-ahead time.

use robolink_protocol::{
    Config, Feedback, Keyframe, Motion, OutputCommand, FEEDBACK_FLAG_PLAYING, MAX_KEYFRAMES,
    NO_READING, NUM_AXES, POSITION_BIAS,
};

use crate::bus::MotorBus;
use crate::hal::{BusPort, DeviceIo, Eeprom};
use crate::store::SequenceStore;

const BIAS: i32 = POSITION_BIAS as i32;

/// Give up moving to the start keyframe after this long.
pub const START_TIMEOUT_MS: u32 = 8_000;
/// Conservative approach speed for the start move, scaled by enc_to_mot/256.
const START_APPROACH_FACTOR: u32 = 94;
/// An axis counts as "at the keyframe" within this many encoder ticks.
const REACH_WINDOW: i32 = 50;
/// Consecutive in-window iterations before the start move is declared done.
const REACH_CONFIRMATIONS: u8 = 10;
/// Never command a velocity below this; the controllers must not stop dead
/// mid-segment.
const MIN_VELOCITY: i32 = 100;
/// Upper velocity clamp, scaled by enc_to_mot/256.
const MAX_VELOCITY_FACTOR: i32 = 7000;
/// Hold window presented to the look-ahead once the last keyframe is
/// reached in non-loop mode.
const END_HOLD_MS: i32 = 100;
/// Consecutive high samples required on the sync line before a looped
/// sequence restarts.
const SYNC_STABLE_SAMPLES: u8 = 20;
/// Grace period so peer controllers can observe the released line.
const SYNC_SETTLE_MS: u32 = 20;

#[derive(Clone, Copy)]
struct Deadline {
    start_ms: u32,
    duration_ms: u32,
}

impl Deadline {
    fn begin(now: u32, duration_ms: u32) -> Self {
        Deadline {
            start_ms: now,
            duration_ms,
        }
    }

    fn elapsed(&self, now: u32) -> u32 {
        now.wrapping_sub(self.start_ms)
    }

    fn reached(&self, now: u32) -> bool {
        self.elapsed(now) >= self.duration_ms
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Idle,
    StartCheck {
        then_play: bool,
    },
    MoveToStart {
        deadline: Deadline,
        hits: u8,
        then_play: bool,
    },
    /// Moving towards keyframe `target`.
    Segment {
        target: u16,
        deadline: Deadline,
        fallback: [u16; NUM_AXES],
    },
    SyncWait {
        stable: u8,
    },
    SyncSettle {
        deadline: Deadline,
    },
}

pub struct Sequencer {
    pub config: Config,
    buffer: [Keyframe; MAX_KEYFRAMES],
    phase: Phase,
    playing: bool,
    should_stop: bool,
    force_loop: bool,
    loop_this_pass: bool,
    enc_pos: [i16; NUM_AXES],
}

impl Sequencer {
    pub fn new(config: Config) -> Self {
        Sequencer {
            config,
            buffer: [Keyframe::default(); MAX_KEYFRAMES],
            phase: Phase::Idle,
            playing: false,
            should_stop: false,
            force_loop: false,
            loop_this_pass: false,
            enc_pos: [NO_READING; NUM_AXES],
        }
    }

    /// Restore config and sequence from the persistent store at boot.
    pub fn load_from_store<E: Eeprom>(&mut self, store: &SequenceStore<E>) {
        let (config, _valid) = store.load_config();
        self.config = config;
        for i in 0..self.config.num_keyframes.min(MAX_KEYFRAMES as u16) {
            self.buffer[i as usize] = store.read_keyframe(i as u8);
        }
    }

    /// Flush the RAM buffer and config to the persistent store.
    pub fn commit<E: Eeprom>(&self, store: &mut SequenceStore<E>) {
        let count = (self.config.num_keyframes as usize).min(MAX_KEYFRAMES);
        store.save_sequence(&self.config, &self.buffer[..count]);
    }

    pub fn write_keyframe(&mut self, index: u8, keyframe: Keyframe) -> bool {
        if (index as usize) < MAX_KEYFRAMES {
            self.buffer[index as usize] = keyframe;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub fn keyframe(&self, index: u8) -> &Keyframe {
        &self.buffer[index as usize]
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Request an abort. The playback loop honours the flag on its next
    /// iteration and leaves the motors at their last commanded velocity;
    /// the host is expected to follow up with a motion command to hold.
    pub fn stop(&mut self) {
        self.should_stop = true;
    }

    /// Begin sequence playback: drive to the start keyframe if necessary,
    /// then run the segment timeline.
    pub fn start_play(&mut self, force_loop: bool) {
        if self.playing || self.config.num_keyframes == 0 {
            return;
        }
        self.playing = true;
        self.should_stop = false;
        self.force_loop = force_loop;
        self.loop_this_pass = force_loop;
        self.phase = Phase::StartCheck { then_play: true };
    }

    /// Move to the start keyframe without playing (button workflow).
    pub fn start_move_to_start(&mut self) {
        if self.playing || self.config.num_keyframes == 0 {
            return;
        }
        self.playing = true;
        self.should_stop = false;
        self.phase = Phase::StartCheck { then_play: false };
    }

    fn active_axes(&self) -> usize {
        (self.config.active_axes as usize).min(NUM_AXES)
    }

    fn finish(&mut self) {
        self.playing = false;
        self.phase = Phase::Idle;
    }

    fn execute_output<IO: DeviceIo>(&self, io: &mut IO, command: u8) {
        match OutputCommand::from_u8(command) {
            Some(OutputCommand::Set) => io.set_output(true),
            Some(OutputCommand::Reset) => io.set_output(false),
            _ => {}
        }
    }

    fn keyframe_reached<P: BusPort>(&mut self, bus: &mut MotorBus<P>, keyframe: &Keyframe) -> bool {
        let mut max_diff: i32 = -1;
        for j in 0..self.active_axes() {
            if let Some(enc) = bus.encoder_position(j as u8 + 1) {
                let diff = (keyframe.ticks[j] as i32 - BIAS - enc as i32).abs();
                if diff > max_diff {
                    max_diff = diff;
                }
            }
        }
        max_diff >= 0 && max_diff < REACH_WINDOW
    }

    /// Check whether the arm already sits on keyframe 0; fires the frame's
    /// output command when it does.
    pub fn is_in_start_position<P: BusPort, IO: DeviceIo>(
        &mut self,
        bus: &mut MotorBus<P>,
        io: &mut IO,
    ) -> bool {
        let start = self.buffer[0];
        let reached = self.keyframe_reached(bus, &start);
        if reached {
            self.execute_output(io, start.output_command);
        }
        reached
    }

    /// Position feedback for the host. While playing the cached encoder
    /// values from the control loop are reported; otherwise the controllers
    /// are read live.
    pub fn feedback<P: BusPort>(&mut self, bus: &mut MotorBus<P>) -> Feedback {
        let mut fb = Feedback {
            num_axes: self.config.active_axes as u8,
            flags: 0,
            positions: [NO_READING; NUM_AXES],
        };
        if self.playing {
            fb.flags |= FEEDBACK_FLAG_PLAYING;
        }
        for j in 0..self.active_axes() {
            fb.positions[j] = if self.playing {
                self.enc_pos[j]
            } else {
                bus.encoder_position(j as u8 + 1).unwrap_or(NO_READING)
            };
        }
        fb
    }

    /// Immediate motion command: per-axis destinations and velocities
    /// straight to the bus, then the output command.
    pub fn execute_motion<P: BusPort, IO: DeviceIo>(
        &mut self,
        bus: &mut MotorBus<P>,
        io: &mut IO,
        motion: &Motion,
    ) {
        for j in 0..(motion.num_axes as usize).min(NUM_AXES) {
            bus.set_destination(j as u8 + 1, motion.ticks[j]);
            bus.set_velocity(j as u8 + 1, motion.velocity[j]);
        }
        self.execute_output(io, motion.output_command);
    }

    fn power_down<P: BusPort>(&mut self, bus: &mut MotorBus<P>) {
        for j in 0..self.active_axes() {
            bus.set_velocity(j as u8 + 1, 0);
        }
    }

    fn begin_pass(&mut self, now: u32) {
        self.loop_this_pass = self.force_loop;
        self.begin_segment(now, 1);
    }

    fn begin_segment(&mut self, now: u32, target: u16) {
        let prev = self.buffer[target as usize - 1];
        let current = self.buffer[target as usize];
        let duration = (current.duration as u32).max(1);

        // Fallback speed from the keyframe timing alone, used whenever
        // encoder feedback is unavailable or look-ahead is disabled.
        let mut fallback = [0u16; NUM_AXES];
        for j in 0..self.active_axes() {
            let diff = (current.ticks[j] as i32 - prev.ticks[j] as i32).unsigned_abs();
            let enc_speed = 1000 * diff / duration;
            fallback[j] = (self.config.enc_to_mot[j] as u32 * enc_speed / 256)
                .min(u16::MAX as u32) as u16;
        }

        self.phase = Phase::Segment {
            target,
            deadline: Deadline::begin(now, duration),
            fallback,
        };
    }

    fn reached_start<P: BusPort, IO: DeviceIo>(
        &mut self,
        _bus: &mut MotorBus<P>,
        io: &mut IO,
        then_play: bool,
        now: u32,
    ) {
        let start = self.buffer[0];
        self.execute_output(io, start.output_command);

        if then_play && self.config.num_keyframes >= 2 {
            self.begin_pass(now);
        } else {
            self.finish();
        }
    }

    /// Walk the look-ahead window `delta_ms` into the future of the
    /// timeline starting at the segment towards `target`. Returns
    /// `(from, to, duration, remaining_delta)` in unbiased ticks.
    fn lookahead_window(
        &mut self,
        target: u16,
        axis: usize,
        delta_ms: i32,
        button: bool,
    ) -> (i32, i32, i32, i32) {
        let mut k = target as usize;
        let mut from = self.buffer[k - 1].ticks[axis] as i32 - BIAS;
        let mut to = self.buffer[k].ticks[axis] as i32 - BIAS;
        let mut duration = (self.buffer[k].duration as i32).max(1);
        let mut delta = delta_ms;
        let last = self.config.num_keyframes as usize - 1;

        while delta > duration {
            if k == last {
                // Heading into the last keyframe. Keep looping on button
                // hold or a loop request, otherwise hold position there.
                if button || self.force_loop {
                    self.loop_this_pass = true;
                }
                if !self.loop_this_pass {
                    from = to;
                    duration = END_HOLD_MS;
                    break;
                }
                // The zeroth frame is the starting pose; loops wrap to 1.
                delta -= duration;
                from = to;
                k = 1;
            } else {
                delta -= duration;
                from = to;
                k += 1;
            }
            to = self.buffer[k].ticks[axis] as i32 - BIAS;
            duration = (self.buffer[k].duration as i32).max(1);
        }

        (from, to, duration, delta)
    }

    /// Advance playback by one iteration.
    pub fn poll<P: BusPort, IO: DeviceIo>(&mut self, bus: &mut MotorBus<P>, io: &mut IO) {
        let now = io.now_ms();

        match self.phase {
            Phase::Idle => {}

            Phase::StartCheck { then_play } => {
                if self.should_stop {
                    self.finish();
                    return;
                }
                let start = self.buffer[0];
                if self.keyframe_reached(bus, &start) {
                    self.reached_start(bus, io, then_play, now);
                } else {
                    self.phase = Phase::MoveToStart {
                        deadline: Deadline::begin(now, START_TIMEOUT_MS),
                        hits: 0,
                        then_play,
                    };
                }
            }

            Phase::MoveToStart {
                deadline,
                mut hits,
                then_play,
            } => {
                if self.should_stop || deadline.reached(now) {
                    // Did not reach the start position in time; switch the
                    // motors off rather than letting them grind on.
                    self.power_down(bus);
                    self.finish();
                    return;
                }

                let start = self.buffer[0];
                for j in 0..self.active_axes() {
                    let id = j as u8 + 1;
                    let velocity =
                        (self.config.enc_to_mot[j] as u32 * START_APPROACH_FACTOR / 256) as u16;
                    bus.set_velocity(id, velocity);
                    bus.set_destination(id, start.ticks[j]);

                    if let Some(enc) = bus.encoder_position(id) {
                        self.enc_pos[j] = enc;
                    }
                }

                if self.keyframe_reached(bus, &start) {
                    hits += 1;
                    if hits >= REACH_CONFIRMATIONS {
                        self.reached_start(bus, io, then_play, now);
                        return;
                    }
                } else {
                    hits = 0;
                }
                self.phase = Phase::MoveToStart {
                    deadline,
                    hits,
                    then_play,
                };
            }

            Phase::Segment {
                target,
                deadline,
                fallback,
            } => {
                if self.should_stop {
                    self.finish();
                    return;
                }

                if deadline.reached(now) {
                    self.execute_output(io, self.buffer[target as usize].output_command);

                    let next = target + 1;
                    if next < self.config.num_keyframes {
                        self.begin_segment(now, next);
                    } else if self.loop_this_pass {
                        if self.force_loop {
                            // Loop commanded by the host: no multi-arm wait.
                            self.begin_pass(now);
                        } else {
                            io.sync_release();
                            self.phase = Phase::SyncWait { stable: 0 };
                        }
                    } else {
                        self.finish();
                    }
                    return;
                }

                let lookahead = self.config.lookahead as i32;
                let elapsed = deadline.elapsed(now) as i32;
                let button = io.button();

                for j in 0..self.active_axes() {
                    let id = j as u8 + 1;
                    let (from, to, duration, delta) =
                        self.lookahead_window(target, j, elapsed + lookahead, button);

                    let nominal_velocity = 1000 * (to - from) / duration;
                    let dest = from + delta * nominal_velocity / 1000;

                    let encoder = if lookahead > 0 {
                        bus.encoder_position(id)
                    } else {
                        None
                    };

                    match encoder {
                        Some(enc) => {
                            let enc_to_mot = self.config.enc_to_mot[j] as i32;
                            let max_speed = enc_to_mot * MAX_VELOCITY_FACTOR / 256;

                            // Be at `dest` in `lookahead` ms: the required
                            // motor speed follows from the encoder error.
                            let mut velocity =
                                (1000 * (dest - enc as i32) / lookahead).abs() * enc_to_mot / 256;
                            if velocity < MIN_VELOCITY {
                                velocity = MIN_VELOCITY;
                            } else if velocity > max_speed {
                                velocity = max_speed;
                            }

                            bus.set_destination(id, clamp_tick(dest + BIAS));
                            bus.set_velocity(id, velocity as u16);
                            self.enc_pos[j] = enc;
                        }
                        None => {
                            bus.set_destination(id, clamp_tick(to + BIAS));
                            bus.set_velocity(id, fallback[j]);
                        }
                    }
                }
            }

            Phase::SyncWait { stable } => {
                if self.should_stop {
                    io.sync_assert();
                    self.finish();
                    return;
                }
                let stable = if io.sync_read() { stable + 1 } else { 0 };
                if stable > SYNC_STABLE_SAMPLES {
                    self.phase = Phase::SyncSettle {
                        deadline: Deadline::begin(now, SYNC_SETTLE_MS),
                    };
                } else {
                    self.phase = Phase::SyncWait { stable };
                }
            }

            Phase::SyncSettle { deadline } => {
                if deadline.reached(now) {
                    io.sync_assert();
                    self.begin_pass(now);
                }
            }
        }
    }
}

fn clamp_tick(tick: i32) -> u16 {
    tick.clamp(0, 2 * BIAS) as u16
}
