#![no_std]

//! Control program executed on each joint's motor controller.
//!
//! Every joint is pulled by a tendon with appreciable compliance, so the
//! commanded motor position and the joint encoder drift apart under load.
//! This program closes the gap: it finds the mechanical zero with the Hall
//! sensor mounted at the joint centre, then runs a position loop that keeps
//! the motor leading the encoder proportionally to the requested speed.
//!
//! The arm microcontroller talks to the program through controller
//! registers: the *pause* register carries the requested state, `MaxSpeed2`
//! carries the biased target encoder position (it is unused by the
//! controller's own absolute-position mode), and `MaxSpeed` the target
//! speed.
//!
//! [`JointController::poll`] advances one loop iteration; the busy-wait
//! phases of the original vendor program are expressed as explicit states.

#[cfg(test)]
extern crate std;

use robolink_protocol::POSITION_BIAS;

/// Encoder-to-motor scale: one encoder tick is `1 << ENCODER_SHIFT` motor
/// ticks (35:1 gearing).
pub const ENCODER_SHIFT: u32 = 2;

/// Analog threshold below which the Hall sensor is considered active.
pub const HALL_THRESHOLD: i32 = 580;

/// Requested states, as written into the pause register by the arm
/// microcontroller.
pub const STATE_UNINITIALISED: i32 = 0;
pub const STATE_FIND_CENTRE: i32 = 1;
pub const STATE_POSITION_CONTROL: i32 = 2;
pub const STATE_COMPLIANCE: i32 = 3;
pub const STATE_PASSIVE: i32 = 4;

/// Initial sweep half-width while hunting for the Hall sensor, widened by
/// the same amount on every reversal.
const SEARCH_SPREAD_STEP: i32 = 200;
/// Reduced drive current during zero finding so the motor cannot power
/// through a hardware limit.
const SEARCH_CURRENT: i32 = 20;
/// Nominal drive current.
const RUN_CURRENT: i32 = 50;
const HOLD_CURRENT_REDUCTION: i32 = 20;

const SEARCH_SPEED: i32 = 500;
const EDGE_SPEED: i32 = 100;
const CRUISE_SPEED: i32 = 500;

/// Position mode with tension correction.
const MODE_POSITION: i32 = 2;
/// Plain velocity mode used while sweeping.
const MODE_VELOCITY: i32 = 5;

/// Motor controller register interface as exposed to the on-controller
/// program. Mirrors the vendor firmware call surface.
pub trait Drive {
    fn now_ms(&self) -> u32;

    fn set_pause(&mut self, value: i32);
    fn pause(&self) -> i32;

    fn set_rotenc_inc(&mut self, value: i32);
    fn set_encoder_direction(&mut self, value: i32);
    fn set_min_speed(&mut self, value: i32);
    fn set_acceleration(&mut self, value: i32);
    fn set_deceleration(&mut self, value: i32);
    fn set_ramp_type(&mut self, value: i32);
    fn set_current(&mut self, percent: i32);
    fn set_current_reduction(&mut self, percent: i32);
    fn set_mode(&mut self, mode: i32);

    fn set_direction(&mut self, direction: i32);
    fn direction(&self) -> i32;
    fn set_max_speed(&mut self, value: i32);
    fn max_speed(&self) -> i32;
    fn set_max_speed2(&mut self, value: i32);
    fn max_speed2(&self) -> i32;

    fn start_drive(&mut self);
    fn stop_drive(&mut self, ramp: i32);

    fn demand_position(&self) -> i32;
    fn encoder_position(&self) -> i32;
    fn set_position(&mut self, value: i32);
    fn set_target_pos(&mut self, value: i32);

    fn analog_input(&self, channel: u8) -> i32;
    fn set_digital_output(&mut self, value: i32);
    fn set_output_selection(&mut self, output: u8, value: i32);
}

/// Zero-finding sub-states. The sweep drives outward in growing arcs until
/// the sensor answers, then both edges are measured twice at low speed.
#[derive(Clone, Copy)]
enum FindPhase {
    /// Already on the sensor at start: drive right until clear.
    ClearSensor,
    ClearSettle {
        until: u32,
    },
    Sweep {
        spread: i32,
        origin: i32,
    },
    /// Drive a bit further so the edge pass starts outside the sensor.
    LeaveSettle {
        until: u32,
        first_pass: bool,
        middle1: i32,
    },
    EdgeEnter {
        first_pass: bool,
        middle1: i32,
    },
    EdgeExit {
        first_pass: bool,
        middle1: i32,
        sum: i32,
    },
    /// Closed-loop crawl onto the computed middle position.
    Centre {
        middle: i32,
    },
}

pub struct JointController {
    initialized: bool,
    find: Option<FindPhase>,
    holding: bool,
    drive_target: i32,
    microstep_offset: i32,
    heartbeat: i32,
}

impl JointController {
    pub const fn new() -> Self {
        JointController {
            initialized: false,
            find: None,
            holding: false,
            drive_target: 0,
            microstep_offset: 0,
            heartbeat: 0,
        }
    }

    /// Low two bits of the motor position at the end of zero finding,
    /// preserved so later absolute moves keep the microstep phase.
    pub fn microstep_offset(&self) -> i32 {
        self.microstep_offset
    }

    fn initialize<D: Drive>(&mut self, drive: &mut D) {
        // The pause register doubles as the state interface to the arm
        // microcontroller; start in "waiting for initialise".
        drive.set_pause(STATE_UNINITIALISED);

        // Encoder resolution relative to the motor resolution (4640 / 35).
        drive.set_rotenc_inc(133);
        drive.set_encoder_direction(0);

        drive.set_min_speed(1);
        // Ramp parameter = (3000 / [Hz/ms])^2, sinus profile.
        drive.set_acceleration(300);
        drive.set_deceleration(0);
        drive.set_ramp_type(1);

        drive.set_current(RUN_CURRENT);
        drive.set_current_reduction(HOLD_CURRENT_REDUCTION);

        // Absolute position mode; the hardware loop corrects cable tension.
        drive.set_mode(MODE_POSITION);
        drive.stop_drive(1);

        drive.set_output_selection(1, 0);
        drive.set_output_selection(2, 0);
        drive.set_output_selection(3, 0);

        self.initialized = true;
    }

    /// One iteration of the control program.
    pub fn poll<D: Drive>(&mut self, drive: &mut D) {
        if !self.initialized {
            self.initialize(drive);
        }

        // Heartbeat on the spare output.
        self.heartbeat ^= 1;
        drive.set_digital_output(self.heartbeat);

        let state = drive.pause();

        if state != STATE_FIND_CENTRE {
            self.find = None;
        }

        match state {
            STATE_UNINITIALISED => {}
            STATE_FIND_CENTRE => self.find_centre_step(drive),
            STATE_POSITION_CONTROL => self.position_control_step(drive),
            STATE_COMPLIANCE => {
                // Accepted but vendor-extensible; the software compliance
                // integrator is not part of the shipped program.
            }
            STATE_PASSIVE => {
                // The PC has full control; only keep the drive started.
                drive.start_drive();
            }
            _ => {
                drive.stop_drive(1);
            }
        }
    }

    fn find_centre_step<D: Drive>(&mut self, drive: &mut D) {
        let Some(phase) = self.find else {
            drive.set_mode(MODE_VELOCITY);
            drive.set_current(SEARCH_CURRENT);
            drive.set_max_speed(SEARCH_SPEED);

            let origin = drive.demand_position();

            if drive.analog_input(1) < HALL_THRESHOLD {
                // Starting on the sensor: drive right until clear first.
                drive.set_direction(1);
                drive.start_drive();
                self.find = Some(FindPhase::ClearSensor);
            } else {
                drive.set_direction(0);
                drive.start_drive();
                self.find = Some(FindPhase::Sweep {
                    spread: SEARCH_SPREAD_STEP,
                    origin,
                });
            }
            return;
        };

        match phase {
            FindPhase::ClearSensor => {
                if drive.analog_input(1) >= HALL_THRESHOLD {
                    self.find = Some(FindPhase::ClearSettle {
                        until: drive.now_ms().wrapping_add(100),
                    });
                }
            }

            FindPhase::ClearSettle { until } => {
                if deadline_reached(drive.now_ms(), until) {
                    drive.stop_drive(1);
                    let origin = drive.demand_position();
                    drive.set_direction(0);
                    drive.start_drive();
                    self.find = Some(FindPhase::Sweep {
                        spread: SEARCH_SPREAD_STEP,
                        origin,
                    });
                }
            }

            FindPhase::Sweep { mut spread, origin } => {
                if drive.analog_input(1) <= HALL_THRESHOLD {
                    // Found the sensor; overshoot a little so the slow edge
                    // pass approaches from outside.
                    self.find = Some(FindPhase::LeaveSettle {
                        until: drive.now_ms().wrapping_add(250),
                        first_pass: true,
                        middle1: 0,
                    });
                    return;
                }

                let demand = drive.demand_position();
                if drive.direction() == 0 {
                    if origin - demand > spread {
                        drive.set_direction(1);
                        spread += SEARCH_SPREAD_STEP;
                    }
                } else if demand - origin > spread {
                    drive.set_direction(0);
                    spread += SEARCH_SPREAD_STEP;
                }
                self.find = Some(FindPhase::Sweep { spread, origin });
            }

            FindPhase::LeaveSettle {
                until,
                first_pass,
                middle1,
            } => {
                if deadline_reached(drive.now_ms(), until) {
                    drive.set_direction((drive.direction() + 1) % 2);
                    if first_pass {
                        drive.set_max_speed(EDGE_SPEED);
                    }
                    self.find = Some(FindPhase::EdgeEnter {
                        first_pass,
                        middle1,
                    });
                }
            }

            FindPhase::EdgeEnter {
                first_pass,
                middle1,
            } => {
                if drive.analog_input(1) <= HALL_THRESHOLD {
                    self.find = Some(FindPhase::EdgeExit {
                        first_pass,
                        middle1,
                        sum: drive.encoder_position(),
                    });
                }
            }

            FindPhase::EdgeExit {
                first_pass,
                middle1,
                sum,
            } => {
                if drive.analog_input(1) >= HALL_THRESHOLD {
                    let edge_sum = sum + drive.encoder_position();
                    if first_pass {
                        self.find = Some(FindPhase::LeaveSettle {
                            until: drive.now_ms().wrapping_add(250),
                            first_pass: false,
                            middle1: edge_sum,
                        });
                    } else {
                        // One shift averages the four readings down to the
                        // midpoint, the other converts encoder scale to
                        // motor scale.
                        let middle = (middle1 + edge_sum) >> 2;
                        drive.stop_drive(1);
                        drive.set_current(RUN_CURRENT);
                        drive.set_mode(MODE_POSITION);
                        self.find = Some(FindPhase::Centre { middle });
                    }
                }
            }

            FindPhase::Centre { middle } => {
                let encoder = drive.encoder_position();
                let motor = drive.demand_position();

                if (encoder - middle) >> ENCODER_SHIFT == 0 {
                    // Sitting on the zero: make it official.
                    drive.set_position(0);
                    drive.set_target_pos(0);
                    drive.set_max_speed2(POSITION_BIAS as i32);
                    drive.set_max_speed(CRUISE_SPEED);
                    self.microstep_offset = motor & 3;
                    self.holding = false;
                    self.find = None;
                    drive.set_pause(STATE_POSITION_CONTROL);
                    return;
                }

                drive.set_target_pos(motor - ((encoder - middle) << 1));
                drive.start_drive();
            }
        }
    }

    fn position_control_step<D: Drive>(&mut self, drive: &mut D) {
        // The host encodes the target encoder position into MaxSpeed2,
        // biased so negatives survive the unsigned register.
        let target = drive.max_speed2() - POSITION_BIAS as i32;
        let target_speed = drive.max_speed();

        let encoder = drive.encoder_position();
        let motor = drive.demand_position();

        let delta = (target - encoder) >> ENCODER_SHIFT;
        let delta_abs = delta.abs();
        // Overshoot when far, single-step when close: double the step while
        // the remaining distance exceeds the speed-derived window.
        let far_shift = u32::from((target_speed >> 5) < delta_abs);

        if delta_abs < 3 {
            if !self.holding && delta_abs < 2 {
                self.holding = true;
                self.drive_target = motor;
                if delta < 0 {
                    self.drive_target -= 4;
                }
            }
        } else {
            self.holding = false;
        }

        if !self.holding {
            let mut step = delta << far_shift;
            // Never issue a zero-delta start; the controller stalls on it.
            if step > 0 && step < 5 {
                step = 5;
            } else if step < 0 && step > -5 {
                step = -5;
            }
            self.drive_target = step + motor;
        }

        drive.set_target_pos(self.drive_target);
        drive.start_drive();
    }
}

impl Default for JointController {
    fn default() -> Self {
        JointController::new()
    }
}

fn deadline_reached(now: u32, until: u32) -> bool {
    // Wrapping comparison; deadlines are always < 2^31 ms away.
    until.wrapping_sub(now) > i32::MAX as u32 || now == until
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Behavioural model of the motor controller: the motor follows the
    /// commanded target (position mode) or turns at the commanded speed
    /// (velocity mode); the encoder tracks the motor through the gearing
    /// and the Hall sensor covers a window in encoder space.
    struct SimDrive {
        now: u32,
        pause: i32,
        mode: i32,
        current: i32,
        speed: i32,
        speed2: i32,
        direction: i32,
        driving: bool,
        motor: i32,
        target: i32,
        enc_offset: i32,
        hall_centre: i32,
        hall_halfwidth: i32,
        output: i32,
        stops: usize,
    }

    impl SimDrive {
        fn new(motor: i32, hall_centre: i32) -> Self {
            SimDrive {
                now: 0,
                pause: STATE_UNINITIALISED,
                mode: 0,
                current: 0,
                speed: 0,
                speed2: 0,
                direction: 0,
                driving: false,
                motor,
                target: motor,
                enc_offset: 0,
                hall_centre,
                hall_halfwidth: 30,
                output: 0,
                stops: 0,
            }
        }

        /// Advance the plant by one millisecond.
        fn tick(&mut self) {
            self.now = self.now.wrapping_add(1);
            if !self.driving {
                return;
            }
            let step = (self.speed / 20).max(1);
            if self.mode == MODE_VELOCITY {
                self.motor += if self.direction == 1 { step } else { -step };
            } else {
                let diff = self.target - self.motor;
                self.motor += diff.clamp(-step, step);
            }
        }
    }

    impl Drive for SimDrive {
        fn now_ms(&self) -> u32 {
            self.now
        }
        fn set_pause(&mut self, value: i32) {
            self.pause = value;
        }
        fn pause(&self) -> i32 {
            self.pause
        }
        fn set_rotenc_inc(&mut self, _value: i32) {}
        fn set_encoder_direction(&mut self, _value: i32) {}
        fn set_min_speed(&mut self, _value: i32) {}
        fn set_acceleration(&mut self, _value: i32) {}
        fn set_deceleration(&mut self, _value: i32) {}
        fn set_ramp_type(&mut self, _value: i32) {}
        fn set_current(&mut self, percent: i32) {
            self.current = percent;
        }
        fn set_current_reduction(&mut self, _percent: i32) {}
        fn set_mode(&mut self, mode: i32) {
            self.mode = mode;
        }
        fn set_direction(&mut self, direction: i32) {
            self.direction = direction;
        }
        fn direction(&self) -> i32 {
            self.direction
        }
        fn set_max_speed(&mut self, value: i32) {
            self.speed = value;
        }
        fn max_speed(&self) -> i32 {
            self.speed
        }
        fn set_max_speed2(&mut self, value: i32) {
            self.speed2 = value;
        }
        fn max_speed2(&self) -> i32 {
            self.speed2
        }
        fn start_drive(&mut self) {
            self.driving = true;
        }
        fn stop_drive(&mut self, _ramp: i32) {
            self.driving = false;
            self.stops += 1;
        }
        fn demand_position(&self) -> i32 {
            self.motor
        }
        fn encoder_position(&self) -> i32 {
            (self.motor >> ENCODER_SHIFT) + self.enc_offset
        }
        fn set_position(&mut self, value: i32) {
            // Redefine the current physical position as `value` in both
            // counters; the sensor moves into the new encoder frame.
            let old_enc = self.encoder_position();
            self.motor = value;
            self.target = value;
            self.enc_offset = 0;
            let new_enc = self.encoder_position();
            self.hall_centre += new_enc - old_enc;
        }
        fn set_target_pos(&mut self, value: i32) {
            self.target = value;
        }
        fn analog_input(&self, _channel: u8) -> i32 {
            let enc = self.encoder_position();
            if (enc - self.hall_centre).abs() <= self.hall_halfwidth {
                400
            } else {
                700
            }
        }
        fn set_digital_output(&mut self, value: i32) {
            self.output = value;
        }
        fn set_output_selection(&mut self, _output: u8, _value: i32) {}
    }

    fn run(controller: &mut JointController, drive: &mut SimDrive, iterations: usize) {
        for _ in 0..iterations {
            controller.poll(drive);
            drive.tick();
        }
    }

    #[test]
    fn first_poll_initialises_and_waits() {
        let mut drive = SimDrive::new(0, 1000);
        let mut controller = JointController::new();

        controller.poll(&mut drive);
        assert_eq!(drive.pause, STATE_UNINITIALISED);
        assert_eq!(drive.mode, MODE_POSITION);
        assert_eq!(drive.current, RUN_CURRENT);
        assert!(!drive.driving);
    }

    #[test]
    fn zero_find_centres_on_the_hall_sensor() {
        // Sensor centre 400 encoder ticks to the right of the start.
        let mut drive = SimDrive::new(0, 400);
        let mut controller = JointController::new();

        controller.poll(&mut drive);
        drive.set_pause(STATE_FIND_CENTRE);

        run(&mut controller, &mut drive, 40_000);

        // The program switched itself to position control with both
        // counters zeroed on the sensor centre.
        assert_eq!(drive.pause, STATE_POSITION_CONTROL);
        assert_eq!(drive.motor, 0);
        assert_eq!(drive.encoder_position(), 0);
        assert!(
            (drive.hall_centre).abs() <= drive.hall_halfwidth + 4,
            "zero is off the sensor centre: {}",
            drive.hall_centre
        );
        assert_eq!(drive.speed2, POSITION_BIAS as i32);
        assert_eq!(drive.speed, CRUISE_SPEED);
    }

    #[test]
    fn zero_find_works_when_starting_on_the_sensor() {
        let mut drive = SimDrive::new(0, 10);
        let mut controller = JointController::new();

        controller.poll(&mut drive);
        drive.set_pause(STATE_FIND_CENTRE);

        run(&mut controller, &mut drive, 40_000);

        assert_eq!(drive.pause, STATE_POSITION_CONTROL);
        assert!((drive.hall_centre).abs() <= drive.hall_halfwidth + 4);
    }

    #[test]
    fn search_current_is_reduced_and_restored() {
        let mut drive = SimDrive::new(0, 600);
        let mut controller = JointController::new();

        controller.poll(&mut drive);
        drive.set_pause(STATE_FIND_CENTRE);

        controller.poll(&mut drive);
        assert_eq!(drive.current, SEARCH_CURRENT);

        run(&mut controller, &mut drive, 40_000);
        assert_eq!(drive.pause, STATE_POSITION_CONTROL);
        assert_eq!(drive.current, RUN_CURRENT);
    }

    #[test]
    fn position_control_converges_and_latches_hold() {
        let mut drive = SimDrive::new(0, 0);
        let mut controller = JointController::new();

        controller.poll(&mut drive);
        drive.set_pause(STATE_POSITION_CONTROL);
        drive.set_max_speed(3200);
        drive.set_max_speed2(POSITION_BIAS as i32 + 400);

        run(&mut controller, &mut drive, 5_000);

        // The hold window is ±2 in motor scale, i.e. ±8 encoder ticks.
        let encoder = drive.encoder_position();
        assert!((encoder - 400).abs() < 8, "did not converge: {}", encoder);
        assert!(controller.holding);

        // While holding, the target stays latched.
        let latched = drive.target;
        run(&mut controller, &mut drive, 50);
        assert_eq!(drive.target, latched);
    }

    #[test]
    fn hold_releases_when_target_moves_away() {
        let mut drive = SimDrive::new(0, 0);
        let mut controller = JointController::new();

        controller.poll(&mut drive);
        drive.set_pause(STATE_POSITION_CONTROL);
        drive.set_max_speed(3200);
        drive.set_max_speed2(POSITION_BIAS as i32 + 100);
        run(&mut controller, &mut drive, 5_000);
        assert!(controller.holding);

        drive.set_max_speed2(POSITION_BIAS as i32 + 500);
        run(&mut controller, &mut drive, 5_000);
        let encoder = drive.encoder_position();
        assert!((encoder - 500).abs() < 8, "did not re-converge: {}", encoder);
    }

    #[test]
    fn small_steps_are_bounded_away_from_zero() {
        let mut drive = SimDrive::new(0, 0);
        let mut controller = JointController::new();

        controller.poll(&mut drive);
        drive.set_pause(STATE_POSITION_CONTROL);
        drive.set_max_speed(3200);
        // delta = 12 >> 2 = 3: inside the minimum-step window.
        drive.set_max_speed2(POSITION_BIAS as i32 + 12);

        controller.poll(&mut drive);
        assert_eq!(drive.target, 5);
    }

    #[test]
    fn far_targets_use_doubled_steps() {
        let mut drive = SimDrive::new(0, 0);
        let mut controller = JointController::new();

        controller.poll(&mut drive);
        drive.set_pause(STATE_POSITION_CONTROL);
        // Speed window: 320 >> 5 = 10 < delta.
        drive.set_max_speed(320);
        drive.set_max_speed2(POSITION_BIAS as i32 + 400);

        controller.poll(&mut drive);
        // delta = 100, doubled to 200.
        assert_eq!(drive.target, 200);
    }

    #[test]
    fn passive_state_only_keeps_the_drive_started() {
        let mut drive = SimDrive::new(0, 0);
        let mut controller = JointController::new();

        controller.poll(&mut drive);
        drive.set_pause(STATE_PASSIVE);
        controller.poll(&mut drive);
        assert!(drive.driving);
    }

    #[test]
    fn unknown_state_halts_the_motor() {
        let mut drive = SimDrive::new(0, 0);
        let mut controller = JointController::new();

        controller.poll(&mut drive);
        drive.set_pause(9);
        drive.start_drive();
        controller.poll(&mut drive);
        assert!(!drive.driving);
    }

    #[test]
    fn compliance_state_is_accepted() {
        let mut drive = SimDrive::new(0, 0);
        let mut controller = JointController::new();

        controller.poll(&mut drive);
        drive.set_pause(STATE_COMPLIANCE);
        let stops = drive.stops;
        controller.poll(&mut drive);
        // Neither halted nor driven.
        assert_eq!(drive.stops, stops);
        assert!(!drive.driving);
    }
}
