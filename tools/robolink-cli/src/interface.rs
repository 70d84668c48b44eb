//! Connection lifecycle and extended-mode communication with the arm.
//!
//! The interface owns the transport and walks the link through its states:
//! port probing, robot detection over the legacy ASCII registers, per-axis
//! reset and zero-find initialisation, and finally the framed extended
//! protocol against the arm microcontroller. [`RobotInterface::step`] is
//! one iteration of that ladder and is meant to be driven as fast as the
//! serial round trips allow; commands from other threads arrive through
//! plain method calls on the owning thread (see the runner in `main`).
//!
//! While the device sequencer plays, the host only polls feedback; while
//! the host streams motion, the device only follows — exactly one side
//! drives at any time.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, info};
use regex::Regex;
use robolink_protocol as proto;
use robolink_protocol::WirePayload;

use crate::config::{JointConfig, JointTable};
use crate::keyframe::DigitalOutput;
use crate::player::{TimelineItem, SERVO_SPEED_MAX};
use crate::ticks;
use crate::transport::{ExtError, PortOpener, Transport, TxEvent};

/// Time budget for a compliance transition.
const COMPLIANCE_TIMEOUT: Duration = Duration::from_secs(2);
/// Velocity floor commanded after playback ends; exactly zero makes the
/// motors sing.
const HOLD_VELOCITY: f64 = std::f64::consts::PI / 180.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    PortClosed,
    PortOpen,
    RobotConfirmed,
    Resetting,
    Initialising,
    InitialisedStiff,
    InitialisedCompliant,
    ExtendedMode,
    Playing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComplianceMode {
    Stiff,
    HardwareCompliant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyframeCommand {
    Commit,
    Play,
    Loop,
}

#[derive(Clone, Debug)]
pub enum Event {
    Message(String),
    Connected,
    Disconnected,
    Initialized,
    PlaybackStarted,
    PlaybackFinished,
    ComplianceChanged(ComplianceMode),
    TransferFinished(bool),
    MotionOut {
        angles: BTreeMap<String, f64>,
        velocities: BTreeMap<String, f64>,
    },
}

struct MotorState {
    joint: JointConfig,
    is_reset: bool,
    is_initialized: bool,
    is_hw_compliant: bool,
}

pub struct RobotInterface<O: PortOpener> {
    transport: Transport<O>,
    motors: Vec<MotorState>,
    lookahead_ms: u32,

    state: LinkState,
    check_initialization: bool,
    playing: bool,
    stop_playing: bool,
    compliance: ComplianceMode,
    requested_compliance: ComplianceMode,

    tx_angles: BTreeMap<String, f64>,
    tx_velocities: BTreeMap<String, f64>,
    rx_angles: BTreeMap<String, f64>,
    rx_velocities: BTreeMap<String, f64>,
    last_rx_angles: BTreeMap<String, f64>,
    tx_output: proto::OutputCommand,

    last_cycle: Instant,
    events: Vec<Event>,
}

impl<O: PortOpener> RobotInterface<O> {
    pub fn new(table: &JointTable, opener: O) -> Self {
        let motors: Vec<MotorState> = table
            .joints()
            .iter()
            .map(|joint| MotorState {
                joint: joint.clone(),
                is_reset: false,
                is_initialized: false,
                is_hw_compliant: false,
            })
            .collect();

        let zeros: BTreeMap<String, f64> = motors
            .iter()
            .map(|m| (m.joint.name.clone(), 0.0))
            .collect();

        RobotInterface {
            transport: Transport::new(opener),
            motors,
            lookahead_ms: table.lookahead_ms,
            state: LinkState::PortClosed,
            check_initialization: true,
            playing: false,
            stop_playing: false,
            compliance: ComplianceMode::Stiff,
            requested_compliance: ComplianceMode::Stiff,
            tx_angles: zeros.clone(),
            tx_velocities: zeros.clone(),
            rx_angles: zeros.clone(),
            rx_velocities: zeros.clone(),
            last_rx_angles: zeros,
            tx_output: proto::OutputCommand::Nop,
            last_cycle: Instant::now(),
            events: Vec::new(),
        }
    }

    /// Externally visible connection state.
    pub fn state(&self) -> LinkState {
        match self.state {
            LinkState::ExtendedMode if self.playing => LinkState::Playing,
            LinkState::ExtendedMode if self.compliance == ComplianceMode::HardwareCompliant => {
                LinkState::InitialisedCompliant
            }
            other => other,
        }
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.state, LinkState::PortClosed | LinkState::PortOpen)
    }

    pub fn is_initialized(&self) -> bool {
        matches!(
            self.state,
            LinkState::InitialisedStiff | LinkState::ExtendedMode
        )
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn compliance(&self) -> ComplianceMode {
        self.compliance
    }

    pub fn rx_angles(&self) -> &BTreeMap<String, f64> {
        &self.rx_angles
    }

    /// Drain queued events.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    fn message(&mut self, text: impl Into<String>) {
        let text = text.into();
        info!("{}", text);
        self.events.push(Event::Message(text));
    }

    /// Stream a new joint target. Angles are clamped to the joint limits,
    /// velocities to the servo maximum, before anything reaches the wire.
    pub fn motion_in(
        &mut self,
        angles: &BTreeMap<String, f64>,
        velocities: &BTreeMap<String, f64>,
        output: proto::OutputCommand,
    ) {
        for motor in &self.motors {
            let name = &motor.joint.name;
            if let Some(angle) = angles.get(name) {
                self.tx_angles
                    .insert(name.clone(), motor.joint.clamp_angle(*angle));
            }
            if let Some(velocity) = velocities.get(name) {
                self.tx_velocities
                    .insert(name.clone(), velocity.abs().clamp(0.0, SERVO_SPEED_MAX));
            }
        }
        self.tx_output = output;
    }

    /// Freeze the arm where it currently is.
    pub fn stop_robot(&mut self) {
        self.tx_angles = self.rx_angles.clone();
        for velocity in self.tx_velocities.values_mut() {
            *velocity = 0.0;
        }
    }

    /// Request the per-axis zero-find initialisation.
    pub fn initialize_robot(&mut self) {
        if !self.is_connected() {
            return;
        }
        for motor in &mut self.motors {
            motor.is_reset = false;
            motor.is_initialized = false;
        }
        self.compliance = ComplianceMode::Stiff;
        self.requested_compliance = ComplianceMode::Stiff;
        self.check_initialization = false;
        self.state = LinkState::Resetting;
        self.message("Initializing...");
    }

    pub fn set_compliance(&mut self, mode: ComplianceMode) {
        if !self.is_initialized() {
            self.message("Please initialize the robot first.");
            return;
        }
        self.requested_compliance = mode;
    }

    pub fn stop_playing(&mut self) {
        self.stop_playing = true;
    }

    /// One iteration of the connection ladder.
    pub fn step(&mut self) {
        match self.state {
            LinkState::PortClosed => {
                if self.transport.try_open() {
                    self.state = LinkState::PortOpen;
                }
            }
            LinkState::PortOpen => self.confirm_connection(),
            LinkState::RobotConfirmed => {
                if self.check_initialization {
                    self.check_initialization_pass();
                }
            }
            LinkState::Resetting => self.reset_pass(),
            LinkState::Initialising => self.initialize_pass(),
            LinkState::InitialisedStiff => {
                if self.ext_enable().is_ok() && self.send_device_config(0).is_ok() {
                    self.state = LinkState::ExtendedMode;
                    self.last_cycle = Instant::now();
                }
                if !self.transport.is_open() {
                    self.disconnect();
                }
            }
            LinkState::ExtendedMode => {
                self.check_compliance();
                if self.state == LinkState::ExtendedMode {
                    self.extended_cycle();
                }
            }
            // Synthesised in state(); never stored.
            LinkState::InitialisedCompliant | LinkState::Playing => unreachable!(),
        }
    }

    fn disconnect(&mut self) {
        self.transport.close();
        for motor in &mut self.motors {
            motor.is_reset = false;
            motor.is_initialized = false;
            motor.is_hw_compliant = false;
        }
        self.compliance = ComplianceMode::Stiff;
        self.requested_compliance = ComplianceMode::Stiff;
        self.playing = false;
        self.stop_playing = false;
        self.check_initialization = true;
        self.state = LinkState::PortClosed;
        self.events.push(Event::Disconnected);
        self.message("ROBOT lost!");
    }

    /// Probe for a robot with a status query on the first axis.
    fn confirm_connection(&mut self) {
        // Make sure a previous session did not leave the arm in extended
        // mode; a failure here is expected and harmless.
        let _ = self.ext_chat(proto::Command::Exit);

        match self.transport.txrx("#1ZP\r") {
            TxEvent::Response(response) => {
                let confirmed = Regex::new(r"1ZP\+\d$").unwrap();
                if confirmed.is_match(&response) {
                    debug!("found robot on port index {}", self.transport.port_index());
                    self.state = LinkState::RobotConfirmed;
                    self.check_initialization = true;
                    self.events.push(Event::Connected);
                    self.message("ROBOT connected. Please initialize.");
                } else {
                    self.transport.cycle_port();
                    self.state = LinkState::PortClosed;
                }
            }
            TxEvent::Timeout => {
                self.transport.cycle_port();
                self.state = LinkState::PortClosed;
            }
            TxEvent::Disconnected => self.disconnect(),
        }
    }

    /// Without commanding anything, check whether all axes already report
    /// state 2; a robot that stayed powered keeps its initialisation.
    fn check_initialization_pass(&mut self) {
        let mut initialized = true;

        for i in 0..self.motors.len() {
            if self.motors[i].is_initialized {
                continue;
            }
            let address = self.motors[i].joint.address;
            match self.transport.txrx(&format!("#{}ZP\r", address)) {
                TxEvent::Response(r) if r.ends_with(&format!("{}ZP+2", address)) => {
                    self.motors[i].is_initialized = true;
                }
                TxEvent::Disconnected => {
                    self.disconnect();
                    return;
                }
                _ => initialized = false,
            }
        }

        self.check_initialization = false;
        if initialized {
            self.finish_initialization("ROBOT is already initialized.");
        }
    }

    /// Force every axis back to state 0 so initialisation starts clean.
    fn reset_pass(&mut self) {
        let mut reset = true;

        for i in 0..self.motors.len() {
            if self.motors[i].is_reset {
                continue;
            }
            let address = self.motors[i].joint.address;
            match self.transport.txrx(&format!("#{}P0\r", address)) {
                TxEvent::Response(r) if r.ends_with(&format!("{}P0", address)) => {
                    self.motors[i].is_reset = true;
                }
                TxEvent::Disconnected => {
                    self.disconnect();
                    return;
                }
                _ => reset = false,
            }
        }

        if reset {
            self.state = LinkState::Initialising;
        }
    }

    /// Kick axes still in state 0 into the zero-find and wait for state 2.
    fn initialize_pass(&mut self) {
        let mut initialized = true;

        for i in 0..self.motors.len() {
            if self.motors[i].is_initialized {
                continue;
            }
            let address = self.motors[i].joint.address;
            match self.transport.txrx(&format!("#{}ZP\r", address)) {
                TxEvent::Response(r) if r.ends_with(&format!("{}ZP+2", address)) => {
                    self.motors[i].is_initialized = true;
                }
                TxEvent::Response(r) if r.ends_with(&format!("{}ZP+0", address)) => {
                    initialized = false;
                    let _ = self.transport.txrx(&format!("#{}P1\r", address));
                }
                TxEvent::Disconnected => {
                    self.disconnect();
                    return;
                }
                _ => initialized = false,
            }
        }

        if initialized {
            self.finish_initialization("Initialization complete. ROBOT is ready for your command.");
        }
    }

    /// All axes are in state 2: read the first set of encoder positions so
    /// velocity estimation starts from zero error, then report up.
    fn finish_initialization(&mut self, note: &str) {
        for i in 0..self.motors.len() {
            let address = self.motors[i].joint.address;
            let register = format!("{}I", address);
            if let TxEvent::Response(response) = self.transport.txrx(&format!("#{}\r", register)) {
                let value = Regex::new(&format!(r"{}([+-]?\d+)", regex::escape(&register)))
                    .unwrap()
                    .captures(&response)
                    .and_then(|c| c[1].parse::<i16>().ok());
                if let Some(encoder) = value {
                    if let Some(angle) = ticks::encoder_to_angle(&self.motors[i].joint, encoder) {
                        self.rx_angles
                            .insert(self.motors[i].joint.name.clone(), angle);
                    }
                }
            }
        }
        self.last_rx_angles = self.rx_angles.clone();
        self.last_cycle = Instant::now();

        self.state = LinkState::InitialisedStiff;
        self.events.push(Event::Initialized);
        self.message(note);
    }

    // ----- extended protocol helpers -------------------------------------

    fn ext_chat(&mut self, command: proto::Command) -> Result<(), ExtError> {
        let frame = proto::simple_frame(command);
        let reply = self.transport.ext_request(&frame, command, 0)?;
        if reply == frame {
            Ok(())
        } else {
            Err(ExtError::Mismatch)
        }
    }

    fn ext_send<M: WirePayload>(&mut self, command: proto::Command, msg: &M) -> Result<(), ExtError> {
        let mut raw = [0u8; 64];
        let len = proto::encode_message(command, msg, &mut raw).expect("payload fits the frame");
        let reply = self.transport.ext_request(&raw[..len], command, 0)?;
        if reply == proto::simple_frame(command) {
            Ok(())
        } else {
            Err(ExtError::Mismatch)
        }
    }

    fn ext_query<R: WirePayload>(&mut self, request: &[u8], command: proto::Command) -> Result<R, ExtError> {
        let reply = self.transport.ext_request(request, command, R::SIZE)?;
        Ok(R::read(&reply[proto::HEADER_LEN..proto::HEADER_LEN + R::SIZE]))
    }

    fn ext_enable(&mut self) -> Result<(), ExtError> {
        self.ext_chat(proto::Command::Init)
    }

    fn ext_disable(&mut self) -> Result<(), ExtError> {
        self.ext_chat(proto::Command::Exit)
    }

    fn send_device_config(&mut self, num_keyframes: usize) -> Result<(), ExtError> {
        let mut config = proto::Config {
            num_keyframes: num_keyframes as u16,
            active_axes: 0,
            enc_to_mot: [0; proto::NUM_AXES],
            lookahead: self.lookahead_ms as u16,
        };
        for motor in &self.motors {
            let slot = motor.joint.address as usize - 1;
            config.enc_to_mot[slot] = ticks::enc_to_mot(&motor.joint);
            config.active_axes = config.active_axes.max(motor.joint.address as u16);
        }
        self.ext_send(proto::Command::Config, &config)
    }

    /// Drop out of extended mode after a protocol error; the ladder will
    /// re-enable it on the next step. Transport-fatal errors disconnect.
    fn ext_failed(&mut self, error: ExtError) {
        if error == ExtError::Disconnected || !self.transport.is_open() {
            self.disconnect();
        } else {
            debug!("extended mode lost: {}", error);
            self.state = LinkState::InitialisedStiff;
        }
    }

    // ----- extended-mode cycle -------------------------------------------

    fn extended_cycle(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_cycle).as_secs_f64().max(1e-6);
        self.last_cycle = now;

        let feedback: proto::Feedback;

        if self.playing || self.compliance == ComplianceMode::HardwareCompliant {
            // Poll only; the device is the one driving.
            match self.ext_query(&proto::simple_frame(proto::Command::Feedback), proto::Command::Feedback) {
                Ok(fb) => feedback = fb,
                Err(e) => {
                    self.ext_failed(e);
                    return;
                }
            }

            if self.playing && self.stop_playing {
                // Keep sending stop until the playing flag vanishes.
                let _ = self.ext_chat(proto::Command::Stop);
            }
        } else {
            let mut motion = proto::Motion::default();
            for motor in &self.motors {
                let name = &motor.joint.name;
                let slot = motor.joint.address as usize - 1;

                let clamped = motor.joint.clamp_angle(self.tx_angles[name]);
                self.tx_angles.insert(name.clone(), clamped);

                motion.ticks[slot] = ticks::angle_to_tick(&motor.joint, clamped);
                motion.velocity[slot] =
                    ticks::velocity_to_motor(&motor.joint, self.tx_velocities[name]);
                motion.num_axes = motion.num_axes.max(motor.joint.address);
            }
            motion.output_command = self.tx_output as u8;

            let mut raw = [0u8; 64];
            let len = proto::encode_message(proto::Command::Motion, &motion, &mut raw)
                .expect("motion fits the frame");
            match self.ext_query(&raw[..len], proto::Command::Motion) {
                Ok(fb) => feedback = fb,
                Err(e) => {
                    self.ext_failed(e);
                    return;
                }
            }
        }

        // Fold the feedback into the received pose; axes without a fresh
        // reading keep their previous value.
        for motor in &self.motors {
            let name = &motor.joint.name;
            let slot = motor.joint.address as usize - 1;
            if let Some(angle) = ticks::encoder_to_angle(&motor.joint, feedback.positions[slot]) {
                self.rx_angles.insert(name.clone(), angle);
                let last = self.last_rx_angles.get(name).copied().unwrap_or(angle);
                self.rx_velocities.insert(name.clone(), (angle - last).abs() / dt);
            }
        }
        self.last_rx_angles = self.rx_angles.clone();

        if self.compliance == ComplianceMode::HardwareCompliant {
            // Follow the hand-guided arm so re-stiffening cannot lurch.
            self.tx_angles = self.rx_angles.clone();
        }

        if self.playing && !feedback.is_playing() {
            self.message("Playback finished.");
            self.playing = false;
            self.stop_playing = false;

            // Hold the final pose with a gentle velocity floor.
            self.tx_angles = self.rx_angles.clone();
            for velocity in self.tx_velocities.values_mut() {
                *velocity = HOLD_VELOCITY;
            }

            self.events.push(Event::PlaybackFinished);
            return;
        }

        self.events.push(Event::MotionOut {
            angles: self.rx_angles.clone(),
            velocities: self.rx_velocities.clone(),
        });
    }

    // ----- compliance ----------------------------------------------------

    fn check_compliance(&mut self) {
        if self.requested_compliance == self.compliance {
            return;
        }

        // A pending motion must be cancelled before touching the currents:
        // the commanded position has to equal the observed one.
        self.tx_angles = self.rx_angles.clone();

        if self.requested_compliance == ComplianceMode::Stiff {
            // Push one command packet at the observed pose first.
            let was = self.compliance;
            self.compliance = ComplianceMode::Stiff;
            self.extended_cycle();
            self.compliance = was;
            if self.state != LinkState::ExtendedMode {
                return;
            }
        }

        // The currents are per-motor-controller registers; extended mode
        // has to be left to talk to them.
        if self.ext_disable().is_err() {
            return;
        }

        let deadline = Instant::now() + COMPLIANCE_TIMEOUT;
        let target = self.requested_compliance;
        let mut done = false;

        while !done {
            if Instant::now() >= deadline {
                self.message(match target {
                    ComplianceMode::HardwareCompliant => {
                        "Failed to change to hardware compliance mode."
                    }
                    ComplianceMode::Stiff => "Failed to leave hardware compliance mode.",
                });
                self.requested_compliance = self.compliance;
                break;
            }

            done = true;
            for i in 0..self.motors.len() {
                let address = self.motors[i].joint.address;
                let (run, hold) = match target {
                    ComplianceMode::HardwareCompliant => {
                        if self.motors[i].is_hw_compliant {
                            continue;
                        }
                        (0, 0)
                    }
                    ComplianceMode::Stiff => {
                        if !self.motors[i].is_hw_compliant {
                            continue;
                        }
                        (
                            self.motors[i].joint.max_current,
                            self.motors[i].joint.hold_current,
                        )
                    }
                };

                let hold_ok = matches!(
                    self.transport.txrx(&format!("#{}r{}\r", address, hold)),
                    TxEvent::Response(ref r) if r.ends_with(&format!("{}r{}", address, hold))
                );
                let run_ok = matches!(
                    self.transport.txrx(&format!("#{}i{}\r", address, run)),
                    TxEvent::Response(ref r) if r.ends_with(&format!("{}i{}", address, run))
                );

                if !self.transport.is_open() {
                    self.disconnect();
                    return;
                }

                if hold_ok && run_ok {
                    self.motors[i].is_hw_compliant = target == ComplianceMode::HardwareCompliant;
                } else {
                    done = false;
                }
            }
        }

        if done {
            self.compliance = target;
            self.message(match target {
                ComplianceMode::HardwareCompliant => "The robot is in hardware compliance mode.",
                ComplianceMode::Stiff => "The robot is stiff.",
            });
        }

        let _ = self.ext_enable();
        let compliance = self.compliance;
        self.events.push(Event::ComplianceChanged(compliance));
    }

    // ----- sequence transfer ---------------------------------------------

    fn item_to_keyframe(&self, item: &TimelineItem, duration_ms: u16) -> proto::Keyframe {
        let mut keyframe = proto::Keyframe {
            duration: duration_ms,
            ..proto::Keyframe::default()
        };
        keyframe.output_command = output_to_wire(item.output) as u8;

        for motor in &self.motors {
            let Some(target) = item.joints.get(&motor.joint.name) else {
                continue;
            };
            let slot = motor.joint.address as usize - 1;
            keyframe.ticks[slot] = ticks::angle_to_tick(&motor.joint, target.angle);
        }

        keyframe
    }

    /// Translate a compiled timeline into device keyframes and push them,
    /// terminated by a commit or a playback start. Any I/O failure or
    /// mismatched acknowledgement fails the whole transfer.
    pub fn transfer_keyframes(&mut self, timeline: &[TimelineItem], command: KeyframeCommand) {
        self.stop_playing = false;

        if self.state != LinkState::ExtendedMode || self.playing {
            self.message("The robot is not ready for a keyframe transfer.");
            self.events.push(Event::TransferFinished(false));
            return;
        }
        let Some(head) = timeline.first() else {
            self.events.push(Event::TransferFinished(false));
            return;
        };

        let active_axes = self.motors.iter().map(|m| m.joint.address).max().unwrap_or(0);
        if active_axes as usize > proto::NUM_AXES {
            self.message("Number of joints is too big for microcontroller");
            self.events.push(Event::TransferFinished(false));
            return;
        }

        // The zeroth wire keyframe is the starting pose, reached before the
        // timeline proper begins.
        let mut frames = vec![self.item_to_keyframe(head, 0)];
        for item in &timeline[1..] {
            let duration_ms = (item.relative_time * 1000.0).round().clamp(1.0, 65_535.0) as u16;
            frames.push(self.item_to_keyframe(item, duration_ms));
        }

        if frames.len() > proto::MAX_KEYFRAMES {
            self.message("The sequence has too many keyframes for the microcontroller");
            self.events.push(Event::TransferFinished(false));
            return;
        }

        if let Err(e) = self.send_device_config(frames.len()) {
            self.message("Could not write configuration");
            self.ext_failed(e);
            self.events.push(Event::TransferFinished(false));
            return;
        }

        for (index, keyframe) in frames.iter().enumerate() {
            let save = proto::SaveKeyframe {
                index: index as u8,
                keyframe: *keyframe,
            };
            if let Err(e) = self.ext_send(proto::Command::SaveKeyframe, &save) {
                self.message(format!("Could not save keyframe {}", index));
                self.ext_failed(e);
                self.events.push(Event::TransferFinished(false));
                return;
            }
        }

        match command {
            KeyframeCommand::Commit => {
                if let Err(e) = self.ext_chat(proto::Command::Commit) {
                    self.message("Could not write to EEPROM");
                    self.ext_failed(e);
                    self.events.push(Event::TransferFinished(false));
                    return;
                }
            }
            KeyframeCommand::Play | KeyframeCommand::Loop => {
                let mut flags = 0;
                if command == KeyframeCommand::Loop {
                    flags |= proto::PLAY_FLAG_LOOP;
                }
                if let Err(e) = self.ext_send(proto::Command::Play, &proto::Play { flags }) {
                    self.message("Could not start playback");
                    self.ext_failed(e);
                    self.events.push(Event::TransferFinished(false));
                    return;
                }
                self.playing = true;
                self.events.push(Event::PlaybackStarted);
            }
        }

        self.events.push(Event::TransferFinished(true));
    }

    /// Command a jump into the bootloader. The packet carries the literal
    /// reset key and is never acknowledged.
    pub fn reset_device(&mut self) -> bool {
        if self.state != LinkState::ExtendedMode {
            self.message("The microcontroller link is not up.");
            return false;
        }
        let mut raw = [0u8; 16];
        let len = proto::encode_message(proto::Command::Reset, &proto::Reset::armed(), &mut raw)
            .expect("reset fits the frame");
        let sent = self.transport.send_raw(&raw[..len]);
        if sent {
            self.message("Microcontroller reset into bootloader.");
            self.state = LinkState::InitialisedStiff;
        } else {
            self.disconnect();
        }
        sent
    }
}

fn output_to_wire(output: DigitalOutput) -> proto::OutputCommand {
    match output {
        DigitalOutput::Ignore => proto::OutputCommand::Nop,
        DigitalOutput::Set => proto::OutputCommand::Set,
        DigitalOutput::Reset => proto::OutputCommand::Reset,
    }
}
