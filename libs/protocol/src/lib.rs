#![no_std]

//! Extended binary protocol spoken between the host and the arm
//! microcontroller.
//!
//! The extended protocol has to be activated through an `Init` packet. With
//! this scheme old-style tools which want to talk directly to the motor
//! controllers over the passthrough path can keep doing so unmodified.
//!
//! Every packet shares a 4-byte header (`0xFF`, version, command, payload
//! length), followed by the payload, one checksum byte and the `0x0D`
//! terminator. All multi-byte fields are little-endian and payload structs
//! are packed (no alignment padding on the wire).

use heapless::Vec;

#[cfg(test)]
extern crate std;

pub const PROTOCOL_VERSION: u8 = 10;
pub const START_BYTE: u8 = 0xFF;
pub const TERMINATOR: u8 = 0x0D;
pub const HEADER_LEN: usize = 4;
/// Header + checksum + terminator.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + 2;

pub const NUM_AXES: usize = 8;
pub const MAX_KEYFRAMES: usize = 128;

/// Zero reference of tick-space. Encoder positions are biased by this
/// constant so negative positions fit into a u16.
pub const POSITION_BIAS: u16 = 16384;

/// Feedback position meaning "no fresh encoder reading". Receivers keep the
/// last known value instead of converting it.
pub const NO_READING: i16 = 0x7FFF;

/// Literal key required in a `Reset` payload before the device jumps into
/// its bootloader.
pub const RESET_KEY: [u8; 8] = [0x0A, 0x65, 0x38, 0x47, 0x82, 0xAB, 0xBF, 0x00];

/// Largest payload the decoder accepts. The length field is a u8, but the
/// biggest defined payload is [`Motion`] at 34 bytes; anything longer is
/// treated as line noise.
pub const MAX_PAYLOAD: usize = 64;

pub const FEEDBACK_FLAG_PLAYING: u8 = 1;
pub const PLAY_FLAG_LOOP: u8 = 1;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Enable extended protocol
    Init = 0,
    /// Reset microcontroller (and enter bootloader)
    Reset = 1,
    /// Read/save axis configuration
    Config = 2,
    /// Read keyframe
    ReadKeyframe = 3,
    /// Save keyframe
    SaveKeyframe = 4,
    /// Exit extended protocol
    Exit = 5,
    /// Save motion sequence to non-volatile memory
    Commit = 6,
    /// Play motion sequence
    Play = 7,
    /// Stop
    Stop = 8,
    /// Get position feedback
    Feedback = 9,
    /// Execute single motion command
    Motion = 10,
}

pub const COMMAND_COUNT: u8 = 11;

impl Command {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Command::Init),
            1 => Some(Command::Reset),
            2 => Some(Command::Config),
            3 => Some(Command::ReadKeyframe),
            4 => Some(Command::SaveKeyframe),
            5 => Some(Command::Exit),
            6 => Some(Command::Commit),
            7 => Some(Command::Play),
            8 => Some(Command::Stop),
            9 => Some(Command::Feedback),
            10 => Some(Command::Motion),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputCommand {
    /// Do nothing
    Nop = 0,
    /// Set output
    Set = 1,
    /// Reset output
    Reset = 2,
}

impl OutputCommand {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OutputCommand::Nop),
            1 => Some(OutputCommand::Set),
            2 => Some(OutputCommand::Reset),
            _ => None,
        }
    }
}

impl Default for OutputCommand {
    fn default() -> Self {
        OutputCommand::Nop
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    BufferTooSmall,
    PayloadTooLong,
    LengthMismatch,
}

/// Fixed-layout payload that can be written to and read from the wire.
pub trait WirePayload: Sized {
    /// Packed size in bytes.
    const SIZE: usize;

    /// Write the packed representation. `out` has exactly `SIZE` bytes.
    fn write(&self, out: &mut [u8]);

    /// Read the packed representation. `buf` has exactly `SIZE` bytes.
    fn read(buf: &[u8]) -> Self;
}

/// Axis configuration as persisted on the device.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    pub num_keyframes: u16,
    pub active_axes: u16,
    /// Per axis: `encoder_velocity = enc_to_mot * motor_velocity / 256`.
    pub enc_to_mot: [u16; NUM_AXES],
    /// Velocity-correction look-ahead in milliseconds. 0 disables the
    /// correction loop.
    pub lookahead: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_keyframes: 0,
            active_axes: 4,
            enc_to_mot: [256; NUM_AXES],
            lookahead: 200,
        }
    }
}

impl WirePayload for Config {
    const SIZE: usize = 2 + 2 + 2 * NUM_AXES + 2;

    fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.num_keyframes.to_le_bytes());
        out[2..4].copy_from_slice(&self.active_axes.to_le_bytes());
        for (i, v) in self.enc_to_mot.iter().enumerate() {
            out[4 + 2 * i..6 + 2 * i].copy_from_slice(&v.to_le_bytes());
        }
        out[20..22].copy_from_slice(&self.lookahead.to_le_bytes());
    }

    fn read(buf: &[u8]) -> Self {
        let mut enc_to_mot = [0u16; NUM_AXES];
        for (i, v) in enc_to_mot.iter_mut().enumerate() {
            *v = u16::from_le_bytes([buf[4 + 2 * i], buf[5 + 2 * i]]);
        }
        Config {
            num_keyframes: u16::from_le_bytes([buf[0], buf[1]]),
            active_axes: u16::from_le_bytes([buf[2], buf[3]]),
            enc_to_mot,
            lookahead: u16::from_le_bytes([buf[20], buf[21]]),
        }
    }
}

/// One keyframe in wire form. Ticks are encoder positions biased by
/// [`POSITION_BIAS`].
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Keyframe {
    /// Segment duration in milliseconds. 0 only for the initial frame.
    pub duration: u16,
    pub ticks: [u16; NUM_AXES],
    pub output_command: u8,
}

impl Default for Keyframe {
    fn default() -> Self {
        Keyframe {
            duration: 0,
            ticks: [POSITION_BIAS; NUM_AXES],
            output_command: OutputCommand::Nop as u8,
        }
    }
}

impl WirePayload for Keyframe {
    const SIZE: usize = 2 + 2 * NUM_AXES + 1;

    fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.duration.to_le_bytes());
        for (i, v) in self.ticks.iter().enumerate() {
            out[2 + 2 * i..4 + 2 * i].copy_from_slice(&v.to_le_bytes());
        }
        out[18] = self.output_command;
    }

    fn read(buf: &[u8]) -> Self {
        let mut ticks = [0u16; NUM_AXES];
        for (i, v) in ticks.iter_mut().enumerate() {
            *v = u16::from_le_bytes([buf[2 + 2 * i], buf[3 + 2 * i]]);
        }
        Keyframe {
            duration: u16::from_le_bytes([buf[0], buf[1]]),
            ticks,
            output_command: buf[18],
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaveKeyframe {
    pub index: u8,
    pub keyframe: Keyframe,
}

impl WirePayload for SaveKeyframe {
    const SIZE: usize = 1 + Keyframe::SIZE;

    fn write(&self, out: &mut [u8]) {
        out[0] = self.index;
        self.keyframe.write(&mut out[1..]);
    }

    fn read(buf: &[u8]) -> Self {
        SaveKeyframe {
            index: buf[0],
            keyframe: Keyframe::read(&buf[1..]),
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadKeyframe {
    pub index: u8,
}

impl WirePayload for ReadKeyframe {
    const SIZE: usize = 1;

    fn write(&self, out: &mut [u8]) {
        out[0] = self.index;
    }

    fn read(buf: &[u8]) -> Self {
        ReadKeyframe { index: buf[0] }
    }
}

/// Per-axis position feedback. A position of [`NO_READING`] means the
/// encoder could not be read this cycle.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Feedback {
    pub num_axes: u8,
    pub flags: u8,
    pub positions: [i16; NUM_AXES],
}

impl Default for Feedback {
    fn default() -> Self {
        Feedback {
            num_axes: 0,
            flags: 0,
            positions: [NO_READING; NUM_AXES],
        }
    }
}

impl Feedback {
    #[inline]
    pub fn is_playing(&self) -> bool {
        self.flags & FEEDBACK_FLAG_PLAYING != 0
    }
}

impl WirePayload for Feedback {
    const SIZE: usize = 2 + 2 * NUM_AXES;

    fn write(&self, out: &mut [u8]) {
        out[0] = self.num_axes;
        out[1] = self.flags;
        for (i, v) in self.positions.iter().enumerate() {
            out[2 + 2 * i..4 + 2 * i].copy_from_slice(&v.to_le_bytes());
        }
    }

    fn read(buf: &[u8]) -> Self {
        let mut positions = [0i16; NUM_AXES];
        for (i, v) in positions.iter_mut().enumerate() {
            *v = i16::from_le_bytes([buf[2 + 2 * i], buf[3 + 2 * i]]);
        }
        Feedback {
            num_axes: buf[0],
            flags: buf[1],
            positions,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Play {
    pub flags: u8,
}

impl WirePayload for Play {
    const SIZE: usize = 1;

    fn write(&self, out: &mut [u8]) {
        out[0] = self.flags;
    }

    fn read(buf: &[u8]) -> Self {
        Play { flags: buf[0] }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reset {
    pub key: [u8; 8],
}

impl Reset {
    pub const fn armed() -> Self {
        Reset { key: RESET_KEY }
    }
}

impl WirePayload for Reset {
    const SIZE: usize = 8;

    fn write(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.key);
    }

    fn read(buf: &[u8]) -> Self {
        let mut key = [0u8; 8];
        key.copy_from_slice(&buf[0..8]);
        Reset { key }
    }
}

/// Immediate motion command: per-axis destination ticks and motor
/// velocities, applied without touching the stored sequence.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Motion {
    pub ticks: [u16; NUM_AXES],
    pub velocity: [u16; NUM_AXES],
    pub num_axes: u8,
    pub output_command: u8,
}

impl Default for Motion {
    fn default() -> Self {
        Motion {
            ticks: [POSITION_BIAS; NUM_AXES],
            velocity: [0; NUM_AXES],
            num_axes: 0,
            output_command: OutputCommand::Nop as u8,
        }
    }
}

impl WirePayload for Motion {
    const SIZE: usize = 4 * NUM_AXES + 2;

    fn write(&self, out: &mut [u8]) {
        for (i, v) in self.ticks.iter().enumerate() {
            out[2 * i..2 * i + 2].copy_from_slice(&v.to_le_bytes());
        }
        for (i, v) in self.velocity.iter().enumerate() {
            out[16 + 2 * i..18 + 2 * i].copy_from_slice(&v.to_le_bytes());
        }
        out[32] = self.num_axes;
        out[33] = self.output_command;
    }

    fn read(buf: &[u8]) -> Self {
        let mut ticks = [0u16; NUM_AXES];
        let mut velocity = [0u16; NUM_AXES];
        for (i, v) in ticks.iter_mut().enumerate() {
            *v = u16::from_le_bytes([buf[2 * i], buf[2 * i + 1]]);
        }
        for (i, v) in velocity.iter_mut().enumerate() {
            *v = u16::from_le_bytes([buf[16 + 2 * i], buf[17 + 2 * i]]);
        }
        Motion {
            ticks,
            velocity,
            num_axes: buf[32],
            output_command: buf[33],
        }
    }
}

/// Packet checksum: bitwise complement of the 8-bit sum over version,
/// command, length and every payload byte.
pub fn checksum(command: u8, payload: &[u8]) -> u8 {
    let mut sum = PROTOCOL_VERSION
        .wrapping_add(command)
        .wrapping_add(payload.len() as u8);
    for &b in payload {
        sum = sum.wrapping_add(b);
    }
    !sum
}

/// Total frame length for a payload of `payload_len` bytes.
#[inline]
pub const fn frame_len(payload_len: usize) -> usize {
    payload_len + FRAME_OVERHEAD
}

/// Encode a raw frame around an already-packed payload.
pub fn encode_frame(command: Command, payload: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    if payload.len() > u8::MAX as usize {
        return Err(Error::PayloadTooLong);
    }
    let total = frame_len(payload.len());
    if out.len() < total {
        return Err(Error::BufferTooSmall);
    }

    out[0] = START_BYTE;
    out[1] = PROTOCOL_VERSION;
    out[2] = command.as_u8();
    out[3] = payload.len() as u8;
    out[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
    out[HEADER_LEN + payload.len()] = checksum(command.as_u8(), payload);
    out[HEADER_LEN + payload.len() + 1] = TERMINATOR;

    Ok(total)
}

/// Encode a frame carrying a typed payload.
pub fn encode_message<M: WirePayload>(
    command: Command,
    msg: &M,
    out: &mut [u8],
) -> Result<usize, Error> {
    let total = frame_len(M::SIZE);
    if out.len() < total {
        return Err(Error::BufferTooSmall);
    }
    out[0] = START_BYTE;
    out[1] = PROTOCOL_VERSION;
    out[2] = command.as_u8();
    out[3] = M::SIZE as u8;
    msg.write(&mut out[HEADER_LEN..HEADER_LEN + M::SIZE]);
    out[HEADER_LEN + M::SIZE] = checksum(command.as_u8(), &out[HEADER_LEN..HEADER_LEN + M::SIZE]);
    out[HEADER_LEN + M::SIZE + 1] = TERMINATOR;
    Ok(total)
}

/// Payload-less frame, e.g. `FF 0A 00 00 F5 0D` for `Init`.
pub fn simple_frame(command: Command) -> [u8; FRAME_OVERHEAD] {
    [
        START_BYTE,
        PROTOCOL_VERSION,
        command.as_u8(),
        0,
        checksum(command.as_u8(), &[]),
        TERMINATOR,
    ]
}

/// A decoded packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub payload: Vec<u8, MAX_PAYLOAD>,
}

impl Frame {
    /// Interpret the payload as a typed message. Returns `None` on a size
    /// mismatch.
    pub fn decode<M: WirePayload>(&self) -> Option<M> {
        if self.payload.len() != M::SIZE {
            return None;
        }
        Some(M::read(&self.payload))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecoderState {
    Start,
    Version,
    Command,
    Length,
    Payload,
    Checksum,
    End,
}

/// Byte-wise packet decoder.
///
/// Any mismatch (wrong version, unknown command, oversized length, bad
/// checksum, missing terminator) silently drops the partial packet and
/// returns to the start state, so stray passthrough bytes cannot wedge it.
pub struct Decoder {
    state: DecoderState,
    command: u8,
    length: u8,
    payload: Vec<u8, MAX_PAYLOAD>,
}

impl Decoder {
    pub const fn new() -> Self {
        Decoder {
            state: DecoderState::Start,
            command: 0,
            length: 0,
            payload: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state = DecoderState::Start;
        self.payload.clear();
    }

    /// Feed one byte; yields a packet after a correct terminator.
    pub fn push(&mut self, byte: u8) -> Option<Frame> {
        match self.state {
            DecoderState::Start => {
                self.payload.clear();
                if byte == START_BYTE {
                    self.state = DecoderState::Version;
                }
            }
            DecoderState::Version => {
                self.state = if byte == PROTOCOL_VERSION {
                    DecoderState::Command
                } else {
                    DecoderState::Start
                };
            }
            DecoderState::Command => {
                self.command = byte;
                self.state = if byte < COMMAND_COUNT {
                    DecoderState::Length
                } else {
                    DecoderState::Start
                };
            }
            DecoderState::Length => {
                self.length = byte;
                if byte as usize > MAX_PAYLOAD {
                    self.state = DecoderState::Start;
                } else if byte == 0 {
                    self.state = DecoderState::Checksum;
                } else {
                    self.state = DecoderState::Payload;
                }
            }
            DecoderState::Payload => {
                // Capacity is checked in the Length state.
                let _ = self.payload.push(byte);
                if self.payload.len() == self.length as usize {
                    self.state = DecoderState::Checksum;
                }
            }
            DecoderState::Checksum => {
                self.state = if checksum(self.command, &self.payload) == byte {
                    DecoderState::End
                } else {
                    DecoderState::Start
                };
            }
            DecoderState::End => {
                self.state = DecoderState::Start;
                if byte == TERMINATOR {
                    let mut payload = Vec::new();
                    core::mem::swap(&mut payload, &mut self.payload);
                    // Commands are range-checked in the Command state.
                    let command = Command::from_u8(self.command)?;
                    return Some(Frame { command, payload });
                }
            }
        }

        None
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new()
    }
}
