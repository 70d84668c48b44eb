//! Simulated board back ends shared by the unit tests in this crate.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::format;
use std::rc::Rc;
use std::string::String;
use std::vec::Vec;

use robolink_protocol::{POSITION_BIAS, NUM_AXES};
use robolink_ringbuf::{RingBuffer, SERIAL_BUFFER};

use crate::hal::{BusPort, DeviceIo, Eeprom, HostLink};

/// Canned single-response port for the low-level driver tests.
pub struct SimBusPort {
    sent_bytes: Vec<u8>,
    pending: VecDeque<u8>,
}

impl SimBusPort {
    pub fn with_response(response: &[u8]) -> Self {
        SimBusPort {
            sent_bytes: Vec::new(),
            pending: response.iter().copied().collect(),
        }
    }

    pub fn sent(&self) -> &[u8] {
        &self.sent_bytes
    }
}

impl BusPort for SimBusPort {
    fn transmit(&mut self, bytes: &[u8]) {
        self.sent_bytes.extend_from_slice(bytes);
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.pending.pop_front()
    }

    fn delay_us(&mut self, _us: u32) {}
}

#[derive(Clone)]
pub struct AxisSim {
    pub present: bool,
    pub state: u8,
    pub program_running: bool,
    pub encoder: i16,
    pub encoder_readable: bool,
    pub destination: u16,
    pub velocity: u16,
    pub destinations: Vec<u16>,
    pub velocities: Vec<u16>,
    /// When set, the encoder snaps to each commanded destination, so moves
    /// complete instantly.
    pub track: bool,
}

impl Default for AxisSim {
    fn default() -> Self {
        AxisSim {
            present: true,
            state: crate::bus::STATE_IDLE,
            program_running: true,
            encoder: 0,
            encoder_readable: true,
            destination: POSITION_BIAS,
            velocity: 0,
            destinations: Vec::new(),
            velocities: Vec::new(),
            track: false,
        }
    }
}

pub struct JointsInner {
    pub axes: [AxisSim; NUM_AXES],
    pub raw: Vec<u8>,
    /// Every byte ever sent over the bus, framing included.
    pub transmitted: Vec<u8>,
    pending: VecDeque<u8>,
}

/// ASCII-level simulation of the motor controllers on the RS-485 bus.
#[derive(Clone)]
pub struct SimJoints {
    pub inner: Rc<RefCell<JointsInner>>,
}

impl SimJoints {
    pub fn new() -> Self {
        SimJoints {
            inner: Rc::new(RefCell::new(JointsInner {
                axes: core::array::from_fn(|_| AxisSim::default()),
                raw: Vec::new(),
                transmitted: Vec::new(),
                pending: VecDeque::new(),
            })),
        }
    }

    pub fn tracking() -> Self {
        let sim = SimJoints::new();
        for axis in sim.inner.borrow_mut().axes.iter_mut() {
            axis.track = true;
        }
        sim
    }

    fn respond(inner: &mut JointsInner, text: String) {
        inner.pending.extend(text.as_bytes());
        inner.pending.push_back(b'\r');
    }

    fn handle(inner: &mut JointsInner, command: &str) {
        let bytes = command.as_bytes();
        if bytes.len() < 2 || bytes[0] != b'#' || !bytes[1].is_ascii_digit() {
            return;
        }
        let id = (bytes[1] - b'0') as usize;
        if id == 0 || id > NUM_AXES {
            return;
        }
        let rest = &command[2..];
        if !inner.axes[id - 1].present {
            return;
        }

        if rest == "ZP" {
            let state = inner.axes[id - 1].state;
            Self::respond(inner, format!("{}ZP+{}", id, state));
        } else if rest == "ZI" {
            if inner.axes[id - 1].encoder_readable {
                let encoder = inner.axes[id - 1].encoder;
                Self::respond(inner, format!("{}ZI{}", id, encoder));
            }
        } else if rest == "Zs" {
            let destination = inner.axes[id - 1].destination;
            Self::respond(inner, format!("{}Zs{}", id, destination));
        } else if rest == "(JA" {
            inner.axes[id - 1].program_running = true;
            Self::respond(inner, format!("{}(JA+", id));
        } else if let Some(value) = rest.strip_prefix('P') {
            if let Ok(state) = value.parse::<u8>() {
                inner.axes[id - 1].state = state;
            }
            Self::respond(inner, format!("{}{}", id, rest));
        } else if let Some(value) = rest.strip_prefix('n') {
            if let Ok(destination) = value.parse::<u16>() {
                let axis = &mut inner.axes[id - 1];
                axis.destination = destination;
                axis.destinations.push(destination);
                if axis.track {
                    axis.encoder = (destination as i32 - POSITION_BIAS as i32) as i16;
                }
            }
            Self::respond(inner, format!("{}{}", id, rest));
        } else if let Some(value) = rest.strip_prefix('o') {
            if let Ok(velocity) = value.parse::<u16>() {
                let axis = &mut inner.axes[id - 1];
                axis.velocity = velocity;
                axis.velocities.push(velocity);
            }
            Self::respond(inner, format!("{}{}", id, rest));
        }
    }
}

impl BusPort for SimJoints {
    fn transmit(&mut self, bytes: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        inner.transmitted.extend_from_slice(bytes);
        inner.raw.extend_from_slice(bytes);

        // Split CR-terminated commands; a partial trailing command would be
        // completed by the next transmit, which the driver never does.
        let raw = core::mem::take(&mut inner.raw);
        let mut start = 0;
        for (i, &b) in raw.iter().enumerate() {
            if b == b'\r' {
                if let Ok(command) = core::str::from_utf8(&raw[start..i]) {
                    Self::handle(&mut inner, command);
                }
                start = i + 1;
            }
        }
        inner.raw = raw[start..].to_vec();
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.inner.borrow_mut().pending.pop_front()
    }

    fn delay_us(&mut self, _us: u32) {}
}

/// Byte-addressed EEPROM image with a write counter for wear tests.
pub struct SimEeprom {
    pub data: RefCell<Vec<u8>>,
    pub writes: Cell<usize>,
}

impl SimEeprom {
    pub fn blank(size: usize) -> Self {
        SimEeprom {
            data: RefCell::new(std::vec![0xFF; size]),
            writes: Cell::new(0),
        }
    }
}

impl Eeprom for SimEeprom {
    fn read(&self, addr: usize, out: &mut [u8]) {
        let data = self.data.borrow();
        out.copy_from_slice(&data[addr..addr + out.len()]);
    }

    fn write(&mut self, addr: usize, bytes: &[u8]) {
        self.writes.set(self.writes.get() + 1);
        let mut data = self.data.borrow_mut();
        data[addr..addr + bytes.len()].copy_from_slice(bytes);
    }
}

/// Board I/O with externally driven clock and button.
#[derive(Clone, Default)]
pub struct SimIo {
    pub now: Rc<Cell<u32>>,
    pub output: Rc<Cell<bool>>,
    pub output_writes: Rc<Cell<usize>>,
    pub button: Rc<Cell<bool>>,
    pub sync_line: Rc<Cell<bool>>,
    pub sync_released: Rc<Cell<bool>>,
    pub bootloader: Rc<Cell<bool>>,
}

impl SimIo {
    pub fn new() -> Self {
        let io = SimIo::default();
        io.sync_line.set(true);
        io
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

impl DeviceIo for SimIo {
    fn now_ms(&self) -> u32 {
        self.now.get()
    }

    fn set_output(&mut self, active: bool) {
        self.output.set(active);
        self.output_writes.set(self.output_writes.get() + 1);
    }

    fn button(&self) -> bool {
        self.button.get()
    }

    fn sync_release(&mut self) {
        self.sync_released.set(true);
    }

    fn sync_read(&self) -> bool {
        self.sync_line.get()
    }

    fn sync_assert(&mut self) {
        self.sync_released.set(false);
    }

    fn enter_bootloader(&mut self) {
        self.bootloader.set(true);
    }
}

/// Host serial link: the receive side runs through the same SPSC queue the
/// UART interrupt fills on hardware.
pub struct SimHost {
    pub rx: RingBuffer<SERIAL_BUFFER>,
    pub tx: Vec<u8>,
}

impl SimHost {
    pub fn new() -> Self {
        SimHost {
            rx: RingBuffer::new(),
            tx: Vec::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.put_all(bytes);
    }

    pub fn take_tx(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.tx)
    }
}

impl HostLink for SimHost {
    fn read_byte(&mut self) -> Option<u8> {
        self.rx.get()
    }

    fn write(&mut self, bytes: &[u8]) {
        self.tx.extend_from_slice(bytes);
    }
}
