//! Serial transport: port lifecycle, legacy ASCII exchanges and
//! extended-protocol request/reply framing.
//!
//! The transport owns the serial handle exclusively. Ports are opened in
//! ascending index, cycling modulo [`PORT_CYCLE`] until a robot answers.
//! Two failure classes are kept apart: transport-fatal conditions (a write
//! that moves no bytes, ten consecutive read timeouts) close the port and
//! reset the connection, while transient garbage (checksum mismatch, stray
//! prefix bytes) is resynchronised away by scanning for the packet header.

use std::io;
use std::time::Duration;

use log::{debug, warn};
use robolink_protocol::{checksum, Command, FRAME_OVERHEAD, HEADER_LEN, PROTOCOL_VERSION, START_BYTE};
use thiserror::Error;

pub const BAUD_RATE: u32 = 115_200;
/// How many port indices to cycle while searching for a robot.
pub const PORT_CYCLE: usize = 15;
/// Blocking read window.
pub const READ_TIMEOUT: Duration = Duration::from_millis(200);
/// Consecutive ASCII read timeouts before the link counts as lost.
pub const TIMEOUT_TICKS: i32 = 10;
/// Read attempts per extended-mode reply.
const EXT_READ_ATTEMPTS: u32 = 10;

const RECEIVE_BUFFER: usize = 64;

/// Byte-level serial access. `read` returns `Ok(0)` on timeout.
pub trait SerialLink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens ports by cycle index; the OS-specific naming lives behind this.
pub trait PortOpener {
    type Port: SerialLink;
    fn open(&mut self, index: usize) -> Option<Self::Port>;
}

/// Outcome of a legacy ASCII exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxEvent {
    /// Reply with the trailing carriage return stripped.
    Response(String),
    /// No reply this round; the link is still considered up.
    Timeout,
    /// Transport-fatal: the port has been closed.
    Disconnected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtError {
    #[error("no reply from the microcontroller")]
    Timeout,
    #[error("reply failed the checksum")]
    ChecksumMismatch,
    #[error("reply did not match the request")]
    Mismatch,
    #[error("serial link lost")]
    Disconnected,
}

pub struct Transport<O: PortOpener> {
    opener: O,
    port: Option<O::Port>,
    port_index: usize,
    timeout_ticks_left: i32,
}

impl<O: PortOpener> Transport<O> {
    pub fn new(opener: O) -> Self {
        Transport {
            opener,
            port: None,
            port_index: 0,
            timeout_ticks_left: TIMEOUT_TICKS,
        }
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    pub fn port_index(&self) -> usize {
        self.port_index
    }

    /// Try the current index; advance to the next on failure.
    pub fn try_open(&mut self) -> bool {
        match self.opener.open(self.port_index) {
            Some(port) => {
                debug!("trying port index {}", self.port_index);
                self.port = Some(port);
                self.timeout_ticks_left = TIMEOUT_TICKS;
                true
            }
            None => {
                self.port_index = (self.port_index + 1) % PORT_CYCLE;
                false
            }
        }
    }

    pub fn close(&mut self) {
        self.port = None;
    }

    /// Close and move on to the next port index.
    pub fn cycle_port(&mut self) {
        self.close();
        self.port_index = (self.port_index + 1) % PORT_CYCLE;
    }

    fn fatal(&mut self) {
        warn!("serial port lost, closing");
        self.close();
    }

    /// One ASCII exchange: send the command, wait up to the read timeout
    /// for the reply.
    pub fn txrx(&mut self, command: &str) -> TxEvent {
        let Some(port) = self.port.as_mut() else {
            return TxEvent::Disconnected;
        };

        match port.write(command.as_bytes()) {
            Ok(n) if n == command.len() => {}
            _ => {
                self.fatal();
                return TxEvent::Disconnected;
            }
        }

        let mut buf = [0u8; RECEIVE_BUFFER];
        let read = match port.read(&mut buf) {
            Ok(n) => n,
            Err(_) => {
                self.fatal();
                return TxEvent::Disconnected;
            }
        };

        if read == 0 {
            self.timeout_ticks_left -= 1;
            if self.timeout_ticks_left <= 0 {
                self.timeout_ticks_left = TIMEOUT_TICKS;
                self.fatal();
                return TxEvent::Disconnected;
            }
            return TxEvent::Timeout;
        }

        self.timeout_ticks_left = TIMEOUT_TICKS;
        let mut response = String::from_utf8_lossy(&buf[..read]).into_owned();
        while response.ends_with('\r') || response.ends_with('\n') {
            response.pop();
        }
        debug!("ascii '{}' -> '{}'", command.trim_end(), response);
        TxEvent::Response(response)
    }

    /// Fire-and-forget write for packets that have no reply (`Reset`).
    pub fn send_raw(&mut self, bytes: &[u8]) -> bool {
        let Some(port) = self.port.as_mut() else {
            return false;
        };
        match port.write(bytes) {
            Ok(n) if n == bytes.len() => true,
            _ => {
                self.fatal();
                false
            }
        }
    }

    /// Send an extended-protocol request and collect the fixed-size reply
    /// frame for `reply_command` with `payload_len` payload bytes.
    ///
    /// Stray bytes before the reply are skipped by scanning for the header
    /// triple (start byte, version, command); the scan is bounded by the
    /// reply size, matching the transient-error policy.
    pub fn ext_request(
        &mut self,
        request: &[u8],
        reply_command: Command,
        payload_len: usize,
    ) -> Result<Vec<u8>, ExtError> {
        let Some(port) = self.port.as_mut() else {
            return Err(ExtError::Disconnected);
        };

        match port.write(request) {
            Ok(n) if n == request.len() => {}
            _ => {
                self.fatal();
                return Err(ExtError::Disconnected);
            }
        }

        let expected = payload_len + FRAME_OVERHEAD;
        let header = [START_BYTE, PROTOCOL_VERSION, reply_command.as_u8()];
        let mut buf = vec![0u8; expected];
        let mut filled = 0;
        let mut attempts = 0;

        while filled < expected {
            attempts += 1;
            if attempts > EXT_READ_ATTEMPTS {
                debug!("extended reply timeout ({} of {} bytes)", filled, expected);
                return Err(ExtError::Timeout);
            }

            let read = match port.read(&mut buf[filled..]) {
                Ok(n) => n,
                Err(_) => {
                    self.fatal();
                    return Err(ExtError::Disconnected);
                }
            };
            if read == 0 {
                continue;
            }
            filled += read;

            if filled < header.len() + 1 {
                continue;
            }

            // Re-align on the reply header if stray bytes slipped in.
            let mut skip = 0;
            while skip < filled && !buf[skip..].starts_with(&header[..header.len().min(filled - skip)])
            {
                skip += 1;
            }
            if skip > 0 {
                buf.copy_within(skip..filled, 0);
                filled -= skip;
            }
        }

        if buf[3] as usize != payload_len {
            return Err(ExtError::Mismatch);
        }
        let payload = &buf[HEADER_LEN..HEADER_LEN + payload_len];
        if checksum(reply_command.as_u8(), payload) != buf[HEADER_LEN + payload_len] {
            debug!("extended reply checksum mismatch");
            return Err(ExtError::ChecksumMismatch);
        }

        Ok(buf)
    }
}

/// Platform serial ports, 115200 8N1 with no handshaking.
pub struct SystemPorts;

fn port_name(index: usize) -> String {
    #[cfg(windows)]
    {
        format!(r"\\.\COM{}", index)
    }
    #[cfg(not(windows))]
    {
        format!("/dev/ttyUSB{}", index)
    }
}

pub struct SystemPort(Box<dyn serialport::SerialPort>);

impl SerialLink for SystemPort {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let n = std::io::Write::write(&mut self.0, bytes)?;
        std::io::Write::flush(&mut self.0)?;
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match std::io::Read::read(&mut self.0, buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl PortOpener for SystemPorts {
    type Port = SystemPort;

    fn open(&mut self, index: usize) -> Option<SystemPort> {
        serialport::new(port_name(index), BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .ok()
            .map(SystemPort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robolink_protocol::simple_frame;
    use std::collections::VecDeque;

    /// Port that replays canned reply chunks, one per read call.
    pub struct ScriptedPort {
        pub written: Vec<u8>,
        pub replies: VecDeque<Vec<u8>>,
        pub fail_writes: bool,
    }

    impl ScriptedPort {
        fn new(replies: &[&[u8]]) -> Self {
            ScriptedPort {
                written: Vec::new(),
                replies: replies.iter().map(|r| r.to_vec()).collect(),
                fail_writes: false,
            }
        }
    }

    impl SerialLink for ScriptedPort {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            if self.fail_writes {
                return Ok(0);
            }
            self.written.extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.replies.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.replies.push_front(chunk.split_off(n));
                    }
                    Ok(n)
                }
                None => Ok(0),
            }
        }
    }

    struct OneShotOpener {
        port: Option<ScriptedPort>,
        fail_first: usize,
    }

    impl PortOpener for OneShotOpener {
        type Port = ScriptedPort;

        fn open(&mut self, _index: usize) -> Option<ScriptedPort> {
            if self.fail_first > 0 {
                self.fail_first -= 1;
                return None;
            }
            self.port.take()
        }
    }

    fn transport(replies: &[&[u8]]) -> Transport<OneShotOpener> {
        let mut t = Transport::new(OneShotOpener {
            port: Some(ScriptedPort::new(replies)),
            fail_first: 0,
        });
        assert!(t.try_open());
        t
    }

    #[test]
    fn failed_opens_cycle_the_port_index() {
        let mut t = Transport::new(OneShotOpener {
            port: Some(ScriptedPort::new(&[])),
            fail_first: 2,
        });
        assert!(!t.try_open());
        assert_eq!(t.port_index(), 1);
        assert!(!t.try_open());
        assert_eq!(t.port_index(), 2);
        assert!(t.try_open());
    }

    #[test]
    fn ascii_exchange_sends_expected_bytes() {
        let mut t = transport(&[b"1ZP+0\r"]);
        let reply = t.txrx("#1ZP\r");
        assert_eq!(reply, TxEvent::Response("1ZP+0".into()));
        // Boot-and-connect byte stream: 23 31 5A 50 0D.
        assert_eq!(t.port.as_ref().unwrap().written, [0x23, 0x31, 0x5A, 0x50, 0x0D]);
    }

    #[test]
    fn zero_byte_write_disconnects() {
        let mut t = transport(&[]);
        t.port.as_mut().unwrap().fail_writes = true;
        assert_eq!(t.txrx("#1ZP\r"), TxEvent::Disconnected);
        assert!(!t.is_open());
    }

    #[test]
    fn ten_consecutive_timeouts_disconnect() {
        let mut t = transport(&[]);
        for _ in 0..TIMEOUT_TICKS - 1 {
            assert_eq!(t.txrx("#1ZP\r"), TxEvent::Timeout);
        }
        assert_eq!(t.txrx("#1ZP\r"), TxEvent::Disconnected);
        assert!(!t.is_open());
    }

    #[test]
    fn a_reply_resets_the_timeout_budget() {
        let mut t = transport(&[b"", b"1ZP+0\r"]);
        assert_eq!(t.txrx("#1ZP\r"), TxEvent::Timeout);
        assert_eq!(t.txrx("#1ZP\r"), TxEvent::Response("1ZP+0".into()));
        for _ in 0..TIMEOUT_TICKS - 1 {
            assert_eq!(t.txrx("#1ZP\r"), TxEvent::Timeout);
        }
        assert_eq!(t.txrx("#1ZP\r"), TxEvent::Disconnected);
    }

    #[test]
    fn extended_reply_round_trips() {
        let frame = simple_frame(Command::Init);
        let mut t = transport(&[&frame]);
        let reply = t.ext_request(&frame, Command::Init, 0).unwrap();
        assert_eq!(reply, frame);
    }

    #[test]
    fn extended_reply_survives_stray_prefix_bytes() {
        let frame = simple_frame(Command::Feedback);
        let mut dirty = b"2ZI\r".to_vec();
        dirty.extend_from_slice(&frame);
        let mut t = transport(&[&dirty]);

        let reply = t
            .ext_request(&simple_frame(Command::Feedback), Command::Feedback, 0)
            .unwrap();
        assert_eq!(reply, frame);
    }

    #[test]
    fn extended_reply_reassembles_split_reads() {
        let frame = simple_frame(Command::Play);
        let mut t = transport(&[&frame[..2], &frame[2..]]);
        let reply = t.ext_request(&frame, Command::Play, 0).unwrap();
        assert_eq!(reply, frame);
    }

    #[test]
    fn corrupted_checksum_is_an_error() {
        let mut frame = simple_frame(Command::Init);
        frame[4] ^= 0xFF;
        let mut t = transport(&[&frame]);
        assert_eq!(
            t.ext_request(&simple_frame(Command::Init), Command::Init, 0),
            Err(ExtError::ChecksumMismatch)
        );
    }

    #[test]
    fn silence_times_out_without_closing_the_port() {
        let mut t = transport(&[]);
        assert_eq!(
            t.ext_request(&simple_frame(Command::Init), Command::Init, 0),
            Err(ExtError::Timeout)
        );
        assert!(t.is_open());
    }
}
