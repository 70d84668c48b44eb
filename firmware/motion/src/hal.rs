//! Board abstraction consumed by the firmware core.

/// Half-duplex RS-485 link to the joint motor controllers.
pub trait BusPort {
    /// Switch the transceiver to output, send `bytes`, wait until the last
    /// byte left the shift register and switch back to input.
    /// Implementations insert the ≥200 µs direction settle on both edges.
    fn transmit(&mut self, bytes: &[u8]);

    /// Non-blocking read of one byte from the receive queue.
    fn read_byte(&mut self) -> Option<u8>;

    /// Busy-wait used while polling for a controller response.
    fn delay_us(&mut self, us: u32);
}

/// Serial link towards the host PC.
pub trait HostLink {
    fn read_byte(&mut self) -> Option<u8>;
    fn write(&mut self, bytes: &[u8]);
}

/// Digital I/O and timebase of the controller board.
pub trait DeviceIo {
    /// Milliseconds since boot, driven by the 1 kHz tick. Wraps.
    fn now_ms(&self) -> u32;

    /// Digital output manipulated by keyframe output commands.
    fn set_output(&mut self, active: bool);

    /// Start button / switch.
    fn button(&self) -> bool;

    /// Release the shared synchronisation line (input, pull-up enabled).
    fn sync_release(&mut self);

    /// Sample the synchronisation line.
    fn sync_read(&self) -> bool;

    /// Reassert (pull down) the synchronisation line.
    fn sync_assert(&mut self);

    /// Jump into the bootloader. Only invoked after a byte-exact reset key.
    fn enter_bootloader(&mut self);
}

/// Byte-addressed non-volatile memory.
pub trait Eeprom {
    fn read(&self, addr: usize, out: &mut [u8]);
    fn write(&mut self, addr: usize, data: &[u8]);
}
