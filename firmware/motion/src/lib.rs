#![no_std]

//! Hardware-agnostic core of the arm microcontroller firmware.
//!
//! The board shell (UART interrupts feeding `robolink-ringbuf` queues, the
//! 1 kHz tick timer, the EEPROM cell, GPIO) is injected through the small
//! traits in [`hal`]; everything above that line lives here and is exercised
//! by host-run unit tests against simulated back ends.
//!
//! The main loop is cooperative: [`device::Device::poll`] advances one
//! iteration of whatever is active (passthrough shovelling, packet
//! dispatching, or one axis pass of the playback engine), so the host can
//! always reach the device mid-motion.

#[cfg(test)]
extern crate std;

pub mod bus;
pub mod device;
pub mod hal;
pub mod passthrough;
pub mod sequencer;
pub mod store;

#[cfg(test)]
pub(crate) mod sim;
