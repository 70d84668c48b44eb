#![no_std]

//! Lock-free single-producer single-consumer byte queue.
//!
//! Backs the UART receive/transmit paths on the arm microcontroller: the
//! interrupt handler is the sole producer (or consumer, for TX) and the main
//! loop is the other side. Indices are monotonically increasing and masked on
//! access, so a full queue is distinguishable from an empty one without a
//! separate count.
//!
//! Capacity must be a power of two; the serial paths use [`SERIAL_BUFFER`].

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Queue capacity used by the device serial paths.
pub const SERIAL_BUFFER: usize = 256;

pub struct RingBuffer<const N: usize> {
    buf: UnsafeCell<[u8; N]>,
    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
}

// One producer and one consumer may access the queue concurrently. The
// producer only writes `buf[write_idx]` before publishing `write_idx`; the
// consumer only reads published slots.
unsafe impl<const N: usize> Sync for RingBuffer<N> {}

impl<const N: usize> RingBuffer<N> {
    const CAPACITY_IS_POWER_OF_TWO: () = assert!(N.is_power_of_two());

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::CAPACITY_IS_POWER_OF_TWO;
        RingBuffer {
            buf: UnsafeCell::new([0; N]),
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
        }
    }

    /// Enqueue one byte. Returns `false` (dropping the byte) when the queue
    /// is full. Producer side only.
    pub fn put(&self, byte: u8) -> bool {
        let write = self.write_idx.load(Ordering::Relaxed);
        let read = self.read_idx.load(Ordering::Acquire);
        if write.wrapping_sub(read) == N {
            return false;
        }

        unsafe {
            (*self.buf.get())[write & (N - 1)] = byte;
        }
        self.write_idx.store(write.wrapping_add(1), Ordering::Release);
        true
    }

    /// Enqueue a slice, dropping bytes that do not fit. Producer side only.
    pub fn put_all(&self, data: &[u8]) {
        for &b in data {
            self.put(b);
        }
    }

    /// Dequeue one byte. Consumer side only.
    pub fn get(&self) -> Option<u8> {
        let read = self.read_idx.load(Ordering::Relaxed);
        let write = self.write_idx.load(Ordering::Acquire);
        if read == write {
            return None;
        }

        let byte = unsafe { (*self.buf.get())[read & (N - 1)] };
        self.read_idx.store(read.wrapping_add(1), Ordering::Release);
        Some(byte)
    }

    /// True when at least one byte is queued.
    pub fn available(&self) -> bool {
        self.read_idx.load(Ordering::Relaxed) != self.write_idx.load(Ordering::Acquire)
    }

    /// Number of queued bytes.
    pub fn len(&self) -> usize {
        let write = self.write_idx.load(Ordering::Acquire);
        let read = self.read_idx.load(Ordering::Relaxed);
        write.wrapping_sub(read)
    }

    pub fn is_empty(&self) -> bool {
        !self.available()
    }

    /// Discard everything queued so far. Consumer side only.
    pub fn flush(&self) {
        let write = self.write_idx.load(Ordering::Acquire);
        self.read_idx.store(write, Ordering::Release);
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        RingBuffer::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    #[test]
    fn put_get_in_order() {
        let rb: RingBuffer<8> = RingBuffer::new();
        rb.put_all(&[1, 2, 3]);
        assert_eq!(rb.len(), 3);
        assert_eq!(rb.get(), Some(1));
        assert_eq!(rb.get(), Some(2));
        assert_eq!(rb.get(), Some(3));
        assert_eq!(rb.get(), None);
        assert!(rb.is_empty());
    }

    #[test]
    fn full_queue_drops_new_bytes() {
        let rb: RingBuffer<4> = RingBuffer::new();
        for i in 0..4 {
            assert!(rb.put(i));
        }
        assert!(!rb.put(99));
        assert_eq!(rb.len(), 4);
        assert_eq!(rb.get(), Some(0));
        assert!(rb.put(99));
    }

    #[test]
    fn flush_discards_pending() {
        let rb: RingBuffer<8> = RingBuffer::new();
        rb.put_all(&[1, 2, 3]);
        rb.flush();
        assert!(!rb.available());
        assert_eq!(rb.get(), None);

        rb.put(4);
        assert_eq!(rb.get(), Some(4));
    }

    #[test]
    fn wraparound_preserves_order() {
        let rb: RingBuffer<4> = RingBuffer::new();
        for round in 0..10u8 {
            rb.put_all(&[round, round.wrapping_add(1)]);
            assert_eq!(rb.get(), Some(round));
            assert_eq!(rb.get(), Some(round.wrapping_add(1)));
        }
    }

    #[test]
    fn concurrent_producer_consumer() {
        let rb: Arc<RingBuffer<SERIAL_BUFFER>> = Arc::new(RingBuffer::new());
        let producer = rb.clone();

        let handle = thread::spawn(move || {
            for i in 0..10_000u32 {
                while !producer.put((i & 0xFF) as u8) {
                    thread::yield_now();
                }
            }
        });

        let mut received = Vec::with_capacity(10_000);
        while received.len() < 10_000 {
            if let Some(b) = rb.get() {
                received.push(b);
            } else {
                thread::yield_now();
            }
        }
        handle.join().unwrap();

        for (i, b) in received.iter().enumerate() {
            assert_eq!(*b, (i & 0xFF) as u8);
        }
    }
}
