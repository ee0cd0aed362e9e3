//! Platform capabilities
//!
//! The core drives external silicon through three capabilities supplied by
//! the port: the bus transport, the packet buffer pool and the host OS
//! scheduling primitives. Everything here is a seam; the core never owns a
//! transport or a thread.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::WifiResult;

/// Bus function an I/O operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BusFunction {
    /// Bus-controller register space (F0)
    Bus = 0,
    /// Chip backplane window (F1)
    Backplane = 1,
    /// WLAN packet path (F2)
    Wlan = 2,
}

/// Direction of a raw backplane transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Write,
    Read,
}

/// Bus transport capability (SDIO, SPI or memory-mapped M2M).
///
/// Register and backplane accessors move up to four bytes; the WLAN packet
/// path moves whole frames. Implementations are expected to be callable from
/// both the application and the driver worker thread.
pub trait Bus: Send + Sync {
    /// Read a register of up to 4 bytes from a bus function
    fn read_register(&self, function: BusFunction, address: u32, byte_count: u8) -> WifiResult<u32>;

    /// Write a register of up to 4 bytes on a bus function
    fn write_register(
        &self,
        function: BusFunction,
        address: u32,
        byte_count: u8,
        value: u32,
    ) -> WifiResult<()>;

    /// Read up to 4 bytes from a backplane address
    fn read_backplane(&self, address: u32, byte_count: u8) -> WifiResult<u32>;

    /// Write up to 4 bytes to a backplane address
    fn write_backplane(&self, address: u32, byte_count: u8, value: u32) -> WifiResult<()>;

    /// Bulk transfer to or from a backplane address
    fn transfer_backplane_bytes(
        &self,
        direction: TransferDirection,
        address: u32,
        buffer: &mut [u8],
    ) -> WifiResult<()>;

    /// Send one framed packet on the WLAN function
    fn wlan_write(&self, frame: &[u8]) -> WifiResult<()>;

    /// Receive one framed packet from the WLAN function.
    ///
    /// Returns the frame length, or 0 when nothing is pending.
    fn wlan_read(&self, buffer: &mut [u8]) -> WifiResult<usize>;

    /// Kick the transport out of its own low-power state
    fn wakeup(&self) -> WifiResult<()>;

    /// Allow the transport to enter its own low-power state
    fn sleep(&self) -> WifiResult<()>;

    /// Transport link state
    fn is_up(&self) -> bool;

    /// Record the transport link state
    fn set_state(&self, up: bool);
}

/// Direction tag handed back to the pool on release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDir {
    Tx,
    Rx,
}

/// A pooled packet buffer.
///
/// Owns its bytes; the pool recycles the backing storage on release.
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    /// Build a zero-filled buffer of the given size
    pub fn new(size: usize) -> Self {
        Buffer { data: vec![0; size] }
    }

    /// Wrap existing storage
    pub fn from_vec(data: Vec<u8>) -> Self {
        Buffer { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Take the backing storage (pool-side recycling)
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Packet buffer pool capability.
pub trait BufferPool: Send + Sync {
    /// Acquire a zeroed buffer sized for one control request
    fn get_ioctl_buffer(&self, size: usize) -> WifiResult<Buffer>;

    /// Return a buffer to the pool
    fn release(&self, buffer: Buffer, direction: BufferDir);
}

/// Counting semaphore from the host scheduler.
pub trait Semaphore: Send + Sync {
    /// Wait for a unit; false on timeout
    fn acquire(&self, timeout_ms: u32) -> bool;

    /// Release a unit
    fn release(&self);
}

/// Host OS capability: the preemptive-scheduler services the core blocks on.
pub trait HostOs: Send + Sync {
    /// Create a counting semaphore with the given initial count
    fn semaphore(&self, initial: u32) -> Arc<dyn Semaphore>;

    /// Sleep the calling thread
    fn delay_ms(&self, ms: u32);

    /// Monotonic millisecond clock
    fn ticks_ms(&self) -> u64;
}
