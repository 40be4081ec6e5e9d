//! Core of an IEEE-1284 hardcopy capture bridge.
//!
//! This crate contains the hardware-independent core of a small embedded
//! device that accepts byte-parallel print data from a legacy peripheral
//! (a Tektronix TDS-series oscilloscope or any Standard Parallel Port
//! talker) and persists it to one of three backing stores: a FAT volume
//! on an SD card, a flat filesystem on a 16 MiB SPI NOR chip, or a host
//! computer reachable over a serial link using a hex-framed protocol.
//!
//! The crate is strictly `no_std` and allocation-free. All hardware
//! access goes through [embedded_hal] and [embedded_io] traits so the
//! core can be driven by any HAL and tested on the host. The only
//! asynchronous execution context is the parallel-port strobe interrupt;
//! everything else runs inside a single cooperative loop, see
//! [runloop::RunLoop].
//!
//! Construction follows a composition-root pattern: the board support
//! code creates the shared receiver state, splits the receiver into its
//! task and interrupt halves, wires the storage backends into a
//! [storage::router::StorageRouter] and hands everything to the run
//! loop. No component reaches for global state on its own.
#![no_std]

#[cfg(test)]
extern crate std;

pub mod nor;
pub mod parallel;
pub mod queue;
pub mod runloop;
pub mod storage;

/// Error taxonomy shared by every storage backend and driver in the
/// crate.
///
/// Low-level driver detail (a concrete SPI error, a FAT library error)
/// is folded into these kinds at the module boundary; callers decide
/// about retries. The router never maps an error to a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    #[error("selected backend is not usable right now")]
    NotReady,
    #[error("name does not exist")]
    NotFound,
    #[error("name already exists and the backend forbids overwrite")]
    AlreadyExists,
    #[error("name fails validation")]
    InvalidName,
    #[error("allocation cannot be met")]
    NoSpace,
    #[error("medium reported a read/write failure")]
    IoError,
    #[error("blocking operation exceeded its budget")]
    Timeout,
    #[error("integrity check failed")]
    Corruption,
    #[error("operation already in progress")]
    Busy,
    #[error("operation not supported by this backend")]
    Unsupported,
    #[error("caller buffer cannot hold the value")]
    BufferTooSmall,
    #[error("framing or signaling violation on the wire")]
    ProtocolError,
}
