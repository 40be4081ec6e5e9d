//! # Uniform storage interface
//!
//! One small trait, [StorageBackend], spans the three very different
//! media the bridge can persist to: a FAT volume on SD, the flat
//! filesystem on the NOR chip, and the framed hex stream toward a
//! host. The [router::StorageRouter] owns one backend of each kind,
//! dispatches on [StorageKind] and handles selection and fail-over.
//!
//! File names are short ASCII strings bounded by [NAME_MAX]; the
//! router applies [validate_name] before any dispatch so the backends
//! can rely on well-formed names.
use crate::Error;

pub mod hex;
pub mod nor;
pub mod router;
pub mod sd;

/// Fixed name limit. Valid names are strictly shorter, which keeps
/// them storable in the NOR directory and within 8.3 on FAT.
pub const NAME_MAX: usize = 16;

/// Owned file name, fixed capacity.
pub type FileName = heapless::String<NAME_MAX>;

/// Backend identity used for selection and explicit dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageKind {
    Sd,
    Nor,
    Hex,
    /// Resolve by the priority policy: Sd, then Nor, then Hex.
    Auto,
}

/// Uniform file operations over one backing store.
///
/// All operations are synchronous and bounded; blocking primitives
/// underneath carry their own timeouts. `update` is the periodic
/// housekeeping hook (media presence probing, lazy mounting) driven
/// once per run-loop tick.
pub trait StorageBackend {
    /// True when the medium can accept operations right now.
    fn is_ready(&mut self) -> bool;

    /// Periodic housekeeping; re-probes removable media.
    fn update(&mut self) -> Result<(), Error>;

    /// Creates (or replaces) `name` with the full contents `bytes`.
    fn write(&mut self, name: &str, bytes: &[u8]) -> Result<usize, Error>;

    /// Reads up to `dst.len()` bytes of `name`.
    fn read(&mut self, name: &str, dst: &mut [u8]) -> Result<usize, Error>;

    fn exists(&mut self, name: &str) -> bool;

    fn size(&mut self, name: &str) -> Result<u32, Error>;

    fn delete(&mut self, name: &str) -> Result<(), Error>;

    /// Fills `out` with file names; returns the number filled.
    fn list(&mut self, out: &mut [FileName]) -> Result<usize, Error>;

    fn format(&mut self) -> Result<(), Error>;

    /// `(available, total)` in bytes.
    fn space(&mut self) -> Result<(u64, u64), Error>;
}

/// Checks a file name before it reaches any backend: non-empty,
/// strictly shorter than [NAME_MAX], no control bytes, none of the
/// characters rejected by FAT.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() >= NAME_MAX {
        return Err(Error::InvalidName);
    }
    for byte in name.bytes() {
        if byte < 0x20
            || matches!(
                byte,
                b'/' | b'\\' | b':' | b'*' | b'?' | b'"' | b'<' | b'>' | b'|'
            )
        {
            return Err(Error::InvalidName);
        }
    }
    Ok(())
}
