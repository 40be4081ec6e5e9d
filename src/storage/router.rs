//! # Storage router
//!
//! Owns one backend of each kind and presents the single storage
//! surface the rest of the firmware talks to. Dispatch is static: the
//! three backends live in the router as plain fields and a
//! [StorageKind] match hands out a `&mut dyn` view of the right one.
//!
//! Selection policy: `Auto` resolves in the priority order Sd, Nor,
//! Hex, falling back to Sd as the stable default when nothing is
//! ready. Selection is sticky; it is re-evaluated only when the
//! currently selected backend stops being ready, or when the operator
//! selects explicitly. A manual selection likewise holds until its
//! backend goes away.
//!
//! Cross-medium copy streams through a fixed transfer buffer owned by
//! the router. The flat filesystem cannot append, so a source larger
//! than the buffer is rejected with `BufferTooSmall` rather than
//! chunked.
use core::fmt::Write as _;

use super::{FileName, StorageBackend, StorageKind, validate_name};
use crate::Error;

/// Size of the copy scratch buffer, and therefore the copy size cap.
pub const TRANSFER_BUF_LEN: usize = 2048;

/// Canned payload for the router self-test.
const TEST_PATTERN: &[u8; 32] = b"hardcopy-selftest-0123456789ABCD";
const TEST_NAME: &str = "test.dat";

/// Running totals kept by the router.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RouterStats {
    pub files_written: u32,
    pub files_read: u32,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

pub struct StorageRouter<Sd, Nor, Hex>
where
    Sd: StorageBackend,
    Nor: StorageBackend,
    Hex: StorageBackend,
{
    sd: Sd,
    nor: Nor,
    hex: Hex,
    /// Always a concrete kind, never `Auto`.
    selected: StorageKind,
    /// Operator override in effect.
    manual: bool,
    auto_counter: u16,
    stats: RouterStats,
    transfer_buf: [u8; TRANSFER_BUF_LEN],
}

impl<Sd, Nor, Hex> StorageRouter<Sd, Nor, Hex>
where
    Sd: StorageBackend,
    Nor: StorageBackend,
    Hex: StorageBackend,
{
    pub fn new(sd: Sd, nor: Nor, hex: Hex) -> Self {
        Self {
            sd,
            nor,
            hex,
            selected: StorageKind::Sd,
            manual: false,
            auto_counter: 0,
            stats: RouterStats::default(),
            transfer_buf: [0; TRANSFER_BUF_LEN],
        }
    }

    fn backend_mut(&mut self, kind: StorageKind) -> &mut dyn StorageBackend {
        match kind {
            StorageKind::Sd => &mut self.sd,
            StorageKind::Nor => &mut self.nor,
            StorageKind::Hex => &mut self.hex,
            // Callers resolve Auto first.
            StorageKind::Auto => unreachable!(),
        }
    }

    fn resolve(&self, kind: StorageKind) -> StorageKind {
        match kind {
            StorageKind::Auto => self.selected,
            concrete => concrete,
        }
    }

    fn auto_pick(&mut self) -> StorageKind {
        if self.sd.is_ready() {
            StorageKind::Sd
        } else if self.nor.is_ready() {
            StorageKind::Nor
        } else if self.hex.is_ready() {
            StorageKind::Hex
        } else {
            StorageKind::Sd
        }
    }

    /// Re-runs the selection policy if the current backend went away.
    /// Fails `NotReady` if nothing usable remains.
    fn ensure_selected_ready(&mut self) -> Result<(), Error> {
        if self.backend_mut(self.selected).is_ready() {
            return Ok(());
        }
        self.manual = false;
        self.selected = self.auto_pick();
        if self.backend_mut(self.selected).is_ready() {
            #[cfg(feature = "defmt")]
            defmt::debug!("router: failed over to {}", self.selected);
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    /// Periodic housekeeping: advances every backend and maintains the
    /// selection. Returns the last backend error, if any.
    pub fn update(&mut self) -> Result<(), Error> {
        let mut result = Ok(());
        for kind in [StorageKind::Sd, StorageKind::Nor, StorageKind::Hex] {
            if let Err(error) = self.backend_mut(kind).update() {
                result = Err(error);
            }
        }
        if !self.backend_mut(self.selected).is_ready() {
            self.manual = false;
            self.selected = self.auto_pick();
        }
        result
    }

    /// Selects a backend. `Auto` re-runs the priority policy; a
    /// concrete kind must be ready to take effect. Returns whether the
    /// selection was applied.
    pub fn select(&mut self, kind: StorageKind) -> bool {
        match kind {
            StorageKind::Auto => {
                self.manual = false;
                self.selected = self.auto_pick();
                true
            }
            concrete => {
                if self.backend_mut(concrete).is_ready() {
                    self.manual = true;
                    self.selected = concrete;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// The backend operations currently go to.
    pub fn selected(&self) -> StorageKind {
        self.selected
    }

    /// Direct backend access for maintenance operations that have no
    /// uniform equivalent (filesystem check, defragmentation, stream
    /// configuration).
    pub fn sd_mut(&mut self) -> &mut Sd {
        &mut self.sd
    }

    pub fn nor_mut(&mut self) -> &mut Nor {
        &mut self.nor
    }

    pub fn hex_mut(&mut self) -> &mut Hex {
        &mut self.hex
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    pub fn write(&mut self, name: &str, bytes: &[u8]) -> Result<usize, Error> {
        validate_name(name)?;
        self.ensure_selected_ready()?;
        let written = self.backend_mut(self.selected).write(name, bytes)?;
        self.stats.files_written += 1;
        self.stats.bytes_written += written as u64;
        Ok(written)
    }

    /// Writes under a generated name `{prefix}_{counter:04}{ext}`.
    ///
    /// The counter is process-local and strictly increasing; it
    /// advances even when the write fails, so a retried capture never
    /// reuses a name. The generated name is returned through
    /// `out_name` on success.
    pub fn write_auto(
        &mut self,
        prefix: &str,
        ext: &str,
        bytes: &[u8],
        out_name: Option<&mut FileName>,
    ) -> Result<usize, Error> {
        self.auto_counter = self.auto_counter.wrapping_add(1);
        let mut name = FileName::new();
        write!(name, "{prefix}_{:04}{ext}", self.auto_counter).map_err(|_| Error::InvalidName)?;
        let written = self.write(&name, bytes)?;
        if let Some(out) = out_name {
            *out = name;
        }
        Ok(written)
    }

    pub fn read(&mut self, name: &str, dst: &mut [u8]) -> Result<usize, Error> {
        validate_name(name)?;
        self.ensure_selected_ready()?;
        let read = self.backend_mut(self.selected).read(name, dst)?;
        self.stats.files_read += 1;
        self.stats.bytes_read += read as u64;
        Ok(read)
    }

    pub fn exists(&mut self, name: &str) -> bool {
        if validate_name(name).is_err() {
            return false;
        }
        self.backend_mut(self.resolve(StorageKind::Auto)).exists(name)
    }

    pub fn size(&mut self, name: &str) -> Result<u32, Error> {
        validate_name(name)?;
        self.ensure_selected_ready()?;
        self.backend_mut(self.selected).size(name)
    }

    pub fn delete(&mut self, name: &str) -> Result<(), Error> {
        validate_name(name)?;
        self.ensure_selected_ready()?;
        self.backend_mut(self.selected).delete(name)
    }

    pub fn list(&mut self, out: &mut [FileName]) -> Result<usize, Error> {
        self.ensure_selected_ready()?;
        self.backend_mut(self.selected).list(out)
    }

    pub fn space(&mut self) -> Result<(u64, u64), Error> {
        self.ensure_selected_ready()?;
        self.backend_mut(self.selected).space()
    }

    /// Moves one file between two backends through the transfer
    /// buffer. `Auto` on either side resolves to the current
    /// selection. Sources larger than the buffer are rejected.
    pub fn copy(&mut self, name: &str, from: StorageKind, to: StorageKind) -> Result<(), Error> {
        validate_name(name)?;
        let from = self.resolve(from);
        let to = self.resolve(to);
        if from == to {
            return Err(Error::Unsupported);
        }
        if !self.backend_mut(from).is_ready() || !self.backend_mut(to).is_ready() {
            return Err(Error::NotReady);
        }
        let size = self.backend_mut(from).size(name)?;
        if size as usize > TRANSFER_BUF_LEN {
            return Err(Error::BufferTooSmall);
        }
        let read = match from {
            StorageKind::Sd => self.sd.read(name, &mut self.transfer_buf),
            StorageKind::Nor => self.nor.read(name, &mut self.transfer_buf),
            StorageKind::Hex => self.hex.read(name, &mut self.transfer_buf),
            StorageKind::Auto => unreachable!(),
        }?;
        match to {
            StorageKind::Sd => self.sd.write(name, &self.transfer_buf[..read]),
            StorageKind::Nor => self.nor.write(name, &self.transfer_buf[..read]),
            StorageKind::Hex => self.hex.write(name, &self.transfer_buf[..read]),
            StorageKind::Auto => unreachable!(),
        }?;
        self.stats.files_read += 1;
        self.stats.bytes_read += read as u64;
        self.stats.files_written += 1;
        self.stats.bytes_written += read as u64;
        Ok(())
    }

    /// Round-trips a canned 32-byte pattern through the selected
    /// backend and deletes it again. True only on byte-for-byte
    /// equality.
    pub fn test_write(&mut self) -> bool {
        let Ok(written) = self.write(TEST_NAME, TEST_PATTERN) else {
            return false;
        };
        let mut back = [0u8; TEST_PATTERN.len()];
        let read = self.read(TEST_NAME, &mut back);
        let _ = self.delete(TEST_NAME);
        written == TEST_PATTERN.len() && read == Ok(TEST_PATTERN.len()) && back == *TEST_PATTERN
    }
}
