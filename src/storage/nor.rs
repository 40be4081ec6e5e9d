//! # NOR backend
//!
//! Adapts [NorFlatFs] to the uniform [StorageBackend] interface and
//! owns the readiness policy for the soldered flash chip: readiness
//! means the filesystem is mounted, and mounting happens lazily from
//! [StorageBackend::update] once the JEDEC probe sees a chip.
//!
//! If the chip answers but the directory sector cannot be read, the
//! backend formats and remounts once (enabled by default, see
//! [NorBackend::with_auto_format]); a bridge in the field is more
//! useful with an empty filesystem than with none.
use embedded_storage::nor_flash::{ErrorType, NorFlash, ReadNorFlash};

use super::{FileName, StorageBackend};
use crate::Error;
use crate::nor::FlashIdent;
use crate::nor::flatfs::NorFlatFs;

pub struct NorBackend<S>
where
    S: ReadNorFlash + NorFlash + FlashIdent + ErrorType<Error = Error>,
{
    fs: NorFlatFs<S>,
    chip_present: bool,
    auto_format: bool,
}

impl<S> NorBackend<S>
where
    S: ReadNorFlash + NorFlash + FlashIdent + ErrorType<Error = Error>,
{
    pub fn new(flash: S) -> Self {
        Self {
            fs: NorFlatFs::new(flash),
            chip_present: false,
            auto_format: true,
        }
    }

    /// Controls whether an unreadable directory is repaired by an
    /// automatic format during [StorageBackend::update].
    pub fn with_auto_format(mut self, enabled: bool) -> Self {
        self.auto_format = enabled;
        self
    }

    /// True if the last probe saw a chip on the bus.
    pub fn chip_present(&self) -> bool {
        self.chip_present
    }

    /// Direct access to the filesystem for maintenance commands
    /// (fsck, defragment) that have no uniform-interface equivalent.
    pub fn fs_mut(&mut self) -> &mut NorFlatFs<S> {
        &mut self.fs
    }

    fn try_mount(&mut self) -> Result<(), Error> {
        let id = self.fs.flash_mut().probe()?;
        self.chip_present = id.is_present();
        if !self.chip_present {
            // An absent chip is a board configuration, not a fault.
            return Ok(());
        }
        match self.fs.mount() {
            Ok(()) => {
                // Persist any demotions the integrity check left in
                // the mirror.
                self.fs.fsck()?;
                Ok(())
            }
            Err(error) if self.auto_format => {
                #[cfg(feature = "defmt")]
                defmt::warn!("nor: mount failed ({}), formatting", error);
                let _ = error;
                self.fs.format()
            }
            Err(error) => Err(error),
        }
    }
}

impl<S> StorageBackend for NorBackend<S>
where
    S: ReadNorFlash + NorFlash + FlashIdent + ErrorType<Error = Error>,
{
    fn is_ready(&mut self) -> bool {
        self.fs.is_mounted()
    }

    fn update(&mut self) -> Result<(), Error> {
        if self.fs.is_mounted() {
            return Ok(());
        }
        self.try_mount()
    }

    fn write(&mut self, name: &str, bytes: &[u8]) -> Result<usize, Error> {
        self.fs.create_write(name, bytes)
    }

    fn read(&mut self, name: &str, dst: &mut [u8]) -> Result<usize, Error> {
        self.fs.read(name, dst)
    }

    fn exists(&mut self, name: &str) -> bool {
        self.fs.exists(name)
    }

    fn size(&mut self, name: &str) -> Result<u32, Error> {
        self.fs.size(name)
    }

    fn delete(&mut self, name: &str) -> Result<(), Error> {
        self.fs.delete(name)
    }

    fn list(&mut self, out: &mut [FileName]) -> Result<usize, Error> {
        if !self.fs.is_mounted() {
            return Err(Error::NotReady);
        }
        Ok(self.fs.list(out))
    }

    fn format(&mut self) -> Result<(), Error> {
        self.fs.format()
    }

    fn space(&mut self) -> Result<(u64, u64), Error> {
        if !self.fs.is_mounted() {
            return Err(Error::NotReady);
        }
        Ok(self.fs.space())
    }
}
