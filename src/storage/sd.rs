//! # SD card backend
//!
//! FAT16/FAT32 storage on a removable SD card, built on
//! [embedded_sdmmc]. The FAT driving itself is the library's job;
//! this backend contributes the uniform interface, the media
//! presence policy and the error folding.
//!
//! Readiness folds three conditions: the card-detect switch is
//! asserted (active low), the write-protect switch is released, and
//! the volume opened successfully since the last insertion. Insertion
//! and removal are only noticed between operations, on the
//! [StorageBackend::update] tick.
//!
//! Only the root directory is used; the capture workflow never
//! creates a hierarchy.
use embedded_hal::digital::InputPin;
use embedded_sdmmc::{BlockDevice, Mode, TimeSource, VolumeIdx, VolumeManager};

use super::{FileName, NAME_MAX, StorageBackend};
use crate::Error;

/// Folds an [embedded_sdmmc] error into the crate taxonomy.
fn map_sd_error<E: core::fmt::Debug>(error: embedded_sdmmc::Error<E>) -> Error {
    use embedded_sdmmc::Error as SdError;
    match error {
        SdError::NotFound => Error::NotFound,
        SdError::FilenameError(_) => Error::InvalidName,
        SdError::NotEnoughSpace => Error::NoSpace,
        SdError::ReadOnly => Error::Unsupported,
        SdError::Unsupported => Error::Unsupported,
        SdError::FileAlreadyOpen => Error::Busy,
        SdError::DeviceError(_) => Error::IoError,
        _ => Error::IoError,
    }
}

pub struct SdBackend<D, T, CD, WP>
where
    D: BlockDevice,
    T: TimeSource,
    CD: InputPin,
    WP: InputPin,
{
    volume_mgr: VolumeManager<D, T>,
    card_detect: CD,
    write_protect: WP,
    /// Volume opened successfully since the last insertion.
    volume_ok: bool,
}

impl<D, T, CD, WP> SdBackend<D, T, CD, WP>
where
    D: BlockDevice,
    T: TimeSource,
    CD: InputPin,
    WP: InputPin,
{
    pub fn new(device: D, time_source: T, card_detect: CD, write_protect: WP) -> Self {
        Self {
            volume_mgr: VolumeManager::new(device, time_source),
            card_detect,
            write_protect,
            volume_ok: false,
        }
    }

    /// Card-detect switch, active low.
    pub fn card_present(&mut self) -> bool {
        self.card_detect.is_low().unwrap_or(false)
    }

    /// Write-protect slider; the socket pulls the line high in the
    /// protected position.
    pub fn write_protected(&mut self) -> bool {
        self.write_protect.is_high().unwrap_or(true)
    }
}

impl<D, T, CD, WP> StorageBackend for SdBackend<D, T, CD, WP>
where
    D: BlockDevice,
    T: TimeSource,
    CD: InputPin,
    WP: InputPin,
{
    fn is_ready(&mut self) -> bool {
        self.card_present() && !self.write_protected() && self.volume_ok
    }

    fn update(&mut self) -> Result<(), Error> {
        if !self.card_present() {
            self.volume_ok = false;
            return Ok(());
        }
        if !self.volume_ok {
            // Freshly inserted (or never probed): check the volume
            // actually mounts before reporting ready.
            self.volume_ok = self.volume_mgr.open_volume(VolumeIdx(0)).is_ok();
        }
        Ok(())
    }

    fn write(&mut self, name: &str, bytes: &[u8]) -> Result<usize, Error> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        let mut volume = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(map_sd_error)?;
        let mut root = volume.open_root_dir().map_err(map_sd_error)?;
        let mut file = root
            .open_file_in_dir(name, Mode::ReadWriteCreateOrTruncate)
            .map_err(map_sd_error)?;
        file.write(bytes).map_err(map_sd_error)?;
        file.close().map_err(map_sd_error)?;
        Ok(bytes.len())
    }

    fn read(&mut self, name: &str, dst: &mut [u8]) -> Result<usize, Error> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        let mut volume = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(map_sd_error)?;
        let mut root = volume.open_root_dir().map_err(map_sd_error)?;
        let mut file = root
            .open_file_in_dir(name, Mode::ReadOnly)
            .map_err(map_sd_error)?;
        let mut total = 0;
        while total < dst.len() && !file.is_eof() {
            total += file.read(&mut dst[total..]).map_err(map_sd_error)?;
        }
        Ok(total)
    }

    fn exists(&mut self, name: &str) -> bool {
        if !self.is_ready() {
            return false;
        }
        let Ok(mut volume) = self.volume_mgr.open_volume(VolumeIdx(0)) else {
            return false;
        };
        let Ok(mut root) = volume.open_root_dir() else {
            return false;
        };
        root.find_directory_entry(name).is_ok()
    }

    fn size(&mut self, name: &str) -> Result<u32, Error> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        let mut volume = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(map_sd_error)?;
        let mut root = volume.open_root_dir().map_err(map_sd_error)?;
        let entry = root.find_directory_entry(name).map_err(map_sd_error)?;
        Ok(entry.size)
    }

    fn delete(&mut self, name: &str) -> Result<(), Error> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        let mut volume = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(map_sd_error)?;
        let mut root = volume.open_root_dir().map_err(map_sd_error)?;
        root.delete_file_in_dir(name).map_err(map_sd_error)
    }

    fn list(&mut self, out: &mut [FileName]) -> Result<usize, Error> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        let mut volume = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(map_sd_error)?;
        let mut root = volume.open_root_dir().map_err(map_sd_error)?;
        let mut filled = 0;
        root.iterate_dir(|entry| {
            if filled == out.len() || entry.attributes.is_directory() || entry.attributes.is_volume()
            {
                return;
            }
            let mut name = FileName::new();
            push_component(&mut name, entry.name.base_name());
            let extension = entry.name.extension();
            if !extension.is_empty() {
                let _ = name.push('.');
                push_component(&mut name, extension);
            }
            out[filled] = name;
            filled += 1;
        })
        .map_err(map_sd_error)?;
        Ok(filled)
    }

    /// Formatting cards is a host job; the bridge refuses.
    fn format(&mut self) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn space(&mut self) -> Result<(u64, u64), Error> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        let blocks = self
            .volume_mgr
            .device()
            .num_blocks()
            .map_err(|_| Error::IoError)?;
        // The FAT layer keeps no free-cluster accounting; only the
        // card capacity is known.
        let total = blocks.0 as u64 * 512;
        Ok((0, total))
    }
}

/// Copies an 8.3 name component, dropping the space padding.
fn push_component(name: &mut FileName, bytes: &[u8]) {
    for byte in bytes {
        if *byte != b' ' && name.len() < NAME_MAX {
            let _ = name.push(*byte as char);
        }
    }
}
