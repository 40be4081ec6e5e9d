//! # Flat filesystem on the NOR chip
//!
//! A deliberately tiny filesystem: one fixed directory in the first
//! erase sector, sector-aligned contiguous extents for file data, no
//! hierarchy, no renames, no partial overwrite. Deleting a file only
//! marks its slot; the space becomes writable again through
//! [NorFlatFs::defragment] or a format.
//!
//! ## On-disk layout
//!
//! Sector 0 holds [DIR_SLOTS] fixed 32-byte slots packed at the start
//! of the sector, the rest left erased. One slot:
//!
//! ```text
//!   offset  0..16   name, unused tail bytes zero
//!   offset 16..20   start sector, little endian
//!   offset 20..24   size in bytes, little endian
//!   offset 24..28   bitwise complement of size, little endian
//!   offset 28       status: 0xFF empty, 0xAA active, 0x55 deleted
//!   offset 29..32   zero padding
//! ```
//!
//! Storing both `size` and `!size` gives a cheap corruption guard:
//! any slot whose pair does not XOR to all-ones is demoted to deleted
//! during [NorFlatFs::mount] and the demotion is persisted by
//! [NorFlatFs::fsck].
use embedded_storage::nor_flash::{ErrorType, NorFlash, ReadNorFlash};
use static_assertions::const_assert;

use super::{PAGE_SIZE, SECTOR_SIZE};
use crate::Error;
use crate::storage::FileName;

/// Fixed length of the on-disk name field.
pub const NAME_LEN: usize = 16;
/// Number of directory slots.
pub const DIR_SLOTS: usize = 32;
/// Serialized size of one directory slot.
pub const ENTRY_LEN: usize = 32;
/// First sector available for file data.
pub const DATA_START_SECTOR: u32 = 1;

const STATUS_EMPTY: u8 = 0xFF;
const STATUS_ACTIVE: u8 = 0xAA;
const STATUS_DELETED: u8 = 0x55;

const_assert!(NAME_LEN + 16 == ENTRY_LEN);
const_assert!(DIR_SLOTS * ENTRY_LEN <= SECTOR_SIZE);

/// Lifecycle state of a directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotStatus {
    Empty,
    Active,
    Deleted,
}

impl SlotStatus {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            STATUS_EMPTY => Some(SlotStatus::Empty),
            STATUS_ACTIVE => Some(SlotStatus::Active),
            STATUS_DELETED => Some(SlotStatus::Deleted),
            _ => None,
        }
    }

    fn raw(self) -> u8 {
        match self {
            SlotStatus::Empty => STATUS_EMPTY,
            SlotStatus::Active => STATUS_ACTIVE,
            SlotStatus::Deleted => STATUS_DELETED,
        }
    }
}

/// RAM mirror of one directory slot.
#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    name: [u8; NAME_LEN],
    start_sector: u32,
    size: u32,
    size_complement: u32,
    status: SlotStatus,
}

impl DirEntry {
    const EMPTY: DirEntry = DirEntry {
        name: [0xFF; NAME_LEN],
        start_sector: 0xFFFF_FFFF,
        size: 0xFFFF_FFFF,
        size_complement: 0xFFFF_FFFF,
        status: SlotStatus::Empty,
    };

    /// Parses one serialized slot. An undefined status byte yields a
    /// deleted entry and reports the demotion through the second tuple
    /// element.
    fn from_bytes(bytes: &[u8; ENTRY_LEN]) -> (DirEntry, bool) {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&bytes[..NAME_LEN]);
        let word = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };
        let raw_status = bytes[NAME_LEN + 12];
        let (status, demoted) = match SlotStatus::from_raw(raw_status) {
            Some(status) => (status, false),
            None => (SlotStatus::Deleted, true),
        };
        (
            DirEntry {
                name,
                start_sector: word(NAME_LEN),
                size: word(NAME_LEN + 4),
                size_complement: word(NAME_LEN + 8),
                status,
            },
            demoted,
        )
    }

    fn to_bytes(self) -> [u8; ENTRY_LEN] {
        // An empty slot is the erased flash state.
        if self.status == SlotStatus::Empty {
            return [0xFF; ENTRY_LEN];
        }
        let mut bytes = [0u8; ENTRY_LEN];
        bytes[..NAME_LEN].copy_from_slice(&self.name);
        bytes[NAME_LEN..NAME_LEN + 4].copy_from_slice(&self.start_sector.to_le_bytes());
        bytes[NAME_LEN + 4..NAME_LEN + 8].copy_from_slice(&self.size.to_le_bytes());
        bytes[NAME_LEN + 8..NAME_LEN + 12].copy_from_slice(&self.size_complement.to_le_bytes());
        bytes[NAME_LEN + 12] = self.status.raw();
        bytes
    }

    fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|byte| *byte == 0x00 || *byte == 0xFF)
            .unwrap_or(NAME_LEN);
        &self.name[..len]
    }

    fn name_matches(&self, name: &str) -> bool {
        self.name_bytes().eq_ignore_ascii_case(name.as_bytes())
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn start_sector(&self) -> u32 {
        self.start_sector
    }

    pub fn status(&self) -> SlotStatus {
        self.status
    }
}

/// Sectors needed to store `size` bytes.
fn sectors_for(size: u32) -> u32 {
    size.div_ceil(SECTOR_SIZE as u32)
}

//==================================================================================================
// Filesystem
//==================================================================================================

/// Flat filesystem over any [NorFlash] with 4 KiB erase sectors.
///
/// The directory mirror lives in RAM; every mutating operation
/// persists the whole directory sector before it reports success.
pub struct NorFlatFs<S>
where
    S: ReadNorFlash + NorFlash + ErrorType<Error = Error>,
{
    flash: S,
    dir: [DirEntry; DIR_SLOTS],
    total_sectors: u32,
    next_free_sector: u32,
    active_count: u8,
    deleted_count: u8,
    mounted: bool,
    /// Mirror holds demotions not yet written back.
    dirty: bool,
    page_buf: [u8; PAGE_SIZE],
}

impl<S> NorFlatFs<S>
where
    S: ReadNorFlash + NorFlash + ErrorType<Error = Error>,
{
    pub fn new(flash: S) -> Self {
        let total_sectors = (flash.capacity() / SECTOR_SIZE) as u32;
        Self {
            flash,
            dir: [DirEntry::EMPTY; DIR_SLOTS],
            total_sectors,
            next_free_sector: DATA_START_SECTOR,
            active_count: 0,
            deleted_count: 0,
            mounted: false,
            dirty: false,
            page_buf: [0; PAGE_SIZE],
        }
    }

    /// Releases the underlying flash.
    pub fn release(self) -> S {
        self.flash
    }

    /// Access to the underlying flash, e.g. for identification probes.
    pub fn flash_mut(&mut self) -> &mut S {
        &mut self.flash
    }

    /// Reads the directory into RAM and checks every active slot.
    ///
    /// Slots failing the complement, name or bounds checks are demoted
    /// to deleted in the mirror only; [Self::fsck] persists pending
    /// demotions. Fails if the directory sector cannot be read.
    pub fn mount(&mut self) -> Result<(), Error> {
        self.mounted = false;
        self.dirty = false;
        let mut entry_buf = [0u8; ENTRY_LEN];
        for slot in 0..DIR_SLOTS {
            self.flash
                .read((slot * ENTRY_LEN) as u32, &mut entry_buf)?;
            let (mut entry, demoted) = DirEntry::from_bytes(&entry_buf);
            if demoted {
                self.dirty = true;
            }
            if entry.status == SlotStatus::Active && !self.entry_is_valid(&entry) {
                entry.status = SlotStatus::Deleted;
                self.dirty = true;
            }
            self.dir[slot] = entry;
        }
        self.recount();
        self.mounted = true;
        Ok(())
    }

    /// Erases the directory sector, leaving every slot empty.
    ///
    /// Data sectors are not touched; they are erased lazily before each
    /// write.
    pub fn format(&mut self) -> Result<(), Error> {
        self.flash.erase(0, SECTOR_SIZE as u32)?;
        self.dir = [DirEntry::EMPTY; DIR_SLOTS];
        self.recount();
        self.dirty = false;
        self.mounted = true;
        Ok(())
    }

    /// Creates a file and writes its complete contents.
    ///
    /// An existing file of the same name (compared case-insensitively)
    /// is replaced. Allocation is taken from the contiguous tail; if
    /// the tail is too short the filesystem defragments once and
    /// retries before reporting `NoSpace`.
    pub fn create_write(&mut self, name: &str, bytes: &[u8]) -> Result<usize, Error> {
        self.ensure_mounted()?;
        if name.is_empty() || name.len() > NAME_LEN {
            return Err(Error::InvalidName);
        }
        let size = bytes.len() as u32;
        let needed = sectors_for(size);

        // An overwrite reuses the file's own slot; the superseded
        // extent is abandoned for defragmentation to reclaim.
        let existing = self.find_active(name);
        let slot = existing
            .or_else(|| self.find_free_slot())
            .ok_or(Error::NoSpace)?;

        if self.next_free_sector + needed > self.total_sectors {
            // Reclaim deleted extents, then re-check the tail.
            if let Some(slot) = existing {
                self.mark_deleted(slot);
            }
            self.defragment()?;
            if self.next_free_sector + needed > self.total_sectors {
                self.persist_directory()?;
                return Err(Error::NoSpace);
            }
        }

        let start_sector = self.next_free_sector;
        self.write_extent(start_sector, bytes)?;

        let entry = &mut self.dir[slot];
        entry.name = [0u8; NAME_LEN];
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry.start_sector = start_sector;
        entry.size = size;
        entry.size_complement = !size;
        entry.status = SlotStatus::Active;
        self.recount();
        self.persist_directory()?;
        Ok(bytes.len())
    }

    /// Reads up to `dst.len()` bytes of the named file.
    pub fn read(&mut self, name: &str, dst: &mut [u8]) -> Result<usize, Error> {
        self.ensure_mounted()?;
        let slot = self.find_active(name).ok_or(Error::NotFound)?;
        let entry = self.dir[slot];
        let len = (entry.size as usize).min(dst.len());
        self.flash
            .read(entry.start_sector * SECTOR_SIZE as u32, &mut dst[..len])?;
        Ok(len)
    }

    /// Marks the named file deleted and persists the directory. The
    /// data sectors stay untouched until defragmentation or format.
    pub fn delete(&mut self, name: &str) -> Result<(), Error> {
        self.ensure_mounted()?;
        let slot = self.find_active(name).ok_or(Error::NotFound)?;
        self.mark_deleted(slot);
        self.persist_directory()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.mounted && self.find_active(name).is_some()
    }

    pub fn size(&self, name: &str) -> Result<u32, Error> {
        if !self.mounted {
            return Err(Error::NotReady);
        }
        let slot = self.find_active(name).ok_or(Error::NotFound)?;
        Ok(self.dir[slot].size)
    }

    /// Fills `out` with the names of active files; returns the count.
    pub fn list(&self, out: &mut [FileName]) -> usize {
        if !self.mounted {
            return 0;
        }
        let mut filled = 0;
        for entry in self.dir.iter() {
            if filled == out.len() {
                break;
            }
            if entry.status != SlotStatus::Active {
                continue;
            }
            let mut name = FileName::new();
            if let Ok(text) = core::str::from_utf8(entry.name_bytes())
                && name.push_str(text).is_ok()
            {
                out[filled] = name;
                filled += 1;
            }
        }
        filled
    }

    /// Re-runs the mount-time integrity check over the RAM mirror and
    /// persists any demotion, including ones still pending from
    /// [Self::mount]. Returns true if the directory changed.
    pub fn fsck(&mut self) -> Result<bool, Error> {
        self.ensure_mounted()?;
        for slot in 0..DIR_SLOTS {
            if self.dir[slot].status == SlotStatus::Active && !self.entry_is_valid(&self.dir[slot])
            {
                self.dir[slot].status = SlotStatus::Deleted;
                self.dirty = true;
            }
        }
        if !self.dirty {
            return Ok(false);
        }
        self.recount();
        self.persist_directory()?;
        Ok(true)
    }

    /// Moves every active extent toward low sectors, reclaiming the
    /// space of deleted files. Returns true if anything moved.
    ///
    /// Extents are processed in ascending start-sector order, not
    /// directory order: slot reuse lets a low slot hold a high extent,
    /// and compacting such a slot first would overwrite a later
    /// extent's sectors before they are copied. Sorted by start, every
    /// target lies at or below the extent's own start, so a copy can
    /// only overlap source sectors of the same extent that the forward
    /// sector-by-sector pass has already moved.
    pub fn defragment(&mut self) -> Result<bool, Error> {
        self.ensure_mounted()?;
        let mut order = [0usize; DIR_SLOTS];
        let mut active = 0;
        for slot in 0..DIR_SLOTS {
            if self.dir[slot].status == SlotStatus::Active {
                order[active] = slot;
                active += 1;
            }
        }
        order[..active].sort_unstable_by_key(|slot| self.dir[*slot].start_sector);

        let mut target = DATA_START_SECTOR;
        let mut moved = false;
        for &slot in order[..active].iter() {
            let needed = sectors_for(self.dir[slot].size);
            let start = self.dir[slot].start_sector;
            if start != target {
                for index in 0..needed {
                    self.copy_sector(start + index, target + index)?;
                }
                self.dir[slot].start_sector = target;
                moved = true;
            }
            target += needed;
        }
        self.next_free_sector = target;
        if moved {
            self.persist_directory()?;
        }
        Ok(moved)
    }

    /// Free tail bytes and total data capacity.
    pub fn space(&self) -> (u64, u64) {
        let free = self.total_sectors.saturating_sub(self.next_free_sector) as u64;
        let total = self.total_sectors.saturating_sub(DATA_START_SECTOR) as u64;
        (free * SECTOR_SIZE as u64, total * SECTOR_SIZE as u64)
    }

    #[inline]
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    #[inline]
    pub fn active_count(&self) -> usize {
        self.active_count as usize
    }

    #[inline]
    pub fn deleted_count(&self) -> usize {
        self.deleted_count as usize
    }

    #[inline]
    pub fn next_free_sector(&self) -> u32 {
        self.next_free_sector
    }

    /// Mirror access for diagnostics.
    pub fn entries(&self) -> &[DirEntry; DIR_SLOTS] {
        &self.dir
    }

    fn ensure_mounted(&self) -> Result<(), Error> {
        if self.mounted { Ok(()) } else { Err(Error::NotReady) }
    }

    fn entry_is_valid(&self, entry: &DirEntry) -> bool {
        entry.size ^ entry.size_complement == 0xFFFF_FFFF
            && !entry.name_bytes().is_empty()
            && entry.start_sector >= DATA_START_SECTOR
            && entry.start_sector + sectors_for(entry.size) <= self.total_sectors
    }

    fn find_active(&self, name: &str) -> Option<usize> {
        self.dir
            .iter()
            .position(|entry| entry.status == SlotStatus::Active && entry.name_matches(name))
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.dir
            .iter()
            .position(|entry| entry.status != SlotStatus::Active)
    }

    fn mark_deleted(&mut self, slot: usize) {
        self.dir[slot].status = SlotStatus::Deleted;
        self.recount();
    }

    /// Recomputes the counters and the tail pointer from the mirror.
    fn recount(&mut self) {
        let mut active = 0u8;
        let mut deleted = 0u8;
        let mut next_free = DATA_START_SECTOR;
        for entry in self.dir.iter() {
            match entry.status {
                SlotStatus::Active => {
                    active += 1;
                    next_free = next_free.max(entry.start_sector + sectors_for(entry.size));
                }
                SlotStatus::Deleted => deleted += 1,
                SlotStatus::Empty => {}
            }
        }
        self.active_count = active;
        self.deleted_count = deleted;
        self.next_free_sector = next_free;
    }

    /// Erases each sector of the extent just before programming it.
    fn write_extent(&mut self, start_sector: u32, bytes: &[u8]) -> Result<(), Error> {
        for (index, chunk) in bytes.chunks(SECTOR_SIZE).enumerate() {
            let addr = (start_sector + index as u32) * SECTOR_SIZE as u32;
            self.flash.erase(addr, addr + SECTOR_SIZE as u32)?;
            self.flash.write(addr, chunk)?;
        }
        Ok(())
    }

    fn copy_sector(&mut self, from: u32, to: u32) -> Result<(), Error> {
        let from_addr = from * SECTOR_SIZE as u32;
        let to_addr = to * SECTOR_SIZE as u32;
        self.flash.erase(to_addr, to_addr + SECTOR_SIZE as u32)?;
        for page in 0..(SECTOR_SIZE / PAGE_SIZE) as u32 {
            let offset = page * PAGE_SIZE as u32;
            self.flash.read(from_addr + offset, &mut self.page_buf)?;
            self.flash.write(to_addr + offset, &self.page_buf)?;
        }
        Ok(())
    }

    /// Writes the whole mirror back to sector 0.
    fn persist_directory(&mut self) -> Result<(), Error> {
        self.flash.erase(0, SECTOR_SIZE as u32)?;
        let entries_per_page = PAGE_SIZE / ENTRY_LEN;
        for page in 0..DIR_SLOTS.div_ceil(entries_per_page) {
            self.page_buf.fill(0xFF);
            for index in 0..entries_per_page {
                let slot = page * entries_per_page + index;
                if slot >= DIR_SLOTS {
                    break;
                }
                self.page_buf[index * ENTRY_LEN..(index + 1) * ENTRY_LEN]
                    .copy_from_slice(&self.dir[slot].to_bytes());
            }
            self.flash
                .write((page * PAGE_SIZE) as u32, &self.page_buf)?;
        }
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nor::testutil::{MemFlash, pattern};
    use std::vec;
    use std::vec::Vec;

    fn formatted(sectors: usize) -> NorFlatFs<MemFlash> {
        let mut fs = NorFlatFs::new(MemFlash::new(sectors));
        fs.format().unwrap();
        fs
    }

    fn name_slots<const N: usize>() -> [FileName; N] {
        core::array::from_fn(|_| FileName::new())
    }

    #[test]
    fn format_yields_empty_directory() {
        let fs = formatted(16);
        assert!(fs.is_mounted());
        assert_eq!(fs.active_count(), 0);
        assert_eq!(fs.deleted_count(), 0);
        assert_eq!(fs.next_free_sector(), DATA_START_SECTOR);
        let mut names = name_slots::<4>();
        assert_eq!(fs.list(&mut names), 0);
    }

    #[test]
    fn operations_require_mount() {
        let mut fs = NorFlatFs::new(MemFlash::new(16));
        assert_eq!(fs.create_write("a", &[1]), Err(Error::NotReady));
        assert_eq!(fs.read("a", &mut [0u8; 4]), Err(Error::NotReady));
        assert_eq!(fs.delete("a"), Err(Error::NotReady));
        assert!(!fs.exists("a"));
    }

    #[test]
    fn write_read_roundtrip_multi_sector() {
        let mut fs = formatted(16);
        let data = pattern(SECTOR_SIZE * 2 + 700, 3);
        assert_eq!(fs.create_write("scope.bmp", &data), Ok(data.len()));
        assert!(fs.exists("scope.bmp"));
        assert_eq!(fs.size("scope.bmp"), Ok(data.len() as u32));
        assert_eq!(fs.active_count(), 1);
        assert_eq!(fs.next_free_sector(), DATA_START_SECTOR + 3);

        let mut back = vec![0u8; data.len() + 10];
        assert_eq!(fs.read("scope.bmp", &mut back), Ok(data.len()));
        assert_eq!(&back[..data.len()], &data[..]);
    }

    #[test]
    fn read_truncates_to_destination() {
        let mut fs = formatted(16);
        fs.create_write("f", &[1, 2, 3, 4, 5]).unwrap();
        let mut dst = [0u8; 3];
        assert_eq!(fs.read("f", &mut dst), Ok(3));
        assert_eq!(dst, [1, 2, 3]);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut fs = formatted(16);
        fs.create_write("Shot.BMP", &[9]).unwrap();
        assert!(fs.exists("shot.bmp"));
        assert_eq!(fs.size("SHOT.bmp"), Ok(1));
        let mut dst = [0u8; 1];
        assert_eq!(fs.read("sHoT.bMp", &mut dst), Ok(1));
    }

    #[test]
    fn on_disk_entry_layout_is_stable() {
        let mut fs = formatted(16);
        fs.create_write("hi.bin", &[0u8; 5000]).unwrap();
        let flash = fs.release();
        let raw = flash.raw(0, ENTRY_LEN);
        assert_eq!(&raw[..6], b"hi.bin");
        assert!(raw[6..NAME_LEN].iter().all(|byte| *byte == 0));
        assert_eq!(&raw[16..20], &1u32.to_le_bytes());
        assert_eq!(&raw[20..24], &5000u32.to_le_bytes());
        assert_eq!(&raw[24..28], &(!5000u32).to_le_bytes());
        assert_eq!(raw[28], STATUS_ACTIVE);
        assert_eq!(&raw[29..32], &[0, 0, 0]);
    }

    #[test]
    fn active_entries_satisfy_invariants() {
        let mut fs = formatted(64);
        fs.create_write("a", &pattern(100, 1)).unwrap();
        fs.create_write("b", &pattern(9000, 2)).unwrap();
        fs.create_write("c", &[]).unwrap();
        let mut extents: Vec<(u32, u32)> = Vec::new();
        for entry in fs.entries() {
            if entry.status() != SlotStatus::Active {
                continue;
            }
            assert_eq!(entry.size ^ entry.size_complement, 0xFFFF_FFFF);
            assert!(entry.start_sector() >= DATA_START_SECTOR);
            let end = entry.start_sector() + sectors_for(entry.size());
            assert!(end <= fs.total_sectors);
            extents.push((entry.start_sector(), end));
        }
        // Pairwise disjoint extents.
        for (index, a) in extents.iter().enumerate() {
            for b in extents.iter().skip(index + 1) {
                assert!(a.1 <= b.0 || b.1 <= a.0);
            }
        }
    }

    #[test]
    fn overwrite_replaces_previous_version() {
        let mut fs = formatted(16);
        fs.create_write("plot", &[1, 1, 1]).unwrap();
        fs.create_write("PLOT", &[2, 2]).unwrap();
        assert_eq!(fs.active_count(), 1);
        let mut dst = [0u8; 4];
        assert_eq!(fs.read("plot", &mut dst), Ok(2));
        assert_eq!(&dst[..2], &[2, 2]);
        // The superseded extent is reclaimable, not reclaimed.
        assert_eq!(fs.deleted_count(), 0);
        assert_eq!(fs.next_free_sector(), DATA_START_SECTOR + 2);
    }

    #[test]
    fn delete_marks_without_erasing() {
        let mut fs = formatted(16);
        fs.create_write("x", &[7, 7, 7]).unwrap();
        assert_eq!(fs.delete("x"), Ok(()));
        assert_eq!(fs.active_count(), 0);
        assert_eq!(fs.deleted_count(), 1);
        assert_eq!(fs.delete("x"), Err(Error::NotFound));
        assert_eq!(fs.read("x", &mut [0u8; 4]), Err(Error::NotFound));
        // Data bytes are still on the medium.
        let flash = fs.release();
        assert_eq!(flash.raw(SECTOR_SIZE, 3), &[7, 7, 7]);
    }

    #[test]
    fn zero_length_file_roundtrip() {
        let mut fs = formatted(16);
        assert_eq!(fs.create_write("empty", &[]), Ok(0));
        assert_eq!(fs.size("empty"), Ok(0));
        assert_eq!(fs.read("empty", &mut [0u8; 8]), Ok(0));
        assert_eq!(fs.next_free_sector(), DATA_START_SECTOR);
    }

    #[test]
    fn directory_survives_remount() {
        let mut fs = formatted(16);
        let data = pattern(6000, 5);
        fs.create_write("keep.dat", &data).unwrap();
        fs.create_write("gone.dat", &[1]).unwrap();
        fs.delete("gone.dat").unwrap();

        let mut fs = NorFlatFs::new(fs.release());
        fs.mount().unwrap();
        assert_eq!(fs.active_count(), 1);
        assert_eq!(fs.deleted_count(), 1);
        assert_eq!(fs.next_free_sector(), DATA_START_SECTOR + 2);
        let mut back = vec![0u8; data.len()];
        assert_eq!(fs.read("keep.dat", &mut back), Ok(data.len()));
        assert_eq!(back, data);
    }

    #[test]
    fn corrupt_complement_is_demoted_and_fsck_persists() {
        let mut fs = formatted(16);
        fs.create_write("bad.dat", &[1, 2, 3]).unwrap();
        let mut flash = fs.release();
        // Flip one bit of the stored complement.
        let addr = NAME_LEN + 8;
        let byte = flash.raw(addr, 1)[0];
        flash.corrupt(addr, byte ^ 0x01);

        let mut fs = NorFlatFs::new(flash);
        fs.mount().unwrap();
        assert_eq!(fs.active_count(), 0);
        assert_eq!(fs.deleted_count(), 1);
        let mut names = name_slots::<4>();
        assert_eq!(fs.list(&mut names), 0);

        // The demotion is pending in the mirror; fsck writes it back.
        assert_eq!(fs.fsck(), Ok(true));
        assert_eq!(fs.fsck(), Ok(false));
        let flash = fs.release();
        assert_eq!(flash.raw(NAME_LEN + 12, 1)[0], STATUS_DELETED);
    }

    #[test]
    fn undefined_status_byte_is_demoted() {
        let mut fs = formatted(16);
        fs.create_write("odd", &[5]).unwrap();
        let mut flash = fs.release();
        flash.corrupt(NAME_LEN + 12, 0x3C);
        let mut fs = NorFlatFs::new(flash);
        fs.mount().unwrap();
        assert_eq!(fs.active_count(), 0);
        assert_eq!(fs.deleted_count(), 1);
        assert_eq!(fs.fsck(), Ok(true));
    }

    #[test]
    fn out_of_bounds_extent_is_demoted() {
        let mut fs = formatted(16);
        fs.create_write("far", &[1]).unwrap();
        let mut flash = fs.release();
        // Rewrite the start sector to point past the end of the chip.
        let start = 100u32.to_le_bytes();
        for (index, byte) in start.iter().enumerate() {
            flash.corrupt(NAME_LEN + index, *byte);
        }
        let mut fs = NorFlatFs::new(flash);
        fs.mount().unwrap();
        assert_eq!(fs.active_count(), 0);
    }

    #[test]
    fn defragment_compacts_and_write_retries() {
        // Directory plus three data sectors.
        let mut fs = formatted(4);
        fs.create_write("a", &pattern(SECTOR_SIZE * 2, 1)).unwrap();
        let keep = pattern(100, 2);
        fs.create_write("b", &keep).unwrap();
        assert_eq!(fs.next_free_sector(), 4);
        fs.delete("a").unwrap();

        // Tail exhausted; create_write defragments and succeeds.
        let big = pattern(SECTOR_SIZE + 1, 3);
        assert_eq!(fs.create_write("c", &big), Ok(big.len()));
        assert_eq!(fs.next_free_sector(), 4);

        let mut back = vec![0u8; keep.len()];
        assert_eq!(fs.read("b", &mut back), Ok(keep.len()));
        assert_eq!(back, keep);
        let mut back = vec![0u8; big.len()];
        assert_eq!(fs.read("c", &mut back), Ok(big.len()));
        assert_eq!(back, big);

        // Completely full now.
        assert_eq!(fs.create_write("d", &[1]), Err(Error::NoSpace));
    }

    #[test]
    fn defragment_moves_in_start_order_despite_slot_reuse() {
        // Slot reuse puts a high extent in a low slot: "c" lands in
        // deleted "a"'s slot 0 but above "b" (slot 1). Compaction must
        // move "b" first or its sector is overwritten as "c" comes
        // down.
        let mut fs = formatted(8);
        fs.create_write("a", &pattern(100, 1)).unwrap();
        let keep_b = pattern(200, 2);
        fs.create_write("b", &keep_b).unwrap();
        fs.delete("a").unwrap();
        let keep_c = pattern(SECTOR_SIZE + 50, 3);
        fs.create_write("c", &keep_c).unwrap();
        assert_eq!(fs.next_free_sector(), 5);

        // Four more sectors do not fit the tail; the write compacts.
        let keep_d = pattern(SECTOR_SIZE * 3 + 10, 4);
        assert_eq!(fs.create_write("d", &keep_d), Ok(keep_d.len()));
        assert_eq!(fs.next_free_sector(), 8);

        let mut back = vec![0u8; keep_b.len()];
        assert_eq!(fs.read("b", &mut back), Ok(keep_b.len()));
        assert_eq!(back, keep_b);
        let mut back = vec![0u8; keep_c.len()];
        assert_eq!(fs.read("c", &mut back), Ok(keep_c.len()));
        assert_eq!(back, keep_c);
        let mut back = vec![0u8; keep_d.len()];
        assert_eq!(fs.read("d", &mut back), Ok(keep_d.len()));
        assert_eq!(back, keep_d);
    }

    #[test]
    fn defragment_is_a_noop_when_compact() {
        let mut fs = formatted(8);
        fs.create_write("a", &pattern(10, 1)).unwrap();
        assert_eq!(fs.defragment(), Ok(false));
    }

    #[test]
    fn directory_full_reports_no_space() {
        let mut fs = formatted(64);
        let mut name = std::string::String::new();
        for index in 0..DIR_SLOTS {
            name.clear();
            core::fmt::Write::write_fmt(&mut name, format_args!("f{index:02}")).unwrap();
            fs.create_write(&name, &[index as u8]).unwrap();
        }
        assert_eq!(fs.create_write("straw", &[1]), Err(Error::NoSpace));
        // Overwriting an existing file still works via its own slot.
        assert_eq!(fs.create_write("f00", &[9, 9]), Ok(2));
    }

    #[test]
    fn failed_data_write_leaves_directory_unchanged() {
        let mut fs = formatted(16);
        fs.create_write("ok", &[1]).unwrap();
        fs.flash.set_fail_writes_after(Some(0));
        assert_eq!(fs.create_write("new", &pattern(100, 4)), Err(Error::IoError));
        fs.flash.set_fail_writes_after(None);
        assert!(fs.exists("ok"));
        assert!(!fs.exists("new"));
        assert_eq!(fs.active_count(), 1);
        // A remount sees the same consistent directory.
        let mut fs = NorFlatFs::new(fs.release());
        fs.mount().unwrap();
        assert!(fs.exists("ok"));
        assert!(!fs.exists("new"));
    }

    #[test]
    fn rejects_invalid_names() {
        let mut fs = formatted(16);
        assert_eq!(fs.create_write("", &[1]), Err(Error::InvalidName));
        assert_eq!(
            fs.create_write("name_longer_than_sixteen", &[1]),
            Err(Error::InvalidName)
        );
    }
}
