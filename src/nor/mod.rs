//! # SPI NOR flash driver
//!
//! Low-level driver for the 16 MiB serial NOR chip (W25Q128 class)
//! behind an [embedded_hal::spi::SpiDevice]. The chip is addressed in
//! 256-byte program pages and erased in 4 KiB sectors; every mutating
//! command is preceded by a Write-Enable and completed by polling the
//! write-in-progress status bit with a one-tick cooperative sleep
//! between polls and an explicit per-operation timeout.
//!
//! The driver exposes a small inherent API ([NorFlashDriver::probe],
//! [NorFlashDriver::read], [NorFlashDriver::write_page],
//! [NorFlashDriver::erase_sector], [NorFlashDriver::erase_chip]) and
//! additionally implements the [embedded_storage] NOR traits so the
//! flat filesystem in [flatfs] can run against any conforming flash,
//! including the in-memory model used by the host tests.
use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{Operation, SpiDevice};
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use fugit::MillisDurationU32;

use crate::Error;

pub mod flatfs;

/// Largest programmable unit.
pub const PAGE_SIZE: usize = 256;
/// Smallest erasable unit.
pub const SECTOR_SIZE: usize = 4096;
/// Total number of erase sectors on the chip.
pub const TOTAL_SECTORS: u32 = 4096;
/// Addressable capacity in bytes.
pub const CAPACITY_BYTES: u32 = TOTAL_SECTORS * SECTOR_SIZE as u32;

/// Cooperative sleep between status polls.
const POLL_TICK_MS: u32 = 1;

/// Budget for a page program to complete.
pub const PAGE_PROGRAM_TIMEOUT: MillisDurationU32 = MillisDurationU32::from_ticks(1000);
/// Budget for a sector erase to complete; the datasheet worst case is
/// around three seconds.
pub const SECTOR_ERASE_TIMEOUT: MillisDurationU32 = MillisDurationU32::from_ticks(5000);
/// Default budget for a full chip erase.
pub const CHIP_ERASE_TIMEOUT: MillisDurationU32 = MillisDurationU32::from_ticks(60_000);

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Opcode {
    PageProgram = 0x02,
    Read = 0x03,
    ReadStatus1 = 0x05,
    WriteEnable = 0x06,
    SectorErase = 0x20,
    ChipErase = 0xC7,
    JedecId = 0x9F,
}

/// Status register 1 of the chip.
#[bitbybit::bitfield(u8)]
#[derive(Debug)]
pub struct StatusRegister {
    /// Erase or program in progress.
    #[bit(0, r)]
    write_in_progress: bool,
    /// Write-enable latch is set.
    #[bit(1, r)]
    write_enable_latch: bool,
}

/// JEDEC manufacturer and device identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JedecId {
    pub manufacturer: u8,
    pub device: u16,
}

impl JedecId {
    pub const fn new(manufacturer: u8, device: u16) -> Self {
        Self {
            manufacturer,
            device,
        }
    }

    /// Identification as the 24-bit value read off the wire.
    pub const fn raw(&self) -> u32 {
        ((self.manufacturer as u32) << 16) | self.device as u32
    }

    /// All-zero and all-one identifications mean a floating bus, not a
    /// chip.
    pub const fn is_present(&self) -> bool {
        self.raw() != 0x000000 && self.raw() != 0xFFFFFF
    }
}

/// Identification probe, implemented by the concrete driver and by the
/// flash models used in tests.
pub trait FlashIdent {
    fn probe(&mut self) -> Result<JedecId, Error>;
}

//==================================================================================================
// Driver
//==================================================================================================

/// Driver for a W25Q128-class chip behind an SPI device with managed
/// chip select.
pub struct NorFlashDriver<Spi: SpiDevice, Delay: DelayNs> {
    spi: Spi,
    delay: Delay,
}

impl<Spi: SpiDevice, Delay: DelayNs> NorFlashDriver<Spi, Delay> {
    pub fn new(spi: Spi, delay: Delay) -> Self {
        Self { spi, delay }
    }

    /// Releases the underlying bus device and delay.
    pub fn release(self) -> (Spi, Delay) {
        (self.spi, self.delay)
    }

    /// Reads the JEDEC identification.
    pub fn probe(&mut self) -> Result<JedecId, Error> {
        let mut id = [0u8; 3];
        self.spi
            .transaction(&mut [
                Operation::Write(&[Opcode::JedecId as u8]),
                Operation::Read(&mut id),
            ])
            .map_err(|_| Error::IoError)?;
        Ok(JedecId::new(id[0], u16::from_be_bytes([id[1], id[2]])))
    }

    /// Reads status register 1.
    pub fn read_status(&mut self) -> Result<StatusRegister, Error> {
        let mut status = [0u8; 1];
        self.spi
            .transaction(&mut [
                Operation::Write(&[Opcode::ReadStatus1 as u8]),
                Operation::Read(&mut status),
            ])
            .map_err(|_| Error::IoError)?;
        Ok(StatusRegister::new_with_raw_value(status[0]))
    }

    /// Reads `buf.len()` bytes starting at `addr`.
    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        check_bounds(addr, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        self.spi
            .transaction(&mut [
                Operation::Write(&command_with_addr(Opcode::Read, addr)),
                Operation::Read(buf),
            ])
            .map_err(|_| Error::IoError)
    }

    /// Programs up to one page. `data` must fit the page containing
    /// `addr`; the chip wraps within the page otherwise.
    ///
    /// The target bytes must be in the erased state; programming only
    /// clears bits.
    pub fn write_page(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() > PAGE_SIZE || addr as usize % PAGE_SIZE + data.len() > PAGE_SIZE {
            return Err(Error::Unsupported);
        }
        check_bounds(addr, data.len())?;
        self.write_enable()?;
        self.spi
            .transaction(&mut [
                Operation::Write(&command_with_addr(Opcode::PageProgram, addr)),
                Operation::Write(data),
            ])
            .map_err(|_| Error::IoError)?;
        self.wait_ready(PAGE_PROGRAM_TIMEOUT)
    }

    /// Erases the 4 KiB sector with the given index.
    pub fn erase_sector(&mut self, sector: u32) -> Result<(), Error> {
        if sector >= TOTAL_SECTORS {
            return Err(Error::Unsupported);
        }
        self.write_enable()?;
        let addr = sector * SECTOR_SIZE as u32;
        self.spi
            .transaction(&mut [Operation::Write(&command_with_addr(
                Opcode::SectorErase,
                addr,
            ))])
            .map_err(|_| Error::IoError)?;
        self.wait_ready(SECTOR_ERASE_TIMEOUT)
    }

    /// Erases the whole chip. Slow; only the full-format path uses it.
    pub fn erase_chip(&mut self, timeout: MillisDurationU32) -> Result<(), Error> {
        self.write_enable()?;
        self.spi
            .transaction(&mut [Operation::Write(&[Opcode::ChipErase as u8])])
            .map_err(|_| Error::IoError)?;
        self.wait_ready(timeout)
    }

    fn write_enable(&mut self) -> Result<(), Error> {
        self.spi
            .transaction(&mut [Operation::Write(&[Opcode::WriteEnable as u8])])
            .map_err(|_| Error::IoError)
    }

    /// Polls write-in-progress with a one-tick sleep between polls.
    ///
    /// On timeout the chip is left as-is; the next call may safely
    /// retry without issuing another erase or program.
    fn wait_ready(&mut self, timeout: MillisDurationU32) -> Result<(), Error> {
        let mut waited_ms = 0u32;
        loop {
            if !self.read_status()?.write_in_progress() {
                return Ok(());
            }
            if waited_ms >= timeout.ticks() {
                return Err(Error::Timeout);
            }
            self.delay.delay_ms(POLL_TICK_MS);
            waited_ms += POLL_TICK_MS;
        }
    }
}

fn command_with_addr(opcode: Opcode, addr: u32) -> [u8; 4] {
    [
        opcode as u8,
        (addr >> 16) as u8,
        (addr >> 8) as u8,
        addr as u8,
    ]
}

fn check_bounds(addr: u32, len: usize) -> Result<(), Error> {
    if addr as u64 + len as u64 > CAPACITY_BYTES as u64 {
        return Err(Error::Unsupported);
    }
    Ok(())
}

impl<Spi: SpiDevice, Delay: DelayNs> FlashIdent for NorFlashDriver<Spi, Delay> {
    fn probe(&mut self) -> Result<JedecId, Error> {
        NorFlashDriver::probe(self)
    }
}

//==================================================================================================
// embedded-storage integration
//==================================================================================================

impl NorFlashError for Error {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Error::Unsupported => NorFlashErrorKind::OutOfBounds,
            _ => NorFlashErrorKind::Other,
        }
    }
}

impl<Spi: SpiDevice, Delay: DelayNs> ErrorType for NorFlashDriver<Spi, Delay> {
    type Error = Error;
}

impl<Spi: SpiDevice, Delay: DelayNs> ReadNorFlash for NorFlashDriver<Spi, Delay> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        NorFlashDriver::read(self, offset, bytes)
    }

    fn capacity(&self) -> usize {
        CAPACITY_BYTES as usize
    }
}

impl<Spi: SpiDevice, Delay: DelayNs> NorFlash for NorFlashDriver<Spi, Delay> {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from > to
            || from as usize % SECTOR_SIZE != 0
            || to as usize % SECTOR_SIZE != 0
            || to > CAPACITY_BYTES
        {
            return Err(Error::Unsupported);
        }
        for sector in from / SECTOR_SIZE as u32..to / SECTOR_SIZE as u32 {
            self.erase_sector(sector)?;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_bounds(offset, bytes.len())?;
        let mut addr = offset;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let room = PAGE_SIZE - addr as usize % PAGE_SIZE;
            let (chunk, rest) = remaining.split_at(room.min(remaining.len()));
            self.write_page(addr, chunk)?;
            addr += chunk.len() as u32;
            remaining = rest;
        }
        Ok(())
    }
}
