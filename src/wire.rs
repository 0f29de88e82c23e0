//! Command framing over SPI: `READ_JEDEC_ID`, `READ_DATA`, `READ_STATUS`,
//! `WRITE_ENABLE`, `PAGE_PROGRAM`, `SECTOR_ERASE`.
//!
//! Chip-select is driven directly by this layer around every command,
//! mirroring the source's `flash_enable()`/`flash_disable()` framing rather
//! than delegating CS management to the bus.

use core::fmt::Debug;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::Error;

#[repr(u8)]
enum Command {
    ReadJedecId = 0x9F,
    ReadData = 0x03,
    ReadStatus = 0x05,
    WriteEnable = 0x06,
    PageProgram = 0x02,
    SectorErase = 0x20,
}

/// Status register 1 bit meanings.
const STATUS_WIP: u8 = 0x01;
const STATUS_WEL: u8 = 0x02;

fn address_bytes(addr: u32) -> [u8; 3] {
    let b = addr.to_be_bytes();
    [b[1], b[2], b[3]]
}

/// The wire layer: SPI bus plus chip-select, with no knowledge of geometry or
/// caching.
pub struct FlashBus<SPI, CS> {
    spi: SPI,
    cs: CS,
    /// If set, bounds how many times `wait_ready` polls the status register
    /// before giving up with [`Error::Timeout`]. `None` (the default) polls
    /// unboundedly, matching the source.
    max_ready_polls: Option<u32>,
}

impl<SPI, S, CS, P> FlashBus<SPI, CS>
where
    SPI: SpiBus<u8, Error = S>,
    CS: OutputPin<Error = P>,
    S: Debug,
    P: Debug,
{
    pub fn new(spi: SPI, cs: CS) -> Result<Self, Error<S, P>> {
        let mut bus = Self {
            spi,
            cs,
            max_ready_polls: None,
        };
        bus.cs.set_high().map_err(Error::Pin)?;
        Ok(bus)
    }

    /// Bound the number of `wait_ready` polls; `None` reverts to unbounded.
    pub fn with_max_ready_polls(mut self, max: Option<u32>) -> Self {
        self.max_ready_polls = max;
        self
    }

    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    fn assert_cs(&mut self) -> Result<(), Error<S, P>> {
        self.cs.set_low().map_err(Error::Pin)
    }

    fn deassert_cs(&mut self) -> Result<(), Error<S, P>> {
        self.cs.set_high().map_err(Error::Pin)
    }

    fn transaction<F>(&mut self, body: F) -> Result<(), Error<S, P>>
    where
        F: FnOnce(&mut SPI) -> Result<(), S>,
    {
        self.assert_cs()?;
        let result = body(&mut self.spi).map_err(Error::Spi);
        self.deassert_cs()?;
        result
    }

    /// Asserts CS, transmits a JEDEC ID request, reads 3 response bytes,
    /// deasserts CS.
    pub fn identify(&mut self) -> Result<crate::geometry::JedecId, Error<S, P>> {
        let mut id = [0u8; 3];
        self.transaction(|spi| {
            spi.write(&[Command::ReadJedecId as u8])?;
            spi.read(&mut id)
        })?;
        Ok(crate::geometry::JedecId::from_bytes(id))
    }

    fn read_status(&mut self) -> Result<u8, Error<S, P>> {
        let mut status = [0u8];
        self.transaction(|spi| {
            spi.write(&[Command::ReadStatus as u8])?;
            spi.read(&mut status)
        })?;
        Ok(status[0])
    }

    /// Polls the status register until WIP and WEL are both clear.
    pub fn wait_ready(&mut self) -> Result<(), Error<S, P>> {
        let mut polls = 0u32;
        loop {
            let status = self.read_status()?;
            if status & (STATUS_WIP | STATUS_WEL) == 0 {
                return Ok(());
            }
            if let Some(max) = self.max_ready_polls {
                polls += 1;
                if polls >= max {
                    return Err(Error::Timeout);
                }
            }
        }
    }

    /// One-byte `WRITE_ENABLE` command, framed by CS.
    pub fn write_enable(&mut self) -> Result<(), Error<S, P>> {
        self.transaction(|spi| spi.write(&[Command::WriteEnable as u8]))?;
        if self.read_status()? & STATUS_WEL == 0 {
            return Err(Error::WriteEnableFail);
        }
        Ok(())
    }

    /// Issues `READ_DATA` with a 24-bit address, then streams `buf.len()`
    /// bytes. The chip auto-increments its internal address; there is no
    /// length cap.
    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error<S, P>> {
        let addr = address_bytes(addr);
        self.transaction(|spi| {
            spi.write(&[Command::ReadData as u8, addr[0], addr[1], addr[2]])?;
            spi.read(buf)
        })
    }

    /// Programs at most `page_size` bytes at `addr`. Requires `wait_ready`
    /// then `write_enable` first; callers must align `addr` to the page size
    /// and must not cross a page boundary.
    pub fn program_page(&mut self, addr: u32, buf: &[u8]) -> Result<(), Error<S, P>> {
        self.wait_ready()?;
        self.write_enable()?;
        let addr = address_bytes(addr);
        self.transaction(|spi| {
            spi.write(&[Command::PageProgram as u8, addr[0], addr[1], addr[2]])?;
            spi.write(buf)
        })
    }

    /// Erases the sector starting at `addr` (aligned to `sector_size`).
    /// Requires `wait_ready` then `write_enable` first.
    pub fn erase_sector(&mut self, addr: u32) -> Result<(), Error<S, P>> {
        self.wait_ready()?;
        self.write_enable()?;
        let addr = address_bytes(addr);
        self.transaction(|spi| {
            spi.write(&[Command::SectorErase as u8, addr[0], addr[1], addr[2]])
        })
    }
}
