//! The 512-byte block interface: MBR synthesis, block-index-to-flash-address
//! translation, the I/O-control surface, and the top-level device type that
//! owns the wire layer, the geometry, and the cache together.

use core::fmt::Debug;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::cache::CacheState;
use crate::geometry::{Geometry, BLOCK_SIZE, PART1_START_BLOCK};
use crate::wire::FlashBus;
use crate::Error;

/// The upward block-device contract, shared by the USB-MSC adapter and any
/// on-device filesystem driver.
pub trait BlockDevice {
    type SpiError: Debug;
    type PinError: Debug;

    fn block_size(&self) -> u32;
    fn block_count(&self) -> u32;

    fn read_block(
        &mut self,
        idx: u32,
        dest: &mut [u8],
    ) -> Result<(), Error<Self::SpiError, Self::PinError>>;

    fn write_block(
        &mut self,
        idx: u32,
        src: &[u8],
    ) -> Result<(), Error<Self::SpiError, Self::PinError>>;

    /// Reads consecutive blocks starting at `start_idx` into `dest`, which
    /// must be a multiple of the block size. Aborts and reports the first
    /// failure.
    fn read_blocks(
        &mut self,
        start_idx: u32,
        dest: &mut [u8],
    ) -> Result<(), Error<Self::SpiError, Self::PinError>>;

    /// Writes consecutive blocks starting at `start_idx` from `src`, which
    /// must be a multiple of the block size. Aborts and reports the first
    /// failure.
    fn write_blocks(
        &mut self,
        start_idx: u32,
        src: &[u8],
    ) -> Result<(), Error<Self::SpiError, Self::PinError>>;

    fn flush(&mut self) -> Result<(), Error<Self::SpiError, Self::PinError>>;
}

/// I/O-control codes recognized by [`FlashBlockDevice::ioctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCommand {
    Init,
    Deinit,
    Sync,
    SectorCount,
    SectorSize,
}

/// Maps the numeric ioctl codes a USB-MSC/filesystem caller actually sends
/// (mirroring the source's `MP_BLOCKDEV_IOCTL_*` constants) onto
/// [`IoctlCommand`]. Codes outside this table are rejected here rather than
/// left for [`FlashBlockDevice::ioctl`] to puzzle over.
impl core::convert::TryFrom<u32> for IoctlCommand {
    type Error = ();

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(IoctlCommand::Init),
            2 => Ok(IoctlCommand::Deinit),
            3 => Ok(IoctlCommand::Sync),
            4 => Ok(IoctlCommand::SectorCount),
            5 => Ok(IoctlCommand::SectorSize),
            _ => Err(()),
        }
    }
}

/// Synthesizes the MBR contents for block 0: a single FAT12 partition
/// spanning `[PART1_START_BLOCK, block_count)`, preceded by boot code zeros
/// and followed by three empty partition entries and the boot signature.
///
/// A pure function with no dependency on cache or wire state, kept out of
/// the read path so it is directly unit-testable.
pub fn synthesize_mbr(block_count: u32) -> [u8; 512] {
    let mut mbr = [0u8; 512];

    let lba_start = PART1_START_BLOCK;
    let lba_len = block_count.saturating_sub(PART1_START_BLOCK);

    let entry = &mut mbr[446..462];
    entry[0] = 0x00; // boot flag: not bootable
    entry[1..4].copy_from_slice(&[0xFF, 0xFF, 0xFF]); // CHS start, non-empty
    entry[4] = 0x01; // partition type: FAT12
    entry[5..8].copy_from_slice(&[0xFF, 0xFF, 0xFF]); // CHS end, non-empty
    entry[8..12].copy_from_slice(&lba_start.to_le_bytes());
    entry[12..16].copy_from_slice(&lba_len.to_le_bytes());
    // bytes [462, 510) stay zero: three empty partition entries.

    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    mbr
}

/// Owns the wire layer, the chip's geometry, and the sector cache: the
/// complete flash-backed block device.
pub struct FlashBlockDevice<SPI, CS> {
    bus: FlashBus<SPI, CS>,
    geometry: Geometry,
    cache: CacheState,
}

impl<SPI, S, CS, P> FlashBlockDevice<SPI, CS>
where
    SPI: SpiBus<u8, Error = S>,
    CS: OutputPin<Error = P>,
    S: Debug,
    P: Debug,
{
    /// Brings the device up: identifies the chip over SPI and derives its
    /// geometry. An unrecognized JEDEC ID is not an I/O error — the device
    /// comes up with [`Geometry::UNKNOWN`] and every block operation beyond
    /// the synthetic MBR read fails from then on.
    pub fn new(spi: SPI, cs: CS) -> Result<Self, Error<S, P>> {
        let mut bus = FlashBus::new(spi, cs)?;
        let id = bus.identify()?;
        let geometry = Geometry::identify(id);

        #[cfg(feature = "defmt")]
        if !geometry.is_known() {
            defmt::warn!("unrecognized JEDEC ID, flash block device disabled");
        }

        Ok(Self {
            bus,
            geometry,
            cache: CacheState::new(),
        })
    }

    /// Bounds how many times the wire layer polls the status register before
    /// giving up with [`Error::Timeout`]. See [`FlashBus::with_max_ready_polls`].
    pub fn with_max_ready_polls(mut self, max: Option<u32>) -> Self {
        self.bus = self.bus.with_max_ready_polls(max);
        self
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn release(self) -> (SPI, CS) {
        self.bus.release()
    }

    fn flash_addr(&self, idx: u32) -> Result<u32, Error<S, P>> {
        if idx < PART1_START_BLOCK || idx >= self.geometry.block_count() {
            return Err(Error::OutOfBounds);
        }
        Ok((idx - PART1_START_BLOCK) * BLOCK_SIZE)
    }

    /// Recognizes `INIT`, `DEINIT`, `SYNC`, `SEC_COUNT`, `SEC_SIZE`.
    /// [`IoctlCommand`] is itself exhaustive, so there is no "unrecognized
    /// code" case here; a caller holding a raw numeric ioctl code should go
    /// through [`Self::ioctl_raw`] instead, which maps unknown codes to
    /// `None` before ever reaching this match.
    pub fn ioctl(&mut self, cmd: IoctlCommand) -> Option<u32> {
        match cmd {
            IoctlCommand::Init => Some(0),
            // The source flushes on DEINIT too ("TODO properly" in its own
            // comment) rather than treating it as a distinct teardown step;
            // preserved here rather than silently dropping the flush.
            IoctlCommand::Deinit | IoctlCommand::Sync => {
                self.flush().ok()?;
                Some(0)
            }
            IoctlCommand::SectorCount => Some(self.block_count()),
            IoctlCommand::SectorSize => Some(BLOCK_SIZE),
        }
    }

    /// Entry point for a caller holding a raw numeric ioctl code (as a
    /// filesystem or USB-MSC shim typically does) rather than an
    /// [`IoctlCommand`] already in hand. Unrecognized codes return `None`
    /// instead of panicking or being silently treated as a no-op.
    pub fn ioctl_raw(&mut self, code: u32) -> Option<u32> {
        let cmd = IoctlCommand::try_from(code).ok()?;
        self.ioctl(cmd)
    }

}

impl<SPI, S, CS, P> BlockDevice for FlashBlockDevice<SPI, CS>
where
    SPI: SpiBus<u8, Error = S>,
    CS: OutputPin<Error = P>,
    S: Debug,
    P: Debug,
{
    type SpiError = S;
    type PinError = P;

    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u32 {
        self.geometry.block_count()
    }

    fn read_block(&mut self, idx: u32, dest: &mut [u8]) -> Result<(), Error<S, P>> {
        if idx >= self.geometry.block_count() {
            return Err(Error::OutOfBounds);
        }
        if idx == 0 {
            dest.copy_from_slice(&synthesize_mbr(self.geometry.block_count()));
            return Ok(());
        }
        if idx < PART1_START_BLOCK {
            dest.fill(0);
            return Ok(());
        }
        let addr = self.flash_addr(idx)?;
        self.cache
            .read_cached_or_flash(&mut self.bus, &self.geometry, addr, dest)
    }

    fn write_block(&mut self, idx: u32, src: &[u8]) -> Result<(), Error<S, P>> {
        if idx < PART1_START_BLOCK {
            // Host attempts to write the synthetic MBR are silently accepted.
            return Ok(());
        }
        let addr = self.flash_addr(idx)?;
        self.bus.wait_ready()?;
        self.cache
            .stage_write(&mut self.bus, &self.geometry, addr, src)
    }

    fn read_blocks(&mut self, start_idx: u32, dest: &mut [u8]) -> Result<(), Error<S, P>> {
        for (i, chunk) in dest.chunks_mut(BLOCK_SIZE as usize).enumerate() {
            let idx = start_idx + i as u32;
            self.read_block(idx, chunk)
                .map_err(|e| Error::BlockFailed(idx, alloc::boxed::Box::new(e)))?;
        }
        Ok(())
    }

    fn write_blocks(&mut self, start_idx: u32, src: &[u8]) -> Result<(), Error<S, P>> {
        for (i, chunk) in src.chunks(BLOCK_SIZE as usize).enumerate() {
            let idx = start_idx + i as u32;
            self.write_block(idx, chunk)
                .map_err(|e| Error::BlockFailed(idx, alloc::boxed::Box::new(e)))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error<S, P>> {
        self.cache.flush(&mut self.bus, &self.geometry, false)
    }
}

impl<SPI, S, CS, P> FlashBlockDevice<SPI, CS>
where
    SPI: SpiBus<u8, Error = S>,
    CS: OutputPin<Error = P>,
    S: Debug,
    P: Debug,
{
    /// Flushes exactly like [`BlockDevice::flush`], but brackets the flush
    /// with the optional activity indicator mentioned in the source's
    /// `#ifdef MICROPY_HW_LED_MSC` guard: high while the flush is in
    /// progress, low again once it returns (success or failure). `None`
    /// skips the toggling entirely — the indicator is not required wiring.
    pub fn flush_with_activity_led<LED>(
        &mut self,
        led: Option<&mut LED>,
    ) -> Result<(), Error<S, P>>
    where
        LED: OutputPin<Error = P>,
    {
        let Some(led) = led else {
            return self.flush();
        };
        led.set_high().map_err(Error::Pin)?;
        let result = self.flush();
        led.set_low().map_err(Error::Pin)?;
        result
    }
}
