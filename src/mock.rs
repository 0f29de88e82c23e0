//! Host-only in-memory SPI bus and GPIO pin used to exercise the block-device
//! core's cache, wire, and eviction behavior without real silicon.
//!
//! No mocking crate is depended on anywhere in the retrieved reference pack,
//! so this is hand-written, matching the minimal amount of chip emulation
//! the wire layer (`src/wire.rs`) actually drives: JEDEC ID, status register
//! (WEL only — WIP is never left set, operations are modeled as instant),
//! page program (NOR AND-only semantics) and sector erase.

use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::convert::Infallible;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::{ErrorType as SpiErrorType, SpiBus};

pub type FlashImage = Rc<RefCell<Vec<u8>>>;

/// A flash image filled with the erased state (`0xFF`).
pub fn blank_flash(len: usize) -> FlashImage {
    Rc::new(RefCell::new(vec![0xFF; len]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockSpiError;

impl embedded_hal::spi::Error for MockSpiError {
    fn kind(&self) -> embedded_hal::spi::ErrorKind {
        embedded_hal::spi::ErrorKind::Other
    }
}

enum Pending {
    ReadJedec,
    ReadStatus,
    ReadData { addr: u32 },
    PageProgram { addr: u32 },
}

/// Emulates just enough of a 24-bit-addressed NOR flash chip to drive
/// [`crate::wire::FlashBus`] through its paces.
pub struct MockSpiBus {
    flash: FlashImage,
    sector_size: u32,
    jedec_id: [u8; 3],
    pending: Option<Pending>,
    wel: bool,
    inject_error: bool,
    pub erase_count: usize,
    pub program_count: usize,
}

impl MockSpiBus {
    pub fn new(flash: FlashImage, sector_size: u32) -> Self {
        Self {
            flash,
            sector_size,
            jedec_id: [0x01, 0x40, 0x15],
            pending: None,
            wel: false,
            inject_error: false,
            erase_count: 0,
            program_count: 0,
        }
    }

    pub fn with_jedec_id(mut self, id: [u8; 3]) -> Self {
        self.jedec_id = id;
        self
    }

    /// The next `read` or `write` call fails with [`MockSpiError`].
    pub fn inject_next_error(&mut self) {
        self.inject_error = true;
    }

    fn take_injected_error(&mut self) -> Result<(), MockSpiError> {
        if self.inject_error {
            self.inject_error = false;
            return Err(MockSpiError);
        }
        Ok(())
    }

    fn be24(words: &[u8]) -> u32 {
        ((words[0] as u32) << 16) | ((words[1] as u32) << 8) | words[2] as u32
    }
}

impl SpiErrorType for MockSpiBus {
    type Error = MockSpiError;
}

impl SpiBus<u8> for MockSpiBus {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.take_injected_error()?;
        match self.pending.take() {
            Some(Pending::ReadJedec) => {
                for (i, b) in words.iter_mut().enumerate() {
                    *b = *self.jedec_id.get(i).unwrap_or(&0);
                }
            }
            Some(Pending::ReadStatus) => {
                let status = if self.wel { 0x02 } else { 0x00 };
                words.fill(status);
            }
            Some(Pending::ReadData { addr }) => {
                let flash = self.flash.borrow();
                let len = flash.len();
                for (i, b) in words.iter_mut().enumerate() {
                    *b = flash[(addr as usize + i) % len];
                }
            }
            Some(Pending::PageProgram { .. }) | None => words.fill(0xFF),
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.take_injected_error()?;
        if words.is_empty() {
            return Ok(());
        }
        if let Some(Pending::PageProgram { addr }) = self.pending.take() {
            let mut flash = self.flash.borrow_mut();
            let len = flash.len();
            for (i, b) in words.iter().enumerate() {
                let idx = (addr as usize + i) % len;
                flash[idx] &= *b;
            }
            self.wel = false;
            self.program_count += 1;
            return Ok(());
        }

        match words[0] {
            0x9F => self.pending = Some(Pending::ReadJedec),
            0x05 => self.pending = Some(Pending::ReadStatus),
            0x06 => self.wel = true,
            0x03 => self.pending = Some(Pending::ReadData {
                addr: Self::be24(&words[1..4]),
            }),
            0x02 => self.pending = Some(Pending::PageProgram {
                addr: Self::be24(&words[1..4]),
            }),
            0x20 => {
                let addr = Self::be24(&words[1..4]);
                let mut flash = self.flash.borrow_mut();
                let len = flash.len();
                let start = addr as usize % len;
                let end = (start + self.sector_size as usize).min(len);
                flash[start..end].fill(0xFF);
                self.wel = false;
                self.erase_count += 1;
            }
            _ => {}
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.write(write)?;
        self.read(read)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let snapshot = words.to_vec();
        self.write(&snapshot)?;
        self.read(words)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// A GPIO pin that always succeeds; used for chip-select and the optional
/// activity LED in tests.
#[derive(Debug, Default)]
pub struct MockPin {
    pub level_high: bool,
}

impl MockPin {
    pub fn new() -> Self {
        Self { level_high: false }
    }
}

impl embedded_hal::digital::ErrorType for MockPin {
    type Error = Infallible;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.level_high = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.level_high = true;
        Ok(())
    }
}
