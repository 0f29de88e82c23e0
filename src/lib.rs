#![no_std]

//! Sector-caching, write-staging core for a block device backed by SPI NOR
//! flash.
//!
//! This crate does not drive any particular flash chip byte-for-byte; it owns
//! the part that is hard to get right regardless of chip: reconciling a
//! 512-byte block interface (as seen by a USB-MSC host and an on-device
//! filesystem) with a flash chip that can only be erased a whole sector at a
//! time. See [`device::FlashBlockDevice`] for the block interface, and
//! [`usb`] for the USB-MSC adapter that sits in front of it.

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

use core::fmt::Debug;
use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind};

pub mod cache;
pub mod device;
pub mod geometry;
pub mod usb;
pub mod wire;

#[cfg(test)]
mod mock;

pub use cache::{Backing, CacheState};
pub use device::{synthesize_mbr, BlockDevice, FlashBlockDevice, IoctlCommand};
pub use geometry::{Geometry, JedecId, BLOCK_SIZE, PART1_START_BLOCK};
pub use usb::{FilesystemCoherence, UsbMscAdapter, WritabilityGate};
pub use wire::FlashBus;

/// Errors produced anywhere in the block-device core.
///
/// `S` is the SPI bus's error type, `P` is the chip-select (and optional
/// activity LED) pin's error type.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error<S: Debug, P: Debug> {
    /// The chip reported an unrecognized JEDEC ID at init; the device has no
    /// usable geometry and every block operation fails.
    NotPresent,
    /// An SPI bus transceive failed.
    Spi(S),
    /// A GPIO (chip-select or activity LED) operation failed.
    Pin(P),
    /// USB write was refused because the filesystem currently owns the
    /// medium as writable.
    WriteProtected,
    /// A block or flash address fell outside the addressable range.
    OutOfBounds,
    /// An address passed to a page- or sector-addressed primitive was not
    /// aligned to the unit that primitive requires.
    NotAligned,
    /// The write-enable latch did not set after `WRITE_ENABLE`.
    WriteEnableFail,
    /// A step of `flush` failed partway through; the cache state was
    /// preserved so a retry is possible.
    FlushFailed,
    /// The bounded `wait_ready` poll budget (if configured) was exhausted.
    Timeout,
    /// `readback-check` found a mismatch between what was written and what
    /// was read back.
    ReadbackFail,
    /// A bulk `read_blocks`/`write_blocks` call failed partway through. Holds
    /// the index of the first block that failed and the underlying
    /// single-block error.
    BlockFailed(u32, alloc::boxed::Box<Error<S, P>>),
}

impl<S: Debug, P: Debug> NorFlashError for Error<S, P> {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Error::NotAligned => NorFlashErrorKind::NotAligned,
            Error::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            Error::BlockFailed(_, source) => source.kind(),
            _ => NorFlashErrorKind::Other,
        }
    }
}
