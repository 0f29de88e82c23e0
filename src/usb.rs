//! The USB Mass Storage Class adapter: answers the four questions the USB
//! side asks of the block device (ready?, capacity?, writable?, read/write N
//! sectors), gated by a filesystem-supplied writability oracle.

use core::fmt::Debug;

use crate::device::BlockDevice;
use crate::geometry::PART1_START_BLOCK;
use crate::Error;

/// Supplied by the on-device filesystem: reports whether the filesystem
/// currently holds the medium mounted writable. While it does, USB writes
/// are refused to avoid two writers disagreeing about sector contents.
pub trait WritabilityGate {
    fn filesystem_owns_write(&self) -> bool;
}

/// Supplied by the on-device filesystem: notified with the LBA of every
/// USB-originated write so a privately cached copy of that sector can be
/// dropped.
///
/// Exists so the USB adapter never reaches into the filesystem driver's own
/// window buffer directly; the filesystem decides for itself how to respond.
pub trait FilesystemCoherence {
    fn invalidate_sector(&mut self, lba: u32);
}

/// Binds a [`BlockDevice`] to the writability and coherence hooks a
/// filesystem driver supplies, and answers the USB-MSC surface on top.
pub struct UsbMscAdapter<'a, D, G, F> {
    device: &'a mut D,
    writability: &'a G,
    coherence: &'a mut F,
}

impl<'a, D, G, F, S, P> UsbMscAdapter<'a, D, G, F>
where
    D: BlockDevice<SpiError = S, PinError = P>,
    G: WritabilityGate,
    F: FilesystemCoherence,
    S: Debug,
    P: Debug,
{
    pub fn new(device: &'a mut D, writability: &'a G, coherence: &'a mut F) -> Self {
        Self {
            device,
            writability,
            coherence,
        }
    }

    /// True once the device has usable geometry. An unidentified chip's
    /// `block_count()` collapses to `PART1_START_BLOCK` exactly (see
    /// [`crate::geometry::Geometry::block_count`]), which this treats as
    /// "no medium" rather than as a present-but-empty disk.
    pub fn test_unit_ready(&self) -> bool {
        self.device.block_count() > PART1_START_BLOCK
    }

    /// Last valid sector index, deliberately not a sector count — a host
    /// that treats this as a count instead of an index will be off by one.
    /// Returns `None` when no medium is present.
    pub fn read_capacity(&self) -> Option<u32> {
        if !self.test_unit_ready() {
            return None;
        }
        Some(self.device.block_count() - 1)
    }

    /// The medium is always reported removable: an on-board SPI NOR chip
    /// behind this adapter has no eject mechanism of its own, but the host
    /// still asks, so answer the way the source's `vfs_removal` always does.
    pub fn is_removable(&self) -> bool {
        true
    }

    pub fn write_protected(&self) -> bool {
        self.writability.filesystem_owns_write()
    }

    pub fn read_10(&mut self, start_lba: u32, dest: &mut [u8]) -> Result<(), Error<S, P>> {
        self.device.read_blocks(start_lba, dest)
    }

    /// Writes `src` (a multiple of the block size) starting at `start_lba`,
    /// then invalidates every written sector on the filesystem side. Refused
    /// outright while the filesystem owns write access.
    pub fn write_10(&mut self, start_lba: u32, src: &[u8]) -> Result<(), Error<S, P>> {
        if self.write_protected() {
            return Err(Error::WriteProtected);
        }
        self.device.write_blocks(start_lba, src)?;
        let block_size = self.device.block_size();
        let blocks_written = src.len() as u32 / block_size;
        for i in 0..blocks_written {
            self.coherence.invalidate_sector(start_lba + i);
        }
        Ok(())
    }
}
