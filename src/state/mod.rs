//! Persistent metadata records: the commit markers for every image slot.

use serde::{Deserialize, Serialize};

use crate::{ImageSlot, VolumeId};

#[cfg(feature = "simple_state")]
pub mod simple;

/// Per-slot persistent record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotRecord {
    pub binary_size: u32,
    pub image_crc: u16,
    pub hamming_size: u32,
    pub hamming_present: bool,
    pub reboot_counter: u16,
}

/// The whole persistent block, stored as a single value.
///
/// A slot with `binary_size == 0` has never been committed and must not be
/// booted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MetadataBlock {
    pub slots: [SlotRecord; ImageSlot::COUNT],
    /// Size and CRC of the bootloader currently programmed into flash.
    pub bootloader_size: u32,
    pub bootloader_crc: u16,
    pub bootloader_faulty: bool,
    /// A software update waits on this volume for the next boot.
    pub update_pending: Option<VolumeId>,
}

impl MetadataBlock {
    /// Upper bound of the postcard encoding, sizing fetch/store buffers.
    pub const MAX_SERIALIZED: usize = 128;

    pub fn slot(&self, slot: ImageSlot) -> &SlotRecord {
        &self.slots[slot.index()]
    }

    pub fn slot_mut(&mut self, slot: ImageSlot) -> &mut SlotRecord {
        &mut self.slots[slot.index()]
    }
}
