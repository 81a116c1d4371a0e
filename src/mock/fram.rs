use std::vec::Vec;

use crate::state::MetadataBlock;
use crate::{FramError, FramRegions, ImageSlot, MetadataStore, VolumeId};

/// Metadata half of the FRAM API, backed by a plain [`MetadataBlock`].
#[derive(Debug, Default)]
pub struct MockMeta {
    pub block: MetadataBlock,
    /// Fail the next N metadata writes.
    pub fail_writes: usize,
}

impl MockMeta {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_gate(&mut self) -> Result<(), FramError> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            Err(FramError)
        } else {
            Ok(())
        }
    }
}

impl MetadataStore for MockMeta {
    async fn binary_size(&mut self, slot: ImageSlot) -> Result<u32, FramError> {
        Ok(self.block.slot(slot).binary_size)
    }

    async fn set_binary_size(&mut self, slot: ImageSlot, size: u32) -> Result<(), FramError> {
        self.write_gate()?;
        self.block.slot_mut(slot).binary_size = size;
        Ok(())
    }

    async fn image_crc(&mut self, slot: ImageSlot) -> Result<u16, FramError> {
        Ok(self.block.slot(slot).image_crc)
    }

    async fn set_image_crc(&mut self, slot: ImageSlot, crc: u16) -> Result<(), FramError> {
        self.write_gate()?;
        self.block.slot_mut(slot).image_crc = crc;
        Ok(())
    }

    async fn hamming_size(&mut self, slot: ImageSlot) -> Result<u32, FramError> {
        Ok(self.block.slot(slot).hamming_size)
    }

    async fn set_hamming_size(&mut self, slot: ImageSlot, size: u32) -> Result<(), FramError> {
        self.write_gate()?;
        self.block.slot_mut(slot).hamming_size = size;
        Ok(())
    }

    async fn hamming_present(&mut self, slot: ImageSlot) -> Result<bool, FramError> {
        Ok(self.block.slot(slot).hamming_present)
    }

    async fn set_hamming_present(
        &mut self,
        slot: ImageSlot,
        present: bool,
    ) -> Result<(), FramError> {
        self.write_gate()?;
        self.block.slot_mut(slot).hamming_present = present;
        Ok(())
    }

    async fn reboot_counter(&mut self, slot: ImageSlot) -> Result<u16, FramError> {
        Ok(self.block.slot(slot).reboot_counter)
    }

    async fn set_reboot_counter(&mut self, slot: ImageSlot, count: u16) -> Result<(), FramError> {
        self.write_gate()?;
        self.block.slot_mut(slot).reboot_counter = count;
        Ok(())
    }

    async fn bootloader_size(&mut self) -> Result<u32, FramError> {
        Ok(self.block.bootloader_size)
    }

    async fn set_bootloader_size(&mut self, size: u32) -> Result<(), FramError> {
        self.write_gate()?;
        self.block.bootloader_size = size;
        Ok(())
    }

    async fn bootloader_crc(&mut self) -> Result<u16, FramError> {
        Ok(self.block.bootloader_crc)
    }

    async fn set_bootloader_crc(&mut self, crc: u16) -> Result<(), FramError> {
        self.write_gate()?;
        self.block.bootloader_crc = crc;
        Ok(())
    }

    async fn bootloader_faulty(&mut self) -> Result<bool, FramError> {
        Ok(self.block.bootloader_faulty)
    }

    async fn set_bootloader_faulty(&mut self, faulty: bool) -> Result<(), FramError> {
        self.write_gate()?;
        self.block.bootloader_faulty = faulty;
        Ok(())
    }

    async fn update_pending(&mut self) -> Result<Option<VolumeId>, FramError> {
        Ok(self.block.update_pending)
    }

    async fn set_update_pending(&mut self, target: Option<VolumeId>) -> Result<(), FramError> {
        self.write_gate()?;
        self.block.update_pending = target;
        Ok(())
    }
}

/// The raw FRAM regions: bootloader backup plus one hamming region per slot.
#[derive(Debug)]
pub struct MockRegions {
    pub backup: Vec<u8>,
    hamming: [Vec<u8>; ImageSlot::COUNT],
    pub capacity: u32,
    /// Fail the next N region reads.
    pub fail_reads: usize,
}

impl MockRegions {
    pub fn new() -> Self {
        Self {
            backup: Vec::new(),
            hamming: Default::default(),
            capacity: 64 * 1024,
            fail_reads: 0,
        }
    }

    pub fn hamming(&self, slot: ImageSlot) -> &[u8] {
        &self.hamming[slot.index()]
    }

    fn read_gate(&mut self) -> Result<(), FramError> {
        if self.fail_reads > 0 {
            self.fail_reads -= 1;
            Err(FramError)
        } else {
            Ok(())
        }
    }
}

impl FramRegions for MockRegions {
    async fn backup_size(&mut self) -> Result<u32, FramError> {
        Ok(self.backup.len() as u32)
    }

    async fn read_backup(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FramError> {
        self.read_gate()?;
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > self.backup.len() {
            return Err(FramError);
        }
        buf.copy_from_slice(&self.backup[offset..end]);
        Ok(())
    }

    fn hamming_capacity(&self, _slot: ImageSlot) -> u32 {
        self.capacity
    }

    async fn read_hamming(
        &mut self,
        slot: ImageSlot,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), FramError> {
        self.read_gate()?;
        let region = &self.hamming[slot.index()];
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > region.len() {
            return Err(FramError);
        }
        buf.copy_from_slice(&region[offset..end]);
        Ok(())
    }

    async fn write_hamming(
        &mut self,
        slot: ImageSlot,
        offset: u32,
        bytes: &[u8],
    ) -> Result<(), FramError> {
        let end = offset as usize + bytes.len();
        if end as u32 > self.capacity {
            return Err(FramError);
        }
        let region = &mut self.hamming[slot.index()];
        if region.len() < end {
            region.resize(end, 0);
        }
        region[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }
}
