//! Simple straightforward implementation of keeping the metadata block.
//!
//! This implementation focusses on correctness and ease, contrary to
//! efficiency and code size. Leverages `sequential-storage` and `postcard` to
//! store and serialize/deserialize the block in a dedicated NOR region, for
//! boards whose FRAM is too small (or absent) to hold it.

use embedded_storage_async::nor_flash::NorFlash;
use sequential_storage::cache::KeyPointerCache;
use sequential_storage::map::{SerializationError, Value, fetch_item, store_item};

use super::MetadataBlock;
use crate::{FramError, ImageSlot, MetadataStore, VolumeId};

impl<'a> Value<'a> for MetadataBlock {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        let buffer = postcard::to_slice(self, buffer).map_err(|e| match e {
            postcard::Error::SerializeBufferFull => SerializationError::BufferTooSmall,
            // Unmapped error.
            _ => SerializationError::Custom(0),
        })?;

        Ok(buffer.len())
    }

    fn deserialize_from(buffer: &'a [u8]) -> Result<Self, SerializationError>
    where
        Self: Sized,
    {
        postcard::from_bytes(buffer).map_err(|e| match e {
            // Provided buffer is too small.
            postcard::Error::DeserializeUnexpectedEnd => SerializationError::BufferTooSmall,
            // Data type mismatch between Value and what is stored on disk.
            postcard::Error::DeserializeBadVarint
            | postcard::Error::DeserializeBadBool
            | postcard::Error::DeserializeBadChar
            | postcard::Error::DeserializeBadUtf8
            | postcard::Error::DeserializeBadOption
            | postcard::Error::DeserializeBadEnum
            | postcard::Error::DeserializeBadEncoding => SerializationError::InvalidFormat,
            // Unmapped error.
            _ => SerializationError::Custom(0),
        })
    }
}

/// Metadata store kept in a NOR flash region.
pub struct SimpleStore<NVM: NorFlash> {
    block: MetadataBlock,
    nvm: NVM,
    // Up to four pages of metadata region.
    cache: KeyPointerCache<4, (), 1>,
}

impl<NVM: NorFlash> SimpleStore<NVM> {
    /// Fetch the stored block, or start from the default (all slots
    /// uncommitted) on a blank region.
    pub async fn new(mut nvm: NVM) -> Result<Self, FramError> {
        let nvm_size = nvm.capacity() as u32;
        let mut cache: KeyPointerCache<4, (), 1> = KeyPointerCache::new();
        let mut data_buffer = [0u8; MetadataBlock::MAX_SERIALIZED];

        let block = fetch_item::<(), MetadataBlock, _>(
            &mut nvm,
            0..nvm_size,
            &mut cache,
            &mut data_buffer,
            &(),
        )
        .await
        .map_err(|_| FramError)?
        .unwrap_or_default();

        Ok(Self { block, nvm, cache })
    }

    pub fn block(&self) -> &MetadataBlock {
        &self.block
    }

    /// Hand the region back, e.g. across a controlled restart.
    pub fn release(self) -> NVM {
        self.nvm
    }

    async fn store(&mut self) -> Result<(), FramError> {
        let mut data_buffer = [0u8; MetadataBlock::MAX_SERIALIZED];
        let nvm_size = self.nvm.capacity() as u32;

        store_item::<(), MetadataBlock, _>(
            &mut self.nvm,
            0..nvm_size,
            &mut self.cache,
            &mut data_buffer,
            &(),
            &self.block,
        )
        .await
        .map_err(|_| FramError)
    }
}

impl<NVM: NorFlash> MetadataStore for SimpleStore<NVM> {
    async fn binary_size(&mut self, slot: ImageSlot) -> Result<u32, FramError> {
        Ok(self.block.slot(slot).binary_size)
    }

    async fn set_binary_size(&mut self, slot: ImageSlot, size: u32) -> Result<(), FramError> {
        self.block.slot_mut(slot).binary_size = size;
        self.store().await
    }

    async fn image_crc(&mut self, slot: ImageSlot) -> Result<u16, FramError> {
        Ok(self.block.slot(slot).image_crc)
    }

    async fn set_image_crc(&mut self, slot: ImageSlot, crc: u16) -> Result<(), FramError> {
        self.block.slot_mut(slot).image_crc = crc;
        self.store().await
    }

    async fn hamming_size(&mut self, slot: ImageSlot) -> Result<u32, FramError> {
        Ok(self.block.slot(slot).hamming_size)
    }

    async fn set_hamming_size(&mut self, slot: ImageSlot, size: u32) -> Result<(), FramError> {
        self.block.slot_mut(slot).hamming_size = size;
        self.store().await
    }

    async fn hamming_present(&mut self, slot: ImageSlot) -> Result<bool, FramError> {
        Ok(self.block.slot(slot).hamming_present)
    }

    async fn set_hamming_present(
        &mut self,
        slot: ImageSlot,
        present: bool,
    ) -> Result<(), FramError> {
        self.block.slot_mut(slot).hamming_present = present;
        self.store().await
    }

    async fn reboot_counter(&mut self, slot: ImageSlot) -> Result<u16, FramError> {
        Ok(self.block.slot(slot).reboot_counter)
    }

    async fn set_reboot_counter(&mut self, slot: ImageSlot, count: u16) -> Result<(), FramError> {
        self.block.slot_mut(slot).reboot_counter = count;
        self.store().await
    }

    async fn bootloader_size(&mut self) -> Result<u32, FramError> {
        Ok(self.block.bootloader_size)
    }

    async fn set_bootloader_size(&mut self, size: u32) -> Result<(), FramError> {
        self.block.bootloader_size = size;
        self.store().await
    }

    async fn bootloader_crc(&mut self) -> Result<u16, FramError> {
        Ok(self.block.bootloader_crc)
    }

    async fn set_bootloader_crc(&mut self, crc: u16) -> Result<(), FramError> {
        self.block.bootloader_crc = crc;
        self.store().await
    }

    async fn bootloader_faulty(&mut self) -> Result<bool, FramError> {
        Ok(self.block.bootloader_faulty)
    }

    async fn set_bootloader_faulty(&mut self, faulty: bool) -> Result<(), FramError> {
        self.block.bootloader_faulty = faulty;
        self.store().await
    }

    async fn update_pending(&mut self) -> Result<Option<VolumeId>, FramError> {
        Ok(self.block.update_pending)
    }

    async fn set_update_pending(&mut self, target: Option<VolumeId>) -> Result<(), FramError> {
        self.block.update_pending = target;
        self.store().await
    }
}
