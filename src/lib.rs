//! Toolkit for rewriting a flight computer's firmware images across redundant
//! storage, a bounded number of steps at a time.
//!
//! The heart of the crate is a pair of resumable state machines driven from a
//! periodic task tick: the [`engine::CopyEngine`], which erases, reads, writes
//! and checksums one image-copy operation, and the [`filecopy::FileCopier`],
//! which applies the same step/yield discipline to ordinary file management on
//! the active SD volume. The [`handler::ImageHandler`] wraps the engine into a
//! commandable facade that accepts one operation at a time and emits exactly
//! one terminal report per accepted request.
//!
//! All device access goes through the traits below; the crate never owns a bus
//! or a filesystem. A destination only becomes bootable when its size and CRC
//! commit marker lands in the [`MetadataStore`], strictly after the last data
//! write.

#![no_std]

pub mod engine;
pub mod filecopy;
pub mod handler;
pub mod scrub;
pub mod sectormap;
pub mod state;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod mock;

use serde::{Deserialize, Serialize};

use crate::sectormap::Sector;

/// Raw failure reported by a flash primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashError;

/// Raw failure reported by the FRAM device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FramError;

/// Raw failure reported by a filesystem primitive.
///
/// The state machines map these into the [`CopyError`] taxonomy depending on
/// whether the source or the destination side of an operation raised them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FsError {
    NotFound,
    Locked,
    DirectoryMissing,
    Io,
}

/// Terminal failure kinds surfaced to the requester of an operation.
///
/// A budget-exhausted tick is not a failure and never produces one of these;
/// see [`StepOutcome::BudgetExceeded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CopyError {
    /// An operation is already in progress.
    Busy,
    /// Structurally invalid operation/slot combination.
    InvalidParameters,
    SourceNotFound,
    SourceLocked,
    DestinationDirectoryMissing,
    /// Read retry budget exhausted, or a source region unreadable.
    ReadError,
    /// Write retry budget exhausted.
    WriteError,
    /// The persistent store rejected the commit marker. Already written flash
    /// data is not rolled back; the previous marker still names the
    /// last-known-good image.
    MetadataStore,
    /// A volume switch is pending; SD operations are deferred until it lands.
    VolumeChangePending,
    /// The requester (or ground) cancelled the operation between steps.
    Cancelled,
}

/// Logical storage location of one firmware image copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageSlot {
    /// The image bank in NOR flash the vehicle boots from.
    Flash,
    SdSlot0,
    SdSlot1,
    /// First SD-stored bootloader copy.
    Bootloader0,
    /// Second SD-stored bootloader copy.
    Bootloader1,
}

impl ImageSlot {
    pub const COUNT: usize = 5;

    /// Stable index into per-slot metadata arrays.
    pub const fn index(self) -> usize {
        match self {
            ImageSlot::Flash => 0,
            ImageSlot::SdSlot0 => 1,
            ImageSlot::SdSlot1 => 2,
            ImageSlot::Bootloader0 => 3,
            ImageSlot::Bootloader1 => 4,
        }
    }

    /// Whether this slot may take part in an application-image copy.
    pub const fn is_application(self) -> bool {
        matches!(self, ImageSlot::Flash | ImageSlot::SdSlot0 | ImageSlot::SdSlot1)
    }

    /// Image file backing this slot on the active SD volume, if any.
    pub const fn image_file(self) -> Option<&'static str> {
        match self {
            ImageSlot::Flash => None,
            ImageSlot::SdSlot0 => Some("app/slot0.bin"),
            ImageSlot::SdSlot1 => Some("app/slot1.bin"),
            ImageSlot::Bootloader0 => Some("bl/boot0.bin"),
            ImageSlot::Bootloader1 => Some("bl/boot1.bin"),
        }
    }

    /// Hamming-code file protecting this slot's image.
    pub const fn hamming_file(self) -> &'static str {
        match self {
            ImageSlot::Flash => "ham/flash.ham",
            ImageSlot::SdSlot0 => "ham/slot0.ham",
            ImageSlot::SdSlot1 => "ham/slot1.ham",
            ImageSlot::Bootloader0 => "ham/boot0.ham",
            ImageSlot::Bootloader1 => "ham/boot1.ham",
        }
    }
}

/// One of the two redundant SD cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VolumeId {
    Sd0,
    Sd1,
}

/// Identity of the requester an operation reports back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClientId(pub u16);

/// Bounded path on an SD volume.
pub type FilePath = heapless::String<64>;

/// Physical byte address inside the image flash device.
///
/// Only the sector address table mints these, so a write target is always the
/// result of a checked mapping rather than ad-hoc pointer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PhysicalAddress(pub(crate) u32);

impl PhysicalAddress {
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Top-level intent of one engine operation, fixed from `start` to the
/// terminal report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OperationKind {
    /// Application-image copy between application slots (SD to flash, flash
    /// to SD, or SD to SD mirror).
    Image { from: ImageSlot, to: ImageSlot },
    /// An SD-stored bootloader copy into the flash bootloader region.
    BootloaderFromSd { from: ImageSlot },
    /// The FRAM bootloader backup into the flash bootloader region.
    BootloaderFromFram,
    /// A slot's hamming-code file into its FRAM hamming region.
    Hamming { slot: ImageSlot },
}

impl OperationKind {
    /// Whether any phase of the operation touches the active SD volume.
    pub fn touches_sd(self) -> bool {
        match self {
            OperationKind::Image { from, to } => {
                from != ImageSlot::Flash || to != ImageSlot::Flash
            }
            OperationKind::BootloaderFromSd { .. } => true,
            OperationKind::BootloaderFromFram => false,
            OperationKind::Hamming { .. } => true,
        }
    }
}

/// Result of one engine invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StepOutcome {
    /// A phase boundary was crossed; more work remains and the budget allows
    /// re-invocation within the same tick.
    Progressed,
    /// The operation completed and its commit marker is written.
    Finished,
    /// The budget is spent (or a transient I/O failure wants a retry next
    /// tick); the cursor resumes exactly here on the next invocation.
    BudgetExceeded,
    /// Terminal failure; the engine has reset itself to idle.
    Failed(CopyError),
}

/// Pacing contract for one scheduler invocation.
///
/// Boards implement this over a clock to cap a tick at a fraction of the task
/// period; [`UnitBudget`] counts whole work units instead, which keeps
/// scheduling deterministic.
pub trait TimeBudget {
    /// Account one unit of bounded work: a sector erase, a bucket transfer,
    /// or a file-copy chunk.
    fn record_unit(&mut self);

    /// True once the invocation must yield back to its task.
    fn exhausted(&self) -> bool;
}

/// Deterministic budget counting whole work units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitBudget {
    left: u32,
}

impl UnitBudget {
    pub const fn new(units: u32) -> Self {
        Self { left: units }
    }
}

impl TimeBudget for UnitBudget {
    fn record_unit(&mut self) {
        self.left = self.left.saturating_sub(1);
    }

    fn exhausted(&self) -> bool {
        self.left == 0
    }
}

/// Erase/program/read primitive of the image flash device.
///
/// No knowledge of images or slots; addresses come out of the sector address
/// table.
#[allow(async_fn_in_trait)]
pub trait ImageFlash {
    async fn erase_sector(&mut self, sector: Sector) -> Result<(), FlashError>;
    async fn write(&mut self, address: PhysicalAddress, bytes: &[u8]) -> Result<(), FlashError>;
    async fn read(&mut self, address: PhysicalAddress, buf: &mut [u8]) -> Result<(), FlashError>;
}

/// Persistent per-slot metadata surviving power loss and watchdog resets.
///
/// Each operation is individually atomic from the core's point of view. The
/// size and CRC of a slot form its commit marker: a reader must treat a slot
/// with a zero size as not bootable.
#[allow(async_fn_in_trait)]
pub trait MetadataStore {
    async fn binary_size(&mut self, slot: ImageSlot) -> Result<u32, FramError>;
    async fn set_binary_size(&mut self, slot: ImageSlot, size: u32) -> Result<(), FramError>;

    async fn image_crc(&mut self, slot: ImageSlot) -> Result<u16, FramError>;
    async fn set_image_crc(&mut self, slot: ImageSlot, crc: u16) -> Result<(), FramError>;

    async fn hamming_size(&mut self, slot: ImageSlot) -> Result<u32, FramError>;
    async fn set_hamming_size(&mut self, slot: ImageSlot, size: u32) -> Result<(), FramError>;

    async fn hamming_present(&mut self, slot: ImageSlot) -> Result<bool, FramError>;
    async fn set_hamming_present(
        &mut self,
        slot: ImageSlot,
        present: bool,
    ) -> Result<(), FramError>;

    async fn reboot_counter(&mut self, slot: ImageSlot) -> Result<u16, FramError>;
    async fn set_reboot_counter(&mut self, slot: ImageSlot, count: u16) -> Result<(), FramError>;

    /// Size and CRC of the bootloader currently programmed into flash.
    async fn bootloader_size(&mut self) -> Result<u32, FramError>;
    async fn set_bootloader_size(&mut self, size: u32) -> Result<(), FramError>;
    async fn bootloader_crc(&mut self) -> Result<u16, FramError>;
    async fn set_bootloader_crc(&mut self, crc: u16) -> Result<(), FramError>;

    async fn bootloader_faulty(&mut self) -> Result<bool, FramError>;
    async fn set_bootloader_faulty(&mut self, faulty: bool) -> Result<(), FramError>;

    /// Pending software update and the volume it should be taken from.
    async fn update_pending(&mut self) -> Result<Option<VolumeId>, FramError>;
    async fn set_update_pending(&mut self, target: Option<VolumeId>) -> Result<(), FramError>;
}

/// The FRAM regions holding raw image data rather than metadata: the
/// bootloader backup and the per-slot hamming codes.
#[allow(async_fn_in_trait)]
pub trait FramRegions {
    /// Size of the bootloader image held in the backup region.
    async fn backup_size(&mut self) -> Result<u32, FramError>;
    async fn read_backup(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FramError>;

    fn hamming_capacity(&self, slot: ImageSlot) -> u32;
    async fn read_hamming(
        &mut self,
        slot: ImageSlot,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), FramError>;
    async fn write_hamming(
        &mut self,
        slot: ImageSlot,
        offset: u32,
        bytes: &[u8],
    ) -> Result<(), FramError>;
}

/// POSIX-like primitives of the SD filesystem layer.
///
/// Offset-addressed so that no file handle outlives a single step; the volume
/// manager may therefore switch cards between operations but never under an
/// open handle.
#[allow(async_fn_in_trait)]
pub trait VolumeFs {
    async fn file_size(&mut self, volume: VolumeId, path: &str) -> Result<u32, FsError>;
    async fn read_at(
        &mut self,
        volume: VolumeId,
        path: &str,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize, FsError>;
    /// Create the file, truncating any previous content.
    async fn create(&mut self, volume: VolumeId, path: &str) -> Result<(), FsError>;
    async fn append(&mut self, volume: VolumeId, path: &str, bytes: &[u8]) -> Result<(), FsError>;
    async fn remove(&mut self, volume: VolumeId, path: &str) -> Result<(), FsError>;
    async fn lock(&mut self, volume: VolumeId, path: &str) -> Result<(), FsError>;
    async fn unlock(&mut self, volume: VolumeId, path: &str) -> Result<(), FsError>;
}

/// Redundancy manager serializing access to the two SD cards.
///
/// Multi-step operations bracket themselves with `acquire`/`release`; a volume
/// switch is deferred until the access count reaches zero.
pub trait VolumeAccess {
    fn current_volume(&self) -> VolumeId;
    /// Switch the active volume now if no accesses are outstanding. Returns
    /// false (and leaves the switch pending) otherwise.
    fn try_switch_volume(&mut self) -> bool;
    fn switch_pending(&self) -> bool;
    fn acquire(&mut self);
    fn release(&mut self);
}
