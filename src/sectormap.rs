//! Checked mapping from logical image regions to physical flash sectors.
//!
//! The NOR device carries a run of small boot sectors followed by uniform
//! large sectors. Two build-time layouts reserve either the small sectors
//! alone (64 KiB bootloader) or the small sectors plus the first large sector
//! (128 KiB bootloader) — selected once at startup by injecting the matching
//! table, never by probing at runtime.
//!
//! Every lookup is range-checked: an index or offset outside a region's
//! reservation is an error, never a silently wrapped address.

use crate::PhysicalAddress;

/// Logical destination region inside the image flash device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashRegion {
    Bootloader,
    Application,
}

/// One physical erase sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sector {
    pub(crate) base: PhysicalAddress,
    pub(crate) len: u32,
}

impl Sector {
    pub const fn base(self) -> PhysicalAddress {
        self.base
    }

    pub const fn len(self) -> u32 {
        self.len
    }
}

/// Sector base plus intra-sector byte offset, as produced by
/// [`SectorMap::address_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SectorAddress {
    pub base: PhysicalAddress,
    pub offset: u32,
}

impl SectorAddress {
    pub const fn absolute(self) -> PhysicalAddress {
        PhysicalAddress(self.base.0 + self.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SectorMapError {
    IndexOutOfRange,
    OffsetOutOfRange,
}

/// A run of equally sized sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SectorRun {
    base: u32,
    sector_len: u32,
    count: u32,
}

impl SectorRun {
    const fn len(&self) -> u32 {
        self.sector_len * self.count
    }
}

/// Total capacity of the image flash device.
pub const DEVICE_CAPACITY: u32 = 0x0020_0000;

const BOOT_SECTOR: u32 = 0x2000;
const MAIN_SECTOR: u32 = 0x1_0000;

/// Pure mapping from (region, logical index) to physical sectors for one of
/// the two bootloader reservation layouts.
#[derive(Debug, Clone, Copy)]
pub struct SectorMap {
    bootloader: &'static [SectorRun],
    application: &'static [SectorRun],
}

impl SectorMap {
    /// Eight 8 KiB boot sectors reserved for the bootloader, application
    /// image from 0x10000.
    pub const SMALL_BOOTLOADER: SectorMap = SectorMap {
        bootloader: &[SectorRun { base: 0x0, sector_len: BOOT_SECTOR, count: 8 }],
        application: &[SectorRun { base: 0x1_0000, sector_len: MAIN_SECTOR, count: 31 }],
    };

    /// The eight boot sectors plus the first large sector reserved (128 KiB
    /// bootloader), application image from 0x20000.
    pub const LARGE_BOOTLOADER: SectorMap = SectorMap {
        bootloader: &[
            SectorRun { base: 0x0, sector_len: BOOT_SECTOR, count: 8 },
            SectorRun { base: 0x1_0000, sector_len: MAIN_SECTOR, count: 1 },
        ],
        application: &[SectorRun { base: 0x2_0000, sector_len: MAIN_SECTOR, count: 30 }],
    };

    fn runs(&self, region: FlashRegion) -> &'static [SectorRun] {
        match region {
            FlashRegion::Bootloader => self.bootloader,
            FlashRegion::Application => self.application,
        }
    }

    /// Number of erase sectors reserved for the region.
    pub fn sector_count(&self, region: FlashRegion) -> u32 {
        self.runs(region).iter().map(|run| run.count).sum()
    }

    /// Total reserved byte length of the region.
    pub fn region_len(&self, region: FlashRegion) -> u32 {
        self.runs(region).iter().map(|run| run.len()).sum()
    }

    /// Physical sector for a logical index inside the region's reservation.
    pub fn sector(&self, region: FlashRegion, index: u32) -> Result<Sector, SectorMapError> {
        let mut remaining = index;
        for run in self.runs(region) {
            if remaining < run.count {
                return Ok(Sector {
                    base: PhysicalAddress(run.base + remaining * run.sector_len),
                    len: run.sector_len,
                });
            }
            remaining -= run.count;
        }
        Err(SectorMapError::IndexOutOfRange)
    }

    /// Sector base and intra-sector offset for a byte offset into the region.
    pub fn address_for(
        &self,
        region: FlashRegion,
        byte_offset: u32,
    ) -> Result<SectorAddress, SectorMapError> {
        let mut remaining = byte_offset;
        for run in self.runs(region) {
            if remaining < run.len() {
                let sector = remaining / run.sector_len;
                return Ok(SectorAddress {
                    base: PhysicalAddress(run.base + sector * run.sector_len),
                    offset: remaining % run.sector_len,
                });
            }
            remaining -= run.len();
        }
        Err(SectorMapError::OffsetOutOfRange)
    }

    /// How many leading sectors of the region an image of `len` bytes covers.
    pub fn sectors_covering(
        &self,
        region: FlashRegion,
        len: u32,
    ) -> Result<u32, SectorMapError> {
        if len > self.region_len(region) {
            return Err(SectorMapError::OffsetOutOfRange);
        }
        let mut sectors = 0;
        let mut covered = 0;
        for run in self.runs(region) {
            for _ in 0..run.count {
                if covered >= len {
                    return Ok(sectors);
                }
                covered += run.sector_len;
                sectors += 1;
            }
        }
        Ok(sectors)
    }
}

/// Board capability descriptor, injected once at startup together with the
/// sector map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceGeometry {
    /// Bytes moved per write step: the flash small-sector size, or the NAND
    /// page size on boards programming NAND.
    pub bucket_size: usize,
}

impl DeviceGeometry {
    pub const NOR_SMALL_SECTOR: DeviceGeometry = DeviceGeometry::new(BOOT_SECTOR as usize);
    pub const NAND_PAGE: DeviceGeometry = DeviceGeometry::new(2048);

    pub const fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0 && bucket_size <= crate::engine::MAX_BUCKET);
        Self { bucket_size }
    }
}
