//! Image copying engine: performs one image-copy or hamming-copy operation
//! across many scheduler invocations without blocking the calling task.
//!
//! An operation runs in two phases. `Erasing` prepares the destination (flash
//! sectors are erased one per work unit, an SD destination is truncated, a
//! FRAM hamming region has its presence flag cleared). `Writing` then moves
//! one bucket per work unit: read from the source at the byte cursor, write
//! through the sector address table, advance. The time budget is re-checked
//! after every unit, and a `BudgetExceeded` return resumes at exactly the same
//! cursor on the next invocation.
//!
//! Transient read/write failures are retried on later invocations; the third
//! consecutive failure ends the operation. A bucket that was read but failed
//! to write stays pending and is not read again, so the source stream is never
//! consumed twice.
//!
//! The destination only becomes bootable at the very end, when the binary
//! size and CRC16 land in the metadata store. Anything short of that commit
//! leaves the previous marker in place, so a power loss mid-copy can never
//! make the vehicle boot a half-written image.

use crc::{CRC_16_IBM_3740, Crc, Digest};

use crate::sectormap::{DeviceGeometry, FlashRegion, SectorMap};
use crate::{
    CopyError, FramError, FramRegions, FsError, ImageFlash, ImageSlot, MetadataStore,
    OperationKind, StepOutcome, TimeBudget, VolumeFs, VolumeId,
};

/// CRC algorithm shared with the boot ROM's integrity check.
pub(crate) static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Largest supported bucket (the flash small-sector size); sizes the working
/// buffer.
pub const MAX_BUCKET: usize = 0x2000;

/// Offset of the sixth vector-table word. The boot ROM reads the image size
/// from it, so bootloader destinations get it patched before bucket zero is
/// written.
const SIXTH_VECTOR: usize = 0x14;

/// Consecutive failures tolerated on a single read or write.
const MAX_IO_ATTEMPTS: u8 = 3;

/// Coarse machine state; `Writing` is never entered before `Erasing` has
/// completed for the operation's destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EngineState {
    Idle,
    Erasing,
    Writing,
}

/// Cursor snapshot for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CopyProgress {
    pub step_counter: u32,
    pub byte_index: u32,
    pub file_size: u32,
    /// Destination sectors that failed to erase and were skipped.
    pub skipped_sectors: u32,
}

/// Where the current operation reads from.
enum Source {
    SdFile { volume: VolumeId, path: &'static str },
    FramBackup,
    FlashApplication,
}

/// Where the current operation writes to.
enum Destination {
    Flash(FlashRegion),
    SdFile { volume: VolumeId, path: &'static str },
    FramHamming(ImageSlot),
}

struct Operation {
    kind: OperationKind,
    source: Source,
    dest: Destination,
}

/// Mutable per-operation progress record; created by `start`, destroyed on
/// completion or abort.
struct Cursor {
    step_counter: u32,
    byte_index: u32,
    /// Cached once per operation; the source must not change size mid-copy.
    file_size: u32,
    error_count: u8,
    /// A bucket sits in the working buffer, read but not yet committed to the
    /// destination.
    pending_read: bool,
    pending_len: usize,
    erase_index: u32,
    erase_count: u32,
    skipped_sectors: u32,
    digest: Digest<'static, u16>,
}

impl Cursor {
    fn new(file_size: u32, erase_count: u32) -> Self {
        Self {
            step_counter: 0,
            byte_index: 0,
            file_size,
            error_count: 0,
            pending_read: false,
            pending_len: 0,
            erase_index: 0,
            erase_count,
            skipped_sectors: 0,
            digest: CRC16.digest(),
        }
    }
}

/// The operation-specific state machine. Owns the cursor and the working
/// buffer; the devices are passed into every call by the owner.
pub struct CopyEngine {
    map: SectorMap,
    geometry: DeviceGeometry,
    state: EngineState,
    op: Option<(Operation, Cursor)>,
    last_finished: Option<OperationKind>,
    buf: [u8; MAX_BUCKET],
}

impl CopyEngine {
    pub fn new(map: SectorMap, geometry: DeviceGeometry) -> Self {
        Self {
            map,
            geometry,
            state: EngineState::Idle,
            op: None,
            last_finished: None,
            buf: [0; MAX_BUCKET],
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.op.is_none()
    }

    /// Kind of the operation currently in flight.
    pub fn current(&self) -> Option<OperationKind> {
        self.op.as_ref().map(|(op, _)| op.kind)
    }

    pub fn last_finished(&self) -> Option<OperationKind> {
        self.last_finished
    }

    pub fn progress(&self) -> Option<CopyProgress> {
        self.op.as_ref().map(|(_, cursor)| CopyProgress {
            step_counter: cursor.step_counter,
            byte_index: cursor.byte_index,
            file_size: cursor.file_size,
            skipped_sectors: cursor.skipped_sectors,
        })
    }

    /// Abandon the operation between steps, without writing the commit
    /// marker. The destination stays marked not-yet-valid.
    pub fn cancel(&mut self) {
        self.op = None;
        self.state = EngineState::Idle;
    }

    /// Register one operation and cache its source size. The engine stays
    /// formally idle until the first `step` enters the erase phase.
    pub async fn start<M, R, S>(
        &mut self,
        kind: OperationKind,
        volume: VolumeId,
        meta: &mut M,
        regions: &mut R,
        fs: &mut S,
    ) -> Result<(), CopyError>
    where
        M: MetadataStore,
        R: FramRegions,
        S: VolumeFs,
    {
        if self.op.is_some() {
            return Err(CopyError::Busy);
        }

        let (source, dest) = plan(kind, volume)?;

        let file_size = match &source {
            Source::SdFile { volume, path } => {
                fs.file_size(*volume, path).await.map_err(|e| match e {
                    FsError::NotFound | FsError::DirectoryMissing => CopyError::SourceNotFound,
                    FsError::Locked => CopyError::SourceLocked,
                    FsError::Io => CopyError::ReadError,
                })?
            }
            Source::FramBackup => regions
                .backup_size()
                .await
                .map_err(|_| CopyError::ReadError)?,
            Source::FlashApplication => meta
                .binary_size(ImageSlot::Flash)
                .await
                .map_err(|_| CopyError::MetadataStore)?,
        };
        // A zero size is the not-bootable marker; there is nothing to copy.
        if file_size == 0 {
            return Err(CopyError::InvalidParameters);
        }

        let erase_count = match &dest {
            Destination::Flash(region) => self
                .map
                .sectors_covering(*region, file_size)
                .map_err(|_| CopyError::InvalidParameters)?,
            Destination::FramHamming(slot) => {
                if file_size > regions.hamming_capacity(*slot) {
                    return Err(CopyError::InvalidParameters);
                }
                1
            }
            Destination::SdFile { .. } => 1,
        };

        self.op = Some((
            Operation { kind, source, dest },
            Cursor::new(file_size, erase_count),
        ));
        Ok(())
    }

    /// Make bounded progress on the in-flight operation.
    ///
    /// Any `Failed` return guarantees the engine has already reset itself; the
    /// only partial state left behind is in the destination medium, which is
    /// by design not yet marked bootable.
    pub async fn step<F, M, R, S, B>(
        &mut self,
        flash: &mut F,
        meta: &mut M,
        regions: &mut R,
        fs: &mut S,
        budget: &mut B,
    ) -> StepOutcome
    where
        F: ImageFlash,
        M: MetadataStore,
        R: FramRegions,
        S: VolumeFs,
        B: TimeBudget,
    {
        let outcome = self.step_inner(flash, meta, regions, fs, budget).await;
        match outcome {
            StepOutcome::Finished => {
                if let Some((op, _)) = self.op.take() {
                    self.last_finished = Some(op.kind);
                }
                self.state = EngineState::Idle;
            }
            StepOutcome::Failed(_) => {
                self.op = None;
                self.state = EngineState::Idle;
            }
            StepOutcome::Progressed | StepOutcome::BudgetExceeded => {}
        }
        outcome
    }

    async fn step_inner<F, M, R, S, B>(
        &mut self,
        flash: &mut F,
        meta: &mut M,
        regions: &mut R,
        fs: &mut S,
        budget: &mut B,
    ) -> StepOutcome
    where
        F: ImageFlash,
        M: MetadataStore,
        R: FramRegions,
        S: VolumeFs,
        B: TimeBudget,
    {
        let map = self.map;
        let bucket = self.geometry.bucket_size;

        let Some((op, cursor)) = self.op.as_mut() else {
            return StepOutcome::Failed(CopyError::InvalidParameters);
        };

        if self.state == EngineState::Idle {
            self.state = EngineState::Erasing;
        }

        if self.state == EngineState::Erasing {
            match &op.dest {
                Destination::Flash(region) => {
                    while cursor.erase_index < cursor.erase_count {
                        if budget.exhausted() {
                            return StepOutcome::BudgetExceeded;
                        }
                        let sector = match map.sector(*region, cursor.erase_index) {
                            Ok(sector) => sector,
                            Err(_) => return StepOutcome::Failed(CopyError::InvalidParameters),
                        };
                        if flash.erase_sector(sector).await.is_err() {
                            // Mission flash accumulates bad sectors; the scrub
                            // pass catches whatever ends up unreadable here.
                            cursor.skipped_sectors += 1;
                            #[cfg(feature = "defmt")]
                            defmt::warn!(
                                "skipping faulty sector at {=u32:#x}",
                                sector.base().get()
                            );
                        }
                        cursor.erase_index += 1;
                        budget.record_unit();
                    }
                }
                Destination::SdFile { volume, path } => {
                    if budget.exhausted() {
                        return StepOutcome::BudgetExceeded;
                    }
                    if let Err(e) = fs.create(*volume, path).await {
                        return StepOutcome::Failed(match e {
                            FsError::NotFound | FsError::DirectoryMissing => {
                                CopyError::DestinationDirectoryMissing
                            }
                            _ => CopyError::WriteError,
                        });
                    }
                    budget.record_unit();
                }
                Destination::FramHamming(slot) => {
                    if budget.exhausted() {
                        return StepOutcome::BudgetExceeded;
                    }
                    // Invalidate before overwriting; valid again only at commit.
                    if meta.set_hamming_present(*slot, false).await.is_err() {
                        return StepOutcome::Failed(CopyError::MetadataStore);
                    }
                    budget.record_unit();
                }
            }
            self.state = EngineState::Writing;
            cursor.step_counter = 0;
            cursor.byte_index = 0;
            return StepOutcome::Progressed;
        }

        loop {
            if !cursor.pending_read {
                if budget.exhausted() {
                    return StepOutcome::BudgetExceeded;
                }
                let remaining = cursor.file_size - cursor.byte_index;
                let want = (bucket as u32).min(remaining) as usize;
                let chunk = &mut self.buf[..want];
                let read = match &op.source {
                    Source::SdFile { volume, path } => {
                        match fs.read_at(*volume, path, cursor.byte_index, chunk).await {
                            Ok(n) if n == want => Ok(()),
                            // A short read mid-file means the source changed
                            // or the medium is failing; counts as an attempt.
                            Ok(_) | Err(_) => Err(()),
                        }
                    }
                    Source::FramBackup => regions
                        .read_backup(cursor.byte_index, chunk)
                        .await
                        .map_err(|_| ()),
                    Source::FlashApplication => {
                        match map.address_for(FlashRegion::Application, cursor.byte_index) {
                            Ok(addr) => flash.read(addr.absolute(), chunk).await.map_err(|_| ()),
                            Err(_) => return StepOutcome::Failed(CopyError::InvalidParameters),
                        }
                    }
                };
                if read.is_err() {
                    cursor.error_count += 1;
                    if cursor.error_count >= MAX_IO_ATTEMPTS {
                        return StepOutcome::Failed(CopyError::ReadError);
                    }
                    return StepOutcome::BudgetExceeded;
                }
                cursor.error_count = 0;
                cursor.pending_len = want;
                cursor.pending_read = true;

                if matches!(op.dest, Destination::Flash(FlashRegion::Bootloader))
                    && cursor.step_counter == 0
                    && want >= SIXTH_VECTOR + 4
                {
                    chunk[SIXTH_VECTOR..SIXTH_VECTOR + 4]
                        .copy_from_slice(&cursor.file_size.to_le_bytes());
                }
            }

            let data = &self.buf[..cursor.pending_len];
            let write = match &op.dest {
                Destination::Flash(region) => {
                    match map.address_for(*region, cursor.byte_index) {
                        Ok(addr) => flash.write(addr.absolute(), data).await.map_err(|_| ()),
                        Err(_) => return StepOutcome::Failed(CopyError::InvalidParameters),
                    }
                }
                Destination::SdFile { volume, path } => {
                    fs.append(*volume, path, data).await.map_err(|_| ())
                }
                Destination::FramHamming(slot) => regions
                    .write_hamming(*slot, cursor.byte_index, data)
                    .await
                    .map_err(|_| ()),
            };
            if write.is_err() {
                cursor.error_count += 1;
                if cursor.error_count >= MAX_IO_ATTEMPTS {
                    return StepOutcome::Failed(CopyError::WriteError);
                }
                // The bucket stays pending and is not re-read on retry.
                return StepOutcome::BudgetExceeded;
            }

            cursor.digest.update(data);
            cursor.error_count = 0;
            cursor.pending_read = false;
            cursor.byte_index += cursor.pending_len as u32;
            cursor.step_counter += 1;
            budget.record_unit();

            if cursor.byte_index >= cursor.file_size {
                let crc = core::mem::replace(&mut cursor.digest, CRC16.digest()).finalize();
                if commit(op.kind, cursor.file_size, crc, meta).await.is_err() {
                    return StepOutcome::Failed(CopyError::MetadataStore);
                }
                return StepOutcome::Finished;
            }
            if budget.exhausted() {
                return StepOutcome::BudgetExceeded;
            }
        }
    }
}

/// Validate the operation shape and derive its source and destination.
fn plan(kind: OperationKind, volume: VolumeId) -> Result<(Source, Destination), CopyError> {
    match kind {
        OperationKind::Image { from, to } => {
            if !from.is_application() || !to.is_application() || from == to {
                return Err(CopyError::InvalidParameters);
            }
            let source = match from.image_file() {
                Some(path) => Source::SdFile { volume, path },
                None => Source::FlashApplication,
            };
            let dest = match to.image_file() {
                Some(path) => Destination::SdFile { volume, path },
                None => Destination::Flash(FlashRegion::Application),
            };
            Ok((source, dest))
        }
        OperationKind::BootloaderFromSd { from } => {
            let path = match (from, from.image_file()) {
                (ImageSlot::Bootloader0 | ImageSlot::Bootloader1, Some(path)) => path,
                _ => return Err(CopyError::InvalidParameters),
            };
            Ok((
                Source::SdFile { volume, path },
                Destination::Flash(FlashRegion::Bootloader),
            ))
        }
        OperationKind::BootloaderFromFram => Ok((
            Source::FramBackup,
            Destination::Flash(FlashRegion::Bootloader),
        )),
        OperationKind::Hamming { slot } => Ok((
            Source::SdFile { volume, path: slot.hamming_file() },
            Destination::FramHamming(slot),
        )),
    }
}

/// The atomic commit that makes the freshly written destination valid.
async fn commit<M: MetadataStore>(
    kind: OperationKind,
    size: u32,
    crc: u16,
    meta: &mut M,
) -> Result<(), FramError> {
    match kind {
        OperationKind::Image { to, .. } => {
            meta.set_binary_size(to, size).await?;
            meta.set_image_crc(to, crc).await
        }
        OperationKind::BootloaderFromSd { .. } | OperationKind::BootloaderFromFram => {
            meta.set_bootloader_size(size).await?;
            meta.set_bootloader_crc(crc).await
        }
        OperationKind::Hamming { slot } => {
            meta.set_hamming_size(slot, size).await?;
            meta.set_hamming_present(slot, true).await
        }
    }
}
