//! Bounded read-back verification of a committed image against its commit
//! marker, for catching single-event upsets and silently failed writes while
//! the vehicle keeps running.
//!
//! One bucket is read and folded into a running CRC16 per work unit; the
//! digest survives across invocations just like the copy engine's cursor.
//! Correcting a corrupt image is not this machine's job — it only reports the
//! verdict, and recovery is another copy operation.

use crc::Digest;

use crate::engine::{CRC16, MAX_BUCKET};
use crate::sectormap::{DeviceGeometry, FlashRegion, SectorMap};
use crate::{
    CopyError, ImageFlash, ImageSlot, MetadataStore, TimeBudget, VolumeFs, VolumeId,
};

/// Result of one scrubber invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScrubOutcome {
    /// Budget spent; the pass resumes at the same byte on the next call.
    BudgetExceeded,
    /// The whole committed extent was read; the caller compares the sums.
    Done { computed: u16, expected: u16 },
    /// Terminal failure; the scrubber has reset itself to idle.
    Failed(CopyError),
}

enum ScrubSource {
    FlashApplication,
    SdFile { volume: VolumeId, path: &'static str },
}

struct ScrubCursor {
    byte_index: u32,
    size: u32,
    expected: u16,
    digest: Digest<'static, u16>,
}

/// Resumable read-back verification pass over one committed slot.
pub struct Scrubber {
    map: SectorMap,
    geometry: DeviceGeometry,
    op: Option<(ImageSlot, ScrubSource, ScrubCursor)>,
    buf: [u8; MAX_BUCKET],
}

impl Scrubber {
    pub fn new(map: SectorMap, geometry: DeviceGeometry) -> Self {
        Self { map, geometry, op: None, buf: [0; MAX_BUCKET] }
    }

    pub fn is_idle(&self) -> bool {
        self.op.is_none()
    }

    /// Slot currently being verified.
    pub fn current(&self) -> Option<ImageSlot> {
        self.op.as_ref().map(|(slot, _, _)| *slot)
    }

    pub fn cancel(&mut self) {
        self.op = None;
    }

    /// Begin verifying `slot` against its commit marker.
    pub async fn start<M: MetadataStore>(
        &mut self,
        slot: ImageSlot,
        volume: VolumeId,
        meta: &mut M,
    ) -> Result<(), CopyError> {
        if self.op.is_some() {
            return Err(CopyError::Busy);
        }
        let size = meta
            .binary_size(slot)
            .await
            .map_err(|_| CopyError::MetadataStore)?;
        let expected = meta
            .image_crc(slot)
            .await
            .map_err(|_| CopyError::MetadataStore)?;
        // An uncommitted slot has nothing trustworthy to verify against.
        if size == 0 {
            return Err(CopyError::InvalidParameters);
        }
        let source = match slot.image_file() {
            Some(path) => ScrubSource::SdFile { volume, path },
            None => ScrubSource::FlashApplication,
        };
        if matches!(source, ScrubSource::FlashApplication)
            && size > self.map.region_len(FlashRegion::Application)
        {
            return Err(CopyError::InvalidParameters);
        }
        self.op = Some((
            slot,
            source,
            ScrubCursor { byte_index: 0, size, expected, digest: CRC16.digest() },
        ));
        Ok(())
    }

    /// Fold buckets into the running CRC until the budget is spent or the
    /// committed extent ends.
    pub async fn step<F, S, B>(&mut self, flash: &mut F, fs: &mut S, budget: &mut B) -> ScrubOutcome
    where
        F: ImageFlash,
        S: VolumeFs,
        B: TimeBudget,
    {
        let outcome = self.step_inner(flash, fs, budget).await;
        if !matches!(outcome, ScrubOutcome::BudgetExceeded) {
            self.op = None;
        }
        outcome
    }

    async fn step_inner<F, S, B>(
        &mut self,
        flash: &mut F,
        fs: &mut S,
        budget: &mut B,
    ) -> ScrubOutcome
    where
        F: ImageFlash,
        S: VolumeFs,
        B: TimeBudget,
    {
        let map = self.map;
        let bucket = self.geometry.bucket_size;
        let Some((_, source, cursor)) = self.op.as_mut() else {
            return ScrubOutcome::Failed(CopyError::InvalidParameters);
        };

        loop {
            if cursor.byte_index >= cursor.size {
                let computed = core::mem::replace(&mut cursor.digest, CRC16.digest()).finalize();
                return ScrubOutcome::Done { computed, expected: cursor.expected };
            }
            if budget.exhausted() {
                return ScrubOutcome::BudgetExceeded;
            }

            let want = (bucket as u32).min(cursor.size - cursor.byte_index) as usize;
            let chunk = &mut self.buf[..want];
            let read = match source {
                ScrubSource::FlashApplication => {
                    match map.address_for(FlashRegion::Application, cursor.byte_index) {
                        Ok(addr) => flash.read(addr.absolute(), chunk).await.map_err(|_| ()),
                        Err(_) => return ScrubOutcome::Failed(CopyError::InvalidParameters),
                    }
                }
                ScrubSource::SdFile { volume, path } => {
                    match fs.read_at(*volume, path, cursor.byte_index, chunk).await {
                        Ok(n) if n == want => Ok(()),
                        Ok(_) | Err(_) => Err(()),
                    }
                }
            };
            if read.is_err() {
                return ScrubOutcome::Failed(CopyError::ReadError);
            }
            cursor.digest.update(chunk);
            cursor.byte_index += want as u32;
            budget.record_unit();
        }
    }
}
