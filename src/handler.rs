//! Commandable facade over the copy engine and the scrubber.
//!
//! The handler owns the devices and arbitrates one operation at a time: a
//! `start` on a busy handler is rejected, never queued. Every accepted request
//! produces exactly one terminal report — from the `tick` that finishes or
//! fails it, or from an explicit `cancel` — and budget-exhausted ticks produce
//! none. SD-touching operations hold the volume for their whole lifetime, so
//! the redundancy manager can only switch cards between operations.

use crate::engine::{CopyEngine, CopyProgress, EngineState};
use crate::scrub::{ScrubOutcome, Scrubber};
use crate::sectormap::{DeviceGeometry, SectorMap};
use crate::{
    ClientId, CopyError, FramRegions, ImageFlash, ImageSlot, MetadataStore, OperationKind,
    StepOutcome, TimeBudget, VolumeAccess, VolumeFs,
};

/// Externally visible handler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HandlerState {
    Idle,
    Copying,
    Scrubbing,
}

/// What a terminal report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Activity {
    Copy(OperationKind),
    Scrub(ImageSlot),
}

/// How an activity ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    Success,
    /// The scrubbed content no longer matches its commit marker.
    ScrubMismatch { computed: u16, expected: u16 },
    Failed(CopyError),
}

/// The single terminal notification every accepted request produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OperationReport {
    pub client: ClientId,
    pub activity: Activity,
    pub outcome: Outcome,
}

/// Software image handler: owns the devices, one engine and one scrubber.
pub struct ImageHandler<F, M, R, S, V> {
    flash: F,
    meta: M,
    regions: R,
    fs: S,
    volumes: V,
    engine: CopyEngine,
    scrubber: Scrubber,
    state: HandlerState,
    current: Option<(ClientId, Activity)>,
    holds_volume: bool,
    last: Option<OperationReport>,
}

impl<F, M, R, S, V> ImageHandler<F, M, R, S, V>
where
    F: ImageFlash,
    M: MetadataStore,
    R: FramRegions,
    S: VolumeFs,
    V: VolumeAccess,
{
    pub fn new(
        map: SectorMap,
        geometry: DeviceGeometry,
        flash: F,
        meta: M,
        regions: R,
        fs: S,
        volumes: V,
    ) -> Self {
        Self {
            flash,
            meta,
            regions,
            fs,
            volumes,
            engine: CopyEngine::new(map, geometry),
            scrubber: Scrubber::new(map, geometry),
            state: HandlerState::Idle,
            current: None,
            holds_volume: false,
            last: None,
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.state()
    }

    /// Cursor snapshot of the in-flight copy, for status telemetry.
    pub fn progress(&self) -> Option<CopyProgress> {
        self.engine.progress()
    }

    pub fn last_report(&self) -> Option<&OperationReport> {
        self.last.as_ref()
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn meta(&self) -> &M {
        &self.meta
    }

    pub fn regions(&self) -> &R {
        &self.regions
    }

    pub fn fs(&self) -> &S {
        &self.fs
    }

    pub fn volumes(&self) -> &V {
        &self.volumes
    }

    /// The redundancy manager stays commandable from above (volume switch
    /// requests are its own concern and defer themselves while we hold it).
    pub fn volumes_mut(&mut self) -> &mut V {
        &mut self.volumes
    }

    /// Accept one copy operation.
    pub async fn start(&mut self, client: ClientId, kind: OperationKind) -> Result<(), CopyError> {
        if self.state != HandlerState::Idle {
            return Err(CopyError::Busy);
        }
        if kind.touches_sd() && self.volumes.switch_pending() {
            return Err(CopyError::VolumeChangePending);
        }
        let volume = self.volumes.current_volume();
        self.engine
            .start(kind, volume, &mut self.meta, &mut self.regions, &mut self.fs)
            .await?;
        if kind.touches_sd() {
            self.volumes.acquire();
            self.holds_volume = true;
        }
        self.state = HandlerState::Copying;
        self.current = Some((client, Activity::Copy(kind)));
        Ok(())
    }

    /// Accept one scrub pass over a committed slot.
    pub async fn start_scrub(&mut self, client: ClientId, slot: ImageSlot) -> Result<(), CopyError> {
        if self.state != HandlerState::Idle {
            return Err(CopyError::Busy);
        }
        let on_sd = slot.image_file().is_some();
        if on_sd && self.volumes.switch_pending() {
            return Err(CopyError::VolumeChangePending);
        }
        let volume = self.volumes.current_volume();
        self.scrubber.start(slot, volume, &mut self.meta).await?;
        if on_sd {
            self.volumes.acquire();
            self.holds_volume = true;
        }
        self.state = HandlerState::Scrubbing;
        self.current = Some((client, Activity::Scrub(slot)));
        Ok(())
    }

    /// Drive the active machine until it ends or the budget is spent.
    pub async fn tick(&mut self, budget: &mut impl TimeBudget) -> Option<OperationReport> {
        match self.state {
            HandlerState::Idle => None,
            HandlerState::Copying => loop {
                let outcome = self
                    .engine
                    .step(
                        &mut self.flash,
                        &mut self.meta,
                        &mut self.regions,
                        &mut self.fs,
                        budget,
                    )
                    .await;
                match outcome {
                    StepOutcome::Progressed => {
                        if budget.exhausted() {
                            return None;
                        }
                    }
                    StepOutcome::BudgetExceeded => return None,
                    StepOutcome::Finished => return self.finish(Outcome::Success),
                    StepOutcome::Failed(e) => return self.finish(Outcome::Failed(e)),
                }
            },
            HandlerState::Scrubbing => {
                match self.scrubber.step(&mut self.flash, &mut self.fs, budget).await {
                    ScrubOutcome::BudgetExceeded => None,
                    ScrubOutcome::Done { computed, expected } => {
                        if computed == expected {
                            self.finish(Outcome::Success)
                        } else {
                            self.finish(Outcome::ScrubMismatch { computed, expected })
                        }
                    }
                    ScrubOutcome::Failed(e) => self.finish(Outcome::Failed(e)),
                }
            }
        }
    }

    /// Cancel between steps. No commit marker is written; the destination
    /// stays marked not-yet-valid.
    pub fn cancel(&mut self) -> Option<OperationReport> {
        if self.state == HandlerState::Idle {
            return None;
        }
        self.engine.cancel();
        self.scrubber.cancel();
        self.finish(Outcome::Failed(CopyError::Cancelled))
    }

    fn finish(&mut self, outcome: Outcome) -> Option<OperationReport> {
        if self.holds_volume {
            self.volumes.release();
            self.holds_volume = false;
        }
        self.state = HandlerState::Idle;
        let (client, activity) = self.current.take()?;
        let report = OperationReport { client, activity, outcome };
        self.last = Some(report);
        Some(report)
    }
}
