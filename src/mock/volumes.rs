use crate::{VolumeAccess, VolumeId};

/// Redundancy manager with an access refcount and deferred switching.
#[derive(Debug)]
pub struct MockVolumes {
    pub current: VolumeId,
    pub accesses: u32,
    pub pending: bool,
    pub switches: usize,
}

impl MockVolumes {
    pub fn new() -> Self {
        Self { current: VolumeId::Sd0, accesses: 0, pending: false, switches: 0 }
    }

    fn flip(&mut self) {
        self.current = match self.current {
            VolumeId::Sd0 => VolumeId::Sd1,
            VolumeId::Sd1 => VolumeId::Sd0,
        };
        self.switches += 1;
    }
}

impl VolumeAccess for MockVolumes {
    fn current_volume(&self) -> VolumeId {
        self.current
    }

    fn try_switch_volume(&mut self) -> bool {
        if self.accesses == 0 {
            self.flip();
            true
        } else {
            self.pending = true;
            false
        }
    }

    fn switch_pending(&self) -> bool {
        self.pending
    }

    fn acquire(&mut self) {
        self.accesses += 1;
    }

    fn release(&mut self) {
        self.accesses -= 1;
        if self.accesses == 0 && self.pending {
            self.pending = false;
            self.flip();
        }
    }
}
