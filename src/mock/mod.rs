//! In-memory mock devices for host tests: failure injection, erase/write
//! tracing and wear tracking.

pub mod fram;
pub mod fs;
#[cfg(feature = "simple_state")]
pub mod nvm;
pub mod volumes;

pub use flash::{FlashEvent, MockFlash};
pub use fram::{MockMeta, MockRegions};
pub use fs::MockFs;
#[cfg(feature = "simple_state")]
pub use nvm::MockNvm;
pub use volumes::MockVolumes;
