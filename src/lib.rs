pub mod bitmap;
pub mod bittree;
pub mod block;
pub mod checksum;
pub mod context;
pub mod device;
pub mod error;
pub mod events;
pub mod fs;
pub mod orchestrator;
mod pipeline;
pub mod pool;
pub mod rate;
mod repair;
pub mod replace;
pub mod walker;

pub use bittree::{BitOp, BitState, BitTree, InodeVerdict};
pub use context::ScrubProgress;
#[cfg(feature = "io")]
pub use device::FileDevice;
pub use device::{BlockDevice, MemDevice};
pub use error::ScrubError;
pub use events::{EventItem, EventMask, EventRegistry, PageEvent, ScrubTask};
pub use fs::{RelevanceOracle, ScrubFilesystem, ScrubGate};
pub use orchestrator::{ScrubOptions, Scrubber, scrub_device};
