mod error;
mod global_registry;
mod tracker;

pub use error::GlobalDirtyError;
pub use global_registry::{GlobalDirtyPoller, GlobalDirtyRegistry};
pub use tracker::DirtyTracker;
