#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod fs;
pub mod fuse;
pub mod path;
pub mod repair;
pub mod storage;
pub mod tier;

pub use config::{DEFAULT_THRESHOLD, ThresholdPolicy, TierConfig};
pub use error::{Result, TierError};
pub use fs::TierFs;
pub use fuse::TierFuse;
pub use path::VirtualPath;
