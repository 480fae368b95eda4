pub mod lock;
pub mod migrate;
pub mod record;
pub mod resolver;
pub mod shadow;

pub use lock::{ExclusiveGuard, PathLocks, SharedGuard};
pub use migrate::MigrationEngine;
pub use record::IndirectionRecord;
pub use resolver::{Location, Resolver, Tier};
pub use shadow::{ShadowMetadata, ShadowStore};
