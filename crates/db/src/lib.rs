//! The seeder's address database: known peers, sliding-window reliability
//! statistics, crawl scheduling, the ban list, and the durable snapshot.

pub mod db;
pub mod record;
pub mod reliability;
pub mod snapshot;

pub use db::{DbPolicy, FamilyFilter, SeedDb, NEW_FAIL_CAP};
pub use record::{DbStats, ProbeTarget, SeedReport, ServiceResult};
pub use reliability::{ReliabilityWindow, WindowStat, WINDOWS, WINDOW_COUNT};
pub use snapshot::{SnapshotError, SEEDS_FILE_VERSION};
