//! High-level table operations. Each module contributes methods to
//! [`crate::Table`]: row-level mutations funnel through the commit
//! pipeline, maintenance operations rewrite the live file set.

pub(crate) mod delete;
pub(crate) mod merge;
pub(crate) mod update;
pub(crate) mod write;

pub mod dedup;
pub mod optimize;
pub mod vacuum;
pub mod zorder;

pub use dedup::{DedupMetrics, DedupOptions, KeepStrategy};
pub use merge::{Merge, MergeMetrics};
pub use optimize::{CompactionMetrics, CompactionOptions, CompactionStrategy};
pub use update::UpdateMetrics;
pub use vacuum::{VacuumMetrics, VacuumOptions};
pub use zorder::{ZOrderMetrics, ZOrderOptions};

pub use delete::DeleteMetrics;
pub use write::InsertOptions;
