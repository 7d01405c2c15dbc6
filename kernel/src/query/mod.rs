//! In-process query evaluation: MongoDB-style filters compiled once and
//! run per row, include/exclude projections, and zone-map pruning that
//! skips whole files before any Parquet bytes move.

pub(crate) mod filter;
mod project;
mod prune;

pub use filter::Filter;
pub use project::Projection;
pub(crate) use prune::file_may_match;
