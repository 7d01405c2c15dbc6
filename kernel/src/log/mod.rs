//! Reading and writing the transaction log: the NDJSON action codec and the
//! listing/selection of commit and checkpoint files that feed log replay.

pub(crate) mod codec;
pub(crate) mod segment;
