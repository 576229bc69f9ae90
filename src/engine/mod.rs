//! Message & conversation reconciliation: ordered, deduplicated logs per
//! conversation plus the conversation-list projection derived from them.

pub mod merge;
pub mod projection;
pub mod store;

pub use merge::{interleave, merge_by_id, TimelineEntry, TimelineItem};
pub use store::{MergeOutcome, MergeSource, ReconciliationEngine};
