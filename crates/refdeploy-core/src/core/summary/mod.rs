//! Remote listings: encodings, generation, deltas and the fetch cache.

pub mod build;
pub mod cache;
pub mod delta;
pub mod format;

pub use build::{update_summary, SummaryOptions, SummaryReport};
pub use cache::{SummaryBlob, SummaryCache, SummarySource};
pub use format::{CacheData, SparseData, SubsummaryDescriptor, Summary, SummaryIndex, SummaryRef};
