//! Near-duplicate photo detection.
//!
//! Images are embedded by a [`FeatureExtractor`], cached in an
//! [`IncrementalStore`] keyed by path, and grouped with density-based
//! clustering so each group can be culled down to the images worth keeping.

pub mod config;
pub mod core;
pub mod database;

pub use crate::config::{ExtractorKind, Settings};
pub use crate::core::cluster::{Cluster, DuplicateClusterer};
pub use crate::core::extractor::FeatureExtractor;
pub use crate::core::record::{Clusterable, ImageRecord};
pub use crate::core::runner::ScanRunner;
pub use crate::core::scanner::{ScanConfiguration, ScanOutcome, ScanPipeline, ScanProgress};
pub use crate::database::IncrementalStore;
