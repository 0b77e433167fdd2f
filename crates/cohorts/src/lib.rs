//! Experiment cohorts: randomized test/control/excluded partitions per
//! propensity group, cohort statistics, significance checks and audience
//! profiles.

pub mod assigner;
pub mod profile;
pub mod random;
pub mod stats;

pub use assigner::CohortAssigner;
pub use random::{CohortDraw, RandomSource, SeededSource};
pub use stats::CohortStatsReporter;
