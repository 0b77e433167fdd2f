pub mod config;
pub mod error;
pub mod types;

pub use config::{GroupNames, PlannerConfig, StatRanges};
pub use error::{AudienceError, AudienceResult};
pub use types::{
    AudienceStrategy, Cohort, CohortAssignment, GroupedVisitor, KpiSummary, SampleSizePlan,
    ScoredVisitor,
};
