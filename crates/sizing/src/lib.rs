//! Experiment sizing: chi-squared sample sizes, propensity groups,
//! per-group KPIs and sample size plans for both audience strategies.

pub mod calculator;
pub mod grouper;
pub mod planner;

pub use calculator::required_sample_size;
pub use grouper::PropensityGrouper;
pub use planner::SampleSizePlanner;
