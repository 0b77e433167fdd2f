use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::error::{AudienceError, AudienceResult};
use crate::types::AudienceStrategy;

/// Root planner configuration. Loaded from environment variables
/// with the prefix `PROPENSITY_PLANNER__` and an optional TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    #[serde(default)]
    pub grouping: GroupingConfig,
    #[serde(default)]
    pub ranges: StatRanges,
    #[serde(default)]
    pub cohorts: CohortConfig,
    #[serde(default)]
    pub significance: SignificanceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupingConfig {
    #[serde(default = "default_num_groups")]
    pub num_groups: u32,
    #[serde(default)]
    pub group_names: GroupNames,
    #[serde(default)]
    pub sort_policy: SortPolicy,
}

/// What to do with a dataset that is not ranked by descending score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortPolicy {
    RejectUnsorted,
    /// Stable sort, so equal scores keep their input order.
    #[default]
    SortDescending,
}

/// Ranges of experiment parameters to evaluate, all in percent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatRanges {
    #[serde(default = "default_uplift_pct", deserialize_with = "number_list")]
    pub uplift_pct: Vec<f64>,
    #[serde(default = "default_power_pct", deserialize_with = "number_list")]
    pub power_pct: Vec<f64>,
    #[serde(default = "default_confidence_pct", deserialize_with = "number_list")]
    pub confidence_pct: Vec<f64>,
}

/// Names of propensity groups, indexed by group number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct GroupNames(Vec<String>);

#[derive(Debug, Clone, Deserialize)]
pub struct CohortConfig {
    #[serde(default = "default_audience_strategy")]
    pub audience_strategy: AudienceStrategy,
    #[serde(default = "default_experiment_seed")]
    pub experiment_seed: u64,
    #[serde(default)]
    pub seed_policy: SeedPolicy,
    /// Experimental configuration to build cohorts for.
    #[serde(default = "default_selected_uplift")]
    pub uplift: f64,
    #[serde(default = "default_selected_power")]
    pub power: f64,
    #[serde(default = "default_selected_ci_level")]
    pub ci_level: f64,
    /// Cumulative slice used by the single-group strategy; covers groups `0..=slice`.
    #[serde(default)]
    pub single_group_slice: u32,
}

/// How the control and test draws are seeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPolicy {
    /// Every draw reuses the experiment seed as-is. Reproduces historic
    /// assignments, but the control and test draws are not independent.
    #[default]
    Shared,
    /// Each (group, draw) gets its own sub-seed derived from the experiment seed.
    Independent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignificanceConfig {
    /// Proportions, e.g. 0.95.
    #[serde(default = "default_confidence_levels", deserialize_with = "number_list")]
    pub confidence_levels: Vec<f64>,
}

// Default functions
fn default_num_groups() -> u32 {
    3
}
fn default_uplift_pct() -> Vec<f64> {
    vec![5.0, 10.0, 15.0, 20.0]
}
fn default_power_pct() -> Vec<f64> {
    vec![80.0, 90.0]
}
fn default_confidence_pct() -> Vec<f64> {
    vec![90.0, 95.0, 99.0]
}
fn default_audience_strategy() -> AudienceStrategy {
    AudienceStrategy::MultiGroup
}
fn default_experiment_seed() -> u64 {
    88
}
fn default_selected_uplift() -> f64 {
    10.0
}
fn default_selected_power() -> f64 {
    80.0
}
fn default_selected_ci_level() -> f64 {
    95.0
}
fn default_confidence_levels() -> Vec<f64> {
    vec![0.90, 0.95, 0.99]
}

/// A list of numbers, or a single number standing for a one-element list.
///
/// Environment values are parsed before list splitting, so `5` arrives as an
/// integer while `5,10` arrives as a list of strings.
fn number_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
    deserializer.deserialize_any(NumberListVisitor)
}

struct Number(f64);

impl<'de> Deserialize<'de> for Number {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(NumberVisitor).map(Number)
    }
}

struct NumberVisitor;

impl<'de> Visitor<'de> for NumberVisitor {
    type Value = f64;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a number")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
        Ok(v as f64)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
        Ok(v as f64)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
        Ok(v)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
        v.trim()
            .parse()
            .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}

struct NumberListVisitor;

impl<'de> Visitor<'de> for NumberListVisitor {
    type Value = Vec<f64>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a number or a list of numbers")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        NumberVisitor.visit_i64(v).map(|n| vec![n])
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        NumberVisitor.visit_u64(v).map(|n| vec![n])
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Ok(vec![v])
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        if v.trim().is_empty() {
            return Ok(Vec::new());
        }
        v.split(',').map(|part| NumberVisitor.visit_str(part)).collect()
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut values = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(Number(n)) = seq.next_element()? {
            values.push(n);
        }
        Ok(values)
    }
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            num_groups: default_num_groups(),
            group_names: GroupNames::default(),
            sort_policy: SortPolicy::default(),
        }
    }
}

impl Default for StatRanges {
    fn default() -> Self {
        Self {
            uplift_pct: default_uplift_pct(),
            power_pct: default_power_pct(),
            confidence_pct: default_confidence_pct(),
        }
    }
}

impl Default for GroupNames {
    fn default() -> Self {
        Self(vec!["High".into(), "Medium".into(), "Low".into()])
    }
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            audience_strategy: default_audience_strategy(),
            experiment_seed: default_experiment_seed(),
            seed_policy: SeedPolicy::default(),
            uplift: default_selected_uplift(),
            power: default_selected_power(),
            ci_level: default_selected_ci_level(),
            single_group_slice: 0,
        }
    }
}

impl Default for SignificanceConfig {
    fn default() -> Self {
        Self {
            confidence_levels: default_confidence_levels(),
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            grouping: GroupingConfig::default(),
            ranges: StatRanges::default(),
            cohorts: CohortConfig::default(),
            significance: SignificanceConfig::default(),
        }
    }
}

impl StatRanges {
    /// Validated ranges. Empty ranges are allowed and simply yield no plan rows.
    pub fn new(
        uplift_pct: Vec<f64>,
        power_pct: Vec<f64>,
        confidence_pct: Vec<f64>,
    ) -> AudienceResult<Self> {
        let ranges = Self {
            uplift_pct,
            power_pct,
            confidence_pct,
        };
        ranges.validate()?;
        Ok(ranges)
    }

    pub fn validate(&self) -> AudienceResult<()> {
        for &uplift in &self.uplift_pct {
            if !uplift.is_finite() || uplift <= -100.0 {
                return Err(AudienceError::Config(format!(
                    "uplift must be a finite percentage above -100, got {uplift}"
                )));
            }
        }
        check_open_percent("power", &self.power_pct)?;
        check_open_percent("confidence", &self.confidence_pct)
    }

    /// Number of (uplift, power, confidence) combinations.
    pub fn combinations(&self) -> usize {
        self.uplift_pct.len() * self.power_pct.len() * self.confidence_pct.len()
    }
}

fn check_open_percent(name: &str, values: &[f64]) -> AudienceResult<()> {
    match values.iter().find(|v| !(**v > 0.0 && **v < 100.0)) {
        Some(bad) => Err(AudienceError::Config(format!(
            "{name} must lie strictly between 0 and 100 percent, got {bad}"
        ))),
        None => Ok(()),
    }
}

impl GroupNames {
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> AudienceResult<Self> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if let Some(pos) = names.iter().position(|n| n.trim().is_empty()) {
            return Err(AudienceError::Config(format!(
                "group {pos} has an empty audience name"
            )));
        }
        Ok(Self(names))
    }

    pub fn name(&self, group_number: u32) -> AudienceResult<&str> {
        self.0
            .get(group_number as usize)
            .map(String::as_str)
            .ok_or(AudienceError::UnmappedGroup(group_number))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PlannerConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(path: Option<&str>) -> AudienceResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("PROPENSITY_PLANNER")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("grouping.group_names")
                .with_list_parse_key("ranges.uplift_pct")
                .with_list_parse_key("ranges.power_pct")
                .with_list_parse_key("ranges.confidence_pct")
                .with_list_parse_key("significance.confidence_levels"),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        debug!(
            num_groups = config.grouping.num_groups,
            combinations = config.ranges.combinations(),
            strategy = config.cohorts.audience_strategy.id(),
            seed_policy = ?config.cohorts.seed_policy,
            "planner configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> AudienceResult<()> {
        let result = self.check();
        if let Err(e) = &result {
            warn!(error = %e, "invalid planner configuration");
        }
        result
    }

    fn check(&self) -> AudienceResult<()> {
        if self.grouping.num_groups == 0 {
            return Err(AudienceError::Config("num_groups must be at least 1".into()));
        }
        if self.grouping.group_names.len() < self.grouping.num_groups as usize {
            return Err(AudienceError::UnmappedGroup(
                self.grouping.group_names.len() as u32,
            ));
        }
        GroupNames::new(self.grouping.group_names.0.iter().cloned())?;
        self.ranges.validate()?;

        let cohorts = &self.cohorts;
        StatRanges::new(vec![cohorts.uplift], vec![cohorts.power], vec![cohorts.ci_level])?;
        if cohorts.single_group_slice >= self.grouping.num_groups {
            return Err(AudienceError::Config(format!(
                "single_group_slice {} is outside {} groups",
                cohorts.single_group_slice, self.grouping.num_groups
            )));
        }

        if let Some(bad) = self
            .significance
            .confidence_levels
            .iter()
            .find(|c| !(**c > 0.0 && **c < 1.0))
        {
            return Err(AudienceError::Config(format!(
                "significance confidence levels are proportions in (0, 1), got {bad}"
            )));
        }
        Ok(())
    }
}
