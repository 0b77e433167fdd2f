use serde::{Deserialize, Deserializer, Serialize};

use crate::error::AudienceError;

/// One scored visitor-visit, as produced by the external scoring step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredVisitor {
    #[serde(rename = "fullvisitorid")]
    pub visitor_id: String,
    /// Model-predicted probability of a return purchase.
    pub score: f64,
    #[serde(default, rename = "predicted_score_label")]
    pub predicted_label: bool,
    /// Observed outcome. Known for reference-period and evaluated data only.
    #[serde(default)]
    pub label: bool,

    #[serde(default)]
    pub bounces: u32,
    #[serde(default)]
    pub revenue: f64,
    #[serde(default)]
    pub product_clicks: u32,
    #[serde(default)]
    pub product_views: u32,
    #[serde(default)]
    pub added_to_cart: u32,
    #[serde(default)]
    pub pageviews: u32,
    #[serde(default)]
    pub hits: u32,
    #[serde(default)]
    pub time_on_site: f64,

    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub medium: String,
    #[serde(default, rename = "deviceCategory")]
    pub device: String,
    #[serde(default)]
    pub browser: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, rename = "channelGrouping")]
    pub channel: String,
    #[serde(default)]
    pub last_action: String,
    /// 1 = Sunday .. 7 = Saturday.
    #[serde(default)]
    pub day_of_week: Option<u8>,
    #[serde(default)]
    pub hour: Option<u8>,
}

impl ScoredVisitor {
    /// Minimal visitor with only identity, score and outcome set.
    pub fn new(visitor_id: impl Into<String>, score: f64, label: bool) -> Self {
        Self {
            visitor_id: visitor_id.into(),
            score,
            predicted_label: score >= 0.5,
            label,
            bounces: 0,
            revenue: 0.0,
            product_clicks: 0,
            product_views: 0,
            added_to_cart: 0,
            pageviews: 0,
            hits: 0,
            time_on_site: 0.0,
            source: String::new(),
            medium: String::new(),
            device: String::new(),
            browser: String::new(),
            os: String::new(),
            channel: String::new(),
            last_action: String::new(),
            day_of_week: None,
            hour: None,
        }
    }
}

/// A visitor tagged with its propensity group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedVisitor {
    /// 0 = highest propensity.
    pub group_number: u32,
    /// Position in the descending score ranking.
    pub row_number: usize,
    #[serde(flatten)]
    pub visitor: ScoredVisitor,
}

/// serde_json writes `NaN` as `null`; read it back as `NaN`.
fn nan_if_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Aggregate KPIs of one propensity group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiSummary {
    pub group_number: u32,
    pub total_visitors: u64,
    pub conversions: u64,
    /// Lowest score among converters; `None` when the group has none.
    pub min_score: Option<f64>,
    /// Percentages. `NaN` when the denominator is zero, `null` in JSON.
    #[serde(deserialize_with = "nan_if_null")]
    pub conversion_rate: f64,
    #[serde(deserialize_with = "nan_if_null")]
    pub ctr: f64,
    #[serde(deserialize_with = "nan_if_null")]
    pub bounce_rate: f64,
    pub clicks: u64,
    pub views: u64,
    pub bounces: u64,
    pub revenue: f64,
}

/// How many propensity groups take part in the experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AudienceStrategy {
    /// Test/control cohorts in every propensity group.
    MultiGroup = 1,
    /// One audience made of the cumulative top-K groups.
    SingleGroup = 2,
}

impl AudienceStrategy {
    pub fn id(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for AudienceStrategy {
    type Error = AudienceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::MultiGroup),
            2 => Ok(Self::SingleGroup),
            other => Err(AudienceError::Config(format!(
                "unknown audience strategy {other}, expected 1 or 2"
            ))),
        }
    }
}

impl From<AudienceStrategy> for u8 {
    fn from(strategy: AudienceStrategy) -> Self {
        strategy.id()
    }
}

/// Required sample size for one (group, uplift, power, confidence) combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSizePlan {
    pub audience_strategy: AudienceStrategy,
    /// For single-group plans the slice covers groups `0..=group_number`.
    pub group_number: u32,
    pub group_size: u64,
    /// Share of the whole population in the slice; single-group plans only.
    #[serde(default)]
    pub group_size_proportion: Option<f64>,
    pub group_min_propensity: Option<f64>,
    #[serde(deserialize_with = "nan_if_null")]
    pub group_conv_rate: f64,
    #[serde(deserialize_with = "nan_if_null")]
    pub ctr: f64,
    pub revenue: f64,
    #[serde(deserialize_with = "nan_if_null")]
    pub bounce_rate: f64,
    pub uplift: f64,
    pub power: f64,
    pub ci_level: f64,
    /// Per arm. `None` when the conversion rate leaves the test undefined.
    pub required_sample_size: Option<u64>,
}

impl SampleSizePlan {
    /// True when the row describes the given experimental configuration.
    pub fn matches(&self, uplift: f64, power: f64, ci_level: f64) -> bool {
        self.uplift == uplift && self.power == power && self.ci_level == ci_level
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Cohort {
    Test,
    Control,
}

/// A target visitor with its experiment assignment. `cohort == None` means excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortAssignment {
    #[serde(flatten)]
    pub visitor: ScoredVisitor,
    pub group_number: u32,
    pub maudience: String,
    pub cohort: Option<Cohort>,
    pub audience_strategy: AudienceStrategy,
}

impl CohortAssignment {
    pub fn is_excluded(&self) -> bool {
        self.cohort.is_none()
    }
}
