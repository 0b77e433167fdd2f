//! Behavioural profile of each audience.

use std::collections::{BTreeMap, HashMap};

use propensity_core::{CohortAssignment, ScoredVisitor};
use serde::{Deserialize, Serialize};

pub const ACTION_ADD_TO_CART: &str = "Add product(s) to cart";
pub const ACTION_PRODUCT_DETAIL: &str = "Product detail_views";
pub const ACTION_LIST_CLICK_THROUGH: &str = "Click through of product lists";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub column: String,
    pub mean: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudienceProfile {
    pub maudience: String,
    pub visitors: u64,
    /// Percent of the audience's visitors.
    pub last_action_added_to_cart: f64,
    pub viewed_product_detail: f64,
    pub clicked_through_product_lists: f64,
    pub used_referral: f64,
    pub added_gt_1_to_cart: f64,
    pub weekend_visitors: f64,
    pub bounce_rate: f64,
    pub features: Vec<FeatureSummary>,
    /// Most frequent value per categorical column.
    pub modes: BTreeMap<String, String>,
}

type Numeric = fn(&ScoredVisitor) -> f64;
type Categorical = fn(&ScoredVisitor) -> &str;

const NUMERIC: [(&str, Numeric); 6] = [
    ("hits", |v| v.hits as f64),
    ("product_views", |v| v.product_views as f64),
    ("product_clicks", |v| v.product_clicks as f64),
    ("pageviews", |v| v.pageviews as f64),
    ("added_to_cart", |v| v.added_to_cart as f64),
    ("time_on_site", |v| v.time_on_site),
];

const CATEGORICAL: [(&str, Categorical); 7] = [
    ("source", |v| v.source.as_str()),
    ("medium", |v| v.medium.as_str()),
    ("channelGrouping", |v| v.channel.as_str()),
    ("last_action", |v| v.last_action.as_str()),
    ("browser", |v| v.browser.as_str()),
    ("os", |v| v.os.as_str()),
    ("deviceCategory", |v| v.device.as_str()),
];

/// Profiles ordered by audience name. Excluded visitors count toward their audience.
pub fn audience_profile(rows: &[CohortAssignment]) -> Vec<AudienceProfile> {
    let mut audiences: BTreeMap<&str, Vec<&ScoredVisitor>> = BTreeMap::new();
    for row in rows {
        audiences.entry(row.maudience.as_str()).or_default().push(&row.visitor);
    }
    audiences
        .into_iter()
        .map(|(maudience, visitors)| profile(maudience, &visitors))
        .collect()
}

fn profile(maudience: &str, visitors: &[&ScoredVisitor]) -> AudienceProfile {
    let n = visitors.len() as f64;
    let share = |pred: &dyn Fn(&ScoredVisitor) -> bool| {
        100.0 * visitors.iter().filter(|v| pred(**v)).count() as f64 / n
    };

    let features = NUMERIC
        .iter()
        .map(|(column, value)| FeatureSummary {
            column: column.to_string(),
            mean: visitors.iter().map(|v| value(*v)).sum::<f64>() / n,
            max: visitors.iter().map(|v| value(*v)).fold(f64::NEG_INFINITY, f64::max),
        })
        .collect();

    let modes = CATEGORICAL
        .iter()
        .filter_map(|(column, value)| {
            mode(visitors.iter().map(|v| value(*v))).map(|m| (column.to_string(), m.to_string()))
        })
        .collect();

    AudienceProfile {
        maudience: maudience.to_string(),
        visitors: visitors.len() as u64,
        last_action_added_to_cart: share(&|v| v.last_action == ACTION_ADD_TO_CART),
        viewed_product_detail: share(&|v| v.last_action == ACTION_PRODUCT_DETAIL),
        clicked_through_product_lists: share(&|v| v.last_action == ACTION_LIST_CLICK_THROUGH),
        used_referral: share(&|v| v.medium == "referral"),
        added_gt_1_to_cart: share(&|v| v.added_to_cart > 1),
        weekend_visitors: share(&|v| matches!(v.day_of_week, Some(1) | Some(7))),
        bounce_rate: share(&|v| v.bounces == 1),
        features,
        modes,
    }
}

/// Most frequent non-empty value; ties go to the lexicographically smallest.
fn mode<'a>(values: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for value in values.filter(|v| !v.is_empty()) {
        *counts.entry(value).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(a, ca), (b, cb)| ca.cmp(cb).then_with(|| b.cmp(a)))
        .map(|(value, _)| value)
}
