//! Minimum sample size for a chi-squared test of proportions.
//!
//! The experiment is treated as a two-bin goodness-of-fit test
//! ({converted, not converted}) with Cohen's w as effect size. With one
//! degree of freedom the noncentral chi-squared tail reduces to two
//! normal tails, so the power curve is evaluated with a standard normal
//! and solved for the number of observations by bisection.

use propensity_core::{AudienceError, AudienceResult};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

/// Beyond this the experiment is unrunnable and the size is reported as undefined.
const MAX_NOBS: f64 = 1e12;
const MAX_BISECTIONS: usize = 200;

/// Cohen's w between the null `{p0, 1-p0}` and alternative `{p1, 1-p1}`.
///
/// Non-finite when `p0` is 0 or 1.
pub fn effect_size(p0: f64, p1: f64) -> f64 {
    let diff = p1 - p0;
    (diff * diff / p0 + diff * diff / (1.0 - p0)).sqrt()
}

/// Power of a two-bin chi-squared goodness-of-fit test.
pub fn chisquare_power(effect_size: f64, nobs: f64, alpha: f64) -> AudienceResult<f64> {
    let normal = standard_normal()?;
    let z = normal.inverse_cdf(1.0 - alpha / 2.0);
    Ok(power_at(&normal, effect_size, nobs, z))
}

fn power_at(normal: &Normal, effect_size: f64, nobs: f64, z: f64) -> f64 {
    let shift = effect_size * nobs.sqrt();
    normal.cdf(shift - z) + normal.cdf(-shift - z)
}

fn standard_normal() -> AudienceResult<Normal> {
    Normal::new(0.0, 1.0).map_err(|e| AudienceError::Stats(e.to_string()))
}

/// Minimum per-arm sample size to detect `uplift_pct` relative uplift on
/// `baseline_pct` conversion rate at the given power and confidence.
///
/// Returns `Ok(None)` when the test is undefined for the inputs (a baseline
/// of 0 or 100, a NaN baseline, zero uplift, or an alternative proportion
/// above 1). Power and confidence outside (0, 100) are configuration errors.
pub fn required_sample_size(
    baseline_pct: f64,
    uplift_pct: f64,
    power_pct: f64,
    confidence_pct: f64,
) -> AudienceResult<Option<u64>> {
    if !(power_pct > 0.0 && power_pct < 100.0) {
        return Err(AudienceError::Config(format!(
            "power must lie strictly between 0 and 100 percent, got {power_pct}"
        )));
    }
    if !(confidence_pct > 0.0 && confidence_pct < 100.0) {
        return Err(AudienceError::Config(format!(
            "confidence must lie strictly between 0 and 100 percent, got {confidence_pct}"
        )));
    }

    let p0 = baseline_pct / 100.0;
    let p1 = p0 * (100.0 + uplift_pct) / 100.0;
    if !(p0 > 0.0 && p0 < 1.0) || !(0.0..=1.0).contains(&p1) {
        debug!(baseline_pct, uplift_pct, "sample size undefined for proportions");
        return Ok(None);
    }

    let w = effect_size(p0, p1);
    if !w.is_finite() || w <= 0.0 {
        return Ok(None);
    }

    let alpha = (100.0 - confidence_pct) / 100.0;
    let target = power_pct / 100.0;
    let normal = standard_normal()?;
    let z = normal.inverse_cdf(1.0 - alpha / 2.0);

    if power_at(&normal, w, 0.0, z) >= target {
        return Ok(Some(0));
    }

    let mut hi = 1.0_f64;
    while power_at(&normal, w, hi, z) < target {
        hi *= 2.0;
        if hi > MAX_NOBS {
            debug!(baseline_pct, uplift_pct, "sample size beyond solver bound");
            return Ok(None);
        }
    }
    let mut lo = if hi > 1.0 { hi / 2.0 } else { 0.0 };

    for _ in 0..MAX_BISECTIONS {
        if hi - lo <= 1e-9 * hi {
            break;
        }
        let mid = 0.5 * (lo + hi);
        if power_at(&normal, w, mid, z) < target {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    Ok(Some(hi.ceil() as u64))
}
