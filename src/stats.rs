//! Two-proportion z-test for comparing experiment variants.

use serde::{Deserialize, Serialize};

const Z_CRITICAL_95: f64 = 1.96;
const Z_POWER_80: f64 = 0.84;
const DEGENERATE_SE: f64 = 0.0001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantStats {
    pub name: String,
    pub conversions: u64,
    pub total: u64,
    pub rate: f64,
}

impl VariantStats {
    pub fn new(name: impl Into<String>, conversions: u64, total: u64) -> Self {
        let rate = if total > 0 {
            conversions as f64 / total as f64
        } else {
            0.0
        };
        Self {
            name: name.into(),
            conversions,
            total,
            rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignificanceResult {
    pub variant: String,
    pub significant: bool,
    pub p_value: f64,
    pub z_score: f64,
    /// Relative lift of the variant over control, in percent.
    pub lift: f64,
    pub confidence_interval: (f64, f64),
    pub winner: Option<String>,
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSummary {
    pub summary: String,
    pub results: Vec<SignificanceResult>,
    pub winner: Option<String>,
    pub overall_recommendation: String,
}

/// Standard normal CDF via the Abramowitz-Stegun 7.1.26 erf approximation.
pub fn normal_cdf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs() / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    0.5 * (1.0 + sign * y)
}

/// Compares `variant` against `control` at `confidence_level` (e.g. 0.95).
pub fn calculate_significance(
    control: &VariantStats,
    variant: &VariantStats,
    confidence_level: f64,
) -> SignificanceResult {
    let (n1, n2) = (control.total, variant.total);
    if n1 == 0 || n2 == 0 {
        return SignificanceResult {
            variant: variant.name.clone(),
            significant: false,
            p_value: 1.0,
            z_score: 0.0,
            lift: 0.0,
            confidence_interval: (0.0, 0.0),
            winner: None,
            recommendation: "Insufficient data to determine significance".to_string(),
        };
    }

    let (p1, p2) = (control.rate, variant.rate);
    let (n1, n2) = (n1 as f64, n2 as f64);

    let pooled = (control.conversions + variant.conversions) as f64 / (n1 + n2);
    let se = if pooled <= 0.0 || pooled >= 1.0 {
        DEGENERATE_SE
    } else {
        (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt()
    };

    let z = (p2 - p1) / se;
    let p_value = (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0);

    let se_diff = (p1 * (1.0 - p1) / n1 + p2 * (1.0 - p2) / n2).sqrt();
    let diff = p2 - p1;
    let confidence_interval = (diff - Z_CRITICAL_95 * se_diff, diff + Z_CRITICAL_95 * se_diff);

    let lift = if p1 > 0.0 { diff / p1 * 100.0 } else { 0.0 };
    let significant = p_value < 1.0 - confidence_level;

    let (winner, recommendation) = if significant {
        let lift_text = format!("{:.1}", lift.abs());
        if p2 > p1 {
            (
                Some(variant.name.clone()),
                format!(
                    "{} outperforms {} by {}%. Consider adopting the variant.",
                    variant.name, control.name, lift_text
                ),
            )
        } else {
            (
                Some(control.name.clone()),
                format!(
                    "{} outperforms {} by {}%. Keep the control.",
                    control.name, variant.name, lift_text
                ),
            )
        }
    } else {
        (
            None,
            "No statistically significant difference detected. Need more data or the variants perform similarly."
                .to_string(),
        )
    };

    SignificanceResult {
        variant: variant.name.clone(),
        significant,
        p_value,
        z_score: z,
        lift,
        confidence_interval,
        winner,
        recommendation,
    }
}

/// Minimum per-arm sample size to detect a relative lift at 80% power, two-tailed 95%.
///
/// Returns `None` when the effect is zero or the baseline is outside `(0, 1)`.
pub fn required_sample_size(baseline_rate: f64, minimum_detectable_effect: f64) -> Option<u64> {
    if !(baseline_rate > 0.0 && baseline_rate < 1.0) || minimum_detectable_effect == 0.0 {
        return None;
    }
    let p1 = baseline_rate;
    let p2 = baseline_rate * (1.0 + minimum_detectable_effect);
    if !(0.0..=1.0).contains(&p2) {
        return None;
    }

    let pooled = (p1 + p2) / 2.0;
    let numerator = (Z_CRITICAL_95 * (2.0 * pooled * (1.0 - pooled)).sqrt()
        + Z_POWER_80 * (p1 * (1.0 - p1) + p2 * (1.0 - p2)).sqrt())
    .powi(2);
    let denominator = (p2 - p1).powi(2);
    Some((numerator / denominator).ceil() as u64)
}

/// Runs every variant against control and picks an overall winner.
///
/// When several variants beat control, the one with the largest lift wins.
pub fn summarize_experiment(control: &VariantStats, variants: &[VariantStats]) -> ExperimentSummary {
    let results: Vec<SignificanceResult> = variants
        .iter()
        .map(|variant| calculate_significance(control, variant, 0.95))
        .collect();

    let winners: Vec<&SignificanceResult> = results
        .iter()
        .filter(|result| result.significant && result.winner.as_deref().is_some_and(|name| name != control.name))
        .collect();

    let (winner, overall_recommendation) = match winners.as_slice() {
        [] => (
            None,
            "No variants significantly outperform the control. Continue testing or keep current approach.".to_string(),
        ),
        [single] => (
            single.winner.clone(),
            format!(
                "{} is the clear winner. Consider implementing this variant.",
                single.winner.as_deref().unwrap_or_default()
            ),
        ),
        many => {
            let best = many
                .iter()
                .copied()
                .max_by(|a, b| a.lift.total_cmp(&b.lift))
                .and_then(|result| result.winner.clone());
            let best_lift = many.iter().map(|result| result.lift).fold(f64::MIN, f64::max);
            (
                best.clone(),
                format!(
                    "Multiple winning variants. {} has the highest lift ({:.1}%).",
                    best.unwrap_or_default(),
                    best_lift
                ),
            )
        }
    };

    let mut lines = vec![
        "Experiment Results:".to_string(),
        format!(
            "- Control: {} ({:.2}% conversion, n={})",
            control.name,
            control.rate * 100.0,
            control.total
        ),
    ];
    for (variant, result) in variants.iter().zip(&results) {
        lines.push(format!(
            "- {}: {:.2}% conversion, n={}, lift={:.1}%",
            variant.name,
            variant.rate * 100.0,
            variant.total,
            result.lift
        ));
    }

    ExperimentSummary {
        summary: lines.join("\n"),
        results,
        winner,
        overall_recommendation,
    }
}
