// =============================================================================
// Signal Fusion — weighted consensus with provenance
// =============================================================================
//
// Combines per-source biases into a single net bias and position-size
// multiplier.  Every fusion carries full provenance: which sources
// contributed, at what weight and confidence, which one dominated, and a
// deterministic hash of the inputs so identical evidence always produces
// an identical, attributable decision.
// =============================================================================

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::Bias;

/// Net-bias thresholds on the normalized score.
const BIAS_THRESHOLD: f64 = 0.2;
/// Confidence reported when every source was unavailable.
const NO_SOURCE_CONFIDENCE: f64 = 10.0;

/// One source's input to a fusion. A source with `bias = None` was skipped
/// (offline, disabled, or no data) and is recorded but not counted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSignal {
    pub source_id: String,
    pub bias: Option<Bias>,
    /// Confidence in [0, 100].
    pub confidence: f64,
    /// Weight in [0, 1].
    pub weight: f64,
    /// Why the source was skipped, when it was.
    #[serde(default)]
    pub skip_reason: Option<String>,
}

/// A counted source's contribution to the final score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceContribution {
    pub source_id: String,
    pub bias: Bias,
    pub confidence: f64,
    pub weight: f64,
    pub contribution: f64,
}

/// A source that was present but not counted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedSource {
    pub source_id: String,
    pub reason: String,
}

/// Attributable record of which inputs produced the decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub contributing: Vec<SourceContribution>,
    pub skipped: Vec<SkippedSource>,
    /// Source with the largest absolute contribution.
    pub primary_source: Option<String>,
    /// Deterministic SHA-256 over the counted inputs.
    pub fusion_hash: String,
}

/// Output of one fusion pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionResult {
    pub net_bias: Bias,
    /// Normalized score in roughly [-1, 1].
    pub score: f64,
    /// Weighted average confidence of counted sources, [0, 100].
    pub confidence: f64,
    pub position_size_multiplier: f64,
    pub trading_allowed: bool,
    pub reason: Option<String>,
    pub provenance: Provenance,
}

/// Fuse per-source biases into a weighted consensus.
///
/// `macro_source` names the source whose RISK_OFF verdict zeroes
/// `trading_allowed` regardless of the net score.
pub fn fuse(signals: &[SourceSignal], macro_source: Option<&str>) -> FusionResult {
    let mut contributing = Vec::new();
    let mut skipped = Vec::new();
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    let mut confidence_weighted = 0.0;
    let mut macro_risk_off = false;

    for signal in signals {
        match signal.bias {
            Some(bias) => {
                let weight = signal.weight.clamp(0.0, 1.0);
                let confidence = signal.confidence.clamp(0.0, 100.0);
                let contribution = bias.score() * weight * (confidence / 100.0);

                if macro_source == Some(signal.source_id.as_str()) && bias == Bias::RiskOff {
                    macro_risk_off = true;
                }

                contributing.push(SourceContribution {
                    source_id: signal.source_id.clone(),
                    bias,
                    confidence,
                    weight,
                    contribution,
                });
                weighted_sum += contribution;
                weight_total += weight;
                confidence_weighted += confidence * weight;
            }
            None => {
                skipped.push(SkippedSource {
                    source_id: signal.source_id.clone(),
                    reason: signal
                        .skip_reason
                        .clone()
                        .unwrap_or_else(|| "unavailable".to_string()),
                });
            }
        }
    }

    let fusion_hash = hash_inputs(&contributing);

    // No counted sources: stay tradable at low confidence rather than
    // silently freezing a fleet on a flaky signal plane.
    if contributing.is_empty() || weight_total <= f64::EPSILON {
        return FusionResult {
            net_bias: Bias::Neutral,
            score: 0.0,
            confidence: NO_SOURCE_CONFIDENCE,
            position_size_multiplier: 1.0,
            trading_allowed: true,
            reason: Some("all signal sources unavailable".to_string()),
            provenance: Provenance {
                contributing,
                skipped,
                primary_source: None,
                fusion_hash,
            },
        };
    }

    let score = weighted_sum / weight_total;
    let confidence = confidence_weighted / weight_total;

    let net_bias = if score > BIAS_THRESHOLD {
        Bias::Bullish
    } else if score < -BIAS_THRESHOLD {
        Bias::Bearish
    } else {
        Bias::Neutral
    };

    let primary_source = contributing
        .iter()
        .max_by(|a, b| {
            a.contribution
                .abs()
                .partial_cmp(&b.contribution.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|c| c.source_id.clone());

    let (trading_allowed, reason, multiplier) = if macro_risk_off {
        (
            false,
            Some("macro source reports RISK_OFF".to_string()),
            0.0,
        )
    } else {
        (true, None, (0.5 + score.abs()).min(1.5))
    };

    FusionResult {
        net_bias,
        score,
        confidence,
        position_size_multiplier: multiplier,
        trading_allowed,
        reason,
        provenance: Provenance {
            contributing,
            skipped,
            primary_source,
            fusion_hash,
        },
    }
}

/// Deterministic digest of the counted inputs, independent of float
/// formatting noise: fixed-precision rendering, input order preserved.
fn hash_inputs(contributing: &[SourceContribution]) -> String {
    let mut hasher = Sha256::new();
    for c in contributing {
        hasher.update(c.source_id.as_bytes());
        hasher.update(format!("|{}|{:.6}|{:.6};", c.bias, c.weight, c.confidence).as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    fn signal(id: &str, bias: Bias, confidence: f64, weight: f64) -> SourceSignal {
        SourceSignal {
            source_id: id.to_string(),
            bias: Some(bias),
            confidence,
            weight,
            skip_reason: None,
        }
    }

    fn skipped(id: &str) -> SourceSignal {
        SourceSignal {
            source_id: id.to_string(),
            bias: None,
            confidence: 0.0,
            weight: 0.0,
            skip_reason: Some("provider offline".to_string()),
        }
    }

    #[test]
    fn unanimous_bullish_crosses_threshold() {
        let result = fuse(
            &[
                signal("trend", Bias::Bullish, 80.0, 0.5),
                signal("momentum", Bias::Bullish, 60.0, 0.5),
            ],
            None,
        );
        assert_eq!(result.net_bias, Bias::Bullish);
        assert!(result.score > BIAS_THRESHOLD);
        assert!(result.trading_allowed);
        assert!(result.position_size_multiplier > 1.0);
    }

    #[test]
    fn opposing_sources_net_neutral() {
        let result = fuse(
            &[
                signal("a", Bias::Bullish, 70.0, 0.5),
                signal("b", Bias::Bearish, 70.0, 0.5),
            ],
            None,
        );
        assert_eq!(result.net_bias, Bias::Neutral);
        assert!(result.score.abs() < 1e-9);
    }

    #[test]
    fn macro_risk_off_blocks_trading() {
        let result = fuse(
            &[
                signal("trend", Bias::Bullish, 90.0, 0.6),
                signal("macro", Bias::RiskOff, 80.0, 0.4),
            ],
            Some("macro"),
        );
        assert!(!result.trading_allowed);
        assert_eq!(result.position_size_multiplier, 0.0);
        assert!(result.reason.unwrap().contains("RISK_OFF"));
    }

    #[test]
    fn risk_off_from_non_macro_source_does_not_block() {
        let result = fuse(&[signal("other", Bias::RiskOff, 80.0, 1.0)], Some("macro"));
        assert!(result.trading_allowed);
    }

    #[test]
    fn skipped_sources_recorded_not_counted() {
        let result = fuse(
            &[
                signal("trend", Bias::Bullish, 100.0, 0.5),
                skipped("news"),
            ],
            None,
        );
        assert_eq!(result.provenance.contributing.len(), 1);
        assert_eq!(result.provenance.skipped.len(), 1);
        assert_eq!(result.provenance.skipped[0].reason, "provider offline");
        // Score normalized by counted weight only.
        assert!((result.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn all_unavailable_stays_tradable_with_reason() {
        let result = fuse(&[skipped("a"), skipped("b")], None);
        assert!(result.trading_allowed);
        assert_eq!(result.net_bias, Bias::Neutral);
        assert!((result.confidence - NO_SOURCE_CONFIDENCE).abs() < 1e-9);
        assert!(result.reason.unwrap().contains("unavailable"));
    }

    #[test]
    fn primary_source_is_largest_contributor() {
        let result = fuse(
            &[
                signal("small", Bias::Bullish, 40.0, 0.2),
                signal("big", Bias::Bearish, 90.0, 0.8),
            ],
            None,
        );
        assert_eq!(result.provenance.primary_source.as_deref(), Some("big"));
    }

    #[test]
    fn fusion_hash_is_deterministic_and_input_sensitive() {
        let inputs = vec![
            signal("a", Bias::Bullish, 70.0, 0.5),
            signal("b", Bias::Bearish, 60.0, 0.5),
        ];
        let first = fuse(&inputs, None);
        let second = fuse(&inputs, None);
        assert_eq!(first.provenance.fusion_hash, second.provenance.fusion_hash);

        let mut changed = inputs.clone();
        changed[0].confidence = 71.0;
        let third = fuse(&changed, None);
        assert_ne!(first.provenance.fusion_hash, third.provenance.fusion_hash);
    }

    #[test]
    fn weighted_normalization_matches_formula() {
        // score = (1*0.6*0.5 + (-1)*0.2*1.0) / 0.8 = (0.3 - 0.2) / 0.8
        let result = fuse(
            &[
                signal("a", Bias::Bullish, 50.0, 0.6),
                signal("b", Bias::Bearish, 100.0, 0.2),
            ],
            None,
        );
        assert!((result.score - 0.125).abs() < 1e-9);
        assert_eq!(result.net_bias, Bias::Neutral);
    }
}
