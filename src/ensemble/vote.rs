// =============================================================================
// Ensemble Vote — multi-provider weighted voting with conflict detection
// =============================================================================
//
// Queries all providers in parallel under a per-provider timeout, tallies
// the weighted votes, and surfaces conflicts instead of papering over
// them.  High-stakes categories (entry/exit) only execute on strong,
// conflict-free agreement.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use super::provider::{ProviderVote, VoteProvider, VoteRequest};
use crate::types::VoteDecision;

/// Exponential decay applied to provider accuracy on each outcome.
const ACCURACY_DECAY: f64 = 0.95;
/// Agreement strength below this fails a required supermajority.
const SUPERMAJORITY_STRENGTH: f64 = 0.67;
/// High-stakes execution requires at least this agreement strength.
const EXECUTION_STRENGTH: f64 = 0.6;
/// Margin between the top two decisions below which the vote is split.
const SPLIT_MARGIN: f64 = 0.1;
/// Average confidence below this raises a LOW_CONFIDENCE conflict.
const LOW_CONFIDENCE_AVG: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    SplitDecision,
    LowConfidence,
    TimeoutDegraded,
    SupermajorityFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictSeverity {
    High,
    Medium,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub severity: ConflictSeverity,
    pub detail: String,
}

/// One provider's vote as recorded in the result.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedVote {
    pub provider: String,
    pub decision: VoteDecision,
    pub confidence: f64,
    pub weight: f64,
    pub reasoning: String,
}

/// Outcome of one ensemble query.
#[derive(Debug, Clone, Serialize)]
pub struct EnsembleResult {
    pub consensus: VoteDecision,
    /// Share of counted weight behind the consensus, [0, 1].
    pub agreement_strength: f64,
    pub avg_confidence: f64,
    pub votes: Vec<RecordedVote>,
    pub conflicts: Vec<Conflict>,
    pub should_execute: bool,
}

/// Multi-provider voting engine with per-provider accuracy tracking.
pub struct Ensemble {
    providers: Vec<Arc<dyn VoteProvider>>,
    per_provider_timeout: Duration,
    supermajority_required: bool,
    accuracy: RwLock<HashMap<String, f64>>,
}

impl Ensemble {
    pub fn new(
        providers: Vec<Arc<dyn VoteProvider>>,
        per_provider_timeout: Duration,
        supermajority_required: bool,
    ) -> Self {
        Self {
            providers,
            per_provider_timeout,
            supermajority_required,
            accuracy: RwLock::new(HashMap::new()),
        }
    }

    /// Accuracy multiplier for a provider (1.0 until evidence accumulates).
    pub fn accuracy_multiplier(&self, provider: &str) -> f64 {
        self.accuracy.read().get(provider).copied().unwrap_or(1.0)
    }

    /// Update a provider's accuracy with one observed outcome.
    pub fn record_outcome(&self, provider: &str, correct: bool) {
        let mut accuracy = self.accuracy.write();
        let entry = accuracy.entry(provider.to_string()).or_insert(1.0);
        let observation = if correct { 1.0 } else { 0.0 };
        *entry = *entry * ACCURACY_DECAY + observation * (1.0 - ACCURACY_DECAY);
    }

    /// Query every provider in parallel and tally the weighted votes.
    pub async fn vote(&self, request: &VoteRequest) -> EnsembleResult {
        let futures = self.providers.iter().map(|provider| {
            let provider = Arc::clone(provider);
            let request = request.clone();
            let timeout = self.per_provider_timeout;
            async move {
                let vote = match tokio::time::timeout(timeout, provider.vote(&request)).await {
                    Ok(vote) => vote,
                    Err(_) => ProviderVote::abstain("provider timed out"),
                };
                (provider, vote)
            }
        });

        let raw: Vec<(Arc<dyn VoteProvider>, ProviderVote)> = join_all(futures).await;
        self.tally(raw, request)
    }

    fn tally(
        &self,
        raw: Vec<(Arc<dyn VoteProvider>, ProviderVote)>,
        request: &VoteRequest,
    ) -> EnsembleResult {
        let provider_count = raw.len();
        let mut votes = Vec::with_capacity(provider_count);
        let mut tallies: HashMap<VoteDecision, f64> = HashMap::new();
        let mut counted_weight = 0.0;
        let mut confidence_sum = 0.0;
        let mut counted = 0usize;
        let mut abstained = 0usize;

        for (provider, vote) in raw {
            // weight = base * accuracy * (0.3 + 0.7 * confidence)
            let weight = provider.base_weight()
                * self.accuracy_multiplier(provider.name())
                * (0.3 + 0.7 * vote.confidence);

            if vote.decision == VoteDecision::Abstain {
                abstained += 1;
                votes.push(RecordedVote {
                    provider: provider.name().to_string(),
                    decision: vote.decision,
                    confidence: vote.confidence,
                    weight: 0.0,
                    reasoning: vote.reasoning,
                });
                continue;
            }

            *tallies.entry(vote.decision).or_insert(0.0) += weight;
            counted_weight += weight;
            confidence_sum += vote.confidence;
            counted += 1;

            votes.push(RecordedVote {
                provider: provider.name().to_string(),
                decision: vote.decision,
                confidence: vote.confidence,
                weight,
                reasoning: vote.reasoning,
            });
        }

        let mut conflicts = Vec::new();

        // Everyone abstained or errored: nothing to execute.
        if counted == 0 || counted_weight <= f64::EPSILON {
            conflicts.push(Conflict {
                kind: ConflictKind::TimeoutDegraded,
                severity: ConflictSeverity::High,
                detail: format!("{abstained}/{provider_count} providers abstained or failed"),
            });
            return EnsembleResult {
                consensus: VoteDecision::Hold,
                agreement_strength: 0.0,
                avg_confidence: 0.0,
                votes,
                conflicts,
                should_execute: false,
            };
        }

        // Highest-weight decision wins; ties break deterministically by
        // decision name so identical tallies give identical output.
        let mut ranked: Vec<(VoteDecision, f64)> = tallies.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.as_str().cmp(b.0.as_str()))
        });

        let (mut consensus, top_weight) = ranked[0];
        let mut agreement_strength = top_weight / counted_weight;
        let avg_confidence = confidence_sum / counted as f64;

        if ranked.len() > 1 {
            let margin = (ranked[0].1 - ranked[1].1) / counted_weight;
            if margin < SPLIT_MARGIN {
                conflicts.push(Conflict {
                    kind: ConflictKind::SplitDecision,
                    severity: ConflictSeverity::High,
                    detail: format!("margin {margin:.3} between {} and {}", ranked[0].0, ranked[1].0),
                });
            }
        }

        if avg_confidence < LOW_CONFIDENCE_AVG {
            conflicts.push(Conflict {
                kind: ConflictKind::LowConfidence,
                severity: ConflictSeverity::Medium,
                detail: format!("average confidence {avg_confidence:.2}"),
            });
        }

        if abstained * 2 >= provider_count && provider_count > 0 {
            conflicts.push(Conflict {
                kind: ConflictKind::TimeoutDegraded,
                severity: ConflictSeverity::High,
                detail: format!("{abstained}/{provider_count} providers abstained or failed"),
            });
        }

        if self.supermajority_required && agreement_strength < SUPERMAJORITY_STRENGTH {
            conflicts.push(Conflict {
                kind: ConflictKind::SupermajorityFailed,
                severity: ConflictSeverity::High,
                detail: format!(
                    "strength {agreement_strength:.3} below {SUPERMAJORITY_STRENGTH}"
                ),
            });
            // A failed supermajority forces HOLD.
            consensus = VoteDecision::Hold;
            agreement_strength = 0.0;
        }

        let has_high_conflict = conflicts
            .iter()
            .any(|c| c.severity == ConflictSeverity::High);

        let should_execute = if request.category.is_high_stakes() {
            consensus != VoteDecision::Hold
                && agreement_strength >= EXECUTION_STRENGTH
                && !has_high_conflict
        } else {
            consensus != VoteDecision::Hold && !has_high_conflict
        };

        if should_execute {
            info!(consensus = %consensus, strength = agreement_strength, "ensemble approved execution");
        } else {
            debug!(consensus = %consensus, conflicts = conflicts.len(), "ensemble blocked execution");
        }

        EnsembleResult {
            consensus,
            agreement_strength,
            avg_confidence,
            votes,
            conflicts,
            should_execute,
        }
    }
}
