// =============================================================================
// Vote providers — opaque decision endpoints
// =============================================================================
//
// Each provider is a chat-completion-style endpoint that answers with a
// JSON object `{decision, confidence, reasoning}`.  Anything that deviates
// from that contract — transport error, bad JSON, unknown decision —
// downgrades to an ABSTAIN vote rather than failing the ensemble.
// =============================================================================

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::types::VoteDecision;

/// What the ensemble is being asked to decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteCategory {
    Entry,
    Exit,
    Advisory,
}

impl VoteCategory {
    /// Entry and exit decisions move money; advisory ones do not.
    pub fn is_high_stakes(&self) -> bool {
        matches!(self, Self::Entry | Self::Exit)
    }
}

/// A request put to every provider in parallel.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VoteRequest {
    pub symbol: String,
    pub category: VoteCategory,
    /// Free-form context (signal summary, position state) forwarded to the
    /// provider prompt.
    pub context: serde_json::Value,
}

/// One provider's parsed answer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderVote {
    pub decision: VoteDecision,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub reasoning: String,
}

impl ProviderVote {
    pub fn abstain(reason: impl Into<String>) -> Self {
        Self {
            decision: VoteDecision::Abstain,
            confidence: 0.0,
            reasoning: reason.into(),
        }
    }
}

/// Backend-agnostic provider seam. Implemented by the HTTP client in
/// production and by scripted providers in tests.
#[async_trait]
pub trait VoteProvider: Send + Sync {
    fn name(&self) -> &str;
    fn base_weight(&self) -> f64;
    async fn vote(&self, request: &VoteRequest) -> ProviderVote;
}

/// Parse a provider's answer text into a vote. Any deviation from the
/// contract is an abstention.
pub fn parse_vote_payload(text: &str) -> ProviderVote {
    // Providers sometimes wrap the object in prose or code fences; take the
    // outermost braces.
    let candidate = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => return ProviderVote::abstain("no JSON object in response"),
    };

    let value: serde_json::Value = match serde_json::from_str(candidate) {
        Ok(v) => v,
        Err(e) => return ProviderVote::abstain(format!("malformed JSON: {e}")),
    };

    let Some(decision) = value["decision"].as_str().and_then(VoteDecision::parse) else {
        return ProviderVote::abstain("missing or unknown decision");
    };

    let confidence = value["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);
    let reasoning = value["reasoning"].as_str().unwrap_or("").to_string();

    ProviderVote {
        decision,
        confidence,
        reasoning,
    }
}

/// HTTP-backed provider speaking the chat-completion shape.
pub struct HttpVoteProvider {
    name: String,
    url: String,
    api_key: Option<String>,
    base_weight: f64,
    client: reqwest::Client,
}

impl HttpVoteProvider {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        api_key: Option<String>,
        base_weight: f64,
        timeout: std::time::Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self {
            name: name.into(),
            url: url.into(),
            api_key,
            base_weight,
            client,
        }
    }
}

#[async_trait]
impl VoteProvider for HttpVoteProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_weight(&self) -> f64 {
        self.base_weight
    }

    async fn vote(&self, request: &VoteRequest) -> ProviderVote {
        let body = json!({
            "messages": [{
                "role": "user",
                "content": format!(
                    "Decide for {} ({:?}). Respond with a JSON object \
                     {{\"decision\": \"BUY|SELL|HOLD|ABSTAIN\", \"confidence\": 0.0, \
                     \"reasoning\": \"...\"}}.\nContext: {}",
                    request.symbol, request.category, request.context
                ),
            }],
        });

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(provider = %self.name, error = %e, "vote request failed");
                return ProviderVote::abstain(format!("transport error: {e}"));
            }
        };

        if !resp.status().is_success() {
            return ProviderVote::abstain(format!("status {}", resp.status().as_u16()));
        }

        let payload: serde_json::Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => return ProviderVote::abstain(format!("bad response body: {e}")),
        };

        // Chat-completion shape: choices[0].message.content holds the text.
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("");
        let vote = parse_vote_payload(content);
        debug!(provider = %self.name, decision = %vote.decision, "provider vote parsed");
        vote
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_payload() {
        let vote = parse_vote_payload(
            r#"{ "decision": "BUY", "confidence": 0.72, "reasoning": "trend up" }"#,
        );
        assert_eq!(vote.decision, VoteDecision::Buy);
        assert!((vote.confidence - 0.72).abs() < 1e-9);
        assert_eq!(vote.reasoning, "trend up");
    }

    #[test]
    fn parses_payload_wrapped_in_prose() {
        let vote = parse_vote_payload(
            "Sure, here is my answer:\n```json\n{\"decision\": \"sell\", \"confidence\": 0.5, \"reasoning\": \"x\"}\n```",
        );
        assert_eq!(vote.decision, VoteDecision::Sell);
    }

    #[test]
    fn deviations_downgrade_to_abstain() {
        assert_eq!(
            parse_vote_payload("no json here").decision,
            VoteDecision::Abstain
        );
        assert_eq!(
            parse_vote_payload("{ not valid json }").decision,
            VoteDecision::Abstain
        );
        assert_eq!(
            parse_vote_payload(r#"{ "decision": "YOLO", "confidence": 1.0 }"#).decision,
            VoteDecision::Abstain
        );
        assert_eq!(
            parse_vote_payload(r#"{ "confidence": 1.0 }"#).decision,
            VoteDecision::Abstain
        );
    }

    #[test]
    fn confidence_is_clamped() {
        let vote = parse_vote_payload(r#"{ "decision": "HOLD", "confidence": 7.5 }"#);
        assert_eq!(vote.decision, VoteDecision::Hold);
        assert!((vote.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn high_stakes_categories() {
        assert!(VoteCategory::Entry.is_high_stakes());
        assert!(VoteCategory::Exit.is_high_stakes());
        assert!(!VoteCategory::Advisory.is_high_stakes());
    }
}
