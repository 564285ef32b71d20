//! Synthesis: merging provider payloads into one analysis.
//!
//! The coordinator never looks inside payloads; a [`Synthesizer`] is the
//! only component that does. The merge must not depend on the order in
//! which providers settled.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{
    ClosingReason, ClosingRecommendations, ProviderResult, ProviderResults, SessionRecord,
    SynthesisStatus, SynthesizedAnalysis,
};

/// Pluggable merge step.
pub trait Synthesizer: Send + Sync {
    /// Merge the successful results of a settled session. Must return an
    /// `InsufficientData` analysis rather than fail when nothing succeeded.
    fn synthesize(
        &self,
        results: &ProviderResults,
        configured: &[String],
        now: DateTime<Utc>,
    ) -> SynthesizedAnalysis;

    /// Build the closing recommendations for a session about to be finalized.
    fn close(
        &self,
        record: &SessionRecord,
        reason: ClosingReason,
        now: DateTime<Utc>,
    ) -> ClosingRecommendations;
}

/// Default synthesizer: keys each payload by provider name.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeSynthesizer;

/// Payload field a provider may use to contribute closing recommendations.
pub const RECOMMENDATIONS_FIELD: &str = "recommendations";

impl Synthesizer for MergeSynthesizer {
    fn synthesize(
        &self,
        results: &ProviderResults,
        configured: &[String],
        now: DateTime<Utc>,
    ) -> SynthesizedAnalysis {
        let findings: BTreeMap<String, Value> = results
            .successes()
            .map(|(name, payload)| (name.to_string(), payload.clone()))
            .collect();
        let contributors: Vec<String> = findings.keys().cloned().collect();

        let status = if contributors.is_empty() {
            SynthesisStatus::InsufficientData
        } else if contributors.len() >= configured.len() {
            SynthesisStatus::Complete
        } else {
            SynthesisStatus::Partial
        };

        let coverage = if configured.is_empty() {
            0.0
        } else {
            contributors.len() as f64 / configured.len() as f64
        };

        SynthesizedAnalysis {
            status,
            contributors,
            findings,
            coverage,
            synthesized_at: now,
        }
    }

    fn close(
        &self,
        record: &SessionRecord,
        reason: ClosingReason,
        now: DateTime<Utc>,
    ) -> ClosingRecommendations {
        let mut recommendations = BTreeSet::new();

        for outcome in record.provider_results.iter() {
            match &outcome.result {
                ProviderResult::Success { payload } => {
                    let Some(items) = payload.get(RECOMMENDATIONS_FIELD).and_then(Value::as_array)
                    else {
                        continue;
                    };
                    recommendations.extend(items.iter().filter_map(Value::as_str).map(String::from));
                }
                ProviderResult::Failure {
                    reason,
                    recoverable: true,
                } => {
                    recommendations.insert(format!(
                        "Retry {} analysis ({})",
                        outcome.provider, reason
                    ));
                }
                ProviderResult::Failure {
                    reason,
                    recoverable: false,
                } => {
                    recommendations.insert(format!(
                        "Review {} provider configuration ({})",
                        outcome.provider, reason
                    ));
                }
            }
        }

        let insufficient = record
            .synthesized_analysis
            .as_ref()
            .is_none_or(SynthesizedAnalysis::is_insufficient);
        if insufficient {
            recommendations.insert(
                "Insufficient data: re-run the session once providers are available".to_string(),
            );
        }

        if reason == ClosingReason::Shutdown {
            recommendations.insert("Session was closed early by a service shutdown".to_string());
        }

        ClosingRecommendations {
            reason,
            recommendations: recommendations.into_iter().collect(),
            completed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_merge_is_order_independent() {
        let now = Utc::now();
        let mut forward = ProviderResults::new();
        forward.insert_once("a", ProviderResult::success(json!({"x": 1})), now);
        forward.insert_once("b", ProviderResult::success(json!({"y": 2})), now);

        let mut reverse = ProviderResults::new();
        reverse.insert_once("b", ProviderResult::success(json!({"y": 2})), now);
        reverse.insert_once("a", ProviderResult::success(json!({"x": 1})), now);

        let configured = names(&["a", "b"]);
        let one = MergeSynthesizer.synthesize(&forward, &configured, now);
        let two = MergeSynthesizer.synthesize(&reverse, &configured, now);
        assert_eq!(one, two);
        assert_eq!(one.status, SynthesisStatus::Complete);
        assert_eq!(one.coverage, 1.0);
    }

    #[test]
    fn test_partial_excludes_failures() {
        let now = Utc::now();
        let mut results = ProviderResults::new();
        results.insert_once("a", ProviderResult::success(json!(1)), now);
        results.insert_once("b", ProviderResult::timed_out(), now);

        let analysis = MergeSynthesizer.synthesize(&results, &names(&["a", "b"]), now);
        assert_eq!(analysis.status, SynthesisStatus::Partial);
        assert_eq!(analysis.contributors, vec!["a"]);
        assert!(!analysis.findings.contains_key("b"));
        assert_eq!(analysis.coverage, 0.5);
    }

    #[test]
    fn test_zero_successes_is_insufficient_data() {
        let now = Utc::now();
        let mut results = ProviderResults::new();
        results.insert_once("a", ProviderResult::failure("boom", false), now);

        let analysis = MergeSynthesizer.synthesize(&results, &names(&["a"]), now);
        assert!(analysis.is_insufficient());
        assert!(analysis.contributors.is_empty());
        assert_eq!(analysis.coverage, 0.0);
    }

    #[test]
    fn test_closing_recommendations() {
        let now = Utc::now();
        let mut record = SessionRecord::new("subject-1", now, None);
        record.provider_results.insert_once(
            "medical",
            ProviderResult::success(json!({"recommendations": ["Hydrate", "Sleep 8h", 3]})),
            now,
        );
        record
            .provider_results
            .insert_once("biometric", ProviderResult::timed_out(), now);
        record.provider_results.insert_once(
            "culture",
            ProviderResult::failure("bad locale", false),
            now,
        );
        record.synthesized_analysis = Some(MergeSynthesizer.synthesize(
            &record.provider_results,
            &names(&["medical", "biometric", "culture"]),
            now,
        ));

        let closing = MergeSynthesizer.close(&record, ClosingReason::Completed, now);
        assert_eq!(closing.reason, ClosingReason::Completed);
        assert_eq!(
            closing.recommendations,
            vec![
                "Hydrate",
                "Retry biometric analysis (timeout)",
                "Review culture provider configuration (bad locale)",
                "Sleep 8h",
            ]
        );
    }

    #[test]
    fn test_shutdown_closing_without_analysis() {
        let now = Utc::now();
        let record = SessionRecord::new("subject-1", now, None);

        let closing = MergeSynthesizer.close(&record, ClosingReason::Shutdown, now);
        assert_eq!(closing.reason, ClosingReason::Shutdown);
        assert!(closing.recommendations.iter().any(|r| r.starts_with("Insufficient data")));
        assert!(closing.recommendations.iter().any(|r| r.contains("shutdown")));
    }
}
