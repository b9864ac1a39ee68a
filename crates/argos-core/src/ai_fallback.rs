//! Cost-bounded AI extraction fallback.
//!
//! Used only after structural parsing of a fetched document has failed.
//! Providers are tried in priority order. Before each one, the token count
//! and projected cost are estimated and the provider is skipped if the
//! projection exceeds the per-operation budget. Every provider considered
//! leaves an audit entry, skipped ones included.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{AppError, SourceError, SourceErrorKind};
use crate::extraction::{
    AiBudget, AuditOutcome, ExtractionOutcome, ExtractionRequest, ExtractionResult, ProviderAudit,
};
use crate::models::{CrossReference, Record};
use crate::traits::ExtractionProvider;
use crate::util::strip_code_fences;

/// Chooses and invokes extraction providers under a hard cost cap.
#[derive(Clone)]
pub struct AiFallbackDecider {
    providers: Vec<Arc<dyn ExtractionProvider>>,
    budget: AiBudget,
}

impl AiFallbackDecider {
    /// Providers are ordered by priority, then by ascending cost.
    pub fn new(mut providers: Vec<Arc<dyn ExtractionProvider>>, budget: AiBudget) -> Self {
        providers.sort_by(|a, b| {
            let (a, b) = (a.spec(), b.spec());
            a.priority.cmp(&b.priority).then(
                a.cost_per_million_tokens
                    .total_cmp(&b.cost_per_million_tokens),
            )
        });
        Self { providers, budget }
    }

    /// A decider with no providers; every request is skipped.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), AiBudget::default())
    }

    pub fn budget(&self) -> &AiBudget {
        &self.budget
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.spec().name.as_str()).collect()
    }

    /// Try to extract structured fields from content that failed to parse.
    pub async fn maybe_extract(
        &self,
        request: &ExtractionRequest,
        cancel: &CancellationToken,
    ) -> ExtractionOutcome {
        let content = self.budget.prepare(&request.content);
        let estimated_tokens = self.budget.estimate_tokens(&request.content);
        let mut audit = Vec::with_capacity(self.providers.len());
        let mut invoked = false;

        for provider in &self.providers {
            let spec = provider.spec();
            let estimated_cost_usd = spec.estimate_cost(estimated_tokens);
            let entry = |outcome| ProviderAudit {
                provider: spec.name.clone(),
                estimated_tokens,
                estimated_cost_usd,
                outcome,
            };

            if estimated_cost_usd > self.budget.max_cost_usd {
                let err = AppError::AiBudgetExceeded {
                    provider: spec.name.clone(),
                    estimated_cost_usd,
                    budget_usd: self.budget.max_cost_usd,
                };
                tracing::info!(
                    provider = %spec.name,
                    schema = request.schema.name(),
                    url = request.source_url.as_deref().unwrap_or(""),
                    estimated_tokens,
                    estimated_cost_usd,
                    budget_usd = self.budget.max_cost_usd,
                    "AI extraction skipped: {err}"
                );
                audit.push(entry(AuditOutcome::SkippedOverBudget));
                continue;
            }

            if cancel.is_cancelled() {
                audit.push(entry(AuditOutcome::Cancelled));
                break;
            }

            invoked = true;
            tracing::info!(
                provider = %spec.name,
                schema = request.schema.name(),
                url = request.source_url.as_deref().unwrap_or(""),
                estimated_tokens,
                estimated_cost_usd,
                "Invoking AI extraction provider"
            );

            let call = tokio::time::timeout(
                spec.timeout,
                provider.extract(content, &request.schema, &self.budget),
            );
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                r = call => Some(r),
            };

            let outcome = match result {
                None => {
                    audit.push(entry(AuditOutcome::Cancelled));
                    break;
                }
                Some(Err(_)) => AuditOutcome::TimedOut,
                Some(Ok(Err(e))) => AuditOutcome::Failed {
                    error: e.to_string(),
                },
                Some(Ok(Ok(value))) => match Self::normalize_output(value)
                    .and_then(|v| request.schema.validate(&v).map(|()| v))
                {
                    Ok(data) => {
                        tracing::info!(
                            provider = %spec.name,
                            estimated_cost_usd,
                            "AI extraction succeeded"
                        );
                        audit.push(entry(AuditOutcome::Succeeded));
                        return ExtractionOutcome::Extracted(ExtractionResult {
                            data,
                            provider: spec.name.clone(),
                            estimated_tokens,
                            estimated_cost_usd,
                            audit,
                        });
                    }
                    Err(e) => AuditOutcome::InvalidOutput {
                        error: e.to_string(),
                    },
                },
            };

            tracing::warn!(provider = %spec.name, outcome = ?outcome, "AI extraction provider failed");
            audit.push(entry(outcome));
        }

        if invoked {
            tracing::warn!(
                schema = request.schema.name(),
                providers = audit.len(),
                "AI extraction failed on every provider"
            );
            ExtractionOutcome::Failed { audit }
        } else {
            ExtractionOutcome::Skipped { audit }
        }
    }

    /// Extract one record from content a source's parser could not handle.
    ///
    /// The record's provenance names the provider that produced it. A
    /// skipped or failed extraction becomes a [`SourceError`] for `source`.
    pub async fn extract_record(
        &self,
        request: &ExtractionRequest,
        source: &str,
        known: Option<&CrossReference>,
        cancel: &CancellationToken,
    ) -> Result<Record, SourceError> {
        match self.maybe_extract(request, cancel).await {
            ExtractionOutcome::Extracted(result) => {
                let mut record = request
                    .schema
                    .to_record(&result.data, source, known)
                    .map_err(|e| SourceError::from_app_error(source, &e))?;
                record.provenance.extracted_by = Some(result.provider);
                Ok(record)
            }
            ExtractionOutcome::Skipped { audit } => Err(SourceError::new(
                source,
                SourceErrorKind::Extraction,
                format!(
                    "AI extraction skipped: {} provider(s) over the {:.2} USD budget",
                    audit.len(),
                    self.budget.max_cost_usd
                ),
            )),
            ExtractionOutcome::Failed { audit } => Err(SourceError::new(
                source,
                SourceErrorKind::Extraction,
                format!("AI extraction failed on {} provider(s)", audit.len()),
            )),
        }
    }

    /// Providers sometimes return JSON as a string, possibly fenced.
    fn normalize_output(value: serde_json::Value) -> Result<serde_json::Value, AppError> {
        match value {
            serde_json::Value::String(text) => {
                Ok(serde_json::from_str(strip_code_fences(&text))?)
            }
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::extraction::{ProviderSpec, TargetSchema};
    use crate::testutil::MockProvider;

    fn request(chars: usize) -> ExtractionRequest {
        ExtractionRequest::new("x".repeat(chars), TargetSchema::Patent)
    }

    fn decider(providers: Vec<MockProvider>) -> AiFallbackDecider {
        AiFallbackDecider::new(
            providers
                .into_iter()
                .map(|p| Arc::new(p) as Arc<dyn ExtractionProvider>)
                .collect(),
            AiBudget::default(),
        )
    }

    #[tokio::test]
    async fn providers_sorted_by_priority_then_cost() {
        let d = decider(vec![
            MockProvider::new(ProviderSpec::new("anthropic", 2, 3.0)),
            MockProvider::new(ProviderSpec::new("openai", 2, 2.5)),
            MockProvider::new(ProviderSpec::new("groq", 0, 0.0)),
        ]);
        assert_eq!(d.provider_names(), vec!["groq", "openai", "anthropic"]);
    }

    #[tokio::test]
    async fn over_budget_provider_is_skipped_and_next_used() {
        // 100k chars ≈ 25 500 tokens: 0.0765 USD at 3.0/M but 0.1275 USD at 5.0/M.
        let expensive = MockProvider::new(ProviderSpec::new("premium", 0, 5.0))
            .with_response(Ok(json!({ "title": "wrong" })));
        let cheaper = MockProvider::new(ProviderSpec::new("standard", 1, 3.0))
            .with_response(Ok(json!({ "publication_number": "WO2020123456", "title": "Salt" })));
        let d = decider(vec![expensive.clone(), cheaper.clone()]);

        let outcome = d.maybe_extract(&request(100_000), &CancellationToken::new()).await;

        let ExtractionOutcome::Extracted(result) = outcome else {
            panic!("expected extraction");
        };
        assert_eq!(result.provider, "standard");
        assert_eq!(expensive.call_count(), 0);
        assert_eq!(result.audit.len(), 2);
        assert_eq!(result.audit[0].outcome, AuditOutcome::SkippedOverBudget);
        assert!(result.audit[0].estimated_cost_usd > 0.10);
        assert_eq!(result.audit[1].outcome, AuditOutcome::Succeeded);
    }

    #[tokio::test]
    async fn all_over_budget_is_skipped_not_failed() {
        let a = MockProvider::new(ProviderSpec::new("a", 0, 50.0));
        let b = MockProvider::new(ProviderSpec::new("b", 1, 80.0));
        let d = decider(vec![a.clone(), b.clone()]);

        let outcome = d.maybe_extract(&request(50_000), &CancellationToken::new()).await;

        assert!(matches!(outcome, ExtractionOutcome::Skipped { .. }));
        assert_eq!(outcome.audit().len(), 2);
        assert_eq!(a.call_count() + b.call_count(), 0);
    }

    #[tokio::test]
    async fn failures_advance_to_next_provider() {
        let failing = MockProvider::new(ProviderSpec::new("free", 0, 0.0)).with_response(Err(
            AppError::LlmError {
                message: "overloaded".into(),
                status_code: 503,
                retryable: true,
            },
        ));
        let garbage = MockProvider::new(ProviderSpec::new("cheap", 1, 0.5))
            .with_response(Ok(json!({ "title": 12 })));
        let good = MockProvider::new(ProviderSpec::new("paid", 2, 2.5)).with_response(Ok(
            json!("```json\n{\"publication_number\": \"EP1234567\"}\n```"),
        ));
        let d = decider(vec![failing, garbage, good]);

        let outcome = d.maybe_extract(&request(1_000), &CancellationToken::new()).await;

        let ExtractionOutcome::Extracted(result) = outcome else {
            panic!("expected extraction");
        };
        assert_eq!(result.provider, "paid");
        assert_eq!(result.data["publication_number"], "EP1234567");
        assert!(matches!(result.audit[0].outcome, AuditOutcome::Failed { .. }));
        assert!(matches!(result.audit[1].outcome, AuditOutcome::InvalidOutput { .. }));
    }

    #[tokio::test]
    async fn all_invoked_providers_failing_is_failed() {
        let failing = MockProvider::new(ProviderSpec::new("free", 0, 0.0))
            .with_response(Err(AppError::LlmError {
                message: "bad".into(),
                status_code: 400,
                retryable: false,
            }));
        let pricey = MockProvider::new(ProviderSpec::new("pricey", 1, 1_000.0));
        let d = decider(vec![failing, pricey]);

        let outcome = d.maybe_extract(&request(1_000), &CancellationToken::new()).await;

        assert!(matches!(outcome, ExtractionOutcome::Failed { .. }));
        assert_eq!(outcome.audit()[1].outcome, AuditOutcome::SkippedOverBudget);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let slow = MockProvider::new(
            ProviderSpec::new("slow", 0, 0.0).with_timeout(Duration::from_secs(5)),
        )
        .with_response(Ok(json!({})))
        .with_delay(Duration::from_secs(30));
        let d = decider(vec![slow]);

        let outcome = d.maybe_extract(&request(10), &CancellationToken::new()).await;

        assert!(matches!(outcome, ExtractionOutcome::Failed { .. }));
        assert_eq!(outcome.audit()[0].outcome, AuditOutcome::TimedOut);
    }

    #[tokio::test]
    async fn no_providers_means_skipped() {
        let outcome = AiFallbackDecider::disabled()
            .maybe_extract(&request(10), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, ExtractionOutcome::Skipped { .. }));
        assert!(outcome.audit().is_empty());
    }

    #[tokio::test]
    async fn extracted_record_names_its_provider() {
        let provider = MockProvider::new(ProviderSpec::new("groq", 0, 0.0)).with_response(Ok(
            json!({ "title": "Crystalline salt", "applicants": ["Acme"] }),
        ));
        let d = decider(vec![provider]);
        let known = CrossReference::new("pubchem", crate::models::RecordKind::Patent, "WO2020123456");

        let record = d
            .extract_record(&request(500), "wipo", Some(&known), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.identifier, "WO2020123456");
        assert_eq!(record.category, "WO");
        assert_eq!(record.title.as_deref(), Some("Crystalline salt"));
        assert_eq!(record.provenance.source, "wipo");
        assert_eq!(record.provenance.extracted_by.as_deref(), Some("groq"));
    }

    #[tokio::test]
    async fn skipped_extraction_is_a_source_error() {
        let d = decider(vec![MockProvider::new(ProviderSpec::new("pricey", 0, 1_000.0))]);

        let err = d
            .extract_record(&request(500), "wipo", None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.source, "wipo");
        assert_eq!(err.kind, SourceErrorKind::Extraction);
    }

    #[tokio::test]
    async fn content_is_truncated_before_sending() {
        let provider = MockProvider::new(ProviderSpec::new("free", 0, 0.0))
            .with_response(Ok(json!({ "publication_number": "WO1" })));
        let d = decider(vec![provider.clone()]);

        d.maybe_extract(&request(150_000), &CancellationToken::new()).await;

        assert_eq!(provider.received_lengths(), vec![100_000]);
    }
}
