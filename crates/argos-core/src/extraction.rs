//! AI extraction types: target schemas, cost model, requests and outcomes.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::AppError;
use crate::models::{CrossReference, Record, RecordKind};
use crate::util::truncate_chars;

/// Fixed output schema an extraction provider must fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSchema {
    Patent,
    ClinicalTrial,
    Molecule,
}

impl TargetSchema {
    pub fn for_kind(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Patent => TargetSchema::Patent,
            RecordKind::ClinicalTrial => TargetSchema::ClinicalTrial,
            RecordKind::Molecule => TargetSchema::Molecule,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            TargetSchema::Patent => RecordKind::Patent,
            TargetSchema::ClinicalTrial => RecordKind::ClinicalTrial,
            TargetSchema::Molecule => RecordKind::Molecule,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TargetSchema::Patent => "patent",
            TargetSchema::ClinicalTrial => "clinical_trial",
            TargetSchema::Molecule => "molecule",
        }
    }

    /// JSON Schema sent to providers and used to validate their output.
    ///
    /// Every field is nullable; providers are told to leave unknown fields
    /// null rather than guess.
    pub fn json_schema(&self) -> Value {
        let text = json!({ "type": ["string", "null"] });
        let list = json!({ "type": ["array", "null"], "items": { "type": "string" } });
        let properties = match self {
            TargetSchema::Patent => json!({
                "publication_number": text,
                "country": text,
                "title": text,
                "abstract": text,
                "applicants": list,
                "inventors": list,
                "classifications": list,
                "filing_date": text,
                "publication_date": text,
            }),
            TargetSchema::ClinicalTrial => json!({
                "nct_id": text,
                "title": text,
                "summary": text,
                "sponsor": text,
                "phase": text,
                "status": text,
                "conditions": list,
                "interventions": list,
                "start_date": text,
                "completion_date": text,
            }),
            TargetSchema::Molecule => json!({
                "name": text,
                "synonyms": list,
                "development_codes": list,
                "cas_number": text,
                "molecular_formula": text,
                "inchikey": text,
            }),
        };
        json!({
            "type": "object",
            "properties": properties,
            "additionalProperties": true,
        })
    }

    /// Check provider output against [`json_schema`](Self::json_schema).
    pub fn validate(&self, value: &Value) -> Result<(), AppError> {
        let schema = self.json_schema();
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| AppError::SchemaValidationError(format!("invalid target schema: {e}")))?;
        let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::SchemaValidationError(errors.join("; ")))
        }
    }

    /// Map validated provider output onto a [`Record`].
    ///
    /// Absent fields stay empty. Identifier and category fall back to the
    /// cross-reference that prompted the extraction; if neither has an
    /// identifier the output is unusable.
    pub fn to_record(
        &self,
        value: &Value,
        source: &str,
        known: Option<&CrossReference>,
    ) -> Result<Record, AppError> {
        let text = |key: &str| -> Option<String> {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        let list = |key: &str| -> Vec<String> {
            value
                .get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default()
        };

        let (id_key, category) = match self {
            TargetSchema::Patent => ("publication_number", text("country")),
            TargetSchema::ClinicalTrial => ("nct_id", Some("NCT".to_string())),
            TargetSchema::Molecule => ("name", Some("MOL".to_string())),
        };
        let identifier = text(id_key)
            .or_else(|| known.map(|k| k.identifier.clone()))
            .ok_or_else(|| AppError::ParseError(format!("extracted {} has no identifier", self.name())))?;
        let category = category
            .or_else(|| known.and_then(|k| k.category.clone()))
            .or_else(|| patent_country_prefix(&identifier))
            .unwrap_or_default();

        let mut record = Record::new(self.kind(), identifier, category, source);
        match self {
            TargetSchema::Patent => {
                record.title = text("title");
                record.description = text("abstract");
                record.responsible_party = list("applicants");
                record.secondary_names = list("inventors");
                record.classifications = list("classifications");
                record.key_date = text("filing_date");
                record.secondary_date = text("publication_date");
            }
            TargetSchema::ClinicalTrial => {
                record.title = text("title");
                record.description = text("summary");
                record.responsible_party = text("sponsor").into_iter().collect();
                record.secondary_names = list("interventions");
                record.classifications = list("conditions");
                record.key_date = text("start_date");
                record.secondary_date = text("completion_date");
                for key in ["phase", "status"] {
                    if let Some(v) = text(key) {
                        record.attributes.insert(key.to_string(), v);
                    }
                }
            }
            TargetSchema::Molecule => {
                record.title = text("name");
                record.secondary_names = list("synonyms");
                record.classifications = list("development_codes");
                for key in ["cas_number", "molecular_formula", "inchikey"] {
                    if let Some(v) = text(key) {
                        record.attributes.insert(key.to_string(), v);
                    }
                }
            }
        }
        if record.link.is_none() {
            record.link = known.and_then(|k| k.url.clone());
        }
        Ok(record)
    }
}

/// Leading two-letter country code of a patent number (`WO2020...` → `WO`).
fn patent_country_prefix(identifier: &str) -> Option<String> {
    let prefix: String = identifier.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    (prefix.len() == 2).then(|| prefix.to_ascii_uppercase())
}

/// Static configuration of one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSpec {
    pub name: String,
    pub model: String,
    /// Lower runs first.
    pub priority: u32,
    /// USD per million tokens.
    pub cost_per_million_tokens: f64,
    pub timeout: Duration,
}

impl ProviderSpec {
    pub fn new(name: impl Into<String>, priority: u32, cost_per_million_tokens: f64) -> Self {
        Self {
            name: name.into(),
            model: String::new(),
            priority,
            cost_per_million_tokens,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn estimate_cost(&self, tokens: u64) -> f64 {
        tokens as f64 / 1_000_000.0 * self.cost_per_million_tokens
    }
}

/// Per-operation spending cap and token estimation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AiBudget {
    /// Hard cap in USD for a single extraction, per provider projection.
    pub max_cost_usd: f64,
    pub chars_per_token: u64,
    /// Fixed prompt and response allowance added to every estimate.
    pub prompt_overhead_tokens: u64,
    /// Content beyond this many characters is dropped before sending.
    pub max_content_chars: usize,
}

impl Default for AiBudget {
    fn default() -> Self {
        Self {
            max_cost_usd: 0.10,
            chars_per_token: 4,
            prompt_overhead_tokens: 500,
            max_content_chars: 100_000,
        }
    }
}

impl AiBudget {
    pub fn with_max_cost_usd(mut self, max: f64) -> Self {
        self.max_cost_usd = max;
        self
    }

    /// Content as it will be sent (truncated).
    pub fn prepare<'a>(&self, content: &'a str) -> &'a str {
        truncate_chars(content, self.max_content_chars)
    }

    pub fn estimate_tokens(&self, content: &str) -> u64 {
        let chars = self.prepare(content).chars().count() as u64;
        chars / self.chars_per_token.max(1) + self.prompt_overhead_tokens
    }
}

/// A failed structural parse handed to the fallback decider.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub content: String,
    pub schema: TargetSchema,
    /// Where the content came from, for audit logs.
    pub source_url: Option<String>,
}

impl ExtractionRequest {
    pub fn new(content: impl Into<String>, schema: TargetSchema) -> Self {
        Self {
            content: content.into(),
            schema,
            source_url: None,
        }
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }
}

/// What happened with one provider during a fallback run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    Succeeded,
    SkippedOverBudget,
    Failed { error: String },
    TimedOut,
    InvalidOutput { error: String },
    Cancelled,
}

/// Audit entry for one provider consideration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderAudit {
    pub provider: String,
    pub estimated_tokens: u64,
    pub estimated_cost_usd: f64,
    #[serde(flatten)]
    pub outcome: AuditOutcome,
}

/// Successful extraction with its cost trace.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub data: Value,
    pub provider: String,
    pub estimated_tokens: u64,
    pub estimated_cost_usd: f64,
    pub audit: Vec<ProviderAudit>,
}

/// Outcome of [`AiFallbackDecider::maybe_extract`](crate::ai_fallback::AiFallbackDecider::maybe_extract).
#[derive(Debug, Clone)]
pub enum ExtractionOutcome {
    Extracted(ExtractionResult),
    /// Every provider was over budget; nothing was invoked.
    Skipped { audit: Vec<ProviderAudit> },
    /// At least one provider was invoked and none produced valid output.
    Failed { audit: Vec<ProviderAudit> },
}

impl ExtractionOutcome {
    pub fn audit(&self) -> &[ProviderAudit] {
        match self {
            ExtractionOutcome::Extracted(result) => &result.audit,
            ExtractionOutcome::Skipped { audit } | ExtractionOutcome::Failed { audit } => audit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_uses_truncated_length() {
        let budget = AiBudget::default();
        assert_eq!(budget.estimate_tokens(""), 500);
        assert_eq!(budget.estimate_tokens(&"a".repeat(4_000)), 1_500);
        assert_eq!(budget.estimate_tokens(&"a".repeat(1_000_000)), 25_500);
    }

    #[test]
    fn provider_cost_projection() {
        let spec = ProviderSpec::new("openai", 3, 2.50);
        assert!((spec.estimate_cost(1_000_000) - 2.50).abs() < 1e-9);
        assert!((spec.estimate_cost(25_500) - 0.06375).abs() < 1e-9);
        assert_eq!(ProviderSpec::new("free", 0, 0.0).estimate_cost(1_000_000), 0.0);
    }

    #[test]
    fn schema_accepts_partial_output() {
        let value = json!({ "title": "Aspirin tablets", "applicants": null, "inventors": ["A. Smith"] });
        assert!(TargetSchema::Patent.validate(&value).is_ok());
    }

    #[test]
    fn schema_rejects_wrong_types() {
        let value = json!({ "title": 42, "inventors": "A. Smith" });
        let err = TargetSchema::Patent.validate(&value).unwrap_err();
        assert!(matches!(err, AppError::SchemaValidationError(_)));
        assert!(TargetSchema::Molecule.validate(&json!([1, 2])).is_err());
    }

    #[test]
    fn patent_output_maps_to_record_without_fabrication() {
        let value = json!({
            "publication_number": "WO2020123456A1",
            "title": "Crystalline form",
            "inventors": ["Jane Doe"],
            "filing_date": "2019-06-01"
        });
        let record = TargetSchema::Patent.to_record(&value, "wipo", None).unwrap();

        assert_eq!(record.kind, RecordKind::Patent);
        assert_eq!(record.category, "WO");
        assert_eq!(record.title.as_deref(), Some("Crystalline form"));
        assert_eq!(record.secondary_names, vec!["Jane Doe"]);
        assert!(record.description.is_none());
        assert!(record.responsible_party.is_empty());
        assert!(record.secondary_date.is_none());
    }

    #[test]
    fn missing_identifier_falls_back_to_cross_reference() {
        let xref = CrossReference::new("pubchem_patents", RecordKind::Patent, "US-10123456-B2")
            .with_category("US")
            .with_url("https://example.org/US10123456");
        let record = TargetSchema::Patent
            .to_record(&json!({ "title": "Method" }), "pubchem_patents", Some(&xref))
            .unwrap();
        assert_eq!(record.identifier, "US-10123456-B2");
        assert_eq!(record.category, "US");
        assert_eq!(record.link.as_deref(), Some("https://example.org/US10123456"));

        assert!(TargetSchema::Patent.to_record(&json!({}), "x", None).is_err());
    }

    #[test]
    fn trial_output_maps_phase_and_status() {
        let value = json!({
            "nct_id": "NCT01234567",
            "sponsor": "Bayer",
            "phase": "PHASE3",
            "conditions": ["Prostate cancer"]
        });
        let record = TargetSchema::ClinicalTrial.to_record(&value, "ctgov", None).unwrap();
        assert_eq!(record.category, "NCT");
        assert_eq!(record.responsible_party, vec!["Bayer"]);
        assert_eq!(record.attributes.get("phase").map(String::as_str), Some("PHASE3"));
        assert!(!record.attributes.contains_key("status"));
    }
}
