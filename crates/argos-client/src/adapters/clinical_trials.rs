//! ClinicalTrials.gov v2 `studies` search.

use argos_core::error::{AppError, SourceError, SourceErrorKind};
use argos_core::extraction::TargetSchema;
use argos_core::models::{CrossReference, Record, RecordKind, Subject};
use argos_core::source::{AdapterOutput, QueryContext, SourceAdapter};
use argos_core::traits::{Cleaner, Fetcher};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use super::{AiAssist, fetch_json, join_path};
use crate::cleaner::HtmdCleaner;

pub const SOURCE: &str = "clinicaltrials_gov";

const PUBLIC_API: &str = "https://clinicaltrials.gov/api/v2";
const STUDY_PAGE: &str = "https://clinicaltrials.gov/study";
const MAX_PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 10;
const MAX_TERMS: usize = 5;

/// Trials mentioning the subject's name or development codes.
#[derive(Clone)]
pub struct ClinicalTrialsAdapter<F: Fetcher, C: Cleaner = HtmdCleaner> {
    fetcher: F,
    api: Url,
    ai: Option<AiAssist<C>>,
}

impl<F: Fetcher> ClinicalTrialsAdapter<F, HtmdCleaner> {
    pub fn public(fetcher: F) -> Result<Self, AppError> {
        Self::new(fetcher, PUBLIC_API)
    }

    /// `api` is the v2 root, e.g. `https://clinicaltrials.gov/api/v2`.
    pub fn new(fetcher: F, api: &str) -> Result<Self, AppError> {
        let api = Url::parse(api)
            .map_err(|e| AppError::ConfigError(format!("Invalid ClinicalTrials.gov API '{api}': {e}")))?;
        Ok(Self {
            fetcher,
            api,
            ai: None,
        })
    }
}

impl<F: Fetcher, C: Cleaner> ClinicalTrialsAdapter<F, C> {
    /// Recover studies that fail to parse with AI extraction.
    pub fn with_ai<C2: Cleaner>(self, ai: AiAssist<C2>) -> ClinicalTrialsAdapter<F, C2> {
        ClinicalTrialsAdapter {
            fetcher: self.fetcher,
            api: self.api,
            ai: Some(ai),
        }
    }

    async fn parse_or_recover(&self, study: Value, ctx: &QueryContext) -> Result<Record, SourceError> {
        let raw = self.ai.as_ref().map(|ai| (ai, study.clone()));
        let parse_error = match parse_study(study) {
            Ok(record) => return Ok(record),
            Err(e) => e,
        };
        let Some((ai, raw)) = raw else {
            return Err(SourceError::from_app_error(SOURCE, &parse_error));
        };

        let known = raw
            .pointer("/protocolSection/identificationModule/nctId")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| {
                CrossReference::new(SOURCE, RecordKind::ClinicalTrial, id)
                    .with_category("NCT")
                    .with_url(format!("{STUDY_PAGE}/{id}"))
            });
        tracing::info!(
            source = SOURCE,
            study = known.as_ref().map(|k| k.identifier.as_str()),
            error = %parse_error,
            "Study did not parse, trying AI extraction"
        );
        ai.recover(SOURCE, &raw.to_string(), TargetSchema::ClinicalTrial, known.as_ref(), ctx)
            .await
    }

    fn search_url(&self, term: &str, page_size: usize, page_token: Option<&str>) -> Result<Url, AppError> {
        let mut url = join_path(&self.api, &["studies"])?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
            query
                .append_pair("query.term", term)
                .append_pair("pageSize", &page_size.to_string())
                .append_pair("format", "json");
        }
        Ok(url)
    }
}

/// Name and development codes joined with `OR`, multi-word terms quoted.
/// The CAS number is left out; registries do not index it.
fn query_term(subject: &Subject) -> String {
    subject
        .search_terms()
        .into_iter()
        .filter(|t| subject.cas_number.as_deref() != Some(t.as_str()))
        .take(MAX_TERMS)
        .map(|t| if t.contains(' ') { format!("\"{t}\"") } else { t })
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[async_trait]
impl<F, C> SourceAdapter for ClinicalTrialsAdapter<F, C>
where
    F: Fetcher + 'static,
    C: Cleaner + 'static,
{
    fn name(&self) -> &str {
        SOURCE
    }

    async fn query(&self, subject: &Subject, ctx: &QueryContext) -> AdapterOutput {
        let term = query_term(subject);
        if term.is_empty() {
            tracing::debug!(source = SOURCE, "No search terms, skipping");
            return AdapterOutput::default();
        }
        let max_results = ctx.options().max_results;
        let page_size = max_results.clamp(1, MAX_PAGE_SIZE);
        let mut output = AdapterOutput::default();
        let mut page_token: Option<String> = None;

        for page in 0..MAX_PAGES {
            let fetched = match self.search_url(&term, page_size, page_token.as_deref()) {
                Ok(url) => fetch_json::<_, StudiesPage>(&self.fetcher, ctx, url.as_str()).await,
                Err(e) => Err(e),
            };
            let studies = match fetched {
                Ok(studies) => studies,
                Err(e) => {
                    output = output.with_error(SourceError::from_app_error(SOURCE, &e));
                    break;
                }
            };

            for study in studies.studies {
                match self.parse_or_recover(study, ctx).await {
                    Ok(record) => output.records.push(record),
                    Err(error) => output.errors.push(error),
                }
            }
            tracing::debug!(source = SOURCE, page, records = output.records.len(), "Fetched studies page");

            page_token = studies.next_page_token;
            if page_token.is_none() || output.records.len() >= max_results {
                break;
            }
            if ctx.is_expired() {
                output.errors.push(SourceError::new(
                    SOURCE,
                    SourceErrorKind::Incomplete,
                    "deadline reached before the last results page",
                ));
                break;
            }
        }

        output.records.truncate(max_results);
        tracing::info!(
            source = SOURCE,
            subject = %subject.name,
            trials = output.records.len(),
            errors = output.errors.len(),
            "Clinical trial search finished"
        );
        output
    }
}

// ---- v2 API types ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudiesPage {
    #[serde(default)]
    studies: Vec<Value>,
    next_page_token: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct Study {
    protocol_section: ProtocolSection,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ProtocolSection {
    identification_module: IdentificationModule,
    status_module: StatusModule,
    design_module: DesignModule,
    arms_interventions_module: ArmsInterventionsModule,
    conditions_module: ConditionsModule,
    sponsor_collaborators_module: SponsorCollaboratorsModule,
    description_module: DescriptionModule,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct IdentificationModule {
    nct_id: Option<String>,
    official_title: Option<String>,
    brief_title: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct StatusModule {
    overall_status: Option<String>,
    start_date_struct: Option<DateStruct>,
    completion_date_struct: Option<DateStruct>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DateStruct {
    date: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct DesignModule {
    phases: Vec<String>,
    enrollment_info: Option<EnrollmentInfo>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct EnrollmentInfo {
    count: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ArmsInterventionsModule {
    interventions: Vec<Intervention>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Intervention {
    name: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ConditionsModule {
    conditions: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SponsorCollaboratorsModule {
    lead_sponsor: Option<LeadSponsor>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LeadSponsor {
    name: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct DescriptionModule {
    brief_summary: Option<String>,
}

fn parse_study(value: Value) -> Result<Record, AppError> {
    let study: Study = serde_json::from_value(value)
        .map_err(|e| AppError::ParseError(format!("malformed study: {e}")))?;
    let p = study.protocol_section;
    let nct_id = p
        .identification_module
        .nct_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::ParseError("study without an NCT id".into()))?;

    let mut record = Record::new(RecordKind::ClinicalTrial, nct_id.as_str(), "NCT", SOURCE)
        .with_link(format!("{STUDY_PAGE}/{nct_id}"));
    record.title = p
        .identification_module
        .official_title
        .or(p.identification_module.brief_title);
    record.description = p.description_module.brief_summary;
    record.responsible_party = p
        .sponsor_collaborators_module
        .lead_sponsor
        .and_then(|s| s.name)
        .into_iter()
        .collect();
    record.secondary_names = p
        .arms_interventions_module
        .interventions
        .into_iter()
        .filter_map(|i| i.name)
        .collect();
    record.classifications = p.conditions_module.conditions;
    record.key_date = p.status_module.start_date_struct.and_then(|d| d.date);
    record.secondary_date = p.status_module.completion_date_struct.and_then(|d| d.date);

    if let Some(phase) = p.design_module.phases.into_iter().next() {
        record = record.with_attribute("phase", phase);
    }
    if let Some(status) = p.status_module.overall_status {
        record = record.with_attribute("status", status);
    }
    if let Some(count) = p.design_module.enrollment_info.and_then(|e| e.count) {
        record = record.with_attribute("enrollment", count.to_string());
    }
    Ok(record)
}
