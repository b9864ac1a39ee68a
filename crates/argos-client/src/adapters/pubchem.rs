//! PubChem: molecule resolution and patent cross-references.
//!
//! [`PubChemResolver`] turns a free-text query into a canonical [`Subject`]
//! through PUG REST (CID, synonyms, computed properties) and contributes a
//! molecule record. [`PubChemPatentAdapter`] lists the compound's patent
//! identifiers as cross-references and expands each through the PUG-View
//! patent document, falling back to AI extraction when that document does
//! not parse.

use std::collections::HashSet;
use std::sync::LazyLock;

use argos_core::error::{AppError, SourceError};
use argos_core::extraction::TargetSchema;
use argos_core::models::{CrossReference, Record, RecordKind, Subject};
use argos_core::source::{AdapterOutput, QueryContext, Resolution, SourceAdapter, SubjectResolver};
use argos_core::traits::{Cleaner, Fetcher};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use url::Url;

use super::{AiAssist, fetch_json, fetch_json_or_missing, fetch_text, join_path};
use crate::cleaner::HtmdCleaner;

pub const RESOLVER_NAME: &str = "pubchem";
pub const PATENT_SOURCE: &str = "pubchem_patents";

const PUBLIC_HOST: &str = "https://pubchem.ncbi.nlm.nih.gov";
const PROPERTIES: &str = "MolecularFormula,MolecularWeight,InChIKey,IUPACName";
const MAX_ALIASES: usize = 100;
const MAX_CODES: usize = 20;
const RECORD_SYNONYMS: usize = 20;
const INTERNAL_PREFIXES: [&str; 4] = ["CHEMBL", "SCHEMBL", "DTXSID", "UNII-"];

static DEV_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[A-Z]{2,5}-?\d{3,7}[A-Z]?$").expect("valid regex"));
static CAS_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2,7}-\d{2}-\d$").expect("valid regex"));

/// URL builder for one PubChem deployment.
#[derive(Debug, Clone)]
pub struct PubChemApi {
    host: Url,
}

impl PubChemApi {
    pub fn public() -> Result<Self, AppError> {
        Self::new(PUBLIC_HOST)
    }

    pub fn new(host: &str) -> Result<Self, AppError> {
        let host = Url::parse(host)
            .map_err(|e| AppError::ConfigError(format!("Invalid PubChem host '{host}': {e}")))?;
        Ok(Self { host })
    }

    fn compound_by_name(&self, name: &str, operation: &[&str]) -> Result<Url, AppError> {
        let mut path = vec!["rest", "pug", "compound", "name", name];
        path.extend_from_slice(operation);
        join_path(&self.host, &path)
    }

    fn compound_by_cid(&self, cid: &str, operation: &[&str]) -> Result<Url, AppError> {
        let mut path = vec!["rest", "pug", "compound", "cid", cid];
        path.extend_from_slice(operation);
        join_path(&self.host, &path)
    }

    pub fn cids(&self, name: &str) -> Result<Url, AppError> {
        self.compound_by_name(name, &["cids", "JSON"])
    }

    pub fn synonyms(&self, cid: &str) -> Result<Url, AppError> {
        self.compound_by_cid(cid, &["synonyms", "JSON"])
    }

    pub fn properties(&self, cid: &str) -> Result<Url, AppError> {
        self.compound_by_cid(cid, &["property", PROPERTIES, "JSON"])
    }

    pub fn patents_by_cid(&self, cid: &str) -> Result<Url, AppError> {
        self.compound_by_cid(cid, &["xrefs", "PatentID", "JSON"])
    }

    pub fn patents_by_name(&self, name: &str) -> Result<Url, AppError> {
        self.compound_by_name(name, &["xrefs", "PatentID", "JSON"])
    }

    pub fn patent_view(&self, patent_id: &str) -> Result<Url, AppError> {
        join_path(&self.host, &["rest", "pug_view", "data", "patent", patent_id, "JSON"])
    }

    pub fn compound_page(&self, cid: &str) -> Result<Url, AppError> {
        join_path(&self.host, &["compound", cid])
    }

    pub fn patent_page(&self, patent_id: &str) -> Result<Url, AppError> {
        join_path(&self.host, &["patent", patent_id])
    }
}

// ---- PUG REST types ----

#[derive(Deserialize)]
struct CidResponse {
    #[serde(rename = "IdentifierList")]
    identifier_list: IdentifierList,
}

#[derive(Deserialize)]
struct IdentifierList {
    #[serde(rename = "CID", default)]
    cid: Vec<u64>,
}

#[derive(Deserialize)]
struct InformationResponse {
    #[serde(rename = "InformationList")]
    information_list: InformationList,
}

#[derive(Deserialize)]
struct InformationList {
    #[serde(rename = "Information", default)]
    information: Vec<Information>,
}

#[derive(Deserialize)]
struct Information {
    #[serde(rename = "Synonym", default)]
    synonym: Vec<String>,
    #[serde(rename = "PatentID", default)]
    patent_id: Vec<String>,
}

#[derive(Deserialize)]
struct PropertyResponse {
    #[serde(rename = "PropertyTable")]
    property_table: PropertyTable,
}

#[derive(Deserialize)]
struct PropertyTable {
    #[serde(rename = "Properties", default)]
    properties: Vec<Properties>,
}

#[derive(Deserialize, Default)]
struct Properties {
    #[serde(rename = "MolecularFormula")]
    molecular_formula: Option<String>,
    /// A string in current responses, a number in older ones.
    #[serde(rename = "MolecularWeight")]
    molecular_weight: Option<serde_json::Value>,
    #[serde(rename = "InChIKey")]
    inchikey: Option<String>,
    #[serde(rename = "IUPACName")]
    iupac_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolves a query to a PubChem compound.
#[derive(Clone)]
pub struct PubChemResolver<F: Fetcher> {
    fetcher: F,
    api: PubChemApi,
}

impl<F: Fetcher> PubChemResolver<F> {
    pub fn new(fetcher: F, api: PubChemApi) -> Self {
        Self { fetcher, api }
    }

    /// Synonyms and properties enrich the subject but are not required.
    async fn optional<T: serde::de::DeserializeOwned>(
        &self,
        url: Result<Url, AppError>,
        ctx: &QueryContext,
    ) -> Option<T> {
        let result = match url {
            Ok(url) => fetch_json_or_missing(&self.fetcher, ctx, url.as_str()).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(source = RESOLVER_NAME, error = %e, "Optional PubChem lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl<F: Fetcher + 'static> SubjectResolver for PubChemResolver<F> {
    fn name(&self) -> &str {
        RESOLVER_NAME
    }

    async fn resolve(&self, query: &str, ctx: &QueryContext) -> Result<Resolution, AppError> {
        let name = query.trim();
        if name.is_empty() {
            return Err(AppError::Generic("empty query".into()));
        }

        let cids: CidResponse = fetch_json(&self.fetcher, ctx, self.api.cids(name)?.as_str()).await?;
        let cid = cids
            .identifier_list
            .cid
            .first()
            .map(u64::to_string)
            .ok_or_else(|| AppError::ParseError(format!("no PubChem compound for '{name}'")))?;

        let synonyms: Vec<String> = self
            .optional::<InformationResponse>(self.api.synonyms(&cid), ctx)
            .await
            .and_then(|r| r.information_list.information.into_iter().next())
            .map(|info| info.synonym)
            .unwrap_or_default();
        let properties = self
            .optional::<PropertyResponse>(self.api.properties(&cid), ctx)
            .await
            .and_then(|r| r.property_table.properties.into_iter().next())
            .unwrap_or_default();

        let preferred = synonyms
            .first()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| name.to_string());

        let mut subject = Subject::from_query(query);
        subject.name = preferred.clone();
        subject.aliases = clean_synonyms(&synonyms);
        subject.codes = development_codes(&synonyms);
        subject.cas_number = cas_number(&synonyms);
        subject.identifiers.insert("pubchem_cid".into(), cid.clone());
        if let Some(key) = &properties.inchikey {
            subject.identifiers.insert("inchikey".into(), key.clone());
        }

        let record = molecule_record(&subject, &properties, self.api.compound_page(&cid)?);
        tracing::info!(
            query = name,
            cid = %cid,
            aliases = subject.aliases.len(),
            codes = subject.codes.len(),
            "Resolved subject"
        );

        Ok(Resolution {
            subject,
            records: vec![record],
        })
    }
}

fn molecule_record(subject: &Subject, properties: &Properties, page: Url) -> Record {
    let mut record = Record::new(RecordKind::Molecule, subject.name.as_str(), "MOL", RESOLVER_NAME)
        .with_title(subject.name.as_str())
        .with_link(page.as_str());
    if let Some(iupac) = &properties.iupac_name {
        record = record.with_description(iupac.as_str());
    }
    record.secondary_names = subject.aliases.iter().take(RECORD_SYNONYMS).cloned().collect();
    record.classifications = subject.codes.clone();
    for (key, value) in &subject.identifiers {
        record = record.with_attribute(key.as_str(), value.as_str());
    }
    if let Some(cas) = &subject.cas_number {
        record = record.with_attribute("cas_number", cas.as_str());
    }
    if let Some(formula) = &properties.molecular_formula {
        record = record.with_attribute("molecular_formula", formula.as_str());
    }
    match &properties.molecular_weight {
        Some(serde_json::Value::String(w)) => {
            record = record.with_attribute("molecular_weight", w.as_str());
        }
        Some(serde_json::Value::Number(w)) => {
            record = record.with_attribute("molecular_weight", w.to_string());
        }
        _ => {}
    }
    record
}

/// Synonyms worth searching for: reasonable length, no database-internal ids.
fn clean_synonyms(synonyms: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    synonyms
        .iter()
        .map(|s| s.trim())
        .filter(|s| (3..100).contains(&s.chars().count()))
        .filter(|s| {
            let upper = s.to_uppercase();
            !INTERNAL_PREFIXES.iter().any(|p| upper.starts_with(p))
        })
        .filter(|s| seen.insert(s.to_lowercase()))
        .take(MAX_ALIASES)
        .map(String::from)
        .collect()
}

/// Synonyms shaped like sponsor development codes (`BAY-1841788`, `ODM201`).
fn development_codes(synonyms: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    synonyms
        .iter()
        .map(|s| s.trim())
        .filter(|s| DEV_CODE.is_match(s))
        .filter(|s| {
            let upper = s.to_uppercase();
            !["CID", "SID", "AID"].iter().any(|p| upper.starts_with(p))
        })
        .filter(|s| seen.insert(s.to_uppercase()))
        .take(MAX_CODES)
        .map(String::from)
        .collect()
}

fn cas_number(synonyms: &[String]) -> Option<String> {
    synonyms
        .iter()
        .map(|s| s.trim())
        .find(|s| CAS_NUMBER.is_match(s))
        .map(String::from)
}

// ---------------------------------------------------------------------------
// Patent adapter
// ---------------------------------------------------------------------------

/// Patent cross-references for a compound, expanded through PUG-View.
#[derive(Clone)]
pub struct PubChemPatentAdapter<F: Fetcher, C: Cleaner = HtmdCleaner> {
    fetcher: F,
    api: PubChemApi,
    ai: Option<AiAssist<C>>,
}

impl<F: Fetcher> PubChemPatentAdapter<F, HtmdCleaner> {
    pub fn new(fetcher: F, api: PubChemApi) -> Self {
        Self {
            fetcher,
            api,
            ai: None,
        }
    }
}

impl<F: Fetcher, C: Cleaner> PubChemPatentAdapter<F, C> {
    /// Recover patent documents that fail to parse with AI extraction.
    pub fn with_ai<C2: Cleaner>(self, ai: AiAssist<C2>) -> PubChemPatentAdapter<F, C2> {
        PubChemPatentAdapter {
            fetcher: self.fetcher,
            api: self.api,
            ai: Some(ai),
        }
    }

    fn cross_references(&self, response: InformationResponse, limit: usize) -> Vec<CrossReference> {
        let mut seen = HashSet::new();
        let mut ids: Vec<String> = response
            .information_list
            .information
            .into_iter()
            .flat_map(|info| info.patent_id)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();
        // International filings first: one WO family covers many national ones.
        ids.sort_by_key(|id| !id.starts_with("WO"));
        ids.truncate(limit);

        ids.into_iter()
            .map(|id| {
                let parts = PatentId::parse(&id);
                let mut reference = CrossReference::new(PATENT_SOURCE, RecordKind::Patent, id.as_str());
                if !parts.country.is_empty() {
                    reference = reference.with_category(parts.country);
                }
                if let Ok(page) = self.api.patent_page(&id) {
                    reference = reference.with_url(page.as_str());
                }
                reference
            })
            .collect()
    }
}

#[async_trait]
impl<F, C> SourceAdapter for PubChemPatentAdapter<F, C>
where
    F: Fetcher + 'static,
    C: Cleaner + 'static,
{
    fn name(&self) -> &str {
        PATENT_SOURCE
    }

    async fn query(&self, subject: &Subject, ctx: &QueryContext) -> AdapterOutput {
        let url = match subject.identifiers.get("pubchem_cid") {
            Some(cid) => self.api.patents_by_cid(cid),
            None => self.api.patents_by_name(&subject.name),
        };
        let result = match url {
            Ok(url) => {
                fetch_json_or_missing::<_, InformationResponse>(&self.fetcher, ctx, url.as_str()).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(Some(response)) => {
                let cross_references =
                    self.cross_references(response, ctx.options().max_results);
                tracing::info!(
                    source = PATENT_SOURCE,
                    subject = %subject.name,
                    patents = cross_references.len(),
                    "Listed patent cross-references"
                );
                AdapterOutput {
                    cross_references,
                    ..AdapterOutput::default()
                }
            }
            Ok(None) => AdapterOutput::default(),
            Err(e) => AdapterOutput::failed(SourceError::from_app_error(PATENT_SOURCE, &e)),
        }
    }

    async fn expand(&self, reference: &CrossReference, ctx: &QueryContext) -> AdapterOutput {
        let body = match self.api.patent_view(&reference.identifier) {
            Ok(url) => fetch_text(&self.fetcher, ctx, url.as_str()).await,
            Err(e) => Err(e),
        };
        let body = match body {
            Ok(body) => body,
            Err(e) => return AdapterOutput::failed(SourceError::from_app_error(PATENT_SOURCE, &e)),
        };

        match parse_patent_view(&body, reference) {
            Ok(record) => AdapterOutput::from_records(vec![record]),
            Err(parse_error) => {
                let Some(ai) = &self.ai else {
                    return AdapterOutput::failed(SourceError::from_app_error(
                        PATENT_SOURCE,
                        &parse_error,
                    ));
                };
                tracing::info!(
                    source = PATENT_SOURCE,
                    patent = %reference.identifier,
                    error = %parse_error,
                    "Patent document did not parse, trying AI extraction"
                );
                match ai
                    .recover(PATENT_SOURCE, &body, TargetSchema::Patent, Some(reference), ctx)
                    .await
                {
                    Ok(record) => AdapterOutput::from_records(vec![record]),
                    Err(error) => AdapterOutput::failed(error),
                }
            }
        }
    }
}

/// `WO-2016012345-A1` split into country, number and kind code.
#[derive(Debug, PartialEq, Eq)]
struct PatentId {
    country: String,
    number: String,
    kind: Option<String>,
}

impl PatentId {
    fn parse(id: &str) -> Self {
        let parts: Vec<&str> = id.trim().split('-').collect();
        if let [country, number, kind] = parts.as_slice() {
            return Self {
                country: country.to_uppercase(),
                number: number.to_string(),
                kind: Some(kind.to_uppercase()),
            };
        }
        let compact: String = id.chars().filter(|c| c.is_alphanumeric()).collect();
        let country: String = compact.chars().take_while(char::is_ascii_alphabetic).collect();
        Self {
            number: compact[country.len()..].to_string(),
            country: country.to_uppercase(),
            kind: None,
        }
    }
}

// ---- PUG-View types ----

#[derive(Deserialize)]
struct ViewDocument {
    #[serde(rename = "Record")]
    record: ViewRecord,
}

#[derive(Deserialize)]
struct ViewRecord {
    #[serde(rename = "RecordAccession")]
    accession: Option<String>,
    #[serde(rename = "RecordTitle")]
    title: Option<String>,
    #[serde(rename = "Section", default)]
    sections: Vec<ViewSection>,
}

#[derive(Deserialize)]
struct ViewSection {
    #[serde(rename = "TOCHeading", default)]
    heading: String,
    #[serde(rename = "Information", default)]
    information: Vec<ViewInformation>,
    #[serde(rename = "Section", default)]
    sections: Vec<ViewSection>,
}

#[derive(Deserialize)]
struct ViewInformation {
    #[serde(rename = "Value")]
    value: Option<ViewValue>,
}

#[derive(Deserialize)]
struct ViewValue {
    #[serde(rename = "StringWithMarkup", default)]
    strings: Vec<Markup>,
    #[serde(rename = "DateISO8601", default)]
    dates: Vec<String>,
}

#[derive(Deserialize)]
struct Markup {
    #[serde(rename = "String")]
    string: String,
}

/// Every section flattened to `(lowercase heading, values)`.
fn flatten_sections(sections: &[ViewSection], out: &mut Vec<(String, Vec<String>)>) {
    for section in sections {
        let values: Vec<String> = section
            .information
            .iter()
            .filter_map(|info| info.value.as_ref())
            .flat_map(|value| {
                value
                    .dates
                    .iter()
                    .cloned()
                    .chain(value.strings.iter().map(|m| m.string.clone()))
            })
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if !values.is_empty() {
            out.push((section.heading.to_lowercase(), values));
        }
        flatten_sections(&section.sections, out);
    }
}

/// Structural parse of a PUG-View patent document.
fn parse_patent_view(body: &str, reference: &CrossReference) -> Result<Record, AppError> {
    let document: ViewDocument = serde_json::from_str(body)
        .map_err(|e| AppError::ParseError(format!("PUG-View patent {}: {e}", reference.identifier)))?;
    let record = document.record;
    let title = record
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            AppError::ParseError(format!("PUG-View patent {} has no title", reference.identifier))
        })?;

    let mut sections = Vec::new();
    flatten_sections(&record.sections, &mut sections);
    let values = |needles: &[&str]| -> Vec<String> {
        sections
            .iter()
            .filter(|(heading, _)| needles.iter().any(|n| heading.contains(n)))
            .flat_map(|(_, values)| values.iter().cloned())
            .collect()
    };
    let first = |needles: &[&str]| values(needles).into_iter().next();

    let identifier = record
        .accession
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| reference.identifier.clone());
    let id = PatentId::parse(&identifier);
    let category = if id.country.is_empty() {
        reference.category.clone().unwrap_or_default()
    } else {
        id.country.clone()
    };

    let mut patent = Record::new(RecordKind::Patent, identifier.as_str(), category, PATENT_SOURCE)
        .with_title(title);
    patent.description = first(&["abstract"]);
    patent.responsible_party = values(&["assignee", "applicant"]);
    patent.secondary_names = values(&["inventor"]);
    patent.classifications = values(&["classification", "ipc", "cpc"]);
    patent.key_date = first(&["filing date", "priority date"]);
    patent.secondary_date = first(&["publication date", "grant date"]);
    patent.link = reference.url.clone();
    if let Some(kind) = id.kind {
        patent = patent.with_attribute("kind_code", kind);
    }
    Ok(patent)
}
