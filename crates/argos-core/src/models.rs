use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Declared kind of a record; decides its output bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Patent,
    ClinicalTrial,
    Molecule,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Patent => "patent",
            RecordKind::ClinicalTrial => "clinical_trial",
            RecordKind::Molecule => "molecule",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The weighted fields of a record, used for completeness and scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Identifier,
    Category,
    Title,
    Description,
    ResponsibleParty,
    KeyDate,
    SecondaryNames,
    Classifications,
    SecondaryDate,
}

impl Field {
    pub const ALL: [Field; 9] = [
        Field::Identifier,
        Field::Category,
        Field::Title,
        Field::Description,
        Field::ResponsibleParty,
        Field::KeyDate,
        Field::SecondaryNames,
        Field::Classifications,
        Field::SecondaryDate,
    ];
}

/// Where a record came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Source whose values won the merge.
    pub source: String,
    /// Other sources that reported the same entity.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also_seen_in: Vec<String>,
    /// AI provider that produced the fields, when structural parsing failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_by: Option<String>,
}

/// A patent, clinical trial or molecule fact.
///
/// The generic field names map onto each kind:
///
/// | field               | patent           | clinical trial | molecule          |
/// |---------------------|------------------|----------------|-------------------|
/// | `identifier`        | publication no.  | NCT id         | preferred name    |
/// | `category`          | country code     | registry       | `MOL`             |
/// | `responsible_party` | applicants       | lead sponsor   | -                 |
/// | `key_date`          | filing date      | start date     | -                 |
/// | `secondary_names`   | inventors        | interventions  | synonyms          |
/// | `classifications`   | IPC/CPC codes    | conditions     | development codes |
/// | `secondary_date`    | publication date | completion     | -                 |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: RecordKind,
    pub identifier: String,
    pub category: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub responsible_party: Vec<String>,
    #[serde(default)]
    pub key_date: Option<String>,
    #[serde(default)]
    pub secondary_names: Vec<String>,
    #[serde(default)]
    pub classifications: Vec<String>,
    #[serde(default)]
    pub secondary_date: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    /// Kind-specific extras (phase, status, CAS number, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub provenance: Provenance,
    /// 0-100, filled in by the scorer.
    #[serde(default)]
    pub quality_score: u8,
}

impl Record {
    pub fn new(
        kind: RecordKind,
        identifier: impl Into<String>,
        category: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            identifier: identifier.into().trim().to_string(),
            category: category.into().trim().to_ascii_uppercase(),
            title: None,
            description: None,
            responsible_party: Vec::new(),
            key_date: None,
            secondary_names: Vec::new(),
            classifications: Vec::new(),
            secondary_date: None,
            link: None,
            attributes: BTreeMap::new(),
            provenance: Provenance {
                source: source.into(),
                ..Default::default()
            },
            quality_score: 0,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = non_empty(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = non_empty(description.into());
        self
    }

    pub fn with_key_date(mut self, date: impl Into<String>) -> Self {
        self.key_date = non_empty(date.into());
        self
    }

    pub fn with_secondary_date(mut self, date: impl Into<String>) -> Self {
        self.secondary_date = non_empty(date.into());
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = non_empty(link.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(value) = non_empty(value.into()) {
            self.attributes.insert(key.into(), value);
        }
        self
    }

    pub fn is_populated(&self, field: Field) -> bool {
        match field {
            Field::Identifier => !self.identifier.is_empty(),
            Field::Category => !self.category.is_empty(),
            Field::Title => self.title.is_some(),
            Field::Description => self.description.is_some(),
            Field::ResponsibleParty => !self.responsible_party.is_empty(),
            Field::KeyDate => self.key_date.is_some(),
            Field::SecondaryNames => !self.secondary_names.is_empty(),
            Field::Classifications => !self.classifications.is_empty(),
            Field::SecondaryDate => self.secondary_date.is_some(),
        }
    }

    /// Number of populated weighted fields.
    pub fn completeness(&self) -> usize {
        Field::ALL.iter().filter(|f| self.is_populated(**f)).count()
    }

    /// Normalized identity key: `kind:CATEGORY:IDENTIFIER`.
    ///
    /// Punctuation and spacing are removed and case is folded, so
    /// `WO 2020/123456` and `wo-2020-123456` are the same patent. A
    /// patent's country prefix is dropped from the number if present.
    pub fn identity_key(&self) -> String {
        let category = normalize_identifier(&self.category);
        let mut id = normalize_identifier(&self.identifier);
        if self.kind == RecordKind::Patent
            && !category.is_empty()
            && id.len() > category.len()
            && id.starts_with(&category)
        {
            id = id[category.len()..].to_string();
        }
        format!("{}:{category}:{id}", self.kind)
    }
}

/// Uppercase and keep only alphanumerics.
pub fn normalize_identifier(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// The canonical subject of a search, resolved in the enrichment phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    /// What the user typed.
    pub query: String,
    /// Preferred name.
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Development codes such as `ABC-1234`.
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(default)]
    pub cas_number: Option<String>,
    /// Upstream identifiers (e.g. `pubchem_cid`).
    #[serde(default)]
    pub identifiers: BTreeMap<String, String>,
}

impl Subject {
    /// Unresolved subject: just the query.
    pub fn from_query(query: impl Into<String>) -> Self {
        let query = query.into().trim().to_string();
        Self {
            name: query.clone(),
            query,
            ..Default::default()
        }
    }

    /// Name, codes and CAS number, deduplicated case-insensitively, in that order.
    pub fn search_terms(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        std::iter::once(&self.name)
            .chain(self.codes.iter())
            .chain(self.cas_number.iter())
            .filter(|t| !t.trim().is_empty())
            .filter(|t| seen.insert(t.to_lowercase()))
            .cloned()
            .collect()
    }
}

/// A pointer to a record that a source could only reference, to be expanded
/// by a follow-up query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrossReference {
    /// Adapter that can expand this reference.
    pub source: String,
    pub kind: RecordKind,
    pub identifier: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl CrossReference {
    pub fn new(source: impl Into<String>, kind: RecordKind, identifier: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind,
            identifier: identifier.into(),
            category: None,
            url: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Identity key of the record this points at. A patent without a
    /// category takes its country from the number's leading letters.
    pub fn identity_key(&self) -> String {
        let category = match (&self.category, self.kind) {
            (Some(category), _) => category.clone(),
            (None, RecordKind::Patent) => self
                .identifier
                .trim()
                .chars()
                .take_while(char::is_ascii_alphabetic)
                .collect(),
            (None, _) => String::new(),
        };
        Record::new(self.kind, self.identifier.as_str(), category, self.source.as_str())
            .identity_key()
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
