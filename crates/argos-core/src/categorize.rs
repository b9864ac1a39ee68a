//! Partition scored records into output buckets by declared kind.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::models::{Record, RecordKind};

/// Counts for one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BucketSummary {
    pub total: usize,
    /// Country for patents, registry for trials.
    pub by_category: BTreeMap<String, usize>,
    pub by_source: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub by_phase: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub by_status: BTreeMap<String, usize>,
}

impl BucketSummary {
    fn from_records(records: &[Record]) -> Self {
        let mut summary = BucketSummary {
            total: records.len(),
            ..Default::default()
        };
        for record in records {
            *summary.by_category.entry(record.category.clone()).or_default() += 1;
            *summary
                .by_source
                .entry(record.provenance.source.clone())
                .or_default() += 1;
            if let Some(phase) = record.attributes.get("phase") {
                *summary.by_phase.entry(phase.clone()).or_default() += 1;
            }
            if let Some(status) = record.attributes.get("status") {
                *summary.by_status.entry(status.clone()).or_default() += 1;
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summaries {
    pub patents: BucketSummary,
    pub clinical_trials: BucketSummary,
    pub molecules: BucketSummary,
}

/// Records split into disjoint buckets, each sorted by score (best first)
/// then identity key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CategorizedRecords {
    pub patents: Vec<Record>,
    pub clinical_trials: Vec<Record>,
    pub molecules: Vec<Record>,
    pub summaries: Summaries,
}

impl CategorizedRecords {
    pub fn total(&self) -> usize {
        self.patents.len() + self.clinical_trials.len() + self.molecules.len()
    }
}

/// Buckets records purely by [`RecordKind`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Categorizer;

impl Categorizer {
    pub fn categorize(&self, records: Vec<Record>) -> CategorizedRecords {
        let mut out = CategorizedRecords::default();
        for record in records {
            match record.kind {
                RecordKind::Patent => out.patents.push(record),
                RecordKind::ClinicalTrial => out.clinical_trials.push(record),
                RecordKind::Molecule => out.molecules.push(record),
            }
        }
        for bucket in [&mut out.patents, &mut out.clinical_trials, &mut out.molecules] {
            sort_for_presentation(bucket);
        }
        out.summaries = Summaries {
            patents: BucketSummary::from_records(&out.patents),
            clinical_trials: BucketSummary::from_records(&out.clinical_trials),
            molecules: BucketSummary::from_records(&out.molecules),
        };
        out
    }
}

fn sort_for_presentation(records: &mut [Record]) {
    records.sort_by_cached_key(|r| (std::cmp::Reverse(r.quality_score), r.identity_key()));
}
