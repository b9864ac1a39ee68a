//! Cross-source deduplication by normalized identity key.
//!
//! Records sharing an identity key are merged field by field. Empty fields
//! are filled from the other record; when both have a value, the record with
//! more populated fields wins, then the higher-priority source. The winner
//! is chosen independently of arrival order, so merging is commutative and
//! merging a set with itself changes nothing.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::models::Record;

/// Merges duplicate records.
#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    /// Source names, most trusted first. Unlisted sources rank after all
    /// listed ones, alphabetically.
    source_priority: Vec<String>,
}

impl Deduplicator {
    pub fn new(source_priority: Vec<String>) -> Self {
        Self { source_priority }
    }

    fn source_rank(&self, source: &str) -> usize {
        self.source_priority
            .iter()
            .position(|s| s == source)
            .unwrap_or(self.source_priority.len())
    }

    /// `Less` means `a` should be the primary record.
    fn precedence(&self, a: &Record, b: &Record) -> Ordering {
        b.completeness()
            .cmp(&a.completeness())
            .then_with(|| {
                self.source_rank(&a.provenance.source)
                    .cmp(&self.source_rank(&b.provenance.source))
            })
            .then_with(|| a.provenance.source.cmp(&b.provenance.source))
            .then_with(|| tiebreak(a).cmp(&tiebreak(b)))
    }

    /// Merge two records with the same identity key.
    pub fn merge_pair(&self, a: Record, b: Record) -> Record {
        let (mut primary, other) = if self.precedence(&a, &b) == Ordering::Greater {
            (b, a)
        } else {
            (a, b)
        };

        if primary.title.is_none() {
            primary.title = other.title;
        }
        if primary.description.is_none() {
            primary.description = other.description;
        }
        if primary.key_date.is_none() {
            primary.key_date = other.key_date;
        }
        if primary.secondary_date.is_none() {
            primary.secondary_date = other.secondary_date;
        }
        if primary.link.is_none() {
            primary.link = other.link;
        }
        if primary.responsible_party.is_empty() {
            primary.responsible_party = other.responsible_party;
        }
        if primary.secondary_names.is_empty() {
            primary.secondary_names = other.secondary_names;
        }
        if primary.classifications.is_empty() {
            primary.classifications = other.classifications;
        }
        for (key, value) in other.attributes {
            primary.attributes.entry(key).or_insert(value);
        }

        let mut seen: Vec<String> = primary
            .provenance
            .also_seen_in
            .drain(..)
            .chain(other.provenance.also_seen_in)
            .chain(std::iter::once(other.provenance.source))
            .filter(|s| *s != primary.provenance.source)
            .collect();
        seen.sort();
        seen.dedup();
        primary.provenance.also_seen_in = seen;
        if primary.provenance.extracted_by.is_none() {
            primary.provenance.extracted_by = other.provenance.extracted_by;
        }

        primary
    }

    /// Collapse duplicates. Output is ordered by identity key.
    pub fn deduplicate(&self, records: Vec<Record>) -> Vec<Record> {
        let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for record in records {
            groups.entry(record.identity_key()).or_default().push(record);
        }

        let before: usize = groups.values().map(Vec::len).sum();
        let merged: Vec<Record> = groups
            .into_values()
            .filter_map(|mut group| {
                // Fold from the strongest record so arrival order is irrelevant.
                group.sort_by(|a, b| self.precedence(a, b));
                let mut iter = group.into_iter();
                let first = iter.next()?;
                Some(iter.fold(first, |acc, next| self.merge_pair(acc, next)))
            })
            .collect();

        if merged.len() < before {
            tracing::debug!(
                before,
                after = merged.len(),
                "Merged duplicate records"
            );
        }
        merged
    }
}

type Tiebreak<'a> = (
    &'a Option<String>,
    &'a Option<String>,
    &'a Vec<String>,
    &'a Option<String>,
    &'a Vec<String>,
    &'a Vec<String>,
    &'a Option<String>,
    &'a Option<String>,
    &'a BTreeMap<String, String>,
    &'a str,
);

/// Total order over field values for records otherwise indistinguishable.
fn tiebreak(r: &Record) -> Tiebreak<'_> {
    (
        &r.title,
        &r.description,
        &r.responsible_party,
        &r.key_date,
        &r.secondary_names,
        &r.classifications,
        &r.secondary_date,
        &r.link,
        &r.attributes,
        r.identifier.as_str(),
    )
}
