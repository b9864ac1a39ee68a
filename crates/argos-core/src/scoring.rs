//! Completeness-based quality scoring.

use std::collections::BTreeMap;

use crate::models::{Field, Record};

/// Weight of each scored field.
///
/// | field               | default |
/// |---------------------|---------|
/// | identifier          | 20      |
/// | category            | 20      |
/// | title               | 15      |
/// | description         | 10      |
/// | responsible party   | 10      |
/// | key date            | 10      |
/// | secondary names     | 5       |
/// | classifications     | 5       |
/// | secondary date      | 5       |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldWeights {
    weights: BTreeMap<Field, u32>,
}

impl Default for FieldWeights {
    fn default() -> Self {
        let weights = [
            (Field::Identifier, 20),
            (Field::Category, 20),
            (Field::Title, 15),
            (Field::Description, 10),
            (Field::ResponsibleParty, 10),
            (Field::KeyDate, 10),
            (Field::SecondaryNames, 5),
            (Field::Classifications, 5),
            (Field::SecondaryDate, 5),
        ]
        .into_iter()
        .collect();
        Self { weights }
    }
}

impl FieldWeights {
    pub fn with_weight(mut self, field: Field, weight: u32) -> Self {
        self.weights.insert(field, weight);
        self
    }

    pub fn weight(&self, field: Field) -> u32 {
        self.weights.get(&field).copied().unwrap_or(0)
    }

    /// Sum of all weights, saturating at `u32::MAX`.
    pub fn total(&self) -> u32 {
        self.weights.values().fold(0, |acc, w| acc.saturating_add(*w))
    }
}

/// Scores records 0-100 from which weighted fields are populated.
#[derive(Debug, Clone, Default)]
pub struct QualityScorer {
    weights: FieldWeights,
}

impl QualityScorer {
    pub fn new(weights: FieldWeights) -> Self {
        Self { weights }
    }

    pub fn score(&self, record: &Record) -> u8 {
        let total = self.weights.total();
        if total == 0 {
            return 0;
        }
        let present: u32 = Field::ALL
            .iter()
            .filter(|f| record.is_populated(**f))
            .map(|f| self.weights.weight(*f))
            .fold(0, u32::saturating_add);
        ((f64::from(present) * 100.0 / f64::from(total)).round() as u32).min(100) as u8
    }

    /// Fill in `quality_score` on every record.
    pub fn score_all(&self, records: &mut [Record]) {
        for record in records {
            record.quality_score = self.score(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;

    fn full_patent() -> Record {
        let mut record = Record::new(RecordKind::Patent, "WO2020123456", "WO", "wipo")
            .with_title("Title")
            .with_description("Abstract")
            .with_key_date("2019-01-01")
            .with_secondary_date("2020-07-01");
        record.responsible_party = vec!["Acme".into()];
        record.secondary_names = vec!["Doe".into()];
        record.classifications = vec!["A61K".into()];
        record
    }

    #[test]
    fn default_weights_sum_to_100() {
        assert_eq!(FieldWeights::default().total(), 100);
    }

    #[test]
    fn complete_record_scores_100() {
        assert_eq!(QualityScorer::default().score(&full_patent()), 100);
    }

    #[test]
    fn partial_record_scores_weighted_sum() {
        let record = Record::new(RecordKind::Patent, "WO2020123456", "WO", "wipo").with_title("T");
        assert_eq!(QualityScorer::default().score(&record), 55);
    }

    #[test]
    fn score_is_deterministic() {
        let scorer = QualityScorer::default();
        let record = full_patent();
        let first = scorer.score(&record);
        for _ in 0..10 {
            assert_eq!(scorer.score(&record), first);
        }
    }

    #[test]
    fn adding_a_field_never_lowers_score() {
        let scorer = QualityScorer::default();
        let full = full_patent();
        let mut record = Record::new(RecordKind::Patent, "WO1", "", "x");
        let mut previous = scorer.score(&record);

        let steps: Vec<Box<dyn Fn(&mut Record) + '_>> = vec![
            Box::new(|r: &mut Record| r.category = "WO".into()),
            Box::new(|r: &mut Record| r.title = full.title.clone()),
            Box::new(|r: &mut Record| r.secondary_names = full.secondary_names.clone()),
            Box::new(|r: &mut Record| r.description = full.description.clone()),
            Box::new(|r: &mut Record| r.secondary_date = full.secondary_date.clone()),
            Box::new(|r: &mut Record| r.key_date = full.key_date.clone()),
        ];
        for step in steps {
            step(&mut record);
            let next = scorer.score(&record);
            assert!(next >= previous, "{next} < {previous}");
            previous = next;
        }
    }

    #[test]
    fn custom_weights_are_normalized() {
        let weights = FieldWeights::default().with_weight(Field::Title, 115);
        let record = Record::new(RecordKind::Patent, "", "", "x").with_title("T");
        assert_eq!(QualityScorer::new(weights).score(&record), 58);
    }

    #[test]
    fn extreme_weights_saturate() {
        let weights = Field::ALL
            .iter()
            .fold(FieldWeights::default(), |w, f| w.with_weight(*f, u32::MAX));
        assert_eq!(weights.total(), u32::MAX);

        let scorer = QualityScorer::new(weights);
        assert_eq!(scorer.score(&full_patent()), 100);
        let sparse = Record::new(RecordKind::Patent, "WO1", "", "x");
        assert!(scorer.score(&sparse) <= 100);
    }

    #[test]
    fn score_all_fills_records() {
        let mut records = vec![full_patent()];
        QualityScorer::default().score_all(&mut records);
        assert_eq!(records[0].quality_score, 100);
    }
}
