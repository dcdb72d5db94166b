use serde::Deserialize;
use shared_types::{KeystoreConfig, KeystoreRecord};
use std::cmp::Ordering;

/// Extra filters for a controller-scoped lookup.
///
/// Carries no controller field; the controller is a separate argument of
/// every find and is always applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystoreQuery {
    pub reference_id: Option<String>,
    pub meter_id: Option<String>,
    pub kms_module: Option<String>,
}

impl KeystoreQuery {
    pub fn by_reference_id(reference_id: impl Into<String>) -> Self {
        Self {
            reference_id: Some(reference_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, config: &KeystoreConfig) -> bool {
        fn field_matches(filter: Option<&String>, value: Option<&String>) -> bool {
            filter.map_or(true, |expected| value == Some(expected))
        }

        field_matches(self.reference_id.as_ref(), config.reference_id.as_ref())
            && field_matches(self.meter_id.as_ref(), config.meter_id.as_ref())
            && field_matches(self.kms_module.as_ref(), Some(&config.kms_module))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    Id,
    Sequence,
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Result shaping for a find. Without a sort the store order is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub sort: Option<(SortField, SortOrder)>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sorted(field: SortField, order: SortOrder) -> Self {
        Self {
            sort: Some((field, order)),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn apply(&self, mut records: Vec<KeystoreRecord>) -> Vec<KeystoreRecord> {
        if let Some((field, order)) = self.sort {
            records.sort_by(|a, b| {
                let ordering = compare_by(field, a, b);
                match order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
        records
    }
}

fn compare_by(field: SortField, a: &KeystoreRecord, b: &KeystoreRecord) -> Ordering {
    match field {
        SortField::Id => a.config.id.cmp(&b.config.id),
        SortField::Sequence => a.config.sequence.cmp(&b.config.sequence),
        SortField::Created => a.meta.created.cmp(&b.meta.created),
        SortField::Updated => a.meta.updated.cmp(&b.meta.updated),
    }
}

/// A query whose execution plan can be requested from the store.
#[derive(Debug, Clone, Copy)]
pub enum ExplainTarget<'a> {
    /// Point lookup of a record by id.
    Record { id: &'a str },
    /// Controller-scoped find.
    Find {
        controller: &'a str,
        query: &'a KeystoreQuery,
    },
    /// The match check of a compare-and-swap.
    CompareAndSwap {
        id: &'a str,
        expected_sequence: u64,
        expected_kms_module: &'a str,
    },
    /// Scan of every keystore under a meter.
    Meter { meter_id: &'a str },
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::RecordMeta;

    fn record(id: &str, sequence: u64) -> KeystoreRecord {
        let mut config = KeystoreConfig::new(id, "alice", "ssm-v1");
        config.sequence = sequence;
        KeystoreRecord {
            meta: RecordMeta::now(),
            config,
        }
    }

    #[test]
    fn test_query_matches_optional_fields() {
        let config = KeystoreConfig::new("ks-1", "alice", "ssm-v1").with_meter_id("m-1");

        assert!(KeystoreQuery::default().matches(&config));
        assert!(KeystoreQuery {
            meter_id: Some("m-1".into()),
            ..KeystoreQuery::default()
        }
        .matches(&config));
        assert!(!KeystoreQuery::by_reference_id("primary").matches(&config));
        assert!(!KeystoreQuery {
            kms_module: Some("other".into()),
            ..KeystoreQuery::default()
        }
        .matches(&config));
    }

    #[test]
    fn test_sort_and_limit() {
        let records = vec![record("b", 2), record("c", 0), record("a", 1)];

        let by_id = FindOptions::sorted(SortField::Id, SortOrder::Asc).apply(records.clone());
        let ids: Vec<_> = by_id.iter().map(|r| r.config.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let top = FindOptions::sorted(SortField::Sequence, SortOrder::Desc)
            .with_limit(2)
            .apply(records.clone());
        let sequences: Vec<_> = top.iter().map(|r| r.config.sequence).collect();
        assert_eq!(sequences, vec![2, 1]);

        let unsorted = FindOptions::default().apply(records);
        assert_eq!(unsorted[0].config.id, "b");
    }
}
