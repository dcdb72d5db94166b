use serde::Serialize;
use shared_types::KeystoreConfig;

/// An index maintained over the keystore collection.
///
/// The id index is the record location itself; the others are materialised
/// as index objects under `indexes/<prefix>/...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: &'static str,
    pub fields: &'static [&'static str],
    pub unique: bool,
    /// Field that must exist for a record to be indexed.
    pub partial_on: Option<&'static str>,
    pub(crate) prefix: &'static str,
}

pub const ID_INDEX: IndexDefinition = IndexDefinition {
    name: "config.id_1",
    fields: &["config.id"],
    unique: true,
    partial_on: None,
    prefix: "keystores",
};

pub const CONTROLLER_INDEX: IndexDefinition = IndexDefinition {
    name: "config.controller_1",
    fields: &["config.controller"],
    unique: false,
    partial_on: None,
    prefix: "controller",
};

pub const REFERENCE_INDEX: IndexDefinition = IndexDefinition {
    name: "config.controller_1_config.referenceId_1",
    fields: &["config.controller", "config.referenceId"],
    unique: true,
    partial_on: Some("config.referenceId"),
    prefix: "reference",
};

pub const METER_INDEX: IndexDefinition = IndexDefinition {
    name: "config.meterId_1",
    fields: &["config.meterId"],
    unique: false,
    partial_on: Some("config.meterId"),
    prefix: "meter",
};

impl IndexDefinition {
    /// The value `config` is filed under in this index, if it is indexed.
    pub(crate) fn value_of<'c>(&self, config: &'c KeystoreConfig) -> Option<&'c str> {
        match self.prefix {
            "keystores" => Some(&config.id),
            "controller" => Some(&config.controller),
            "reference" => config.reference_id.as_deref(),
            "meter" => config.meter_id.as_deref(),
            _ => None,
        }
    }
}

/// Every index the keystore collection relies on.
pub const KEYSTORE_INDEXES: [IndexDefinition; 4] =
    [ID_INDEX, CONTROLLER_INDEX, REFERENCE_INDEX, METER_INDEX];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlanStage {
    /// Point lookup through a unique index.
    #[serde(rename = "IDHACK")]
    IdLookup,
    /// Range scan over index entries.
    #[serde(rename = "IXSCAN")]
    IndexScan,
}

/// Execution statistics for a query, returned by the `explain_*` operations
/// instead of data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    pub stage: PlanStage,
    pub index: &'static str,
    pub keys_examined: usize,
    pub docs_examined: usize,
    pub n_returned: usize,
}

impl QueryPlan {
    pub fn is_index_covered(&self) -> bool {
        KEYSTORE_INDEXES.iter().any(|index| index.name == self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_indexes() {
        let unique: Vec<_> = KEYSTORE_INDEXES
            .iter()
            .filter(|index| index.unique)
            .map(|index| index.name)
            .collect();
        assert_eq!(unique, vec![ID_INDEX.name, REFERENCE_INDEX.name]);
    }

    #[test]
    fn test_partial_indexes() {
        assert_eq!(REFERENCE_INDEX.partial_on, Some("config.referenceId"));
        assert_eq!(METER_INDEX.partial_on, Some("config.meterId"));
        assert_eq!(CONTROLLER_INDEX.partial_on, None);
    }

    #[test]
    fn test_indexed_values() {
        let config = KeystoreConfig::new("ks-1", "alice", "ssm-v1").with_meter_id("meter-1");

        assert_eq!(ID_INDEX.value_of(&config), Some("ks-1"));
        assert_eq!(CONTROLLER_INDEX.value_of(&config), Some("alice"));
        assert_eq!(METER_INDEX.value_of(&config), Some("meter-1"));
        assert_eq!(REFERENCE_INDEX.value_of(&config), None);
    }

    #[test]
    fn test_plan_serialization() {
        let plan = QueryPlan {
            stage: PlanStage::IndexScan,
            index: CONTROLLER_INDEX.name,
            keys_examined: 2,
            docs_examined: 2,
            n_returned: 2,
        };
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["stage"], "IXSCAN");
        assert_eq!(json["keysExamined"], 2);
        assert!(plan.is_index_covered());
    }
}
