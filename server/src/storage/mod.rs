mod backend;
mod config;
mod indexes;
mod query;
mod traits;


pub use backend::ObjectStoreBackend;
pub use config::{ConditionalWrites, S3Config, StorageConfig};
pub use indexes::{
    IndexDefinition, PlanStage, QueryPlan, CONTROLLER_INDEX, ID_INDEX, KEYSTORE_INDEXES,
    METER_INDEX, REFERENCE_INDEX,
};
pub use query::{ExplainTarget, FindOptions, KeystoreQuery, SortField, SortOrder};
pub use traits::KeystoreStorage;
