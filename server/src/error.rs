use std::fmt;
use std::sync::Arc;
use thiserror::Error;

type BoxedSource = Arc<dyn std::error::Error + Send + Sync>;

/// Machine-readable category of a [`KeystoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input; fix the request and retry.
    Data,
    /// Uniqueness violation on `id` or `(controller, referenceId)`.
    Duplicate,
    /// CAS precondition failed; re-read and decide whether to retry.
    InvalidState,
    NotFound,
    /// Cancellation observed while computing usage.
    Abort,
    /// Failure in the persistent store or an external collaborator.
    Storage,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Data => "DataError",
            ErrorKind::Duplicate => "DuplicateError",
            ErrorKind::InvalidState => "InvalidStateError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::Abort => "AbortError",
            ErrorKind::Storage => "StorageError",
        }
    }

    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::Data => 400,
            ErrorKind::Duplicate | ErrorKind::InvalidState => 409,
            ErrorKind::NotFound => 404,
            ErrorKind::Abort => 503,
            ErrorKind::Storage => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors raised by the keystore configuration store.
///
/// Cloneable so that a failed single-flight fetch can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum KeystoreError {
    #[error("{0}")]
    Data(String),

    #[error("Duplicate keystore configuration: {id}")]
    Duplicate {
        id: String,
        reference_id: Option<String>,
    },

    #[error(
        "Could not update keystore configuration {id} to sequence {sequence}. \
         Record sequence and \"kmsModule\" do not match or keystore does not exist."
    )]
    InvalidState { id: String, sequence: u64 },

    #[error("Keystore configuration not found: {keystore_id}")]
    KeystoreNotFound { keystore_id: String },

    #[error("KMS module \"{kms_module}\" cannot report key counts.")]
    KeyCountUnsupported { kms_module: String },

    #[error("Computing metered storage for meter {meter_id} aborted.")]
    Aborted { meter_id: String },

    #[error("Object store error: {0}")]
    ObjectStore(#[source] Arc<object_store::Error>),

    #[error("Malformed keystore record: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),

    #[error("KMS module \"{kms_module}\" failed: {source}")]
    Module {
        kms_module: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Storage usage aggregation for meter {meter_id} failed: {source}")]
    Aggregate {
        meter_id: String,
        #[source]
        source: BoxedSource,
    },
}

impl KeystoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeystoreError::Data(_) => ErrorKind::Data,
            KeystoreError::Duplicate { .. } => ErrorKind::Duplicate,
            KeystoreError::InvalidState { .. } => ErrorKind::InvalidState,
            KeystoreError::KeystoreNotFound { .. } | KeystoreError::KeyCountUnsupported { .. } => {
                ErrorKind::NotFound
            }
            KeystoreError::Aborted { .. } => ErrorKind::Abort,
            KeystoreError::ObjectStore(_)
            | KeystoreError::Serialization(_)
            | KeystoreError::Module { .. }
            | KeystoreError::Aggregate { .. } => ErrorKind::Storage,
        }
    }

    pub(crate) fn module(kms_module: &str, err: anyhow::Error) -> Self {
        KeystoreError::Module {
            kms_module: kms_module.to_string(),
            source: Arc::from(Box::<dyn std::error::Error + Send + Sync>::from(err)),
        }
    }

    pub(crate) fn aggregate(meter_id: &str, err: anyhow::Error) -> Self {
        KeystoreError::Aggregate {
            meter_id: meter_id.to_string(),
            source: Arc::from(Box::<dyn std::error::Error + Send + Sync>::from(err)),
        }
    }
}

impl From<object_store::Error> for KeystoreError {
    fn from(err: object_store::Error) -> Self {
        KeystoreError::ObjectStore(Arc::new(err))
    }
}

impl From<serde_json::Error> for KeystoreError {
    fn from(err: serde_json::Error) -> Self {
        KeystoreError::Serialization(Arc::new(err))
    }
}

pub type KeystoreResult<T> = Result<T, KeystoreError>;
