//! Error types and result types for mapper operations.
//!
//! Every fallible operation in this crate returns a [`MapperResult<T>`]. Validation and
//! query-construction errors surface at the call that caused them, before any store call;
//! store failures surface after commit compensation has run.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

use crate::driver::WriteOutcome;

/// Represents all possible errors raised by the mapper, its session and its store drivers.
#[derive(Error, Debug)]
pub enum MapperError {
    /// A value failed validation (type, shape, range, length or a user-supplied validator).
    #[error("Bad value for field \"{field}\": {reason} (value: {value})")]
    BadValue {
        field: String,
        value: String,
        reason: String,
        #[source]
        cause: Option<Box<MapperError>>,
    },
    /// A required field has no value at a point that requires a complete document.
    #[error("Missing value for required field: {0}")]
    MissingValue(String),
    /// A field was not loaded because the document was only partially retrieved.
    #[error("Field was not retrieved: {0}")]
    FieldNotRetrieved(String),
    /// A field has no value and no default.
    #[error("Field is not set: {0}")]
    FieldNotSet(String),
    /// A value was supplied for a name that is not a field of the schema.
    #[error("Unknown field: {0}")]
    ExtraValue(String),
    /// A field path could not be resolved against a schema.
    #[error("Field not found: {segment} (in {path})")]
    FieldNotFound { segment: String, path: String },
    /// A query could not be built (conflicting constraints, duplicate sort or hint, ...).
    #[error("Bad query: {0}")]
    BadQuery(String),
    /// An update modifier is not allowed on the target field.
    #[error("Invalid modifier for field {field}: {modifier}")]
    InvalidModifier { field: String, modifier: String },
    /// A targeted update has neither an identity filter nor a document identity.
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),
    /// A query referenced more than one collection.
    #[error("Query references more than one collection: {0:?}")]
    MultipleCollectionsFound(Vec<String>),
    /// A query referenced more than one document type.
    #[error("Query references more than one document type: {0:?}")]
    MultipleObjectsDetected(Vec<String>),
    /// A single-result query matched no document.
    #[error("No result found")]
    NoResultFound,
    /// A single-result query matched more than one document.
    #[error("Too many results for a single-result query")]
    TooManyResults,
    /// A reference could not be resolved and nulls were not allowed.
    #[error("Bad reference: {0}")]
    BadReference(String),
    /// A session or transaction scope was ended in an invalid state.
    #[error("Transaction error: {0}")]
    Transaction(String),
    /// A field or schema was declared with an invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// No schema is registered under the given name.
    #[error("Unknown document type: {0}")]
    UnknownType(String),
    /// A commit or query was cancelled at a store-call boundary.
    #[error("Operation cancelled")]
    Cancelled,
    /// Serialization/deserialization error when converting between BSON and JSON.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Error during store initialization or connection setup.
    #[error("Initialization error: {0}")]
    Initialization(String),
    /// A document with the given identity already exists in the collection.
    #[error("Document {0} already exists in collection {1}")]
    DocumentAlreadyExists(String, String),
    /// The requested collection does not exist in the store.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
    /// An ordered bulk write stopped after the models in `completed` were applied.
    #[error("Bulk write failed after {} operations: {source}", .completed.len())]
    BulkWrite {
        /// Outcomes of the applied models, in order.
        completed: Vec<WriteOutcome>,
        #[source]
        source: Box<MapperError>,
    },
    /// An error occurred in the underlying store driver.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// A specialized `Result` type for mapper operations.
pub type MapperResult<T> = Result<T, MapperError>;

impl MapperError {
    /// Builds a [`MapperError::BadValue`] without a cause.
    pub fn bad_value(field: impl Into<String>, value: impl std::fmt::Debug, reason: impl Into<String>) -> Self {
        MapperError::BadValue {
            field: field.into(),
            value: format!("{value:?}"),
            reason: reason.into(),
            cause: None,
        }
    }

    /// Attaches the error that triggered this one. Only `BadValue` carries a cause.
    pub fn with_cause(self, cause: MapperError) -> Self {
        match self {
            MapperError::BadValue { field, value, reason, .. } => MapperError::BadValue {
                field,
                value,
                reason,
                cause: Some(Box::new(cause)),
            },
            other => other,
        }
    }

    /// Returns the underlying error of a bulk write failure, or `self`.
    pub fn root(&self) -> &MapperError {
        match self {
            MapperError::BulkWrite { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn field_not_found(segment: &str, path: &str) -> Self {
        MapperError::FieldNotFound {
            segment: segment.to_string(),
            path: path.to_string(),
        }
    }
}

impl From<BsonError> for MapperError {
    fn from(err: BsonError) -> Self {
        MapperError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for MapperError {
    fn from(err: SerdeJsonError) -> Self {
        MapperError::Serialization(err.to_string())
    }
}
