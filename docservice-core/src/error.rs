//! Error types and result types for service operations.
//!
//! Every fallible operation in this crate returns a [`ServiceResult<T>`]. The variants of
//! [`ServiceError`] follow the life of an operation: query construction errors are raised
//! before any I/O, hook errors are wrapped with the name of the rule that raised them, and
//! transaction errors carry the underlying cause.

use std::convert::Infallible;

use bson::error::Error as BsonError;
use thiserror::Error;

/// Represents all possible errors that can occur when working with a service.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Serialization/deserialization error when converting between models and BSON.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Error during driver initialization or connection setup.
    #[error("Initialization error: {0}")]
    Initialization(String),
    /// Stored data does not match the declared model.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// A document with the given ID already exists in the collection.
    /// The first argument is the document ID, the second is the collection name.
    #[error("Document {0} already exists in collection {1}")]
    DocumentAlreadyExists(String, String),
    /// A comparison was built with a value that does not fit the field's declared type.
    #[error("Type mismatch on field '{field}': expected {expected}, found {found}")]
    TypeMismatch {
        /// The dotted path of the field.
        field: String,
        /// The declared value kind of the field.
        expected: String,
        /// The BSON type of the offending value.
        found: String,
    },
    /// The query or update is structurally invalid.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    /// A hook rejected the operation. Hook authors raise this through [`ServiceError::rejected`].
    #[error("{0}")]
    Rejected(String),
    /// A validator rejected an insert or update. Nothing was written.
    #[error("Validation failed in {rule}: {source}")]
    ValidationFailed {
        /// The qualified name of the validator.
        rule: String,
        /// The error raised by the validator.
        source: Box<ServiceError>,
    },
    /// A `deny` delete rule rejected a deletion. Nothing was written.
    #[error("Delete denied by {rule}: {source}")]
    DeleteDenied {
        /// The qualified name of the delete rule.
        rule: String,
        /// The error raised by the delete rule.
        source: Box<ServiceError>,
    },
    /// A `pre` or `post` delete rule failed. The enclosing transaction was rolled back.
    #[error("Delete rule {rule} failed: {source}")]
    DeleteRuleFailed {
        /// The qualified name of the delete rule.
        rule: String,
        /// The error raised by the delete rule.
        source: Box<ServiceError>,
    },
    /// Delete rules kept deleting through nested services past the configured depth,
    /// usually because the relation they follow is cyclic.
    #[error("Cascading delete in collection {collection} exceeded depth {depth}")]
    CascadeTooDeep {
        /// The collection whose deletion went one level too deep.
        collection: String,
        /// The configured maximum depth.
        depth: usize,
    },
    /// The operation required a matching document but none was found.
    #[error("No document matched {filter} in collection {collection}")]
    NotFound {
        /// The collection that was queried.
        collection: String,
        /// The filter that matched nothing.
        filter: String,
    },
    /// A transactional write could not be committed.
    #[error("Transaction aborted after {attempts} attempt(s): {source}")]
    TransactionAborted {
        /// The number of times the transaction body was executed.
        attempts: usize,
        /// The last error observed.
        source: Box<ServiceError>,
    },
    /// The database reported a write conflict or an unknown commit result.
    /// The whole transaction may be retried.
    #[error("Transient transaction error: {0}")]
    TransientTransaction(String),
    /// An error occurred in the underlying database driver.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl ServiceError {
    /// Creates the error a validator or delete rule returns to reject an operation.
    ///
    /// ```ignore
    /// if parent.is_none() {
    ///     return Err(ServiceError::rejected("Parent does not exist."));
    /// }
    /// ```
    pub fn rejected(reason: impl Into<String>) -> Self {
        ServiceError::Rejected(reason.into())
    }

    /// Whether re-running the whole transaction may succeed.
    ///
    /// Rule wrappers are transparent: a write conflict raised by a cascading delete inside a
    /// `pre` rule is still transient.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::TransientTransaction(_) => true,
            ServiceError::ValidationFailed { source, .. }
            | ServiceError::DeleteDenied { source, .. }
            | ServiceError::DeleteRuleFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Returns the innermost error, unwrapping rule and transaction wrappers.
    pub fn root_cause(&self) -> &ServiceError {
        match self {
            ServiceError::ValidationFailed { source, .. }
            | ServiceError::DeleteDenied { source, .. }
            | ServiceError::DeleteRuleFailed { source, .. }
            | ServiceError::TransactionAborted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// A specialized `Result` type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

impl From<BsonError> for ServiceError {
    fn from(err: BsonError) -> Self {
        ServiceError::Serialization(err.to_string())
    }
}

impl From<Infallible> for ServiceError {
    fn from(err: Infallible) -> Self {
        match err {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_seen_through_rule_wrappers() {
        let error = ServiceError::DeleteRuleFailed {
            rule: "TreeNodeService.delete_subtree".to_string(),
            source: Box::new(ServiceError::TransientTransaction("write conflict".to_string())),
        };

        assert!(error.is_transient());
        assert!(!ServiceError::rejected("nope").is_transient());
        assert!(
            !ServiceError::TransactionAborted {
                attempts: 4,
                source: Box::new(ServiceError::TransientTransaction("write conflict".to_string())),
            }
            .is_transient()
        );
    }

    #[test]
    fn root_cause_unwraps_nested_rules() {
        let error = ServiceError::DeleteRuleFailed {
            rule: "outer".to_string(),
            source: Box::new(ServiceError::DeleteDenied {
                rule: "inner".to_string(),
                source: Box::new(ServiceError::rejected("Can not delete root nodes.")),
            }),
        };

        assert!(matches!(error.root_cause(), ServiceError::Rejected(reason) if reason == "Can not delete root nodes."));
    }
}
