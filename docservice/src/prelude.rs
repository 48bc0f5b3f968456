//! Convenient re-exports of commonly used types from docservice.
//!
//! Import this prelude module to quickly access the most frequently used types
//! and traits without needing to import from multiple sub-modules:
//!
//! ```ignore
//! use docservice::prelude::*;
//! ```
//!
//! This provides access to:
//! - Service declarations and the service handle
//! - Query construction, filtering and aggregation
//! - Validators and delete rules
//! - Driver traits and builders

pub use docservice_core::{
    aggregation::{Aggregation, AggregationStage},
    config::{RetryConfig, ServiceConfig},
    database::Database,
    document::{FromStorageMapping, PrimaryKey, ToStorageMapping, ID_FIELD},
    driver::{DeleteOutcome, Driver, DriverBuilder, DriverSession, FindOptions, UpdateOutcome},
    error::{ServiceError, ServiceResult},
    index::IndexSpec,
    query::{Clause, ComparisonOp, Field, Filter, Query, QueryBuilder, QueryVisitor, Sort, SortDirection, ValueKind},
    rules::{DeletePhase, DeleteRule, Payload, RuleSet, RuleSetBuilder, Validator, ValidatorKind},
    service::{Service, ServiceSpec},
    transaction::TransactionManager,
};
pub use bson::{Bson, Document, doc, oid::ObjectId};
