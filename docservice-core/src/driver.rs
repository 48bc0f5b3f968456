//! Database driver abstraction.
//!
//! This module defines the traits that services use to talk to a database. A [`Driver`] owns
//! the connection and executes collection-level operations; a [`DriverSession`] carries
//! transaction state between those operations.
//!
//! # Overview
//!
//! Every collection operation takes an optional session. Passing `Some(session)` runs the
//! operation inside whatever transaction the session currently holds; passing `None` runs it
//! on its own, outside any transaction.
//!
//! # Traits
//!
//! - [`Driver`]: Collection operations, index management and session creation
//! - [`DriverSession`]: Transaction control for a single logical session
//! - [`DriverBuilder`]: Factory trait for creating driver instances
//!
//! # Examples
//!
//! ```ignore
//! use docservice_core::driver::{Driver, DriverSession};
//! use bson::doc;
//!
//! let mut session = driver.start_session().await?;
//! session.start_transaction().await?;
//! driver.insert_one("people", doc! { "name": "Ada" }, Some(&mut session)).await?;
//! session.commit_transaction().await?;
//! ```

use async_trait::async_trait;
use bson::{Bson, Document};
use std::fmt::Debug;

use crate::{error::ServiceResult, index::IndexSpec};

/// Options for [`Driver::find`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Sort document, e.g. `{ "name": 1 }`.
    pub sort: Option<Document>,
    /// Number of documents to skip.
    pub skip: Option<u64>,
    /// Maximum number of documents to return.
    pub limit: Option<i64>,
    /// Projection document.
    pub projection: Option<Document>,
}

/// The result of an update operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Number of documents that matched the filter.
    pub matched_count: u64,
    /// Number of documents that were actually changed.
    pub modified_count: u64,
}

/// The result of a delete operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Number of documents that were removed.
    pub deleted_count: u64,
}

/// A logical database session.
///
/// Dropping a session ends it. An uncommitted transaction held by a dropped session is
/// discarded, so cancelling an operation midway never leaves partial writes behind.
#[async_trait]
pub trait DriverSession: Send + Debug {
    /// Whether a transaction is currently open on this session.
    fn in_transaction(&self) -> bool;

    /// Opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if a transaction is already open or the server rejects it.
    async fn start_transaction(&mut self) -> ServiceResult<()>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::TransientTransaction`](crate::error::ServiceError::TransientTransaction)
    /// on write conflicts or unknown commit results. The transaction is closed either way.
    async fn commit_transaction(&mut self) -> ServiceResult<()>;

    /// Rolls back the open transaction.
    async fn abort_transaction(&mut self) -> ServiceResult<()>;

    /// Forgets the open transaction without waiting for the server.
    ///
    /// Called when the operation that opened the transaction is dropped before it could
    /// commit or abort. Writes of the discarded transaction must never become visible, and
    /// the session must be usable for a new transaction afterwards.
    fn discard_transaction(&mut self);
}

/// Abstract interface for database drivers.
///
/// # Thread Safety
///
/// Drivers are shared between services and tasks, so implementations must be `Send + Sync`.
/// Sessions are not shared: each is used by one operation chain at a time through `&mut`.
///
/// # Error Handling
///
/// Server errors are mapped to [`ServiceError::Backend`](crate::error::ServiceError::Backend),
/// except transaction conflicts which map to
/// [`ServiceError::TransientTransaction`](crate::error::ServiceError::TransientTransaction).
#[async_trait]
pub trait Driver: Send + Sync + Debug + 'static {
    /// The session type of this driver.
    type Session: DriverSession + 'static;

    /// Starts a new session.
    async fn start_session(&self) -> ServiceResult<Self::Session>;

    /// Whether the connected deployment supports multi-document transactions.
    async fn supports_transactions(&self) -> ServiceResult<bool>;

    /// Returns the documents matching `filter`.
    ///
    /// # Arguments
    ///
    /// * `collection` - The name of the collection to query
    /// * `filter` - A MongoDB filter document
    /// * `options` - Sorting, pagination and projection
    /// * `session` - Optional session the read takes part in
    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
        session: Option<&mut Self::Session>,
    ) -> ServiceResult<Vec<Document>>;

    /// Returns the first document matching `filter`, if any.
    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        session: Option<&mut Self::Session>,
    ) -> ServiceResult<Option<Document>> {
        let options = FindOptions { limit: Some(1), ..FindOptions::default() };
        let documents = self.find(collection, filter, options, session).await?;
        Ok(documents.into_iter().next())
    }

    /// Counts the documents matching `filter`.
    async fn count_documents(
        &self,
        collection: &str,
        filter: Document,
        session: Option<&mut Self::Session>,
    ) -> ServiceResult<u64>;

    /// Inserts a document and returns its `_id`. A missing `_id` is generated.
    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
        session: Option<&mut Self::Session>,
    ) -> ServiceResult<Bson>;

    /// Inserts several documents and returns their `_id`s in input order.
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<&mut Self::Session>,
    ) -> ServiceResult<Vec<Bson>>;

    /// Applies `update` to the first document matching `filter`.
    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        session: Option<&mut Self::Session>,
    ) -> ServiceResult<UpdateOutcome>;

    /// Applies `update` to every document matching `filter`.
    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        session: Option<&mut Self::Session>,
    ) -> ServiceResult<UpdateOutcome>;

    /// Deletes the first document matching `filter`.
    async fn delete_one(
        &self,
        collection: &str,
        filter: Document,
        session: Option<&mut Self::Session>,
    ) -> ServiceResult<DeleteOutcome>;

    /// Deletes every document matching `filter`.
    async fn delete_many(
        &self,
        collection: &str,
        filter: Document,
        session: Option<&mut Self::Session>,
    ) -> ServiceResult<DeleteOutcome>;

    /// Runs an aggregation pipeline and returns the resulting documents.
    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
        session: Option<&mut Self::Session>,
    ) -> ServiceResult<Vec<Document>>;

    /// Creates an index and returns its name.
    async fn create_index(
        &self,
        collection: &str,
        name: &str,
        index: &IndexSpec,
        session: Option<&mut Self::Session>,
    ) -> ServiceResult<String>;

    /// Drops the index with the given name.
    async fn drop_index(
        &self,
        collection: &str,
        name: &str,
        session: Option<&mut Self::Session>,
    ) -> ServiceResult<()>;

    /// Drops every index of a collection except the one on `_id`.
    async fn drop_indexes(
        &self,
        collection: &str,
        session: Option<&mut Self::Session>,
    ) -> ServiceResult<()>;

    /// Lists the names of the indexes of a collection.
    async fn list_index_names(&self, collection: &str) -> ServiceResult<Vec<String>>;
}

/// Factory trait for drivers that need asynchronous setup (connecting, probing the server).
#[async_trait]
pub trait DriverBuilder {
    type Driver: Driver;

    async fn build(self) -> ServiceResult<Self::Driver>;
}
