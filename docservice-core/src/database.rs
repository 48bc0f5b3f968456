//! The database handle shared by services.
//!
//! A [`Database`] wraps a driver in an `Arc`, so it is cheap to clone and can be handed to
//! every service of an application.
//!
//! # Example
//!
//! ```ignore
//! use docservice_core::database::Database;
//!
//! let database = Database::new(driver);
//! let people = database.service::<PersonService>();
//! ```

use std::sync::Arc;

use crate::{
    config::RetryConfig,
    driver::Driver,
    error::ServiceResult,
    service::{Service, ServiceSpec},
    transaction::TransactionManager,
};

/// A cloneable handle to a database driver.
///
/// # Type Parameters
///
/// * `D` - The driver implementation type
#[derive(Debug)]
pub struct Database<D: Driver> {
    driver: Arc<D>,
    // number of rule-driven deletes this handle was passed down through
    cascade_depth: usize,
}

impl<D: Driver> Clone for Database<D> {
    fn clone(&self) -> Self {
        Self { driver: Arc::clone(&self.driver), cascade_depth: self.cascade_depth }
    }
}

impl<D: Driver> Database<D> {
    /// Creates a new database handle with the given driver.
    pub fn new(driver: D) -> Self {
        Self { driver: Arc::new(driver), cascade_depth: 0 }
    }

    /// Returns a reference to the underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// How many delete rules this handle was handed down through.
    ///
    /// Services created from the handle a delete rule receives inherit its depth, so a
    /// cascade that crosses services is still bounded.
    pub fn cascade_depth(&self) -> usize {
        self.cascade_depth
    }

    pub(crate) fn one_level_deeper(&self) -> Self {
        Self { driver: Arc::clone(&self.driver), cascade_depth: self.cascade_depth + 1 }
    }

    /// Creates the service described by `S`.
    pub fn service<S: ServiceSpec>(&self) -> Service<S, D> {
        Service::new(self.clone())
    }

    /// Starts a new driver session.
    pub async fn start_session(&self) -> ServiceResult<D::Session> {
        self.driver.start_session().await
    }

    /// Whether the connected deployment supports multi-document transactions.
    pub async fn supports_transactions(&self) -> ServiceResult<bool> {
        self.driver.supports_transactions().await
    }

    /// Returns a transaction manager using the given retry policy.
    pub fn transactions(&self, retry: RetryConfig) -> TransactionManager<'_, D> {
        TransactionManager::new(&self.driver, retry)
    }
}
