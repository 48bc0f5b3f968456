//! Transactional execution with retries.
//!
//! [`TransactionManager`] runs a closure inside a driver transaction. The closure receives
//! the session it must pass to every database call it makes. On a transient error the
//! transaction is rolled back and the closure is run again from the start, so it must not
//! keep side effects outside the database between attempts.
//!
//! ```ignore
//! let outcome = database
//!     .transactions(RetryConfig::default())
//!     .run(None, |session| {
//!         Box::pin(async move {
//!             driver.delete_many("nodes", doc! { "parent": id }, Some(session)).await
//!         })
//!     })
//!     .await?;
//! ```

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::{
    config::RetryConfig,
    driver::{Driver, DriverSession},
    error::{ServiceError, ServiceResult},
};

/// Runs closures inside retried transactions.
#[derive(Debug)]
pub struct TransactionManager<'d, D: Driver> {
    driver: &'d D,
    retry: RetryConfig,
}

impl<'d, D: Driver> TransactionManager<'d, D> {
    /// Creates a manager for `driver` with the given retry policy.
    pub fn new(driver: &'d D, retry: RetryConfig) -> Self {
        Self { driver, retry }
    }

    /// The retry policy of this manager.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Runs `body` in a transaction, starting a new session when none is given.
    pub async fn run<T, F>(&self, session: Option<&mut D::Session>, body: F) -> ServiceResult<T>
    where
        T: Send,
        F: for<'s> FnMut(&'s mut D::Session) -> BoxFuture<'s, ServiceResult<T>> + Send,
    {
        match session {
            Some(session) => self.run_in_transaction(session, body).await,
            None => {
                let mut session = self.driver.start_session().await?;
                self.run_in_transaction(&mut session, body).await
            }
        }
    }

    /// Runs `body` in a transaction on `session`.
    ///
    /// - If `session` already holds a transaction, `body` runs once inside it and the caller
    ///   keeps control of commit and retries.
    /// - If the deployment does not support transactions, `body` runs once without atomicity.
    /// - Otherwise a transaction is opened, `body` runs and the transaction is committed.
    ///   Transient failures when starting, running or committing abort the transaction and
    ///   restart it after a backoff.
    /// - If the returned future is dropped midway, the transaction it opened is discarded.
    ///
    /// # Errors
    ///
    /// - Errors returned by `body` that are not transient are returned unchanged after the
    ///   transaction is rolled back.
    /// - [`ServiceError::TransactionAborted`] when the retries are exhausted or starting or
    ///   committing fails with a non-transient error.
    pub async fn run_in_transaction<T, F>(
        &self,
        session: &mut D::Session,
        mut body: F,
    ) -> ServiceResult<T>
    where
        T: Send,
        F: for<'s> FnMut(&'s mut D::Session) -> BoxFuture<'s, ServiceResult<T>> + Send,
    {
        if session.in_transaction() {
            debug!("joining the transaction already open on the session");
            return body(session).await;
        }
        if !self.driver.supports_transactions().await? {
            debug!("transactions are not supported, running without atomicity");
            return body(session).await;
        }

        let mut opened = OpenedTransaction { session };
        let session = &mut *opened.session;
        let mut attempts = 0;
        loop {
            attempts += 1;
            // start and commit failures are reported as aborted transactions, body errors as is
            let (error, from_driver) = match session.start_transaction().await {
                Err(error) => (error, true),
                Ok(()) => match body(&mut *session).await {
                    Ok(value) => match session.commit_transaction().await {
                        Ok(()) => {
                            debug!(attempts, "transaction committed");
                            return Ok(value);
                        }
                        Err(error) => (error, true),
                    },
                    Err(error) => (error, false),
                },
            };
            Self::rollback(session).await;

            if !error.is_transient() {
                if from_driver {
                    return Err(ServiceError::TransactionAborted {
                        attempts,
                        source: Box::new(error),
                    });
                }
                return Err(error);
            }
            if attempts > self.retry.max_retries {
                warn!(attempts, %error, "transaction retries exhausted");
                return Err(ServiceError::TransactionAborted { attempts, source: Box::new(error) });
            }

            let backoff = self.retry.backoff_before(attempts);
            warn!(
                attempts,
                backoff_ms = backoff.as_millis() as u64,
                %error,
                "transient transaction error, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn rollback(session: &mut D::Session) {
        if !session.in_transaction() {
            return;
        }
        if let Err(error) = session.abort_transaction().await {
            warn!(%error, "failed to abort transaction");
        }
    }
}

/// A transaction opened by [`TransactionManager::run_in_transaction`].
///
/// If the call is dropped while the transaction is still open, the transaction is discarded
/// so the caller's session does not keep a stale one that later operations would join.
struct OpenedTransaction<'s, S: DriverSession> {
    session: &'s mut S,
}

impl<S: DriverSession> Drop for OpenedTransaction<'_, S> {
    fn drop(&mut self) {
        if self.session.in_transaction() {
            warn!("transaction dropped before it finished, discarding it");
            self.session.discard_transaction();
        }
    }
}
