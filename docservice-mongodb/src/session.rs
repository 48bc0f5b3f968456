//! MongoDB client sessions.

use async_trait::async_trait;
use mongodb::ClientSession;
use tracing::{debug, warn};

use docservice_core::{driver::DriverSession, error::ServiceResult};

use crate::options::map_error;


/// A session of the [`MongoDbDriver`](crate::MongoDbDriver).
///
/// Wraps a [`ClientSession`]. Dropping the session ends it on the server, which aborts any
/// transaction still open.
///
/// A discarded transaction cannot be aborted without a round trip, so it is only marked;
/// the abort is sent before the next operation that uses the session.
#[derive(Debug)]
pub struct MongoDbSession {
    inner: ClientSession,
    in_transaction: bool,
    discarded: bool,
}

impl MongoDbSession {
    pub(crate) fn new(inner: ClientSession) -> Self {
        Self { inner, in_transaction: false, discarded: false }
    }

    /// The underlying client session, for running raw driver operations in the same transaction.
    ///
    /// Aborts a discarded transaction first, so raw operations never join it.
    pub async fn client_session(&mut self) -> &mut ClientSession {
        self.abort_discarded().await;
        &mut self.inner
    }

    async fn abort_discarded(&mut self) {
        if !self.discarded {
            return;
        }
        self.discarded = false;
        match self.inner.abort_transaction().await {
            Ok(()) => debug!("aborted discarded transaction"),
            Err(error) => warn!(%error, "failed to abort discarded transaction"),
        }
    }
}

#[async_trait]
impl DriverSession for MongoDbSession {
    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn start_transaction(&mut self) -> ServiceResult<()> {
        self.client_session()
            .await
            .start_transaction()
            .await
            .map_err(|e| map_error(e, ""))?;
        self.in_transaction = true;

        debug!("started transaction");
        Ok(())
    }

    async fn commit_transaction(&mut self) -> ServiceResult<()> {
        // the server aborts the transaction on a failed commit
        self.in_transaction = false;
        self.inner
            .commit_transaction()
            .await
            .map_err(|e| map_error(e, ""))?;

        debug!("committed transaction");
        Ok(())
    }

    async fn abort_transaction(&mut self) -> ServiceResult<()> {
        if !self.in_transaction {
            self.abort_discarded().await;
            return Ok(());
        }

        self.in_transaction = false;
        self.inner
            .abort_transaction()
            .await
            .map_err(|e| map_error(e, ""))?;

        debug!("aborted transaction");
        Ok(())
    }

    fn discard_transaction(&mut self) {
        if self.in_transaction {
            self.in_transaction = false;
            self.discarded = true;
            debug!("discarded transaction, abort pending");
        }
    }
}
