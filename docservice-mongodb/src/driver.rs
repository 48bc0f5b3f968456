use std::sync::OnceLock;
use async_trait::async_trait;
use futures::TryStreamExt;
use bson::{Bson, Document, doc};
use mongodb::{Client, Collection, options::ClientOptions};
use tracing::{debug, info};

use docservice_core::{
    driver::{DeleteOutcome, Driver, DriverBuilder, FindOptions, UpdateOutcome},
    error::{ServiceError, ServiceResult},
    index::IndexSpec,
};

use crate::{
    options::{find_options, index_model, map_error},
    session::MongoDbSession,
};


/// Database driver backed by the official MongoDB driver.
///
/// Transactions need a replica set or a sharded cluster; [`Driver::supports_transactions`]
/// asks the server once and caches the answer.
#[derive(Debug)]
pub struct MongoDbDriver {
    client: Client,
    database: String,
    transactions: OnceLock<bool>,
}

impl MongoDbDriver {
    pub fn new(client: Client, database: String) -> Self {
        Self { client, database, transactions: OnceLock::new() }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbDriverBuilder {
        MongoDbDriverBuilder::new(dsn, database)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn get_collection(&self, collection: &str) -> Collection<Document> {
        self.client
            .database(&self.database)
            .collection(collection)
    }

    pub async fn shutdown(self) {
        self.client.shutdown().await;
    }
}

#[async_trait]
impl Driver for MongoDbDriver {
    type Session = MongoDbSession;

    async fn start_session(&self) -> ServiceResult<MongoDbSession> {
        let session = self.client
            .start_session()
            .await
            .map_err(|e| ServiceError::Backend(e.to_string()))?;

        Ok(MongoDbSession::new(session))
    }

    async fn supports_transactions(&self) -> ServiceResult<bool> {
        if let Some(supported) = self.transactions.get() {
            return Ok(*supported);
        }

        let hello = self.client
            .database("admin")
            .run_command(doc! { "hello": 1 })
            .await
            .map_err(|e| ServiceError::Backend(e.to_string()))?;
        // replica set members report a set name, mongos routers report "isdbgrid"
        let supported = hello.contains_key("setName")
            || hello.get_str("msg").is_ok_and(|msg| msg == "isdbgrid");

        info!(database = %self.database, supported, "probed transaction support");
        Ok(*self.transactions.get_or_init(|| supported))
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
        session: Option<&mut MongoDbSession>,
    ) -> ServiceResult<Vec<Document>> {
        let handle = self.get_collection(collection);
        let action = handle
            .find(filter)
            .with_options(find_options(options));

        match session {
            Some(session) => {
                let mut cursor = action
                    .session(session.client_session().await)
                    .await
                    .map_err(|e| map_error(e, collection))?;
                cursor
                    .stream(session.client_session().await)
                    .try_collect()
                    .await
                    .map_err(|e| map_error(e, collection))
            },
            None => action
                .await
                .map_err(|e| map_error(e, collection))?
                .try_collect()
                .await
                .map_err(|e| map_error(e, collection)),
        }
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        session: Option<&mut MongoDbSession>,
    ) -> ServiceResult<Option<Document>> {
        let handle = self.get_collection(collection);
        let action = handle.find_one(filter);

        let result = match session {
            Some(session) => action.session(session.client_session().await).await,
            None => action.await,
        };

        result.map_err(|e| map_error(e, collection))
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: Document,
        session: Option<&mut MongoDbSession>,
    ) -> ServiceResult<u64> {
        let handle = self.get_collection(collection);
        let action = handle.count_documents(filter);

        let result = match session {
            Some(session) => action.session(session.client_session().await).await,
            None => action.await,
        };

        result.map_err(|e| map_error(e, collection))
    }

    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
        session: Option<&mut MongoDbSession>,
    ) -> ServiceResult<Bson> {
        let handle = self.get_collection(collection);
        let action = handle.insert_one(document);

        let result = match session {
            Some(session) => action.session(session.client_session().await).await,
            None => action.await,
        }
        .map_err(|e| map_error(e, collection))?;

        debug!(collection, id = %result.inserted_id, "inserted document");
        Ok(result.inserted_id)
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<&mut MongoDbSession>,
    ) -> ServiceResult<Vec<Bson>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let count = documents.len();
        let handle = self.get_collection(collection);
        let action = handle.insert_many(documents);

        let result = match session {
            Some(session) => action.session(session.client_session().await).await,
            None => action.await,
        }
        .map_err(|e| map_error(e, collection))?;

        // inserted ids are keyed by input position
        let mut ids = Vec::with_capacity(count);
        for position in 0..count {
            let id = result.inserted_ids
                .get(&position)
                .cloned()
                .ok_or_else(|| ServiceError::Backend(format!(
                    "server did not report an id for document {position}"
                )))?;
            ids.push(id);
        }

        debug!(collection, count, "inserted documents");
        Ok(ids)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        session: Option<&mut MongoDbSession>,
    ) -> ServiceResult<UpdateOutcome> {
        let handle = self.get_collection(collection);
        let action = handle.update_one(filter, update);

        let result = match session {
            Some(session) => action.session(session.client_session().await).await,
            None => action.await,
        }
        .map_err(|e| map_error(e, collection))?;

        Ok(UpdateOutcome {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
        })
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        session: Option<&mut MongoDbSession>,
    ) -> ServiceResult<UpdateOutcome> {
        let handle = self.get_collection(collection);
        let action = handle.update_many(filter, update);

        let result = match session {
            Some(session) => action.session(session.client_session().await).await,
            None => action.await,
        }
        .map_err(|e| map_error(e, collection))?;

        Ok(UpdateOutcome {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
        })
    }

    async fn delete_one(
        &self,
        collection: &str,
        filter: Document,
        session: Option<&mut MongoDbSession>,
    ) -> ServiceResult<DeleteOutcome> {
        let handle = self.get_collection(collection);
        let action = handle.delete_one(filter);

        let result = match session {
            Some(session) => action.session(session.client_session().await).await,
            None => action.await,
        }
        .map_err(|e| map_error(e, collection))?;

        Ok(DeleteOutcome { deleted_count: result.deleted_count })
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: Document,
        session: Option<&mut MongoDbSession>,
    ) -> ServiceResult<DeleteOutcome> {
        let handle = self.get_collection(collection);
        let action = handle.delete_many(filter);

        let result = match session {
            Some(session) => action.session(session.client_session().await).await,
            None => action.await,
        }
        .map_err(|e| map_error(e, collection))?;

        debug!(collection, deleted = result.deleted_count, "deleted documents");
        Ok(DeleteOutcome { deleted_count: result.deleted_count })
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
        session: Option<&mut MongoDbSession>,
    ) -> ServiceResult<Vec<Document>> {
        let handle = self.get_collection(collection);
        let action = handle.aggregate(pipeline);

        match session {
            Some(session) => {
                let mut cursor = action
                    .session(session.client_session().await)
                    .await
                    .map_err(|e| map_error(e, collection))?;
                cursor
                    .stream(session.client_session().await)
                    .try_collect()
                    .await
                    .map_err(|e| map_error(e, collection))
            },
            None => action
                .await
                .map_err(|e| map_error(e, collection))?
                .try_collect()
                .await
                .map_err(|e| map_error(e, collection)),
        }
    }

    async fn create_index(
        &self,
        collection: &str,
        name: &str,
        index: &IndexSpec,
        session: Option<&mut MongoDbSession>,
    ) -> ServiceResult<String> {
        let handle = self.get_collection(collection);
        let action = handle.create_index(index_model(name, index)?);

        let result = match session {
            Some(session) => action.session(session.client_session().await).await,
            None => action.await,
        }
        .map_err(|e| map_error(e, collection))?;

        Ok(result.index_name)
    }

    async fn drop_index(
        &self,
        collection: &str,
        name: &str,
        session: Option<&mut MongoDbSession>,
    ) -> ServiceResult<()> {
        let handle = self.get_collection(collection);
        let action = handle.drop_index(name);

        let result = match session {
            Some(session) => action.session(session.client_session().await).await,
            None => action.await,
        };

        result.map_err(|e| map_error(e, collection))
    }

    async fn drop_indexes(
        &self,
        collection: &str,
        session: Option<&mut MongoDbSession>,
    ) -> ServiceResult<()> {
        let handle = self.get_collection(collection);
        let action = handle.drop_indexes();

        let result = match session {
            Some(session) => action.session(session.client_session().await).await,
            None => action.await,
        };

        result.map_err(|e| map_error(e, collection))
    }

    async fn list_index_names(&self, collection: &str) -> ServiceResult<Vec<String>> {
        self.get_collection(collection)
            .list_index_names()
            .await
            .map_err(|e| map_error(e, collection))
    }
}


/// Builder for [`MongoDbDriver`] from a connection string.
pub struct MongoDbDriverBuilder {
    dsn: String,
    database: String,
}

impl MongoDbDriverBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl DriverBuilder for MongoDbDriverBuilder {
    type Driver = MongoDbDriver;

    async fn build(self) -> ServiceResult<Self::Driver> {
        Ok(MongoDbDriver::new(
            Client::with_options(
                ClientOptions::parse(&self.dsn)
                    .await
                    .map_err(|e| ServiceError::Initialization(e.to_string()))?,
            )
            .map_err(|e| ServiceError::Initialization(e.to_string()))?,
            self.database,
        ))
    }
}
