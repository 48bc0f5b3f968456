//! The service layer: typed CRUD operations with validators, delete rules and transactions.
//!
//! A service is declared by implementing [`ServiceSpec`] on a marker type and used through a
//! [`Service`] bound to a [`Database`].
//!
//! # Example
//!
//! ```ignore
//! struct PersonService;
//!
//! impl ServiceSpec for PersonService {
//!     type Insert = PersonCreate;
//!     type Update = PersonUpdate;
//!     type Model = Person;
//!     type Id = ObjectId;
//!
//!     const COLLECTION: &'static str = "people";
//!
//!     fn register_rules<D: Driver>(rules: &mut RuleSetBuilder<Self, D>) {
//!         rules.validator("name_is_unique", ValidatorKind::Insert, |service, data, _, session| {
//!             Box::pin(async move { /* ... */ Ok(()) })
//!         });
//!     }
//! }
//!
//! let people = database.service::<PersonService>();
//! let ada = people.create(&PersonCreate { name: "Ada".into() }, None).await?;
//! ```
//!
//! # Operation order
//!
//! - Inserts and updates run their validators first; a failing validator aborts the
//!   operation before anything is written.
//! - Deletes on a service with delete rules resolve the ids to delete, run the `deny` rules,
//!   then run `pre` rules, the deletion itself and `post` rules in one transaction.
//!   Without delete rules a delete is a single driver call.
//! - Deletes issued by delete rules nest. Past
//!   [`ServiceConfig::max_cascade_depth`](crate::config::ServiceConfig::max_cascade_depth)
//!   levels the innermost one fails with [`ServiceError::CascadeTooDeep`], which rolls back
//!   the whole deletion. A cascade over a cyclic relation ends this way.
//!
//! Every operation takes an optional session. Passing the session received by a hook makes
//! the nested operation part of the hook's transaction.

use std::fmt;
use std::sync::Arc;

use bson::{Bson, Document, doc};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, warn};

use crate::{
    config::ServiceConfig,
    database::Database,
    document::{FromStorageMapping, ID_FIELD, PrimaryKey, ToStorageMapping, document_id},
    driver::{DeleteOutcome, Driver, FindOptions, UpdateOutcome},
    error::{ServiceError, ServiceResult},
    index::IndexSpec,
    aggregation::Aggregation,
    query::Query,
    rules::{DeletePhase, DeleteRule, Payload, RuleSet, RuleSetBuilder, ValidatorKind},
    transaction::TransactionManager,
};

/// Declares a service: its collection, models, indexes and hooks.
pub trait ServiceSpec: Sized + Send + Sync + 'static {
    /// The data accepted by inserts.
    type Insert: Serialize + Send + Sync + 'static;
    /// The data accepted by updates.
    type Update: Serialize + Send + Sync + 'static;
    /// The stored model returned by reads.
    type Model: DeserializeOwned + Send + Sync + 'static;
    /// The primary key type.
    type Id: PrimaryKey;

    /// The name of the collection the service manages.
    const COLLECTION: &'static str;

    /// The configuration of the service.
    fn config() -> ServiceConfig {
        ServiceConfig::default()
    }

    /// The indexes created by [`Service::create_indexes`], in creation order.
    fn indexes() -> Vec<(&'static str, IndexSpec)> {
        Vec::new()
    }

    /// Registers the validators and delete rules of the service.
    ///
    /// Called once per driver type; the result is cached. To reuse the rules of another
    /// service, call a shared generic registration function first and override by name.
    fn register_rules<D: Driver>(rules: &mut RuleSetBuilder<Self, D>) {
        let _ = rules;
    }

    /// Converts insert data into the stored document.
    ///
    /// Override to add computed fields such as creation timestamps.
    fn prepare_insert(data: &Self::Insert, config: &ServiceConfig) -> ServiceResult<Document> {
        let mapping = data.to_storage_mapping()?;
        if config.exclude_null_on_insert {
            return Ok(without_nulls(mapping));
        }
        Ok(mapping)
    }

    /// Converts update data into an update document.
    ///
    /// The default sets every non-null field with `$set`; `None` fields are left untouched.
    fn prepare_update(changes: &Self::Update) -> ServiceResult<Document> {
        Ok(doc! { "$set": without_nulls(changes.to_storage_mapping()?) })
    }
}

fn without_nulls(mapping: Document) -> Document {
    mapping
        .into_iter()
        .filter(|(_, value)| !matches!(value, Bson::Null))
        .collect()
}

fn is_empty_update(update: &Document) -> bool {
    update
        .values()
        .all(|value| matches!(value, Bson::Document(fields) if fields.is_empty()))
}

fn single(key: &str, value: Bson) -> Document {
    let mut document = Document::new();
    document.insert(key, value);
    document
}

/// A service bound to a database.
///
/// Services hold no state besides the database handle and the shared rule set, so they are
/// cheap to clone and to construct per request.
pub struct Service<S: ServiceSpec, D: Driver> {
    database: Database<D>,
    rules: Arc<RuleSet<S, D>>,
    config: ServiceConfig,
}

impl<S: ServiceSpec, D: Driver> Clone for Service<S, D> {
    fn clone(&self) -> Self {
        Self {
            database: self.database.clone(),
            rules: Arc::clone(&self.rules),
            config: self.config.clone(),
        }
    }
}

impl<S: ServiceSpec, D: Driver> fmt::Debug for Service<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("collection", &S::COLLECTION)
            .field("rules", &self.rules)
            .field("config", &self.config)
            .finish()
    }
}

impl<S: ServiceSpec, D: Driver> Service<S, D> {
    /// Creates the service with its registered rules.
    pub fn new(database: Database<D>) -> Self {
        Self::with_rules(database, RuleSet::for_service())
    }

    /// Creates the service with an explicit rule set instead of the registered one.
    pub fn with_rules(database: Database<D>, rules: Arc<RuleSet<S, D>>) -> Self {
        Self { database, rules, config: S::config() }
    }

    /// Replaces the configuration of this service instance.
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn collection_name(&self) -> &'static str {
        S::COLLECTION
    }

    pub fn database(&self) -> &Database<D> {
        &self.database
    }

    pub fn driver(&self) -> &D {
        self.database.driver()
    }

    pub fn rules(&self) -> &RuleSet<S, D> {
        &self.rules
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The same service on a handle one cascade level deeper, as handed to delete rules.
    fn one_level_deeper(&self) -> Self {
        Self {
            database: self.database.one_level_deeper(),
            rules: Arc::clone(&self.rules),
            config: self.config.clone(),
        }
    }

    /// A transaction manager using this service's retry policy.
    pub fn transactions(&self) -> TransactionManager<'_, D> {
        self.database.transactions(self.config.retry.clone())
    }

    /// Whether the connected deployment supports multi-document transactions.
    pub async fn supports_transactions(&self) -> ServiceResult<bool> {
        self.database.supports_transactions().await
    }

    /// The filter matching the document with the given id.
    pub fn id_filter(id: &S::Id) -> Document {
        single(ID_FIELD, id.to_bson())
    }

    /// The filter matching every document whose id is in `ids`.
    pub fn ids_filter(ids: &[S::Id]) -> Document {
        let ids: Vec<Bson> = ids.iter().map(PrimaryKey::to_bson).collect();
        single(ID_FIELD, Bson::Document(doc! { "$in": ids }))
    }

    fn rule_name(rule: &str) -> String {
        let service = std::any::type_name::<S>();
        let service = service.rsplit("::").next().unwrap_or(service);
        format!("{service}.{rule}")
    }

    /// Returns the stored documents matching `query` without converting them.
    pub async fn find_documents(
        &self,
        query: impl Into<Query>,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<Vec<Document>> {
        let query = query.into();
        let filter = query.filter_document();
        let options = FindOptions {
            sort: query.sort_document(),
            skip: query.offset,
            limit: query.limit,
            projection: query.projection,
        };
        debug!(collection = S::COLLECTION, %filter, "find");
        self.driver()
            .find(S::COLLECTION, filter, options, session)
            .await
    }

    /// Runs an aggregation pipeline on the collection.
    ///
    /// ```ignore
    /// let adults = people
    ///     .aggregate(
    ///         Aggregation::new()
    ///             .filter(&AGE.gte(18)?)
    ///             .stage(AggregationStage::Count, "adults"),
    ///         None,
    ///     )
    ///     .await?;
    /// ```
    pub async fn aggregate(
        &self,
        pipeline: impl Into<Aggregation>,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<Vec<Document>> {
        let pipeline = pipeline.into().into_stages();
        debug!(collection = S::COLLECTION, stages = pipeline.len(), "aggregate");
        self.driver()
            .aggregate(S::COLLECTION, pipeline, session)
            .await
    }

    /// Runs an aggregation pipeline and converts every resulting document into `T`.
    pub async fn aggregate_as<T: FromStorageMapping>(
        &self,
        pipeline: impl Into<Aggregation>,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<Vec<T>> {
        self.aggregate(pipeline, session)
            .await?
            .into_iter()
            .map(T::from_storage_mapping)
            .collect()
    }

    /// Returns the models matching `query`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidDocument`] if a stored document does not match the model.
    pub async fn find(
        &self,
        query: impl Into<Query>,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<Vec<S::Model>> {
        self.find_documents(query, session)
            .await?
            .into_iter()
            .map(<S::Model as FromStorageMapping>::from_storage_mapping)
            .collect()
    }

    /// Returns the first model matching `filter`.
    pub async fn find_one(
        &self,
        filter: impl Into<Document>,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<Option<S::Model>> {
        self.driver()
            .find_one(S::COLLECTION, filter.into(), session)
            .await?
            .map(<S::Model as FromStorageMapping>::from_storage_mapping)
            .transpose()
    }

    /// Returns the model with the given id.
    pub async fn get_by_id(
        &self,
        id: &S::Id,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<Option<S::Model>> {
        self.find_one(Self::id_filter(id), session).await
    }

    /// Returns the ids of the documents matching `filter`.
    pub async fn find_ids(
        &self,
        filter: impl Into<Document>,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<Vec<S::Id>> {
        let options = FindOptions {
            projection: Some(single(ID_FIELD, Bson::Int32(1))),
            ..FindOptions::default()
        };
        self.driver()
            .find(S::COLLECTION, filter.into(), options, session)
            .await?
            .iter()
            .map(document_id::<S::Id>)
            .collect()
    }

    /// Counts the documents matching `filter`.
    pub async fn count_documents(
        &self,
        filter: impl Into<Document>,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<u64> {
        self.driver()
            .count_documents(S::COLLECTION, filter.into(), session)
            .await
    }

    /// Whether a document with the given id exists.
    pub async fn exists(&self, id: &S::Id, session: Option<&mut D::Session>) -> ServiceResult<bool> {
        Ok(self.count_documents(Self::id_filter(id), session).await? > 0)
    }

    /// Validates and inserts `data`, returning the id of the new document.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ValidationFailed`] if an insert validator rejects the data.
    pub async fn insert_one(
        &self,
        data: &S::Insert,
        mut session: Option<&mut D::Session>,
    ) -> ServiceResult<S::Id> {
        self.validate(ValidatorKind::Insert, Payload::Insert(data), None, session.as_deref_mut())
            .await?;
        let document = S::prepare_insert(data, &self.config)?;
        let id = self
            .driver()
            .insert_one(S::COLLECTION, document, session)
            .await?;
        debug!(collection = S::COLLECTION, %id, "inserted document");
        <S::Id as PrimaryKey>::from_bson(id)
    }

    /// Validates every item, then inserts them all, returning their ids in input order.
    ///
    /// Nothing is written if any item fails validation.
    pub async fn insert_many(
        &self,
        data: &[S::Insert],
        mut session: Option<&mut D::Session>,
    ) -> ServiceResult<Vec<S::Id>> {
        for item in data {
            self.validate(ValidatorKind::Insert, Payload::Insert(item), None, session.as_deref_mut())
                .await?;
        }
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let documents = data
            .iter()
            .map(|item| S::prepare_insert(item, &self.config))
            .collect::<ServiceResult<Vec<_>>>()?;
        let ids = self
            .driver()
            .insert_many(S::COLLECTION, documents, session)
            .await?;
        debug!(collection = S::COLLECTION, count = ids.len(), "inserted documents");
        ids.into_iter().map(<S::Id as PrimaryKey>::from_bson).collect()
    }

    /// Inserts `data` and returns the stored model.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::ValidationFailed`] if an insert validator rejects the data.
    /// - [`ServiceError::NotFound`] if the new document cannot be read back.
    pub async fn create(
        &self,
        data: &S::Insert,
        mut session: Option<&mut D::Session>,
    ) -> ServiceResult<S::Model> {
        let id = self.insert_one(data, session.as_deref_mut()).await?;
        self.get_by_id(&id, session)
            .await?
            .ok_or_else(|| self.not_found(&Self::id_filter(&id)))
    }

    /// Applies `changes` to every document matching `filter`.
    ///
    /// Update validators receive `filter`. An update that sets no fields writes nothing and
    /// reports the matched documents as unmodified.
    pub async fn update_many(
        &self,
        filter: impl Into<Document>,
        changes: &S::Update,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<UpdateOutcome> {
        self.apply_update(filter.into(), changes, true, session)
            .await
    }

    /// Applies `changes` to the first document matching `filter`.
    pub async fn update_one(
        &self,
        filter: impl Into<Document>,
        changes: &S::Update,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<UpdateOutcome> {
        self.apply_update(filter.into(), changes, false, session)
            .await
    }

    /// Applies `changes` to the document with the given id.
    pub async fn update_by_id(
        &self,
        id: &S::Id,
        changes: &S::Update,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<UpdateOutcome> {
        self.update_one(Self::id_filter(id), changes, session)
            .await
    }

    /// Applies `changes` to the document with the given id and returns the updated model.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::ValidationFailed`] if an update validator rejects the changes.
    /// - [`ServiceError::NotFound`] if no document has the given id.
    pub async fn update(
        &self,
        id: &S::Id,
        changes: &S::Update,
        mut session: Option<&mut D::Session>,
    ) -> ServiceResult<S::Model> {
        let outcome = self
            .update_by_id(id, changes, session.as_deref_mut())
            .await?;
        if outcome.matched_count == 0 {
            return Err(self.not_found(&Self::id_filter(id)));
        }
        self.get_by_id(id, session)
            .await?
            .ok_or_else(|| self.not_found(&Self::id_filter(id)))
    }

    async fn apply_update(
        &self,
        filter: Document,
        changes: &S::Update,
        many: bool,
        mut session: Option<&mut D::Session>,
    ) -> ServiceResult<UpdateOutcome> {
        self.validate(
            ValidatorKind::Update,
            Payload::Update(changes),
            Some(&filter),
            session.as_deref_mut(),
        )
        .await?;

        let update = S::prepare_update(changes)?;
        if is_empty_update(&update) {
            debug!(collection = S::COLLECTION, %filter, "empty update, nothing to write");
            let matched = self
                .driver()
                .count_documents(S::COLLECTION, filter, session)
                .await?;
            let matched_count = if many { matched } else { matched.min(1) };
            return Ok(UpdateOutcome { matched_count, modified_count: 0 });
        }

        debug!(collection = S::COLLECTION, %filter, %update, many, "update");
        if many {
            self.driver()
                .update_many(S::COLLECTION, filter, update, session)
                .await
        } else {
            self.driver()
                .update_one(S::COLLECTION, filter, update, session)
                .await
        }
    }

    /// Deletes every document matching `filter`, running the delete rules of the service.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::DeleteDenied`] if a `deny` rule rejects the deletion. Nothing is written.
    /// - [`ServiceError::DeleteRuleFailed`] if a `pre` or `post` rule fails. The transaction is
    ///   rolled back.
    /// - [`ServiceError::CascadeTooDeep`] if the delete rules nest deletes too deeply; it
    ///   reaches the caller wrapped in the rule errors of every level.
    /// - [`ServiceError::TransactionAborted`] if the transaction cannot be committed.
    pub async fn delete_many(
        &self,
        filter: impl Into<Document>,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<DeleteOutcome> {
        let filter = filter.into();
        if !self.rules.has_delete_rules() {
            debug!(collection = S::COLLECTION, %filter, "delete_many");
            return self
                .driver()
                .delete_many(S::COLLECTION, filter, session)
                .await;
        }
        self.delete_with_rules(filter, false, session)
            .await
    }

    /// Deletes the document matching `filter`.
    ///
    /// # Errors
    ///
    /// With delete rules, returns [`ServiceError::InvalidQuery`] if `filter` matches more than
    /// one document. Otherwise the same errors as [`Service::delete_many`].
    pub async fn delete_one(
        &self,
        filter: impl Into<Document>,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<DeleteOutcome> {
        let filter = filter.into();
        if !self.rules.has_delete_rules() {
            debug!(collection = S::COLLECTION, %filter, "delete_one");
            return self
                .driver()
                .delete_one(S::COLLECTION, filter, session)
                .await;
        }
        self.delete_with_rules(filter, true, session)
            .await
    }

    /// Deletes the document with the given id.
    pub async fn delete_by_id(
        &self,
        id: &S::Id,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<DeleteOutcome> {
        self.delete_one(Self::id_filter(id), session)
            .await
    }

    async fn delete_with_rules(
        &self,
        filter: Document,
        single: bool,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<DeleteOutcome> {
        match session {
            Some(session) => self.delete_in_session(filter, single, session).await,
            None => {
                let mut session = self.database.start_session().await?;
                self.delete_in_session(filter, single, &mut session)
                    .await
            }
        }
    }

    async fn delete_in_session(
        &self,
        filter: Document,
        single: bool,
        session: &mut D::Session,
    ) -> ServiceResult<DeleteOutcome> {
        let ids = self.find_ids(filter, Some(&mut *session)).await?;
        if ids.is_empty() {
            debug!(collection = S::COLLECTION, "delete matched no documents");
            return Ok(DeleteOutcome::default());
        }
        if single && ids.len() > 1 {
            return Err(ServiceError::InvalidQuery(format!(
                "delete_one filter matched {} documents in {}",
                ids.len(),
                S::COLLECTION
            )));
        }
        let depth = self.database.cascade_depth();
        if depth >= self.config.max_cascade_depth {
            warn!(collection = S::COLLECTION, depth, "cascading delete is too deep");
            return Err(ServiceError::CascadeTooDeep {
                collection: S::COLLECTION.to_string(),
                depth: self.config.max_cascade_depth,
            });
        }

        // rules act one level deeper, so deletes they issue are counted against the limit
        let nested = self.one_level_deeper();
        for rule in nested.rules.deny_delete_rules() {
            (rule.callback)(&nested, &mut *session, ids.as_slice())
                .await
                .map_err(|source| ServiceError::DeleteDenied {
                    rule: Self::rule_name(rule.name()),
                    source: Box::new(source),
                })?;
        }

        debug!(collection = S::COLLECTION, count = ids.len(), depth, "deleting with rules");
        let ids: Arc<[S::Id]> = ids.into();
        let service = nested.clone();
        self.transactions()
            .run_in_transaction(session, move |session| {
                let service = service.clone();
                let ids = Arc::clone(&ids);
                Box::pin(async move { service.delete_in_transaction(session, &ids).await })
            })
            .await
    }

    async fn delete_in_transaction(
        &self,
        session: &mut D::Session,
        ids: &[S::Id],
    ) -> ServiceResult<DeleteOutcome> {
        for rule in self.rules.pre_delete_rules() {
            self.run_delete_rule(rule, session, ids).await?;
        }
        let outcome = self
            .driver()
            .delete_many(S::COLLECTION, Self::ids_filter(ids), Some(&mut *session))
            .await?;
        for rule in self.rules.post_delete_rules() {
            self.run_delete_rule(rule, session, ids).await?;
        }
        Ok(outcome)
    }

    async fn run_delete_rule(
        &self,
        rule: &DeleteRule<S, D>,
        session: &mut D::Session,
        ids: &[S::Id],
    ) -> ServiceResult<()> {
        debug_assert!(rule.phase() != DeletePhase::Deny);
        (rule.callback)(self, session, ids)
            .await
            .map_err(|source| ServiceError::DeleteRuleFailed {
                rule: Self::rule_name(rule.name()),
                source: Box::new(source),
            })
    }

    async fn validate(
        &self,
        kind: ValidatorKind,
        payload: Payload<'_, S>,
        filter: Option<&Document>,
        mut session: Option<&mut D::Session>,
    ) -> ServiceResult<()> {
        for validator in self.rules.validators(kind) {
            (validator.callback)(self, payload, filter, session.as_deref_mut())
                .await
                .map_err(|source| ServiceError::ValidationFailed {
                    rule: Self::rule_name(validator.name()),
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }

    fn not_found(&self, filter: &Document) -> ServiceError {
        ServiceError::NotFound { collection: S::COLLECTION.to_string(), filter: filter.to_string() }
    }

    /// Creates every index declared by [`ServiceSpec::indexes`], returning their names.
    pub async fn create_indexes(
        &self,
        mut session: Option<&mut D::Session>,
    ) -> ServiceResult<Vec<String>> {
        let mut names = Vec::new();
        for (name, index) in S::indexes() {
            names.push(
                self.create_index(name, &index, session.as_deref_mut())
                    .await?,
            );
        }
        Ok(names)
    }

    /// Creates a single index.
    pub async fn create_index(
        &self,
        name: &str,
        index: &IndexSpec,
        session: Option<&mut D::Session>,
    ) -> ServiceResult<String> {
        let name = self
            .driver()
            .create_index(S::COLLECTION, name, index, session)
            .await?;
        info!(collection = S::COLLECTION, index = %name, "created index");
        Ok(name)
    }

    /// Drops the index with the given name.
    pub async fn drop_index(&self, name: &str, session: Option<&mut D::Session>) -> ServiceResult<()> {
        self.driver()
            .drop_index(S::COLLECTION, name, session)
            .await?;
        info!(collection = S::COLLECTION, index = name, "dropped index");
        Ok(())
    }

    /// Drops every index of the collection except the one on `_id`.
    pub async fn drop_indexes(&self, session: Option<&mut D::Session>) -> ServiceResult<()> {
        self.driver()
            .drop_indexes(S::COLLECTION, session)
            .await?;
        info!(collection = S::COLLECTION, "dropped indexes");
        Ok(())
    }

    /// Lists the index names of the collection.
    pub async fn list_index_names(&self) -> ServiceResult<Vec<String>> {
        self.driver()
            .list_index_names(S::COLLECTION)
            .await
    }
}
