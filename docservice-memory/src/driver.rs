//! In-memory driver implementation.
//!
//! This module provides a driver that keeps collections as vectors of BSON documents behind
//! an async-aware read-write lock. Sessions support snapshot transactions with optimistic
//! commit: a commit fails with a transient error if anything else was written since the
//! transaction started, which lets the transaction manager's retry path run in tests.

use std::{
    collections::HashMap,
    sync::{Arc, atomic::{AtomicU64, AtomicUsize, Ordering}},
};
use async_trait::async_trait;
use mea::rwlock::RwLock;
use bson::{Bson, Document, doc, oid::ObjectId};
use tracing::{debug, warn};

use docservice_core::{
    driver::{DeleteOutcome, Driver, DriverBuilder, DriverSession, FindOptions, UpdateOutcome},
    error::{ServiceError, ServiceResult},
    index::IndexSpec,
};

use crate::{
    evaluator::{DocumentEvaluator, project, sort_documents},
    pipeline::run_pipeline,
    update::{apply_update, check_update},
};

type CollectionMap = Vec<Document>;
type StoreMap = HashMap<String, CollectionMap>;


#[derive(Debug, Default)]
struct StoreState {
    /// collection name -> documents in insertion order
    collections: StoreMap,
    /// collection name -> declared indexes
    indexes: HashMap<String, Vec<(String, IndexSpec)>>,
    /// bumped on every committed write
    version: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sessions: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    failing_starts: AtomicUsize,
    failing_commits: AtomicUsize,
}

fn take_injected_failure(pending: &AtomicUsize) -> bool {
    pending
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}


/// Thread-safe in-memory database driver.
///
/// `InMemoryDriver` is cloneable and uses an `Arc`-wrapped internal state, so clones share
/// the same data. Queries scan whole collections; declared indexes are recorded but not used
/// or enforced.
///
/// # Example
///
/// ```ignore
/// use docservice_memory::InMemoryDriver;
/// use docservice_core::driver::Driver;
/// use bson::doc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let driver = InMemoryDriver::new();
///
///     let id = driver.insert_one("users", doc! { "name": "Alice" }, None).await?;
///     let found = driver.find_one("users", doc! { "_id": id }, None).await?;
///     assert!(found.is_some());
///
///     Ok(())
/// }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryDriver {
    state: Arc<RwLock<StoreState>>,
    counters: Arc<Counters>,
    transactions: bool,
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDriver {
    /// Creates a new empty driver with transaction support.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            counters: Arc::new(Counters::default()),
            transactions: true,
        }
    }

    /// Creates a builder for constructing an `InMemoryDriver` with custom options.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let driver = InMemoryDriver::builder()
    ///     .with_transactions(false)
    ///     .build()
    ///     .await?;
    /// ```
    pub fn builder() -> InMemoryDriverBuilder {
        InMemoryDriverBuilder::default()
    }

    /// Makes the next `count` commits fail with a transient transaction error.
    pub fn fail_next_commits(&self, count: usize) {
        self.counters
            .failing_commits
            .store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` transaction starts fail with a transient transaction error.
    pub fn fail_next_starts(&self, count: usize) {
        self.counters
            .failing_starts
            .store(count, Ordering::SeqCst);
    }

    /// Number of transactions committed so far.
    pub fn committed_transactions(&self) -> u64 {
        self.counters.commits.load(Ordering::SeqCst)
    }

    /// Number of transactions aborted, failed or discarded so far.
    pub fn aborted_transactions(&self) -> u64 {
        self.counters.aborts.load(Ordering::SeqCst)
    }

    /// Returns a copy of every committed document of a collection, in insertion order.
    pub async fn snapshot(&self, collection: &str) -> Vec<Document> {
        self.state
            .read()
            .await
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    async fn read<R>(
        &self,
        session: Option<&mut InMemorySession>,
        f: impl FnOnce(&StoreMap) -> ServiceResult<R> + Send,
    ) -> ServiceResult<R> {
        if let Some(snapshot) = session.and_then(|s| s.transaction.as_ref()) {
            return f(&snapshot.collections);
        }

        let state = self.state.read().await;
        f(&state.collections)
    }

    async fn write<R>(
        &self,
        session: Option<&mut InMemorySession>,
        f: impl FnOnce(&mut StoreMap) -> ServiceResult<R> + Send,
    ) -> ServiceResult<R> {
        if let Some(snapshot) = session.and_then(|s| s.transaction.as_mut()) {
            return f(&mut snapshot.collections);
        }

        let mut state = self.state.write().await;
        let result = f(&mut state.collections)?;
        state.version += 1;

        Ok(result)
    }
}

/// Positions of the documents of `collection` matching `filter`.
fn matching(collections: &StoreMap, collection: &str, filter: &Document) -> ServiceResult<Vec<usize>> {
    match collections.get(collection) {
        Some(documents) => DocumentEvaluator::matching_positions(documents, filter),
        None => {
            // still reject malformed filters on missing collections
            DocumentEvaluator::new(&Document::new()).evaluate(filter)?;
            Ok(Vec::new())
        },
    }
}

fn with_id(document: Document) -> Document {
    if document.contains_key("_id") {
        return document;
    }

    let mut identified = doc! { "_id": ObjectId::new() };
    for (key, value) in document {
        identified.insert(key, value);
    }
    identified
}

fn id_of(document: &Document) -> Bson {
    document.get("_id").cloned().unwrap_or(Bson::Null)
}

fn check_new_ids(existing: &[Document], incoming: &[Document], collection: &str) -> ServiceResult<()> {
    for (position, document) in incoming.iter().enumerate() {
        let id = id_of(document);
        let taken = existing.iter().any(|other| other.get("_id") == Some(&id))
            || incoming[..position].iter().any(|other| other.get("_id") == Some(&id));
        if taken {
            return Err(ServiceError::DocumentAlreadyExists(id.to_string(), collection.to_string()));
        }
    }

    Ok(())
}


#[async_trait]
impl Driver for InMemoryDriver {
    type Session = InMemorySession;

    async fn start_session(&self) -> ServiceResult<InMemorySession> {
        let id = self.counters.sessions.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(InMemorySession {
            id,
            driver: self.clone(),
            transaction: None,
        })
    }

    async fn supports_transactions(&self) -> ServiceResult<bool> {
        Ok(self.transactions)
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
        session: Option<&mut InMemorySession>,
    ) -> ServiceResult<Vec<Document>> {
        self.read(session, |collections| {
            let positions = matching(collections, collection, &filter)?;
            let mut found = match collections.get(collection) {
                Some(documents) => positions
                    .into_iter()
                    .map(|position| documents[position].clone())
                    .collect::<Vec<_>>(),
                None => Vec::new(),
            };

            if let Some(sort) = &options.sort {
                sort_documents(&mut found, sort);
            }

            let skipped = found
                .into_iter()
                .skip(options.skip.unwrap_or(0) as usize);
            let limited = match options.limit {
                Some(limit) if limit != 0 => skipped
                    .take(limit.unsigned_abs() as usize)
                    .collect::<Vec<_>>(),
                _ => skipped.collect::<Vec<_>>(),
            };

            Ok(match &options.projection {
                Some(projection) => limited
                    .into_iter()
                    .map(|document| project(document, projection))
                    .collect(),
                None => limited,
            })
        })
        .await
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: Document,
        session: Option<&mut InMemorySession>,
    ) -> ServiceResult<u64> {
        self.read(session, |collections| {
            Ok(matching(collections, collection, &filter)?.len() as u64)
        })
        .await
    }

    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
        session: Option<&mut InMemorySession>,
    ) -> ServiceResult<Bson> {
        let document = with_id(document);
        let id = id_of(&document);

        self.write(session, |collections| {
            let documents = collections
                .entry(collection.to_string())
                .or_default();
            check_new_ids(documents, std::slice::from_ref(&document), collection)?;
            documents.push(document);
            Ok(())
        })
        .await?;

        debug!(collection, %id, "inserted document");
        Ok(id)
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<&mut InMemorySession>,
    ) -> ServiceResult<Vec<Bson>> {
        let documents = documents
            .into_iter()
            .map(with_id)
            .collect::<Vec<_>>();
        let ids = documents.iter().map(id_of).collect::<Vec<_>>();

        self.write(session, |collections| {
            let existing = collections
                .entry(collection.to_string())
                .or_default();
            check_new_ids(existing, &documents, collection)?;
            existing.extend(documents);
            Ok(())
        })
        .await?;

        debug!(collection, count = ids.len(), "inserted documents");
        Ok(ids)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        session: Option<&mut InMemorySession>,
    ) -> ServiceResult<UpdateOutcome> {
        update_documents(self, collection, filter, update, false, session).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        session: Option<&mut InMemorySession>,
    ) -> ServiceResult<UpdateOutcome> {
        update_documents(self, collection, filter, update, true, session).await
    }

    async fn delete_one(
        &self,
        collection: &str,
        filter: Document,
        session: Option<&mut InMemorySession>,
    ) -> ServiceResult<DeleteOutcome> {
        delete_documents(self, collection, filter, false, session).await
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: Document,
        session: Option<&mut InMemorySession>,
    ) -> ServiceResult<DeleteOutcome> {
        delete_documents(self, collection, filter, true, session).await
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
        session: Option<&mut InMemorySession>,
    ) -> ServiceResult<Vec<Document>> {
        let documents = self
            .read(session, |collections| Ok(collections.get(collection).cloned().unwrap_or_default()))
            .await?;

        run_pipeline(documents, &pipeline)
    }

    async fn create_index(
        &self,
        collection: &str,
        name: &str,
        index: &IndexSpec,
        _session: Option<&mut InMemorySession>,
    ) -> ServiceResult<String> {
        if index.keys.is_empty() {
            return Err(ServiceError::InvalidQuery("an index needs at least one key".to_string()));
        }

        let name = if name.is_empty() {
            index.keys
                .iter()
                .map(|(key, direction)| format!("{key}_{direction}"))
                .collect::<Vec<_>>()
                .join("_")
        } else {
            name.to_string()
        };

        let mut state = self.state.write().await;
        let indexes = state.indexes
            .entry(collection.to_string())
            .or_default();
        match indexes.iter_mut().find(|(existing, _)| *existing == name) {
            Some(existing) => existing.1 = index.clone(),
            None => indexes.push((name.clone(), index.clone())),
        }

        Ok(name)
    }

    async fn drop_index(
        &self,
        collection: &str,
        name: &str,
        _session: Option<&mut InMemorySession>,
    ) -> ServiceResult<()> {
        let mut state = self.state.write().await;
        let indexes = state.indexes
            .entry(collection.to_string())
            .or_default();
        let before = indexes.len();
        indexes.retain(|(existing, _)| existing != name);

        if indexes.len() == before {
            return Err(ServiceError::Backend(format!(
                "index not found with name [{name}] in collection {collection}"
            )));
        }

        Ok(())
    }

    async fn drop_indexes(
        &self,
        collection: &str,
        _session: Option<&mut InMemorySession>,
    ) -> ServiceResult<()> {
        let mut state = self.state.write().await;
        if let Some(indexes) = state.indexes.get_mut(collection) {
            indexes.clear();
        }

        Ok(())
    }

    async fn list_index_names(&self, collection: &str) -> ServiceResult<Vec<String>> {
        let state = self.state.read().await;
        let mut names = vec!["_id_".to_string()];

        if let Some(indexes) = state.indexes.get(collection) {
            names.extend(indexes.iter().map(|(name, _)| name.clone()));
        }

        Ok(names)
    }
}

async fn update_documents(
    driver: &InMemoryDriver,
    collection: &str,
    filter: Document,
    update: Document,
    many: bool,
    session: Option<&mut InMemorySession>,
) -> ServiceResult<UpdateOutcome> {
    check_update(&update)?;

    driver.write(session, |collections| {
        let mut positions = matching(collections, collection, &filter)?;
        if !many {
            positions.truncate(1);
        }
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(UpdateOutcome::default());
        };

        // apply to copies first so a failing update leaves every document untouched
        let mut updated = Vec::with_capacity(positions.len());
        let mut modified_count = 0;
        for &position in &positions {
            let mut document = documents[position].clone();
            if apply_update(&mut document, &update)? {
                modified_count += 1;
            }
            updated.push((position, document));
        }
        for (position, document) in updated {
            documents[position] = document;
        }

        Ok(UpdateOutcome {
            matched_count: positions.len() as u64,
            modified_count,
        })
    })
    .await
}

async fn delete_documents(
    driver: &InMemoryDriver,
    collection: &str,
    filter: Document,
    many: bool,
    session: Option<&mut InMemorySession>,
) -> ServiceResult<DeleteOutcome> {
    let outcome = driver.write(session, |collections| {
        let mut positions = matching(collections, collection, &filter)?;
        if !many {
            positions.truncate(1);
        }
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(DeleteOutcome::default());
        };

        for &position in positions.iter().rev() {
            documents.remove(position);
        }

        Ok(DeleteOutcome { deleted_count: positions.len() as u64 })
    })
    .await?;

    debug!(collection, deleted = outcome.deleted_count, "deleted documents");
    Ok(outcome)
}


#[derive(Debug)]
struct Snapshot {
    base_version: u64,
    collections: StoreMap,
}

/// A session of the [`InMemoryDriver`].
///
/// A transaction works on a private copy of every collection. Committing publishes the copy
/// if nothing else was written since the transaction started; dropping the session discards it.
#[derive(Debug)]
pub struct InMemorySession {
    id: u64,
    driver: InMemoryDriver,
    transaction: Option<Snapshot>,
}

impl InMemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl DriverSession for InMemorySession {
    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    async fn start_transaction(&mut self) -> ServiceResult<()> {
        if self.transaction.is_some() {
            return Err(ServiceError::Backend(format!(
                "session {} already has a transaction in progress",
                self.id
            )));
        }
        if !self.driver.transactions {
            return Err(ServiceError::Backend("transactions are not supported".to_string()));
        }
        if take_injected_failure(&self.driver.counters.failing_starts) {
            warn!(session = self.id, "injected start failure");
            return Err(ServiceError::TransientTransaction(
                "injected start failure".to_string()
            ));
        }

        let state = self.driver.state.read().await;
        self.transaction = Some(Snapshot {
            base_version: state.version,
            collections: state.collections.clone(),
        });
        debug!(session = self.id, version = state.version, "started transaction");

        Ok(())
    }

    async fn commit_transaction(&mut self) -> ServiceResult<()> {
        let Some(snapshot) = self.transaction.take() else {
            return Err(ServiceError::Backend(format!(
                "session {} has no transaction in progress",
                self.id
            )));
        };

        if take_injected_failure(&self.driver.counters.failing_commits) {
            self.driver.counters.aborts.fetch_add(1, Ordering::SeqCst);
            warn!(session = self.id, "injected commit failure");
            return Err(ServiceError::TransientTransaction(
                "injected commit failure".to_string()
            ));
        }

        let mut state = self.driver.state.write().await;
        if state.version != snapshot.base_version {
            self.driver.counters.aborts.fetch_add(1, Ordering::SeqCst);
            return Err(ServiceError::TransientTransaction(format!(
                "write conflict: store moved from version {} to {}",
                snapshot.base_version, state.version
            )));
        }

        state.collections = snapshot.collections;
        state.version += 1;
        self.driver.counters.commits.fetch_add(1, Ordering::SeqCst);
        debug!(session = self.id, version = state.version, "committed transaction");

        Ok(())
    }

    async fn abort_transaction(&mut self) -> ServiceResult<()> {
        if self.transaction.take().is_some() {
            self.driver.counters.aborts.fetch_add(1, Ordering::SeqCst);
            debug!(session = self.id, "aborted transaction");
        }

        Ok(())
    }

    fn discard_transaction(&mut self) {
        if self.transaction.take().is_some() {
            self.driver.counters.aborts.fetch_add(1, Ordering::SeqCst);
            debug!(session = self.id, "discarded transaction");
        }
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.discard_transaction();
    }
}


/// Builder for constructing [`InMemoryDriver`] instances.
///
/// # Example
///
/// ```ignore
/// use docservice_memory::InMemoryDriver;
/// use docservice_core::driver::DriverBuilder;
///
/// let driver = InMemoryDriver::builder()
///     .with_documents("nodes", vec![doc! { "name": "root" }])
///     .build()
///     .await?;
/// ```
#[derive(Debug)]
pub struct InMemoryDriverBuilder {
    transactions: bool,
    seed: StoreMap,
}

impl Default for InMemoryDriverBuilder {
    fn default() -> Self {
        Self { transactions: true, seed: StoreMap::new() }
    }
}

impl InMemoryDriverBuilder {
    /// Whether the driver reports transaction support. Without it, sessions behave like
    /// sessions on a standalone server.
    pub fn with_transactions(mut self, transactions: bool) -> Self {
        self.transactions = transactions;
        self
    }

    /// Seeds a collection. Documents without an `_id` get a generated one.
    pub fn with_documents(mut self, collection: impl Into<String>, documents: Vec<Document>) -> Self {
        self.seed
            .entry(collection.into())
            .or_default()
            .extend(documents.into_iter().map(with_id));
        self
    }
}

#[async_trait]
impl DriverBuilder for InMemoryDriverBuilder {
    type Driver = InMemoryDriver;

    /// Builds and returns a new [`InMemoryDriver`] instance.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::DocumentAlreadyExists`] if seeded documents share an `_id`.
    async fn build(self) -> ServiceResult<Self::Driver> {
        for (collection, documents) in &self.seed {
            check_new_ids(&[], documents, collection)?;
        }

        let driver = InMemoryDriver {
            transactions: self.transactions,
            ..InMemoryDriver::new()
        };
        driver.state.write().await.collections = self.seed;

        Ok(driver)
    }
}
