//! A declarative service layer for document databases.
//!
//! This crate is the primary entry point of docservice. It re-exports the core types from the
//! sub-crates and provides access to the available drivers.
//!
//! # Features
//!
//! - **Typed queries** - Field descriptors compile comparisons into MongoDB filter documents
//! - **Validators** - Named checks run before inserts and updates
//! - **Delete rules** - Deny, pre and post rules run around deletes in one transaction
//! - **Retried transactions** - Transient failures re-run the whole transactional body
//! - **Multiple drivers** - In-memory and MongoDB drivers behind one trait
//!
//! # Quick Start
//!
//! ```ignore
//! use docservice::{prelude::*, memory::InMemoryDriver};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! pub struct Person {
//!     #[serde(rename = "_id")]
//!     pub id: ObjectId,
//!     pub name: String,
//!     pub age: i32,
//! }
//!
//! #[derive(Debug, Serialize)]
//! pub struct PersonCreate {
//!     pub name: String,
//!     pub age: i32,
//! }
//!
//! #[derive(Debug, Default, Serialize)]
//! pub struct PersonUpdate {
//!     pub name: Option<String>,
//!     pub age: Option<i32>,
//! }
//!
//! const AGE: Field = Field::new("age", ValueKind::Number);
//!
//! pub struct PersonService;
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
//!         rules.validator("adult", ValidatorKind::Insert, |_service, payload, _filter, _session| {
//!             Box::pin(async move {
//!                 match payload {
//!                     Payload::Insert(person) if person.age < 18 => Err(ServiceError::rejected("must be an adult")),
//!                     _ => Ok(()),
//!                 }
//!             })
//!         });
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> ServiceResult<()> {
//!     let database = Database::new(InMemoryDriver::builder().build().await?);
//!     let people = database.service::<PersonService>();
//!
//!     people.create(&PersonCreate { name: "Ada".into(), age: 36 }, None).await?;
//!     let adults = people.find(AGE.gte(18)?, None).await?;
//!     println!("{adults:?}");
//!
//!     Ok(())
//! }
//! ```
//!
//! # Drivers
//!
//! - [`memory`] - In-memory driver for development and testing
//! - [`mongodb`] - MongoDB driver (requires the `mongodb` feature)

pub mod prelude;

pub use docservice_core::{config, database, document, driver, error, index, query, rules, service, transaction};

// Re-export BSON types for convenience
pub use bson;

/// In-memory driver implementations.
pub mod memory {
    pub use docservice_memory::{InMemoryDriver, InMemoryDriverBuilder, InMemorySession};
}

/// MongoDB driver implementations.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docservice_mongodb::{MongoDbDriver, MongoDbDriverBuilder, MongoDbSession};
}
