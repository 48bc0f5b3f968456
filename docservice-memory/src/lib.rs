//! In-memory database driver for docservice.
//!
//! This crate provides a thread-safe, in-memory implementation of the `Driver` trait.
//! It uses async-aware read-write locks for concurrent access and is meant for development,
//! testing and small deployments.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using an async-aware RwLock
//! - **Filter evaluation** - Evaluates the MongoDB filter dialect produced by the query compiler
//! - **Update operators** - `$set`, `$unset` and `$inc`
//! - **Aggregation** - `$match`, `$sort`, `$skip`, `$limit`, `$project`, `$set`, `$unset`,
//!   `$group` and `$count` stages
//! - **Snapshot transactions** - Optimistic commits that fail transiently on write conflicts
//! - **Fault injection** - Forced transaction start and commit failures for exercising retry paths
//!
//! # Quick Start
//!
//! ```ignore
//! use docservice::{prelude::*, memory::InMemoryDriver};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = InMemoryDriver::builder().build().await?;
//!     let database = Database::new(driver);
//!     let people = database.service::<PersonService>();
//!
//!     let person = people.create(&PersonCreate { name: "Ada".into(), age: 36 }, None).await?;
//!     println!("{person:?}");
//!
//!     Ok(())
//! }
//! ```

pub mod driver;
mod evaluator;
mod pipeline;
mod update;

pub use driver::{InMemoryDriver, InMemoryDriverBuilder, InMemorySession};
