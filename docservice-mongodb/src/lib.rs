//! MongoDB driver for docservice.
//!
//! This crate implements the `Driver` trait on top of the official MongoDB driver. Filters
//! compiled by the query layer are passed to the server untouched, and service transactions
//! map onto MongoDB client session transactions.
//!
//! To use this driver, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! docservice = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Features
//!
//! - **Sessions and transactions** - Multi-document transactions on replica sets and sharded clusters
//! - **Transient error detection** - `TransientTransactionError` labelled failures are retried
//! - **Standalone fallback** - Without transaction support, writes run without a transaction
//! - **Indexing** - Creating, dropping and listing indexes
//! - **Aggregation** - Pipelines run on the server, inside the session's transaction if any
//!
//! # Example
//!
//! ```ignore
//! use docservice::{prelude::*, mongodb::MongoDbDriver};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = MongoDbDriver::builder("mongodb://localhost:27017/?replicaSet=rs0", "my_database")
//!         .build()
//!         .await?;
//!     let database = Database::new(driver);
//!
//!     Ok(())
//! }
//! ```

pub mod driver;
pub mod session;
mod options;

pub use driver::{MongoDbDriver, MongoDbDriverBuilder};
pub use session::MongoDbSession;
