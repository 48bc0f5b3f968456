//! A declarative service layer for document databases.
//!
//! This crate is the core of the docservice project and provides:
//!
//! - **Typed queries** ([`query`]) - Field descriptors, filter clauses and their compilation
//!   into MongoDB filter documents
//! - **Aggregations** ([`aggregation`]) - Aggregation pipeline builder
//! - **Document conversion** ([`document`]) - Storage mappings and primary key types
//! - **Driver abstraction** ([`driver`]) - Traits implemented by database drivers and sessions
//! - **Rules** ([`rules`]) - Validators and delete rules registered per service
//! - **Transactions** ([`transaction`]) - Retried transactional execution
//! - **Services** ([`service`]) - The CRUD layer tying the above together
//! - **Database handle** ([`database`]) - The shared driver handle services are created from
//! - **Indexes** ([`index`]) - Index declarations
//! - **Configuration** ([`config`]) - Service and retry configuration
//! - **Error handling** ([`error`]) - Error types and result types
//!
//! # Example
//!
//! ```ignore
//! use docservice::prelude::*;
//!
//! const PARENT: Field = Field::nullable("parent", ValueKind::ObjectId);
//!
//! struct TreeNodeService;
//!
//! impl ServiceSpec for TreeNodeService {
//!     type Insert = TreeNodeCreate;
//!     type Update = TreeNodeUpdate;
//!     type Model = TreeNode;
//!     type Id = ObjectId;
//!
//!     const COLLECTION: &'static str = "tree_nodes";
//!
//!     fn register_rules<D: Driver>(rules: &mut RuleSetBuilder<Self, D>) {
//!         rules.delete_rule("delete_children", DeletePhase::Pre, |service, session, ids| {
//!             Box::pin(async move {
//!                 service.delete_many(PARENT.is_in(ids.to_vec())?, Some(session)).await?;
//!                 Ok(())
//!             })
//!         });
//!     }
//! }
//! ```

pub mod aggregation;
pub mod config;
pub mod database;
pub mod document;
pub mod driver;
pub mod error;
pub mod index;
pub mod query;
pub mod rules;
pub mod service;
pub mod transaction;
