//! MongoDB client facade for docbridge
//!
//! A small, resilient data-access layer over the official MongoDB driver.
//!
//! # Features
//! - Connection manager with liveness probe and single-shot reconnect
//! - Find, insert, update, upsert and bulk upsert with one uniform deadline
//! - Typed errors for every operation, logged through `tracing`
//! - Driver capability traits with a MongoDB and an in-memory implementation

pub mod client;
pub mod config;
pub mod driver;
pub mod manager;
pub mod memory;
pub mod mongo;
pub mod query;
pub mod validation;

pub use client::DocClient;
pub use config::{ConnectionConfig, PoolConfig};
pub use docbridge_common::{DocBridgeError, Result};
pub use driver::{BulkOutcome, DocumentStream, Driver, StoreClient, UpdateOutcome, UpsertPair};
pub use manager::{ConnectionManager, ConnectionState, Lease};
pub use memory::{MemoryClient, MemoryDriver};
pub use mongo::{MongoClient, MongoDriver};
pub use query::{update_document, FindQuery};
pub use validation::{validate_database_name, ValidatedCollectionName};
