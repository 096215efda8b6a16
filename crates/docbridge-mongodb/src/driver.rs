//! Driver capability interface
//!
//! The facade never talks to a store directly. It goes through [`Driver`] to
//! open a client and through [`StoreClient`] for everything else, so the same
//! operation layer runs against MongoDB or the in-memory store.

use async_trait::async_trait;
use bson::{Bson, Document};
use docbridge_common::Result;
use futures::stream::BoxStream;

use crate::config::ConnectionConfig;
use crate::query::FindQuery;

/// Documents produced by a find, in cursor order
pub type DocumentStream = BoxStream<'static, Result<Document>>;

/// Opens clients. One call per `init`.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Client: StoreClient;

    /// Opens a client for `config`. Does not need to verify liveness; the
    /// connection manager probes the returned client itself.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Self::Client>;
}

/// A live client handle.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    async fn ping(&self) -> Result<()>;

    async fn find(&self, database: &str, query: &FindQuery) -> Result<DocumentStream>;

    /// Returns the `_id` of the inserted document.
    async fn insert_one(&self, database: &str, collection: &str, document: Document)
        -> Result<Bson>;

    /// Ordered insert. Returns the `_id`s in input order.
    async fn insert_many(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<Bson>>;

    async fn update_one(
        &self,
        database: &str,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome>;

    async fn update_many(
        &self,
        database: &str,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome>;

    /// One ordered bulk write with an upserting update-one model per pair.
    async fn bulk_upsert(
        &self,
        database: &str,
        collection: &str,
        pairs: Vec<UpsertPair>,
    ) -> Result<BulkOutcome>;

    async fn shutdown(&self) -> Result<()>;
}

/// Result of an update or upsert
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
    /// Set when the update inserted a new document
    pub upserted_id: Option<Bson>,
}

impl UpdateOutcome {
    pub fn upserted(&self) -> bool {
        self.upserted_id.is_some()
    }
}

/// Result of a bulk upsert
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_count: u64,
}

/// One filter/update pair of a bulk upsert
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertPair {
    pub filter: Document,
    pub update: Document,
}

impl UpsertPair {
    pub fn new(filter: Document, update: Document) -> Self {
        Self { filter, update }
    }
}

impl From<(Document, Document)> for UpsertPair {
    fn from((filter, update): (Document, Document)) -> Self {
        Self::new(filter, update)
    }
}
