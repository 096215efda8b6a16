//! Operation layer
//!
//! Every operation follows the same template: validate the collection name,
//! lease a live handle (pinging and reconnecting once if needed), run exactly
//! one driver call under the effective deadline, and log any failure before
//! returning it.

use bson::{Bson, Document as BsonDocument};
use docbridge_common::{DocBridgeError, Result};
use futures::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument};

use crate::config::ConnectionConfig;
use crate::driver::{BulkOutcome, DocumentStream, Driver, StoreClient, UpdateOutcome, UpsertPair};
use crate::manager::{ConnectionManager, ConnectionState};
use crate::mongo::MongoDriver;
use crate::query::{update_document, FindQuery};
use crate::validation::ValidatedCollectionName;

/// Document-store facade.
///
/// Cloning is cheap and clones share one connection manager.
///
/// # Example
///
/// ```ignore
/// use bson::doc;
/// use docbridge_mongodb::{ConnectionConfig, DocClient};
///
/// let config = ConnectionConfig::new("localhost", 27017, "app", "secret", "shop");
/// let client = DocClient::connect(config).await?;
///
/// client.insert("users", doc! { "_id": 1, "name": "a" }).await?;
/// let users = client.find("users", doc! { "_id": 1 }, 10).await?;
/// ```
pub struct DocClient<D: Driver = MongoDriver> {
    manager: Arc<ConnectionManager<D>>,
    timeout: Duration,
}

impl<D: Driver> Clone for DocClient<D> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            timeout: self.timeout,
        }
    }
}

impl<D: Driver> std::fmt::Debug for DocClient<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocClient")
            .field("manager", &self.manager)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DocClient<MongoDriver> {
    /// Connects to MongoDB and verifies liveness.
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        Self::connect_with(MongoDriver::new(), config).await
    }
}

impl<D: Driver> DocClient<D> {
    /// Creates a client without dialing. The first operation connects.
    pub fn new(driver: D, config: ConnectionConfig) -> Self {
        let timeout = config.operation_timeout;
        Self {
            manager: Arc::new(ConnectionManager::new(driver, config)),
            timeout,
        }
    }

    /// Creates a client and runs `init` before returning it.
    pub async fn connect_with(driver: D, config: ConnectionConfig) -> Result<Self> {
        let client = Self::new(driver, config);
        client.init().await?;
        Ok(client)
    }

    /// A client sharing this connection whose operations use `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn manager(&self) -> &ConnectionManager<D> {
        &self.manager
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn database(&self) -> &str {
        &self.manager.config().database
    }

    pub async fn init(&self) -> Result<()> {
        self.manager.init().await
    }

    pub async fn ping(&self, reconnect_on_failure: bool) -> Result<()> {
        self.manager.ping(reconnect_on_failure).await
    }

    pub async fn close(&self) -> Result<()> {
        self.manager.close().await
    }

    /// Runs `call` under `timeout`, logging whatever goes wrong.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        collection: &ValidatedCollectionName,
        timeout: Duration,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DocBridgeError::Timeout(format!(
                "{} on '{}' exceeded {:?}",
                operation, collection, timeout
            ))),
        };

        if let Err(e) = &result {
            error!(operation, collection = %collection, error = %e, "Operation failed");
        }
        result
    }

    fn validated(&self, operation: &'static str, collection: &str) -> Result<ValidatedCollectionName> {
        ValidatedCollectionName::new(collection).inspect_err(|e| {
            error!(operation, collection, error = %e, "Rejected collection name");
        })
    }

    /// Find up to `limit` documents matching `filter` (0 = unlimited).
    pub async fn find(
        &self,
        collection: &str,
        filter: BsonDocument,
        limit: u64,
    ) -> Result<Vec<BsonDocument>> {
        self.find_query(FindQuery::new(collection).filter(filter).limit(limit))
            .await
    }

    /// Same as [`find`](Self::find) with a sort specification.
    pub async fn find_with_sort(
        &self,
        collection: &str,
        filter: BsonDocument,
        sort: BsonDocument,
        limit: u64,
    ) -> Result<Vec<BsonDocument>> {
        self.find_query(
            FindQuery::new(collection)
                .filter(filter)
                .sort(sort)
                .limit(limit),
        )
        .await
    }

    /// Runs a [`FindQuery`] and materializes the whole result set.
    ///
    /// A decode failure mid-cursor aborts the call; documents read before it
    /// are discarded.
    #[instrument(skip(self, query), fields(collection = query.collection_name(), limit = query.get_limit()))]
    pub async fn find_query(&self, query: FindQuery) -> Result<Vec<BsonDocument>> {
        let collection = self.validated("find", query.collection_name())?;
        let client = self.manager.lease().await?;
        let timeout = query.get_timeout().unwrap_or(self.timeout);
        let limit = query.get_limit();

        let documents = self
            .bounded("find", &collection, timeout, async {
                let stream = client.find(self.database(), &query).await?;
                collect_documents(stream, limit).await
            })
            .await?;

        debug!(count = documents.len(), "Find completed");
        Ok(documents)
    }

    /// Finds documents and decodes each one into `T`.
    pub async fn find_as<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: BsonDocument,
        sort: Option<BsonDocument>,
        limit: u64,
    ) -> Result<Vec<T>> {
        let mut query = FindQuery::new(collection).filter(filter).limit(limit);
        if let Some(sort) = sort {
            query = query.sort(sort);
        }

        self.find_query(query)
            .await?
            .into_iter()
            .map(|document| {
                bson::from_document(document).map_err(|e| {
                    let err = DocBridgeError::from(e);
                    error!(operation = "find_as", collection, error = %err, "Operation failed");
                    err
                })
            })
            .collect()
    }

    /// Inserts one document and returns its `_id`.
    #[instrument(skip(self, document))]
    pub async fn insert(&self, collection: &str, document: BsonDocument) -> Result<Bson> {
        let collection = self.validated("insert", collection)?;
        let client = self.manager.lease().await?;
        self.bounded(
            "insert",
            &collection,
            self.timeout,
            client.insert_one(self.database(), collection.as_str(), document),
        )
        .await
    }

    /// Serializes `value` to BSON and inserts it.
    pub async fn insert_as<T: Serialize>(&self, collection: &str, value: &T) -> Result<Bson> {
        let document = bson::to_document(value).map_err(|e| {
            let err = DocBridgeError::from(e);
            error!(operation = "insert_as", collection, error = %err, "Operation failed");
            err
        })?;
        self.insert(collection, document).await
    }

    /// Ordered insert. Returns the `_id`s in input order.
    #[instrument(skip(self, documents), fields(count = documents.len()))]
    pub async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<BsonDocument>,
    ) -> Result<Vec<Bson>> {
        let collection = self.validated("insert_many", collection)?;
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.manager.lease().await?;
        self.bounded(
            "insert_many",
            &collection,
            self.timeout,
            client.insert_many(self.database(), collection.as_str(), documents),
        )
        .await
    }

    /// Updates the first document matching `filter`.
    #[instrument(skip(self, filter, update))]
    pub async fn update(
        &self,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
    ) -> Result<UpdateOutcome> {
        self.update_with("update", collection, filter, update, false, false)
            .await
    }

    /// Updates every document matching `filter`.
    #[instrument(skip(self, filter, update))]
    pub async fn update_many(
        &self,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
    ) -> Result<UpdateOutcome> {
        self.update_with("update_many", collection, filter, update, true, false)
            .await
    }

    /// Updates the first document matching `filter`, inserting one if none does.
    #[instrument(skip(self, filter, values))]
    pub async fn upsert(
        &self,
        collection: &str,
        filter: BsonDocument,
        values: BsonDocument,
    ) -> Result<UpdateOutcome> {
        self.update_with("upsert", collection, filter, values, false, true)
            .await
    }

    async fn update_with(
        &self,
        operation: &'static str,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let collection = self.validated(operation, collection)?;
        let update = update_document(update).inspect_err(|e| {
            error!(operation, collection = %collection, error = %e, "Rejected update document");
        })?;
        let client = self.manager.lease().await?;
        let database = self.database();

        self.bounded(operation, &collection, self.timeout, async {
            if multi {
                client
                    .update_many(database, collection.as_str(), filter, update, upsert)
                    .await
            } else {
                client
                    .update_one(database, collection.as_str(), filter, update, upsert)
                    .await
            }
        })
        .await
    }

    /// Upserts every pair in one ordered bulk write.
    #[instrument(skip(self, pairs), fields(count = pairs.len()))]
    pub async fn upsert_many(
        &self,
        collection: &str,
        pairs: Vec<UpsertPair>,
    ) -> Result<BulkOutcome> {
        let collection = self.validated("upsert_many", collection)?;
        if pairs.is_empty() {
            return Ok(BulkOutcome::default());
        }

        let pairs = pairs
            .into_iter()
            .map(|pair| Ok(UpsertPair::new(pair.filter, update_document(pair.update)?)))
            .collect::<Result<Vec<_>>>()
            .inspect_err(|e| {
                error!(operation = "upsert_many", collection = %collection, error = %e, "Rejected update document");
            })?;

        let client = self.manager.lease().await?;
        self.bounded(
            "upsert_many",
            &collection,
            self.timeout,
            client.bulk_upsert(self.database(), collection.as_str(), pairs),
        )
        .await
    }
}

/// Drains a cursor, stopping after `limit` documents when `limit > 0`.
async fn collect_documents(mut stream: DocumentStream, limit: u64) -> Result<Vec<BsonDocument>> {
    let mut documents = Vec::new();
    while let Some(next) = stream.next().await {
        documents.push(next?);
        if limit > 0 && documents.len() as u64 >= limit {
            break;
        }
    }
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDriver;
    use bson::doc;
    use futures::stream;

    fn client() -> (MemoryDriver, DocClient<MemoryDriver>) {
        let driver = MemoryDriver::new();
        let client = DocClient::new(driver.clone(), ConnectionConfig::default());
        (driver, client)
    }

    #[tokio::test]
    async fn test_collect_documents_respects_limit() {
        let docs: Vec<Result<BsonDocument>> = (0..5).map(|n| Ok(doc! { "n": n })).collect();
        let collected = collect_documents(stream::iter(docs.clone()).boxed(), 2)
            .await
            .unwrap();
        assert_eq!(collected.len(), 2);

        let collected = collect_documents(stream::iter(docs).boxed(), 0).await.unwrap();
        assert_eq!(collected.len(), 5);
    }

    #[tokio::test]
    async fn test_collect_documents_stops_on_error() {
        let items = vec![
            Ok(doc! { "n": 1 }),
            Err(DocBridgeError::Decode("bad".to_string())),
            Ok(doc! { "n": 2 }),
        ];
        let err = collect_documents(stream::iter(items).boxed(), 0)
            .await
            .unwrap_err();
        assert_eq!(err, DocBridgeError::Decode("bad".to_string()));
    }

    #[tokio::test]
    async fn test_first_operation_connects_lazily() {
        let (driver, client) = client();
        assert_eq!(client.state(), ConnectionState::NotReady);

        client.insert("users", doc! { "_id": 1 }).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Ready);
        assert_eq!(driver.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_with_timeout_shares_connection() {
        let (driver, client) = client();
        client.init().await.unwrap();

        let short = client.with_timeout(Duration::from_millis(250));
        assert_eq!(short.timeout(), Duration::from_millis(250));
        assert_eq!(client.timeout(), Duration::from_secs(30));

        short.insert("users", doc! { "_id": 1 }).await.unwrap();
        assert_eq!(driver.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_collection_is_rejected_before_connecting() {
        let (driver, client) = client();
        let err = client.find("system.users", doc! {}, 0).await.unwrap_err();
        assert!(matches!(err, DocBridgeError::Validation(_)));
        assert_eq!(driver.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_batches_skip_the_driver() {
        let (driver, client) = client();
        assert!(client.insert_many("users", Vec::new()).await.unwrap().is_empty());
        assert_eq!(
            client.upsert_many("users", Vec::new()).await.unwrap(),
            BulkOutcome::default()
        );
        assert_eq!(driver.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_update_is_rejected() {
        let (_, client) = client();
        let err = client
            .update("users", doc! { "_id": 1 }, doc! {})
            .await
            .unwrap_err();
        assert!(matches!(err, DocBridgeError::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_timeout() {
        let (driver, client) = client();
        client.init().await.unwrap();
        driver.set_latency(Some(Duration::from_secs(2)));

        // Ping is unbounded by default, so only the operation deadline fires
        let err = client
            .with_timeout(Duration::from_secs(1))
            .insert("users", doc! { "_id": 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, DocBridgeError::Timeout(msg) if msg.contains("insert on 'users'")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_query_timeout_override() {
        let (driver, client) = client();
        client.insert("users", doc! { "_id": 1 }).await.unwrap();
        driver.set_latency(Some(Duration::from_secs(2)));

        let query = FindQuery::new("users").timeout(Duration::from_secs(1));
        assert!(matches!(
            client.find_query(query).await,
            Err(DocBridgeError::Timeout(_))
        ));

        let query = FindQuery::new("users").timeout(Duration::from_secs(5));
        assert_eq!(client.find_query(query).await.unwrap().len(), 1);
    }
}
