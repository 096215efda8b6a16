//! MongoDB driver backed by the official `mongodb` crate

use async_trait::async_trait;
use bson::{doc, Bson, Document as BsonDocument};
use docbridge_common::{DocBridgeError, Result};
use futures::{StreamExt, TryStreamExt};
use mongodb::{
    options::{ClientOptions, FindOptions, ServerApi, ServerApiVersion, UpdateOneModel, UpdateOptions},
    Client, Collection,
};
use tracing::{debug, instrument};

use crate::config::{ConnectionConfig, PoolConfig};
use crate::driver::{BulkOutcome, DocumentStream, Driver, StoreClient, UpdateOutcome, UpsertPair};
use crate::query::FindQuery;

/// Production driver
#[derive(Debug, Clone, Default)]
pub struct MongoDriver;

impl MongoDriver {
    pub fn new() -> Self {
        Self
    }
}

/// Applies pool tuning on top of the options parsed from the URI.
fn apply_pool_config(client_options: &mut ClientOptions, config: &PoolConfig) {
    if let Some(min) = config.min_pool_size {
        client_options.min_pool_size = Some(min);
    }
    if let Some(max) = config.max_pool_size {
        client_options.max_pool_size = Some(max);
    }
    if let Some(idle) = config.max_idle_time {
        client_options.max_idle_time = Some(idle);
    }
    if let Some(connect) = config.connect_timeout {
        client_options.connect_timeout = Some(connect);
    }
    if let Some(server_sel) = config.server_selection_timeout {
        client_options.server_selection_timeout = Some(server_sel);
    }
    if let Some(app) = &config.app_name {
        client_options.app_name = Some(app.clone());
    }
}

#[async_trait]
impl Driver for MongoDriver {
    type Client = MongoClient;

    #[instrument(skip_all, fields(host = %config.host, port = config.port))]
    async fn connect(&self, config: &ConnectionConfig) -> Result<MongoClient> {
        let mut client_options = ClientOptions::parse(config.uri())
            .await
            .map_err(|e| DocBridgeError::Connect(format!("Invalid connection URI: {}", e)))?;

        apply_pool_config(&mut client_options, &config.pool);

        // Set stable API version for compatibility
        let server_api = ServerApi::builder().version(ServerApiVersion::V1).build();
        client_options.server_api = Some(server_api);

        let client = Client::with_options(client_options)
            .map_err(|e| DocBridgeError::Connect(e.to_string()))?;

        debug!("MongoDB client created");
        Ok(MongoClient { client })
    }
}

/// Live MongoDB client. Cloning the inner `Client` shares its pool.
#[derive(Debug, Clone)]
pub struct MongoClient {
    client: Client,
}

impl MongoClient {
    fn collection(&self, database: &str, collection: &str) -> Collection<BsonDocument> {
        self.client.database(database).collection(collection)
    }

    /// Underlying driver client, for calls the facade does not cover
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl StoreClient for MongoClient {
    async fn ping(&self) -> Result<()> {
        // run_command targets the primary by default
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| DocBridgeError::Ping(e.to_string()))?;
        Ok(())
    }

    async fn find(&self, database: &str, query: &FindQuery) -> Result<DocumentStream> {
        let mut options = FindOptions::default();
        options.limit = query.driver_limit();
        options.sort = query.get_sort().cloned();
        options.skip = query.get_skip();

        let cursor = self
            .collection(database, query.collection_name())
            .find(query.get_filter().clone())
            .with_options(options)
            .await?;

        Ok(cursor.map_err(DocBridgeError::from).boxed())
    }

    async fn insert_one(
        &self,
        database: &str,
        collection: &str,
        document: BsonDocument,
    ) -> Result<Bson> {
        let result = self.collection(database, collection).insert_one(document).await?;
        Ok(result.inserted_id)
    }

    async fn insert_many(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<BsonDocument>,
    ) -> Result<Vec<Bson>> {
        let result = self
            .collection(database, collection)
            .insert_many(documents)
            .await?;

        let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
        ids.sort_by_key(|(index, _)| *index);
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn update_one(
        &self,
        database: &str,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let mut options = UpdateOptions::default();
        options.upsert = Some(upsert);

        let result = self
            .collection(database, collection)
            .update_one(filter, update)
            .with_options(options)
            .await?;

        Ok(UpdateOutcome {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    async fn update_many(
        &self,
        database: &str,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let mut options = UpdateOptions::default();
        options.upsert = Some(upsert);

        let result = self
            .collection(database, collection)
            .update_many(filter, update)
            .with_options(options)
            .await?;

        Ok(UpdateOutcome {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    async fn bulk_upsert(
        &self,
        database: &str,
        collection: &str,
        pairs: Vec<UpsertPair>,
    ) -> Result<BulkOutcome> {
        let namespace = self.collection(database, collection).namespace();
        let models: Vec<UpdateOneModel> = pairs
            .into_iter()
            .map(|pair| {
                UpdateOneModel::builder()
                    .namespace(namespace.clone())
                    .filter(pair.filter)
                    .update(pair.update)
                    .upsert(true)
                    .build()
            })
            .collect();

        let result = self.client.bulk_write(models).ordered(true).await?;

        Ok(BulkOutcome {
            matched_count: result.matched_count.max(0) as u64,
            modified_count: result.modified_count.max(0) as u64,
            upserted_count: result.upserted_count.max(0) as u64,
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}
