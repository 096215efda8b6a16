//! Query builder for find operations and update document helpers

use bson::{doc, Document as BsonDocument};
use docbridge_common::{DocBridgeError, Result};
use std::time::Duration;

/// Query builder for find operations
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    collection_name: String,
    filter: BsonDocument,
    sort: Option<BsonDocument>,
    skip: Option<u64>,
    limit: u64,
    timeout: Option<Duration>,
}

impl FindQuery {
    /// Create a new query matching every document in the collection
    pub fn new(collection_name: impl Into<String>) -> Self {
        Self {
            collection_name: collection_name.into(),
            filter: BsonDocument::new(),
            sort: None,
            skip: None,
            limit: 0,
            timeout: None,
        }
    }

    /// Set the filter document
    pub fn filter(mut self, filter: BsonDocument) -> Self {
        self.filter = filter;
        self
    }

    /// Set the sort order
    pub fn sort(mut self, sort: BsonDocument) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Set the number of documents to skip
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Set the maximum number of documents to return (0 = unlimited)
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Override the client's operation timeout for this query
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn get_filter(&self) -> &BsonDocument {
        &self.filter
    }

    pub fn get_sort(&self) -> Option<&BsonDocument> {
        self.sort.as_ref()
    }

    pub fn get_skip(&self) -> Option<u64> {
        self.skip
    }

    pub fn get_limit(&self) -> u64 {
        self.limit
    }

    /// The limit as the driver expects it: `None` when unlimited
    pub fn driver_limit(&self) -> Option<i64> {
        match self.limit {
            0 => None,
            n => Some(i64::try_from(n).unwrap_or(i64::MAX)),
        }
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Normalizes an update argument.
///
/// Documents holding update operators (`$set`, `$inc`, ...) pass through
/// unchanged. Plain value documents are wrapped as `{ "$set": values }`.
pub fn update_document(values: BsonDocument) -> Result<BsonDocument> {
    if values.is_empty() {
        return Err(DocBridgeError::Validation(
            "Update document cannot be empty".to_string(),
        ));
    }

    if values.keys().any(|key| key.starts_with('$')) {
        Ok(values)
    } else {
        Ok(doc! { "$set": values })
    }
}
