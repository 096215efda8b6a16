//! In-memory driver
//!
//! A process-local store that implements the same capability set as the
//! MongoDB driver. Data lives in the [`MemoryDriver`] and survives reconnects,
//! so it can stand in for a server in tests. Fault injection hooks simulate an
//! unreachable server, failing pings, latency and undecodable documents.
//!
//! Supported query operators: `$and`, `$or`, `$nor`, `$eq`, `$ne`, `$gt`,
//! `$gte`, `$lt`, `$lte`, `$in`, `$nin`, `$exists`, `$not`. Supported update
//! operators: `$set`, `$setOnInsert`, `$unset`, `$inc`.

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document as BsonDocument};
use docbridge_common::{DocBridgeError, Result};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::driver::{BulkOutcome, DocumentStream, Driver, StoreClient, UpdateOutcome, UpsertPair};
use crate::query::FindQuery;

type Namespace = (String, String);

#[derive(Debug, Default)]
struct MemoryServer {
    collections: Mutex<HashMap<Namespace, Vec<BsonDocument>>>,
    unreachable: AtomicBool,
    failing_pings: AtomicUsize,
    connects: AtomicUsize,
    latency: Mutex<Option<Duration>>,
    decode_failure_after: Mutex<Option<usize>>,
}

/// Driver for the in-memory store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    server: Arc<MemoryServer>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unreachable, connects, pings and operations all fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.server.unreachable.store(!reachable, AtomicOrdering::SeqCst);
    }

    /// Makes the next `count` pings fail even though the store is reachable.
    pub fn fail_next_pings(&self, count: usize) {
        self.server.failing_pings.store(count, AtomicOrdering::SeqCst);
    }

    /// Delay added to every ping and operation.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.server.latency.lock() = latency;
    }

    /// Finds yield `count` documents, then a decode error.
    pub fn fail_decode_after(&self, count: Option<usize>) {
        *self.server.decode_failure_after.lock() = count;
    }

    /// Number of successful connects so far
    pub fn connect_count(&self) -> usize {
        self.server.connects.load(AtomicOrdering::SeqCst)
    }

    /// Snapshot of a collection in insertion order
    pub fn documents(&self, database: &str, collection: &str) -> Vec<BsonDocument> {
        self.server
            .collections
            .lock()
            .get(&(database.to_string(), collection.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    type Client = MemoryClient;

    async fn connect(&self, _config: &ConnectionConfig) -> Result<MemoryClient> {
        if self.server.unreachable.load(AtomicOrdering::SeqCst) {
            return Err(DocBridgeError::Connect("connection refused".to_string()));
        }
        self.server.connects.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(MemoryClient {
            server: Arc::clone(&self.server),
            closed: AtomicBool::new(false),
        })
    }
}

/// Handle onto the in-memory store
#[derive(Debug)]
pub struct MemoryClient {
    server: Arc<MemoryServer>,
    closed: AtomicBool,
}

impl MemoryClient {
    async fn delay(&self) {
        let latency = *self.server.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    async fn check(&self) -> Result<()> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(DocBridgeError::Connect("client has been shut down".to_string()));
        }
        if self.server.unreachable.load(AtomicOrdering::SeqCst) {
            return Err(DocBridgeError::Connect("server unreachable".to_string()));
        }
        self.delay().await;
        Ok(())
    }

    fn with_collection<T>(
        &self,
        database: &str,
        collection: &str,
        f: impl FnOnce(&mut Vec<BsonDocument>) -> Result<T>,
    ) -> Result<T> {
        let mut collections = self.server.collections.lock();
        let docs = collections
            .entry((database.to_string(), collection.to_string()))
            .or_default();
        f(docs)
    }
}

#[async_trait]
impl StoreClient for MemoryClient {
    async fn ping(&self) -> Result<()> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(DocBridgeError::Ping("client has been shut down".to_string()));
        }
        self.delay().await;
        if self.server.unreachable.load(AtomicOrdering::SeqCst) {
            return Err(DocBridgeError::Ping("server unreachable".to_string()));
        }
        let injected = self
            .server
            .failing_pings
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DocBridgeError::Ping("injected ping failure".to_string()));
        }
        Ok(())
    }

    async fn find(&self, database: &str, query: &FindQuery) -> Result<DocumentStream> {
        self.check().await?;

        let mut found = self.with_collection(database, query.collection_name(), |docs| {
            let mut found = Vec::new();
            for doc in docs.iter() {
                if matches_filter(doc, query.get_filter())? {
                    found.push(doc.clone());
                }
            }
            Ok(found)
        })?;

        if let Some(sort) = query.get_sort() {
            sort_documents(&mut found, sort)?;
        }

        let skip = query.get_skip().unwrap_or(0) as usize;
        let limit = match query.get_limit() {
            0 => usize::MAX,
            n => n as usize,
        };
        let mut items: Vec<Result<BsonDocument>> = found
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(Ok)
            .collect();

        let decode_failure_after = *self.server.decode_failure_after.lock();
        if let Some(after) = decode_failure_after {
            if after < items.len() {
                items.truncate(after);
                items.push(Err(DocBridgeError::Decode(format!(
                    "injected decode failure at document {}",
                    after
                ))));
            }
        }

        Ok(stream::iter(items).boxed())
    }

    async fn insert_one(
        &self,
        database: &str,
        collection: &str,
        document: BsonDocument,
    ) -> Result<Bson> {
        self.check().await?;
        self.with_collection(database, collection, |docs| {
            insert_document(docs, database, collection, document)
        })
    }

    async fn insert_many(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<BsonDocument>,
    ) -> Result<Vec<Bson>> {
        self.check().await?;
        self.with_collection(database, collection, |docs| {
            // Ordered: documents before the first failure stay inserted
            documents
                .into_iter()
                .map(|document| insert_document(docs, database, collection, document))
                .collect()
        })
    }

    async fn update_one(
        &self,
        database: &str,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        self.check().await?;
        self.with_collection(database, collection, |docs| {
            update_documents(docs, &filter, &update, upsert, false)
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
        self.check().await?;
        self.with_collection(database, collection, |docs| {
            update_documents(docs, &filter, &update, upsert, true)
        })
    }

    async fn bulk_upsert(
        &self,
        database: &str,
        collection: &str,
        pairs: Vec<UpsertPair>,
    ) -> Result<BulkOutcome> {
        self.check().await?;
        self.with_collection(database, collection, |docs| {
            let mut outcome = BulkOutcome::default();
            for pair in &pairs {
                let single = update_documents(docs, &pair.filter, &pair.update, true, false)?;
                outcome.matched_count += single.matched_count;
                outcome.modified_count += single.modified_count;
                if single.upserted() {
                    outcome.upserted_count += 1;
                }
            }
            Ok(outcome)
        })
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, AtomicOrdering::SeqCst) {
            return Err(DocBridgeError::Close("client already shut down".to_string()));
        }
        Ok(())
    }
}

fn with_generated_id(document: BsonDocument) -> BsonDocument {
    if document.contains_key("_id") {
        return document;
    }
    let mut with_id = doc! { "_id": ObjectId::new() };
    for (key, value) in document {
        with_id.insert(key, value);
    }
    with_id
}

fn insert_document(
    docs: &mut Vec<BsonDocument>,
    database: &str,
    collection: &str,
    document: BsonDocument,
) -> Result<Bson> {
    let document = with_generated_id(document);
    let id = document.get("_id").cloned().unwrap_or(Bson::Null);

    let duplicate = docs
        .iter()
        .any(|existing| existing.get("_id").is_some_and(|other| bson_eq(other, &id)));
    if duplicate {
        return Err(DocBridgeError::Query(format!(
            "E11000 duplicate key error collection: {}.{} index: _id_ dup key: {{ _id: {} }}",
            database, collection, id
        )));
    }

    docs.push(document);
    Ok(id)
}

fn update_documents(
    docs: &mut Vec<BsonDocument>,
    filter: &BsonDocument,
    update: &BsonDocument,
    upsert: bool,
    multi: bool,
) -> Result<UpdateOutcome> {
    let mut outcome = UpdateOutcome::default();

    for doc in docs.iter_mut() {
        if !matches_filter(doc, filter)? {
            continue;
        }
        let mut updated = doc.clone();
        apply_update(&mut updated, update, false)?;
        outcome.matched_count += 1;
        if updated != *doc {
            *doc = updated;
            outcome.modified_count += 1;
        }
        if !multi {
            break;
        }
    }

    if outcome.matched_count == 0 && upsert {
        let mut inserted = seed_from_filter(filter)?;
        apply_update(&mut inserted, update, true)?;
        let inserted = with_generated_id(inserted);
        outcome.upserted_id = inserted.get("_id").cloned();
        docs.push(inserted);
    }

    Ok(outcome)
}

fn get_path<'a>(doc: &'a BsonDocument, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(doc: &mut BsonDocument, path: &str, value: Bson) -> Result<()> {
    let mut parts: Vec<&str> = path.split('.').collect();
    let last = parts.pop().unwrap_or(path);
    let mut current = doc;
    for part in parts {
        if !current.contains_key(part) {
            current.insert(part, BsonDocument::new());
        }
        current = match current.get_mut(part) {
            Some(Bson::Document(inner)) => inner,
            _ => {
                return Err(DocBridgeError::Query(format!(
                    "Cannot create field '{}' in non-document value at '{}'",
                    last, path
                )))
            }
        };
    }
    current.insert(last, value);
    Ok(())
}

fn remove_path(doc: &mut BsonDocument, path: &str) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let last = parts.pop().unwrap_or(path);
    let mut current = doc;
    for part in parts {
        current = match current.get_mut(part) {
            Some(Bson::Document(inner)) => inner,
            _ => return,
        };
    }
    current.remove(last);
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Integers compare exactly; f64 only when a double is involved
fn as_exact_int(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}

fn compare_numbers(a: &Bson, b: &Bson) -> Option<Option<Ordering>> {
    if let (Some(x), Some(y)) = (as_exact_int(a), as_exact_int(b)) {
        return Some(Some(x.cmp(&y)));
    }
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => Some(x.partial_cmp(&y)),
        _ => None,
    }
}

/// Equality with numeric types compared by value
fn bson_eq(a: &Bson, b: &Bson) -> bool {
    match compare_numbers(a, b) {
        Some(ordering) => ordering == Some(Ordering::Equal),
        None => a == b,
    }
}

fn compare_values(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let Some(ordering) = compare_numbers(a, b) {
        return ordering;
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => {
            Some(x.timestamp_millis().cmp(&y.timestamp_millis()))
        }
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        _ => None,
    }
}

/// Cross-type sort order, lowest first
fn type_rank(value: Option<&Bson>) -> u8 {
    match value {
        Some(Bson::MinKey) => 0,
        None | Some(Bson::Null) | Some(Bson::Undefined) => 1,
        Some(Bson::Int32(_)) | Some(Bson::Int64(_)) | Some(Bson::Double(_))
        | Some(Bson::Decimal128(_)) => 2,
        Some(Bson::String(_)) | Some(Bson::Symbol(_)) => 3,
        Some(Bson::Document(_)) => 4,
        Some(Bson::Array(_)) => 5,
        Some(Bson::Binary(_)) => 6,
        Some(Bson::ObjectId(_)) => 7,
        Some(Bson::Boolean(_)) => 8,
        Some(Bson::DateTime(_)) => 9,
        Some(Bson::Timestamp(_)) => 10,
        Some(Bson::RegularExpression(_)) => 11,
        Some(Bson::MaxKey) => 13,
        Some(_) => 12,
    }
}

fn sort_cmp(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    type_rank(a).cmp(&type_rank(b)).then_with(|| match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    })
}

fn sort_documents(docs: &mut [BsonDocument], sort: &BsonDocument) -> Result<()> {
    let mut keys = Vec::with_capacity(sort.len());
    for (path, direction) in sort {
        let descending = match as_f64(direction) {
            Some(d) if d == 1.0 => false,
            Some(d) if d == -1.0 => true,
            _ => {
                return Err(DocBridgeError::Query(format!(
                    "Invalid sort direction for '{}': {}",
                    path, direction
                )))
            }
        };
        keys.push((path.as_str(), descending));
    }

    docs.sort_by(|a, b| {
        keys.iter()
            .map(|(path, descending)| {
                let ordering = sort_cmp(get_path(a, path), get_path(b, path));
                if *descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            })
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
    Ok(())
}

fn operator_document(condition: &Bson) -> Option<&BsonDocument> {
    match condition {
        Bson::Document(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
            Some(ops)
        }
        _ => None,
    }
}

fn sub_filters<'a>(operator: &str, argument: &'a Bson) -> Result<Vec<&'a BsonDocument>> {
    let invalid = || DocBridgeError::Query(format!("{} must be an array of documents", operator));
    match argument {
        Bson::Array(items) if !items.is_empty() => items
            .iter()
            .map(|item| item.as_document().ok_or_else(invalid))
            .collect(),
        _ => Err(invalid()),
    }
}

fn matches_filter(doc: &BsonDocument, filter: &BsonDocument) -> Result<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in sub_filters(key, condition)? {
                    if !matches_filter(doc, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" | "$nor" => {
                let mut any = false;
                for sub in sub_filters(key, condition)? {
                    if matches_filter(doc, sub)? {
                        any = true;
                        break;
                    }
                }
                if key == "$or" {
                    any
                } else {
                    !any
                }
            }
            other if other.starts_with('$') => {
                return Err(DocBridgeError::Query(format!(
                    "unknown top level operator: {}",
                    other
                )))
            }
            path => matches_condition(get_path(doc, path), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn value_equals(value: Option<&Bson>, target: &Bson) -> bool {
    match value {
        None => matches!(target, Bson::Null),
        Some(Bson::Array(items)) if !matches!(target, Bson::Array(_)) => {
            items.iter().any(|item| bson_eq(item, target))
        }
        Some(v) => bson_eq(v, target),
    }
}

fn any_compares(value: Option<&Bson>, target: &Bson, accept: fn(Ordering) -> bool) -> bool {
    let check = |v: &Bson| compare_values(v, target).is_some_and(accept);
    match value {
        Some(Bson::Array(items)) => items.iter().any(check),
        Some(v) => check(v),
        None => false,
    }
}

fn matches_condition(value: Option<&Bson>, condition: &Bson) -> Result<bool> {
    let Some(ops) = operator_document(condition) else {
        return Ok(value_equals(value, condition));
    };

    for (op, argument) in ops {
        let matched = match op.as_str() {
            "$eq" => value_equals(value, argument),
            "$ne" => !value_equals(value, argument),
            "$gt" => any_compares(value, argument, |o| o == Ordering::Greater),
            "$gte" => any_compares(value, argument, |o| o != Ordering::Less),
            "$lt" => any_compares(value, argument, |o| o == Ordering::Less),
            "$lte" => any_compares(value, argument, |o| o != Ordering::Greater),
            "$in" | "$nin" => {
                let Bson::Array(candidates) = argument else {
                    return Err(DocBridgeError::Query(format!("{} needs an array", op)));
                };
                let found = candidates.iter().any(|c| value_equals(value, c));
                if op == "$in" {
                    found
                } else {
                    !found
                }
            }
            "$exists" => {
                let wanted = match argument {
                    Bson::Boolean(b) => *b,
                    other => as_f64(other).is_some_and(|n| n != 0.0),
                };
                wanted == value.is_some()
            }
            "$not" => {
                if operator_document(argument).is_none() {
                    return Err(DocBridgeError::Query("$not needs an operator document".to_string()));
                }
                !matches_condition(value, argument)?
            }
            other => {
                return Err(DocBridgeError::Query(format!(
                    "unsupported query operator: {}",
                    other
                )))
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn add_numbers(current: &Bson, delta: &Bson) -> Result<Bson> {
    match (current, delta) {
        (Bson::Int32(a), Bson::Int32(b)) => Ok(a
            .checked_add(*b)
            .map(Bson::Int32)
            .unwrap_or_else(|| Bson::Int64(i64::from(*a) + i64::from(*b)))),
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            let a = current.as_i64().or_else(|| current.as_i32().map(i64::from));
            let b = delta.as_i64().or_else(|| delta.as_i32().map(i64::from));
            match (a, b) {
                (Some(a), Some(b)) => a
                    .checked_add(b)
                    .map(Bson::Int64)
                    .ok_or_else(|| DocBridgeError::Query("$inc overflowed int64".to_string())),
                _ => Err(DocBridgeError::Query("Cannot apply $inc".to_string())),
            }
        }
        _ => match (as_f64(current), as_f64(delta)) {
            (Some(a), Some(b)) => Ok(Bson::Double(a + b)),
            _ => Err(DocBridgeError::Query(
                "Cannot apply $inc to a value of non-numeric type".to_string(),
            )),
        },
    }
}

fn apply_update(doc: &mut BsonDocument, update: &BsonDocument, inserting: bool) -> Result<()> {
    if update.is_empty() || !update.keys().all(|k| k.starts_with('$')) {
        return Err(DocBridgeError::Query(
            "Update document requires atomic operators".to_string(),
        ));
    }

    for (op, fields) in update {
        let fields = fields.as_document().ok_or_else(|| {
            DocBridgeError::Query(format!("Modifiers for {} must be a document", op))
        })?;

        for (path, value) in fields {
            if path == "_id" && op != "$setOnInsert" {
                let changes_id = match doc.get("_id") {
                    Some(existing) => op != "$set" || !bson_eq(existing, value),
                    None => op != "$set",
                };
                if changes_id {
                    return Err(DocBridgeError::Query(
                        "Performing an update on the path '_id' would modify the immutable field '_id'"
                            .to_string(),
                    ));
                }
            }

            match op.as_str() {
                "$set" => set_path(doc, path, value.clone())?,
                "$setOnInsert" => {
                    if inserting {
                        set_path(doc, path, value.clone())?;
                    }
                }
                "$unset" => remove_path(doc, path),
                "$inc" => {
                    let current = get_path(doc, path).cloned().unwrap_or(Bson::Int32(0));
                    let next = add_numbers(&current, value)?;
                    set_path(doc, path, next)?;
                }
                other => {
                    return Err(DocBridgeError::Query(format!(
                        "unsupported update operator: {}",
                        other
                    )))
                }
            }
        }
    }
    Ok(())
}

/// Equality fields of a filter become the starting point of an upserted document.
fn seed_from_filter(filter: &BsonDocument) -> Result<BsonDocument> {
    let mut seeded = BsonDocument::new();
    for (path, condition) in filter {
        if path.starts_with('$') {
            continue;
        }
        match operator_document(condition) {
            Some(ops) => {
                if let Some(value) = ops.get("$eq") {
                    set_path(&mut seeded, path, value.clone())?;
                }
            }
            None => set_path(&mut seeded, path, condition.clone())?,
        }
    }
    Ok(seeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn client() -> (MemoryDriver, MemoryClient) {
        let driver = MemoryDriver::new();
        let client = driver.connect(&ConnectionConfig::default()).await.unwrap();
        (driver, client)
    }

    async fn find_all(client: &MemoryClient, query: FindQuery) -> Result<Vec<BsonDocument>> {
        client.find("db", &query).await?.try_collect().await
    }

    #[test]
    fn test_matches_equality_and_dotted_paths() {
        let doc = doc! { "name": "a", "age": 30, "address": { "city": "Oslo" }, "tags": ["x", "y"] };
        assert!(matches_filter(&doc, &doc! {}).unwrap());
        assert!(matches_filter(&doc, &doc! { "name": "a" }).unwrap());
        assert!(matches_filter(&doc, &doc! { "age": 30.0 }).unwrap());
        assert!(matches_filter(&doc, &doc! { "address.city": "Oslo" }).unwrap());
        assert!(matches_filter(&doc, &doc! { "tags": "y" }).unwrap());
        assert!(matches_filter(&doc, &doc! { "missing": Bson::Null }).unwrap());
        assert!(!matches_filter(&doc, &doc! { "name": "b" }).unwrap());
    }

    #[test]
    fn test_matches_operators() {
        let doc = doc! { "age": 30, "name": "a" };
        assert!(matches_filter(&doc, &doc! { "age": { "$gt": 18, "$lte": 30 } }).unwrap());
        assert!(!matches_filter(&doc, &doc! { "age": { "$lt": 30 } }).unwrap());
        assert!(matches_filter(&doc, &doc! { "name": { "$in": ["a", "b"] } }).unwrap());
        assert!(matches_filter(&doc, &doc! { "name": { "$nin": ["c"] } }).unwrap());
        assert!(matches_filter(&doc, &doc! { "name": { "$ne": "b" } }).unwrap());
        assert!(matches_filter(&doc, &doc! { "email": { "$exists": false } }).unwrap());
        assert!(matches_filter(&doc, &doc! { "age": { "$not": { "$gt": 40 } } }).unwrap());
        assert!(matches_filter(
            &doc,
            &doc! { "$or": [ { "name": "z" }, { "age": { "$gte": 30 } } ] }
        )
        .unwrap());
        assert!(!matches_filter(&doc, &doc! { "$nor": [ { "name": "a" } ] }).unwrap());
        assert!(matches_filter(&doc, &doc! { "$and": [ { "name": "a" }, { "age": 30 } ] }).unwrap());
    }

    #[test]
    fn test_matches_rejects_unknown_operators() {
        let doc = doc! { "age": 30 };
        assert!(matches_filter(&doc, &doc! { "age": { "$regex": "3" } }).is_err());
        assert!(matches_filter(&doc, &doc! { "$where": "true" }).is_err());
        assert!(matches_filter(&doc, &doc! { "$or": [] }).is_err());
    }

    #[test]
    fn test_apply_update_operators() {
        let mut doc = doc! { "_id": 1, "n": 1, "old": true };
        apply_update(
            &mut doc,
            &doc! { "$set": { "name": "a", "meta.v": 2 }, "$inc": { "n": 4 }, "$unset": { "old": "" } },
            false,
        )
        .unwrap();
        assert_eq!(doc, doc! { "_id": 1, "n": 5, "name": "a", "meta": { "v": 2 } });
    }

    #[test]
    fn test_apply_update_rejects_replacement_and_id_change() {
        let mut doc = doc! { "_id": 1 };
        assert!(apply_update(&mut doc, &doc! { "name": "a" }, false).is_err());
        assert!(apply_update(&mut doc, &doc! { "$set": { "_id": 2 } }, false).is_err());
        assert!(apply_update(&mut doc, &doc! { "$set": { "_id": 1 } }, false).is_ok());
    }

    #[test]
    fn test_add_numbers() {
        assert_eq!(add_numbers(&Bson::Int32(1), &Bson::Int32(2)).unwrap(), Bson::Int32(3));
        assert_eq!(
            add_numbers(&Bson::Int32(i32::MAX), &Bson::Int32(1)).unwrap(),
            Bson::Int64(i64::from(i32::MAX) + 1)
        );
        assert_eq!(add_numbers(&Bson::Int64(1), &Bson::Int32(2)).unwrap(), Bson::Int64(3));
        assert_eq!(add_numbers(&Bson::Int32(1), &Bson::Double(0.5)).unwrap(), Bson::Double(1.5));
        assert!(add_numbers(&Bson::String("a".into()), &Bson::Int32(1)).is_err());
    }

    #[test]
    fn test_sort_documents() {
        let mut docs = vec![
            doc! { "n": 2, "s": "b" },
            doc! { "s": "z" },
            doc! { "n": 1, "s": "c" },
            doc! { "n": 2, "s": "a" },
        ];
        sort_documents(&mut docs, &doc! { "n": -1, "s": 1 }).unwrap();
        assert_eq!(
            docs,
            vec![
                doc! { "n": 2, "s": "a" },
                doc! { "n": 2, "s": "b" },
                doc! { "n": 1, "s": "c" },
                doc! { "s": "z" },
            ]
        );
        assert!(sort_documents(&mut docs, &doc! { "n": 2 }).is_err());
    }

    #[test]
    fn test_seed_from_filter() {
        let seeded = seed_from_filter(&doc! {
            "_id": 7, "a.b": 1, "c": { "$eq": 2 }, "d": { "$gt": 3 }, "$or": [ { "e": 1 } ]
        })
        .unwrap();
        assert_eq!(seeded, doc! { "_id": 7, "a": { "b": 1 }, "c": 2 });
    }

    #[tokio::test]
    async fn test_insert_generates_id_first() {
        let (driver, client) = client().await;
        let id = client.insert_one("db", "users", doc! { "name": "a" }).await.unwrap();
        assert!(matches!(id, Bson::ObjectId(_)));

        let stored = driver.documents("db", "users");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].keys().next().map(String::as_str), Some("_id"));
    }

    #[tokio::test]
    async fn test_insert_duplicate_id() {
        let (_, client) = client().await;
        client.insert_one("db", "users", doc! { "_id": 1 }).await.unwrap();
        let err = client.insert_one("db", "users", doc! { "_id": 1 }).await.unwrap_err();
        assert!(matches!(err, DocBridgeError::Query(msg) if msg.contains("E11000")));
    }

    #[tokio::test]
    async fn test_large_int64_ids_stay_distinct() {
        let (driver, client) = client().await;
        let low = 9_007_199_254_740_992i64;
        let high = low + 1;
        client.insert_one("db", "big", doc! { "_id": low }).await.unwrap();
        client.insert_one("db", "big", doc! { "_id": high }).await.unwrap();
        assert_eq!(driver.documents("db", "big").len(), 2);

        let found = find_all(&client, FindQuery::new("big").filter(doc! { "_id": high }))
            .await
            .unwrap();
        assert_eq!(found, vec![doc! { "_id": high }]);

        let sorted = find_all(&client, FindQuery::new("big").sort(doc! { "_id": -1 }))
            .await
            .unwrap();
        assert_eq!(sorted, vec![doc! { "_id": high }, doc! { "_id": low }]);
    }

    #[test]
    fn test_mixed_numeric_equality() {
        assert!(bson_eq(&Bson::Int32(3), &Bson::Int64(3)));
        assert!(bson_eq(&Bson::Int64(3), &Bson::Double(3.0)));
        assert!(!bson_eq(&Bson::Int64(3), &Bson::Double(3.5)));
    }

    #[tokio::test]
    async fn test_insert_many_is_ordered() {
        let (driver, client) = client().await;
        let result = client
            .insert_many(
                "db",
                "users",
                vec![doc! { "_id": 1 }, doc! { "_id": 1 }, doc! { "_id": 2 }],
            )
            .await;
        assert!(result.is_err());
        assert_eq!(driver.documents("db", "users"), vec![doc! { "_id": 1 }]);
    }

    #[tokio::test]
    async fn test_find_sort_skip_limit() {
        let (_, client) = client().await;
        for n in 0..5 {
            client.insert_one("db", "nums", doc! { "_id": n }).await.unwrap();
        }
        let query = FindQuery::new("nums").sort(doc! { "_id": -1 }).skip(1).limit(2);
        let found = find_all(&client, query).await.unwrap();
        assert_eq!(found, vec![doc! { "_id": 3 }, doc! { "_id": 2 }]);
    }

    #[tokio::test]
    async fn test_find_decode_failure_injection() {
        let (driver, client) = client().await;
        for n in 0..3 {
            client.insert_one("db", "nums", doc! { "_id": n }).await.unwrap();
        }
        driver.fail_decode_after(Some(1));
        let err = find_all(&client, FindQuery::new("nums")).await.unwrap_err();
        assert!(matches!(err, DocBridgeError::Decode(_)));
    }

    #[tokio::test]
    async fn test_update_one_and_many() {
        let (_, client) = client().await;
        client
            .insert_many("db", "c", vec![doc! { "_id": 1, "g": 1 }, doc! { "_id": 2, "g": 1 }])
            .await
            .unwrap();

        let one = client
            .update_one("db", "c", doc! { "g": 1 }, doc! { "$set": { "x": 1 } }, false)
            .await
            .unwrap();
        assert_eq!((one.matched_count, one.modified_count), (1, 1));

        let many = client
            .update_many("db", "c", doc! { "g": 1 }, doc! { "$set": { "x": 1 } }, false)
            .await
            .unwrap();
        assert_eq!((many.matched_count, many.modified_count), (2, 1));
        assert!(!many.upserted());
    }

    #[tokio::test]
    async fn test_update_upsert_inserts_seeded_document() {
        let (driver, client) = client().await;
        let outcome = client
            .update_one(
                "db",
                "c",
                doc! { "_id": 9 },
                doc! { "$set": { "name": "a" }, "$setOnInsert": { "created": true } },
                true,
            )
            .await
            .unwrap();
        assert_eq!(outcome.upserted_id, Some(Bson::Int32(9)));
        assert_eq!(
            driver.documents("db", "c"),
            vec![doc! { "_id": 9, "name": "a", "created": true }]
        );
    }

    #[tokio::test]
    async fn test_bulk_upsert() {
        let (driver, client) = client().await;
        client.insert_one("db", "c", doc! { "_id": 1, "v": 0 }).await.unwrap();
        let outcome = client
            .bulk_upsert(
                "db",
                "c",
                vec![
                    UpsertPair::new(doc! { "_id": 1 }, doc! { "$set": { "v": 1 } }),
                    UpsertPair::new(doc! { "_id": 2 }, doc! { "$set": { "v": 2 } }),
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            BulkOutcome {
                matched_count: 1,
                modified_count: 1,
                upserted_count: 1
            }
        );
        assert_eq!(driver.documents("db", "c").len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_and_shutdown() {
        let (driver, client) = client().await;
        driver.set_reachable(false);
        assert!(matches!(client.ping().await, Err(DocBridgeError::Ping(_))));
        assert!(matches!(
            driver.connect(&ConnectionConfig::default()).await,
            Err(DocBridgeError::Connect(_))
        ));
        driver.set_reachable(true);
        assert!(client.ping().await.is_ok());

        client.shutdown().await.unwrap();
        assert!(client.ping().await.is_err());
        assert!(matches!(client.shutdown().await, Err(DocBridgeError::Close(_))));
    }

    #[tokio::test]
    async fn test_fail_next_pings() {
        let (driver, client) = client().await;
        driver.fail_next_pings(2);
        assert!(client.ping().await.is_err());
        assert!(client.ping().await.is_err());
        assert!(client.ping().await.is_ok());
    }
}
