//! Vector-store service (§4.F): a thin wrapper over the Qdrant client that
//! adds collection lifecycle management, bounded concurrency, and retries
//! on top of the raw RPC calls.
//!
//! Grounded on the namespace-cached storage pattern in background indexing
//! workers: collection existence is cached per name (here with a TTL rather
//! than held forever, since collections named by project hash can in
//! principle be deleted out-of-band) and every request shares one
//! concurrency-limiting semaphore so a burst of upserts can't starve the
//! rest of the service.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use qdrant_client::qdrant::{
    value::Kind, vectors_config::Config as VectorsConfigOneOf, CountPointsBuilder, CreateCollectionBuilder,
    DeletePointsBuilder, Distance, Filter, OptimizersConfigDiff, PointId, PointStruct, PointsIdsList, ScoredPoint,
    ScrollPointsBuilder, ScrollResponse, SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue,
    VectorParamsBuilder, VectorsConfig,
};
use qdrant_client::Qdrant;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::VectorStoreError;

const EXISTENCE_TTL: Duration = Duration::from_secs(3600);
const EXISTENCE_CACHE_CAP: usize = 100;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 3;
const INDEXING_THRESHOLD: u64 = 100;

/// A point ready to be upserted: an integer id, a dense vector, and an
/// arbitrary JSON payload (the caller — `watcher.rs` — builds this from a
/// [`crate::models::Point`]).
pub struct UpsertPoint {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

pub struct VectorStore {
    client: Qdrant,
    semaphore: Arc<Semaphore>,
    existence_cache: DashMap<String, Instant>,
    request_timeout: Duration,
}

impl VectorStore {
    pub fn new(url: &str, max_concurrent: usize) -> Result<Self, VectorStoreError> {
        Self::with_timeout(url, max_concurrent, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Like [`Self::new`] but with an explicit per-request timeout, used by
    /// callers that thread `config.qdrant_timeout` through instead of
    /// relying on the default.
    pub fn with_timeout(url: &str, max_concurrent: usize, request_timeout: Duration) -> Result<Self, VectorStoreError> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| VectorStoreError::Client(e.into()))?;
        Ok(Self {
            client,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            existence_cache: DashMap::new(),
            request_timeout,
        })
    }

    /// TTL-cached existence check; creates the collection on miss. Treats a
    /// concurrent "already exists" as success rather than an error, since
    /// two watcher cycles can race to create the same collection.
    pub async fn ensure_collection(&self, name: &str, dims: u64) -> Result<(), VectorStoreError> {
        if let Some(seen_at) = self.existence_cache.get(name) {
            if seen_at.elapsed() < EXISTENCE_TTL {
                return Ok(());
            }
        }

        if self.existence_cache.len() >= EXISTENCE_CACHE_CAP {
            self.evict_oldest();
        }

        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(|e| VectorStoreError::Client(e.into()))?;

        if !exists {
            let create = CreateCollectionBuilder::new(name)
                .vectors_config(VectorsConfig {
                    config: Some(VectorsConfigOneOf::Params(
                        VectorParamsBuilder::new(dims, Distance::Cosine).build(),
                    )),
                })
                .optimizers_config(OptimizersConfigDiff {
                    indexing_threshold: Some(INDEXING_THRESHOLD),
                    ..Default::default()
                })
                .on_disk_payload(true);

            match self.client.create_collection(create).await {
                Ok(_) => {}
                Err(e) => {
                    let msg = e.to_string();
                    if !msg.to_lowercase().contains("already exists") {
                        return Err(VectorStoreError::Client(e.into()));
                    }
                    debug!("collection {name} already exists (race), treating as success");
                }
            }
        }

        self.existence_cache.insert(name.to_string(), Instant::now());
        Ok(())
    }

    fn evict_oldest(&self) {
        if let Some(oldest_key) = self
            .existence_cache
            .iter()
            .min_by_key(|e| *e.value())
            .map(|e| e.key().clone())
        {
            self.existence_cache.remove(&oldest_key);
        }
    }

    /// Upserts a batch of points with `wait=true`, retried up to
    /// [`MAX_RETRIES`] times with exponential backoff. Returns an error
    /// (rather than panicking) on final failure; callers must not advance
    /// state-store bookkeeping when this returns `Err`.
    pub async fn upsert(&self, collection: &str, points: Vec<UpsertPoint>) -> Result<(), VectorStoreError> {
        if points.is_empty() {
            return Ok(());
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| VectorStoreError::Client(e.into()))?;

        let structs: Vec<PointStruct> = points
            .into_iter()
            .map(|p| PointStruct::new(p.id, p.vector, payload_from_json(p.payload)))
            .collect();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let request = UpsertPointsBuilder::new(collection, structs.clone()).wait(true);

            match tokio::time::timeout(self.request_timeout, self.client.upsert_points(request)).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => {
                    if attempt >= MAX_RETRIES {
                        return Err(VectorStoreError::Client(e.into()));
                    }
                    warn!("upsert to {collection} failed (attempt {attempt}): {e}");
                }
                Err(_) => {
                    if attempt >= MAX_RETRIES {
                        return Err(VectorStoreError::Timeout);
                    }
                    warn!("upsert to {collection} timed out (attempt {attempt})");
                }
            }
            tokio::time::sleep(Duration::from_millis(200 * (1u64 << attempt.min(4)))).await;
        }
    }

    pub async fn delete_by_id(&self, collection: &str, ids: Vec<u64>) -> Result<(), VectorStoreError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| VectorStoreError::Client(e.into()))?;

        let point_ids: Vec<PointId> = ids.into_iter().map(PointId::from).collect();
        let request = DeletePointsBuilder::new(collection).points(PointsIdsList { ids: point_ids });
        self.client
            .delete_points(request)
            .await
            .map(|_| ())
            .map_err(|e| VectorStoreError::Client(e.into()))
    }

    pub async fn scroll(
        &self,
        collection: &str,
        filter: Option<Filter>,
        offset: Option<PointId>,
        limit: u32,
    ) -> Result<ScrollResponse, VectorStoreError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| VectorStoreError::Client(e.into()))?;

        let mut request = ScrollPointsBuilder::new(collection).limit(limit).with_payload(true);
        if let Some(f) = filter {
            request = request.filter(f);
        }
        if let Some(o) = offset {
            request = request.offset(o);
        }
        self.client
            .scroll(request)
            .await
            .map_err(|e| VectorStoreError::Client(e.into()))
    }

    pub async fn count(&self, collection: &str, filter: Option<Filter>) -> Result<u64, VectorStoreError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| VectorStoreError::Client(e.into()))?;

        let mut request = CountPointsBuilder::new(collection).exact(true);
        if let Some(f) = filter {
            request = request.filter(f);
        }
        let resp = self
            .client
            .count(request)
            .await
            .map_err(|e| VectorStoreError::Client(e.into()))?;
        Ok(resp.result.map(|r| r.count).unwrap_or(0))
    }

    /// Plain vector search with no server-side ranking formula; used by the
    /// client-side and no-decay search modes (`search.rs` builds the
    /// server-side-decay request directly against the Qdrant query API
    /// since it needs `Formula` support this wrapper doesn't expose).
    pub async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        score_threshold: Option<f32>,
        filter: Option<Filter>,
    ) -> Result<Vec<ScoredPoint>, VectorStoreError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| VectorStoreError::Client(e.into()))?;

        let mut request = SearchPointsBuilder::new(collection, vector, limit).with_payload(true);
        if let Some(t) = score_threshold {
            request = request.score_threshold(t);
        }
        if let Some(f) = filter {
            request = request.filter(f);
        }
        self.client
            .search_points(request)
            .await
            .map(|r| r.result)
            .map_err(|e| VectorStoreError::Client(e.into()))
    }

    /// Raw client access for callers (the search engine) that need the
    /// query API's `Formula`/`DecayParamsExpression` construction directly.
    pub fn raw_client(&self) -> &Qdrant {
        &self.client
    }
}

fn payload_from_json(value: serde_json::Value) -> std::collections::HashMap<String, QdrantValue> {
    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| (k, json_to_qdrant_value(v)))
            .collect(),
        _ => std::collections::HashMap::new(),
    }
}

/// Converts a Qdrant payload map back into a JSON object, for callers that
/// want to hand the stored point's raw payload back to a client (e.g. the
/// search API's `include_raw` option).
pub fn payload_to_json(payload: &std::collections::HashMap<String, QdrantValue>) -> serde_json::Value {
    let map = payload.iter().map(|(k, v)| (k.clone(), qdrant_value_to_json(v))).collect();
    serde_json::Value::Object(map)
}

pub fn qdrant_value_to_json(value: &QdrantValue) -> serde_json::Value {
    match &value.kind {
        None => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(*b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::Number((*i).into()),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(*d).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s.clone()),
        Some(Kind::ListValue(list)) => serde_json::Value::Array(list.values.iter().map(qdrant_value_to_json).collect()),
        Some(Kind::StructValue(s)) => {
            serde_json::Value::Object(s.fields.iter().map(|(k, v)| (k.clone(), qdrant_value_to_json(v))).collect())
        }
        #[allow(unreachable_patterns)]
        Some(_) => serde_json::Value::Null,
    }
}

fn json_to_qdrant_value(value: serde_json::Value) -> QdrantValue {
    let kind = match value {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(b) => Some(Kind::BoolValue(b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Kind::IntegerValue(i))
            } else {
                Some(Kind::DoubleValue(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => Some(Kind::StringValue(s)),
        serde_json::Value::Array(items) => Some(Kind::ListValue(qdrant_client::qdrant::ListValue {
            values: items.into_iter().map(json_to_qdrant_value).collect(),
        })),
        serde_json::Value::Object(map) => Some(Kind::StructValue(qdrant_client::qdrant::Struct {
            fields: map.into_iter().map(|(k, v)| (k, json_to_qdrant_value(v))).collect(),
        })),
    };
    QdrantValue { kind }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_object_becomes_a_payload_map() {
        let payload = serde_json::json!({"project": "foo", "chunk_index": 3});
        let map = payload_from_json(payload);
        assert!(matches!(map.get("project").unwrap().kind, Some(Kind::StringValue(_))));
        assert!(matches!(map.get("chunk_index").unwrap().kind, Some(Kind::IntegerValue(3))));
    }

    #[test]
    fn with_timeout_overrides_the_default() {
        let store = VectorStore::with_timeout("http://localhost:6333", 1, Duration::from_secs(30)).unwrap();
        assert_eq!(store.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn non_object_json_yields_empty_payload() {
        let payload = serde_json::json!("not an object");
        assert!(payload_from_json(payload).is_empty());
    }
}
