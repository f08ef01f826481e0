//! Elasticsearch backend.
//!
//! Speaks the Elasticsearch 8 REST API over one shared HTTP client.
//! Lifecycle operations on one index are serialised through
//! [`IndexLifecycle`]; reads and document writes are not.

mod response;
mod transport;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::bulk::{encode_ndjson, BulkBatch, BulkSummary};
use crate::config::Config;
use crate::error::{BulkOperationError, Result, SiftError};
use crate::lifecycle::{IndexLifecycle, IndexState};
use crate::query::{metadata_metrics_body, QueryBuilder, SearchQuery, VectorQuery};
use crate::schema::{
    field_name_for_vector_settings, index_name_for_dataset, mapping_for_metadata_property,
    mapping_for_vector_settings, SchemaBuilder,
};
use crate::types::{
    Dataset, MetadataMetrics, MetadataProperty, RecordId, Record, SearchResponse,
    VectorSettings, VectorValue,
};

use super::{SearchEngine, SearchFilters};

pub use response::{parse_metrics_response, parse_search_response};
use transport::{BackendResponse, RequestBody, Transport};

/// Settings groups Elasticsearch only accepts on a closed index.
const CLOSED_INDEX_SETTINGS: &[&str] = &["analysis"];

/// Version conflicts retried by the backend on partial updates.
const RETRY_ON_CONFLICT: u32 = 3;

pub struct ElasticsearchEngine {
    transport: Transport,
    schema: SchemaBuilder,
    index_prefix: String,
    wait_for_active_shards: u32,
    lifecycle: IndexLifecycle,
}

impl ElasticsearchEngine {
    pub const NAME: &'static str = "elasticsearch";

    pub fn new(config: &Config) -> Result<Self> {
        let es = &config.elasticsearch;
        let transport = Transport::from_config(es)?;
        info!(
            hosts = ?es.hosts,
            shards = es.number_of_shards,
            replicas = es.number_of_replicas,
            "elasticsearch engine configured"
        );
        Ok(Self {
            transport,
            schema: SchemaBuilder::new(es.number_of_shards, es.number_of_replicas),
            index_prefix: config.search_engine.index_prefix.clone(),
            wait_for_active_shards: es.number_of_shards,
            lifecycle: IndexLifecycle::new(),
        })
    }

    pub fn index_name(&self, dataset: &Dataset) -> String {
        index_name_for_dataset(&self.index_prefix, &dataset.id)
    }

    /// This process's view of index states.
    pub fn lifecycle(&self) -> &IndexLifecycle {
        &self.lifecycle
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<RequestBody>,
    ) -> Result<BackendResponse> {
        self.transport
            .request(operation, method, path, query, body.as_ref())
            .await
    }

    /// Send and require a 2xx answer.
    async fn send_ok(
        &self,
        operation: &'static str,
        index: &str,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<RequestBody>,
    ) -> Result<Value> {
        let response = self.send(operation, method, path, query, body).await?;
        if response.is_success() {
            Ok(response.body)
        } else {
            Err(error_for(index, &response))
        }
    }

    /// Ask the backend whether `index` exists and whether it is open, and
    /// record the answer.
    async fn refresh_state(&self, index: &str) -> Result<IndexState> {
        let response = self
            .send(
                "index_status",
                Method::GET,
                &format!("/_cat/indices/{index}"),
                &[("format", "json".into()), ("h", "status".into())],
                None,
            )
            .await?;

        let state = match response.status {
            404 => IndexState::Absent,
            s if (200..300).contains(&s) => response::parse_index_status(&response.body)
                .ok_or_else(|| SiftError::Backend {
                    status: s,
                    reason: format!("unexpected index status for {index}: {}", response.body),
                })?,
            _ => return Err(error_for(index, &response)),
        };
        self.lifecycle.observe(index, state);
        Ok(state)
    }

    async fn open_locked(&self, index: &str) -> Result<()> {
        let guard = self
            .lifecycle
            .begin(index, IndexState::Reopening, IndexState::Closed)?;
        self.send_ok(
            "open_index",
            index,
            Method::POST,
            &format!("/{index}/_open"),
            &[("wait_for_active_shards", self.wait_for_active_shards.to_string())],
            None,
        )
        .await?;
        guard.commit(IndexState::Open)
    }

    async fn close_locked(&self, index: &str) -> Result<()> {
        let guard = self
            .lifecycle
            .begin(index, IndexState::Closing, IndexState::Open)?;
        self.send_ok(
            "close_index",
            index,
            Method::POST,
            &format!("/{index}/_close"),
            &[
                ("ignore_unavailable", "true".into()),
                ("wait_for_active_shards", self.wait_for_active_shards.to_string()),
            ],
            None,
        )
        .await?;
        guard.commit(IndexState::Closed)
    }

    async fn delete_locked(&self, index: &str) -> Result<()> {
        if self.refresh_state(index).await? == IndexState::Absent {
            debug!(index, "index does not exist, nothing to delete");
            return Ok(());
        }

        let guard = self
            .lifecycle
            .begin(index, IndexState::Deleting, IndexState::Open)?;
        let result = self
            .send_ok(
                "delete_index",
                index,
                Method::DELETE,
                &format!("/{index}"),
                &[("ignore_unavailable", "true".into())],
                None,
            )
            .await;

        match result {
            Ok(_) => {}
            Err(SiftError::IndexNotFound { .. }) => {
                warn!(index, "index deleted concurrently");
            }
            Err(e) => return Err(e),
        }
        guard.commit(IndexState::Absent)
    }

    async fn put_settings(&self, index: &str, settings: &Value) -> Result<()> {
        self.send_ok(
            "put_settings",
            index,
            Method::PUT,
            &format!("/{index}/_settings"),
            &[],
            Some(RequestBody::Json(settings.clone())),
        )
        .await?;
        Ok(())
    }

    async fn put_mapping(&self, index: &str, properties: Value) -> Result<()> {
        self.send_ok(
            "put_mapping",
            index,
            Method::PUT,
            &format!("/{index}/_mapping"),
            &[],
            Some(RequestBody::Json(json!({ "properties": properties }))),
        )
        .await?;
        Ok(())
    }

    /// Send every chunk of `batch`, then settle per-item outcomes.
    async fn execute_bulk(&self, batch: BulkBatch) -> Result<BulkSummary> {
        let mut responses = Vec::new();
        for chunk in batch.chunks() {
            let body = encode_ndjson(batch.index(), chunk)?;
            debug!(index = batch.index(), actions = chunk.len(), "sending bulk chunk");
            let response = self
                .send_ok(
                    "bulk",
                    batch.index(),
                    Method::POST,
                    "/_bulk",
                    &[],
                    Some(RequestBody::NdJson(body)),
                )
                .await?;
            responses.push(response);
        }
        batch.settle(&responses)
    }

    async fn run_search(&self, operation: &'static str, index: &str, body: Value) -> Result<Value> {
        self.send_ok(
            operation,
            index,
            Method::POST,
            &format!("/{index}/_search"),
            &[],
            Some(RequestBody::Json(body)),
        )
        .await
    }

    async fn stored_vector(
        &self,
        index: &str,
        vector_settings: &VectorSettings,
        record_id: RecordId,
    ) -> Result<Vec<f32>> {
        let response = self
            .send(
                "get_document",
                Method::GET,
                &format!("/{index}/_doc/{record_id}"),
                &[("_source_includes", field_name_for_vector_settings(vector_settings))],
                None,
            )
            .await?;
        if response.status == 404 {
            return Err(not_found(index, &record_id.to_string(), &response));
        }
        if !response.is_success() {
            return Err(error_for(index, &response));
        }
        response::parse_stored_vector(&response.body, vector_settings).ok_or_else(|| {
            SiftError::Validation(format!(
                "record {record_id} has no vector for '{}'",
                vector_settings.name
            ))
        })
    }
}

/// Typed error for a non-2xx backend answer.
fn error_for(index: &str, response: &BackendResponse) -> SiftError {
    match (response.status, response.error_type()) {
        (429, _) => SiftError::BackendUnavailable(format!(
            "backend is rejecting requests: {}",
            response.error_reason()
        )),
        (_, Some("index_not_found_exception")) => SiftError::IndexNotFound {
            index: index.to_string(),
        },
        (_, Some("resource_already_exists_exception")) => SiftError::IndexAlreadyExists {
            index: index.to_string(),
        },
        (status, _) => SiftError::Backend {
            status,
            reason: response.error_reason(),
        },
    }
}

fn not_found(index: &str, id: &str, response: &BackendResponse) -> SiftError {
    match response.error_type() {
        Some("index_not_found_exception") => SiftError::IndexNotFound {
            index: index.to_string(),
        },
        _ => SiftError::DocumentNotFound {
            index: index.to_string(),
            id: id.to_string(),
        },
    }
}

#[async_trait]
impl SearchEngine for ElasticsearchEngine {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn ping(&self) -> Result<()> {
        self.send_ok("ping", "", Method::GET, "/", &[], None).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!("closing elasticsearch engine");
        Ok(())
    }

    #[instrument(skip(self, dataset), fields(dataset = %dataset.id))]
    async fn create_index(&self, dataset: &Dataset) -> Result<()> {
        let schema = self.schema.build(dataset)?;
        let index = self.index_name(dataset);
        let _lock = self.lifecycle.lock(&index).await;

        if self.refresh_state(&index).await? != IndexState::Absent {
            debug!(index = %index, "index already exists");
            return Ok(());
        }

        let guard = self
            .lifecycle
            .begin(&index, IndexState::Creating, IndexState::Absent)?;
        let result = self
            .send_ok(
                "create_index",
                &index,
                Method::PUT,
                &format!("/{index}"),
                &[],
                Some(RequestBody::Json(json!({
                    "settings": schema.settings,
                    "mappings": schema.mappings,
                }))),
            )
            .await;

        match result {
            Ok(_) => {}
            Err(SiftError::IndexAlreadyExists { .. }) => {
                warn!(index = %index, "index created concurrently, keeping existing index");
            }
            Err(e) => return Err(e),
        }
        guard.commit(IndexState::Open)
    }

    #[instrument(skip(self, dataset), fields(dataset = %dataset.id))]
    async fn delete_index(&self, dataset: &Dataset) -> Result<()> {
        let index = self.index_name(dataset);
        let lock = self.lifecycle.lock(&index).await;
        let result = self.delete_locked(&index).await;
        drop(lock);

        if result.is_ok() {
            self.lifecycle.forget(&index);
        }
        result
    }

    #[instrument(skip(self, dataset), fields(dataset = %dataset.id))]
    async fn open_index(&self, dataset: &Dataset) -> Result<()> {
        let index = self.index_name(dataset);
        let _lock = self.lifecycle.lock(&index).await;

        match self.refresh_state(&index).await? {
            IndexState::Absent => Err(SiftError::IndexNotFound { index }),
            IndexState::Closed => self.open_locked(&index).await,
            _ => Ok(()),
        }
    }

    #[instrument(skip(self, dataset), fields(dataset = %dataset.id))]
    async fn close_index(&self, dataset: &Dataset) -> Result<()> {
        let index = self.index_name(dataset);
        let _lock = self.lifecycle.lock(&index).await;

        match self.refresh_state(&index).await? {
            IndexState::Open => self.close_locked(&index).await,
            state => {
                debug!(index = %index, %state, "index not open, nothing to close");
                Ok(())
            }
        }
    }

    #[instrument(skip(self, dataset, settings), fields(dataset = %dataset.id))]
    async fn update_index_settings(&self, dataset: &Dataset, settings: &Value) -> Result<()> {
        let index = self.index_name(dataset);
        let needs_close = CLOSED_INDEX_SETTINGS
            .iter()
            .any(|key| settings.get(*key).is_some());
        if !needs_close {
            return self.put_settings(&index, settings).await;
        }

        let _lock = self.lifecycle.lock(&index).await;
        match self.refresh_state(&index).await? {
            IndexState::Absent => return Err(SiftError::IndexNotFound { index }),
            IndexState::Closed => return self.put_settings(&index, settings).await,
            _ => {}
        }

        self.close_locked(&index).await?;
        let updated = self.put_settings(&index, settings).await;
        if let Err(e) = &updated {
            warn!(index = %index, error = %e, "settings update rejected, reopening index");
        }
        // reopen even when the update was rejected
        let reopened = self.open_locked(&index).await;
        match (updated, reopened) {
            (Err(update_err), Err(reopen_err)) => {
                warn!(index = %index, error = %reopen_err, "failed to reopen index after rejected settings update");
                Err(update_err)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    #[instrument(skip(self, dataset, property), fields(dataset = %dataset.id, property = %property.name))]
    async fn update_metadata_property(
        &self,
        dataset: &Dataset,
        property: &MetadataProperty,
    ) -> Result<()> {
        let mapping = mapping_for_metadata_property(property)?;
        self.put_mapping(&self.index_name(dataset), mapping).await
    }

    #[instrument(skip(self, dataset, vector_settings), fields(dataset = %dataset.id, vector = %vector_settings.name))]
    async fn configure_vector_settings(
        &self,
        dataset: &Dataset,
        vector_settings: &VectorSettings,
    ) -> Result<()> {
        let mapping = mapping_for_vector_settings(vector_settings)?;
        self.put_mapping(&self.index_name(dataset), mapping).await
    }

    #[instrument(skip(self, dataset, records), fields(dataset = %dataset.id, count = records.len()))]
    async fn index_records(&self, dataset: &Dataset, records: &[Record]) -> Result<BulkSummary> {
        let batch = BulkBatch::for_records(self.index_name(dataset), dataset, records);
        if batch.is_empty() {
            return Ok(BulkSummary::default());
        }
        self.execute_bulk(batch).await
    }

    #[instrument(skip(self, dataset, record_ids), fields(dataset = %dataset.id, count = record_ids.len()))]
    async fn delete_records(
        &self,
        dataset: &Dataset,
        record_ids: &[RecordId],
    ) -> Result<BulkSummary> {
        let batch = BulkBatch::for_deletes(self.index_name(dataset), record_ids);
        if batch.is_empty() {
            return Ok(BulkSummary::default());
        }
        self.execute_bulk(batch).await
    }

    #[instrument(skip(self, dataset, partial), fields(dataset = %dataset.id, record = %record_id))]
    async fn update_record(
        &self,
        dataset: &Dataset,
        record_id: RecordId,
        partial: &Value,
    ) -> Result<()> {
        let index = self.index_name(dataset);
        let response = self
            .send(
                "update_document",
                Method::POST,
                &format!("/{index}/_update/{record_id}"),
                &[("retry_on_conflict", RETRY_ON_CONFLICT.to_string())],
                Some(RequestBody::Json(json!({ "doc": partial }))),
            )
            .await?;
        match response.status {
            s if (200..300).contains(&s) => Ok(()),
            404 => Err(not_found(&index, &record_id.to_string(), &response)),
            _ => Err(error_for(&index, &response)),
        }
    }

    #[instrument(skip(self, dataset, query), fields(dataset = %dataset.id))]
    async fn search(&self, dataset: &Dataset, query: &SearchQuery) -> Result<SearchResponse> {
        let index = self.index_name(dataset);
        let request = QueryBuilder::new(dataset).build(query)?;
        let operation = if request.is_knn() { "knn_search" } else { "search" };
        let body = self.run_search(operation, &index, request.to_body()).await?;
        parse_search_response(&body)
    }

    #[instrument(skip(self, dataset, vector_settings, value, filters), fields(dataset = %dataset.id, vector = %vector_settings.name))]
    async fn similarity_search(
        &self,
        dataset: &Dataset,
        vector_settings: &VectorSettings,
        value: &VectorValue,
        k: usize,
        filters: &SearchFilters,
    ) -> Result<SearchResponse> {
        let (value, exclude) = match value {
            VectorValue::Vector(v) => (v.clone(), None),
            VectorValue::Record(record_id) => {
                let index = self.index_name(dataset);
                let v = self.stored_vector(&index, vector_settings, *record_id).await?;
                (v, Some(*record_id))
            }
        };

        let query = SearchQuery {
            metadata_filters: filters.metadata.clone(),
            response_status: filters.response_status.clone(),
            vector: Some(VectorQuery {
                vector_settings: vector_settings.clone(),
                value,
                k,
                exclude,
            }),
            ..SearchQuery::default()
        };
        self.search(dataset, &query).await
    }

    #[instrument(skip(self, dataset, property), fields(dataset = %dataset.id, property = %property.name))]
    async fn metadata_property_metrics(
        &self,
        dataset: &Dataset,
        property: &MetadataProperty,
    ) -> Result<MetadataMetrics> {
        let index = self.index_name(dataset);
        let body = self
            .run_search("metadata_metrics", &index, metadata_metrics_body(property))
            .await?;
        parse_metrics_response(property, &body)
    }

    #[instrument(skip(self, dataset, query), fields(dataset = %dataset.id))]
    async fn reindex_all(&self, dataset: &Dataset, query: Option<&Value>) -> Result<u64> {
        let index = self.index_name(dataset);
        let body = match query {
            Some(q) => json!({ "query": q }),
            None => json!({}),
        };
        let response = self
            .send(
                "update_by_query",
                Method::POST,
                &format!("/{index}/_update_by_query"),
                &[("slices", "auto".into())],
                Some(RequestBody::Json(body)),
            )
            .await?;

        let updated = response.body.get("updated").and_then(Value::as_u64).unwrap_or(0);
        let failures = response::parse_update_by_query_failures(&response.body);
        if !failures.is_empty() {
            let succeeded = updated as usize;
            let total = response.body.get("total").and_then(Value::as_u64).unwrap_or(0) as usize;
            warn!(
                index = %index,
                updated,
                failed = failures.len(),
                "reindex left documents unprocessed"
            );
            return Err(SiftError::Bulk(BulkOperationError {
                index,
                attempted: total.max(succeeded + failures.len()),
                succeeded,
                failures,
            }));
        }
        if !response.is_success() {
            return Err(error_for(&index, &response));
        }

        info!(index = %index, updated, "reindexed documents");
        Ok(updated)
    }
}
