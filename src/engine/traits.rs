//! Core trait definition for search engine backends.
//!
//! Callers hold an `Arc<dyn SearchEngine>` obtained from the
//! [`EngineRegistry`](super::EngineRegistry) and never see the concrete
//! backend type.

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::bulk::BulkSummary;
use crate::error::Result;
use crate::query::SearchQuery;
use crate::types::{
    Dataset, MetadataFilter, MetadataMetrics, MetadataProperty, Record, RecordId, Response,
    SearchResponse, UserResponseStatusFilter, VectorSettings, VectorValue,
};

/// Filters applied to a similarity search before neighbours are selected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    pub metadata: Vec<MetadataFilter>,
    pub response_status: Option<UserResponseStatusFilter>,
}

/// Contract every search backend implements.
///
/// All operations are safe to call concurrently for different datasets.
/// Lifecycle operations on the same dataset are serialised by the engine;
/// document writes to the same record are last-write-wins.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Registry name of this engine.
    fn name(&self) -> &'static str;

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<()>;

    /// Release backend resources.
    async fn close(&self) -> Result<()>;

    /// Create the dataset's index. A no-op if it already exists.
    ///
    /// # Errors
    /// `SiftError::Schema` if the dataset declares an unsupported schema;
    /// nothing is sent to the backend in that case.
    async fn create_index(&self, dataset: &Dataset) -> Result<()>;

    /// Delete the dataset's index. A no-op if it does not exist.
    async fn delete_index(&self, dataset: &Dataset) -> Result<()>;

    async fn open_index(&self, dataset: &Dataset) -> Result<()>;

    /// Close the dataset's index. A no-op if it does not exist.
    async fn close_index(&self, dataset: &Dataset) -> Result<()>;

    /// Update index settings. Settings the backend only accepts on a
    /// closed index are applied with a close/update/reopen cycle.
    async fn update_index_settings(&self, dataset: &Dataset, settings: &Value) -> Result<()>;

    /// Add (or re-declare) a metadata property mapping on a live index.
    async fn update_metadata_property(
        &self,
        dataset: &Dataset,
        property: &MetadataProperty,
    ) -> Result<()>;

    /// Add a vector field mapping on a live index.
    async fn configure_vector_settings(
        &self,
        dataset: &Dataset,
        vector_settings: &VectorSettings,
    ) -> Result<()>;

    /// Index (create or replace) records in one logical bulk call.
    ///
    /// # Errors
    /// `SiftError::Bulk` listing every failed record when at least one
    /// failed; all other records were written.
    async fn index_records(&self, dataset: &Dataset, records: &[Record]) -> Result<BulkSummary>;

    /// Remove records. Missing records are not failures.
    async fn delete_records(&self, dataset: &Dataset, record_ids: &[RecordId])
        -> Result<BulkSummary>;

    /// Merge `partial` into the stored record document.
    async fn update_record(
        &self,
        dataset: &Dataset,
        record_id: RecordId,
        partial: &Value,
    ) -> Result<()>;

    async fn update_record_response(
        &self,
        dataset: &Dataset,
        record_id: RecordId,
        response: &Response,
    ) -> Result<()> {
        let partial = json!({
            "responses": { response.user_id.to_string(): crate::bulk::response_document(response) }
        });
        self.update_record(dataset, record_id, &partial).await
    }

    async fn delete_record_response(
        &self,
        dataset: &Dataset,
        record_id: RecordId,
        user_id: Uuid,
    ) -> Result<()> {
        let partial = json!({ "responses": { user_id.to_string(): Value::Null } });
        self.update_record(dataset, record_id, &partial).await
    }

    /// Filter/text search, or vector search when the query carries a vector.
    async fn search(&self, dataset: &Dataset, query: &SearchQuery) -> Result<SearchResponse>;

    /// The `k` records nearest to `value` in the given vector space.
    async fn similarity_search(
        &self,
        dataset: &Dataset,
        vector_settings: &VectorSettings,
        value: &VectorValue,
        k: usize,
        filters: &SearchFilters,
    ) -> Result<SearchResponse>;

    async fn metadata_property_metrics(
        &self,
        dataset: &Dataset,
        property: &MetadataProperty,
    ) -> Result<MetadataMetrics>;

    /// Re-process stored documents (all, or those matching `query`) so they
    /// pick up mapping changes. Returns the number of documents updated.
    async fn reindex_all(&self, dataset: &Dataset, query: Option<&Value>) -> Result<u64>;
}
