//! Query construction.
//!
//! Turns a [`SearchQuery`] into one backend request body. Two shapes exist
//! and a request is exactly one of them:
//!
//! * standard: bool query with an optional relevance clause and filters,
//!   sorted by `_score` desc then `id` asc so paging is deterministic;
//! * kNN: approximate vector search where every filter is a pre-filter,
//!   so `k` is never under-filled by post-hoc filtering.

use serde_json::{json, Value};

use crate::error::{Result, SiftError};
use crate::schema::{
    field_name_for_field, field_name_for_metadata_property, field_name_for_response_status,
    field_name_for_vector_settings, ANY_RESPONSE_STATUS_FIELD,
};
use crate::types::{
    Dataset, MetadataFilter, MetadataProperty, MetadataPropertyType, RecordId, ResponseStatus,
    ResponseStatusFilter, TextQuery, UserResponseStatusFilter, VectorSettings,
};

/// Hard ceiling on `offset + limit` and on `k`.
pub const MAX_RESULT_WINDOW: usize = 10_000;

/// Candidate pool examined by approximate search for a given `k`.
///
/// The middle band is intentionally tighter than the small-`k` band.
pub fn compute_num_candidates_from_k(k: usize) -> usize {
    if k < 50 {
        500
    } else if k < 200 {
        100
    } else {
        2000
    }
}

/// Vector part of a search request.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorQuery {
    pub vector_settings: VectorSettings,
    pub value: Vec<f32>,
    pub k: usize,
    /// Record excluded from the results, used when searching by example.
    pub exclude: Option<RecordId>,
}

/// Structured search request.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub text: Option<TextQuery>,
    pub metadata_filters: Vec<MetadataFilter>,
    pub response_status: Option<UserResponseStatusFilter>,
    pub vector: Option<VectorQuery>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: None,
            metadata_filters: Vec::new(),
            response_status: None,
            vector: None,
            offset: 0,
            limit: 50,
        }
    }
}

impl SearchQuery {
    pub fn text(mut self, q: impl Into<String>, field: Option<&str>) -> Self {
        self.text = Some(TextQuery {
            q: q.into(),
            field: field.map(String::from),
        });
        self
    }

    pub fn metadata_filter(mut self, filter: MetadataFilter) -> Self {
        self.metadata_filters.push(filter);
        self
    }

    pub fn response_status(mut self, filter: UserResponseStatusFilter) -> Self {
        self.response_status = Some(filter);
        self
    }

    pub fn vector(mut self, vector: VectorQuery) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }
}

/// A backend request, ready to serialise.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendQuery {
    Standard {
        query: Value,
        from: usize,
        size: usize,
    },
    Knn {
        knn: Value,
        size: usize,
    },
}

impl BackendQuery {
    pub fn is_knn(&self) -> bool {
        matches!(self, BackendQuery::Knn { .. })
    }

    /// Request body for the backend's `_search` endpoint.
    pub fn to_body(&self) -> Value {
        match self {
            BackendQuery::Standard { query, from, size } => json!({
                "query": query,
                "from": from,
                "size": size,
                "sort": [
                    {"_score": {"order": "desc"}},
                    {"id": {"order": "asc"}},
                ],
                "_source": false,
                "track_total_hits": true,
            }),
            BackendQuery::Knn { knn, size } => json!({
                "knn": knn,
                "size": size,
                "_source": false,
                "track_total_hits": true,
            }),
        }
    }
}

/// Builds backend queries against one dataset's schema.
pub struct QueryBuilder<'a> {
    dataset: &'a Dataset,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(dataset: &'a Dataset) -> Self {
        Self { dataset }
    }

    pub fn build(&self, query: &SearchQuery) -> Result<BackendQuery> {
        let mut filters = Vec::new();
        for filter in &query.metadata_filters {
            filters.push(self.metadata_filter(filter)?);
        }
        if let Some(status) = &query.response_status {
            filters.push(response_status_filter(status)?);
        }

        match &query.vector {
            Some(vector) => self.knn_query(vector, query.text.as_ref(), filters),
            None => self.standard_query(query, filters),
        }
    }

    fn standard_query(&self, query: &SearchQuery, filters: Vec<Value>) -> Result<BackendQuery> {
        if query.limit == 0 {
            return Err(SiftError::InvalidQuery("limit must be > 0".into()));
        }
        let past_window = query
            .offset
            .checked_add(query.limit)
            .is_none_or(|end| end > MAX_RESULT_WINDOW);
        if past_window {
            return Err(SiftError::InvalidQuery(format!(
                "offset + limit must be <= {MAX_RESULT_WINDOW}"
            )));
        }

        let must = match &query.text {
            Some(text) => self.text_clause(text)?,
            None => json!({"match_all": {}}),
        };

        Ok(BackendQuery::Standard {
            query: json!({"bool": {"must": [must], "filter": filters}}),
            from: query.offset,
            size: query.limit,
        })
    }

    fn knn_query(
        &self,
        vector: &VectorQuery,
        text: Option<&TextQuery>,
        mut filters: Vec<Value>,
    ) -> Result<BackendQuery> {
        let settings = &vector.vector_settings;
        if !self.dataset.vectors_settings.iter().any(|v| v.id == settings.id) {
            return Err(SiftError::InvalidQuery(format!(
                "vector settings '{}' do not belong to dataset {}",
                settings.name, self.dataset.id
            )));
        }
        if vector.value.len() != settings.dimensions {
            return Err(SiftError::DimensionMismatch {
                expected: settings.dimensions,
                actual: vector.value.len(),
            });
        }
        if vector.k == 0 || vector.k > MAX_RESULT_WINDOW {
            return Err(SiftError::InvalidQuery(format!(
                "k must be in 1..={MAX_RESULT_WINDOW}, got {}",
                vector.k
            )));
        }

        // A text clause in vector mode only restricts the candidate set.
        if let Some(text) = text {
            filters.push(self.text_clause(text)?);
        }

        let must_not: Vec<Value> = vector
            .exclude
            .iter()
            .map(|id| json!({"term": {"id": id.to_string()}}))
            .collect();

        let mut knn = json!({
            "field": field_name_for_vector_settings(settings),
            "query_vector": vector.value,
            "k": vector.k,
            // the backend rejects a pool smaller than k
            "num_candidates": compute_num_candidates_from_k(vector.k).max(vector.k),
        });
        if !filters.is_empty() || !must_not.is_empty() {
            knn["filter"] = json!({"bool": {"filter": filters, "must_not": must_not}});
        }

        Ok(BackendQuery::Knn {
            knn,
            size: vector.k,
        })
    }

    fn text_clause(&self, text: &TextQuery) -> Result<Value> {
        if text.q.trim().is_empty() {
            return Err(SiftError::InvalidQuery("text query must not be empty".into()));
        }
        match &text.field {
            Some(field) => {
                if !self.dataset.fields.iter().any(|f| &f.name == field) {
                    return Err(SiftError::InvalidQuery(format!(
                        "field '{field}' is not defined in dataset {}",
                        self.dataset.id
                    )));
                }
                Ok(json!({"match": {field_name_for_field(field): {"query": text.q}}}))
            }
            None => {
                if self.dataset.fields.is_empty() {
                    return Err(SiftError::InvalidQuery(format!(
                        "dataset {} has no fields to search",
                        self.dataset.id
                    )));
                }
                let fields: Vec<String> = self
                    .dataset
                    .fields
                    .iter()
                    .map(|f| field_name_for_field(&f.name))
                    .collect();
                Ok(json!({"multi_match": {"query": text.q, "fields": fields}}))
            }
        }
    }

    fn metadata_filter(&self, filter: &MetadataFilter) -> Result<Value> {
        let property = self.property_for(filter.property_name())?;
        let field = field_name_for_metadata_property(&property.name);

        match (filter, property.property_type()) {
            (MetadataFilter::Terms { values, .. }, MetadataPropertyType::Terms) => {
                if values.is_empty() {
                    return Err(SiftError::InvalidQuery(format!(
                        "terms filter on '{}' needs at least one value",
                        property.name
                    )));
                }
                Ok(json!({"terms": {field: values}}))
            }
            (MetadataFilter::IntegerRange { ge, le, .. }, MetadataPropertyType::Integer) => {
                range_clause(&field, &property.name, *ge, *le)
            }
            (MetadataFilter::FloatRange { ge, le, .. }, MetadataPropertyType::Float) => {
                range_clause(&field, &property.name, *ge, *le)
            }
            (_, property_type) => Err(SiftError::InvalidQuery(format!(
                "filter does not apply to {property_type} metadata property '{}'",
                property.name
            ))),
        }
    }

    fn property_for(&self, name: &str) -> Result<&'a MetadataProperty> {
        self.dataset.metadata_property(name).ok_or_else(|| {
            SiftError::InvalidQuery(format!(
                "metadata property '{name}' is not defined in dataset {}",
                self.dataset.id
            ))
        })
    }
}

fn range_clause<T>(field: &str, name: &str, ge: Option<T>, le: Option<T>) -> Result<Value>
where
    T: PartialOrd + serde::Serialize + Copy,
{
    let mut bounds = serde_json::Map::new();
    match (ge, le) {
        (None, None) => {
            return Err(SiftError::InvalidQuery(format!(
                "range filter on '{name}' needs at least one bound"
            )))
        }
        (Some(ge), Some(le)) if ge > le => {
            return Err(SiftError::InvalidQuery(format!(
                "range filter on '{name}' has ge > le"
            )))
        }
        _ => {}
    }
    if let Some(ge) = ge {
        bounds.insert("gte".into(), json!(ge));
    }
    if let Some(le) = le {
        bounds.insert("lte".into(), json!(le));
    }
    Ok(json!({"range": {field: bounds}}))
}

/// Filter clause for a response status filter.
pub fn response_status_filter(filter: &UserResponseStatusFilter) -> Result<Value> {
    if filter.statuses.is_empty() {
        return Err(SiftError::InvalidQuery(
            "response status filter needs at least one status".into(),
        ));
    }

    let wants_pending = filter.statuses.contains(&ResponseStatusFilter::Pending);
    let mut statuses: Vec<&'static str> = filter
        .statuses
        .iter()
        .filter_map(ResponseStatusFilter::as_response_status)
        .map(|s| s.as_str())
        .collect();
    statuses.sort_unstable();
    statuses.dedup();

    let mut should = Vec::new();
    match &filter.user_id {
        Some(user_id) => {
            let field = field_name_for_response_status(user_id);
            if !statuses.is_empty() {
                should.push(json!({"terms": {field.clone(): statuses}}));
            }
            if wants_pending {
                should.push(json!({"bool": {"must_not": [{"exists": {"field": field}}]}}));
            }
        }
        None => {
            if !statuses.is_empty() {
                should.push(any_user_status_clause(&statuses));
            }
            if wants_pending {
                let all = [
                    ResponseStatus::Discarded.as_str(),
                    ResponseStatus::Draft.as_str(),
                    ResponseStatus::Submitted.as_str(),
                ];
                should.push(json!({"bool": {"must_not": [any_user_status_clause(&all)]}}));
            }
        }
    }

    Ok(json!({"bool": {"should": should, "minimum_should_match": 1}}))
}

fn any_user_status_clause(statuses: &[&str]) -> Value {
    json!({
        "query_string": {
            "fields": [ANY_RESPONSE_STATUS_FIELD],
            "query": statuses.join(" OR "),
        }
    })
}

/// Aggregation request computing metrics for one metadata property.
pub fn metadata_metrics_body(property: &MetadataProperty) -> Value {
    let field = field_name_for_metadata_property(&property.name);
    match property.property_type() {
        MetadataPropertyType::Terms => {
            let size = match &property.settings {
                crate::types::MetadataPropertySettings::Terms { values: Some(values) } => {
                    values.len().max(1)
                }
                _ => TERMS_METRICS_SIZE,
            };
            json!({
                "size": 0,
                "track_total_hits": true,
                "query": {"exists": {"field": field}},
                "aggs": {"values": {"terms": {"field": field, "size": size}}},
            })
        }
        MetadataPropertyType::Integer | MetadataPropertyType::Float => json!({
            "size": 0,
            "aggs": {
                "min_value": {"min": {"field": field}},
                "max_value": {"max": {"field": field}},
            },
        }),
    }
}

/// Distinct terms reported for a terms property without declared values.
pub const TERMS_METRICS_SIZE: usize = 100;
