//! Decoding of backend response bodies.

use serde_json::Value;
use uuid::Uuid;

use crate::error::{BulkItemFailure, BulkOperation, Result, SiftError};
use crate::lifecycle::IndexState;
use crate::types::{
    MetadataMetrics, MetadataProperty, MetadataPropertyType, SearchResponse, SearchResponseItem,
    TermCount, VectorSettings,
};

fn malformed(what: &str) -> SiftError {
    SiftError::Backend {
        status: 200,
        reason: format!("malformed backend response: {what}"),
    }
}

/// Ranked hits and total count of a `_search` response.
pub fn parse_search_response(body: &Value) -> Result<SearchResponse> {
    let hits = body.get("hits").ok_or_else(|| malformed("missing hits"))?;

    let total = match hits.get("total") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(total) => total.get("value").and_then(Value::as_u64).unwrap_or(0),
        None => 0,
    };

    let items = hits
        .get("hits")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing hits.hits"))?
        .iter()
        .map(|hit| {
            let id = hit
                .get("_id")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed("hit without _id"))?;
            let record_id =
                Uuid::parse_str(id).map_err(|_| malformed(&format!("hit id '{id}' is not a uuid")))?;
            Ok(SearchResponseItem {
                record_id,
                score: hit.get("_score").and_then(Value::as_f64).map(|s| s as f32),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(SearchResponse { items, total })
}

/// Aggregated metrics for `property` out of a metrics `_search` response.
pub fn parse_metrics_response(property: &MetadataProperty, body: &Value) -> Result<MetadataMetrics> {
    let aggregations = body
        .get("aggregations")
        .ok_or_else(|| malformed("missing aggregations"))?;
    let agg_value = |name: &str| {
        aggregations
            .get(name)
            .and_then(|a| a.get("value"))
            .and_then(Value::as_f64)
    };

    match property.property_type() {
        MetadataPropertyType::Terms => {
            let total = body
                .get("hits")
                .and_then(|h| h.get("total"))
                .and_then(|t| t.get("value").or(Some(t)))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let values = aggregations
                .get("values")
                .and_then(|a| a.get("buckets"))
                .and_then(Value::as_array)
                .ok_or_else(|| malformed("missing terms buckets"))?
                .iter()
                .map(|bucket| TermCount {
                    term: match bucket.get("key") {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    },
                    count: bucket.get("doc_count").and_then(Value::as_u64).unwrap_or(0),
                })
                .collect();
            Ok(MetadataMetrics::Terms { total, values })
        }
        MetadataPropertyType::Integer => Ok(MetadataMetrics::Integer {
            min: agg_value("min_value").map(|v| v.round() as i64),
            max: agg_value("max_value").map(|v| v.round() as i64),
        }),
        MetadataPropertyType::Float => Ok(MetadataMetrics::Float {
            min: agg_value("min_value"),
            max: agg_value("max_value"),
        }),
    }
}

/// Stored vector of a `_doc` response fetched with `_source_includes`.
pub fn parse_stored_vector(body: &Value, vector_settings: &VectorSettings) -> Option<Vec<f32>> {
    body.get("_source")?
        .get("vectors")?
        .get(vector_settings.id.to_string())?
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

/// Per-document failures of an `_update_by_query` response. Failures
/// without a document id (shard or search failures) get the nil id; the
/// raw failure object is kept either way.
pub fn parse_update_by_query_failures(body: &Value) -> Vec<BulkItemFailure> {
    let Some(failures) = body.get("failures").and_then(Value::as_array) else {
        return Vec::new();
    };
    failures
        .iter()
        .map(|failure| {
            let cause = failure.get("cause").or_else(|| failure.get("reason"));
            let reason = cause
                .and_then(|c| c.get("reason").or_else(|| c.get("type")))
                .and_then(Value::as_str)
                .or_else(|| cause.and_then(Value::as_str))
                .unwrap_or("unknown failure");
            BulkItemFailure {
                id: failure
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|id| Uuid::parse_str(id).ok())
                    .unwrap_or_else(Uuid::nil),
                operation: BulkOperation::Update,
                status: failure
                    .get("status")
                    .and_then(Value::as_u64)
                    .map(|s| s as u16),
                reason: reason.to_string(),
                error: failure.clone(),
            }
        })
        .collect()
}

/// Index state out of a `_cat/indices` row.
pub fn parse_index_status(body: &Value) -> Option<IndexState> {
    let row = body.as_array()?.first()?;
    match row.get("status").and_then(Value::as_str)? {
        "open" => Some(IndexState::Open),
        "close" => Some(IndexState::Closed),
        _ => None,
    }
}
