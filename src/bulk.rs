//! Bulk indexing.
//!
//! A [`BulkBatch`] collects index/update/delete actions for one index,
//! validating record documents on the way in. Records that fail validation
//! never reach the backend but are reported alongside backend per-item
//! failures when the batch is settled. One bad record never keeps the rest
//! of the batch from being written.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{BulkItemFailure, BulkOperation, BulkOperationError, Result, SiftError};
use crate::types::{Dataset, MetadataPropertySettings, Record, Response};

/// Maximum actions sent in one backend request.
pub const BULK_CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub enum BulkAction {
    /// Full document write (create or replace).
    Index { id: Uuid, document: Value },
    /// Partial document merge.
    Update { id: Uuid, doc: Value },
    Delete { id: Uuid },
}

impl BulkAction {
    pub fn id(&self) -> Uuid {
        match self {
            BulkAction::Index { id, .. }
            | BulkAction::Update { id, .. }
            | BulkAction::Delete { id } => *id,
        }
    }

    pub fn operation(&self) -> BulkOperation {
        match self {
            BulkAction::Index { .. } => BulkOperation::Index,
            BulkAction::Update { .. } => BulkOperation::Update,
            BulkAction::Delete { .. } => BulkOperation::Delete,
        }
    }
}

/// Result of a fully successful batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkSummary {
    pub attempted: usize,
    pub succeeded: usize,
}

#[derive(Debug, Clone)]
pub struct BulkBatch {
    index: String,
    actions: Vec<BulkAction>,
    rejected: Vec<BulkItemFailure>,
}

impl BulkBatch {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            actions: Vec::new(),
            rejected: Vec::new(),
        }
    }

    /// Index actions for `records`; invalid records are rejected locally.
    pub fn for_records(index: impl Into<String>, dataset: &Dataset, records: &[Record]) -> Self {
        let mut batch = Self::new(index);
        for record in records {
            match record_document(dataset, record) {
                Ok(document) => batch.push(BulkAction::Index {
                    id: record.id,
                    document,
                }),
                Err(e) => batch.reject(record.id, BulkOperation::Index, e),
            }
        }
        batch
    }

    pub fn for_deletes(index: impl Into<String>, ids: &[Uuid]) -> Self {
        let mut batch = Self::new(index);
        for id in ids {
            batch.push(BulkAction::Delete { id: *id });
        }
        batch
    }

    pub fn push(&mut self, action: BulkAction) {
        self.actions.push(action);
    }

    pub fn reject(&mut self, id: Uuid, operation: BulkOperation, error: SiftError) {
        let reason = error.to_string();
        self.rejected.push(BulkItemFailure {
            id,
            operation,
            status: None,
            error: json!({"type": "validation_exception", "reason": reason}),
            reason,
        });
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn actions(&self) -> &[BulkAction] {
        &self.actions
    }

    pub fn rejected(&self) -> &[BulkItemFailure] {
        &self.rejected
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.rejected.is_empty()
    }

    /// Actions split into backend-sized chunks.
    pub fn chunks(&self) -> std::slice::Chunks<'_, BulkAction> {
        self.actions.chunks(BULK_CHUNK_SIZE)
    }

    /// Merge the backend responses (one per chunk, in order) with local
    /// rejections. Any failure yields one aggregate error listing all of them.
    pub fn settle(self, responses: &[Value]) -> Result<BulkSummary> {
        let attempted = self.actions.len() + self.rejected.len();
        let mut failures = self.rejected;

        for (chunk, response) in self.actions.chunks(BULK_CHUNK_SIZE).zip(responses) {
            failures.extend(item_failures(chunk, response)?);
        }

        if failures.is_empty() {
            crate::metrics::BULK_ITEMS_TOTAL
                .with_label_values(&["ok"])
                .inc_by(attempted as u64);
            return Ok(BulkSummary {
                attempted,
                succeeded: attempted,
            });
        }

        crate::metrics::BULK_ITEMS_TOTAL
            .with_label_values(&["ok"])
            .inc_by((attempted - failures.len()) as u64);
        crate::metrics::BULK_ITEMS_TOTAL
            .with_label_values(&["failed"])
            .inc_by(failures.len() as u64);

        Err(SiftError::Bulk(BulkOperationError {
            index: self.index,
            attempted,
            succeeded: attempted - failures.len(),
            failures,
        }))
    }
}

/// NDJSON body for one chunk of actions.
pub fn encode_ndjson(index: &str, actions: &[BulkAction]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(actions.len() * 256);
    for action in actions {
        let id = action.id().to_string();
        let header = json!({ action.operation().to_string(): {"_index": index, "_id": id} });
        serde_json::to_writer((&mut buf).writer(), &header)?;
        buf.put_u8(b'\n');
        match action {
            BulkAction::Index { document, .. } => {
                serde_json::to_writer((&mut buf).writer(), document)?;
                buf.put_u8(b'\n');
            }
            BulkAction::Update { doc, .. } => {
                serde_json::to_writer((&mut buf).writer(), &json!({ "doc": doc }))?;
                buf.put_u8(b'\n');
            }
            BulkAction::Delete { .. } => {}
        }
    }
    Ok(buf.freeze())
}

/// Per-item failures in a bulk response. Items are matched to actions by
/// position. Deleting a missing document is not a failure.
fn item_failures(actions: &[BulkAction], response: &Value) -> Result<Vec<BulkItemFailure>> {
    let items = response
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| SiftError::Backend {
            status: 200,
            reason: "bulk response has no items".into(),
        })?;
    if items.len() != actions.len() {
        return Err(SiftError::Backend {
            status: 200,
            reason: format!(
                "bulk response has {} items for {} actions",
                items.len(),
                actions.len()
            ),
        });
    }

    let mut failures = Vec::new();
    for (action, item) in actions.iter().zip(items) {
        let result = item
            .as_object()
            .and_then(|o| o.values().next())
            .cloned()
            .unwrap_or(Value::Null);
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(500) as u16;

        if (200..300).contains(&status) {
            continue;
        }
        if status == 404 && action.operation() == BulkOperation::Delete {
            continue;
        }

        let error = result.get("error").cloned().unwrap_or(Value::Null);
        let reason = error
            .get("reason")
            .and_then(Value::as_str)
            .or_else(|| error.get("type").and_then(Value::as_str))
            .unwrap_or("unknown error")
            .to_string();
        failures.push(BulkItemFailure {
            id: action.id(),
            operation: action.operation(),
            status: Some(status),
            reason,
            error,
        });
    }
    Ok(failures)
}

/// Backend document for a record, validated against the dataset schema.
pub fn record_document(dataset: &Dataset, record: &Record) -> Result<Value> {
    if record.dataset_id != dataset.id {
        return Err(SiftError::Validation(format!(
            "record {} belongs to dataset {}, not {}",
            record.id, record.dataset_id, dataset.id
        )));
    }

    let mut fields = Map::new();
    for (name, value) in &record.fields {
        if !dataset.fields.iter().any(|f| &f.name == name) {
            return Err(SiftError::Validation(format!(
                "field '{name}' is not defined in dataset {}",
                dataset.id
            )));
        }
        fields.insert(name.clone(), Value::String(value.clone()));
    }

    let mut metadata = Map::new();
    for (name, value) in &record.metadata {
        if let Some(property) = dataset.metadata_property(name) {
            validate_metadata_value(name, &property.settings, value)?;
        }
        metadata.insert(name.clone(), value.clone());
    }

    let mut vectors = Map::new();
    for (name, values) in &record.vectors {
        let settings = dataset.vector_settings_by_name(name).ok_or_else(|| {
            SiftError::Validation(format!(
                "vector '{name}' is not defined in dataset {}",
                dataset.id
            ))
        })?;
        if values.len() != settings.dimensions {
            return Err(SiftError::DimensionMismatch {
                expected: settings.dimensions,
                actual: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(SiftError::Validation(format!(
                "vector '{name}' contains non-finite values"
            )));
        }
        vectors.insert(settings.id.to_string(), json!(values));
    }

    let mut suggestions = Map::new();
    for suggestion in &record.suggestions {
        if dataset.question(&suggestion.question_name).is_none() {
            return Err(SiftError::Validation(format!(
                "suggestion for unknown question '{}'",
                suggestion.question_name
            )));
        }
        suggestions.insert(suggestion.question_name.clone(), suggestion.value.clone());
    }

    let mut responses = Map::new();
    for response in &record.responses {
        responses.insert(response.user_id.to_string(), response_document(response));
    }

    Ok(json!({
        "id": record.id.to_string(),
        "fields": fields,
        "metadata": metadata,
        "responses": responses,
        "suggestions": suggestions,
        "vectors": vectors,
        "inserted_at": record.inserted_at.to_rfc3339(),
        "updated_at": record.updated_at.to_rfc3339(),
    }))
}

pub fn response_document(response: &Response) -> Value {
    let mut doc = json!({"status": response.status.as_str()});
    if let Some(values) = &response.values {
        doc["values"] = json!(values);
    }
    doc
}

fn validate_metadata_value(
    name: &str,
    settings: &MetadataPropertySettings,
    value: &Value,
) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    let invalid = |expected: &str| {
        Err(SiftError::Validation(format!(
            "metadata '{name}' expects {expected}, got {value}"
        )))
    };

    match settings {
        MetadataPropertySettings::Terms { values: allowed } => {
            let terms: Vec<&str> = match value {
                Value::String(s) => vec![s.as_str()],
                Value::Array(items) => match items.iter().map(Value::as_str).collect::<Option<Vec<_>>>() {
                    Some(terms) => terms,
                    None => return invalid("a string or list of strings"),
                },
                _ => return invalid("a string or list of strings"),
            };
            if let Some(allowed) = allowed {
                if let Some(term) = terms.iter().find(|t| !allowed.iter().any(|a| a == *t)) {
                    return invalid(&format!("one of {allowed:?} (got '{term}')"));
                }
            }
            Ok(())
        }
        MetadataPropertySettings::Integer { min, max } => {
            let Some(v) = value.as_i64() else {
                return invalid("an integer");
            };
            if min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m) {
                return invalid(&format!("a value within [{min:?}, {max:?}]"));
            }
            Ok(())
        }
        MetadataPropertySettings::Float { min, max } => {
            let Some(v) = value.as_f64() else {
                return invalid("a number");
            };
            if min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m) {
                return invalid(&format!("a value within [{min:?}, {max:?}]"));
            }
            Ok(())
        }
    }
}
