//! Index schema construction.
//!
//! Derives the backend mapping and index settings for a dataset from its
//! fields, questions, metadata properties, and vector settings. The
//! document layout every mapping describes is:
//!
//! ```text
//! id            keyword
//! fields.*      text
//! metadata.*    keyword | long | float (per property type)
//! responses.<user id>.status / .values.<question>
//! suggestions.<question>
//! vectors.<vector settings id>   dense vector
//! inserted_at / updated_at       date
//! ```

use std::collections::HashSet;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{Result, SiftError};
use crate::types::{
    Dataset, Field, MetadataProperty, MetadataPropertyType, Question, QuestionKind,
    VectorSettings,
};

/// Similarity metric for every vector field. Not configurable per field.
pub const VECTOR_SIMILARITY: &str = "l2_norm";

/// Largest dimensionality an indexed dense vector may declare.
pub const MAX_VECTOR_DIMENSIONS: usize = 4096;

/// Mapping and settings for one dataset index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSchema {
    pub settings: Value,
    pub mappings: Value,
}

/// Stable index name for a dataset.
pub fn index_name_for_dataset(prefix: &str, dataset_id: &Uuid) -> String {
    format!("{prefix}.{dataset_id}")
}

pub fn field_name_for_field(field_name: &str) -> String {
    format!("fields.{field_name}")
}

pub fn field_name_for_metadata_property(property_name: &str) -> String {
    format!("metadata.{property_name}")
}

pub fn field_name_for_vector_settings(vector_settings: &VectorSettings) -> String {
    format!("vectors.{}", vector_settings.id)
}

pub fn field_name_for_response_status(user_id: &Uuid) -> String {
    format!("responses.{user_id}.status")
}

/// Status field of every user's response, as a wildcard path.
pub const ANY_RESPONSE_STATUS_FIELD: &str = "responses.*.status";

/// Builds index mappings and settings. Shard and replica counts come from
/// process configuration and apply to every index identically.
#[derive(Debug, Clone, Copy)]
pub struct SchemaBuilder {
    number_of_shards: u32,
    number_of_replicas: u32,
}

impl SchemaBuilder {
    pub fn new(number_of_shards: u32, number_of_replicas: u32) -> Self {
        Self {
            number_of_shards,
            number_of_replicas,
        }
    }

    pub fn index_settings(&self) -> Value {
        json!({
            "number_of_shards": self.number_of_shards,
            "number_of_replicas": self.number_of_replicas,
        })
    }

    pub fn build(&self, dataset: &Dataset) -> Result<IndexSchema> {
        Ok(IndexSchema {
            settings: self.index_settings(),
            mappings: build_mappings(dataset)?,
        })
    }
}

/// Full mapping document for a dataset.
pub fn build_mappings(dataset: &Dataset) -> Result<Value> {
    validate_dataset(dataset)?;

    let mut fields = Map::new();
    for field in &dataset.fields {
        fields.insert(field.name.clone(), mapping_for_field(field));
    }

    let mut metadata = Map::new();
    for property in &dataset.metadata_properties {
        metadata.insert(property.name.clone(), mapping_for_metadata_type(property.property_type()));
    }

    let mut suggestions = Map::new();
    let mut dynamic_templates = vec![json!({
        "status_responses": {
            "path_match": ANY_RESPONSE_STATUS_FIELD,
            "mapping": {"type": "keyword"},
        }
    })];
    for question in &dataset.questions {
        suggestions.insert(question.name.clone(), mapping_for_question(question.kind));
        dynamic_templates.push(dynamic_template_for_question(question));
    }

    let mut vectors = Map::new();
    for vector_settings in &dataset.vectors_settings {
        vectors.insert(
            vector_settings.id.to_string(),
            dense_vector_mapping(vector_settings),
        );
    }

    Ok(json!({
        "dynamic": "strict",
        "dynamic_templates": dynamic_templates,
        "properties": {
            "id": {"type": "keyword"},
            "inserted_at": {"type": "date"},
            "updated_at": {"type": "date"},
            "fields": {"type": "object", "properties": fields},
            "metadata": {"type": "object", "dynamic": false, "properties": metadata},
            "responses": {"type": "object", "dynamic": true},
            "suggestions": {"type": "object", "dynamic": false, "properties": suggestions},
            "vectors": {"type": "object", "dynamic": false, "properties": vectors},
        }
    }))
}

/// Mapping fragment that adds one metadata property to an existing index.
pub fn mapping_for_metadata_property(property: &MetadataProperty) -> Result<Value> {
    validate_name("metadata property", &property.name)?;
    Ok(nested_property(
        "metadata",
        &property.name,
        mapping_for_metadata_type(property.property_type()),
    ))
}

/// Mapping fragment that adds one vector field to an existing index.
pub fn mapping_for_vector_settings(vector_settings: &VectorSettings) -> Result<Value> {
    validate_vector_settings(vector_settings)?;
    Ok(nested_property(
        "vectors",
        &vector_settings.id.to_string(),
        dense_vector_mapping(vector_settings),
    ))
}

fn nested_property(parent: &str, name: &str, mapping: Value) -> Value {
    json!({ parent: { "properties": { name: mapping } } })
}

fn mapping_for_field(_field: &Field) -> Value {
    json!({"type": "text"})
}

fn mapping_for_metadata_type(property_type: MetadataPropertyType) -> Value {
    match property_type {
        MetadataPropertyType::Terms => json!({"type": "keyword"}),
        MetadataPropertyType::Integer => json!({"type": "long"}),
        MetadataPropertyType::Float => json!({"type": "float"}),
    }
}

fn mapping_for_question(kind: QuestionKind) -> Value {
    match kind {
        QuestionKind::Text => json!({"type": "text", "index": false}),
        QuestionKind::Rating => json!({"type": "integer"}),
        QuestionKind::LabelSelection | QuestionKind::MultiLabelSelection => {
            json!({"type": "keyword"})
        }
        QuestionKind::Ranking | QuestionKind::Span => {
            json!({"type": "object", "enabled": false})
        }
    }
}

fn dynamic_template_for_question(question: &Question) -> Value {
    json!({
        format!("{}_responses", question.name): {
            "path_match": format!("responses.*.values.{}", question.name),
            "mapping": mapping_for_question(question.kind),
        }
    })
}

fn dense_vector_mapping(vector_settings: &VectorSettings) -> Value {
    json!({
        "type": "dense_vector",
        "dims": vector_settings.dimensions,
        "index": true,
        "similarity": VECTOR_SIMILARITY,
    })
}

fn validate_dataset(dataset: &Dataset) -> Result<()> {
    let mut seen = HashSet::new();
    for field in &dataset.fields {
        validate_name("field", &field.name)?;
        if !seen.insert(field.name.as_str()) {
            return Err(SiftError::Schema(format!("duplicate field '{}'", field.name)));
        }
    }

    let mut seen = HashSet::new();
    for question in &dataset.questions {
        validate_name("question", &question.name)?;
        if !seen.insert(question.name.as_str()) {
            return Err(SiftError::Schema(format!(
                "duplicate question '{}'",
                question.name
            )));
        }
    }

    let mut seen = HashSet::new();
    for property in &dataset.metadata_properties {
        validate_name("metadata property", &property.name)?;
        if !seen.insert(property.name.as_str()) {
            return Err(SiftError::Schema(format!(
                "duplicate metadata property '{}'",
                property.name
            )));
        }
    }

    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for vector_settings in &dataset.vectors_settings {
        validate_vector_settings(vector_settings)?;
        if !ids.insert(vector_settings.id) || !names.insert(vector_settings.name.as_str()) {
            return Err(SiftError::Schema(format!(
                "duplicate vector settings '{}' ({})",
                vector_settings.name, vector_settings.id
            )));
        }
    }
    Ok(())
}

fn validate_vector_settings(vector_settings: &VectorSettings) -> Result<()> {
    validate_name("vector settings", &vector_settings.name)?;
    if vector_settings.dimensions == 0 || vector_settings.dimensions > MAX_VECTOR_DIMENSIONS {
        return Err(SiftError::Schema(format!(
            "vector settings '{}' declares {} dimensions, expected 1..={MAX_VECTOR_DIMENSIONS}",
            vector_settings.name, vector_settings.dimensions
        )));
    }
    Ok(())
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SiftError::Schema(format!("{kind} name must not be empty")));
    }
    if name.contains('.') || name.contains('*') {
        return Err(SiftError::Schema(format!(
            "{kind} name '{name}' must not contain '.' or '*'"
        )));
    }
    Ok(())
}
