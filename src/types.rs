use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Identifier of a record within a dataset.
pub type RecordId = Uuid;

/// A text field declared on a dataset. Every field is indexed as full text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub required: bool,
}

/// The kind of answer a question collects. Drives how response values and
/// suggestions are mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Text,
    Rating,
    LabelSelection,
    MultiLabelSelection,
    Ranking,
    Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub name: String,
    pub kind: QuestionKind,
}

/// Declared value type of a metadata property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataPropertyType {
    Terms,
    Integer,
    Float,
}

impl std::fmt::Display for MetadataPropertyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataPropertyType::Terms => write!(f, "terms"),
            MetadataPropertyType::Integer => write!(f, "integer"),
            MetadataPropertyType::Float => write!(f, "float"),
        }
    }
}

impl std::str::FromStr for MetadataPropertyType {
    type Err = crate::error::SiftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "terms" => Ok(MetadataPropertyType::Terms),
            "integer" => Ok(MetadataPropertyType::Integer),
            "float" => Ok(MetadataPropertyType::Float),
            other => Err(crate::error::SiftError::Schema(format!(
                "unsupported metadata property type '{other}'"
            ))),
        }
    }
}

/// Type-specific settings of a metadata property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetadataPropertySettings {
    Terms {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        values: Option<Vec<String>>,
    },
    Integer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    Float {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
}

impl MetadataPropertySettings {
    pub fn property_type(&self) -> MetadataPropertyType {
        match self {
            MetadataPropertySettings::Terms { .. } => MetadataPropertyType::Terms,
            MetadataPropertySettings::Integer { .. } => MetadataPropertyType::Integer,
            MetadataPropertySettings::Float { .. } => MetadataPropertyType::Float,
        }
    }

    /// Build settings from the persistence layer's raw `(type, settings)` pair.
    /// Unknown types are a schema error.
    pub fn from_raw(type_name: &str, raw: &serde_json::Value) -> crate::error::Result<Self> {
        let property_type: MetadataPropertyType = type_name.parse()?;
        let mut tagged = match raw {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(crate::error::SiftError::Schema(format!(
                    "metadata property settings must be an object, got {other}"
                )))
            }
        };
        tagged.insert(
            "type".to_string(),
            serde_json::Value::String(property_type.to_string()),
        );
        serde_json::from_value(serde_json::Value::Object(tagged))
            .map_err(|e| crate::error::SiftError::Schema(format!("invalid {property_type} settings: {e}")))
    }
}

/// A typed metadata key declared on a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataProperty {
    pub id: Uuid,
    pub name: String,
    pub settings: MetadataPropertySettings,
}

impl MetadataProperty {
    pub fn property_type(&self) -> MetadataPropertyType {
        self.settings.property_type()
    }
}

/// A named vector space with fixed dimensionality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSettings {
    pub id: Uuid,
    pub name: String,
    pub dimensions: usize,
}

/// A dataset, as read from the persistence layer at call time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub questions: Vec<Question>,
    #[serde(default)]
    pub metadata_properties: Vec<MetadataProperty>,
    #[serde(default)]
    pub vectors_settings: Vec<VectorSettings>,
}

impl Dataset {
    pub fn metadata_property(&self, name: &str) -> Option<&MetadataProperty> {
        self.metadata_properties.iter().find(|p| p.name == name)
    }

    pub fn vector_settings_by_name(&self, name: &str) -> Option<&VectorSettings> {
        self.vectors_settings.iter().find(|v| v.name == name)
    }

    pub fn question(&self, name: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.name == name)
    }
}

/// Status of one annotator's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Draft,
    Submitted,
    Discarded,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Draft => "draft",
            ResponseStatus::Submitted => "submitted",
            ResponseStatus::Discarded => "discarded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub user_id: Uuid,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub question_name: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// A unit of annotation content. Indexed as one backend document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub dataset_id: Uuid,
    #[serde(default)]
    pub fields: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub responses: Vec<Response>,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
    /// Vector values keyed by vector settings name.
    #[serde(default)]
    pub vectors: HashMap<String, Vec<f32>>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// A bare record with no content, stamped now.
    pub fn new(id: RecordId, dataset_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            dataset_id,
            fields: HashMap::new(),
            metadata: HashMap::new(),
            responses: Vec::new(),
            suggestions: Vec::new(),
            vectors: HashMap::new(),
            inserted_at: now,
            updated_at: now,
        }
    }
}

/// Response statuses accepted by a status filter. `Pending` selects records
/// without any response (for the scoped user, if one is given).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatusFilter {
    Pending,
    Draft,
    Submitted,
    Discarded,
}

impl ResponseStatusFilter {
    pub fn as_response_status(&self) -> Option<ResponseStatus> {
        match self {
            ResponseStatusFilter::Pending => None,
            ResponseStatusFilter::Draft => Some(ResponseStatus::Draft),
            ResponseStatusFilter::Submitted => Some(ResponseStatus::Submitted),
            ResponseStatusFilter::Discarded => Some(ResponseStatus::Discarded),
        }
    }
}

/// Narrows a search to responses with the given statuses, optionally
/// scoped to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserResponseStatusFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub statuses: Vec<ResponseStatusFilter>,
}

/// Metadata filter clauses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetadataFilter {
    Terms {
        name: String,
        values: Vec<String>,
    },
    IntegerRange {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ge: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        le: Option<i64>,
    },
    FloatRange {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ge: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        le: Option<f64>,
    },
}

impl MetadataFilter {
    pub fn property_name(&self) -> &str {
        match self {
            MetadataFilter::Terms { name, .. }
            | MetadataFilter::IntegerRange { name, .. }
            | MetadataFilter::FloatRange { name, .. } => name,
        }
    }
}

/// Free-text relevance clause. Without a `field`, all dataset fields are
/// searched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextQuery {
    pub q: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Source of the query vector for a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorValue {
    Vector(Vec<f32>),
    /// Use the stored vector of an indexed record. The record itself is
    /// excluded from the results.
    Record(RecordId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResponseItem {
    pub record_id: RecordId,
    pub score: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResponse {
    pub items: Vec<SearchResponseItem>,
    pub total: u64,
}

impl SearchResponse {
    pub fn record_ids(&self) -> Vec<RecordId> {
        self.items.iter().map(|i| i.record_id).collect()
    }
}

/// Aggregated values of one metadata property across a dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataMetrics {
    Terms {
        total: u64,
        values: Vec<TermCount>,
    },
    Integer {
        min: Option<i64>,
        max: Option<i64>,
    },
    Float {
        min: Option<f64>,
        max: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TermCount {
    pub term: String,
    pub count: u64,
}
