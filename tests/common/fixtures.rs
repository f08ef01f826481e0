use serde_json::json;
use uuid::Uuid;

use sift::config::Config;
use sift::engine::ElasticsearchEngine;
use sift::types::{
    Dataset, Field, MetadataProperty, MetadataPropertySettings, Question, QuestionKind, Record,
    Response, ResponseStatus, VectorSettings,
};

use super::fake_backend::FakeBackend;

/// Engine pointed at `backend` with a short retry budget.
pub fn engine_for(backend: &FakeBackend) -> ElasticsearchEngine {
    ElasticsearchEngine::new(&config_for(backend)).unwrap()
}

pub fn config_for(backend: &FakeBackend) -> Config {
    let mut config = Config::default();
    config.elasticsearch.hosts = vec![backend.base_url.clone()];
    config.elasticsearch.max_retries = 2;
    config.elasticsearch.request_timeout_secs = 5;
    config
}

/// Product reviews dataset: text fields `review` and `title`, a rating
/// question, metadata `rating` (integer 1..=5), `lang` (terms) and
/// `confidence` (float), and a 3-dimensional `embedding` vector.
pub fn review_dataset() -> Dataset {
    Dataset {
        id: Uuid::new_v4(),
        name: "reviews".into(),
        fields: vec![
            Field {
                id: Uuid::new_v4(),
                name: "review".into(),
                required: true,
            },
            Field {
                id: Uuid::new_v4(),
                name: "title".into(),
                required: false,
            },
        ],
        questions: vec![
            Question {
                id: Uuid::new_v4(),
                name: "quality".into(),
                kind: QuestionKind::Rating,
            },
            Question {
                id: Uuid::new_v4(),
                name: "sentiment".into(),
                kind: QuestionKind::LabelSelection,
            },
        ],
        metadata_properties: vec![
            MetadataProperty {
                id: Uuid::new_v4(),
                name: "rating".into(),
                settings: MetadataPropertySettings::Integer {
                    min: Some(1),
                    max: Some(5),
                },
            },
            MetadataProperty {
                id: Uuid::new_v4(),
                name: "lang".into(),
                settings: MetadataPropertySettings::Terms {
                    values: Some(vec!["en".into(), "es".into(), "fr".into()]),
                },
            },
            MetadataProperty {
                id: Uuid::new_v4(),
                name: "confidence".into(),
                settings: MetadataPropertySettings::Float { min: None, max: None },
            },
        ],
        vectors_settings: vec![VectorSettings {
            id: Uuid::new_v4(),
            name: "embedding".into(),
            dimensions: 3,
        }],
    }
}

/// Record ids sort in creation order.
pub fn record_id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

pub fn review(dataset: &Dataset, n: u128, text: &str, rating: i64) -> Record {
    let mut record = Record::new(record_id(n), dataset.id);
    record.fields.insert("review".into(), text.into());
    record.metadata.insert("rating".into(), json!(rating));
    record
}

pub fn with_vector(mut record: Record, vector: [f32; 3]) -> Record {
    record.vectors.insert("embedding".into(), vector.to_vec());
    record
}

pub fn with_response(mut record: Record, user_id: Uuid, status: ResponseStatus) -> Record {
    record.responses.push(Response {
        user_id,
        status,
        values: Some([("quality".to_string(), json!(4))].into_iter().collect()),
    });
    record
}
