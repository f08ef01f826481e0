pub mod elasticsearch;
pub mod registry;
pub mod traits;

pub use elasticsearch::ElasticsearchEngine;
pub use registry::{EngineFactory, EngineRegistry};
pub use traits::{SearchEngine, SearchFilters};
