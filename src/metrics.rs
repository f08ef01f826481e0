use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

lazy_static::lazy_static! {
    pub static ref BACKEND_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sift_backend_requests_total", "Requests sent to the search backend", &["operation", "outcome"]
    ).unwrap();
    pub static ref BACKEND_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "sift_backend_request_duration_seconds", "Search backend request duration", &["operation"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();
    pub static ref BULK_ITEMS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sift_bulk_items_total", "Documents processed by bulk operations", &["result"]
    ).unwrap();
    pub static ref INDEX_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sift_index_transitions_total", "Completed index lifecycle transitions", &["state"]
    ).unwrap();
}

pub fn init() {
    lazy_static::initialize(&BACKEND_REQUESTS_TOTAL);
    lazy_static::initialize(&BACKEND_REQUEST_DURATION);
    lazy_static::initialize(&BULK_ITEMS_TOTAL);
    lazy_static::initialize(&INDEX_TRANSITIONS_TOTAL);
}
