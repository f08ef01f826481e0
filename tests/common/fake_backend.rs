//! In-process Elasticsearch stand-in.
//!
//! Serves the subset of the REST API the engine uses from an in-memory
//! index map, on a random local port. Writes are visible to the next
//! search immediately. Query evaluation covers the DSL the query builder
//! emits: bool, match, multi_match, term(s), range, exists, query_string
//! over wildcard paths, match_all, knn (l2 score `1 / (1 + d^2)`) and the
//! terms/min/max aggregations.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub struct FakeIndex {
    pub open: bool,
    pub settings: Value,
    pub mappings: Value,
    pub docs: BTreeMap<String, Value>,
}

#[derive(Default)]
pub struct FakeState {
    pub indices: Mutex<BTreeMap<String, FakeIndex>>,
    /// `METHOD /path?query` of every request, in arrival order.
    pub requests: Mutex<Vec<String>>,
    /// Statuses returned, one per request, before any processing.
    pub injected: Mutex<VecDeque<u16>>,
    /// Document ids the bulk and update-by-query endpoints reject.
    pub failing_ids: Mutex<HashSet<String>>,
    /// Path fragments answered with a fixed error status on every request.
    pub failing_paths: Mutex<Vec<(String, u16)>>,
}

pub struct FakeBackend {
    pub base_url: String,
    pub state: Arc<FakeState>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn index(&self, name: &str) -> Option<FakeIndex> {
        self.state.indices.lock().unwrap().get(name).cloned()
    }

    pub fn index_names(&self) -> Vec<String> {
        self.state.indices.lock().unwrap().keys().cloned().collect()
    }

    pub fn doc(&self, index: &str, id: &str) -> Option<Value> {
        self.index(index).and_then(|i| i.docs.get(id).cloned())
    }

    pub fn doc_count(&self, index: &str) -> usize {
        self.index(index).map_or(0, |i| i.docs.len())
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn requests_matching(&self, needle: &str) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.contains(needle))
            .collect()
    }

    pub fn clear_requests(&self) {
        self.state.requests.lock().unwrap().clear();
    }

    pub fn inject_statuses(&self, statuses: &[u16]) {
        self.state.injected.lock().unwrap().extend(statuses);
    }

    pub fn fail_document(&self, id: &str) {
        self.state.failing_ids.lock().unwrap().insert(id.to_string());
    }

    /// Answer every request whose path contains `fragment` with `status`.
    pub fn fail_path(&self, fragment: &str, status: u16) {
        self.state
            .failing_paths
            .lock()
            .unwrap()
            .push((fragment.to_string(), status));
    }
}

fn reply(status: u16, body: Value) -> Response {
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(body),
    )
        .into_response()
}

fn es_error(status: u16, kind: &str, reason: &str) -> Response {
    reply(
        status,
        json!({"error": {"type": kind, "reason": reason}, "status": status}),
    )
}

fn index_not_found(index: &str) -> Response {
    es_error(404, "index_not_found_exception", &format!("no such index [{index}]"))
}

fn index_closed(index: &str) -> Response {
    es_error(400, "index_closed_exception", &format!("closed [{index}]"))
}

async fn handle(
    State(state): State<Arc<FakeState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let query: HashMap<String, String> = uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    state.requests.lock().unwrap().push(match uri.query() {
        Some(q) => format!("{method} {path}?{q}"),
        None => format!("{method} {path}"),
    });

    if let Some(status) = state.injected.lock().unwrap().pop_front() {
        return es_error(status, "injected_failure", "injected by test");
    }
    let path_failure = state
        .failing_paths
        .lock()
        .unwrap()
        .iter()
        .find(|(fragment, _)| path.contains(fragment.as_str()))
        .map(|(fragment, status)| (fragment.clone(), *status));
    if let Some((fragment, status)) = path_failure {
        return es_error(status, "injected_failure", &format!("injected failure on {fragment}"));
    }

    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

    if segments.first() == Some(&"_bulk") && method == Method::POST {
        return bulk(&state, &body);
    }

    let json_body: Value = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => return es_error(400, "parse_exception", &e.to_string()),
        }
    };

    let mut indices = state.indices.lock().unwrap();

    match (method.clone(), segments.as_slice()) {
        (Method::GET, []) => reply(200, json!({"version": {"number": "8.11.0"}, "tagline": "fake"})),

        (Method::GET, ["_cat", "indices", index]) => match indices.get(*index) {
            Some(i) => reply(200, json!([{"status": (if i.open { "open" } else { "close" })}])),
            None => index_not_found(index),
        },

        (Method::PUT, [index]) => {
            if indices.contains_key(*index) {
                return es_error(
                    400,
                    "resource_already_exists_exception",
                    &format!("index [{index}] already exists"),
                );
            }
            indices.insert(
                index.to_string(),
                FakeIndex {
                    open: true,
                    settings: json_body.get("settings").cloned().unwrap_or(json!({})),
                    mappings: json_body.get("mappings").cloned().unwrap_or(json!({})),
                    docs: BTreeMap::new(),
                },
            );
            reply(200, json!({"acknowledged": true, "index": index}))
        }

        (Method::DELETE, [index]) => {
            if indices.remove(*index).is_none()
                && query.get("ignore_unavailable").map(String::as_str) != Some("true")
            {
                return index_not_found(index);
            }
            reply(200, json!({"acknowledged": true}))
        }

        (Method::POST, [index, "_open"]) => match indices.get_mut(*index) {
            Some(i) => {
                i.open = true;
                reply(200, json!({"acknowledged": true, "shards_acknowledged": true}))
            }
            None => index_not_found(index),
        },

        (Method::POST, [index, "_close"]) => match indices.get_mut(*index) {
            Some(i) => {
                i.open = false;
                reply(200, json!({"acknowledged": true, "shards_acknowledged": true}))
            }
            None if query.get("ignore_unavailable").map(String::as_str) == Some("true") => {
                reply(200, json!({"acknowledged": true}))
            }
            None => index_not_found(index),
        },

        (Method::PUT, [index, "_mapping"]) => match indices.get_mut(*index) {
            Some(i) if !i.open => index_closed(index),
            Some(i) => {
                let properties = json_body.get("properties").cloned().unwrap_or(json!({}));
                let mut update = json!({"properties": properties});
                merge(&mut i.mappings, &mut update);
                reply(200, json!({"acknowledged": true}))
            }
            None => index_not_found(index),
        },

        (Method::PUT, [index, "_settings"]) => match indices.get_mut(*index) {
            Some(i) if i.open && json_body.get("analysis").is_some() => es_error(
                400,
                "illegal_argument_exception",
                "Can't update non dynamic settings [[index.analysis]] for open indices",
            ),
            Some(i) => {
                let mut update = json_body.clone();
                merge(&mut i.settings, &mut update);
                reply(200, json!({"acknowledged": true}))
            }
            None => index_not_found(index),
        },

        (Method::POST, [index, "_update", id]) => match indices.get_mut(*index) {
            Some(i) if !i.open => index_closed(index),
            Some(i) => match i.docs.get_mut(*id) {
                Some(doc) => {
                    let mut partial = json_body.get("doc").cloned().unwrap_or(json!({}));
                    merge(doc, &mut partial);
                    reply(200, json!({"_id": id, "result": "updated"}))
                }
                None => es_error(
                    404,
                    "document_missing_exception",
                    &format!("[{id}]: document missing"),
                ),
            },
            None => index_not_found(index),
        },

        (Method::GET, [index, "_doc", id]) => match indices.get(*index) {
            Some(i) => match i.docs.get(*id) {
                Some(doc) => {
                    let source = match query.get("_source_includes") {
                        Some(path) => project(doc, path),
                        None => doc.clone(),
                    };
                    reply(200, json!({"_index": index, "_id": id, "found": true, "_source": source}))
                }
                None => reply(404, json!({"_index": index, "_id": id, "found": false})),
            },
            None => index_not_found(index),
        },

        (Method::POST, [index, "_search"]) => match indices.get(*index) {
            Some(i) if !i.open => index_closed(index),
            Some(i) => search(i, &json_body),
            None => index_not_found(index),
        },

        (Method::POST, [index, "_update_by_query"]) => match indices.get(*index) {
            Some(i) if !i.open => index_closed(index),
            Some(i) => {
                let q = json_body.get("query").cloned().unwrap_or(json!({"match_all": {}}));
                let failing = state.failing_ids.lock().unwrap().clone();
                let (failed, updated): (Vec<&String>, Vec<&String>) = i
                    .docs
                    .iter()
                    .filter(|(_, d)| evaluate(&q, d, &i.mappings).is_some())
                    .map(|(id, _)| id)
                    .partition(|id| failing.contains(*id));
                let failures: Vec<Value> = failed
                    .iter()
                    .map(|id| {
                        json!({
                            "index": index,
                            "id": id,
                            "cause": {
                                "type": "mapper_parsing_exception",
                                "reason": format!("failed to parse document [{id}]"),
                            },
                            "status": 400,
                        })
                    })
                    .collect();
                reply(
                    200,
                    json!({
                        "updated": updated.len(),
                        "total": updated.len() + failed.len(),
                        "version_conflicts": 0,
                        "failures": failures,
                    }),
                )
            }
            None => index_not_found(index),
        },

        _ => es_error(
            400,
            "unsupported_operation",
            &format!("fake backend does not serve {method} {path}"),
        ),
    }
}

fn bulk(state: &FakeState, body: &[u8]) -> Response {
    let text = match std::str::from_utf8(body) {
        Ok(t) => t,
        Err(e) => return es_error(400, "parse_exception", &e.to_string()),
    };
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let mut items = Vec::new();
    let mut errors = false;
    let failing = state.failing_ids.lock().unwrap().clone();
    let mut indices = state.indices.lock().unwrap();

    while let Some(line) = lines.next() {
        let header: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => return es_error(400, "parse_exception", &e.to_string()),
        };
        let Some((op, meta)) = header.as_object().and_then(|o| o.iter().next()) else {
            return es_error(400, "action_request_validation_exception", "empty action");
        };
        let op = op.clone();
        let index = meta["_index"].as_str().unwrap_or_default().to_string();
        let id = meta["_id"].as_str().unwrap_or_default().to_string();
        let source: Option<Value> = if op == "delete" {
            None
        } else {
            match lines.next().map(serde_json::from_str::<Value>) {
                Some(Ok(v)) => Some(v),
                _ => return es_error(400, "parse_exception", "missing action source"),
            }
        };

        let (status, error): (u16, Option<Value>) = match indices.get_mut(&index) {
            None => (404, Some(json!({"type": "index_not_found_exception", "reason": format!("no such index [{index}]")}))),
            Some(_) if failing.contains(&id) => (
                400,
                Some(json!({"type": "mapper_parsing_exception", "reason": format!("failed to parse document [{id}]")})),
            ),
            Some(i) => match (op.as_str(), source) {
                ("index", Some(doc)) => match check_mapped_types(&i.mappings, &doc) {
                    Err(reason) => (400, Some(json!({"type": "mapper_parsing_exception", "reason": reason}))),
                    Ok(()) => {
                        let created = i.docs.insert(id.clone(), doc).is_none();
                        (if created { 201 } else { 200 }, None)
                    }
                },
                ("update", Some(update)) => match i.docs.get_mut(&id) {
                    Some(doc) => {
                        let mut partial = update.get("doc").cloned().unwrap_or(json!({}));
                        merge(doc, &mut partial);
                        (200, None)
                    }
                    None => (404, Some(json!({"type": "document_missing_exception", "reason": "document missing"}))),
                },
                ("delete", _) => {
                    if i.docs.remove(&id).is_some() {
                        (200, None)
                    } else {
                        (404, None)
                    }
                }
                _ => (400, Some(json!({"type": "illegal_argument_exception", "reason": "bad action"}))),
            },
        };

        let mut result = json!({"_index": index, "_id": id, "status": status});
        if let Some(error) = error {
            errors = true;
            result["error"] = error;
        } else if op == "delete" && status == 404 {
            result["result"] = json!("not_found");
        }
        items.push(json!({ op: result }));
    }

    reply(200, json!({"took": 1, "errors": errors, "items": items}))
}

/// Deep merge `update` into `target`; explicit nulls replace.
fn merge(target: &mut Value, update: &mut Value) {
    match (target, update) {
        (Value::Object(t), Value::Object(u)) => {
            for (k, v) in u.iter_mut() {
                match t.get_mut(k) {
                    Some(existing) if existing.is_object() && v.is_object() => merge(existing, v),
                    _ => {
                        t.insert(k.clone(), v.take());
                    }
                }
            }
        }
        (t, u) => *t = u.take(),
    }
}

/// `_source` restricted to one dotted path.
fn project(doc: &Value, path: &str) -> Value {
    let mut out = json!({});
    let parts: Vec<&str> = path.split('.').collect();
    let mut src = doc;
    for part in &parts {
        match src.get(*part) {
            Some(v) => src = v,
            None => return out,
        }
    }
    let mut cursor = &mut out;
    for (n, part) in parts.iter().enumerate() {
        let value = if n + 1 == parts.len() { src.clone() } else { json!({}) };
        cursor[*part] = value;
        cursor = &mut cursor[*part];
    }
    out
}

/// Values at a dotted path; `*` matches any key. Arrays are flattened.
fn lookup<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for part in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            if let Value::Object(map) = value {
                if part == "*" {
                    next.extend(map.values());
                } else if let Some(v) = map.get(part) {
                    next.push(v);
                }
            }
        }
        current = next;
    }
    current
        .into_iter()
        .flat_map(|v| match v {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            Value::Null => vec![],
            other => vec![other],
        })
        .collect()
}

/// Whether a `metadata.*` / `vectors.*` path is declared in the mapping.
fn is_mapped(mappings: &Value, path: &str) -> bool {
    let mut parts = path.split('.');
    let Some(root) = parts.next() else { return false };
    if root != "metadata" && root != "vectors" {
        return true;
    }
    let mut node = &mappings["properties"][root];
    for part in parts {
        node = &node["properties"][part];
    }
    !node.is_null()
}

fn mapped_type<'a>(mappings: &'a Value, path: &str) -> Option<&'a str> {
    let mut node = &mappings["properties"];
    let parts: Vec<&str> = path.split('.').collect();
    for (n, part) in parts.iter().enumerate() {
        node = &node[*part];
        if n + 1 < parts.len() {
            node = &node["properties"];
        }
    }
    node["type"].as_str()
}

fn check_mapped_types(mappings: &Value, doc: &Value) -> Result<(), String> {
    if let Some(metadata) = doc.get("metadata").and_then(Value::as_object) {
        for (name, value) in metadata {
            let path = format!("metadata.{name}");
            let ok = match mapped_type(mappings, &path) {
                Some("long") => value.is_null() || value.is_i64() || value.is_u64(),
                Some("float") => value.is_null() || value.is_number(),
                _ => true,
            };
            if !ok {
                return Err(format!("failed to parse field [{path}] with value {value}"));
            }
        }
    }
    if let Some(vectors) = doc.get("vectors").and_then(Value::as_object) {
        for (id, value) in vectors {
            let dims = mappings["properties"]["vectors"]["properties"][id]["dims"].as_u64();
            let len = value.as_array().map(|a| a.len() as u64);
            if let (Some(dims), Some(len)) = (dims, len) {
                if dims != len {
                    return Err(format!(
                        "vector [vectors.{id}] has {len} dimensions, mapping declares {dims}"
                    ));
                }
            }
        }
    }
    Ok(())
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn text_score(doc: &Value, field: &str, query: &str) -> Option<f32> {
    let wanted = tokens(query);
    let present: HashSet<String> = lookup(doc, field)
        .into_iter()
        .filter_map(Value::as_str)
        .flat_map(tokens)
        .collect();
    let hits = wanted.iter().filter(|t| present.contains(*t)).count();
    (hits > 0).then_some(hits as f32)
}

fn same_term(stored: &Value, wanted: &Value) -> bool {
    match (stored, wanted) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Number(a), Value::String(b)) | (Value::String(b), Value::Number(a)) => {
            b.parse::<f64>().ok() == a.as_f64()
        }
        (a, b) => a == b,
    }
}

fn in_range(value: f64, bounds: &Value) -> bool {
    let bound = |k: &str| bounds.get(k).and_then(Value::as_f64);
    bound("gte").map_or(true, |b| value >= b)
        && bound("gt").map_or(true, |b| value > b)
        && bound("lte").map_or(true, |b| value <= b)
        && bound("lt").map_or(true, |b| value < b)
}

fn single_entry(value: &Value) -> Option<(&String, &Value)> {
    value.as_object().and_then(|o| o.iter().next())
}

fn as_clauses(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
        None => vec![],
    }
}

/// Score of `doc` under `query`, `None` when it does not match.
fn evaluate(query: &Value, doc: &Value, mappings: &Value) -> Option<f32> {
    let (kind, body) = single_entry(query)?;
    match kind.as_str() {
        "match_all" => Some(1.0),
        "bool" => {
            let must = as_clauses(body.get("must"));
            let filter = as_clauses(body.get("filter"));
            let should = as_clauses(body.get("should"));
            let must_not = as_clauses(body.get("must_not"));

            let mut score = 0.0;
            for clause in &must {
                score += evaluate(clause, doc, mappings)?;
            }
            for clause in &filter {
                evaluate(clause, doc, mappings)?;
            }
            if must_not.iter().any(|c| evaluate(c, doc, mappings).is_some()) {
                return None;
            }
            let default_min = if must.is_empty() && filter.is_empty() && !should.is_empty() { 1 } else { 0 };
            let min_should = body
                .get("minimum_should_match")
                .and_then(Value::as_u64)
                .unwrap_or(default_min) as usize;
            let mut matched = 0;
            for clause in &should {
                if let Some(s) = evaluate(clause, doc, mappings) {
                    matched += 1;
                    score += s;
                }
            }
            (matched >= min_should).then_some(score)
        }
        "match" => {
            let (field, params) = single_entry(body)?;
            let q = params.get("query").and_then(Value::as_str).or_else(|| params.as_str())?;
            text_score(doc, field, q)
        }
        "multi_match" => {
            let q = body.get("query").and_then(Value::as_str)?;
            body.get("fields")?
                .as_array()?
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|f| text_score(doc, f, q))
                .reduce(f32::max)
        }
        "term" => {
            let (field, params) = single_entry(body)?;
            if !is_mapped(mappings, field) {
                return None;
            }
            let wanted = params.get("value").unwrap_or(params);
            lookup(doc, field)
                .into_iter()
                .any(|v| same_term(v, wanted))
                .then_some(1.0)
        }
        "terms" => {
            let (field, wanted) = single_entry(body)?;
            if !is_mapped(mappings, field) {
                return None;
            }
            let wanted = wanted.as_array()?;
            lookup(doc, field)
                .into_iter()
                .any(|v| wanted.iter().any(|w| same_term(v, w)))
                .then_some(1.0)
        }
        "range" => {
            let (field, bounds) = single_entry(body)?;
            if !is_mapped(mappings, field) {
                return None;
            }
            lookup(doc, field)
                .into_iter()
                .filter_map(Value::as_f64)
                .any(|v| in_range(v, bounds))
                .then_some(1.0)
        }
        "exists" => {
            let field = body.get("field").and_then(Value::as_str)?;
            (is_mapped(mappings, field) && !lookup(doc, field).is_empty()).then_some(1.0)
        }
        "query_string" => {
            let q = body.get("query").and_then(Value::as_str)?;
            let alternatives: Vec<&str> = q.split(" OR ").map(str::trim).collect();
            let fields = body.get("fields")?.as_array()?;
            fields
                .iter()
                .filter_map(Value::as_str)
                .flat_map(|f| lookup(doc, f))
                .filter_map(Value::as_str)
                .any(|v| alternatives.contains(&v))
                .then_some(1.0)
        }
        _ => None,
    }
}

fn l2_score(a: &[f64], b: &[f64]) -> f64 {
    let d2: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    1.0 / (1.0 + d2)
}

fn hits_body(hits: &[(f32, &String)], total: usize) -> Value {
    json!({
        "took": 1,
        "timed_out": false,
        "hits": {
            "total": {"value": total, "relation": "eq"},
            "hits": hits.iter().map(|(score, id)| json!({"_id": id, "_score": score})).collect::<Vec<_>>(),
        }
    })
}

fn search(index: &FakeIndex, body: &Value) -> Response {
    if let Some(knn) = body.get("knn") {
        return knn_search(index, knn, body);
    }

    let query = body.get("query").cloned().unwrap_or(json!({"match_all": {}}));
    let mut matched: Vec<(f32, &String)> = index
        .docs
        .iter()
        .filter_map(|(id, doc)| evaluate(&query, doc, &index.mappings).map(|s| (s, id)))
        .collect();
    matched.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    let total = matched.len();
    let from = body.get("from").and_then(Value::as_u64).unwrap_or(0) as usize;
    let size = body.get("size").and_then(Value::as_u64).unwrap_or(10) as usize;
    let page: Vec<_> = matched.iter().skip(from).take(size).cloned().collect();

    let mut response = hits_body(&page, total);
    if let Some(aggs) = body.get("aggs").and_then(Value::as_object) {
        let docs: Vec<&Value> = matched.iter().filter_map(|(_, id)| index.docs.get(*id)).collect();
        let mut out = Map::new();
        for (name, agg) in aggs {
            out.insert(name.clone(), aggregate(agg, &docs));
        }
        response["aggregations"] = Value::Object(out);
    }
    reply(200, response)
}

fn aggregate(agg: &Value, docs: &[&Value]) -> Value {
    let Some((kind, params)) = single_entry(agg) else {
        return Value::Null;
    };
    let field = params.get("field").and_then(Value::as_str).unwrap_or_default();
    match kind.as_str() {
        "terms" => {
            let size = params.get("size").and_then(Value::as_u64).unwrap_or(10) as usize;
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            for doc in docs {
                let distinct: HashSet<String> = lookup(doc, field)
                    .into_iter()
                    .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
                    .collect();
                for term in distinct {
                    *counts.entry(term).or_default() += 1;
                }
            }
            let mut buckets: Vec<(String, u64)> = counts.into_iter().collect();
            buckets.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            json!({
                "buckets": buckets.into_iter().take(size)
                    .map(|(key, count)| json!({"key": key, "doc_count": count}))
                    .collect::<Vec<_>>()
            })
        }
        "min" | "max" => {
            let values = docs.iter().flat_map(|d| lookup(d, field)).filter_map(Value::as_f64);
            let value = if kind == "min" {
                values.reduce(f64::min)
            } else {
                values.reduce(f64::max)
            };
            json!({"value": value})
        }
        _ => Value::Null,
    }
}

fn knn_search(index: &FakeIndex, knn: &Value, body: &Value) -> Response {
    let Some(field) = knn.get("field").and_then(Value::as_str) else {
        return es_error(400, "parsing_exception", "knn requires field");
    };
    if !is_mapped(&index.mappings, field) {
        return es_error(
            400,
            "illegal_argument_exception",
            &format!("[knn] queries are only supported on [dense_vector] fields, [{field}] is not mapped"),
        );
    }
    let query_vector: Vec<f64> = knn
        .get("query_vector")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default();
    let k = knn.get("k").and_then(Value::as_u64).unwrap_or(10) as usize;
    let num_candidates = knn.get("num_candidates").and_then(Value::as_u64).unwrap_or(0) as usize;
    if num_candidates < k {
        return es_error(
            400,
            "illegal_argument_exception",
            "[num_candidates] cannot be less than [k]",
        );
    }

    let mut scored: Vec<(f32, &String)> = index
        .docs
        .iter()
        .filter(|(_, doc)| {
            knn.get("filter")
                .map_or(true, |f| evaluate(f, doc, &index.mappings).is_some())
        })
        .filter_map(|(id, doc)| {
            let stored: Vec<f64> = lookup(doc, field).into_iter().filter_map(Value::as_f64).collect();
            (stored.len() == query_vector.len())
                .then(|| (l2_score(&stored, &query_vector) as f32, id))
        })
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    scored.truncate(k);

    let size = body.get("size").and_then(Value::as_u64).unwrap_or(k as u64) as usize;
    let total = scored.len();
    scored.truncate(size);
    reply(200, hits_body(&scored, total))
}
