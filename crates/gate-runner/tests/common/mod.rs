#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use gate_runner::{
    GateError, InstanceHandle, InstanceLauncher, InstanceSpec, Result, RunningInstance,
};
use serde_json::{json, Value};
use tiny_http::{Header, Method, Request, Response, Server};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeMode {
    Durable,
    // Keeps collection metadata on disk but drops points on restart.
    LosesWrites,
    NeverReady,
    FailsCreate,
    RejectsDelete,
    EmptySearch,
}

#[derive(Clone)]
pub struct FakeServiceLauncher {
    pub mode: FakeMode,
    pub events: Arc<Mutex<Vec<String>>>,
}

impl FakeServiceLauncher {
    pub fn new(mode: FakeMode) -> Self {
        Self {
            mode,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events").clone()
    }
}

impl InstanceLauncher for FakeServiceLauncher {
    fn launch(&self, spec: &InstanceSpec) -> Result<InstanceHandle> {
        spec.paths.create_all()?;
        self.events
            .lock()
            .expect("events")
            .push(format!("launch {}", spec.label));

        let runtime = if self.mode == FakeMode::NeverReady {
            FakeInstance {
                label: spec.label.clone(),
                server: None,
                worker: None,
                events: self.events.clone(),
            }
        } else {
            let server = Server::http(("127.0.0.1", spec.http_port)).map_err(|e| {
                GateError::Launch {
                    label: spec.label.clone(),
                    detail: e.to_string(),
                }
            })?;
            let server = Arc::new(server);
            let state = FakeState {
                mode: self.mode,
                data_file: spec.paths.storage.join("collections.json"),
                snapshots: spec.paths.snapshots.clone(),
                collections: load_collections(&spec.paths.storage.join("collections.json")),
            };
            let accept = server.clone();
            let worker = thread::spawn(move || serve(accept, state));
            FakeInstance {
                label: spec.label.clone(),
                server: Some(server),
                worker: Some(worker),
                events: self.events.clone(),
            }
        };
        let service_paths = spec.paths.clone();
        Ok(InstanceHandle::new(spec, service_paths, Box::new(runtime)))
    }
}

struct FakeInstance {
    label: String,
    server: Option<Arc<Server>>,
    worker: Option<JoinHandle<()>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl RunningInstance for FakeInstance {
    fn describe(&self) -> String {
        format!("fake {}", self.label)
    }

    fn pid(&self) -> Option<u32> {
        Some(std::process::id())
    }

    fn terminate(&mut self) -> io::Result<()> {
        if let Some(server) = self.server.take() {
            server.unblock();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.events
            .lock()
            .expect("events")
            .push(format!("stop {}", self.label));
        Ok(())
    }

    fn log_tail(&self) -> String {
        format!("fake service {} log line", self.label)
    }
}

type Points = BTreeMap<u64, (Vec<f64>, Value)>;

struct FakeState {
    mode: FakeMode,
    data_file: PathBuf,
    snapshots: PathBuf,
    collections: BTreeMap<String, Points>,
}

fn load_collections(path: &Path) -> BTreeMap<String, Points> {
    fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

impl FakeState {
    fn persist(&self) {
        let on_disk: BTreeMap<String, Points> = if self.mode == FakeMode::LosesWrites {
            self.collections
                .keys()
                .map(|k| (k.clone(), Points::new()))
                .collect()
        } else {
            self.collections.clone()
        };
        let bytes = serde_json::to_vec(&on_disk).expect("encode collections");
        fs::write(&self.data_file, bytes).expect("persist collections");
    }
}

fn serve(server: Arc<Server>, mut state: FakeState) {
    for mut request in server.incoming_requests() {
        let mut body = String::new();
        let _ = request.as_reader().read_to_string(&mut body);
        let (status, payload) = route(&mut state, &request, &body);
        respond(request, status, payload);
    }
}

fn respond(request: Request, status: u16, payload: Value) {
    let header = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("static header");
    let response = Response::from_string(payload.to_string())
        .with_status_code(status)
        .with_header(header);
    let _ = request.respond(response);
}

fn ok(result: Value) -> (u16, Value) {
    (200, json!({ "result": result, "status": "ok", "time": 0.001 }))
}

fn not_found(what: &str) -> (u16, Value) {
    (
        404,
        json!({ "status": { "error": format!("Not found: {}", what) } }),
    )
}

fn route(state: &mut FakeState, request: &Request, body: &str) -> (u16, Value) {
    let path = request.url().split('?').next().unwrap_or("").to_string();
    let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
    let body: Value = serde_json::from_str(body).unwrap_or(Value::Null);

    match (request.method(), parts.as_slice()) {
        (Method::Get, ["collections"]) => {
            let names: Vec<Value> = state
                .collections
                .keys()
                .map(|k| json!({ "name": k }))
                .collect();
            ok(json!({ "collections": names }))
        }
        (Method::Delete, ["collections", name]) => {
            if state.mode == FakeMode::RejectsDelete {
                return (500, json!({ "status": { "error": "storage busy" } }));
            }
            if state.collections.remove(*name).is_some() {
                state.persist();
                ok(json!(true))
            } else {
                not_found(name)
            }
        }
        (Method::Put, ["collections", name]) => {
            if state.mode == FakeMode::FailsCreate {
                return (
                    400,
                    json!({ "status": { "error": "bad vector config" } }),
                );
            }
            state.collections.insert(name.to_string(), Points::new());
            state.persist();
            ok(json!(true))
        }
        (Method::Get, ["collections", name]) => match state.collections.get(*name) {
            Some(points) => ok(json!({ "status": "green", "points_count": points.len() })),
            None => not_found(name),
        },
        (Method::Put, ["collections", name, "points"]) => {
            let Some(points) = state.collections.get_mut(*name) else {
                return not_found(name);
            };
            for p in body["points"].as_array().cloned().unwrap_or_default() {
                let id = p["id"].as_u64().unwrap_or(0);
                let vector: Vec<f64> = p["vector"]
                    .as_array()
                    .map(|v| v.iter().filter_map(Value::as_f64).collect())
                    .unwrap_or_default();
                points.insert(id, (vector, p["payload"].clone()));
            }
            state.persist();
            ok(json!({ "operation_id": 0, "status": "completed" }))
        }
        (Method::Post, ["collections", name, "points", "search"]) => {
            let Some(points) = state.collections.get(*name) else {
                return not_found(name);
            };
            if state.mode == FakeMode::EmptySearch {
                return ok(json!([]));
            }
            let probe: Vec<f64> = body["vector"]
                .as_array()
                .map(|v| v.iter().filter_map(Value::as_f64).collect())
                .unwrap_or_default();
            let top = body["top"].as_u64().unwrap_or(10) as usize;
            let mut scored: Vec<(u64, f64)> = points
                .iter()
                .map(|(id, (v, _))| (*id, v.iter().zip(&probe).map(|(a, b)| a * b).sum::<f64>()))
                .collect();
            scored.sort_by(|a, b| b.1.total_cmp(&a.1));
            let hits: Vec<Value> = scored
                .into_iter()
                .take(top)
                .map(|(id, score)| json!({ "id": id, "version": 0, "score": score }))
                .collect();
            ok(json!(hits))
        }
        (Method::Post, ["collections", name, "snapshots"]) => {
            let Some(points) = state.collections.get(*name) else {
                return not_found(name);
            };
            let snapshot_name = format!("{}-{}.snapshot", name, Utc::now().timestamp_micros());
            let dir = state.snapshots.join(name);
            fs::create_dir_all(&dir).expect("snapshot dir");
            let bytes = serde_json::to_vec(points).expect("encode snapshot");
            fs::write(dir.join(&snapshot_name), bytes).expect("write snapshot");
            ok(json!({ "name": snapshot_name, "size": 0 }))
        }
        (Method::Put, ["collections", name, "snapshots", "recover"]) => {
            let location = body["location"].as_str().unwrap_or("");
            let Some(path) = location.strip_prefix("file://") else {
                return (400, json!({ "status": { "error": "bad location" } }));
            };
            match fs::read(path)
                .ok()
                .and_then(|b| serde_json::from_slice::<Points>(&b).ok())
            {
                Some(points) => {
                    state.collections.insert(name.to_string(), points);
                    state.persist();
                    ok(json!(true))
                }
                None => (
                    400,
                    json!({ "status": { "error": format!("cannot read {}", path) } }),
                ),
            }
        }
        _ => (404, json!({ "status": { "error": format!("no route {}", path) } })),
    }
}

pub fn scratch(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "archgate_it_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&root).expect("scratch root");
    root
}
