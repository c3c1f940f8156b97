use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{GateError, Result};
use crate::readiness::HealthProbe;

#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub result: T,
    #[serde(default)]
    pub status: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionInfo {
    pub points_count: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoredPoint {
    pub id: Value,
    pub score: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotDescription {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FixturePoint {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct PersistenceCheckpoint {
    pub collection: String,
    pub vector_size: usize,
    pub distance: String,
    pub points: Vec<FixturePoint>,
    pub probe_vector: Vec<f32>,
    pub top: usize,
}

impl PersistenceCheckpoint {
    pub fn standard(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            vector_size: 4,
            distance: "Dot".to_string(),
            points: vec![
                FixturePoint {
                    id: 1,
                    vector: vec![0.05, 0.61, 0.76, 0.74],
                    payload: json!({ "city": "Berlin", "count": 1 }),
                },
                FixturePoint {
                    id: 2,
                    vector: vec![0.19, 0.81, 0.75, 0.11],
                    payload: json!({ "city": "London", "count": 2 }),
                },
                FixturePoint {
                    id: 3,
                    vector: vec![0.36, 0.55, 0.47, 0.94],
                    payload: json!({ "city": "Moscow", "count": 3 }),
                },
            ],
            probe_vector: vec![0.2, 0.1, 0.9, 0.7],
            top: 3,
        }
    }

    pub fn expected_count(&self) -> u64 {
        self.points.len() as u64
    }

    fn create_body(&self) -> Value {
        json!({
            "vectors": { "size": self.vector_size, "distance": self.distance },
            "optimizers_config": { "default_segment_number": 1 },
            "replication_factor": 1
        })
    }
}

pub struct ServiceClient {
    client: Client,
    base_url: String,
}

impl ServiceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn delete_collection_if_exists(&self, collection: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/collections/{}", collection)))
            .send()?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(collection, status = status.as_u16(), "collection cleared");
            return Ok(());
        }
        Err(status_error("delete collection", resp))
    }

    pub fn create_collection(&self, fixture: &PersistenceCheckpoint) -> Result<()> {
        let resp = self
            .client
            .put(self.url(&format!("/collections/{}", fixture.collection)))
            .json(&fixture.create_body())
            .send()?;
        expect_success("create collection", resp).map(|_| ())
    }

    // wait=true: returns only once the points are durably applied.
    pub fn upsert_points(&self, fixture: &PersistenceCheckpoint) -> Result<()> {
        let body = json!({ "points": fixture.points });
        let resp = self
            .client
            .put(self.url(&format!(
                "/collections/{}/points?wait=true",
                fixture.collection
            )))
            .json(&body)
            .send()?;
        expect_success("upsert points", resp).map(|_| ())
    }

    pub fn search(&self, fixture: &PersistenceCheckpoint) -> Result<Vec<ScoredPoint>> {
        let body = json!({ "vector": fixture.probe_vector, "top": fixture.top });
        let resp = self
            .client
            .post(self.url(&format!(
                "/collections/{}/points/search",
                fixture.collection
            )))
            .json(&body)
            .send()?;
        decode::<Vec<ScoredPoint>>("search", expect_success("search", resp)?)
    }

    pub fn collection_info(&self, collection: &str) -> Result<CollectionInfo> {
        let resp = self
            .client
            .get(self.url(&format!("/collections/{}", collection)))
            .send()?;
        decode::<CollectionInfo>("collection info", expect_success("collection info", resp)?)
    }

    pub fn create_snapshot(&self, collection: &str) -> Result<SnapshotDescription> {
        let resp = self
            .client
            .post(self.url(&format!(
                "/collections/{}/snapshots?wait=true",
                collection
            )))
            .send()?;
        decode::<SnapshotDescription>(
            "create snapshot",
            expect_success("create snapshot", resp)?,
        )
    }

    pub fn recover_snapshot(&self, collection: &str, location: &Path) -> Result<()> {
        let body = json!({ "location": format!("file://{}", location.display()) });
        let resp = self
            .client
            .put(self.url(&format!(
                "/collections/{}/snapshots/recover?wait=true",
                collection
            )))
            .json(&body)
            .send()?;
        expect_success("recover snapshot", resp).map(|_| ())
    }
}

impl HealthProbe for ServiceClient {
    fn probe(&self, budget: Duration) -> bool {
        matches!(
            self.client
                .get(self.url("/collections"))
                .timeout(budget)
                .send(),
            Ok(resp) if resp.status().is_success()
        )
    }
}

fn status_error(operation: &str, resp: Response) -> GateError {
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    GateError::unexpected(operation, format!("{} {}", status, body))
}

fn expect_success(operation: &str, resp: Response) -> Result<Value> {
    if !resp.status().is_success() {
        return Err(status_error(operation, resp));
    }
    let text = resp.text()?;
    serde_json::from_str::<Value>(&text)
        .map_err(|e| GateError::unexpected(operation, format!("invalid json ({}): {}", e, text)))
}

fn decode<T: DeserializeOwned>(operation: &str, body: Value) -> Result<T> {
    serde_json::from_value::<ApiResponse<T>>(body.clone())
        .map(|r| r.result)
        .map_err(|e| GateError::unexpected(operation, format!("{}: {}", e, body)))
}

pub fn seed_and_verify(client: &ServiceClient, fixture: &PersistenceCheckpoint) -> Result<()> {
    client.delete_collection_if_exists(&fixture.collection)?;
    client.create_collection(fixture)?;
    client.upsert_points(fixture)?;
    let hits = client.search(fixture)?;
    require_hits(fixture, &hits)?;
    info!(
        collection = %fixture.collection,
        written = fixture.points.len(),
        hits = hits.len(),
        "fixture written and searchable"
    );
    Ok(())
}

pub fn verify_persisted(client: &ServiceClient, fixture: &PersistenceCheckpoint) -> Result<u64> {
    let info = client.collection_info(&fixture.collection)?;
    let observed = info.points_count.ok_or_else(|| {
        GateError::unexpected("collection info", "response missing result.points_count")
    })?;
    check_persisted_count(fixture, observed)?;
    info!(collection = %fixture.collection, observed, "persisted count verified");
    Ok(observed)
}

pub fn check_persisted_count(fixture: &PersistenceCheckpoint, observed: u64) -> Result<()> {
    let expected = fixture.expected_count();
    if observed < expected {
        return Err(GateError::PersistenceViolation {
            collection: fixture.collection.clone(),
            expected,
            observed,
        });
    }
    Ok(())
}

pub fn require_hits(fixture: &PersistenceCheckpoint, hits: &[ScoredPoint]) -> Result<()> {
    if hits.is_empty() {
        return Err(GateError::SearchEmpty {
            collection: fixture.collection.clone(),
        });
    }
    Ok(())
}

pub fn wait_for_file(path: &Path, deadline: Duration, interval: Duration) -> Result<PathBuf> {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() > deadline {
            return Err(GateError::SnapshotMissing(path.to_path_buf()));
        }
        thread::sleep(interval);
    }
    Ok(path.to_path_buf())
}
