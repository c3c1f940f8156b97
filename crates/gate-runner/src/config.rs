use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::error::{GateError, Result};

pub const ENV_PROFILE: &str = "ARCHGATE_PROFILE";
pub const ENV_SERVICE_BIN: &str = "ARCHGATE_SERVICE_BIN";
pub const ENV_IMAGE: &str = "ARCHGATE_IMAGE";
pub const ENV_ENABLE_PERF: &str = "ARCHGATE_ENABLE_PERF";
pub const ENV_ENABLE_CONTAINER_SMOKE: &str = "ARCHGATE_ENABLE_CONTAINER_SMOKE";
pub const ENV_BENCH_VECTORS: &str = "ARCHGATE_BENCH_VECTORS";
pub const ENV_BENCH_DIM: &str = "ARCHGATE_BENCH_DIM";
pub const ENV_BENCH_MEASUREMENT_SECS: &str = "ARCHGATE_BENCH_MEASUREMENT_SECS";
pub const ENV_BENCH_SAMPLE_SIZE: &str = "ARCHGATE_BENCH_SAMPLE_SIZE";
pub const ENV_READY_TIMEOUT_SECS: &str = "ARCHGATE_READY_TIMEOUT_SECS";

// Names the quantization persistence bench reads its sizing from.
pub const QBENCH_VECTORS: &str = "QDRANT_QBENCH_VECTORS";
pub const QBENCH_DIM: &str = "QDRANT_QBENCH_DIM";
pub const QBENCH_MEASUREMENT_SECS: &str = "QDRANT_QBENCH_MEASUREMENT_SECS";
pub const QBENCH_SAMPLE_SIZE: &str = "QDRANT_QBENCH_SAMPLE_SIZE";

const DEFAULT_IMAGE: &str = "qdrant/qdrant:local";
const DEFAULT_SERVICE_BIN_NAME: &str = "qdrant";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildProfile {
    Debug,
    Release,
}

impl BuildProfile {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "debug" | "dev" => Ok(BuildProfile::Debug),
            "release" => Ok(BuildProfile::Release),
            other => Err(GateError::Setup(format!(
                "unsupported {}={} (expected debug or release)",
                ENV_PROFILE, other
            ))),
        }
    }

    pub fn target_dir_name(self) -> &'static str {
        match self {
            BuildProfile::Debug => "debug",
            BuildProfile::Release => "release",
        }
    }

    pub fn cargo_args(self) -> Vec<String> {
        match self {
            BuildProfile::Debug => Vec::new(),
            BuildProfile::Release => vec!["--release".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BenchSizing {
    pub vectors: u64,
    pub dim: u64,
    pub measurement_secs: u64,
    pub sample_size: u64,
}

impl Default for BenchSizing {
    fn default() -> Self {
        Self {
            vectors: 2000,
            dim: 64,
            measurement_secs: 5,
            sample_size: 10,
        }
    }
}

impl BenchSizing {
    pub fn as_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(QBENCH_VECTORS.to_string(), self.vectors.to_string());
        env.insert(QBENCH_DIM.to_string(), self.dim.to_string());
        env.insert(
            QBENCH_MEASUREMENT_SECS.to_string(),
            self.measurement_secs.to_string(),
        );
        env.insert(QBENCH_SAMPLE_SIZE.to_string(), self.sample_size.to_string());
        env
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub out_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub profile: BuildProfile,
    pub service_bin: PathBuf,
    pub image: String,
    pub bench: BenchSizing,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    toggles: BTreeMap<String, String>,
}

impl RunConfig {
    pub fn from_env(out_dir: &Path, workspace_dir: &Path) -> Result<Self> {
        let vars: BTreeMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with("ARCHGATE_"))
            .collect();
        Self::from_vars(out_dir, workspace_dir, &vars)
    }

    pub fn from_vars(
        out_dir: &Path,
        workspace_dir: &Path,
        vars: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let profile = match vars.get(ENV_PROFILE) {
            Some(raw) if !raw.trim().is_empty() => BuildProfile::parse(raw)?,
            _ => BuildProfile::Release,
        };
        let service_bin = match vars.get(ENV_SERVICE_BIN) {
            Some(p) if !p.trim().is_empty() => PathBuf::from(p),
            _ => workspace_dir
                .join("target")
                .join(profile.target_dir_name())
                .join(DEFAULT_SERVICE_BIN_NAME),
        };
        let image = vars
            .get(ENV_IMAGE)
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string());

        let defaults = BenchSizing::default();
        let bench = BenchSizing {
            vectors: parse_u64(vars, ENV_BENCH_VECTORS, defaults.vectors)?,
            dim: parse_u64(vars, ENV_BENCH_DIM, defaults.dim)?,
            measurement_secs: parse_u64(
                vars,
                ENV_BENCH_MEASUREMENT_SECS,
                defaults.measurement_secs,
            )?,
            sample_size: parse_u64(vars, ENV_BENCH_SAMPLE_SIZE, defaults.sample_size)?,
        };
        let ready_timeout = Duration::from_secs(parse_u64(vars, ENV_READY_TIMEOUT_SECS, 30)?);

        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            workspace_dir: workspace_dir.to_path_buf(),
            profile,
            service_bin,
            image,
            bench,
            ready_timeout,
            poll_interval: Duration::from_millis(200),
            request_timeout: Duration::from_secs(10),
            toggles: vars.clone(),
        })
    }

    pub fn is_enabled(&self, var: &str) -> bool {
        match self.toggles.get(var).map(|v| v.trim().to_ascii_lowercase()) {
            None => false,
            Some(v) => !(v.is_empty() || v == "0" || v == "false" || v == "no"),
        }
    }
}

fn parse_u64(vars: &BTreeMap<String, String>, key: &str, default: u64) -> Result<u64> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| GateError::Setup(format!("{} must be an integer (got {:?})", key, raw))),
    }
}
