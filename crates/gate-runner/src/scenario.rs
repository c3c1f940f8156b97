use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::error::{GateError, Result};
use crate::instance::{InstanceHandle, InstanceLauncher, InstancePaths, InstanceSpec};
use crate::ports::pick_port_pair;
use crate::readiness::wait_ready;
use crate::sampler::rss_kb;
use crate::workload::{
    require_hits, seed_and_verify, verify_persisted, wait_for_file, PersistenceCheckpoint,
    ServiceClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootLabel {
    Boot1,
    Boot2,
}

impl BootLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            BootLabel::Boot1 => "boot1",
            BootLabel::Boot2 => "boot2",
        }
    }
}

impl fmt::Display for BootLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BootRecord {
    pub label: BootLabel,
    pub ready_latency_ms: u64,
    pub rss_kb_at_ready: u64,
    pub rss_kb_after_workload: u64,
}

impl fmt::Display for BootRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ready_latency_ms={} rss_kb_at_ready={} rss_kb_after_workload={}",
            self.label, self.ready_latency_ms, self.rss_kb_at_ready, self.rss_kb_after_workload
        )
    }
}

#[derive(Debug, Clone)]
pub struct SmokeSettings {
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub snapshot_timeout: Duration,
}

impl Default for SmokeSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
            request_timeout: Duration::from_secs(10),
            snapshot_timeout: Duration::from_secs(30),
        }
    }
}

impl SmokeSettings {
    pub fn from_config(cfg: &RunConfig) -> Self {
        Self {
            ready_timeout: cfg.ready_timeout,
            poll_interval: cfg.poll_interval,
            request_timeout: cfg.request_timeout,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    retain: bool,
}

impl ScratchDir {
    pub fn create(prefix: &str) -> io::Result<Self> {
        let path = std::env::temp_dir().join(format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            retain: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retain(&mut self) {
        self.retain = true;
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.retain {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

/// Starts one instance, waits for readiness, runs `body`, and stops the instance on every path out.
pub fn run_boot<T, F>(
    launcher: &dyn InstanceLauncher,
    spec: &InstanceSpec,
    label: BootLabel,
    settings: &SmokeSettings,
    out: &mut dyn Write,
    body: F,
) -> Result<(BootRecord, T)>
where
    F: FnOnce(&InstanceHandle, &ServiceClient) -> Result<T>,
{
    writeln!(out, "[{}] starting instance ({})", label, spec.label)?;
    let mut handle = launcher.launch(spec)?;
    let outcome = drive_boot(&handle, label, settings, body);
    if let Err(err) = &outcome {
        let _ = writeln!(out, "[{}] error: {}", label, err);
        let tail = handle.log_tail();
        if !tail.is_empty() {
            let _ = writeln!(out, "--- {} instance log (tail) ---\n{}", label, tail);
        }
    }
    let stopped = handle.stop();
    let (record, value) = outcome?;
    stopped?;
    writeln!(out, "[{}] {}", label, record)?;
    Ok((record, value))
}

fn drive_boot<T, F>(
    handle: &InstanceHandle,
    label: BootLabel,
    settings: &SmokeSettings,
    body: F,
) -> Result<(BootRecord, T)>
where
    F: FnOnce(&InstanceHandle, &ServiceClient) -> Result<T>,
{
    let client = ServiceClient::new(handle.http_endpoint(), settings.request_timeout)?;
    let latency = wait_ready(&client, settings.ready_timeout, settings.poll_interval).ok_or_else(
        || GateError::ReadinessTimeout {
            endpoint: handle.http_endpoint().to_string(),
            deadline_secs: settings.ready_timeout.as_secs(),
        },
    )?;
    let rss_kb_at_ready = handle.pid().map(rss_kb).unwrap_or(0);
    info!(
        boot = %label,
        ready_latency_ms = latency.as_millis() as u64,
        rss_kb_at_ready,
        "instance ready"
    );

    let value = body(handle, &client)?;

    let rss_kb_after_workload = handle.pid().map(rss_kb).unwrap_or(0);
    let record = BootRecord {
        label,
        ready_latency_ms: latency.as_millis() as u64,
        rss_kb_at_ready,
        rss_kb_after_workload,
    };
    Ok((record, value))
}

fn boot_spec(label: &str, root: &Path, paths: InstancePaths, ports: (u16, u16)) -> InstanceSpec {
    InstanceSpec {
        label: label.to_string(),
        http_port: ports.0,
        grpc_port: ports.1,
        paths,
        log_path: root.join(format!("{}.instance.log", label)),
        extra_env: Default::default(),
    }
}

pub fn persistence_restart(
    launcher: &dyn InstanceLauncher,
    settings: &SmokeSettings,
    root: &Path,
    fixture: &PersistenceCheckpoint,
    out: &mut dyn Write,
) -> Result<Vec<BootRecord>> {
    let ports = pick_port_pair()?;
    let paths = InstancePaths::under(root, "storage");

    let spec1 = boot_spec("boot1", root, paths.clone(), ports);
    let (boot1, ()) = run_boot(launcher, &spec1, BootLabel::Boot1, settings, out, |_, client| {
        seed_and_verify(client, fixture)
    })?;

    let spec2 = boot_spec("boot2", root, paths, ports);
    let (boot2, observed) =
        run_boot(launcher, &spec2, BootLabel::Boot2, settings, out, |_, client| {
            verify_persisted(client, fixture)
        })?;
    writeln!(
        out,
        "persistence ok: collection={} written={} observed_after_restart={}",
        fixture.collection,
        fixture.expected_count(),
        observed
    )?;
    Ok(vec![boot1, boot2])
}

pub fn snapshot_restore(
    launcher: &dyn InstanceLauncher,
    settings: &SmokeSettings,
    root: &Path,
    fixture: &PersistenceCheckpoint,
    out: &mut dyn Write,
) -> Result<Vec<BootRecord>> {
    let ports = pick_port_pair()?;

    let spec1 = boot_spec(
        "snapshot_source",
        root,
        InstancePaths::under(root, "storage_a"),
        ports,
    );
    let (boot1, snapshot_host_path) =
        run_boot(launcher, &spec1, BootLabel::Boot1, settings, out, |handle, client| {
            seed_and_verify(client, fixture)?;
            let snapshot = client.create_snapshot(&fixture.collection)?;
            let path = handle
                .paths()
                .snapshots
                .join(&fixture.collection)
                .join(&snapshot.name);
            wait_for_file(&path, settings.snapshot_timeout, settings.poll_interval)
        })?;
    info!(snapshot = %snapshot_host_path.display(), "snapshot created");

    let spec2 = boot_spec(
        "snapshot_restore",
        root,
        InstancePaths::under(root, "storage_b"),
        ports,
    );
    let (boot2, observed) =
        run_boot(launcher, &spec2, BootLabel::Boot2, settings, out, |handle, client| {
            client.delete_collection_if_exists(&fixture.collection)?;
            client.recover_snapshot(
                &fixture.collection,
                &handle.service_path(&snapshot_host_path),
            )?;
            let observed = verify_persisted(client, fixture)?;
            require_hits(fixture, &client.search(fixture)?)?;
            Ok(observed)
        })?;
    writeln!(
        out,
        "snapshot restore ok: collection={} snapshot={} observed_after_restore={}",
        fixture.collection,
        snapshot_host_path.display(),
        observed
    )?;
    Ok(vec![boot1, boot2])
}

pub fn with_scratch<T>(
    prefix: &str,
    out: &mut dyn Write,
    scenario: impl FnOnce(&Path, &mut dyn Write) -> Result<T>,
) -> Result<T> {
    let mut scratch = ScratchDir::create(prefix)?;
    let result = scenario(scratch.path(), &mut *out);
    if result.is_err() {
        scratch.retain();
        warn!(path = %scratch.path().display(), "scratch directory retained for inspection");
        let _ = writeln!(out, "scratch retained at {}", scratch.path().display());
    }
    result
}
