use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{GateError, Result};

const ENV_PREFIX: &str = "QDRANT";
const CONTAINER_HTTP_PORT: u16 = 6333;
const CONTAINER_GRPC_PORT: u16 = 6334;
const CONTAINER_STORAGE: &str = "/qdrant/storage";
const CONTAINER_SNAPSHOTS: &str = "/qdrant/snapshots";
const CONTAINER_TEMP: &str = "/qdrant/tmp";
const STOP_GRACE: Duration = Duration::from_secs(10);
const LOG_TAIL_BYTES: u64 = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    pub storage: PathBuf,
    pub snapshots: PathBuf,
    pub temp: PathBuf,
}

impl InstancePaths {
    pub fn under(root: &Path, storage_name: &str) -> Self {
        Self {
            storage: root.join(storage_name),
            snapshots: root.join("snapshots"),
            temp: root.join("tmp"),
        }
    }

    pub fn create_all(&self) -> io::Result<()> {
        fs::create_dir_all(&self.storage)?;
        fs::create_dir_all(&self.snapshots)?;
        fs::create_dir_all(&self.temp)
    }

    fn pairs(&self) -> [&Path; 3] {
        [
            self.storage.as_path(),
            self.snapshots.as_path(),
            self.temp.as_path(),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub label: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub paths: InstancePaths,
    pub log_path: PathBuf,
    pub extra_env: BTreeMap<String, String>,
}

pub fn service_env(
    bind_host: &str,
    http_port: u16,
    grpc_port: u16,
    paths: &InstancePaths,
) -> Vec<(String, String)> {
    let key = |suffix: &str| format!("{}__{}", ENV_PREFIX, suffix);
    vec![
        (key("SERVICE__HOST"), bind_host.to_string()),
        (key("SERVICE__HTTP_PORT"), http_port.to_string()),
        (key("SERVICE__GRPC_PORT"), grpc_port.to_string()),
        (
            key("STORAGE__STORAGE_PATH"),
            paths.storage.display().to_string(),
        ),
        (
            key("STORAGE__SNAPSHOTS_PATH"),
            paths.snapshots.display().to_string(),
        ),
        (key("STORAGE__TEMP_PATH"), paths.temp.display().to_string()),
        (key("TELEMETRY_DISABLED"), "true".to_string()),
        ("RUST_LOG".to_string(), "warn".to_string()),
    ]
}

pub trait RunningInstance: Send {
    fn describe(&self) -> String;
    fn pid(&self) -> Option<u32>;
    fn terminate(&mut self) -> io::Result<()>;
    fn log_tail(&self) -> String;
}

pub trait InstanceLauncher {
    fn launch(&self, spec: &InstanceSpec) -> Result<InstanceHandle>;
}

pub struct InstanceHandle {
    label: String,
    http_endpoint: String,
    grpc_endpoint: String,
    host_paths: InstancePaths,
    service_paths: InstancePaths,
    runtime: Box<dyn RunningInstance>,
    stopped: bool,
}

impl InstanceHandle {
    pub fn new(
        spec: &InstanceSpec,
        service_paths: InstancePaths,
        runtime: Box<dyn RunningInstance>,
    ) -> Self {
        Self {
            label: spec.label.clone(),
            http_endpoint: format!("http://127.0.0.1:{}", spec.http_port),
            grpc_endpoint: format!("http://127.0.0.1:{}", spec.grpc_port),
            host_paths: spec.paths.clone(),
            service_paths,
            runtime,
            stopped: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn http_endpoint(&self) -> &str {
        &self.http_endpoint
    }

    pub fn grpc_endpoint(&self) -> &str {
        &self.grpc_endpoint
    }

    pub fn paths(&self) -> &InstancePaths {
        &self.host_paths
    }

    pub fn pid(&self) -> Option<u32> {
        self.runtime.pid()
    }

    pub fn log_tail(&self) -> String {
        self.runtime.log_tail()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn service_path(&self, host_path: &Path) -> PathBuf {
        for (host, service) in self
            .host_paths
            .pairs()
            .into_iter()
            .zip(self.service_paths.pairs())
        {
            if let Ok(rel) = host_path.strip_prefix(host) {
                return service.join(rel);
            }
        }
        host_path.to_path_buf()
    }

    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        info!(label = %self.label, instance = %self.runtime.describe(), "stopping instance");
        self.runtime.terminate()?;
        self.stopped = true;
        Ok(())
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        match self.runtime.terminate() {
            Ok(()) => self.stopped = true,
            Err(e) => warn!(label = %self.label, error = %e, "instance teardown on drop failed"),
        }
    }
}

pub struct ProcessLauncher {
    pub binary: PathBuf,
}

impl ProcessLauncher {
    pub fn new(binary: &Path) -> Self {
        Self {
            binary: binary.to_path_buf(),
        }
    }
}

impl InstanceLauncher for ProcessLauncher {
    fn launch(&self, spec: &InstanceSpec) -> Result<InstanceHandle> {
        if !self.binary.exists() {
            return Err(GateError::Setup(format!(
                "service binary not found: {}",
                self.binary.display()
            )));
        }
        spec.paths.create_all()?;
        if let Some(parent) = spec.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&self.binary);
        cmd.envs(service_env(
            "127.0.0.1",
            spec.http_port,
            spec.grpc_port,
            &spec.paths,
        ))
        .envs(&spec.extra_env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

        let child = cmd.spawn().map_err(|e| GateError::Launch {
            label: spec.label.clone(),
            detail: format!("{}: {}", self.binary.display(), e),
        })?;
        info!(
            label = %spec.label,
            pid = child.id(),
            http_port = spec.http_port,
            grpc_port = spec.grpc_port,
            "instance process started"
        );
        let runtime = ProcessInstance {
            child,
            log_path: spec.log_path.clone(),
        };
        Ok(InstanceHandle::new(
            spec,
            spec.paths.clone(),
            Box::new(runtime),
        ))
    }
}

struct ProcessInstance {
    child: Child,
    log_path: PathBuf,
}

impl RunningInstance for ProcessInstance {
    fn describe(&self) -> String {
        format!("pid {}", self.child.id())
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn terminate(&mut self) -> io::Result<()> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        // SIGINT lets the service flush storage before exiting.
        #[cfg(unix)]
        {
            let _ = Command::new("kill")
                .arg("-2")
                .arg(self.child.id().to_string())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
        let start = Instant::now();
        while start.elapsed() < STOP_GRACE {
            match self.child.try_wait() {
                Ok(Some(_)) => return Ok(()),
                Ok(None) => thread::sleep(Duration::from_millis(100)),
                Err(e) => {
                    warn!(pid = self.child.id(), error = %e, "cannot poll instance, killing");
                    break;
                }
            }
        }
        warn!(pid = self.child.id(), "instance ignored SIGINT, killing");
        let _ = self.child.kill();
        self.child.wait()?;
        Ok(())
    }

    fn log_tail(&self) -> String {
        tail_file(&self.log_path, LOG_TAIL_BYTES)
    }
}

pub struct ContainerLauncher {
    pub image: String,
    pub docker: String,
}

impl ContainerLauncher {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            docker: "docker".to_string(),
        }
    }

    pub fn service_paths() -> InstancePaths {
        InstancePaths {
            storage: PathBuf::from(CONTAINER_STORAGE),
            snapshots: PathBuf::from(CONTAINER_SNAPSHOTS),
            temp: PathBuf::from(CONTAINER_TEMP),
        }
    }

    pub fn run_args(&self, spec: &InstanceSpec, name: &str) -> Vec<String> {
        let service_paths = Self::service_paths();
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--rm".into(),
            "--name".into(),
            name.to_string(),
            "-p".into(),
            format!("127.0.0.1:{}:{}", spec.http_port, CONTAINER_HTTP_PORT),
            "-p".into(),
            format!("127.0.0.1:{}:{}", spec.grpc_port, CONTAINER_GRPC_PORT),
        ];
        for (host, service) in spec.paths.pairs().into_iter().zip(service_paths.pairs()) {
            args.push("-v".into());
            args.push(format!("{}:{}", host.display(), service.display()));
        }
        let env = service_env(
            "0.0.0.0",
            CONTAINER_HTTP_PORT,
            CONTAINER_GRPC_PORT,
            &service_paths,
        );
        for (k, v) in env.into_iter().chain(spec.extra_env.clone()) {
            args.push("-e".into());
            args.push(format!("{}={}", k, v));
        }
        args.push(self.image.clone());
        args
    }
}

impl InstanceLauncher for ContainerLauncher {
    fn launch(&self, spec: &InstanceSpec) -> Result<InstanceHandle> {
        spec.paths.create_all()?;
        let name = format!(
            "archgate-{}-{}-{}",
            spec.label,
            std::process::id(),
            spec.http_port
        );
        let output = Command::new(&self.docker)
            .args(self.run_args(spec, &name))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| GateError::Setup(format!("cannot run {}: {}", self.docker, e)))?;
        if !output.status.success() {
            return Err(GateError::Launch {
                label: spec.label.clone(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(GateError::Launch {
                label: spec.label.clone(),
                detail: "docker run printed no container id".to_string(),
            });
        }
        info!(label = %spec.label, container = %id, image = %self.image, "container started");
        let runtime = ContainerInstance {
            docker: self.docker.clone(),
            id,
        };
        Ok(InstanceHandle::new(
            spec,
            Self::service_paths(),
            Box::new(runtime),
        ))
    }
}

struct ContainerInstance {
    docker: String,
    id: String,
}

impl RunningInstance for ContainerInstance {
    fn describe(&self) -> String {
        format!("container {}", self.id)
    }

    fn pid(&self) -> Option<u32> {
        let output = Command::new(&self.docker)
            .args(["inspect", "-f", "{{.State.Pid}}", &self.id])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|pid| *pid != 0)
    }

    fn terminate(&mut self) -> io::Result<()> {
        // Started with --rm, so a successful stop also removes it.
        let status = Command::new(&self.docker)
            .args(["stop", "-t", &STOP_GRACE.as_secs().to_string(), &self.id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            let _ = Command::new(&self.docker)
                .args(["rm", "-f", &self.id])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
        Ok(())
    }

    fn log_tail(&self) -> String {
        match Command::new(&self.docker)
            .args(["logs", "--tail", "200", &self.id])
            .output()
        {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                text
            }
            Err(_) => String::new(),
        }
    }
}

pub fn tail_file(path: &Path, max_bytes: u64) -> String {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return String::new(),
    };
    let len = match file.metadata() {
        Ok(m) => m.len(),
        Err(_) => return String::new(),
    };
    if file.seek(SeekFrom::Start(len.saturating_sub(max_bytes))).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).to_string()
}
