use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{RunConfig, ENV_ENABLE_CONTAINER_SMOKE, ENV_ENABLE_PERF};
use crate::error::{GateError, Result};
use crate::tools::ToolchainVersions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalStage {
    ContainerSmoke,
    StartupMemorySmoke,
    SnapshotSmoke,
}

impl InternalStage {
    pub fn as_str(self) -> &'static str {
        match self {
            InternalStage::ContainerSmoke => "container_smoke",
            InternalStage::StartupMemorySmoke => "startup_memory_smoke",
            InternalStage::SnapshotSmoke => "snapshot_smoke",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageAction {
    Command {
        argv: Vec<String>,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    Internal {
        stage: InternalStage,
    },
}

impl StageAction {
    pub fn command(argv: &[&str]) -> Self {
        StageAction::Command {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    pub fn display(&self) -> String {
        match self {
            StageAction::Command { argv, env } => {
                let mut parts: Vec<String> =
                    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                parts.extend(argv.iter().map(|a| shell_quote(a)));
                parts.join(" ")
            }
            StageAction::Internal { stage } => format!("internal:{}", stage.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    pub name: String,
    pub action: StageAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_by: Option<String>,
}

impl Stage {
    pub fn new(name: &str, action: StageAction) -> Self {
        Self {
            name: name.to_string(),
            action,
            enabled_by: None,
        }
    }

    pub fn enabled_by(mut self, var: &str) -> Self {
        self.enabled_by = Some(var.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

#[derive(Debug, Deserialize)]
struct PlanFile {
    stages: Vec<StageDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StageDef {
    name: String,
    #[serde(default)]
    command: Option<Vec<String>>,
    #[serde(default)]
    internal: Option<InternalStage>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    enabled_by: Option<String>,
}

impl StagePlan {
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for stage in &stages {
            if stage.name.trim().is_empty() {
                return Err(GateError::Plan("stage name must not be empty".to_string()));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(GateError::DuplicateStage(stage.name.clone()));
            }
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: PlanFile =
            serde_yaml::from_str(text).map_err(|e| GateError::Plan(e.to_string()))?;
        let mut stages = Vec::with_capacity(file.stages.len());
        for def in file.stages {
            let action = match (def.command, def.internal) {
                (Some(argv), None) => {
                    if argv.is_empty() {
                        return Err(GateError::Plan(format!(
                            "stage {} has an empty command",
                            def.name
                        )));
                    }
                    StageAction::Command { argv, env: def.env }
                }
                (None, Some(stage)) => StageAction::Internal { stage },
                _ => {
                    return Err(GateError::Plan(format!(
                        "stage {} must set exactly one of command or internal",
                        def.name
                    )))
                }
            };
            stages.push(Stage {
                name: def.name,
                action,
                enabled_by: def.enabled_by,
            });
        }
        Self::new(stages)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| GateError::Plan(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&text)
    }

    pub fn default_plan(cfg: &RunConfig) -> Result<Self> {
        let mut build = vec!["cargo", "build", "--locked", "--bin", "qdrant"];
        let profile_args = cfg.profile.cargo_args();
        build.extend(profile_args.iter().map(String::as_str));

        let perf = StageAction::Command {
            argv: ["cargo", "bench", "-p", "quantization", "--bench", "persistence_smoke"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            env: cfg.bench.as_env(),
        };

        Self::new(vec![
            Stage::new("build", StageAction::command(&build)),
            Stage::new(
                "unit_tests",
                StageAction::command(&["cargo", "test", "--locked", "--workspace", "--lib"]),
            ),
            Stage::new(
                "http_smoke",
                StageAction::command(&[
                    "cargo",
                    "test",
                    "--locked",
                    "--test",
                    "s390x_http_smoke",
                    "--",
                    "--ignored",
                    "--nocapture",
                ]),
            ),
            Stage::new("perf_smoke", perf).enabled_by(ENV_ENABLE_PERF),
            Stage::new(
                "startup_memory_smoke",
                StageAction::Internal {
                    stage: InternalStage::StartupMemorySmoke,
                },
            ),
            Stage::new(
                "snapshot_smoke",
                StageAction::Internal {
                    stage: InternalStage::SnapshotSmoke,
                },
            ),
            Stage::new(
                "container_smoke",
                StageAction::Internal {
                    stage: InternalStage::ContainerSmoke,
                },
            )
            .enabled_by(ENV_ENABLE_CONTAINER_SMOKE),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct RunStamp {
    pub arch: String,
    pub endian: &'static str,
    pub timestamp: String,
}

impl RunStamp {
    pub fn detect() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        let endian = if cfg!(target_endian = "big") {
            "big"
        } else {
            "little"
        };
        Self {
            arch: std::env::consts::ARCH.to_string(),
            endian,
            timestamp: now.format("%Y%m%dT%H%M%SZ").to_string(),
        }
    }

    pub fn log_path(&self, out_dir: &Path, stage: &str) -> PathBuf {
        out_dir.join(format!(
            "{}_{}_{}_{}.log",
            stage, self.arch, self.endian, self.timestamp
        ))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: String,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub results: Vec<StageResult>,
    pub skipped: Vec<String>,
}

pub trait InternalStageExecutor {
    fn execute(&self, stage: InternalStage, cfg: &RunConfig, out: &mut dyn Write) -> Result<()>;
}

pub struct StageLog {
    file: File,
    echo: bool,
}

impl StageLog {
    fn create(base: &Path, echo: bool) -> io::Result<(Self, PathBuf)> {
        if let Some(parent) = base.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut attempt = 0u32;
        loop {
            let path = if attempt == 0 {
                base.to_path_buf()
            } else {
                suffixed(base, attempt)
            };
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => return Ok((Self { file, echo }, path)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }

    fn reopen(path: &Path) -> io::Result<Self> {
        let file = fs::OpenOptions::new().append(true).open(path)?;
        Ok(Self { file, echo: false })
    }
}

fn suffixed(base: &Path, n: u32) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(format!("{}_{}.log", stem, n))
}

impl Write for StageLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        if self.echo {
            let mut stdout = io::stdout().lock();
            stdout.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.echo {
            io::stdout().flush()?;
        }
        Ok(())
    }
}

pub struct StageRunner<'a> {
    cfg: &'a RunConfig,
    internal: &'a dyn InternalStageExecutor,
    stamp: RunStamp,
    toolchain: ToolchainVersions,
    echo: bool,
}

impl<'a> StageRunner<'a> {
    pub fn new(cfg: &'a RunConfig, internal: &'a dyn InternalStageExecutor) -> Self {
        Self {
            cfg,
            internal,
            stamp: RunStamp::detect(),
            toolchain: ToolchainVersions::detect(),
            echo: true,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn stamp(&self) -> &RunStamp {
        &self.stamp
    }

    fn say(&self, line: &str) {
        if self.echo {
            println!("{}", line);
        }
    }

    pub fn run(&self, plan: &StagePlan) -> Result<RunSummary> {
        fs::create_dir_all(&self.cfg.out_dir)?;
        let mut summary = RunSummary::default();
        for stage in plan.stages() {
            if let Some(var) = &stage.enabled_by {
                if !self.cfg.is_enabled(var) {
                    self.say(&format!(
                        "==> [skip] {} (set {}=1 to enable)",
                        stage.name, var
                    ));
                    info!(stage = %stage.name, toggle = %var, "stage skipped");
                    summary.skipped.push(stage.name.clone());
                    continue;
                }
            }
            let result = self.run_stage(stage)?;
            if result.exit_code != 0 {
                let failure = GateError::StageFailed {
                    stage: result.stage.clone(),
                    exit_code: result.exit_code,
                    log_path: result.log_path.clone(),
                };
                self.say(&format!("==> FAILED: {}", failure));
                return Err(failure);
            }
            summary.results.push(result);
        }
        self.say(&format!(
            "==> ALL STAGES PASSED ({} run, {} skipped) logs: {}",
            summary.results.len(),
            summary.skipped.len(),
            self.cfg.out_dir.display()
        ));
        Ok(summary)
    }

    pub fn run_stage(&self, stage: &Stage) -> Result<StageResult> {
        let (mut log, log_path) =
            StageLog::create(&self.stamp.log_path(&self.cfg.out_dir, &stage.name), self.echo)?;
        let started_at = Utc::now();
        self.say(&format!("==> [{}] log: {}", stage.name, log_path.display()));
        info!(stage = %stage.name, log = %log_path.display(), "stage started");

        writeln!(log, "# stage: {}", stage.name)?;
        writeln!(log, "# started_at: {}", started_at.to_rfc3339())?;
        writeln!(log, "# cwd: {}", self.cfg.workspace_dir.display())?;
        writeln!(
            log,
            "# host: arch={} endian={}",
            self.stamp.arch, self.stamp.endian
        )?;
        writeln!(log, "# rustc: {}", self.toolchain.rustc)?;
        writeln!(log, "# cargo: {}", self.toolchain.cargo)?;
        writeln!(log, "# command: {}", stage.action.display())?;
        log.flush()?;

        let exit_code = match &stage.action {
            StageAction::Command { argv, env } => {
                run_command_tee(argv, env, &self.cfg.workspace_dir, log)?
            }
            StageAction::Internal { stage: internal } => {
                match self.internal.execute(*internal, self.cfg, &mut log) {
                    Ok(()) => 0,
                    Err(e) => {
                        writeln!(log, "error: [{}] {}", stage.name, e)?;
                        warn!(stage = %stage.name, error = %e, "internal stage failed");
                        1
                    }
                }
            }
        };

        let ended_at = Utc::now();
        let mut trailer = StageLog::reopen(&log_path)?;
        writeln!(trailer, "# ended_at: {}", ended_at.to_rfc3339())?;
        writeln!(trailer, "# exit_code: {}", exit_code)?;
        trailer.flush()?;

        info!(stage = %stage.name, exit_code, "stage finished");
        Ok(StageResult {
            stage: stage.name.clone(),
            exit_code,
            started_at,
            ended_at,
            log_path,
        })
    }
}

// Spawn failures are reported like a shell would (127).
fn run_command_tee(
    argv: &[String],
    env: &BTreeMap<String, String>,
    cwd: &Path,
    mut log: StageLog,
) -> Result<i32> {
    let Some((program, args)) = argv.split_first() else {
        writeln!(log, "error: empty command")?;
        return Ok(127);
    };
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            writeln!(log, "error: failed to spawn {}: {}", program, e)?;
            return Ok(127);
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let shared = Mutex::new(log);
    thread::scope(|s| {
        if let Some(out) = stdout {
            let shared = &shared;
            s.spawn(move || pump_lines(out, shared));
        }
        if let Some(err) = stderr {
            let shared = &shared;
            s.spawn(move || pump_lines(err, shared));
        }
    });
    let status = child.wait()?;
    if let Ok(mut log) = shared.into_inner() {
        log.flush()?;
    }
    Ok(status.code().unwrap_or(-1))
}

fn pump_lines<R: Read>(source: R, sink: &Mutex<StageLog>) {
    let mut reader = BufReader::new(source);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                if let Ok(mut log) = sink.lock() {
                    let _ = log.write_all(&line);
                }
            }
        }
    }
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
