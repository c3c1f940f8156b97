use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gate_runner::{GateError, RunConfig, RunSummary, SmokeExecutor, StagePlan, StageRunner};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "archgate",
    version = "0.3.0",
    about = "Multi-architecture validation gate"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage of the plan in order, stopping at the first failure.
    Run {
        #[arg(long, default_value = "validation-logs")]
        out_dir: PathBuf,
        #[arg(long)]
        plan: Option<PathBuf>,
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved stage plan without executing it.
    Describe {
        #[arg(long)]
        plan: Option<PathBuf>,
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = match &cli.command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
    };
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            let code = err
                .downcast_ref::<GateError>()
                .map(GateError::exit_code)
                .unwrap_or(1);
            if json_mode {
                emit_json(&json!({
                    "ok": false,
                    "error": { "code": "command_failed", "message": format!("{:#}", err) }
                }));
            } else {
                eprintln!("error: {:#}", err);
            }
            std::process::exit(code);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            out_dir,
            plan,
            workspace,
            json,
        } => {
            let workspace = resolve_workspace(workspace)?;
            let cfg = RunConfig::from_env(&out_dir, &workspace)?;
            let plan = load_plan(plan.as_deref(), &cfg)?;
            let executor = SmokeExecutor;
            let runner = StageRunner::new(&cfg, &executor);
            let stamp = runner.stamp().clone();
            tracing::info!(
                out_dir = %cfg.out_dir.display(),
                arch = %stamp.arch,
                endian = stamp.endian,
                profile = ?cfg.profile,
                "validation run starting"
            );
            let summary = runner.run(&plan)?;
            if json {
                return Ok(Some(summary_to_json(&summary)));
            }
            for result in &summary.results {
                println!(
                    "passed: {} ({}s) log: {}",
                    result.stage,
                    (result.ended_at - result.started_at).num_seconds(),
                    result.log_path.display()
                );
            }
            for name in &summary.skipped {
                println!("skipped: {}", name);
            }
            Ok(None)
        }
        Commands::Describe {
            plan,
            workspace,
            json,
        } => {
            let workspace = resolve_workspace(workspace)?;
            let cfg = RunConfig::from_env(Path::new("validation-logs"), &workspace)?;
            let plan = load_plan(plan.as_deref(), &cfg)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "profile": cfg.profile,
                    "service_bin": cfg.service_bin.display().to_string(),
                    "image": cfg.image,
                    "bench": cfg.bench,
                    "plan": plan,
                })));
            }
            println!("profile: {:?}", cfg.profile);
            println!("service_bin: {}", cfg.service_bin.display());
            println!("image: {}", cfg.image);
            for stage in plan.stages() {
                let gate = match &stage.enabled_by {
                    Some(var) if cfg.is_enabled(var) => format!(" [enabled by {}]", var),
                    Some(var) => format!(" [skipped unless {}=1]", var),
                    None => String::new(),
                };
                println!("stage: {} -> {}{}", stage.name, stage.action.display(), gate);
            }
            Ok(None)
        }
    }
}

fn resolve_workspace(workspace: Option<PathBuf>) -> Result<PathBuf> {
    match workspace {
        Some(p) => Ok(p),
        None => std::env::current_dir().context("cannot determine working directory"),
    }
}

fn load_plan(path: Option<&Path>, cfg: &RunConfig) -> Result<StagePlan> {
    let plan = match path {
        Some(p) => StagePlan::load(p)?,
        None => StagePlan::default_plan(cfg)?,
    };
    Ok(plan)
}

fn summary_to_json(summary: &RunSummary) -> Value {
    json!({
        "ok": true,
        "stages": summary.results,
        "skipped": summary.skipped,
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize json\"}}}}"
        ),
    }
}
