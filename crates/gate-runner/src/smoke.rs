use std::io::Write;

use tracing::info;

use crate::config::RunConfig;
use crate::error::Result;
use crate::instance::{ContainerLauncher, InstanceLauncher, ProcessLauncher};
use crate::scenario::{persistence_restart, snapshot_restore, with_scratch, BootRecord, SmokeSettings};
use crate::stage::{InternalStage, InternalStageExecutor};
use crate::tools::require_tool;
use crate::workload::PersistenceCheckpoint;

#[derive(Debug, Default)]
pub struct SmokeExecutor;

impl InternalStageExecutor for SmokeExecutor {
    fn execute(&self, stage: InternalStage, cfg: &RunConfig, out: &mut dyn Write) -> Result<()> {
        let settings = SmokeSettings::from_config(cfg);
        match stage {
            InternalStage::StartupMemorySmoke => {
                writeln!(out, "service binary: {}", cfg.service_bin.display())?;
                let launcher = ProcessLauncher::new(&cfg.service_bin);
                let fixture = PersistenceCheckpoint::standard("archgate_memory_smoke");
                let records = with_scratch("archgate_memory", out, |root, out| {
                    persistence_restart(&launcher, &settings, root, &fixture, out)
                })?;
                report(stage, &records, out)
            }
            InternalStage::SnapshotSmoke => {
                writeln!(out, "service binary: {}", cfg.service_bin.display())?;
                let launcher = ProcessLauncher::new(&cfg.service_bin);
                let fixture = PersistenceCheckpoint::standard("archgate_snapshot_smoke");
                let records = with_scratch("archgate_snapshot", out, |root, out| {
                    snapshot_restore(&launcher, &settings, root, &fixture, out)
                })?;
                report(stage, &records, out)
            }
            InternalStage::ContainerSmoke => {
                let docker = require_tool("docker")?;
                writeln!(out, "docker: {}", docker)?;
                writeln!(out, "image: {}", cfg.image)?;
                let launcher = ContainerLauncher::new(&cfg.image);
                run_container(&launcher, &settings, out)
            }
        }
    }
}

fn run_container(
    launcher: &dyn InstanceLauncher,
    settings: &SmokeSettings,
    out: &mut dyn Write,
) -> Result<()> {
    let fixture = PersistenceCheckpoint::standard("archgate_container_smoke");
    let records = with_scratch("archgate_container", out, |root, out| {
        persistence_restart(launcher, settings, root, &fixture, out)
    })?;
    report(InternalStage::ContainerSmoke, &records, out)
}

fn report(stage: InternalStage, records: &[BootRecord], out: &mut dyn Write) -> Result<()> {
    for record in records {
        info!(
            stage = stage.as_str(),
            boot = %record.label,
            ready_latency_ms = record.ready_latency_ms,
            rss_kb_at_ready = record.rss_kb_at_ready,
            rss_kb_after_workload = record.rss_kb_after_workload,
            "boot metrics"
        );
        writeln!(out, "metric {} {}", stage.as_str(), record)?;
    }
    Ok(())
}
