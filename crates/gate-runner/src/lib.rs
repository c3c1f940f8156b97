pub mod config;
pub mod error;
pub mod instance;
pub mod ports;
pub mod readiness;
pub mod sampler;
pub mod scenario;
pub mod smoke;
pub mod stage;
pub mod tools;
pub mod workload;

pub use config::{BenchSizing, BuildProfile, RunConfig};
pub use error::{GateError, Result};
pub use instance::{
    ContainerLauncher, InstanceHandle, InstanceLauncher, InstancePaths, InstanceSpec,
    ProcessLauncher, RunningInstance,
};
pub use scenario::{persistence_restart, snapshot_restore, BootLabel, BootRecord, SmokeSettings};
pub use smoke::SmokeExecutor;
pub use stage::{
    InternalStage, InternalStageExecutor, RunStamp, RunSummary, Stage, StageAction, StagePlan,
    StageResult, StageRunner,
};
pub use workload::{PersistenceCheckpoint, ServiceClient};
