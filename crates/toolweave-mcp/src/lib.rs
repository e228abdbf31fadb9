pub mod capability;
pub mod controller;
pub mod executor;
pub mod gateway;
pub mod learning;
pub mod predict;
pub mod registry;
pub mod sandbox;
pub mod speculation;
pub mod suggester;
pub mod testing;

pub use capability::{CapabilityMatch, CapabilityStore, Promotion};
pub use controller::{RunOptions, RunOutcome, WorkflowController};
pub use executor::{ExecutionReport, ParallelExecutor};
pub use gateway::{Gateway, MetricsSnapshot};
pub use learning::LearningLoop;
pub use predict::PredictionState;
pub use registry::{RegistrationSummary, ToolRegistry};
pub use sandbox::{
    CapabilitySpan, CodeRequest, InProcessWorker, SandboxBridge, SandboxRun, SandboxWorker,
    WorkerContext, WorkerOutcome, WorkspaceGuard,
};
pub use speculation::SpeculationCache;
pub use suggester::{DagSuggester, DagSuggestion, DependencyPath, ReplanRequest};
