pub mod bridge;
pub mod paths;
pub mod protocol;
pub mod worker;

pub use bridge::{CapabilitySpan, CodeRequest, SandboxBridge, SandboxRun};
pub use paths::{validate_tool_args, WorkspaceGuard};
pub use protocol::{BridgeMessage, WorkerMessage};
pub use worker::{
    classify_worker_error, InProcessWorker, SandboxWorker, ToolProxies, WorkerChannels,
    WorkerContext, WorkerOutcome, WorkerProgram,
};
