pub mod config;
pub mod error;
pub mod events;
pub mod traits;
pub mod types;

pub use config::{
    ConfidenceWeights, ExecutorConfig, GraphConfig, RetrievalConfig, SandboxConfig, Settings,
    SuggesterConfig,
};
pub use error::{ErrorInfo, Result, WeaveError};
pub use events::{topic_matches, EventBus, EventSubscription, GatewayEvent};
pub use traits::{EmbeddingProvider, EpisodicMemory, EpisodicStats, McpClient, StorageAdapter};
pub use types::*;
