pub mod hybrid;
pub mod index;
pub mod provider;

pub use hybrid::{HybridHit, HybridRetriever};
pub use index::{ToolHit, VectorIndex};
pub use provider::HashingEmbedder;
