pub mod context;
pub mod error;
pub mod estimate;
pub mod jobs;
pub mod media;
pub mod send;
pub mod types;

pub use context::{AssembledContext, ContextAssembler};
pub use error::SendError;
pub use estimate::{build_estimator, TokenEstimator};
pub use jobs::{Job, JobQueue};
pub use media::{MediaError, MediaResolver, PassthroughResolver};
pub use send::{SendPipeline, FALLBACK_REPLY, TRANSCRIPTION_PLACEHOLDER};
pub use types::{SendOutcome, SendRequest};
