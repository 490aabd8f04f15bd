//! Subagent lifecycle: admission, the tool-agent loop against a
//! language-model worker, concurrency caps, cancellation, and archival.

pub mod agent_loop;
pub mod manager;
pub mod run;

pub use manager::{
    AnnounceCallback, CallContext, SpawnAccepted, SpawnRequest, SubagentManager,
};
pub use run::{Envelope, SubagentMode, SubagentRun, SubagentStatus, TranscriptEntry};
