//! Session store: checkpoint write/read and resume preparation

mod store;
mod summary;

pub use store::{
    AutoResume, RestoredSession, ResumeContext, SessionStore, default_checkpoint_retention,
};
pub use summary::{ContextSummary, summarize_context};
