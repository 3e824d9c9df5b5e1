pub mod orchestrator;
pub mod query;
pub mod synth;

pub use orchestrator::{RecallOutcome, RecallPipeline, SourceRef};
pub use query::{process_query, QueryPlan};
pub use synth::synthesize;
