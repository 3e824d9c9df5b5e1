pub mod pipeline;
pub mod schema;
pub mod tier1;

pub use pipeline::{CaptureOutcome, CapturePipeline, EmbedFn};
pub use schema::{Certainty, DecisionKind, DecisionRecord};
pub use tier1::{cosine_similarity, matches_capture_trigger, ExemplarCache};
