pub mod use_cases;

pub use use_cases::query_pipeline::{PipelineDeps, PipelineSettings, QueryPipeline};
