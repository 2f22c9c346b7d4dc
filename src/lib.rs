pub mod config;
pub mod error;
pub mod extraction;
pub mod image_processing;
pub mod mcp_server;
pub mod persistence;
pub mod pipeline;
pub mod poll;
pub mod progress;
pub mod prompt;
pub mod queue_client;
pub mod quota;
pub mod retry;
pub mod storage;
pub mod submitter;
pub mod tools;

#[cfg(test)]
mod test_utils;

pub use config::{PipelineConfig, Settings};
pub use error::{GenerationError, StorageError};
pub use pipeline::{
    Collaborators, EnhanceRequest, GenerationOutcome, GenerationPipeline, GenerationRequest,
    GenerationRun, ImageSource, PipelineEvent,
};
