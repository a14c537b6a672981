pub mod auth;
pub mod config;
pub mod connectors;
pub mod db;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod retry;
pub mod sink;

pub use error::{ErrorKind, SyncError};
pub use pipeline::{run_pipeline, Delivery, FetchMode, PipelineOptions, RunReport};
