pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod extract;
pub mod rpc;
pub mod scoring;
pub mod stream;

pub use error::{PipelineError, Result};
