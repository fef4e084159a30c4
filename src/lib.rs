pub mod config;
pub mod deploy;
pub mod errors;
pub mod files;
pub mod generation;
pub mod pipeline;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod util;

#[cfg(test)]
mod test_support;

pub use errors::PipelineError;
