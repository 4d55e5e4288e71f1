//! CLI command handling

pub mod manifest;
pub mod pipeline;
pub mod pipeline_handlers;
