//! Data models for steprail

pub mod configuration;
pub mod workflow;

pub use configuration::*;
pub use workflow::*;
