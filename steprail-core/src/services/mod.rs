//! Ambient services shared by the core and the CLI

pub mod logging;

pub use logging::*;
