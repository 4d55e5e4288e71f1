//! Workflow engine, pipeline and supporting pieces

pub mod bash_executor;
pub mod cursor;
pub mod engine;
pub mod executor;
pub mod gate;
pub mod persistence;
pub mod pipeline;
pub mod status;
pub mod transitions;
pub mod validator;

pub use bash_executor::*;
pub use cursor::*;
pub use engine::*;
pub use executor::*;
pub use gate::*;
pub use persistence::*;
pub use pipeline::*;
pub use status::*;
pub use transitions::*;
pub use validator::*;
