pub mod config;
pub mod core;
pub mod error;
pub mod estimation;
pub mod log;
pub mod milestone;
pub mod orchestration;
pub mod state;
pub mod util;

pub use error::{Error, GraphError, Result};
