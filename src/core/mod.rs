pub mod config;
pub mod error;
pub mod poll;
pub mod telemetry;

pub use error::{HarnessError, Result};
