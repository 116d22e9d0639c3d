pub mod config;
pub mod errors;
pub mod tasks;

pub use config::*;
pub use errors::*;
pub use tasks::*;
