pub mod config;
pub mod response;

pub use config::{Cli, Configuration};
pub use response::{ApiError, ApiResult};
